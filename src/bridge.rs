/// The host/engine bridge.
///
/// Host code mutates command queues from its own thread; the simulation
/// advances only inside engine runs. The bridge is the hinge between the
/// two: an enqueue signal wakes a background thread that schedules the
/// driver for the next tick and starts an engine run iff none is in
/// flight. Runs are serialized, and a panic escaping the engine is logged
/// with a backtrace and terminates the process with a non-zero exit code.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::error;

use crate::command::{Command, CommandQueueRef, Context};
use crate::driver::Driver;
use crate::engine::Engine;
use crate::error::Result;
use crate::trace::TraceSnapshot;

pub struct DriverHandle {
    driver: Arc<Mutex<Driver>>,
    enqueue_signal: Sender<()>,
    driver_stopped: Sender<()>,
    bridge: Option<JoinHandle<()>>,
}

/// Register the driver with the engine and start the bridge thread.
/// The returned handle is the host program's view of the driver.
pub fn run(driver: Driver, engine: Arc<Engine>) -> DriverHandle {
    driver.trace.simulation_start();
    let driver = Arc::new(Mutex::new(driver));
    engine.register(driver.clone());

    // Enqueue signals coalesce: a full slot already means a wakeup is due.
    // The stop channel is a rendezvous so terminate() synchronizes with
    // bridge exit.
    let (enqueue_tx, enqueue_rx) = bounded::<()>(1);
    let (stop_tx, stop_rx) = bounded::<()>(0);

    let bridge = thread::spawn(move || bridge_loop(engine, enqueue_rx, stop_rx));

    DriverHandle {
        driver,
        enqueue_signal: enqueue_tx,
        driver_stopped: stop_tx,
        bridge: Some(bridge),
    }
}

fn bridge_loop(
    engine: Arc<Engine>,
    enqueue_signal: Receiver<()>,
    driver_stopped: Receiver<()>,
) {
    let engine_running = Arc::new(Mutex::new(false));
    let run_serial = Arc::new(Mutex::new(()));

    loop {
        select! {
            recv(driver_stopped) -> _ => return,
            recv(enqueue_signal) -> msg => {
                if msg.is_err() {
                    return;
                }

                // Schedule the driver for the next tick while the engine
                // is held, so a concluding run cannot miss the new work.
                engine.pause();
                engine.schedule();
                engine.resume();

                let mut running = engine_running.lock().unwrap();
                if *running {
                    continue;
                }
                *running = true;
                drop(running);

                spawn_engine_run(
                    Arc::clone(&engine),
                    Arc::clone(&engine_running),
                    Arc::clone(&run_serial),
                );
            }
        }
    }
}

fn spawn_engine_run(
    engine: Arc<Engine>,
    engine_running: Arc<Mutex<bool>>,
    run_serial: Arc<Mutex<()>>,
) {
    thread::spawn(move || {
        let result = catch_unwind(AssertUnwindSafe(|| loop {
            {
                let _serial = run_serial.lock().unwrap();
                engine.run();
            }
            // A schedule that raced with the run's conclusion would be
            // lost: re-check before declaring the engine idle.
            let mut running = engine_running.lock().unwrap();
            if !engine.has_pending() {
                *running = false;
                return;
            }
        }));

        if let Err(panic) = result {
            let what = panic_message(panic.as_ref());
            error!(panic = %what, "engine run panicked");
            eprintln!(
                "engine panic: {what}\n{}",
                std::backtrace::Backtrace::force_capture()
            );
            std::process::exit(1);
        }
    });
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

impl DriverHandle {
    pub fn create_context(&self) -> Arc<Context> {
        self.driver.lock().unwrap().create_context()
    }

    pub fn create_command_queue(
        &self,
        ctx: &Arc<Context>,
        device_id: usize,
    ) -> Result<CommandQueueRef> {
        self.driver.lock().unwrap().create_command_queue(ctx, device_id)
    }

    /// Append a command to the queue and wake the engine. Only the
    /// context's queue mutex is taken — an engine run in progress is
    /// never blocked by an enqueue.
    pub fn enqueue(&self, queue: &CommandQueueRef, cmd: Command) {
        queue.enqueue(cmd);
        let _ = self.enqueue_signal.try_send(());
    }

    pub fn trace_snapshot(&self) -> TraceSnapshot {
        self.driver.lock().unwrap().trace.snapshot()
    }

    /// Stop the bridge thread. In-flight engine runs finish on their own.
    pub fn terminate(&mut self) {
        let _ = self.driver_stopped.send(());
        if let Some(bridge) = self.bridge.take() {
            let _ = bridge.join();
        }
        self.driver.lock().unwrap().trace.simulation_end();
    }
}
