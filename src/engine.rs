/// The slice of the discrete-event engine the driver depends on.
///
/// The real simulator schedules clocked components through a time-ordered
/// event queue; the driver only needs the contract: components are ticked
/// until none reports progress, a run can be paused long enough to schedule
/// new work, and `schedule` guarantees at least one more sweep. This
/// minimal engine implements exactly that and nothing more.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// A clocked component. `tick` advances one cycle and reports whether any
/// progress was made so the engine knows when the system is quiescent.
pub trait TickingComponent: Send {
    fn tick(&mut self) -> bool;
}

pub struct Engine {
    components: Mutex<Vec<Arc<Mutex<dyn TickingComponent>>>>,
    paused: Mutex<bool>,
    unpaused: Condvar,
    /// Set by `schedule`; cleared at the top of each sweep so a schedule
    /// arriving mid-sweep forces one more
    pending: AtomicBool,
}

impl Engine {
    pub fn new() -> Self {
        Engine {
            components: Mutex::new(Vec::new()),
            paused: Mutex::new(false),
            unpaused: Condvar::new(),
            pending: AtomicBool::new(false),
        }
    }

    pub fn register(&self, component: Arc<Mutex<dyn TickingComponent>>) {
        self.components.lock().unwrap().push(component);
    }

    /// Hold the next sweep until `resume`.
    pub fn pause(&self) {
        *self.paused.lock().unwrap() = true;
    }

    pub fn resume(&self) {
        *self.paused.lock().unwrap() = false;
        self.unpaused.notify_all();
    }

    /// Guarantee at least one more sweep, starting or extending a run.
    pub fn schedule(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }

    /// Whether a schedule arrived that no run has consumed yet.
    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Tick all components until the system is quiescent: a full sweep
    /// with no progress and no pending schedule.
    pub fn run(&self) {
        loop {
            {
                let mut paused = self.paused.lock().unwrap();
                while *paused {
                    paused = self.unpaused.wait(paused).unwrap();
                }
            }

            self.pending.store(false, Ordering::SeqCst);
            let components: Vec<_> = self.components.lock().unwrap().clone();

            let mut progress = false;
            for component in &components {
                progress |= component.lock().unwrap().tick();
            }

            if !progress && !self.pending.load(Ordering::SeqCst) {
                return;
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Countdown {
        remaining: u32,
        ticks: u32,
    }

    impl TickingComponent for Countdown {
        fn tick(&mut self) -> bool {
            self.ticks += 1;
            if self.remaining == 0 {
                return false;
            }
            self.remaining -= 1;
            true
        }
    }

    #[test]
    fn runs_until_quiescent() {
        let engine = Engine::new();
        let c = Arc::new(Mutex::new(Countdown { remaining: 3, ticks: 0 }));
        engine.register(c.clone());
        engine.run();
        // 3 productive sweeps + 1 empty sweep to detect quiescence
        assert_eq!(c.lock().unwrap().ticks, 4);
    }

    #[test]
    fn schedule_forces_another_sweep() {
        let engine = Engine::new();
        let c = Arc::new(Mutex::new(Countdown { remaining: 0, ticks: 0 }));
        engine.register(c.clone());

        engine.run();
        assert_eq!(c.lock().unwrap().ticks, 1);

        engine.schedule();
        engine.run();
        assert_eq!(c.lock().unwrap().ticks, 2);
    }
}
