/// Commands, command queues, and host contexts.
///
/// A context is the host-visible unit of ownership: a pid, an ordered list
/// of command queues, and the dirty flags a later copy-out consults. Host
/// code and the tick thread share a context through `Arc`; the queue list
/// is guarded by one mutex per context, taken briefly by both sides.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::kernel::{CodeObject, DispatchPacket};
use crate::memory::Pid;
use crate::protocol::next_id;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Payload of a middleware-defined command. Middlewares downcast through
/// `as_any` to recognize their own command types.
pub trait ExtensionPayload: std::fmt::Debug + Send {
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Discriminant of a command, detached from its payload so dispatch can
/// branch without holding a borrow of the queue head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    LaunchKernel,
    LaunchUnified,
    Noop,
    Extension,
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::LaunchKernel  => "LaunchKernel",
            CommandKind::LaunchUnified => "LaunchUnifiedMultiGPUKernel",
            CommandKind::Noop          => "Noop",
            CommandKind::Extension     => "Extension",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One unit of work on a command queue. Every command carries a
/// time-unique id and the ids of its outstanding per-GPU requests.
#[derive(Debug)]
pub enum Command {
    LaunchKernel {
        id: u64,
        code_object: CodeObject,
        packet: DispatchPacket,
        packet_addr: u64,
        reqs: Vec<u64>,
    },
    LaunchUnified {
        id: u64,
        code_object: CodeObject,
        /// One packet per member GPU, in member order
        packets: Vec<DispatchPacket>,
        packet_addrs: Vec<u64>,
        reqs: Vec<u64>,
    },
    Noop {
        id: u64,
    },
    /// Dispatched by the first registered middleware that claims it
    Extension {
        id: u64,
        payload: Box<dyn ExtensionPayload>,
        reqs: Vec<u64>,
    },
}

impl Command {
    pub fn launch_kernel(
        code_object: CodeObject,
        packet: DispatchPacket,
        packet_addr: u64,
    ) -> Self {
        Command::LaunchKernel {
            id: next_id(),
            code_object,
            packet,
            packet_addr,
            reqs: Vec::new(),
        }
    }

    pub fn launch_unified(
        code_object: CodeObject,
        packets: Vec<DispatchPacket>,
        packet_addrs: Vec<u64>,
    ) -> Self {
        Command::LaunchUnified {
            id: next_id(),
            code_object,
            packets,
            packet_addrs,
            reqs: Vec::new(),
        }
    }

    pub fn noop() -> Self {
        Command::Noop { id: next_id() }
    }

    pub fn extension(payload: Box<dyn ExtensionPayload>) -> Self {
        Command::Extension { id: next_id(), payload, reqs: Vec::new() }
    }

    pub fn id(&self) -> u64 {
        match self {
            Command::LaunchKernel { id, .. }
            | Command::LaunchUnified { id, .. }
            | Command::Noop { id }
            | Command::Extension { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Command::LaunchKernel { .. }  => CommandKind::LaunchKernel,
            Command::LaunchUnified { .. } => CommandKind::LaunchUnified,
            Command::Noop { .. }          => CommandKind::Noop,
            Command::Extension { .. }     => CommandKind::Extension,
        }
    }

    /// Ids of the requests still awaiting a response.
    pub fn reqs(&self) -> &[u64] {
        match self {
            Command::LaunchKernel { reqs, .. }
            | Command::LaunchUnified { reqs, .. }
            | Command::Extension { reqs, .. } => reqs,
            Command::Noop { .. } => &[],
        }
    }

    pub fn push_req(&mut self, req_id: u64) {
        match self {
            Command::LaunchKernel { reqs, .. }
            | Command::LaunchUnified { reqs, .. }
            | Command::Extension { reqs, .. } => reqs.push(req_id),
            Command::Noop { .. } => unreachable!("noop commands issue no requests"),
        }
    }

    pub fn remove_req(&mut self, req_id: u64) {
        match self {
            Command::LaunchKernel { reqs, .. }
            | Command::LaunchUnified { reqs, .. }
            | Command::Extension { reqs, .. } => reqs.retain(|&r| r != req_id),
            Command::Noop { .. } => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Command queues
// ---------------------------------------------------------------------------

/// FIFO of commands bound to one device. At most one command is in flight
/// (`is_running`); the head stays visible until it completes.
#[derive(Debug)]
pub struct CommandQueue {
    /// 1-based device id this queue dispatches to
    pub gpu_id: usize,
    /// Owning context's pid
    pub pid: Pid,
    pub is_running: bool,
    commands: VecDeque<Command>,
}

impl CommandQueue {
    pub fn new(gpu_id: usize, pid: Pid) -> Self {
        CommandQueue { gpu_id, pid, is_running: false, commands: VecDeque::new() }
    }

    pub fn enqueue(&mut self, cmd: Command) {
        self.commands.push_back(cmd);
    }

    pub fn peek(&self) -> Option<&Command> {
        self.commands.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut Command> {
        self.commands.front_mut()
    }

    pub fn dequeue(&mut self) -> Option<Command> {
        self.commands.pop_front()
    }

    pub fn num_commands(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Contexts
// ---------------------------------------------------------------------------

/// A host buffer record; the dirty bit tells a later copy-out to flush.
#[derive(Debug, Clone)]
pub struct Buffer {
    pub device_id: usize,
    pub v_addr: u64,
    pub size: u64,
    pub dirty: bool,
}

/// Host-visible context: pid, queues, and dirty tracking.
#[derive(Debug)]
pub struct Context {
    pid: Pid,
    pub(crate) queues: Mutex<Vec<CommandQueue>>,
    l2_dirty: AtomicBool,
    buffers: Mutex<Vec<Buffer>>,
}

impl Context {
    pub fn new(pid: Pid) -> Self {
        Context {
            pid,
            queues: Mutex::new(Vec::new()),
            l2_dirty: AtomicBool::new(false),
            buffers: Mutex::new(Vec::new()),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn l2_dirty(&self) -> bool {
        self.l2_dirty.load(Ordering::Relaxed)
    }

    pub fn set_l2_dirty(&self) {
        self.l2_dirty.store(true, Ordering::Relaxed);
    }

    pub fn add_buffer(&self, buffer: Buffer) {
        self.buffers.lock().unwrap().push(buffer);
    }

    pub fn mark_all_buffers_dirty(&self) {
        for buffer in self.buffers.lock().unwrap().iter_mut() {
            buffer.dirty = true;
        }
    }

    pub fn buffers(&self) -> Vec<Buffer> {
        self.buffers.lock().unwrap().clone()
    }
}

/// Host-side handle to one queue: the context plus an index into its queue
/// list, never a pointer into it.
#[derive(Debug, Clone)]
pub struct CommandQueueRef {
    pub(crate) ctx: Arc<Context>,
    pub(crate) index: usize,
}

impl CommandQueueRef {
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Append a command. Callers on the host thread follow this with the
    /// driver's enqueue signal so the engine wakes up.
    pub fn enqueue(&self, cmd: Command) {
        self.ctx.queues.lock().unwrap()[self.index].enqueue(cmd);
    }

    pub fn is_empty(&self) -> bool {
        self.ctx.queues.lock().unwrap()[self.index].is_empty()
    }

    pub fn num_commands(&self) -> usize {
        self.ctx.queues.lock().unwrap()[self.index].num_commands()
    }
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Driver extension point. Middlewares are offered, in registration order,
/// every command the driver itself does not recognize; the first whose
/// `process_command` returns true claims the dispatch. `tick` runs every
/// cycle before inbound handling.
pub trait Middleware: Send {
    fn process_command(&mut self, queue: &mut CommandQueue) -> bool;
    fn tick(&mut self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Dim3;

    fn launch() -> Command {
        Command::launch_kernel(
            CodeObject::new("k"),
            DispatchPacket::new(Dim3::x(1), Dim3::x(1)),
            0,
        )
    }

    #[test]
    fn queue_is_fifo_and_peek_keeps_the_head() {
        let mut q = CommandQueue::new(1, Pid(1));
        let a = launch();
        let a_id = a.id();
        q.enqueue(a);
        q.enqueue(Command::noop());

        assert_eq!(q.peek().unwrap().id(), a_id);
        assert_eq!(q.peek().unwrap().id(), a_id, "peek does not consume");
        assert_eq!(q.dequeue().unwrap().id(), a_id);
        assert_eq!(q.num_commands(), 1);
    }

    #[test]
    fn outstanding_requests_track_by_id() {
        let mut cmd = launch();
        cmd.push_req(10);
        cmd.push_req(11);
        cmd.remove_req(10);
        assert_eq!(cmd.reqs(), &[11]);
        cmd.remove_req(11);
        assert!(cmd.reqs().is_empty());
    }

    #[test]
    fn launches_dirty_the_context() {
        let ctx = Context::new(Pid(1));
        ctx.add_buffer(Buffer { device_id: 1, v_addr: 0x1000, size: 4096, dirty: false });
        assert!(!ctx.l2_dirty());

        ctx.set_l2_dirty();
        ctx.mark_all_buffers_dirty();
        assert!(ctx.l2_dirty());
        assert!(ctx.buffers().iter().all(|b| b.dirty));
    }

    #[derive(Debug)]
    struct Probe(u32);

    impl ExtensionPayload for Probe {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn extension_payloads_downcast() {
        let cmd = Command::extension(Box::new(Probe(7)));
        let Command::Extension { payload, .. } = &cmd else { panic!() };
        let probe = payload.as_any().downcast_ref::<Probe>().unwrap();
        assert_eq!(probe.0, 7);
    }
}
