/// The GPU driver.
///
/// Mediates between host code and the simulated GPUs: it owns the page
/// table and device memory allocator, multiplexes per-context command
/// queues, dispatches kernel launches to one or several GPUs, and services
/// MMU page-migration requests (see `migration.rs`).
///
/// All mutable driver state is touched from the engine thread inside
/// `tick`; the host thread reaches only the context list and per-context
/// queues, each behind its own mutex.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::command::{
    Command, CommandKind, CommandQueue, CommandQueueRef, Context, Middleware,
};
use crate::device::{Device, DeviceKind, DeviceProperties};
use crate::engine::TickingComponent;
use crate::error::{DriverError, Result};
use crate::kernel::WorkgroupFilter;
use crate::memory::{MemoryAllocator, PageTable, Pid};
use crate::migration::MigrationState;
use crate::port::Port;
use crate::protocol::{next_id, LaunchKernelReq, LaunchKernelRsp, Msg};
use crate::trace::SimulationTrace;

/// Driver-level configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Page bytes = 1 << log2_page_size
    pub log2_page_size: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig { log2_page_size: 12 }
    }
}

pub struct Driver {
    /// Port all GPU-side responses arrive on; requests stamp it as `src`
    pub(crate) gpu_port: Port,
    /// Port the MMU talks to
    pub(crate) mmu_port: Port,
    /// Command-processor port of each GPU, in registration order
    pub(crate) gpus: Vec<Port>,
    /// Page-migration-controller port of each GPU, in registration order
    pub(crate) remote_pmc_ports: Vec<Port>,

    pub(crate) allocator: MemoryAllocator,
    pub(crate) page_table: PageTable,
    pub(crate) middlewares: Vec<Box<dyn Middleware>>,

    /// Outbound GPU requests; only the head is attempted each tick
    pub(crate) requests_to_send: VecDeque<(Port, Msg)>,
    pub(crate) contexts: Arc<Mutex<Vec<Arc<Context>>>>,

    /// The at-most-one migration in flight
    pub(crate) migration: Option<MigrationState>,
    /// Prepared MMU response; outlives the migration state so it can be
    /// transmitted after the machine has gone idle
    pub(crate) to_send_to_mmu: Option<(Port, Msg)>,

    pub(crate) next_pid: u32,
    pub(crate) trace: SimulationTrace,
}

impl Driver {
    pub fn new(config: DriverConfig) -> Self {
        Driver {
            gpu_port: Port::new("Driver.ToGPUs"),
            mmu_port: Port::new("Driver.ToMMU"),
            gpus: Vec::new(),
            remote_pmc_ports: Vec::new(),
            allocator: MemoryAllocator::new(config.log2_page_size),
            page_table: PageTable::new(config.log2_page_size),
            middlewares: Vec::new(),
            requests_to_send: VecDeque::new(),
            contexts: Arc::new(Mutex::new(Vec::new())),
            migration: None,
            to_send_to_mmu: None,
            next_pid: 1,
            trace: SimulationTrace::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Wiring surface, used by the per-GPU builder before the run starts
    // -----------------------------------------------------------------------

    /// Port GPU-side components respond to.
    pub fn gpu_port(&self) -> Port {
        self.gpu_port.clone()
    }

    /// Port the MMU delivers migration requests to.
    pub fn mmu_port(&self) -> Port {
        self.mmu_port.clone()
    }

    /// Tell the driver about a GPU. Ids are assigned in registration
    /// order, starting at 1.
    pub fn register_gpu(&mut self, cp_port: Port, properties: DeviceProperties) -> usize {
        self.gpus.push(cp_port);
        self.allocator.register_gpu(properties)
    }

    /// Record a GPU's page-migration-controller port, in the same order as
    /// `register_gpu`.
    pub fn register_remote_pmc_port(&mut self, port: Port) {
        self.remote_pmc_ports.push(port);
    }

    /// Create a virtual device whose launches fan out across `members`.
    pub fn create_unified_gpu(&mut self, members: &[usize]) -> Result<usize> {
        self.allocator.register_unified_gpu(members)
    }

    pub fn add_middleware(&mut self, middleware: Box<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    pub fn num_gpus(&self) -> usize {
        self.gpus.len()
    }

    pub fn device(&self, id: usize) -> &Device {
        self.allocator.device(id)
    }

    pub fn is_handling_migration(&self) -> bool {
        self.migration.is_some()
    }

    // -----------------------------------------------------------------------
    // Host-facing surface
    // -----------------------------------------------------------------------

    pub fn create_context(&mut self) -> Arc<Context> {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        let ctx = Arc::new(Context::new(pid));
        self.contexts.lock().unwrap().push(Arc::clone(&ctx));
        ctx
    }

    /// Create a command queue on `ctx` bound to `device_id` (a GPU or a
    /// unified device).
    pub fn create_command_queue(
        &mut self,
        ctx: &Arc<Context>,
        device_id: usize,
    ) -> Result<CommandQueueRef> {
        let device = self
            .allocator
            .get_device(device_id)
            .ok_or(DriverError::UnknownDevice(device_id))?;
        if device.kind == DeviceKind::Cpu {
            return Err(DriverError::NotAGpu(device_id));
        }

        let mut queues = ctx.queues.lock().unwrap();
        queues.push(CommandQueue::new(device_id, ctx.pid()));
        Ok(CommandQueueRef { ctx: Arc::clone(ctx), index: queues.len() - 1 })
    }

    /// Context lookup by pid. Absence is a wiring bug: every migration
    /// request names a process the host created.
    pub(crate) fn context_with_pid(&self, pid: Pid) -> Arc<Context> {
        let contexts = self.contexts.lock().unwrap();
        for ctx in contexts.iter() {
            if ctx.pid() == pid {
                return Arc::clone(ctx);
            }
        }
        panic!("no context for {pid}");
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// One driver cycle. Outbound drains run first to free buffer space,
    /// middlewares next so extensions observe a clean tick, inbound
    /// handling last so responses computed this cycle go out on the next.
    pub fn tick(&mut self) -> bool {
        let mut progress = false;

        progress |= self.send_to_gpus();
        progress |= self.send_to_mmu();
        progress |= self.send_migration_req_to_cp();

        progress |= self.tick_middlewares();

        progress |= self.process_return_req();
        progress |= self.process_new_commands();
        progress |= self.parse_from_mmu();

        progress
    }

    /// Attempt the head of the outbound buffer. On backpressure the
    /// request stays queued for the next tick.
    fn send_to_gpus(&mut self) -> bool {
        let Some((dst, msg)) = self.requests_to_send.pop_front() else {
            return false;
        };
        match dst.deliver(msg) {
            Ok(()) => true,
            Err(msg) => {
                self.requests_to_send.push_front((dst, msg));
                false
            }
        }
    }

    fn send_to_mmu(&mut self) -> bool {
        let Some((dst, msg)) = self.to_send_to_mmu.take() else {
            return false;
        };
        match dst.deliver(msg) {
            Ok(()) => true,
            Err(msg) => {
                self.to_send_to_mmu = Some((dst, msg));
                false
            }
        }
    }

    fn tick_middlewares(&mut self) -> bool {
        let mut progress = false;
        for middleware in self.middlewares.iter_mut() {
            progress |= middleware.tick();
        }
        progress
    }

    // -----------------------------------------------------------------------
    // Inbound GPU responses
    // -----------------------------------------------------------------------

    /// Handle at most one incoming GPU response per tick.
    fn process_return_req(&mut self) -> bool {
        let Some(msg) = self.gpu_port.retrieve() else {
            return false;
        };
        match msg {
            Msg::LaunchKernelRsp(rsp) => self.process_launch_kernel_rsp(rsp),
            Msg::RdmaDrainRsp(_) => self.process_rdma_drain_rsp(),
            Msg::ShootdownCompleteRsp(_) => self.process_shootdown_complete_rsp(),
            Msg::PageMigrationRspToDriver(_) => self.process_page_migration_rsp_from_cp(),
            Msg::RdmaRestartRsp(_) => self.process_rdma_restart_rsp(),
            Msg::GpuRestartRsp(_) => self.process_gpu_restart_rsp(),
            other => panic!("driver cannot handle {} on the GPU port", other.kind()),
        }
    }

    fn process_launch_kernel_rsp(&mut self, rsp: LaunchKernelRsp) -> bool {
        let contexts = Arc::clone(&self.contexts);
        let contexts = contexts.lock().unwrap();
        for ctx in contexts.iter() {
            let mut queues = ctx.queues.lock().unwrap();
            for queue in queues.iter_mut() {
                let (cmd_id, done) = {
                    let Some(cmd) = queue.front_mut() else { continue };
                    if !cmd.reqs().contains(&rsp.rsp_to) {
                        continue;
                    }
                    cmd.remove_req(rsp.rsp_to);
                    (cmd.id(), cmd.reqs().is_empty())
                };

                self.trace.req_finalize(cmd_id, rsp.rsp_to);
                if done {
                    queue.is_running = false;
                    queue.dequeue();
                    self.trace.command_complete(cmd_id);
                }
                return true;
            }
        }
        panic!("no in-flight command matches launch response for request {}", rsp.rsp_to);
    }

    // -----------------------------------------------------------------------
    // Command admission
    // -----------------------------------------------------------------------

    /// Try to start one new command on every idle queue. Queues within a
    /// context are visited in insertion order but progress independently.
    fn process_new_commands(&mut self) -> bool {
        let contexts = Arc::clone(&self.contexts);
        let contexts = contexts.lock().unwrap();

        let mut progress = false;
        for ctx in contexts.iter() {
            let mut queues = ctx.queues.lock().unwrap();
            for queue in queues.iter_mut() {
                if queue.is_empty() || queue.is_running {
                    continue;
                }
                progress |= self.process_one_command(ctx, queue);
            }
        }
        progress
    }

    fn process_one_command(&mut self, ctx: &Context, queue: &mut CommandQueue) -> bool {
        let Some(kind) = queue.peek().map(Command::kind) else {
            return false;
        };
        match kind {
            CommandKind::Noop => self.process_noop_command(queue),
            CommandKind::LaunchKernel => self.process_launch_kernel_command(ctx, queue),
            CommandKind::LaunchUnified => self.process_unified_launch_command(ctx, queue),
            CommandKind::Extension => self.process_command_with_middleware(queue),
        }
    }

    fn process_noop_command(&mut self, queue: &mut CommandQueue) -> bool {
        let Some(cmd) = queue.dequeue() else {
            return false;
        };
        self.trace.command_start(cmd.id(), CommandKind::Noop.name());
        self.trace.command_complete(cmd.id());
        true
    }

    /// Extension commands are offered to middlewares in registration
    /// order; the first acceptor claims dispatch.
    fn process_command_with_middleware(&mut self, queue: &mut CommandQueue) -> bool {
        let Some(cmd_id) = queue.peek().map(Command::id) else {
            return false;
        };
        for middleware in self.middlewares.iter_mut() {
            if middleware.process_command(queue) {
                self.trace.command_start(cmd_id, CommandKind::Extension.name());
                return true;
            }
        }
        false
    }

    // -----------------------------------------------------------------------
    // Kernel launch
    // -----------------------------------------------------------------------

    fn process_launch_kernel_command(
        &mut self,
        ctx: &Context,
        queue: &mut CommandQueue,
    ) -> bool {
        let pid = queue.pid;
        let dst = self.gpus[queue.gpu_id - 1].clone();
        let req_id = next_id();

        let (cmd_id, code_object, packet, packet_addr) = {
            let Some(Command::LaunchKernel { id, code_object, packet, packet_addr, reqs }) =
                queue.front_mut()
            else {
                return false;
            };
            reqs.push(req_id);
            (*id, code_object.clone(), *packet, *packet_addr)
        };

        let req = LaunchKernelReq {
            id: req_id,
            src: self.gpu_port.clone(),
            pid,
            code_object,
            packet,
            packet_addr,
            wg_filter: None,
        };
        self.requests_to_send.push_back((dst, Msg::LaunchKernelReq(req)));

        queue.is_running = true;
        ctx.set_l2_dirty();
        ctx.mark_all_buffers_dirty();

        self.trace.command_start(cmd_id, CommandKind::LaunchKernel.name());
        self.trace.req_initiate(cmd_id, req_id);
        true
    }

    fn process_unified_launch_command(
        &mut self,
        ctx: &Context,
        queue: &mut CommandQueue,
    ) -> bool {
        let pid = queue.pid;
        let wg_dist = self.distribute_workgroups(queue);
        let members = self.allocator.device(queue.gpu_id).unified_members.clone();

        let Some(cmd_id) = queue.peek().map(Command::id) else {
            return false;
        };
        self.trace.command_start(cmd_id, CommandKind::LaunchUnified.name());

        for (i, &gpu_id) in members.iter().enumerate() {
            if wg_dist[i + 1] == wg_dist[i] {
                continue;
            }
            let dst = self.gpus[gpu_id - 1].clone();
            let req_id = next_id();

            let (code_object, packet, packet_addr) = {
                let Some(Command::LaunchUnified {
                    code_object, packets, packet_addrs, reqs, ..
                }) = queue.front_mut()
                else {
                    return false;
                };
                reqs.push(req_id);
                (code_object.clone(), packets[i], packet_addrs[i])
            };

            let req = LaunchKernelReq {
                id: req_id,
                src: self.gpu_port.clone(),
                pid,
                code_object,
                packet,
                packet_addr,
                wg_filter: Some(WorkgroupFilter { lo: wg_dist[i], hi: wg_dist[i + 1] }),
            };
            self.requests_to_send.push_back((dst, Msg::LaunchKernelReq(req)));
            self.trace.req_initiate(cmd_id, req_id);
        }

        queue.is_running = true;
        ctx.set_l2_dirty();
        ctx.mark_all_buffers_dirty();
        true
    }

    /// Partition the grid across the unified device's members in
    /// proportion to CU count. Returns the boundary array
    /// `wg_dist[0..=k]`, `wg_dist[0] = 0`; member i owns
    /// `[wg_dist[i], wg_dist[i+1])` of the row-major flattened ids.
    fn distribute_workgroups(&self, queue: &CommandQueue) -> Vec<u64> {
        let members = &self.allocator.device(queue.gpu_id).unified_members;
        let packet = match queue.peek() {
            Some(Command::LaunchUnified { packets, .. }) => packets[0],
            _ => panic!("workgroup distribution on a non-unified launch"),
        };

        let total_cu: u64 = members
            .iter()
            .map(|&m| self.allocator.device(m).properties.cu_count as u64)
            .sum();
        assert!(total_cu > 0, "unified device has no compute units");

        let num_wg = packet.num_workgroups();
        let wg_per_cu = num_wg.div_ceil(total_cu);

        let mut wg_dist = Vec::with_capacity(members.len() + 1);
        wg_dist.push(0);
        let mut allocated = 0u64;
        for &m in members.iter() {
            allocated += self.allocator.device(m).properties.cu_count as u64 * wg_per_cu;
            wg_dist.push(allocated);
        }

        if allocated < num_wg {
            panic!("workgroup distribution covers only {allocated} of {num_wg} workgroups");
        }
        wg_dist
    }
}

impl TickingComponent for Driver {
    fn tick(&mut self) -> bool {
        Driver::tick(self)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::harness::{drain, gpu_props, rig, ticks};
    use super::*;
    use crate::command::{Buffer, ExtensionPayload};
    use crate::kernel::{CodeObject, Dim3, DispatchPacket};

    fn trivial_launch() -> Command {
        Command::launch_kernel(
            CodeObject::new("vec_add"),
            DispatchPacket::new(Dim3::x(64), Dim3::x(64)),
            0x2000,
        )
    }

    #[test]
    fn single_gpu_launch_runs_to_completion() {
        let mut rig = rig(&[4]);
        let ctx = rig.driver.create_context();
        let q = rig.driver.create_command_queue(&ctx, 1).unwrap();

        // Buffer placement belongs to the benchmark harness; the driver
        // only flips dirty bits on launch.
        ctx.add_buffer(Buffer { device_id: 1, v_addr: 0x2000, size: 4096, dirty: false });

        q.enqueue(Command::noop());
        q.enqueue(trivial_launch());

        // noop drains one tick, the launch is admitted the next and its
        // request goes out the tick after that
        ticks(&mut rig.driver, 4);

        let sent = drain(&rig.cp_ports[0]);
        assert_eq!(sent.len(), 1);
        let Msg::LaunchKernelReq(req) = &sent[0] else {
            panic!("expected a launch request, got {}", sent[0].kind())
        };
        assert_eq!(req.pid, ctx.pid());
        assert!(req.wg_filter.is_none());
        assert!(ctx.l2_dirty());
        assert!(ctx.buffers().iter().all(|b| b.dirty));
        assert!(!q.is_empty(), "launch stays at the head until it completes");

        rig.driver
            .gpu_port
            .deliver(Msg::LaunchKernelRsp(LaunchKernelRsp { rsp_to: req.id }))
            .unwrap();
        ticks(&mut rig.driver, 2);

        assert!(q.is_empty());
        assert!(drain(&rig.cp_ports[0]).is_empty(), "exactly one request was sent");
        let snap = rig.driver.trace.snapshot();
        assert_eq!(snap.commands_completed, 2);
        assert_eq!(snap.reqs_finalized, 1);
    }

    fn unified_launch_requests(cu_counts: &[u32], grid_x: u32) -> Vec<(usize, Msg)> {
        let mut rig = rig(cu_counts);
        let members: Vec<usize> = (1..=cu_counts.len()).collect();
        let unified = rig.driver.create_unified_gpu(&members).unwrap();

        let ctx = rig.driver.create_context();
        let q = rig.driver.create_command_queue(&ctx, unified).unwrap();

        let packet = DispatchPacket::new(Dim3::x(grid_x), Dim3::x(1));
        q.enqueue(Command::launch_unified(
            CodeObject::new("reduce"),
            vec![packet; cu_counts.len()],
            vec![0x3000; cu_counts.len()],
        ));

        ticks(&mut rig.driver, 2 + cu_counts.len());

        let mut sent = Vec::new();
        for (i, cp) in rig.cp_ports.iter().enumerate() {
            for msg in drain(cp) {
                sent.push((i + 1, msg));
            }
        }
        sent
    }

    #[test]
    fn unified_launch_splits_evenly_across_equal_gpus() {
        // 8 workgroups over 2+2 CUs: wg_dist = [0, 4, 8]
        let sent = unified_launch_requests(&[2, 2], 8);
        assert_eq!(sent.len(), 2);

        let packet = DispatchPacket::new(Dim3::x(8), Dim3::x(1));
        for (gpu_id, msg) in &sent {
            let Msg::LaunchKernelReq(req) = msg else { panic!() };
            let filter = req.wg_filter.unwrap();
            let expected = match gpu_id {
                1 => WorkgroupFilter { lo: 0, hi: 4 },
                2 => WorkgroupFilter { lo: 4, hi: 8 },
                _ => unreachable!(),
            };
            assert_eq!(filter, expected);
            let accepted: Vec<u32> =
                (0..8).filter(|&x| filter.accepts(&packet, Dim3::x(x))).collect();
            assert_eq!(accepted.len() as u64, filter.len());
        }
    }

    #[test]
    fn unified_launch_weights_by_cu_count() {
        // 8 workgroups over 1+3 CUs: wg_per_cu = 2, ranges [0,2) and [2,8)
        let sent = unified_launch_requests(&[1, 3], 8);
        assert_eq!(sent.len(), 2);

        for (gpu_id, msg) in &sent {
            let Msg::LaunchKernelReq(req) = msg else { panic!() };
            let filter = req.wg_filter.unwrap();
            match gpu_id {
                1 => assert_eq!(filter, WorkgroupFilter { lo: 0, hi: 2 }),
                2 => assert_eq!(filter, WorkgroupFilter { lo: 2, hi: 8 }),
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn unified_launch_completes_after_all_members_respond() {
        let mut rig = rig(&[2, 2]);
        let unified = rig.driver.create_unified_gpu(&[1, 2]).unwrap();
        let ctx = rig.driver.create_context();
        let q = rig.driver.create_command_queue(&ctx, unified).unwrap();

        let packet = DispatchPacket::new(Dim3::x(8), Dim3::x(1));
        q.enqueue(Command::launch_unified(
            CodeObject::new("reduce"),
            vec![packet; 2],
            vec![0; 2],
        ));
        ticks(&mut rig.driver, 4);

        let mut req_ids = Vec::new();
        for cp in &rig.cp_ports {
            for msg in drain(cp) {
                let Msg::LaunchKernelReq(req) = msg else { panic!() };
                req_ids.push(req.id);
            }
        }
        assert_eq!(req_ids.len(), 2);

        rig.driver
            .gpu_port
            .deliver(Msg::LaunchKernelRsp(LaunchKernelRsp { rsp_to: req_ids[0] }))
            .unwrap();
        ticks(&mut rig.driver, 2);
        assert!(!q.is_empty(), "one member still outstanding");

        rig.driver
            .gpu_port
            .deliver(Msg::LaunchKernelRsp(LaunchKernelRsp { rsp_to: req_ids[1] }))
            .unwrap();
        ticks(&mut rig.driver, 2);
        assert!(q.is_empty());
    }

    #[test]
    fn backpressure_preserves_order_and_drops_nothing() {
        // A CP with room for a single message at a time
        let mut driver = Driver::new(DriverConfig::default());
        let cp = Port::with_capacity("GPU1.CP", 1);
        driver.register_gpu(cp.clone(), gpu_props(4));

        let ctx = driver.create_context();
        let queues: Vec<_> = (0..3)
            .map(|_| driver.create_command_queue(&ctx, 1).unwrap())
            .collect();
        for q in &queues {
            q.enqueue(trivial_launch());
        }

        // Admission queues all three requests; only the first fits.
        ticks(&mut driver, 2);
        assert_eq!(driver.requests_to_send.len(), 2);

        // The port stays full: the send step makes no progress and the
        // whole tick reports none.
        assert!(!driver.tick());
        assert!(!driver.tick());
        assert_eq!(driver.requests_to_send.len(), 2);

        // Drain one slot per tick and collect the arrival order.
        let mut arrived = Vec::new();
        for _ in 0..3 {
            if let Some(Msg::LaunchKernelReq(req)) = cp.retrieve() {
                arrived.push(req.id);
            }
            driver.tick();
        }
        if let Some(Msg::LaunchKernelReq(req)) = cp.retrieve() {
            arrived.push(req.id);
        }

        assert_eq!(arrived.len(), 3, "no request was dropped");
        let mut sorted = arrived.clone();
        sorted.sort_unstable();
        assert_eq!(arrived, sorted, "requests kept their append order");
    }

    #[derive(Debug)]
    struct FlushL2;

    impl ExtensionPayload for FlushL2 {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct FlushMiddleware;

    impl Middleware for FlushMiddleware {
        fn process_command(&mut self, queue: &mut CommandQueue) -> bool {
            let recognized = matches!(
                queue.peek(),
                Some(Command::Extension { payload, .. })
                    if payload.as_any().downcast_ref::<FlushL2>().is_some()
            );
            if !recognized {
                return false;
            }
            queue.dequeue();
            true
        }

        fn tick(&mut self) -> bool {
            false
        }
    }

    struct RejectingMiddleware;

    impl Middleware for RejectingMiddleware {
        fn process_command(&mut self, _queue: &mut CommandQueue) -> bool {
            false
        }

        fn tick(&mut self) -> bool {
            false
        }
    }

    #[test]
    fn first_accepting_middleware_claims_extension_commands() {
        let mut rig = rig(&[4]);
        rig.driver.add_middleware(Box::new(RejectingMiddleware));
        rig.driver.add_middleware(Box::new(FlushMiddleware));

        let ctx = rig.driver.create_context();
        let q = rig.driver.create_command_queue(&ctx, 1).unwrap();
        q.enqueue(Command::extension(Box::new(FlushL2)));

        ticks(&mut rig.driver, 2);
        assert!(q.is_empty());
    }

    #[test]
    fn unclaimed_extension_commands_stay_queued() {
        let mut rig = rig(&[4]);
        rig.driver.add_middleware(Box::new(RejectingMiddleware));

        let ctx = rig.driver.create_context();
        let q = rig.driver.create_command_queue(&ctx, 1).unwrap();
        q.enqueue(Command::extension(Box::new(FlushL2)));

        ticks(&mut rig.driver, 3);
        assert_eq!(q.num_commands(), 1);
    }

    #[test]
    fn queue_creation_validates_the_device() {
        let mut rig = rig(&[4]);
        let ctx = rig.driver.create_context();
        assert!(rig.driver.create_command_queue(&ctx, 0).is_err(), "CPU sentinel");
        assert!(rig.driver.create_command_queue(&ctx, 9).is_err(), "unknown device");
        assert!(rig.driver.create_command_queue(&ctx, 1).is_ok());
    }

}
