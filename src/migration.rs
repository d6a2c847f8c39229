/// The page-migration orchestrator.
///
/// A single MMU request drives a five-phase barrier across the GPUs:
///
///   DRAIN_RDMA    drain every GPU's RDMA engine so no in-flight remote
///                 access can observe the stale physical page
///   SHOOTDOWN     invalidate translations on every accessing GPU
///   MIGRATE       copy each page to its requesting GPU, one at a time
///                 through the destination CP's migration channel
///   GPU_RESTART   resume the accessing GPUs' pipelines
///   RDMA_RESTART  resume every RDMA engine, then go idle
///
/// Each phase fans out requests and counts acknowledgements; the next
/// phase's requests are emitted exactly when the previous counter reaches
/// zero. The MMU response is prepared at the MIGRATE boundary and
/// transmitted by the tick loop independently of the remaining phases.
use std::collections::VecDeque;

use tracing::debug;

use crate::driver::Driver;
use crate::port::Port;
use crate::protocol::{
    GpuRestartReq, Msg, PageMigrationReqToCp, PageMigrationReqToDriver,
    PageMigrationRspFromDriver, RdmaDrainCmd, RdmaRestartCmd, ShootdownCmd,
};

/// One queued page copy: the destination GPU's CP and the v-addr the
/// driver clears `is_migrating` for once the copy completes.
pub(crate) struct PendingPageCopy {
    pub(crate) dst: Port,
    pub(crate) req: PageMigrationReqToCp,
    pub(crate) v_addr: u64,
}

/// The at-most-one migration in flight. Exists from MMU request
/// acceptance until the last RDMA-restart acknowledgement.
pub(crate) struct MigrationState {
    pub(crate) req: PageMigrationReqToDriver,
    pub(crate) reqs_to_cp: VecDeque<PendingPageCopy>,
    pub(crate) rdma_drain_pending: usize,
    pub(crate) shootdown_pending: usize,
    pub(crate) pages_migrating: usize,
    pub(crate) gpu_restart_pending: usize,
    pub(crate) rdma_restart_pending: usize,
    /// v-addr of the one copy currently on the wire
    pub(crate) migrating_one_page: Option<u64>,
}

impl MigrationState {
    fn new(req: PageMigrationReqToDriver) -> Self {
        MigrationState {
            req,
            reqs_to_cp: VecDeque::new(),
            rdma_drain_pending: 0,
            shootdown_pending: 0,
            pages_migrating: 0,
            gpu_restart_pending: 0,
            rdma_restart_pending: 0,
            migrating_one_page: None,
        }
    }
}

/// Decrement a phase counter; underflow means a response arrived for a
/// request this phase never sent.
fn take_ack(counter: &mut usize, phase: &str) -> bool {
    if *counter == 0 {
        panic!("{phase} acknowledgement underflow");
    }
    *counter -= 1;
    *counter == 0
}

impl Driver {
    fn migration_ref(&self) -> &MigrationState {
        match self.migration.as_ref() {
            Some(migration) => migration,
            None => panic!("migration response with no migration in flight"),
        }
    }

    fn migration_mut(&mut self) -> &mut MigrationState {
        match self.migration.as_mut() {
            Some(migration) => migration,
            None => panic!("migration response with no migration in flight"),
        }
    }

    /// The requesting GPUs' v-addr lists in ascending device-id order.
    /// Keys of `gpu_to_vaddrs` are 1-based device ids; fixing the
    /// iteration order makes shootdown lists, copy issue order, and the
    /// MMU response deterministic.
    fn requested_vaddrs_by_gpu(&self) -> Vec<(usize, Vec<u64>)> {
        let migration = self.migration_ref();
        let mut ordered = Vec::new();
        for gpu_id in 1..=self.gpus.len() {
            if let Some(vaddrs) = migration.req.migration_info.gpu_to_vaddrs.get(&gpu_id) {
                ordered.push((gpu_id, vaddrs.clone()));
            }
        }
        ordered
    }

    // -----------------------------------------------------------------------
    // Entry: accept one MMU request when idle
    // -----------------------------------------------------------------------

    /// Handle at most one incoming MMU message per tick. While a migration
    /// is in flight the inbox is left untouched, so a second request waits
    /// its turn there.
    pub(crate) fn parse_from_mmu(&mut self) -> bool {
        if self.migration.is_some() {
            return false;
        }
        let Some(msg) = self.mmu_port.retrieve() else {
            return false;
        };
        match msg {
            Msg::PageMigrationReqToDriver(req) => {
                debug!(
                    pid = req.pid.0,
                    host_gpu = req.current_host_gpu,
                    "page migration accepted"
                );
                self.migration = Some(MigrationState::new(req));
                self.initiate_rdma_drain();
                true
            }
            other => panic!("driver cannot handle {} on the MMU port", other.kind()),
        }
    }

    // -----------------------------------------------------------------------
    // Phase 1: DRAIN_RDMA
    // -----------------------------------------------------------------------

    fn initiate_rdma_drain(&mut self) {
        for gpu in &self.gpus {
            self.requests_to_send.push_back((
                gpu.clone(),
                Msg::RdmaDrainCmd(RdmaDrainCmd { src: self.gpu_port.clone() }),
            ));
        }
        let num_gpus = self.gpus.len();
        self.migration_mut().rdma_drain_pending = num_gpus;
    }

    pub(crate) fn process_rdma_drain_rsp(&mut self) -> bool {
        let migration = self.migration_mut();
        if take_ack(&mut migration.rdma_drain_pending, "RDMA drain") {
            debug!("RDMA engines drained");
            self.send_shootdown_reqs();
        }
        true
    }

    // -----------------------------------------------------------------------
    // Phase 2: SHOOTDOWN
    // -----------------------------------------------------------------------

    fn send_shootdown_reqs(&mut self) {
        let vaddrs: Vec<u64> = self
            .requested_vaddrs_by_gpu()
            .into_iter()
            .flat_map(|(_, vaddrs)| vaddrs)
            .collect();

        let migration = self.migration_mut();
        let accessing_gpus = migration.req.accessing_gpus.clone();
        let pid = migration.req.pid;
        migration.shootdown_pending = accessing_gpus.len();

        for &gpu_id in &accessing_gpus {
            let dst = self.gpus[gpu_id - 1].clone();
            self.requests_to_send.push_back((
                dst,
                Msg::ShootdownCmd(ShootdownCmd {
                    src: self.gpu_port.clone(),
                    vaddrs: vaddrs.clone(),
                    pid,
                }),
            ));
        }
    }

    pub(crate) fn process_shootdown_complete_rsp(&mut self) -> bool {
        let migration = self.migration_mut();
        if take_ack(&mut migration.shootdown_pending, "shootdown") {
            debug!("translations shot down");
            self.prepare_page_migration_reqs();
        }
        true
    }

    // -----------------------------------------------------------------------
    // Phase 3: MIGRATE
    // -----------------------------------------------------------------------

    /// For every requested v-addr: retarget the mapping to the requesting
    /// GPU and queue a copy request to that GPU's CP, reading from the
    /// current host GPU's PMC.
    fn prepare_page_migration_reqs(&mut self) {
        let by_gpu = self.requested_vaddrs_by_gpu();
        let (pid, page_size, host_gpu) = {
            let migration = self.migration_ref();
            (migration.req.pid, migration.req.page_size, migration.req.current_host_gpu)
        };

        // The faulting process must be a live context.
        let _ctx = self.context_with_pid(pid);
        let src_pmc = self.remote_pmc_ports[host_gpu - 1].clone();

        let mut total_pages = 0;
        for (gpu_id, vaddrs) in by_gpu {
            for v_addr in vaddrs {
                let old_paddr = match self.page_table.find(pid, v_addr) {
                    Some(page) => page.p_addr,
                    None => panic!("no page at {v_addr:#x} for {pid} during migration"),
                };

                let mut page = match self.allocator.allocate_page_with_vaddr(
                    &mut self.page_table,
                    pid,
                    gpu_id,
                    v_addr,
                    true,
                ) {
                    Ok(page) => page,
                    Err(err) => panic!("migration target allocation failed: {err}"),
                };
                page.is_migrating = true;
                let dst_paddr = page.p_addr;
                self.page_table.update(page);

                let req = PageMigrationReqToCp {
                    src: self.gpu_port.clone(),
                    dst_pmc_port: src_pmc.clone(),
                    src_paddr: old_paddr,
                    dst_paddr,
                    page_size,
                };
                let dst = self.gpus[gpu_id - 1].clone();
                self.migration_mut().reqs_to_cp.push_back(PendingPageCopy {
                    dst,
                    req,
                    v_addr,
                });
                total_pages += 1;
            }
        }

        self.migration_mut().pages_migrating = total_pages;
    }

    /// Tick sub-step: put the next queued copy on the wire, but only when
    /// no copy is in flight — the CP's migration channel is not
    /// multiplexed.
    pub(crate) fn send_migration_req_to_cp(&mut self) -> bool {
        let Some(migration) = self.migration.as_mut() else {
            return false;
        };
        if migration.migrating_one_page.is_some() {
            return false;
        }
        let Some(copy) = migration.reqs_to_cp.pop_front() else {
            return false;
        };

        match copy.dst.deliver(Msg::PageMigrationReqToCp(copy.req.clone())) {
            Ok(()) => {
                migration.migrating_one_page = Some(copy.v_addr);
                true
            }
            Err(_) => {
                migration.reqs_to_cp.push_front(copy);
                false
            }
        }
    }

    pub(crate) fn process_page_migration_rsp_from_cp(&mut self) -> bool {
        let (pid, v_addr) = {
            let migration = self.migration_mut();
            let v_addr = match migration.migrating_one_page.take() {
                Some(v_addr) => v_addr,
                None => panic!("page copy response with no copy in flight"),
            };
            (migration.req.pid, v_addr)
        };

        // The copy has landed; the new mapping is live.
        match self.page_table.find_mut(pid, v_addr) {
            Some(page) => page.is_migrating = false,
            None => panic!("migrated page {v_addr:#x} vanished from the page table"),
        }
        self.trace.page_migrated(v_addr);

        let migration = self.migration_mut();
        if take_ack(&mut migration.pages_migrating, "page migration") {
            debug!("all pages copied");
            self.prepare_gpu_restart_reqs();
            self.prepare_page_migration_rsp_to_mmu();
        }
        true
    }

    // -----------------------------------------------------------------------
    // Phase 4: GPU_RESTART
    // -----------------------------------------------------------------------

    fn prepare_gpu_restart_reqs(&mut self) {
        let accessing_gpus = self.migration_ref().req.accessing_gpus.clone();
        for &gpu_id in &accessing_gpus {
            let dst = self.gpus[gpu_id - 1].clone();
            self.requests_to_send.push_back((
                dst,
                Msg::GpuRestartReq(GpuRestartReq { src: self.gpu_port.clone() }),
            ));
        }
        self.migration_mut().gpu_restart_pending = accessing_gpus.len();
    }

    /// The response carries every v-addr that moved and echoes the
    /// respond-to-top flag. It is dispatched by the tick loop's MMU send
    /// step and does not gate the restart phases.
    fn prepare_page_migration_rsp_to_mmu(&mut self) {
        let vaddrs: Vec<u64> = self
            .requested_vaddrs_by_gpu()
            .into_iter()
            .flat_map(|(_, vaddrs)| vaddrs)
            .collect();

        let (dst, rsp_to_top) = {
            let migration = self.migration_ref();
            (migration.req.src.clone(), migration.req.respond_to_top)
        };
        let rsp = PageMigrationRspFromDriver { vaddrs, rsp_to_top };
        self.to_send_to_mmu = Some((dst, Msg::PageMigrationRspFromDriver(rsp)));
    }

    pub(crate) fn process_gpu_restart_rsp(&mut self) -> bool {
        let migration = self.migration_mut();
        if take_ack(&mut migration.gpu_restart_pending, "GPU restart") {
            debug!("accessing GPUs restarted");
            self.prepare_rdma_restart_reqs();
        }
        true
    }

    // -----------------------------------------------------------------------
    // Phase 5: RDMA_RESTART
    // -----------------------------------------------------------------------

    fn prepare_rdma_restart_reqs(&mut self) {
        for gpu in &self.gpus {
            self.requests_to_send.push_back((
                gpu.clone(),
                Msg::RdmaRestartCmd(RdmaRestartCmd { src: self.gpu_port.clone() }),
            ));
        }
        let num_gpus = self.gpus.len();
        self.migration_mut().rdma_restart_pending = num_gpus;
    }

    pub(crate) fn process_rdma_restart_rsp(&mut self) -> bool {
        let migration = self.migration_mut();
        if take_ack(&mut migration.rdma_restart_pending, "RDMA restart") {
            self.migration = None;
            self.trace.migration_complete();
        }
        true
    }
}
