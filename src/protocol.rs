/// The closed message set exchanged over the driver's GPU and MMU ports.
///
/// Requests carry their source port so the responder knows where to route
/// the reply; launch responses carry `rsp_to`, the request id, which keys
/// completion back to the owning command. Dispatch anywhere in the crate is
/// an exhaustive match over `Msg` — there is no open-ended message type.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::kernel::{CodeObject, DispatchPacket, WorkgroupFilter};
use crate::memory::Pid;
use crate::port::Port;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide id source for commands and requests. Ids are unique for
/// the lifetime of the simulation.
pub fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// GPU-port traffic
// ---------------------------------------------------------------------------

/// Launch one kernel on one GPU. A unified launch sends several of these,
/// each with a workgroup filter selecting its slice of the grid.
#[derive(Debug, Clone)]
pub struct LaunchKernelReq {
    pub id: u64,
    pub src: Port,
    pub pid: Pid,
    pub code_object: CodeObject,
    pub packet: DispatchPacket,
    /// Device address the packet was written to
    pub packet_addr: u64,
    pub wg_filter: Option<WorkgroupFilter>,
}

#[derive(Debug, Clone)]
pub struct LaunchKernelRsp {
    pub rsp_to: u64,
}

/// Stop accepting new remote memory accesses and settle in-flight ones.
#[derive(Debug, Clone)]
pub struct RdmaDrainCmd {
    pub src: Port,
}

#[derive(Debug, Clone)]
pub struct RdmaDrainRsp {}

/// Invalidate cached translations for `vaddrs` across the GPU's TLBs.
#[derive(Debug, Clone)]
pub struct ShootdownCmd {
    pub src: Port,
    pub vaddrs: Vec<u64>,
    pub pid: Pid,
}

#[derive(Debug, Clone)]
pub struct ShootdownCompleteRsp {}

/// Copy one page over the device fabric. Sent to the destination GPU's CP;
/// `dst_pmc_port` names the source GPU's page-migration controller the copy
/// reads from.
#[derive(Debug, Clone)]
pub struct PageMigrationReqToCp {
    pub src: Port,
    pub dst_pmc_port: Port,
    pub src_paddr: u64,
    pub dst_paddr: u64,
    pub page_size: u64,
}

#[derive(Debug, Clone)]
pub struct PageMigrationRspToDriver {}

/// Resume a GPU's access pipelines after migration.
#[derive(Debug, Clone)]
pub struct GpuRestartReq {
    pub src: Port,
}

#[derive(Debug, Clone)]
pub struct GpuRestartRsp {}

#[derive(Debug, Clone)]
pub struct RdmaRestartCmd {
    pub src: Port,
}

#[derive(Debug, Clone)]
pub struct RdmaRestartRsp {}

// ---------------------------------------------------------------------------
// MMU-port traffic
// ---------------------------------------------------------------------------

/// Which GPU requested which v-addrs, keyed by 1-based device id.
#[derive(Debug, Clone, Default)]
pub struct PageMigrationInfo {
    pub gpu_to_vaddrs: HashMap<usize, Vec<u64>>,
}

/// The MMU's demand that a set of pages move to the GPUs that faulted on
/// them.
#[derive(Debug, Clone)]
pub struct PageMigrationReqToDriver {
    pub src: Port,
    pub pid: Pid,
    pub page_size: u64,
    /// 1-based id of the GPU currently hosting the pages
    pub current_host_gpu: usize,
    /// 1-based ids of the GPUs whose pipelines must pause for the move
    pub accessing_gpus: Vec<usize>,
    pub migration_info: PageMigrationInfo,
    pub respond_to_top: bool,
}

/// The single "migration done" event, listing every v-addr that moved.
#[derive(Debug, Clone)]
pub struct PageMigrationRspFromDriver {
    pub vaddrs: Vec<u64>,
    pub rsp_to_top: bool,
}

// ---------------------------------------------------------------------------
// Tagged message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Msg {
    LaunchKernelReq(LaunchKernelReq),
    LaunchKernelRsp(LaunchKernelRsp),
    RdmaDrainCmd(RdmaDrainCmd),
    RdmaDrainRsp(RdmaDrainRsp),
    ShootdownCmd(ShootdownCmd),
    ShootdownCompleteRsp(ShootdownCompleteRsp),
    PageMigrationReqToCp(PageMigrationReqToCp),
    PageMigrationRspToDriver(PageMigrationRspToDriver),
    GpuRestartReq(GpuRestartReq),
    GpuRestartRsp(GpuRestartRsp),
    RdmaRestartCmd(RdmaRestartCmd),
    RdmaRestartRsp(RdmaRestartRsp),
    PageMigrationReqToDriver(PageMigrationReqToDriver),
    PageMigrationRspFromDriver(PageMigrationRspFromDriver),
}

impl Msg {
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::LaunchKernelReq(_)           => "LaunchKernelReq",
            Msg::LaunchKernelRsp(_)           => "LaunchKernelRsp",
            Msg::RdmaDrainCmd(_)              => "RdmaDrainCmd",
            Msg::RdmaDrainRsp(_)              => "RdmaDrainRsp",
            Msg::ShootdownCmd(_)              => "ShootdownCmd",
            Msg::ShootdownCompleteRsp(_)      => "ShootdownCompleteRsp",
            Msg::PageMigrationReqToCp(_)      => "PageMigrationReqToCp",
            Msg::PageMigrationRspToDriver(_)  => "PageMigrationRspToDriver",
            Msg::GpuRestartReq(_)             => "GpuRestartReq",
            Msg::GpuRestartRsp(_)             => "GpuRestartRsp",
            Msg::RdmaRestartCmd(_)            => "RdmaRestartCmd",
            Msg::RdmaRestartRsp(_)            => "RdmaRestartRsp",
            Msg::PageMigrationReqToDriver(_)  => "PageMigrationReqToDriver",
            Msg::PageMigrationRspFromDriver(_) => "PageMigrationRspFromDriver",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = next_id();
        let b = next_id();
        assert!(b > a);
    }
}
