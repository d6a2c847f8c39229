/// Functional command-processor model.
///
/// Stands in for a full GPU front-end in the demo binary and integration
/// tests: every driver request is acknowledged with its matching response
/// on the next tick, with no compute and no timing. A reply that hits
/// backpressure is held and retried, so the one-response-per-request
/// contract survives a full driver inbox.
use crate::engine::TickingComponent;
use crate::port::Port;
use crate::protocol::{
    GpuRestartRsp, LaunchKernelRsp, Msg, PageMigrationRspToDriver, RdmaDrainRsp,
    RdmaRestartRsp, ShootdownCompleteRsp,
};

pub struct CommandProcessor {
    port: Port,
    pending_reply: Option<(Port, Msg)>,
}

impl CommandProcessor {
    pub fn new(name: &str) -> Self {
        CommandProcessor { port: Port::new(name), pending_reply: None }
    }

    /// The port the driver sends requests to.
    pub fn port(&self) -> Port {
        self.port.clone()
    }

    fn respond_to(msg: Msg) -> (Port, Msg) {
        match msg {
            Msg::LaunchKernelReq(req) => {
                (req.src, Msg::LaunchKernelRsp(LaunchKernelRsp { rsp_to: req.id }))
            }
            Msg::RdmaDrainCmd(cmd) => (cmd.src, Msg::RdmaDrainRsp(RdmaDrainRsp {})),
            Msg::ShootdownCmd(cmd) => {
                (cmd.src, Msg::ShootdownCompleteRsp(ShootdownCompleteRsp {}))
            }
            Msg::PageMigrationReqToCp(req) => {
                (req.src, Msg::PageMigrationRspToDriver(PageMigrationRspToDriver {}))
            }
            Msg::GpuRestartReq(req) => (req.src, Msg::GpuRestartRsp(GpuRestartRsp {})),
            Msg::RdmaRestartCmd(cmd) => (cmd.src, Msg::RdmaRestartRsp(RdmaRestartRsp {})),
            other => panic!("command processor cannot handle {}", other.kind()),
        }
    }
}

impl TickingComponent for CommandProcessor {
    fn tick(&mut self) -> bool {
        if let Some((dst, msg)) = self.pending_reply.take() {
            if let Err(msg) = dst.deliver(msg) {
                self.pending_reply = Some((dst, msg));
                return false;
            }
            return true;
        }

        let Some(msg) = self.port.retrieve() else {
            return false;
        };
        let (dst, rsp) = Self::respond_to(msg);
        if let Err(rsp) = dst.deliver(rsp) {
            self.pending_reply = Some((dst, rsp));
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{CodeObject, Dim3, DispatchPacket};
    use crate::memory::Pid;
    use crate::protocol::LaunchKernelReq;

    #[test]
    fn acknowledges_one_request_per_tick() {
        let mut cp = CommandProcessor::new("GPU1.CP");
        let driver_side = Port::new("Driver.ToGPUs");

        let req = LaunchKernelReq {
            id: 42,
            src: driver_side.clone(),
            pid: Pid(1),
            code_object: CodeObject::new("k"),
            packet: DispatchPacket::new(Dim3::x(1), Dim3::x(1)),
            packet_addr: 0,
            wg_filter: None,
        };
        cp.port().deliver(Msg::LaunchKernelReq(req)).unwrap();

        assert!(cp.tick());
        let Some(Msg::LaunchKernelRsp(rsp)) = driver_side.retrieve() else {
            panic!("expected a launch response")
        };
        assert_eq!(rsp.rsp_to, 42);
        assert!(!cp.tick(), "idle once the inbox is empty");
    }

    #[test]
    fn holds_the_reply_under_backpressure() {
        let mut cp = CommandProcessor::new("GPU1.CP");
        let driver_side = Port::with_capacity("Driver.ToGPUs", 1);
        driver_side
            .deliver(Msg::RdmaDrainRsp(RdmaDrainRsp {}))
            .unwrap();

        cp.port()
            .deliver(Msg::GpuRestartReq(crate::protocol::GpuRestartReq {
                src: driver_side.clone(),
            }))
            .unwrap();

        assert!(cp.tick(), "request consumed, reply parked");
        assert_eq!(driver_side.pending_count(), 1);

        driver_side.retrieve().unwrap();
        assert!(cp.tick(), "parked reply flushed");
        assert!(matches!(driver_side.retrieve(), Some(Msg::GpuRestartRsp(_))));
    }
}
