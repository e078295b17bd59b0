use std::net::Ipv4Addr;

use codec::{
    FlowId, ServiceId,
    ctrl::{CtrlMessage, Registration, ResolveUpcall},
};
use service::StackHandler;
use tokio::sync::mpsc::UnboundedSender;

/// Bridges stack events onto the resolver control socket.
///
/// Upcalls are fire-and-forget: when the channel is gone the event is
/// logged and dropped, the stack is never blocked on the resolver.
#[derive(Clone)]
pub struct Observer {
    upcalls: UnboundedSender<CtrlMessage>,
}

impl Observer {
    pub fn new(upcalls: UnboundedSender<CtrlMessage>) -> Self {
        Self { upcalls }
    }

    fn push(&self, message: CtrlMessage) {
        if self.upcalls.send(message).is_err() {
            log::warn!("resolver upcall dropped: control channel closed");
        }
    }
}

impl StackHandler for Observer {
    fn on_resolve_miss(&self, src: Option<&ServiceId>, dst: &ServiceId, src_addr: Ipv4Addr) {
        log::debug!("resolution miss for {}", dst);

        self.push(CtrlMessage::Resolve(ResolveUpcall {
            src_flags: 0,
            src_prefix_bits: 0,
            dst_flags: 0,
            dst_prefix_bits: 0,
            src_service: src.copied().unwrap_or_default(),
            dst_service: *dst,
            src_address: src_addr,
        }));
    }

    fn on_register(&self, service: &ServiceId, prefix_bits: u8) {
        log::info!("service registered: {} /{}", service, prefix_bits);

        self.push(CtrlMessage::Register(Registration {
            reregister: false,
            prefix_bits,
            srvid_flags: 0,
            address: Ipv4Addr::UNSPECIFIED,
            service_id: *service,
        }));
    }

    fn on_unregister(&self, service: &ServiceId, prefix_bits: u8) {
        log::info!("service unregistered: {} /{}", service, prefix_bits);

        self.push(CtrlMessage::Unregister(Registration {
            reregister: false,
            prefix_bits,
            srvid_flags: 0,
            address: Ipv4Addr::UNSPECIFIED,
            service_id: *service,
        }));
    }

    fn on_established(&self, flow: FlowId) {
        log::info!("connection established: flow={}", flow);
    }

    fn on_closed(&self, flow: FlowId) {
        log::info!("connection closed: flow={}", flow);
    }
}
