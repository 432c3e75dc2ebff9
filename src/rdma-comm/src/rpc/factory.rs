use std::sync::atomic::{AtomicU64, Ordering};

use super::{PacketHeader, RpcMessageType, RpcPacket};
use crate::slot::WorkRequestProxy;

/// Builds packets on top of acquired slots.
pub trait RpcPacketFactory {
    /// The header of a new packet of the given kind for RPC method `operation_type`.
    fn header(&self, message_type: RpcMessageType, operation_type: u32) -> PacketHeader;

    fn create<'a>(
        &self,
        proxy: WorkRequestProxy<'a>,
        message_type: RpcMessageType,
        operation_type: u32,
    ) -> RpcPacket<'a> {
        RpcPacket::new(proxy, self.header(message_type, operation_type))
    }

    /// A response or error to `request`, carrying its operation type and id.
    fn respond<'a>(
        &self,
        proxy: WorkRequestProxy<'a>,
        request: &PacketHeader,
        message_type: RpcMessageType,
    ) -> RpcPacket<'a> {
        let header = PacketHeader::new(message_type, request.operation_type, request.operation_id);
        RpcPacket::new(proxy, header)
    }
}

impl<F> RpcPacketFactory for F
where
    F: Fn(RpcMessageType, u32) -> PacketHeader,
{
    fn header(&self, message_type: RpcMessageType, operation_type: u32) -> PacketHeader {
        self(message_type, operation_type)
    }
}

/// Numbers operations in creation order, starting at 0.
#[derive(Debug, Default)]
pub struct DefaultPacketFactory {
    next_id: AtomicU64,
}

impl DefaultPacketFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RpcPacketFactory for DefaultPacketFactory {
    fn header(&self, message_type: RpcMessageType, operation_type: u32) -> PacketHeader {
        let operation_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        PacketHeader::new(message_type, operation_type, operation_id)
    }
}
