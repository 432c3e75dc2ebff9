//! RPC packets carried in slot buffers.
//!
//! Every packet starts with a fixed [`PacketHeader`]; the payload behind it is encoded by an
//! [`RpcDataSerializer`].
use serde::{Deserialize, Serialize};

use crate::error::SerializationError;

mod factory;
mod packet;
mod serializer;

pub use factory::{DefaultPacketFactory, RpcPacketFactory};
pub use packet::{InboundPacket, PacketHeader, RpcPacket, HEADER_LEN};
pub use serializer::{BincodeSerializer, RpcDataSerializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RpcMessageType {
    Request = 0,
    Response = 1,
    Error = 2,
}

impl TryFrom<u8> for RpcMessageType {
    type Error = SerializationError;

    fn try_from(value: u8) -> Result<Self, SerializationError> {
        match value {
            0 => Ok(RpcMessageType::Request),
            1 => Ok(RpcMessageType::Response),
            2 => Ok(RpcMessageType::Error),
            other => Err(SerializationError::UnknownMessageType(other)),
        }
    }
}
