use static_assertions::const_assert;

use super::{RpcDataSerializer, RpcMessageType};
use crate::error::{Error, SerializationError};
use crate::slot::WorkRequestProxy;

/// Bytes taken by the header at the start of every packet.
pub const HEADER_LEN: usize = 16;

/// `| type: u8 | pad: [u8; 3] | operation_type: u32 | operation_id: u64 |`, little endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub message_type: RpcMessageType,
    /// The RPC method the packet belongs to.
    pub operation_type: u32,
    /// Matches a response to its request.
    pub operation_id: u64,
}

const_assert!(1 + 3 + 4 + 8 == HEADER_LEN);

impl PacketHeader {
    pub fn new(message_type: RpcMessageType, operation_type: u32, operation_id: u64) -> Self {
        PacketHeader {
            message_type,
            operation_type,
            operation_id,
        }
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<(), SerializationError> {
        let capacity = buf.len();
        let buf = buf
            .get_mut(..HEADER_LEN)
            .ok_or(SerializationError::BufferTooSmall {
                required: HEADER_LEN,
                capacity,
            })?;
        buf[0] = self.message_type as u8;
        buf[1..4].fill(0);
        buf[4..8].copy_from_slice(&self.operation_type.to_le_bytes());
        buf[8..16].copy_from_slice(&self.operation_id.to_le_bytes());
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, SerializationError> {
        if buf.len() < HEADER_LEN {
            return Err(SerializationError::BufferTooSmall {
                required: HEADER_LEN,
                capacity: buf.len(),
            });
        }
        let message_type = RpcMessageType::try_from(buf[0])?;
        // infallible, the length is checked above
        let operation_type = u32::from_le_bytes(buf[4..8].try_into().unwrap_or_default());
        let operation_id = u64::from_le_bytes(buf[8..16].try_into().unwrap_or_default());
        Ok(PacketHeader {
            message_type,
            operation_type,
            operation_id,
        })
    }
}

/// An outbound packet, written into the buffer of the slot it holds.
#[derive(Debug)]
pub struct RpcPacket<'a> {
    proxy: WorkRequestProxy<'a>,
    header: PacketHeader,
}

impl<'a> RpcPacket<'a> {
    pub fn new(proxy: WorkRequestProxy<'a>, header: PacketHeader) -> Self {
        RpcPacket { proxy, header }
    }

    #[inline]
    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    /// Writes the header and the encoded `data`, and sets the slot length to cover both.
    pub fn write<S: RpcDataSerializer>(
        &mut self,
        serializer: &S,
        data: &S::Data,
    ) -> Result<(), Error> {
        let buf = self.proxy.buffer_mut();
        self.header.encode(buf)?;
        let n = serializer.write_to_buffer(data, &mut buf[HEADER_LEN..])?;
        self.proxy.set_len(HEADER_LEN + n)?;
        Ok(())
    }

    /// The slot, ready to be posted.
    pub fn into_proxy(self) -> WorkRequestProxy<'a> {
        self.proxy
    }
}

/// A packet as delivered to the receive handler.
#[derive(Debug, Clone, Copy)]
pub struct InboundPacket<'b> {
    pub header: PacketHeader,
    pub payload: &'b [u8],
}

impl<'b> InboundPacket<'b> {
    pub fn parse(bytes: &'b [u8]) -> Result<Self, SerializationError> {
        let header = PacketHeader::decode(bytes)?;
        Ok(InboundPacket {
            header,
            payload: &bytes[HEADER_LEN..],
        })
    }

    pub fn read_payload<S: RpcDataSerializer>(
        &self,
        serializer: &S,
    ) -> Result<S::Data, SerializationError> {
        serializer.read_from_buffer(self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let header = PacketHeader::new(RpcMessageType::Response, 0x0102_0304, 42);
        let mut buf = [0xffu8; HEADER_LEN];
        header.encode(&mut buf).unwrap();
        assert_eq!(buf[0], 1);
        assert_eq!(&buf[1..4], &[0, 0, 0]);
        assert_eq!(&buf[4..8], &[4, 3, 2, 1]);
        assert_eq!(buf[8], 42);
        assert_eq!(PacketHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn malformed_headers() {
        assert!(matches!(
            PacketHeader::decode(&[0u8; 7]),
            Err(SerializationError::BufferTooSmall { required: HEADER_LEN, capacity: 7 })
        ));
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = 9;
        assert!(matches!(
            InboundPacket::parse(&buf),
            Err(SerializationError::UnknownMessageType(9))
        ));
        assert!(PacketHeader::new(RpcMessageType::Request, 0, 0)
            .encode(&mut [0u8; 4])
            .is_err());
    }
}
