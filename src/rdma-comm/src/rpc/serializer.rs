use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SerializationError;

/// Encodes the payload of a packet into the bytes behind its header.
pub trait RpcDataSerializer {
    type Data;

    /// Returns the number of bytes written.
    fn write_to_buffer(&self, data: &Self::Data, buf: &mut [u8])
        -> Result<usize, SerializationError>;

    fn read_from_buffer(&self, buf: &[u8]) -> Result<Self::Data, SerializationError>;
}

/// Any serde type, encoded with bincode.
pub struct BincodeSerializer<T>(PhantomData<fn() -> T>);

impl<T> BincodeSerializer<T> {
    pub fn new() -> Self {
        BincodeSerializer(PhantomData)
    }
}

impl<T> Default for BincodeSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodeSerializer<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Copy for BincodeSerializer<T> {}

impl<T: Serialize + DeserializeOwned> RpcDataSerializer for BincodeSerializer<T> {
    type Data = T;

    fn write_to_buffer(&self, data: &T, buf: &mut [u8]) -> Result<usize, SerializationError> {
        let required = bincode::serialized_size(data)? as usize;
        if required > buf.len() {
            return Err(SerializationError::BufferTooSmall {
                required,
                capacity: buf.len(),
            });
        }
        bincode::serialize_into(&mut buf[..required], data)?;
        Ok(required)
    }

    fn read_from_buffer(&self, buf: &[u8]) -> Result<T, SerializationError> {
        Ok(bincode::deserialize(buf)?)
    }
}
