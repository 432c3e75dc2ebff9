use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use interface::{AccessFlags, MrKeys, RemoteKey};
use rdma::mr::MemoryRegion;
use rdma::verbs::ProtectionDomain;

use crate::config::CommunicatorConfig;
use crate::error::Error;
use crate::slot::WorkRequestType;

/// Owns the registered region and its split into segments.
///
/// The segment of slot `id` of type `ty` starts at
/// `base + (type_offset(ty) + id) * segment_size`, where the type offsets follow the order of
/// `work_request_types` in the config. Segments never overlap and never move.
pub struct BufferManager {
    region: MemoryRegion,
    pd: Arc<dyn ProtectionDomain>,
    keys: MrKeys,
    registered: AtomicBool,
    segment_size: usize,
    max_slots: u32,
    // in slots
    type_offsets: [Option<usize>; WorkRequestType::COUNT],
    types: Vec<WorkRequestType>,
}

impl fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferManager")
            .field("region", &self.region)
            .field("keys", &self.keys)
            .field("segment_size", &self.segment_size)
            .field("max_slots", &self.max_slots)
            .field("types", &self.types)
            .finish()
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        self.deregister();
    }
}

impl BufferManager {
    /// Maps and registers a region large enough for every segment of the layout.
    pub fn new(config: &CommunicatorConfig, pd: Arc<dyn ProtectionDomain>) -> Result<Self, Error> {
        config.validate()?;
        let capacity = config.region_capacity()?;
        let region = MemoryRegion::new(capacity)?;

        let mut type_offsets = [None; WorkRequestType::COUNT];
        for (i, ty) in config.work_request_types.iter().enumerate() {
            type_offsets[ty.index()] = Some(i * config.max_work_requests as usize);
        }

        let access =
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_READ;
        // SAFETY: the region is deregistered before it is unmapped.
        let keys = unsafe { pd.register(region.as_mut_ptr(), region.len(), access)? };
        tracing::debug!(
            "registered region {:#x}, len: {}, lkey: {}, rkey: {}",
            region.addr(),
            region.len(),
            keys.lkey,
            keys.rkey
        );

        Ok(BufferManager {
            region,
            pd,
            keys,
            registered: AtomicBool::new(true),
            segment_size: config.max_buffer_size,
            max_slots: config.max_work_requests,
            type_offsets,
            types: config.work_request_types.clone(),
        })
    }

    /// Address and remote key of the whole region, to be shared with the peer.
    #[inline]
    pub fn registered_region(&self) -> RemoteKey {
        RemoteKey {
            rkey: self.keys.rkey,
            addr: self.region.addr(),
        }
    }

    #[inline]
    pub fn keys(&self) -> MrKeys {
        self.keys
    }

    #[inline]
    pub fn lkey(&self) -> u32 {
        self.keys.lkey
    }

    #[inline]
    pub fn region_len(&self) -> usize {
        self.region.len()
    }

    #[inline]
    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    #[inline]
    pub fn max_slots(&self) -> u32 {
        self.max_slots
    }

    #[inline]
    pub fn work_request_types(&self) -> &[WorkRequestType] {
        &self.types
    }

    /// Offset of the segment from the start of the region.
    pub fn segment_offset(&self, ty: WorkRequestType, id: u32) -> Option<u64> {
        if id >= self.max_slots {
            return None;
        }
        let slot = self.type_offsets[ty.index()]? + id as usize;
        Some((slot * self.segment_size) as u64)
    }

    #[inline]
    pub fn segment_address(&self, ty: WorkRequestType, id: u32) -> Option<u64> {
        self.segment_offset(ty, id)
            .map(|offset| self.region.addr() + offset)
    }

    #[inline]
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Deregisters the region. The memory stays mapped until drop.
    pub fn deregister(&self) {
        if self.registered.swap(false, Ordering::AcqRel) {
            self.pd.deregister(self.keys);
            tracing::debug!("deregistered region {:#x}", self.region.addr());
        }
    }
}
