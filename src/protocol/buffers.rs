// # Shared Buffers
//
// Refcounted header+payload container passed along the server pipelines
// without data duplication. A command received once can be handed to the
// executor, the binlog service, and any number of replicators by cloning
// an `Arc<SharedBuffers>`; consumers keep their own cursors into the
// immutable bytes. The header is mutable only while the container has a
// single owner (during FSM reads and response building), which the type
// system enforces by requiring `&mut` for every mutation.
//
// The payload slot has three states: empty, owned bytes, or bytes
// borrowed from a store record. Borrowed payloads carry a reader pin
// that keeps the record's reader count nonzero until the last consumer
// drops its reference, so a record marked for deletion cannot reclaim a
// payload that is still being streamed out.

use crate::compression::Compressor;
use crate::memory::{Domain, Memory};
use bytes::Bytes;
use std::sync::Arc;

/// Size of the inline scratch area used before the real header size is
/// known; never smaller than descriptor + header-size bytes (5).
pub const AUX_DATA_SIZE: usize = 12;

/// Implemented by store records whose payload can be pinned for reading.
pub trait PayloadHost: Send + Sync {
    fn unregister_reader(&self);
}

/// Keeps a record's reader count elevated; unregisters on drop.
pub struct ReaderPin {
    host: Arc<dyn PayloadHost>,
}

impl ReaderPin {
    /// The caller must have already called `register_reader` on the host
    /// under the record lock.
    pub fn new(host: Arc<dyn PayloadHost>) -> Self {
        Self { host }
    }
}

impl Drop for ReaderPin {
    fn drop(&mut self) {
        self.host.unregister_reader();
    }
}

/// Payload bytes borrowed from a store record under a reader pin.
pub struct BorrowedPayload {
    pub data: Bytes,
    pub usize: u32,
    pub compressor: Compressor,
    _pin: Option<ReaderPin>,
}

impl BorrowedPayload {
    pub fn new(data: Bytes, usize: u32, compressor: Compressor, pin: Option<ReaderPin>) -> Self {
        Self {
            data,
            usize,
            compressor,
            _pin: pin,
        }
    }
}

enum HeaderStorage {
    Inline([u8; AUX_DATA_SIZE]),
    Heap(Vec<u8>),
}

enum PayloadSlot {
    Empty,
    Owned {
        data: Vec<u8>,
        usize: u32,
        compressor: Compressor,
    },
    Borrowed(BorrowedPayload),
}

pub struct SharedBuffers {
    domain: Domain,
    header: HeaderStorage,
    payload: PayloadSlot,
}

impl SharedBuffers {
    pub fn new(domain: Domain) -> Self {
        Self {
            domain,
            header: HeaderStorage::Inline([0; AUX_DATA_SIZE]),
            payload: PayloadSlot::Empty,
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn memory(&self) -> &'static Memory {
        self.domain.memory()
    }

    ///////////////////////////////////////////////////////////////////////
    // HEADER
    ///////////////////////////////////////////////////////////////////////

    pub fn using_static_header(&self) -> bool {
        matches!(self.header, HeaderStorage::Inline(_))
    }

    pub fn available_header_size(&self) -> usize {
        match &self.header {
            HeaderStorage::Inline(_) => AUX_DATA_SIZE,
            HeaderStorage::Heap(buffer) => buffer.len(),
        }
    }

    /// Switches from the inline scratch to a heap header of `full_size`
    /// bytes, preserving the first `used_size` bytes already received.
    pub fn configure_header(&mut self, used_size: usize, full_size: usize) {
        debug_assert!(used_size <= AUX_DATA_SIZE && used_size <= full_size);
        let mut buffer = vec![0u8; full_size];
        if let HeaderStorage::Inline(aux) = &self.header {
            buffer[..used_size].copy_from_slice(&aux[..used_size]);
        } else {
            debug_assert!(false, "header configured twice");
        }
        self.memory().register_allocation(full_size as u64);
        self.header = HeaderStorage::Heap(buffer);
    }

    pub fn header_bytes(&self, offset: usize, size: usize) -> &[u8] {
        match &self.header {
            HeaderStorage::Inline(aux) => &aux[offset..offset + size],
            HeaderStorage::Heap(buffer) => &buffer[offset..offset + size],
        }
    }

    pub fn header_bytes_mut(&mut self, offset: usize, size: usize) -> &mut [u8] {
        match &mut self.header {
            HeaderStorage::Inline(aux) => &mut aux[offset..offset + size],
            HeaderStorage::Heap(buffer) => &mut buffer[offset..offset + size],
        }
    }

    // multi-byte header fields are little-endian on the wire

    pub fn header_u8(&self, offset: usize) -> u8 {
        self.header_bytes(offset, 1)[0]
    }

    pub fn header_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.header_bytes(offset, 2).try_into().unwrap())
    }

    pub fn header_u24(&self, offset: usize) -> u32 {
        let b = self.header_bytes(offset, 3);
        (b[0] as u32) | ((b[1] as u32) << 8) | ((b[2] as u32) << 16)
    }

    pub fn header_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.header_bytes(offset, 4).try_into().unwrap())
    }

    pub fn header_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.header_bytes(offset, 8).try_into().unwrap())
    }

    pub fn set_header_u8(&mut self, offset: usize, value: u8) {
        self.header_bytes_mut(offset, 1)[0] = value;
    }

    pub fn set_header_u16(&mut self, offset: usize, value: u16) {
        self.header_bytes_mut(offset, 2)
            .copy_from_slice(&value.to_le_bytes());
    }

    pub fn set_header_u32(&mut self, offset: usize, value: u32) {
        self.header_bytes_mut(offset, 4)
            .copy_from_slice(&value.to_le_bytes());
    }

    pub fn set_header_u64(&mut self, offset: usize, value: u64) {
        self.header_bytes_mut(offset, 8)
            .copy_from_slice(&value.to_le_bytes());
    }

    ///////////////////////////////////////////////////////////////////////
    // PAYLOAD
    ///////////////////////////////////////////////////////////////////////

    pub fn payload_size(&self) -> usize {
        match &self.payload {
            PayloadSlot::Empty => 0,
            PayloadSlot::Owned { data, .. } => data.len(),
            PayloadSlot::Borrowed(borrowed) => borrowed.data.len(),
        }
    }

    pub fn payload_usize(&self) -> u32 {
        match &self.payload {
            PayloadSlot::Empty => 0,
            PayloadSlot::Owned { usize, .. } => *usize,
            PayloadSlot::Borrowed(borrowed) => borrowed.usize,
        }
    }

    pub fn payload_compressor(&self) -> Compressor {
        match &self.payload {
            PayloadSlot::Empty => Compressor::None,
            PayloadSlot::Owned { compressor, .. } => *compressor,
            PayloadSlot::Borrowed(borrowed) => borrowed.compressor,
        }
    }

    pub fn payload_bytes(&self, offset: usize, size: usize) -> &[u8] {
        match &self.payload {
            PayloadSlot::Empty => &[],
            PayloadSlot::Owned { data, .. } => &data[offset..offset + size],
            PayloadSlot::Borrowed(borrowed) => &borrowed.data[offset..offset + size],
        }
    }

    pub fn payload_bytes_mut(&mut self, offset: usize, size: usize) -> &mut [u8] {
        match &mut self.payload {
            PayloadSlot::Owned { data, .. } => &mut data[offset..offset + size],
            _ => panic!("payload is not owned"),
        }
    }

    /// Allocates an owned payload buffer to receive `size` raw bytes from
    /// the wire; compression metadata is filled in from the header when
    /// the payload is consumed.
    pub fn ensure_payload(&mut self, size: usize) {
        debug_assert!(matches!(self.payload, PayloadSlot::Empty));
        self.memory().register_allocation(size as u64);
        self.payload = PayloadSlot::Owned {
            data: vec![0u8; size],
            usize: 0,
            compressor: Compressor::None,
        };
    }

    /// Installs an already-built (and already domain-accounted) payload
    /// buffer; used by response/command builders.
    pub fn set_owned_payload(&mut self, data: Vec<u8>, usize: u32, compressor: Compressor) {
        debug_assert!(matches!(self.payload, PayloadSlot::Empty));
        self.payload = PayloadSlot::Owned {
            data,
            usize,
            compressor,
        };
    }

    /// Attaches a record payload under its reader pin; used by response
    /// writers streaming record data out.
    pub fn attach_payload(&mut self, borrowed: BorrowedPayload) {
        debug_assert!(matches!(self.payload, PayloadSlot::Empty));
        self.payload = PayloadSlot::Borrowed(borrowed);
    }

    /// Takes the owned payload out for transfer into a store record,
    /// moving its byte accounting into `target` in the same motion.
    /// Returns the raw (possibly compressed) bytes.
    pub fn take_payload(&mut self, target: Domain) -> Option<Bytes> {
        match std::mem::replace(&mut self.payload, PayloadSlot::Empty) {
            PayloadSlot::Owned { data, .. } => {
                target
                    .memory()
                    .transfer_used_size(self.memory(), data.len() as u64);
                Some(Bytes::from(data))
            }
            PayloadSlot::Empty => None,
            PayloadSlot::Borrowed(_) => {
                debug_assert!(false, "cannot take a borrowed payload");
                None
            }
        }
    }

    /// Clones payload bytes without transferring ownership; used when a
    /// command is dispatched locally while the same buffer is queued for
    /// binlogging or replication.
    pub fn clone_payload_bytes(&self) -> Option<Bytes> {
        match &self.payload {
            PayloadSlot::Empty => None,
            PayloadSlot::Owned { data, .. } => Some(Bytes::copy_from_slice(data)),
            PayloadSlot::Borrowed(borrowed) => Some(borrowed.data.clone()),
        }
    }

    /// Freezes the container for fan-out; no further mutation is
    /// possible through the returned handle.
    pub fn freeze(self) -> Arc<SharedBuffers> {
        Arc::new(self)
    }
}

impl Drop for SharedBuffers {
    fn drop(&mut self) {
        let memory = self.memory();
        if let HeaderStorage::Heap(buffer) = &self.header {
            memory.register_deallocation(buffer.len() as u64);
        }
        if let PayloadSlot::Owned { data, .. } = &self.payload {
            memory.register_deallocation(data.len() as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_inline_header_upgrade() {
        let mut sb = SharedBuffers::new(Domain::Global);
        assert!(sb.using_static_header());
        assert_eq!(sb.available_header_size(), AUX_DATA_SIZE);
        sb.set_header_u8(0, 0x81);
        sb.set_header_u8(1, 42);
        sb.configure_header(2, 64);
        assert!(!sb.using_static_header());
        assert_eq!(sb.available_header_size(), 64);
        // bytes received before the upgrade survive it
        assert_eq!(sb.header_u8(0), 0x81);
        assert_eq!(sb.header_u8(1), 42);
    }

    #[test]
    fn test_little_endian_header_fields() {
        let mut sb = SharedBuffers::new(Domain::Global);
        sb.configure_header(0, 16);
        sb.set_header_u32(4, 0x0403_0201);
        assert_eq!(sb.header_u8(4), 0x01);
        assert_eq!(sb.header_u8(7), 0x04);
        assert_eq!(sb.header_u16(4), 0x0201);
        assert_eq!(sb.header_u24(4), 0x0003_0201);
        sb.set_header_u64(8, 0xAABB_CCDD_1122_3344);
        assert_eq!(sb.header_u64(8), 0xAABB_CCDD_1122_3344);
    }

    #[test]
    fn test_payload_transfer() {
        let mut sb = SharedBuffers::new(Domain::Global);
        sb.ensure_payload(100);
        sb.payload_bytes_mut(0, 100).fill(7);
        assert_eq!(sb.payload_size(), 100);
        let taken = sb.take_payload(Domain::Session).unwrap();
        assert_eq!(taken.len(), 100);
        assert_eq!(taken[0], 7);
        // the slot is empty afterwards; a second take yields nothing
        assert_eq!(sb.payload_size(), 0);
        assert!(sb.take_payload(Domain::Session).is_none());
        Domain::Session.memory().register_deallocation(100);
    }

    struct CountingHost(AtomicU32);

    impl PayloadHost for CountingHost {
        fn unregister_reader(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_reader_pin_unregisters_once() {
        let host = Arc::new(CountingHost(AtomicU32::new(0)));
        let mut sb = SharedBuffers::new(Domain::Fpc);
        sb.attach_payload(BorrowedPayload::new(
            Bytes::from_static(b"page data"),
            9,
            Compressor::None,
            Some(ReaderPin::new(host.clone())),
        ));
        let shared = sb.freeze();
        let second = shared.clone();
        drop(shared);
        assert_eq!(host.0.load(Ordering::Relaxed), 0);
        drop(second);
        assert_eq!(host.0.load(Ordering::Relaxed), 1);
    }
}
