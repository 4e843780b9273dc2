// # Chunk Builders (encoding side)
//
// Header building is two-phase: every chunk is measured with an
// `estimate_*` call, `configure()` then sizes and allocates the header
// buffer exactly (descriptor + header-size bytes + command id + password
// hash + payload sizes + chunks) so no reallocation ever happens, and
// the matching `add_*` calls fill it in the same order. `check()`
// asserts the cursor landed exactly on the estimate; violating the
// protocol is a programming error, not a runtime condition.
//
// Payload lists cannot estimate up front (their strings arrive one at a
// time), so they grow by doubling guided by a running average element
// length seeded from caller-supplied min/max guesses.

use super::buffers::{BorrowedPayload, SharedBuffers};
use super::{
    AuthLevel, Command, ResponseType, CHNK_BIG_INTEGER, CHNK_BIG_NEGATIVE,
    CHNK_BIG_NEGATIVE_BIAS, CHNK_INTEGER, CHNK_LARGE_BIAS, CHNK_LIST, CHNK_LONG_LIST,
    CHNK_LONG_STRING, CHNK_MEDIUM_BIAS, CHNK_SHORT_LIST, CHNK_SHORT_STRING,
    CHNK_SMALL_INTEGER, CHNK_SMALL_NEGATIVE, CHNK_SMALL_NEGATIVE_BIAS, CHNK_STRING, CHNK_SUBTYPE, DESC_ADMIN_AUTH,
    DESC_BULK_AUTH, DESC_BYTE_HEADER, DESC_BYTE_PAYLOAD, DESC_DWORD_HEADER,
    DESC_DWORD_PAYLOAD, DESC_MARKER_IS_PRESENT, DESC_PAYLOAD_IS_COMPRESSED, DESC_USER_AUTH,
    DESC_WORD_HEADER, DESC_WORD_PAYLOAD,
};
use crate::compression::{self, CompressionLevel, Compressor, DataHint, DomainAllocator};
use crate::memory::Memory;

/// Bytes needed to encode a count-like entity (value or length).
pub fn measure_entity(n: u32) -> usize {
    if n < CHNK_LARGE_BIAS {
        return 1;
    }
    let n = n - CHNK_LARGE_BIAS;
    if n & 0xFFFF_FF00 == 0 {
        2
    } else if n & 0xFFFF_0000 == 0 {
        3
    } else if n & 0xFF00_0000 == 0 {
        4
    } else {
        5
    }
}

/// Writes an entity with the chosen small/medium/large masks; returns
/// the number of bytes written.
pub fn put_entity(p: &mut [u8], n: u32, small_mask: u8, medium_mask: u8, large_mask: u8) -> usize {
    if n < CHNK_MEDIUM_BIAS {
        p[0] = CHNK_SUBTYPE | small_mask | n as u8;
        1
    } else if n < CHNK_LARGE_BIAS {
        p[0] = medium_mask | (n - CHNK_MEDIUM_BIAS) as u8;
        1
    } else {
        let n = n - CHNK_LARGE_BIAS;
        if n & 0xFFFF_FF00 == 0 {
            p[0] = CHNK_SUBTYPE | large_mask;
            p[1] = n as u8;
            2
        } else if n & 0xFFFF_0000 == 0 {
            p[0] = CHNK_SUBTYPE | large_mask | 1;
            p[1..3].copy_from_slice(&(n as u16).to_le_bytes());
            3
        } else if n & 0xFF00_0000 == 0 {
            p[0] = CHNK_SUBTYPE | large_mask | 2;
            p[1] = n as u8;
            p[2] = (n >> 8) as u8;
            p[3] = (n >> 16) as u8;
            4
        } else {
            p[0] = CHNK_SUBTYPE | large_mask | 3;
            p[1..5].copy_from_slice(&n.to_le_bytes());
            5
        }
    }
}

fn measure_number(num: i64) -> usize {
    if num >= 0 {
        debug_assert!(num <= u32::MAX as i64);
        measure_entity(num as u32)
    } else if num > CHNK_BIG_NEGATIVE_BIAS {
        1
    } else {
        debug_assert!(num >= i32::MIN as i64);
        let nn = (-num + CHNK_BIG_NEGATIVE_BIAS) as u32;
        if nn & 0xFFFF_FF00 == 0 {
            2
        } else if nn & 0xFFFF_0000 == 0 {
            3
        } else if nn & 0xFF00_0000 == 0 {
            4
        } else {
            5
        }
    }
}

/// `size / 255 + 1` length bytes plus the string itself.
fn measure_list_string(size: usize) -> usize {
    size / 255 + 1 + size
}

fn put_vlq_length(buffer: &mut Vec<u8>, size: usize) {
    let mut n = size;
    while n >= 255 {
        buffer.push(255);
        n -= 255;
    }
    buffer.push(n as u8);
}

fn estimate_size_bytes(size: u32) -> usize {
    if size <= 0xFF {
        1
    } else if size <= 0xFFFF {
        2
    } else {
        4
    }
}

///////////////////////////////////////////////////////////////////////////
// HEADER LIST BUILDER
///////////////////////////////////////////////////////////////////////////

/// List destined for a command or response header. Two-phase like the
/// header itself: `estimate()` per element, `configure()`, `add()` per
/// element in the same order, `check()`.
pub struct HeaderListChunkBuilder {
    memory: &'static Memory,
    buffer: Vec<u8>,
    estimated_size: usize,
    count: u32,
}

impl HeaderListChunkBuilder {
    pub fn new(memory: &'static Memory) -> Self {
        Self {
            memory,
            buffer: Vec::new(),
            estimated_size: 0,
            count: 0,
        }
    }

    pub fn estimate(&mut self, element: &[u8]) -> usize {
        debug_assert!(self.buffer.capacity() == 0, "estimate after configure");
        let n = measure_list_string(element.len());
        self.estimated_size += n;
        self.count += 1;
        n
    }

    pub fn configure(&mut self) {
        self.estimated_size += measure_entity(self.count);
        self.memory.register_allocation(self.estimated_size as u64);
        self.buffer = Vec::with_capacity(self.estimated_size);
        let mut lead = [0u8; 5];
        let lead_size = put_entity(&mut lead, self.count, CHNK_SHORT_LIST, CHNK_LIST, CHNK_LONG_LIST);
        self.buffer.extend_from_slice(&lead[..lead_size]);
    }

    pub fn add(&mut self, element: &[u8]) {
        debug_assert!(self.buffer.capacity() > 0, "add before configure");
        put_vlq_length(&mut self.buffer, element.len());
        self.buffer.extend_from_slice(element);
    }

    pub fn check(&self) {
        assert_eq!(
            self.buffer.len(),
            self.estimated_size,
            "header list build does not match its estimate"
        );
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }
}

impl Drop for HeaderListChunkBuilder {
    fn drop(&mut self) {
        if self.buffer.capacity() > 0 {
            self.memory.register_deallocation(self.estimated_size as u64);
        }
    }
}

///////////////////////////////////////////////////////////////////////////
// PAYLOAD LIST BUILDER
///////////////////////////////////////////////////////////////////////////

/// List destined for a `LIST` response payload; grows as strings arrive.
pub struct PayloadListChunkBuilder {
    memory: &'static Memory,
    buffer: Vec<u8>,
    allocated: usize,
    count: u32,
}

impl PayloadListChunkBuilder {
    pub fn new(
        memory: &'static Memory,
        min_guess: u32,
        max_guess: u32,
        average_length: u32,
    ) -> Self {
        let min_guess = min_guess.max(1);
        let max_guess = if max_guess == 0 {
            if min_guess == 1 { 64 } else { min_guess }
        } else {
            max_guess.max(min_guess)
        };
        let average_length = if average_length == 0 { 16 } else { average_length } + 1;
        let num = if max_guess > min_guess {
            min_guess + (max_guess - min_guess) * 3 / 4
        } else {
            max_guess
        };
        let size = (num as u64 * average_length as u64).min(u32::MAX as u64) as usize;
        memory.register_allocation(size as u64);
        Self {
            memory,
            buffer: Vec::with_capacity(size),
            allocated: size,
            count: 0,
        }
    }

    pub fn add(&mut self, element: &[u8]) {
        let full_length = measure_list_string(element.len());
        let needed = self.buffer.len() + full_length;
        if needed > self.allocated {
            let average = needed / (self.count as usize + 1);
            let extra_strings = if self.count < 4 {
                2
            } else if self.count < 32 {
                8
            } else {
                self.count as usize / 4
            };
            let extra = (extra_strings * average).max(full_length);
            self.memory.register_reallocation(
                self.allocated as u64,
                (self.allocated + extra) as u64,
            );
            self.allocated += extra;
            self.buffer.reserve(self.allocated - self.buffer.len());
        }
        put_vlq_length(&mut self.buffer, element.len());
        self.buffer.extend_from_slice(element);
        self.count += 1;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }
}

impl Drop for PayloadListChunkBuilder {
    fn drop(&mut self) {
        self.memory.register_deallocation(self.allocated as u64);
    }
}

///////////////////////////////////////////////////////////////////////////
// PAYLOAD BUILDER
///////////////////////////////////////////////////////////////////////////

/// Builds the payload of a command or response; must run before the
/// header builder so `configure()` can see the final compressed size.
pub struct PayloadChunkBuilder {
    usize: u32,
    compressor: Compressor,
    threshold: u32,
}

impl PayloadChunkBuilder {
    pub fn new(compressor: Compressor, threshold: u32) -> Self {
        Self {
            usize: 0,
            compressor,
            threshold,
        }
    }

    pub fn compressor(&self) -> Compressor {
        self.compressor
    }

    pub fn usize(&self) -> u32 {
        self.usize
    }

    /// Stores `data`, compressed when it reaches the threshold and the
    /// engine achieves a strict reduction, raw otherwise.
    pub fn add(&mut self, sb: &mut SharedBuffers, data: &[u8], hint: DataHint) {
        debug_assert_eq!(sb.payload_size(), 0);
        if data.is_empty() {
            self.usize = 0;
            self.compressor = Compressor::None;
            return;
        }
        self.usize = data.len() as u32;
        if data.len() >= self.threshold as usize && self.compressor != Compressor::None {
            let mut allocator = DomainAllocator::new(sb.memory());
            if let Ok(Some(packed)) = compression::pack(
                self.compressor,
                data,
                &mut allocator,
                CompressionLevel::Fastest,
                hint,
            ) {
                sb.set_owned_payload(packed, self.usize, self.compressor);
                return;
            }
        }
        // could not be compressed, store as is
        self.compressor = Compressor::None;
        sb.memory().register_allocation(data.len() as u64);
        sb.set_owned_payload(data.to_vec(), self.usize, Compressor::None);
    }

    pub fn add_list(&mut self, sb: &mut SharedBuffers, list: &PayloadListChunkBuilder) {
        self.add(sb, list.buffer(), DataHint::Text);
    }

    /// Attaches a record payload as-is (it is already compressed the way
    /// the record stores it).
    pub fn add_record_payload(&mut self, sb: &mut SharedBuffers, payload: BorrowedPayload) {
        debug_assert_eq!(sb.payload_size(), 0);
        self.usize = payload.usize;
        self.compressor = payload.compressor;
        sb.attach_payload(payload);
    }

    pub fn add_empty(&mut self) {
        self.usize = 0;
        self.compressor = Compressor::None;
    }
}

///////////////////////////////////////////////////////////////////////////
// HEADER BUILDER
///////////////////////////////////////////////////////////////////////////

enum HeaderKind {
    Command {
        command: Command,
        auth: AuthLevel,
        hash: u64,
    },
    Response {
        response_type: ResponseType,
    },
}

/// Two-phase builder for command and response headers.
pub struct HeaderChunkBuilder {
    kind: HeaderKind,
    marker: bool,
    estimated_size: usize,
    used_size: usize,
}

impl HeaderChunkBuilder {
    pub fn command(command: Command, auth: AuthLevel, hash: u64, marker: bool) -> Self {
        Self {
            kind: HeaderKind::Command {
                command,
                auth,
                hash,
            },
            marker,
            estimated_size: 0,
            used_size: 0,
        }
    }

    pub fn response(response_type: ResponseType, marker: bool) -> Self {
        Self {
            kind: HeaderKind::Response { response_type },
            marker,
            estimated_size: 0,
            used_size: 0,
        }
    }

    pub fn estimate_number(&mut self, num: i64) -> usize {
        let n = measure_number(num);
        self.estimated_size += n;
        n
    }

    pub fn estimate_string(&mut self, s: &[u8]) -> usize {
        let n = measure_entity(s.len() as u32) + s.len();
        self.estimated_size += n;
        n
    }

    pub fn estimate_list(&mut self, list: &HeaderListChunkBuilder) -> usize {
        let n = list.size();
        self.estimated_size += n;
        n
    }

    /// Finalizes descriptor bits, sizes the header exactly, and writes
    /// the fixed prefix (descriptor, header size, command id, password
    /// hash, payload sizes). Chunk `add_*` calls must follow.
    pub fn configure(&mut self, sb: &mut SharedBuffers, payload: Option<&PayloadChunkBuilder>) {
        debug_assert!(sb.using_static_header() && self.used_size == 0);

        let mut desc: u8 = match &self.kind {
            HeaderKind::Command { auth, .. } => match auth {
                AuthLevel::None => 0,
                AuthLevel::User => DESC_USER_AUTH,
                AuthLevel::Admin => DESC_ADMIN_AUTH,
                AuthLevel::Bulk => DESC_BULK_AUTH,
            },
            HeaderKind::Response { response_type } => *response_type as u8,
        };
        if self.marker {
            desc |= DESC_MARKER_IS_PRESENT;
        }
        let command = match &self.kind {
            HeaderKind::Command { command, .. } => Some(*command),
            HeaderKind::Response { .. } => None,
        };
        let auth_hash = match &self.kind {
            HeaderKind::Command { auth, hash, .. } if *auth != AuthLevel::None => Some(*hash),
            _ => None,
        };

        // payload bookkeeping
        let mut payload_compressor = Compressor::None;
        let mut payload_size = 0u32;
        let mut payload_usize = 0u32;
        let mut payload_size_bytes = 0usize;

        // size of everything the header-size field covers
        let mut header_size = 0usize;
        if self.estimated_size > 0 || payload.is_some() {
            header_size = self.estimated_size;
            if command.is_some() {
                header_size += 1;
            }
            if auth_hash.is_some() {
                header_size += 8;
            }
            if let Some(p) = payload {
                payload_compressor = p.compressor();
                payload_size = sb.payload_size() as u32;
                payload_usize = p.usize();
                payload_size_bytes = estimate_size_bytes(payload_usize);
                if payload_compressor != Compressor::None {
                    debug_assert!(payload_size < payload_usize);
                    desc |= DESC_PAYLOAD_IS_COMPRESSED;
                    header_size += payload_size_bytes * 2 + 1;
                } else {
                    debug_assert!(payload_size == payload_usize);
                    header_size += payload_size_bytes;
                }
            }
        }

        let mut header_size_bytes = 0usize;
        let full_header_size = if header_size > 0 {
            header_size_bytes = estimate_size_bytes(header_size as u32);
            1 + header_size_bytes + header_size
        } else {
            // "sizeless" header: descriptor, optional command, optional hash
            1 + command.map_or(0, |_| 1) + auth_hash.map_or(0, |_| 8)
        };

        sb.configure_header(0, full_header_size);
        self.used_size = 1;

        // a) header size field selects its own width bits
        if header_size > 0 {
            match header_size_bytes {
                1 => {
                    sb.set_header_u8(self.used_size, header_size as u8);
                    desc |= DESC_BYTE_HEADER;
                }
                2 => {
                    sb.set_header_u16(self.used_size, header_size as u16);
                    desc |= DESC_WORD_HEADER;
                }
                _ => {
                    sb.set_header_u32(self.used_size, header_size as u32);
                    desc |= DESC_DWORD_HEADER;
                }
            }
            self.used_size += header_size_bytes;
        }

        // b) command ID
        if let Some(command) = command {
            sb.set_header_u8(self.used_size, command as u8);
            self.used_size += 1;
        }

        // c) password hash
        if let Some(hash) = auth_hash {
            sb.set_header_u64(self.used_size, hash);
            self.used_size += 8;
        }

        // d) payload sizes; width is picked from the uncompressed size
        //    so both fields share it
        if payload.is_some() && header_size > 0 {
            if payload_compressor != Compressor::None {
                sb.set_header_u8(self.used_size, payload_compressor as u8);
                self.used_size += 1;
            }
            let width_bits = match payload_size_bytes {
                1 => DESC_BYTE_PAYLOAD,
                2 => DESC_WORD_PAYLOAD,
                _ => DESC_DWORD_PAYLOAD,
            };
            desc |= width_bits;
            self.put_size_field(sb, payload_size, payload_size_bytes);
            if payload_compressor != Compressor::None {
                self.put_size_field(sb, payload_usize, payload_size_bytes);
            }
        }

        sb.set_header_u8(0, desc);
        self.estimated_size = full_header_size;
    }

    fn put_size_field(&mut self, sb: &mut SharedBuffers, value: u32, width: usize) {
        match width {
            1 => sb.set_header_u8(self.used_size, value as u8),
            2 => sb.set_header_u16(self.used_size, value as u16),
            _ => sb.set_header_u32(self.used_size, value),
        }
        self.used_size += width;
    }

    fn put(&mut self, sb: &mut SharedBuffers, n: u32, small: u8, medium: u8, large: u8) {
        let size = measure_entity(n);
        let target = sb.header_bytes_mut(self.used_size, size);
        put_entity(target, n, small, medium, large);
        self.used_size += size;
    }

    pub fn add_number(&mut self, sb: &mut SharedBuffers, num: i64) {
        if num >= 0 {
            debug_assert!(num <= u32::MAX as i64);
            self.put(sb, num as u32, CHNK_SMALL_INTEGER, CHNK_INTEGER, CHNK_BIG_INTEGER);
        } else if num > CHNK_BIG_NEGATIVE_BIAS {
            let small = (-num + CHNK_SMALL_NEGATIVE_BIAS) as u8;
            sb.set_header_u8(self.used_size, CHNK_SUBTYPE | CHNK_SMALL_NEGATIVE | small);
            self.used_size += 1;
        } else {
            debug_assert!(num >= i32::MIN as i64);
            let big = (-num + CHNK_BIG_NEGATIVE_BIAS) as u32;
            if big & 0xFFFF_FF00 == 0 {
                sb.set_header_u8(self.used_size, CHNK_SUBTYPE | CHNK_BIG_NEGATIVE);
                sb.set_header_u8(self.used_size + 1, big as u8);
                self.used_size += 2;
            } else if big & 0xFFFF_0000 == 0 {
                sb.set_header_u8(self.used_size, CHNK_SUBTYPE | CHNK_BIG_NEGATIVE | 1);
                sb.set_header_u16(self.used_size + 1, big as u16);
                self.used_size += 3;
            } else if big & 0xFF00_0000 == 0 {
                sb.set_header_u8(self.used_size, CHNK_SUBTYPE | CHNK_BIG_NEGATIVE | 2);
                sb.set_header_u8(self.used_size + 1, big as u8);
                sb.set_header_u8(self.used_size + 2, (big >> 8) as u8);
                sb.set_header_u8(self.used_size + 3, (big >> 16) as u8);
                self.used_size += 4;
            } else {
                sb.set_header_u8(self.used_size, CHNK_SUBTYPE | CHNK_BIG_NEGATIVE | 3);
                sb.set_header_u32(self.used_size + 1, big);
                self.used_size += 5;
            }
        }
    }

    pub fn add_string(&mut self, sb: &mut SharedBuffers, s: &[u8]) {
        self.put(sb, s.len() as u32, CHNK_SHORT_STRING, CHNK_STRING, CHNK_LONG_STRING);
        if !s.is_empty() {
            sb.header_bytes_mut(self.used_size, s.len()).copy_from_slice(s);
            self.used_size += s.len();
        }
    }

    pub fn add_list(&mut self, sb: &mut SharedBuffers, list: &HeaderListChunkBuilder) {
        list.check();
        sb.header_bytes_mut(self.used_size, list.size())
            .copy_from_slice(list.buffer());
        self.used_size += list.size();
    }

    pub fn check(&self) {
        assert_eq!(
            self.used_size, self.estimated_size,
            "header build does not match its estimate"
        );
    }
}
