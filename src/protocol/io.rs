// # Reader/Writer Finite-State Machines
//
// Non-blocking, restartable framing of commands and responses over any
// byte stream. Device reads and writes may complete partially; the FSMs
// keep `pos`/`remains` so a later call resumes exactly where the short
// operation stopped. `Ok(0)` is never returned by a device: progress,
// retry, end-of-stream and failure are the only outcomes.

use super::buffers::SharedBuffers;
use super::chunks::ChunkIterator;
use super::{
    AuthLevel, Command, ResponseType, DESC_AUTH_BITS, DESC_BYTE_HEADER, DESC_BYTE_PAYLOAD,
    DESC_DWORD_HEADER, DESC_DWORD_PAYLOAD, DESC_HEADER_BITS, DESC_MARKER_IS_PRESENT,
    DESC_NO_AUTH, DESC_NO_HEADER, DESC_NO_PAYLOAD, DESC_PAYLOAD_BITS,
    DESC_PAYLOAD_IS_COMPRESSED, DESC_WORD_HEADER, DESC_WORD_PAYLOAD, INTEGRITY_MARKER,
    RESP_TYPE_OK,
};
use crate::compression::Compressor;
use crate::memory::Domain;
use std::io::{Read, Write};
use std::sync::Arc;

/// Result of a device-level byte operation
pub enum DeviceResult {
    /// At least one byte was transferred
    Ok(usize),
    /// The device would block; try again after the next readiness event
    Retry,
    /// Peer closed the stream / end of file
    Eof,
    /// Unrecoverable device error
    Error,
}

/// Result of driving an FSM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// The frame was fully read or written
    Done,
    /// Re-invoke after the next readiness event
    Retry,
    Eof,
    Error,
}

/// Byte stream the FSMs run over
pub trait ByteDevice {
    fn read_bytes(&mut self, buffer: &mut [u8]) -> DeviceResult;
    fn write_bytes(&mut self, buffer: &[u8]) -> DeviceResult;
}

/// Adapter for any `Read + Write` stream (sockets, files)
pub struct StreamDevice<T> {
    stream: T,
}

impl<T> StreamDevice<T> {
    pub fn new(stream: T) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn into_inner(self) -> T {
        self.stream
    }
}

impl<T: Read + Write> ByteDevice for StreamDevice<T> {
    fn read_bytes(&mut self, buffer: &mut [u8]) -> DeviceResult {
        match self.stream.read(buffer) {
            Ok(0) => DeviceResult::Eof,
            Ok(n) => DeviceResult::Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => DeviceResult::Retry,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => DeviceResult::Retry,
            Err(e) => {
                log::warn!("device read failed: {e}");
                DeviceResult::Error
            }
        }
    }

    fn write_bytes(&mut self, buffer: &[u8]) -> DeviceResult {
        match self.stream.write(buffer) {
            Ok(0) => DeviceResult::Error,
            Ok(n) => DeviceResult::Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => DeviceResult::Retry,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => DeviceResult::Retry,
            Err(e) => {
                log::warn!("device write failed: {e}");
                DeviceResult::Error
            }
        }
    }
}

/// In-memory device for tests and loopback pipelines; reads are served
/// in slices of at most `chunk` bytes with an interleaved `Retry` after
/// each one so resumability is exercised.
pub struct MemoryDevice {
    input: Vec<u8>,
    read_pos: usize,
    pub output: Vec<u8>,
    chunk: usize,
    retry_pending: bool,
}

impl MemoryDevice {
    pub fn new(input: Vec<u8>) -> Self {
        Self {
            input,
            read_pos: 0,
            output: Vec::new(),
            chunk: usize::MAX,
            retry_pending: false,
        }
    }

    pub fn with_chunking(input: Vec<u8>, chunk: usize) -> Self {
        Self {
            input,
            read_pos: 0,
            output: Vec::new(),
            chunk: chunk.max(1),
            retry_pending: false,
        }
    }
}

impl ByteDevice for MemoryDevice {
    fn read_bytes(&mut self, buffer: &mut [u8]) -> DeviceResult {
        if self.chunk != usize::MAX && self.retry_pending {
            self.retry_pending = false;
            return DeviceResult::Retry;
        }
        if self.read_pos >= self.input.len() {
            return DeviceResult::Eof;
        }
        let n = buffer
            .len()
            .min(self.chunk)
            .min(self.input.len() - self.read_pos);
        buffer[..n].copy_from_slice(&self.input[self.read_pos..self.read_pos + n]);
        self.read_pos += n;
        self.retry_pending = true;
        DeviceResult::Ok(n)
    }

    fn write_bytes(&mut self, buffer: &[u8]) -> DeviceResult {
        let n = buffer.len().min(self.chunk);
        self.output.extend_from_slice(&buffer[..n]);
        DeviceResult::Ok(n)
    }
}

///////////////////////////////////////////////////////////////////////////
// HEADER / PAYLOAD INFO
///////////////////////////////////////////////////////////////////////////

/// Location of the data chunks within a received header
#[derive(Debug, Clone, Copy)]
pub struct HeaderInfo {
    pub chunks_offset: usize,
    pub chunks_size: usize,
}

/// Payload description decoded from a header
#[derive(Debug, Clone, Copy)]
pub struct PayloadInfo {
    pub size: u32,
    pub usize: u32,
    pub compressor: Compressor,
    pub has_errors: bool,
}

impl PayloadInfo {
    fn none() -> Self {
        Self {
            size: 0,
            usize: 0,
            compressor: Compressor::None,
            has_errors: false,
        }
    }

    fn invalid() -> Self {
        Self {
            has_errors: true,
            ..Self::none()
        }
    }
}

fn header_size_field_len(descriptor: u8) -> usize {
    match descriptor & DESC_HEADER_BITS {
        DESC_NO_HEADER => 0,
        DESC_BYTE_HEADER => 1,
        DESC_WORD_HEADER => 2,
        _ => 4,
    }
}

/// Width of the payload size field(s), or 0 when there is no payload
fn payload_size_field_len(descriptor: u8) -> usize {
    match descriptor & DESC_PAYLOAD_BITS {
        DESC_NO_PAYLOAD => 0,
        DESC_BYTE_PAYLOAD => 1,
        DESC_WORD_PAYLOAD => 2,
        _ => 4,
    }
}

/// Bytes the payload info occupies in the header
fn payload_info_len(descriptor: u8) -> usize {
    let width = payload_size_field_len(descriptor);
    if width == 0 {
        0
    } else if descriptor & DESC_PAYLOAD_IS_COMPRESSED != 0 {
        width * 2 + 1
    } else {
        width
    }
}

fn read_size_field(sb: &SharedBuffers, offset: usize, width: usize) -> u32 {
    match width {
        1 => sb.header_u8(offset) as u32,
        2 => sb.header_u16(offset) as u32,
        _ => sb.header_u32(offset),
    }
}

fn decode_payload_info(sb: &SharedBuffers, descriptor: u8, offset: usize) -> PayloadInfo {
    let width = payload_size_field_len(descriptor);
    if width == 0 {
        return PayloadInfo::none();
    }
    let available = sb.available_header_size();
    let compressed = descriptor & DESC_PAYLOAD_IS_COMPRESSED != 0;
    let needed = if compressed { width * 2 + 1 } else { width };
    if available < offset + needed {
        return PayloadInfo::invalid();
    }
    let mut info = PayloadInfo::none();
    if compressed {
        info.size = read_size_field(sb, offset + 1, width);
        info.usize = read_size_field(sb, offset + 1 + width, width);
        info.compressor = match Compressor::from_byte(sb.header_u8(offset)) {
            Some(Compressor::None) | None => return PayloadInfo::invalid(),
            Some(c) => c,
        };
        if info.size == 0 || info.size >= info.usize {
            return PayloadInfo::invalid();
        }
    } else {
        info.size = read_size_field(sb, offset, width);
        info.usize = info.size;
    }
    info
}

///////////////////////////////////////////////////////////////////////////
// COMMAND ACCESSORS
///////////////////////////////////////////////////////////////////////////

/// Shared header arithmetic for command readers and writers.
pub(crate) trait CommandAccessor {
    fn sb(&self) -> &SharedBuffers;

    fn descriptor(&self) -> u8 {
        self.sb().header_u8(0)
    }

    fn auth_level(&self) -> AuthLevel {
        AuthLevel::from_descriptor(self.descriptor())
    }

    /// descriptor + command ID + optional password hash
    fn sizeless_header_size(&self) -> usize {
        if self.descriptor() & DESC_AUTH_BITS != DESC_NO_AUTH {
            10
        } else {
            2
        }
    }

    fn full_header_size(&self) -> usize {
        let descriptor = self.descriptor();
        match header_size_field_len(descriptor) {
            0 => self.sizeless_header_size(),
            1 => self.sb().header_u8(1) as usize + 2,
            2 => self.sb().header_u16(1) as usize + 3,
            _ => self.sb().header_u32(1) as usize + 5,
        }
    }

    fn command_byte(&self) -> u8 {
        self.sb().header_u8(header_size_field_len(self.descriptor()) + 1)
    }

    fn password_hash(&self) -> Option<u64> {
        if self.descriptor() & DESC_AUTH_BITS != DESC_NO_AUTH {
            Some(
                self.sb()
                    .header_u64(header_size_field_len(self.descriptor()) + 2),
            )
        } else {
            None
        }
    }

    fn marker_present(&self) -> bool {
        self.descriptor() & DESC_MARKER_IS_PRESENT != 0
    }

    fn payload_info_offset(&self) -> usize {
        let descriptor = self.descriptor();
        let mut offset = header_size_field_len(descriptor) + 2;
        if descriptor & DESC_AUTH_BITS != DESC_NO_AUTH {
            offset += 8;
        }
        offset
    }

    fn payload_info(&self) -> PayloadInfo {
        let descriptor = self.descriptor();
        decode_payload_info(self.sb(), descriptor, self.payload_info_offset())
    }

    fn header_info(&self) -> Option<HeaderInfo> {
        let descriptor = self.descriptor();
        if descriptor & DESC_HEADER_BITS == DESC_NO_HEADER {
            return None;
        }
        let offset = self.payload_info_offset() + payload_info_len(descriptor);
        let header_size = self.full_header_size();
        if offset < header_size {
            Some(HeaderInfo {
                chunks_offset: offset,
                chunks_size: header_size - offset,
            })
        } else {
            None
        }
    }
}

///////////////////////////////////////////////////////////////////////////
// COMMAND READER
///////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Created,
    Descriptor,
    HeaderSizeBytes,
    Header,
    Payload,
    Marker,
    Done,
    Error,
}

/// Incremental parser for one command frame.
pub struct CommandReader {
    sb: SharedBuffers,
    state: ReadState,
    pos: usize,
    remains: usize,
}

impl CommandAccessor for CommandReader {
    fn sb(&self) -> &SharedBuffers {
        &self.sb
    }
}

impl CommandReader {
    pub fn new(domain: Domain) -> Self {
        Self {
            sb: SharedBuffers::new(domain),
            state: ReadState::Created,
            pos: 0,
            remains: 0,
        }
    }

    pub fn completed(&self) -> bool {
        self.state == ReadState::Done
    }

    pub fn command(&self) -> Option<Command> {
        debug_assert!(self.completed());
        Command::from_byte(self.command_byte())
    }

    pub fn auth(&self) -> (AuthLevel, Option<u64>) {
        (self.auth_level(), self.password_hash())
    }

    pub fn payload(&self) -> PayloadInfo {
        self.payload_info()
    }

    /// Iterator over the received header data chunks.
    pub fn header_chunks(&self) -> ChunkIterator<'_> {
        match self.header_info() {
            Some(info) => {
                ChunkIterator::new(self.sb.header_bytes(info.chunks_offset, info.chunks_size))
            }
            None => ChunkIterator::new(&[]),
        }
    }

    pub fn shared_buffers(&self) -> &SharedBuffers {
        &self.sb
    }

    pub fn shared_buffers_mut(&mut self) -> &mut SharedBuffers {
        &mut self.sb
    }

    pub fn into_shared_buffers(self) -> SharedBuffers {
        self.sb
    }

    fn fail(&mut self) -> IoOutcome {
        self.state = ReadState::Error;
        IoOutcome::Error
    }

    /// Drives the FSM as far as the device allows. Returns `Done` once
    /// exactly one full frame has been read.
    pub fn read(&mut self, device: &mut dyn ByteDevice) -> IoOutcome {
        loop {
            match self.state {
                ReadState::Created => {
                    self.state = ReadState::Descriptor;
                }

                ReadState::Descriptor => {
                    let mut byte = [0u8; 1];
                    match device.read_bytes(&mut byte) {
                        DeviceResult::Ok(_) => {
                            self.sb.header_bytes_mut(0, 1)[0] = byte[0];
                            self.pos = 1;
                            self.remains = header_size_field_len(byte[0]);
                            if self.remains == 0 {
                                // "sizeless" header
                                let full = self.sizeless_header_size();
                                self.sb.configure_header(self.pos, full);
                                self.remains = full - self.pos;
                                self.state = ReadState::Header;
                            } else {
                                self.state = ReadState::HeaderSizeBytes;
                            }
                        }
                        DeviceResult::Retry => return IoOutcome::Retry,
                        DeviceResult::Eof => {
                            self.state = ReadState::Error;
                            return IoOutcome::Eof;
                        }
                        DeviceResult::Error => return self.fail(),
                    }
                }

                ReadState::HeaderSizeBytes => {
                    let target = self.sb.header_bytes_mut(self.pos, self.remains);
                    match device.read_bytes(target) {
                        DeviceResult::Ok(n) => {
                            self.pos += n;
                            if n == self.remains {
                                let full = self.full_header_size();
                                if full <= self.pos {
                                    return self.fail();
                                }
                                self.sb.configure_header(self.pos, full);
                                self.remains = full - self.pos;
                                self.state = ReadState::Header;
                            } else {
                                self.remains -= n;
                            }
                        }
                        DeviceResult::Retry => return IoOutcome::Retry,
                        DeviceResult::Eof => {
                            self.state = ReadState::Error;
                            return IoOutcome::Eof;
                        }
                        DeviceResult::Error => return self.fail(),
                    }
                }

                ReadState::Header => {
                    let target = self.sb.header_bytes_mut(self.pos, self.remains);
                    match device.read_bytes(target) {
                        DeviceResult::Ok(n) => {
                            if n == self.remains {
                                let info = self.payload_info();
                                if info.has_errors {
                                    return self.fail();
                                }
                                if info.size > 0 {
                                    self.sb.ensure_payload(info.size as usize);
                                    self.pos = 0;
                                    self.remains = info.size as usize;
                                    self.state = ReadState::Payload;
                                } else {
                                    self.state = ReadState::Marker;
                                }
                            } else {
                                self.pos += n;
                                self.remains -= n;
                            }
                        }
                        DeviceResult::Retry => return IoOutcome::Retry,
                        DeviceResult::Eof => {
                            self.state = ReadState::Error;
                            return IoOutcome::Eof;
                        }
                        DeviceResult::Error => return self.fail(),
                    }
                }

                ReadState::Payload => {
                    let target = self.sb.payload_bytes_mut(self.pos, self.remains);
                    match device.read_bytes(target) {
                        DeviceResult::Ok(n) => {
                            if n == self.remains {
                                self.state = ReadState::Marker;
                            } else {
                                self.pos += n;
                                self.remains -= n;
                            }
                        }
                        DeviceResult::Retry => return IoOutcome::Retry,
                        DeviceResult::Eof => {
                            self.state = ReadState::Error;
                            return IoOutcome::Eof;
                        }
                        DeviceResult::Error => return self.fail(),
                    }
                }

                ReadState::Marker => {
                    if self.marker_present() {
                        let mut byte = [0u8; 1];
                        match device.read_bytes(&mut byte) {
                            DeviceResult::Ok(_) => {
                                if byte[0] != INTEGRITY_MARKER {
                                    return self.fail();
                                }
                            }
                            DeviceResult::Retry => return IoOutcome::Retry,
                            DeviceResult::Eof => {
                                self.state = ReadState::Error;
                                return IoOutcome::Eof;
                            }
                            DeviceResult::Error => return self.fail(),
                        }
                    }
                    self.state = ReadState::Done;
                    self.pos = 0;
                    self.remains = 0;
                    return IoOutcome::Done;
                }

                ReadState::Done | ReadState::Error => {
                    debug_assert!(false, "read() called on a finished reader");
                    return self.fail();
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////
// WRITE FSM CORE
///////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Ready,
    Header,
    Payload,
    Marker,
    Done,
    Error,
}

/// Drives one frame (header, payload, marker) out of a shared buffer.
struct FrameWriter {
    state: WriteState,
    pos: usize,
    remains: usize,
}

impl FrameWriter {
    fn new() -> Self {
        Self {
            state: WriteState::Ready,
            pos: 0,
            remains: 0,
        }
    }

    fn completed(&self) -> bool {
        self.state == WriteState::Done
    }

    fn rewind(&mut self) {
        self.state = WriteState::Ready;
    }

    fn write(
        &mut self,
        sb: &SharedBuffers,
        header_size: usize,
        marker: bool,
        device: &mut dyn ByteDevice,
    ) -> IoOutcome {
        loop {
            match self.state {
                WriteState::Ready => {
                    self.pos = 0;
                    self.remains = header_size;
                    self.state = WriteState::Header;
                }

                WriteState::Header => {
                    let source = sb.header_bytes(self.pos, self.remains);
                    match device.write_bytes(source) {
                        DeviceResult::Ok(n) => {
                            if n == self.remains {
                                self.remains = sb.payload_size();
                                if self.remains > 0 {
                                    self.pos = 0;
                                    self.state = WriteState::Payload;
                                } else {
                                    self.state = WriteState::Marker;
                                }
                            } else {
                                self.pos += n;
                                self.remains -= n;
                            }
                        }
                        DeviceResult::Retry => return IoOutcome::Retry,
                        DeviceResult::Eof => {
                            self.state = WriteState::Error;
                            return IoOutcome::Eof;
                        }
                        DeviceResult::Error => {
                            self.state = WriteState::Error;
                            return IoOutcome::Error;
                        }
                    }
                }

                WriteState::Payload => {
                    let source = sb.payload_bytes(self.pos, self.remains);
                    match device.write_bytes(source) {
                        DeviceResult::Ok(n) => {
                            if n == self.remains {
                                self.state = WriteState::Marker;
                            } else {
                                self.pos += n;
                                self.remains -= n;
                            }
                        }
                        DeviceResult::Retry => return IoOutcome::Retry,
                        DeviceResult::Eof => {
                            self.state = WriteState::Error;
                            return IoOutcome::Eof;
                        }
                        DeviceResult::Error => {
                            self.state = WriteState::Error;
                            return IoOutcome::Error;
                        }
                    }
                }

                WriteState::Marker => {
                    if marker {
                        match device.write_bytes(&[INTEGRITY_MARKER]) {
                            DeviceResult::Ok(_) => {}
                            DeviceResult::Retry => return IoOutcome::Retry,
                            DeviceResult::Eof => {
                                self.state = WriteState::Error;
                                return IoOutcome::Eof;
                            }
                            DeviceResult::Error => {
                                self.state = WriteState::Error;
                                return IoOutcome::Error;
                            }
                        }
                    }
                    self.state = WriteState::Done;
                    self.pos = 0;
                    self.remains = 0;
                    return IoOutcome::Done;
                }

                WriteState::Done | WriteState::Error => {
                    debug_assert!(false, "write() called on a finished writer");
                    self.state = WriteState::Error;
                    return IoOutcome::Error;
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////
// COMMAND WRITER
///////////////////////////////////////////////////////////////////////////

/// Streams a fully-built command frame; the shared buffer may be held by
/// several writers at once (binlog + replicators).
pub struct CommandWriter {
    sb: Arc<SharedBuffers>,
    frame: FrameWriter,
}

impl CommandAccessor for CommandWriter {
    fn sb(&self) -> &SharedBuffers {
        &self.sb
    }
}

impl CommandWriter {
    /// The builders must have run already; the writer starts `Ready`.
    pub fn new(sb: Arc<SharedBuffers>) -> Self {
        Self {
            sb,
            frame: FrameWriter::new(),
        }
    }

    pub fn completed(&self) -> bool {
        self.frame.completed()
    }

    /// Returns a `Done` writer to `Ready` so the same command can be
    /// streamed to another connection (replication fan-out reuse).
    pub fn io_rewind(&mut self) {
        self.frame.rewind();
    }

    pub fn shared_buffers(&self) -> &Arc<SharedBuffers> {
        &self.sb
    }

    pub fn write(&mut self, device: &mut dyn ByteDevice) -> IoOutcome {
        let header_size = self.full_header_size();
        let marker = self.marker_present();
        self.frame.write(&self.sb, header_size, marker, device)
    }
}

///////////////////////////////////////////////////////////////////////////
// RESPONSE WRITER
///////////////////////////////////////////////////////////////////////////

/// Streams a fully-built response frame to one connection.
pub struct ResponseWriter {
    sb: SharedBuffers,
    frame: FrameWriter,
}

impl ResponseWriter {
    pub fn new(sb: SharedBuffers) -> Self {
        Self {
            sb,
            frame: FrameWriter::new(),
        }
    }

    fn descriptor(&self) -> u8 {
        self.sb.header_u8(0)
    }

    fn full_header_size(&self) -> usize {
        match header_size_field_len(self.descriptor()) {
            0 => 1, // zero-header OK response
            1 => self.sb.header_u8(1) as usize + 2,
            2 => self.sb.header_u16(1) as usize + 3,
            _ => self.sb.header_u32(1) as usize + 5,
        }
    }

    pub fn completed(&self) -> bool {
        self.frame.completed()
    }

    pub fn write(&mut self, device: &mut dyn ByteDevice) -> IoOutcome {
        let header_size = self.full_header_size();
        let marker = self.descriptor() & DESC_MARKER_IS_PRESENT != 0;
        self.frame.write(&self.sb, header_size, marker, device)
    }
}

///////////////////////////////////////////////////////////////////////////
// RESPONSE READER
///////////////////////////////////////////////////////////////////////////

/// Incremental parser for one response frame (client side).
pub struct ResponseReader {
    sb: SharedBuffers,
    state: ReadState,
    pos: usize,
    remains: usize,
}

impl ResponseReader {
    pub fn new(domain: Domain) -> Self {
        Self {
            sb: SharedBuffers::new(domain),
            state: ReadState::Created,
            pos: 0,
            remains: 0,
        }
    }

    fn descriptor(&self) -> u8 {
        self.sb.header_u8(0)
    }

    pub fn response_type(&self) -> ResponseType {
        ResponseType::from_descriptor(self.descriptor())
    }

    fn full_header_size(&self) -> usize {
        match header_size_field_len(self.descriptor()) {
            0 => 1,
            1 => self.sb.header_u8(1) as usize + 2,
            2 => self.sb.header_u16(1) as usize + 3,
            _ => self.sb.header_u32(1) as usize + 5,
        }
    }

    fn payload_info_offset(&self) -> usize {
        1 + header_size_field_len(self.descriptor())
    }

    pub fn payload_info(&self) -> PayloadInfo {
        decode_payload_info(&self.sb, self.descriptor(), self.payload_info_offset())
    }

    /// Whether the response declares a payload at all (a zero-length
    /// payload still sets the descriptor's payload bits).
    pub fn has_payload_field(&self) -> bool {
        self.descriptor() & DESC_PAYLOAD_BITS != 0
    }

    pub fn header_info(&self) -> Option<HeaderInfo> {
        let descriptor = self.descriptor();
        if descriptor & DESC_HEADER_BITS == DESC_NO_HEADER {
            return None;
        }
        let offset = self.payload_info_offset() + payload_info_len(descriptor);
        let header_size = self.full_header_size();
        if offset < header_size {
            Some(HeaderInfo {
                chunks_offset: offset,
                chunks_size: header_size - offset,
            })
        } else {
            None
        }
    }

    pub fn header_chunks(&self) -> ChunkIterator<'_> {
        match self.header_info() {
            Some(info) => {
                ChunkIterator::new(self.sb.header_bytes(info.chunks_offset, info.chunks_size))
            }
            None => ChunkIterator::new(&[]),
        }
    }

    pub fn completed(&self) -> bool {
        self.state == ReadState::Done
    }

    pub fn shared_buffers(&self) -> &SharedBuffers {
        &self.sb
    }

    pub fn into_shared_buffers(self) -> SharedBuffers {
        self.sb
    }

    fn marker_present(&self) -> bool {
        self.descriptor() & DESC_MARKER_IS_PRESENT != 0
    }

    fn fail(&mut self) -> IoOutcome {
        self.state = ReadState::Error;
        IoOutcome::Error
    }

    pub fn read(&mut self, device: &mut dyn ByteDevice) -> IoOutcome {
        loop {
            match self.state {
                ReadState::Created => {
                    self.state = ReadState::Descriptor;
                }

                ReadState::Descriptor => {
                    let mut byte = [0u8; 1];
                    match device.read_bytes(&mut byte) {
                        DeviceResult::Ok(_) => {
                            self.sb.header_bytes_mut(0, 1)[0] = byte[0];
                            self.pos = 1;
                            self.remains = header_size_field_len(byte[0]);
                            if self.remains == 0 {
                                // zero-length header; must be an OK response
                                if byte[0] & super::RESP_TYPE_BITS == RESP_TYPE_OK {
                                    self.state = ReadState::Marker;
                                } else {
                                    return self.fail();
                                }
                            } else {
                                self.state = ReadState::HeaderSizeBytes;
                            }
                        }
                        DeviceResult::Retry => return IoOutcome::Retry,
                        DeviceResult::Eof => {
                            self.state = ReadState::Error;
                            return IoOutcome::Eof;
                        }
                        DeviceResult::Error => return self.fail(),
                    }
                }

                ReadState::HeaderSizeBytes => {
                    let target = self.sb.header_bytes_mut(self.pos, self.remains);
                    match device.read_bytes(target) {
                        DeviceResult::Ok(n) => {
                            self.pos += n;
                            if n == self.remains {
                                let full = self.full_header_size();
                                if full <= self.pos {
                                    return self.fail();
                                }
                                self.sb.configure_header(self.pos, full);
                                self.remains = full - self.pos;
                                self.state = ReadState::Header;
                            } else {
                                self.remains -= n;
                            }
                        }
                        DeviceResult::Retry => return IoOutcome::Retry,
                        DeviceResult::Eof => {
                            self.state = ReadState::Error;
                            return IoOutcome::Eof;
                        }
                        DeviceResult::Error => return self.fail(),
                    }
                }

                ReadState::Header => {
                    let target = self.sb.header_bytes_mut(self.pos, self.remains);
                    match device.read_bytes(target) {
                        DeviceResult::Ok(n) => {
                            if n == self.remains {
                                let info = self.payload_info();
                                if info.has_errors {
                                    return self.fail();
                                }
                                if info.size > 0 {
                                    self.sb.ensure_payload(info.size as usize);
                                    self.pos = 0;
                                    self.remains = info.size as usize;
                                    self.state = ReadState::Payload;
                                } else {
                                    self.state = ReadState::Marker;
                                }
                            } else {
                                self.pos += n;
                                self.remains -= n;
                            }
                        }
                        DeviceResult::Retry => return IoOutcome::Retry,
                        DeviceResult::Eof => {
                            self.state = ReadState::Error;
                            return IoOutcome::Eof;
                        }
                        DeviceResult::Error => return self.fail(),
                    }
                }

                ReadState::Payload => {
                    let target = self.sb.payload_bytes_mut(self.pos, self.remains);
                    match device.read_bytes(target) {
                        DeviceResult::Ok(n) => {
                            if n == self.remains {
                                self.state = ReadState::Marker;
                            } else {
                                self.pos += n;
                                self.remains -= n;
                            }
                        }
                        DeviceResult::Retry => return IoOutcome::Retry,
                        DeviceResult::Eof => {
                            self.state = ReadState::Error;
                            return IoOutcome::Eof;
                        }
                        DeviceResult::Error => return self.fail(),
                    }
                }

                ReadState::Marker => {
                    if self.marker_present() {
                        let mut byte = [0u8; 1];
                        match device.read_bytes(&mut byte) {
                            DeviceResult::Ok(_) => {
                                if byte[0] != INTEGRITY_MARKER {
                                    return self.fail();
                                }
                            }
                            DeviceResult::Retry => return IoOutcome::Retry,
                            DeviceResult::Eof => {
                                self.state = ReadState::Error;
                                return IoOutcome::Eof;
                            }
                            DeviceResult::Error => return self.fail(),
                        }
                    }
                    self.state = ReadState::Done;
                    self.pos = 0;
                    self.remains = 0;
                    return IoOutcome::Done;
                }

                ReadState::Done | ReadState::Error => {
                    debug_assert!(false, "read() called on a finished reader");
                    return self.fail();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::builders::HeaderChunkBuilder;

    fn build_ping(hash: u64) -> SharedBuffers {
        let mut sb = SharedBuffers::new(Domain::Global);
        let mut header = HeaderChunkBuilder::command(Command::Ping, AuthLevel::User, hash, true);
        header.configure(&mut sb, None);
        header.check();
        sb
    }

    #[test]
    fn test_command_frame_round_trip() {
        let sb = build_ping(0xDEAD_BEEF_CAFE_F00D).freeze();
        let mut writer = CommandWriter::new(sb);
        let mut device = MemoryDevice::new(Vec::new());
        assert_eq!(writer.write(&mut device), IoOutcome::Done);
        assert!(writer.completed());
        // descriptor + command + hash + marker
        assert_eq!(device.output.len(), 11);
        assert_eq!(*device.output.last().unwrap(), INTEGRITY_MARKER);

        let mut reader = CommandReader::new(Domain::Global);
        let mut input = MemoryDevice::new(device.output.clone());
        assert_eq!(reader.read(&mut input), IoOutcome::Done);
        assert_eq!(reader.command(), Some(Command::Ping));
        let (level, hash) = reader.auth();
        assert_eq!(level, AuthLevel::User);
        assert_eq!(hash, Some(0xDEAD_BEEF_CAFE_F00D));
    }

    #[test]
    fn test_short_reads_resume() {
        let sb = build_ping(42).freeze();
        let mut writer = CommandWriter::new(sb);
        let mut device = MemoryDevice::new(Vec::new());
        assert_eq!(writer.write(&mut device), IoOutcome::Done);

        // one byte at a time with a retry after each
        let mut reader = CommandReader::new(Domain::Global);
        let mut input = MemoryDevice::with_chunking(device.output.clone(), 1);
        let mut retries = 0;
        loop {
            match reader.read(&mut input) {
                IoOutcome::Done => break,
                IoOutcome::Retry => retries += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert!(retries > 0);
        assert_eq!(reader.command(), Some(Command::Ping));
    }

    #[test]
    fn test_bad_marker_is_an_error() {
        let sb = build_ping(42).freeze();
        let mut writer = CommandWriter::new(sb);
        let mut device = MemoryDevice::new(Vec::new());
        writer.write(&mut device);
        let mut bytes = device.output.clone();
        *bytes.last_mut().unwrap() = 0x00;
        let mut reader = CommandReader::new(Domain::Global);
        let mut input = MemoryDevice::new(bytes);
        assert_eq!(reader.read(&mut input), IoOutcome::Error);
    }

    #[test]
    fn test_io_rewind_replays_frame() {
        let sb = build_ping(7).freeze();
        let mut writer = CommandWriter::new(sb);
        let mut first = MemoryDevice::new(Vec::new());
        assert_eq!(writer.write(&mut first), IoOutcome::Done);
        writer.io_rewind();
        let mut second = MemoryDevice::new(Vec::new());
        assert_eq!(writer.write(&mut second), IoOutcome::Done);
        assert_eq!(first.output, second.output);
    }

    #[test]
    fn test_zero_header_ok_response() {
        let mut sb = SharedBuffers::new(Domain::Global);
        let mut header = HeaderChunkBuilder::response(ResponseType::Ok, true);
        header.configure(&mut sb, None);
        header.check();
        let mut writer = ResponseWriter::new(sb);
        let mut device = MemoryDevice::new(Vec::new());
        assert_eq!(writer.write(&mut device), IoOutcome::Done);
        assert_eq!(device.output, vec![0x80, INTEGRITY_MARKER]);

        let mut reader = ResponseReader::new(Domain::Global);
        let mut input = MemoryDevice::new(device.output.clone());
        assert_eq!(reader.read(&mut input), IoOutcome::Done);
        assert_eq!(reader.response_type(), ResponseType::Ok);
    }
}
