// # Compressor Registry
//
// Per-thread, per-algorithm compression with a uniform contract:
// `pack()` succeeds only when it achieves a strict size reduction
// (otherwise the caller stores the data raw), and `unpack()` requires
// the exact uncompressed size up front. Engines are instantiated lazily
// in thread-local slots so no locking is needed on the data path.
//
// The enum values are wire-protocol constants and must never be
// renumbered; adding an engine appends a value and bumps the protocol
// version.

mod engines;

use crate::error::{CacheError, Result};
use crate::memory::Memory;
use engines::{instantiate_engine, CompressorEngine};
use std::cell::RefCell;

/// Compression engine selector; the numeric values go over the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Compressor {
    None = 0,
    Lzf = 1,
    Snappy = 2,
    Lz4 = 3,
    Lzss3 = 4,
    Brotli = 5,
    Zstd = 6,
    Zlib = 7,
    Lzham = 8,
}

pub const NUM_COMPRESSORS: usize = 9;

pub const DEFAULT_COMPRESSOR: Compressor = Compressor::Snappy;

impl Compressor {
    pub fn from_byte(byte: u8) -> Option<Compressor> {
        match byte {
            0 => Some(Compressor::None),
            1 => Some(Compressor::Lzf),
            2 => Some(Compressor::Snappy),
            3 => Some(Compressor::Lz4),
            4 => Some(Compressor::Lzss3),
            5 => Some(Compressor::Brotli),
            6 => Some(Compressor::Zstd),
            7 => Some(Compressor::Zlib),
            8 => Some(Compressor::Lzham),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Compressor::None => "none",
            Compressor::Lzf => "lzf",
            Compressor::Snappy => "snappy",
            Compressor::Lz4 => "lz4",
            Compressor::Lzss3 => "lzss3",
            Compressor::Brotli => "brotli",
            Compressor::Zstd => "zstd",
            Compressor::Zlib => "zlib",
            Compressor::Lzham => "lzham",
        }
    }

    pub fn from_name(name: &str) -> Option<Compressor> {
        match name {
            "none" => Some(Compressor::None),
            "lzf" => Some(Compressor::Lzf),
            "snappy" => Some(Compressor::Snappy),
            "lz4" => Some(Compressor::Lz4),
            "lzss3" => Some(Compressor::Lzss3),
            "brotli" => Some(Compressor::Brotli),
            "zstd" => Some(Compressor::Zstd),
            "zlib" => Some(Compressor::Zlib),
            "lzham" => Some(Compressor::Lzham),
            _ => None,
        }
    }
}

/// Compression strength selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CompressionLevel {
    /// Weakest but fastest; used on the request path
    Fastest,
    Average,
    /// Strongest practical level
    Best,
    /// Background re-compression only
    Extreme,
}

pub const DEFAULT_LEVEL: CompressionLevel = CompressionLevel::Best;

/// Hint about the nature of the data being compressed; engines that
/// cannot use it still accept it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataHint {
    Generic,
    Text,
    Binary,
}

/// Destination-buffer provider for registry `pack`/`unpack`; keeps the
/// byte accounting in whatever domain the caller works in.
pub trait Allocator {
    fn alloc(&mut self, size: usize) -> Vec<u8>;
    fn shrink(&mut self, buffer: &mut Vec<u8>, new_size: usize);
    fn free(&mut self, buffer: Vec<u8>);
}

/// Allocator drawing accounting from a memory domain
pub struct DomainAllocator<'a> {
    memory: &'a Memory,
}

impl<'a> DomainAllocator<'a> {
    pub fn new(memory: &'a Memory) -> Self {
        Self { memory }
    }
}

impl Allocator for DomainAllocator<'_> {
    fn alloc(&mut self, size: usize) -> Vec<u8> {
        self.memory.register_allocation(size as u64);
        vec![0u8; size]
    }

    fn shrink(&mut self, buffer: &mut Vec<u8>, new_size: usize) {
        debug_assert!(new_size <= buffer.len());
        self.memory
            .register_reallocation(buffer.len() as u64, new_size as u64);
        buffer.truncate(new_size);
        buffer.shrink_to_fit();
    }

    fn free(&mut self, buffer: Vec<u8>) {
        self.memory.register_deallocation(buffer.len() as u64);
    }
}

thread_local! {
    static ENGINES: RefCell<[Option<Box<dyn CompressorEngine>>; NUM_COMPRESSORS]> =
        RefCell::new([None, None, None, None, None, None, None, None, None]);
}

fn with_engine<R>(
    compressor: Compressor,
    f: impl FnOnce(&mut dyn CompressorEngine) -> R,
) -> Result<R> {
    ENGINES.with(|slots| {
        let mut slots = slots.borrow_mut();
        let slot = &mut slots[compressor as usize];
        if slot.is_none() {
            *slot = instantiate_engine(compressor);
        }
        match slot.as_mut() {
            Some(engine) => Ok(f(engine.as_mut())),
            None => Err(CacheError::Compression(format!(
                "compressor '{}' is not supported by this build",
                compressor.name()
            ))),
        }
    })
}

/// Whether a usable engine exists for the given selector.
pub fn is_supported(compressor: Compressor) -> bool {
    matches!(
        compressor,
        Compressor::Snappy
            | Compressor::Lz4
            | Compressor::Brotli
            | Compressor::Zstd
            | Compressor::Zlib
    )
}

/// Compresses `src` into a freshly allocated buffer. Returns `None` when
/// the engine could not shrink the data strictly below `src.len()`; the
/// caller must then store the raw bytes instead.
pub fn pack(
    compressor: Compressor,
    src: &[u8],
    allocator: &mut dyn Allocator,
    level: CompressionLevel,
    hint: DataHint,
) -> Result<Option<Vec<u8>>> {
    if compressor == Compressor::None || src.is_empty() {
        return Ok(None);
    }
    with_engine(compressor, |engine| {
        let bound = engine.max_compressed_size(src.len());
        let mut dst = allocator.alloc(bound);
        match engine.pack(src, &mut dst, level, hint) {
            Some(size) if size < src.len() => {
                allocator.shrink(&mut dst, size);
                Some(dst)
            }
            _ => {
                allocator.free(dst);
                None
            }
        }
    })
}

/// Decompresses `src` into a buffer of exactly `usize` bytes.
pub fn unpack(
    compressor: Compressor,
    src: &[u8],
    usize_hint: usize,
    allocator: &mut dyn Allocator,
) -> Result<Vec<u8>> {
    if compressor == Compressor::None {
        return Err(CacheError::Compression(
            "cannot unpack data marked as uncompressed".to_string(),
        ));
    }
    with_engine(compressor, |engine| {
        let mut dst = allocator.alloc(usize_hint);
        if engine.unpack(src, &mut dst) {
            Ok(dst)
        } else {
            allocator.free(dst);
            Err(CacheError::Compression(format!(
                "'{}' failed to decompress {} bytes into {}",
                compressor.name(),
                src.len(),
                usize_hint
            )))
        }
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::GLOBAL_MEMORY;

    const SUPPORTED: [Compressor; 5] = [
        Compressor::Snappy,
        Compressor::Lz4,
        Compressor::Brotli,
        Compressor::Zstd,
        Compressor::Zlib,
    ];

    fn compressible() -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog "
            .iter()
            .cycle()
            .take(8192)
            .copied()
            .collect()
    }

    #[test]
    fn test_round_trip_all_supported() {
        let src = compressible();
        for compressor in SUPPORTED {
            let mut allocator = DomainAllocator::new(&GLOBAL_MEMORY);
            let packed = pack(
                compressor,
                &src,
                &mut allocator,
                CompressionLevel::Fastest,
                DataHint::Text,
            )
            .unwrap()
            .unwrap_or_else(|| panic!("{} should shrink repetitive text", compressor.name()));
            assert!(packed.len() < src.len());
            let unpacked = unpack(compressor, &packed, src.len(), &mut allocator).unwrap();
            assert_eq!(unpacked, src);
            allocator.free(packed);
            allocator.free(unpacked.clone());
        }
    }

    #[test]
    fn test_incompressible_returns_none() {
        // tiny inputs cannot shrink below their own length
        let src = b"hello";
        let mut allocator = DomainAllocator::new(&GLOBAL_MEMORY);
        for compressor in SUPPORTED {
            let result = pack(
                compressor,
                src,
                &mut allocator,
                CompressionLevel::Best,
                DataHint::Generic,
            )
            .unwrap();
            assert!(result.is_none(), "{} must refuse to grow data", compressor.name());
        }
    }

    #[test]
    fn test_unsupported_engines() {
        let mut allocator = DomainAllocator::new(&GLOBAL_MEMORY);
        for compressor in [Compressor::Lzf, Compressor::Lzss3, Compressor::Lzham] {
            assert!(!is_supported(compressor));
            let result = pack(
                compressor,
                &compressible(),
                &mut allocator,
                DEFAULT_LEVEL,
                DataHint::Generic,
            );
            assert!(result.is_err());
        }
    }

    #[test]
    fn test_wire_values_are_stable() {
        assert_eq!(Compressor::None as u8, 0);
        assert_eq!(Compressor::Lzf as u8, 1);
        assert_eq!(Compressor::Snappy as u8, 2);
        assert_eq!(Compressor::Lz4 as u8, 3);
        assert_eq!(Compressor::Lzss3 as u8, 4);
        assert_eq!(Compressor::Brotli as u8, 5);
        assert_eq!(Compressor::Zstd as u8, 6);
        assert_eq!(Compressor::Zlib as u8, 7);
        assert_eq!(Compressor::Lzham as u8, 8);
        assert_eq!(Compressor::from_byte(6), Some(Compressor::Zstd));
        assert_eq!(Compressor::from_byte(9), None);
    }
}
