// Engine adapters behind the compressor registry. Each engine works on
// caller-provided buffers: `pack` reports the compressed size only when
// the whole input fit into `dst`, `unpack` succeeds only when the output
// filled `dst` exactly.

use super::{Compressor, CompressionLevel, DataHint};

pub(crate) trait CompressorEngine {
    fn name(&self) -> &'static str;

    /// Upper bound for the destination buffer passed to `pack`.
    fn max_compressed_size(&mut self, size: usize) -> usize;

    /// Returns the compressed size, or `None` when compression failed or
    /// did not fit into `dst`. The strict-reduction check against the
    /// source length is performed by the registry.
    fn pack(
        &mut self,
        src: &[u8],
        dst: &mut [u8],
        level: CompressionLevel,
        hint: DataHint,
    ) -> Option<usize>;

    /// `dst.len()` must equal the exact uncompressed size.
    fn unpack(&mut self, src: &[u8], dst: &mut [u8]) -> bool;
}

pub(crate) fn instantiate_engine(compressor: Compressor) -> Option<Box<dyn CompressorEngine>> {
    match compressor {
        Compressor::Snappy => Some(Box::new(SnappyEngine::new())),
        Compressor::Lz4 => Some(Box::new(Lz4Engine)),
        Compressor::Brotli => Some(Box::new(BrotliEngine)),
        Compressor::Zstd => Some(Box::new(ZstdEngine)),
        Compressor::Zlib => Some(Box::new(ZlibEngine)),
        Compressor::None | Compressor::Lzf | Compressor::Lzss3 | Compressor::Lzham => None,
    }
}

///////////////////////////////////////////////////////////////////////////
// Snappy
///////////////////////////////////////////////////////////////////////////

// keeps its scratch tables alive between calls
struct SnappyEngine {
    encoder: snap::raw::Encoder,
    decoder: snap::raw::Decoder,
}

impl SnappyEngine {
    fn new() -> Self {
        Self {
            encoder: snap::raw::Encoder::new(),
            decoder: snap::raw::Decoder::new(),
        }
    }
}

impl CompressorEngine for SnappyEngine {
    fn name(&self) -> &'static str {
        "snappy"
    }

    fn max_compressed_size(&mut self, size: usize) -> usize {
        snap::raw::max_compress_len(size)
    }

    fn pack(
        &mut self,
        src: &[u8],
        dst: &mut [u8],
        _level: CompressionLevel,
        _hint: DataHint,
    ) -> Option<usize> {
        self.encoder.compress(src, dst).ok()
    }

    fn unpack(&mut self, src: &[u8], dst: &mut [u8]) -> bool {
        matches!(self.decoder.decompress(src, dst), Ok(n) if n == dst.len())
    }
}

///////////////////////////////////////////////////////////////////////////
// LZ4
///////////////////////////////////////////////////////////////////////////

struct Lz4Engine;

impl CompressorEngine for Lz4Engine {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn max_compressed_size(&mut self, size: usize) -> usize {
        lz4_flex::block::get_maximum_output_size(size)
    }

    fn pack(
        &mut self,
        src: &[u8],
        dst: &mut [u8],
        _level: CompressionLevel,
        _hint: DataHint,
    ) -> Option<usize> {
        lz4_flex::block::compress_into(src, dst).ok()
    }

    fn unpack(&mut self, src: &[u8], dst: &mut [u8]) -> bool {
        matches!(lz4_flex::block::decompress_into(src, dst), Ok(n) if n == dst.len())
    }
}

///////////////////////////////////////////////////////////////////////////
// Brotli
///////////////////////////////////////////////////////////////////////////

struct BrotliEngine;

impl CompressorEngine for BrotliEngine {
    fn name(&self) -> &'static str {
        "brotli"
    }

    fn max_compressed_size(&mut self, size: usize) -> usize {
        // metadata blocks plus worst-case literal expansion
        size + size / 3 + 1024
    }

    fn pack(
        &mut self,
        src: &[u8],
        dst: &mut [u8],
        level: CompressionLevel,
        hint: DataHint,
    ) -> Option<usize> {
        let mut params = brotli::enc::BrotliEncoderParams::default();
        params.quality = match level {
            CompressionLevel::Fastest => 1,
            CompressionLevel::Average => 5,
            CompressionLevel::Best => 9,
            CompressionLevel::Extreme => 11,
        };
        if hint == DataHint::Text {
            params.mode = brotli::enc::backward_references::BrotliEncoderMode::BROTLI_MODE_TEXT;
        }
        let mut reader = src;
        let mut cursor = std::io::Cursor::new(&mut *dst);
        match brotli::BrotliCompress(&mut reader, &mut cursor, &params) {
            Ok(written) => Some(written),
            Err(_) => None, // output did not fit
        }
    }

    fn unpack(&mut self, src: &[u8], dst: &mut [u8]) -> bool {
        let mut reader = src;
        let mut cursor = std::io::Cursor::new(&mut *dst);
        brotli::BrotliDecompress(&mut reader, &mut cursor).is_ok()
            && cursor.position() as usize == dst.len()
    }
}

///////////////////////////////////////////////////////////////////////////
// Zstd
///////////////////////////////////////////////////////////////////////////

struct ZstdEngine;

impl CompressorEngine for ZstdEngine {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn max_compressed_size(&mut self, size: usize) -> usize {
        zstd::zstd_safe::compress_bound(size)
    }

    fn pack(
        &mut self,
        src: &[u8],
        dst: &mut [u8],
        level: CompressionLevel,
        _hint: DataHint,
    ) -> Option<usize> {
        let level = match level {
            CompressionLevel::Fastest => 1,
            CompressionLevel::Average => 3,
            CompressionLevel::Best => 9,
            CompressionLevel::Extreme => 19,
        };
        zstd::bulk::compress_to_buffer(src, dst, level).ok()
    }

    fn unpack(&mut self, src: &[u8], dst: &mut [u8]) -> bool {
        matches!(zstd::bulk::decompress_to_buffer(src, dst), Ok(n) if n == dst.len())
    }
}

///////////////////////////////////////////////////////////////////////////
// Zlib
///////////////////////////////////////////////////////////////////////////

struct ZlibEngine;

impl CompressorEngine for ZlibEngine {
    fn name(&self) -> &'static str {
        "zlib"
    }

    fn max_compressed_size(&mut self, size: usize) -> usize {
        // deflate bound plus zlib wrapper
        size + (size >> 12) + (size >> 14) + (size >> 25) + 13 + 6
    }

    fn pack(
        &mut self,
        src: &[u8],
        dst: &mut [u8],
        level: CompressionLevel,
        _hint: DataHint,
    ) -> Option<usize> {
        let level = match level {
            CompressionLevel::Fastest => flate2::Compression::fast(),
            CompressionLevel::Average => flate2::Compression::new(6),
            CompressionLevel::Best | CompressionLevel::Extreme => flate2::Compression::best(),
        };
        let mut compress = flate2::Compress::new(level, true);
        match compress.compress(src, dst, flate2::FlushCompress::Finish) {
            Ok(flate2::Status::StreamEnd) => Some(compress.total_out() as usize),
            _ => None,
        }
    }

    fn unpack(&mut self, src: &[u8], dst: &mut [u8]) -> bool {
        let mut decompress = flate2::Decompress::new(true);
        matches!(
            decompress.decompress(src, dst, flate2::FlushDecompress::Finish),
            Ok(flate2::Status::StreamEnd)
        ) && decompress.total_out() as usize == dst.len()
    }
}
