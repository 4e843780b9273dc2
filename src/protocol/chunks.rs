// # Chunk Codec (decoding side)
//
// One-pass cursor over the self-describing TLV chunks carried in command
// and response headers, plus the string-list format used in payloads.
// All reads are bounds-checked: header bytes come from the network, so
// malformed input surfaces as a `Protocol` error rather than a panic.

use crate::compression::{self, Compressor, DomainAllocator};
use crate::error::{CacheError, Result};
use crate::memory::Memory;
use super::{
    CHNK_BIG_INTEGER, CHNK_BIG_NEGATIVE, CHNK_BIG_NEGATIVE_BIAS, CHNK_INTEGER, CHNK_LARGE_BIAS,
    CHNK_LIST, CHNK_LONG_LIST, CHNK_LONG_MASK, CHNK_LONG_STRING, CHNK_MEDIUM_BIAS,
    CHNK_SHORT_LIST, CHNK_SHORT_MASK, CHNK_SHORT_STRING, CHNK_SMALL_INTEGER,
    CHNK_SMALL_NEGATIVE, CHNK_SMALL_NEGATIVE_BIAS, CHNK_STRING, CHNK_SUBTYPE_BITS,
    CHNK_TYPE_BITS,
};

/// Kind of the next chunk under the cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    None,
    Number,
    String,
    List,
}

fn malformed(what: &str) -> CacheError {
    CacheError::Protocol(format!("malformed chunk data: {what}"))
}

/// Cursor over the data-chunk region of a header.
pub struct ChunkIterator<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ChunkIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn has_more_chunks(&self) -> bool {
        self.offset < self.data.len()
    }

    fn byte_at(&self, offset: usize) -> Result<u8> {
        self.data
            .get(offset)
            .copied()
            .ok_or_else(|| malformed("truncated chunk"))
    }

    fn slice_at(&self, offset: usize, size: usize) -> Result<&'a [u8]> {
        self.data
            .get(offset..offset + size)
            .ok_or_else(|| malformed("truncated chunk body"))
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        if self.offset + n > self.data.len() {
            return Err(malformed("chunk extends past header"));
        }
        self.offset += n;
        Ok(())
    }

    /// Reads the 1..4 little-endian trailing bytes selected by the low
    /// bits of the lead byte; advances past the lead byte too.
    fn read_count(&mut self, lead: u8) -> Result<u32> {
        let (value, total) = match lead & CHNK_SHORT_MASK {
            0 => (self.byte_at(self.offset + 1)? as u32, 2),
            1 => {
                let b = self.slice_at(self.offset + 1, 2)?;
                (u16::from_le_bytes(b.try_into().unwrap()) as u32, 3)
            }
            2 => {
                let b = self.slice_at(self.offset + 1, 3)?;
                ((b[0] as u32) | ((b[1] as u32) << 8) | ((b[2] as u32) << 16), 4)
            }
            3 => {
                let b = self.slice_at(self.offset + 1, 4)?;
                (u32::from_le_bytes(b.try_into().unwrap()), 5)
            }
            _ => return Err(malformed("invalid count width")),
        };
        self.skip(total)?;
        Ok(value)
    }

    /// Peeks the type of the next chunk without advancing.
    pub fn next_chunk_type(&self) -> ChunkType {
        if !self.has_more_chunks() {
            return ChunkType::None;
        }
        let lead = self.data[self.offset];
        match lead & CHNK_TYPE_BITS {
            CHNK_INTEGER => ChunkType::Number,
            CHNK_STRING => ChunkType::String,
            CHNK_LIST => ChunkType::List,
            _ => match lead & CHNK_SUBTYPE_BITS {
                CHNK_SHORT_STRING | CHNK_LONG_STRING => ChunkType::String,
                CHNK_SHORT_LIST | CHNK_LONG_LIST => ChunkType::List,
                _ => ChunkType::Number,
            },
        }
    }

    /// Decodes the next chunk as a signed number in
    /// `i32::MIN ..= u32::MAX`.
    pub fn next_number(&mut self) -> Result<i64> {
        if !self.has_more_chunks() {
            return Err(malformed("expected number, found end of header"));
        }
        let lead = self.data[self.offset];
        let value = match lead & CHNK_TYPE_BITS {
            CHNK_INTEGER => {
                self.skip(1)?;
                ((lead & CHNK_LONG_MASK) as u32 + CHNK_MEDIUM_BIAS) as i64
            }
            CHNK_STRING | CHNK_LIST => {
                return Err(malformed("expected number chunk"));
            }
            _ => match lead & CHNK_SUBTYPE_BITS {
                CHNK_SMALL_NEGATIVE => {
                    self.skip(1)?;
                    -((lead & CHNK_SHORT_MASK) as i64) + CHNK_SMALL_NEGATIVE_BIAS
                }
                CHNK_BIG_NEGATIVE => {
                    let count = self.read_count(lead)? as i64;
                    -count + CHNK_BIG_NEGATIVE_BIAS
                }
                CHNK_SMALL_INTEGER => {
                    self.skip(1)?;
                    (lead & CHNK_SHORT_MASK) as i64
                }
                CHNK_BIG_INTEGER => {
                    let count = self.read_count(lead)? as i64;
                    count + CHNK_LARGE_BIAS as i64
                }
                _ => return Err(malformed("expected number chunk")),
            },
        };
        if value < i32::MIN as i64 || value > u32::MAX as i64 {
            return Err(malformed("number out of range"));
        }
        Ok(value)
    }

    /// Decodes the next chunk as a binary string borrowing the
    /// underlying buffer.
    pub fn next_string(&mut self) -> Result<&'a [u8]> {
        if !self.has_more_chunks() {
            return Err(malformed("expected string, found end of header"));
        }
        let lead = self.data[self.offset];
        let length = match lead & CHNK_TYPE_BITS {
            CHNK_STRING => {
                self.skip(1)?;
                ((lead & CHNK_LONG_MASK) as u32 + CHNK_MEDIUM_BIAS) as usize
            }
            CHNK_INTEGER | CHNK_LIST => return Err(malformed("expected string chunk")),
            _ => match lead & CHNK_SUBTYPE_BITS {
                CHNK_SHORT_STRING => {
                    self.skip(1)?;
                    (lead & CHNK_SHORT_MASK) as usize
                }
                CHNK_LONG_STRING => {
                    self.read_count(lead)? as usize + CHNK_LARGE_BIAS as usize
                }
                _ => return Err(malformed("expected string chunk")),
            },
        };
        let bytes = self.slice_at(self.offset, length)?;
        self.skip(length)?;
        Ok(bytes)
    }

    /// Decodes the next chunk as a list header and returns a reader for
    /// its elements; reading elements advances this iterator.
    pub fn next_list<'i>(&'i mut self) -> Result<ListReader<'a, 'i>> {
        if !self.has_more_chunks() {
            return Err(malformed("expected list, found end of header"));
        }
        let lead = self.data[self.offset];
        let count = match lead & CHNK_TYPE_BITS {
            CHNK_LIST => {
                self.skip(1)?;
                (lead & CHNK_LONG_MASK) as u32 + CHNK_MEDIUM_BIAS
            }
            CHNK_INTEGER | CHNK_STRING => return Err(malformed("expected list chunk")),
            _ => match lead & CHNK_SUBTYPE_BITS {
                CHNK_SHORT_LIST => {
                    self.skip(1)?;
                    (lead & CHNK_SHORT_MASK) as u32
                }
                CHNK_LONG_LIST => {
                    let count = self.read_count(lead)? as u64 + CHNK_LARGE_BIAS as u64;
                    u32::try_from(count).map_err(|_| malformed("list count overflow"))?
                }
                _ => return Err(malformed("expected list chunk")),
            },
        };
        // each element carries at least its length byte
        if count as usize > self.data.len() - self.offset {
            return Err(malformed("list count exceeds header size"));
        }
        Ok(ListReader {
            iterator: self,
            count,
            taken: 0,
        })
    }
}

/// Reader over the elements of a list chunk; every element is a binary
/// string with a 255-run length prefix (517 encodes as `255, 255, 7`).
pub struct ListReader<'a, 'i> {
    iterator: &'i mut ChunkIterator<'a>,
    count: u32,
    taken: u32,
}

impl<'a> ListReader<'a, '_> {
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn next_string(&mut self) -> Result<&'a [u8]> {
        if self.taken >= self.count {
            return Err(malformed("read past end of list"));
        }
        let length = read_vlq_length(self.iterator.data, &mut self.iterator.offset)?;
        let bytes = self.iterator.slice_at(self.iterator.offset, length)?;
        self.iterator.skip(length)?;
        self.taken += 1;
        Ok(bytes)
    }

    /// Collects the remaining elements into owned strings.
    pub fn collect_strings(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut strings = Vec::with_capacity((self.count - self.taken) as usize);
        while self.taken < self.count {
            strings.push(self.next_string()?.to_vec());
        }
        Ok(strings)
    }
}

fn read_vlq_length(data: &[u8], offset: &mut usize) -> Result<usize> {
    let mut length = 0usize;
    loop {
        let byte = *data
            .get(*offset)
            .ok_or_else(|| malformed("truncated list element length"))?;
        *offset += 1;
        length += byte as usize;
        if byte != 255 {
            return Ok(length);
        }
    }
}

/// Payload view for `LIST` bodies: decompresses when needed and walks
/// the concatenated VLQ strings.
pub struct PayloadReader {
    data: PayloadData,
    offset: usize,
}

enum PayloadData {
    Borrowed(bytes::Bytes),
    Owned(Vec<u8>, &'static Memory),
}

impl PayloadReader {
    pub fn new(
        payload: bytes::Bytes,
        compressor: Compressor,
        usize_hint: u32,
        memory: &'static Memory,
    ) -> Result<Self> {
        let data = if compressor == Compressor::None {
            PayloadData::Borrowed(payload)
        } else {
            let mut allocator = DomainAllocator::new(memory);
            let unpacked =
                compression::unpack(compressor, &payload, usize_hint as usize, &mut allocator)?;
            PayloadData::Owned(unpacked, memory)
        };
        Ok(Self { data, offset: 0 })
    }

    fn bytes(&self) -> &[u8] {
        match &self.data {
            PayloadData::Borrowed(data) => data,
            PayloadData::Owned(data, _) => data,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        self.bytes()
    }

    /// Next VLQ-prefixed string, as an owned vector (the backing buffer
    /// may be a temporary decompression).
    pub fn next_string(&mut self) -> Result<Vec<u8>> {
        let data = match &self.data {
            PayloadData::Borrowed(b) => &b[..],
            PayloadData::Owned(v, _) => &v[..],
        };
        let mut offset = self.offset;
        let length = read_vlq_length(data, &mut offset)?;
        let bytes = data
            .get(offset..offset + length)
            .ok_or_else(|| malformed("truncated payload string"))?
            .to_vec();
        self.offset = offset + length;
        Ok(bytes)
    }

    pub fn read_strings(&mut self, count: u32) -> Result<Vec<Vec<u8>>> {
        let mut strings = Vec::with_capacity(count as usize);
        for _ in 0..count {
            strings.push(self.next_string()?);
        }
        Ok(strings)
    }
}

impl Drop for PayloadReader {
    fn drop(&mut self) {
        if let PayloadData::Owned(data, memory) = &self.data {
            memory.register_deallocation(data.len() as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlq_length() {
        let data = [255u8, 255, 7, 0xAA];
        let mut offset = 0;
        assert_eq!(read_vlq_length(&data, &mut offset).unwrap(), 517);
        assert_eq!(offset, 3);

        let data = [0u8];
        let mut offset = 0;
        assert_eq!(read_vlq_length(&data, &mut offset).unwrap(), 0);

        let data = [255u8];
        let mut offset = 0;
        assert!(read_vlq_length(&data, &mut offset).is_err());
    }

    use crate::protocol::CHNK_SUBTYPE;

    #[test]
    fn test_truncated_chunks_error() {
        // long string claiming 100 bytes with an empty body
        let data = [CHNK_SUBTYPE | CHNK_LONG_STRING, 100 - 72];
        let mut it = ChunkIterator::new(&data);
        assert_eq!(it.next_chunk_type(), ChunkType::String);
        assert!(it.next_string().is_err());
    }

    #[test]
    fn test_type_mismatch_errors() {
        let data = [CHNK_SUBTYPE | CHNK_SMALL_NEGATIVE]; // -1
        let mut it = ChunkIterator::new(&data);
        assert_eq!(it.next_chunk_type(), ChunkType::Number);
        assert!(it.next_string().is_err());
    }
}
