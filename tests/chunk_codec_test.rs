// Chunk codec round-trip coverage: the full boundary grid plus a
// randomized sweep over mixed value sequences.

use cybercache::memory::{Domain, GLOBAL_MEMORY};
use cybercache::protocol::buffers::SharedBuffers;
use cybercache::protocol::builders::{HeaderChunkBuilder, HeaderListChunkBuilder};
use cybercache::protocol::chunks::ChunkIterator;
use cybercache::protocol::{AuthLevel, Command, ResponseType};
use rand::Rng;

const STRING_LENGTHS: [usize; 9] = [0, 7, 8, 71, 72, 255, 256, 65535, 65536];
const LIST_LENGTHS: [usize; 6] = [0, 1, 7, 8, 71, 72];
const INTEGERS: [i64; 9] = [
    -8,
    -9,
    0,
    7,
    8,
    71,
    72,
    i32::MIN as i64,
    u32::MAX as i64,
];

/// Builds a response header carrying exactly the given chunks and hands
/// back the chunk region for decoding.
fn encode(numbers: &[i64], strings: &[Vec<u8>], lists: &[Vec<Vec<u8>>]) -> Vec<u8> {
    let mut sb = SharedBuffers::new(Domain::Global);
    let mut header = HeaderChunkBuilder::response(ResponseType::Error, false);

    let mut list_builders = Vec::new();
    for list in lists {
        let mut builder = HeaderListChunkBuilder::new(&GLOBAL_MEMORY);
        for item in list {
            builder.estimate(item);
        }
        builder.configure();
        for item in list {
            builder.add(item);
        }
        builder.check();
        list_builders.push(builder);
    }

    for number in numbers {
        header.estimate_number(*number);
    }
    for string in strings {
        header.estimate_string(string);
    }
    for builder in &list_builders {
        header.estimate_list(builder);
    }
    header.configure(&mut sb, None);
    for number in numbers {
        header.add_number(&mut sb, *number);
    }
    for string in strings {
        header.add_string(&mut sb, string);
    }
    for builder in &list_builders {
        header.add_list(&mut sb, builder);
    }
    header.check();

    // chunks start after descriptor + header-size bytes (error responses
    // have no command id, password hash, or payload sizes)
    let total = sb.available_header_size();
    let width = match sb.header_u8(0) & 0x0C {
        0x04 => 1,
        0x08 => 2,
        0x0C => 4,
        _ => 0,
    };
    let offset = 1 + width;
    sb.header_bytes(offset, total - offset).to_vec()
}

#[test]
fn test_integer_boundaries() {
    let region = encode(&INTEGERS, &[], &[]);
    let mut it = ChunkIterator::new(&region);
    for expected in INTEGERS {
        assert_eq!(it.next_number().unwrap(), expected);
    }
    assert!(!it.has_more_chunks());
}

#[test]
fn test_string_length_boundaries() {
    let strings: Vec<Vec<u8>> = STRING_LENGTHS
        .iter()
        .map(|&len| (0..len).map(|i| (i % 251) as u8).collect())
        .collect();
    let region = encode(&[], &strings, &[]);
    let mut it = ChunkIterator::new(&region);
    for expected in &strings {
        assert_eq!(it.next_string().unwrap(), expected.as_slice());
    }
    assert!(!it.has_more_chunks());
}

#[test]
fn test_list_length_boundaries() {
    for &count in &LIST_LENGTHS {
        let list: Vec<Vec<u8>> = (0..count)
            .map(|i| format!("item-{i}").into_bytes())
            .collect();
        let region = encode(&[], &[], &[list.clone()]);
        let mut it = ChunkIterator::new(&region);
        let mut reader = it.next_list().unwrap();
        assert_eq!(reader.count() as usize, count);
        assert_eq!(reader.collect_strings().unwrap(), list);
        assert!(!it.has_more_chunks());
    }
}

#[test]
fn test_list_element_vlq_lengths() {
    // 517-byte elements need the 255,255,7 length prefix
    let list = vec![vec![0xAB; 517], vec![], vec![0xCD; 255]];
    let region = encode(&[], &[], &[list.clone()]);
    let mut it = ChunkIterator::new(&region);
    let mut reader = it.next_list().unwrap();
    assert_eq!(reader.collect_strings().unwrap(), list);
}

#[test]
fn test_randomized_sequences() {
    let mut rng = rand::rng();
    for _ in 0..50 {
        let numbers: Vec<i64> = (0..rng.random_range(1..8))
            .map(|_| rng.random_range(i32::MIN as i64..=u32::MAX as i64))
            .collect();
        let strings: Vec<Vec<u8>> = (0..rng.random_range(1..6))
            .map(|_| {
                let len = rng.random_range(0..300);
                (0..len).map(|_| rng.random()).collect()
            })
            .collect();
        let region = encode(&numbers, &strings, &[]);
        let mut it = ChunkIterator::new(&region);
        for expected in &numbers {
            assert_eq!(it.next_number().unwrap(), *expected);
        }
        for expected in &strings {
            assert_eq!(it.next_string().unwrap(), expected.as_slice());
        }
        assert!(!it.has_more_chunks());
    }
}

#[test]
fn test_command_and_response_descriptors_differ_only_in_low_bits() {
    let mut sb = SharedBuffers::new(Domain::Global);
    let mut header = HeaderChunkBuilder::command(Command::Check, AuthLevel::Admin, 99, false);
    header.configure(&mut sb, None);
    header.check();
    assert_eq!(sb.header_u8(0) & 0x03, 0x02); // admin auth bits
    assert_eq!(sb.header_u8(1), Command::Check as u8);
}
