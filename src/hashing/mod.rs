// # Hasher Registry
//
// Seeded 64-bit non-cryptographic hashing with a selectable algorithm.
// Two process-wide instances exist: `table_hasher` drives record lookup
// in the sharded stores, `password_hasher` derives the authentication
// hashes compared against command headers. Switching method or seed is a
// cold-path administrative operation; record hashes are recomputed on
// the next lookup, so a method change on a live store is only valid
// while the stores are empty (the config layer enforces that).

use crate::error::{CacheError, Result};
use parking_lot::RwLock;

/// Reserved value meaning "no hash" / "not configured"
pub const INVALID_HASH_VALUE: u64 = u64::MAX;

/// Selectable hash algorithms; wire/config names in `name()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HashMethod {
    XxHash = 1,
    FarmHash = 2,
    SpookyHash = 3,
    MurmurHash2 = 4,
    MurmurHash3 = 5,
}

impl HashMethod {
    pub fn name(self) -> &'static str {
        match self {
            HashMethod::XxHash => "xxhash",
            HashMethod::FarmHash => "farmhash",
            HashMethod::SpookyHash => "spookyhash",
            HashMethod::MurmurHash2 => "murmurhash2",
            HashMethod::MurmurHash3 => "murmurhash3",
        }
    }

    pub fn from_name(name: &str) -> Option<HashMethod> {
        match name {
            "xxhash" => Some(HashMethod::XxHash),
            "farmhash" => Some(HashMethod::FarmHash),
            "spookyhash" => Some(HashMethod::SpookyHash),
            "murmurhash2" => Some(HashMethod::MurmurHash2),
            "murmurhash3" => Some(HashMethod::MurmurHash3),
            _ => None,
        }
    }

    fn proc(self) -> Option<HashProc> {
        match self {
            HashMethod::XxHash => Some(xxhash_proc),
            HashMethod::MurmurHash2 => Some(murmurhash2_proc),
            HashMethod::MurmurHash3 => Some(murmurhash3_proc),
            // No engine is compiled in for these methods in this build
            HashMethod::FarmHash | HashMethod::SpookyHash => None,
        }
    }
}

type HashProc = fn(&[u8], u64) -> u64;

fn xxhash_proc(buff: &[u8], seed: u64) -> u64 {
    xxhash_rust::xxh64::xxh64(buff, seed)
}

// MurmurHash2, 64-bit version for 64-bit platforms ("MurmurHash64A" by
// Austin Appleby, public domain); the variant Redis uses for its own
// key hashing, kept here because it is the password-hasher default.
fn murmurhash2_proc(buff: &[u8], seed: u64) -> u64 {
    const M: u64 = 0xC6A4_A793_5BD1_E995;
    const R: u32 = 47;

    let len = buff.len();
    let mut h: u64 = seed ^ (len as u64).wrapping_mul(M);

    let mut chunks = buff.chunks_exact(8);
    for chunk in &mut chunks {
        let mut k = u64::from_le_bytes(chunk.try_into().unwrap());
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h ^= k;
        h = h.wrapping_mul(M);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k: u64 = 0;
        for (i, &b) in tail.iter().enumerate() {
            k |= (b as u64) << (8 * i);
        }
        h ^= k;
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    h
}

fn murmurhash3_proc(buff: &[u8], seed: u64) -> u64 {
    // the x64 variant produces 128 bits; the low half is the hash
    let mut cursor = std::io::Cursor::new(buff);
    match murmur3::murmur3_x64_128(&mut cursor, seed as u32) {
        Ok(digest) => digest as u64,
        Err(_) => INVALID_HASH_VALUE, // Cursor reads cannot fail in practice
    }
}

struct HasherState {
    method: HashMethod,
    proc: HashProc,
    seed: u64,
}

/// A seeded hash engine with a runtime-selectable algorithm.
pub struct Hasher {
    state: RwLock<HasherState>,
}

impl Hasher {
    pub fn new(method: HashMethod, seed: u64) -> Self {
        let proc = method
            .proc()
            .expect("default hash method must have a compiled-in engine");
        Self {
            state: RwLock::new(HasherState { method, proc, seed }),
        }
    }

    pub fn get_method(&self) -> HashMethod {
        self.state.read().method
    }

    /// Cold path: administrative method switch. Fails for methods whose
    /// engine is not compiled into this build.
    pub fn set_method(&self, method: HashMethod) -> Result<()> {
        match method.proc() {
            Some(proc) => {
                let mut state = self.state.write();
                state.method = method;
                state.proc = proc;
                Ok(())
            }
            None => Err(CacheError::Hashing(format!(
                "hash method '{}' is not supported by this build",
                method.name()
            ))),
        }
    }

    pub fn get_seed(&self) -> u64 {
        self.state.read().seed
    }

    pub fn set_seed(&self, seed: u64) {
        self.state.write().seed = seed;
    }

    pub fn hash(&self, buff: &[u8]) -> u64 {
        let state = self.state.read();
        (state.proc)(buff, state.seed)
    }
}

/// Hashing engine for record lookup in the sharded stores
pub fn table_hasher() -> &'static Hasher {
    static TABLE_HASHER: once_cell::sync::Lazy<Hasher> =
        once_cell::sync::Lazy::new(|| Hasher::new(HashMethod::XxHash, 0xA7E7_92DE_6A72_D8E0));
    &TABLE_HASHER
}

/// Hashing engine for one-way password encryption
pub fn password_hasher() -> &'static Hasher {
    static PASSWORD_HASHER: once_cell::sync::Lazy<Hasher> =
        once_cell::sync::Lazy::new(|| Hasher::new(HashMethod::MurmurHash2, 0x2CFC_6D03_3D50_9131));
    &PASSWORD_HASHER
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        let hasher = Hasher::new(HashMethod::XxHash, 12345);
        let a = hasher.hash(b"session-key-1");
        let b = hasher.hash(b"session-key-1");
        assert_eq!(a, b);
        assert_ne!(a, hasher.hash(b"session-key-2"));
    }

    #[test]
    fn test_seed_changes_output() {
        let hasher = Hasher::new(HashMethod::XxHash, 1);
        let first = hasher.hash(b"payload");
        hasher.set_seed(2);
        assert_ne!(first, hasher.hash(b"payload"));
    }

    #[test]
    fn test_murmur2_known_properties() {
        // engine must consume trailing bytes: differing tails differ
        let h = Hasher::new(HashMethod::MurmurHash2, 0);
        assert_ne!(h.hash(b"abcdefgh1"), h.hash(b"abcdefgh2"));
        assert_ne!(h.hash(b""), h.hash(b"\0"));
    }

    #[test]
    fn test_method_switch() {
        let hasher = Hasher::new(HashMethod::XxHash, 7);
        let xx = hasher.hash(b"key");
        hasher.set_method(HashMethod::MurmurHash2).unwrap();
        assert_eq!(hasher.get_method(), HashMethod::MurmurHash2);
        assert_ne!(xx, hasher.hash(b"key"));
        assert!(hasher.set_method(HashMethod::FarmHash).is_err());
        // failed switch leaves the previous method in place
        assert_eq!(hasher.get_method(), HashMethod::MurmurHash2);
    }

    #[test]
    fn test_global_hashers() {
        assert_eq!(table_hasher().get_method(), HashMethod::XxHash);
        assert_eq!(password_hasher().get_method(), HashMethod::MurmurHash2);
        assert_ne!(
            table_hasher().hash(b"secret"),
            password_hasher().hash(b"secret")
        );
    }
}
