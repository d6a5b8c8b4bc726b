//! Stable fingerprints for kernels and image lookups.

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

/// Incremental FNV-1a hasher; unlike `DefaultHasher` the result is stable across processes.
#[derive(Clone, Copy)]
pub struct Fingerprint {
    state: u64,
}

impl Fingerprint {
    pub fn new() -> Self {
        Self {
            state: FNV1A_OFFSET,
        }
    }

    pub fn write_bytes(mut self, bytes: &[u8]) -> Self {
        self.state = fnv1a_bytes(self.state, bytes);
        self
    }

    pub fn write_str(self, value: &str) -> Self {
        // Length prefix keeps ("ab", "c") distinct from ("a", "bc").
        self.write_u64(value.len() as u64)
            .write_bytes(value.as_bytes())
    }

    pub fn write_u64(self, value: u64) -> Self {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn finish(self) -> u64 {
        self.state
    }
}

impl Default for Fingerprint {
    fn default() -> Self {
        Self::new()
    }
}

pub fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    fnv1a_bytes(FNV1A_OFFSET, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_vector() {
        assert_eq!(fnv1a_hash(b""), FNV1A_OFFSET);
        assert_eq!(fnv1a_hash(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn string_fields_are_length_prefixed() {
        let left = Fingerprint::new().write_str("ab").write_str("c").finish();
        let right = Fingerprint::new().write_str("a").write_str("bc").finish();
        assert_ne!(left, right);
    }
}
