use serde::Serialize;

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

pub fn fnv1a_init() -> u64 {
    FNV1A_OFFSET
}

pub fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    fnv1a_bytes(fnv1a_init(), bytes)
}

/// Incremental FNV-1a over a sequence of serializable parts.
///
/// Values are hashed through their bincode encoding, so two fingerprints agree
/// exactly when the encoded parts agree byte for byte.
#[derive(Debug, Clone, Copy)]
pub struct Fingerprint {
    state: u64,
}

impl Fingerprint {
    pub fn new() -> Self {
        Self {
            state: fnv1a_init(),
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.state = fnv1a_bytes(self.state, &(bytes.len() as u64).to_le_bytes());
        self.state = fnv1a_bytes(self.state, bytes);
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.state = fnv1a_bytes(self.state, &value.to_le_bytes());
    }

    pub fn write_serialized<T: Serialize + ?Sized>(&mut self, value: &T) -> bincode::Result<()> {
        let bytes = bincode::serialize(value)?;
        self.write_bytes(&bytes);
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv_matches_reference_vectors() {
        assert_eq!(fnv1a_hash(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_hash(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn fingerprint_is_length_delimited() {
        let mut a = Fingerprint::new();
        a.write_str("ab");
        a.write_str("c");
        let mut b = Fingerprint::new();
        b.write_str("a");
        b.write_str("bc");
        assert_ne!(a.finish(), b.finish());
    }
}
