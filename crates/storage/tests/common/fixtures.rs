use bytes::Bytes;

/// Generate deterministic pseudo-random test data. Same seed produces the
/// same output, and LCG output does not compress.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Highly repetitive data that any gzip level shrinks.
pub fn compressible_bytes(len: usize) -> Bytes {
    let phrase = b"the quick brown fox jumps over the lazy dog. ";
    let mut data = Vec::with_capacity(len);
    while data.len() < len {
        let take = phrase.len().min(len - data.len());
        data.extend_from_slice(&phrase[..take]);
    }
    Bytes::from(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_bytes_deterministic() {
        assert_eq!(seeded_bytes(42, 1000), seeded_bytes(42, 1000));
        assert_ne!(seeded_bytes(42, 1000), seeded_bytes(43, 1000));
    }

    #[test]
    fn test_compressible_bytes_length() {
        assert_eq!(compressible_bytes(10_000).len(), 10_000);
    }
}
