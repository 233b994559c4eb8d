//! 128-bit checksums for headers, bodies, and the session hash chain.
//!
//! Every message carries two checksums: one over the header (excluding the
//! checksum field itself) and one over the body. The header checksum doubles
//! as the hash-chain link between a client's requests and the cluster's
//! replies, so it must be wide enough that collisions are not a practical
//! concern. We take the low 128 bits of BLAKE3.

/// Computes the 128-bit checksum of `data`.
///
/// The result is the first 16 bytes of the BLAKE3 digest, interpreted as a
/// little-endian `u128`.
#[must_use]
pub fn checksum(data: &[u8]) -> u128 {
    let hash = blake3::hash(data);
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash.as_bytes()[..16]);
    u128::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_deterministic() {
        assert_eq!(checksum(b"keel"), checksum(b"keel"));
    }

    #[test]
    fn checksum_distinguishes_inputs() {
        assert_ne!(checksum(b"keel"), checksum(b"heel"));
        assert_ne!(checksum(b""), checksum(b"\0"));
    }

    #[test]
    fn empty_checksum_is_nonzero() {
        // The hash chain uses 0 as "no parent", so the empty digest must
        // never collide with it.
        assert_ne!(checksum(b""), 0);
    }
}
