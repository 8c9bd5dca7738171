//! Small shared helpers with no better home.

use std::fmt::Write as _;

/// A short, content-dependent hex digest used to name data files and
/// manifests so concurrent writers never collide on a path (§4.B, §4.D).
/// Not cryptographically secured -- collision resistance against an
/// adversary is not a requirement here, only against accidental reuse.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hash: u64 = 0xcbf29ce484222325; // FNV-1a offset basis
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    let mut out = String::with_capacity(16);
    let _ = write!(out, "{hash:016x}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bytes_hash_the_same() {
        assert_eq!(content_hash(b"hello"), content_hash(b"hello"));
        assert_ne!(content_hash(b"hello"), content_hash(b"world"));
    }
}
