//! Stable 32-bit hash for sticky sessions and admission client keys.
//!
//! The mix is pinned bitwise so that sticky routing is reproducible across
//! instances, restarts, and independent implementations: the same session
//! key must map to the same agent everywhere. Admission reuses the hash to
//! turn client ids into opaque keys so raw ids are never stored.

/// Offset basis of the stable hash.
pub const STABLE_HASH_OFFSET_BASIS: u32 = 2_166_136_261;

/// Computes the stable 32-bit hash of `input`.
///
/// For each byte of the UTF-8 encoding:
///
/// ```text
/// h = h XOR b
/// h = h + (h << 1) + (h << 4) + (h << 7) + (h << 8) + (h << 24)   (mod 2^32)
/// ```
///
/// The shift-add chain is the FNV-1a prime multiplication spelled out in
/// unsigned 32-bit arithmetic.
#[must_use]
pub fn stable_hash(input: &str) -> u32 {
    let mut h = STABLE_HASH_OFFSET_BASIS;
    for &b in input.as_bytes() {
        h ^= u32::from(b);
        h = h
            .wrapping_add(h << 1)
            .wrapping_add(h << 4)
            .wrapping_add(h << 7)
            .wrapping_add(h << 8)
            .wrapping_add(h << 24);
    }
    h
}
