//! Payload integrity digest
//!
//! Adler-32: a running sum of bytes and a running sum of those sums, both
//! reduced modulo the largest prime below 2^16. Cheap, order-sensitive and
//! good at catching truncation or flipped bits. It is not a cryptographic
//! checksum and must never be treated as one.

/// Largest prime smaller than 65536
const MOD_ADLER: u32 = 65_521;

/// Computes the Adler-32 digest of `bytes`.
///
/// The empty slice digests to `1`.
pub fn checksum(bytes: &[u8]) -> u32 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;

    for &byte in bytes {
        a = (a + u32::from(byte)) % MOD_ADLER;
        b = (b + a) % MOD_ADLER;
    }

    (b << 16) | a
}
