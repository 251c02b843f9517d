//! Shared pieces of the end-to-end suite: binary length-prefixed
//! framings, the response transforms the test workers apply, and a
//! harness that boots a dispatcher around the `test-worker` helper
//! binary.

pub mod framing;
pub mod harness;

/// Plain adler32, as the checksum-echo worker computes it.
pub fn adler32(bytes: &[u8]) -> u32 {
    const MOD: u32 = 65521;
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for &byte in bytes {
        a = (a + byte as u32) % MOD;
        b = (b + a) % MOD;
    }
    (b << 16) | a
}

/// The cascading-xor response body: for every input byte `c`, emit
/// `prev ^ c` then `c`, seeded with the keep-alive flag byte. The
/// response carries its own length-prefixed header.
pub fn xor_cascade_response(body: &[u8], keep_alive: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 1 + 2 * body.len());
    out.extend_from_slice(&(2 * body.len() as u64).to_le_bytes());
    out.push(keep_alive);
    for &c in body {
        let prev = *out.last().expect("seeded with the flag byte");
        out.push(prev ^ c);
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adler32_matches_known_vectors() {
        assert_eq!(adler32(b""), 1);
        assert_eq!(adler32(b"Wikipedia"), 0x11E60398);
        // For n zero bytes: a stays 1, b ends at n mod 65521.
        assert_eq!(adler32(&[0u8; 1000]), (1000 << 16) | 1);
    }

    #[test]
    fn xor_cascade_shape() {
        let resp = xor_cascade_response(&[0x10, 0x20], 1);
        assert_eq!(&resp[..8], &4u64.to_le_bytes());
        assert_eq!(resp[8], 1);
        assert_eq!(resp[9], 1 ^ 0x10);
        assert_eq!(resp[10], 0x10);
        assert_eq!(resp[11], 0x10 ^ 0x20);
        assert_eq!(resp[12], 0x20);
    }
}
