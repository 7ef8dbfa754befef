//! Internet checksum (RFC 1071)
//!
//! `checksum` returns the folded ones-complement sum *without* the final
//! inversion so partial sums can be chained: pseudo-header, then header,
//! then payload. Header types invert the result when writing the field.

use std::net::Ipv4Addr;

/// Compute the folded ones-complement sum of `data`, starting from `initial`.
///
/// An odd trailing byte is padded with zero on the right.
#[must_use]
pub fn checksum(data: &[u8], initial: u16) -> u16 {
    let mut sum = u32::from(initial);
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
        // Fold early so the accumulator never overflows on jumbo buffers
        if sum > 0xFFFF_0000 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    fold(sum)
}

/// Add two partial checksums together.
#[must_use]
pub fn combine(a: u16, b: u16) -> u16 {
    fold(u32::from(a) + u32::from(b))
}

/// Partial checksum of the IPv4 pseudo-header used by TCP and UDP.
///
/// `l4_len` is the length of the transport header plus payload.
#[must_use]
pub fn pseudo_header_checksum(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, l4_len: u16) -> u16 {
    let mut sum = checksum(&src.octets(), 0);
    sum = checksum(&dst.octets(), sum);
    sum = combine(sum, u16::from(protocol));
    combine(sum, l4_len)
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    // Loop above guarantees the value fits
    #[allow(clippy::cast_possible_truncation)]
    let folded = sum as u16;
    folded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_rfc1071_example() {
        // Example from RFC 1071 section 3
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data, 0), 0xddf2);
    }

    #[test]
    fn test_checksum_odd_length() {
        assert_eq!(checksum(&[0xab], 0), 0xab00);
        assert_eq!(checksum(&[0x12, 0x34, 0x56], 0), 0x1234 + 0x5600);
    }

    #[test]
    fn test_checksum_chaining_matches_single_pass() {
        let data: Vec<u8> = (0..=255u8).collect();
        let whole = checksum(&data, 0);
        let chained = checksum(&data[128..], checksum(&data[..128], 0));
        assert_eq!(whole, chained);
    }

    #[test]
    fn test_combine_wraps_carry() {
        assert_eq!(combine(0xFFFF, 0x0001), 0x0001);
        assert_eq!(combine(0x8000, 0x8000), 0x0001);
    }

    #[test]
    fn test_pseudo_header() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let manual = checksum(&[10, 0, 0, 1, 10, 0, 0, 2, 0, 6, 0, 20], 0);
        assert_eq!(pseudo_header_checksum(6, src, dst, 20), manual);
    }
}
