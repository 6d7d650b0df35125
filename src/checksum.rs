//! Incremental ones'-complement checksum arithmetic.
//!
//! Every in-place rewrite the engine performs (NAT, sequence modulation)
//! patches the affected checksum by folding out the old value and folding
//! in the new one, rather than recomputing over the payload. The identities
//! used here are the standard RFC 1624 ones. Translation across address
//! families is the one case where incremental patching is impossible,
//! because the pseudo-header length changes; those packets requeue with
//! a zeroed checksum for the serializer to fill in.

use core::net::IpAddr;

/// Patch a 16-bit checksum for a 16-bit field changing from `old` to `new`.
///
/// `udp` selects the UDP special case: a zero checksum means "not
/// computed" and must be preserved, and a computed result of zero is
/// transmitted as `0xffff`.
pub fn fixup(cksum: u16, old: u16, new: u16, udp: bool) -> u16 {
    if udp && cksum == 0 {
        return 0;
    }

    // RFC 1624 equation 3: HC' = ~(~HC + ~m + m'). This form round-trips
    // exactly, which the plain add-and-subtract form does not.
    let mut x = u32::from(!cksum) + u32::from(!old) + u32::from(new);
    x = (x & 0xffff) + (x >> 16);
    x = (x & 0xffff) + (x >> 16);
    let x = !(x as u16);

    if udp && x == 0 {
        return 0xffff;
    }
    x
}

/// Patch a checksum for a 32-bit field (e.g. a TCP sequence number)
/// changing from `old` to `new`.
pub fn fixup32(cksum: u16, old: u32, new: u32, udp: bool) -> u16 {
    let cksum = fixup(cksum, (old >> 16) as u16, (new >> 16) as u16, udp);
    fixup(cksum, old as u16, new as u16, udp)
}

/// The 16-bit halves of an address in network word order.
pub fn address_words(addr: &IpAddr) -> ([u16; 8], usize) {
    let mut words = [0u16; 8];
    match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            words[0] = u16::from_be_bytes([octets[0], octets[1]]);
            words[1] = u16::from_be_bytes([octets[2], octets[3]]);
            (words, 2)
        }
        IpAddr::V6(v6) => {
            for (i, segment) in v6.segments().iter().enumerate() {
                words[i] = *segment;
            }
            (words, 8)
        }
    }
}

/// Patch a checksum for an address changing from `old` to `new`.
///
/// The two addresses must belong to the same family; a family-crossing
/// rewrite invalidates the whole pseudo-header and cannot be patched.
pub fn fixup_addr(cksum: u16, old: &IpAddr, new: &IpAddr, udp: bool) -> u16 {
    debug_assert_eq!(
        core::mem::discriminant(old),
        core::mem::discriminant(new),
        "incremental fixup requires matching families"
    );
    let (old_words, n) = address_words(old);
    let (new_words, _) = address_words(new);
    let mut cksum = cksum;
    for i in 0..n {
        cksum = fixup(cksum, old_words[i], new_words[i], udp);
    }
    cksum
}
