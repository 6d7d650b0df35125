//! The packet descriptor consumed by the filtering engine.
//!
//! Parsing and buffer management happen upstream: by the time a packet
//! reaches this crate its headers have been validated, any fragments have
//! been reassembled, and the interesting fields have been pulled out into a
//! [`PacketDescriptor`]. The engine mutates the descriptor in place when it
//! performs NAT; the I/O layer is responsible for writing the changes back
//! to the wire representation.

use core::fmt;
use core::net::IpAddr;
use core::ops::Add;

/// The direction a packet is traveling relative to the filtering boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Arriving from the wire.
    In,
    /// Leaving towards the wire.
    Out,
}

impl Direction {
    /// The opposite direction.
    pub fn reverse(self) -> Self {
        match self {
            Direction::In => Direction::Out,
            Direction::Out => Direction::In,
        }
    }
}

/// IP address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// The family of `addr`.
    pub fn of(addr: &IpAddr) -> Family {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

/// Transport-layer protocol, as far as the engine distinguishes them.
///
/// Anything without a dedicated tracker falls under `Other` and gets the
/// simple liveness treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Sctp,
    Other(u8),
}

/// TCP header flags, kept as raw bits so flag-set matchers can mask them
/// the same way the wire format does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const URG: TcpFlags = TcpFlags(0x20);

    /// Whether every flag in `other` is set in `self`.
    pub fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any flag in `other` is set in `self`.
    pub fn intersects(self, other: TcpFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// The flags of `self` selected by `mask`.
    pub fn masked(self, mask: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 & mask.0)
    }
}

impl core::ops::BitOr for TcpFlags {
    type Output = TcpFlags;
    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (bit, c) in [
            (Self::FIN, 'F'),
            (Self::SYN, 'S'),
            (Self::RST, 'R'),
            (Self::PSH, 'P'),
            (Self::ACK, 'A'),
            (Self::URG, 'U'),
        ] {
            if self.contains(bit) {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

/// A TCP sequence number with the wrapping comparisons required by the
/// sequence-window tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct SeqNum(u32);

impl SeqNum {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// `self >= other` in sequence space.
    pub fn geq(self, other: SeqNum) -> bool {
        self.0.wrapping_sub(other.0) as i32 >= 0
    }

    /// `self > other` in sequence space.
    pub fn gt(self, other: SeqNum) -> bool {
        self.0.wrapping_sub(other.0) as i32 > 0
    }

    /// Signed distance from `other` to `self`.
    pub fn diff(self, other: SeqNum) -> i64 {
        (self.0.wrapping_sub(other.0) as i32).into()
    }

    pub fn wrapping_sub(self, value: u32) -> SeqNum {
        SeqNum(self.0.wrapping_sub(value))
    }
}

impl Add<u32> for SeqNum {
    type Output = SeqNum;
    fn add(self, rhs: u32) -> SeqNum {
        SeqNum(self.0.wrapping_add(rhs))
    }
}

impl From<u32> for SeqNum {
    fn from(value: u32) -> Self {
        SeqNum(value)
    }
}

/// Parsed TCP header fields. `seq`, `ack`, the SACK blocks, and `checksum`
/// are rewritten in place when sequence modulation or NAT applies.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TcpSegment {
    pub seq: SeqNum,
    pub ack: SeqNum,
    pub flags: TcpFlags,
    pub window: u16,
    /// Window-scale option, present only on SYN segments that carry it.
    pub wscale: Option<u8>,
    /// MSS option where present, consumed by the SYN proxy.
    pub mss: Option<u16>,
    /// SACK option blocks, demodulated together with `ack`.
    pub sack_blocks: Vec<(SeqNum, SeqNum)>,
    pub checksum: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UdpHeader {
    pub checksum: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
    /// Echo identifier; the upstream parser copies it into the descriptor's
    /// source port so ICMP queries key like other flows.
    pub id: u16,
    pub checksum: u16,
}

/// A parsed SCTP control chunk, reduced to what the tracker needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SctpChunk {
    /// INIT carrying the initiate tag the peer expects on replies.
    Init { initiate_tag: u32 },
    /// INIT-ACK carrying the initiate tag for the reverse direction.
    InitAck { initiate_tag: u32 },
    /// COOKIE ECHO; completes the association handshake.
    Cookie,
    HeartbeatAck,
    Shutdown,
    ShutdownComplete,
    Abort,
    /// ASCONF address reconfiguration: addresses added to or removed from
    /// the association.
    Asconf { add: Vec<IpAddr>, del: Vec<IpAddr> },
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SctpHeader {
    /// Verification tag the sender stamped on this packet.
    pub vtag: u32,
    pub chunks: Vec<SctpChunk>,
    pub checksum: u32,
}

/// The transport header of a packet, already parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportHeader {
    Tcp(TcpSegment),
    Udp(UdpHeader),
    Icmp(IcmpHeader),
    Sctp(SctpHeader),
    /// A protocol the engine does not inspect beyond addresses.
    Opaque,
}

impl TransportHeader {
    /// The transport checksum field, for protocols that carry a 16-bit
    /// ones'-complement checksum the engine patches incrementally.
    pub fn checksum_mut(&mut self) -> Option<&mut u16> {
        match self {
            TransportHeader::Tcp(tcp) => Some(&mut tcp.checksum),
            TransportHeader::Udp(udp) => Some(&mut udp.checksum),
            TransportHeader::Icmp(icmp) => Some(&mut icmp.checksum),
            TransportHeader::Sctp(_) | TransportHeader::Opaque => None,
        }
    }
}

/// A fully parsed packet, as handed to [`test_packet`].
///
/// Addresses, ports, and checksums are mutable: translation rewrites them
/// in place and the caller propagates the changes back to the actual
/// buffer.
///
/// [`test_packet`]: crate::context::FilterContext::test_packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketDescriptor {
    pub direction: Direction,
    pub family: Family,
    pub protocol: Protocol,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    /// Source port, or the echo identifier for ICMP queries.
    pub src_port: u16,
    pub dst_port: u16,
    /// IPv4 header checksum. `None` for IPv6.
    pub ip_checksum: Option<u16>,
    pub transport: TransportHeader,
    /// Total packet length in bytes, for byte counters.
    pub tot_len: u32,
    /// Transport payload length, for TCP logical segment length.
    pub payload_len: u32,
    /// Index of the interface the packet was received on or will leave
    /// through. Zero when unknown.
    pub interface: u32,
    pub tos: u8,
    /// Tag applied by an earlier rule or by the link layer.
    pub tag: Option<u16>,
}

impl PacketDescriptor {
    /// The TCP segment header, when this is a TCP packet.
    pub fn tcp(&self) -> Option<&TcpSegment> {
        match &self.transport {
            TransportHeader::Tcp(tcp) => Some(tcp),
            _ => None,
        }
    }

    pub fn tcp_mut(&mut self) -> Option<&mut TcpSegment> {
        match &mut self.transport {
            TransportHeader::Tcp(tcp) => Some(tcp),
            _ => None,
        }
    }

    pub fn sctp(&self) -> Option<&SctpHeader> {
        match &self.transport {
            TransportHeader::Sctp(sctp) => Some(sctp),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use core::net::Ipv4Addr;

    /// A plausible outbound TCP SYN for tests that don't care about the
    /// specific addresses.
    pub(crate) fn tcp_syn(
        src: (IpAddr, u16),
        dst: (IpAddr, u16),
        seq: u32,
        direction: Direction,
    ) -> PacketDescriptor {
        PacketDescriptor {
            direction,
            family: Family::of(&src.0),
            protocol: Protocol::Tcp,
            src_addr: src.0,
            dst_addr: dst.0,
            src_port: src.1,
            dst_port: dst.1,
            ip_checksum: Some(0x1234),
            transport: TransportHeader::Tcp(TcpSegment {
                seq: SeqNum::new(seq),
                ack: SeqNum::new(0),
                flags: TcpFlags::SYN,
                window: 8192,
                wscale: None,
                mss: Some(1460),
                sack_blocks: Vec::new(),
                checksum: 0xabcd,
            }),
            tot_len: 60,
            payload_len: 0,
            interface: 1,
            tos: 0,
            tag: None,
        }
    }

    pub(crate) fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqnum_wrapping_comparisons() {
        let near_max = SeqNum::new(u32::MAX - 10);
        let wrapped = near_max + 20;
        assert!(wrapped.gt(near_max));
        assert!(wrapped.geq(near_max));
        assert!(!near_max.geq(wrapped));
        assert_eq!(wrapped.raw(), 9);
    }

    #[test]
    fn seqnum_diff_is_signed() {
        let a = SeqNum::new(100);
        let b = SeqNum::new(200);
        assert_eq!(b.diff(a), 100);
        assert_eq!(a.diff(b), -100);
    }

    #[test]
    fn flags_display() {
        let flags = TcpFlags::SYN | TcpFlags::ACK;
        assert_eq!(flags.to_string(), "SA");
        assert!(flags.contains(TcpFlags::SYN));
        assert!(!flags.contains(TcpFlags::FIN));
        assert!(flags.intersects(TcpFlags::ACK | TcpFlags::FIN));
    }
}
