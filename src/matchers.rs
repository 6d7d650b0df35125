//! Rule matchers: the individual predicates a rule checks against a packet.
//!
//! Every matcher on a rule is optional; an absent matcher matches all
//! packets. The blanket [`Matcher`] impl for `Option<M>` encodes that.

use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use core::ops::RangeInclusive;

use crate::packets::TcpFlags;

/// A predicate over some property of a packet.
pub trait Matcher<T> {
    fn matches(&self, actual: &T) -> bool;

    /// Whether the matcher constrains anything at all. Unconstrained
    /// matchers are what skip steps jump over.
    fn required_matches(&self) -> bool {
        true
    }
}

/// An absent matcher matches everything.
impl<T, M: Matcher<T>> Matcher<T> for Option<M> {
    fn matches(&self, actual: &T) -> bool {
        match self {
            Some(matcher) => matcher.matches(actual),
            None => true,
        }
    }

    fn required_matches(&self) -> bool {
        self.is_some()
    }
}

/// An IP subnet in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: IpAddr,
    prefix: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubnetError {
    PrefixTooLong,
    HostBitsSet,
}

impl Subnet {
    pub fn new(network: IpAddr, prefix: u8) -> Result<Self, SubnetError> {
        let bits = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > bits {
            return Err(SubnetError::PrefixTooLong);
        }
        let subnet = Self { network, prefix };
        if subnet.mask_addr(&network) != network {
            return Err(SubnetError::HostBitsSet);
        }
        Ok(subnet)
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    fn mask_addr(&self, addr: &IpAddr) -> IpAddr {
        match addr {
            IpAddr::V4(v4) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(self.prefix))
                };
                IpAddr::V4(Ipv4Addr::from(u32::from(*v4) & mask))
            }
            IpAddr::V6(v6) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - u32::from(self.prefix))
                };
                IpAddr::V6(Ipv6Addr::from(u128::from(*v6) & mask))
            }
        }
    }

    /// Whether `addr` falls inside the subnet. Addresses of the other
    /// family never match.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                self.mask_addr(addr) == self.network
            }
            _ => false,
        }
    }
}

/// The ways an address matcher can specify its addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressMatcherType {
    Subnet(Subnet),
    Range(RangeInclusive<IpAddr>),
}

impl Matcher<IpAddr> for AddressMatcherType {
    fn matches(&self, actual: &IpAddr) -> bool {
        match self {
            Self::Subnet(subnet) => subnet.contains(actual),
            Self::Range(range) => range.contains(actual),
        }
    }
}

/// A matcher for IP addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressMatcher {
    pub matcher: AddressMatcherType,
    pub invert: bool,
}

impl Matcher<IpAddr> for AddressMatcher {
    fn matches(&self, actual: &IpAddr) -> bool {
        self.matcher.matches(actual) ^ self.invert
    }
}

/// A matcher for transport-layer port numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMatcher {
    pub range: RangeInclusive<u16>,
    pub invert: bool,
}

impl Matcher<u16> for PortMatcher {
    fn matches(&self, actual: &u16) -> bool {
        self.range.contains(actual) ^ self.invert
    }
}

/// A matcher for TCP header flags: the bits in `flags` must be set and the
/// rest of `mask` must be clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagMatcher {
    pub flags: TcpFlags,
    pub mask: TcpFlags,
}

impl FlagMatcher {
    /// The conventional "new connection" matcher: SYN set, ACK clear.
    pub fn syn_only() -> Self {
        Self { flags: TcpFlags::SYN, mask: TcpFlags::SYN | TcpFlags::ACK }
    }
}

impl Matcher<TcpFlags> for FlagMatcher {
    fn matches(&self, actual: &TcpFlags) -> bool {
        actual.masked(self.mask) == self.flags
    }
}

/// A matcher for the interface a packet arrived on or leaves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceMatcher {
    pub id: u32,
    pub invert: bool,
}

impl Matcher<u32> for InterfaceMatcher {
    fn matches(&self, actual: &u32) -> bool {
        (self.id == *actual) ^ self.invert
    }
}
