//! Rules, rulesets, and nested rule groups (anchors).
//!
//! A [`Ruleset`] is an ordered list of [`Rule`]s with precomputed skip
//! indices: for each of eight predicate categories, every rule knows the
//! index of the next rule that differs from it in that category. When
//! evaluation fails a predicate it jumps there directly instead of
//! stepping rule by rule. The computation is a single head-run pass in
//! [`Ruleset::new`].

use core::net::IpAddr;
use core::ops::RangeInclusive;
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::conntrack::TimeoutKind;
use crate::matchers::{AddressMatcher, FlagMatcher, InterfaceMatcher, PortMatcher};
use crate::packets::{Direction, Family, Protocol};

/// The terminal effect of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Pass,
    Block,
    /// Applies side effects (tag, log, queue) and keeps scanning.
    Match,
}

/// What kind of state, if any, a passing rule creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatePolicy {
    /// No state; every packet of the flow re-evaluates the rules.
    None,
    /// Full tracking with sequence-window validation.
    #[default]
    Keep,
    /// Full tracking plus sequence-number modulation.
    Modulate,
    /// Full tracking behind a locally answered SYN proxy handshake.
    Proxy,
    /// Transition-only tracking for asymmetric paths.
    Sloppy,
}

/// The translation a NAT rule performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatKind {
    /// Matching flows are exempt from translation; short-circuits the
    /// NAT pre-pass.
    Exempt,
    /// Rewrite the source address (and usually port).
    Masquerade,
    /// Rewrite the destination address (and optionally port).
    Redirect,
    /// 1:1 bidirectional source mapping, ports untouched.
    Binat,
}

/// The translation half of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatSpec {
    pub kind: NatKind,
    /// Candidate translation addresses. Round-robin unless sticky.
    pub pool: Vec<IpAddr>,
    /// Proxy port range for allocated source ports, or the fixed
    /// destination port for redirects.
    pub port_range: Option<RangeInclusive<u16>>,
    /// Pin each source address to one pool address via a source node.
    pub sticky: bool,
}

/// Route-to pool with sticky source pinning. The pool is consumed by the
/// routing collaborator; only the sticky bookkeeping lives here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePool {
    pub addrs: Vec<IpAddr>,
    pub sticky: bool,
}

/// What to flush when a source trips its overload threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushScope {
    #[default]
    None,
    /// Kill other states from the same source created by this rule.
    Rule,
    /// Kill all states from the same source.
    Global,
}

/// Connection rate threshold: more than `limit` new connections within
/// `seconds` trips the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnRate {
    pub limit: u32,
    pub seconds: u32,
}

/// Per-rule state and source limits.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceLimits {
    /// Cap on live states created by this rule.
    pub max_states: Option<u32>,
    /// Cap on distinct source nodes tracked for this rule.
    pub max_src_nodes: Option<u32>,
    /// Cap on live states per source address.
    pub max_src_states: Option<u32>,
    /// Cap on established connections per source address.
    pub max_src_conn: Option<u32>,
    pub rate: Option<ConnRate>,
    /// Block table to record offending sources in.
    pub overload_table: Option<String>,
    pub flush: FlushScope,
}

impl SourceLimits {
    /// Whether any per-source limit requires a source node.
    pub fn tracks_sources(&self) -> bool {
        self.max_src_nodes.is_some()
            || self.max_src_states.is_some()
            || self.max_src_conn.is_some()
            || self.rate.is_some()
    }
}

/// Reference from a rule to a nested group of rules.
#[derive(Debug, Clone)]
pub struct AnchorRef {
    pub anchor: Arc<Anchor>,
    /// Evaluate every child of the anchor instead of its own ruleset.
    pub wildcard: bool,
}

/// A named, nested group of rules.
#[derive(Debug)]
pub struct Anchor {
    pub name: String,
    pub ruleset: Ruleset,
    /// Children in name order; wildcard references iterate these.
    pub children: BTreeMap<String, Arc<Anchor>>,
}

/// Packet/byte/state counters kept per rule.
#[derive(Debug, Default)]
pub struct RuleCounters {
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
    pub states: AtomicU64,
    pub src_nodes: AtomicU64,
}

impl RuleCounters {
    pub fn count_packet(&self, bytes: u64) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// The number of skip categories.
pub const SKIP_COUNT: usize = 8;

/// Predicate categories with precomputed skip indices, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipCat {
    Interface = 0,
    Direction = 1,
    Family = 2,
    Protocol = 3,
    SrcAddr = 4,
    DstAddr = 5,
    SrcPort = 6,
    DstPort = 7,
}

/// An ordered filter clause.
#[derive(Debug)]
pub struct Rule {
    pub interface: Option<InterfaceMatcher>,
    pub direction: Option<Direction>,
    pub family: Option<Family>,
    pub protocol: Option<Protocol>,
    pub src_addr: Option<AddressMatcher>,
    pub dst_addr: Option<AddressMatcher>,
    pub src_port: Option<PortMatcher>,
    pub dst_port: Option<PortMatcher>,
    pub flags: Option<FlagMatcher>,
    pub tos: Option<u8>,
    /// Matches packets carrying this tag (set by an earlier rule).
    pub tag_match: Option<u16>,
    /// Match with probability `p / u32::MAX`, one draw per evaluation.
    pub probability: Option<u32>,

    pub action: Action,
    /// Stop evaluation immediately on match.
    pub quick: bool,
    /// Answer blocked packets actively: TCP gets a reset, everything
    /// else an unreachable.
    pub reject: bool,
    pub state: StatePolicy,
    pub nat: Option<NatSpec>,
    pub route_to: Option<RoutePool>,
    pub limits: SourceLimits,
    /// Per-state timeout overrides, consulted before the global table.
    pub timeouts: Vec<(TimeoutKind, u32)>,
    /// Per-rule adaptive scaling thresholds (start, end).
    pub adaptive: Option<(u32, u32)>,
    pub log: bool,
    /// Tag applied to matching packets.
    pub tag_set: Option<u16>,
    pub anchor: Option<AnchorRef>,

    /// Position in the containing ruleset, for logging and read-out.
    pub number: usize,
    /// Jump targets, filled in by [`Ruleset::new`]. `rules.len()` means
    /// "past the end".
    pub skip: [usize; SKIP_COUNT],

    pub counters: RuleCounters,
}

impl Default for Rule {
    fn default() -> Self {
        Self {
            interface: None,
            direction: None,
            family: None,
            protocol: None,
            src_addr: None,
            dst_addr: None,
            src_port: None,
            dst_port: None,
            flags: None,
            tos: None,
            tag_match: None,
            probability: None,
            action: Action::Pass,
            quick: false,
            reject: false,
            state: StatePolicy::default(),
            nat: None,
            route_to: None,
            limits: SourceLimits::default(),
            timeouts: Vec::new(),
            adaptive: None,
            log: false,
            tag_set: None,
            anchor: None,
            number: 0,
            skip: [0; SKIP_COUNT],
            counters: RuleCounters::default(),
        }
    }
}

impl Rule {
    /// Whether `self` and `other` constrain `cat` identically. Rules in
    /// one skip run are interchangeable for that category: if the
    /// category fails on one, it fails on all of them.
    fn same_skip_value(&self, other: &Rule, cat: SkipCat) -> bool {
        match cat {
            SkipCat::Interface => self.interface == other.interface,
            SkipCat::Direction => self.direction == other.direction,
            SkipCat::Family => self.family == other.family,
            SkipCat::Protocol => self.protocol == other.protocol,
            SkipCat::SrcAddr => self.src_addr == other.src_addr,
            SkipCat::DstAddr => self.dst_addr == other.dst_addr,
            SkipCat::SrcPort => self.src_port == other.src_port,
            SkipCat::DstPort => self.dst_port == other.dst_port,
        }
    }
}

/// An ordered, skip-linked list of rules.
#[derive(Debug, Default)]
pub struct Ruleset {
    rules: Vec<Arc<Rule>>,
}

impl Ruleset {
    /// Numbers the rules, computes skip indices, and freezes the list.
    pub fn new(mut rules: Vec<Rule>) -> Self {
        for (number, rule) in rules.iter_mut().enumerate() {
            rule.number = number;
        }
        calc_skip_steps(&mut rules);
        Self { rules: rules.into_iter().map(Arc::new).collect() }
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Head-run skip computation: walk the list once per category keeping the
/// index where the current run of identical values began; when the value
/// changes, point every rule of the finished run at the change point. The
/// trailing run points past the end.
fn calc_skip_steps(rules: &mut [Rule]) {
    let cats = [
        SkipCat::Interface,
        SkipCat::Direction,
        SkipCat::Family,
        SkipCat::Protocol,
        SkipCat::SrcAddr,
        SkipCat::DstAddr,
        SkipCat::SrcPort,
        SkipCat::DstPort,
    ];
    let mut head = [0usize; SKIP_COUNT];
    for i in 1..rules.len() {
        for cat in cats {
            let c = cat as usize;
            if !rules[head[c]].same_skip_value(&rules[i], cat) {
                for j in head[c]..i {
                    rules[j].skip[c] = i;
                }
                head[c] = i;
            }
        }
    }
    let end = rules.len();
    for cat in cats {
        let c = cat as usize;
        for j in head[c]..end {
            rules[j].skip[c] = end;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchers::{AddressMatcherType, Subnet};

    fn src_subnet(net: &str, prefix: u8) -> Option<AddressMatcher> {
        Some(AddressMatcher {
            matcher: AddressMatcherType::Subnet(
                Subnet::new(net.parse().unwrap(), prefix).unwrap(),
            ),
            invert: false,
        })
    }

    fn dst_port(port: u16) -> Option<PortMatcher> {
        Some(PortMatcher { range: port..=port, invert: false })
    }

    #[test]
    fn skip_steps_group_identical_runs() {
        // Rules 0-2 share a protocol, rule 3 changes it. A protocol
        // mismatch at rule 0 must land directly on rule 3.
        let rules = vec![
            Rule { protocol: Some(Protocol::Tcp), dst_port: dst_port(80), ..Rule::default() },
            Rule { protocol: Some(Protocol::Tcp), dst_port: dst_port(443), ..Rule::default() },
            Rule { protocol: Some(Protocol::Tcp), dst_port: dst_port(22), ..Rule::default() },
            Rule { protocol: Some(Protocol::Udp), ..Rule::default() },
        ];
        let set = Ruleset::new(rules);
        let rules = set.rules();
        assert_eq!(rules[0].skip[SkipCat::Protocol as usize], 3);
        assert_eq!(rules[1].skip[SkipCat::Protocol as usize], 3);
        assert_eq!(rules[2].skip[SkipCat::Protocol as usize], 3);
        // The trailing run points past the end.
        assert_eq!(rules[3].skip[SkipCat::Protocol as usize], 4);
        // Ports all differ, so their skips advance one at a time.
        assert_eq!(rules[0].skip[SkipCat::DstPort as usize], 1);
        assert_eq!(rules[1].skip[SkipCat::DstPort as usize], 2);
    }

    #[test]
    fn skip_steps_never_jump_over_a_differing_rule() {
        // Rule 1 constrains a different source subnet; a source-address
        // mismatch at rule 0 may skip to 1, never past it.
        let rules = vec![
            Rule { src_addr: src_subnet("10.0.0.0", 8), ..Rule::default() },
            Rule { src_addr: src_subnet("192.168.0.0", 16), ..Rule::default() },
            Rule { src_addr: src_subnet("192.168.0.0", 16), ..Rule::default() },
        ];
        let set = Ruleset::new(rules);
        let rules = set.rules();
        assert_eq!(rules[0].skip[SkipCat::SrcAddr as usize], 1);
        assert_eq!(rules[1].skip[SkipCat::SrcAddr as usize], 3);
        assert_eq!(rules[2].skip[SkipCat::SrcAddr as usize], 3);
    }

    #[test]
    fn unconstrained_run_skips_whole_list() {
        let rules = vec![
            Rule::default(),
            Rule { dst_port: dst_port(80), ..Rule::default() },
            Rule::default(),
        ];
        let set = Ruleset::new(rules);
        let rules = set.rules();
        // No rule constrains the interface, so the whole list is one run.
        assert_eq!(rules[0].skip[SkipCat::Interface as usize], 3);
        assert_eq!(rules[0].skip[SkipCat::DstPort as usize], 1);
        assert_eq!(rules[1].skip[SkipCat::DstPort as usize], 2);
        assert_eq!(rules[2].skip[SkipCat::DstPort as usize], 3);
        assert_eq!(rules[0].number, 0);
        assert_eq!(rules[2].number, 2);
    }
}
