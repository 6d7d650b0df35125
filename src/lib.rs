//! Stateful packet filtering.
//!
//! The engine evaluates parsed packet descriptors against a skip-step
//! optimized ruleset with nested anchors, keeps per-flow state with
//! full TCP sequence tracking, translates addresses with incremental
//! checksum repair, and rate-limits sources. The embedding stack hands
//! each packet to [`FilterContext::test_packet`] and applies the
//! verdict and any in-place header rewrites.

mod checksum;
mod conntrack;
mod context;
mod eval;
mod logic;
mod matchers;
mod packets;
mod purge;
mod rules;
mod srcnode;

pub use conntrack::{
    state_expires, AdaptiveLimits, Endpoint, InsertError, KeySide, LivenessPhase, PacketRole,
    Peer, Phase, SctpPhase, State, StateKey, StateMatch, StateTable, TcpPhase, TimeoutKind,
    Timeouts,
};
pub use context::{
    BlockTable, Config, DecisionLog, DropReason, FilterContext, FlushRequest, ManualClock,
    MonotonicClock, NullCollaborators, RejectSink, StateSync, Status, SynCookies, TcpReply,
    TimeSource,
};
pub use eval::{evaluate, EvalMode, RuleMatch, ANCHOR_STACK_DEPTH};
pub use logic::TestResult;
pub use matchers::{
    AddressMatcher, AddressMatcherType, FlagMatcher, InterfaceMatcher, Matcher, PortMatcher,
    Subnet, SubnetError,
};
pub use packets::{
    Direction, Family, IcmpHeader, PacketDescriptor, Protocol, SctpChunk, SctpHeader, SeqNum,
    TcpFlags, TcpSegment, TransportHeader, UdpHeader,
};
pub use purge::{spawn, PurgeHandle, Purger};
pub use rules::{
    Action, Anchor, AnchorRef, ConnRate, FlushScope, NatKind, NatSpec, RoutePool, Rule,
    RuleCounters, Ruleset, SourceLimits, StatePolicy,
};
pub use srcnode::{SourceError, SourceKind, SourceNode, SourceTracker};
