//! Engine-wide shared state: rulesets, tables, configuration, status
//! counters, the clock, and the collaborator traits the engine calls
//! out through. One `FilterContext` corresponds to one filtering
//! namespace.

use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::conntrack::sctp::MultihomeMap;
use crate::conntrack::{AdaptiveLimits, State, StateKey, StateTable, Timeouts};
use crate::packets::{Family, PacketDescriptor, SeqNum, TcpFlags};
use crate::rules::{Rule, Ruleset, StatePolicy};
use crate::srcnode::SourceTracker;

/// Why a packet was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DropReason {
    /// A block rule matched.
    #[error("blocked by rule")]
    Match,
    #[error("transport header truncated")]
    ShortHeader,
    #[error("bad checksum")]
    BadChecksum,
    #[error("fragment refused by policy")]
    FragmentPolicy,
    #[error("no matching state")]
    NoState,
    #[error("packet outside tracked windows")]
    BadState,
    #[error("table full or allocation refused")]
    Memory,
    #[error("source limit exceeded")]
    SourceLimit,
    #[error("translation failed")]
    Translate,
    #[error("forbidden IP options")]
    IpOptions,
    #[error("normalizer refused the packet")]
    Normalizer,
}

impl DropReason {
    pub(crate) const COUNT: usize = 11;

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Match => 0,
            Self::ShortHeader => 1,
            Self::BadChecksum => 2,
            Self::FragmentPolicy => 3,
            Self::NoState => 4,
            Self::BadState => 5,
            Self::Memory => 6,
            Self::SourceLimit => 7,
            Self::Translate => 8,
            Self::IpOptions => 9,
            Self::Normalizer => 10,
        }
    }
}

/// Monotonic engine time in whole seconds. Timeout math is second
/// granular, as are the configuration units.
pub trait TimeSource: Send + Sync {
    fn uptime(&self) -> u64;
}

/// Real clock: seconds since the context was created.
#[derive(Debug)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl TimeSource for MonotonicClock {
    fn uptime(&self) -> u64 {
        self.start.elapsed().as_secs()
    }
}

/// Settable clock for tests and simulation.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<u64>,
}

impl ManualClock {
    pub fn set(&self, now: u64) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, seconds: u64) {
        *self.now.lock() += seconds;
    }
}

impl TimeSource for ManualClock {
    fn uptime(&self) -> u64 {
        *self.now.lock()
    }
}

// Shared clock handles, so a test can keep one end and hand the other
// to the context.
impl<T: TimeSource + ?Sized> TimeSource for Arc<T> {
    fn uptime(&self) -> u64 {
        (**self).uptime()
    }
}

/// Receives one record per logged rule match and per drop. The sink
/// formats and stores; the engine only reports.
pub trait DecisionLog: Send + Sync {
    fn record(
        &self,
        pd: &PacketDescriptor,
        rule: Option<&Arc<Rule>>,
        dropped: Option<DropReason>,
    );
}

/// A TCP segment the engine wants synthesized and sent, for active
/// rejection and the SYN proxy. Addressing is explicit since the
/// segment may not be a straight reply to the triggering packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpReply {
    pub family: Family,
    pub src: (IpAddr, u16),
    pub dst: (IpAddr, u16),
    pub seq: SeqNum,
    pub ack: SeqNum,
    pub flags: TcpFlags,
    pub window: u16,
    /// MSS option value, zero for none.
    pub mss: u16,
}

/// Emits synthesized packets. Implementations own the I/O path, which
/// is out of scope here.
pub trait RejectSink: Send + Sync {
    fn send_tcp(&self, reply: TcpReply);
    /// ICMP destination-unreachable (administratively prohibited) in
    /// reply to `pd`.
    fn send_unreachable(&self, pd: &PacketDescriptor);
}

/// Cluster state synchronization. A freshly created state may need to
/// reach a peer before its first packet is released.
pub trait StateSync: Send + Sync {
    /// Whether the creating packet must be deferred until the peer
    /// acknowledges the state.
    fn defer(&self, state: &Arc<State>) -> bool;
}

/// Stateless SYN cookies. The derivation is opaque; the engine only
/// asks for an ISN and later validates the echoed cookie.
pub trait SynCookies: Send + Sync {
    /// Whether cookies are engaged, typically under SYN flood.
    fn active(&self) -> bool;
    /// The cookie ISN for a new flow, encoding `mss`.
    fn isn(&self, key: &StateKey, mss: u16) -> u32;
    /// Validates an ACK against the cookie; returns the encoded MSS.
    fn check(&self, key: &StateKey, ack: u32) -> Option<u16>;
}

/// Inert defaults for all collaborator seams.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCollaborators;

impl DecisionLog for NullCollaborators {
    fn record(
        &self,
        _pd: &PacketDescriptor,
        _rule: Option<&Arc<Rule>>,
        _dropped: Option<DropReason>,
    ) {
    }
}

impl RejectSink for NullCollaborators {
    fn send_tcp(&self, _reply: TcpReply) {}
    fn send_unreachable(&self, _pd: &PacketDescriptor) {}
}

impl StateSync for NullCollaborators {
    fn defer(&self, _state: &Arc<State>) -> bool {
        false
    }
}

impl SynCookies for NullCollaborators {
    fn active(&self) -> bool {
        false
    }
    fn isn(&self, _key: &StateKey, _mss: u16) -> u32 {
        0
    }
    fn check(&self, _key: &StateKey, _ack: u32) -> Option<u16> {
        None
    }
}

/// Engine sizing and timing knobs. Row counts must be powers of two.
#[derive(Debug, Clone)]
pub struct Config {
    pub state_key_rows: usize,
    pub state_id_rows: usize,
    pub state_limit: usize,
    pub source_rows: usize,
    pub source_limit: usize,
    /// Seconds an empty source node lingers before the sweep frees it.
    pub source_idle: u32,
    pub timeouts: Timeouts,
    pub adaptive: AdaptiveLimits,
    /// Fraction of the id-hash rows each purge tick visits.
    pub purge_fraction: usize,
    /// Seconds between purge ticks.
    pub purge_interval: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_key_rows: 32768,
            state_id_rows: 32768,
            state_limit: 100_000,
            source_rows: 32768,
            source_limit: 10_000,
            source_idle: 15,
            timeouts: Timeouts::default(),
            adaptive: AdaptiveLimits::default(),
            purge_fraction: 10,
            purge_interval: 10,
        }
    }
}

/// Per-reason drop counters plus the aggregate verdict counters.
#[derive(Debug, Default)]
pub struct Status {
    drops: [AtomicU64; DropReason::COUNT],
    passes: AtomicU64,
    absorbed: AtomicU64,
}

impl Status {
    pub fn count_drop(&self, reason: DropReason) {
        self.drops[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_pass(&self) {
        self.passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_absorbed(&self) {
        self.absorbed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn drops(&self, reason: DropReason) -> u64 {
        self.drops[reason.index()].load(Ordering::Relaxed)
    }

    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    pub fn absorbed(&self) -> u64 {
        self.absorbed.load(Ordering::Relaxed)
    }
}

/// Addresses recorded by source-limit overload, per named table. Rules
/// elsewhere may match against a table to block the offenders.
#[derive(Debug, Default)]
pub struct BlockTable {
    tables: Mutex<HashMap<String, HashSet<IpAddr>>>,
}

impl BlockTable {
    pub fn insert(&self, table: &str, addr: IpAddr) -> bool {
        self.tables.lock().entry(table.to_string()).or_default().insert(addr)
    }

    pub fn contains(&self, table: &str, addr: IpAddr) -> bool {
        self.tables.lock().get(table).is_some_and(|set| set.contains(&addr))
    }

    pub fn clear(&self, table: &str) {
        self.tables.lock().remove(table);
    }
}

/// A deferred request to kill states, drained by the purge task.
#[derive(Debug, Clone)]
pub struct FlushRequest {
    /// Kill states whose wire source is this address.
    pub addr: IpAddr,
    /// Restrict to states created by this rule; `None` flushes the
    /// address globally.
    pub rule: Option<Arc<Rule>>,
}

/// Shared engine state for one filtering namespace.
pub struct FilterContext {
    pub config: Config,
    rules: RwLock<Arc<Ruleset>>,
    nat_rules: RwLock<Arc<Ruleset>>,
    /// Matched when no rule does; passes and keeps no state.
    pub default_rule: Arc<Rule>,
    pub states: StateTable,
    pub sources: SourceTracker,
    pub multihome: MultihomeMap,
    pub blocked: BlockTable,
    pub status: Status,
    /// Rulesets replaced by a reload; rules stay alive until no state
    /// references them and the purge sweep retires them.
    retired: Mutex<Vec<Arc<Ruleset>>>,
    flush_queue: Mutex<Vec<FlushRequest>>,
    clock: Box<dyn TimeSource>,
    pub decisions: Box<dyn DecisionLog>,
    pub rejects: Box<dyn RejectSink>,
    pub sync: Box<dyn StateSync>,
    pub cookies: Box<dyn SynCookies>,
}

impl FilterContext {
    pub fn new(config: Config) -> Self {
        let states =
            StateTable::new(config.state_key_rows, config.state_id_rows, config.state_limit);
        let sources =
            SourceTracker::new(config.source_rows, config.source_limit, config.source_idle);
        Self {
            config,
            rules: RwLock::new(Arc::new(Ruleset::new(Vec::new()))),
            nat_rules: RwLock::new(Arc::new(Ruleset::new(Vec::new()))),
            default_rule: Arc::new(Rule { state: StatePolicy::None, ..Rule::default() }),
            states,
            sources,
            multihome: MultihomeMap::default(),
            blocked: BlockTable::default(),
            status: Status::default(),
            retired: Mutex::new(Vec::new()),
            flush_queue: Mutex::new(Vec::new()),
            clock: Box::new(MonotonicClock::default()),
            decisions: Box::new(NullCollaborators),
            rejects: Box::new(NullCollaborators),
            sync: Box::new(NullCollaborators),
            cookies: Box::new(NullCollaborators),
        }
    }

    pub fn with_clock(mut self, clock: impl TimeSource + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_decision_log(mut self, log: impl DecisionLog + 'static) -> Self {
        self.decisions = Box::new(log);
        self
    }

    pub fn with_reject_sink(mut self, sink: impl RejectSink + 'static) -> Self {
        self.rejects = Box::new(sink);
        self
    }

    pub fn with_state_sync(mut self, sync: impl StateSync + 'static) -> Self {
        self.sync = Box::new(sync);
        self
    }

    pub fn with_syn_cookies(mut self, cookies: impl SynCookies + 'static) -> Self {
        self.cookies = Box::new(cookies);
        self
    }

    pub fn uptime(&self) -> u64 {
        self.clock.uptime()
    }

    /// The active filter ruleset; a cheap clone for the packet path.
    pub fn rules(&self) -> Arc<Ruleset> {
        Arc::clone(&self.rules.read())
    }

    pub fn nat_rules(&self) -> Arc<Ruleset> {
        Arc::clone(&self.nat_rules.read())
    }

    /// Atomically swaps the filter ruleset. In-flight evaluations keep
    /// their snapshot; the old set joins the retired list so states
    /// created under it keep valid rule references until they die.
    pub fn replace_rules(&self, rules: Vec<Rule>) {
        let fresh = Arc::new(Ruleset::new(rules));
        let old = {
            let mut active = self.rules.write();
            core::mem::replace(&mut *active, fresh)
        };
        self.retired.lock().push(old);
    }

    pub fn replace_nat_rules(&self, rules: Vec<Rule>) {
        let fresh = Arc::new(Ruleset::new(rules));
        let old = {
            let mut active = self.nat_rules.write();
            core::mem::replace(&mut *active, fresh)
        };
        self.retired.lock().push(old);
    }

    /// Queues a source flush for the purge task.
    pub fn request_flush(&self, request: FlushRequest) {
        self.flush_queue.lock().push(request);
    }

    pub(crate) fn drain_flush_queue(&self) -> Vec<FlushRequest> {
        core::mem::take(&mut *self.flush_queue.lock())
    }

    /// Runs `keep` over the retired rulesets, dropping the ones it
    /// rejects. Used by the purge sweep once no rule in a set is
    /// referenced.
    pub(crate) fn retain_retired(&self, keep: impl FnMut(&Arc<Ruleset>) -> bool) {
        self.retired.lock().retain(keep);
    }

    #[cfg(test)]
    pub(crate) fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }
}
