//! The bidirectional connection-tracking state table.
//!
//! Every tracked flow owns two state keys: the wire key holds the flow's
//! original, untranslated endpoints and the stack key the translated
//! view; they are the same object when no NAT applies. Keys live in one
//! hash table with a lock per bucket row; states are additionally hashed
//! by id into a second table whose row lock doubles as the state's lock
//! for teardown. Two key rows are always taken in index order and the id
//! row only after both, so concurrent insertions cannot deadlock.

pub mod tcp;
pub mod sctp;

use core::hash::{Hash, Hasher};
use core::net::IpAddr;
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::hash_map::DefaultHasher;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::packets::{Direction, Family, PacketDescriptor, Protocol, SeqNum};
use crate::rules::{Anchor, Rule};
use crate::srcnode::{SourceNode, SOURCE_KINDS};

/// The timeout class a state is currently in. The class picks the idle
/// interval from the [`Timeouts`] table; `Purge` and `Unlinked` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    TcpFirst,
    TcpOpening,
    TcpEstablished,
    TcpClosing,
    TcpFinWait,
    TcpClosed,
    UdpFirst,
    UdpSingle,
    UdpMultiple,
    IcmpFirst,
    IcmpError,
    OtherFirst,
    OtherSingle,
    OtherMultiple,
    /// Kill on the next purge pass.
    Purge,
    /// Detached from the table; the state is dead.
    Unlinked,
}

/// Idle intervals in seconds per timeout class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub tcp_first: u32,
    pub tcp_opening: u32,
    pub tcp_established: u32,
    pub tcp_closing: u32,
    pub tcp_fin_wait: u32,
    pub tcp_closed: u32,
    pub udp_first: u32,
    pub udp_single: u32,
    pub udp_multiple: u32,
    pub icmp_first: u32,
    pub icmp_error: u32,
    pub other_first: u32,
    pub other_single: u32,
    pub other_multiple: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            tcp_first: 120,
            tcp_opening: 30,
            tcp_established: 24 * 60 * 60,
            tcp_closing: 900,
            tcp_fin_wait: 45,
            tcp_closed: 90,
            udp_first: 60,
            udp_single: 30,
            udp_multiple: 60,
            icmp_first: 20,
            icmp_error: 10,
            other_first: 60,
            other_single: 30,
            other_multiple: 60,
        }
    }
}

impl Timeouts {
    pub fn get(&self, kind: TimeoutKind) -> u32 {
        match kind {
            TimeoutKind::TcpFirst => self.tcp_first,
            TimeoutKind::TcpOpening => self.tcp_opening,
            TimeoutKind::TcpEstablished => self.tcp_established,
            TimeoutKind::TcpClosing => self.tcp_closing,
            TimeoutKind::TcpFinWait => self.tcp_fin_wait,
            TimeoutKind::TcpClosed => self.tcp_closed,
            TimeoutKind::UdpFirst => self.udp_first,
            TimeoutKind::UdpSingle => self.udp_single,
            TimeoutKind::UdpMultiple => self.udp_multiple,
            TimeoutKind::IcmpFirst => self.icmp_first,
            TimeoutKind::IcmpError => self.icmp_error,
            TimeoutKind::OtherFirst => self.other_first,
            TimeoutKind::OtherSingle => self.other_single,
            TimeoutKind::OtherMultiple => self.other_multiple,
            TimeoutKind::Purge | TimeoutKind::Unlinked => 0,
        }
    }
}

/// Load thresholds for adaptive timeout scaling: above `start` live
/// states, idle intervals shrink linearly, reaching zero at `end`. The
/// exact curve is configuration, not contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveLimits {
    pub start: u32,
    pub end: u32,
}

impl Default for AdaptiveLimits {
    fn default() -> Self {
        Self { start: 6000, end: 12000 }
    }
}

/// TCP connection phases, per half. Ordering follows the handshake so
/// phase comparisons can ask "at least established".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TcpPhase {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    CloseWait,
    FinWait1,
    Closing,
    LastAck,
    FinWait2,
    TimeWait,
    /// SYN proxy: handshaking with the client, nothing sent upstream.
    ProxySrc,
    /// SYN proxy: replaying the handshake to the server.
    ProxyDst,
}

/// Liveness phases for protocols without a handshake to track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LivenessPhase {
    NoTraffic,
    Single,
    Multiple,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Tcp(TcpPhase),
    Sctp(SctpPhase),
    Simple(LivenessPhase),
}

/// SCTP association phases, per half. SCTP states share the TCP timeout
/// classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SctpPhase {
    Closed,
    CookieWait,
    Established,
    ShutdownPending,
}

/// Per-direction tracking sub-state. For TCP the sequence fields hold
/// the van-Rooij window; other protocols only use `phase`.
#[derive(Debug, Clone, Copy)]
pub struct Peer {
    /// Lowest sequence this side may still retransmit.
    pub seqlo: SeqNum,
    /// Highest sequence + window this side may send.
    pub seqhi: SeqNum,
    pub max_win: u16,
    /// Window-scale shift, present once this side has advertised one.
    pub wscale: Option<u8>,
    /// Offset added to this side's sequence numbers on the wire when
    /// modulation is active.
    pub seqdiff: u32,
    pub mss: u16,
    /// SCTP verification tag this side stamps on its packets, zero
    /// until observed.
    pub vtag: u32,
    pub phase: Phase,
}

impl Peer {
    pub fn simple() -> Self {
        Self {
            seqlo: SeqNum::new(0),
            seqhi: SeqNum::new(0),
            max_win: 0,
            wscale: None,
            seqdiff: 0,
            mss: 0,
            vtag: 0,
            phase: Phase::Simple(LivenessPhase::NoTraffic),
        }
    }

    pub fn tcp_closed() -> Self {
        Self { phase: Phase::Tcp(TcpPhase::Closed), ..Self::simple() }
    }

    pub fn sctp_closed() -> Self {
        Self { phase: Phase::Sctp(SctpPhase::Closed), ..Self::simple() }
    }
}

/// One endpoint of a state key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

/// A flow identity: family, protocol, and two endpoints oriented in the
/// state's original direction (`endpoints[0]` is the initiator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateKey {
    pub family: Family,
    pub protocol: Protocol,
    pub endpoints: [Endpoint; 2],
}

/// Which packet orientation matched a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketRole {
    /// Same orientation as the state's creating packet.
    Forward,
    Reply,
}

impl PacketRole {
    /// Peer index of the packet's sender.
    pub fn src_index(self) -> usize {
        match self {
            Self::Forward => 0,
            Self::Reply => 1,
        }
    }

    pub fn dst_index(self) -> usize {
        1 - self.src_index()
    }
}

fn hash_one<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

impl StateKey {
    pub fn from_packet(pd: &PacketDescriptor) -> Self {
        Self {
            family: pd.family,
            protocol: pd.protocol,
            endpoints: [
                Endpoint { addr: pd.src_addr, port: pd.src_port },
                Endpoint { addr: pd.dst_addr, port: pd.dst_port },
            ],
        }
    }

    /// Orientation-independent hash, so both directions of a flow land
    /// in the same bucket row.
    pub fn hash_value(&self) -> u64 {
        hash_one(&(self.family, self.protocol))
            ^ hash_one(&self.endpoints[0])
            ^ hash_one(&self.endpoints[1])
    }

    /// Whether a packet with the given endpoints belongs to this key,
    /// and in which orientation.
    pub fn match_endpoints(
        &self,
        family: Family,
        protocol: Protocol,
        src: Endpoint,
        dst: Endpoint,
    ) -> Option<PacketRole> {
        if family != self.family || protocol != self.protocol {
            return None;
        }
        if src == self.endpoints[0] && dst == self.endpoints[1] {
            Some(PacketRole::Forward)
        } else if src == self.endpoints[1] && dst == self.endpoints[0] {
            Some(PacketRole::Reply)
        } else {
            None
        }
    }

    /// Keys equal in either orientation share one bucket entry.
    fn same_flow(&self, other: &StateKey) -> bool {
        self.match_endpoints(
            other.family,
            other.protocol,
            other.endpoints[0],
            other.endpoints[1],
        )
        .is_some()
    }
}

/// The two key slots of a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySide {
    /// Untranslated view: the flow's original endpoints.
    Wire = 0,
    /// Translated view, differing from wire only under NAT.
    Stack = 1,
}

impl KeySide {
    pub fn other(self) -> Self {
        match self {
            Self::Wire => Self::Stack,
            Self::Stack => Self::Wire,
        }
    }
}

/// Mutable half of a state, guarded by its own lock nested inside the
/// table row locks.
#[derive(Debug)]
pub struct StateInner {
    /// `peers[0]` is the initiator (original source), `peers[1]` the
    /// responder.
    pub peers: [Peer; 2],
    pub timeout: TimeoutKind,
    /// Uptime seconds at the last matching packet.
    pub last_active: u64,
    /// Back-references to source nodes, one slot per kind.
    pub src_nodes: [Option<Arc<SourceNode>>; SOURCE_KINDS],
    /// A connection count was charged to the limit node; teardown owes
    /// it back. Phases alone cannot tell, a pre-handshake reset also
    /// reaches the closing phases.
    pub established: bool,
}

/// A tracked connection.
#[derive(Debug)]
pub struct State {
    pub id: u64,
    /// Direction of the creating packet.
    pub direction: Direction,
    /// Interface binding; `None` floats across interfaces.
    pub interface: Option<u32>,
    /// `[wire, stack]`; the same `Arc` twice when untranslated.
    pub keys: [Arc<StateKey>; 2],
    pub rule: Arc<Rule>,
    pub anchor: Option<Arc<Anchor>>,
    pub nat_rule: Option<Arc<Rule>>,
    pub match_rules: Vec<Arc<Rule>>,
    /// Uptime seconds at creation.
    pub creation: u64,
    pub inner: Mutex<StateInner>,
    /// Packet/byte counters per orientation.
    pub packets: [AtomicU64; 2],
    pub bytes: [AtomicU64; 2],
}

impl State {
    pub fn key(&self, side: KeySide) -> &Arc<StateKey> {
        &self.keys[side as usize]
    }

    pub fn translated(&self) -> bool {
        !Arc::ptr_eq(&self.keys[0], &self.keys[1])
    }

    pub fn count_packet(&self, role: PacketRole, bytes: u64) {
        self.packets[role.src_index()].fetch_add(1, Ordering::Relaxed);
        self.bytes[role.src_index()].fetch_add(bytes, Ordering::Relaxed);
    }

    fn accepts_interface(&self, interface: u32) -> bool {
        self.interface.map_or(true, |bound| bound == interface)
    }
}

/// When a state's idle deadline falls, given the current live-state
/// load. Above `adaptive.start` states the interval shrinks linearly,
/// hitting zero at `adaptive.end`. Rules may override both the interval
/// and the thresholds; a rule override scales by the rule's own state
/// count instead of the global one.
pub fn state_expires(
    state: &State,
    inner: &StateInner,
    timeouts: &Timeouts,
    adaptive: AdaptiveLimits,
    live_states: u64,
) -> u64 {
    let base = state
        .rule
        .timeouts
        .iter()
        .find(|(kind, _)| *kind == inner.timeout)
        .map(|&(_, secs)| secs)
        .unwrap_or_else(|| timeouts.get(inner.timeout));

    let (start, end, states) = match state.rule.adaptive {
        Some((start, end)) => {
            (start, end, state.rule.counters.states.load(Ordering::Relaxed))
        }
        None => (adaptive.start, adaptive.end, live_states),
    };

    let timeout = if end > 0 && states > u64::from(start) {
        if states >= u64::from(end) {
            0
        } else {
            u64::from(base) * (u64::from(end) - states) / u64::from(end - start)
        }
    } else {
        u64::from(base)
    };
    inner.last_active + timeout
}

/// A successful table lookup: the state, the key side the packet hit,
/// and the packet's orientation within the flow.
#[derive(Debug, Clone)]
pub struct StateMatch {
    pub state: Arc<State>,
    pub side: KeySide,
    pub role: PacketRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// Another state already owns this key on the same side and
    /// interface.
    Conflict,
    /// A state with this id already exists; the caller lost an
    /// insertion race and must discard its state.
    DuplicateId,
    /// The table is at its configured capacity.
    TableFull,
}

/// One key-hash bucket entry: a shared key plus the states attached to
/// it on each side.
#[derive(Debug)]
struct KeyEntry {
    key: Arc<StateKey>,
    states: [Vec<Arc<State>>; 2],
}

/// Everything a torn-down state still owes the rest of the engine:
/// source-node references to release outside the table locks.
#[derive(Debug)]
pub struct Unlinked {
    pub nodes: [Option<Arc<SourceNode>>; SOURCE_KINDS],
    /// A connection count was charged while the state lived; release
    /// owes it back.
    pub established: bool,
}

pub struct StateTable {
    key_rows: Vec<Mutex<Vec<KeyEntry>>>,
    id_rows: Vec<Mutex<Vec<Arc<State>>>>,
    limit: usize,
    count: AtomicU64,
    next_id: AtomicU64,
    pub inserts: AtomicU64,
    pub removals: AtomicU64,
    pub searches: AtomicU64,
}

impl StateTable {
    /// Row counts must be powers of two; the row index is a bit mask.
    pub fn new(key_rows: usize, id_rows: usize, limit: usize) -> Self {
        assert!(key_rows.is_power_of_two() && id_rows.is_power_of_two());
        Self {
            key_rows: (0..key_rows).map(|_| Mutex::new(Vec::new())).collect(),
            id_rows: (0..id_rows).map(|_| Mutex::new(Vec::new())).collect(),
            limit,
            count: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            inserts: AtomicU64::new(0),
            removals: AtomicU64::new(0),
            searches: AtomicU64::new(0),
        }
    }

    pub fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Live state count.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn id_row_count(&self) -> usize {
        self.id_rows.len()
    }

    /// The states currently linked into one id row. Purge scans rows
    /// this way and decides expiry without holding the row lock.
    pub fn id_row_snapshot(&self, row: usize) -> Vec<Arc<State>> {
        self.id_rows[row].lock().clone()
    }

    fn key_row(&self, key: &StateKey) -> usize {
        (key.hash_value() as usize) & (self.key_rows.len() - 1)
    }

    fn id_row(&self, id: u64) -> usize {
        (hash_one(&id) as usize) & (self.id_rows.len() - 1)
    }

    /// Runs `f` with the wire-key row and, when distinct, the stack-key
    /// row, locking the lower-indexed row first.
    fn with_key_rows<R>(
        &self,
        wire_row: usize,
        stack_row: usize,
        f: impl FnOnce(&mut Vec<KeyEntry>, Option<&mut Vec<KeyEntry>>) -> R,
    ) -> R {
        if wire_row == stack_row {
            let mut row = self.key_rows[wire_row].lock();
            f(&mut row, None)
        } else {
            let (lo, hi) = if wire_row < stack_row {
                (wire_row, stack_row)
            } else {
                (stack_row, wire_row)
            };
            let mut lo_guard: MutexGuard<'_, Vec<KeyEntry>> = self.key_rows[lo].lock();
            let mut hi_guard: MutexGuard<'_, Vec<KeyEntry>> = self.key_rows[hi].lock();
            if wire_row < stack_row {
                f(&mut lo_guard, Some(&mut hi_guard))
            } else {
                f(&mut hi_guard, Some(&mut lo_guard))
            }
        }
    }

    /// Finds the state a packet belongs to. The side matched tells the
    /// caller which translation space the packet is in: a wire-side hit
    /// carries untranslated endpoints, a stack-side hit translated ones.
    /// The direction-preferred side is tried first; the other side
    /// covers the NAT'd half of a translated flow.
    pub fn find(&self, pd: &PacketDescriptor) -> Option<StateMatch> {
        self.searches.fetch_add(1, Ordering::Relaxed);
        let probe = StateKey::from_packet(pd);
        let src = probe.endpoints[0];
        let dst = probe.endpoints[1];
        let row = self.key_rows[self.key_row(&probe)].lock();

        let order = match pd.direction {
            Direction::In => [KeySide::Wire, KeySide::Stack],
            Direction::Out => [KeySide::Stack, KeySide::Wire],
        };
        for entry in row.iter() {
            let Some(role) = entry.key.match_endpoints(pd.family, pd.protocol, src, dst)
            else {
                continue;
            };
            for side in order {
                for state in &entry.states[side as usize] {
                    if !state.accepts_interface(pd.interface) {
                        continue;
                    }
                    if state.inner.lock().timeout == TimeoutKind::Unlinked {
                        continue;
                    }
                    // The probe matched this entry's key; reorient the
                    // role against the state's own key for that side.
                    let role = state.key(side)
                        .match_endpoints(pd.family, pd.protocol, src, dst)
                        .unwrap_or(role);
                    return Some(StateMatch { state: state.clone(), side, role });
                }
            }
        }
        None
    }

    /// Whether any live state uses `key` on either side; NAT port
    /// allocation probes candidate translations with this.
    pub fn contains_key(&self, key: &StateKey) -> bool {
        let row = self.key_rows[self.key_row(key)].lock();
        row.iter().any(|entry| {
            entry.key.same_flow(key)
                && entry.states.iter().flatten().any(|state| {
                    state.inner.lock().timeout != TimeoutKind::Unlinked
                })
        })
    }

    /// Links a state into both key rows and the id row. Both key rows
    /// are updated before the id row is touched, so a concurrent lookup
    /// either sees the state on both keys or not at all through the id
    /// table.
    pub fn insert(&self, state: Arc<State>) -> Result<(), InsertError> {
        if self.count.load(Ordering::Relaxed) >= self.limit as u64 {
            return Err(InsertError::TableFull);
        }
        let wire_row = self.key_row(state.key(KeySide::Wire));
        let stack_row = self.key_row(state.key(KeySide::Stack));
        let distinct = state.translated();

        self.with_key_rows(wire_row, stack_row, |wire, stack| {
            attach(wire, state.key(KeySide::Wire), KeySide::Wire, &state)?;
            if distinct {
                // Distinct keys can still hash to the same row.
                let result = match stack {
                    Some(stack) => {
                        attach(stack, state.key(KeySide::Stack), KeySide::Stack, &state)
                    }
                    None => attach(wire, state.key(KeySide::Stack), KeySide::Stack, &state),
                };
                if let Err(e) = result {
                    detach(wire, &state, KeySide::Wire);
                    return Err(e);
                }
            } else {
                // Untranslated states share one key object; the stack
                // side rides the same entry.
                attach_same(wire, state.key(KeySide::Wire), &state);
            }
            Ok(())
        })?;

        let id_row = self.id_row(state.id);
        let mut row = self.id_rows[id_row].lock();
        if row.iter().any(|existing| existing.id == state.id) {
            drop(row);
            self.detach_keys(&state);
            return Err(InsertError::DuplicateId);
        }
        row.push(state.clone());
        drop(row);

        self.count.fetch_add(1, Ordering::Relaxed);
        self.inserts.fetch_add(1, Ordering::Relaxed);
        state.rule.counters.states.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Unlinks a state: terminal timeout and id-row removal first (under
    /// the id row lock), key detachment after. Returns `None` when
    /// another thread already unlinked it. The returned source-node
    /// references must be released by the caller, outside these locks.
    pub fn unlink(&self, state: &Arc<State>) -> Option<Unlinked> {
        let id_row = self.id_row(state.id);
        let mut row = self.id_rows[id_row].lock();
        let mut inner = state.inner.lock();
        if inner.timeout == TimeoutKind::Unlinked {
            return None;
        }
        inner.timeout = TimeoutKind::Unlinked;
        let established = inner.established;
        let mut nodes: [Option<Arc<SourceNode>>; SOURCE_KINDS] = Default::default();
        for (slot, node) in nodes.iter_mut().zip(inner.src_nodes.iter_mut()) {
            *slot = node.take();
        }
        drop(inner);
        row.retain(|other| !Arc::ptr_eq(other, state));
        drop(row);

        self.detach_keys(state);
        state.rule.counters.states.fetch_sub(1, Ordering::Relaxed);
        self.count.fetch_sub(1, Ordering::Relaxed);
        self.removals.fetch_add(1, Ordering::Relaxed);
        Some(Unlinked { nodes, established })
    }

    fn detach_keys(&self, state: &Arc<State>) {
        let wire_row = self.key_row(state.key(KeySide::Wire));
        let stack_row = self.key_row(state.key(KeySide::Stack));
        self.with_key_rows(wire_row, stack_row, |wire, stack| {
            match stack {
                Some(stack) => {
                    detach(wire, state, KeySide::Wire);
                    detach(stack, state, KeySide::Stack);
                }
                None => {
                    detach(wire, state, KeySide::Wire);
                    detach(wire, state, KeySide::Stack);
                }
            }
        });
    }
}

/// Attaches `state` to `key`'s entry in `row` on `side`, sharing an
/// existing key object when the flow is already present. A live state
/// bound to an overlapping interface on the same side is a conflict.
fn attach(
    row: &mut Vec<KeyEntry>,
    key: &Arc<StateKey>,
    side: KeySide,
    state: &Arc<State>,
) -> Result<(), InsertError> {
    if let Some(entry) = row.iter_mut().find(|entry| entry.key.same_flow(key)) {
        let conflict = entry.states[side as usize].iter().any(|other| {
            other.inner.lock().timeout != TimeoutKind::Unlinked
                && match (other.interface, state.interface) {
                    (None, _) | (_, None) => true,
                    (Some(a), Some(b)) => a == b,
                }
        });
        if conflict {
            return Err(InsertError::Conflict);
        }
        entry.states[side as usize].push(state.clone());
        return Ok(());
    }
    let mut states: [Vec<Arc<State>>; 2] = [Vec::new(), Vec::new()];
    states[side as usize].push(state.clone());
    row.push(KeyEntry { key: key.clone(), states });
    Ok(())
}

/// Attaches the stack side of an untranslated state to the entry its
/// wire side just landed in.
fn attach_same(row: &mut Vec<KeyEntry>, key: &Arc<StateKey>, state: &Arc<State>) {
    if let Some(entry) = row.iter_mut().find(|entry| entry.key.same_flow(key)) {
        entry.states[KeySide::Stack as usize].push(state.clone());
    }
}

/// Removes `state` from its entry on `side`, dropping the entry once no
/// state references the key from either side.
fn detach(row: &mut Vec<KeyEntry>, state: &Arc<State>, side: KeySide) {
    row.retain_mut(|entry| {
        entry.states[side as usize].retain(|other| !Arc::ptr_eq(other, state));
        !entry.states[0].is_empty() || !entry.states[1].is_empty()
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::testutil::{tcp_syn, v4};
    use assert_matches::assert_matches;

    fn key(src: (IpAddr, u16), dst: (IpAddr, u16)) -> Arc<StateKey> {
        Arc::new(StateKey {
            family: Family::V4,
            protocol: Protocol::Tcp,
            endpoints: [
                Endpoint { addr: src.0, port: src.1 },
                Endpoint { addr: dst.0, port: dst.1 },
            ],
        })
    }

    fn state(id: u64, wire: Arc<StateKey>, stack: Arc<StateKey>) -> Arc<State> {
        Arc::new(State {
            id,
            direction: Direction::Out,
            interface: None,
            keys: [wire, stack],
            rule: Arc::new(Rule::default()),
            anchor: None,
            nat_rule: None,
            match_rules: Vec::new(),
            creation: 0,
            inner: Mutex::new(StateInner {
                peers: [Peer::tcp_closed(), Peer::tcp_closed()],
                timeout: TimeoutKind::TcpFirst,
                last_active: 0,
                src_nodes: Default::default(),
                established: false,
            }),
            packets: [AtomicU64::new(0), AtomicU64::new(0)],
            bytes: [AtomicU64::new(0), AtomicU64::new(0)],
        })
    }

    fn table() -> StateTable {
        StateTable::new(64, 64, 1000)
    }

    fn client() -> (IpAddr, u16) {
        (v4(10, 0, 0, 5), 5000)
    }

    fn server() -> (IpAddr, u16) {
        (v4(192, 0, 2, 1), 80)
    }

    fn nat() -> (IpAddr, u16) {
        (v4(203, 0, 113, 9), 40000)
    }

    #[test]
    fn untranslated_round_trip() {
        let table = table();
        let k = key(client(), server());
        table.insert(state(1, k.clone(), k)).unwrap();

        let pd = tcp_syn(client(), server(), 1, Direction::Out);
        let hit = table.find(&pd).unwrap();
        assert_eq!(hit.role, PacketRole::Forward);

        // The reply locates the same state with direction flipped.
        let pd = tcp_syn(server(), client(), 2, Direction::In);
        let hit = table.find(&pd).unwrap();
        assert_eq!(hit.role, PacketRole::Reply);
        assert_eq!(hit.state.id, 1);
    }

    #[test]
    fn translated_flow_matches_both_spaces() {
        let table = table();
        let wire = key(client(), server());
        let stack = key(nat(), server());
        table.insert(state(7, wire, stack)).unwrap();

        // The original outbound packet carries untranslated endpoints.
        let pd = tcp_syn(client(), server(), 1, Direction::Out);
        let hit = table.find(&pd).unwrap();
        assert_eq!(hit.side, KeySide::Wire);
        assert_eq!(hit.role, PacketRole::Forward);

        // The inbound reply is addressed to the translated endpoint.
        let pd = tcp_syn(server(), nat(), 2, Direction::In);
        let hit = table.find(&pd).unwrap();
        assert_eq!(hit.side, KeySide::Stack);
        assert_eq!(hit.role, PacketRole::Reply);
        assert_eq!(hit.state.id, 7);
    }

    #[test]
    fn duplicate_id_loser_unwinds() {
        let table = table();
        let k = key(client(), server());
        table.insert(state(3, k.clone(), k.clone())).unwrap();

        let other = key(client(), (v4(198, 51, 100, 1), 25));
        assert_matches!(
            table.insert(state(3, other.clone(), other)),
            Err(InsertError::DuplicateId)
        );
        // The loser's keys are gone again.
        let pd = tcp_syn(client(), (v4(198, 51, 100, 1), 25), 1, Direction::Out);
        assert!(table.find(&pd).is_none());
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn same_key_same_interface_conflicts() {
        let table = table();
        let k = key(client(), server());
        table.insert(state(1, k.clone(), k.clone())).unwrap();
        assert_matches!(table.insert(state(2, k.clone(), k)), Err(InsertError::Conflict));
    }

    #[test]
    fn table_limit_is_enforced() {
        let table = StateTable::new(4, 4, 1);
        let k = key(client(), server());
        table.insert(state(1, k.clone(), k)).unwrap();
        let other = key(client(), (v4(198, 51, 100, 1), 25));
        assert_matches!(
            table.insert(state(2, other.clone(), other)),
            Err(InsertError::TableFull)
        );
    }

    #[test]
    fn unlink_is_terminal_and_idempotent() {
        let table = table();
        let k = key(client(), server());
        let s = state(1, k.clone(), k);
        table.insert(s.clone()).unwrap();

        assert!(table.unlink(&s).is_some());
        assert_eq!(s.inner.lock().timeout, TimeoutKind::Unlinked);
        assert!(table.unlink(&s).is_none());

        let pd = tcp_syn(client(), server(), 1, Direction::Out);
        assert!(table.find(&pd).is_none());
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn unlink_owes_a_connection_only_when_one_was_charged() {
        let table = table();
        let k = key(client(), server());
        let s = state(1, k.clone(), k.clone());
        table.insert(s.clone()).unwrap();

        // A pre-handshake reset walks the phases into TimeWait without
        // a connection ever being counted.
        {
            let mut inner = s.inner.lock();
            for peer in inner.peers.iter_mut() {
                peer.phase = Phase::Tcp(TcpPhase::TimeWait);
            }
        }
        assert!(!table.unlink(&s).unwrap().established);

        let s = state(2, k.clone(), k);
        table.insert(s.clone()).unwrap();
        s.inner.lock().established = true;
        assert!(table.unlink(&s).unwrap().established);
    }

    #[test]
    fn contains_key_sees_both_sides() {
        let table = table();
        let wire = key(client(), server());
        let stack = key(nat(), server());
        table.insert(state(1, wire, stack)).unwrap();
        assert!(table.contains_key(&key(nat(), server())));
        assert!(table.contains_key(&key(server(), nat())));
        assert!(!table.contains_key(&key(nat(), (v4(8, 8, 8, 8), 53))));
    }

    #[test]
    fn adaptive_timeout_scales_down_under_load() {
        let timeouts = Timeouts::default();
        let adaptive = AdaptiveLimits { start: 100, end: 200 };
        let k = key(client(), server());
        let s = state(1, k.clone(), k);
        let mut inner = StateInner {
            peers: [Peer::tcp_closed(), Peer::tcp_closed()],
            timeout: TimeoutKind::TcpEstablished,
            last_active: 1000,
            src_nodes: Default::default(),
            established: false,
        };

        // Below start: the full interval.
        assert_eq!(
            state_expires(&s, &inner, &timeouts, adaptive, 50),
            1000 + u64::from(timeouts.tcp_established)
        );
        // Halfway between start and end: half the interval.
        assert_eq!(
            state_expires(&s, &inner, &timeouts, adaptive, 150),
            1000 + u64::from(timeouts.tcp_established) / 2
        );
        // At or past end: expires immediately.
        assert_eq!(state_expires(&s, &inner, &timeouts, adaptive, 200), 1000);

        // Terminal classes expire immediately regardless of load.
        inner.timeout = TimeoutKind::Purge;
        assert_eq!(state_expires(&s, &inner, &timeouts, adaptive, 0), 1000);
    }
}
