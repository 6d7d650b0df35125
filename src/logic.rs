//! Top-level packet dispatch.
//!
//! Every packet either belongs to an existing state (tracker update,
//! then rewrite from the state's keys) or runs the full path:
//! translation pre-pass, filter-rule evaluation, and state creation
//! with partial insertions unwound on failure.

pub(crate) mod nat;

use std::sync::Arc;

use rand::Rng;

use crate::context::{DropReason, FilterContext, FlushRequest, TcpReply};
use crate::conntrack::tcp::{self, ProxySegment, ProxyTarget, ProxyVerdict, TrackError};
use crate::conntrack::{
    sctp, KeySide, LivenessPhase, PacketRole, Peer, Phase, SctpPhase, State, StateInner,
    StateKey, StateMatch, TcpPhase, TimeoutKind,
};
use crate::eval::{self, EvalMode, RuleMatch};
use crate::packets::{Family, PacketDescriptor, Protocol, SctpHeader, SeqNum, TcpFlags};
use crate::rules::{Action, FlushScope, StatePolicy};
use crate::srcnode::{SourceKind, SourceNode, SOURCE_KINDS};

/// The engine's verdict on one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestResult {
    Pass,
    Drop(DropReason),
    /// The packet changed address family and must re-enter processing
    /// as the new family.
    Requeue(Family),
    /// Held until state synchronization acknowledges the new state.
    Defer,
    /// Consumed by the engine itself (SYN proxy, syncookies); nothing
    /// is forwarded but nothing was rejected either.
    Absorbed,
}

impl FilterContext {
    /// Tests one packet against the engine, rewriting it in place when
    /// it belongs to a translated flow.
    pub fn test_packet(&self, pd: &mut PacketDescriptor) -> TestResult {
        let mut rng = rand::thread_rng();
        let result = self.dispatch(pd, &mut rng);
        match result {
            TestResult::Pass => self.status.count_pass(),
            TestResult::Absorbed => self.status.count_absorbed(),
            TestResult::Drop(reason) => self.status.count_drop(reason),
            TestResult::Requeue(_) | TestResult::Defer => {}
        }
        result
    }

    fn dispatch<R: Rng>(&self, pd: &mut PacketDescriptor, rng: &mut R) -> TestResult {
        if let Some(found) = self.states.find(pd) {
            return self.test_state(pd, found, rng);
        }
        self.test_rules(pd, rng)
    }

    /// Updates an existing state with one packet, then rewrites the
    /// packet into the opposite translation space.
    fn test_state<R: Rng>(
        &self,
        pd: &mut PacketDescriptor,
        found: StateMatch,
        rng: &mut R,
    ) -> TestResult {
        let StateMatch { state, side, role } = found;
        let now = self.uptime();
        let src_idx = role.src_index();

        match pd.protocol {
            Protocol::Tcp => match self.track_tcp(pd, &state, role, now, rng) {
                TestResult::Pass => {}
                other => return other,
            },
            Protocol::Udp => {
                let mut inner = state.inner.lock();
                liveness(
                    &mut inner,
                    src_idx,
                    TimeoutKind::UdpSingle,
                    TimeoutKind::UdpMultiple,
                    now,
                );
            }
            Protocol::Icmp => {
                // A reply was seen; the short error timeout applies.
                let mut inner = state.inner.lock();
                inner.timeout = TimeoutKind::IcmpError;
                inner.last_active = now;
            }
            Protocol::Sctp => match self.track_sctp(pd, &state, role, now, rng) {
                TestResult::Pass => {}
                other => return other,
            },
            Protocol::Other(_) => {
                let mut inner = state.inner.lock();
                liveness(
                    &mut inner,
                    src_idx,
                    TimeoutKind::OtherSingle,
                    TimeoutKind::OtherMultiple,
                    now,
                );
            }
        }

        state.count_packet(role, u64::from(pd.tot_len));
        state.rule.counters.count_packet(u64::from(pd.tot_len));

        if state.translated() {
            let from = Arc::clone(state.key(side));
            let to = Arc::clone(state.key(side.other()));
            if let nat::Rewrite::Requeue(family) = nat::rewrite_packet(pd, &from, &to, role) {
                return TestResult::Requeue(family);
            }
        }
        TestResult::Pass
    }

    fn track_tcp<R: Rng>(
        &self,
        pd: &mut PacketDescriptor,
        state: &Arc<State>,
        role: PacketRole,
        now: u64,
        rng: &mut R,
    ) -> TestResult {
        let policy = state.rule.state;
        let (limit_node, proxying) = {
            let inner = state.inner.lock();
            (
                inner.src_nodes[SourceKind::Limit as usize].clone(),
                matches!(
                    inner.peers[0].phase,
                    Phase::Tcp(TcpPhase::ProxySrc | TcpPhase::ProxyDst)
                ),
            )
        };

        // The proxy phases consume the handshake before any tracking.
        // Syncookie states enter them too, whatever the rule's policy.
        if policy == StatePolicy::Proxy || proxying {
            let mut inner = state.inner.lock();
            let forward = role == PacketRole::Forward;
            let mut charged = false;
            let verdict = {
                let StateInner { peers, .. } = &mut *inner;
                let Some(tcp) = pd.tcp() else {
                    return TestResult::Drop(DropReason::ShortHeader);
                };
                tcp::synproxy(peers, forward, tcp, rng, || {
                    charged = true;
                    limit_node
                        .as_ref()
                        .map_or(true, |node| !self.sources.connection_limited(node, now))
                })
            };
            if charged {
                inner.established = true;
            }
            match verdict {
                ProxyVerdict::Pass => drop(inner),
                ProxyVerdict::Absorb(sends) => {
                    inner.last_active = now;
                    drop(inner);
                    self.send_proxy_segments(state, sends);
                    return TestResult::Absorbed;
                }
                ProxyVerdict::Drop => return TestResult::Drop(DropReason::BadState),
                ProxyVerdict::SourceLimit => {
                    drop(inner);
                    if let Some(node) = &limit_node {
                        self.source_overload(state, node);
                    }
                    return TestResult::Drop(DropReason::SourceLimit);
                }
            }
        }

        // A fresh SYN on a fully closed flow recycles the endpoints:
        // the old state dies and the retransmit creates a new one.
        {
            let mut inner = state.inner.lock();
            let flags = match pd.tcp() {
                Some(tcp) => tcp.flags,
                None => return TestResult::Drop(DropReason::ShortHeader),
            };
            if flags.masked(TcpFlags::SYN | TcpFlags::ACK) == TcpFlags::SYN
                && tcp::reusable(&inner.peers)
            {
                for peer in inner.peers.iter_mut() {
                    peer.phase = Phase::Tcp(TcpPhase::Closed);
                }
                drop(inner);
                log::debug!("recycling state {} for a new connection", state.id);
                self.kill_state(state);
                return TestResult::Drop(DropReason::NoState);
            }
        }

        let mut inner = state.inner.lock();
        let src_idx = role.src_index();
        let result = if policy == StatePolicy::Sloppy {
            let flags = match pd.tcp() {
                Some(tcp) => tcp.flags,
                None => return TestResult::Drop(DropReason::ShortHeader),
            };
            Ok(tcp::track_sloppy(&mut inner.peers, src_idx, flags))
        } else {
            let StateInner { peers, .. } = &mut *inner;
            let payload_len = pd.payload_len;
            let Some(tcp) = pd.tcp_mut() else {
                return TestResult::Drop(DropReason::ShortHeader);
            };
            tcp::track_full(peers, src_idx, tcp, payload_len, rng)
        };

        match result {
            Ok(tracked) => {
                if let Some(kind) = tracked.timeout {
                    inner.timeout = kind;
                    inner.last_active = now;
                }
                if tracked.established {
                    inner.established = true;
                }
                drop(inner);
                if tracked.established {
                    if let Some(node) = &limit_node {
                        if self.sources.connection_limited(node, now) {
                            self.source_overload(state, node);
                            return TestResult::Drop(DropReason::SourceLimit);
                        }
                    }
                }
                TestResult::Pass
            }
            Err(TrackError::BadState) => TestResult::Drop(DropReason::BadState),
            Err(TrackError::HandshakeMismatch { reset_seq }) => {
                drop(inner);
                if let Some(seq) = reset_seq {
                    self.rejects.send_tcp(TcpReply {
                        family: pd.family,
                        src: (pd.dst_addr, pd.dst_port),
                        dst: (pd.src_addr, pd.src_port),
                        seq,
                        ack: SeqNum::new(0),
                        flags: TcpFlags::RST,
                        window: 0,
                        mss: 0,
                    });
                }
                TestResult::Drop(DropReason::BadState)
            }
        }
    }

    fn track_sctp<R: Rng>(
        &self,
        pd: &mut PacketDescriptor,
        state: &Arc<State>,
        role: PacketRole,
        now: u64,
        rng: &mut R,
    ) -> TestResult {
        let src_idx = role.src_index();
        let Some(header) = pd.sctp().cloned() else {
            return TestResult::Drop(DropReason::ShortHeader);
        };

        let tags = {
            let mut inner = state.inner.lock();

            if sctp::has_init(&header) && sctp::reusable(&inner.peers) {
                for peer in inner.peers.iter_mut() {
                    peer.phase = Phase::Sctp(SctpPhase::Closed);
                }
                drop(inner);
                self.kill_state(state);
                return TestResult::Drop(DropReason::NoState);
            }

            match sctp::track(&mut inner.peers, src_idx, &header) {
                Ok(tracked) => {
                    if let Some(kind) = tracked.timeout {
                        inner.timeout = kind;
                    }
                    inner.last_active = now;
                }
                Err(mismatch) => {
                    log::debug!(
                        "verification tag mismatch on state {}: {:x} != {:x}",
                        state.id,
                        mismatch.got,
                        mismatch.expected
                    );
                    return TestResult::Drop(DropReason::BadState);
                }
            }
            [inner.peers[0].vtag, inner.peers[1].vtag]
        };

        let jobs = sctp::multihome_jobs(&header);
        if !jobs.is_empty() {
            self.process_multihome(pd, &header, tags, src_idx, jobs, rng);
        }
        TestResult::Pass
    }

    /// Applies ASCONF address changes: each added address gets its own
    /// state through the normal rule path with the association's
    /// verification tags copied in; removed addresses shut their flows
    /// down. Runs with no state lock held.
    fn process_multihome<R: Rng>(
        &self,
        pd: &PacketDescriptor,
        header: &SctpHeader,
        tags: [u32; 2],
        src_idx: usize,
        jobs: Vec<sctp::MultihomeOp>,
        rng: &mut R,
    ) {
        let vtag = sctp::initiate_tag(header).unwrap_or(tags[src_idx]);
        for job in jobs {
            match job {
                sctp::MultihomeOp::Add(addr) => {
                    // The packet's own source already has its state,
                    // and retransmitted ASCONFs must not spawn twins.
                    if addr == pd.src_addr
                        || self.multihome.other_sources(vtag, pd.src_addr).contains(&addr)
                    {
                        continue;
                    }
                    let mut extra = pd.clone();
                    extra.src_addr = addr;
                    extra.family = Family::of(&addr);
                    match self.test_rules(&mut extra, rng) {
                        TestResult::Pass => {
                            if let Some(found) = self.states.find(&extra) {
                                let mut inner = found.state.inner.lock();
                                inner.peers[0].vtag = tags[src_idx];
                                inner.peers[1].vtag = tags[1 - src_idx];
                            }
                            self.multihome.add(vtag, addr);
                        }
                        other => {
                            log::debug!("multihome address {addr} refused: {other:?}");
                        }
                    }
                }
                sctp::MultihomeOp::Del(addr) => {
                    let mut gone = pd.clone();
                    gone.src_addr = addr;
                    gone.family = Family::of(&addr);
                    if let Some(found) = self.states.find(&gone) {
                        let mut inner = found.state.inner.lock();
                        let idx = found.role.src_index();
                        inner.peers[idx].phase = Phase::Sctp(SctpPhase::ShutdownPending);
                        inner.timeout = TimeoutKind::TcpClosing;
                    }
                    self.multihome.detach(tags, addr);
                }
            }
        }
    }

    /// The no-state path: translation pre-pass, rule evaluation, state
    /// creation.
    fn test_rules<R: Rng>(&self, pd: &mut PacketDescriptor, rng: &mut R) -> TestResult {
        let now = self.uptime();

        // Under syncookies a SYN is answered statelessly; only an ACK
        // carrying a valid cookie reaches the ruleset.
        let mut cookie_mss = None;
        if pd.protocol == Protocol::Tcp && self.cookies.active() {
            if let Some(tcp) = pd.tcp() {
                let key = StateKey::from_packet(pd);
                let relevant =
                    tcp.flags.masked(TcpFlags::SYN | TcpFlags::ACK | TcpFlags::RST);
                if relevant == TcpFlags::SYN {
                    let mss = tcp.mss.unwrap_or(536);
                    self.rejects.send_tcp(TcpReply {
                        family: pd.family,
                        src: (pd.dst_addr, pd.dst_port),
                        dst: (pd.src_addr, pd.src_port),
                        seq: SeqNum::new(self.cookies.isn(&key, mss)),
                        ack: tcp.seq + 1,
                        flags: TcpFlags::SYN | TcpFlags::ACK,
                        window: 0,
                        mss,
                    });
                    return TestResult::Absorbed;
                } else if relevant == TcpFlags::ACK {
                    match self.cookies.check(&key, tcp.ack.raw().wrapping_sub(1)) {
                        Some(mss) => cookie_mss = Some(mss),
                        None => return TestResult::Drop(DropReason::NoState),
                    }
                }
            }
        }

        let wire_key = StateKey::from_packet(pd);
        let translation = match nat::translate(self, pd, rng) {
            Ok(translation) => translation,
            Err(reason) => return TestResult::Drop(reason),
        };
        let mut requeue = None;
        if let Some(translation) = &translation {
            // Filter rules see the translated packet.
            match nat::rewrite_packet(pd, &wire_key, &translation.stack, PacketRole::Forward)
            {
                nat::Rewrite::Done => {}
                nat::Rewrite::Requeue(family) => requeue = Some(family),
            }
        }

        let ruleset = self.rules();
        let result = eval::evaluate(&ruleset, &self.default_rule, pd, EvalMode::Filter, rng);

        // Match-rule side effects apply whatever the final verdict.
        for rule in &result.match_rules {
            rule.counters.count_packet(u64::from(pd.tot_len));
            if let Some(tag) = rule.tag_set {
                pd.tag = Some(tag);
            }
            if rule.log {
                self.decisions.record(pd, Some(rule), None);
            }
        }
        let rule = Arc::clone(&result.rule);
        rule.counters.count_packet(u64::from(pd.tot_len));
        if let Some(tag) = rule.tag_set {
            pd.tag = Some(tag);
        }

        if rule.action == Action::Block {
            self.decisions.record(pd, Some(&rule), Some(DropReason::Match));
            if rule.reject {
                self.send_return(pd);
            }
            self.unwind_translation(translation, now);
            return TestResult::Drop(DropReason::Match);
        }
        if rule.log {
            self.decisions.record(pd, Some(&rule), None);
        }

        // Translated flows always keep state: the reply needs the
        // reverse mapping.
        if rule.state == StatePolicy::None && translation.is_none() {
            return match requeue {
                Some(family) => TestResult::Requeue(family),
                None => TestResult::Pass,
            };
        }

        self.create_state(pd, wire_key, translation, result, cookie_mss, requeue, now, rng)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_state<R: Rng>(
        &self,
        pd: &mut PacketDescriptor,
        wire_key: StateKey,
        translation: Option<nat::Translation>,
        result: RuleMatch,
        cookie_mss: Option<u16>,
        requeue: Option<Family>,
        now: u64,
        rng: &mut R,
    ) -> TestResult {
        let rule = result.rule;

        if let Some(max) = rule.limits.max_states {
            if rule.counters.states.load(core::sync::atomic::Ordering::Relaxed)
                >= u64::from(max)
            {
                self.unwind_translation(translation, now);
                return TestResult::Drop(DropReason::Memory);
            }
        }

        let mut nodes: [Option<Arc<SourceNode>>; SOURCE_KINDS] = Default::default();
        if rule.limits.tracks_sources() {
            match self.sources.acquire(
                SourceKind::Limit,
                wire_key.endpoints[0].addr,
                &rule,
                now,
            ) {
                Ok(node) => nodes[SourceKind::Limit as usize] = Some(node),
                Err(err) => {
                    log::debug!(
                        "source node refused for {}: {err}",
                        wire_key.endpoints[0].addr
                    );
                    self.unwind_translation(translation, now);
                    return TestResult::Drop(DropReason::SourceLimit);
                }
            }
        }
        let nat_rule = translation.as_ref().map(|t| Arc::clone(&t.rule));
        if let Some(translation) = &translation {
            nodes[SourceKind::StickyNat as usize] = translation.sticky.clone();
        }
        if let Some(route) = &rule.route_to {
            if route.sticky {
                match self.sources.acquire(
                    SourceKind::StickyRoute,
                    wire_key.endpoints[0].addr,
                    &rule,
                    now,
                ) {
                    Ok(node) => {
                        if self.sources.pinned(&node).is_none() {
                            if let Some(addr) = route.addrs.first() {
                                self.sources.pin(&node, *addr);
                            }
                        }
                        nodes[SourceKind::StickyRoute as usize] = Some(node);
                    }
                    Err(err) => {
                        self.sources.release(&nodes, false, now);
                        log::debug!("route node refused: {err}");
                        return TestResult::Drop(DropReason::SourceLimit);
                    }
                }
            }
        }

        let wire = Arc::new(wire_key);
        let stack = match &translation {
            Some(translation) => Arc::new(translation.stack.clone()),
            None => Arc::clone(&wire),
        };

        let mut peers = [Peer::simple(), Peer::simple()];
        let mut proxy_answer = None;
        let timeout = match pd.protocol {
            Protocol::Tcp => {
                peers = [Peer::tcp_closed(), Peer::tcp_closed()];
                let payload_len = pd.payload_len;
                let Some(tcp) = pd.tcp_mut() else {
                    self.sources.release(&nodes, false, now);
                    return TestResult::Drop(DropReason::ShortHeader);
                };
                if let Some(mss) = cookie_mss {
                    // The handshake already happened statelessly; pick
                    // it up in the upstream-replay proxy phase.
                    peers[0].seqlo = tcp.seq.wrapping_sub(1);
                    peers[0].seqhi = tcp.ack.wrapping_sub(1);
                    peers[0].max_win = tcp.window.max(1);
                    peers[0].mss = mss;
                    peers[0].phase = Phase::Tcp(TcpPhase::ProxyDst);
                    peers[1].seqhi = SeqNum::new(1);
                    peers[1].max_win = 1;
                } else {
                    let modulate = rule.state == StatePolicy::Modulate;
                    tcp::init_tracking(&mut peers, tcp, payload_len, modulate, rng);
                    if rule.state == StatePolicy::Proxy
                        && tcp.flags.masked(TcpFlags::SYN | TcpFlags::ACK) == TcpFlags::SYN
                    {
                        proxy_answer = Some(tcp::proxy_init(&mut peers, tcp, rng));
                    }
                }
                TimeoutKind::TcpFirst
            }
            Protocol::Udp => {
                peers[0].phase = Phase::Simple(LivenessPhase::Single);
                TimeoutKind::UdpFirst
            }
            Protocol::Icmp => TimeoutKind::IcmpFirst,
            Protocol::Sctp => {
                peers = [Peer::sctp_closed(), Peer::sctp_closed()];
                match pd.sctp() {
                    Some(header) if sctp::has_init(header) => {
                        sctp::init_tracking(&mut peers, header);
                    }
                    // Multihome extra states get their tags copied in
                    // by the caller.
                    _ => peers[0].phase = Phase::Sctp(SctpPhase::CookieWait),
                }
                TimeoutKind::TcpFirst
            }
            Protocol::Other(_) => {
                peers[0].phase = Phase::Simple(LivenessPhase::Single);
                TimeoutKind::OtherFirst
            }
        };

        let state = Arc::new(State {
            id: self.states.alloc_id(),
            direction: pd.direction,
            interface: rule.interface.as_ref().map(|_| pd.interface),
            keys: [wire, stack],
            rule: Arc::clone(&rule),
            anchor: result.anchor,
            nat_rule,
            match_rules: result.match_rules,
            creation: now,
            inner: parking_lot::Mutex::new(StateInner {
                peers,
                timeout,
                last_active: now,
                src_nodes: nodes.clone(),
                established: false,
            }),
            packets: Default::default(),
            bytes: Default::default(),
        });
        state.count_packet(PacketRole::Forward, u64::from(pd.tot_len));

        if let Err(err) = self.states.insert(Arc::clone(&state)) {
            self.sources.release(&nodes, false, now);
            log::debug!("state insertion failed: {err:?}");
            return TestResult::Drop(DropReason::Memory);
        }

        if let Some(send) = proxy_answer {
            self.send_proxy_segments(&state, vec![send]);
            return TestResult::Absorbed;
        }
        if cookie_mss.is_some() {
            // Drive the proxy machine with the cookie ACK: it emits
            // the upstream SYN and absorbs the packet.
            let limit_node = nodes[SourceKind::Limit as usize].clone();
            let mut charged = false;
            let verdict = {
                let mut inner = state.inner.lock();
                let StateInner { peers, .. } = &mut *inner;
                let Some(tcp) = pd.tcp() else {
                    return TestResult::Drop(DropReason::ShortHeader);
                };
                tcp::synproxy(peers, true, tcp, rng, || {
                    charged = true;
                    limit_node
                        .as_ref()
                        .map_or(true, |node| !self.sources.connection_limited(node, now))
                })
            };
            if charged {
                state.inner.lock().established = true;
            }
            return match verdict {
                ProxyVerdict::Absorb(sends) => {
                    self.send_proxy_segments(&state, sends);
                    TestResult::Absorbed
                }
                ProxyVerdict::SourceLimit => {
                    if let Some(node) = &limit_node {
                        self.source_overload(&state, node);
                    }
                    TestResult::Drop(DropReason::SourceLimit)
                }
                ProxyVerdict::Pass | ProxyVerdict::Drop => {
                    TestResult::Drop(DropReason::BadState)
                }
            };
        }

        if self.sync.defer(&state) {
            return TestResult::Defer;
        }
        match requeue {
            Some(family) => TestResult::Requeue(family),
            None => TestResult::Pass,
        }
    }

    /// Gives back the sticky NAT reference when the flow never reached
    /// the state table.
    fn unwind_translation(&self, translation: Option<nat::Translation>, now: u64) {
        if let Some(nat::Translation { sticky: Some(node), .. }) = translation {
            self.sources.release(&[Some(node)], false, now);
        }
    }

    /// Addresses proxy segments from the state's keys: the client is
    /// spoken to in wire space, the server in stack space.
    fn send_proxy_segments(&self, state: &Arc<State>, sends: Vec<ProxySegment>) {
        for send in sends {
            let (key, src, dst) = match send.to {
                ProxyTarget::Client => {
                    let key = state.key(KeySide::Wire);
                    (key, key.endpoints[1], key.endpoints[0])
                }
                ProxyTarget::Server => {
                    let key = state.key(KeySide::Stack);
                    (key, key.endpoints[0], key.endpoints[1])
                }
            };
            self.rejects.send_tcp(TcpReply {
                family: key.family,
                src: (src.addr, src.port),
                dst: (dst.addr, dst.port),
                seq: send.seq,
                ack: send.ack,
                flags: send.flags,
                window: send.window,
                mss: send.mss,
            });
        }
    }

    /// Active rejection for a block rule: TCP gets a reset, everything
    /// else an administrative unreachable. Resets to a reset are never
    /// sent.
    fn send_return(&self, pd: &PacketDescriptor) {
        match pd.tcp() {
            Some(tcp) if !tcp.flags.contains(TcpFlags::RST) => {
                let mut ack = tcp.seq + pd.payload_len;
                if tcp.flags.contains(TcpFlags::SYN) {
                    ack = ack + 1;
                }
                if tcp.flags.contains(TcpFlags::FIN) {
                    ack = ack + 1;
                }
                self.rejects.send_tcp(TcpReply {
                    family: pd.family,
                    src: (pd.dst_addr, pd.dst_port),
                    dst: (pd.src_addr, pd.src_port),
                    seq: tcp.ack,
                    ack,
                    flags: TcpFlags::RST | TcpFlags::ACK,
                    window: 0,
                    mss: 0,
                });
            }
            Some(_) => {}
            None => self.rejects.send_unreachable(pd),
        }
    }

    /// A source crossed its connection limits: kill the offending
    /// state and, when configured, record the address in the overload
    /// table and queue a flush of its other states.
    fn source_overload(&self, state: &Arc<State>, node: &Arc<SourceNode>) {
        log::warn!("source {} exceeded connection limits", node.addr);
        let limits = &node.rule.limits;
        if let Some(table) = &limits.overload_table {
            self.blocked.insert(table, node.addr);
            match limits.flush {
                FlushScope::None => {}
                FlushScope::Rule => self.request_flush(FlushRequest {
                    addr: node.addr,
                    rule: Some(Arc::clone(&node.rule)),
                }),
                FlushScope::Global => {
                    self.request_flush(FlushRequest { addr: node.addr, rule: None })
                }
            }
        }
        self.kill_state(state);
    }
}

/// Liveness phases for protocols without a handshake: one packet each
/// way moves the flow to the longer bidirectional timeout.
fn liveness(
    inner: &mut StateInner,
    src_idx: usize,
    single: TimeoutKind,
    multiple: TimeoutKind,
    now: u64,
) {
    let phase = |peer: &Peer| match peer.phase {
        Phase::Simple(phase) => phase,
        _ => LivenessPhase::NoTraffic,
    };
    if phase(&inner.peers[src_idx]) < LivenessPhase::Single {
        inner.peers[src_idx].phase = Phase::Simple(LivenessPhase::Single);
    }
    // Both sides have spoken: the flow is bidirectional from here on.
    if phase(&inner.peers[1 - src_idx]) >= LivenessPhase::Single {
        inner.peers[src_idx].phase = Phase::Simple(LivenessPhase::Multiple);
        inner.peers[1 - src_idx].phase = Phase::Simple(LivenessPhase::Multiple);
    }
    inner.timeout = if inner.peers.iter().all(|p| phase(p) == LivenessPhase::Multiple) {
        multiple
    } else {
        single
    };
    inner.last_active = now;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Config, FilterContext};
    use crate::matchers::PortMatcher;
    use crate::packets::testutil::{tcp_syn, v4};
    use crate::packets::{Direction, TransportHeader};
    use crate::rules::Rule;

    fn pass_rule(dst_port: u16) -> Rule {
        Rule {
            dst_port: Some(PortMatcher { range: dst_port..=dst_port, invert: false }),
            ..Rule::default()
        }
    }

    fn block_all() -> Rule {
        Rule { action: Action::Block, state: StatePolicy::None, ..Rule::default() }
    }

    #[test]
    fn block_rule_drops_with_match_reason() {
        let ctx = FilterContext::new(Config::default());
        ctx.replace_rules(vec![block_all()]);
        let mut pd =
            tcp_syn((v4(10, 0, 0, 5), 5000), (v4(192, 0, 2, 1), 80), 1000, Direction::Out);
        assert_eq!(ctx.test_packet(&mut pd), TestResult::Drop(DropReason::Match));
        assert_eq!(ctx.status.drops(DropReason::Match), 1);
    }

    #[test]
    fn pass_rule_creates_state_and_reply_matches_it() {
        let ctx = FilterContext::new(Config::default());
        // Last match wins: the catch-all block goes first so the port
        // rule overrides it.
        ctx.replace_rules(vec![block_all(), pass_rule(80)]);

        let mut syn =
            tcp_syn((v4(10, 0, 0, 5), 5000), (v4(192, 0, 2, 1), 80), 1000, Direction::Out);
        assert_eq!(ctx.test_packet(&mut syn), TestResult::Pass);
        assert_eq!(ctx.states.count(), 1);

        // The reply traverses the state, not the (blocking) ruleset.
        let mut synack = tcp_syn(
            (v4(192, 0, 2, 1), 80),
            (v4(10, 0, 0, 5), 5000),
            7000,
            Direction::In,
        );
        if let Some(tcp) = synack.tcp_mut() {
            tcp.flags = TcpFlags::SYN | TcpFlags::ACK;
            tcp.ack = SeqNum::new(1001);
        }
        assert_eq!(ctx.test_packet(&mut synack), TestResult::Pass);
        assert_eq!(ctx.states.count(), 1);
    }

    #[test]
    fn stateless_pass_keeps_no_state() {
        let ctx = FilterContext::new(Config::default());
        ctx.replace_rules(vec![Rule { state: StatePolicy::None, ..Rule::default() }]);
        let mut pd =
            tcp_syn((v4(10, 0, 0, 5), 5000), (v4(192, 0, 2, 1), 80), 1000, Direction::Out);
        assert_eq!(ctx.test_packet(&mut pd), TestResult::Pass);
        assert_eq!(ctx.states.count(), 0);
    }

    #[test]
    fn out_of_window_packet_is_dropped_as_bad_state() {
        let ctx = FilterContext::new(Config::default());
        ctx.replace_rules(vec![pass_rule(80)]);

        let mut syn =
            tcp_syn((v4(10, 0, 0, 5), 5000), (v4(192, 0, 2, 1), 80), 1000, Direction::Out);
        assert_eq!(ctx.test_packet(&mut syn), TestResult::Pass);

        let mut wild =
            tcp_syn((v4(10, 0, 0, 5), 5000), (v4(192, 0, 2, 1), 80), 1000, Direction::Out);
        if let Some(tcp) = wild.tcp_mut() {
            tcp.flags = TcpFlags::ACK;
            tcp.seq = SeqNum::new(1000 + 0x0400_0000);
            tcp.ack = SeqNum::new(1);
        }
        wild.payload_len = 100;
        assert_eq!(ctx.test_packet(&mut wild), TestResult::Drop(DropReason::BadState));
        assert_eq!(ctx.status.drops(DropReason::BadState), 1);
    }

    #[test]
    fn udp_flow_promotes_to_the_multiple_timeout() {
        let ctx = FilterContext::new(Config::default());
        ctx.replace_rules(vec![Rule::default()]);

        let mut query =
            tcp_syn((v4(10, 0, 0, 5), 5353), (v4(192, 0, 2, 1), 53), 0, Direction::Out);
        query.protocol = Protocol::Udp;
        query.transport = TransportHeader::Udp(Default::default());
        assert_eq!(ctx.test_packet(&mut query), TestResult::Pass);

        let mut reply =
            tcp_syn((v4(192, 0, 2, 1), 53), (v4(10, 0, 0, 5), 5353), 0, Direction::In);
        reply.protocol = Protocol::Udp;
        reply.transport = TransportHeader::Udp(Default::default());
        assert_eq!(ctx.test_packet(&mut reply), TestResult::Pass);

        let found = ctx.states.find(&query).expect("state exists");
        let inner = found.state.inner.lock();
        assert_eq!(inner.timeout, TimeoutKind::UdpMultiple);
    }

    #[test]
    fn rule_state_cap_refuses_the_next_flow() {
        let ctx = FilterContext::new(Config::default());
        let mut rule = Rule::default();
        rule.limits.max_states = Some(2);
        ctx.replace_rules(vec![rule]);

        for port in [1000, 1001] {
            let mut pd = tcp_syn(
                (v4(10, 0, 0, 5), port),
                (v4(192, 0, 2, 1), 80),
                1000,
                Direction::Out,
            );
            assert_eq!(ctx.test_packet(&mut pd), TestResult::Pass);
        }
        let mut pd =
            tcp_syn((v4(10, 0, 0, 5), 1002), (v4(192, 0, 2, 1), 80), 1000, Direction::Out);
        assert_eq!(ctx.test_packet(&mut pd), TestResult::Drop(DropReason::Memory));
    }
}
