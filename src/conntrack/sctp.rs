//! SCTP association tracking.
//!
//! An association is identified by the verification tags each side
//! stamps on its packets: the INIT's initiate tag is captured for the
//! responder at creation and each side's own tag is learned from its
//! first nonzero wire tag, after which a mismatch drops the packet.
//! ASCONF chunks extend or retract the source addresses allowed to
//! participate in the association; they are scanned into jobs that the
//! engine processes after all state locks are released.

use std::collections::HashMap;
use std::net::IpAddr;

use parking_lot::Mutex;

use crate::conntrack::{Peer, Phase, SctpPhase, TimeoutKind};
use crate::packets::{SctpChunk, SctpHeader};

/// Outcome of tracking one SCTP packet against an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SctpResult {
    /// New timeout class when a chunk moved the phase; `None` keeps the
    /// current class. The deadline is refreshed either way.
    pub timeout: Option<TimeoutKind>,
}

/// Verification tag mismatch against the learned tag for the sender's
/// side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VtagMismatch {
    pub expected: u32,
    pub got: u32,
}

fn sctp_phase(peer: &Peer) -> SctpPhase {
    match peer.phase {
        Phase::Sctp(phase) => phase,
        _ => SctpPhase::Closed,
    }
}

fn advance(peer: &mut Peer, at_least: SctpPhase) -> bool {
    if sctp_phase(peer) < at_least {
        peer.phase = Phase::Sctp(at_least);
        true
    } else {
        false
    }
}

/// Initializes both halves from the association's first packet, which
/// carries the INIT. The initiate tag is the tag the responder will
/// stamp on its replies.
pub fn init_tracking(peers: &mut [Peer; 2], header: &SctpHeader) {
    peers[0].phase = Phase::Sctp(SctpPhase::CookieWait);
    peers[1].phase = Phase::Sctp(SctpPhase::Closed);
    if let Some(tag) = initiate_tag(header) {
        peers[1].vtag = tag;
    }
}

/// The initiate tag of the first INIT or INIT-ACK chunk, if any.
pub fn initiate_tag(header: &SctpHeader) -> Option<u32> {
    header.chunks.iter().find_map(|chunk| match chunk {
        SctpChunk::Init { initiate_tag } | SctpChunk::InitAck { initiate_tag } => {
            Some(*initiate_tag)
        }
        _ => None,
    })
}

pub fn has_init(header: &SctpHeader) -> bool {
    header.chunks.iter().any(|c| matches!(c, SctpChunk::Init { .. }))
}

/// Whether a fresh INIT may recycle this association's endpoints: both
/// halves must be shut down or never established.
pub fn reusable(peers: &[Peer; 2]) -> bool {
    peers.iter().all(|peer| {
        let phase = sctp_phase(peer);
        phase == SctpPhase::Closed || phase >= SctpPhase::ShutdownPending
    })
}

/// Tracks one packet sent by `peers[src_idx]`: verifies the sender's
/// tag, then applies chunk-driven phase transitions. SCTP shares the
/// TCP timeout classes.
pub fn track(
    peers: &mut [Peer; 2],
    src_idx: usize,
    header: &SctpHeader,
) -> Result<SctpResult, VtagMismatch> {
    {
        let src = &mut peers[src_idx];
        if src.vtag == 0 {
            src.vtag = header.vtag;
        } else if src.vtag != header.vtag {
            return Err(VtagMismatch { expected: src.vtag, got: header.vtag });
        }
    }

    let mut timeout = None;
    for chunk in &header.chunks {
        match chunk {
            SctpChunk::Init { .. } => {
                if advance(&mut peers[src_idx], SctpPhase::CookieWait) {
                    timeout = Some(TimeoutKind::TcpOpening);
                }
            }
            SctpChunk::InitAck { initiate_tag } => {
                // The tag the INIT sender will use from now on.
                let dst = &mut peers[1 - src_idx];
                if dst.vtag == 0 {
                    dst.vtag = *initiate_tag;
                }
                if advance(&mut peers[src_idx], SctpPhase::CookieWait) {
                    timeout = Some(TimeoutKind::TcpOpening);
                }
            }
            SctpChunk::Cookie | SctpChunk::HeartbeatAck => {
                if advance(&mut peers[src_idx], SctpPhase::Established) {
                    timeout = Some(TimeoutKind::TcpEstablished);
                }
            }
            SctpChunk::Shutdown => {
                if advance(&mut peers[src_idx], SctpPhase::ShutdownPending) {
                    timeout = Some(TimeoutKind::TcpClosing);
                }
            }
            SctpChunk::ShutdownComplete | SctpChunk::Abort => {
                peers[src_idx].phase = Phase::Sctp(SctpPhase::Closed);
                timeout = Some(TimeoutKind::TcpClosed);
            }
            SctpChunk::Asconf { .. } | SctpChunk::Data => {}
        }
    }

    Ok(SctpResult { timeout })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultihomeOp {
    /// Allow this address as an additional association source.
    Add(IpAddr),
    /// The peer dropped this address; shut down its flow.
    Del(IpAddr),
}

/// Scans ASCONF chunks into deferred jobs. The engine drains them after
/// the state lock is released, since each ADD spawns a rule evaluation
/// and state insertion of its own.
pub fn multihome_jobs(header: &SctpHeader) -> Vec<MultihomeOp> {
    let mut jobs = Vec::new();
    for chunk in &header.chunks {
        if let SctpChunk::Asconf { add, del } = chunk {
            jobs.extend(add.iter().copied().map(MultihomeOp::Add));
            jobs.extend(del.iter().copied().map(MultihomeOp::Del));
        }
    }
    jobs
}

/// Source addresses registered per verification tag. Flows created for
/// ADD-IP addresses land here so later ADDs can cross-connect every
/// known source, and state teardown retracts its own address.
#[derive(Debug, Default)]
pub struct MultihomeMap {
    inner: Mutex<HashMap<u32, Vec<IpAddr>>>,
}

impl MultihomeMap {
    pub fn add(&self, vtag: u32, addr: IpAddr) {
        if vtag == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        let sources = inner.entry(vtag).or_default();
        if !sources.contains(&addr) {
            sources.push(addr);
        }
    }

    /// All known sources for the tag other than `addr`.
    pub fn other_sources(&self, vtag: u32, addr: IpAddr) -> Vec<IpAddr> {
        let inner = self.inner.lock();
        inner
            .get(&vtag)
            .map(|sources| {
                sources.iter().copied().filter(|other| *other != addr).collect()
            })
            .unwrap_or_default()
    }

    /// Drops `addr` under both of the association's tags. Called when a
    /// state is freed so dead flows stop advertising their source.
    pub fn detach(&self, vtags: [u32; 2], addr: IpAddr) {
        let mut inner = self.inner.lock();
        for vtag in vtags {
            if vtag == 0 {
                continue;
            }
            if let Some(sources) = inner.get_mut(&vtag) {
                sources.retain(|other| *other != addr);
                if sources.is_empty() {
                    inner.remove(&vtag);
                }
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::testutil::v4;

    fn init_packet(tag: u32) -> SctpHeader {
        SctpHeader {
            vtag: 0,
            chunks: vec![SctpChunk::Init { initiate_tag: tag }],
            checksum: 0,
        }
    }

    fn packet(vtag: u32, chunks: Vec<SctpChunk>) -> SctpHeader {
        SctpHeader { vtag, chunks, checksum: 0 }
    }

    /// Runs INIT / INIT-ACK / COOKIE ECHO and returns the peer pair.
    fn associate() -> [Peer; 2] {
        let mut peers = [Peer::sctp_closed(), Peer::sctp_closed()];
        init_tracking(&mut peers, &init_packet(0xaaaa));
        assert_eq!(peers[1].vtag, 0xaaaa);

        let init_ack = packet(0xaaaa, vec![SctpChunk::InitAck { initiate_tag: 0xbbbb }]);
        track(&mut peers, 1, &init_ack).unwrap();
        assert_eq!(peers[0].vtag, 0xbbbb);

        let cookie = packet(0xbbbb, vec![SctpChunk::Cookie]);
        let result = track(&mut peers, 0, &cookie).unwrap();
        assert_eq!(result.timeout, Some(TimeoutKind::TcpEstablished));
        peers
    }

    #[test]
    fn handshake_learns_both_tags() {
        let peers = associate();
        assert_eq!(peers[0].vtag, 0xbbbb);
        assert_eq!(peers[1].vtag, 0xaaaa);
        assert_eq!(peers[0].phase, Phase::Sctp(SctpPhase::Established));
    }

    #[test]
    fn init_ack_advances_the_responder_half() {
        let mut peers = [Peer::sctp_closed(), Peer::sctp_closed()];
        init_tracking(&mut peers, &init_packet(0xaaaa));

        let init_ack = packet(0xaaaa, vec![SctpChunk::InitAck { initiate_tag: 0xbbbb }]);
        let result = track(&mut peers, 1, &init_ack).unwrap();
        assert_eq!(result.timeout, Some(TimeoutKind::TcpOpening));
        assert_eq!(peers[1].phase, Phase::Sctp(SctpPhase::CookieWait));
        // A half-open responder keeps a fresh INIT from recycling the
        // association.
        assert!(!reusable(&peers));

        let heartbeat = packet(0xaaaa, vec![SctpChunk::HeartbeatAck]);
        track(&mut peers, 1, &heartbeat).unwrap();
        assert_eq!(peers[1].phase, Phase::Sctp(SctpPhase::Established));
    }

    #[test]
    fn wrong_tag_is_dropped() {
        let mut peers = associate();
        let bogus = packet(0xdead, vec![SctpChunk::Data]);
        let err = track(&mut peers, 0, &bogus).unwrap_err();
        assert_eq!(err, VtagMismatch { expected: 0xbbbb, got: 0xdead });
    }

    #[test]
    fn data_keeps_the_timeout_class() {
        let mut peers = associate();
        let data = packet(0xbbbb, vec![SctpChunk::Data]);
        let result = track(&mut peers, 0, &data).unwrap();
        assert_eq!(result.timeout, None);
    }

    #[test]
    fn shutdown_walks_to_closed() {
        let mut peers = associate();

        let shutdown = packet(0xbbbb, vec![SctpChunk::Shutdown]);
        let result = track(&mut peers, 0, &shutdown).unwrap();
        assert_eq!(result.timeout, Some(TimeoutKind::TcpClosing));
        assert!(!reusable(&peers));

        let complete = packet(0xaaaa, vec![SctpChunk::ShutdownComplete]);
        let result = track(&mut peers, 1, &complete).unwrap();
        assert_eq!(result.timeout, Some(TimeoutKind::TcpClosed));
        assert_eq!(peers[1].phase, Phase::Sctp(SctpPhase::Closed));
        assert!(reusable(&peers));
    }

    #[test]
    fn asconf_scan_collects_adds_and_dels() {
        let header = packet(
            0xbbbb,
            vec![
                SctpChunk::Data,
                SctpChunk::Asconf {
                    add: vec![v4(10, 0, 0, 7)],
                    del: vec![v4(10, 0, 0, 8)],
                },
            ],
        );
        assert_eq!(
            multihome_jobs(&header),
            vec![
                MultihomeOp::Add(v4(10, 0, 0, 7)),
                MultihomeOp::Del(v4(10, 0, 0, 8)),
            ]
        );
    }

    #[test]
    fn multihome_map_add_dedup_and_detach() {
        let map = MultihomeMap::default();
        let a: IpAddr = v4(10, 0, 0, 7);
        let b: IpAddr = v4(10, 0, 0, 8);
        map.add(0xaaaa, a);
        map.add(0xaaaa, a);
        map.add(0xaaaa, b);
        assert_eq!(map.other_sources(0xaaaa, a), vec![b]);

        map.detach([0xaaaa, 0], b);
        assert_eq!(map.other_sources(0xaaaa, b), vec![a]);
        map.detach([0xaaaa, 0], a);
        assert_eq!(map.len(), 0);
    }
}
