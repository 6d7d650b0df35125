//! TCP state tracking.
//!
//! The full tracker validates every segment against the sequence windows
//! from Guido van Rooij's filtering paper, with a looser second-chance
//! window for connections picked up mid-stream, and maintains one
//! [`TcpPhase`] per connection half. Sequence modulation and the SYN
//! proxy rewrite are layered on the same peer fields: `seqdiff` is the
//! per-side offset between stack-space and wire-space sequence numbers.

use rand::Rng;

use crate::checksum;
use crate::conntrack::{Peer, Phase, TcpPhase, TimeoutKind};
use crate::packets::{SeqNum, TcpFlags, TcpSegment};

/// Largest tolerated ack skew: one maximal window plus a fudge factor
/// for a reassembled fragment.
pub const MAX_ACK_WINDOW: u32 = 0xffff + 1500;

const TCP_MAX_WIN: u32 = 0xffff;

/// Outcome of a successful tracking step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackResult {
    /// The timeout class the connection now belongs in, or `None` when
    /// the packet only matched the loose window and must not refresh
    /// the deadline.
    pub timeout: Option<TimeoutKind>,
    /// The handshake just completed; the caller owes the source node a
    /// connection count.
    pub established: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackError {
    /// Both window tests failed.
    BadState,
    /// Sequence mismatch while both halves were still handshaking. The
    /// caller should answer with a reset acking `ack` unless the
    /// offending segment was itself a reset.
    HandshakeMismatch { reset_seq: Option<SeqNum> },
}

fn tcp_phase(peer: &Peer) -> TcpPhase {
    match peer.phase {
        Phase::Tcp(phase) => phase,
        // A state picked up by a non-TCP path cannot reach the tracker.
        Phase::Simple(_) | Phase::Sctp(_) => TcpPhase::Closed,
    }
}

fn advance(peer: &mut Peer, at_least: TcpPhase) {
    if tcp_phase(peer) < at_least {
        peer.phase = Phase::Tcp(at_least);
    }
}

fn split(peers: &mut [Peer; 2], src: usize) -> (&mut Peer, &mut Peer) {
    let (head, tail) = peers.split_at_mut(1);
    if src == 0 {
        (&mut head[0], &mut tail[0])
    } else {
        (&mut tail[0], &mut head[0])
    }
}

/// Timeout class from the two half states, strictest first.
pub fn timeout_for(src: &Peer, dst: &Peer) -> TimeoutKind {
    let (s, d) = (tcp_phase(src), tcp_phase(dst));
    if s >= TcpPhase::FinWait2 && d >= TcpPhase::FinWait2 {
        TimeoutKind::TcpClosed
    } else if s >= TcpPhase::Closing && d >= TcpPhase::Closing {
        TimeoutKind::TcpFinWait
    } else if s < TcpPhase::Established || d < TcpPhase::Established {
        TimeoutKind::TcpOpening
    } else if s >= TcpPhase::Closing || d >= TcpPhase::Closing {
        TimeoutKind::TcpClosing
    } else {
        TimeoutKind::TcpEstablished
    }
}

fn set_seq(tcp: &mut TcpSegment, new: SeqNum) {
    tcp.checksum = checksum::fixup32(tcp.checksum, tcp.seq.raw(), new.raw(), false);
    tcp.seq = new;
}

fn set_ack(tcp: &mut TcpSegment, new: SeqNum) {
    tcp.checksum = checksum::fixup32(tcp.checksum, tcp.ack.raw(), new.raw(), false);
    tcp.ack = new;
}

/// Initializes tracking from the connection's first segment (sent by
/// `peers[0]`), optionally arming sequence modulation with a random
/// offset; the segment is rewritten in place when it is.
pub fn init_tracking<R: Rng>(
    peers: &mut [Peer; 2],
    tcp: &mut TcpSegment,
    payload_len: u32,
    modulate: bool,
    rng: &mut R,
) {
    let (src, dst) = split(peers, 0);
    let seq = tcp.seq;
    let mut end = seq + payload_len;
    if tcp.flags.contains(TcpFlags::SYN) {
        end = end + 1;
    }
    if tcp.flags.contains(TcpFlags::FIN) {
        end = end + 1;
    }

    src.seqlo = seq;
    src.seqhi = end + 1;
    if modulate {
        // Nonzero so the deferred server-side offset can tell "not yet
        // generated" apart.
        src.seqdiff = loop {
            let diff = rng.gen::<u32>();
            if diff != 0 {
                break diff;
            }
        };
        set_seq(tcp, seq + src.seqdiff);
    }
    src.max_win = u32::from(tcp.window).max(1) as u16;
    src.wscale = tcp.wscale;
    src.mss = tcp.mss.unwrap_or(0);
    src.phase = Phase::Tcp(TcpPhase::SynSent);

    dst.phase = Phase::Tcp(TcpPhase::Closed);
    dst.seqhi = SeqNum::new(1);
    dst.max_win = 1;
}

/// Full Van Rooij tracking of one segment sent by `peers[src_idx]`.
/// Rewrites sequence numbers in place when modulation is active.
pub fn track_full<R: Rng>(
    peers: &mut [Peer; 2],
    src_idx: usize,
    tcp: &mut TcpSegment,
    payload_len: u32,
    rng: &mut R,
) -> Result<TrackResult, TrackError> {
    let (src, dst) = split(peers, src_idx);
    let flags = tcp.flags;
    let mut win = u32::from(tcp.window);

    let (mut sws, mut dws) = match (src.wscale, dst.wscale) {
        (Some(s), Some(d)) if !flags.contains(TcpFlags::SYN) => {
            (u32::from(s), u32::from(d))
        }
        _ => (0, 0),
    };

    let orig_seq = tcp.seq;
    let mut seq = tcp.seq;
    let mut ack;
    let mut end;
    let mut data_end;

    if src.seqlo.raw() == 0 {
        // First segment from this end.
        if dst.seqdiff != 0 && src.seqdiff == 0 {
            // Deferred modulation offset for the responder.
            src.seqdiff = loop {
                let diff = rng.gen::<u32>().wrapping_sub(seq.raw());
                if diff != 0 {
                    break diff;
                }
            };
            ack = tcp.ack.wrapping_sub(dst.seqdiff);
            set_seq(tcp, seq + src.seqdiff);
            set_ack(tcp, ack);
        } else {
            ack = tcp.ack;
        }

        end = seq + payload_len;
        if flags.contains(TcpFlags::SYN) {
            end = end + 1;
            if let Some(dscale) = dst.wscale {
                src.wscale = tcp.wscale;
                match src.wscale {
                    Some(scale) => {
                        // Remove the scale factor from the initial
                        // window.
                        sws = u32::from(scale);
                        win = (win + (1 << sws) - 1) >> sws;
                        dws = u32::from(dscale);
                    }
                    None => {
                        // This side never scales; widen the other
                        // side's view instead. Also handles a
                        // retransmitted SYN|ACK.
                        dst.max_win = TCP_MAX_WIN
                            .min(u32::from(dst.max_win) << u32::from(dscale))
                            as u16;
                        dst.wscale = None;
                    }
                }
            }
        }
        data_end = end;
        if flags.contains(TcpFlags::FIN) {
            end = end + 1;
        }

        src.seqlo = seq;
        advance(src, TcpPhase::SynSent);

        // The window may need sliding if the connection was picked up
        // after establishment.
        let span = (u32::from(dst.max_win) << dws).max(1);
        if src.seqhi.raw() == 1 || (end + span).geq(src.seqhi) {
            src.seqhi = end + span;
        }
        if win > u32::from(src.max_win) {
            src.max_win = win as u16;
        }
    } else {
        ack = tcp.ack.wrapping_sub(dst.seqdiff);
        if src.seqdiff != 0 {
            set_seq(tcp, seq + src.seqdiff);
            set_ack(tcp, ack);
        }
        end = seq + payload_len;
        if flags.contains(TcpFlags::SYN) {
            end = end + 1;
        }
        data_end = end;
        if flags.contains(TcpFlags::FIN) {
            end = end + 1;
        }
    }

    if !flags.contains(TcpFlags::ACK) {
        // Let it pass through the ack skew check.
        ack = dst.seqlo;
    } else if (ack.raw() == 0 && flags.contains(TcpFlags::ACK | TcpFlags::RST))
        || tcp_phase(dst) < TcpPhase::SynSent
    {
        // Broken stacks ack nothing on a timed-out handshake.
        ack = dst.seqlo;
    }

    if seq == end {
        // Ease sequencing restrictions on dataless packets.
        seq = src.seqlo;
        end = seq;
        data_end = seq;
    }

    let ackskew = dst.seqlo.diff(ack);

    // Demodulate SACK blocks the same way as the ack number.
    if dst.seqdiff != 0 && !tcp.sack_blocks.is_empty() {
        demodulate_sack(tcp, dst.seqdiff);
    }

    let strict = src.seqhi.geq(data_end)
        && seq.geq(src.seqlo.wrapping_sub(u32::from(dst.max_win) << dws))
        && ackskew >= -i64::from(MAX_ACK_WINDOW)
        && ackskew <= i64::from(MAX_ACK_WINDOW << sws)
        && (!flags.contains(TcpFlags::RST)
            || orig_seq == src.seqlo
            || orig_seq == src.seqlo + 1
            || orig_seq + 1 == src.seqlo);

    if strict {
        if u32::from(src.max_win) < win {
            src.max_win = win as u16;
        }
        if end.gt(src.seqlo) {
            src.seqlo = end;
        }
        if (ack + (win << sws)).geq(dst.seqhi) {
            dst.seqhi = ack + (win << sws).max(1);
        }

        let mut established = false;
        if flags.contains(TcpFlags::SYN) {
            advance(src, TcpPhase::SynSent);
        }
        if flags.contains(TcpFlags::FIN) {
            advance(src, TcpPhase::Closing);
        }
        if flags.contains(TcpFlags::ACK) {
            if tcp_phase(dst) == TcpPhase::SynSent {
                dst.phase = Phase::Tcp(TcpPhase::Established);
                established = tcp_phase(src) == TcpPhase::Established;
            } else if tcp_phase(dst) == TcpPhase::Closing {
                dst.phase = Phase::Tcp(TcpPhase::FinWait2);
            }
        }
        if flags.contains(TcpFlags::RST) {
            src.phase = Phase::Tcp(TcpPhase::TimeWait);
            dst.phase = Phase::Tcp(TcpPhase::TimeWait);
        }

        Ok(TrackResult { timeout: Some(timeout_for(src, dst)), established })
    } else if (tcp_phase(dst) < TcpPhase::SynSent
        || tcp_phase(dst) >= TcpPhase::FinWait2
        || tcp_phase(src) >= TcpPhase::FinWait2)
        && (src.seqhi + MAX_ACK_WINDOW).geq(data_end)
        && seq.geq(src.seqlo.wrapping_sub(MAX_ACK_WINDOW))
    {
        // Loose window: shotgunned SYNs, connections picked up
        // mid-stream, and post-close stragglers. Deliberately does not
        // refresh the deadline so a flood cannot keep dead state alive.
        log::debug!(
            "loose state match: seq={} ack={} len={} ackskew={}",
            seq.raw(),
            ack.raw(),
            payload_len,
            ackskew
        );

        if u32::from(src.max_win) < win {
            src.max_win = win as u16;
        }
        if end.gt(src.seqlo) {
            src.seqlo = end;
        }
        if (ack + (win << sws)).geq(dst.seqhi) {
            dst.seqhi = ack + (win << sws).max(1);
        }
        // dst.seqhi is left alone: this could be a shotgunned SYN, not
        // an established stream.

        if flags.contains(TcpFlags::FIN) {
            advance(src, TcpPhase::Closing);
        }
        if flags.contains(TcpFlags::RST) {
            src.phase = Phase::Tcp(TcpPhase::TimeWait);
            dst.phase = Phase::Tcp(TcpPhase::TimeWait);
        }

        Ok(TrackResult { timeout: None, established: false })
    } else if tcp_phase(src) == TcpPhase::SynSent && tcp_phase(dst) == TcpPhase::SynSent
    {
        // Mismatch during the handshake: tell the peer to start over.
        let reset_seq = (!flags.contains(TcpFlags::RST)).then_some(tcp.ack);
        src.seqlo = SeqNum::new(0);
        src.seqhi = SeqNum::new(1);
        src.max_win = 1;
        Err(TrackError::HandshakeMismatch { reset_seq })
    } else {
        log::debug!(
            "bad state: seq={} ack={} len={} ackskew={}",
            seq.raw(),
            ack.raw(),
            payload_len,
            ackskew
        );
        Err(TrackError::BadState)
    }
}

/// Transition-only tracking for asymmetric paths: no sequence windows,
/// just the phase machine.
pub fn track_sloppy(
    peers: &mut [Peer; 2],
    src_idx: usize,
    flags: TcpFlags,
) -> TrackResult {
    let (src, dst) = split(peers, src_idx);
    let mut established = false;

    if flags.contains(TcpFlags::SYN) {
        advance(src, TcpPhase::SynSent);
    }
    if flags.contains(TcpFlags::FIN) {
        advance(src, TcpPhase::Closing);
    }
    if flags.contains(TcpFlags::ACK) {
        if tcp_phase(dst) == TcpPhase::SynSent {
            dst.phase = Phase::Tcp(TcpPhase::Established);
            established = tcp_phase(src) == TcpPhase::Established;
        } else if tcp_phase(dst) == TcpPhase::Closing {
            dst.phase = Phase::Tcp(TcpPhase::FinWait2);
        } else if tcp_phase(src) == TcpPhase::SynSent
            && tcp_phase(dst) < TcpPhase::SynSent
        {
            // Only one half of the connection is visible; an ACK after
            // the initial SYN means it went through.
            src.phase = Phase::Tcp(TcpPhase::Established);
            dst.phase = Phase::Tcp(TcpPhase::Established);
            established = true;
        } else if tcp_phase(src) == TcpPhase::Closing
            && tcp_phase(dst) == TcpPhase::Established
            && dst.seqlo.raw() == 0
        {
            // Half-visible close without the full FIN/ACK exchange.
            dst.phase = Phase::Tcp(TcpPhase::Closing);
        }
    }
    if flags.contains(TcpFlags::RST) {
        src.phase = Phase::Tcp(TcpPhase::TimeWait);
        dst.phase = Phase::Tcp(TcpPhase::TimeWait);
    }

    TrackResult { timeout: Some(timeout_for(src, dst)), established }
}

/// A segment the proxy asks the caller to synthesize. Sequence fields
/// are absolute; addressing comes from the state's keys or the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxySegment {
    pub to: ProxyTarget,
    pub seq: SeqNum,
    pub ack: SeqNum,
    pub flags: TcpFlags,
    pub window: u16,
    /// MSS option value, zero for none.
    pub mss: u16,
}

/// Who a synthesized proxy segment is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyTarget {
    /// The connection initiator, in wire space.
    Client,
    /// The intended destination, in stack space.
    Server,
}

/// What the SYN proxy decided about one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyVerdict {
    /// Proxy phases are over; continue with normal tracking.
    Pass,
    /// The packet was consumed; synthesize the listed segments.
    Absorb(Vec<ProxySegment>),
    /// Handshake violation.
    Drop,
    /// The source's connection limit fired during splice.
    SourceLimit,
}

/// Arms the SYN proxy on a freshly created state and returns the
/// SYN|ACK to send the client. Runs after [`init_tracking`], replacing
/// `seqhi` with the locally chosen cookie ISN.
pub fn proxy_init<R: Rng>(
    peers: &mut [Peer; 2],
    tcp: &TcpSegment,
    rng: &mut R,
) -> ProxySegment {
    let src = &mut peers[0];
    src.phase = Phase::Tcp(TcpPhase::ProxySrc);
    src.seqhi = SeqNum::new(rng.gen());
    src.mss = tcp.mss.unwrap_or(536);
    ProxySegment {
        to: ProxyTarget::Client,
        seq: src.seqhi,
        ack: tcp.seq + 1,
        flags: TcpFlags::SYN | TcpFlags::ACK,
        window: 0,
        mss: src.mss,
    }
}

/// SYN proxy: answers the client's handshake locally with the cookie
/// ISN stored in `peers[0].seqhi`, replays it upstream only once the
/// client proves liveness, then splices the two half-connections by
/// arming sequence offsets. `peers[0]` is always the initiator.
/// `connlimit_ok` is consulted once, when the client completes.
pub fn synproxy<R: Rng>(
    peers: &mut [Peer; 2],
    forward: bool,
    tcp: &TcpSegment,
    rng: &mut R,
    connlimit_ok: impl FnOnce() -> bool,
) -> ProxyVerdict {
    if tcp_phase(&peers[0]) == TcpPhase::ProxySrc {
        if !forward {
            // Nothing upstream exists yet; eat replies.
            return ProxyVerdict::Absorb(Vec::new());
        }
        if tcp.flags.contains(TcpFlags::SYN) {
            if tcp.seq != peers[0].seqlo {
                return ProxyVerdict::Drop;
            }
            return ProxyVerdict::Absorb(vec![ProxySegment {
                to: ProxyTarget::Client,
                seq: peers[0].seqhi,
                ack: tcp.seq + 1,
                flags: TcpFlags::SYN | TcpFlags::ACK,
                window: 0,
                mss: peers[0].mss,
            }]);
        } else if tcp.flags.masked(TcpFlags::ACK | TcpFlags::RST | TcpFlags::FIN)
            != TcpFlags::ACK
            || tcp.ack != peers[0].seqhi + 1
            || tcp.seq != peers[0].seqlo + 1
        {
            return ProxyVerdict::Drop;
        } else if !connlimit_ok() {
            return ProxyVerdict::SourceLimit;
        }
        peers[0].phase = Phase::Tcp(TcpPhase::ProxyDst);
    }
    if tcp_phase(&peers[0]) == TcpPhase::ProxyDst {
        if forward {
            if tcp.flags.masked(TcpFlags::SYN | TcpFlags::ACK) != TcpFlags::ACK
                || tcp.ack != peers[0].seqhi + 1
                || tcp.seq != peers[0].seqlo + 1
            {
                return ProxyVerdict::Drop;
            }
            peers[0].max_win = tcp.window.max(1);
            if peers[1].seqhi.raw() == 1 {
                peers[1].seqhi = SeqNum::new(rng.gen());
            }
            return ProxyVerdict::Absorb(vec![ProxySegment {
                to: ProxyTarget::Server,
                seq: peers[1].seqhi,
                ack: SeqNum::new(0),
                flags: TcpFlags::SYN,
                window: 0,
                mss: peers[0].mss,
            }]);
        } else if tcp.flags.masked(TcpFlags::SYN | TcpFlags::ACK)
            != (TcpFlags::SYN | TcpFlags::ACK)
            || tcp.ack != peers[1].seqhi + 1
        {
            return ProxyVerdict::Drop;
        } else {
            peers[1].max_win = tcp.window.max(1);
            peers[1].seqlo = tcp.seq;
            let sends = vec![
                // Complete the upstream handshake.
                ProxySegment {
                    to: ProxyTarget::Server,
                    seq: tcp.ack,
                    ack: tcp.seq + 1,
                    flags: TcpFlags::ACK,
                    window: peers[0].max_win,
                    mss: 0,
                },
                // Open the client's window now that the server exists.
                ProxySegment {
                    to: ProxyTarget::Client,
                    seq: peers[0].seqhi + 1,
                    ack: peers[0].seqlo + 1,
                    flags: TcpFlags::ACK,
                    window: peers[1].max_win,
                    mss: 0,
                },
            ];
            // Splice: from here on normal tracking runs with offsets
            // mapping each side onto the locally spoken numbers.
            peers[0].seqdiff = peers[1].seqhi.raw().wrapping_sub(peers[0].seqlo.raw());
            peers[1].seqdiff = peers[0].seqhi.raw().wrapping_sub(peers[1].seqlo.raw());
            peers[0].seqhi = peers[0].seqlo + u32::from(peers[1].max_win);
            peers[1].seqhi = peers[1].seqlo + u32::from(peers[0].max_win);
            peers[0].wscale = None;
            peers[1].wscale = None;
            peers[0].phase = Phase::Tcp(TcpPhase::Established);
            peers[1].phase = Phase::Tcp(TcpPhase::Established);
            return ProxyVerdict::Absorb(sends);
        }
    }
    ProxyVerdict::Pass
}

/// Subtracts the responder-side modulation offset from every SACK block,
/// patching the checksum per word.
fn demodulate_sack(tcp: &mut TcpSegment, seqdiff: u32) {
    let mut cksum = tcp.checksum;
    for (start, end) in &mut tcp.sack_blocks {
        let new_start = start.wrapping_sub(seqdiff);
        let new_end = end.wrapping_sub(seqdiff);
        cksum = checksum::fixup32(cksum, start.raw(), new_start.raw(), false);
        cksum = checksum::fixup32(cksum, end.raw(), new_end.raw(), false);
        *start = new_start;
        *end = new_end;
    }
    tcp.checksum = cksum;
}

/// Whether both halves are past the connection's useful life and a new
/// SYN may recycle the flow's endpoints.
pub fn reusable(peers: &[Peer; 2]) -> bool {
    tcp_phase(&peers[0]) >= TcpPhase::FinWait2 && tcp_phase(&peers[1]) >= TcpPhase::FinWait2
}
