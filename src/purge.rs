//! State teardown and background expiry.
//!
//! Rather than a timer per state, a background pass walks a fraction
//! of the id rows each interval and kills whatever has outlived its
//! idle deadline. Teardown itself is also used inline by the dispatch
//! path when a tracker declares a state dead.

use core::net::IpAddr;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::conntrack::{state_expires, KeySide, State, TimeoutKind};
use crate::context::FilterContext;
use crate::packets::Protocol;
use crate::rules::Rule;

impl FilterContext {
    /// Unlinks one state and settles its debts: multihome map entries
    /// and source-node references. Idempotent; returns whether this
    /// call did the unlinking.
    pub(crate) fn kill_state(&self, state: &Arc<State>) -> bool {
        let now = self.uptime();
        let wire = state.key(KeySide::Wire);
        let vtags = if wire.protocol == Protocol::Sctp {
            let inner = state.inner.lock();
            Some([inner.peers[0].vtag, inner.peers[1].vtag])
        } else {
            None
        };
        let Some(unlinked) = self.states.unlink(state) else {
            return false;
        };
        if let Some(vtags) = vtags {
            self.multihome.detach(vtags, wire.endpoints[0].addr);
        }
        self.sources.release(&unlinked.nodes, unlinked.established, now);
        true
    }

    /// Kills states by wire source address, optionally restricted to
    /// states created by one rule. Returns how many died.
    pub fn flush_states(&self, addr: Option<IpAddr>, rule: Option<&Arc<Rule>>) -> usize {
        let mut killed = 0;
        for row in 0..self.states.id_row_count() {
            for state in self.states.id_row_snapshot(row) {
                if let Some(addr) = addr {
                    if state.key(KeySide::Wire).endpoints[0].addr != addr {
                        continue;
                    }
                }
                if let Some(rule) = rule {
                    if !Arc::ptr_eq(rule, &state.rule) {
                        continue;
                    }
                }
                if self.kill_state(&state) {
                    killed += 1;
                }
            }
        }
        killed
    }
}

/// Walks the state table incrementally, one slice of id rows per tick.
pub struct Purger {
    ctx: Arc<FilterContext>,
    next_row: usize,
}

impl Purger {
    pub fn new(ctx: Arc<FilterContext>) -> Self {
        Self { ctx, next_row: 0 }
    }

    /// One purge pass: drain queued overload flushes, expire a slice
    /// of the table, and on each full wrap sweep source nodes and
    /// retired rulesets.
    pub fn tick(&mut self) {
        let ctx = Arc::clone(&self.ctx);
        let now = ctx.uptime();

        for request in ctx.drain_flush_queue() {
            let killed = ctx.flush_states(Some(request.addr), request.rule.as_ref());
            if killed > 0 {
                log::info!("flushed {killed} states from overloading {}", request.addr);
            }
        }

        let rows = ctx.states.id_row_count();
        let span = (rows / ctx.config.purge_fraction).max(1);
        let live = ctx.states.count();
        for _ in 0..span {
            let row = self.next_row;
            self.next_row = (self.next_row + 1) % rows;
            for state in ctx.states.id_row_snapshot(row) {
                let expired = {
                    let inner = state.inner.lock();
                    match inner.timeout {
                        TimeoutKind::Unlinked => false,
                        TimeoutKind::Purge => true,
                        _ => {
                            now >= state_expires(
                                &state,
                                &inner,
                                &ctx.config.timeouts,
                                ctx.config.adaptive,
                                live,
                            )
                        }
                    }
                };
                if expired {
                    ctx.kill_state(&state);
                }
            }
            if self.next_row == 0 {
                self.sweep(now);
                break;
            }
        }
    }

    /// End-of-wrap housekeeping: free idle source nodes and retired
    /// rulesets no state or node references anymore.
    fn sweep(&self, now: u64) {
        let freed = self.ctx.sources.sweep(now);
        if freed > 0 {
            log::debug!("freed {freed} idle source nodes");
        }
        self.ctx.retain_retired(|ruleset| {
            ruleset.rules().iter().any(|rule| {
                rule.counters.states.load(Ordering::Relaxed) != 0
                    || rule.counters.src_nodes.load(Ordering::Relaxed) != 0
            })
        });
    }
}

/// Owns the background purge thread; dropping the handle stops it.
pub struct PurgeHandle {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

/// Spawns the purge thread, ticking every `config.purge_interval`
/// seconds.
pub fn spawn(ctx: Arc<FilterContext>) -> std::io::Result<PurgeHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let interval = Duration::from_secs(ctx.config.purge_interval.max(1));
    let thread = thread::Builder::new().name("purge".into()).spawn(move || {
        let mut purger = Purger::new(ctx);
        // Sleep in short steps so drop does not stall on the interval.
        let step = Duration::from_millis(200);
        let mut slept = Duration::ZERO;
        while !flag.load(Ordering::Relaxed) {
            thread::sleep(step);
            slept += step;
            if slept >= interval {
                slept = Duration::ZERO;
                purger.tick();
            }
        }
    })?;
    Ok(PurgeHandle { stop, thread: Some(thread) })
}

impl Drop for PurgeHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Config, ManualClock};
    use crate::logic::TestResult;
    use crate::packets::testutil::{tcp_syn, v4};
    use crate::packets::Direction;
    use crate::rules::Rule;

    fn engine() -> (Arc<FilterContext>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let ctx = Arc::new(
            FilterContext::new(Config::default()).with_clock(Arc::clone(&clock)),
        );
        ctx.replace_rules(vec![Rule::default()]);
        (ctx, clock)
    }

    fn open_flow(ctx: &FilterContext, src_port: u16) {
        let mut pd = tcp_syn(
            (v4(10, 0, 0, 5), src_port),
            (v4(192, 0, 2, 1), 80),
            1000,
            Direction::Out,
        );
        assert_eq!(ctx.test_packet(&mut pd), TestResult::Pass);
    }

    fn drain_table(purger: &mut Purger) {
        let rows = purger.ctx.states.id_row_count();
        for _ in 0..=rows {
            purger.tick();
        }
    }

    #[test]
    fn idle_state_expires_after_its_timeout() {
        let (ctx, clock) = engine();
        open_flow(&ctx, 5000);
        assert_eq!(ctx.states.count(), 1);

        let mut purger = Purger::new(Arc::clone(&ctx));
        drain_table(&mut purger);
        assert_eq!(ctx.states.count(), 1);

        // An opening flow only gets tcp_first seconds of silence.
        clock.advance(u64::from(ctx.config.timeouts.tcp_first) + 1);
        drain_table(&mut purger);
        assert_eq!(ctx.states.count(), 0);
    }

    #[test]
    fn flush_by_address_spares_other_sources() {
        let (ctx, _clock) = engine();
        open_flow(&ctx, 5000);
        let mut other = tcp_syn(
            (v4(10, 0, 0, 6), 5000),
            (v4(192, 0, 2, 1), 80),
            1000,
            Direction::Out,
        );
        assert_eq!(ctx.test_packet(&mut other), TestResult::Pass);
        assert_eq!(ctx.states.count(), 2);

        assert_eq!(ctx.flush_states(Some(v4(10, 0, 0, 5)), None), 1);
        assert_eq!(ctx.states.count(), 1);
    }

    #[test]
    fn retired_ruleset_is_freed_once_unreferenced() {
        let (ctx, clock) = engine();
        open_flow(&ctx, 5000);
        ctx.replace_rules(vec![Rule::default()]);
        assert_eq!(ctx.retired_count(), 2);

        let mut purger = Purger::new(Arc::clone(&ctx));
        drain_table(&mut purger);
        // The old ruleset's pass rule still owns the live state.
        assert_eq!(ctx.retired_count(), 1);

        clock.advance(u64::from(ctx.config.timeouts.tcp_first) + 1);
        drain_table(&mut purger);
        assert_eq!(ctx.retired_count(), 0);
    }
}
