//! Per-source-address tracking: connection limits, rates, and sticky
//! address pinning.
//!
//! A source node aggregates everything the engine knows about one source
//! address under one rule, in one of three independent kinds: connection
//! limiting, sticky route-to pinning, and sticky NAT pinning. The kinds
//! hash into separate row arrays so their locks never interfere. Nodes
//! are reference-counted by the states pointing at them; a node's expiry
//! stamp is only set once its state count returns to zero, and the purge
//! sweep frees it after that.

use core::hash::{Hash, Hasher};
use core::net::IpAddr;
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::hash_map::DefaultHasher;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::rules::Rule;

/// Scaling factor for rate counters, so integer decay keeps fractional
/// precision.
pub const THRESHOLD_MULT: u32 = 1000;
const THRESHOLD_MAX: u32 = u32::MAX / THRESHOLD_MULT;

pub const SOURCE_KINDS: usize = 3;

/// The independent tracking kinds a single source address can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Connection/state limiting.
    Limit = 0,
    /// Sticky route-to address pinning.
    StickyRoute = 1,
    /// Sticky NAT address pinning.
    StickyNat = 2,
}

/// An exponentially decaying event counter: each elapsed window forgets
/// the window's worth of history, each event adds [`THRESHOLD_MULT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Threshold {
    limit: u32,
    seconds: u32,
    count: u32,
    last: u64,
}

impl Threshold {
    pub fn new(limit: u32, seconds: u32, now: u64) -> Self {
        Self {
            limit: limit.min(THRESHOLD_MAX).saturating_mul(THRESHOLD_MULT),
            seconds,
            count: 0,
            last: now,
        }
    }

    fn decay(&mut self, now: u64) {
        if self.seconds > 0 {
            let elapsed = now.saturating_sub(self.last);
            let fade = (u64::from(self.count) * elapsed / u64::from(self.seconds))
                .min(u64::from(self.count)) as u32;
            self.count -= fade;
        } else {
            self.count = 0;
        }
        self.last = now;
    }

    pub fn add(&mut self, now: u64) {
        self.decay(now);
        self.count = self.count.saturating_add(THRESHOLD_MULT);
    }

    pub fn exceeded(&self) -> bool {
        self.limit > 0 && self.count > self.limit
    }

    #[cfg(test)]
    fn count(&self) -> u32 {
        self.count
    }
}

#[derive(Debug)]
pub struct SourceInner {
    /// Live states pointing at this node.
    pub states: u32,
    /// Fully established connections among them.
    pub conn: u32,
    pub conn_rate: Threshold,
    /// Sticky address chosen for this source, for the sticky kinds.
    pub pinned: Option<IpAddr>,
    /// Uptime deadline after which an unreferenced node may be freed.
    /// Meaningless while `states > 0`.
    pub expire: u64,
}

/// Per-(source address, rule, kind) aggregate.
#[derive(Debug)]
pub struct SourceNode {
    pub addr: IpAddr,
    pub kind: SourceKind,
    pub rule: Arc<Rule>,
    pub inner: Mutex<SourceInner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SourceError {
    /// The rule's source-node cap or the tracker capacity is exhausted.
    #[error("source node limit exhausted")]
    NodeLimit,
    /// The source is at its per-source state cap.
    #[error("per-source state limit exhausted")]
    StateLimit,
}

fn row_index(addr: &IpAddr, rule: &Arc<Rule>, rows: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    addr.hash(&mut hasher);
    (Arc::as_ptr(rule) as usize).hash(&mut hasher);
    (hasher.finish() as usize) & (rows - 1)
}

/// The source-node hash tables, one row array per kind.
pub struct SourceTracker {
    rows: [Vec<Mutex<Vec<Arc<SourceNode>>>>; SOURCE_KINDS],
    /// How long an unreferenced node lingers before the sweep takes it.
    idle: u32,
    limit: usize,
    count: AtomicU64,
    pub inserts: AtomicU64,
    pub removals: AtomicU64,
}

impl SourceTracker {
    pub fn new(rows: usize, limit: usize, idle: u32) -> Self {
        assert!(rows.is_power_of_two());
        let make = || (0..rows).map(|_| Mutex::new(Vec::new())).collect();
        Self {
            rows: [make(), make(), make()],
            idle,
            limit,
            count: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            removals: AtomicU64::new(0),
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn row(&self, kind: SourceKind, addr: &IpAddr, rule: &Arc<Rule>) -> &Mutex<Vec<Arc<SourceNode>>> {
        let rows = &self.rows[kind as usize];
        &rows[row_index(addr, rule, rows.len())]
    }

    /// Finds or creates the node for `(addr, rule, kind)` and counts a
    /// new state against it. Enforces the rule's node and per-source
    /// state caps; on failure nothing is counted.
    pub fn acquire(
        &self,
        kind: SourceKind,
        addr: IpAddr,
        rule: &Arc<Rule>,
        now: u64,
    ) -> Result<Arc<SourceNode>, SourceError> {
        let mut row = self.row(kind, &addr, rule).lock();
        if let Some(node) = row
            .iter()
            .find(|node| node.addr == addr && Arc::ptr_eq(&node.rule, rule))
        {
            let mut inner = node.inner.lock();
            if kind == SourceKind::Limit {
                if let Some(max) = rule.limits.max_src_states {
                    if inner.states >= max {
                        return Err(SourceError::StateLimit);
                    }
                }
            }
            inner.states += 1;
            drop(inner);
            return Ok(node.clone());
        }

        if self.count.load(Ordering::Relaxed) >= self.limit as u64 {
            return Err(SourceError::NodeLimit);
        }
        if let Some(max) = rule.limits.max_src_nodes {
            if rule.counters.src_nodes.load(Ordering::Relaxed) >= u64::from(max) {
                return Err(SourceError::NodeLimit);
            }
        }
        let rate = rule.limits.rate.unwrap_or(crate::rules::ConnRate { limit: 0, seconds: 0 });
        let node = Arc::new(SourceNode {
            addr,
            kind,
            rule: rule.clone(),
            inner: Mutex::new(SourceInner {
                states: 1,
                conn: 0,
                conn_rate: Threshold::new(rate.limit, rate.seconds, now),
                pinned: None,
                expire: 0,
            }),
        });
        row.push(node.clone());
        self.count.fetch_add(1, Ordering::Relaxed);
        self.inserts.fetch_add(1, Ordering::Relaxed);
        rule.counters.src_nodes.fetch_add(1, Ordering::Relaxed);
        Ok(node)
    }

    /// Counts a fully established connection and answers whether the
    /// source just tripped its connection count or rate limit.
    pub fn connection_limited(&self, node: &SourceNode, now: u64) -> bool {
        let mut inner = node.inner.lock();
        inner.conn += 1;
        inner.conn_rate.add(now);
        let over_count = node
            .rule
            .limits
            .max_src_conn
            .map_or(false, |max| inner.conn > max);
        over_count || inner.conn_rate.exceeded()
    }

    /// Gives back the references a dead state held. Called outside all
    /// state-table locks.
    pub fn release(&self, nodes: &[Option<Arc<SourceNode>>], established: bool, now: u64) {
        for node in nodes.iter().flatten() {
            let mut inner = node.inner.lock();
            inner.states = inner.states.saturating_sub(1);
            if established && node.kind == SourceKind::Limit {
                inner.conn = inner.conn.saturating_sub(1);
            }
            if inner.states == 0 {
                inner.expire = now + u64::from(self.idle);
            }
        }
    }

    /// Remembers the sticky address chosen for this source.
    pub fn pin(&self, node: &SourceNode, addr: IpAddr) {
        node.inner.lock().pinned = Some(addr);
    }

    pub fn pinned(&self, node: &SourceNode) -> Option<IpAddr> {
        node.inner.lock().pinned
    }

    /// Sweeps unreferenced, expired nodes. Returns how many were
    /// freed.
    pub fn sweep(&self, now: u64) -> usize {
        let mut freed = 0;
        for rows in &self.rows {
            for row in rows {
                let mut row = row.lock();
                row.retain(|node| {
                    let inner = node.inner.lock();
                    let dead = inner.states == 0 && inner.expire <= now;
                    if dead {
                        freed += 1;
                        node.rule.counters.src_nodes.fetch_sub(1, Ordering::Relaxed);
                    }
                    !dead
                });
            }
        }
        self.count.fetch_sub(freed as u64, Ordering::Relaxed);
        self.removals.fetch_add(freed as u64, Ordering::Relaxed);
        freed as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::testutil::v4;
    use crate::rules::{ConnRate, SourceLimits};
    use assert_matches::assert_matches;

    fn limited_rule(max_src_states: u32) -> Arc<Rule> {
        Arc::new(Rule {
            limits: SourceLimits {
                max_src_states: Some(max_src_states),
                ..SourceLimits::default()
            },
            ..Rule::default()
        })
    }

    fn tracker() -> SourceTracker {
        SourceTracker::new(64, 1000, 0)
    }

    #[test]
    fn threshold_decays_to_zero_within_window() {
        let mut t = Threshold::new(10, 30, 0);
        for _ in 0..5 {
            t.add(0);
        }
        assert_eq!(t.count(), 5 * THRESHOLD_MULT);
        // Half the window forgets half the history.
        t.decay(15);
        assert_eq!(t.count(), 5 * THRESHOLD_MULT / 2);
        // A full idle window forgets everything.
        t.decay(45);
        assert_eq!(t.count(), 0);
    }

    #[test]
    fn threshold_trips_above_limit() {
        let mut t = Threshold::new(3, 10, 0);
        t.add(0);
        t.add(0);
        t.add(0);
        assert!(!t.exceeded());
        t.add(0);
        assert!(t.exceeded());
    }

    #[test]
    fn sixth_state_from_one_source_is_refused() {
        let tracker = tracker();
        let rule = limited_rule(5);
        let addr = v4(10, 0, 0, 5);
        for _ in 0..5 {
            tracker.acquire(SourceKind::Limit, addr, &rule, 0).unwrap();
        }
        assert_matches!(
            tracker.acquire(SourceKind::Limit, addr, &rule, 0),
            Err(SourceError::StateLimit)
        );
        // The existing five are unaffected.
        let node = {
            let row = tracker.row(SourceKind::Limit, &addr, &rule).lock();
            row[0].clone()
        };
        assert_eq!(node.inner.lock().states, 5);

        // A different source is not limited.
        tracker.acquire(SourceKind::Limit, v4(10, 0, 0, 6), &rule, 0).unwrap();
    }

    #[test]
    fn connection_rate_limit_trips() {
        let tracker = tracker();
        let rule = Arc::new(Rule {
            limits: SourceLimits {
                rate: Some(ConnRate { limit: 2, seconds: 10 }),
                ..SourceLimits::default()
            },
            ..Rule::default()
        });
        let node = tracker.acquire(SourceKind::Limit, v4(10, 0, 0, 5), &rule, 0).unwrap();
        assert!(!tracker.connection_limited(&node, 0));
        assert!(!tracker.connection_limited(&node, 0));
        assert!(tracker.connection_limited(&node, 0));
        // After the window decays, connections are allowed again, but
        // the absolute conn count keeps growing until states release.
        let mut inner = node.inner.lock();
        inner.conn = 0;
        drop(inner);
        assert!(!tracker.connection_limited(&node, 100));
    }

    #[test]
    fn release_arms_expiry_and_sweep_frees() {
        let tracker = SourceTracker::new(64, 1000, 10);
        let rule = limited_rule(5);
        let node = tracker.acquire(SourceKind::Limit, v4(10, 0, 0, 5), &rule, 0).unwrap();
        assert_eq!(tracker.count(), 1);

        tracker.release(&[Some(node.clone())], false, 50);
        assert_eq!(node.inner.lock().expire, 60);

        // Not yet expired.
        assert_eq!(tracker.sweep(55), 0);
        assert_eq!(tracker.sweep(60), 1);
        assert_eq!(tracker.count(), 0);
        assert_eq!(rule.counters.src_nodes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn sticky_pin_round_trips() {
        let tracker = tracker();
        let rule = Arc::new(Rule::default());
        let node = tracker.acquire(SourceKind::StickyNat, v4(10, 0, 0, 5), &rule, 0).unwrap();
        assert_eq!(tracker.pinned(&node), None);
        tracker.pin(&node, v4(203, 0, 113, 9));
        assert_eq!(tracker.pinned(&node), Some(v4(203, 0, 113, 9)));
    }

    #[test]
    fn node_cap_per_rule_is_enforced() {
        let tracker = tracker();
        let rule = Arc::new(Rule {
            limits: SourceLimits { max_src_nodes: Some(1), ..SourceLimits::default() },
            ..Rule::default()
        });
        tracker.acquire(SourceKind::Limit, v4(10, 0, 0, 5), &rule, 0).unwrap();
        assert_matches!(
            tracker.acquire(SourceKind::Limit, v4(10, 0, 0, 6), &rule, 0),
            Err(SourceError::NodeLimit)
        );
    }
}
