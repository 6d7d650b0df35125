//! The rule-evaluation engine.
//!
//! Evaluation is an ordered scan over the active ruleset with two
//! accelerations: a failed predicate jumps to that category's skip index,
//! and anchor descent uses an explicit fixed-capacity frame stack so the
//! nesting depth is bounded and overflow is survivable. Filter evaluation
//! is last-match-wins with `quick` short-circuit; translation lookup runs
//! the same machinery in first-match mode.

use std::sync::Arc;

use log::warn;
use rand::Rng;

use crate::matchers::Matcher;
use crate::packets::{PacketDescriptor, Protocol};
use crate::rules::{Action, Anchor, Rule, Ruleset, SkipCat};

/// Nested rule groups deeper than this are not descended into; the
/// offending rule is skipped and evaluation continues at its level.
pub const ANCHOR_STACK_DEPTH: usize = 64;

/// The outcome of a ruleset evaluation.
#[derive(Debug)]
pub struct RuleMatch {
    /// The last matching terminal rule, or the default rule.
    pub rule: Arc<Rule>,
    /// The innermost anchor containing the matched rule, if any.
    pub anchor: Option<Arc<Anchor>>,
    /// Every `Match`-action rule passed on the way, in order; all of
    /// their side effects apply.
    pub match_rules: Vec<Arc<Rule>>,
}

/// Filter evaluation scans the whole list; translation lookup stops at
/// the first match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    Filter,
    Translation,
}

/// One level of anchor descent. `pending` holds the remaining children
/// of a wildcard anchor, in reverse name order so `pop` yields them in
/// name order.
struct Frame {
    set: FrameRules,
    idx: usize,
    pending: Vec<Arc<Anchor>>,
}

enum FrameRules {
    Root,
    Child(Arc<Anchor>),
}

impl Frame {
    fn rules<'a>(&'a self, root: &'a Ruleset) -> &'a [Arc<Rule>] {
        match &self.set {
            FrameRules::Root => root.rules(),
            FrameRules::Child(anchor) => anchor.ruleset.rules(),
        }
    }

    fn anchor(&self) -> Option<Arc<Anchor>> {
        match &self.set {
            FrameRules::Root => None,
            FrameRules::Child(anchor) => Some(anchor.clone()),
        }
    }
}

/// Evaluates `ruleset` against `pd`. Returns the matched terminal rule
/// (falling back to `default_rule`), its anchor, and the accumulated
/// `Match` rules.
pub fn evaluate<R: Rng>(
    ruleset: &Ruleset,
    default_rule: &Arc<Rule>,
    pd: &PacketDescriptor,
    mode: EvalMode,
    rng: &mut R,
) -> RuleMatch {
    let mut matched: Option<(Arc<Rule>, Option<Arc<Anchor>>)> = None;
    let mut match_rules = Vec::new();
    let mut stack: Vec<Frame> = Vec::with_capacity(4);
    let mut frame = Frame { set: FrameRules::Root, idx: 0, pending: Vec::new() };

    'scan: loop {
        let rules = frame.rules(ruleset);
        if frame.idx >= rules.len() {
            // Wildcard anchors chain their remaining children before the
            // frame pops.
            if let Some(child) = frame.pending.pop() {
                let pending = std::mem::take(&mut frame.pending);
                frame = Frame { set: FrameRules::Child(child), idx: 0, pending };
                continue;
            }
            frame = match stack.pop() {
                Some(parent) => parent,
                None => break,
            };
            continue;
        }
        let rule = rules[frame.idx].clone();

        match step(&rule, pd, rng) {
            Step::Skip(next) => {
                frame.idx = next;
                continue;
            }
            Step::Matched => {}
        }

        if let Some(anchor_ref) = &rule.anchor {
            frame.idx += 1;
            if stack.len() >= ANCHOR_STACK_DEPTH {
                warn!("anchor stack overflow at rule {}, not descending", rule.number);
                continue;
            }
            let (set, pending) = if anchor_ref.wildcard {
                let mut children: Vec<_> =
                    anchor_ref.anchor.children.values().cloned().collect();
                children.reverse();
                match children.pop() {
                    Some(first) => (FrameRules::Child(first), children),
                    None => continue,
                }
            } else {
                (FrameRules::Child(anchor_ref.anchor.clone()), Vec::new())
            };
            stack.push(frame);
            frame = Frame { set, idx: 0, pending };
            continue;
        }

        match rule.action {
            Action::Match => {
                match_rules.push(rule);
                frame.idx += 1;
            }
            Action::Pass | Action::Block => {
                let anchor = frame.anchor();
                let quick = rule.quick;
                matched = Some((rule, anchor));
                if quick || mode == EvalMode::Translation {
                    break 'scan;
                }
                frame.idx += 1;
            }
        }
    }

    match matched {
        Some((rule, anchor)) => RuleMatch { rule, anchor, match_rules },
        None => RuleMatch { rule: default_rule.clone(), anchor: None, match_rules },
    }
}

enum Step {
    /// A predicate failed; resume at this index.
    Skip(usize),
    Matched,
}

/// Tests one rule's predicates in the fixed cheapest-first order. Skip
/// categories jump via the precomputed indices; the cheap tail predicates
/// advance one rule at a time.
fn step<R: Rng>(rule: &Rule, pd: &PacketDescriptor, rng: &mut R) -> Step {
    let skip = |cat: SkipCat| Step::Skip(rule.skip[cat as usize]);

    if !rule.interface.matches(&pd.interface) {
        return skip(SkipCat::Interface);
    }
    if rule.direction.is_some_and(|dir| dir != pd.direction) {
        return skip(SkipCat::Direction);
    }
    if rule.family.is_some_and(|family| family != pd.family) {
        return skip(SkipCat::Family);
    }
    if rule.protocol.is_some_and(|proto| proto != pd.protocol) {
        return skip(SkipCat::Protocol);
    }
    if !rule.src_addr.matches(&pd.src_addr) {
        return skip(SkipCat::SrcAddr);
    }
    if !rule.dst_addr.matches(&pd.dst_addr) {
        return skip(SkipCat::DstAddr);
    }
    if !rule.src_port.matches(&pd.src_port) {
        return skip(SkipCat::SrcPort);
    }
    if !rule.dst_port.matches(&pd.dst_port) {
        return skip(SkipCat::DstPort);
    }

    let next = Step::Skip(rule.number + 1);
    if let Some(flags) = &rule.flags {
        // A flag matcher only ever matches TCP.
        if pd.protocol != Protocol::Tcp {
            return next;
        }
        match pd.tcp() {
            Some(tcp) if flags.matches(&tcp.flags) => {}
            _ => return next,
        }
    }
    if rule.tos.is_some_and(|tos| tos != pd.tos) {
        return next;
    }
    if rule.tag_match.is_some_and(|tag| Some(tag) != pd.tag) {
        return next;
    }
    if let Some(prob) = rule.probability {
        // One draw per evaluation of the rule.
        if rng.gen::<u32>() >= prob {
            return next;
        }
    }
    Step::Matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchers::PortMatcher;
    use crate::packets::testutil::{self, v4};
    use crate::packets::Direction;
    use crate::rules::StatePolicy;
    use rand::rngs::mock::StepRng;
    use std::collections::BTreeMap;

    fn port(p: u16) -> Option<PortMatcher> {
        Some(PortMatcher { range: p..=p, invert: false })
    }

    fn tcp_syn(dst_port: u16) -> PacketDescriptor {
        testutil::tcp_syn((v4(10, 0, 0, 5), 5000), (v4(192, 0, 2, 1), dst_port), 1000, Direction::Out)
    }

    fn default_block() -> Arc<Rule> {
        Arc::new(Rule {
            action: Action::Block,
            state: StatePolicy::None,
            ..Rule::default()
        })
    }

    fn rng() -> StepRng {
        StepRng::new(0, 0)
    }

    fn eval(set: &Ruleset, pd: &PacketDescriptor) -> RuleMatch {
        evaluate(set, &default_block(), pd, EvalMode::Filter, &mut rng())
    }

    #[test]
    fn quick_rule_short_circuits() {
        let set = Ruleset::new(vec![
            Rule { protocol: Some(Protocol::Tcp), dst_port: port(80), quick: true, ..Rule::default() },
            Rule { protocol: Some(Protocol::Tcp), dst_port: port(443), ..Rule::default() },
        ]);

        let result = eval(&set, &tcp_syn(80));
        assert_eq!(result.rule.number, 0);
        assert_eq!(result.rule.action, Action::Pass);

        let result = eval(&set, &tcp_syn(443));
        assert_eq!(result.rule.number, 1);

        // Nothing matches port 22; the default rule wins.
        let result = eval(&set, &tcp_syn(22));
        assert_eq!(result.rule.action, Action::Block);
    }

    #[test]
    fn last_match_wins_without_quick() {
        let set = Ruleset::new(vec![
            Rule { dst_port: port(80), action: Action::Pass, ..Rule::default() },
            Rule { dst_port: port(80), action: Action::Block, ..Rule::default() },
        ]);
        let result = eval(&set, &tcp_syn(80));
        assert_eq!(result.rule.number, 1);
        assert_eq!(result.rule.action, Action::Block);
    }

    #[test]
    fn match_rules_accumulate_in_order() {
        let set = Ruleset::new(vec![
            Rule { action: Action::Match, tag_set: Some(7), ..Rule::default() },
            Rule { dst_port: port(80), action: Action::Match, ..Rule::default() },
            Rule { dst_port: port(80), action: Action::Pass, ..Rule::default() },
        ]);
        let result = eval(&set, &tcp_syn(80));
        assert_eq!(result.rule.number, 2);
        let numbers: Vec<_> = result.match_rules.iter().map(|r| r.number).collect();
        assert_eq!(numbers, vec![0, 1]);
    }

    fn anchor(name: &str, rules: Vec<Rule>, children: Vec<Arc<Anchor>>) -> Arc<Anchor> {
        Arc::new(Anchor {
            name: name.to_string(),
            ruleset: Ruleset::new(rules),
            children: children.into_iter().map(|a| (a.name.clone(), a)).collect::<BTreeMap<_, _>>(),
        })
    }

    #[test]
    fn singular_anchor_is_descended() {
        let child = anchor(
            "web",
            vec![Rule { dst_port: port(80), quick: true, ..Rule::default() }],
            vec![],
        );
        let set = Ruleset::new(vec![Rule {
            anchor: Some(crate::rules::AnchorRef { anchor: child.clone(), wildcard: false }),
            ..Rule::default()
        }]);
        let result = eval(&set, &tcp_syn(80));
        assert_eq!(result.rule.action, Action::Pass);
        assert_eq!(result.anchor.as_ref().map(|a| a.name.as_str()), Some("web"));
    }

    #[test]
    fn wildcard_anchor_visits_children_in_name_order() {
        let a = anchor("a", vec![Rule { action: Action::Match, ..Rule::default() }], vec![]);
        let b = anchor(
            "b",
            vec![Rule { dst_port: port(80), quick: true, ..Rule::default() }],
            vec![],
        );
        let parent = anchor("parent", vec![], vec![a, b]);
        let set = Ruleset::new(vec![Rule {
            anchor: Some(crate::rules::AnchorRef { anchor: parent, wildcard: true }),
            ..Rule::default()
        }]);
        let result = eval(&set, &tcp_syn(80));
        // Child "a" contributed its match rule before "b" terminated.
        assert_eq!(result.match_rules.len(), 1);
        assert_eq!(result.anchor.as_ref().map(|a| a.name.as_str()), Some("b"));
    }

    #[test]
    fn overdeep_anchors_are_skipped_not_fatal() {
        // Build a chain one deeper than the stack allows; the innermost
        // rule must be unreachable but evaluation still completes.
        let mut inner = anchor(
            "deep",
            vec![Rule { quick: true, ..Rule::default() }],
            vec![],
        );
        for i in 0..ANCHOR_STACK_DEPTH + 1 {
            inner = anchor(
                &format!("level{i}"),
                vec![Rule {
                    anchor: Some(crate::rules::AnchorRef { anchor: inner, wildcard: false }),
                    ..Rule::default()
                }],
                vec![],
            );
        }
        let set = Ruleset::new(vec![Rule {
            anchor: Some(crate::rules::AnchorRef { anchor: inner, wildcard: false }),
            ..Rule::default()
        }]);
        let result = eval(&set, &tcp_syn(80));
        assert_eq!(result.rule.action, Action::Block);
    }

    #[test]
    fn direction_mismatch_skips() {
        let set = Ruleset::new(vec![
            Rule { direction: Some(Direction::In), quick: true, ..Rule::default() },
            Rule { direction: Some(Direction::In), dst_port: port(80), ..Rule::default() },
            Rule { action: Action::Pass, ..Rule::default() },
        ]);
        let mut pd = tcp_syn(80);
        pd.direction = Direction::Out;
        let result = eval(&set, &pd);
        assert_eq!(result.rule.number, 2);
    }
}
