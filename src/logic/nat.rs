//! Network address translation.
//!
//! Translation runs as a pre-pass over the NAT ruleset for a flow's
//! first packet and yields the flow's two keys: the wire key (the flow
//! as the packet arrived, untranslated) and the stack key (the flow
//! after translation). Established flows skip the pre-pass entirely;
//! their packets are rewritten from whichever state key the lookup
//! missed.

use std::net::IpAddr;
use std::sync::Arc;

use rand::Rng;

use crate::checksum;
use crate::context::{DropReason, FilterContext};
use crate::conntrack::{PacketRole, StateKey};
use crate::eval::{self, EvalMode};
use crate::packets::{Direction, Family, PacketDescriptor, Protocol, TransportHeader};
use crate::rules::{NatKind, NatSpec, Rule};
use crate::srcnode::{SourceKind, SourceNode};

/// Ports tried before giving up on a unique translation.
const MAX_PORT_ATTEMPTS: u16 = 128;

/// Default source-port range for masquerading when the rule does not
/// name one.
const PROXY_PORT_RANGE: core::ops::RangeInclusive<u16> = 50001..=65535;

/// The outcome of the translation pre-pass for a new flow.
#[derive(Debug)]
pub(crate) struct Translation {
    pub rule: Arc<Rule>,
    /// The flow after translation, packet-oriented. The wire key is
    /// simply [`StateKey::from_packet`].
    pub stack: StateKey,
    /// Sticky source node holding the pinned pool address, if the rule
    /// asked for one.
    pub sticky: Option<Arc<SourceNode>>,
}

/// Evaluates the NAT ruleset for a flow's first packet. `Ok(None)`
/// means the flow is untranslated, either because nothing matched or
/// because an exemption rule did.
pub(crate) fn translate<R: Rng>(
    ctx: &FilterContext,
    pd: &PacketDescriptor,
    rng: &mut R,
) -> Result<Option<Translation>, DropReason> {
    let ruleset = ctx.nat_rules();
    let result = eval::evaluate(&ruleset, &ctx.default_rule, pd, EvalMode::Translation, rng);
    if Arc::ptr_eq(&result.rule, &ctx.default_rule) {
        return Ok(None);
    }
    let rule = result.rule;
    let Some(nat) = rule.nat.clone() else {
        return Ok(None);
    };

    match nat.kind {
        NatKind::Exempt => Ok(None),
        NatKind::Masquerade => masquerade(ctx, pd, rule, &nat, rng).map(Some),
        NatKind::Redirect => {
            let mut stack = StateKey::from_packet(pd);
            let Some(addr) = nat.pool.first() else {
                return Err(DropReason::Translate);
            };
            stack.endpoints[1].addr = *addr;
            if let Some(range) = &nat.port_range {
                stack.endpoints[1].port = *range.start();
            }
            stack.family = Family::of(addr);
            Ok(Some(Translation { rule, stack, sticky: None }))
        }
        NatKind::Binat => {
            // One-to-one address mapping, ports untouched. Outbound
            // flows rewrite their source, inbound their destination.
            let mut stack = StateKey::from_packet(pd);
            let Some(addr) = nat.pool.first() else {
                return Err(DropReason::Translate);
            };
            let side = match pd.direction {
                Direction::Out => 0,
                Direction::In => 1,
            };
            stack.endpoints[side].addr = *addr;
            stack.family = Family::of(addr);
            Ok(Some(Translation { rule, stack, sticky: None }))
        }
    }
}

/// Source translation: picks a pool address (honoring stickiness) and a
/// source port that makes the translated key unique.
fn masquerade<R: Rng>(
    ctx: &FilterContext,
    pd: &PacketDescriptor,
    rule: Arc<Rule>,
    nat: &NatSpec,
    rng: &mut R,
) -> Result<Translation, DropReason> {
    let mut sticky = None;
    let addr = if nat.sticky {
        let node = ctx
            .sources
            .acquire(SourceKind::StickyNat, pd.src_addr, &rule, ctx.uptime())
            .map_err(|_| DropReason::SourceLimit)?;
        let addr = match ctx.sources.pinned(&node).filter(|a| nat.pool.contains(a)) {
            Some(addr) => addr,
            None => match pick_pool_addr(&nat.pool, rng) {
                Some(addr) => {
                    ctx.sources.pin(&node, addr);
                    addr
                }
                None => {
                    ctx.sources.release(&[Some(node)], false, ctx.uptime());
                    return Err(DropReason::Translate);
                }
            },
        };
        sticky = Some(node);
        addr
    } else {
        pick_pool_addr(&nat.pool, rng).ok_or(DropReason::Translate)?
    };

    let mut stack = StateKey::from_packet(pd);
    stack.endpoints[0].addr = addr;
    stack.family = Family::of(&addr);

    let range = nat.port_range.clone().unwrap_or(PROXY_PORT_RANGE);
    if let Err(reason) = allocate_src_port(ctx, &mut stack, range, rng) {
        ctx.sources.release(&[sticky], false, ctx.uptime());
        return Err(reason);
    }
    Ok(Translation { rule, stack, sticky })
}

fn pick_pool_addr<R: Rng>(pool: &[IpAddr], rng: &mut R) -> Option<IpAddr> {
    match pool.len() {
        0 => None,
        1 => Some(pool[0]),
        n => Some(pool[rng.gen_range(0..n)]),
    }
}

/// Finds a source port that makes `key` unique in the state table.
/// Starts at a random offset into the range and probes upward with
/// wraparound; ICMP reuses the slot for the echo identifier.
fn allocate_src_port<R: Rng>(
    ctx: &FilterContext,
    key: &mut StateKey,
    range: core::ops::RangeInclusive<u16>,
    rng: &mut R,
) -> Result<(), DropReason> {
    // A port already inside the range keeps its value if the key is
    // free; most flows translate the address only.
    if range.contains(&key.endpoints[0].port) && !ctx.states.contains_key(key) {
        return Ok(());
    }

    // Widened so a full 0..=65535 range does not overflow the length.
    let len = u32::from(*range.end()) - u32::from(*range.start()) + 1;
    let start = rng.gen_range(0..len);
    for i in 0..u32::from(MAX_PORT_ATTEMPTS).min(len) {
        let offset = (start + i) % len;
        key.endpoints[0].port = (u32::from(*range.start()) + offset) as u16;
        if !ctx.states.contains_key(key) {
            return Ok(());
        }
    }
    log::warn!(
        "port allocation exhausted {} attempts in {}..={}",
        u32::from(MAX_PORT_ATTEMPTS).min(len),
        range.start(),
        range.end()
    );
    Err(DropReason::Translate)
}

/// What a rewrite did to the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rewrite {
    Done,
    /// The translation crossed address families; the packet must
    /// re-enter the stack as the new family.
    Requeue(Family),
}

/// Rewrites the packet's endpoints from its current key (`from`) to the
/// state's other key (`to`), patching checksums incrementally. `role`
/// orients the keys against the packet: a reply packet's source is the
/// key's responder endpoint.
pub(crate) fn rewrite_packet(
    pd: &mut PacketDescriptor,
    from: &StateKey,
    to: &StateKey,
    role: PacketRole,
) -> Rewrite {
    let new_src = to.endpoints[role.src_index()];
    let new_dst = to.endpoints[role.dst_index()];

    if to.family != from.family {
        // Family translation: nothing survives incremental patching.
        pd.src_addr = new_src.addr;
        pd.dst_addr = new_dst.addr;
        set_port(pd, true, new_src.port);
        set_port(pd, false, new_dst.port);
        pd.family = to.family;
        pd.ip_checksum = match to.family {
            Family::V4 => Some(0),
            Family::V6 => None,
        };
        if let Some(cksum) = pd.transport.checksum_mut() {
            // Recomputed over the new pseudo-header by the serializer.
            *cksum = 0;
        }
        return Rewrite::Requeue(to.family);
    }

    let udp = pd.protocol == Protocol::Udp;
    if pd.src_addr != new_src.addr {
        patch_addr(pd, udp, |p| &mut p.src_addr, new_src.addr);
    }
    if pd.dst_addr != new_dst.addr {
        patch_addr(pd, udp, |p| &mut p.dst_addr, new_dst.addr);
    }
    if pd.src_port != new_src.port {
        patch_port(pd, udp, true, new_src.port);
    }
    if pd.dst_port != new_dst.port {
        patch_port(pd, udp, false, new_dst.port);
    }
    Rewrite::Done
}

fn patch_addr(
    pd: &mut PacketDescriptor,
    udp: bool,
    field: impl Fn(&mut PacketDescriptor) -> &mut IpAddr,
    new: IpAddr,
) {
    let old = *field(pd);
    // The IPv4 header checksum covers the addresses; the pseudo-header
    // folds them into the transport checksum for both families. ICMPv4
    // has no pseudo-header.
    if let Some(ip_sum) = pd.ip_checksum {
        pd.ip_checksum = Some(checksum::fixup_addr(ip_sum, &old, &new, false));
    }
    let pseudo = !matches!(
        (&pd.transport, pd.family),
        (TransportHeader::Icmp(_), Family::V4)
    );
    if pseudo {
        if let Some(cksum) = pd.transport.checksum_mut() {
            *cksum = checksum::fixup_addr(*cksum, &old, &new, udp);
        }
    }
    *field(pd) = new;
}

fn patch_port(pd: &mut PacketDescriptor, udp: bool, src: bool, new: u16) {
    let old = if src { pd.src_port } else { pd.dst_port };
    if let Some(cksum) = pd.transport.checksum_mut() {
        *cksum = checksum::fixup(*cksum, old, new, udp);
    }
    set_port(pd, src, new);
}

/// Keeps the descriptor's port columns and the transport header's own
/// copy in step. ICMP stores the echo identifier there instead.
fn set_port(pd: &mut PacketDescriptor, src: bool, new: u16) {
    if src {
        pd.src_port = new;
    } else {
        pd.dst_port = new;
    }
    if let TransportHeader::Icmp(icmp) = &mut pd.transport {
        // Queries carry the echo id in both port columns.
        icmp.id = new;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Config;
    use crate::conntrack::Endpoint;
    use crate::packets::testutil::{tcp_syn, v4};
    use crate::packets::Family;
    use crate::rules::{Action, Rule};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn nat_rule(kind: NatKind, pool: Vec<IpAddr>, sticky: bool) -> Rule {
        Rule {
            action: Action::Pass,
            nat: Some(NatSpec { kind, pool, port_range: None, sticky }),
            ..Rule::default()
        }
    }

    fn outbound() -> PacketDescriptor {
        tcp_syn((v4(10, 0, 0, 5), 5000), (v4(203, 0, 113, 9), 80), 1000, Direction::Out)
    }

    #[test]
    fn masquerade_rewrites_source_into_the_pool() {
        let ctx = FilterContext::new(Config::default());
        ctx.replace_nat_rules(vec![nat_rule(
            NatKind::Masquerade,
            vec![v4(198, 51, 100, 1)],
            false,
        )]);
        let pd = outbound();
        let mut rng = StdRng::seed_from_u64(3);

        let translation = translate(&ctx, &pd, &mut rng).unwrap().unwrap();
        assert_eq!(translation.stack.endpoints[0].addr, v4(198, 51, 100, 1));
        assert!(PROXY_PORT_RANGE.contains(&translation.stack.endpoints[0].port));
        assert_eq!(translation.stack.endpoints[1].addr, v4(203, 0, 113, 9));
        assert_eq!(translation.stack.endpoints[1].port, 80);
    }

    #[test]
    fn exemption_short_circuits_to_untranslated() {
        let ctx = FilterContext::new(Config::default());
        ctx.replace_nat_rules(vec![
            nat_rule(NatKind::Exempt, Vec::new(), false),
            nat_rule(NatKind::Masquerade, vec![v4(198, 51, 100, 1)], false),
        ]);
        let pd = outbound();
        let mut rng = StdRng::seed_from_u64(3);
        assert!(translate(&ctx, &pd, &mut rng).unwrap().is_none());
    }

    #[test]
    fn empty_nat_ruleset_means_untranslated() {
        let ctx = FilterContext::new(Config::default());
        let pd = outbound();
        let mut rng = StdRng::seed_from_u64(3);
        assert!(translate(&ctx, &pd, &mut rng).unwrap().is_none());
    }

    #[test]
    fn sticky_masquerade_pins_the_pool_address() {
        let ctx = FilterContext::new(Config::default());
        let pool = vec![v4(198, 51, 100, 1), v4(198, 51, 100, 2), v4(198, 51, 100, 3)];
        ctx.replace_nat_rules(vec![nat_rule(NatKind::Masquerade, pool, true)]);
        let pd = outbound();
        let mut rng = StdRng::seed_from_u64(3);

        let first = translate(&ctx, &pd, &mut rng).unwrap().unwrap();
        let pinned = first.stack.endpoints[0].addr;
        for _ in 0..8 {
            let again = translate(&ctx, &pd, &mut rng).unwrap().unwrap();
            assert_eq!(again.stack.endpoints[0].addr, pinned);
        }
    }

    #[test]
    fn redirect_rewrites_destination() {
        let ctx = FilterContext::new(Config::default());
        let mut rule = nat_rule(NatKind::Redirect, vec![v4(10, 0, 0, 8)], false);
        if let Some(nat) = &mut rule.nat {
            nat.port_range = Some(8080..=8080);
        }
        ctx.replace_nat_rules(vec![rule]);
        let pd = tcp_syn(
            (v4(203, 0, 113, 50), 40000),
            (v4(198, 51, 100, 1), 80),
            1000,
            Direction::In,
        );
        let mut rng = StdRng::seed_from_u64(3);

        let translation = translate(&ctx, &pd, &mut rng).unwrap().unwrap();
        assert_eq!(
            translation.stack.endpoints[1],
            Endpoint { addr: v4(10, 0, 0, 8), port: 8080 }
        );
        assert_eq!(translation.stack.endpoints[0].port, 40000);
    }

    #[test]
    fn rewrite_and_reverse_restore_the_checksums() {
        let mut pd = outbound();
        let original = pd.clone();
        let wire = StateKey::from_packet(&pd);
        let mut stack = wire.clone();
        stack.endpoints[0] = Endpoint { addr: v4(198, 51, 100, 1), port: 40000 };

        assert_eq!(
            rewrite_packet(&mut pd, &wire, &stack, PacketRole::Forward),
            Rewrite::Done
        );
        assert_eq!(pd.src_addr, v4(198, 51, 100, 1));
        assert_eq!(pd.src_port, 40000);
        assert_ne!(pd, original);

        assert_eq!(
            rewrite_packet(&mut pd, &stack, &wire, PacketRole::Forward),
            Rewrite::Done
        );
        assert_eq!(pd, original);
    }

    #[test]
    fn family_crossing_rewrite_requeues() {
        let mut pd = outbound();
        let wire = StateKey::from_packet(&pd);
        let mut stack = wire.clone();
        stack.family = Family::V6;
        stack.endpoints[0].addr = "2001:db8::1".parse().unwrap();
        stack.endpoints[1].addr = "2001:db8::9".parse().unwrap();

        assert_eq!(
            rewrite_packet(&mut pd, &wire, &stack, PacketRole::Forward),
            Rewrite::Requeue(Family::V6)
        );
        assert_eq!(pd.family, Family::V6);
        assert_eq!(pd.ip_checksum, None);
    }
}
