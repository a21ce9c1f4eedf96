//! RPL routing layer.
//!
//! Non-storing mode: every mote keeps a rank, a preferred parent and a
//! small parent set computed from overheard DIOs; DAOs flow up to the DAG
//! root, which assembles downward source routes from the advertised
//! (child, parent) pairs.

use std::collections::{BTreeMap, HashSet};

use rand::Rng;
use serde_json::json;

use crate::address::{Ipv6Addr, MacAddr};
use crate::connectivity::Connectivity;
use crate::engine::{EventKind, SlotOrder};
use crate::mote::{Mote, app, sf, sixlowpan};
use crate::packet::{
    DaoPayload, DioPayload, LENGTH_DAO, LENGTH_DIO, MacHeader, NetHeader, Packet, Payload,
};
use crate::simlog::types as logtypes;
use crate::simulation::SimCtx;

pub const RPL_MIN_HOP_RANK_INCREASE: u16 = 256;
/// Rank of the DAG root.
pub const RPL_ROOT_RANK: u16 = RPL_MIN_HOP_RANK_INCREASE;
/// Candidates whose rank increase exceeds this are unusable.
pub const RPL_MAX_RANK_INCREASE: u16 = 2560;
/// A new parent must improve the rank by more than this to displace the
/// current one.
pub const RPL_PARENT_SWITCH_THRESHOLD: u16 = 640;
pub const RPL_PARENT_SET_SIZE: usize = 3;
/// Pseudo-count weight of the static link PDR in the ETX estimate.
pub const RPL_NUM_SUFFICIENT_TX: u32 = 10;
/// Relative jitter applied to the DAO period.
const DAO_JITTER: f64 = 0.2;

/// The root has no stored route towards the destination.
#[derive(Debug, PartialEq, Eq)]
pub struct NoSourceRouteError {
    pub dst_host: u64,
}

impl std::fmt::Display for NoSourceRouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no source route towards host {:#x}", self.dst_host)
    }
}

impl std::error::Error for NoSourceRouteError {}

pub struct Rpl {
    pub rank: Option<u16>,
    pub preferred_parent: Option<MacAddr>,
    pub parent_set: Vec<MacAddr>,
    pub neighbor_ranks: BTreeMap<MacAddr, u16>,
    pub dodag_id: Option<Ipv6Addr>,
    /// One-shot bypass of the DIO probability gate, set when a routing
    /// inconsistency was detected.
    dio_kick: bool,
    /// Root only: child host -> parent MAC, learned from DAOs.
    parent_child_from_daos: BTreeMap<u64, MacAddr>,
}

impl Rpl {
    pub fn new() -> Self {
        Rpl {
            rank: None,
            preferred_parent: None,
            parent_set: Vec::new(),
            neighbor_ranks: BTreeMap::new(),
            dodag_id: None,
            dio_kick: false,
            parent_child_from_daos: BTreeMap::new(),
        }
    }

    /// Fixed state of the DAG root.
    pub fn init_root(&mut self, own_global: Ipv6Addr) {
        self.rank = Some(RPL_ROOT_RANK);
        self.dodag_id = Some(own_global);
    }

    pub fn reset(&mut self) {
        self.rank = None;
        self.preferred_parent = None;
        self.parent_set.clear();
        self.neighbor_ranks.clear();
        self.dodag_id = None;
        self.dio_kick = false;
    }

    pub fn dag_rank(&self) -> Option<u16> {
        self.rank.map(|r| r / RPL_MIN_HOP_RANK_INCREASE)
    }

    pub fn kick_dio(&mut self) {
        self.dio_kick = true;
    }

    pub fn take_dio_kick(&mut self) -> bool {
        std::mem::replace(&mut self.dio_kick, false)
    }

    pub fn known_children(&self) -> usize {
        self.parent_child_from_daos.len()
    }
}

/// ETX towards a neighbour: observed TX counters smoothed towards the
/// static link PDR with a pseudo-count prior.
fn etx(mote: &Mote, conn: &Connectivity, neighbor: MacAddr) -> f64 {
    let (num_tx, num_tx_ack) = mote.tsch.tx_counters_to(neighbor);
    let pdr = conn.get_pdr(mote.id, neighbor.mote_id(), 0);
    let prior = RPL_NUM_SUFFICIENT_TX as f64;
    let denominator = num_tx_ack as f64 + prior * pdr;
    if denominator <= 0.0 {
        return f64::INFINITY;
    }
    (num_tx as f64 + prior) / denominator
}

fn rank_increase(mote: &Mote, conn: &Connectivity, neighbor: MacAddr) -> u32 {
    let etx = etx(mote, conn, neighbor);
    if !etx.is_finite() {
        return u32::MAX;
    }
    ((3.0 * etx - 2.0) * RPL_MIN_HOP_RANK_INCREASE as f64).round() as u32
}

fn candidate_rank(mote: &Mote, conn: &Connectivity, neighbor: MacAddr) -> Option<u16> {
    let advertised = *mote.rpl.neighbor_ranks.get(&neighbor)?;
    let increase = rank_increase(mote, conn, neighbor);
    if increase > RPL_MAX_RANK_INCREASE as u32 {
        return None;
    }
    Some((advertised as u32 + increase).min(u16::MAX as u32) as u16)
}

/// Build a DIO on demand for TSCH. `None` until this mote has a rank and a
/// DODAG to advertise.
pub fn create_dio(mote: &Mote) -> Option<Packet> {
    let rank = mote.rpl.rank?;
    let dodag_id = mote.rpl.dodag_id?;
    let mut packet = Packet::new(
        Payload::Dio(DioPayload { rank, dodag_id }),
        NetHeader::new(mote.link_local_addr(), Ipv6Addr::AllRplNodes, LENGTH_DIO),
    );
    packet.mac = Some(MacHeader {
        src_mac: mote.mac_addr,
        dst_mac: MacAddr::BROADCAST,
        retries_left: 0,
    });
    Some(packet)
}

/// Process an overheard DIO: track the neighbour's rank and re-run parent
/// selection.
pub fn action_receive_dio(mote: &mut Mote, conn: &Connectivity, ctx: &mut SimCtx, packet: &Packet) {
    if mote.dag_root || !mote.tsch.is_sync || !mote.secjoin.joined {
        return;
    }
    let Payload::Dio(dio) = &packet.payload else { return };
    let src_mac = packet.mac.as_ref().expect("DIO without MAC header").src_mac;

    mote.rpl.neighbor_ranks.insert(src_mac, dio.rank);
    if mote.rpl.dodag_id.is_none() {
        mote.rpl.dodag_id = Some(dio.dodag_id);
        schedule_dao(mote, ctx);
    }
    update_parent(mote, conn, ctx);
}

fn update_parent(mote: &mut Mote, conn: &Connectivity, ctx: &mut SimCtx) {
    let mut best: Option<(MacAddr, u16)> = None;
    let neighbors: Vec<MacAddr> = mote.rpl.neighbor_ranks.keys().copied().collect();
    for neighbor in &neighbors {
        let Some(candidate) = candidate_rank(mote, conn, *neighbor) else { continue };
        let better = match best {
            None => true,
            Some((_, best_rank)) => candidate < best_rank,
        };
        if better {
            best = Some((*neighbor, candidate));
        }
    }
    let Some((best_neighbor, best_rank)) = best else { return };

    let old_parent = mote.rpl.preferred_parent;
    match old_parent {
        None => {
            switch_parent(mote, ctx, None, best_neighbor, best_rank);
        }
        Some(current) if current == best_neighbor => {
            mote.rpl.rank = Some(best_rank);
        }
        Some(current) => {
            match candidate_rank(mote, conn, current) {
                // hysteresis: only move for a clear improvement
                Some(current_rank) => {
                    if current_rank.saturating_sub(best_rank) > RPL_PARENT_SWITCH_THRESHOLD {
                        switch_parent(mote, ctx, Some(current), best_neighbor, best_rank);
                    } else {
                        mote.rpl.rank = Some(current_rank);
                    }
                }
                // current parent no longer acceptable
                None => switch_parent(mote, ctx, Some(current), best_neighbor, best_rank),
            }
        }
    }

    // parent set: up to three candidates advertising a rank below ours
    let own_rank = mote.rpl.rank.unwrap_or(u16::MAX);
    let mut candidates: Vec<(u16, MacAddr)> = neighbors
        .iter()
        .filter(|n| mote.rpl.neighbor_ranks[*n] < own_rank)
        .filter_map(|n| candidate_rank(mote, conn, *n).map(|r| (r, *n)))
        .collect();
    candidates.sort();
    mote.rpl.parent_set = candidates
        .into_iter()
        .take(RPL_PARENT_SET_SIZE)
        .map(|(_, neighbor)| neighbor)
        .collect();
}

fn switch_parent(
    mote: &mut Mote,
    ctx: &mut SimCtx,
    old: Option<MacAddr>,
    new: MacAddr,
    new_rank: u16,
) {
    mote.rpl.preferred_parent = Some(new);
    mote.rpl.rank = Some(new_rank);
    ctx.log.log(
        ctx.engine.asn(),
        logtypes::RPL_CHURN,
        json!({
            "_mote_id": mote.id,
            "preferredParent": new.to_string(),
            "oldParent": old.map(|p| p.to_string()),
            "rank": new_rank,
        }),
    );
    sf::schedule_parent_change(mote, ctx, old, new);
    app::start(mote, ctx);
}

/// Arm the periodic DAO timer (first shot jittered like the rest).
pub fn start_dao(mote: &mut Mote, ctx: &mut SimCtx) {
    schedule_dao(mote, ctx);
}

fn schedule_dao(mote: &mut Mote, ctx: &mut SimCtx) {
    let period = ctx.settings.rpl_dao_period;
    if period <= 0.0 || mote.dag_root {
        return;
    }
    let jitter = 1.0 + ctx.rng.gen_range(-DAO_JITTER..DAO_JITTER);
    let slots = ctx.settings.seconds_to_slots(period * jitter).max(1);
    let asn = ctx.engine.asn();
    ctx.engine.schedule(asn + slots, SlotOrder::Stack, EventKind::RplSendDao { mote: mote.id });
}

/// Periodic DAO towards the root, carrying our (address, parent) pair.
pub fn on_send_dao(mote: &mut Mote, ctx: &mut SimCtx) {
    if mote.secjoin.joined && !mote.dag_root {
        if let (Some(parent), Some(dodag_id)) = (mote.rpl.preferred_parent, mote.rpl.dodag_id) {
            let packet = Packet::new(
                Payload::Dao(DaoPayload { child: mote.global_addr(), parent }),
                NetHeader::new(mote.global_addr(), dodag_id, LENGTH_DAO),
            );
            sixlowpan::send(mote, ctx, packet);
        }
    }
    schedule_dao(mote, ctx);
}

/// Root side: absorb the (child, parent) pair of a DAO.
pub fn action_receive_dao(mote: &mut Mote, _ctx: &mut SimCtx, packet: &Packet) {
    if !mote.dag_root {
        return;
    }
    let Payload::Dao(dao) = &packet.payload else { return };
    if let Some(child_host) = dao.child.host() {
        mote.rpl.parent_child_from_daos.insert(child_host, dao.parent);
    }
}

/// Walk the DAO-learned chain from the root down to `dst_host`. The result
/// lists every hop below the root, ending at the destination.
pub fn compute_source_route(mote: &Mote, dst_host: u64) -> Result<Vec<Ipv6Addr>, NoSourceRouteError> {
    let root_host = mote.mac_addr.host();
    let mut chain = Vec::new();
    let mut visited = HashSet::new();
    let mut current = dst_host;
    while current != root_host {
        if !visited.insert(current) {
            // the stored pairs form a loop
            return Err(NoSourceRouteError { dst_host });
        }
        chain.push(Ipv6Addr::Global(current));
        let parent = mote
            .rpl
            .parent_child_from_daos
            .get(&current)
            .ok_or(NoSourceRouteError { dst_host })?;
        current = parent.host();
    }
    chain.reverse();
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dag_rank_divides_by_min_hop_rank_increase() {
        let mut rpl = Rpl::new();
        assert_eq!(rpl.dag_rank(), None);
        rpl.rank = Some(RPL_ROOT_RANK);
        assert_eq!(rpl.dag_rank(), Some(1));
        rpl.rank = Some(768);
        assert_eq!(rpl.dag_rank(), Some(3));
    }

    #[test]
    fn dio_kick_is_one_shot() {
        let mut rpl = Rpl::new();
        assert!(!rpl.take_dio_kick());
        rpl.kick_dio();
        assert!(rpl.take_dio_kick());
        assert!(!rpl.take_dio_kick());
    }

    #[test]
    fn reset_keeps_root_tables_but_clears_routing_state() {
        let mut rpl = Rpl::new();
        rpl.rank = Some(512);
        rpl.preferred_parent = Some(MacAddr::from_mote_id(1));
        rpl.neighbor_ranks.insert(MacAddr::from_mote_id(1), 256);
        rpl.reset();
        assert_eq!(rpl.rank, None);
        assert_eq!(rpl.preferred_parent, None);
        assert!(rpl.neighbor_ranks.is_empty());
    }
}
