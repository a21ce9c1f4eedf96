//! Scheduling functions.
//!
//! MSF keeps one autonomous cell per direction (hashed from the owner's
//! address), grows and shrinks the set of negotiated cells towards the
//! preferred parent from a used/elapsed histogram, relocates the worst
//! cell, and recovers from schedule inconsistencies with a 6P CLEAR.
//! SFNone does nothing: a static schedule, when wanted, is installed up
//! front by the simulation.

use rand::Rng;
use rand::seq::SliceRandom;

use crate::address::MacAddr;
use crate::engine::{EventKind, SlotOrder};
use crate::mote::tsch::CellOptions;
use crate::mote::{Mote, sixp, tsch};
use crate::packet::{SixPCellDescr, SixPCommand, SixPPayload, SixPReturnCode};
use crate::settings::SfClass;
use crate::simulation::SimCtx;

/// Relocate when the best and worst negotiated cells disagree on PDR by
/// more than this.
const MSF_RELOCATE_PDR_THRESHOLD: f64 = 0.5;
/// Candidate cells offered in ADD/RELOCATE requests.
const MSF_CELL_LIST_LEN: usize = 5;

pub struct Sf {
    pub kind: SfClass,
    cells_elapsed: u32,
    cells_used: u32,
}

impl Sf {
    pub fn new(kind: SfClass) -> Self {
        Sf { kind, cells_elapsed: 0, cells_used: 0 }
    }

    pub fn reset(&mut self) {
        self.cells_elapsed = 0;
        self.cells_used = 0;
    }
}

/// Slot/channel of an autonomous cell, hashed from the cell owner's
/// address (SAX-style). Slot 0 is the minimal cell and never used.
fn autonomous_cell_of(mac: MacAddr, slotframe_length: u32, num_chans: u8) -> (u32, u32) {
    let mut h = mac.host();
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    let slot = 1 + (h % (slotframe_length as u64 - 1)) as u32;
    let channel = ((h >> 32) % num_chans as u64) as u32;
    (slot, channel)
}

/// Install an autonomous cell, probing forward from the hashed slot when
/// it is taken.
fn install_autonomous_cell(
    mote: &mut Mote,
    ctx: &mut SimCtx,
    owner: MacAddr,
    options: CellOptions,
    neighbor: Option<MacAddr>,
) {
    let length = mote.tsch.slotframes[0].length;
    let (slot, channel) = autonomous_cell_of(owner, length, ctx.settings.phy_num_chans);
    for probe in 0..length - 1 {
        let candidate = 1 + (slot - 1 + probe) % (length - 1);
        if tsch::try_add_cell(mote, ctx, 0, candidate, channel, options, neighbor).is_ok() {
            return;
        }
    }
    log::warn!("mote {}: no free slot for an autonomous cell", mote.id);
}

fn schedule_housekeeping(mote: &Mote, ctx: &mut SimCtx) {
    let slots = ctx.settings.seconds_to_slots(ctx.settings.sf_msf_housekeeping_period).max(1);
    let asn = ctx.engine.asn();
    ctx.engine.schedule(asn + slots, SlotOrder::Stack, EventKind::MsfHousekeeping { mote: mote.id });
}

/// The mote finished joining: set up the autonomous RX cell and start the
/// housekeeping cycle.
pub fn indication_joined(mote: &mut Mote, ctx: &mut SimCtx) {
    if mote.sf.kind != SfClass::Msf {
        return;
    }
    let own = mote.mac_addr;
    install_autonomous_cell(mote, ctx, own, CellOptions::RX, None);
    schedule_housekeeping(mote, ctx);
}

/// A new on-link neighbour appeared. MSF adds cells lazily (on parent
/// selection), so this is informational.
pub fn indication_neighbor_added(_mote: &mut Mote, _ctx: &mut SimCtx, _neighbor: MacAddr) {}

/// A dedicated TX cell towards the preferred parent elapsed.
pub fn indication_dedicated_tx_cell_elapsed(mote: &mut Mote, _ctx: &mut SimCtx, used: bool) {
    if mote.sf.kind != SfClass::Msf {
        return;
    }
    mote.sf.cells_elapsed += 1;
    if used {
        mote.sf.cells_used += 1;
    }
}

/// Move the schedule to a new preferred parent: clear the old peer, set up
/// the autonomous TX cell towards the new one and renegotiate as many
/// cells as the old parent had.
pub fn schedule_parent_change(
    mote: &mut Mote,
    ctx: &mut SimCtx,
    old: Option<MacAddr>,
    new: MacAddr,
) {
    if mote.sf.kind != SfClass::Msf {
        return;
    }

    let mut cells_to_renegotiate = 1;
    if let Some(old_parent) = old {
        cells_to_renegotiate = negotiated_tx_cells(mote, old_parent).len().max(1);
        clear_cells_with(mote, ctx, old_parent);
        sixp::send_request(
            mote,
            ctx,
            old_parent,
            SixPCommand::Clear,
            CellOptions::empty(),
            0,
            Vec::new(),
            Vec::new(),
            Vec::new(),
        );
    }

    install_autonomous_cell(mote, ctx, new, CellOptions::TX | CellOptions::SHARED, Some(new));
    request_add_cells(mote, ctx, new, cells_to_renegotiate);
}

/// Dedicated, negotiated TX cells towards a peer (the autonomous TX cell
/// is shared and excluded).
fn negotiated_tx_cells(mote: &Mote, peer: MacAddr) -> Vec<(u32, u32, Option<f64>)> {
    mote.tsch
        .slotframes
        .iter()
        .flat_map(|sf| sf.iter())
        .filter(|c| {
            c.neighbor == Some(peer)
                && c.options.contains(CellOptions::TX)
                && !c.options.contains(CellOptions::SHARED)
        })
        .map(|c| (c.slot_offset, c.channel_offset, c.pdr_estimate()))
        .collect()
}

fn pick_candidate_cells(mote: &Mote, ctx: &mut SimCtx, count: usize) -> Vec<SixPCellDescr> {
    let available = mote.tsch.available_slots();
    let num_chans = ctx.settings.phy_num_chans;
    available
        .choose_multiple(&mut ctx.rng, count)
        .map(|slot| SixPCellDescr {
            slot_offset: *slot,
            channel_offset: ctx.rng.gen_range(0..num_chans) as u32,
        })
        .collect()
}

fn request_add_cells(mote: &mut Mote, ctx: &mut SimCtx, peer: MacAddr, count: usize) {
    let candidates = pick_candidate_cells(mote, ctx, MSF_CELL_LIST_LEN);
    if candidates.is_empty() {
        return;
    }
    sixp::send_request(
        mote,
        ctx,
        peer,
        SixPCommand::Add,
        CellOptions::TX,
        count,
        candidates,
        Vec::new(),
        Vec::new(),
    );
}

fn request_delete_cells(mote: &mut Mote, ctx: &mut SimCtx, peer: MacAddr, count: usize) {
    let cells: Vec<SixPCellDescr> = negotiated_tx_cells(mote, peer)
        .into_iter()
        .take(count)
        .map(|(slot, channel, _)| SixPCellDescr { slot_offset: slot, channel_offset: channel })
        .collect();
    if cells.is_empty() {
        return;
    }
    let count = cells.len();
    sixp::send_request(
        mote,
        ctx,
        peer,
        SixPCommand::Delete,
        CellOptions::TX,
        count,
        cells,
        Vec::new(),
        Vec::new(),
    );
}

/// Periodic MSF evaluation of the negotiated-cell budget.
pub fn on_housekeeping(mote: &mut Mote, ctx: &mut SimCtx) {
    if mote.sf.kind != SfClass::Msf {
        return;
    }
    schedule_housekeeping(mote, ctx);

    let elapsed = mote.sf.cells_elapsed;
    let used = mote.sf.cells_used;
    mote.sf.reset();

    if !mote.secjoin.joined {
        return;
    }
    let Some(parent) = mote.rpl.preferred_parent else { return };

    if elapsed > 0 {
        let usage = used as f64 / elapsed as f64;
        let total_cells = mote.tsch.num_cells();
        if usage >= ctx.settings.sf_msf_lim_num_cells_used_high
            && total_cells < ctx.settings.sf_msf_max_num_cells
        {
            request_add_cells(mote, ctx, parent, ctx.settings.sf_msf_num_cells_to_add_remove);
            return;
        }
        if usage <= ctx.settings.sf_msf_lim_num_cells_used_low {
            request_delete_cells(mote, ctx, parent, ctx.settings.sf_msf_num_cells_to_add_remove);
            return;
        }
    }

    // relocation: move the worst-PDR negotiated cell when it clearly lags
    let cells = negotiated_tx_cells(mote, parent);
    let estimates: Vec<(u32, u32, f64)> = cells
        .into_iter()
        .filter_map(|(slot, channel, pdr)| pdr.map(|p| (slot, channel, p)))
        .collect();
    if estimates.len() < 2 {
        return;
    }
    let best = estimates.iter().map(|(_, _, p)| *p).fold(f64::MIN, f64::max);
    let (worst_slot, worst_channel, worst_pdr) = estimates
        .iter()
        .copied()
        .min_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
        .expect("at least two estimates");
    if best - worst_pdr > MSF_RELOCATE_PDR_THRESHOLD {
        let candidates = pick_candidate_cells(mote, ctx, MSF_CELL_LIST_LEN);
        if candidates.is_empty() {
            return;
        }
        sixp::send_request(
            mote,
            ctx,
            parent,
            SixPCommand::Relocate,
            CellOptions::TX,
            1,
            Vec::new(),
            candidates,
            vec![SixPCellDescr { slot_offset: worst_slot, channel_offset: worst_channel }],
        );
    }
}

/// SeqNum mismatch observed: wipe the pair's negotiated schedule and tell
/// the peer to do the same.
pub fn detect_schedule_inconsistency(mote: &mut Mote, ctx: &mut SimCtx, peer: MacAddr) {
    if mote.sf.kind != SfClass::Msf {
        return;
    }
    clear_cells_with(mote, ctx, peer);
    sixp::send_request(
        mote,
        ctx,
        peer,
        SixPCommand::Clear,
        CellOptions::empty(),
        0,
        Vec::new(),
        Vec::new(),
        Vec::new(),
    );
}

/// Remove every cell shared with a peer; the autonomous TX cell is
/// reinstalled when the peer is still our parent.
pub fn clear_cells_with(mote: &mut Mote, ctx: &mut SimCtx, peer: MacAddr) {
    for (handle, slot, _channel) in mote.tsch.cells_with(peer) {
        tsch::delete_cell(mote, ctx, handle, slot);
    }
    if mote.sf.kind == SfClass::Msf && mote.rpl.preferred_parent == Some(peer) {
        install_autonomous_cell(mote, ctx, peer, CellOptions::TX | CellOptions::SHARED, Some(peer));
    }
}

/// Responder-side policy for ADD/DELETE/RELOCATE requests.
pub fn handle_6p_request(
    mote: &mut Mote,
    ctx: &mut SimCtx,
    peer: MacAddr,
    request: &SixPPayload,
) -> (SixPReturnCode, Vec<SixPCellDescr>) {
    if mote.sf.kind != SfClass::Msf {
        return (SixPReturnCode::ErrSfId, Vec::new());
    }
    let crate::packet::SixPCode::Command(command) = request.code else {
        return (SixPReturnCode::ErrVersion, Vec::new());
    };
    match command {
        SixPCommand::Add => {
            if mote.tsch.num_cells() + request.num_cells > ctx.settings.sf_msf_max_num_cells {
                return (SixPReturnCode::ErrNoRes, Vec::new());
            }
            if request.cell_list.is_empty() {
                // three-step: propose our own candidates
                return (SixPReturnCode::Success, pick_candidate_cells(mote, ctx, MSF_CELL_LIST_LEN));
            }
            let chosen = choose_from_proposal(mote, &request.cell_list, request.num_cells);
            (SixPReturnCode::Success, chosen)
        }
        SixPCommand::Delete => {
            let ours: Vec<u32> =
                mote.tsch.cells_with(peer).into_iter().map(|(_, slot, _)| slot).collect();
            if request.cell_list.is_empty() {
                let proposal: Vec<SixPCellDescr> = mote
                    .tsch
                    .cells_with(peer)
                    .into_iter()
                    .take(MSF_CELL_LIST_LEN)
                    .map(|(_, slot, ch)| SixPCellDescr { slot_offset: slot, channel_offset: ch })
                    .collect();
                return (SixPReturnCode::Success, proposal);
            }
            if request.cell_list.iter().any(|c| !ours.contains(&c.slot_offset)) {
                return (SixPReturnCode::ErrCellList, Vec::new());
            }
            let chosen = request.cell_list.iter().take(request.num_cells).copied().collect();
            (SixPReturnCode::Success, chosen)
        }
        SixPCommand::Relocate => {
            let ours: Vec<u32> =
                mote.tsch.cells_with(peer).into_iter().map(|(_, slot, _)| slot).collect();
            if request.relocation_cell_list.iter().any(|c| !ours.contains(&c.slot_offset)) {
                return (SixPReturnCode::ErrCellList, Vec::new());
            }
            let chosen = choose_from_proposal(
                mote,
                &request.candidate_cell_list,
                request.relocation_cell_list.len(),
            );
            if chosen.is_empty() {
                return (SixPReturnCode::ErrCellList, Vec::new());
            }
            (SixPReturnCode::Success, chosen)
        }
        _ => (SixPReturnCode::ErrVersion, Vec::new()),
    }
}

/// Pick the cells we can actually host from a peer's proposal.
pub fn choose_from_proposal(
    mote: &Mote,
    proposal: &[SixPCellDescr],
    wanted: usize,
) -> Vec<SixPCellDescr> {
    let available = mote.tsch.available_slots();
    proposal
        .iter()
        .filter(|c| available.contains(&c.slot_offset))
        .take(wanted)
        .copied()
        .collect()
}

/// Completion callback of an initiated transaction.
pub fn on_6p_transaction_done(
    mote: &mut Mote,
    ctx: &mut SimCtx,
    peer: MacAddr,
    _command: SixPCommand,
    outcome: sixp::TransactionOutcome,
) {
    if mote.sf.kind != SfClass::Msf {
        return;
    }
    if let sixp::TransactionOutcome::Completed { code: SixPReturnCode::ErrSeqNum, .. } = outcome {
        // the peer's counter disagrees with ours: full reschedule
        detect_schedule_inconsistency(mote, ctx, peer);
    }
    // everything else is retried, if still needed, at the next
    // housekeeping evaluation
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autonomous_cells_stay_inside_the_slotframe() {
        for id in 0..200 {
            let (slot, channel) = autonomous_cell_of(MacAddr::from_mote_id(id), 101, 16);
            assert!((1..101).contains(&slot));
            assert!(channel < 16);
        }
    }

    #[test]
    fn autonomous_cells_are_deterministic() {
        let mac = MacAddr::from_mote_id(42);
        assert_eq!(autonomous_cell_of(mac, 101, 16), autonomous_cell_of(mac, 101, 16));
    }

    #[test]
    fn autonomous_cells_spread_over_slots() {
        let mut seen = std::collections::HashSet::new();
        for id in 1..50 {
            seen.insert(autonomous_cell_of(MacAddr::from_mote_id(id), 101, 16).0);
        }
        // a degenerate hash would pile everything onto a few slots
        assert!(seen.len() > 30);
    }
}
