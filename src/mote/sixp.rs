//! 6P transaction protocol.
//!
//! Negotiates cell changes between neighbours on behalf of the scheduling
//! function. At most one outstanding transaction per (initiator, responder)
//! pair; a per-peer SeqNum guards against stale state, with 0 reserved as
//! the "reset" value and a wrap of 0xFF to 1. Two-step transactions
//! complete on the link-layer ACK of the response, three-step ones on the
//! ACK of the confirmation. Timeouts invalidate the transaction and hand
//! the failure to the scheduling function.

use std::collections::BTreeMap;

use serde_json::json;

use crate::address::{Ipv6Addr, MacAddr};
use crate::engine::{EventKind, SlotOrder};
use crate::mote::tsch::CellOptions;
use crate::mote::{Mote, sf, sixlowpan, tsch};
use crate::packet::{
    LENGTH_SIXP, NetHeader, Packet, Payload, SixPCellDescr, SixPCode, SixPCommand, SixPMsgType,
    SixPPayload, SixPReturnCode,
};
use crate::settings::Settings;
use crate::simlog::types as logtypes;
use crate::simulation::SimCtx;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransactionType {
    TwoStep,
    ThreeStep,
}

/// Outcome handed to the scheduling-function callback.
#[derive(Clone, Debug)]
pub enum TransactionOutcome {
    Completed { code: SixPReturnCode, cell_list: Vec<SixPCellDescr> },
    Timeout,
}

pub struct Transaction {
    pub peer: MacAddr,
    pub is_initiator: bool,
    pub command: SixPCommand,
    pub request: SixPPayload,
    pub transaction_type: TransactionType,
    pub seq_num: u8,
    /// Cells applied to the schedule when the transaction completes.
    pub pending_cells: Vec<SixPCellDescr>,
    pub cell_options: CellOptions,
}

pub struct SixP {
    seq_nums: BTreeMap<MacAddr, u8>,
    /// Keyed by (peer, this mote is the initiator).
    transactions: BTreeMap<(MacAddr, bool), Transaction>,
}

impl SixP {
    pub fn new() -> Self {
        SixP { seq_nums: BTreeMap::new(), transactions: BTreeMap::new() }
    }

    pub fn reset(&mut self) {
        self.seq_nums.clear();
        self.transactions.clear();
    }

    pub fn seq_num_of(&self, peer: MacAddr) -> u8 {
        self.seq_nums.get(&peer).copied().unwrap_or(0)
    }

    pub fn has_transaction_with(&self, peer: MacAddr) -> bool {
        self.transactions.contains_key(&(peer, true)) || self.transactions.contains_key(&(peer, false))
    }

    fn increment_seq_num(&mut self, peer: MacAddr) {
        let next = wrap_increment(self.seq_num_of(peer));
        self.seq_nums.insert(peer, next);
    }
}

/// SeqNum arithmetic: 0xFF wraps to 1, never back to the reserved 0.
fn wrap_increment(seq: u8) -> u8 {
    if seq == 0xFF { 1 } else { seq + 1 }
}

/// A request carrying a non-empty cell list is answerable in one exchange;
/// ADD/DELETE with an empty list and RELOCATE with an empty candidate list
/// need the responder to propose, making the transaction three-step.
fn classify(command: SixPCommand, payload: &SixPPayload) -> TransactionType {
    match command {
        SixPCommand::Add | SixPCommand::Delete if payload.cell_list.is_empty() => {
            TransactionType::ThreeStep
        }
        SixPCommand::Relocate if payload.candidate_cell_list.is_empty() => {
            TransactionType::ThreeStep
        }
        _ => TransactionType::TwoStep,
    }
}

/// Timeout budget: enough slotframes for the worst-case backoff of every
/// round trip of the transaction.
fn timeout_slots(settings: &Settings, transaction_type: TransactionType) -> u64 {
    let round_trips = match transaction_type {
        TransactionType::TwoStep => 2,
        TransactionType::ThreeStep => 3,
    };
    round_trips
        * settings.tsch_slotframe_length as u64
        * (1u64 << tsch::TSCH_MAX_BACKOFF_EXPONENT)
}

fn send_frame(mote: &mut Mote, ctx: &mut SimCtx, peer: MacAddr, payload: SixPPayload) {
    let packet = Packet::new(
        Payload::SixP(payload),
        NetHeader::new(mote.link_local_addr(), Ipv6Addr::LinkLocal(peer.host()), LENGTH_SIXP),
    );
    sixlowpan::send(mote, ctx, packet);
}

fn schedule_timeout(mote: &Mote, ctx: &mut SimCtx, peer: MacAddr, initiator: bool, slots: u64) {
    let asn = ctx.engine.asn();
    ctx.engine.schedule(
        asn + slots,
        SlotOrder::Stack,
        EventKind::SixPTimeout { mote: mote.id, peer, initiator },
    );
}

/// Start a transaction towards `peer`. Returns false when one is already
/// outstanding; the scheduling function simply retries later.
pub fn send_request(
    mote: &mut Mote,
    ctx: &mut SimCtx,
    peer: MacAddr,
    command: SixPCommand,
    cell_options: CellOptions,
    num_cells: usize,
    cell_list: Vec<SixPCellDescr>,
    candidate_cell_list: Vec<SixPCellDescr>,
    relocation_cell_list: Vec<SixPCellDescr>,
) -> bool {
    if mote.sixp.transactions.contains_key(&(peer, true)) {
        return false;
    }
    let payload = SixPPayload {
        msg_type: SixPMsgType::Request,
        code: SixPCode::Command(command),
        seq_num: mote.sixp.seq_num_of(peer),
        cell_options,
        num_cells,
        cell_list,
        candidate_cell_list,
        relocation_cell_list,
    };
    let transaction_type = classify(command, &payload);
    mote.sixp.transactions.insert(
        (peer, true),
        Transaction {
            peer,
            is_initiator: true,
            command,
            request: payload.clone(),
            transaction_type,
            seq_num: payload.seq_num,
            pending_cells: Vec::new(),
            cell_options,
        },
    );
    schedule_timeout(mote, ctx, peer, true, timeout_slots(&ctx.settings, transaction_type));
    send_frame(mote, ctx, peer, payload);
    true
}

/// Frames dispatched by TSCH.
pub fn recv(mote: &mut Mote, ctx: &mut SimCtx, packet: Packet) {
    let Payload::SixP(payload) = packet.payload else { return };
    let Some(mac) = packet.mac else { return };
    let peer = mac.src_mac;
    match payload.msg_type {
        SixPMsgType::Request => handle_request(mote, ctx, peer, payload),
        SixPMsgType::Response => handle_response(mote, ctx, peer, payload),
        SixPMsgType::Confirmation => handle_confirmation(mote, ctx, peer, payload),
    }
}

fn send_response(
    mote: &mut Mote,
    ctx: &mut SimCtx,
    peer: MacAddr,
    code: SixPReturnCode,
    seq_num: u8,
    num_cells: usize,
    cell_list: Vec<SixPCellDescr>,
) {
    let payload = SixPPayload {
        msg_type: SixPMsgType::Response,
        code: SixPCode::Return(code),
        seq_num,
        cell_options: CellOptions::empty(),
        num_cells,
        cell_list,
        candidate_cell_list: Vec::new(),
        relocation_cell_list: Vec::new(),
    };
    send_frame(mote, ctx, peer, payload);
}

fn handle_request(mote: &mut Mote, ctx: &mut SimCtx, peer: MacAddr, request: SixPPayload) {
    let SixPCode::Command(command) = request.code else { return };
    let expected = mote.sixp.seq_num_of(peer);

    // a stale SeqNum reveals that the peers disagree about their shared
    // schedule; recovery is a CLEAR
    if command != SixPCommand::Clear && request.seq_num != expected {
        send_response(mote, ctx, peer, SixPReturnCode::ErrSeqNum, expected, 0, Vec::new());
        sf::detect_schedule_inconsistency(mote, ctx, peer);
        return;
    }

    if let Some(open) = mote.sixp.transactions.get(&(peer, false)) {
        if open.request == request {
            // duplicate of the request being served: ignore
            return;
        }
        send_response(mote, ctx, peer, SixPReturnCode::ErrBusy, expected, 0, Vec::new());
        return;
    }

    let transaction_type = classify(command, &request);
    let mut response_num_cells = 0;
    let (code, cells) = match command {
        SixPCommand::Clear => {
            mote.sixp.seq_nums.insert(peer, 0);
            sf::clear_cells_with(mote, ctx, peer);
            (SixPReturnCode::Success, Vec::new())
        }
        SixPCommand::Count => {
            // the count rides in num_cells; no cell list
            response_num_cells = mote.tsch.cells_with(peer).len();
            (SixPReturnCode::Success, Vec::new())
        }
        SixPCommand::List => {
            let cells: Vec<SixPCellDescr> = mote
                .tsch
                .cells_with(peer)
                .into_iter()
                .map(|(_, slot, ch)| SixPCellDescr { slot_offset: slot, channel_offset: ch })
                .collect();
            response_num_cells = cells.len();
            (SixPReturnCode::Success, cells)
        }
        SixPCommand::Signal => (SixPReturnCode::Success, Vec::new()),
        SixPCommand::Add | SixPCommand::Delete | SixPCommand::Relocate => {
            let (code, cells) = sf::handle_6p_request(mote, ctx, peer, &request);
            response_num_cells = cells.len();
            (code, cells)
        }
    };

    // install/delete happen when the transaction completes
    let pending = if transaction_type == TransactionType::TwoStep && code == SixPReturnCode::Success
    {
        cells.clone()
    } else {
        Vec::new()
    };
    mote.sixp.transactions.insert(
        (peer, false),
        Transaction {
            peer,
            is_initiator: false,
            command,
            request: request.clone(),
            transaction_type,
            seq_num: request.seq_num,
            pending_cells: pending,
            cell_options: request.cell_options,
        },
    );
    schedule_timeout(mote, ctx, peer, false, timeout_slots(&ctx.settings, transaction_type));
    send_response(mote, ctx, peer, code, request.seq_num, response_num_cells, cells);
}

fn handle_response(mote: &mut Mote, ctx: &mut SimCtx, peer: MacAddr, response: SixPPayload) {
    let SixPCode::Return(code) = response.code else { return };
    let Some(transaction) = mote.sixp.transactions.get(&(peer, true)) else { return };
    let command = transaction.command;
    let transaction_type = transaction.transaction_type;
    let cell_options = transaction.cell_options;

    if code != SixPReturnCode::Success {
        complete(mote, ctx, peer, true, code, Vec::new());
        return;
    }

    match transaction_type {
        TransactionType::TwoStep => {
            apply_cells(mote, ctx, peer, command, &response.cell_list, cell_options, true);
            complete(mote, ctx, peer, true, code, response.cell_list);
        }
        TransactionType::ThreeStep => {
            let wanted = transaction.request.num_cells;
            let chosen = sf::choose_from_proposal(mote, &response.cell_list, wanted);
            if let Some(t) = mote.sixp.transactions.get_mut(&(peer, true)) {
                t.pending_cells = chosen.clone();
            }
            let seq = response.seq_num;
            let confirmation = SixPPayload {
                msg_type: SixPMsgType::Confirmation,
                code: SixPCode::Return(SixPReturnCode::Success),
                seq_num: seq,
                cell_options,
                num_cells: chosen.len(),
                cell_list: chosen,
                candidate_cell_list: Vec::new(),
                relocation_cell_list: Vec::new(),
            };
            send_frame(mote, ctx, peer, confirmation);
            // completion comes with the ACK of the confirmation
        }
    }
}

fn handle_confirmation(mote: &mut Mote, ctx: &mut SimCtx, peer: MacAddr, confirmation: SixPPayload) {
    let Some(transaction) = mote.sixp.transactions.get(&(peer, false)) else { return };
    if transaction.transaction_type != TransactionType::ThreeStep {
        return;
    }
    let command = transaction.command;
    let options = transaction.cell_options;
    let SixPCode::Return(code) = confirmation.code else { return };
    if code == SixPReturnCode::Success {
        apply_cells(mote, ctx, peer, command, &confirmation.cell_list, options, false);
    }
    complete(mote, ctx, peer, false, code, confirmation.cell_list);
}

/// Link-layer ACK of one of our 6P frames.
pub fn on_mac_ack(mote: &mut Mote, ctx: &mut SimCtx, peer: MacAddr, payload: SixPPayload) {
    match payload.msg_type {
        SixPMsgType::Request => {}
        SixPMsgType::Response => {
            let Some(transaction) = mote.sixp.transactions.get(&(peer, false)) else { return };
            // error responses never opened a transaction; do not let them
            // complete an unrelated one
            if payload.code != SixPCode::Return(SixPReturnCode::Success)
                || payload.seq_num != transaction.seq_num
                || transaction.transaction_type != TransactionType::TwoStep
            {
                return;
            }
            let command = transaction.command;
            let options = transaction.cell_options;
            let cells = transaction.pending_cells.clone();
            apply_cells(mote, ctx, peer, command, &cells, options, false);
            complete(mote, ctx, peer, false, SixPReturnCode::Success, cells);
        }
        SixPMsgType::Confirmation => {
            let Some(transaction) = mote.sixp.transactions.get(&(peer, true)) else { return };
            if transaction.transaction_type != TransactionType::ThreeStep {
                return;
            }
            let command = transaction.command;
            let options = transaction.cell_options;
            let cells = transaction.pending_cells.clone();
            apply_cells(mote, ctx, peer, command, &cells, options, true);
            complete(mote, ctx, peer, true, SixPReturnCode::Success, cells);
        }
    }
}

pub fn on_timeout(mote: &mut Mote, ctx: &mut SimCtx, peer: MacAddr, initiator: bool) {
    let Some(transaction) = mote.sixp.transactions.remove(&(peer, initiator)) else { return };
    ctx.log.log(
        ctx.engine.asn(),
        logtypes::SIXP_TRANSACTION_ERROR,
        json!({
            "_mote_id": mote.id,
            "peer": peer.to_string(),
            "cmd": transaction.command.as_str(),
            "error": "TIMEOUT",
        }),
    );
    if initiator {
        sf::on_6p_transaction_done(
            mote,
            ctx,
            peer,
            transaction.command,
            TransactionOutcome::Timeout,
        );
    }
}

/// Tear down a finished transaction, advance the SeqNum on success, log
/// and notify the scheduling function.
fn complete(
    mote: &mut Mote,
    ctx: &mut SimCtx,
    peer: MacAddr,
    initiator: bool,
    code: SixPReturnCode,
    cell_list: Vec<SixPCellDescr>,
) {
    let Some(transaction) = mote.sixp.transactions.remove(&(peer, initiator)) else { return };
    ctx.engine.cancel(&EventKind::SixPTimeout { mote: mote.id, peer, initiator });

    if code == SixPReturnCode::Success {
        if transaction.command == SixPCommand::Clear {
            // both peers fall back to the reserved "reset" value
            mote.sixp.seq_nums.insert(peer, 0);
        } else {
            mote.sixp.increment_seq_num(peer);
        }
        ctx.log.log(
            ctx.engine.asn(),
            logtypes::SIXP_TRANSACTION_COMPLETED,
            json!({
                "_mote_id": mote.id,
                "peer": peer.to_string(),
                "cmd": transaction.command.as_str(),
                "seqNum": mote.sixp.seq_num_of(peer),
                "numCells": cell_list.len(),
            }),
        );
    } else {
        ctx.log.log(
            ctx.engine.asn(),
            logtypes::SIXP_TRANSACTION_ERROR,
            json!({
                "_mote_id": mote.id,
                "peer": peer.to_string(),
                "cmd": transaction.command.as_str(),
                "error": code.as_str(),
            }),
        );
    }

    if initiator {
        sf::on_6p_transaction_done(
            mote,
            ctx,
            peer,
            transaction.command,
            TransactionOutcome::Completed { code, cell_list },
        );
    }
}

/// Apply the negotiated change to the local schedule. The initiator
/// installs the requested options, the responder the mirrored ones.
fn apply_cells(
    mote: &mut Mote,
    ctx: &mut SimCtx,
    peer: MacAddr,
    command: SixPCommand,
    cells: &[SixPCellDescr],
    options: CellOptions,
    initiator: bool,
) {
    let effective = if initiator { options } else { options.mirrored() };
    match command {
        SixPCommand::Add => {
            for cell in cells {
                install_cell(mote, ctx, peer, cell, effective);
            }
        }
        SixPCommand::Delete => {
            for cell in cells {
                tsch::delete_cell(mote, ctx, 0, cell.slot_offset);
            }
        }
        SixPCommand::Relocate => {
            // the relocation list leaves, the agreed cells arrive
            let leaving: Vec<SixPCellDescr> = if initiator {
                mote.sixp
                    .transactions
                    .get(&(peer, true))
                    .map(|t| t.request.relocation_cell_list.clone())
                    .unwrap_or_default()
            } else {
                mote.sixp
                    .transactions
                    .get(&(peer, false))
                    .map(|t| t.request.relocation_cell_list.clone())
                    .unwrap_or_default()
            };
            for cell in leaving {
                tsch::delete_cell(mote, ctx, 0, cell.slot_offset);
            }
            for cell in cells {
                install_cell(mote, ctx, peer, cell, effective);
            }
        }
        SixPCommand::Clear | SixPCommand::Count | SixPCommand::List | SixPCommand::Signal => {}
    }
}

fn install_cell(
    mote: &mut Mote,
    ctx: &mut SimCtx,
    peer: MacAddr,
    cell: &SixPCellDescr,
    options: CellOptions,
) {
    if let Err(e) =
        tsch::try_add_cell(mote, ctx, 0, cell.slot_offset, cell.channel_offset, options, Some(peer))
    {
        log::warn!("mote {}: skipping negotiated cell: {}", mote.id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_num_wraps_to_one() {
        assert_eq!(wrap_increment(0), 1);
        assert_eq!(wrap_increment(1), 2);
        assert_eq!(wrap_increment(0xFE), 0xFF);
        assert_eq!(wrap_increment(0xFF), 1);
    }

    fn request(command: SixPCommand, cells: usize, candidates: usize) -> SixPPayload {
        let descr = |i: u32| SixPCellDescr { slot_offset: i, channel_offset: 0 };
        SixPPayload {
            msg_type: SixPMsgType::Request,
            code: SixPCode::Command(command),
            seq_num: 0,
            cell_options: CellOptions::TX,
            num_cells: 1,
            cell_list: (0..cells as u32).map(descr).collect(),
            candidate_cell_list: (0..candidates as u32).map(descr).collect(),
            relocation_cell_list: Vec::new(),
        }
    }

    #[test]
    fn step_classification_follows_cell_lists() {
        assert_eq!(
            classify(SixPCommand::Add, &request(SixPCommand::Add, 3, 0)),
            TransactionType::TwoStep
        );
        assert_eq!(
            classify(SixPCommand::Add, &request(SixPCommand::Add, 0, 0)),
            TransactionType::ThreeStep
        );
        assert_eq!(
            classify(SixPCommand::Delete, &request(SixPCommand::Delete, 0, 0)),
            TransactionType::ThreeStep
        );
        assert_eq!(
            classify(SixPCommand::Relocate, &request(SixPCommand::Relocate, 1, 0)),
            TransactionType::ThreeStep
        );
        assert_eq!(
            classify(SixPCommand::Relocate, &request(SixPCommand::Relocate, 1, 5)),
            TransactionType::TwoStep
        );
        assert_eq!(
            classify(SixPCommand::Clear, &request(SixPCommand::Clear, 0, 0)),
            TransactionType::TwoStep
        );
    }

    #[test]
    fn timeout_grows_with_round_trips() {
        let settings = Settings::default();
        let two = timeout_slots(&settings, TransactionType::TwoStep);
        let three = timeout_slots(&settings, TransactionType::ThreeStep);
        assert!(three > two);
        assert_eq!(two % settings.tsch_slotframe_length as u64, 0);
    }

    #[test]
    fn seq_num_state_is_per_peer() {
        let mut sixp = SixP::new();
        let a = MacAddr::from_mote_id(1);
        let b = MacAddr::from_mote_id(2);
        sixp.increment_seq_num(a);
        sixp.increment_seq_num(a);
        assert_eq!(sixp.seq_num_of(a), 2);
        assert_eq!(sixp.seq_num_of(b), 0);
    }
}
