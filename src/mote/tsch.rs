//! TSCH link layer.
//!
//! Owns the slotframe schedule, the TX queue, the retransmission backoff
//! and time synchronisation. A mote boots unsynchronised and hunts for an
//! Enhanced Beacon on a random channel every slot; once synced it installs
//! the minimal cell and wakes up only at its active slots. Transmission
//! outcomes come back from the connectivity layer through
//! `tx_done`/`rx_done`.

use std::collections::{BTreeMap, VecDeque};

use bitflags::bitflags;
use rand::Rng;
use serde_json::json;

use crate::address::MacAddr;
use crate::connectivity::Connectivity;
use crate::engine::{EventKind, SlotOrder};
use crate::mote::{Mote, radio, rpl, secjoin, sixlowpan, sixp, sf};
use crate::packet::{
    DropReason, EbPayload, LENGTH_EB, LENGTH_KEEPALIVE, MacHeader, NetHeader, Packet, PacketType,
    Payload,
};
use crate::simlog::types as logtypes;
use crate::simulation::SimCtx;

pub const TSCH_QUEUE_SIZE: usize = 10;
pub const TSCH_MAXTXRETRIES: u8 = 5;
pub const TSCH_MIN_BACKOFF_EXPONENT: u8 = 1;
pub const TSCH_MAX_BACKOFF_EXPONENT: u8 = 7;

/// 802.15.4 hopping sequence expressed in channel offsets (the matrix is
/// indexed by channel 0..phy_numChans).
pub const TSCH_HOPPING_SEQUENCE: [u8; 16] = [5, 6, 12, 7, 15, 4, 14, 11, 8, 0, 1, 2, 13, 3, 9, 10];

/// Samples kept per cell to estimate its PDR.
const CELL_HISTORY_LEN: usize = 32;

bitflags! {
    pub struct CellOptions: u8 {
        const TX     = 0b001;
        const RX     = 0b010;
        const SHARED = 0b100;
    }
}

impl CellOptions {
    pub fn log_str(&self) -> String {
        let mut parts = Vec::new();
        if self.contains(CellOptions::TX) {
            parts.push("TX");
        }
        if self.contains(CellOptions::RX) {
            parts.push("RX");
        }
        if self.contains(CellOptions::SHARED) {
            parts.push("SHARED");
        }
        parts.join("|")
    }

    /// The options the peer of a negotiated cell installs: TX and RX
    /// swapped, SHARED preserved.
    pub fn mirrored(&self) -> CellOptions {
        let mut out = *self & CellOptions::SHARED;
        if self.contains(CellOptions::TX) {
            out |= CellOptions::RX;
        }
        if self.contains(CellOptions::RX) {
            out |= CellOptions::TX;
        }
        out
    }
}

/// A scheduled (slot offset, channel offset) entry.
pub struct Cell {
    pub slot_offset: u32,
    pub channel_offset: u32,
    pub options: CellOptions,
    /// `None` means "any neighbour" (the minimal cell).
    pub neighbor: Option<MacAddr>,
    pub num_tx: u32,
    pub num_tx_ack: u32,
    pub num_rx: u32,
    tx_history: VecDeque<bool>,
}

impl Cell {
    pub fn new(
        slot_offset: u32,
        channel_offset: u32,
        options: CellOptions,
        neighbor: Option<MacAddr>,
    ) -> Self {
        Cell {
            slot_offset,
            channel_offset,
            options,
            neighbor,
            num_tx: 0,
            num_tx_ack: 0,
            num_rx: 0,
            tx_history: VecDeque::with_capacity(CELL_HISTORY_LEN),
        }
    }

    /// Record a transmission on this cell. When `num_tx` reaches 256 both
    /// counters are halved, preserving the ratio (MSF requirement).
    pub fn record_tx(&mut self, acked: bool, broadcast: bool) {
        self.num_tx += 1;
        if acked && !broadcast {
            self.num_tx_ack += 1;
        }
        if !broadcast {
            if self.tx_history.len() == CELL_HISTORY_LEN {
                self.tx_history.pop_front();
            }
            self.tx_history.push_back(acked);
        }
        if self.num_tx == 256 {
            self.num_tx /= 2;
            self.num_tx_ack /= 2;
        }
        debug_assert!(self.num_tx_ack <= self.num_tx);
    }

    /// PDR estimated from the recent transmission history.
    pub fn pdr_estimate(&self) -> Option<f64> {
        if self.tx_history.is_empty() {
            return None;
        }
        let acked = self.tx_history.iter().filter(|a| **a).count();
        Some(acked as f64 / self.tx_history.len() as f64)
    }
}

#[derive(Debug)]
pub enum ScheduleError {
    SlotOccupied { slotframe_handle: u8, slot_offset: u32 },
}

impl std::fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleError::SlotOccupied { slotframe_handle, slot_offset } => write!(
                f,
                "slot offset {} already scheduled in slotframe {}",
                slot_offset, slotframe_handle
            ),
        }
    }
}

impl std::error::Error for ScheduleError {}

/// A repeating schedule of `length` slots. At most one cell per slot
/// offset.
pub struct Slotframe {
    pub handle: u8,
    pub length: u32,
    cells: BTreeMap<u32, Cell>,
}

impl Slotframe {
    pub fn new(handle: u8, length: u32) -> Self {
        Slotframe { handle, length, cells: BTreeMap::new() }
    }

    pub fn try_add(&mut self, cell: Cell) -> Result<(), ScheduleError> {
        assert!(cell.slot_offset < self.length, "slot offset beyond slotframe");
        if self.cells.contains_key(&cell.slot_offset) {
            return Err(ScheduleError::SlotOccupied {
                slotframe_handle: self.handle,
                slot_offset: cell.slot_offset,
            });
        }
        self.cells.insert(cell.slot_offset, cell);
        Ok(())
    }

    pub fn delete(&mut self, slot_offset: u32) -> Option<Cell> {
        self.cells.remove(&slot_offset)
    }

    pub fn cell_at(&self, slot_offset: u32) -> Option<&Cell> {
        self.cells.get(&slot_offset)
    }

    pub fn cell_at_mut(&mut self, slot_offset: u32) -> Option<&mut Cell> {
        self.cells.get_mut(&slot_offset)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values()
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }
}

/// The cell chosen for the current slot, remembered until its outcome.
struct ActiveSlot {
    slotframe_handle: u8,
    slot_offset: u32,
    /// Index into the TX queue when a queued frame is being transmitted;
    /// `None` for generated frames and RX slots.
    queue_index: Option<usize>,
}

pub struct Tsch {
    pub slotframes: Vec<Slotframe>,
    pub tx_queue: Vec<Packet>,
    pub is_sync: bool,
    pub asn_last_sync: u64,
    /// MAC address of the neighbour whose EB synchronised us.
    pub join_proxy: Option<MacAddr>,
    pub backoff_exponent: u8,
    pub backoff_remaining_delay: u32,
    active: Option<ActiveSlot>,
}

impl Tsch {
    pub fn new(slotframe_length: u32) -> Self {
        Tsch {
            slotframes: vec![Slotframe::new(0, slotframe_length)],
            tx_queue: Vec::new(),
            is_sync: false,
            asn_last_sync: 0,
            join_proxy: None,
            backoff_exponent: TSCH_MIN_BACKOFF_EXPONENT,
            backoff_remaining_delay: 0,
            active: None,
        }
    }

    pub fn has_any_tx_cell(&self) -> bool {
        self.slotframes
            .iter()
            .flat_map(|sf| sf.iter())
            .any(|c| c.options.contains(CellOptions::TX))
    }

    /// Does a dedicated TX cell towards this neighbour exist?
    pub fn has_tx_cell_to(&self, neighbor: MacAddr) -> bool {
        self.slotframes.iter().flat_map(|sf| sf.iter()).any(|c| {
            c.options.contains(CellOptions::TX) && c.neighbor == Some(neighbor)
        })
    }

    /// Aggregate (numTx, numTxAck) over the dedicated TX cells towards a
    /// neighbour; the ETX estimator consumes this.
    pub fn tx_counters_to(&self, neighbor: MacAddr) -> (u32, u32) {
        self.slotframes
            .iter()
            .flat_map(|sf| sf.iter())
            .filter(|c| c.options.contains(CellOptions::TX) && c.neighbor == Some(neighbor))
            .fold((0, 0), |(tx, ack), c| (tx + c.num_tx, ack + c.num_tx_ack))
    }

    /// Slot offsets with no cell in any slotframe; offset 0 is reserved
    /// for the minimal cell.
    pub fn available_slots(&self) -> Vec<u32> {
        let length = self.slotframes[0].length;
        (1..length)
            .filter(|offset| self.slotframes.iter().all(|sf| sf.cell_at(*offset).is_none()))
            .collect()
    }

    pub fn cells_with(&self, neighbor: MacAddr) -> Vec<(u8, u32, u32)> {
        self.slotframes
            .iter()
            .flat_map(|sf| {
                sf.iter()
                    .filter(move |c| c.neighbor == Some(neighbor))
                    .map(move |c| (sf.handle, c.slot_offset, c.channel_offset))
            })
            .collect()
    }

    pub fn num_cells(&self) -> usize {
        self.slotframes.iter().map(|sf| sf.num_cells()).sum()
    }

    fn reset_backoff(&mut self) {
        self.backoff_exponent = TSCH_MIN_BACKOFF_EXPONENT;
        self.backoff_remaining_delay = 0;
    }

    /// Draw the wait with the current exponent, then widen the window for
    /// the next failure (802.15.4-2015 rule: the first delay comes from
    /// `rand(0, 2^minBE - 1)`).
    fn increase_backoff(&mut self, rng: &mut rand::rngs::StdRng) {
        self.backoff_remaining_delay = rng.gen_range(0..(1u32 << self.backoff_exponent));
        self.backoff_exponent = (self.backoff_exponent + 1).min(TSCH_MAX_BACKOFF_EXPONENT);
    }
}

/// Physical channel of a cell at a given ASN.
pub fn physical_channel(asn: u64, channel_offset: u32, num_chans: u8) -> u8 {
    let index = ((asn + channel_offset as u64) % TSCH_HOPPING_SEQUENCE.len() as u64) as usize;
    TSCH_HOPPING_SEQUENCE[index] % num_chans
}

/// Install a cell and keep the wake-up schedule consistent. Duplicate slot
/// offsets within one slotframe are a simulator bug.
pub fn add_cell(
    mote: &mut Mote,
    ctx: &mut SimCtx,
    slotframe_handle: u8,
    slot_offset: u32,
    channel_offset: u32,
    options: CellOptions,
    neighbor: Option<MacAddr>,
) {
    try_add_cell(mote, ctx, slotframe_handle, slot_offset, channel_offset, options, neighbor)
        .expect("duplicate cell at slot offset");
}

pub fn try_add_cell(
    mote: &mut Mote,
    ctx: &mut SimCtx,
    slotframe_handle: u8,
    slot_offset: u32,
    channel_offset: u32,
    options: CellOptions,
    neighbor: Option<MacAddr>,
) -> Result<(), ScheduleError> {
    let slotframe = mote
        .tsch
        .slotframes
        .iter_mut()
        .find(|sf| sf.handle == slotframe_handle)
        .expect("unknown slotframe handle");
    slotframe.try_add(Cell::new(slot_offset, channel_offset, options, neighbor))?;
    ctx.log.log(
        ctx.engine.asn(),
        logtypes::TSCH_ADD_CELL,
        json!({
            "_mote_id": mote.id,
            "slotFrameHandle": slotframe_handle,
            "slotOffset": slot_offset,
            "channelOffset": channel_offset,
            "neighbor": neighbor.map(|n| n.to_string()),
            "cellOptions": options.log_str(),
        }),
    );
    if mote.tsch.is_sync {
        schedule_next_active_slot(mote, ctx);
    }
    Ok(())
}

pub fn delete_cell(
    mote: &mut Mote,
    ctx: &mut SimCtx,
    slotframe_handle: u8,
    slot_offset: u32,
) -> Option<Cell> {
    let slotframe = mote
        .tsch
        .slotframes
        .iter_mut()
        .find(|sf| sf.handle == slotframe_handle)?;
    let cell = slotframe.delete(slot_offset)?;
    ctx.log.log(
        ctx.engine.asn(),
        logtypes::TSCH_DELETE_CELL,
        json!({
            "_mote_id": mote.id,
            "slotFrameHandle": slotframe_handle,
            "slotOffset": slot_offset,
            "channelOffset": cell.channel_offset,
            "neighbor": cell.neighbor.map(|n| n.to_string()),
            "cellOptions": cell.options.log_str(),
        }),
    );
    if mote.tsch.is_sync {
        schedule_next_active_slot(mote, ctx);
    }
    Some(cell)
}

pub fn install_minimal_cell(mote: &mut Mote, ctx: &mut SimCtx) {
    add_cell(
        mote,
        ctx,
        0,
        0,
        0,
        CellOptions::TX | CellOptions::RX | CellOptions::SHARED,
        None,
    );
}

/// Begin hunting for an EB: listen on a random channel every slot.
pub fn start_eb_hunt(mote: &mut Mote, ctx: &mut SimCtx) {
    let asn = ctx.engine.asn();
    ctx.engine.schedule(asn + 1, SlotOrder::Stack, EventKind::TschListenForEb { mote: mote.id });
}

pub fn on_listen_for_eb(mote: &mut Mote, ctx: &mut SimCtx) {
    if mote.tsch.is_sync {
        return;
    }
    let num_chans = ctx.settings.phy_num_chans;
    let channel = ctx.rng.gen_range(0..num_chans);
    radio::start_rx(mote, channel);
    let asn = ctx.engine.asn();
    ctx.engine.schedule(asn + 1, SlotOrder::Stack, EventKind::TschListenForEb { mote: mote.id });
}

/// Wake up at the nearest upcoming slot with a scheduled cell.
pub fn schedule_next_active_slot(mote: &mut Mote, ctx: &mut SimCtx) {
    let asn = ctx.engine.asn();
    let length = mote.tsch.slotframes[0].length as u64;
    for delta in 1..=length {
        let offset = ((asn + delta) % length) as u32;
        let scheduled =
            mote.tsch.slotframes.iter().any(|sf| sf.cell_at(offset).is_some());
        if scheduled {
            ctx.engine.schedule(
                asn + delta,
                SlotOrder::Stack,
                EventKind::TschActiveSlot { mote: mote.id },
            );
            return;
        }
    }
}

/// Execute the current active slot: pick a frame and transmit, or listen.
pub fn on_active_slot(mote: &mut Mote, ctx: &mut SimCtx) {
    if !mote.tsch.is_sync {
        return;
    }
    let asn = ctx.engine.asn();
    let length = mote.tsch.slotframes[0].length as u64;
    let slot_offset = (asn % length) as u32;
    let num_chans = ctx.settings.phy_num_chans;

    // frame selection over the cells scheduled at this offset, slotframes
    // in handle order
    let mut tx_selection: Option<(u8, usize)> = None;
    let mut shared_any_cell: Option<u8> = None;
    let mut rx_cell: Option<u8> = None;
    for slotframe in &mote.tsch.slotframes {
        let Some(cell) = slotframe.cell_at(slot_offset) else { continue };
        if cell.options.contains(CellOptions::RX) && rx_cell.is_none() {
            rx_cell = Some(slotframe.handle);
        }
        if !cell.options.contains(CellOptions::TX) {
            continue;
        }
        match cell.neighbor {
            None => {
                if shared_any_cell.is_none() {
                    shared_any_cell = Some(slotframe.handle);
                }
                if tx_selection.is_none() {
                    if let Some(index) = select_frame_for_shared_cell(mote) {
                        tx_selection = Some((slotframe.handle, index));
                    }
                }
            }
            Some(neighbor) => {
                if tx_selection.is_none() {
                    if let Some(index) = mote
                        .tsch
                        .tx_queue
                        .iter()
                        .position(|p| p.mac.as_ref().map(|m| m.dst_mac) == Some(neighbor))
                    {
                        tx_selection = Some((slotframe.handle, index));
                    }
                }
            }
        }
    }

    // retransmissions on shared cells honour the backoff delay: skip the
    // transmission and listen instead
    let mut backoff_skip = false;
    if let Some((handle, index)) = tx_selection {
        let cell_shared = cell_of(mote, handle, slot_offset)
            .map(|c| c.options.contains(CellOptions::SHARED))
            .unwrap_or(false);
        let is_retransmission = mote.tsch.tx_queue[index]
            .mac
            .as_ref()
            .is_some_and(|m| m.retries_left < TSCH_MAXTXRETRIES);
        if cell_shared && is_retransmission && mote.tsch.backoff_remaining_delay > 0 {
            mote.tsch.backoff_remaining_delay -= 1;
            tx_selection = None;
            backoff_skip = true;
        }
    }

    let mut transmitted_on: Option<u8> = None;
    if let Some((handle, index)) = tx_selection {
        let channel_offset =
            cell_of(mote, handle, slot_offset).expect("selected cell exists").channel_offset;
        let channel = physical_channel(asn, channel_offset, num_chans);
        let packet = mote.tsch.tx_queue[index].clone();
        mote.tsch.active =
            Some(ActiveSlot { slotframe_handle: handle, slot_offset, queue_index: Some(index) });
        radio::start_tx(mote, channel, packet);
        transmitted_on = Some(handle);
    } else if let (Some(handle), false) = (shared_any_cell, backoff_skip) {
        // idle shared cell: maybe advertise with an EB or a DIO
        if let Some(packet) = maybe_generate_advertisement(mote, ctx) {
            let channel_offset =
                cell_of(mote, handle, slot_offset).expect("shared cell exists").channel_offset;
            let channel = physical_channel(asn, channel_offset, num_chans);
            mote.tsch.active =
                Some(ActiveSlot { slotframe_handle: handle, slot_offset, queue_index: None });
            radio::start_tx(mote, channel, packet);
            transmitted_on = Some(handle);
        }
    }

    if transmitted_on.is_none() {
        if let Some(handle) = rx_cell {
            let channel_offset =
                cell_of(mote, handle, slot_offset).expect("rx cell exists").channel_offset;
            let channel = physical_channel(asn, channel_offset, num_chans);
            mote.tsch.active =
                Some(ActiveSlot { slotframe_handle: handle, slot_offset, queue_index: None });
            radio::start_rx(mote, channel);
        }
    }

    // tell the SF about every dedicated TX cell to the preferred parent
    // that just elapsed, used or not
    if let Some(parent) = mote.rpl.preferred_parent {
        let elapsed: Vec<(u8, bool)> = mote
            .tsch
            .slotframes
            .iter()
            .filter_map(|sf| {
                sf.cell_at(slot_offset).and_then(|c| {
                    if c.options.contains(CellOptions::TX) && c.neighbor == Some(parent) {
                        Some((sf.handle, transmitted_on == Some(sf.handle)))
                    } else {
                        None
                    }
                })
            })
            .collect();
        for (_handle, used) in elapsed {
            sf::indication_dedicated_tx_cell_elapsed(mote, ctx, used);
        }
    }

    schedule_next_active_slot(mote, ctx);
}

fn cell_of(mote: &Mote, handle: u8, slot_offset: u32) -> Option<&Cell> {
    mote.tsch.slotframes.iter().find(|sf| sf.handle == handle)?.cell_at(slot_offset)
}

/// Shared any-neighbour cells take broadcast frames and unicast frames
/// whose destination has no dedicated TX cell.
fn select_frame_for_shared_cell(mote: &Mote) -> Option<usize> {
    mote.tsch.tx_queue.iter().position(|p| {
        let Some(mac) = p.mac.as_ref() else { return false };
        mac.dst_mac.is_broadcast() || !mote.tsch.has_tx_cell_to(mac.dst_mac)
    })
}

/// On an idle shared cell, flip a fair coin between an EB and a DIO and
/// apply that type's generation probability.
fn maybe_generate_advertisement(mote: &mut Mote, ctx: &mut SimCtx) -> Option<Packet> {
    if !mote.secjoin.joined {
        return None;
    }
    let num_neighbors = mote.lowpan.on_link_neighbors.len() as f64;
    if ctx.rng.gen_bool(0.5) {
        // EB arm
        let prob = ctx.settings.tsch_prob_bcast_eb_dio_prob / (1.0 + num_neighbors);
        let has_rank = mote.dag_root || mote.rpl.rank.is_some();
        if has_rank && ctx.rng.r#gen::<f64>() < prob {
            return Some(build_eb(mote));
        }
    } else {
        // DIO arm
        let prob = ctx.settings.tsch_prob_bcast_dio_prob / (1.0 + num_neighbors);
        let kick = mote.rpl.take_dio_kick();
        if kick || ctx.rng.r#gen::<f64>() < prob {
            return rpl::create_dio(mote);
        }
    }
    None
}

fn build_eb(mote: &Mote) -> Packet {
    let dag_rank = mote.rpl.dag_rank().unwrap_or(1);
    let mut packet = Packet::new(
        Payload::Eb(EbPayload { join_metric: (dag_rank.saturating_sub(1)) as u8 }),
        NetHeader::new(mote.link_local_addr(), crate::address::Ipv6Addr::AllRplNodes, LENGTH_EB),
    );
    packet.mac = Some(MacHeader {
        src_mac: mote.mac_addr,
        dst_mac: MacAddr::BROADCAST,
        retries_left: 0,
    });
    packet
}

/// Put a frame on the TX queue. EBs and DIOs are never queued; they are
/// generated on demand at shared cells.
pub fn enqueue(mote: &mut Mote, ctx: &mut SimCtx, mut packet: Packet) -> bool {
    debug_assert!(packet.mac.is_some(), "enqueue before MAC header assignment");
    debug_assert!(!matches!(packet.packet_type(), PacketType::Dio | PacketType::Eb));

    if !mote.tsch.has_any_tx_cell() {
        crate::mote::drop_packet(ctx, mote.id, packet, DropReason::NoTxCells);
        return false;
    }
    if mote.tsch.tx_queue.len() >= TSCH_QUEUE_SIZE {
        crate::mote::drop_packet(ctx, mote.id, packet, DropReason::TxQueueFull);
        return false;
    }
    if let Some(mac) = packet.mac.as_mut() {
        mac.retries_left = TSCH_MAXTXRETRIES;
    }
    mote.tsch.tx_queue.push(packet);
    ctx.log.log(
        ctx.engine.asn(),
        logtypes::TSCH_TXQUEUE_LENGTH,
        json!({ "_mote_id": mote.id, "length": mote.tsch.tx_queue.len() }),
    );
    true
}

/// Transmission outcome, reported by the radio at propagation time.
pub fn tx_done(
    mote: &mut Mote,
    _conn: &Connectivity,
    ctx: &mut SimCtx,
    packet: Packet,
    channel: u8,
    acked: bool,
) {
    let asn = ctx.engine.asn();
    let active = mote.tsch.active.take();
    let (slot_offset, channel_offset) = match &active {
        Some(a) => {
            let co = cell_of(mote, a.slotframe_handle, a.slot_offset).map(|c| c.channel_offset);
            (Some(a.slot_offset), co)
        }
        None => (None, None),
    };

    ctx.log.log(
        asn,
        logtypes::TSCH_TXDONE,
        json!({
            "_mote_id": mote.id,
            "packet": packet.log_summary(),
            "isACKed": acked,
            "slot_offset": slot_offset,
            "channel_offset": channel_offset,
            "channel": channel,
        }),
    );

    let broadcast = packet.is_broadcast();
    let mut cell_shared = false;
    if let Some(a) = &active {
        if let Some(slotframe) =
            mote.tsch.slotframes.iter_mut().find(|sf| sf.handle == a.slotframe_handle)
        {
            if let Some(cell) = slotframe.cell_at_mut(a.slot_offset) {
                cell_shared = cell.options.contains(CellOptions::SHARED);
                cell.record_tx(acked, broadcast);
            }
        }
    }

    if broadcast {
        // broadcast frames are never retransmitted and count as successful
        if cell_shared {
            mote.tsch.reset_backoff();
        }
        return;
    }

    let dst_mac = packet.mac.as_ref().expect("unicast without MAC header").dst_mac;
    let queue_index = active.as_ref().and_then(|a| a.queue_index);

    if acked {
        if mote.rpl.preferred_parent == Some(dst_mac) {
            mote.tsch.asn_last_sync = asn;
        }
        let completed = queue_index.map(|index| mote.tsch.tx_queue.remove(index));
        if cell_shared {
            mote.tsch.reset_backoff();
        } else if mote.tsch.tx_queue.is_empty() {
            mote.tsch.reset_backoff();
        }
        if let Some(Packet { payload: Payload::SixP(payload), .. }) = completed {
            sixp::on_mac_ack(mote, ctx, dst_mac, payload);
        }
    } else if let Some(index) = queue_index {
        let retries_left =
            mote.tsch.tx_queue[index].mac.as_ref().expect("queued frame has MAC").retries_left;
        if retries_left == 0 {
            let dropped = mote.tsch.tx_queue.remove(index);
            crate::mote::drop_packet(ctx, mote.id, dropped, DropReason::MaxRetries);
        } else {
            mote.tsch.tx_queue[index].mac.as_mut().expect("queued frame has MAC").retries_left -=
                1;
            if cell_shared {
                mote.tsch.increase_backoff(&mut ctx.rng);
            }
        }
    }
}

/// Reception outcome; returns whether the frame is acknowledged.
pub fn rx_done(
    mote: &mut Mote,
    conn: &Connectivity,
    ctx: &mut SimCtx,
    packet: Option<Packet>,
) -> bool {
    let active = mote.tsch.active.take();
    let Some(packet) = packet else { return false };
    let Some(mac) = packet.mac.clone() else { return false };

    if !mote.tsch.is_sync {
        if mac.dst_mac.is_broadcast() && packet.packet_type() == PacketType::Eb {
            action_receive_eb(mote, ctx, &packet);
        }
        return false;
    }

    let for_me = mac.dst_mac == mote.mac_addr;
    if for_me || mac.dst_mac.is_broadcast() {
        if let Some(a) = &active {
            if let Some(slotframe) =
                mote.tsch.slotframes.iter_mut().find(|sf| sf.handle == a.slotframe_handle)
            {
                if let Some(cell) = slotframe.cell_at_mut(a.slot_offset) {
                    cell.num_rx += 1;
                }
            }
        }
        sixlowpan::remember_neighbor(mote, ctx, mac.src_mac);
    }

    if mac.dst_mac.is_broadcast() {
        match packet.packet_type() {
            PacketType::Eb => {} // already synced; EBs are for pledges
            PacketType::Dio => rpl::action_receive_dio(mote, conn, ctx, &packet),
            _ => {}
        }
        return false;
    }

    if !for_me {
        return false;
    }

    if mote.rpl.preferred_parent == Some(mac.src_mac) {
        mote.tsch.asn_last_sync = ctx.engine.asn();
    }

    match packet.packet_type() {
        PacketType::SixP => sixp::recv(mote, ctx, packet),
        PacketType::KeepAlive => {} // the ACK itself is the point
        PacketType::Dio | PacketType::Eb => {}
        _ => sixlowpan::recv(mote, conn, ctx, packet),
    }
    true
}

/// First EB reception: synchronise, install the minimal cell, start the
/// secure join.
pub fn action_receive_eb(mote: &mut Mote, ctx: &mut SimCtx, packet: &Packet) {
    if mote.tsch.is_sync {
        return;
    }
    let src_mac = packet.mac.as_ref().expect("EB without MAC header").src_mac;
    let asn = ctx.engine.asn();

    mote.tsch.is_sync = true;
    mote.tsch.asn_last_sync = asn;
    mote.tsch.join_proxy = Some(src_mac);
    ctx.engine.cancel(&EventKind::TschListenForEb { mote: mote.id });

    ctx.log.log(
        asn,
        logtypes::TSCH_SYNCED,
        json!({ "_mote_id": mote.id, "join_proxy": src_mac.to_string() }),
    );

    install_minimal_cell(mote, ctx);
    schedule_next_active_slot(mote, ctx);
    start_keep_alive(mote, ctx);
    secjoin::start_join(mote, ctx);
}

pub fn start_keep_alive(mote: &mut Mote, ctx: &mut SimCtx) {
    let interval = ctx.settings.tsch_keep_alive_interval;
    if interval <= 0.0 {
        return;
    }
    let slots = ctx.settings.seconds_to_slots(interval).max(1);
    let asn = ctx.engine.asn();
    ctx.engine.schedule(asn + slots, SlotOrder::Stack, EventKind::TschKeepAlive { mote: mote.id });
}

/// Periodic keep-alive: when nothing has refreshed synchronisation for a
/// full interval, poke the preferred parent so its ACK restores it.
pub fn on_keep_alive(mote: &mut Mote, ctx: &mut SimCtx) {
    if !mote.tsch.is_sync {
        return;
    }
    let asn = ctx.engine.asn();
    let interval_slots = ctx.settings.seconds_to_slots(ctx.settings.tsch_keep_alive_interval).max(1);
    if let Some(parent) = mote.rpl.preferred_parent {
        if asn.saturating_sub(mote.tsch.asn_last_sync) >= interval_slots {
            let mut packet = Packet::new(
                Payload::KeepAlive,
                NetHeader::new(
                    mote.link_local_addr(),
                    crate::address::Ipv6Addr::LinkLocal(parent.host()),
                    LENGTH_KEEPALIVE,
                ),
            );
            packet.mac = Some(MacHeader {
                src_mac: mote.mac_addr,
                dst_mac: parent,
                retries_left: TSCH_MAXTXRETRIES,
            });
            enqueue(mote, ctx, packet);
        }
    }
    ctx.engine.schedule(
        asn + interval_slots,
        SlotOrder::Stack,
        EventKind::TschKeepAlive { mote: mote.id },
    );
}

/// Lose synchronisation: wipe the schedule and the stack state above it,
/// then go back to hunting for an EB.
pub fn desync(mote: &mut Mote, ctx: &mut SimCtx) {
    let asn = ctx.engine.asn();
    ctx.log.log(asn, logtypes::TSCH_DESYNCED, json!({ "_mote_id": mote.id }));

    let handles: Vec<u8> = mote.tsch.slotframes.iter().map(|sf| sf.handle).collect();
    for handle in handles {
        let offsets: Vec<u32> = mote
            .tsch
            .slotframes
            .iter()
            .find(|sf| sf.handle == handle)
            .map(|sf| sf.iter().map(|c| c.slot_offset).collect())
            .unwrap_or_default();
        for offset in offsets {
            delete_cell(mote, ctx, handle, offset);
        }
    }

    mote.tsch.is_sync = false;
    mote.tsch.join_proxy = None;
    mote.tsch.tx_queue.clear();
    mote.tsch.reset_backoff();
    mote.tsch.active = None;

    ctx.engine.cancel(&EventKind::TschActiveSlot { mote: mote.id });
    ctx.engine.cancel(&EventKind::TschKeepAlive { mote: mote.id });
    ctx.engine.cancel(&EventKind::AppSendPacket { mote: mote.id });
    ctx.engine.cancel(&EventKind::RplSendDao { mote: mote.id });
    ctx.engine.cancel(&EventKind::SecJoinRetransmit { mote: mote.id });
    ctx.engine.cancel(&EventKind::MsfHousekeeping { mote: mote.id });

    mote.rpl.reset();
    mote.secjoin.reset();
    mote.sf.reset();
    mote.app.stop();
    mote.lowpan.reset();
    mote.sixp.reset();

    start_eb_hunt(mote, ctx);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_counters_halve_at_256() {
        let mut cell = Cell::new(1, 1, CellOptions::TX, Some(MacAddr::from_mote_id(1)));
        for _ in 0..255 {
            cell.record_tx(true, false);
        }
        assert_eq!(cell.num_tx, 255);
        assert_eq!(cell.num_tx_ack, 255);
        cell.record_tx(false, false);
        // halved after hitting 256
        assert_eq!(cell.num_tx, 128);
        assert_eq!(cell.num_tx_ack, 127);
    }

    #[test]
    fn broadcast_never_acks() {
        let mut cell = Cell::new(0, 0, CellOptions::TX | CellOptions::SHARED, None);
        cell.record_tx(true, true);
        assert_eq!(cell.num_tx, 1);
        assert_eq!(cell.num_tx_ack, 0);
        assert_eq!(cell.pdr_estimate(), None);
    }

    #[test]
    fn pdr_estimate_is_history_ratio() {
        let mut cell = Cell::new(1, 1, CellOptions::TX, Some(MacAddr::from_mote_id(1)));
        for i in 0..10 {
            cell.record_tx(i % 2 == 0, false);
        }
        assert_eq!(cell.pdr_estimate(), Some(0.5));
    }

    #[test]
    fn slotframe_rejects_duplicate_slot() {
        let mut slotframe = Slotframe::new(0, 101);
        slotframe.try_add(Cell::new(3, 0, CellOptions::TX, None)).unwrap();
        assert!(slotframe.try_add(Cell::new(3, 5, CellOptions::RX, None)).is_err());
        // another offset is fine
        slotframe.try_add(Cell::new(4, 5, CellOptions::RX, None)).unwrap();
    }

    #[test]
    fn hopping_covers_all_channels() {
        let mut seen = std::collections::HashSet::new();
        for asn in 0..16u64 {
            seen.insert(physical_channel(asn, 0, 16));
        }
        assert_eq!(seen.len(), 16);
    }

    #[test]
    fn hopping_respects_channel_count() {
        for asn in 0..64u64 {
            for offset in 0..4 {
                assert!(physical_channel(asn, offset, 4) < 4);
            }
        }
    }

    #[test]
    fn mirrored_options_swap_tx_rx() {
        let tx_shared = CellOptions::TX | CellOptions::SHARED;
        assert_eq!(tx_shared.mirrored(), CellOptions::RX | CellOptions::SHARED);
        let trx = CellOptions::TX | CellOptions::RX;
        assert_eq!(trx.mirrored(), trx);
    }

    #[test]
    fn available_slots_excludes_scheduled_and_minimal() {
        let mut tsch = Tsch::new(5);
        tsch.slotframes[0].try_add(Cell::new(0, 0, CellOptions::TX, None)).unwrap();
        tsch.slotframes[0].try_add(Cell::new(2, 0, CellOptions::TX, None)).unwrap();
        assert_eq!(tsch.available_slots(), vec![1, 3, 4]);
    }
}
