//! Connectivity and propagation.
//!
//! A matrix `(src, dst, channel) -> {pdr, rssi}` models every link. It is
//! filled statically at startup (full mesh, linear chain, Pister-hack from
//! coordinates) or advanced over time from a trace file.
//!
//! `propagate()` runs at every ASN, strictly after all stack tasks of the
//! slot: it resolves the concurrent transmissions on each channel into
//! per-listener reception outcomes and completes every transmission. It is
//! the only bridge between transmitters and receivers.

pub mod signal;
pub mod trace;

use std::collections::HashSet;

use rand::Rng;
use rand::rngs::StdRng;
use serde_json::json;

use crate::address::MoteId;
use crate::engine::{EventKind, SlotOrder};
use crate::mote::{Mote, radio};
use crate::mote::radio::RadioState;
use crate::settings::{ConnClass, Settings};
use crate::simlog::types as logtypes;
use crate::simulation::SimCtx;
use trace::TraceReader;

/// RSSI above which a link is considered stable when enforcing
/// connectedness of Pister-hack topologies.
const PISTER_HACK_STABLE_RSSI: f64 = -93.0;

/// RSSI assigned to nonexistent links.
const NO_LINK_RSSI: f64 = -1000.0;

/// RSSI assigned to the ideal links of the FullyMeshed and Linear classes.
const IDEAL_LINK_RSSI: f64 = -60.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinkState {
    pub pdr: f64,
    pub rssi: f64,
}

impl LinkState {
    fn none() -> Self {
        LinkState { pdr: 0.0, rssi: NO_LINK_RSSI }
    }
}

/// One ongoing transmission, snapshotted at propagation time.
struct Transmission {
    src: MoteId,
    channel: u8,
    /// Perceived transmission start time: the source's clock offset to the
    /// root. Receivers lock on the earliest one.
    tx_time: f64,
}

pub struct Connectivity {
    /// `matrix[src][dst][channel]`
    matrix: Vec<Vec<Vec<LinkState>>>,
    num_chans: u8,
    min_rssi: f64,
    slot_duration: f64,
    trace: Option<TraceReader>,
    /// Mote coordinates in km, kept for Pister-hack topologies.
    coordinates: Option<Vec<(f64, f64)>>,
}

impl Connectivity {
    pub fn new(settings: &Settings, rng: &mut StdRng) -> Result<Self, String> {
        let n = settings.exec_num_motes;
        let num_chans = settings.phy_num_chans;
        let mut conn = Connectivity {
            matrix: vec![vec![vec![LinkState::none(); num_chans as usize]; n]; n],
            num_chans,
            min_rssi: settings.conn_min_rssi,
            slot_duration: settings.tsch_slot_duration,
            trace: None,
            coordinates: None,
        };

        match settings.conn_class {
            ConnClass::FullyMeshed => conn.fill_fully_meshed(),
            ConnClass::Linear => conn.fill_linear(),
            ConnClass::PisterHack => conn.fill_pister_hack(settings, rng),
            ConnClass::Trace => {
                let path = settings
                    .conn_trace
                    .as_ref()
                    .ok_or_else(|| "conn_class Trace requires conn_trace".to_string())?;
                let content = std::fs::read_to_string(path)
                    .map_err(|e| format!("Failed to read trace file {}: {}", path, e))?;
                let mut reader = TraceReader::parse(&content, settings.tsch_slot_duration)
                    .map_err(|e| format!("Failed to parse trace file: {}", e))?;
                // rows timestamped at the trace start describe the initial
                // matrix
                let initial: Vec<_> = reader.pop_due(1).to_vec();
                conn.trace = Some(reader);
                for row in initial {
                    conn.apply_trace_row(&row)?;
                }
            }
        }
        Ok(conn)
    }

    fn fill_fully_meshed(&mut self) {
        let n = self.matrix.len();
        for src in 0..n {
            for dst in 0..n {
                if src == dst {
                    continue;
                }
                for ch in 0..self.num_chans as usize {
                    self.matrix[src][dst][ch] = LinkState { pdr: 1.0, rssi: IDEAL_LINK_RSSI };
                }
            }
        }
    }

    fn fill_linear(&mut self) {
        let n = self.matrix.len();
        for src in 0..n {
            for dst in 0..n {
                if src.abs_diff(dst) != 1 {
                    continue;
                }
                for ch in 0..self.num_chans as usize {
                    self.matrix[src][dst][ch] = LinkState { pdr: 1.0, rssi: IDEAL_LINK_RSSI };
                }
            }
        }
    }

    /// Random placement in a `top_squareSide` km square. Every mote is
    /// re-placed until it has at least one stable link towards the already
    /// placed part of the network, so the DAG root is always reachable.
    fn fill_pister_hack(&mut self, settings: &Settings, rng: &mut StdRng) {
        let n = self.matrix.len();
        let side = settings.top_square_side;
        let sigma = settings.conn_shadowing_sigma;

        let mut coords: Vec<(f64, f64)> = Vec::with_capacity(n);
        let mut rssi_sample = vec![vec![NO_LINK_RSSI; n]; n];

        coords.push((rng.gen_range(0.0..side), rng.gen_range(0.0..side)));
        for id in 1..n {
            loop {
                let candidate = (rng.gen_range(0.0..side), rng.gen_range(0.0..side));
                let mut connected = false;
                for placed in 0..id {
                    let rssi = self.compute_rssi(candidate, coords[placed], sigma, rng);
                    rssi_sample[id][placed] = rssi;
                    rssi_sample[placed][id] = rssi;
                    if rssi > PISTER_HACK_STABLE_RSSI {
                        connected = true;
                    }
                }
                if connected {
                    coords.push(candidate);
                    break;
                }
            }
        }

        for src in 0..n {
            for dst in 0..n {
                if src == dst {
                    continue;
                }
                let rssi = rssi_sample[src][dst];
                let link = LinkState { pdr: signal::rssi_to_pdr(rssi), rssi };
                for ch in 0..self.num_chans as usize {
                    self.matrix[src][dst][ch] = link;
                }
            }
        }
        self.coordinates = Some(coords);
    }

    /// Pister-hack RSSI between two positions given in km.
    fn compute_rssi(
        &self,
        mote: (f64, f64),
        neighbor: (f64, f64),
        shadowing_sigma: f64,
        rng: &mut StdRng,
    ) -> f64 {
        let dx = mote.0 - neighbor.0;
        let dy = mote.1 - neighbor.1;
        let distance_m = (dx * dx + dy * dy).sqrt() * 1000.0;
        signal::pister_hack_rssi(distance_m, shadowing_sigma, rng)
    }

    fn apply_trace_row(&mut self, row: &trace::TraceRow) -> Result<(), String> {
        let n = self.matrix.len();
        if row.src >= n || row.dst >= n {
            return Err(format!("trace row references mote {} outside the run", row.src.max(row.dst)));
        }
        if row.channel >= self.num_chans {
            return Err(format!("trace row references channel {} outside the run", row.channel));
        }
        self.matrix[row.src][row.dst][row.channel as usize] =
            LinkState { pdr: row.pdr, rssi: row.rssi };
        Ok(())
    }

    pub fn get_pdr(&self, src: MoteId, dst: MoteId, channel: u8) -> f64 {
        self.matrix[src][dst][channel as usize].pdr
    }

    pub fn get_rssi(&self, src: MoteId, dst: MoteId, channel: u8) -> f64 {
        self.matrix[src][dst][channel as usize].rssi
    }

    /// Overwrite a link on every channel. Used by tests and experiments.
    pub fn set_link(&mut self, src: MoteId, dst: MoteId, pdr: f64, rssi: f64) {
        for ch in 0..self.num_chans as usize {
            self.matrix[src][dst][ch] = LinkState { pdr, rssi };
        }
    }

    pub fn coordinates(&self) -> Option<&[(f64, f64)]> {
        self.coordinates.as_deref()
    }

    /// Resolve all transmissions of the current slot and reschedule for the
    /// next ASN.
    pub fn propagate(&mut self, motes: &mut [Mote], ctx: &mut SimCtx) {
        let asn = ctx.engine.asn();

        if let Some(reader) = &mut self.trace {
            let due: Vec<_> = reader.pop_due(asn).to_vec();
            for row in due {
                if let Err(e) = self.apply_trace_row(&row) {
                    log::warn!("ignoring trace row: {}", e);
                }
            }
        }

        let mut transmissions: Vec<Transmission> = Vec::new();
        for src in 0..motes.len() {
            if motes[src].radio.state != RadioState::Tx {
                continue;
            }
            let channel =
                motes[src].radio.ongoing.as_ref().expect("TX radio without transmission").channel;
            let tx_time = clock_offset_to_root(motes, src, self.slot_duration, asn);
            transmissions.push(Transmission { src, channel, tx_time });
        }

        let mut ack_counts = vec![0u32; motes.len()];
        let conn: &Connectivity = self;

        for channel in 0..conn.num_chans {
            let on_channel: Vec<&Transmission> =
                transmissions.iter().filter(|t| t.channel == channel).collect();

            // listeners in ascending id order for reproducibility
            let listeners: Vec<MoteId> = motes
                .iter()
                .filter(|m| m.radio.state == RadioState::Rx && m.radio.channel == Some(channel))
                .map(|m| m.id)
                .collect();

            for listener in listeners {
                let audible: Vec<&Transmission> = on_channel
                    .iter()
                    .copied()
                    .filter(|t| conn.get_rssi(t.src, listener, channel) > conn.min_rssi)
                    .collect();

                if audible.is_empty() {
                    radio::rx_done(&mut motes[listener], conn, ctx, None);
                    continue;
                }

                // lock on the transmission that started first; ties go to the
                // lowest source id
                let lock: &Transmission = audible
                    .iter()
                    .copied()
                    .min_by(|a, b| {
                        a.tx_time
                            .partial_cmp(&b.tx_time)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then(a.src.cmp(&b.src))
                    })
                    .expect("audible set is non-empty");

                let lock_rssi = conn.get_rssi(lock.src, listener, channel);
                let interferer_rssis: Vec<f64> = audible
                    .iter()
                    .filter(|t| t.src != lock.src)
                    .map(|t| conn.get_rssi(t.src, listener, channel))
                    .collect();

                let sinr =
                    signal::compute_sinr(lock_rssi, &interferer_rssis, signal::NOISE_FLOOR_DBM);
                if !interferer_rssis.is_empty() {
                    ctx.log.log(
                        asn,
                        logtypes::PROP_INTERFERENCE,
                        json!({
                            "_mote_id": listener,
                            "source": lock.src,
                            "channel": channel,
                            "lock_rssi": lock_rssi,
                            "sinr": sinr,
                            "num_interferers": interferer_rssis.len(),
                        }),
                    );
                }

                let equivalent_rssi =
                    signal::sinr_to_equivalent_rssi(sinr, signal::NOISE_FLOOR_DBM);
                let effective_pdr =
                    signal::rssi_to_pdr(equivalent_rssi) * conn.get_pdr(lock.src, listener, channel);

                if ctx.rng.r#gen::<f64>() < effective_pdr {
                    let packet = motes[lock.src]
                        .radio
                        .ongoing
                        .as_ref()
                        .expect("locked transmission vanished")
                        .packet
                        .clone();
                    let acked = radio::rx_done(&mut motes[listener], conn, ctx, Some(packet));
                    if acked {
                        ack_counts[lock.src] += 1;
                    }
                } else {
                    radio::rx_done(&mut motes[listener], conn, ctx, None);
                }
            }
        }

        for transmission in &transmissions {
            let acked = match ack_counts[transmission.src] {
                0 => false,
                1 => true,
                n => panic!(
                    "{} listeners acknowledged one unicast from mote {}: duplicate MAC addresses",
                    n, transmission.src
                ),
            };
            radio::tx_done(&mut motes[transmission.src], conn, ctx, acked);
        }

        for mote in motes.iter() {
            debug_assert_eq!(
                mote.radio.state,
                RadioState::Off,
                "radio of mote {} still on after propagation",
                mote.id
            );
        }

        ctx.engine.schedule(asn + 1, SlotOrder::Propagate, EventKind::Propagate);
    }
}

/// Clock offset of a mote relative to the DAG root: the sum along the
/// parent chain of the drift difference times the seconds elapsed since the
/// child last synchronised. A cycle, a desynced hop or a missing time
/// source aborts the walk to offset zero; lock-on ties are then resolved by
/// source id.
fn clock_offset_to_root(motes: &[Mote], id: MoteId, slot_duration: f64, asn: u64) -> f64 {
    let mut offset = 0.0;
    let mut current = id;
    let mut visited = HashSet::new();

    loop {
        let mote = &motes[current];
        if mote.dag_root {
            return offset;
        }
        if !mote.tsch.is_sync || !visited.insert(current) {
            return 0.0;
        }
        let source_mac = match mote.rpl.preferred_parent.or(mote.tsch.join_proxy) {
            Some(mac) => mac,
            None => return 0.0,
        };
        let parent = source_mac.mote_id();
        if parent >= motes.len() {
            return 0.0;
        }
        let seconds_since_sync = asn.saturating_sub(mote.tsch.asn_last_sync) as f64 * slot_duration;
        let drift_delta = (mote.radio.drift_ppm - motes[parent].radio.drift_ppm) * 1e-6;
        offset += drift_delta * seconds_since_sync;
        current = parent;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn settings(class: ConnClass, motes: usize) -> Settings {
        Settings { conn_class: class, exec_num_motes: motes, ..Settings::default() }
    }

    #[test]
    fn fully_meshed_links_everything() {
        let mut rng = StdRng::seed_from_u64(1);
        let conn = Connectivity::new(&settings(ConnClass::FullyMeshed, 4), &mut rng).unwrap();
        for src in 0..4 {
            for dst in 0..4 {
                let expected = if src == dst { 0.0 } else { 1.0 };
                assert_eq!(conn.get_pdr(src, dst, 0), expected);
            }
        }
    }

    #[test]
    fn linear_links_only_neighbors() {
        let mut rng = StdRng::seed_from_u64(1);
        let conn = Connectivity::new(&settings(ConnClass::Linear, 5), &mut rng).unwrap();
        assert_eq!(conn.get_pdr(0, 1, 0), 1.0);
        assert_eq!(conn.get_pdr(3, 2, 3), 1.0);
        assert_eq!(conn.get_pdr(0, 2, 0), 0.0);
        assert_eq!(conn.get_pdr(4, 0, 0), 0.0);
    }

    #[test]
    fn pister_hack_topology_is_connected() {
        for seed in 0..5 {
            let mut rng = StdRng::seed_from_u64(seed);
            let conn = Connectivity::new(&settings(ConnClass::PisterHack, 10), &mut rng).unwrap();

            // breadth-first reachability over stable links towards the root
            let mut reached: HashSet<MoteId> = HashSet::from([0]);
            let mut frontier = vec![0];
            while let Some(node) = frontier.pop() {
                for other in 0..10 {
                    if !reached.contains(&other)
                        && conn.get_rssi(node, other, 0) > PISTER_HACK_STABLE_RSSI
                    {
                        reached.insert(other);
                        frontier.push(other);
                    }
                }
            }
            assert_eq!(reached.len(), 10, "seed {} produced a partitioned topology", seed);
        }
    }

    #[test]
    fn pister_hack_links_are_symmetric() {
        let mut rng = StdRng::seed_from_u64(3);
        let conn = Connectivity::new(&settings(ConnClass::PisterHack, 6), &mut rng).unwrap();
        for a in 0..6 {
            for b in 0..6 {
                assert_eq!(conn.get_rssi(a, b, 0), conn.get_rssi(b, a, 0));
            }
        }
    }

    #[test]
    fn set_link_overrides_every_channel() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut conn = Connectivity::new(&settings(ConnClass::Linear, 2), &mut rng).unwrap();
        conn.set_link(0, 1, 0.0, -200.0);
        for ch in 0..16 {
            assert_eq!(conn.get_pdr(0, 1, ch), 0.0);
        }
    }
}
