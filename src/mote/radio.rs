//! Radio model.
//!
//! A three-state machine (OFF, TX, RX) with charge accounting per event.
//! The radio never talks to the connectivity layer directly: TSCH turns it
//! on, and `Connectivity::propagate` completes the slot by calling
//! `tx_done`/`rx_done`. Illegal transitions are simulator bugs and abort
//! the run. There is no ACK frame; the return value of `rx_done` is the
//! acknowledgement.

use rand::Rng;
use rand::rngs::StdRng;
use serde_json::json;

use crate::connectivity::Connectivity;
use crate::mote::{Mote, tsch};
use crate::packet::Packet;
use crate::simulation::SimCtx;

/// Clock drift bound, ppm. Each radio draws its drift uniformly within
/// ±this value.
pub const RADIO_MAX_DRIFT_PPM: f64 = 30.0;

// Charge per slot by radio activity, µC.
pub const CHARGE_IDLE_UC: f64 = 6.4;
pub const CHARGE_IDLE_NOT_SYNC_UC: f64 = 45.0;
pub const CHARGE_TX_DATA_RX_ACK_UC: f64 = 54.5;
pub const CHARGE_TX_DATA_UC: f64 = 49.5;
pub const CHARGE_RX_DATA_TX_ACK_UC: f64 = 32.6;
pub const CHARGE_RX_DATA_UC: f64 = 22.6;
pub const CHARGE_SLEEP_UC: f64 = 0.0;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RadioState {
    Off,
    Tx,
    Rx,
}

pub struct OngoingTransmission {
    pub channel: u8,
    pub packet: Packet,
}

/// Cumulative per-radio counters, logged as `radio.stats` at end of run.
#[derive(Clone, Copy, Default, Debug)]
pub struct RadioStats {
    pub num_idle: u64,
    pub num_tx: u64,
    pub num_rx: u64,
    /// Acknowledgements this radio transmitted in response to a reception.
    pub num_ack_tx: u64,
    /// Acknowledgements this radio received for its own transmissions.
    pub num_ack_rx: u64,
    pub charge_uc: f64,
}

impl RadioStats {
    pub fn log_fields(&self) -> serde_json::Value {
        json!({
            "idle": self.num_idle,
            "tx": self.num_tx,
            "rx": self.num_rx,
            "ack_tx": self.num_ack_tx,
            "ack_rx": self.num_ack_rx,
            "charge_uC": self.charge_uc,
        })
    }
}

pub struct Radio {
    pub state: RadioState,
    /// Listening channel while in RX.
    pub channel: Option<u8>,
    pub ongoing: Option<OngoingTransmission>,
    pub drift_ppm: f64,
    pub stats: RadioStats,
}

impl Radio {
    pub fn new(rng: &mut StdRng) -> Self {
        Radio {
            state: RadioState::Off,
            channel: None,
            ongoing: None,
            drift_ppm: rng.gen_range(-RADIO_MAX_DRIFT_PPM..RADIO_MAX_DRIFT_PPM),
            stats: RadioStats::default(),
        }
    }
}

/// OFF -> TX. The frame is held until `tx_done`.
pub fn start_tx(mote: &mut Mote, channel: u8, packet: Packet) {
    assert_eq!(mote.radio.state, RadioState::Off, "mote {}: start_tx while radio busy", mote.id);
    assert!(packet.mac.is_some(), "frame handed to the radio without a MAC header");
    mote.radio.state = RadioState::Tx;
    mote.radio.ongoing = Some(OngoingTransmission { channel, packet });
}

/// OFF -> RX.
pub fn start_rx(mote: &mut Mote, channel: u8) {
    assert_eq!(mote.radio.state, RadioState::Off, "mote {}: start_rx while radio busy", mote.id);
    mote.radio.state = RadioState::Rx;
    mote.radio.channel = Some(channel);
}

/// TX -> OFF. Records charge and forwards the outcome to TSCH.
pub fn tx_done(mote: &mut Mote, conn: &Connectivity, ctx: &mut SimCtx, acked: bool) {
    assert_eq!(mote.radio.state, RadioState::Tx, "mote {}: tx_done while not transmitting", mote.id);
    let transmission = mote.radio.ongoing.take().expect("tx_done without transmission");
    mote.radio.state = RadioState::Off;

    mote.radio.stats.num_tx += 1;
    if acked {
        mote.radio.stats.num_ack_rx += 1;
        mote.radio.stats.charge_uc += CHARGE_TX_DATA_RX_ACK_UC;
    } else {
        mote.radio.stats.charge_uc += CHARGE_TX_DATA_UC;
    }

    tsch::tx_done(mote, conn, ctx, transmission.packet, transmission.channel, acked);
}

/// RX -> OFF. Records charge and forwards to TSCH; the returned flag is
/// whether this mote acknowledged the frame.
pub fn rx_done(mote: &mut Mote, conn: &Connectivity, ctx: &mut SimCtx, packet: Option<Packet>) -> bool {
    assert_eq!(mote.radio.state, RadioState::Rx, "mote {}: rx_done while not listening", mote.id);
    mote.radio.state = RadioState::Off;
    mote.radio.channel = None;

    match packet {
        None => {
            mote.radio.stats.num_idle += 1;
            mote.radio.stats.charge_uc += if mote.tsch.is_sync {
                CHARGE_IDLE_UC
            } else {
                CHARGE_IDLE_NOT_SYNC_UC
            };
            tsch::rx_done(mote, conn, ctx, None);
            false
        }
        Some(packet) => {
            let acked = tsch::rx_done(mote, conn, ctx, Some(packet));
            mote.radio.stats.num_rx += 1;
            if acked {
                mote.radio.stats.num_ack_tx += 1;
                mote.radio.stats.charge_uc += CHARGE_RX_DATA_TX_ACK_UC;
            } else {
                mote.radio.stats.charge_uc += CHARGE_RX_DATA_UC;
            }
            acked
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn drift_is_bounded() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..100 {
            let radio = Radio::new(&mut rng);
            assert!(radio.drift_ppm.abs() < RADIO_MAX_DRIFT_PPM);
        }
    }

    #[test]
    fn charge_ordering_matches_the_model() {
        assert!(CHARGE_TX_DATA_RX_ACK_UC > CHARGE_TX_DATA_UC);
        assert!(CHARGE_TX_DATA_UC > CHARGE_IDLE_UC);
        assert!(CHARGE_IDLE_UC > CHARGE_SLEEP_UC);
        assert!(CHARGE_RX_DATA_TX_ACK_UC > CHARGE_RX_DATA_UC);
    }
}
