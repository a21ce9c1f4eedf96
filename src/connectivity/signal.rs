//! Radio signal calculations.
//!
//! Contains helpers for:
//! - dBm/mW conversions
//! - Friis path loss with the Pister-hack uniform band and optional
//!   log-normal shadowing
//! - The empirical RSSI to PDR mapping
//! - SINR under concurrent transmissions and its equivalent RSSI
//!
//! Units: power in dBm or mW (conversions provided), distance in meters.

use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

/// Thermal noise floor of the receivers, dBm.
pub const NOISE_FLOOR_DBM: f64 = -105.0;

/// Width of the Pister-hack band: the received RSSI is uniformly
/// distributed between the Friis value and Friis - 40 dB.
pub const PISTER_HACK_LOWER_SHIFT_DB: f64 = 40.0;

const SPEED_OF_LIGHT: f64 = 299_792_458.0;
const TWO_DOT_FOUR_GHZ: f64 = 2_400_000_000.0;

/// Default transmit power at the antenna port, dBm.
pub const TX_POWER_DBM: f64 = 0.0;

/// Empirical RSSI to PDR anchors, 1 dB apart from -97 dBm (PDR 0) to
/// -79 dBm (PDR 1); 50% PDR sits at -93.6 dBm. Values between anchors are
/// linearly interpolated.
const RSSI_PDR_TABLE: [f64; 19] = [
    0.0000, 0.1494, 0.2340, 0.4071, 0.6359, 0.6866, 0.7476, 0.8603, 0.8702, 0.9324, 0.9427,
    0.9562, 0.9611, 0.9739, 0.9745, 0.9844, 0.9854, 0.9903, 1.0000,
];

const RSSI_PDR_TABLE_MIN_DBM: f64 = -97.0;
const RSSI_PDR_TABLE_MAX_DBM: f64 = -79.0;

pub fn dbm_to_mw(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0)
}

pub fn mw_to_dbm(mw: f64) -> f64 {
    10.0 * mw.log10()
}

/// Map an RSSI to a packet delivery ratio by piecewise-linear interpolation
/// of the empirical table, clamped to [0, 1] outside the anchors.
pub fn rssi_to_pdr(rssi_dbm: f64) -> f64 {
    if rssi_dbm <= RSSI_PDR_TABLE_MIN_DBM {
        return 0.0;
    }
    if rssi_dbm >= RSSI_PDR_TABLE_MAX_DBM {
        return 1.0;
    }
    let position = rssi_dbm - RSSI_PDR_TABLE_MIN_DBM;
    let index = position.floor() as usize;
    let fraction = position - position.floor();
    let low = RSSI_PDR_TABLE[index];
    let high = RSSI_PDR_TABLE[index + 1];
    low + (high - low) * fraction
}

/// Received power from the simple Friis equation at 2.4 GHz:
/// `Pr = Pt + Gt + Gr + 20 log10(c / (4 pi d f))` with unity antenna gains.
pub fn friis_rssi(distance_m: f64, tx_power_dbm: f64) -> f64 {
    // arbitrarily short distances would yield a positive "gain"
    let d = distance_m.max(0.01);
    let fspl = SPEED_OF_LIGHT / (4.0 * std::f64::consts::PI * d * TWO_DOT_FOUR_GHZ);
    tx_power_dbm + 20.0 * fspl.log10()
}

/// Pister-hack RSSI sample: uniformly distributed between the Friis value
/// and Friis - 40 dB, with optional log-normal shadowing on top.
pub fn pister_hack_rssi(distance_m: f64, shadowing_sigma: f64, rng: &mut StdRng) -> f64 {
    let half_band = PISTER_HACK_LOWER_SHIFT_DB / 2.0;
    let mu = friis_rssi(distance_m, TX_POWER_DBM) - half_band;
    let mut rssi = mu + rng.gen_range(-half_band..half_band);
    if shadowing_sigma > 0.0 {
        let normal = Normal::new(0.0, shadowing_sigma).expect("invalid shadowing sigma");
        rssi += normal.sample(rng);
    }
    rssi
}

/// SINR of the locked-on transmission in dB.
///
/// The interference term only counts power above the noise floor; a signal
/// weaker than the noise floor yields the -10 dB sentinel.
pub fn compute_sinr(lock_rssi_dbm: f64, interferer_rssis_dbm: &[f64], noise_dbm: f64) -> f64 {
    let noise_mw = dbm_to_mw(noise_dbm);
    let signal_mw = dbm_to_mw(lock_rssi_dbm) - noise_mw;
    if signal_mw < 0.0 {
        return -10.0;
    }
    let interference_mw: f64 = interferer_rssis_dbm
        .iter()
        .map(|&rssi| (dbm_to_mw(rssi) - noise_mw).max(0.0))
        .sum();
    mw_to_dbm(signal_mw / (interference_mw + noise_mw))
}

/// RSSI that would produce the same PDR under pure-noise conditions as the
/// given SINR does under interference.
pub fn sinr_to_equivalent_rssi(sinr_db: f64, noise_dbm: f64) -> f64 {
    mw_to_dbm(dbm_to_mw(sinr_db + noise_dbm) + dbm_to_mw(noise_dbm))
}
