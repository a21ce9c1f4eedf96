//! Simulation settings.
//!
//! A flat mapping of recognised options, loadable from a JSON or TOML file.
//! Field names in the file keep the historical spelling (`exec_numMotes`,
//! `tsch_slotframeLength`, ...). Every run starts by writing the full
//! settings snapshot as the first line of the event log.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Connectivity model selection.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ConnClass {
    FullyMeshed,
    Linear,
    Trace,
    PisterHack,
}

/// Scheduling-function selection.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum SfClass {
    #[serde(rename = "MSF")]
    Msf,
    #[serde(rename = "SFNone")]
    SfNone,
}

/// 6LoWPAN fragmentation strategy.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Fragmentation {
    PerHopReassembly,
    FragmentForwarding,
}

/// Optional eviction policies of the fragment-forwarding VRB table.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum VrbPolicy {
    #[serde(rename = "last_fragment")]
    LastFragment,
    #[serde(rename = "missing_fragment")]
    MissingFragment,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(rename = "exec_numMotes")]
    pub exec_num_motes: usize,
    #[serde(rename = "exec_numSlotframesPerRun")]
    pub exec_num_slotframes_per_run: u64,
    #[serde(rename = "exec_numRuns")]
    pub exec_num_runs: u64,
    #[serde(rename = "exec_randomSeed")]
    pub exec_random_seed: u64,
    #[serde(rename = "exec_outputDir")]
    pub exec_output_dir: String,

    /// Slot duration in seconds.
    #[serde(rename = "tsch_slotDuration")]
    pub tsch_slot_duration: f64,
    #[serde(rename = "tsch_slotframeLength")]
    pub tsch_slotframe_length: u32,
    #[serde(rename = "tsch_probBcast_ebDioProb")]
    pub tsch_prob_bcast_eb_dio_prob: f64,
    #[serde(rename = "tsch_probBcast_dioProb")]
    pub tsch_prob_bcast_dio_prob: f64,
    /// Seconds without a sync refresh before a keep-alive is sent to the
    /// preferred parent; 0 disables keep-alives.
    #[serde(rename = "tsch_keepAliveInterval")]
    pub tsch_keep_alive_interval: f64,
    /// Largest payload carried in one frame; longer packets are fragmented.
    #[serde(rename = "tsch_maxPayloadLen")]
    pub tsch_max_payload_len: usize,

    #[serde(rename = "phy_numChans")]
    pub phy_num_chans: u8,

    pub conn_class: ConnClass,
    /// Trace file path, consumed when `conn_class = Trace`.
    pub conn_trace: Option<String>,
    /// Transmissions below this RSSI (dBm) are inaudible.
    #[serde(rename = "conn_minRssi")]
    pub conn_min_rssi: f64,
    /// Log-normal shadowing sigma (dB) of the Pister-hack model; 0 disables.
    #[serde(rename = "conn_shadowingSigma")]
    pub conn_shadowing_sigma: f64,

    pub sf_class: SfClass,
    #[serde(rename = "sf_msf_housekeepingPeriod")]
    pub sf_msf_housekeeping_period: f64,
    #[serde(rename = "sf_msf_maxNumCells")]
    pub sf_msf_max_num_cells: usize,
    #[serde(rename = "sf_msf_limNumCellsUsedHigh")]
    pub sf_msf_lim_num_cells_used_high: f64,
    #[serde(rename = "sf_msf_limNumCellsUsedLow")]
    pub sf_msf_lim_num_cells_used_low: f64,
    #[serde(rename = "sf_msf_numCellsToAddRemove")]
    pub sf_msf_num_cells_to_add_remove: usize,

    /// Mean application packet period in seconds; 0 disables the
    /// application.
    #[serde(rename = "app_pkPeriod")]
    pub app_pk_period: f64,
    /// Relative jitter applied to each period, e.g. 0.05 for ±5%.
    #[serde(rename = "app_pkPeriodVar")]
    pub app_pk_period_var: f64,
    #[serde(rename = "app_pkLength")]
    pub app_pk_length: usize,

    /// DAO period in seconds; 0 disables DAOs.
    #[serde(rename = "rpl_daoPeriod")]
    pub rpl_dao_period: f64,

    pub secjoin_enabled: bool,

    pub fragmentation: Fragmentation,
    #[serde(rename = "fragmentation_ff_vrb_table_size")]
    pub fragmentation_ff_vrb_table_size: usize,
    #[serde(rename = "fragmentation_ff_discard_vrb_entry_policy")]
    pub fragmentation_ff_discard_vrb_entry_policy: Vec<VrbPolicy>,
    #[serde(rename = "sixlowpan_reassembly_buffers_num")]
    pub sixlowpan_reassembly_buffers_num: usize,

    /// Side of the deployment square in km (Pister-hack placement).
    #[serde(rename = "top_squareSide")]
    pub top_square_side: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            exec_num_motes: 10,
            exec_num_slotframes_per_run: 100,
            exec_num_runs: 1,
            exec_random_seed: 0,
            exec_output_dir: "simData".to_string(),
            tsch_slot_duration: 0.010,
            tsch_slotframe_length: 101,
            tsch_prob_bcast_eb_dio_prob: 0.33,
            tsch_prob_bcast_dio_prob: 0.33,
            tsch_keep_alive_interval: 10.0,
            tsch_max_payload_len: 90,
            phy_num_chans: 16,
            conn_class: ConnClass::PisterHack,
            conn_trace: None,
            conn_min_rssi: -97.0,
            conn_shadowing_sigma: 0.0,
            sf_class: SfClass::Msf,
            sf_msf_housekeeping_period: 60.0,
            sf_msf_max_num_cells: 100,
            sf_msf_lim_num_cells_used_high: 0.75,
            sf_msf_lim_num_cells_used_low: 0.25,
            sf_msf_num_cells_to_add_remove: 1,
            app_pk_period: 60.0,
            app_pk_period_var: 0.05,
            app_pk_length: 90,
            rpl_dao_period: 60.0,
            secjoin_enabled: true,
            fragmentation: Fragmentation::PerHopReassembly,
            fragmentation_ff_vrb_table_size: 50,
            fragmentation_ff_discard_vrb_entry_policy: Vec::new(),
            sixlowpan_reassembly_buffers_num: 1,
            top_square_side: 2.0,
        }
    }
}

impl Settings {
    /// Load settings from a JSON or TOML file, selected by extension.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path.display(), e))?;

        let settings: Settings = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| format!("Failed to parse config file: {}", e))?
            }
            _ => serde_json::from_str(&content)
                .map_err(|e| format!("Failed to parse config file: {}", e))?,
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Reject configurations that would produce a meaningless run.
    pub fn validate(&self) -> Result<(), String> {
        if self.exec_num_motes == 0 {
            return Err("exec_numMotes must be at least 1".to_string());
        }
        if self.exec_num_slotframes_per_run == 0 {
            return Err("exec_numSlotframesPerRun must be positive".to_string());
        }
        if self.tsch_slot_duration <= 0.0 {
            return Err("tsch_slotDuration must be positive".to_string());
        }
        if self.tsch_slotframe_length < 2 {
            return Err("tsch_slotframeLength must be at least 2".to_string());
        }
        if self.phy_num_chans == 0 || self.phy_num_chans > 16 {
            return Err(format!("phy_numChans {} outside supported range 1-16", self.phy_num_chans));
        }
        if self.conn_class == ConnClass::Trace && self.conn_trace.is_none() {
            return Err("conn_class Trace requires conn_trace".to_string());
        }
        if !(0.0..=1.0).contains(&self.tsch_prob_bcast_eb_dio_prob)
            || !(0.0..=1.0).contains(&self.tsch_prob_bcast_dio_prob)
        {
            return Err("broadcast probabilities must be within [0, 1]".to_string());
        }
        if self.app_pk_period < 0.0 || self.app_pk_period_var < 0.0 {
            return Err("app_pkPeriod and app_pkPeriodVar must be non-negative".to_string());
        }
        if self.app_pk_length == 0 {
            return Err("app_pkLength must be positive".to_string());
        }
        if self.tsch_max_payload_len == 0 {
            return Err("tsch_maxPayloadLen must be positive".to_string());
        }
        if self.sf_msf_lim_num_cells_used_low >= self.sf_msf_lim_num_cells_used_high {
            return Err("sf_msf_limNumCellsUsedLow must be below the high limit".to_string());
        }
        if self.top_square_side <= 0.0 {
            return Err("top_squareSide must be positive".to_string());
        }
        Ok(())
    }

    /// Convert a duration in seconds to a slot count, rounding up.
    pub fn seconds_to_slots(&self, seconds: f64) -> u64 {
        (seconds / self.tsch_slot_duration).ceil() as u64
    }

    /// Duration of one slotframe in seconds.
    pub fn slotframe_duration(&self) -> f64 {
        self.tsch_slotframe_length as f64 * self.tsch_slot_duration
    }

    /// Total slots of one run.
    pub fn run_length_slots(&self) -> u64 {
        self.exec_num_slotframes_per_run * self.tsch_slotframe_length as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn json_keys_use_historical_spelling() {
        let settings: Settings = serde_json::from_str(
            r#"{
                "exec_numMotes": 6,
                "conn_class": "Linear",
                "sf_class": "SFNone",
                "app_pkPeriod": 10.0,
                "fragmentation": "FragmentForwarding",
                "fragmentation_ff_discard_vrb_entry_policy": ["last_fragment"]
            }"#,
        )
        .unwrap();
        assert_eq!(settings.exec_num_motes, 6);
        assert_eq!(settings.conn_class, ConnClass::Linear);
        assert_eq!(settings.sf_class, SfClass::SfNone);
        assert_eq!(settings.app_pk_period, 10.0);
        assert_eq!(
            settings.fragmentation_ff_discard_vrb_entry_policy,
            vec![VrbPolicy::LastFragment]
        );
    }

    #[test]
    fn snapshot_roundtrips() {
        let settings = Settings::default();
        let text = serde_json::to_string(&settings).unwrap();
        let back: Settings = serde_json::from_str(&text).unwrap();
        assert_eq!(back.exec_num_motes, settings.exec_num_motes);
        assert_eq!(back.tsch_slotframe_length, settings.tsch_slotframe_length);
    }

    #[test]
    fn trace_class_requires_trace_path() {
        let settings = Settings { conn_class: ConnClass::Trace, ..Settings::default() };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn seconds_to_slots_rounds_up() {
        let settings = Settings::default(); // 10 ms slots
        assert_eq!(settings.seconds_to_slots(1.0), 100);
        assert_eq!(settings.seconds_to_slots(0.015), 2);
    }

    #[test]
    fn rejects_single_slot_slotframe() {
        let settings = Settings { tsch_slotframe_length: 1, ..Settings::default() };
        assert!(settings.validate().is_err());
    }
}
