//! Structured event log.
//!
//! One JSON object per line; the first line is the settings snapshot, every
//! other line carries `_asn`, `_type` and `_run_id` plus type-specific keys.
//! Lines are written as they are produced, never buffered for the whole
//! run. Tests use the in-memory sink and parse lines back with serde_json.

use std::io::Write;

use serde_json::{Map, Value, json};

use crate::settings::Settings;

/// Log event types. The set below is what the KPI post-processor consumes,
/// plus the per-frame TSCH events the functional tests rely on.
pub mod types {
    pub const CONFIG: &str = "config";
    pub const TSCH_SYNCED: &str = "tsch.synced";
    pub const TSCH_DESYNCED: &str = "tsch.desynced";
    pub const TSCH_TXDONE: &str = "tsch.txdone";
    pub const TSCH_ADD_CELL: &str = "tsch.add_cell";
    pub const TSCH_DELETE_CELL: &str = "tsch.delete_cell";
    pub const TSCH_TXQUEUE_LENGTH: &str = "tsch.txqueue_length";
    pub const SECJOIN_TX: &str = "secjoin.tx";
    pub const SECJOIN_JOINED: &str = "secjoin.joined";
    pub const APP_TX: &str = "app.tx";
    pub const APP_RX: &str = "app.rx";
    pub const RADIO_STATS: &str = "radio.stats";
    pub const SIXP_TRANSACTION_COMPLETED: &str = "sixp.transaction_completed";
    pub const SIXP_TRANSACTION_ERROR: &str = "sixp.transaction_error";
    pub const RPL_CHURN: &str = "rpl.churn";
    pub const PACKET_DROPPED: &str = "packet.dropped";
    pub const PROP_INTERFERENCE: &str = "prop.interference";
}

/// Where log lines go.
pub enum LogSink {
    Writer(Box<dyn Write>),
    Memory(Vec<String>),
    Null,
}

pub struct SimLog {
    sink: LogSink,
    run_id: u64,
}

impl SimLog {
    pub fn new(sink: LogSink, run_id: u64) -> Self {
        SimLog { sink, run_id }
    }

    pub fn memory(run_id: u64) -> Self {
        Self::new(LogSink::Memory(Vec::new()), run_id)
    }

    /// Write the settings snapshot. Must be the first line of the log.
    pub fn log_settings(&mut self, settings: &Settings) {
        let line = json!({
            "_type": types::CONFIG,
            "_run_id": self.run_id,
            "settings": settings,
        });
        self.write_line(&line);
    }

    /// Append one event line.
    pub fn log(&mut self, asn: u64, event_type: &'static str, fields: Value) {
        let mut obj = Map::new();
        obj.insert("_asn".to_string(), json!(asn));
        obj.insert("_type".to_string(), json!(event_type));
        obj.insert("_run_id".to_string(), json!(self.run_id));
        if let Value::Object(map) = fields {
            for (k, v) in map {
                obj.insert(k, v);
            }
        }
        self.write_line(&Value::Object(obj));
    }

    fn write_line(&mut self, value: &Value) {
        match &mut self.sink {
            LogSink::Writer(w) => {
                if let Err(e) = writeln!(w, "{}", value) {
                    log::error!("failed to write log line: {}", e);
                }
            }
            LogSink::Memory(lines) => lines.push(value.to_string()),
            LogSink::Null => {}
        }
    }

    pub fn flush(&mut self) {
        if let LogSink::Writer(w) = &mut self.sink {
            if let Err(e) = w.flush() {
                log::error!("failed to flush log: {}", e);
            }
        }
    }

    /// Raw lines of the in-memory sink; `None` for other sinks.
    pub fn lines(&self) -> Option<&[String]> {
        match &self.sink {
            LogSink::Memory(lines) => Some(lines),
            _ => None,
        }
    }

    /// Parsed lines of the in-memory sink filtered by `_type`.
    pub fn entries_of_type(&self, event_type: &str) -> Vec<Value> {
        self.lines()
            .unwrap_or(&[])
            .iter()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter(|v| v["_type"] == event_type)
            .collect()
    }
}

impl Drop for SimLog {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_carry_envelope_keys() {
        let mut log = SimLog::memory(3);
        log.log(42, types::APP_TX, json!({ "_mote_id": 1, "appcounter": 0 }));
        let lines = log.lines().unwrap();
        assert_eq!(lines.len(), 1);
        let v: Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(v["_asn"], 42);
        assert_eq!(v["_type"], "app.tx");
        assert_eq!(v["_run_id"], 3);
        assert_eq!(v["_mote_id"], 1);
    }

    #[test]
    fn settings_snapshot_is_a_config_line() {
        let mut log = SimLog::memory(0);
        log.log_settings(&Settings::default());
        let v: Value = serde_json::from_str(&log.lines().unwrap()[0]).unwrap();
        assert_eq!(v["_type"], "config");
        assert_eq!(v["settings"]["exec_numMotes"], 10);
    }

    #[test]
    fn entries_of_type_filters() {
        let mut log = SimLog::memory(0);
        log.log(1, types::APP_TX, json!({}));
        log.log(2, types::APP_RX, json!({}));
        log.log(3, types::APP_TX, json!({}));
        assert_eq!(log.entries_of_type(types::APP_TX).len(), 2);
        assert_eq!(log.entries_of_type(types::APP_RX).len(), 1);
    }

    #[test]
    fn null_sink_swallows_everything() {
        let mut log = SimLog::new(LogSink::Null, 0);
        log.log(1, types::APP_TX, json!({}));
        assert!(log.lines().is_none());
    }
}
