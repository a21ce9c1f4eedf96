//! Connectivity trace reader.
//!
//! A trace is a CSV file with header `datetime,src,dst,channel,pdr,rssi`.
//! Timestamps are mapped to ASNs relative to the first row; the matrix is
//! advanced row by row as simulated time passes the row's ASN.

use std::fmt;

use chrono::NaiveDateTime;

#[derive(Debug, Clone, PartialEq)]
pub struct TraceRow {
    pub asn: u64,
    pub src: usize,
    pub dst: usize,
    pub channel: u8,
    pub pdr: f64,
    pub rssi: f64,
}

#[derive(Debug)]
pub enum TraceError {
    MissingHeader,
    BadHeader(String),
    BadRow { line: usize, reason: String },
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceError::MissingHeader => write!(f, "trace file is empty"),
            TraceError::BadHeader(h) => write!(f, "unexpected trace header: {}", h),
            TraceError::BadRow { line, reason } => {
                write!(f, "bad trace row at line {}: {}", line, reason)
            }
        }
    }
}

impl std::error::Error for TraceError {}

const EXPECTED_HEADER: &str = "datetime,src,dst,channel,pdr,rssi";

/// Parsed trace with a cursor over the not-yet-applied rows.
pub struct TraceReader {
    rows: Vec<TraceRow>,
    cursor: usize,
}

impl TraceReader {
    /// Parse the whole trace. Rows must be in chronological order.
    pub fn parse(content: &str, slot_duration: f64) -> Result<Self, TraceError> {
        let mut lines = content.lines().enumerate();
        let (_, header) = lines.next().ok_or(TraceError::MissingHeader)?;
        if header.trim() != EXPECTED_HEADER {
            return Err(TraceError::BadHeader(header.to_string()));
        }

        let mut rows = Vec::new();
        let mut t0: Option<NaiveDateTime> = None;
        for (idx, line) in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let row = Self::parse_row(line, idx + 1, slot_duration, &mut t0)?;
            if let Some(previous) = rows.last() {
                let previous: &TraceRow = previous;
                if row.asn < previous.asn {
                    return Err(TraceError::BadRow {
                        line: idx + 1,
                        reason: "rows out of chronological order".to_string(),
                    });
                }
            }
            rows.push(row);
        }
        Ok(TraceReader { rows, cursor: 0 })
    }

    fn parse_row(
        line: &str,
        line_no: usize,
        slot_duration: f64,
        t0: &mut Option<NaiveDateTime>,
    ) -> Result<TraceRow, TraceError> {
        let bad = |reason: &str| TraceError::BadRow { line: line_no, reason: reason.to_string() };

        let fields: Vec<&str> = line.split(',').map(|f| f.trim()).collect();
        if fields.len() != 6 {
            return Err(bad("expected 6 comma-separated fields"));
        }

        let datetime = parse_datetime(fields[0]).ok_or_else(|| bad("unparseable datetime"))?;
        let reference = *t0.get_or_insert(datetime);
        let elapsed = (datetime - reference).num_milliseconds();
        if elapsed < 0 {
            return Err(bad("timestamp before trace start"));
        }
        let asn = (elapsed as f64 / 1000.0 / slot_duration).floor() as u64;

        let src = fields[1].parse().map_err(|_| bad("bad src"))?;
        let dst = fields[2].parse().map_err(|_| bad("bad dst"))?;
        let channel = fields[3].parse().map_err(|_| bad("bad channel"))?;
        let pdr: f64 = fields[4].parse().map_err(|_| bad("bad pdr"))?;
        let rssi: f64 = fields[5].parse().map_err(|_| bad("bad rssi"))?;
        if !(0.0..=1.0).contains(&pdr) {
            return Err(bad("pdr outside [0, 1]"));
        }

        Ok(TraceRow { asn, src, dst, channel, pdr, rssi })
    }

    /// Rows whose time has come: every row with `row.asn < asn`.
    pub fn pop_due(&mut self, asn: u64) -> &[TraceRow] {
        let start = self.cursor;
        while self.cursor < self.rows.len() && asn > self.rows[self.cursor].asn {
            self.cursor += 1;
        }
        &self.rows[start..self.cursor]
    }

    pub fn remaining(&self) -> usize {
        self.rows.len() - self.cursor
    }
}

fn parse_datetime(field: &str) -> Option<NaiveDateTime> {
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.fZ"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(field, format) {
            return Some(dt);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE: &str = "\
datetime,src,dst,channel,pdr,rssi
2020-01-01 00:00:00,0,1,0,1.0,-60
2020-01-01 00:00:01,1,0,0,0.8,-70
2020-01-01 00:00:02,0,1,1,0.5,-80
";

    #[test]
    fn parses_rows_and_maps_asns() {
        let reader = TraceReader::parse(TRACE, 0.010).unwrap();
        assert_eq!(reader.rows.len(), 3);
        assert_eq!(reader.rows[0].asn, 0);
        assert_eq!(reader.rows[1].asn, 100);
        assert_eq!(reader.rows[2].asn, 200);
        assert_eq!(reader.rows[1].pdr, 0.8);
    }

    #[test]
    fn pop_due_advances_past_rows() {
        let mut reader = TraceReader::parse(TRACE, 0.010).unwrap();
        assert!(reader.pop_due(0).is_empty());
        // asn must exceed the row asn before the row applies
        assert_eq!(reader.pop_due(1).len(), 1);
        assert_eq!(reader.pop_due(150).len(), 1);
        assert_eq!(reader.pop_due(500).len(), 1);
        assert_eq!(reader.remaining(), 0);
        assert!(reader.pop_due(1000).is_empty());
    }

    #[test]
    fn rejects_bad_header() {
        assert!(matches!(
            TraceReader::parse("time,src,dst\n", 0.010),
            Err(TraceError::BadHeader(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_pdr() {
        let trace = "datetime,src,dst,channel,pdr,rssi\n2020-01-01 00:00:00,0,1,0,1.5,-60\n";
        assert!(matches!(TraceReader::parse(trace, 0.010), Err(TraceError::BadRow { .. })));
    }

    #[test]
    fn accepts_iso8601_t_separator() {
        let trace = "datetime,src,dst,channel,pdr,rssi\n2020-01-01T00:00:00Z,0,1,0,1.0,-60\n";
        let reader = TraceReader::parse(trace, 0.010).unwrap();
        assert_eq!(reader.rows.len(), 1);
    }
}
