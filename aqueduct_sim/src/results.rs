//! Ground-truth recorder.
//!
//! One row per completed iteration, accumulated in memory and flushed as
//! CSV at shutdown. The column layout is fixed by the plant topology:
//!
//! `Timestamp, <tank>_LEVEL.., <junction>_LEVEL..,
//!  (<pump>_FLOW, <pump>_STATUS).., (<valve>_FLOW, <valve>_STATUS)..,
//!  Attack#01, Attack#02`
//!
//! A field the driver had to skip (retry budget exhausted) is recorded as
//! an empty cell rather than dropping the row.

use std::io::Write;
use std::path::Path;

use aqueduct_store::TagValue;
use tracing::info;

/// One iteration's measurements, in header order.
#[derive(Debug, Clone)]
pub struct ResultRow {
    /// Simulated seconds since the start of the run.
    pub timestamp_secs: u64,
    pub tank_levels: Vec<Option<f64>>,
    pub junction_pressures: Vec<Option<f64>>,
    /// (flow, status) per pump.
    pub pumps: Vec<(Option<f64>, Option<i64>)>,
    /// (flow, status) per valve.
    pub valves: Vec<(Option<f64>, Option<i64>)>,
    /// Actuator-side attack flag (`Attack#01`).
    pub attack_actuator: i64,
    /// Sensor-side attack flag (`Attack#02`).
    pub attack_sensor: i64,
}

/// Accumulates result rows and writes the output artifact once.
pub struct ResultsRecorder {
    header: Vec<String>,
    rows: Vec<ResultRow>,
}

impl ResultsRecorder {
    pub fn new(
        tanks: &[String],
        junctions: &[String],
        pumps: &[String],
        valves: &[String],
    ) -> Self {
        let mut header = vec!["Timestamp".to_string()];
        header.extend(tanks.iter().map(|t| format!("{t}_LEVEL")));
        header.extend(junctions.iter().map(|j| format!("{j}_LEVEL")));
        for link in pumps.iter().chain(valves.iter()) {
            header.push(format!("{link}_FLOW"));
            header.push(format!("{link}_STATUS"));
        }
        header.push("Attack#01".to_string());
        header.push("Attack#02".to_string());
        Self {
            header,
            rows: Vec::new(),
        }
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn append(&mut self, row: ResultRow) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Writes the accumulated rows as CSV, creating parent directories as
    /// needed. Returns the number of data rows written.
    pub fn write_to(&self, path: &Path) -> std::io::Result<usize> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::File::create(path)?;
        let mut out = std::io::BufWriter::new(file);
        writeln!(out, "{}", self.header.join(","))?;
        for row in &self.rows {
            writeln!(out, "{}", format_row(row))?;
        }
        out.flush()?;
        info!(rows = self.rows.len(), path = %path.display(), "ground truth written");
        Ok(self.rows.len())
    }
}

fn fmt_analog(value: Option<f64>) -> String {
    value.map(|v| TagValue::Analog(v).encode()).unwrap_or_default()
}

fn fmt_status(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn format_row(row: &ResultRow) -> String {
    let mut cells = vec![row.timestamp_secs.to_string()];
    cells.extend(row.tank_levels.iter().map(|v| fmt_analog(*v)));
    cells.extend(row.junction_pressures.iter().map(|v| fmt_analog(*v)));
    for (flow, status) in row.pumps.iter().chain(row.valves.iter()) {
        cells.push(fmt_analog(*flow));
        cells.push(fmt_status(*status));
    }
    cells.push(row.attack_actuator.to_string());
    cells.push(row.attack_sensor.to_string());
    cells.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn recorder() -> ResultsRecorder {
        ResultsRecorder::new(
            &names(&["T1", "T2"]),
            &names(&["J1"]),
            &names(&["PU1"]),
            &names(&["V2"]),
        )
    }

    #[test]
    fn header_layout_matches_topology() {
        let r = recorder();
        assert_eq!(
            r.header(),
            &[
                "Timestamp",
                "T1_LEVEL",
                "T2_LEVEL",
                "J1_LEVEL",
                "PU1_FLOW",
                "PU1_STATUS",
                "V2_FLOW",
                "V2_STATUS",
                "Attack#01",
                "Attack#02",
            ]
        );
    }

    #[test]
    fn skipped_fields_become_empty_cells() {
        let mut r = recorder();
        r.append(ResultRow {
            timestamp_secs: 3600,
            tank_levels: vec![Some(2.5), None],
            junction_pressures: vec![Some(20.18)],
            pumps: vec![(Some(0.05), Some(1))],
            valves: vec![(None, Some(0))],
            attack_actuator: 0,
            attack_sensor: 1,
        });
        assert_eq!(
            format_row(&r.rows()[0]),
            "3600,2.5,,20.18,0.05,1,,0,0,1"
        );
    }

    #[test]
    fn writes_one_line_per_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("ground_truth.csv");
        let mut r = recorder();
        for i in 0..3u64 {
            r.append(ResultRow {
                timestamp_secs: i * 3600,
                tank_levels: vec![Some(2.0), Some(1.0)],
                junction_pressures: vec![Some(20.0)],
                pumps: vec![(Some(0.05), Some(1))],
                valves: vec![(Some(0.0), Some(0))],
                attack_actuator: 0,
                attack_sensor: 0,
            });
        }
        assert_eq!(r.write_to(&path).unwrap(), 3);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 4);
        assert!(contents.starts_with("Timestamp,"));
    }
}
