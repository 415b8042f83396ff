//! Metric stream and CSV sink.
//!
//! Modules emit `(metric, value, timestamp)` triples during the run; the
//! recorder keeps them in memory per series and writes them out afterwards.
//!
//! # Storage format
//!
//! The output directory contains:
//! - `<metric>.csv` — one file per series, header `value,timestamp`
//! - `run.json` — run metadata (run id, experiment name, seed, duration,
//!   per-series sample counts)

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use uuid::Uuid;

use crate::error::SimError;
use crate::messages::SimTime;

/// One emitted sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSample {
    pub value: f64,
    pub timestamp: SimTime,
}

/// In-memory metric series, keyed by metric name.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    series: BTreeMap<String, Vec<MetricSample>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        MetricsRecorder::default()
    }

    pub fn emit(&mut self, metric: &str, value: f64, timestamp: SimTime) {
        self.series
            .entry(metric.to_string())
            .or_default()
            .push(MetricSample { value, timestamp });
    }

    /// Samples of one series, empty if the metric never fired.
    pub fn series(&self, metric: &str) -> &[MetricSample] {
        self.series.get(metric).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn metric_names(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn total_samples(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }

    /// Write one `<metric>.csv` per series into `dir` (created if missing).
    pub fn write_csv(&self, dir: &Path) -> Result<(), SimError> {
        fs::create_dir_all(dir)?;
        for (name, samples) in &self.series {
            let mut w = BufWriter::new(File::create(dir.join(format!("{name}.csv")))?);
            writeln!(w, "value,timestamp")?;
            for s in samples {
                writeln!(w, "{},{}", s.value, s.timestamp)?;
            }
            w.flush()?;
        }
        Ok(())
    }

    /// Per-series sample counts, for the run summary.
    pub fn sample_counts(&self) -> BTreeMap<String, usize> {
        self.series
            .iter()
            .map(|(k, v)| (k.clone(), v.len()))
            .collect()
    }
}

/// Metadata written next to the CSVs after a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub experiment: String,
    pub seed: u64,
    /// Configured horizon, µs.
    pub duration: f64,
    /// Clock value when the run stopped, µs.
    pub end_time: f64,
    pub events_processed: u64,
    pub samples: BTreeMap<String, usize>,
}

impl RunSummary {
    pub fn new(
        experiment: &str,
        seed: u64,
        duration: f64,
        end_time: f64,
        events_processed: u64,
        recorder: &MetricsRecorder,
    ) -> Self {
        RunSummary {
            run_id: Uuid::new_v4().to_string(),
            experiment: experiment.to_string(),
            seed,
            duration,
            end_time,
            events_processed,
            samples: recorder.sample_counts(),
        }
    }

    pub fn write(&self, dir: &Path) -> Result<(), SimError> {
        fs::create_dir_all(dir)?;
        let mut w = BufWriter::new(File::create(dir.join("run.json"))?);
        serde_json::to_writer_pretty(&mut w, self)?;
        w.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_appends_in_order() {
        let mut rec = MetricsRecorder::new();
        rec.emit("latency", 10.0, 1.0);
        rec.emit("latency", 20.0, 2.0);
        rec.emit("fidelity", 0.9, 2.0);

        let lat = rec.series("latency");
        assert_eq!(lat.len(), 2);
        assert_eq!(lat[0].value, 10.0);
        assert_eq!(lat[1].timestamp, 2.0);
        assert_eq!(rec.total_samples(), 3);
        assert!(rec.series("throughput").is_empty());
    }

    #[test]
    fn csv_files_per_metric() {
        let mut rec = MetricsRecorder::new();
        rec.emit("throughput", 1.0, 5.0);
        rec.emit("throughput", 1.0, 9.0);

        let dir = tempfile::tempdir().unwrap();
        rec.write_csv(dir.path()).unwrap();

        let text = fs::read_to_string(dir.path().join("throughput.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "value,timestamp");
        assert_eq!(lines[1], "1,5");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn summary_counts_series() {
        let mut rec = MetricsRecorder::new();
        rec.emit("latency", 1.0, 0.0);
        rec.emit("latency", 2.0, 1.0);

        let summary = RunSummary::new("smoke", 7, 1e6, 1e6, 42, &rec);
        assert_eq!(summary.samples.get("latency"), Some(&2));

        let dir = tempfile::tempdir().unwrap();
        summary.write(dir.path()).unwrap();
        let text = fs::read_to_string(dir.path().join("run.json")).unwrap();
        assert!(text.contains("\"experiment\": \"smoke\""));
    }
}
