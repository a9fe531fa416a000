use crate::loss::LossSnapshot;
use crate::metrics::ThroughputMetrics;
use crate::transport::{Reliability, SchemaKind};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Outcome of one payload-size iteration as seen by the subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    /// 1-based position in the run
    pub iteration: usize,
    pub payload_size: u32,
    pub demand: u32,
    pub reliability: Reliability,
    pub schema: SchemaKind,
    pub last_received: u32,
    pub lost_samples: u64,
    /// `last_received - lost_samples`, the count throughput is based on
    pub received_samples: u64,
    /// Alive samples actually consumed from the reader
    pub delivered_samples: u64,
    pub total_time_us: u64,
    pub samples_per_second: f64,
    pub megabits_per_second: f64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl IterationResult {
    pub fn new(
        iteration: usize,
        payload_size: u32,
        demand: u32,
        snapshot: LossSnapshot,
        metrics: &ThroughputMetrics,
    ) -> Self {
        Self {
            iteration,
            payload_size,
            demand,
            reliability: Reliability::BestEffort,
            schema: SchemaKind::Static,
            last_received: snapshot.last_sequence_seen,
            lost_samples: metrics.lost_samples,
            received_samples: metrics.received_samples,
            delivered_samples: metrics.received_samples,
            total_time_us: metrics.total_time_us,
            samples_per_second: metrics.samples_per_second,
            megabits_per_second: metrics.megabits_per_second,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn with_qos(mut self, reliability: Reliability, schema: SchemaKind) -> Self {
        self.reliability = reliability;
        self.schema = schema;
        self
    }

    pub fn with_delivered(mut self, delivered: u64) -> Self {
        self.delivered_samples = delivered;
        self
    }

    /// Fraction of the sequence range that was lost, in percent
    pub fn loss_percent(&self) -> f64 {
        if self.last_received == 0 {
            0.0
        } else {
            self.lost_samples as f64 * 100.0 / f64::from(self.last_received)
        }
    }
}

/// System information for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub hostname: String,
    pub cpu_cores: usize,
    pub rust_version: String,
    pub benchmark_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            hostname: crate::utils::local_hostname(),
            cpu_cores: num_cpus::get(),
            rust_version: env!("CARGO_PKG_RUST_VERSION").to_string(),
            benchmark_version: crate::VERSION.to_string(),
        }
    }
}

/// Run metadata written alongside the results
#[derive(Debug, Serialize, Deserialize)]
pub struct RunMetadata {
    pub version: String,
    pub run_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub total_iterations: usize,
    pub system_info: SystemInfo,
}

/// Totals across every iteration of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_received: u64,
    pub total_lost: u64,
    pub peak_samples_per_second: f64,
    pub peak_megabits_per_second: f64,
    /// Payload size at which the peak bit rate was reached
    pub peak_payload_size: Option<u32>,
}

/// Final results document
#[derive(Debug, Serialize, Deserialize)]
pub struct FinalResults {
    pub metadata: RunMetadata,
    pub results: Vec<IterationResult>,
    pub summary: RunSummary,
}

/// Collects iteration results and writes them out as JSON
pub struct ResultsManager {
    output_file: Option<PathBuf>,
    run_id: String,
    results: Vec<IterationResult>,
}

impl ResultsManager {
    /// Without an output file results are only logged
    pub fn new(output_file: Option<&Path>) -> Self {
        Self {
            output_file: output_file.map(Path::to_path_buf),
            run_id: crate::utils::generate_run_id(),
            results: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn add_result(&mut self, result: IterationResult) {
        debug!(
            "Recording iteration {} ({} bytes)",
            result.iteration, result.payload_size
        );
        self.results.push(result);
    }

    pub fn results(&self) -> &[IterationResult] {
        &self.results
    }

    /// Totals and peak rates over the recorded iterations
    pub fn summary(&self) -> RunSummary {
        let peak = self.results.iter().max_by(|a, b| {
            a.megabits_per_second
                .partial_cmp(&b.megabits_per_second)
                .unwrap_or(Ordering::Equal)
        });

        RunSummary {
            total_received: self.results.iter().map(|r| r.received_samples).sum(),
            total_lost: self.results.iter().map(|r| r.lost_samples).sum(),
            peak_samples_per_second: self
                .results
                .iter()
                .map(|r| r.samples_per_second)
                .fold(0.0, f64::max),
            peak_megabits_per_second: peak.map_or(0.0, |r| r.megabits_per_second),
            peak_payload_size: peak.map(|r| r.payload_size),
        }
    }

    /// Log the summary and write the JSON document if an output file is set
    pub fn finalize(&self) -> Result<()> {
        let summary = self.summary();
        info!(
            "Run {}: {} iteration(s), {} received, {} lost",
            self.run_id,
            self.results.len(),
            summary.total_received,
            summary.total_lost
        );

        let Some(path) = &self.output_file else {
            return Ok(());
        };

        let document = FinalResults {
            metadata: RunMetadata {
                version: crate::VERSION.to_string(),
                run_id: self.run_id.clone(),
                timestamp: chrono::Utc::now(),
                total_iterations: self.results.len(),
                system_info: SystemInfo::default(),
            },
            results: self.results.clone(),
            summary,
        };
        let json = serde_json::to_string_pretty(&document)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write results to {:?}", path))?;

        info!("Results written to: {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn result(iteration: usize, payload_size: u32, mbps: f64) -> IterationResult {
        let snapshot = LossSnapshot {
            last_sequence_seen: 1000,
            cumulative_lost: 10,
        };
        let mut metrics = ThroughputMetrics::compute(snapshot, 1_000_000, payload_size);
        metrics.megabits_per_second = mbps;
        IterationResult::new(iteration, payload_size, 100, snapshot, &metrics)
    }

    #[test]
    fn test_iteration_result_from_metrics() {
        let r = result(1, 1024, 8.0).with_qos(Reliability::Reliable, SchemaKind::Dynamic);
        assert_eq!(r.last_received, 1000);
        assert_eq!(r.lost_samples, 10);
        assert_eq!(r.received_samples, 990);
        assert_eq!(r.reliability, Reliability::Reliable);
        assert!((r.loss_percent() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_summary_picks_peak() {
        let mut manager = ResultsManager::new(None);
        manager.add_result(result(1, 64, 2.0));
        manager.add_result(result(2, 1024, 30.0));
        manager.add_result(result(3, 4096, 12.0));

        let summary = manager.summary();
        assert_eq!(summary.total_received, 3 * 990);
        assert_eq!(summary.total_lost, 30);
        assert_eq!(summary.peak_payload_size, Some(1024));
        assert_eq!(summary.peak_megabits_per_second, 30.0);
    }

    #[test]
    fn test_finalize_writes_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.json");
        let mut manager = ResultsManager::new(Some(&path));
        manager.add_result(result(1, 256, 1.5));
        manager.finalize().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let document: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(document["metadata"]["run_id"], manager.run_id());
        assert_eq!(document["metadata"]["total_iterations"], 1);
        assert_eq!(document["results"][0]["payload_size"], 256);
        assert_eq!(document["results"][0]["reliability"], "BestEffort");
    }

    #[test]
    fn test_finalize_without_output_file() {
        let manager = ResultsManager::new(None);
        assert!(manager.finalize().is_ok());
        assert_eq!(manager.summary().peak_payload_size, None);
    }
}
