//! Synthetic workload driver for soak-testing a session.
//!
//! Runs `iterations` operations back to back on one [`ClientSession`] and
//! aggregates counts, bytes moved and latency percentiles. `mixed` picks
//! each operation from a seeded weighted distribution, so a run is
//! reproducible for a given seed.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, info, warn};

use tether_core::TetherError;

use crate::session::ClientSession;

const SEED_FILE: &str = "stress-seed.bin";
const UPLOAD_NAME: &str = "stress-upload.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StressOperation {
    Json,
    Upload,
    Download,
    Mixed,
}

impl fmt::Display for StressOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StressOperation::Json => write!(f, "json"),
            StressOperation::Upload => write!(f, "upload"),
            StressOperation::Download => write!(f, "download"),
            StressOperation::Mixed => write!(f, "mixed"),
        }
    }
}

impl FromStr for StressOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "upload" => Ok(Self::Upload),
            "download" => Ok(Self::Download),
            "mixed" => Ok(Self::Mixed),
            other => Err(format!("unknown stress operation: {other}")),
        }
    }
}

/// Relative weights for `mixed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixWeights {
    pub json: u32,
    pub upload: u32,
    pub download: u32,
}

impl Default for MixWeights {
    fn default() -> Self {
        Self {
            json: 6,
            upload: 2,
            download: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StressConfig {
    pub operation: StressOperation,
    pub iterations: u32,
    /// Size of the generated upload/download payload.
    pub payload_size: usize,
    pub seed: u64,
    pub weights: MixWeights,
    /// Where the local payload and downloads are written.
    pub scratch_dir: PathBuf,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operation: StressOperation::Json,
            iterations: 100,
            payload_size: 256 * 1024,
            seed: 42,
            weights: MixWeights::default(),
            scratch_dir: std::env::temp_dir().join("tether-stress"),
        }
    }
}

// ── Report ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StressReport {
    pub operation: StressOperation,
    pub iterations: u32,
    pub successes: u32,
    pub failures: u32,
    pub bytes: u64,
    pub elapsed: Duration,
    /// One entry per iteration, in completion order.
    pub latencies: Vec<Duration>,
    /// First few failure messages.
    pub errors: Vec<String>,
}

const MAX_RECORDED_ERRORS: usize = 10;

impl StressReport {
    fn new(operation: StressOperation) -> Self {
        Self {
            operation,
            iterations: 0,
            successes: 0,
            failures: 0,
            bytes: 0,
            elapsed: Duration::ZERO,
            latencies: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn record(&mut self, latency: Duration, outcome: Result<u64, TetherError>) {
        self.iterations += 1;
        self.latencies.push(latency);
        match outcome {
            Ok(bytes) => {
                self.successes += 1;
                self.bytes += bytes;
            }
            Err(e) => {
                self.failures += 1;
                if self.errors.len() < MAX_RECORDED_ERRORS {
                    self.errors.push(e.to_string());
                }
            }
        }
    }

    /// Percentage of iterations that succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.iterations == 0 {
            return 0.0;
        }
        self.successes as f64 * 100.0 / self.iterations as f64
    }

    pub fn ops_per_second(&self) -> f64 {
        per_second(self.iterations as f64, self.elapsed)
    }

    pub fn bytes_per_second(&self) -> f64 {
        per_second(self.bytes as f64, self.elapsed)
    }

    pub fn min_latency(&self) -> Duration {
        self.latencies.iter().copied().min().unwrap_or_default()
    }

    pub fn max_latency(&self) -> Duration {
        self.latencies.iter().copied().max().unwrap_or_default()
    }

    pub fn mean_latency(&self) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        self.latencies.iter().sum::<Duration>() / self.latencies.len() as u32
    }

    /// Nearest-rank 95th percentile.
    pub fn p95_latency(&self) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted = self.latencies.clone();
        sorted.sort_unstable();
        let rank = (sorted.len() * 95).div_ceil(100);
        sorted[rank.saturating_sub(1)]
    }
}

fn per_second(amount: f64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { amount / secs } else { 0.0 }
}

impl fmt::Display for StressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "operation:    {}", self.operation)?;
        writeln!(f, "iterations:   {}", self.iterations)?;
        writeln!(f, "successes:    {}", self.successes)?;
        writeln!(f, "failures:     {}", self.failures)?;
        writeln!(f, "success rate: {:.2}%", self.success_rate())?;
        writeln!(f, "elapsed:      {:.3}s", self.elapsed.as_secs_f64())?;
        writeln!(f, "ops/sec:      {:.2}", self.ops_per_second())?;
        writeln!(f, "bytes moved:  {}", self.bytes)?;
        writeln!(f, "throughput:   {:.2} KiB/s", self.bytes_per_second() / 1024.0)?;
        write!(
            f,
            "latency:      min {:?} / mean {:?} / p95 {:?} / max {:?}",
            self.min_latency(),
            self.mean_latency(),
            self.p95_latency(),
            self.max_latency()
        )
    }
}

// ── Harness ──────────────────────────────────────────────────────

pub struct StressHarness<'a> {
    session: &'a ClientSession,
    config: StressConfig,
}

impl<'a> StressHarness<'a> {
    pub fn new(session: &'a ClientSession, config: StressConfig) -> Self {
        Self { session, config }
    }

    fn needs(&self, op: StressOperation) -> bool {
        let w = self.config.weights;
        match self.config.operation {
            StressOperation::Mixed => match op {
                StressOperation::Upload => w.upload > 0,
                StressOperation::Download => w.download > 0,
                _ => false,
            },
            current => current == op,
        }
    }

    fn payload_path(&self) -> PathBuf {
        self.config.scratch_dir.join("stress-payload.bin")
    }

    /// Write the local payload and, for downloads, seed the server.
    async fn prepare(&self) -> Result<(), TetherError> {
        if !self.needs(StressOperation::Upload) && !self.needs(StressOperation::Download) {
            return Ok(());
        }
        let mut payload = vec![0u8; self.config.payload_size];
        StdRng::seed_from_u64(self.config.seed).fill_bytes(&mut payload);
        tokio::fs::create_dir_all(&self.config.scratch_dir).await?;
        tokio::fs::write(self.payload_path(), &payload).await?;

        if self.needs(StressOperation::Download) {
            self.session.upload(&self.payload_path(), Some(SEED_FILE)).await?;
            debug!(size = payload.len(), "download seed uploaded");
        }
        Ok(())
    }

    pub async fn run(&self) -> Result<StressReport, TetherError> {
        self.prepare().await?;

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let w = self.config.weights;
        let choices = [
            (StressOperation::Json, w.json),
            (StressOperation::Upload, w.upload),
            (StressOperation::Download, w.download),
        ];
        let mix = match self.config.operation {
            StressOperation::Mixed => Some(
                WeightedIndex::new(choices.iter().map(|(_, weight)| *weight))
                    .map_err(|e| TetherError::Config(format!("invalid mix weights: {e}")))?,
            ),
            _ => None,
        };

        info!(
            operation = %self.config.operation,
            iterations = self.config.iterations,
            seed = self.config.seed,
            "stress run started"
        );
        let mut report = StressReport::new(self.config.operation);
        let started = Instant::now();
        for iteration in 0..self.config.iterations {
            let op = match &mix {
                Some(mix) => choices[mix.sample(&mut rng)].0,
                None => self.config.operation,
            };
            let t0 = Instant::now();
            let outcome = self.run_once(op, iteration).await;
            if let Err(e) = &outcome {
                warn!(%op, iteration, error = %e, "stress iteration failed");
            }
            report.record(t0.elapsed(), outcome);
        }
        report.elapsed = started.elapsed();
        info!(
            successes = report.successes,
            failures = report.failures,
            "stress run finished: {:.2}% success",
            report.success_rate()
        );
        Ok(report)
    }

    /// One operation; returns the payload bytes it moved.
    async fn run_once(&self, op: StressOperation, iteration: u32) -> Result<u64, TetherError> {
        match op {
            StressOperation::Json => {
                let json = serde_json::json!({ "iteration": iteration, "seed": self.config.seed }).to_string();
                let len = json.len() as u64;
                let ack = self.session.send_json("stress", json).await?;
                if ack.success {
                    Ok(len)
                } else {
                    Err(TetherError::Remote(ack.error.unwrap_or_else(|| "negative ack".into())))
                }
            }
            StressOperation::Upload => {
                self.session.upload(&self.payload_path(), Some(UPLOAD_NAME)).await?;
                Ok(self.config.payload_size as u64)
            }
            StressOperation::Download => {
                let dest = self.config.scratch_dir.join("stress-download.bin");
                self.session.download(SEED_FILE, &dest).await
            }
            StressOperation::Mixed => Err(TetherError::Other("mixed is not a single operation".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(latencies_ms: &[u64], failures: u32) -> StressReport {
        let mut report = StressReport::new(StressOperation::Json);
        for (i, ms) in latencies_ms.iter().enumerate() {
            let outcome = if (i as u32) < failures {
                Err(TetherError::ChannelClosed)
            } else {
                Ok(10)
            };
            report.record(Duration::from_millis(*ms), outcome);
        }
        report.elapsed = Duration::from_secs(2);
        report
    }

    #[test]
    fn latency_statistics() {
        let latencies: Vec<u64> = (1..=20).collect();
        let r = report(&latencies, 0);
        assert_eq!(r.min_latency(), Duration::from_millis(1));
        assert_eq!(r.max_latency(), Duration::from_millis(20));
        assert_eq!(r.p95_latency(), Duration::from_millis(19));
        assert_eq!(r.mean_latency(), Duration::from_micros(10_500));
        assert_eq!(r.ops_per_second(), 10.0);
        assert_eq!(r.bytes, 200);
    }

    #[test]
    fn success_rate_has_two_decimals() {
        let r = report(&[1, 1, 1], 1);
        assert_eq!(format!("{:.2}", r.success_rate()), "66.67");
        assert!(r.to_string().contains("success rate: 66.67%"));
        assert_eq!(r.errors, vec!["channel closed"]);
    }

    #[test]
    fn empty_report_is_zeroed() {
        let r = StressReport::new(StressOperation::Mixed);
        assert_eq!(r.success_rate(), 0.0);
        assert_eq!(r.p95_latency(), Duration::ZERO);
        assert_eq!(r.mean_latency(), Duration::ZERO);
    }

    #[test]
    fn operations_parse() {
        assert_eq!("MIXED".parse::<StressOperation>().unwrap(), StressOperation::Mixed);
        assert!("ping".parse::<StressOperation>().is_err());
    }

    #[test]
    fn seeded_mix_is_reproducible() {
        let weights = WeightedIndex::new([6u32, 2, 2]).unwrap();
        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..50).map(|_| weights.sample(&mut rng)).collect::<Vec<_>>()
        };
        assert_eq!(draw(9), draw(9));
    }
}
