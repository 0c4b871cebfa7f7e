use crate::{
    cli::BenchmarkKind,
    metrics::{DimensionSet, MetricsLogger, SeriesSummary},
    throughput::{ClientResult, Direction},
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// File name of the JSON-lines metrics export
pub const METRICS_FILE: &str = "metrics.json";

/// File name of the run summary
pub const SUMMARY_FILE: &str = "summary.json";

/// Destination of per-client throughput reports
pub trait ArtifactSink {
    /// Persist the report of one client of one direction
    fn store(&mut self, direction: Direction, client_index: usize, result: &ClientResult) -> Result<()>;
}

/// `<direction>_<client_index>.json`; unique per direction and client
pub fn artifact_file_name(direction: Direction, client_index: usize) -> String {
    format!("{}_{}.json", direction, client_index)
}

/// Directory-backed artifact store
#[derive(Debug)]
pub struct ArtifactStore {
    dir: PathBuf,
    written: Vec<PathBuf>,
}

impl ArtifactStore {
    /// Use `dir` for every file of the run, creating it if needed
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create results directory {:?}", dir))?;
        debug!("Results directory: {:?}", dir);
        Ok(Self {
            dir,
            written: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every file written so far, in write order
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    fn write(&mut self, file_name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.dir.join(file_name);
        fs::write(&path, contents).with_context(|| format!("Failed to write {:?}", path))?;
        self.written.push(path.clone());
        Ok(path)
    }

    /// Export every observation of `metrics` as JSON lines
    pub fn write_metrics(&mut self, metrics: &MetricsLogger) -> Result<PathBuf> {
        let lines = metrics
            .to_json_lines()
            .context("Failed to serialize metric observations")?;
        let path = self.write(METRICS_FILE, &lines)?;
        info!("Wrote {} observations to {:?}", metrics.observations().len(), path);
        Ok(path)
    }

    pub fn write_summary(&mut self, summary: &RunSummary) -> Result<PathBuf> {
        let json = serde_json::to_string_pretty(summary).context("Failed to serialize run summary")?;
        let path = self.write(SUMMARY_FILE, &json)?;
        info!("Wrote run summary to {:?}", path);
        Ok(path)
    }
}

impl ArtifactSink for ArtifactStore {
    fn store(&mut self, direction: Direction, client_index: usize, result: &ClientResult) -> Result<()> {
        let json = serde_json::to_string(result)
            .with_context(|| format!("Failed to serialize {} client {} report", direction, client_index))?;
        let path = self.write(&artifact_file_name(direction, client_index), &json)?;
        debug!("Stored {} client {} report at {:?}", direction, client_index, path);
        Ok(())
    }
}

/// System information for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub benchmark_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: crate::utils::get_cpu_cores(),
            benchmark_version: crate::VERSION.to_string(),
        }
    }
}

/// Run metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub elapsed: Duration,
    pub system_info: SystemInfo,
}

/// Contents of `summary.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub metadata: RunMetadata,
    pub benchmark: BenchmarkKind,
    pub dimensions: DimensionSet,
    pub series: Vec<SeriesSummary>,
    /// File names of the per-client reports
    pub artifacts: Vec<String>,
}

impl RunSummary {
    pub fn new(
        benchmark: BenchmarkKind,
        dimensions: DimensionSet,
        series: Vec<SeriesSummary>,
        elapsed: Duration,
    ) -> Self {
        Self {
            metadata: RunMetadata {
                run_id: crate::utils::generate_run_id(),
                version: crate::VERSION.to_string(),
                timestamp: chrono::Utc::now(),
                elapsed,
                system_info: SystemInfo::default(),
            },
            benchmark,
            dimensions,
            series,
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }
}
