//! # Metrics Emission Pipeline
//!
//! Observations are scalar values tagged with the dimension set of the run
//! that produced them. A [`MetricsLogger`] belongs to exactly one run and is
//! passed explicitly to whatever emits into it, so two runs in one process
//! never share dimensions.
//!
//! Aggregate statistics are computed from the raw observations with an HDR
//! histogram, the same way latency percentiles are computed elsewhere in the
//! suite.

use crate::error::{BenchError, BenchResult};
use crate::throughput::{Direction, RunResult};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Unit attached to throughput observations
pub const THROUGHPUT_UNIT: &str = "Megabits/Second";

/// Dimension added to throughput observations to separate series
pub const AGGREGATION_DIMENSION: &str = "aggregation";

/// Dimension naming the client of a per-client throughput observation
pub const CLIENT_INDEX_DIMENSION: &str = "client_index";

/// Percentiles reported by [`SeriesSummary`]
pub const SUMMARY_PERCENTILES: [f64; 3] = [50.0, 90.0, 99.0];

/// Values are stored in the histogram with this many fractional digits
const HISTOGRAM_SCALE: f64 = 1000.0;
const HISTOGRAM_SIGFIG: u8 = 3;

/// Ordered dimension name → value mapping attached to observations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DimensionSet(BTreeMap<String, String>);

impl DimensionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy of this set with `extra` dimensions added on top
    pub fn extended(&self, extra: &[(&str, String)]) -> Self {
        let mut dims = self.clone();
        for (name, value) in extra {
            dims.insert(*name, value.clone());
        }
        dims
    }

    fn matches(&self, filter: &[(&str, &str)]) -> bool {
        filter
            .iter()
            .all(|(name, value)| self.get(name) == Some(*value))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for DimensionSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut dims = Self::new();
        for (name, value) in iter {
            dims.insert(name, value);
        }
        dims
    }
}

/// One recorded metric value
#[derive(Debug, Clone)]
pub struct Observation {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub dimensions: Arc<DimensionSet>,
}

#[derive(Serialize)]
struct ObservationRecord<'a> {
    timestamp: chrono::DateTime<chrono::Utc>,
    name: &'a str,
    value: f64,
    unit: &'a str,
    dimensions: &'a DimensionSet,
}

impl Observation {
    fn record(&self) -> ObservationRecord<'_> {
        ObservationRecord {
            timestamp: self.timestamp,
            name: &self.name,
            value: self.value,
            unit: &self.unit,
            dimensions: &self.dimensions,
        }
    }
}

/// Percentile value pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileValue {
    pub percentile: f64,
    pub value: f64,
}

/// Aggregate statistics over one metric series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesSummary {
    pub name: String,
    pub unit: String,
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub percentiles: Vec<PercentileValue>,
}

impl SeriesSummary {
    /// Summarize raw values; `None` for an empty series
    pub fn from_values(name: &str, unit: &str, values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let mut histogram = Histogram::<u64>::new(HISTOGRAM_SIGFIG).ok()?;
        for &value in values {
            let scaled = value.max(0.0) * HISTOGRAM_SCALE;
            if !scaled.is_finite() || scaled >= u64::MAX as f64 {
                warn!("Leaving {} out of the {} percentiles: value is out of range", value, name);
                continue;
            }
            if let Err(e) = histogram.record(scaled.round() as u64) {
                warn!("Leaving {} out of the {} percentiles: {}", value, name, e);
            }
        }

        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let recorded: &[f64] = if histogram.len() == 0 {
            &[]
        } else {
            &SUMMARY_PERCENTILES
        };
        let percentiles = recorded
            .iter()
            .map(|&p| PercentileValue {
                percentile: p,
                value: histogram.value_at_percentile(p) as f64 / HISTOGRAM_SCALE,
            })
            .collect();

        Some(Self {
            name: name.to_string(),
            unit: unit.to_string(),
            count,
            min,
            max,
            mean,
            std_dev: variance.sqrt(),
            percentiles,
        })
    }

    pub fn percentile(&self, percentile: f64) -> Option<f64> {
        self.percentiles
            .iter()
            .find(|p| (p.percentile - percentile).abs() < 0.1)
            .map(|p| p.value)
    }
}

/// Collects the observations of a single benchmark run
#[derive(Debug, Default)]
pub struct MetricsLogger {
    dimensions: Option<Arc<DimensionSet>>,
    observations: Vec<Observation>,
}

impl MetricsLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the active dimension set.
    ///
    /// Observations recorded earlier keep the set they were tagged with.
    pub fn set_dimensions(&mut self, dimensions: DimensionSet) {
        debug!("Metric dimensions set to {:?}", dimensions);
        self.dimensions = Some(Arc::new(dimensions));
    }

    pub fn dimensions(&self) -> Option<&DimensionSet> {
        self.dimensions.as_deref()
    }

    /// Record one observation tagged with the active dimension set
    pub fn put_metric(&mut self, name: &str, value: f64, unit: &str) -> BenchResult<()> {
        self.put_metric_with(name, value, unit, &[])
    }

    /// Record one observation tagged with the active dimension set plus
    /// `extra` series-specific dimensions
    pub fn put_metric_with(
        &mut self,
        name: &str,
        value: f64,
        unit: &str,
        extra: &[(&str, String)],
    ) -> BenchResult<()> {
        let active = self
            .dimensions
            .as_ref()
            .ok_or(BenchError::DimensionsNotSet)?;
        let dimensions = if extra.is_empty() {
            Arc::clone(active)
        } else {
            Arc::new(active.extended(extra))
        };

        self.observations.push(Observation {
            timestamp: chrono::Utc::now(),
            name: name.to_string(),
            value,
            unit: unit.to_string(),
            dimensions,
        });
        Ok(())
    }

    /// Every observation, in emission order
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    /// Observations of one series, in emission order
    pub fn series<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Observation> + 'a {
        self.observations.iter().filter(move |o| o.name == name)
    }

    /// Statistics over every observation named `name`
    pub fn summarize(&self, name: &str) -> Option<SeriesSummary> {
        self.summarize_matching(name, &[])
    }

    /// Statistics over the observations named `name` whose dimensions
    /// contain every `(dimension, value)` pair of `filter`
    pub fn summarize_matching(
        &self,
        name: &str,
        filter: &[(&str, &str)],
    ) -> Option<SeriesSummary> {
        let matching: Vec<&Observation> = self
            .series(name)
            .filter(|o| o.dimensions.matches(filter))
            .collect();
        let unit = matching.first()?.unit.clone();
        let values: Vec<f64> = matching.iter().map(|o| o.value).collect();
        SeriesSummary::from_values(name, &unit, &values)
    }

    /// Export every observation as one JSON object per line
    pub fn to_json_lines(&self) -> serde_json::Result<String> {
        let mut out = String::new();
        for observation in &self.observations {
            out.push_str(&serde_json::to_string(&observation.record())?);
            out.push('\n');
        }
        Ok(out)
    }
}

/// Emit the throughput series of a completed run.
///
/// For every exercised direction, warm-up intervals are dropped from each
/// client and the remaining intervals are aligned by position. Each time
/// point yields one `total` observation (sum over clients) and one
/// `per_client` observation per client, all under the direction's metric
/// name. Returns the number of time points emitted.
pub fn emit_throughput_metrics(
    metrics: &mut MetricsLogger,
    run: &RunResult,
    warmup: Duration,
) -> BenchResult<usize> {
    let mut points_emitted = 0;

    for (direction, clients) in run.iter() {
        let series: Vec<Vec<f64>> = clients
            .iter()
            .map(|client| client.steady_state_bits_per_second(warmup))
            .collect();
        let points = series.iter().map(Vec::len).min().unwrap_or(0);
        let name = direction.metric_name();

        for t in 0..points {
            let total: f64 = series.iter().map(|s| s[t]).sum();
            metrics.put_metric_with(
                name,
                total / 1e6,
                THROUGHPUT_UNIT,
                &[(AGGREGATION_DIMENSION, "total".to_string())],
            )?;
            for (client_index, client_series) in series.iter().enumerate() {
                metrics.put_metric_with(
                    name,
                    client_series[t] / 1e6,
                    THROUGHPUT_UNIT,
                    &[
                        (AGGREGATION_DIMENSION, "per_client".to_string()),
                        (CLIENT_INDEX_DIMENSION, client_index.to_string()),
                    ],
                )?;
            }
        }

        info!(
            "Emitted {} steady-state points for {} ({} clients)",
            points,
            direction,
            clients.len()
        );
        points_emitted += points;
    }

    Ok(points_emitted)
}

/// Summaries of the `total` series of every direction in the run
pub fn summarize_throughput(metrics: &MetricsLogger, run: &RunResult) -> Vec<SeriesSummary> {
    run.directions()
        .filter_map(|direction: Direction| {
            metrics.summarize_matching(
                direction.metric_name(),
                &[(AGGREGATION_DIMENSION, "total")],
            )
        })
        .collect()
}
