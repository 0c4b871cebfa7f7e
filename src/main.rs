//! # vnet-bench - Main Entry Point
//!
//! Runs one benchmark configuration against a guest's virtual network
//! interface:
//!
//! 1. **Initialize logging**: colorized console output, optional log file
//! 2. **Parse arguments**: benchmark kind, direction, sizes, targets
//! 3. **Run**: latency sampling or the throughput fleets
//! 4. **Persist**: per-client reports, `metrics.json`, `summary.json`
//! 5. **Report**: a summary table on stdout

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use vnet_bench::{
    benchmark::{BenchmarkConfig, BenchmarkOutcome, BenchmarkRunner},
    cli::{Args, BenchmarkKind},
    latency::LatencyConfig,
    logging,
    results::{artifact_file_name, ArtifactStore, RunSummary},
    utils::{format_duration, print_table_row, print_table_separator},
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init(args.verbose, args.quiet, args.log_file.as_deref())?;

    info!("Starting vnet-bench {}", vnet_bench::VERSION);

    let results_dir = args.resolved_results_dir();
    let mut store = ArtifactStore::new(&results_dir)?;
    let runner = BenchmarkRunner::from_args(&args);

    let outcome = match args.benchmark {
        BenchmarkKind::Latency => {
            let config = LatencyConfig::from_args(&args)?;
            runner.run_latency(&config, args.vcpus).await
        }
        BenchmarkKind::Throughput => {
            let config = BenchmarkConfig::from_args(&args)?;
            runner.run_throughput(&config, &mut store).await
        }
    };

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("{} benchmark failed: {:#}", args.benchmark, e);
            return Err(e);
        }
    };

    store.write_metrics(&outcome.metrics)?;
    let summary = build_summary(&outcome);
    store.write_summary(&summary)?;

    print_summary(&outcome);
    info!(
        "{} benchmark completed in {}; results in {:?}",
        args.benchmark,
        format_duration(outcome.elapsed),
        store.dir()
    );
    Ok(())
}

fn build_summary(outcome: &BenchmarkOutcome) -> RunSummary {
    let dimensions = outcome.metrics.dimensions().cloned().unwrap_or_default();
    let artifacts = outcome
        .run
        .iter()
        .flat_map(|run| run.iter())
        .flat_map(|(direction, clients)| {
            (0..clients.len()).map(move |index| artifact_file_name(direction, index))
        })
        .collect();

    RunSummary::new(
        outcome.kind,
        dimensions,
        outcome.summaries.clone(),
        outcome.elapsed,
    )
    .with_artifacts(artifacts)
}

/// Print one row per summarized series
fn print_summary(outcome: &BenchmarkOutcome) {
    let widths = [26, 16, 7, 10, 10, 10, 10];
    println!();
    print_table_separator(&widths);
    print_table_row(
        &["Metric", "Unit", "Count", "Mean", "p50", "p90", "p99"],
        &widths,
    );
    print_table_separator(&widths);
    for series in &outcome.summaries {
        let cell = |p: f64| {
            series
                .percentile(p)
                .map(|v| format!("{:.3}", v))
                .unwrap_or_else(|| "-".to_string())
        };
        let count = series.count.to_string();
        let mean = format!("{:.3}", series.mean);
        let (p50, p90, p99) = (cell(50.0), cell(90.0), cell(99.0));
        print_table_row(
            &[
                series.name.as_str(),
                series.unit.as_str(),
                &count,
                &mean,
                &p50,
                &p90,
                &p99,
            ],
            &widths,
        );
    }
    print_table_separator(&widths);
}
