//! # Utility Functions
//!
//! Formatting helpers for console output and a few system queries used when
//! validating configurations and describing the machine a run executed on.
//!
//! ```rust
//! use vnet_bench::utils::*;
//! use std::time::Duration;
//!
//! assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
//! assert_eq!(format_bitrate(9_410_000_000.0), "9.41 Gbit/s");
//! assert_eq!(format_latency_ms(0.0452), "45.2μs");
//! ```

use std::time::Duration;
use uuid::Uuid;

/// Generate a unique identifier for a benchmark run
///
/// ## Returns
/// String representation of a UUID v4, recorded in `summary.json` so runs
/// can be correlated with their artifacts.
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Convert a duration to a human-readable string
///
/// Sub-minute durations keep two decimals in the largest fitting unit;
/// longer ones are shown as minutes and seconds.
///
/// ```rust
/// # use vnet_bench::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        format!("{}m {}s", seconds / 60, seconds % 60)
    }
}

/// Format a rate in bits per second with decimal (1000-based) units
///
/// ```rust
/// # use vnet_bench::utils::format_bitrate;
/// assert_eq!(format_bitrate(800.0), "800 bit/s");
/// assert_eq!(format_bitrate(2_500_000.0), "2.50 Mbit/s");
/// ```
pub fn format_bitrate(bits_per_second: f64) -> String {
    const UNITS: [&str; 4] = ["Kbit/s", "Mbit/s", "Gbit/s", "Tbit/s"];

    if bits_per_second < 1_000.0 {
        return format!("{:.0} bit/s", bits_per_second);
    }
    let mut value = bits_per_second / 1_000.0;
    let mut unit = 0;
    while value >= 1_000.0 && unit < UNITS.len() - 1 {
        value /= 1_000.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// Format a latency sample given in milliseconds
pub fn format_latency_ms(ms: f64) -> String {
    if ms < 1.0 {
        format!("{:.1}μs", ms * 1_000.0)
    } else {
        format!("{:.3}ms", ms)
    }
}

/// Number of CPU cores available to this process
pub fn get_cpu_cores() -> usize {
    num_cpus::get()
}

/// Print a table row with fixed column widths
///
/// ```text
/// +-----------------+---------+
/// | Metric          | p50     |
/// +-----------------+---------+
/// ```
pub fn print_table_row(columns: &[&str], widths: &[usize]) {
    print!("|");
    for (i, column) in columns.iter().enumerate() {
        let width = widths.get(i).copied().unwrap_or(10);
        print!(" {:width$} |", column, width = width);
    }
    println!();
}

pub fn print_table_separator(widths: &[usize]) {
    print!("+");
    for &width in widths {
        print!("{}+", "-".repeat(width + 2));
    }
    println!();
}
