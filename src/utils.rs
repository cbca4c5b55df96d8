//! # Utility Functions
//!
//! Small helpers shared across the crate: clocks, host identity, human
//! readable formatting and fixed-width tables for log output.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a unique identifier for a run or comparison
///
/// Used to tag comparison reports so several reports written into the same
/// directory can be told apart.
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current wall-clock time as fractional seconds since the Unix epoch
///
/// Reading timestamps use this clock so they stay meaningful across hosts.
/// If the system time is before the epoch, returns 0.0 rather than
/// panicking.
pub fn unix_time_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Current wall-clock time as microseconds since the Unix epoch
///
/// Embedded in pub/sub frames so a subscriber on another host can compute
/// end-to-end latency.
pub fn current_timestamp_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Seconds from a configuration value as a `Duration`, saturating
///
/// Values too large for a `Duration` become `Duration::MAX`; zero, negative
/// and NaN values become zero.
pub fn duration_from_secs(secs: f64) -> Duration {
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) => duration,
        Err(_) if secs > 0.0 => Duration::MAX,
        Err(_) => Duration::ZERO,
    }
}

/// Name of this host, used as the `node_ip` field of run summaries
///
/// Falls back to `"localhost"` when the name cannot be read or is not valid
/// UTF-8.
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            if let Ok(name) = name.into_string() {
                if !name.is_empty() {
                    return name;
                }
            }
        }
    }
    "localhost".to_string()
}

/// Format a duration in a human-readable way
///
/// - **Microseconds**: < 1 ms (e.g., "250.00μs")
/// - **Milliseconds**: < 1 s (e.g., "25.75ms")
/// - **Seconds**: < 60 s (e.g., "5.25s")
/// - **Minutes and Hours**: compound format (e.g., "5m 30s", "2h 15m 30s")
///
/// ## Examples
///
/// ```rust
/// # use iot_bench::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_us = duration.as_micros();

    if total_us < 1_000 {
        format!("{:.2}μs", duration.as_nanos() as f64 / 1_000.0)
    } else if total_us < 1_000_000 {
        format!("{:.2}ms", total_us as f64 / 1_000.0)
    } else if total_us < 60_000_000 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Format an optional latency in milliseconds, `"-"` when absent
///
/// Absent latency is distinct from zero latency, so the two must not render
/// the same way.
pub fn format_latency_ms(latency: Option<f64>) -> String {
    match latency {
        Some(ms) => format!("{:.2}ms", ms),
        None => "-".to_string(),
    }
}

/// Render one table row as a string
///
/// ```rust
/// # use iot_bench::utils::{table_row, table_separator};
/// let widths = [8, 6];
/// assert_eq!(table_separator(&widths), "+----------+--------+");
/// assert_eq!(table_row(&["mqtt", "0.1"], &widths), "| mqtt     | 0.1    |");
/// ```
pub fn table_row(columns: &[&str], widths: &[usize]) -> String {
    let mut row = String::from("|");
    for (i, column) in columns.iter().enumerate() {
        let width = widths.get(i).copied().unwrap_or(10);
        row.push_str(&format!(" {:width$} |", column, width = width));
    }
    row
}

/// Render a table separator matching `table_row` widths
pub fn table_separator(widths: &[usize]) -> String {
    let mut line = String::from("+");
    for &width in widths {
        line.push_str(&"-".repeat(width + 2));
        line.push('+');
    }
    line
}
