//! Human-readable run reporting: progress bar and the final summary.

use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use crate::progress::Statistics;

/// A spinner ticked once per file reaching a terminal state.
#[must_use]
pub fn download_bar() -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.green} {pos} files  {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    bar.set_style(style);
    bar.enable_steady_tick(std::time::Duration::from_millis(120));
    bar
}

/// Logs the end-of-run statistics block.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn print_summary(stats: &Statistics) {
    info!("crawl finished in {}", format_duration(stats.duration_secs));
    info!(
        "discovered {} URLs, {} files",
        stats.urls_discovered, stats.files_found
    );
    info!(
        "downloaded {} files ({}), {} failed, {} skipped",
        stats.files_downloaded,
        format_bytes(stats.bytes_downloaded),
        stats.files_failed,
        stats.files_skipped
    );
    info!(
        "average speed {}/s, success rate {:.1}%",
        format_bytes(stats.average_speed as u64),
        stats.success_rate
    );
    if !stats.top_extensions.is_empty() {
        let types: Vec<String> = stats
            .top_extensions
            .iter()
            .map(|(ext, count)| format!(".{ext} ({count})"))
            .collect();
        info!("top file types: {}", types.join(", "));
    }
}

/// Formats a byte count with a binary-unit suffix.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Formats a duration in seconds as `2h 3m 4s` / `3m 4s` / `4s`.
#[must_use]
pub fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
