//! Transfer progress display with progress bars.

use indicatif::{ProgressBar, ProgressStyle};
use peerlink_core::TransferProgress;
use std::time::Duration;

/// Progress bar for one transfer
pub struct ProgressDisplay {
    bar: ProgressBar,
}

impl ProgressDisplay {
    /// Create a progress bar for `total_bytes` octets of `filename`
    #[must_use]
    pub fn new(total_bytes: u64, filename: &str) -> Self {
        let bar = ProgressBar::new(total_bytes);
        if let Ok(style) = ProgressStyle::default_bar().template(concat!(
            "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] ",
            "{bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        )) {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_message(format!("Transferring: {filename}"));
        Self { bar }
    }

    /// Apply a progress snapshot
    pub fn update(&self, progress: &TransferProgress) {
        if progress.bytes_total > 0 {
            self.bar.set_length(progress.bytes_total);
        }
        self.bar.set_position(progress.bytes_done);
    }

    /// Finish with success message
    pub fn finish(&self) {
        self.bar.finish_with_message("Transfer complete!");
    }

    /// Abandon the progress bar with a message
    pub fn abandon(&self, msg: String) {
        self.bar.abandon_with_message(msg);
    }
}

/// Format bytes in human-readable format
///
/// # Example
///
/// ```ignore
/// assert_eq!(format_bytes(1024), "1.00 KB");
/// assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
/// ```
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}

/// Format speed in human-readable format (bytes/sec)
#[must_use]
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

/// Format duration in human-readable format
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// One-line summary of a finished transfer
#[must_use]
pub fn summary(progress: &TransferProgress) -> String {
    format!(
        "{} in {} ({})",
        format_bytes(progress.bytes_done),
        format_duration(progress.elapsed),
        format_speed(progress.speed())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024_u64.pow(4)), "1.00 TB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m");
    }

    #[test]
    fn test_summary() {
        let progress = TransferProgress {
            session_id: 60_000,
            bytes_done: 2048,
            bytes_total: 2048,
            elapsed: Duration::from_secs(2),
        };
        assert_eq!(summary(&progress), "2.00 KB in 2s (1.00 KB/s)");
    }
}
