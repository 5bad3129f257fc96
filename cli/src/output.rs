//! Table formatting helpers for CLI output.

use comfy_table::{ContentArrangement, Table};

/// Create a styled table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    const TB: u64 = 1024 * GB;

    if bytes >= TB {
        format!("{:.1} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// How long ago a checkpoint or report was written, coarsest unit first.
pub fn format_ago(dt: &chrono::DateTime<chrono::Utc>) -> String {
    let secs = chrono::Utc::now().signed_duration_since(*dt).num_seconds();
    if secs < 1 {
        return "just now".to_string();
    }

    const UNITS: [(i64, &str); 5] = [
        (365 * 86400, "year"),
        (86400, "day"),
        (3600, "hour"),
        (60, "minute"),
        (1, "second"),
    ];
    let (size, unit) = UNITS
        .iter()
        .copied()
        .find(|(size, _)| secs >= *size)
        .unwrap_or((1, "second"));
    let count = secs / size;
    let plural = if count == 1 { "" } else { "s" };
    format!("{count} {unit}{plural} ago")
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- format_bytes tests ---

    #[test]
    fn test_format_bytes_zero() {
        assert_eq!(format_bytes(0), "0 B");
    }

    #[test]
    fn test_format_bytes_units() {
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(50 * 1048576), "50.0 MB");
        assert_eq!(format_bytes(3 * 1073741824 / 2), "1.5 GB");
    }

    #[test]
    fn test_format_bytes_terabytes() {
        assert_eq!(format_bytes(2 * 1099511627776), "2.0 TB");
    }

    // --- new_table tests ---

    #[test]
    fn test_new_table() {
        let table = new_table(&["REPOSITORY", "TAG", "EXCLUSIVE"]);
        let output = table.to_string();
        assert!(output.contains("REPOSITORY"));
        assert!(output.contains("EXCLUSIVE"));
    }

    #[test]
    fn test_new_table_with_rows() {
        let mut table = new_table(&["COL1", "COL2"]);
        table.add_row(["dominodatalab/environment", "5f1e9c2a7b3d4e6f8a9b0c1d-3"]);
        let output = table.to_string();
        assert!(output.contains("dominodatalab/environment"));
        assert!(output.contains("5f1e9c2a7b3d4e6f8a9b0c1d-3"));
    }

    // --- format_ago tests ---

    #[test]
    fn test_format_ago_units() {
        let now = chrono::Utc::now();
        assert_eq!(format_ago(&(now - chrono::Duration::seconds(30))), "30 seconds ago");
        assert_eq!(format_ago(&(now - chrono::Duration::minutes(1))), "1 minute ago");
        assert_eq!(format_ago(&(now - chrono::Duration::hours(23))), "23 hours ago");
        assert_eq!(format_ago(&(now - chrono::Duration::days(3))), "3 days ago");
        assert_eq!(format_ago(&(now - chrono::Duration::days(730))), "2 years ago");
    }

    #[test]
    fn test_format_ago_future() {
        let future = chrono::Utc::now() + chrono::Duration::hours(1);
        assert_eq!(format_ago(&future), "just now");
    }
}
