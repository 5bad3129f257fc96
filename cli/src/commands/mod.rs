//! CLI command definitions and dispatch.

mod analyze;
mod checkpoints;
mod delete;
mod version;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use regsweep_core::IdentifierFilter;
use regsweep_engine::Selection;

use crate::output;

/// regsweep - reference-counted garbage collection for image registries.
#[derive(Parser)]
#[command(name = "regsweep", version, about)]
pub struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, global = true, env = "REGSWEEP_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Scan the registry and report unused images and reclaimable space
    Analyze(analyze::AnalyzeArgs),
    /// Delete unused images and their metadata (dry run unless --apply)
    Delete(delete::DeleteArgs),
    /// List resumable deletion checkpoints
    Checkpoints(checkpoints::CheckpointsArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = cli.config.as_deref();
    match cli.command {
        Command::Analyze(args) => analyze::execute(config, args).await,
        Command::Delete(args) => delete::execute(config, args).await,
        Command::Checkpoints(args) => checkpoints::execute(config, args).await,
        Command::Version(args) => version::execute(args).await,
    }
}

/// Parse `--unused-since`: a day count (`30d`), a date (`2024-01-31`) or an
/// RFC 3339 timestamp.
pub(crate) fn parse_unused_since(value: &str) -> Result<DateTime<Utc>, String> {
    let value = value.trim();
    if let Some(days) = value.strip_suffix('d') {
        let days: i64 = days
            .parse()
            .map_err(|_| format!("invalid day count: {value}"))?;
        if days < 0 {
            return Err(format!("day count must not be negative: {value}"));
        }
        return Ok(Utc::now() - Duration::days(days));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| format!("expected <N>d, YYYY-MM-DD or an RFC 3339 timestamp, got '{value}'"))
}

pub(crate) fn load_filter(path: Option<&Path>) -> Result<Option<IdentifierFilter>, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(Some(IdentifierFilter::load(path)?)),
        None => Ok(None),
    }
}

/// Candidate table followed by the freed-space estimate.
pub(crate) fn print_selection(selection: &Selection) {
    if selection.is_empty() {
        println!("No unused images found.");
        return;
    }

    let mut table = output::new_table(&["REPOSITORY", "TAG", "TYPE", "LAYERS", "EXCLUSIVE"]);
    for candidate in &selection.candidates {
        table.add_row(&[
            candidate.key.repository.clone(),
            candidate.key.tag.clone(),
            candidate.image_type.clone(),
            candidate.layer_count.to_string(),
            output::format_bytes(candidate.exclusive_bytes),
        ]);
    }
    println!("{table}");
    println!();
    println!(
        "{} image(s), {} matching tag(s), {} reclaimable",
        selection.unique_images(),
        selection.total_matching_tags,
        output::format_bytes(selection.freed_bytes)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_unused_since_days() {
        let parsed = parse_unused_since("30d").unwrap();
        let expected = Utc::now() - Duration::days(30);
        assert!((parsed - expected).num_seconds().abs() < 5);
    }

    #[test]
    fn test_parse_unused_since_date() {
        let parsed = parse_unused_since("2024-01-31").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-01-31T00:00:00+00:00");
    }

    #[test]
    fn test_parse_unused_since_rfc3339() {
        let parsed = parse_unused_since("2024-01-31T12:30:00+02:00").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-01-31T10:30:00+00:00");
    }

    #[test]
    fn test_parse_unused_since_invalid() {
        assert!(parse_unused_since("yesterday").is_err());
        assert!(parse_unused_since("-3d").is_err());
        assert!(parse_unused_since("xd").is_err());
    }

    #[test]
    fn test_delete_flags_parse() {
        let cli = Cli::try_parse_from([
            "regsweep",
            "delete",
            "--apply",
            "--force",
            "--backup",
            "--backup-dir",
            "/tmp/backup",
            "--unused-since",
            "7d",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Delete(_)));
    }

    #[test]
    fn test_backup_requires_dir() {
        let result = Cli::try_parse_from(["regsweep", "delete", "--apply", "--backup"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_from_report_conflicts_with_filter() {
        let result = Cli::try_parse_from([
            "regsweep",
            "delete",
            "--from-report",
            "r.json",
            "--filter-file",
            "f.txt",
        ]);
        assert!(result.is_err());
    }
}
