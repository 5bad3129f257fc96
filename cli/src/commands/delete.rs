//! `regsweep delete` command: dry run by default.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::Args;
use regsweep_engine::{AnalysisReport, DeletionOptions, DeletionReport, OutcomeState};
use tokio::sync::watch;

use crate::context::Context;
use crate::output;

#[derive(Args)]
pub struct DeleteArgs {
    /// Actually delete; without this flag only a dry run is reported
    #[arg(long)]
    pub apply: bool,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub force: bool,

    /// Back up each image as an OCI layout before deleting it
    #[arg(long, requires = "backup_dir")]
    pub backup: bool,

    /// Directory receiving backups
    #[arg(long)]
    pub backup_dir: Option<PathBuf>,

    /// Resume an interrupted run (the most recent one unless --operation-id is set)
    #[arg(long)]
    pub resume: bool,

    /// Operation id to start or resume
    #[arg(long)]
    pub operation_id: Option<String>,

    /// Treat identifiers last used before this point as unused (30d, 2024-01-31, RFC 3339)
    #[arg(long, value_parser = super::parse_unused_since, conflicts_with = "from_report")]
    pub unused_since: Option<DateTime<Utc>>,

    /// Only consider identifiers listed in this file
    #[arg(long, conflicts_with = "from_report")]
    pub filter_file: Option<PathBuf>,

    /// Replay the selection of a saved analysis report instead of re-analyzing
    #[arg(long)]
    pub from_report: Option<PathBuf>,
}

pub async fn execute(config: Option<&Path>, args: DeleteArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::load(config)?;
    let metadata = ctx.metadata_store()?;

    let report = match &args.from_report {
        Some(path) => {
            let report = AnalysisReport::load(path)?;
            println!(
                "Using analysis report {} from {}",
                path.display(),
                report.generated_at.format("%Y-%m-%d %H:%M:%S")
            );
            report
        }
        None => {
            let filter = super::load_filter(args.filter_file.as_deref())?;
            ctx.analyzer(metadata.clone(), filter, args.unused_since)
                .run()
                .await?
        }
    };

    super::print_selection(&report.selection);
    if report.selection.is_empty() {
        return Ok(());
    }

    let confirmed = args.apply && (args.force || confirm(&report)?);
    let options = DeletionOptions {
        apply: args.apply,
        confirmed,
        backup: args.backup,
        resume: args.resume,
        operation_id: args.operation_id.clone(),
    };

    let mut coordinator = ctx.coordinator(metadata);
    if args.backup {
        if let Some(dir) = &args.backup_dir {
            coordinator = coordinator.with_backup(Arc::new(ctx.backup(dir)));
        }
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, finishing the current image...");
            let _ = cancel_tx.send(true);
        }
    });
    let result = coordinator.with_cancel(cancel_rx).run(&report.selection, &options).await;
    interrupt.abort();
    let result = result?;

    print_outcome(&result);
    let saved = result.save(&ctx.report_dir())?;
    println!("\nReport saved to {}", saved.display());

    if result.summary.cancelled {
        if let Some(checkpoint) = &result.checkpoint {
            println!(
                "Resume with: regsweep delete --apply --resume --operation-id {}",
                checkpoint.operation_id
            );
        }
        return Err("deletion interrupted".into());
    }
    if result.summary.has_failures() {
        return Err(format!(
            "{} image(s) failed, {} aborted by backup failure, {} with inconsistent metadata",
            result.summary.delete_failed,
            result.summary.backup_aborted,
            result.summary.metadata_inconsistent
        )
        .into());
    }
    Ok(())
}

/// Declining turns the run into a dry run.
fn confirm(report: &AnalysisReport) -> Result<bool, Box<dyn std::error::Error>> {
    println!();
    println!(
        "WARNING! This will delete {} image(s) and their metadata, freeing about {}.",
        report.selection.unique_images(),
        output::format_bytes(report.selection.freed_bytes)
    );
    print!("Are you sure you want to continue? [y/N] ");
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    let accepted = input.trim().eq_ignore_ascii_case("y");
    if !accepted {
        println!("Not confirmed, running as a dry run.");
    }
    Ok(accepted)
}

fn print_outcome(report: &DeletionReport) {
    let summary = &report.summary;

    let mut table = output::new_table(&["IMAGE", "OUTCOME", "METADATA", "DETAIL"]);
    for outcome in &report.outcomes {
        let metadata = if outcome.metadata_deleted {
            format!("{} record(s)", outcome.metadata_records)
        } else {
            "-".to_string()
        };
        let detail = outcome
            .error
            .clone()
            .or_else(|| outcome.notes.last().cloned())
            .unwrap_or_default();
        table.add_row(&[
            outcome.key.to_string(),
            outcome.state.as_str().to_string(),
            metadata,
            detail,
        ]);
    }
    println!("{table}");
    println!();

    if summary.dry_run {
        println!(
            "Dry run: {} image(s) would be deleted, freeing about {}. Use --apply to delete.",
            summary.total_candidates,
            output::format_bytes(summary.estimated_bytes)
        );
        return;
    }

    println!(
        "Deleted {} image(s), freed {} (estimated {})",
        summary.deleted + summary.metadata_inconsistent,
        output::format_bytes(summary.realized_bytes),
        output::format_bytes(summary.estimated_bytes)
    );
    let counts = [
        (OutcomeState::MetadataInconsistent, summary.metadata_inconsistent),
        (OutcomeState::DeleteFailed, summary.delete_failed),
        (OutcomeState::BackupAborted, summary.backup_aborted),
        (OutcomeState::Skipped, summary.skipped),
        (OutcomeState::AlreadyProcessed, summary.already_processed),
        (OutcomeState::NotProcessed, summary.not_processed),
    ];
    for (state, count) in counts {
        if count > 0 {
            println!("  {}: {}", state.as_str(), count);
        }
    }
    if !summary.warnings.is_empty() {
        eprintln!("\nWarnings:");
        for warning in &summary.warnings {
            eprintln!("  {warning}");
        }
    }
}
