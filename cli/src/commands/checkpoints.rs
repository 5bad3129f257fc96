//! `regsweep checkpoints` command.

use std::path::Path;

use clap::Args;
use regsweep_core::SweepConfig;
use regsweep_engine::{CheckpointManager, DELETE_OPERATION};

use crate::output;

#[derive(Args)]
pub struct CheckpointsArgs {
    /// Only show operation ids (one per line)
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(config: Option<&Path>, args: CheckpointsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = SweepConfig::load(config)?;
    let manager = CheckpointManager::new(config.checkpoint_dir(), DELETE_OPERATION);
    let checkpoints = manager.list()?;

    if args.quiet {
        for checkpoint in &checkpoints {
            println!("{}", checkpoint.operation_id);
        }
        return Ok(());
    }

    let mut table = output::new_table(&[
        "OPERATION", "PROGRESS", "COMPLETED", "FAILED", "SKIPPED", "STARTED", "UPDATED",
    ]);
    for checkpoint in &checkpoints {
        table.add_row(&[
            checkpoint.operation_id.clone(),
            format!("{}/{}", checkpoint.processed(), checkpoint.total_items),
            checkpoint.completed_items.len().to_string(),
            checkpoint.failed_items.len().to_string(),
            checkpoint.skipped_items.len().to_string(),
            output::format_ago(&checkpoint.started_at),
            output::format_ago(&checkpoint.last_updated),
        ]);
    }
    println!("{table}");
    Ok(())
}
