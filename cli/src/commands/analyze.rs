//! `regsweep analyze` command.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::Args;

use crate::context::Context;
use crate::output;

#[derive(Args)]
pub struct AnalyzeArgs {
    /// Only consider identifiers listed in this file
    #[arg(long)]
    pub filter_file: Option<PathBuf>,

    /// Treat identifiers last used before this point as unused (30d, 2024-01-31, RFC 3339)
    #[arg(long, value_parser = super::parse_unused_since)]
    pub unused_since: Option<DateTime<Utc>>,

    /// Print the full report as JSON instead of tables
    #[arg(long)]
    pub json: bool,

    /// Do not write the report to the state directory
    #[arg(long)]
    pub no_save: bool,
}

pub async fn execute(config: Option<&Path>, args: AnalyzeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let filter = super::load_filter(args.filter_file.as_deref())?;
    let ctx = Context::load(config)?;
    let metadata = ctx.metadata_store()?;

    let report = ctx
        .analyzer(metadata, filter, args.unused_since)
        .run()
        .await?;

    let saved = if args.no_save {
        None
    } else {
        Some(report.save(&ctx.report_dir())?)
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let graph = &report.graph;
    println!(
        "Registry {}: {} image(s), {} layer(s), {}",
        report.registry,
        graph.total_images,
        graph.total_layers,
        output::format_bytes(graph.total_bytes)
    );
    println!(
        "Shared layers: {} ({}), single-use layers: {} ({})",
        graph.shared_layers,
        output::format_bytes(graph.shared_bytes),
        graph.single_use_layers,
        output::format_bytes(graph.single_use_bytes)
    );
    println!(
        "Live identifiers: {} from {} source(s)",
        report.live_identifiers,
        report.providers.len()
    );
    for (source, count) in &report.live_sources {
        println!("  {source}: {count}");
    }
    println!();

    super::print_selection(&report.selection);

    if !report.warnings.is_empty() {
        eprintln!("\nWarnings:");
        for warning in &report.warnings {
            eprintln!("  {warning}");
        }
    }
    if let Some(path) = saved {
        println!("\nReport saved to {}", path.display());
    }
    Ok(())
}
