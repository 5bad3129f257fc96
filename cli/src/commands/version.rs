//! `regsweep version` command.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("regsweep version {}", regsweep_core::VERSION);
    println!("engine {}", regsweep_engine::VERSION);
    Ok(())
}
