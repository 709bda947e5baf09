//! Check command implementation

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tally_aggregator::Settings;

use crate::output;

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Bucket configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "TALLY_CONFIG")]
    pub config: PathBuf,
}

pub fn run(args: CheckArgs) -> Result<()> {
    let settings = Settings::load(&args.config)?;
    let configs = settings
        .bucket_configs()
        .context("Invalid bucket configuration")?;

    if configs.is_empty() {
        output::warning(&format!("No buckets configured in {}", args.config.display()));
        return Ok(());
    }

    println!("{} bucket(s):", configs.len());
    for config in &configs {
        println!(
            "  {} ({}/{}) queryable={} raw_queries={} realtime={} max_age={}s upload={}",
            config.name(),
            config.data_group(),
            config.data_type(),
            config.queryable(),
            config.raw_queries_allowed(),
            config.realtime(),
            config.max_age(),
            config.upload_format(),
        );
        if let Some(keys) = config.auto_ids() {
            println!("    auto_ids: {}", keys.join(", "));
        }
    }

    output::success(&format!("{} is valid", args.config.display()));
    Ok(())
}
