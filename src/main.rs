use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

use tripsync::config::{validate_config, SyncConfig};

#[derive(Parser, Debug)]
#[command(name = "tripsync")]
#[command(about = "Validate and inspect the tripsync cache/sync configuration")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tripsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Environment preset to check (development, staging, production)
  #[arg(short, long)]
  env: Option<String>,
}

fn main() -> Result<()> {
  color_eyre::install()?;
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .init();

  let args = Args::parse();

  if let Some(env) = &args.env {
    std::env::set_var("TRIPSYNC_ENV", env);
  }
  let config = SyncConfig::load(args.config.as_deref())?;

  let report = validate_config(&config);
  for warning in &report.warnings {
    println!("warning: {warning}");
  }
  for error in &report.errors {
    println!("error: {error}");
  }

  if report.is_valid() {
    println!(
      "Config OK: fresh {}ms / stale {}ms, {} memory items, sync every {}ms ({} strategy)",
      config.cache.fresh_ttl_ms,
      config.cache.stale_ttl_ms,
      config.cache.max_memory_items,
      config.sync.sync_interval_ms,
      serde_yaml::to_string(&config.sync.conflict_strategy)
        .unwrap_or_default()
        .trim(),
    );
    Ok(())
  } else {
    std::process::exit(1);
  }
}
