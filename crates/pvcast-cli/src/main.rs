//! pvcast: run trigger for the PV forecast pipeline.
//!
//! Exit codes: 0 when the run completed (even with per-site failures),
//! 1 when it failed, 2 on usage errors. The run summary is printed as JSON
//! on stdout; logs go to stderr.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pvcast_core::{load_sites, PvcastConfig, Site};
use pvcast_ingest::JsonNwpSource;
use pvcast_runtime::{RunOrchestrator, RunReport, RunRequest};
use pvcast_store::SqliteStore;

mod args;

use args::{Command, RunArgs, USAGE};

fn load(config_path: &Path) -> anyhow::Result<(PvcastConfig, Vec<Site>)> {
    let config = PvcastConfig::load(config_path)?;
    let sites_file = config
        .sites_file
        .clone()
        .context("configuration has no sites_file")?;
    let sites = load_sites(&sites_file)?;
    Ok((config, sites))
}

fn build(config: PvcastConfig, sites: Vec<Site>) -> anyhow::Result<RunOrchestrator> {
    let nwp_dir = config
        .nwp_dir
        .clone()
        .context("configuration has no nwp_dir")?;
    let store = SqliteStore::open(&config.db_path)
        .map_err(|e| anyhow::anyhow!("Failed to open store: {}", e))?;

    let source_ids: Vec<String> = config.sources.iter().map(|s| s.id.clone()).collect();
    let mut orchestrator = RunOrchestrator::from_config(config, sites, Arc::new(store));
    for id in source_ids {
        orchestrator = orchestrator.with_source(Arc::new(JsonNwpSource::new(id, &nwp_dir)));
    }
    Ok(orchestrator)
}

/// Statistics of an existing store; `null` when none has been created yet.
fn store_stats(db_path: &Path) -> serde_json::Value {
    if !db_path.exists() {
        return serde_json::Value::Null;
    }
    match SqliteStore::open(db_path).and_then(|store| store.get_stats()) {
        Ok(stats) => serde_json::to_value(stats).unwrap_or_default(),
        Err(e) => serde_json::json!({"error": e.to_string()}),
    }
}

async fn run(args: RunArgs) -> RunReport {
    let orchestrator = match load(&args.config).and_then(|(config, sites)| build(config, sites)) {
        Ok(orchestrator) => orchestrator,
        Err(e) => return RunReport::failed(format!("{:#}", e)),
    };
    info!("Configuration loaded from {}", args.config.display());

    orchestrator
        .run(RunRequest {
            init_time: args.init_time,
            site_ids: args.site_ids,
            dry_run: args.dry_run,
        })
        .await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let command = match args::parse(&argv) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    match command {
        Command::Help => {
            println!("{}", USAGE);
            Ok(())
        }
        Command::Validate { config } => match load(&config) {
            Ok((config, sites)) => {
                println!(
                    "{}",
                    serde_json::json!({
                        "valid": true,
                        "models": config.active_models().len(),
                        "sources": config.sources.len(),
                        "sites": sites.len(),
                        "store": store_stats(&config.db_path),
                    })
                );
                Ok(())
            }
            Err(e) => {
                println!("{}", serde_json::json!({"valid": false, "error": format!("{:#}", e)}));
                std::process::exit(1);
            }
        },
        Command::Run(args) => {
            let report = run(args).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            std::process::exit(report.exit_code());
        }
    }
}
