//! Command-line parsing.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use pvcast_core::SiteId;

pub const USAGE: &str = "\
Usage: pvcast <command> [options]

Commands:
  run        Run one forecast
  validate   Check the configuration and site list
  help       Show this help message

Options:
  --config PATH           Configuration file (default: $PVCAST_CONFIG or config/pvcast.json)
  --init-time RFC3339     Forecast init time, floored to the run step (run only; default: now)
  --sites 1,2,3           Only forecast these site ids (run only)
  --dry-run               Print the forecasts instead of writing them (run only)";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Run(RunArgs),
    Validate { config: PathBuf },
    Help,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunArgs {
    pub config: PathBuf,
    pub init_time: Option<DateTime<Utc>>,
    pub site_ids: Option<Vec<SiteId>>,
    pub dry_run: bool,
}

fn default_config_path() -> PathBuf {
    std::env::var("PVCAST_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config/pvcast.json"))
}

/// Parse `args` (without the program name). `Err` holds a usage message.
pub fn parse(args: &[String]) -> Result<Command, String> {
    let Some(command) = args.first() else {
        return Err("missing command".into());
    };

    let mut config = None;
    let mut init_time = None;
    let mut site_ids = None;
    let mut dry_run = false;
    let mut rest = args[1..].iter();
    while let Some(flag) = rest.next() {
        let mut value = || {
            rest.next()
                .cloned()
                .ok_or_else(|| format!("{} needs a value", flag))
        };
        match flag.as_str() {
            "--config" => config = Some(PathBuf::from(value()?)),
            "--init-time" => {
                let raw = value()?;
                let parsed = DateTime::parse_from_rfc3339(&raw)
                    .map_err(|e| format!("invalid --init-time '{}': {}", raw, e))?;
                init_time = Some(parsed.with_timezone(&Utc));
            }
            "--sites" => {
                let raw = value()?;
                let ids = raw
                    .split(',')
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| {
                        s.trim()
                            .parse::<SiteId>()
                            .map_err(|_| format!("invalid site id '{}'", s))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                if ids.is_empty() {
                    return Err("--sites needs at least one id".into());
                }
                site_ids = Some(ids);
            }
            "--dry-run" => dry_run = true,
            other => return Err(format!("unknown option {}", other)),
        }
    }

    let config = config.unwrap_or_else(default_config_path);
    match command.as_str() {
        "run" => Ok(Command::Run(RunArgs {
            config,
            init_time,
            site_ids,
            dry_run,
        })),
        "validate" if init_time.is_none() && site_ids.is_none() && !dry_run => {
            Ok(Command::Validate { config })
        }
        "validate" => Err("validate only takes --config".into()),
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => Err(format!("unknown command {}", other)),
    }
}
