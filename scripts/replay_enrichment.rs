use std::env;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result, anyhow, bail};
use enrich_worker::config::Config;
use enrich_worker::domain::Domain;
use enrich_worker::pipeline::RunRequest;
use enrich_worker::replay::{ReplayConfig, replay_enrichment};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let replay = parse_args()?;
    let app = if replay.dry_run {
        Config::from_env_offline()
    } else {
        Config::from_env()
    }
    .context("failed to load configuration")?;

    let report = replay_enrichment(&replay, &app).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to encode replay report")?
    );
    if report.providers_exhausted {
        process::exit(2);
    }
    Ok(())
}

fn parse_args() -> Result<ReplayConfig> {
    let mut dataset = None;
    let mut dry_run = false;
    let mut request = RunRequest::default();

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--dataset" => {
                let value = args.next().context("--dataset requires a path argument")?;
                dataset = Some(PathBuf::from(value));
            }
            "--domain" => {
                let value = args.next().context("--domain requires a domain name")?;
                let domain: Domain = value.parse().map_err(|error| anyhow!("{error}"))?;
                request.domain = Some(domain);
            }
            "--limit" => {
                let value = args.next().context("--limit requires a number")?;
                let parsed = value
                    .parse::<usize>()
                    .context("--limit must be a non-negative integer")?;
                request.limit = Some(parsed);
            }
            "--provider" => {
                let value = args.next().context("--provider requires a provider name")?;
                request.provider = Some(value);
            }
            "--dry-run" => {
                dry_run = true;
            }
            "--help" => {
                print_usage();
                process::exit(0);
            }
            _ => {
                bail!("unknown argument: {}", arg);
            }
        }
    }

    let dataset = dataset.ok_or_else(|| anyhow!("--dataset is required"))?;

    Ok(ReplayConfig {
        dataset,
        dry_run,
        request,
    })
}

fn print_usage() {
    eprintln!(
        "Usage: replay_enrichment --dataset <path.jsonl> [--dry-run] [--domain <domain>] \
         [--limit <n>] [--provider <name>]\n\n\
         Loads catalog records from a JSON-lines file and runs the enrichment pipeline.\n\
         --dry-run keeps all state in memory; otherwise ENRICH_DB_DSN is used.\n\
         Providers and pipeline settings are read from the same ENRICH_* variables as the worker."
    );
}
