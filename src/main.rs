use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser};
use serde::Serialize;
use tracing::{debug, info, warn};
use vzhook::config::{DEFAULT_ENV_FILE, HookConfig};
use vzhook::context::{HookContext, Invocation};
use vzhook::core::{Dispatcher, HostIdentity, Outcome, Phase};
use vzhook::logging::{self, LogConfig, mask_secret};
use vzhook::monitor;

#[derive(Parser)]
#[command(name = "vzhook")]
#[command(about = "vzdump hook script reporting backups to Healthchecks", long_about = None)]
struct Cli {
    /// Backup phase, as passed by vzdump
    phase: String,

    /// Backup mode (snapshot, suspend, stop)
    mode: Option<String>,

    /// Guest id, for per-guest phases
    vmid: Option<String>,

    #[arg(long, default_value = DEFAULT_ENV_FILE)]
    env_file: PathBuf,

    #[arg(long, short)]
    verbose: bool,

    /// Log as JSON
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    config: ConfigArgs,
}

/// Flags that override the env file and `HC_*` variables.
#[derive(Args, Serialize)]
struct ConfigArgs {
    #[serde(rename = "base_domain", skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    hc_domain: Option<String>,

    #[serde(rename = "ping_domain", skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    hc_ping_domain: Option<String>,

    #[serde(rename = "rw_api_key", skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    hc_rw_key: Option<String>,

    #[serde(rename = "ping_key", skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    hc_ping_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    job_id: Option<String>,

    /// Outcome reported for the target on backup-end
    #[serde(rename = "target_outcome", skip_serializing_if = "Option::is_none")]
    #[arg(long, value_enum)]
    outcome: Option<Outcome>,

    /// Talk to an in-memory service instead of the network
    #[serde(skip_serializing_if = "is_false")]
    #[arg(long)]
    simulation: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(LogConfig {
        json: cli.json,
        verbose: cli.verbose,
    });

    let config = HookConfig::load(&cli.env_file, &cli.config).context("Invalid configuration")?;
    debug!(
        base_domain = %config.base_domain,
        ping_domain = %config.ping_domain,
        rw_api_key = %mask_secret(&config.rw_api_key),
        ping_key = %mask_secret(&config.ping_key),
        job_id = %config.job_id,
        simulation = config.simulation,
        "Configuration loaded"
    );

    let policy = config.retry_policy();
    debug!(
        attempts = policy.max_attempts,
        worst_case_ms = policy.worst_case().as_millis() as u64,
        "Retry budget"
    );

    let phase = Phase::from_name(&cli.phase);
    let invocation = Invocation::from_env(phase, cli.mode, cli.vmid, config.target_outcome);

    let host = match HostIdentity::discover(&config).await {
        Ok(host) => host,
        Err(e) if invocation.phase.is_critical() => {
            return Err(e).context("Cannot name monitoring endpoints");
        }
        Err(e) => {
            warn!(phase = %invocation.phase, error = %e, "Skipping monitoring update");
            return Ok(());
        }
    };
    let transport = monitor::get_transport(config.simulation, &policy)?;
    let ctx = HookContext::new(config, host, transport);

    let target = invocation
        .target
        .as_ref()
        .map(|t| t.label())
        .unwrap_or_default();
    info!(phase = %invocation.phase, target = %target, "Hook invoked");

    Dispatcher::new(ctx)
        .run(&invocation)
        .await
        .with_context(|| format!("Phase {} failed", invocation.phase))
}
