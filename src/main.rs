mod cli;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use cli::{Cli, Commands};
use std::collections::BTreeMap;
use std::sync::Arc;
use upkeep::config::{self, VERSION_FILE_NAME};
use upkeep::feedback::{FeedbackKind, FeedbackQueue};
use upkeep::install::{self, HelperSwapper};
use upkeep::release::ReleaseClient;
use upkeep::update::{UpdateOrchestrator, UpdateState};
use upkeep::version::{self, VersionStore};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;

    // The swap helper runs before anything else: it is invoked on the
    // downloaded binary and must not touch config or feedback state.
    if let Commands::FinalizeUpdate {
        source,
        target,
        pid,
        release_version,
    } = &cli.command
    {
        let version = version::parse_tag(release_version)
            .map_err(|e| anyhow!("invalid --release-version: {}", e))?;
        let code = install::run_helper(source, target, *pid, &version);
        std::process::exit(code);
    }

    // Handshake with a possible pending update: the helper deletes its
    // backup only once it sees this marker.
    if let Err(e) = install::mark_clean_start() {
        tracing::warn!("Could not write clean-start marker: {}", e);
    }

    let config = config::load_config()?;
    let data_dir = config::get_data_dir()?;

    match cli.command {
        Commands::Version => {
            println!("upkeep v{}", env!("CARGO_PKG_VERSION"));
        }

        Commands::Check => {
            let orchestrator = build_orchestrator(&config, &data_dir)?;
            // Manual check: parse errors are surfaced here, unlike the
            // background cycle.
            match orchestrator.check_only().await? {
                Some(release) => {
                    println!(
                        "Update available: {} ({})",
                        release.version, release.asset_name
                    );
                }
                None => println!("Already on the latest version"),
            }
        }

        Commands::Update => {
            let orchestrator = build_orchestrator(&config, &data_dir)?;

            let mut states = orchestrator.subscribe();
            let printer = tokio::spawn(async move {
                while states.changed().await.is_ok() {
                    eprintln!("  {}", states.borrow().clone());
                }
            });

            if let Some(cycle) = orchestrator.clone().trigger() {
                cycle.await?;
            }
            printer.abort();

            match orchestrator.state() {
                UpdateState::Restarting => {
                    // The helper waits for this process to exit before it
                    // swaps the binary; leave promptly.
                    tracing::info!("Update staged; exiting so the helper can take over");
                }
                UpdateState::Idle => println!("Already on the latest version"),
                UpdateState::Failed { reason } => {
                    tracing::error!("Update failed: {}", reason);
                    std::process::exit(1);
                }
                other => tracing::warn!("Update ended in unexpected state: {}", other),
            }
        }

        Commands::Report { message, data } => {
            let queue = build_queue(&config, &data_dir)?;
            let mut metadata = BTreeMap::new();
            for pair in &data {
                match pair.split_once('=') {
                    Some((key, value)) => {
                        metadata.insert(key.to_string(), value.to_string());
                    }
                    None => bail!("invalid --data '{}'; expected key=value", pair),
                }
            }
            queue.submit(FeedbackKind::Error, message, metadata).await;
            println!("Report recorded. Thank you for the feedback!");
        }

        Commands::Stats => {
            let queue = build_queue(&config, &data_dir)?;
            let stats = queue.statistics();
            println!("--- Feedback Statistics ---");
            println!("  total:          {}", stats.total);
            println!("  errors:         {}", stats.errors);
            println!("  auto successes: {}", stats.auto_successes);
            println!("  delivery rate:  {:.1}%", stats.delivery_rate);
            println!("---------------------------");
        }

        Commands::Flush => {
            let queue = build_queue(&config, &data_dir)?;
            let delivered = queue.flush().await;
            println!("Delivered {} queued record(s)", delivered);
        }

        Commands::FinalizeUpdate { .. } => unreachable!("handled above"),
    }

    Ok(())
}

fn build_orchestrator(
    config: &config::AppConfig,
    data_dir: &std::path::Path,
) -> Result<Arc<UpdateOrchestrator>> {
    if config.update.repo_owner.is_empty() || config.update.repo_name.is_empty() {
        bail!(
            "No release repository configured. Set update.repo_owner and \
             update.repo_name in {} or the UPKEEP_REPO environment variable.",
            config::get_config_file_path()?.display()
        );
    }

    let client = ReleaseClient::new(config.update.clone())?;
    let version_store = VersionStore::new(data_dir.join(VERSION_FILE_NAME));
    let target = std::env::current_exe()?;

    Ok(Arc::new(UpdateOrchestrator::new(
        Arc::new(client),
        Arc::new(HelperSwapper),
        version_store,
        data_dir.join("staging"),
        target,
    )))
}

fn build_queue(config: &config::AppConfig, data_dir: &std::path::Path) -> Result<FeedbackQueue> {
    FeedbackQueue::new(&config.feedback, data_dir, env!("CARGO_PKG_VERSION"))
}

fn setup_logging(cli: &Cli) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if cli.quiet {
        "error"
    } else if cli.verbose == 0 {
        "warn"
    } else if cli.verbose == 1 {
        "info"
    } else {
        "debug"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();

    Ok(())
}
