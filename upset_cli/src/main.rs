use upset_core::config::UpsetConfig;
use upset_core::debugger;
use upset_core::orchestrator::{CampaignError, Orchestrator, run_campaign, setup_campaign};
use upset_core::store::{JsonResultStore, ResultStore, RetryPolicy, RetryingStore};
use upset_core::worker::{CancellationToken, IterationBudget};

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser, default_value = "upset.toml")]
    config_file: PathBuf,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a campaign: time the application and record its gold state.
    New,
    /// Inject faults into an existing campaign.
    Inject {
        /// Campaign id, the latest campaign when omitted.
        #[clap(short, long)]
        campaign: Option<u64>,
        #[clap(short = 'n', long)]
        iterations: Option<u64>,
        /// Stop claiming new iterations after this many seconds.
        #[clap(short, long)]
        time_secs: Option<u64>,
        #[clap(short = 'p', long)]
        threads: Option<usize>,
    },
    /// Run the application without injections and log every run.
    Supervise {
        #[clap(short, long)]
        campaign: Option<u64>,
        #[clap(short, long)]
        run_time_secs: u64,
    },
    /// Rebuild the injected checkpoints of one result.
    Regenerate {
        #[clap(short, long)]
        campaign: Option<u64>,
        result: u64,
    },
}

static CANCEL: OnceLock<CancellationToken> = OnceLock::new();

extern "C" fn on_interrupt(_signal: libc::c_int) {
    if let Some(token) = CANCEL.get() {
        token.cancel();
    }
}

fn install_interrupt_handler() -> CancellationToken {
    let token = CANCEL.get_or_init(CancellationToken::new).clone();
    let handler = on_interrupt as extern "C" fn(libc::c_int);
    // The handler only flips an atomic flag.
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
    token
}

fn open_store(config: &UpsetConfig) -> Result<Arc<dyn ResultStore>, anyhow::Error> {
    let dir = config
        .store
        .directory
        .clone()
        .unwrap_or_else(|| config.workspace.join("results"));
    let inner: Arc<dyn ResultStore> = Arc::new(JsonResultStore::open(&dir)?);
    let policy = RetryPolicy::new(
        config.store.retry_attempts,
        Duration::from_secs(config.store.retry_backoff_secs),
    );
    Ok(Arc::new(RetryingStore::new(inner, policy)))
}

/// An interrupt ends the command cleanly; everything else is an error.
fn finish<T>(outcome: Result<T, CampaignError>) -> Result<Option<T>, anyhow::Error> {
    match outcome {
        Ok(value) => Ok(Some(value)),
        Err(CampaignError::Interrupted) => {
            warn!("Interrupted");
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = UpsetConfig::load_from_file(&cli.config_file)?;
    info!("Loaded configuration from {:?}", cli.config_file);
    let cancel = install_interrupt_handler();
    let store = open_store(&config)?;

    match cli.command {
        Command::New => {
            let debugger = debugger::from_config(&config, cancel.clone())?;
            if let Some(campaign) = finish(setup_campaign(&config, debugger, store, cancel))? {
                info!(
                    "Campaign {} ready: {:.6} s, {} cycles per run",
                    campaign.id, campaign.execution_time, campaign.cycles
                );
            }
        }
        Command::Inject {
            campaign,
            iterations,
            time_secs,
            threads,
        } => {
            if let Some(threads) = threads {
                config.workers.threads = threads;
            }
            let campaign = store.campaign(campaign)?;
            let budget = IterationBudget::new(
                iterations.or(config.injection.iterations),
                time_secs
                    .or(config.injection.time_budget_secs)
                    .map(Duration::from_secs),
            );
            let outcome = run_campaign(&config, &campaign, store, &cancel, &budget, |_| {
                debugger::from_config(&config, cancel.clone())
            });
            if let Some(completed) = finish(outcome)? {
                info!("Completed {completed} iterations of campaign {}", campaign.id);
            }
        }
        Command::Supervise {
            campaign,
            run_time_secs,
        } => {
            let campaign = store.campaign(campaign)?;
            let debugger = debugger::from_config(&config, cancel.clone())?;
            let mut orchestrator = Orchestrator::new(&config, campaign, debugger, store, 0, cancel)?;
            if let Some(runs) = finish(orchestrator.supervise(Duration::from_secs(run_time_secs)))? {
                info!("Supervised {runs} runs");
            }
        }
        Command::Regenerate { campaign, result } => {
            let campaign = store.campaign(campaign)?;
            let debugger = debugger::from_config(&config, cancel.clone())?;
            let mut orchestrator = Orchestrator::new(&config, campaign, debugger, store, 0, cancel)?;
            let regenerated = orchestrator.regenerate_checkpoint(result);
            orchestrator.close()?;
            if let Some(path) = finish(regenerated)? {
                println!("{}", path.display());
            }
        }
    }
    Ok(())
}
