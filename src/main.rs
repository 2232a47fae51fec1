use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use handoff::cleanup::{SweepConfig, SweepReport, Sweeper};
use handoff::config::Config;
use handoff::core::RequestId;
use handoff::ledger::Ledger;
use handoff::lock::HardwareLock;
use handoff::medium::{FsMedium, Medium, Namespace};
use handoff::orchestration::{Coordinator, DispatchSettings, FallbackDispatcher, PolicyTable};
use handoff::worker::{EchoHandler, Worker};
use handoff::{hlog, hlog_debug, Error, Result};

/// Handoff - cross-process task dispatch over a shared medium
#[derive(Parser, Debug)]
#[command(name = "handoff")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    HANDOFF_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.handoff/handoff.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Shared medium root (overrides medium_root in the config file)
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Show namespace contents, the lock holder and the lock queue
    Status,

    /// Dispatch one request through the fallback dispatcher
    Request {
        /// Capability to request (e.g. synthesis)
        #[arg(long, short = 'c')]
        capability: String,

        /// Opaque reference to the input data
        #[arg(long, short = 'p')]
        payload: String,

        /// Request id (generated if not given)
        #[arg(long)]
        request_id: Option<String>,
    },

    /// Run the reference worker for one provider until interrupted
    Worker {
        /// Provider name this worker serves
        #[arg(long)]
        provider: String,

        /// Simulated processing time per task
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,

        /// Answer every task with an error artifact
        #[arg(long)]
        fail: bool,
    },

    /// Report (and optionally remove) leftover records on the medium
    Sweep {
        /// Actually delete leftovers (default: just report)
        #[arg(long)]
        delete: bool,

        /// How long past a deadline a record may linger
        #[arg(long, default_value_t = 30)]
        grace_secs: u64,
    },

    /// Write the default config and create the medium namespaces
    Init,
}

fn main() {
    let cli = Cli::parse();
    handoff::log::init_with_debug(cli.debug);
    hlog!("handoff starting: {:?}", cli.command);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error ({}): {}", e.failure_kind(), e);
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = Config::load()?;
    if let Some(root) = &cli.root {
        config.medium_root = Some(root.to_string_lossy().into_owned());
    }

    if cli.command == Command::Init {
        return run_init(&config).map(|_| 0);
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let medium = open_medium(&config)?;
        match cli.command {
            Command::Status => run_status(&config, medium).await.map(|_| 0),
            Command::Request {
                capability,
                payload,
                request_id,
            } => run_request(&config, medium, &capability, &payload, request_id).await,
            Command::Worker {
                provider,
                delay_ms,
                fail,
            } => run_worker(&config, medium, &provider, delay_ms, fail).await.map(|_| 0),
            Command::Sweep { delete, grace_secs } => {
                run_sweep(medium, delete, grace_secs).await.map(|_| 0)
            }
            Command::Init => Ok(0),
        }
    })
}

fn open_medium(config: &Config) -> Result<Arc<dyn Medium>> {
    let medium = FsMedium::open(config.medium_dir()?)?;
    let medium = if config.watch {
        medium.with_watch()?
    } else {
        medium
    };
    Ok(Arc::new(medium))
}

fn run_init(config: &Config) -> Result<()> {
    if Config::config_path()?.exists() {
        println!("Config already exists: {}", Config::config_path()?.display());
    } else {
        config.save()?;
        println!("Wrote default config: {}", Config::config_path()?.display());
    }
    config.ensure_dirs()?;
    println!("Medium ready at {}", config.medium_dir()?.display());
    Ok(())
}

async fn run_status(config: &Config, medium: Arc<dyn Medium>) -> Result<()> {
    println!("Shared medium: {}", config.medium_dir()?.display());
    println!();
    for ns in Namespace::ALL {
        let keys = medium.list(&ns.prefix()).await?;
        println!("  {:<8} {}", ns.as_str(), keys.len());
    }
    println!();

    let resource = &config.lock.resource_id;
    let lock = HardwareLock::new(medium.clone(), config.poll_interval());
    match lock.holder(resource).await? {
        Some(token) => println!(
            "Lock {}: held by {} (generation {}, {:?} left)",
            resource,
            token.holder_id,
            token.generation,
            token.remaining()
        ),
        None => println!("Lock {}: free", resource),
    }
    for (i, ticket) in lock.waiters(resource).await?.iter().enumerate() {
        println!(
            "  {}. {} (queued {})",
            i + 1,
            ticket.holder_id,
            ticket.enqueued_at.format("%H:%M:%S%.3f")
        );
    }

    let ledger = Ledger::load(medium).await?;
    let entries = ledger.entries().await;
    if !entries.is_empty() {
        println!();
        println!("Requests:");
        for entry in entries {
            println!(
                "  {:<24} {:<20} attempts={}",
                entry.request_id.as_str(),
                entry.state.to_string(),
                entry.attempts.len()
            );
        }
    }
    Ok(())
}

async fn run_request(
    config: &Config,
    medium: Arc<dyn Medium>,
    capability: &str,
    payload: &str,
    request_id: Option<String>,
) -> Result<i32> {
    let request_id = match request_id {
        Some(raw) => RequestId::parse(&raw)?,
        None => RequestId::generate(),
    };
    let policy = PolicyTable::from_config(&config.policy)?;
    let ledger = Arc::new(Ledger::load(medium.clone()).await?);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let coordinator = Coordinator::new(medium, ledger.clone(), DispatchSettings::from_config(config))
        .with_events(tx);
    let dispatcher = FallbackDispatcher::new(Arc::new(coordinator), policy);

    let events = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            hlog_debug!("event: {:?}", event);
        }
    });

    println!("Request {} ({}) -> {}", request_id, capability, payload);
    let cancel = tokio_util::sync::CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };
    let outcome = dispatcher
        .request_with_cancel(&request_id, capability, payload, &cancel)
        .await;
    interrupt.abort();
    drop(dispatcher);
    let _ = events.await;

    // Settled entries leave the live ledger.
    if let Err(e) = ledger.archive(&request_id).await {
        hlog_debug!("Not archiving {}: {}", request_id, e);
    }

    match outcome {
        Ok(artifact) => {
            println!("{}", serde_json::to_string_pretty(&artifact)?);
            Ok(0)
        }
        Err(e) => {
            println!("FAILED ({}): {}", e.failure_kind(), e);
            Ok(1)
        }
    }
}

async fn run_worker(
    config: &Config,
    medium: Arc<dyn Medium>,
    provider: &str,
    delay_ms: u64,
    fail: bool,
) -> Result<()> {
    let handler = EchoHandler {
        delay: Duration::from_millis(delay_ms),
        fail,
    };
    let handle = Worker::new(medium, provider, Arc::new(handler))
        .with_interval(config.poll_interval())
        .spawn();
    println!("Worker for {} running; Ctrl-C to stop", provider);

    let signal = tokio::signal::ctrl_c().await;
    handle.stop().await;
    signal.map_err(Error::from)
}

async fn run_sweep(medium: Arc<dyn Medium>, delete: bool, grace_secs: u64) -> Result<()> {
    let ledger = Ledger::load(medium.clone()).await?;
    let sweeper = Sweeper::new(
        medium,
        SweepConfig {
            grace: Duration::from_secs(grace_secs),
        },
    );
    let report = if delete {
        sweeper.sweep(Some(&ledger)).await?
    } else {
        sweeper.scan(Some(&ledger)).await?
    };
    print_sweep(&report, delete);
    Ok(())
}

fn print_sweep(report: &SweepReport, deleted: bool) {
    let sections: [(&str, &Vec<String>); 5] = [
        ("Orphaned descriptors", &report.orphaned_descriptors),
        ("Stale results", &report.stale_results),
        ("Expired locks", &report.expired_locks),
        ("Dead queue tickets", &report.dead_tickets),
        ("Dangling claims", &report.dangling_claims),
    ];
    for (title, keys) in sections {
        println!("{}: {}", title, keys.len());
        for key in keys {
            println!("   • {}", key);
        }
    }
    println!();

    if report.is_clean() {
        println!("Nothing to sweep.");
    } else if deleted {
        println!("Removed {} record(s).", report.removed_count());
        for (key, reason) in &report.failed {
            println!("  could not remove {}: {}", key, reason);
        }
    } else {
        println!("Run with --delete to remove them.");
    }
}
