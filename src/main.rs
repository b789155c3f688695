//! cache-resilience - keeps setting and scanning keys through reconnects
//!
//! Type `q` (or close stdin) to stop.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use cache_resilience::config::{CacheConfig, CliArgs};
use cache_resilience::connection::ConnectionManager;
use cache_resilience::retry::{RetryExecutor, RetryPolicy};
use cache_resilience::shutdown::{cancel_on_input, ShutdownSignal};
use cache_resilience::workers::{run_commands, scan_keys, set_keys, WorkerSet};

/// How often the main thread checks whether the workers are done
const POLL_INTERVAL: Duration = Duration::from_millis(200);

fn setup_logging(verbose: bool, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_names(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

fn spawn_set_keys(
    workers: &mut WorkerSet,
    executor: &Arc<RetryExecutor>,
    policy: RetryPolicy,
    shutdown: &ShutdownSignal,
    config: &CacheConfig,
) -> Result<()> {
    let executor = Arc::clone(executor);
    let shutdown = shutdown.clone();
    let prefix = config.key_prefix.clone();
    let count = config.number_of_keys_to_set;
    workers.spawn("set-keys", move || {
        set_keys(&executor, &policy, &shutdown, &prefix, count);
        Ok(())
    })
}

fn spawn_scan_keys(
    workers: &mut WorkerSet,
    executor: &Arc<RetryExecutor>,
    shutdown: &ShutdownSignal,
    config: &CacheConfig,
    args: &CliArgs,
) -> Result<()> {
    let executor = Arc::clone(executor);
    let shutdown = shutdown.clone();
    let pattern = config.scan_pattern();
    let page_size = args.scan_page_size;
    let interval = args.scan_interval();
    workers.spawn("scan-keys", move || {
        scan_keys(&executor, &shutdown, &pattern, page_size, interval).map(|_| ())
    })
}

fn run_workers(
    args: &CliArgs,
    config: &CacheConfig,
    manager: &Arc<ConnectionManager>,
    shutdown: &ShutdownSignal,
) -> Result<()> {
    let policy = args.retry_policy()?;
    let executor = Arc::new(RetryExecutor::new(Arc::clone(manager), shutdown.clone()));

    if args.commands {
        run_commands(&executor, &policy).context("Command demo failed")?;
    }

    let mut workers = WorkerSet::new();
    if config.set_keys_first {
        set_keys(
            &executor,
            &policy,
            shutdown,
            &config.key_prefix,
            config.number_of_keys_to_set,
        );
    } else {
        spawn_set_keys(&mut workers, &executor, policy, shutdown, config)?;
    }
    spawn_scan_keys(&mut workers, &executor, shutdown, config, args)?;

    info!("Running... type 'q' and Enter to quit");
    while !workers.all_finished() {
        if shutdown.wait_timeout(POLL_INTERVAL) {
            break;
        }
    }

    shutdown.cancel();
    let report = workers.join(args.grace_period());
    info!(
        "Workers stopped: {} completed, {} failed, {} abandoned",
        report.completed,
        report.failed,
        report.abandoned.len()
    );
    Ok(())
}

fn run() -> Result<()> {
    // Parse CLI arguments
    let args = CliArgs::parse_args();
    setup_logging(args.verbose, args.quiet)?;
    args.validate()
        .map_err(|e| anyhow::anyhow!("Invalid arguments: {}", e))?;

    let config = args.cache_config()?;
    let descriptor = args.descriptor(&config)?;
    info!("Connecting with {:?}", descriptor);

    let manager = Arc::new(ConnectionManager::from_descriptor(
        &descriptor,
        args.manager_settings(),
    ));
    let handle = manager
        .initialize()
        .context("Failed to establish the initial connection")?;
    info!(
        "Connected via {} ({} shard(s))",
        handle.seed(),
        handle.endpoints().len()
    );
    drop(handle);

    let shutdown = ShutdownSignal::new();
    cancel_on_input(io::BufReader::new(io::stdin()), shutdown.clone())
        .context("Failed to start input watcher")?;

    let outcome = run_workers(&args, &config, &manager, &shutdown);
    shutdown.cancel();
    manager.dispose();
    outcome
}

fn main() {
    if let Err(e) = run() {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
