use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

mod config;
mod daemon;
mod ignore;
mod logging;
mod sync;
mod util;
mod watch;

use config::{Cli, Config};
use ignore::IgnoreFilter;
use sync::{SyncAction, coalescer, executor, planner};
use watch::WatchManager;

fn main() {
    let cli = Cli::parse();
    let cfg = match Config::from_cli(cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("treesyncd: {e:#}");
            std::process::exit(2);
        }
    };

    // Fork before the runtime exists; tokio state does not survive a fork.
    if cfg.daemon
        && let Err(e) = daemon::detach(&cfg)
    {
        eprintln!("treesyncd: {e:#}");
        std::process::exit(255);
    }

    if let Err(e) = logging::init(&cfg) {
        eprintln!("treesyncd: {e:#}");
        std::process::exit(255);
    }

    // The whole agent is one cooperative loop; a single-threaded runtime
    // is all it needs.
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "cannot start runtime");
            std::process::exit(255);
        }
    };

    if let Err(e) = runtime.block_on(run(cfg)) {
        tracing::error!(error = format!("{e:#}"), "fatal");
        std::process::exit(255);
    }
}

/// A watch-per-directory agent burns one inotify slot per directory; warn at
/// startup when the kernel budget looks too small to cover a sizeable tree.
fn check_inotify_budget() {
    const SYSCTL: &str = "/proc/sys/fs/inotify/max_user_watches";
    let limit = std::fs::read_to_string(SYSCTL)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok());
    match limit {
        Some(limit) if limit < 32_768 => tracing::warn!(
            limit,
            "inotify max_user_watches is small; raise {SYSCTL} before watching large trees"
        ),
        Some(limit) => tracing::debug!(limit, "inotify watch budget"),
        None => {}
    }
}

/// The full-tree action issued at startup and after queue-overflow recovery.
fn full_sync_action(cfg: &Config) -> SyncAction {
    SyncAction {
        path: cfg.source.clone(),
        recurse: true,
        delete: cfg.delete,
    }
}

async fn run(cfg: Config) -> Result<()> {
    check_inotify_budget();

    let filter = IgnoreFilter::build(&cfg.ignore_patterns, cfg.presets)?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let watcher = notify::recommended_watcher(move |result| {
        // delivered on notify's thread; the channel hands it to the loop
        let _ = tx.send(result);
    })?;
    let mut watches = WatchManager::new(watcher, cfg.source.clone());

    let added = watches.watch(&cfg.source, &filter);
    tracing::info!(
        watches = added,
        source = %cfg.source.display(),
        "watch set established"
    );
    if watches.watch_count() == 0 {
        anyhow::bail!(
            "no watches could be established under {}",
            cfg.source.display()
        );
    }

    // Bring the destinations current before event-driven syncing starts.
    tracing::info!("running initial full sync");
    executor::run_batch(vec![full_sync_action(&cfg)], &cfg).await;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                }
            }
            shutdown.cancel();
        });
    }

    // wait → drain → plan → execute, until a termination signal
    loop {
        let first = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "watch backend error");
                    continue;
                }
                None => {
                    anyhow::bail!("event channel closed unexpectedly");
                }
            }
        };

        let Some(events) =
            coalescer::collect(first, &mut rx, cfg.interval, &shutdown).await
        else {
            break;
        };
        tracing::debug!(events = events.len(), "batch closed");

        let batch = coalescer::fold(&events, &cfg.source, &filter, &mut watches, cfg.delete);

        if batch.rescan {
            // The kernel dropped events; whatever the batch says is
            // incomplete. Start over from a clean watch set and one sweep.
            tracing::warn!("kernel event queue overflowed, rescanning source tree");
            let added = watches.rebuild(&filter);
            tracing::info!(watches = added, "watch set rebuilt");
            executor::run_batch(vec![full_sync_action(&cfg)], &cfg).await;
            continue;
        }

        let actions = planner::plan(&batch.changes, &cfg.source, cfg.threshold);
        if actions.is_empty() {
            tracing::debug!("batch produced no actions");
            continue;
        }
        tracing::info!(actions = actions.len(), "executing sync plan");
        executor::run_batch(actions, &cfg).await;
    }

    tracing::info!(watches = watches.watch_count(), "treesyncd stopped");
    Ok(())
}
