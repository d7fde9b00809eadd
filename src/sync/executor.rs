use tokio::process::Command;

use crate::config::{Config, Destination};
use crate::sync::{SyncAction, planner};
use crate::util::path as upath;

/// The external transfer tool. Recursion and deletion are per-action;
/// everything else is fixed attribute-preserving flags (symlinks,
/// permissions, times, group, owner, devices and specials).
const TRANSFER_TOOL: &str = "rsync";
const BASE_FLAGS: &str = "-lptgoD";

/// Build the argv (minus the program name) for one action against one
/// destination. `rel` is the action path's suffix relative to the source.
pub fn transfer_args(
    action: &SyncAction,
    rel: &str,
    dest: &Destination,
    cfg: &Config,
) -> Vec<String> {
    let mut args = vec![BASE_FLAGS.to_string()];
    if cfg.debug {
        args.push("-v".into());
    }
    for pattern in &cfg.rsync_excludes {
        args.push("--exclude".into());
        args.push(pattern.clone());
    }
    if action.delete && cfg.delete {
        args.push("--delete".into());
    }

    if action.recurse {
        // subtree transfer: both sides carry a trailing separator so the
        // tool syncs contents onto contents
        args.push("-r".into());
        args.push("--".into());
        args.push(format!("{}/", action.path.display()));
        args.push(format!("{}/", dest.join_suffix(rel)));
    } else {
        // single object: the destination argument is its parent directory
        let parent_rel = rel.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        args.push("--".into());
        args.push(action.path.display().to_string());
        args.push(dest.join_suffix(parent_rel));
    }

    args
}

/// Execute a planned batch: prune overlaps and vanished paths, then run the
/// transfer tool once per surviving action per destination, sequentially.
/// Tool failures are warnings; the batch keeps going.
pub async fn run_batch(actions: Vec<SyncAction>, cfg: &Config) {
    let actions = planner::prune(actions, |path| path.symlink_metadata().is_ok());
    if actions.is_empty() {
        return;
    }

    if cfg.destinations.is_empty() {
        // observe-only mode: no transfers to run, just show the plan
        for action in &actions {
            tracing::info!(
                path = %action.path.display(),
                recurse = action.recurse,
                delete = action.delete,
                "planned action (no destinations)"
            );
        }
        return;
    }

    for action in &actions {
        let rel = match upath::relative_path(&cfg.source, &action.path) {
            Ok(rel) => rel,
            Err(e) => {
                tracing::warn!(error = %e, "action outside source, skipping");
                continue;
            }
        };

        for dest in &cfg.destinations {
            let args = transfer_args(action, &rel, dest, cfg);
            if cfg.dry {
                println!("{TRANSFER_TOOL} {}", args.join(" "));
                continue;
            }

            tracing::info!(
                path = %action.path.display(),
                dest = dest.as_str(),
                recurse = action.recurse,
                "syncing"
            );
            match Command::new(TRANSFER_TOOL).args(&args).status().await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    tracing::warn!(
                        path = %action.path.display(),
                        dest = dest.as_str(),
                        %status,
                        "transfer tool failed"
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cannot run {TRANSFER_TOOL}");
                }
            }
        }
    }
}
