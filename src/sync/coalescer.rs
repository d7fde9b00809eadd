use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::ignore::IgnoreFilter;
use crate::sync::{ChangeTree, Marker};
use crate::util::path as upath;
use crate::watch::{WatchBackend, WatchManager};

/// The event kinds the agent cares about. Everything else is dropped before
/// it reaches the change tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Created,
    CloseWrite,
    MovedIn,
    MovedOut,
    Removed,
    AttribChanged,
}

/// A folded batch: the hierarchical change set, plus whether the kernel
/// reported an event-queue overflow anywhere in it.
pub struct Batch {
    pub changes: ChangeTree,
    pub rescan: bool,
}

/// Drain the event stream until it has been quiet for a full `interval`.
///
/// The first event opens the batch; all currently queued events are taken,
/// then the loop sleeps `interval` and drains again until one whole interval
/// passes with nothing new. A zero interval degenerates to one drain pass
/// per sleep tick and still terminates.
///
/// Returns `None` when shutdown was requested mid-drain.
pub async fn collect(
    first: Event,
    rx: &mut UnboundedReceiver<notify::Result<Event>>,
    interval: Duration,
    shutdown: &CancellationToken,
) -> Option<Vec<Event>> {
    let mut events = vec![first];
    drain_ready(rx, &mut events);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return None,
            _ = tokio::time::sleep(interval) => {}
        }
        let before = events.len();
        drain_ready(rx, &mut events);
        if events.len() == before {
            break;
        }
    }

    Some(events)
}

fn drain_ready(rx: &mut UnboundedReceiver<notify::Result<Event>>, out: &mut Vec<Event>) {
    while let Ok(result) = rx.try_recv() {
        match result {
            Ok(event) => out.push(event),
            Err(e) => tracing::warn!(error = %e, "watch backend error"),
        }
    }
}

/// Fold a closed batch into a change tree, applying watch-tree side effects
/// as events are processed in arrival order.
///
/// A directory create or move-in grows the watch set (re-scanning, so
/// children that appeared before the watch existed are picked up) and marks
/// the node `CreatedDir`. A delete or move-out marks `Deleted` only when
/// deletion propagation is enabled, but always tears down the watch subtree
/// when the event was on a directory.
pub fn fold<B: WatchBackend>(
    events: &[Event],
    source: &Path,
    filter: &IgnoreFilter,
    watches: &mut WatchManager<B>,
    delete_enabled: bool,
) -> Batch {
    let mut changes = ChangeTree::default();
    let mut rescan = false;

    for event in events {
        if event.need_rescan() {
            rescan = true;
            continue;
        }
        for (path, change) in records(event) {
            let rel = match upath::relative_path(source, &path) {
                Ok(rel) => rel,
                Err(_) => {
                    tracing::trace!(path = %path.display(), "event outside source, skipping");
                    continue;
                }
            };
            if filter.is_ignored(&rel) {
                tracing::trace!(path = %rel, "ignored event");
                continue;
            }
            tracing::debug!(path = %rel, change = ?change, "event");

            match change {
                Change::Created | Change::MovedIn => {
                    changes.touch(&rel);
                    if created_dir(event, &path) {
                        watches.watch(&path, filter);
                        changes.mark(&rel, Marker::CreatedDir);
                    }
                }
                Change::Removed | Change::MovedOut => {
                    if delete_enabled {
                        changes.mark(&rel, Marker::Deleted);
                    }
                    let was_dir = matches!(event.kind, EventKind::Remove(RemoveKind::Folder))
                        || watches.is_watched_dir(&path);
                    if was_dir {
                        watches.unwatch(&path);
                    }
                }
                Change::CloseWrite | Change::AttribChanged => {
                    changes.touch(&rel);
                }
            }
        }
    }

    Batch { changes, rescan }
}

/// Expand an event into per-path change records. A paired rename is a
/// move-out of the first path and a move-in of the second.
fn records(event: &Event) -> Vec<(PathBuf, Change)> {
    if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind {
        let mut out = Vec::new();
        if let Some(from) = event.paths.first() {
            out.push((from.clone(), Change::MovedOut));
        }
        if let Some(to) = event.paths.get(1) {
            out.push((to.clone(), Change::MovedIn));
        }
        return out;
    }
    match classify(&event.kind) {
        Some(change) => event
            .paths
            .iter()
            .map(|path| (path.clone(), change))
            .collect(),
        None => Vec::new(),
    }
}

fn classify(kind: &EventKind) -> Option<Change> {
    match kind {
        EventKind::Create(_) => Some(Change::Created),
        EventKind::Remove(_) => Some(Change::Removed),
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => Some(Change::CloseWrite),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(Change::MovedOut),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(Change::MovedIn),
        EventKind::Modify(ModifyKind::Metadata(_)) => Some(Change::AttribChanged),
        _ => None,
    }
}

/// Whether a create/move-in event landed a directory at `path`.
fn created_dir(event: &Event, path: &Path) -> bool {
    if matches!(event.kind, EventKind::Create(CreateKind::Folder)) {
        return true;
    }
    // Moved-in entries (and backends that don't distinguish) need a stat;
    // symlinks to directories stay plain objects.
    std::fs::symlink_metadata(path)
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}
