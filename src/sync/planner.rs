use std::path::{Path, PathBuf};

use crate::sync::{ChangeNode, ChangeTree, Marker, SyncAction};

/// Walk the change tree and emit the minimal action set, sorted ascending by
/// path so ancestor actions precede descendants for the overlap filter.
pub fn plan(batch: &ChangeTree, source: &Path, threshold: usize) -> Vec<SyncAction> {
    let mut actions = Vec::new();
    if batch.is_empty() {
        return actions;
    }
    walk(&batch.root, source, source, threshold, &mut actions);
    actions.sort_by(|a, b| a.path.cmp(&b.path));
    actions
}

fn walk(
    node: &ChangeNode,
    path: &Path,
    source: &Path,
    threshold: usize,
    out: &mut Vec<SyncAction>,
) {
    match node.marker {
        Some(Marker::Deleted) => {
            // the object is gone; recursively syncing its parent with
            // deletion enabled is what propagates the removal
            let parent = if path == source {
                source.to_path_buf()
            } else {
                path.parent().unwrap_or(source).to_path_buf()
            };
            out.push(SyncAction {
                path: parent,
                recurse: true,
                delete: true,
            });
        }
        Some(Marker::CreatedDir) => {
            // descendants may have appeared before the watch did; one
            // recursive sync is the safe minimum
            out.push(SyncAction {
                path: path.to_path_buf(),
                recurse: true,
                delete: false,
            });
        }
        None => {
            if node.children.is_empty() {
                out.push(SyncAction {
                    path: path.to_path_buf(),
                    recurse: false,
                    delete: false,
                });
            } else if node.children.len() >= threshold {
                // too noisy to be worth descending
                out.push(SyncAction {
                    path: path.to_path_buf(),
                    recurse: true,
                    delete: false,
                });
            } else {
                for (name, child) in &node.children {
                    walk(child, &path.join(name), source, threshold, out);
                }
            }
        }
    }
}

/// Execution-order overlap elimination over a sorted action list: skip
/// actions covered by an earlier recursive action, and actions whose path no
/// longer exists on disk (events may describe now-gone paths).
pub fn prune<F>(actions: Vec<SyncAction>, exists: F) -> Vec<SyncAction>
where
    F: Fn(&Path) -> bool,
{
    let mut covered: Vec<PathBuf> = Vec::new();
    let mut out = Vec::new();

    for action in actions {
        if covered.iter().any(|prefix| action.path.starts_with(prefix)) {
            tracing::debug!(path = %action.path.display(), "covered by earlier recursive action");
            continue;
        }
        if !exists(&action.path) {
            tracing::debug!(path = %action.path.display(), "path vanished, skipping");
            continue;
        }
        if action.recurse {
            covered.push(action.path.clone());
        }
        out.push(action);
    }

    out
}
