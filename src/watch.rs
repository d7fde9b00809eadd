use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};

use crate::ignore::IgnoreFilter;
use crate::util::path as upath;

/// Kernel-facing half of the watch manager. Registration is keyed by
/// directory path; the backend treats the path as a non-owning handle.
pub trait WatchBackend {
    fn register(&mut self, dir: &Path) -> Result<()>;
    fn unregister(&mut self, dir: &Path) -> Result<()>;
}

impl WatchBackend for RecommendedWatcher {
    fn register(&mut self, dir: &Path) -> Result<()> {
        self.watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("cannot watch {}", dir.display()))
    }

    fn unregister(&mut self, dir: &Path) -> Result<()> {
        self.unwatch(dir)
            .with_context(|| format!("cannot unwatch {}", dir.display()))
    }
}

#[derive(Debug, Default)]
struct WatchNode {
    children: HashMap<String, WatchNode>,
    /// Whether this node currently holds a kernel watch.
    watched: bool,
}

/// In-memory tree of directory watches mirroring the live subtree of the
/// source. A node exists for every watched directory; the spine from the
/// root to any node consists of watched directories too, so detaching a
/// subtree releases every handle beneath it.
pub struct WatchManager<B> {
    backend: B,
    source: PathBuf,
    root: WatchNode,
    count: usize,
}

impl<B: WatchBackend> WatchManager<B> {
    pub fn new(backend: B, source: PathBuf) -> Self {
        Self {
            backend,
            source,
            root: WatchNode::default(),
            count: 0,
        }
    }

    /// Number of directories currently holding a kernel watch.
    pub fn watch_count(&self) -> usize {
        self.count
    }

    /// Recursively register watches for `path` and every non-ignored
    /// directory below it. Returns the number of watches added.
    ///
    /// Per-directory failures are warnings; the scan continues. Directories
    /// nested inside a just-created directory are picked up here even when
    /// their own create events were never seen.
    pub fn watch(&mut self, path: &Path, filter: &IgnoreFilter) -> usize {
        let mut added = 0;
        self.watch_dir(path, filter, &mut added);
        added
    }

    fn watch_dir(&mut self, dir: &Path, filter: &IgnoreFilter, added: &mut usize) {
        let rel = match upath::relative_path(&self.source, dir) {
            Ok(rel) => rel,
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "not under source, skipping");
                return;
            }
        };
        if !rel.is_empty() && filter.is_ignored(&rel) {
            tracing::debug!(path = %rel, "ignored, not watching");
            return;
        }

        match self.backend.register(dir) {
            Ok(()) => {
                if self.insert_watched(&rel) {
                    *added += 1;
                }
            }
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "watch registration failed");
            }
        }

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "cannot read dir");
                return;
            }
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "cannot read dir entry");
                    continue;
                }
            };
            match entry.file_type() {
                // Symlinked directories are synced as links, never descended.
                Ok(ft) if ft.is_dir() && !ft.is_symlink() => {
                    self.watch_dir(&entry.path(), filter, added);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "cannot stat, skipping");
                }
            }
        }
    }

    /// Cancel every watch at or below `path` and detach the subtree.
    ///
    /// Moved-out directories must come through here immediately: the path
    /// recorded against the handle is stale the moment the rename happens.
    pub fn unwatch(&mut self, path: &Path) {
        let rel = match upath::relative_path(&self.source, path) {
            Ok(rel) => rel,
            Err(_) => return,
        };

        if rel.is_empty() {
            let root = std::mem::take(&mut self.root);
            self.cancel_subtree(root, path.to_path_buf());
            return;
        }

        let segs: Vec<&str> = upath::segments(&rel).collect();
        let Some((last, spine)) = segs.split_last() else {
            return;
        };
        let mut node = &mut self.root;
        for seg in spine {
            match node.children.get_mut(*seg) {
                Some(child) => node = child,
                None => return,
            }
        }
        let Some(subtree) = node.children.remove(*last) else {
            return;
        };
        self.cancel_subtree(subtree, path.to_path_buf());
    }

    /// Post-order: descendants release their handles before the subtree root.
    fn cancel_subtree(&mut self, node: WatchNode, path: PathBuf) {
        let WatchNode { children, watched } = node;
        for (name, child) in children {
            let child_path = path.join(&name);
            self.cancel_subtree(child, child_path);
        }
        if watched {
            if let Err(e) = self.backend.unregister(&path) {
                // the kernel already drops watches on deleted directories
                tracing::debug!(path = %path.display(), error = %e, "watch cancel failed");
            }
            self.count -= 1;
        }
    }

    /// Whether `path` corresponds to a directory the tree currently watches.
    /// Used to decide if a delete or move-out event referred to a directory.
    pub fn is_watched_dir(&self, path: &Path) -> bool {
        let Ok(rel) = upath::relative_path(&self.source, path) else {
            return false;
        };
        let mut node = &self.root;
        for seg in upath::segments(&rel) {
            match node.children.get(seg) {
                Some(child) => node = child,
                None => return false,
            }
        }
        node.watched
    }

    /// Tear everything down and re-scan from the source root. Used after a
    /// kernel event-queue overflow, when the tree may be arbitrarily stale.
    pub fn rebuild(&mut self, filter: &IgnoreFilter) -> usize {
        let root = std::mem::take(&mut self.root);
        let source = self.source.clone();
        self.cancel_subtree(root, source.clone());
        self.watch(&source, filter)
    }

    fn insert_watched(&mut self, rel: &str) -> bool {
        let mut node = &mut self.root;
        for seg in upath::segments(rel) {
            node = node.children.entry(seg.to_string()).or_default();
        }
        if node.watched {
            return false;
        }
        node.watched = true;
        self.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ignore::Presets;
    use std::collections::HashSet;

    /// Backend that records registrations instead of talking to a kernel.
    #[derive(Default)]
    struct RecordingBackend {
        registered: Vec<PathBuf>,
        unregistered: Vec<PathBuf>,
        fail_on: HashSet<PathBuf>,
    }

    impl WatchBackend for RecordingBackend {
        fn register(&mut self, dir: &Path) -> Result<()> {
            if self.fail_on.contains(dir) {
                anyhow::bail!("injected failure");
            }
            self.registered.push(dir.to_path_buf());
            Ok(())
        }

        fn unregister(&mut self, dir: &Path) -> Result<()> {
            self.unregistered.push(dir.to_path_buf());
            Ok(())
        }
    }

    fn no_filter() -> IgnoreFilter {
        IgnoreFilter::build(&[], Presets::default()).unwrap()
    }

    fn make_tree(root: &Path, dirs: &[&str]) {
        for dir in dirs {
            std::fs::create_dir_all(root.join(dir)).unwrap();
        }
    }

    #[test]
    fn test_watch_registers_all_directories() {
        let tmp = tempfile::tempdir().unwrap();
        make_tree(tmp.path(), &["a/b", "a/c", "d"]);

        let mut mgr = WatchManager::new(RecordingBackend::default(), tmp.path().to_path_buf());
        let added = mgr.watch(&tmp.path().to_path_buf(), &no_filter());

        // root, a, a/b, a/c, d
        assert_eq!(added, 5);
        assert_eq!(mgr.watch_count(), 5);
        assert!(mgr.is_watched_dir(&tmp.path().join("a/b")));
        assert!(mgr.is_watched_dir(tmp.path()));
    }

    #[test]
    fn test_ignored_directory_gets_no_watch() {
        let tmp = tempfile::tempdir().unwrap();
        make_tree(tmp.path(), &["src", ".git/objects"]);

        let filter = IgnoreFilter::build(
            &[],
            Presets {
                dotfiles: true,
                ..Presets::default()
            },
        )
        .unwrap();
        let mut mgr = WatchManager::new(RecordingBackend::default(), tmp.path().to_path_buf());
        mgr.watch(&tmp.path().to_path_buf(), &filter);

        // root and src only; .git and .git/objects are pruned entirely
        assert_eq!(mgr.watch_count(), 2);
        assert!(!mgr.is_watched_dir(&tmp.path().join(".git")));
        assert!(!mgr.is_watched_dir(&tmp.path().join(".git/objects")));
    }

    #[test]
    fn test_unwatch_subtree_is_post_order_and_updates_count() {
        let tmp = tempfile::tempdir().unwrap();
        make_tree(tmp.path(), &["a/b/c", "d"]);

        let mut mgr = WatchManager::new(RecordingBackend::default(), tmp.path().to_path_buf());
        mgr.watch(&tmp.path().to_path_buf(), &no_filter());
        assert_eq!(mgr.watch_count(), 5);

        mgr.unwatch(&tmp.path().join("a"));

        assert_eq!(mgr.watch_count(), 2);
        assert!(!mgr.is_watched_dir(&tmp.path().join("a")));
        assert!(!mgr.is_watched_dir(&tmp.path().join("a/b")));
        assert!(mgr.is_watched_dir(&tmp.path().join("d")));

        let cancelled = &mgr.backend.unregistered;
        assert_eq!(cancelled.len(), 3);
        // the subtree root is released last
        assert_eq!(cancelled.last().unwrap(), &tmp.path().join("a"));
        let pos = |p: &Path| cancelled.iter().position(|c| c == p).unwrap();
        assert!(pos(&tmp.path().join("a/b/c")) < pos(&tmp.path().join("a/b")));
    }

    #[test]
    fn test_unwatch_by_stale_path_after_move_out() {
        // A moved-out directory is unwatched by the path it had before the
        // move; afterwards no handle may reference the old path.
        let tmp = tempfile::tempdir().unwrap();
        make_tree(tmp.path(), &["proj/src"]);

        let mut mgr = WatchManager::new(RecordingBackend::default(), tmp.path().to_path_buf());
        mgr.watch(&tmp.path().to_path_buf(), &no_filter());
        assert_eq!(mgr.watch_count(), 3);

        // simulate `mv proj /elsewhere`: the tree entry must go even though
        // nothing exists at the old path any more
        std::fs::rename(tmp.path().join("proj"), tmp.path().join("gone")).unwrap();
        std::fs::remove_dir_all(tmp.path().join("gone")).unwrap();
        mgr.unwatch(&tmp.path().join("proj"));

        assert_eq!(mgr.watch_count(), 1);
        assert!(!mgr.is_watched_dir(&tmp.path().join("proj")));
        assert!(!mgr.is_watched_dir(&tmp.path().join("proj/src")));
    }

    #[test]
    fn test_registration_failure_does_not_abort_scan() {
        let tmp = tempfile::tempdir().unwrap();
        make_tree(tmp.path(), &["a/b"]);

        let backend = RecordingBackend {
            fail_on: HashSet::from([tmp.path().join("a")]),
            ..RecordingBackend::default()
        };
        let mut mgr = WatchManager::new(backend, tmp.path().to_path_buf());
        let added = mgr.watch(&tmp.path().to_path_buf(), &no_filter());

        // root and a/b registered; a itself failed but the scan descended
        assert_eq!(added, 2);
        assert!(mgr.is_watched_dir(&tmp.path().join("a/b")));
        assert!(!mgr.is_watched_dir(&tmp.path().join("a")));
    }

    #[test]
    fn test_rebuild_resets_tree() {
        let tmp = tempfile::tempdir().unwrap();
        make_tree(tmp.path(), &["a", "b"]);

        let mut mgr = WatchManager::new(RecordingBackend::default(), tmp.path().to_path_buf());
        mgr.watch(&tmp.path().to_path_buf(), &no_filter());
        assert_eq!(mgr.watch_count(), 3);

        std::fs::remove_dir(tmp.path().join("b")).unwrap();
        make_tree(tmp.path(), &["c"]);
        let added = mgr.rebuild(&no_filter());

        assert_eq!(added, 3);
        assert_eq!(mgr.watch_count(), 3);
        assert!(mgr.is_watched_dir(&tmp.path().join("c")));
        assert!(!mgr.is_watched_dir(&tmp.path().join("b")));
    }
}
