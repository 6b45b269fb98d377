//! notify-backed watcher over a directory tree

use super::filter::WatchFilter;
use crate::error::Result;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Raw notify results, forwarded from notify's own thread
pub type FsEvents = mpsc::UnboundedReceiver<notify::Result<Event>>;

/// Non-recursive watches on the root and every admitted subdirectory.
///
/// Directories created later are added as their create events are seen, see
/// [`FileWatcher::track_new_dirs`].
pub struct FileWatcher {
    watcher: RecommendedWatcher,
    filter: Arc<WatchFilter>,
    root: PathBuf,
    watched: Vec<PathBuf>,
}

impl FileWatcher {
    /// Watch `root` and its admitted subtree
    pub fn new(root: impl Into<PathBuf>, filter: Arc<WatchFilter>) -> Result<(Self, FsEvents)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })?;

        let mut this = Self {
            watcher,
            filter,
            root: root.into(),
            watched: Vec::new(),
        };
        let root = this.root.clone();
        this.add_tree(&root);
        debug!(
            "Watching {} directories under {}",
            this.watched.len(),
            this.root.display()
        );
        Ok((this, rx))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directories currently registered
    pub fn watched_dirs(&self) -> &[PathBuf] {
        &self.watched
    }

    /// Register `dir` and every admitted directory below it
    fn add_tree(&mut self, dir: &Path) {
        let filter = self.filter.clone();
        let root = dir.to_path_buf();
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                entry.file_type().is_dir() && (entry.path() == root || filter.admit_dir(entry.path()))
            });

        // Unreadable directories are skipped
        for entry in walker.flatten() {
            let path = entry.into_path();
            if self.watched.contains(&path) {
                continue;
            }
            match self.watcher.watch(&path, RecursiveMode::NonRecursive) {
                Ok(()) => self.watched.push(path),
                Err(e) => warn!("Could not watch {}: {}", path.display(), e),
            }
        }
    }

    /// Start watching directories announced by a create event. Returns true if
    /// the event was about a directory, which never triggers a rebuild itself.
    pub fn track_new_dirs(&mut self, event: &Event) -> bool {
        if !matches!(event.kind, EventKind::Create(_)) {
            return false;
        }
        let mut saw_dir = false;
        for path in &event.paths {
            if !path.is_dir() {
                continue;
            }
            saw_dir = true;
            if self.filter.admit_dir(path) {
                debug!("Watching new directory {}", path.display());
                self.add_tree(path);
            }
        }
        saw_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::CreateKind;
    use std::fs;

    #[test]
    fn test_walk_skips_hidden_and_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("pkg/sub")).unwrap();
        fs::create_dir_all(root.join(".git/objects")).unwrap();
        fs::create_dir_all(root.join("__pycache__/inner")).unwrap();

        let filter = Arc::new(WatchFilter::new([".py"], ["__pycache__"]));
        let (watcher, _events) = FileWatcher::new(root, filter).unwrap();

        let mut watched: Vec<_> = watcher
            .watched_dirs()
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_path_buf())
            .collect();
        watched.sort();
        assert_eq!(
            watched,
            vec![PathBuf::new(), PathBuf::from("pkg"), PathBuf::from("pkg/sub")]
        );
    }

    #[test]
    fn test_new_directories_are_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let filter = Arc::new(WatchFilter::new([".py"], ["build"]));
        let (mut watcher, _events) = FileWatcher::new(root, filter).unwrap();

        fs::create_dir_all(root.join("added/deeper")).unwrap();
        fs::create_dir_all(root.join("build")).unwrap();
        fs::write(root.join("file.py"), "").unwrap();

        let created = |p: PathBuf| Event::new(EventKind::Create(CreateKind::Folder)).add_path(p);
        assert!(watcher.track_new_dirs(&created(root.join("added"))));
        assert!(watcher.track_new_dirs(&created(root.join("build"))));
        assert!(!watcher.track_new_dirs(&created(root.join("file.py"))));

        assert!(watcher.watched_dirs().contains(&root.join("added/deeper")));
        assert!(!watcher.watched_dirs().contains(&root.join("build")));
    }
}
