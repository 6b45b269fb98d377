//! Which directories to watch and which events should trigger a rebuild

use notify::event::ModifyKind;
use notify::{Event, EventKind};
use std::collections::HashSet;
use std::path::{Component, Path};

/// Suffixes editors use for swap, backup and temp files
const EDITOR_SUFFIXES: &[&str] = &["~", ".swp", ".tmp", ".bak"];

/// Directory and event admission rules for one watch session
#[derive(Debug, Clone, Default)]
pub struct WatchFilter {
    /// Extensions with their leading dot, e.g. `.py`
    extensions: Vec<String>,
    exclude_dirs: HashSet<String>,
}

impl WatchFilter {
    /// Extensions are accepted with or without the leading dot
    pub fn new<E, X>(extensions: E, exclude_dirs: X) -> Self
    where
        E: IntoIterator,
        E::Item: AsRef<str>,
        X: IntoIterator,
        X::Item: Into<String>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|ext| {
                    let ext = ext.as_ref();
                    if ext.starts_with('.') {
                        ext.to_string()
                    } else {
                        format!(".{ext}")
                    }
                })
                .collect(),
            exclude_dirs: exclude_dirs.into_iter().map(Into::into).collect(),
        }
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Whether a directory should be watched and descended into
    pub fn admit_dir(&self, path: &Path) -> bool {
        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => !name.starts_with('.') && !self.exclude_dirs.contains(name),
            None => true,
        }
    }

    /// Create, write and rename events only
    pub fn admit_kind(kind: &EventKind) -> bool {
        matches!(
            kind,
            EventKind::Create(_)
                | EventKind::Modify(ModifyKind::Data(_))
                | EventKind::Modify(ModifyKind::Any)
                | EventKind::Modify(ModifyKind::Name(_))
        )
    }

    /// Whether a changed file should count toward a rebuild
    pub fn admit_path(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if name.starts_with('.') || EDITOR_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            return false;
        }

        let excluded = path.components().any(|c| match c {
            Component::Normal(part) => part
                .to_str()
                .is_some_and(|part| self.exclude_dirs.contains(part)),
            _ => false,
        });
        if excluded {
            return false;
        }

        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|want| want[1..] == *ext))
    }

    /// Event admission: kind first, then any of its paths
    pub fn should_watch(&self, event: &Event) -> bool {
        Self::admit_kind(&event.kind) && event.paths.iter().any(|p| self.admit_path(p))
    }
}
