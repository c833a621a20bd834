//! File-system watching for watch-mode builds.
//!
//! Wires `notify` up to the orchestrator: debounced change events are
//! filtered down to create/modify/remove, made relative to the project
//! root, and pushed into the channel consumed by [`Project::run`].
//!
//! [`Project::run`]: crate::Project::run

use std::cell::RefCell;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{
    DebounceEventResult, DebouncedEvent, Debouncer, RecommendedCache, new_debouncer,
};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::WatchError;
use crate::plugin::Watch;

const DEBOUNCE: Duration = Duration::from_millis(250);

/// A `notify`-backed watcher tracking individual files.
///
/// The orchestrator registers every file the graph discovers and
/// unregisters pruned ones, so only paths the build actually depends on
/// generate events.
pub struct FsWatcher {
    debouncer: RefCell<Debouncer<RecommendedWatcher, RecommendedCache>>,
    root: Utf8PathBuf,
}

impl FsWatcher {
    /// Create a watcher rooted at `root`. Changed paths are reported
    /// relative to it, matching the paths stored in the asset graph.
    pub fn new(root: Utf8PathBuf, tx: UnboundedSender<Utf8PathBuf>) -> Result<Self, WatchError> {
        let event_root = root.clone();

        let debouncer = new_debouncer(DEBOUNCE, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    for path in changed_paths(&event_root, &events) {
                        // A closed receiver means the run loop is gone.
                        if tx.send(path).is_err() {
                            return;
                        }
                    }
                }
                Err(errors) => {
                    for err in errors {
                        tracing::warn!("watch error: {err}");
                    }
                }
            }
        })?;

        Ok(Self {
            debouncer: RefCell::new(debouncer),
            root,
        })
    }
}

impl Watch for FsWatcher {
    fn watch(&self, path: &Utf8Path) {
        let full = self.root.join(path);
        if let Err(err) = self
            .debouncer
            .borrow_mut()
            .watch(full.as_std_path(), RecursiveMode::NonRecursive)
        {
            tracing::warn!("failed to watch '{full}': {err}");
        }
    }

    fn unwatch(&self, path: &Utf8Path) {
        let full = self.root.join(path);
        if let Err(err) = self.debouncer.borrow_mut().unwatch(full.as_std_path()) {
            tracing::debug!("failed to unwatch '{full}': {err}");
        }
    }
}

/// Relevant changed paths from a debounced batch, relative to `root`.
fn changed_paths(root: &Utf8Path, events: &[DebouncedEvent]) -> Vec<Utf8PathBuf> {
    let mut out = Vec::new();

    for event in events {
        if !matches!(
            event.event.kind,
            EventKind::Create(..) | EventKind::Modify(..) | EventKind::Remove(..)
        ) {
            continue;
        }

        for path in &event.event.paths {
            let path = path.strip_prefix(root.as_std_path()).unwrap_or(path);
            match Utf8PathBuf::from_path_buf(path.to_path_buf()) {
                Ok(path) => out.push(path),
                Err(path) => tracing::warn!(?path, "ignoring non-UTF-8 path"),
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use notify::event::{AccessKind, ModifyKind};

    use super::*;

    fn debounced(kind: EventKind, path: &str) -> DebouncedEvent {
        DebouncedEvent {
            event: notify::Event::new(kind).add_path(path.into()),
            time: Instant::now(),
        }
    }

    #[test]
    fn strips_root_and_filters_kinds() {
        let events = vec![
            debounced(EventKind::Modify(ModifyKind::Any), "/project/src/a.js"),
            debounced(EventKind::Access(AccessKind::Any), "/project/src/b.js"),
            debounced(EventKind::Remove(notify::event::RemoveKind::Any), "/project/src/c.js"),
        ];

        let paths = changed_paths("/project".into(), &events);

        assert_eq!(
            paths,
            vec![Utf8PathBuf::from("src/a.js"), "src/c.js".into()],
        );
    }

    #[test]
    fn paths_outside_the_root_pass_through() {
        let events = vec![debounced(EventKind::Modify(ModifyKind::Any), "/elsewhere/x.js")];

        let paths = changed_paths("/project".into(), &events);

        assert_eq!(paths, vec![Utf8PathBuf::from("/elsewhere/x.js")]);
    }
}
