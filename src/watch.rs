// File watcher for autoWatch rebuilds

use crate::error::FrameworkError;
use crate::framework::Session;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Forwards file system changes of the session's watched files to
/// [`Session::file_changed`]
///
/// Directories holding watched files are watched non-recursively, so files
/// replaced by editors (write to temp, rename) keep being observed. The set of
/// directories follows the watched set, which changes after builds.
pub struct BundleWatcher {
    task: JoinHandle<()>,
}

impl BundleWatcher {
    /// Start watching on behalf of `session`
    pub fn start(session: Session) -> Result<Self, FrameworkError> {
        let (event_tx, event_rx) = mpsc::channel(1024);

        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = event_tx.blocking_send(res);
            },
            NotifyConfig::default(),
        )
        .map_err(|e| FrameworkError::Watch(format!("watcher init failed: {e}")))?;

        let task = tokio::spawn(run(session, watcher, event_rx));
        Ok(Self { task })
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for BundleWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    session: Session,
    mut watcher: RecommendedWatcher,
    mut event_rx: mpsc::Receiver<notify::Result<Event>>,
) {
    let mut watched_rx = session.watched().subscribe();
    let mut dirs: HashSet<PathBuf> = HashSet::new();

    let files = watched_rx.borrow_and_update().clone();
    resync(&mut watcher, &mut dirs, &files);

    loop {
        tokio::select! {
            changed = watched_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let files = watched_rx.borrow_and_update().clone();
                resync(&mut watcher, &mut dirs, &files);
            }
            event = event_rx.recv() => {
                match event {
                    Some(Ok(event)) => handle_event(&session, event),
                    Some(Err(err)) => tracing::warn!("Watcher error: {err}"),
                    None => break,
                }
            }
        }
    }

    tracing::debug!("bundle watcher stopped");
}

fn handle_event(session: &Session, event: Event) {
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return;
    }

    for path in &event.paths {
        if session.file_changed(path) {
            // one rebuild per event is enough
            break;
        }
    }
}

/// Watch the parent directories of `files`, dropping directories no longer needed
fn resync(watcher: &mut RecommendedWatcher, dirs: &mut HashSet<PathBuf>, files: &HashSet<PathBuf>) {
    let wanted: HashSet<PathBuf> = files
        .iter()
        .filter_map(|f| f.parent())
        .filter(|d| !d.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .collect();

    for dir in dirs.difference(&wanted).cloned().collect::<Vec<_>>() {
        if let Err(err) = watcher.unwatch(&dir) {
            tracing::debug!("failed to unwatch {}: {err}", dir.display());
        }
        dirs.remove(&dir);
    }

    for dir in wanted {
        if dirs.contains(&dir) {
            continue;
        }
        match watcher.watch(&dir, RecursiveMode::NonRecursive) {
            Ok(()) => {
                tracing::debug!(dir = %dir.display(), "watching");
                dirs.insert(dir);
            }
            Err(err) => tracing::warn!("failed to watch {}: {err}", dir.display()),
        }
    }
}
