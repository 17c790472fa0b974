// Bundle builder - drives the bundler over the working file set

use crate::artifact::{ArtifactStore, Bundle, BundleFile};
use crate::bundler::Bundler;
use crate::error::BuildError;
use crate::source_map;
use crate::working_set::WorkingFileSet;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// Files whose changes should trigger a rebuild
///
/// The working set plus everything the last build read, so a dependency that
/// broke a build is still watched until it is fixed. Replaced after every
/// build; observers are notified only when the set actually changes.
#[derive(Debug, Clone)]
pub struct WatchedFiles {
    tx: Arc<watch::Sender<Arc<HashSet<PathBuf>>>>,
}

impl Default for WatchedFiles {
    fn default() -> Self {
        let (tx, _) = watch::channel(Arc::new(HashSet::new()));
        Self { tx: Arc::new(tx) }
    }
}

impl WatchedFiles {
    pub fn contains(&self, path: &Path) -> bool {
        self.tx.borrow().contains(path)
    }

    pub fn snapshot(&self) -> Arc<HashSet<PathBuf>> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<HashSet<PathBuf>>> {
        self.tx.subscribe()
    }

    fn replace(&self, files: HashSet<PathBuf>) {
        self.tx.send_if_modified(|current| {
            if **current == files {
                false
            } else {
                *current = Arc::new(files);
                true
            }
        });
    }
}

/// Owns the bundler and the working file set of one session
///
/// Every build resets the bundler, re-adds the working set and bundles.
/// Working files that disappeared are dropped and the build retried; any other
/// failure is returned untouched and leaves the published bundle as it was.
pub struct BundleBuilder {
    bundler: Box<dyn Bundler>,
    files: WorkingFileSet,
    artifacts: ArtifactStore,
    bundle_file: Option<BundleFile>,
    watched: WatchedFiles,
    debug: bool,
}

impl BundleBuilder {
    pub fn new(bundler: Box<dyn Bundler>, artifacts: ArtifactStore) -> Self {
        Self {
            bundler,
            files: WorkingFileSet::new(),
            artifacts,
            bundle_file: None,
            watched: WatchedFiles::default(),
            debug: false,
        }
    }

    /// Write every successful bundle to `file`
    pub fn with_bundle_file(mut self, file: BundleFile) -> Self {
        self.bundle_file = Some(file);
        self
    }

    /// Extract the inline source map of every successful bundle
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn files(&self) -> &WorkingFileSet {
        &self.files
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Handle to the set of files whose changes matter to this builder
    pub fn watched(&self) -> WatchedFiles {
        self.watched.clone()
    }

    /// Add a file to the working set; returns `false` if it was already there
    ///
    /// The bundle becomes stale but nothing is rebuilt until [`build`] is called.
    ///
    /// [`build`]: BundleBuilder::build
    pub fn add_file(&mut self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        let added = self.files.add(path.clone());
        if added {
            tracing::debug!(path = %path.display(), "added file to bundle");
            self.refresh_watched();
        }
        added
    }

    /// Drop a file from the working set; returns `false` if it was not there
    pub fn remove_file(&mut self, path: &Path) -> bool {
        let removed = self.files.remove(path);
        if removed {
            tracing::debug!(path = %path.display(), "removed file from bundle");
            self.refresh_watched();
        }
        removed
    }

    /// Bundle the current working set
    ///
    /// The bundle is published and persisted on success. Completion of any
    /// build, successful or not, moves the artifact store to its steady state.
    pub async fn build(&mut self) -> Result<Bundle, BuildError> {
        let started = Instant::now();
        let result = self.bundle_with_recovery().await;
        self.refresh_watched();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let result = match result {
            Ok(content) => {
                let mut bundle = Bundle::new(content);
                if self.debug {
                    bundle.source_map = source_map::extract_inline(&bundle.content).map(Arc::new);
                }

                tracing::info!(
                    bundler = self.bundler.name(),
                    files = self.files.len(),
                    bytes = bundle.len(),
                    elapsed_ms,
                    "bundle built"
                );

                self.artifacts.publish(bundle.clone());
                if let Some(file) = &self.bundle_file {
                    if let Err(e) = file.update(&bundle.content) {
                        tracing::warn!(
                            path = %file.location().display(),
                            error = %e,
                            "failed to write bundle file"
                        );
                    }
                }
                Ok(bundle)
            }
            Err(err) => {
                tracing::error!(bundler = self.bundler.name(), elapsed_ms, "bundle error: {}", err);
                Err(err)
            }
        };

        self.artifacts.mark_built();
        result
    }

    async fn bundle_with_recovery(&mut self) -> Result<String, BuildError> {
        loop {
            self.bundler.reset();
            for path in self.files.iter() {
                self.bundler.add(path);
            }

            match self.bundler.bundle().await {
                Ok(output) => return Ok(output.content),
                Err(err) => {
                    // Only a vanished working file is recoverable; each retry
                    // shrinks the set, so this terminates.
                    let missing = err.missing_path().map(Path::to_path_buf);
                    match missing {
                        Some(path) if self.files.remove(&path) => {
                            tracing::warn!(
                                path = %path.display(),
                                "file no longer exists, removed from bundle"
                            );
                        }
                        _ => return Err(err),
                    }
                }
            }
        }
    }

    fn refresh_watched(&self) {
        let mut files: HashSet<PathBuf> = self.files.iter().map(Path::to_path_buf).collect();
        files.extend(self.bundler.watched_files());
        self.watched.replace(files);
    }

    /// Release the bundler and detach the bundle file
    ///
    /// Builds after closing no longer write the bundle file.
    pub async fn close(&mut self) {
        self.bundle_file = None;
        self.bundler.close().await;
    }
}
