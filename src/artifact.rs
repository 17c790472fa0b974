// Artifact store and the persisted bundle file

use sha2::{Digest, Sha256};
use sourcemap::SourceMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

/// Suffix of the persisted bundle file; the bundle preprocessor is associated
/// with `<tempdir>/*` + this suffix
pub const BUNDLE_FILE_SUFFIX: &str = ".browserify.js";

/// Output of a successful build
#[derive(Debug, Clone, Default)]
pub struct Bundle {
    /// Raw bundled JavaScript
    pub content: Arc<str>,

    /// Parsed inline source map (debug builds only)
    pub source_map: Option<Arc<SourceMap>>,
}

impl Bundle {
    pub fn new(content: impl Into<Arc<str>>) -> Self {
        Self {
            content: content.into(),
            source_map: None,
        }
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Per-session lifecycle of the bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundlePhase {
    Uninitialized,
    AwaitingFirstBuild,
    /// At least one build completed, successfully or not
    SteadyState,
}

/// Snapshot observed by consumers of the artifact store
#[derive(Debug, Clone)]
pub struct ArtifactState {
    pub phase: BundlePhase,
    /// Latest successful bundle; empty placeholder before the first success
    pub bundle: Bundle,
    /// Number of successful builds published
    pub version: u64,
}

/// Latest known-good bundle plus the "built at least once" flag
///
/// Cloning yields another handle to the same store. Failed builds never touch
/// the stored bundle.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    tx: Arc<watch::Sender<ArtifactState>>,
}

impl Default for ArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ArtifactState {
            phase: BundlePhase::Uninitialized,
            bundle: Bundle::default(),
            version: 0,
        });
        Self { tx: Arc::new(tx) }
    }

    /// Replace the stored bundle with a freshly built one
    pub fn publish(&self, bundle: Bundle) {
        self.tx.send_modify(|state| {
            state.bundle = bundle;
            state.version += 1;
        });
    }

    /// Enter `AwaitingFirstBuild` (framework startup)
    pub fn start(&self) {
        self.tx.send_if_modified(|state| {
            if state.phase == BundlePhase::Uninitialized {
                state.phase = BundlePhase::AwaitingFirstBuild;
                true
            } else {
                false
            }
        });
    }

    /// Record that a build completed; `SteadyState` is terminal
    pub fn mark_built(&self) {
        self.tx.send_if_modified(|state| {
            if state.phase == BundlePhase::SteadyState {
                false
            } else {
                state.phase = BundlePhase::SteadyState;
                true
            }
        });
    }

    pub fn phase(&self) -> BundlePhase {
        self.tx.borrow().phase
    }

    pub fn built_once(&self) -> bool {
        self.phase() == BundlePhase::SteadyState
    }

    pub fn bundle(&self) -> Bundle {
        self.tx.borrow().bundle.clone()
    }

    pub fn content(&self) -> Arc<str> {
        Arc::clone(&self.tx.borrow().bundle.content)
    }

    pub fn version(&self) -> u64 {
        self.tx.borrow().version
    }

    /// Observe every change of the store
    pub fn subscribe(&self) -> watch::Receiver<ArtifactState> {
        self.tx.subscribe()
    }
}

/// Hash the given string
fn hash(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Temp file name unique to the given project directory
pub fn temp_file_name(project_dir: &Path, suffix: &str) -> PathBuf {
    let key = project_dir.to_string_lossy();
    std::env::temp_dir().join(format!("{}{}", hash(&key), suffix))
}

/// Filesystem copy of the latest bundle, served and watched by the test runner
#[derive(Debug, Clone)]
pub struct BundleFile {
    location: PathBuf,
}

impl BundleFile {
    /// Bundle file for the current working directory
    pub fn new() -> io::Result<Self> {
        let cwd = std::env::current_dir()?;
        Ok(Self::at(temp_file_name(&cwd, BUNDLE_FILE_SUFFIX)))
    }

    /// Bundle file at an explicit location
    pub fn at(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
        }
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn exists(&self) -> bool {
        self.location.exists()
    }

    /// Create the file as an empty placeholder, truncating leftover content
    pub fn reset(&self) -> io::Result<()> {
        self.update("")
    }

    pub fn update(&self, content: &str) -> io::Result<()> {
        if let Some(parent) = self.location.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.location, content)
    }

    pub fn read(&self) -> io::Result<String> {
        std::fs::read_to_string(&self.location)
    }

    pub fn remove(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.location) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_starts_uninitialized_and_empty() {
        let store = ArtifactStore::new();
        assert_eq!(store.phase(), BundlePhase::Uninitialized);
        assert!(!store.built_once());
        assert_eq!(&*store.content(), "");
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn phase_transitions() {
        let store = ArtifactStore::new();
        store.start();
        assert_eq!(store.phase(), BundlePhase::AwaitingFirstBuild);

        store.mark_built();
        assert_eq!(store.phase(), BundlePhase::SteadyState);

        // terminal
        store.start();
        assert_eq!(store.phase(), BundlePhase::SteadyState);
    }

    #[test]
    fn publish_replaces_content() {
        let store = ArtifactStore::new();
        store.publish(Bundle::new("first"));
        store.publish(Bundle::new("second"));

        assert_eq!(&*store.content(), "second");
        assert_eq!(store.version(), 2);
        assert!(store.bundle().source_map.is_none());
    }

    #[tokio::test]
    async fn subscribers_see_publications() {
        let store = ArtifactStore::new();
        let mut rx = store.subscribe();

        store.publish(Bundle::new("bundle"));

        rx.changed().await.unwrap();
        assert_eq!(&*rx.borrow().bundle.content, "bundle");
    }

    #[test]
    fn temp_file_name_is_deterministic() {
        let a = temp_file_name(Path::new("/project"), BUNDLE_FILE_SUFFIX);
        let b = temp_file_name(Path::new("/project"), BUNDLE_FILE_SUFFIX);
        let c = temp_file_name(Path::new("/other"), BUNDLE_FILE_SUFFIX);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.to_string_lossy().ends_with(".browserify.js"));
        assert_eq!(a.parent(), Some(std::env::temp_dir().as_path()));
    }

    #[test]
    fn bundle_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let file = BundleFile::at(dir.path().join("x.browserify.js"));

        assert!(!file.exists());
        file.reset().unwrap();
        assert!(file.exists());
        assert_eq!(file.read().unwrap(), "");

        file.update("content").unwrap();
        assert_eq!(file.read().unwrap(), "content");
        file.reset().unwrap();
        assert_eq!(file.read().unwrap(), "");

        file.remove().unwrap();
        assert!(!file.exists());
        // removing twice is fine
        file.remove().unwrap();
    }
}
