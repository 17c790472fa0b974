// Framework registration - wires a bundling session into the test runner

use crate::artifact::{ArtifactStore, Bundle, BundleFile, BUNDLE_FILE_SUFFIX};
use crate::builder::{BundleBuilder, WatchedFiles};
use crate::bundler::{create_bundler, prepare_bundler};
use crate::coalesce::Coalescer;
use crate::config::{FilePattern, HostConfig};
use crate::error::{BuildError, FrameworkError};
use crate::preprocess::{
    BuildCoalescer, BundlePreprocessor, TestFilePreprocessor, BUNDLE_PREPROCESSOR,
    TEST_FILE_PREPROCESSOR,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(feature = "watch")]
use crate::watch::BundleWatcher;

/// Name the framework is registered under
pub const FRAMEWORK_NAME: &str = "browserify";

const LOG_TARGET: &str = "framework.browserify";

type ExitHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Start/exit signals of a test run
///
/// Exit hooks run once, in registration order.
#[derive(Default)]
pub struct Lifecycle {
    exit_hooks: Mutex<Vec<ExitHook>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_exit<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.exit_hooks
            .lock()
            .push(Box::new(move || Box::pin(hook())));
    }

    /// Emit the exit signal and wait for every hook
    pub async fn exit(&self) {
        let hooks = std::mem::take(&mut *self.exit_hooks.lock());
        for hook in hooks {
            hook().await;
        }
    }
}

/// Entry point the test runner calls once per session
#[derive(Debug, Clone, Default)]
pub struct Framework {
    bundle_file: Option<BundleFile>,
}

impl Framework {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist the bundle at `file` instead of the per-project temp file
    pub fn with_bundle_file(mut self, file: BundleFile) -> Self {
        self.bundle_file = Some(file);
        self
    }

    /// Register with the test runner
    ///
    /// Creates or truncates the bundle file and adds it to the served files
    /// ahead of the first test file. The file is associated with the bundle
    /// preprocessor and removed on exit.
    pub fn register(&self, lifecycle: &Lifecycle, config: &mut HostConfig) -> Result<Session, FrameworkError> {
        let bundle_file = match &self.bundle_file {
            Some(file) => file.clone(),
            None => BundleFile::new()?,
        };

        bundle_file.reset()?;
        tracing::debug!(target: LOG_TARGET, "created browserify bundle: {}", bundle_file.location().display());

        let options = config.browserify.clone();
        let basedir = options.basedir_or(&config.base_path);

        let mut bundler = create_bundler(&options, &basedir)?;
        prepare_bundler(bundler.as_mut(), &options)?;

        let artifacts = ArtifactStore::new();
        let builder = BundleBuilder::new(bundler, artifacts.clone())
            .with_bundle_file(bundle_file.clone())
            .with_debug(options.debug);
        let watched = builder.watched();
        let builder = Arc::new(tokio::sync::Mutex::new(builder));

        let shared = Arc::clone(&builder);
        let coalescer: BuildCoalescer = Coalescer::new(options.bundle_delay(), move || {
            let builder = Arc::clone(&shared);
            async move { builder.lock().await.build().await }
        });

        artifacts.start();

        let session = Session {
            inner: Arc::new(SessionInner {
                builder,
                coalescer,
                artifacts,
                watched,
                bundle_file: bundle_file.clone(),
                basedir,
                require_name: options.require_name().to_string(),
                auto_watch: config.auto_watch,
                debug: options.debug,
                #[cfg(feature = "watch")]
                watcher: Mutex::new(None),
            }),
        };

        let closing = session.clone();
        lifecycle.on_exit(move || async move {
            tracing::debug!(target: LOG_TARGET, "cleaning up");
            closing.close().await;
        });

        add_bundle_file(config, bundle_file.location());

        #[cfg(feature = "watch")]
        if config.auto_watch {
            let watcher = BundleWatcher::start(session.clone())?;
            *session.inner.watcher.lock() = Some(watcher);
        }

        Ok(session)
    }
}

/// Insert the bundle file before the first file handled by the test file
/// preprocessor (or first, if there is none) and associate it with the
/// bundle preprocessor
fn add_bundle_file(config: &mut HostConfig, location: &Path) {
    let patterns: Vec<glob::Pattern> = config
        .preprocessors
        .iter()
        .filter(|(_, names)| names.iter().any(|n| n == TEST_FILE_PREPROCESSOR))
        .filter_map(|(key, _)| match glob::Pattern::new(key) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                tracing::warn!(target: LOG_TARGET, "invalid preprocessor pattern {}: {}", key, e);
                None
            }
        })
        .collect();

    let idx = config
        .files
        .iter()
        .position(|f| patterns.iter().any(|p| p.matches(&f.pattern)))
        .unwrap_or_else(|| {
            tracing::debug!(target: LOG_TARGET, "no matching preprocessed file was found, defaulting to prepend");
            0
        });

    tracing::debug!(target: LOG_TARGET, "add bundle to config.files at position {}", idx);

    let location = location.to_string_lossy().into_owned();
    config.files.insert(idx, FilePattern::new(location.clone()));

    let association = match Path::new(&location).parent() {
        Some(dir) => format!("{}/*{}", dir.to_string_lossy(), BUNDLE_FILE_SUFFIX),
        None => location,
    };
    let names = config.preprocessors.entry(association).or_default();
    if !names.iter().any(|n| n == BUNDLE_PREPROCESSOR) {
        names.push(BUNDLE_PREPROCESSOR.to_string());
    }
}

struct SessionInner {
    builder: Arc<tokio::sync::Mutex<BundleBuilder>>,
    coalescer: BuildCoalescer,
    artifacts: ArtifactStore,
    watched: WatchedFiles,
    bundle_file: BundleFile,
    basedir: PathBuf,
    require_name: String,
    auto_watch: bool,
    debug: bool,
    #[cfg(feature = "watch")]
    watcher: Mutex<Option<BundleWatcher>>,
}

/// Bundling state of one test run, shared by both preprocessors
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Preprocessor for test files
    pub fn test_file_preprocessor(&self) -> TestFilePreprocessor {
        TestFilePreprocessor::new(
            Arc::clone(&self.inner.builder),
            self.inner.coalescer.clone(),
            self.inner.basedir.clone(),
            self.inner.require_name.clone(),
        )
    }

    /// Preprocessor for the bundle file
    pub fn bundle_preprocessor(&self) -> BundlePreprocessor {
        BundlePreprocessor::new(
            self.inner.artifacts.clone(),
            self.inner.coalescer.clone(),
            self.inner.debug,
        )
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.inner.artifacts
    }

    pub fn bundle_file(&self) -> &BundleFile {
        &self.inner.bundle_file
    }

    pub fn watched(&self) -> &WatchedFiles {
        &self.inner.watched
    }

    /// Number of builds run by this session
    pub fn builds(&self) -> u64 {
        self.inner.coalescer.builds()
    }

    /// A watched file changed on disk
    ///
    /// Schedules a rebuild when autoWatch is on and the file is part of the
    /// bundle; returns whether one was scheduled.
    pub fn file_changed(&self, path: &Path) -> bool {
        if !self.inner.auto_watch
            || self.inner.coalescer.is_closed()
            || !self.inner.watched.contains(path)
        {
            return false;
        }

        tracing::info!(target: LOG_TARGET, path = %path.display(), "file changed, rebuilding bundle");
        self.inner.coalescer.schedule();
        true
    }

    /// Add a file to the bundle without waiting for a build
    pub async fn add_file(&self, path: impl Into<PathBuf>) -> bool {
        self.inner.builder.lock().await.add_file(path)
    }

    /// Drop a deleted file from the bundle
    pub async fn remove_file(&self, path: &Path) -> bool {
        self.inner.builder.lock().await.remove_file(path)
    }

    /// Wait for the next coalesced build
    pub async fn rebuild(&self) -> Result<Bundle, BuildError> {
        self.inner.coalescer.request().await
    }

    async fn close(&self) {
        self.inner.coalescer.shutdown();

        #[cfg(feature = "watch")]
        {
            let watcher = self.inner.watcher.lock().take();
            if let Some(watcher) = watcher {
                watcher.stop();
            }
        }

        self.inner.builder.lock().await.close().await;

        if let Err(e) = self.inner.bundle_file.remove() {
            tracing::warn!(
                target: LOG_TARGET,
                path = %self.inner.bundle_file.location().display(),
                error = %e,
                "failed to remove bundle file"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config(files: &[&str], preprocessors: &[(&str, &str)]) -> HostConfig {
        HostConfig {
            files: files.iter().map(|p| FilePattern {
                pattern: p.to_string(),
                served: true,
                included: true,
                watched: true,
            }).collect(),
            preprocessors: preprocessors
                .iter()
                .map(|(k, v)| (k.to_string(), vec![v.to_string()]))
                .collect::<BTreeMap<_, _>>(),
            ..Default::default()
        }
    }

    fn patterns(config: &HostConfig) -> Vec<&str> {
        config.files.iter().map(|f| f.pattern.as_str()).collect()
    }

    const LOCATION: &str = "/tmp/abc.browserify.js";

    #[test]
    fn prepends_without_preprocessed_files() {
        let mut config = config(&["vendor/external.js"], &[]);
        add_bundle_file(&mut config, Path::new(LOCATION));

        assert_eq!(patterns(&config), vec![LOCATION, "vendor/external.js"]);
        let bundle = &config.files[0];
        assert!(bundle.served && bundle.included && bundle.watched);
    }

    #[test]
    fn inserts_before_first_preprocessed_file() {
        let mut config = config(
            &["vendor/external.js", "foo/*Spec.js"],
            &[("foo/*Spec.js", "browserify")],
        );
        add_bundle_file(&mut config, Path::new(LOCATION));

        assert_eq!(patterns(&config), vec!["vendor/external.js", LOCATION, "foo/*Spec.js"]);
    }

    #[test]
    fn inserts_before_more_specific_pattern() {
        let mut config = config(
            &["vendor/external.js", "foo/*Spec.js"],
            &[("foo/*.js", "browserify")],
        );
        add_bundle_file(&mut config, Path::new(LOCATION));

        assert_eq!(patterns(&config), vec!["vendor/external.js", LOCATION, "foo/*Spec.js"]);
    }

    #[test]
    fn ignores_less_specific_pattern() {
        let mut config = config(
            &["vendor/external.js", "foo/*.js"],
            &[("foo/*Spec.js", "browserify")],
        );
        add_bundle_file(&mut config, Path::new(LOCATION));

        assert_eq!(config.files[0].pattern, LOCATION);
    }

    #[test]
    fn ignores_other_preprocessors() {
        let mut config = config(&["vendor/external.js", "foo/a.js"], &[("foo/*.js", "coverage")]);
        add_bundle_file(&mut config, Path::new(LOCATION));

        assert_eq!(config.files[0].pattern, LOCATION);
    }

    #[test]
    fn declares_bundle_preprocessor() {
        let mut config = config(&[], &[]);
        add_bundle_file(&mut config, Path::new(LOCATION));
        add_bundle_file(&mut config, Path::new(LOCATION));

        assert_eq!(
            config.preprocessors.get("/tmp/*.browserify.js"),
            Some(&vec![BUNDLE_PREPROCESSOR.to_string()])
        );
    }

    #[tokio::test]
    async fn register_resets_and_exit_removes_bundle_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = BundleFile::at(dir.path().join("x.browserify.js"));
        file.update("stale bundle from an earlier run").unwrap();
        let lifecycle = Lifecycle::new();
        let mut config = HostConfig {
            base_path: dir.path().to_path_buf(),
            ..Default::default()
        };

        let session = Framework::new()
            .with_bundle_file(file.clone())
            .register(&lifecycle, &mut config)
            .unwrap();

        assert_eq!(file.read().unwrap(), "");
        assert_eq!(session.bundle_file().location(), file.location());
        assert_eq!(config.files[0].pattern, file.location().to_string_lossy());
        assert_eq!(session.artifacts().phase(), crate::artifact::BundlePhase::AwaitingFirstBuild);

        lifecycle.exit().await;
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn register_fails_on_unknown_transform() {
        let dir = tempfile::tempdir().unwrap();
        let lifecycle = Lifecycle::new();
        let mut config = HostConfig::default();
        config.browserify.transform = vec![crate::config::PluginSpec::Name("nope".to_string())];

        let result = Framework::new()
            .with_bundle_file(BundleFile::at(dir.path().join("x.browserify.js")))
            .register(&lifecycle, &mut config);

        assert!(matches!(result, Err(FrameworkError::Build(_))));
    }

    #[tokio::test]
    async fn file_changes_ignored_without_auto_watch() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.js");
        std::fs::write(&a, "module.exports = 1;\n").unwrap();
        let lifecycle = Lifecycle::new();
        let mut config = HostConfig {
            base_path: dir.path().to_path_buf(),
            ..Default::default()
        };

        let session = Framework::new()
            .with_bundle_file(BundleFile::at(dir.path().join("x.browserify.js")))
            .register(&lifecycle, &mut config)
            .unwrap();
        session.add_file(&a).await;

        assert!(session.watched().contains(&a));
        assert!(!session.file_changed(&a));
        lifecycle.exit().await;
    }

    #[tokio::test]
    async fn exit_hooks_run_in_order_once() {
        let lifecycle = Lifecycle::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            lifecycle.on_exit(move || async move {
                order.lock().push(i);
            });
        }

        lifecycle.exit().await;
        lifecycle.exit().await;
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
