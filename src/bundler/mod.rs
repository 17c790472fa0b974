// Bundler capability - the black box that turns entry files into one bundle

pub mod native;

#[cfg(feature = "esbuild")]
pub mod esbuild;

pub use native::{BundlerPlugin, NativeBundler, Transform};

#[cfg(feature = "esbuild")]
pub use esbuild::EsbuildBundler;

use crate::config::{BackendKind, BundleOptions, PluginSpec};
use crate::error::{BuildError, FrameworkError};
use async_trait::async_trait;
use std::any::Any;
use std::path::{Component, Path, PathBuf};

/// Result of a successful bundle call
#[derive(Debug, Clone, Default)]
pub struct BundleOutput {
    /// Bundled JavaScript
    pub content: String,

    /// Every file that ended up in the bundle
    pub inputs: Vec<PathBuf>,
}

/// A module bundler driven by the bundle builder
///
/// The builder resets the bundler, re-adds every working file and calls
/// [`Bundler::bundle`] once per build. Implementations classify failures into
/// [`BuildError`] variants; the builder relies on `MissingModule` carrying the
/// exact path that was added.
#[async_trait]
pub trait Bundler: Send + 'static {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Drop every entry added so far
    fn reset(&mut self);

    /// Add an entry file
    fn add(&mut self, path: &Path);

    /// Bundle the current entries
    async fn bundle(&mut self) -> Result<BundleOutput, BuildError>;

    /// Register a source transform
    fn transform(&mut self, spec: &PluginSpec) -> Result<(), BuildError>;

    /// Apply a bundler plugin
    fn plugin(&mut self, spec: &PluginSpec) -> Result<(), BuildError>;

    /// Files read by the last bundle call, including a failed one
    fn watched_files(&self) -> Vec<PathBuf>;

    /// Release resources held by the bundler
    async fn close(&mut self) {}

    /// Access the concrete bundler from a configure hook
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Create the bundler selected by `options`
pub fn create_bundler(
    options: &BundleOptions,
    basedir: &Path,
) -> Result<Box<dyn Bundler>, FrameworkError> {
    for option in options.ignored_options() {
        tracing::warn!(option, backend = ?options.backend, "bundler option is not supported and will be ignored");
    }

    match options.backend {
        BackendKind::Native => Ok(Box::new(NativeBundler::new(options, basedir))),
        #[cfg(feature = "esbuild")]
        BackendKind::Esbuild => Ok(Box::new(EsbuildBundler::new(options, basedir)?)),
        #[cfg(not(feature = "esbuild"))]
        BackendKind::Esbuild => Err(FrameworkError::Build(BuildError::Other(
            "esbuild backend requires the `esbuild` feature".to_string(),
        ))),
    }
}

/// Apply configured plugins, then transforms, then the configure hook
pub fn prepare_bundler(
    bundler: &mut dyn Bundler,
    options: &BundleOptions,
) -> Result<(), BuildError> {
    for spec in &options.plugin {
        tracing::debug!(plugin = spec.name(), "applying plugin");
        bundler.plugin(spec)?;
    }

    for spec in &options.transform {
        tracing::debug!(transform = spec.name(), "registering transform");
        bundler.transform(spec)?;
    }

    if let Some(hook) = &options.configure {
        tracing::debug!(bundler = bundler.name(), "running configure hook");
        hook.call(bundler)?;
    }

    Ok(())
}

/// Lexically normalize `.` and `..` components
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Module identifier of `path`: relative to `base`, forward slashes
pub fn module_id(base: &Path, path: &Path) -> String {
    let base = normalize_path(base);
    let path = normalize_path(path);

    let base_parts: Vec<_> = base.components().collect();
    let path_parts: Vec<_> = path.components().collect();

    // Nothing in common with an absolute base (different root or drive)
    if base.is_absolute() != path.is_absolute()
        || (base.is_absolute() && base_parts.first() != path_parts.first())
    {
        return path.to_string_lossy().replace('\\', "/");
    }

    let common = base_parts
        .iter()
        .zip(path_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut segments: Vec<String> = Vec::new();
    for _ in common..base_parts.len() {
        segments.push("..".to_string());
    }
    for part in &path_parts[common..] {
        segments.push(part.as_os_str().to_string_lossy().into_owned());
    }

    segments.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigureHook;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn normalize_removes_dot_segments() {
        assert_eq!(
            normalize_path(Path::new("/src/test/../lib/./a.js")),
            PathBuf::from("/src/lib/a.js")
        );
        assert_eq!(normalize_path(Path::new("../a.js")), PathBuf::from("../a.js"));
    }

    #[test]
    fn module_id_relative_to_base() {
        assert_eq!(module_id(Path::new("/project"), Path::new("/project/test/b.js")), "test/b.js");
        assert_eq!(module_id(Path::new("/project/test"), Path::new("/project/lib/a.js")), "../lib/a.js");
        assert_eq!(module_id(Path::new("/project"), Path::new("/project/b.js")), "b.js");
    }

    #[test]
    fn module_id_with_empty_base_keeps_relative_paths() {
        assert_eq!(module_id(Path::new(""), Path::new("test/b.js")), "test/b.js");
    }

    #[test]
    fn create_native_bundler_by_default() {
        let bundler = create_bundler(&BundleOptions::default(), Path::new("/project")).unwrap();
        assert_eq!(bundler.name(), "native");
    }

    #[test]
    fn prepare_runs_configure_hook_once() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        let options = BundleOptions {
            configure: Some(ConfigureHook::new(move |bundler| {
                assert!(bundler.as_any_mut().downcast_mut::<NativeBundler>().is_some());
                assert!(!flag.swap(true, Ordering::SeqCst));
                Ok(())
            })),
            ..Default::default()
        };

        let mut bundler = NativeBundler::new(&options, Path::new("/project"));
        prepare_bundler(&mut bundler, &options).unwrap();
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn prepare_rejects_unknown_transform() {
        let options = BundleOptions {
            transform: vec![PluginSpec::Name("does-not-exist".to_string())],
            ..Default::default()
        };

        let mut bundler = NativeBundler::new(&options, Path::new("/project"));
        let err = prepare_bundler(&mut bundler, &options).unwrap_err();
        assert!(err.to_string().contains("does-not-exist"));
    }
}
