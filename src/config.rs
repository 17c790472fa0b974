// Configuration types for the bundling framework

use crate::bundler::Bundler;
use crate::error::{BuildError, ConfigError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default debounce window between a build request and the build itself
pub const DEFAULT_BUNDLE_DELAY_MS: u64 = 500;

/// Default global symbol the emitted stubs call
pub const DEFAULT_REQUIRE_NAME: &str = "require";

/// Test runner configuration, as seen by the framework registration hook
///
/// The hook mutates `files` and `preprocessors` in place so the runner serves
/// the bundle artifact alongside the test files.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    /// Base directory test file paths are reported relative to
    #[serde(default, alias = "base_path")]
    pub base_path: PathBuf,

    /// Ordered list of file patterns the runner serves
    #[serde(default)]
    pub files: Vec<FilePattern>,

    /// Glob pattern -> preprocessor names
    #[serde(default)]
    pub preprocessors: BTreeMap<String, Vec<String>>,

    /// Rebuild the bundle whenever a bundled file changes
    #[serde(default, alias = "auto_watch")]
    pub auto_watch: bool,

    /// Options for the bundler and the bundling engine
    #[serde(default)]
    pub browserify: BundleOptions,
}

impl HostConfig {
    /// Load a configuration file, TOML or JSON depending on the extension
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content).map_err(|e| ConfigError::Json {
                path: path.to_path_buf(),
                error: e.to_string(),
            }),
            _ => Self::from_toml_str(&content).map_err(|e| match e {
                ConfigError::Toml { error, .. } => ConfigError::Toml {
                    path: path.to_path_buf(),
                    error,
                },
                other => other,
            }),
        }
    }

    /// Parse a TOML configuration from a string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Toml {
            path: "<string>".into(),
            error: e.to_string(),
        })
    }
}

/// A single entry of the runner's file list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePattern {
    pub pattern: String,
    #[serde(default = "default_true")]
    pub served: bool,
    #[serde(default = "default_true")]
    pub included: bool,
    #[serde(default = "default_true")]
    pub watched: bool,
}

fn default_true() -> bool {
    true
}

impl FilePattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            served: true,
            included: true,
            watched: true,
        }
    }
}

/// A transform or plugin reference: a bare name, or `[name, options]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PluginSpec {
    Name(String),
    WithOptions(String, Value),
}

impl PluginSpec {
    pub fn name(&self) -> &str {
        match self {
            PluginSpec::Name(name) | PluginSpec::WithOptions(name, _) => name,
        }
    }

    /// Options passed along with the spec, `Value::Null` for bare names
    pub fn options(&self) -> &Value {
        static NULL: Value = Value::Null;
        match self {
            PluginSpec::Name(_) => &NULL,
            PluginSpec::WithOptions(_, options) => options,
        }
    }
}

/// Which bundler implementation drives the build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process CommonJS packer
    #[default]
    Native,
    /// esbuild CLI
    Esbuild,
}

/// Hook invoked once with the raw bundler before first use
#[derive(Clone)]
pub struct ConfigureHook(Arc<dyn Fn(&mut dyn Bundler) -> Result<(), BuildError> + Send + Sync>);

impl ConfigureHook {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut dyn Bundler) -> Result<(), BuildError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, bundler: &mut dyn Bundler) -> Result<(), BuildError> {
        (self.0)(bundler)
    }
}

impl fmt::Debug for ConfigureHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConfigureHook(..)")
    }
}

/// Bundler options (the `browserify` section of the runner configuration)
///
/// `extensions`, `builtins` and `basedir` are handed to the bundler as-is.
/// `commondir` and `resolve` are accepted for compatibility with existing
/// configurations; no backend reads them, see [`BundleOptions::ignored_options`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BundleOptions {
    /// Extra file extensions tried when resolving `require` specifiers
    pub extensions: Vec<String>,

    /// Module names left for the runtime to provide
    pub builtins: Vec<String>,

    /// Directory module ids are computed relative to (defaults to the runner's base path)
    pub basedir: Option<PathBuf>,

    /// Whether ids are relative to the common directory of all entries.
    /// Ids are always relative to `basedir`, so only `false` is honored.
    pub commondir: Option<bool>,

    /// Opaque resolver options (not interpreted)
    pub resolve: Value,

    /// Source transforms, applied in order
    pub transform: Vec<PluginSpec>,

    /// Bundler plugins, applied in order
    pub plugin: Vec<PluginSpec>,

    /// Emit and extract inline source maps
    pub debug: bool,

    /// Global symbol name used in emitted stubs
    #[serde(alias = "external_require_name")]
    pub external_require_name: String,

    /// Debounce window for coalesced builds, in milliseconds
    #[serde(alias = "bundle_delay_ms", alias = "bundleDelay")]
    pub bundle_delay_ms: u64,

    /// Bundler implementation
    pub backend: BackendKind,

    /// Low-level customization hook (`prebundle` is accepted as an alias via
    /// [`BundleOptions::with_prebundle`])
    #[serde(skip)]
    pub configure: Option<ConfigureHook>,
}

impl Default for BundleOptions {
    fn default() -> Self {
        Self {
            extensions: vec![],
            builtins: vec![],
            basedir: None,
            commondir: None,
            resolve: Value::Null,
            transform: vec![],
            plugin: vec![],
            debug: false,
            external_require_name: DEFAULT_REQUIRE_NAME.to_string(),
            bundle_delay_ms: DEFAULT_BUNDLE_DELAY_MS,
            backend: BackendKind::default(),
            configure: None,
        }
    }
}

impl BundleOptions {
    pub fn bundle_delay(&self) -> Duration {
        Duration::from_millis(self.bundle_delay_ms)
    }

    /// The require name, falling back to the default when configured empty
    pub fn require_name(&self) -> &str {
        if self.external_require_name.is_empty() {
            DEFAULT_REQUIRE_NAME
        } else {
            &self.external_require_name
        }
    }

    /// Names of options that are set but have no effect on any backend
    ///
    /// Stubs name modules relative to `basedir`, so ids relative to the
    /// common directory of the entries would never match them.
    pub fn ignored_options(&self) -> Vec<&'static str> {
        let mut ignored = Vec::new();
        if self.commondir == Some(true) {
            ignored.push("commondir");
        }
        if !self.resolve.is_null() {
            ignored.push("resolve");
        }
        ignored
    }

    /// Resolve the directory module ids are relative to
    pub fn basedir_or(&self, base_path: &Path) -> PathBuf {
        self.basedir
            .clone()
            .unwrap_or_else(|| base_path.to_path_buf())
    }

    pub fn with_configure<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut dyn Bundler) -> Result<(), BuildError> + Send + Sync + 'static,
    {
        self.configure = Some(ConfigureHook::new(f));
        self
    }

    pub fn with_prebundle<F>(self, f: F) -> Self
    where
        F: Fn(&mut dyn Bundler) -> Result<(), BuildError> + Send + Sync + 'static,
    {
        self.with_configure(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST_CONFIG: &str = r#"
basePath = "/project"
autoWatch = true

[[files]]
pattern = "vendor/external.js"

[[files]]
pattern = "test/*Spec.js"
watched = false

[preprocessors]
"test/*Spec.js" = ["browserify"]

[browserify]
debug = true
extensions = [".coffee"]
externalRequireName = "app_require"
transform = ["uppercase", ["replace", { from = "a", to = "b" }]]
"#;

    #[test]
    fn default_bundle_options() {
        let options = BundleOptions::default();
        assert_eq!(options.bundle_delay(), Duration::from_millis(500));
        assert_eq!(options.require_name(), "require");
        assert_eq!(options.backend, BackendKind::Native);
        assert!(!options.debug);
        assert!(options.configure.is_none());
    }

    #[test]
    fn parse_host_config() {
        let config = HostConfig::from_toml_str(HOST_CONFIG).expect("valid config");

        assert_eq!(config.base_path, PathBuf::from("/project"));
        assert!(config.auto_watch);
        assert_eq!(config.files.len(), 2);
        assert!(config.files[0].served && config.files[0].included);
        assert!(!config.files[1].watched);
        assert_eq!(config.preprocessors["test/*Spec.js"], vec!["browserify"]);

        let options = &config.browserify;
        assert!(options.debug);
        assert_eq!(options.require_name(), "app_require");
        assert_eq!(options.extensions, vec![".coffee".to_string()]);
        assert_eq!(options.bundle_delay_ms, DEFAULT_BUNDLE_DELAY_MS);
    }

    #[test]
    fn plugin_spec_shapes() {
        let config = HostConfig::from_toml_str(HOST_CONFIG).unwrap();
        let transforms = &config.browserify.transform;

        assert_eq!(transforms[0], PluginSpec::Name("uppercase".to_string()));
        assert!(transforms[0].options().is_null());

        assert_eq!(transforms[1].name(), "replace");
        assert_eq!(transforms[1].options()["from"], "a");
    }

    #[test]
    fn parse_json_host_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.json");
        std::fs::write(
            &path,
            r#"{"basePath": "/p", "browserify": {"backend": "esbuild", "plugin": [["p", {"x": 1}]]}}"#,
        )
        .unwrap();

        let config = HostConfig::from_file(&path).unwrap();
        assert_eq!(config.browserify.backend, BackendKind::Esbuild);
        assert_eq!(config.browserify.plugin[0].options()["x"], 1);
        assert!(!config.auto_watch);
    }

    #[test]
    fn invalid_toml_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.toml");
        std::fs::write(&path, "[browserify\ndebug = ").unwrap();

        match HostConfig::from_file(&path) {
            Err(ConfigError::Toml { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected TOML error, got {:?}", other),
        }
    }

    #[test]
    fn empty_require_name_falls_back() {
        let options = BundleOptions {
            external_require_name: String::new(),
            ..Default::default()
        };
        assert_eq!(options.require_name(), "require");
    }

    #[test]
    fn basedir_defaults_to_base_path() {
        let options = BundleOptions::default();
        assert_eq!(
            options.basedir_or(Path::new("/base")),
            PathBuf::from("/base")
        );

        let options = BundleOptions {
            basedir: Some(PathBuf::from("/other")),
            ..Default::default()
        };
        assert_eq!(
            options.basedir_or(Path::new("/base")),
            PathBuf::from("/other")
        );
    }

    #[test]
    fn unsupported_options_are_reported() {
        assert!(BundleOptions::default().ignored_options().is_empty());

        let config = HostConfig::from_toml_str(
            "[browserify]\ncommondir = false\n",
        )
        .unwrap();
        assert!(config.browserify.ignored_options().is_empty());

        let config = HostConfig::from_toml_str(
            "[browserify]\ncommondir = true\n[browserify.resolve]\nmoduleDirectory = \"lib\"\n",
        )
        .unwrap();
        assert_eq!(config.browserify.ignored_options(), vec!["commondir", "resolve"]);
    }
}
