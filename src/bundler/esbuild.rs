// esbuild integration - bundles the working files through the esbuild CLI

use super::{normalize_path, BundleOutput, Bundler};
use crate::config::{BundleOptions, PluginSpec};
use crate::error::{BuildError, EsbuildError};
use async_trait::async_trait;
use serde::Deserialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use which::which;

const ENTRY_FILE: &str = "entry.js";
const OUTPUT_FILE: &str = "bundle.js";
const META_FILE: &str = "meta.json";

/// esbuild bundler configuration
#[derive(Debug, Clone)]
pub struct EsbuildConfig {
    /// ECMAScript target version
    pub target: String,

    /// Whether to minify the output
    pub minify: bool,

    /// Emit an inline source map
    pub sourcemap: bool,

    /// Extensions esbuild tries when resolving specifiers
    pub resolve_extensions: Vec<String>,

    /// Modules left for the runtime to provide
    pub external: Vec<String>,

    /// Additional esbuild arguments
    pub extra_args: Vec<String>,
}

impl Default for EsbuildConfig {
    fn default() -> Self {
        Self {
            target: "es2020".to_string(),
            minify: false,
            sourcemap: false,
            resolve_extensions: vec![],
            external: vec![],
            extra_args: vec![],
        }
    }
}

impl EsbuildConfig {
    pub fn from_options(options: &BundleOptions) -> Self {
        let resolve_extensions = if options.extensions.is_empty() {
            vec![]
        } else {
            let mut exts: Vec<String> = [".js", ".json"].iter().map(|e| e.to_string()).collect();
            for ext in &options.extensions {
                let ext = if ext.starts_with('.') {
                    ext.clone()
                } else {
                    format!(".{}", ext)
                };
                if !exts.contains(&ext) {
                    exts.push(ext);
                }
            }
            exts
        };

        Self {
            sourcemap: options.debug,
            resolve_extensions,
            external: options.builtins.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct Metafile {
    #[serde(default)]
    inputs: BTreeMap<String, serde_json::Value>,
}

/// esbuild bundler
///
/// Writes a generated entry that registers every working file under its
/// module id and exposes a loader as the global require name, then lets
/// esbuild bundle it.
pub struct EsbuildBundler {
    /// Path to the esbuild executable
    esbuild_path: PathBuf,

    /// Bundler configuration
    config: EsbuildConfig,

    basedir: PathBuf,
    require_name: String,
    entries: Vec<PathBuf>,
    touched: Vec<PathBuf>,

    /// Scratch directory for the generated entry, output and metafile
    work_dir: tempfile::TempDir,
}

impl EsbuildBundler {
    /// Create a new bundler by detecting esbuild
    ///
    /// # Errors
    ///
    /// Returns `EsbuildError::NotFound` if esbuild is not installed
    /// or not in PATH.
    pub fn new(options: &BundleOptions, basedir: &Path) -> Result<Self, EsbuildError> {
        let esbuild_path = which("esbuild").map_err(|_| EsbuildError::NotFound)?;
        Self::with_esbuild_path(esbuild_path, options, basedir)
    }

    /// Create a bundler with a specific esbuild path
    ///
    /// This is useful for testing or when esbuild is not in PATH.
    pub fn with_esbuild_path(
        esbuild_path: PathBuf,
        options: &BundleOptions,
        basedir: &Path,
    ) -> Result<Self, EsbuildError> {
        let work_dir = tempfile::TempDir::new()
            .map_err(|e| EsbuildError::Spawn(format!("Failed to create work directory: {}", e)))?;

        Ok(Self {
            esbuild_path,
            config: EsbuildConfig::from_options(options),
            basedir: options.basedir_or(basedir),
            require_name: options.require_name().to_string(),
            entries: Vec::new(),
            touched: Vec::new(),
            work_dir,
        })
    }

    /// Get a reference to the bundler configuration
    pub fn config(&self) -> &EsbuildConfig {
        &self.config
    }

    /// Set a new configuration
    pub fn set_config(&mut self, config: EsbuildConfig) {
        self.config = config;
    }

    fn entry_source(&self) -> String {
        let mut defs = String::new();
        for entry in &self.entries {
            let id = super::module_id(&self.basedir, entry);
            let path = entry.to_string_lossy().replace('\\', "/");
            defs.push_str(&format!(
                "  {}: function () {{ return require({}); }},\n",
                serde_json::Value::String(id),
                serde_json::Value::String(path)
            ));
        }

        format!(
            "var defs = {{\n{defs}}};\n\
             globalThis[{name}] = function (id) {{\n\
             \x20 var load = defs[id];\n\
             \x20 if (!load) {{\n\
             \x20   var err = new Error(\"Cannot find module '\" + id + \"'\");\n\
             \x20   err.code = \"MODULE_NOT_FOUND\";\n\
             \x20   throw err;\n\
             \x20 }}\n\
             \x20 return load();\n\
             }};\n",
            defs = defs,
            name = serde_json::Value::String(self.require_name.clone()),
        )
    }

    fn command(&self) -> Command {
        let work = self.work_dir.path();
        let mut cmd = Command::new(&self.esbuild_path);

        cmd.current_dir(&self.basedir);
        cmd.arg(work.join(ENTRY_FILE));
        cmd.arg("--bundle");
        cmd.arg(format!("--outfile={}", work.join(OUTPUT_FILE).display()));
        cmd.arg(format!("--metafile={}", work.join(META_FILE).display()));
        cmd.arg(format!("--target={}", self.config.target));
        cmd.arg("--format=iife");
        cmd.arg("--platform=browser");
        cmd.arg("--log-level=error");
        cmd.arg("--color=false");

        if self.config.minify {
            cmd.arg("--minify");
        }

        if self.config.sourcemap {
            cmd.arg("--sourcemap=inline");
        }

        if !self.config.resolve_extensions.is_empty() {
            cmd.arg(format!(
                "--resolve-extensions={}",
                self.config.resolve_extensions.join(",")
            ));
        }

        for ext in &self.config.external {
            cmd.arg(format!("--external:{}", ext));
        }

        for arg in &self.config.extra_args {
            cmd.arg(arg);
        }

        cmd
    }

    fn read_inputs(&self) -> Option<Vec<PathBuf>> {
        let json = std::fs::read(self.work_dir.path().join(META_FILE)).ok()?;
        let meta: Metafile = serde_json::from_slice(&json).ok()?;
        let entry = normalize_path(&self.work_dir.path().join(ENTRY_FILE));

        Some(
            meta.inputs
                .keys()
                .map(|p| normalize_path(&self.basedir.join(p)))
                .filter(|p| *p != entry)
                .collect(),
        )
    }

    /// Map esbuild's diagnostics to a build error
    fn classify(&self, stderr: &str) -> BuildError {
        let Some((message, location)) = first_error(stderr) else {
            return BuildError::Other(format!("esbuild failed: {}", stderr.trim()));
        };

        if let Some(specifier) = message
            .strip_prefix("Could not resolve \"")
            .and_then(|rest| rest.split('"').next())
        {
            let from = location.map(|file| normalize_path(&self.basedir.join(file)));
            let path = if Path::new(specifier).is_absolute() {
                normalize_path(Path::new(specifier))
            } else {
                let dir = from
                    .as_deref()
                    .and_then(Path::parent)
                    .unwrap_or(self.basedir.as_path());
                normalize_path(&dir.join(specifier))
            };
            let from = from.filter(|f| !f.starts_with(self.work_dir.path()));
            return BuildError::MissingModule { path, from };
        }

        match location {
            Some(file) => BuildError::Parse {
                path: normalize_path(&self.basedir.join(file)),
                message: message.to_string(),
            },
            None => BuildError::Other(message.to_string()),
        }
    }
}

/// First `[ERROR]` message and the file of the location line following it
fn first_error(stderr: &str) -> Option<(&str, Option<&str>)> {
    let mut lines = stderr.lines();
    let message = lines
        .by_ref()
        .find_map(|l| l.split_once("[ERROR] ").map(|(_, msg)| msg.trim()))?;

    let location = lines
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.strip_suffix(':'))
        .and_then(|l| {
            let mut parts = l.rsplitn(3, ':');
            let _col = parts.next()?.parse::<u32>().ok()?;
            let _line = parts.next()?.parse::<u32>().ok()?;
            parts.next()
        });

    Some((message, location))
}

#[async_trait]
impl Bundler for EsbuildBundler {
    fn name(&self) -> &str {
        "esbuild"
    }

    fn reset(&mut self) {
        self.entries.clear();
    }

    fn add(&mut self, path: &Path) {
        if !self.entries.iter().any(|e| e == path) {
            self.entries.push(path.to_path_buf());
        }
    }

    async fn bundle(&mut self) -> Result<BundleOutput, BuildError> {
        self.touched = self.entries.clone();

        // esbuild resolves entries lazily, so check them up front to report
        // the exact working path
        for entry in &self.entries {
            if !entry.exists() {
                return Err(BuildError::MissingModule {
                    path: entry.clone(),
                    from: None,
                });
            }
        }

        let work = self.work_dir.path();
        tokio::fs::write(work.join(ENTRY_FILE), self.entry_source())
            .await
            .map_err(|e| BuildError::Other(format!("Failed to write entry: {}", e)))?;
        let _ = tokio::fs::remove_file(work.join(META_FILE)).await;

        let output = self
            .command()
            .output()
            .await
            .map_err(|e| BuildError::Other(format!("Failed to execute esbuild: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.classify(&stderr));
        }

        if let Some(inputs) = self.read_inputs() {
            self.touched = inputs;
        }

        let content = tokio::fs::read_to_string(work.join(OUTPUT_FILE))
            .await
            .map_err(|e| BuildError::Other(format!("Failed to read esbuild output: {}", e)))?;

        Ok(BundleOutput {
            content,
            inputs: self.touched.clone(),
        })
    }

    fn transform(&mut self, spec: &PluginSpec) -> Result<(), BuildError> {
        Err(BuildError::Other(format!(
            "transform '{}' is not supported by the esbuild backend",
            spec.name()
        )))
    }

    fn plugin(&mut self, spec: &PluginSpec) -> Result<(), BuildError> {
        Err(BuildError::Other(format!(
            "plugin '{}' is not supported by the esbuild backend",
            spec.name()
        )))
    }

    fn watched_files(&self) -> Vec<PathBuf> {
        self.touched.clone()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundler(basedir: &Path) -> EsbuildBundler {
        EsbuildBundler::with_esbuild_path(
            PathBuf::from("/nonexistent/esbuild"),
            &BundleOptions::default(),
            basedir,
        )
        .unwrap()
    }

    #[test]
    fn esbuild_config_default() {
        let config = EsbuildConfig::default();
        assert_eq!(config.target, "es2020");
        assert!(!config.minify);
        assert!(config.external.is_empty());
        assert!(config.resolve_extensions.is_empty());
    }

    #[test]
    fn esbuild_config_from_options() {
        let options = BundleOptions {
            debug: true,
            extensions: vec!["ts".to_string()],
            builtins: vec!["fs".to_string()],
            ..Default::default()
        };
        let config = EsbuildConfig::from_options(&options);

        assert!(config.sourcemap);
        assert_eq!(config.resolve_extensions, vec![".js", ".json", ".ts"]);
        assert_eq!(config.external, vec!["fs"]);
    }

    #[test]
    fn entry_source_registers_module_ids() {
        let mut b = bundler(Path::new("/project"));
        b.add(Path::new("/project/test/b.js"));

        let source = b.entry_source();
        assert!(source.contains(r#""test/b.js": function () { return require("/project/test/b.js"); },"#));
        assert!(source.contains(r#"globalThis["require"] = function (id) {"#));
    }

    #[test]
    fn classify_missing_dependency() {
        let b = bundler(Path::new("/project"));
        let stderr = "✘ [ERROR] Could not resolve \"./a\"\n\n    test/b.js:1:8:\n      1 │ require(\"./a\");\n";

        match b.classify(stderr) {
            BuildError::MissingModule { path, from } => {
                assert_eq!(path, PathBuf::from("/project/test/a"));
                assert_eq!(from, Some(PathBuf::from("/project/test/b.js")));
            }
            other => panic!("expected missing module, got {:?}", other),
        }
    }

    #[test]
    fn classify_syntax_error() {
        let b = bundler(Path::new("/project"));
        let stderr = "✘ [ERROR] Unexpected \";\"\n\n    test/error.js:1:8:\n      1 │ var x = ;\n";

        assert_eq!(
            b.classify(stderr),
            BuildError::Parse {
                path: PathBuf::from("/project/test/error.js"),
                message: "Unexpected \";\"".to_string(),
            }
        );
    }

    #[test]
    fn classify_unknown_failure() {
        let b = bundler(Path::new("/project"));
        assert!(matches!(b.classify("segfault"), BuildError::Other(_)));
    }

    #[test]
    fn transforms_are_rejected() {
        let mut b = bundler(Path::new("/project"));
        assert!(b.transform(&PluginSpec::Name("envify".to_string())).is_err());
        assert!(b.plugin(&PluginSpec::Name("x".to_string())).is_err());
    }

    #[tokio::test]
    async fn missing_entry_reported_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = bundler(dir.path());
        let gone = dir.path().join("gone.js");
        b.add(&gone);

        let err = b.bundle().await.unwrap_err();
        assert_eq!(err.missing_path(), Some(gone.as_path()));
    }

    #[tokio::test]
    async fn esbuild_bundler_without_esbuild() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("test-input.js");
        std::fs::write(&input, "console.log('test');").unwrap();

        let mut b = bundler(dir.path());
        b.add(&input);

        let result = b.bundle().await;
        assert!(matches!(result, Err(BuildError::Other(_))));
    }
}
