// Native CommonJS bundler - packs entry files and their relative requires

use super::{module_id, normalize_path, BundleOutput, Bundler};
use crate::config::{BundleOptions, PluginSpec};
use crate::error::BuildError;
use crate::source_map;
use async_trait::async_trait;
use oxc_allocator::Allocator;
use oxc_ast::ast::CallExpression;
use oxc_ast_visit::{walk, Visit};
use oxc_parser::Parser;
use oxc_span::SourceType;
use regex::Regex;
use serde_json::Value;
use sourcemap::SourceMapBuilder;
use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// Extensions tried when a `require` specifier has none
const DEFAULT_EXTENSIONS: &[&str] = &[".js", ".json"];

/// A source transform applied to every bundled file before validation
pub trait Transform: Send + Sync {
    fn apply(&self, path: &Path, source: String, options: &Value) -> Result<String, BuildError>;
}

impl<F> Transform for F
where
    F: Fn(&Path, String, &Value) -> Result<String, BuildError> + Send + Sync,
{
    fn apply(&self, path: &Path, source: String, options: &Value) -> Result<String, BuildError> {
        self(path, source, options)
    }
}

/// A plugin that customizes the native bundler when applied
pub trait BundlerPlugin: Send + Sync {
    fn apply(&self, bundler: &mut NativeBundler, options: &Value) -> Result<(), BuildError>;
}

impl<F> BundlerPlugin for F
where
    F: Fn(&mut NativeBundler, &Value) -> Result<(), BuildError> + Send + Sync,
{
    fn apply(&self, bundler: &mut NativeBundler, options: &Value) -> Result<(), BuildError> {
        self(bundler, options)
    }
}

/// Replaces `process.env.NAME` with a string literal, taking values from the
/// transform options first and the process environment second
struct EnvTransform;

impl Transform for EnvTransform {
    fn apply(&self, _path: &Path, source: String, options: &Value) -> Result<String, BuildError> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(r"\bprocess\.env\.([A-Za-z_$][A-Za-z0-9_$]*)").expect("Invalid regex")
        });

        let replaced = re.replace_all(&source, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            let value = match options.get(name) {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Null) | None => std::env::var(name).ok(),
                Some(other) => Some(other.to_string()),
            };
            match value {
                Some(value) => Value::String(value).to_string(),
                None => caps[0].to_string(),
            }
        });

        Ok(replaced.into_owned())
    }
}

struct Module {
    id: String,
    source: String,
    deps: BTreeMap<String, String>,
}

/// In-process CommonJS bundler
///
/// Entries and everything they reach through relative `require` calls are
/// wrapped into a single script that assigns a module loader to the
/// configured global require name. Module ids are paths relative to the base
/// directory. Bare specifiers and builtins are left for the runtime.
pub struct NativeBundler {
    basedir: PathBuf,
    extensions: Vec<String>,
    builtins: HashSet<String>,
    require_name: String,
    debug: bool,
    entries: Vec<PathBuf>,
    transforms: Vec<(Arc<dyn Transform>, Value)>,
    known_transforms: HashMap<String, Arc<dyn Transform>>,
    known_plugins: HashMap<String, Arc<dyn BundlerPlugin>>,
    touched: Vec<PathBuf>,
}

impl NativeBundler {
    pub fn new(options: &BundleOptions, basedir: &Path) -> Self {
        let mut extensions: Vec<String> = DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect();
        for ext in &options.extensions {
            let ext = if ext.starts_with('.') {
                ext.clone()
            } else {
                format!(".{}", ext)
            };
            if !extensions.contains(&ext) {
                extensions.push(ext);
            }
        }

        let mut known_transforms: HashMap<String, Arc<dyn Transform>> = HashMap::new();
        known_transforms.insert("envify".to_string(), Arc::new(EnvTransform));

        Self {
            basedir: options.basedir_or(basedir),
            extensions,
            builtins: options.builtins.iter().cloned().collect(),
            require_name: options.require_name().to_string(),
            debug: options.debug,
            entries: Vec::new(),
            transforms: Vec::new(),
            known_transforms,
            known_plugins: HashMap::new(),
            touched: Vec::new(),
        }
    }

    /// Make a transform available to `transform` specs under `name`
    pub fn register_transform(&mut self, name: impl Into<String>, transform: Arc<dyn Transform>) {
        self.known_transforms.insert(name.into(), transform);
    }

    /// Make a plugin available to `plugin` specs under `name`
    pub fn register_plugin(&mut self, name: impl Into<String>, plugin: Arc<dyn BundlerPlugin>) {
        self.known_plugins.insert(name.into(), plugin);
    }

    /// Apply a transform directly, without going through a named spec
    pub fn add_transform(&mut self, transform: Arc<dyn Transform>, options: Value) {
        self.transforms.push((transform, options));
    }

    pub fn add_builtin(&mut self, name: impl Into<String>) {
        self.builtins.insert(name.into());
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    pub fn entries(&self) -> &[PathBuf] {
        &self.entries
    }

    /// Read, transform and parse one file, returning its source and the
    /// specifiers it requires
    async fn load(&self, path: &Path, from: Option<&Path>) -> Result<(String, Vec<String>), BuildError> {
        let source = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                BuildError::MissingModule {
                    path: path.to_path_buf(),
                    from: from.map(Path::to_path_buf),
                }
            } else {
                BuildError::Other(format!("failed to read {}: {}", path.display(), e))
            }
        })?;

        let mut source = source;
        for (transform, options) in &self.transforms {
            source = transform.apply(path, source, options)?;
        }

        if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str::<Value>(&source).map_err(|e| BuildError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
            return Ok((format!("module.exports = {};", source.trim()), Vec::new()));
        }

        let specifiers = parse_requires(path, &source)?;
        Ok((source, specifiers))
    }

    /// Resolve a relative or absolute specifier from the directory of `from`
    fn resolve(&self, from: &Path, specifier: &str) -> Result<PathBuf, BuildError> {
        let dir = from.parent().unwrap_or_else(|| Path::new(""));
        let base = normalize_path(&dir.join(specifier));

        if base.is_file() {
            return Ok(base);
        }

        for ext in &self.extensions {
            let candidate = with_suffix(&base, ext);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        for ext in &self.extensions {
            let candidate = base.join(format!("index{}", ext));
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        Err(BuildError::MissingModule {
            path: base,
            from: Some(from.to_path_buf()),
        })
    }

    fn is_external(&self, specifier: &str) -> bool {
        let relative = specifier.starts_with("./")
            || specifier.starts_with("../")
            || specifier == "."
            || specifier == ".."
            || Path::new(specifier).is_absolute();
        !relative || self.builtins.contains(specifier)
    }

    fn render(&self, modules: &[Module]) -> Result<String, BuildError> {
        let mut out = String::new();
        let mut line: u32 = 0;
        let mut map = self.debug.then(|| SourceMapBuilder::new(None));

        push_chunk(&mut out, &mut line, &prelude(&self.require_name));

        for (idx, module) in modules.iter().enumerate() {
            let key = Value::String(module.id.clone()).to_string();
            push_chunk(&mut out, &mut line, &format!("{}: [function (require, module, exports) {{\n", key));

            if let Some(builder) = map.as_mut() {
                let src_id = builder.add_source(&module.id);
                builder.set_source_contents(src_id, Some(module.source.as_str()));
                for src_line in 0..module.source.lines().count() as u32 {
                    builder.add(
                        line + src_line,
                        0,
                        src_line,
                        0,
                        Some(module.id.as_str()),
                        None,
                        false,
                    );
                }
            }

            push_chunk(&mut out, &mut line, &module.source);
            if !module.source.ends_with('\n') {
                push_chunk(&mut out, &mut line, "\n");
            }

            let deps = serde_json::to_string(&module.deps)
                .map_err(|e| BuildError::Other(format!("failed to encode dependencies: {}", e)))?;
            let separator = if idx + 1 < modules.len() { "," } else { "" };
            push_chunk(&mut out, &mut line, &format!("}}, {}]{}\n", deps, separator));
        }

        push_chunk(&mut out, &mut line, "});\n");

        if let Some(builder) = map {
            let comment = source_map::inline_comment(&builder.into_sourcemap())
                .map_err(|e| BuildError::Other(format!("failed to write source map: {}", e)))?;
            out.push_str(&comment);
            out.push('\n');
        }

        Ok(out)
    }
}

#[async_trait]
impl Bundler for NativeBundler {
    fn name(&self) -> &str {
        "native"
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
        self.touched.clear();

        let mut modules: Vec<Module> = Vec::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut queue: VecDeque<(PathBuf, Option<PathBuf>)> =
            self.entries.iter().map(|e| (e.clone(), None)).collect();

        while let Some((path, from)) = queue.pop_front() {
            if !seen.insert(path.clone()) {
                continue;
            }
            self.touched.push(path.clone());

            let (source, specifiers) = self.load(&path, from.as_deref()).await?;

            let mut deps = BTreeMap::new();
            for specifier in specifiers {
                if self.is_external(&specifier) {
                    continue;
                }
                let resolved = self.resolve(&path, &specifier)?;
                deps.insert(specifier, module_id(&self.basedir, &resolved));
                queue.push_back((resolved, Some(path.clone())));
            }

            modules.push(Module {
                id: module_id(&self.basedir, &path),
                source,
                deps,
            });
        }

        let content = self.render(&modules)?;

        Ok(BundleOutput {
            content,
            inputs: self.touched.clone(),
        })
    }

    fn transform(&mut self, spec: &PluginSpec) -> Result<(), BuildError> {
        let transform = self
            .known_transforms
            .get(spec.name())
            .cloned()
            .ok_or_else(|| BuildError::Other(format!("unknown transform '{}'", spec.name())))?;
        self.transforms.push((transform, spec.options().clone()));
        Ok(())
    }

    fn plugin(&mut self, spec: &PluginSpec) -> Result<(), BuildError> {
        let plugin = self
            .known_plugins
            .get(spec.name())
            .cloned()
            .ok_or_else(|| BuildError::Other(format!("unknown plugin '{}'", spec.name())))?;
        plugin.apply(self, spec.options())
    }

    fn watched_files(&self) -> Vec<PathBuf> {
        self.touched.clone()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn prelude(require_name: &str) -> String {
    format!(
        r#"{name} = (function (defs) {{
  var cache = {{}};
  function load(id) {{
    if (cache[id]) return cache[id].exports;
    var def = defs[id];
    if (!def) {{
      var err = new Error("Cannot find module '" + id + "'");
      err.code = "MODULE_NOT_FOUND";
      throw err;
    }}
    var module = cache[id] = {{ exports: {{}} }};
    def[0].call(module.exports, function (spec) {{
      return load(def[1].hasOwnProperty(spec) ? def[1][spec] : spec);
    }}, module, module.exports);
    return module.exports;
  }}
  return load;
}})({{
"#,
        name = require_name
    )
}

fn push_chunk(out: &mut String, line: &mut u32, chunk: &str) {
    out.push_str(chunk);
    *line += chunk.matches('\n').count() as u32;
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Collects string literal arguments of `require(...)` calls
#[derive(Default)]
struct RequireCollector {
    specifiers: Vec<String>,
}

impl<'a> Visit<'a> for RequireCollector {
    fn visit_call_expression(&mut self, call: &CallExpression<'a>) {
        if let Some(specifier) = call.common_js_require() {
            self.specifiers.push(specifier.value.to_string());
        }
        walk::walk_call_expression(self, call);
    }
}

/// Bundled files run inside a function wrapper, so everything but explicit
/// ES modules is parsed as CommonJS
fn source_type(path: &Path) -> SourceType {
    match SourceType::from_path(path) {
        Ok(source_type) if source_type.is_module() => source_type,
        Ok(source_type) => source_type.with_commonjs(true),
        Err(_) => SourceType::cjs(),
    }
}

/// Parse `source` and return the `require` specifiers it contains, in order
/// of appearance
fn parse_requires(path: &Path, source: &str) -> Result<Vec<String>, BuildError> {
    let allocator = Allocator::default();

    let parse_result = Parser::new(&allocator, source, source_type(path)).parse();
    if !parse_result.errors.is_empty() {
        let errors: Vec<String> = parse_result.errors.iter().map(|e| e.to_string()).collect();
        return Err(BuildError::Parse {
            path: path.to_path_buf(),
            message: errors.join("\n"),
        });
    }

    let mut collector = RequireCollector::default();
    collector.visit_program(&parse_result.program);
    Ok(collector.specifiers)
}
