// Preprocessors handed to the test runner: test-file stubs and the bundle itself

use crate::artifact::{ArtifactStore, Bundle, BundlePhase};
use crate::builder::BundleBuilder;
use crate::bundler::module_id;
use crate::coalesce::Coalescer;
use crate::error::BuildError;
use async_trait::async_trait;
use sourcemap::SourceMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Preprocessor name for test files
pub const TEST_FILE_PREPROCESSOR: &str = "browserify";

/// Preprocessor name for the persisted bundle file
pub const BUNDLE_PREPROCESSOR: &str = "browserify-bundle";

/// Coalesced bundle builds shared by both preprocessors
pub type BuildCoalescer = Coalescer<Bundle, BuildError>;

/// The runner's view of a file being preprocessed
#[derive(Debug, Clone, Default)]
pub struct FileDescriptor {
    pub path: PathBuf,
    /// Side channel for the bundle's source map (debug only)
    pub source_map: Option<Arc<SourceMap>>,
}

impl FileDescriptor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            source_map: None,
        }
    }
}

/// A file preprocessor registered with the test runner
#[async_trait]
pub trait Preprocessor: Send + Sync {
    fn name(&self) -> &str;

    /// Transform `content` of `file` into what the runner serves
    async fn process(&self, content: String, file: &mut FileDescriptor) -> Result<String, BuildError>;
}

/// Escape `value` for use inside a JavaScript string literal
pub fn escape_js_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c => out.push(c),
        }
    }
    out
}

/// Snippet that requires module `id` from the bundle at browser runtime
pub fn format_stub(require_name: &str, id: &str) -> String {
    format!(
        "typeof {name} === \"function\" && {name}(\"{id}\");",
        name = require_name,
        id = escape_js_string(id)
    )
}

/// Replaces each test file with a stub requiring it from the bundle
///
/// The file joins the working set and the stub is returned once the next
/// build completes. Build failures still produce the stub; the module then
/// fails to load in the browser.
pub struct TestFilePreprocessor {
    builder: Arc<tokio::sync::Mutex<BundleBuilder>>,
    coalescer: BuildCoalescer,
    basedir: PathBuf,
    require_name: String,
}

impl TestFilePreprocessor {
    pub fn new(
        builder: Arc<tokio::sync::Mutex<BundleBuilder>>,
        coalescer: BuildCoalescer,
        basedir: impl Into<PathBuf>,
        require_name: impl Into<String>,
    ) -> Self {
        Self {
            builder,
            coalescer,
            basedir: basedir.into(),
            require_name: require_name.into(),
        }
    }

    pub fn stub_for(&self, path: &Path) -> String {
        format_stub(&self.require_name, &module_id(&self.basedir, path))
    }
}

#[async_trait]
impl Preprocessor for TestFilePreprocessor {
    fn name(&self) -> &str {
        TEST_FILE_PREPROCESSOR
    }

    async fn process(&self, _content: String, file: &mut FileDescriptor) -> Result<String, BuildError> {
        let stub = self.stub_for(&file.path);

        self.builder.lock().await.add_file(&file.path);

        if let Err(err) = self.coalescer.request().await {
            tracing::debug!(path = %file.path.display(), error = %err, "emitting stub for failed build");
        }

        Ok(stub)
    }
}

/// Serves the bundle file
///
/// Until the first build completes the request waits for it and answers with
/// the built bundle. Afterwards the content on disk is passed through as is;
/// rebuilds reach the file through the watch path.
pub struct BundlePreprocessor {
    artifacts: ArtifactStore,
    coalescer: BuildCoalescer,
    debug: bool,
}

impl BundlePreprocessor {
    pub fn new(artifacts: ArtifactStore, coalescer: BuildCoalescer, debug: bool) -> Self {
        Self {
            artifacts,
            coalescer,
            debug,
        }
    }

    fn attach_source_map(&self, content: &str, file: &mut FileDescriptor) {
        if self.debug {
            file.source_map = crate::source_map::extract_inline(content).map(Arc::new);
        }
    }
}

#[async_trait]
impl Preprocessor for BundlePreprocessor {
    fn name(&self) -> &str {
        BUNDLE_PREPROCESSOR
    }

    async fn process(&self, content: String, file: &mut FileDescriptor) -> Result<String, BuildError> {
        if self.artifacts.phase() == BundlePhase::SteadyState {
            self.attach_source_map(&content, file);
            return Ok(content);
        }

        let bundle = self.coalescer.request().await?;
        self.attach_source_map(&bundle.content, file);
        self.artifacts.mark_built();

        Ok(bundle.content.to_string())
    }
}
