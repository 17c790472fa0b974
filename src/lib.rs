//! Incremental bundling engine for browser test runners.
//!
//! Test files handed to the runner are replaced by small require stubs while
//! the files themselves are packed into one bundle. Builds are debounced and
//! shared between every caller waiting on them, files that vanished are
//! dropped from the bundle automatically, and the latest good bundle is
//! persisted to a temp file the runner serves and watches.

pub mod artifact;
pub mod builder;
pub mod bundler;
pub mod cli;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod framework;
pub mod preprocess;
pub mod source_map;
#[cfg(feature = "watch")]
pub mod watch;
pub mod working_set;

pub use artifact::{ArtifactStore, Bundle, BundleFile, BundlePhase};
pub use builder::BundleBuilder;
pub use bundler::{BundleOutput, Bundler, NativeBundler};
pub use coalesce::Coalescer;
pub use config::{BackendKind, BundleOptions, FilePattern, HostConfig, PluginSpec};
pub use error::{BuildError, ConfigError, EsbuildError, FrameworkError};
pub use framework::{Framework, Lifecycle, Session, FRAMEWORK_NAME};
pub use preprocess::{
    format_stub, BundlePreprocessor, FileDescriptor, Preprocessor, TestFilePreprocessor,
    BUNDLE_PREPROCESSOR, TEST_FILE_PREPROCESSOR,
};
