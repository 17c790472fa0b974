// Error types for bundle builds and framework registration

use crate::coalesce::BuildCancelled;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failure of a single bundle build
///
/// Builds fan their result out to every waiting caller, so this type is
/// `Clone` and carries only owned strings and paths.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    /// Malformed source in one of the bundled files
    #[error("Parse error in {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    /// A file referenced by the bundle can no longer be resolved
    #[error("Cannot find module '{}'{}", path.display(), from_suffix(from))]
    MissingModule {
        path: PathBuf,
        from: Option<PathBuf>,
    },

    /// Any other bundler failure
    #[error("Bundle failed: {0}")]
    Other(String),
}

fn from_suffix(from: &Option<PathBuf>) -> String {
    match from {
        Some(from) => format!(" from '{}'", from.display()),
        None => String::new(),
    }
}

impl BuildError {
    /// The unresolvable path of a `MissingModule` error
    pub fn missing_path(&self) -> Option<&Path> {
        match self {
            BuildError::MissingModule { path, .. } => Some(path),
            _ => None,
        }
    }

    pub fn is_parse(&self) -> bool {
        matches!(self, BuildError::Parse { .. })
    }
}

impl From<BuildCancelled> for BuildError {
    fn from(_: BuildCancelled) -> Self {
        BuildError::Other("build cancelled".to_string())
    }
}

/// Errors locating or launching the esbuild executable
#[derive(Debug, Error)]
pub enum EsbuildError {
    #[error(
        "esbuild not found. Install it with: npm install -g esbuild\n\
         esbuild is required for the esbuild bundler backend."
    )]
    NotFound,

    #[error("Failed to execute esbuild: {0}")]
    Spawn(String),
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("TOML parsing error in {path}: {error}")]
    Toml { path: PathBuf, error: String },

    #[error("JSON parsing error in {path}: {error}")]
    Json { path: PathBuf, error: String },
}

/// Errors raised while registering the framework with a test runner session
#[derive(Debug, Error)]
pub enum FrameworkError {
    #[error("Bundle file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bundler setup failed: {0}")]
    Build(#[from] BuildError),

    #[error("{0}")]
    Esbuild(#[from] EsbuildError),

    #[error("File watcher error: {0}")]
    Watch(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        assert_eq!(
            BuildError::MissingModule {
                path: PathBuf::from("/src/a.js"),
                from: None,
            }
            .to_string(),
            "Cannot find module '/src/a.js'"
        );

        assert_eq!(
            BuildError::MissingModule {
                path: PathBuf::from("/src/dep.js"),
                from: Some(PathBuf::from("/src/b.js")),
            }
            .to_string(),
            "Cannot find module '/src/dep.js' from '/src/b.js'"
        );

        assert_eq!(
            BuildError::Other("boom".to_string()).to_string(),
            "Bundle failed: boom"
        );

        assert!(EsbuildError::NotFound
            .to_string()
            .contains("npm install -g esbuild"));
    }

    #[test]
    fn missing_path_only_for_missing_module() {
        let missing = BuildError::MissingModule {
            path: PathBuf::from("/src/gone.js"),
            from: None,
        };
        assert_eq!(missing.missing_path(), Some(Path::new("/src/gone.js")));

        let parse = BuildError::Parse {
            path: PathBuf::from("/src/error.js"),
            message: "Unexpected token".to_string(),
        };
        assert_eq!(parse.missing_path(), None);
        assert!(parse.is_parse());
    }

    #[test]
    fn from_conversions_work() {
        let err: FrameworkError = BuildError::Other("x".to_string()).into();
        assert!(matches!(err, FrameworkError::Build(_)));

        let err: FrameworkError = EsbuildError::NotFound.into();
        assert!(matches!(err, FrameworkError::Esbuild(_)));

        let err: FrameworkError = std::io::Error::other("disk").into();
        assert!(matches!(err, FrameworkError::Io(_)));
    }
}
