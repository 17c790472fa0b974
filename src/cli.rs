// CLI commands for one-off bundles, stubs and watch mode

use crate::artifact::{ArtifactStore, BundleFile};
use crate::builder::BundleBuilder;
use crate::bundler::{create_bundler, module_id, prepare_bundler};
use crate::config::HostConfig;
use crate::framework::{Framework, Lifecycle};
use crate::preprocess::format_stub;
use anyhow::{Context, Result};
use clap::Subcommand;
use std::path::{Path, PathBuf};

/// Bundling subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bundle the given files once
    Bundle {
        /// Entry files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Runner configuration (TOML or JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output file (default: stdout)
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Embed an inline source map
        #[arg(long)]
        debug: bool,
    },

    /// Print the require stub for a test file
    Stub {
        /// Test file
        file: PathBuf,

        /// Directory module ids are relative to (default: current directory)
        #[arg(short, long)]
        base: Option<PathBuf>,

        /// Global require function name
        #[arg(long, default_value = "require")]
        require_name: String,
    },

    /// Bundle the given files and rebuild whenever one of them changes
    Watch {
        /// Entry files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Runner configuration (TOML or JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

impl Commands {
    /// Execute the command
    pub async fn run(self) -> Result<()> {
        match self {
            Commands::Bundle {
                files,
                config,
                out,
                debug,
            } => Self::bundle_cmd(files, config, out, debug).await,
            Commands::Stub {
                file,
                base,
                require_name,
            } => Self::stub_cmd(file, base, require_name),
            Commands::Watch { files, config } => Self::watch_cmd(files, config).await,
        }
    }

    async fn bundle_cmd(
        files: Vec<PathBuf>,
        config: Option<PathBuf>,
        out: Option<PathBuf>,
        debug: bool,
    ) -> Result<()> {
        let config = load_config(config.as_deref())?;
        let mut options = config.browserify.clone();
        options.debug |= debug;

        let basedir = options.basedir_or(&config.base_path);
        let mut bundler = create_bundler(&options, &basedir)?;
        prepare_bundler(bundler.as_mut(), &options)?;

        let mut builder = BundleBuilder::new(bundler, ArtifactStore::new()).with_debug(options.debug);
        for file in files {
            builder.add_file(absolute(&file)?);
        }

        let bundle = builder.build().await?;
        builder.close().await;

        match out {
            Some(path) => {
                std::fs::write(&path, bundle.content.as_bytes())
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("✓ Bundle written to {} ({} bytes)", path.display(), bundle.len());
            }
            None => print!("{}", bundle.content),
        }

        Ok(())
    }

    fn stub_cmd(file: PathBuf, base: Option<PathBuf>, require_name: String) -> Result<()> {
        let base = match base {
            Some(base) => absolute(&base)?,
            None => std::env::current_dir()?,
        };
        let id = module_id(&base, &absolute(&file)?);
        println!("{}", format_stub(&require_name, &id));
        Ok(())
    }

    async fn watch_cmd(files: Vec<PathBuf>, config: Option<PathBuf>) -> Result<()> {
        let mut config = load_config(config.as_deref())?;
        config.auto_watch = true;

        let lifecycle = Lifecycle::new();
        let session = Framework::new()
            .with_bundle_file(BundleFile::new()?)
            .register(&lifecycle, &mut config)?;

        for file in files {
            session.add_file(absolute(&file)?).await;
        }

        match session.rebuild().await {
            Ok(bundle) => println!(
                "✓ Bundle written to {} ({} bytes)",
                session.bundle_file().location().display(),
                bundle.len()
            ),
            Err(e) => eprintln!("✗ {}", e),
        }

        println!("Watching for changes, press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;

        lifecycle.exit().await;
        Ok(())
    }
}

fn load_config(path: Option<&Path>) -> Result<HostConfig> {
    let mut config = match path {
        Some(path) => HostConfig::from_file(path)?,
        None => HostConfig::default(),
    };

    if config.base_path.as_os_str().is_empty() {
        config.base_path = std::env::current_dir()?;
    } else if config.base_path.is_relative() {
        let dir = path
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        config.base_path = absolute(&dir.join(&config.base_path))?;
    }

    Ok(config)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("Invalid path {}", path.display()))
}
