use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize logging to stderr, optionally teeing into a file.
///
/// `RUST_LOG` wins over the verbosity flag for anything it names.
pub fn init_logging(verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("sitescan={level}").parse()?)
        .add_directive("warn".parse()?);

    let file_layer = log_file
        .map(|path| {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create log directory {}", parent.display()))?;
            }
            let file = fs::File::create(&path)
                .context(format!("Failed to create log file {}", path.display()))?;
            Ok::<_, anyhow::Error>(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(file),
            )
        })
        .transpose()?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(())
}

/// Default log file location under the platform data directory.
pub fn default_log_file() -> PathBuf {
    directories::ProjectDirs::from("com", "sitescan", "sitescan")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./logs"))
        .join("sitescan.log")
}
