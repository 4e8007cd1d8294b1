pub mod commands;
pub mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to a file
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Also write logs to the default log file
    #[arg(long, global = true, conflicts_with = "log_file")]
    log_to_file: bool,
}

impl Cli {
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        if self.log_to_file {
            Some(crate::utils::logging::default_log_file())
        } else {
            self.log_file.clone()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a crawl and wait for it to finish
    Crawl {
        /// URL to start crawling from
        #[arg(required = true)]
        url: String,

        /// Configuration profile to use
        #[arg(short, long)]
        profile: Option<String>,

        /// Maximum crawl depth
        #[arg(short, long)]
        depth: Option<u32>,

        /// Maximum number of pages to analyze
        #[arg(short, long)]
        limit: Option<u32>,

        /// Number of concurrent workers
        #[arg(short, long)]
        concurrent: Option<usize>,

        /// Crawl scope (single-page, subfolder, whole-domain)
        #[arg(short, long)]
        scope: Option<String>,
    },

    /// Check the status of a job
    Status {
        /// Job ID to check
        #[arg(required = true)]
        job_id: String,
    },

    /// Print the result of a completed job
    Result {
        /// Job ID to fetch
        #[arg(required = true)]
        job_id: String,
    },

    /// Cancel a waiting or running job
    Cancel {
        /// Job ID to cancel
        #[arg(required = true)]
        job_id: String,
    },

    /// Re-run a failed job with its original configuration
    Retry {
        /// Job ID to retry
        #[arg(required = true)]
        job_id: String,
    },

    /// Show aggregate job counters
    Metrics,

    /// Manage configuration profiles
    Config {
        /// Profile name to manage
        #[arg(required = false)]
        profile: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Crawl {
            url,
            profile,
            depth,
            limit,
            concurrent,
            scope,
        } => {
            info!("Starting crawl on {}", url);
            commands::crawl(url, profile, depth, limit, concurrent, scope).await
        }
        Commands::Status { job_id } => commands::status(job_id).await,
        Commands::Result { job_id } => commands::result(job_id).await,
        Commands::Cancel { job_id } => commands::cancel(job_id).await,
        Commands::Retry { job_id } => commands::retry(job_id).await,
        Commands::Metrics => commands::metrics().await,
        Commands::Config { profile, list } => {
            if list {
                commands::list_profiles().await
            } else if let Some(profile_name) = profile {
                commands::manage_profile(profile_name).await
            } else {
                commands::show_config().await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }
}
