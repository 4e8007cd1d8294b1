use anyhow::Result;
use tracing::{error, info};

use sitescan::cli;
use sitescan::utils::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args();

    logging::init_logging(args.verbose(), args.log_file())?;

    info!("Starting sitescan v{}", env!("CARGO_PKG_VERSION"));

    match cli::process_command(args).await {
        Ok(_) => Ok(()),
        Err(e) => {
            error!("Command failed: {}", e);
            Err(e)
        }
    }
}
