//! Comlink entry point.

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use comlink::cli::Cli;
use comlink::commands::{self, EXIT_STORAGE};

#[tokio::main]
async fn main() {
    // Model API keys usually live here
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level().to_string()));
    fmt().with_env_filter(filter).with_target(false).init();

    if let Err(e) = commands::execute(&cli).await {
        eprintln!("Error: {}", e);
        let code = if commands::is_storage_error(e.as_ref()) {
            EXIT_STORAGE
        } else {
            1
        };
        std::process::exit(code);
    }
}
