//
// main.rs
// Study-Anonymizer-rs
//
// Tokio entry point that installs logging and hands off execution to the CLI layer.
//
// Thales Matheus Mendonça Santos - November 2025

use study_anonymizer::cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // Tokio runtime entry point: delegate all argument parsing and dispatching to the CLI module.
    cli::run().await
}
