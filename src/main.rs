use anyhow::Result;
use clap::Parser;

#[derive(Parser)]
#[command(
    name = "stackpair",
    about = "Dual-mode TCP interoperability harness for a user-space network stack",
    version,
    long_about = None
)]
struct Cli {}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _cli = Cli::parse();

    let config = stackpair::HarnessConfig::default();
    stackpair::run_default_scenarios(&config).await;

    Ok(())
}
