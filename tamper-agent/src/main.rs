//! Tamper Agent Binary Entry Point

use clap::Parser;
use tamper_agent::{init_logging, run_agent, Args};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let args = Args::parse();

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
        }
    };

    if let Err(e) = run_agent(args, shutdown).await {
        tracing::error!("Tamper agent failed: {}", e);
        return Err(e);
    }

    Ok(())
}
