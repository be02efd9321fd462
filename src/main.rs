mod args;
mod codec;
mod config;
mod error;
mod model;
mod reaper;
mod registry;
mod room;
mod server;
mod session;

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = args::Args::new();
    if let Err(e) = args.run().await {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
