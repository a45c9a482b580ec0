use qperf::bench::{run_receiver, run_sender, shutdown_channel};
use qperf::config::{Role, command};
use std::process::ExitCode;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let role = match Role::from_matches(&command().get_matches()) {
        Ok(role) => role,
        Err(e) => {
            error!("Fatal configuration error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
            trigger.trigger();
        }
    });

    match role {
        Role::Sender(config) => match run_sender(config, shutdown).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Fatal error: {:#}", e);
                ExitCode::FAILURE
            }
        },
        Role::Receiver(config) => match run_receiver(&config, shutdown).await {
            Ok(received) => {
                println!("{}", received.report);
                if received.is_failure() {
                    ExitCode::FAILURE
                } else {
                    ExitCode::SUCCESS
                }
            }
            Err(e) => {
                error!("Fatal error: {:#}", e);
                ExitCode::FAILURE
            }
        },
    }
}
