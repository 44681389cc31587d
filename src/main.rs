mod archive;
mod config;
mod content;
mod downloader;
mod error;
mod gdrive;
mod handlers;
mod progress;
mod rclone;
mod settings;
mod tasks;
mod telegram;
mod uploader;

use std::time::Duration;

use teloxide::{net::default_reqwest_settings, prelude::*};
use tracing::{error, info, warn};
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use crate::config::Config;
use crate::error::AppError;
use crate::handlers::{build_handler, Services};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    if let Err(err) = run().await {
        eprintln!("fatal error: {err}");
        error!(error = %err, "terminated with fatal error");
        return Err(err);
    }
    info!("shutdown complete");
    Ok(())
}

async fn run() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    dotenv::dotenv().ok();

    let config = Config::from_env()?;
    tokio::fs::create_dir_all(&config.storage_dir).await?;
    info!(storage = %config.storage_dir.display(), "storage directory ready");

    let client = default_reqwest_settings()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(120))
        .build()?;
    let bot = Bot::from_env_with_client(client);

    let services = Services::new(bot.clone(), config)?;
    let handler = build_handler();
    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![services])
        .build();

    let shutdown_token = dispatcher.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        if let Ok(wait) = shutdown_token.shutdown() {
            wait.await;
        } else {
            warn!("failed to initiate graceful shutdown");
        }
    });

    info!("starting dispatcher");
    dispatcher.dispatch().await;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut term), Ok(mut interrupt)) => {
            tokio::select! {
                _ = term.recv() => info!("received SIGTERM"),
                _ = interrupt.recv() => info!("received SIGINT"),
            }
        }
        _ => {
            warn!("signal handler registration failed, falling back to Ctrl+C");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
