//! Frost Engine - Entry Point
//!
//! Single-node deployment orchestrator: builds services from git or images,
//! rolls them out behind Caddy and keeps the routing document in sync.

use std::collections::HashMap;
use std::env;

use anyhow::Context;
use frost_engine::app::options::AppOptions;
use frost_engine::app::run::run;
use frost_engine::diagnostic::run_diagnostic;
use frost_engine::filesys::file::File;
use frost_engine::logs::{init_logging, LogOptions};
use frost_engine::storage::layout::StorageLayout;
use frost_engine::storage::settings::Settings;
use frost_engine::utils::version_info;

use tracing::{info, warn};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version_info()) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to encode version info: {e}"),
        }
        return;
    }

    let layout = cli_args
        .get("data-dir")
        .map(StorageLayout::new)
        .unwrap_or_default();
    let settings_file = cli_args
        .get("config")
        .map(File::new)
        .unwrap_or_else(|| layout.settings_file());

    // Run diagnostics
    if cli_args.contains_key("diagnostic") || cli_args.contains_key("diag") {
        if !run_diagnostic(&settings_file).await {
            std::process::exit(1);
        }
        return;
    }

    if let Err(e) = start(layout, settings_file).await {
        eprintln!("frostd failed: {e:#}");
        std::process::exit(1);
    }
}

async fn start(layout: StorageLayout, settings_file: File) -> anyhow::Result<()> {
    let settings = Settings::load(&settings_file)
        .await
        .context("failed to load settings")?;
    settings.validate().context("invalid settings")?;

    layout
        .setup()
        .await
        .with_context(|| format!("failed to prepare {}", layout.base_dir.display()))?;

    // Held for the process lifetime so buffered file logs are flushed on exit
    let _log_guard = init_logging(LogOptions {
        log_level: settings.log_level.clone(),
        stdout: true,
        log_dir: Some(layout.logs_dir().path().to_path_buf()),
        json_format: settings.log_json,
    })
    .context("failed to initialize logging")?;

    let options = AppOptions::from_settings(&settings, layout);
    info!(
        "Running Frost engine {} with options: {:?}",
        version_info().version,
        options
    );

    run(options, await_shutdown_signal())
        .await
        .context("engine stopped with an error")?;
    Ok(())
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, shutting down...");
                    }
                    _ = sigint.recv() => {
                        info!("SIGINT received, shutting down...");
                    }
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers, using Ctrl+C only: {}", e);
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Ctrl+C received, shutting down...");
}
