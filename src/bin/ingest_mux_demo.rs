// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Minimal embedding of the Muxer: load a config file, dial every
//! destination, ship one self-log Entry once a Connection is Hot, sync, and
//! shut down cleanly on Ctrl-C.

use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use ingest_mux::cfg::cli::resolve_config_path;
use ingest_mux::cfg::logger::init_logger;
use ingest_mux::muxer::{Muxer, MuxerConfig};
use ingest_mux::wire::{Entry, TAG_SELF_LOG};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const WAIT_FOR_HOT_TIMEOUT: Duration = Duration::from_secs(30);
const SYNC_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

const EXIT_OK: i32 = 0;
const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_RUNTIME_ERROR: i32 = 2;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let config_path = args.get(1).cloned().unwrap_or_else(|| "ingest-mux.yaml".to_string());
    let logger_config_path = args.get(2).cloned();

    let _logger_guard = match logger_config_path.as_deref() {
        Some(path) => match resolve_config_path(path).and_then(|p| init_logger(p.to_str().unwrap_or(path))) {
            Ok(guard) => Some(guard),
            Err(e) => {
                eprintln!("failed to initialize configured logger ({e:#}), falling back to stderr");
                tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
                None
            }
        },
        None => {
            tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
            None
        }
    };

    std::process::exit(match run(&config_path).await {
        Ok(()) => EXIT_OK,
        Err(e) if is_config_error(&e) => {
            error!(error = %e, "fatal configuration error");
            EXIT_CONFIG_ERROR
        }
        Err(e) => {
            error!(error = %e, "fatal runtime error");
            EXIT_RUNTIME_ERROR
        }
    });
}

fn is_config_error(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<ingest_mux::error::MuxError>(), Some(ingest_mux::error::MuxError::Config(_)))
}

async fn run(config_path: &str) -> Result<()> {
    let resolved = resolve_config_path(config_path).context("resolving config path")?;
    let cfg = MuxerConfig::load_from_file(&resolved).context("loading muxer config")?;

    info!(destinations = ?cfg.destinations, ingester = %cfg.ingester_name, "starting muxer");
    let muxer = Muxer::start(cfg)?;

    muxer.wait_for_hot(WAIT_FOR_HOT_TIMEOUT).await.context("waiting for a hot connection")?;
    info!("connection is hot, writing a sample entry");

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let entry = Entry::new(now.as_secs() as i64, now.subsec_nanos(), TAG_SELF_LOG, Bytes::from_static(b"ingest-mux started"));
    muxer.write_entry(entry).await.context("writing sample entry")?;

    muxer.sync(SYNC_TIMEOUT).await.context("syncing after sample write")?;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested, draining and closing connections");
    muxer.close(SHUTDOWN_TIMEOUT).await;

    Ok(())
}
