// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use chrono::Utc;
use nvmf_tcp_rs::{
    cfg::{cli::config_path_from_args, config::Config, logger::init_logger},
    transport::TcpTarget,
};
use tracing::{debug, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config_path_from_args()?;
    let cfg = Config::load_from_file(&config_path)?;
    let _log_guard = init_logger(&cfg.logger)?;
    info!(?config_path, started_at = %Utc::now().to_rfc3339(), "nvmf tcp target starting");
    debug!(config = %serde_json::to_string(&cfg)?, "effective configuration");

    let registry = cfg.build_registry()?;
    let target = TcpTarget::new(
        registry,
        cfg.transport.clone(),
        cfg.poll_groups,
        cfg.placement,
    )?;

    for listener in &cfg.listeners {
        target.listen(&listener.traddr, &listener.trsvcid).await?;
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    target.shutdown().await;
    Ok(())
}
