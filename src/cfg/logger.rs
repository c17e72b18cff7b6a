// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! JSON logging for the target daemon, configured from the main YAML file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fastrace::collector::{Config as FastraceConfig, ConsoleReporter};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
};

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "lowercase")]
pub enum Output {
    Stdout,
    Stderr,
    File,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "lowercase")]
pub enum RotationFreq {
    Minutely,
    Hourly,
    Daily,
    Never,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LogFileConfig {
    pub path: String,
    #[serde(default)]
    pub rotation_frequency: Option<RotationFreq>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggerConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_output")]
    pub output: Output,
    #[serde(default)]
    pub file: Option<LogFileConfig>,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_output() -> Output {
    Output::Stderr
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self { level: default_level(), output: default_output(), file: None }
    }
}

static LOGGER_INSTALLED: OnceCell<()> = OnceCell::new();

/// Install the global subscriber. The returned guard must stay alive for the
/// non-blocking writer to flush; a second call is a no-op.
pub fn init_logger(cfg: &LoggerConfig) -> Result<Option<WorkerGuard>> {
    if LOGGER_INSTALLED.set(()).is_err() {
        return Ok(None);
    }
    let (writer, guard) = make_writer(cfg)?;

    fastrace::set_reporter(ConsoleReporter, FastraceConfig::default());
    let compat_layer = fastrace_tracing::FastraceCompatLayer::new();

    let env_filter = EnvFilter::try_new(&cfg.level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .context("failed to parse log level from config or env")?;

    let json_layer = fmt::layer().with_writer(writer).with_ansi(false).json();

    let subscriber = Registry::default().with(env_filter).with(compat_layer).with(json_layer);

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global default subscriber")?;

    Ok(Some(guard))
}

fn make_writer(cfg: &LoggerConfig) -> Result<(BoxMakeWriter, WorkerGuard)> {
    Ok(match cfg.output {
        Output::Stdout => {
            let (w, g) = tracing_appender::non_blocking(std::io::stdout());
            (BoxMakeWriter::new(w), g)
        },
        Output::Stderr => {
            let (w, g) = tracing_appender::non_blocking(std::io::stderr());
            (BoxMakeWriter::new(w), g)
        },
        Output::File => {
            let fcfg = cfg.file.clone().context("logger.file is required for output=file")?;
            let path = PathBuf::from(&fcfg.path);
            let dir = path.parent().unwrap_or_else(|| Path::new(""));

            let rotation = match fcfg.rotation_frequency.clone().unwrap_or(RotationFreq::Never) {
                RotationFreq::Minutely => Rotation::MINUTELY,
                RotationFreq::Hourly => Rotation::HOURLY,
                RotationFreq::Daily => Rotation::DAILY,
                RotationFreq::Never => Rotation::NEVER,
            };

            let file_appender =
                RollingFileAppender::new(rotation, dir, path.file_name().unwrap_or_default());
            let (w, g) = tracing_appender::non_blocking(file_appender);
            (BoxMakeWriter::new(w), g)
        },
    })
}
