// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Resolve a possibly relative config path against the working directory.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir().context("cannot get current working dir")?.join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}

/// Minimal argument surface: `nvmf_tgt [--config <path>]`.
pub fn config_path_from_args() -> Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    let mut path = "nvmf_tgt.yaml".to_string();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                path = args.next().context("--config needs a path")?;
            },
            "--help" | "-h" => {
                println!("usage: nvmf_tgt [--config <path>]");
                std::process::exit(0);
            },
            other => bail!("unknown argument: {other}"),
        }
    }
    resolve_config_path(&path)
}
