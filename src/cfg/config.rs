// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Target configuration: transport tunables, listeners, and the static
//! subsystem/namespace provisioning, loaded from one YAML file.

use std::{fs, path::Path, sync::Arc};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{
    bdev::MemDisk,
    nvme::types::NVMF_NQN_MAX_LEN,
    subsystem::{DISCOVERY_NQN, Namespace, Registry, Subsystem, SubsystemState, SubsystemType},
    transport::{PlacementPolicy, TransportOpts},
};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Wire and resource tunables of the TCP transport.
    #[serde(rename = "Transport", default)]
    pub transport: TransportOpts,

    /// How new connections spread over poll groups.
    #[serde(rename = "Placement", default)]
    pub placement: PlacementPolicy,

    /// Poll groups to run; defaults to one per reported CPU.
    #[serde(rename = "PollGroups", default)]
    pub poll_groups: usize,

    /// Listening endpoints.
    #[serde(rename = "Listeners")]
    pub listeners: Vec<ListenerConfig>,

    /// Static subsystem provisioning.
    #[serde(rename = "Subsystems", default)]
    pub subsystems: Vec<SubsystemConfig>,

    /// Logging setup (level, sink, rotation).
    #[serde(rename = "Logger", default)]
    pub logger: crate::cfg::logger::LoggerConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ListenerConfig {
    #[serde(rename = "Traddr")]
    pub traddr: String,
    #[serde(rename = "Trsvcid", default = "default_trsvcid")]
    pub trsvcid: String,
}

fn default_trsvcid() -> String {
    "4420".to_string()
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SubsystemConfig {
    #[serde(rename = "Nqn", default = "default_nqn")]
    pub nqn: String,
    /// "nvme" serves namespaces; "discovery" serves the discovery log.
    #[serde(rename = "Type", default)]
    pub subtype: SubsystemType,
    #[serde(rename = "AllowAnyHost", default = "default_true")]
    pub allow_any_host: bool,
    #[serde(rename = "Hosts", default)]
    pub hosts: Vec<String>,
    #[serde(rename = "AnaReporting", default)]
    pub ana_reporting: bool,
    #[serde(rename = "Namespaces", default)]
    pub namespaces: Vec<NamespaceConfig>,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NamespaceConfig {
    #[serde(rename = "Nsid")]
    pub nsid: u32,
    #[serde(rename = "BlockSize", default = "default_block_size")]
    pub block_size: u32,
    #[serde(rename = "NumBlocks")]
    pub num_blocks: u64,
}

fn default_block_size() -> u32 {
    512
}

/// Omitting the NQN only makes sense for the discovery service.
fn default_nqn() -> String {
    DISCOVERY_NQN.to_string()
}

impl Config {
    /// Load from YAML, validate, and normalize derived fields.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {:?}", path.as_ref()))?;
        let mut cfg: Config = serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    pub fn validate_and_normalize(&mut self) -> Result<()> {
        self.transport.validate()?;

        if self.poll_groups == 0 {
            self.poll_groups = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
        }

        ensure!(!self.listeners.is_empty(), "at least one listener is required");
        for l in &self.listeners {
            ensure!(!l.traddr.is_empty(), "listener Traddr must not be empty");
            ensure!(
                l.trsvcid.parse::<u16>().is_ok(),
                "listener Trsvcid {} is not a port number",
                l.trsvcid
            );
        }

        for sub in &self.subsystems {
            ensure!(
                sub.nqn.starts_with("nqn.") && sub.nqn.len() <= NVMF_NQN_MAX_LEN,
                "invalid subsystem nqn {}",
                sub.nqn
            );
            if sub.subtype == SubsystemType::Discovery {
                ensure!(
                    sub.namespaces.is_empty(),
                    "discovery subsystem {} cannot carry namespaces",
                    sub.nqn
                );
            }
            for ns in &sub.namespaces {
                ensure!(ns.nsid != 0 && ns.nsid != u32::MAX, "invalid nsid {}", ns.nsid);
                ensure!(
                    ns.block_size.is_power_of_two() && ns.block_size >= 512,
                    "block size must be a power of two >= 512"
                );
                ensure!(ns.num_blocks > 0, "namespace must have at least one block");
            }
        }
        Ok(())
    }

    /// Materialize the subsystem registry described by this config, every
    /// subsystem active and RAM-backed.
    pub fn build_registry(&self) -> Result<Arc<Registry>> {
        let registry = Registry::new();
        for sub_cfg in &self.subsystems {
            let sub = Subsystem::with_access(
                sub_cfg.nqn.clone(),
                sub_cfg.subtype,
                sub_cfg.allow_any_host,
                sub_cfg.hosts.clone(),
                sub_cfg.ana_reporting,
            );
            for ns_cfg in &sub_cfg.namespaces {
                let disk = Arc::new(MemDisk::new(ns_cfg.block_size, ns_cfg.num_blocks));
                sub.add_namespace(Namespace::new(ns_cfg.nsid, disk))?;
            }
            sub.set_state(SubsystemState::Active);
            registry.add(sub)?;
        }
        Ok(registry)
    }
}
