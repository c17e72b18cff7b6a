// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

#![allow(clippy::module_inception)]

pub mod poll_group;
pub mod pool;
pub mod port;
pub mod qpair;
pub mod request;
pub mod target;

pub use target::TcpTarget;

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

/// In-capsule floor admin and fabrics commands rely on: when the negotiated
/// in-capsule size is below this, the control-message pool covers the gap.
pub const CONTROL_MSG_SIZE: u32 = 8192;

/// Accepts drained per acceptor tick, per port.
pub const ACCEPTS_PER_TICK: usize = 16;

/// Transport-wide tunables with their conventional NVMe-oF defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportOpts {
    #[serde(rename = "MaxQueueDepth", default = "default_max_queue_depth")]
    pub max_queue_depth: u16,
    #[serde(rename = "MaxQpairsPerCtrlr", default = "default_max_qpairs")]
    pub max_qpairs_per_ctrlr: u16,
    #[serde(rename = "InCapsuleDataSize", default = "default_in_capsule")]
    pub in_capsule_data_size: u32,
    #[serde(rename = "MaxIoSize", default = "default_max_io_size")]
    pub max_io_size: u32,
    #[serde(rename = "IoUnitSize", default = "default_io_unit_size")]
    pub io_unit_size: u32,
    #[serde(rename = "MaxAqDepth", default = "default_max_aq_depth")]
    pub max_aq_depth: u16,
    #[serde(rename = "NumSharedBuffers", default = "default_shared_buffers")]
    pub num_shared_buffers: u32,
    #[serde(rename = "BufCacheSize", default = "default_buf_cache")]
    pub buf_cache_size: u32,
    #[serde(rename = "DifInsertOrStrip", default)]
    pub dif_insert_or_strip: bool,
    #[serde(rename = "AbortTimeoutSec", default = "default_abort_timeout")]
    pub abort_timeout_sec: u32,
    #[serde(rename = "SockPriority", default)]
    pub sock_priority: u32,
    #[serde(rename = "C2hSuccess", default = "default_true")]
    pub c2h_success: bool,
    #[serde(rename = "ControlMsgNum", default = "default_control_msg_num")]
    pub control_msg_num: u32,
}

fn default_max_queue_depth() -> u16 {
    128
}
fn default_max_qpairs() -> u16 {
    128
}
fn default_in_capsule() -> u32 {
    4096
}
fn default_max_io_size() -> u32 {
    131072
}
fn default_io_unit_size() -> u32 {
    131072
}
fn default_max_aq_depth() -> u16 {
    128
}
fn default_shared_buffers() -> u32 {
    511
}
fn default_buf_cache() -> u32 {
    32
}
fn default_abort_timeout() -> u32 {
    1
}
fn default_true() -> bool {
    true
}
fn default_control_msg_num() -> u32 {
    32
}

impl Default for TransportOpts {
    fn default() -> Self {
        Self {
            max_queue_depth: default_max_queue_depth(),
            max_qpairs_per_ctrlr: default_max_qpairs(),
            in_capsule_data_size: default_in_capsule(),
            max_io_size: default_max_io_size(),
            io_unit_size: default_io_unit_size(),
            max_aq_depth: default_max_aq_depth(),
            num_shared_buffers: default_shared_buffers(),
            buf_cache_size: default_buf_cache(),
            dif_insert_or_strip: false,
            abort_timeout_sec: default_abort_timeout(),
            sock_priority: 0,
            c2h_success: true,
            control_msg_num: default_control_msg_num(),
        }
    }
}

/// Highest socket priority Linux accepts without CAP_NET_ADMIN tricks.
pub const SOCK_PRIORITY_MAX: u32 = 16;

impl TransportOpts {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_queue_depth >= 2, "MaxQueueDepth must be at least 2");
        ensure!(self.max_aq_depth >= 2, "MaxAqDepth must be at least 2");
        ensure!(self.max_qpairs_per_ctrlr >= 2, "MaxQpairsPerCtrlr must be at least 2");
        ensure!(
            self.max_io_size >= 8192 && self.max_io_size.is_power_of_two(),
            "MaxIoSize must be a power of two >= 8192"
        );
        ensure!(
            self.io_unit_size > 0 && self.io_unit_size <= self.max_io_size,
            "IoUnitSize must be in (0, MaxIoSize]"
        );
        ensure!(
            self.sock_priority <= SOCK_PRIORITY_MAX,
            "SockPriority must be <= {SOCK_PRIORITY_MAX}"
        );
        ensure!(self.num_shared_buffers > 0, "NumSharedBuffers must be nonzero");
        Ok(())
    }

    /// MAXH2CDATA advertised in IC_RESP.
    pub fn maxh2cdata(&self) -> u32 {
        self.max_io_size.min(self.io_unit_size)
    }

    /// I/O qpairs a controller may create (qid 0 excluded).
    pub fn io_qpairs(&self) -> u16 {
        self.max_qpairs_per_ctrlr - 1
    }
}

/// One listening endpoint, as advertised in the discovery log.
#[derive(Debug, Clone)]
pub struct ListenerInfo {
    /// Address family code of the discovery log (1 = IPv4, 2 = IPv6).
    pub adrfam: u8,
    pub traddr: String,
    pub trsvcid: String,
    pub portid: u16,
}

/// How the acceptor spreads new connections over poll groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementPolicy {
    #[default]
    RoundRobin,
    HostIp,
    TransportOptimal,
}
