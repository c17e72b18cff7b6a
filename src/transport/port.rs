// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One listening endpoint of the transport.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio_util::sync::CancellationToken;

use crate::transport::ListenerInfo;

pub struct Port {
    pub info: ListenerInfo,
    pub cancel: CancellationToken,
    /// Listen calls referencing this port; the socket closes when the last
    /// stop_listen drops it to zero.
    refs: AtomicUsize,
}

impl Port {
    pub fn new(info: ListenerInfo, cancel: CancellationToken) -> Self {
        Self { info, cancel, refs: AtomicUsize::new(1) }
    }

    pub fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns `true` when this was the last reference.
    pub fn release(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::SeqCst) == 1
    }
}

/// Canonical key for trid comparison: family-independent address text plus
/// the service string.
pub fn trid_key(traddr: &str, trsvcid: &str) -> String {
    format!("{}:{}", traddr.trim().to_ascii_lowercase(), trsvcid.trim())
}
