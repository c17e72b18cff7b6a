// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Poll groups: the unit of qpair ownership and buffer locality.
//!
//! Each group owns a shared data-buffer pool and a control-message pool;
//! every qpair placed on the group draws from those pools, and each runs as
//! its own task so all of its state stays single-owner. The group tracks
//! its population for the placement policies.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    pdu::digest::{SharedDigestEngine, SoftwareDigest},
    transport::{CONTROL_MSG_SIZE, pool::BufPool, qpair::TcpQpair, target::TargetCtx},
};

pub struct PollGroup {
    pub id: usize,
    data_pool: Arc<BufPool>,
    ctrl_msg_pool: Arc<BufPool>,
    /// The group's CRC32C channel; software unless an accelerator is wired.
    digest_engine: SharedDigestEngine,
    cancel: CancellationToken,
    qpair_count: Arc<AtomicUsize>,
}

impl PollGroup {
    pub fn new(id: usize, ctx: &Arc<TargetCtx>, cancel: CancellationToken) -> Arc<Self> {
        let opts = &ctx.opts;
        // Shared buffers are split evenly across groups; the per-group cache
        // floor keeps a group useful even with many siblings.
        let per_group = (opts.num_shared_buffers as usize / ctx.num_poll_groups.max(1))
            .max(opts.buf_cache_size as usize);
        let data_pool = BufPool::new(per_group, opts.io_unit_size as usize);
        let ctrl_msg_pool =
            BufPool::new(opts.control_msg_num as usize, CONTROL_MSG_SIZE as usize);
        Arc::new(Self {
            id,
            data_pool,
            ctrl_msg_pool,
            digest_engine: Arc::new(SoftwareDigest),
            cancel,
            qpair_count: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn qpair_count(&self) -> usize {
        self.qpair_count.load(Ordering::SeqCst)
    }

    /// Take ownership of a fresh connection: build the qpair and run it on
    /// its own task. `on_exit` fires when the connection dies (used by the
    /// host-IP pin table to drop its reference).
    pub fn add_qpair(
        self: &Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        ctx: Arc<TargetCtx>,
        on_exit: impl FnOnce() + Send + 'static,
    ) {
        let qpair = TcpQpair::new(
            stream,
            peer,
            ctx,
            Arc::clone(&self.data_pool),
            Arc::clone(&self.ctrl_msg_pool),
            Arc::clone(&self.digest_engine),
            self.cancel.child_token(),
        );
        self.qpair_count.fetch_add(1, Ordering::SeqCst);
        let count = Arc::clone(&self.qpair_count);
        let group = self.id;
        debug!(group, %peer, "qpair placed");
        tokio::spawn(async move {
            qpair.run().await;
            count.fetch_sub(1, Ordering::SeqCst);
            on_exit();
        });
    }
}
