// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-poll-group buffer pools.
//!
//! Two pools exist: the shared data-buffer pool (`io_unit_size` buffers
//! backing transport SGLs) and the small control-message pool used when the
//! in-capsule arena is too small for an admin or fabrics command. Waiters
//! queue FIFO — tokio's semaphore hands permits out in acquire order, which
//! is exactly the pending-buffer ordering the request machine relies on.

use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::sync::{Semaphore, TryAcquireError};

/// A fixed-size pool of equally sized buffers.
pub struct BufPool {
    buf_size: usize,
    sem: Arc<Semaphore>,
    free: Mutex<Vec<BytesMut>>,
}

impl BufPool {
    pub fn new(count: usize, buf_size: usize) -> Arc<Self> {
        let free = (0..count).map(|_| BytesMut::zeroed(buf_size)).collect();
        Arc::new(Self { buf_size, sem: Arc::new(Semaphore::new(count)), free: Mutex::new(free) })
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    fn take_bufs(self: &Arc<Self>, n: usize) -> Vec<PooledBuf> {
        let mut free = self.free.lock().expect("buf pool poisoned");
        (0..n)
            .map(|_| {
                let mut buf = free.pop().expect("permit held without a free buffer");
                buf.resize(self.buf_size, 0);
                PooledBuf { buf: Some(buf), pool: Arc::clone(self) }
            })
            .collect()
    }

    /// Non-blocking grab of `n` buffers; `None` when the pool cannot cover
    /// the request right now.
    pub fn try_get(self: &Arc<Self>, n: usize) -> Option<Vec<PooledBuf>> {
        match self.sem.clone().try_acquire_many_owned(n as u32) {
            Ok(permit) => {
                permit.forget();
                Some(self.take_bufs(n))
            },
            Err(TryAcquireError::NoPermits) => None,
            Err(TryAcquireError::Closed) => None,
        }
    }

    /// Wait (FIFO) until `n` buffers are available.
    pub async fn get(self: &Arc<Self>, n: usize) -> Vec<PooledBuf> {
        let permit = self
            .sem
            .clone()
            .acquire_many_owned(n as u32)
            .await
            .expect("buf pool semaphore closed");
        permit.forget();
        self.take_bufs(n)
    }

    fn put_back(&self, buf: BytesMut) {
        self.free.lock().expect("buf pool poisoned").push(buf);
        self.sem.add_permits(1);
    }
}

/// One buffer checked out of a [`BufPool`]; returns to the pool on drop.
pub struct PooledBuf {
    buf: Option<BytesMut>,
    pool: Arc<BufPool>,
}

impl PooledBuf {
    pub fn bytes(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer already returned")
    }

    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer already returned")
    }

    /// Hand the raw buffer out (e.g. to a block device); pair with
    /// [`PooledBuf::restore`] before drop, or the capacity is lost to the
    /// pool until restore.
    pub fn take(&mut self) -> BytesMut {
        self.buf.take().expect("buffer already taken")
    }

    pub fn restore(&mut self, buf: BytesMut) {
        debug_assert!(self.buf.is_none());
        self.buf = Some(buf);
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put_back(buf);
        } else {
            // Buffer is in flight elsewhere; refill with a fresh allocation
            // so the pool's accounting stays closed.
            self.pool.put_back(BytesMut::zeroed(self.pool.buf_size));
        }
    }
}

impl core::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.buf.as_ref().map(|b| b.len()))
            .finish()
    }
}
