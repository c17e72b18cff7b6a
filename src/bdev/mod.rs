// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The block-device seam the I/O path executes against.
//!
//! The transport never touches storage directly: every data command resolves
//! to a [`BlockDevice`] call that returns immediately with a boxed future,
//! and the request state machine parks in `EXECUTING` until the future
//! resolves. [`MemDisk`] is the RAM-backed device used by the daemon's
//! static provisioning and by the test suite.

use std::{future::Future, pin::Pin, sync::Mutex};

use bytes::BytesMut;

/// I/O classes a device may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoType {
    Read,
    Write,
    Flush,
    Reset,
    Unmap,
    Compare,
    WriteZeroes,
    Zcopy,
    NvmeAdminPassthru,
}

/// Completion status of one device operation, translated by the request
/// machinery into NVMe sct/sc pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Success,
    /// Device queue full; the caller retries after a window.
    NoMem,
    /// Compare miscompare.
    CompareFailure,
    /// Out-of-range LBA.
    OutOfRange,
    /// Anything else.
    Failed,
}

/// One I/O submitted to a device. Buffers are owned by the request and
/// lent to the device for the duration of the call.
#[derive(Debug)]
pub enum IoRequest {
    Read { offset_blocks: u64, num_blocks: u64, bufs: Vec<BytesMut> },
    Write { offset_blocks: u64, num_blocks: u64, bufs: Vec<BytesMut> },
    /// Fused compare-and-write: both halves execute atomically.
    CompareAndWrite {
        offset_blocks: u64,
        num_blocks: u64,
        cmp_bufs: Vec<BytesMut>,
        write_bufs: Vec<BytesMut>,
    },
    Compare { offset_blocks: u64, num_blocks: u64, bufs: Vec<BytesMut> },
    WriteZeroes { offset_blocks: u64, num_blocks: u64 },
    Flush,
    Unmap { offset_blocks: u64, num_blocks: u64 },
}

/// Outcome of a device call: status plus the buffers lent in the request,
/// so they can return to their pool.
#[derive(Debug)]
pub struct IoCompletion {
    pub status: IoStatus,
    pub bufs: Vec<BytesMut>,
}

pub type IoFuture = Pin<Box<dyn Future<Output = IoCompletion> + Send>>;
pub type ZcopyStartFuture = Pin<Box<dyn Future<Output = Result<Vec<BytesMut>, IoStatus>> + Send>>;
pub type ZcopyEndFuture = Pin<Box<dyn Future<Output = IoStatus> + Send>>;

/// The block-device contract the transport executes against.
pub trait BlockDevice: Send + Sync {
    fn block_size(&self) -> u32;

    fn block_count(&self) -> u64;

    fn supports(&self, io_type: IoType) -> bool;

    /// Submit one operation; the returned future resolves on completion.
    fn submit(&self, request: IoRequest) -> IoFuture;

    /// Start a zero-copy window: the device hands out buffers covering the
    /// range (populated for reads, blank for writes).
    fn zcopy_start(&self, offset_blocks: u64, num_blocks: u64, populate: bool) -> ZcopyStartFuture;

    /// Finish a zero-copy window; `commit` writes the buffers back.
    fn zcopy_end(&self, offset_blocks: u64, num_blocks: u64, bufs: Vec<BytesMut>, commit: bool)
    -> ZcopyEndFuture;
}

/// RAM-backed block device.
pub struct MemDisk {
    block_size: u32,
    block_count: u64,
    data: Mutex<Vec<u8>>,
}

impl MemDisk {
    pub fn new(block_size: u32, block_count: u64) -> Self {
        let len = (block_size as u64 * block_count) as usize;
        Self { block_size, block_count, data: Mutex::new(vec![0u8; len]) }
    }

    fn span(&self, offset_blocks: u64, num_blocks: u64) -> Option<(usize, usize)> {
        let end = offset_blocks.checked_add(num_blocks)?;
        if end > self.block_count {
            return None;
        }
        let bs = self.block_size as u64;
        Some(((offset_blocks * bs) as usize, (end * bs) as usize))
    }

    fn read_span(&self, start: usize, end: usize, bufs: &mut [BytesMut]) {
        let data = self.data.lock().expect("memdisk poisoned");
        let mut off = start;
        for buf in bufs {
            let take = buf.len().min(end - off);
            buf[..take].copy_from_slice(&data[off..off + take]);
            off += take;
        }
    }

    fn write_span(&self, start: usize, end: usize, bufs: &[BytesMut]) {
        let mut data = self.data.lock().expect("memdisk poisoned");
        let mut off = start;
        for buf in bufs {
            let take = buf.len().min(end - off);
            data[off..off + take].copy_from_slice(&buf[..take]);
            off += take;
        }
    }

    fn compare_span(&self, start: usize, end: usize, bufs: &[BytesMut]) -> IoStatus {
        let data = self.data.lock().expect("memdisk poisoned");
        let mut off = start;
        for buf in bufs {
            let take = buf.len().min(end - off);
            if data[off..off + take] != buf[..take] {
                return IoStatus::CompareFailure;
            }
            off += take;
        }
        IoStatus::Success
    }
}

impl BlockDevice for MemDisk {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn supports(&self, io_type: IoType) -> bool {
        matches!(
            io_type,
            IoType::Read
                | IoType::Write
                | IoType::Flush
                | IoType::Reset
                | IoType::Unmap
                | IoType::Compare
                | IoType::WriteZeroes
        )
    }

    fn submit(&self, request: IoRequest) -> IoFuture {
        let (status, bufs) = match request {
            IoRequest::Read { offset_blocks, num_blocks, mut bufs } => {
                match self.span(offset_blocks, num_blocks) {
                    Some((s, e)) => {
                        self.read_span(s, e, &mut bufs);
                        (IoStatus::Success, bufs)
                    },
                    None => (IoStatus::OutOfRange, bufs),
                }
            },
            IoRequest::Write { offset_blocks, num_blocks, bufs } => {
                match self.span(offset_blocks, num_blocks) {
                    Some((s, e)) => {
                        self.write_span(s, e, &bufs);
                        (IoStatus::Success, bufs)
                    },
                    None => (IoStatus::OutOfRange, bufs),
                }
            },
            IoRequest::CompareAndWrite { offset_blocks, num_blocks, cmp_bufs, write_bufs } => {
                match self.span(offset_blocks, num_blocks) {
                    Some((s, e)) => {
                        let status = self.compare_span(s, e, &cmp_bufs);
                        if status == IoStatus::Success {
                            self.write_span(s, e, &write_bufs);
                        }
                        let mut bufs = cmp_bufs;
                        bufs.extend(write_bufs);
                        (status, bufs)
                    },
                    None => {
                        let mut bufs = cmp_bufs;
                        bufs.extend(write_bufs);
                        (IoStatus::OutOfRange, bufs)
                    },
                }
            },
            IoRequest::Compare { offset_blocks, num_blocks, bufs } => {
                match self.span(offset_blocks, num_blocks) {
                    Some((s, e)) => (self.compare_span(s, e, &bufs), bufs),
                    None => (IoStatus::OutOfRange, bufs),
                }
            },
            IoRequest::WriteZeroes { offset_blocks, num_blocks } => {
                match self.span(offset_blocks, num_blocks) {
                    Some((s, e)) => {
                        let mut data = self.data.lock().expect("memdisk poisoned");
                        data[s..e].fill(0);
                        (IoStatus::Success, Vec::new())
                    },
                    None => (IoStatus::OutOfRange, Vec::new()),
                }
            },
            IoRequest::Flush => (IoStatus::Success, Vec::new()),
            IoRequest::Unmap { offset_blocks, num_blocks } => {
                match self.span(offset_blocks, num_blocks) {
                    Some((s, e)) => {
                        let mut data = self.data.lock().expect("memdisk poisoned");
                        data[s..e].fill(0);
                        (IoStatus::Success, Vec::new())
                    },
                    None => (IoStatus::OutOfRange, Vec::new()),
                }
            },
        };
        Box::pin(async move { IoCompletion { status, bufs } })
    }

    fn zcopy_start(&self, _offset_blocks: u64, _num_blocks: u64, _populate: bool) -> ZcopyStartFuture {
        Box::pin(async { Err(IoStatus::Failed) })
    }

    fn zcopy_end(
        &self,
        _offset_blocks: u64,
        _num_blocks: u64,
        _bufs: Vec<BytesMut>,
        _commit: bool,
    ) -> ZcopyEndFuture {
        Box::pin(async { IoStatus::Failed })
    }
}
