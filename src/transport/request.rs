// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-command request objects and their 15-state lifecycle.
//!
//! Every qpair pre-allocates `resource_count` requests; a request is claimed
//! when a command capsule arrives and returns to `Free` once the response has
//! left and all buffers are back. The per-state counters are maintained on
//! every transition and always sum to `resource_count` — the request slab
//! asserts that invariant in debug builds.

use bytes::BytesMut;

use crate::{
    nvme::types::{NvmeCmd, NvmeCpl, XferDir},
    transport::pool::PooledBuf,
};

/// Request lifecycle states.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqState {
    Free = 0,
    New = 1,
    NeedBuffer = 2,
    AwaitingZcopyStart = 3,
    ZcopyStartCompleted = 4,
    TransferringHostToController = 5,
    AwaitingR2tAck = 6,
    ReadyToExecute = 7,
    Executing = 8,
    AwaitingZcopyCommit = 9,
    Executed = 10,
    ReadyToComplete = 11,
    TransferringControllerToHost = 12,
    AwaitingZcopyRelease = 13,
    Completed = 14,
}

pub const REQ_STATE_COUNT: usize = 15;

/// Where a request's data lives.
#[derive(Debug, Default)]
pub enum DataBuf {
    #[default]
    None,
    /// Payload sits in the request's in-capsule arena.
    InCapsule,
    /// Buffers checked out of the poll group's shared pool.
    Pooled(Vec<PooledBuf>),
    /// One control-message buffer (admin/fabrics commands only).
    CtrlMsg(PooledBuf),
    /// Buffers owned by the block device (zero-copy window).
    Zcopy(Vec<BytesMut>),
}

/// Zero-copy progress of a request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ZcopyPhase {
    #[default]
    None,
    Init,
    Execute,
    EndPending,
}

/// One NVMe command in flight on a qpair.
#[derive(Debug)]
pub struct TcpRequest {
    pub idx: u16,
    pub state: ReqState,
    pub cmd: NvmeCmd,
    pub rsp: NvmeCpl,
    pub xfer: XferDir,
    /// Total data length of the command.
    pub length: u32,
    /// Host-to-controller bytes landed so far.
    pub h2c_offset: u32,
    /// Controller-to-host bytes already pushed.
    pub rw_offset: u32,
    /// Transfer tag pairing R2T and H2C_DATA; unique among live requests.
    pub ttag: u16,
    pub buf: DataBuf,
    /// In-capsule arena owned by this request.
    pub icd: BytesMut,
    pub zcopy_phase: ZcopyPhase,
    /// Second half of a fused pair, set on the Compare once the Write lands.
    pub fused_pair: Option<u16>,
    pub fused_failed: bool,
    /// Data digest of the capsule payload failed: complete with a transient
    /// transport error instead of executing.
    pub ddgst_failed: bool,
}

impl TcpRequest {
    fn new(idx: u16, icd_size: usize) -> Self {
        Self {
            idx,
            state: ReqState::Free,
            cmd: NvmeCmd::default(),
            rsp: NvmeCpl::default(),
            xfer: XferDir::None,
            length: 0,
            h2c_offset: 0,
            rw_offset: 0,
            ttag: idx + 1,
            buf: DataBuf::None,
            icd: BytesMut::zeroed(icd_size),
            zcopy_phase: ZcopyPhase::None,
            fused_pair: None,
            fused_failed: false,
            ddgst_failed: false,
        }
    }

    /// Scrub per-command state for reuse; identity (idx, ttag, arena) stays.
    fn reset(&mut self) {
        self.cmd = NvmeCmd::default();
        self.rsp = NvmeCpl::default();
        self.xfer = XferDir::None;
        self.length = 0;
        self.h2c_offset = 0;
        self.rw_offset = 0;
        self.buf = DataBuf::None;
        self.zcopy_phase = ZcopyPhase::None;
        self.fused_pair = None;
        self.fused_failed = false;
        self.ddgst_failed = false;
    }

    pub fn cid(&self) -> u16 {
        self.cmd.cid.get()
    }

    /// Borrow the data buffers as mutable slices of `length` bytes total,
    /// for inbound payload placement and device I/O.
    pub fn data_slices_mut(&mut self) -> Vec<&mut [u8]> {
        let len = self.length as usize;
        match &mut self.buf {
            DataBuf::None => Vec::new(),
            DataBuf::InCapsule => vec![&mut self.icd[..len]],
            DataBuf::Pooled(bufs) => {
                let mut left = len;
                bufs.iter_mut()
                    .map(|b| {
                        let take = left.min(b.bytes().len());
                        left -= take;
                        &mut b.bytes_mut()[..take]
                    })
                    .take_while(|s| !s.is_empty())
                    .collect()
            },
            DataBuf::CtrlMsg(buf) => vec![&mut buf.bytes_mut()[..len]],
            DataBuf::Zcopy(bufs) => {
                let mut left = len;
                bufs.iter_mut()
                    .map(|b| {
                        let take = left.min(b.len());
                        left -= take;
                        &mut b[..take]
                    })
                    .take_while(|s| !s.is_empty())
                    .collect()
            },
        }
    }

    /// Same as [`Self::data_slices_mut`] but immutable, for outbound sends
    /// and digest calculation.
    pub fn data_slices(&self) -> Vec<&[u8]> {
        let len = self.length as usize;
        match &self.buf {
            DataBuf::None => Vec::new(),
            DataBuf::InCapsule => vec![&self.icd[..len]],
            DataBuf::Pooled(bufs) => {
                let mut left = len;
                bufs.iter()
                    .map(|b| {
                        let take = left.min(b.bytes().len());
                        left -= take;
                        &b.bytes()[..take]
                    })
                    .take_while(|s| !s.is_empty())
                    .collect()
            },
            DataBuf::CtrlMsg(buf) => vec![&buf.bytes()[..len]],
            DataBuf::Zcopy(bufs) => {
                let mut left = len;
                bufs.iter()
                    .map(|b| {
                        let take = left.min(b.len());
                        left -= take;
                        &b[..take]
                    })
                    .take_while(|s| !s.is_empty())
                    .collect()
            },
        }
    }
}

/// The pre-allocated request slab of one qpair, with free-list and per-state
/// accounting.
#[derive(Debug)]
pub struct ReqSlab {
    reqs: Vec<TcpRequest>,
    free: Vec<u16>,
    state_cntr: [u32; REQ_STATE_COUNT],
}

impl ReqSlab {
    pub fn new(resource_count: u16, icd_size: usize) -> Self {
        let reqs: Vec<_> = (0..resource_count).map(|i| TcpRequest::new(i, icd_size)).collect();
        let free = (0..resource_count).rev().collect();
        let mut state_cntr = [0u32; REQ_STATE_COUNT];
        state_cntr[ReqState::Free as usize] = resource_count as u32;
        Self { reqs, free, state_cntr }
    }

    pub fn resource_count(&self) -> usize {
        self.reqs.len()
    }

    pub fn state_count(&self, state: ReqState) -> u32 {
        self.state_cntr[state as usize]
    }

    /// Claim a free request for a new capsule. `None` means the host
    /// overcommitted its queue depth and the qpair must disconnect.
    pub fn alloc(&mut self) -> Option<u16> {
        let idx = self.free.pop()?;
        self.set_state(idx, ReqState::New);
        self.reqs[idx as usize].reset();
        Some(idx)
    }

    /// Return a request to the free list; the ttag becomes reusable here and
    /// nowhere else.
    pub fn release(&mut self, idx: u16) {
        debug_assert_eq!(self.reqs[idx as usize].state, ReqState::Completed);
        self.set_state(idx, ReqState::Free);
        self.reqs[idx as usize].buf = DataBuf::None;
        self.free.push(idx);
    }

    pub fn set_state(&mut self, idx: u16, state: ReqState) {
        let req = &mut self.reqs[idx as usize];
        let old = req.state;
        if old == state {
            return;
        }
        req.state = state;
        self.state_cntr[old as usize] -= 1;
        self.state_cntr[state as usize] += 1;
        debug_assert_eq!(
            self.state_cntr.iter().sum::<u32>() as usize,
            self.reqs.len(),
            "state counters out of balance"
        );
    }

    pub fn get(&self, idx: u16) -> &TcpRequest {
        &self.reqs[idx as usize]
    }

    pub fn get_mut(&mut self, idx: u16) -> &mut TcpRequest {
        &mut self.reqs[idx as usize]
    }

    /// Find the live request owning `ttag`; requests in `Free` do not count.
    pub fn by_ttag(&self, ttag: u16) -> Option<u16> {
        self.reqs
            .iter()
            .find(|r| r.ttag == ttag && r.state != ReqState::Free)
            .map(|r| r.idx)
    }

    /// Find a live request by command id.
    pub fn by_cid(&self, cid: u16) -> Option<u16> {
        self.reqs
            .iter()
            .find(|r| r.state != ReqState::Free && r.cmd.cid.get() == cid)
            .map(|r| r.idx)
    }

    /// Indexes of all requests currently in `state`.
    pub fn in_state(&self, state: ReqState) -> Vec<u16> {
        self.reqs.iter().filter(|r| r.state == state).map(|r| r.idx).collect()
    }
}
