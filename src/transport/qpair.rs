// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One TCP connection: the PDU receive state machine, the per-request
//! lifecycle, and the response emission paths.
//!
//! A qpair is owned by exactly one task. Socket bytes, PDU decoding and all
//! request-state mutation happen on that task; block-device completions,
//! buffer grants and controller messages arrive through the event channel
//! and are folded in between socket reads. One PDU is in flight on the
//! receive side at any time.

use std::{io::IoSlice, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Result, bail};
use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use zerocopy::{FromBytes, IntoBytes};

use crate::{
    bdev::{IoCompletion, IoRequest, IoStatus, IoType},
    ctrlr::{
        admin::{AdminDisposition, AdminEnv, handle_admin},
        connect::handle_connect,
        controller::Controller,
        io as io_cmd,
        properties::{handle_property_get, handle_property_set},
    },
    nvme::{
        fabrics::{ConnectCmd, ConnectData, FabricsCmdType, PropertyGetCmd, PropertySetCmd},
        types::{
            self, FUSE_FIRST, FUSE_NONE, FUSE_SECOND, IoOpcode, SGL_SUBTYPE_OFFSET,
            SGL_SUBTYPE_TRANSPORT, SGL_TYPE_DATA_BLOCK, SGL_TYPE_TRANSPORT_DATA_BLOCK, Sct,
            XferDir,
        },
    },
    pdu::{
        capsule::{CAPSULE_CMD_HDR_LEN, CAPSULE_RESP_HDR_LEN, CapsuleCmd, CapsuleRespBuilder},
        common::{
            COMMON_HDR_LEN, CommonHeader, DIGEST_LEN, PduHeader, PduType,
            QPAIR_EXIT_TIMEOUT_SECS,
        },
        data::{C2hDataBuilder, DATA_HDR_LEN, DataHdr},
        digest::{
            DigestAccum, SharedDigestEngine, calc_header_digest, digest_from_wire,
            digest_to_wire,
        },
        ic::{IC_PDU_LEN, IcReq, IcRespBuilder, PDA_MAX},
        parse::Pdu,
        r2t::{R2T_HDR_LEN, R2tBuilder},
        sgl::{MAX_SGL_DESCRIPTORS, build_iovs, copy_into_iovs},
        term::{C2hTermReqBuilder, Fes, TERM_REQ_HDR_LEN, TERM_REQ_MAX_DATA, TermReq},
    },
    transport::{
        CONTROL_MSG_SIZE,
        pool::{BufPool, PooledBuf},
        request::{DataBuf, ReqSlab, ReqState, ZcopyPhase},
        target::TargetCtx,
    },
};

/// Floor for the receive buffer, whatever the digest negotiation removed.
const RECV_BUF_MIN: usize = 8192;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpairState {
    Invalid,
    Initializing,
    Running,
    Exiting,
    Exited,
}

/// Receive-side state, one PDU at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    AwaitReady,
    AwaitCh,
    AwaitPsh,
    AwaitReq,
    AwaitPayload,
    Error,
}

/// Cross-task messages a qpair consumes between socket reads.
#[derive(Debug)]
pub enum QpairEvent {
    BdevDone { idx: u16, completion: IoCompletion },
    FusedDone { first: u16, second: u16, status: IoStatus, bufs: Vec<BytesMut> },
    BufferGranted { idx: u16, bufs: Vec<PooledBuf> },
    CtrlMsgGranted { idx: u16, buf: PooledBuf },
    ZcopyStartDone { idx: u16, result: std::result::Result<Vec<BytesMut>, IoStatus> },
    ZcopyEndDone { idx: u16, status: IoStatus, commit: bool },
    CompleteAer { cid: u16, value: u32 },
    AbortAer { cid: u16 },
    Abort { cid: u16, reply: oneshot::Sender<bool> },
}

/// The address another task uses to reach a qpair.
#[derive(Debug, Clone)]
pub struct QpairHandle {
    pub qid: u16,
    pub cancel: CancellationToken,
    pub events: mpsc::UnboundedSender<QpairEvent>,
}

/// Where the in-flight PDU's payload lands.
#[derive(Debug)]
enum PayloadDest {
    /// No usable buffer; bytes are drained and dropped.
    Discard,
    /// Into the request's data buffers starting at this logical offset.
    Request { idx: u16, base: usize },
    /// Diagnostic data of an inbound H2C_TERM_REQ.
    Term(Vec<u8>),
    /// Waiting for a control-message buffer grant; receive is stalled.
    Pending { idx: u16 },
}

/// The single in-flight inbound PDU descriptor.
#[derive(Debug)]
struct RecvPdu {
    ch: CommonHeader,
    /// Collected header bytes (common + type-specific [+ header digest]).
    header: Vec<u8>,
    psh_need: usize,
    req_idx: Option<u16>,
    dest: PayloadDest,
    payload_len: usize,
    payload_recvd: usize,
    padding_left: usize,
    ddgst_applies: bool,
    accum: DigestAccum,
    ddgst: [u8; 4],
    ddgst_recvd: usize,
}

impl RecvPdu {
    fn new(ch: CommonHeader, psh_need: usize) -> Self {
        Self {
            ch,
            header: Vec::new(),
            psh_need,
            req_idx: None,
            dest: PayloadDest::Discard,
            payload_len: 0,
            payload_recvd: 0,
            padding_left: 0,
            ddgst_applies: false,
            accum: DigestAccum::default(),
            ddgst: [0; 4],
            ddgst_recvd: 0,
        }
    }
}

pub struct TcpQpair {
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<TargetCtx>,
    data_pool: Arc<BufPool>,
    ctrl_msg_pool: Arc<BufPool>,
    digest_engine: SharedDigestEngine,

    state: QpairState,
    recv_state: RecvState,
    in_progress: Option<RecvPdu>,
    recv_buf: BytesMut,

    slab: ReqSlab,
    resource_count: u16,
    pending_resize: Option<u16>,
    sqhd: u16,

    host_hdgst: bool,
    host_ddgst: bool,
    hpda: u8,
    maxh2cdata: u32,

    qid: Option<u16>,
    ctrlr: Option<Arc<Controller>>,
    first_fused: Option<u16>,
    /// Parked Async Event Requests: (cid, request index).
    aer_reqs: Vec<(u16, u16)>,

    events_tx: mpsc::UnboundedSender<QpairEvent>,
    events_rx: mpsc::UnboundedReceiver<QpairEvent>,
    pub cancel: CancellationToken,
}

impl TcpQpair {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        ctx: Arc<TargetCtx>,
        data_pool: Arc<BufPool>,
        ctrl_msg_pool: Arc<BufPool>,
        digest_engine: SharedDigestEngine,
        cancel: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let icd = ctx.opts.in_capsule_data_size as usize;
        let maxh2cdata = ctx.opts.maxh2cdata();
        Self {
            stream,
            peer,
            ctx,
            data_pool,
            ctrl_msg_pool,
            digest_engine,
            state: QpairState::Invalid,
            recv_state: RecvState::AwaitReady,
            in_progress: None,
            recv_buf: BytesMut::with_capacity(RECV_BUF_MIN),
            // One bootstrap request carries the connection through IC and
            // Connect; the slab is resized to the negotiated depth after.
            slab: ReqSlab::new(1, icd),
            resource_count: 1,
            pending_resize: None,
            sqhd: 0,
            host_hdgst: false,
            host_ddgst: false,
            hpda: 0,
            maxh2cdata,
            qid: None,
            ctrlr: None,
            first_fused: None,
            aer_reqs: Vec::new(),
            events_tx,
            events_rx,
            cancel,
        }
    }

    pub fn handle(&self) -> QpairHandle {
        QpairHandle {
            qid: self.qid.unwrap_or(0),
            cancel: self.cancel.clone(),
            events: self.events_tx.clone(),
        }
    }

    /// Drive the connection until it dies.
    pub async fn run(mut self) {
        debug!(peer = %self.peer, "qpair up");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                ev = self.events_rx.recv() => {
                    match ev {
                        Some(ev) => {
                            if self.handle_event(ev).await.is_err() {
                                break;
                            }
                        },
                        None => break,
                    }
                },
                read = self.stream.read_buf(&mut self.recv_buf) => {
                    match read {
                        Ok(0) => {
                            trace!(peer = %self.peer, "peer closed");
                            break;
                        },
                        Ok(_) => {
                            if self.drive_recv().await.is_err() {
                                break;
                            }
                        },
                        Err(e) => {
                            debug!(peer = %self.peer, "socket error: {e}");
                            break;
                        },
                    }
                },
            }
        }
        self.cleanup().await;
    }

    // ── receive state machine ────────────────────────────────────────────

    async fn drive_recv(&mut self) -> Result<()> {
        loop {
            match self.recv_state {
                RecvState::AwaitReady => {
                    if self.recv_buf.is_empty() {
                        return Ok(());
                    }
                    self.recv_state = RecvState::AwaitCh;
                },
                RecvState::AwaitCh => {
                    if self.recv_buf.len() < COMMON_HDR_LEN {
                        return Ok(());
                    }
                    self.handle_ch().await?;
                },
                RecvState::AwaitPsh => {
                    let need = self.in_progress.as_ref().map(|p| p.psh_need).unwrap_or(0);
                    if self.recv_buf.len() < need {
                        return Ok(());
                    }
                    self.handle_psh().await?;
                },
                RecvState::AwaitReq => {
                    self.handle_await_req().await?;
                },
                RecvState::AwaitPayload => {
                    if !self.handle_payload().await? {
                        return Ok(());
                    }
                },
                RecvState::Error => {
                    self.recv_buf.clear();
                    return Ok(());
                },
            }
        }
    }

    async fn handle_ch(&mut self) -> Result<()> {
        let ch = Pdu::common_from_bytes(&self.recv_buf[..COMMON_HDR_LEN])?;

        let Some(pdu_type) = ch.pdu_type.known() else {
            warn!(raw = ch.pdu_type.raw(), "unknown pdu type");
            return self.enter_error(Fes::InvalidHeaderField, 0).await;
        };
        if !pdu_type.host_to_controller() {
            return self.enter_error(Fes::InvalidHeaderField, 0).await;
        }

        // IC_REQ opens the connection; anything else is only legal once the
        // qpair is running, and a second IC_REQ never is.
        let sequenced = match (self.state, pdu_type) {
            (QpairState::Invalid, PduType::IcReq) => true,
            (QpairState::Running, PduType::IcReq) => false,
            (QpairState::Running, _) => true,
            _ => false,
        };
        if !sequenced {
            return self.enter_error(Fes::PduSequenceError, 0).await;
        }

        if ch.hlen as usize != pdu_type.header_len() {
            return self.enter_error(Fes::InvalidHeaderField, 2).await;
        }
        let hdgst_len = ch.hdgst_len(self.host_hdgst);
        let plen = ch.plen.get() as usize;
        if plen < ch.hlen as usize + hdgst_len {
            return self.enter_error(Fes::InvalidHeaderField, 4).await;
        }
        if pdu_type == PduType::IcReq && plen != IC_PDU_LEN {
            return self.enter_error(Fes::InvalidHeaderField, 4).await;
        }
        if pdu_type == PduType::H2cTermReq && plen > TERM_REQ_HDR_LEN + TERM_REQ_MAX_DATA {
            return self.enter_error(Fes::InvalidHeaderField, 4).await;
        }

        let psh_need = pdu_type.header_len() + hdgst_len;
        self.in_progress = Some(RecvPdu::new(ch, psh_need));
        self.recv_state = RecvState::AwaitPsh;
        Ok(())
    }

    async fn handle_psh(&mut self) -> Result<()> {
        let mut pdu = self.in_progress.take().expect("psh without pdu in progress");
        pdu.header = self.recv_buf.split_to(pdu.psh_need).to_vec();
        let hlen = pdu.ch.hlen as usize;

        // Header digest covers exactly hlen bytes.
        if pdu.ch.hdgst_len(self.host_hdgst) != 0 {
            let want = digest_from_wire(
                pdu.header[hlen..hlen + DIGEST_LEN].try_into().expect("digest word"),
            );
            let got = calc_header_digest(&pdu.header[..hlen]);
            if want != got {
                warn!(peer = %self.peer, "header digest mismatch");
                self.in_progress = Some(pdu);
                return self.enter_error(Fes::HdgstError, hlen as u32).await;
            }
        }

        let pdu_type = pdu.ch.pdu_type.known().expect("validated in AwaitCh");
        match pdu_type {
            PduType::IcReq => {
                let ic = IcReq::from_header_bytes(&pdu.header[..hlen])?;
                self.in_progress = Some(pdu);
                self.process_icreq(&ic).await?;
            },
            PduType::CapsuleCmd => {
                self.in_progress = Some(pdu);
                self.recv_state = RecvState::AwaitReq;
            },
            PduType::H2cData => {
                let hdr = DataHdr::from_header_bytes(&pdu.header[..hlen], PduType::H2cData)?;
                self.process_h2c_data_hdr(&hdr, pdu).await?;
            },
            PduType::H2cTermReq => {
                let term =
                    TermReq::from_header_bytes(&pdu.header[..hlen], PduType::H2cTermReq)?;
                info!(
                    peer = %self.peer,
                    fes = term.fes.get(),
                    fei = term.fei.get(),
                    "host sent termination request"
                );
                let data_len = pdu.ch.plen.get() as usize - hlen;
                if data_len == 0 {
                    bail!("connection terminated by host");
                }
                pdu.payload_len = data_len;
                pdu.dest = PayloadDest::Term(Vec::with_capacity(data_len));
                self.in_progress = Some(pdu);
                self.recv_state = RecvState::AwaitPayload;
            },
            _ => {
                self.in_progress = Some(pdu);
                return self.enter_error(Fes::InvalidHeaderField, 0).await;
            },
        }
        Ok(())
    }

    /// CAPSULE_CMD only: claim a request and bind the in-capsule payload.
    /// On entry the in-flight PDU owns no request yet.
    async fn handle_await_req(&mut self) -> Result<()> {
        let mut pdu = self.in_progress.take().expect("await-req without pdu");
        debug_assert!(pdu.req_idx.is_none());

        let Some(idx) = self.slab.alloc() else {
            // The host overcommitted its queue depth; nothing sane to reply.
            warn!(peer = %self.peer, "no free request for capsule, disconnecting");
            bail!("request slab exhausted");
        };

        let capsule = CapsuleCmd::from_header_bytes(&pdu.header[..CAPSULE_CMD_HDR_LEN])?;
        {
            let req = self.slab.get_mut(idx);
            req.cmd = capsule.sqe;
            req.xfer = capsule.sqe.data_transfer();
        }
        pdu.req_idx = Some(idx);

        let data_len = pdu.ch.data_len(self.host_ddgst);
        if data_len == 0 {
            self.in_progress = None;
            self.recv_state = RecvState::AwaitCh;
            return self.req_process(idx).await;
        }

        // Data offset sanity: we advertise CPDA 0, so pdo only has to clear
        // the header (+ digest).
        let hdgst = pdu.ch.hdgst_len(self.host_hdgst);
        let pdo = pdu.ch.pdo as usize;
        if pdo < CAPSULE_CMD_HDR_LEN + hdgst || pdo > pdu.ch.plen.get() as usize {
            self.in_progress = Some(pdu);
            return self.enter_error(Fes::InvalidHeaderField, 3).await;
        }
        pdu.padding_left = pdo - (CAPSULE_CMD_HDR_LEN + hdgst);
        pdu.payload_len = data_len;
        pdu.ddgst_applies = pdu.ch.ddgst_len(self.host_ddgst) != 0;

        let icd_cap = self.ctx.opts.in_capsule_data_size as usize;
        if data_len <= icd_cap {
            let req = self.slab.get_mut(idx);
            req.length = data_len as u32;
            req.buf = DataBuf::InCapsule;
            pdu.dest = PayloadDest::Request { idx, base: 0 };
        } else if data_len <= CONTROL_MSG_SIZE as usize && self.admin_capable() {
            // Admin/fabrics capsules may exceed the arena up to the
            // control-message size; pull one message buffer.
            self.slab.get_mut(idx).length = data_len as u32;
            match self.ctrl_msg_pool.try_get(1) {
                Some(mut bufs) => {
                    let buf = bufs.pop().expect("one buffer");
                    self.slab.get_mut(idx).buf = DataBuf::CtrlMsg(buf);
                    pdu.dest = PayloadDest::Request { idx, base: 0 };
                },
                None => {
                    let pool = Arc::clone(&self.ctrl_msg_pool);
                    let tx = self.events_tx.clone();
                    tokio::spawn(async move {
                        let mut bufs = pool.get(1).await;
                        let buf = bufs.pop().expect("one buffer");
                        let _ = tx.send(QpairEvent::CtrlMsgGranted { idx, buf });
                    });
                    pdu.dest = PayloadDest::Pending { idx };
                },
            }
        } else {
            // Oversized in-capsule data: drain it, then fail the command.
            let req = self.slab.get_mut(idx);
            req.length = 0;
            req.rsp.set_status(Sct::Generic, types::generic::DATA_SGL_LENGTH_INVALID);
            req.rsp.set_dnr();
            pdu.dest = PayloadDest::Discard;
        }

        self.in_progress = Some(pdu);
        self.recv_state = RecvState::AwaitPayload;
        Ok(())
    }

    async fn process_h2c_data_hdr(&mut self, hdr: &DataHdr, mut pdu: RecvPdu) -> Result<()> {
        let ttag = hdr.ttag.get();
        let datao = hdr.datao.get();
        let datal = hdr.datal.get();

        let Some(idx) = self.slab.by_ttag(ttag) else {
            warn!(ttag, "h2c data with unknown ttag");
            self.in_progress = Some(pdu);
            return self.enter_error(Fes::InvalidHeaderField, 10).await;
        };
        let req = self.slab.get(idx);
        if req.cmd.cid.get() != hdr.cccid.get() {
            self.in_progress = Some(pdu);
            return self.enter_error(Fes::InvalidHeaderField, 8).await;
        }
        if req.state != ReqState::TransferringHostToController {
            self.in_progress = Some(pdu);
            return self.enter_error(Fes::PduSequenceError, 0).await;
        }
        // A single full-length R2T was granted: chunks must arrive in order,
        // without overlap, and stay inside the window.
        let in_order = datao == req.h2c_offset;
        let in_range = datal > 0
            && (datao as u64 + datal as u64) <= req.length as u64
            && datal <= self.maxh2cdata;
        if !in_order || !in_range {
            warn!(datao, datal, h2c_offset = req.h2c_offset, "h2c window violation");
            self.in_progress = Some(pdu);
            return self.enter_error(Fes::DataTransferOutOfRange, 12).await;
        }
        let data_len = pdu.ch.data_len(self.host_ddgst);
        if data_len != datal as usize {
            self.in_progress = Some(pdu);
            return self.enter_error(Fes::InvalidHeaderField, 16).await;
        }

        let hdgst = pdu.ch.hdgst_len(self.host_hdgst);
        let pdo = pdu.ch.pdo as usize;
        if pdo < DATA_HDR_LEN + hdgst || pdo > pdu.ch.plen.get() as usize {
            self.in_progress = Some(pdu);
            return self.enter_error(Fes::InvalidHeaderField, 3).await;
        }
        pdu.padding_left = pdo - (DATA_HDR_LEN + hdgst);
        pdu.payload_len = datal as usize;
        pdu.ddgst_applies = pdu.ch.ddgst_len(self.host_ddgst) != 0;
        pdu.req_idx = Some(idx);
        pdu.dest = PayloadDest::Request { idx, base: datao as usize };
        self.in_progress = Some(pdu);
        self.recv_state = RecvState::AwaitPayload;
        Ok(())
    }

    /// Move payload bytes from the socket buffer into their destination.
    /// Returns `false` when more socket data (or a buffer grant) is needed.
    async fn handle_payload(&mut self) -> Result<bool> {
        let mut pdu = self.in_progress.take().expect("payload without pdu");

        // A capsule waiting on a control-message buffer keeps its bytes in
        // the socket buffer until the grant lands.
        if matches!(pdu.dest, PayloadDest::Pending { .. }) {
            self.in_progress = Some(pdu);
            return Ok(false);
        }

        // Padding between header and data segment is discarded.
        if pdu.padding_left > 0 {
            let skip = pdu.padding_left.min(self.recv_buf.len());
            let _ = self.recv_buf.split_to(skip);
            pdu.padding_left -= skip;
            if pdu.padding_left > 0 {
                self.in_progress = Some(pdu);
                return Ok(false);
            }
        }

        while pdu.payload_recvd < pdu.payload_len && !self.recv_buf.is_empty() {
            let take = (pdu.payload_len - pdu.payload_recvd).min(self.recv_buf.len());
            let chunk = self.recv_buf.split_to(take);
            match &mut pdu.dest {
                PayloadDest::Discard | PayloadDest::Pending { .. } => {},
                PayloadDest::Term(buf) => buf.extend_from_slice(&chunk),
                PayloadDest::Request { idx, base } => {
                    let offset = *base + pdu.payload_recvd;
                    let req = self.slab.get_mut(*idx);
                    let mut slices = req.data_slices_mut();
                    copy_into_iovs(&mut slices, offset, &chunk);
                },
            }
            if pdu.ddgst_applies {
                pdu.accum.update(&chunk);
            }
            pdu.payload_recvd += take;
        }
        if pdu.payload_recvd < pdu.payload_len {
            self.in_progress = Some(pdu);
            return Ok(false);
        }

        if pdu.ddgst_applies {
            while pdu.ddgst_recvd < DIGEST_LEN && !self.recv_buf.is_empty() {
                pdu.ddgst[pdu.ddgst_recvd] = self.recv_buf[0];
                let _ = self.recv_buf.split_to(1);
                pdu.ddgst_recvd += 1;
            }
            if pdu.ddgst_recvd < DIGEST_LEN {
                self.in_progress = Some(pdu);
                return Ok(false);
            }
            let want = digest_from_wire(pdu.ddgst);
            let got = pdu.accum.finish();
            if want != got {
                // Digest errors on a data segment are survivable: the
                // command completes with a transient transport status and
                // the host retries.
                warn!(peer = %self.peer, "data digest mismatch");
                if let Some(idx) = pdu.req_idx {
                    self.slab.get_mut(idx).ddgst_failed = true;
                }
            }
        }

        self.recv_state = RecvState::AwaitCh;
        self.pdu_payload_complete(pdu).await?;
        Ok(true)
    }

    async fn pdu_payload_complete(&mut self, pdu: RecvPdu) -> Result<()> {
        match pdu.ch.pdu_type.known() {
            Some(PduType::CapsuleCmd) => {
                let idx = pdu.req_idx.expect("capsule payload without request");
                self.req_process(idx).await
            },
            Some(PduType::H2cData) => {
                let idx = pdu.req_idx.expect("h2c payload without request");
                {
                    let req = self.slab.get_mut(idx);
                    req.h2c_offset += pdu.payload_len as u32;
                }
                let req = self.slab.get(idx);
                if req.h2c_offset == req.length {
                    self.slab.set_state(idx, ReqState::ReadyToExecute);
                    self.req_process(idx).await
                } else {
                    Ok(())
                }
            },
            Some(PduType::H2cTermReq) => {
                if let PayloadDest::Term(data) = &pdu.dest {
                    debug!(len = data.len(), "h2c term diagnostic data");
                }
                bail!("connection terminated by host");
            },
            _ => Ok(()),
        }
    }

    // ── IC handshake ─────────────────────────────────────────────────────

    async fn process_icreq(&mut self, ic: &IcReq) -> Result<()> {
        self.state = QpairState::Initializing;

        if ic.pfv.get() != 0 {
            return self.enter_error(Fes::UnsupportedParameter, 8).await;
        }
        if ic.hpda > PDA_MAX {
            return self.enter_error(Fes::InvalidHeaderField, 10).await;
        }

        self.host_hdgst = ic.dgst.hdgst();
        self.host_ddgst = ic.dgst.ddgst();
        self.hpda = ic.hpda;

        // Size the receive pipe for capsules with in-capsule data; disabled
        // digests shrink it, never below the floor.
        let mut per_pdu =
            CAPSULE_CMD_HDR_LEN + self.ctx.opts.in_capsule_data_size as usize + 2 * DIGEST_LEN;
        if !self.host_hdgst {
            per_pdu -= DIGEST_LEN;
        }
        if !self.host_ddgst {
            per_pdu -= DIGEST_LEN;
        }
        let want = (2 * per_pdu).max(RECV_BUF_MIN);
        if self.recv_buf.capacity() < want {
            self.recv_buf.reserve(want - self.recv_buf.capacity());
        }

        let resp = IcRespBuilder::new()
            .cpda(0)
            .hdgst(self.host_hdgst)
            .ddgst(self.host_ddgst)
            .maxh2cdata(self.maxh2cdata)
            .header;
        let mut buf = vec![0u8; IC_PDU_LEN];
        resp.to_header_bytes(&mut buf)?;
        write_wire(&mut self.stream, &buf, 0, &[], None).await?;

        debug!(
            peer = %self.peer,
            hdgst = self.host_hdgst,
            ddgst = self.host_ddgst,
            maxh2cdata = self.maxh2cdata,
            "connection initialized"
        );
        self.state = QpairState::Running;
        self.in_progress = None;
        self.recv_state = RecvState::AwaitCh;
        Ok(())
    }

    // ── request state machine ────────────────────────────────────────────

    /// Advance one request until it suspends or frees.
    async fn req_process(&mut self, idx: u16) -> Result<()> {
        loop {
            let state = self.slab.get(idx).state;
            match state {
                ReqState::New => {
                    if !self.req_new(idx).await? {
                        return Ok(());
                    }
                },
                ReqState::NeedBuffer => {
                    if !self.req_need_buffer(idx).await? {
                        return Ok(());
                    }
                },
                ReqState::ZcopyStartCompleted => {
                    if self.slab.get(idx).xfer == XferDir::HostToController {
                        self.begin_h2c(idx).await?;
                        return Ok(());
                    }
                    self.slab.set_state(idx, ReqState::ReadyToExecute);
                },
                ReqState::ReadyToExecute => {
                    if !self.req_execute(idx).await? {
                        return Ok(());
                    }
                },
                ReqState::Executed => {
                    self.slab.set_state(idx, ReqState::ReadyToComplete);
                },
                ReqState::ReadyToComplete => {
                    self.req_complete_transfer(idx).await?;
                },
                ReqState::Completed => {
                    self.req_free(idx);
                    return Ok(());
                },
                // Suspended states wait for an event or more socket data.
                ReqState::AwaitingZcopyStart
                | ReqState::AwaitingR2tAck
                | ReqState::TransferringHostToController
                | ReqState::Executing
                | ReqState::AwaitingZcopyCommit
                | ReqState::TransferringControllerToHost
                | ReqState::AwaitingZcopyRelease
                | ReqState::Free => return Ok(()),
            }
        }
    }

    /// Parse the fresh command; returns `false` when the request suspended.
    async fn req_new(&mut self, idx: u16) -> Result<bool> {
        // Early failure recorded while the capsule streamed in.
        if self.slab.get(idx).rsp.sc() != 0 {
            self.slab.set_state(idx, ReqState::Executed);
            return Ok(true);
        }

        if let Some(kick) = self.handle_fuse(idx) {
            Box::pin(self.req_process(kick)).await?;
        }

        let (sgl_type, sgl_subtype, sgl_len, sgl_addr, has_icd) = {
            let req = self.slab.get(idx);
            (
                req.cmd.dptr.sgl_type(),
                req.cmd.dptr.sgl_subtype(),
                req.cmd.dptr.length.get(),
                req.cmd.dptr.address.get(),
                matches!(req.buf, DataBuf::InCapsule | DataBuf::CtrlMsg(_)),
            )
        };

        if sgl_len == 0 {
            self.slab.get_mut(idx).length = 0;
            self.slab.set_state(idx, ReqState::ReadyToExecute);
            return Ok(true);
        }

        match (sgl_type, sgl_subtype) {
            (SGL_TYPE_TRANSPORT_DATA_BLOCK, SGL_SUBTYPE_TRANSPORT) => {
                if sgl_len > self.ctx.opts.max_io_size {
                    self.fail_req(idx, Sct::Generic, types::generic::DATA_SGL_LENGTH_INVALID);
                    return Ok(true);
                }
                self.slab.get_mut(idx).length = sgl_len;
                self.slab.set_state(idx, ReqState::NeedBuffer);
                Ok(true)
            },
            (SGL_TYPE_DATA_BLOCK, SGL_SUBTYPE_OFFSET) => {
                // In-capsule data: the payload already streamed into the
                // arena (or a control-message buffer). ICDOFF is zero.
                let received = self.slab.get(idx).length;
                if !has_icd || sgl_addr != 0 || sgl_len > received {
                    self.fail_req(idx, Sct::Generic, types::generic::DATA_SGL_LENGTH_INVALID);
                    return Ok(true);
                }
                if self.slab.get(idx).xfer != XferDir::HostToController {
                    self.fail_req(
                        idx,
                        Sct::Generic,
                        types::generic::SGL_DESCRIPTOR_TYPE_INVALID,
                    );
                    return Ok(true);
                }
                self.slab.get_mut(idx).length = sgl_len;
                self.slab.set_state(idx, ReqState::ReadyToExecute);
                Ok(true)
            },
            _ => {
                debug!(sgl_type, sgl_subtype, "unsupported sgl descriptor");
                self.fail_req(idx, Sct::Generic, types::generic::SGL_DESCRIPTOR_TYPE_INVALID);
                Ok(true)
            },
        }
    }

    /// Track fused Compare + Write pairing. Returns a parked request that
    /// now needs a push through the state machine, if any.
    fn handle_fuse(&mut self, idx: u16) -> Option<u16> {
        match self.slab.get(idx).cmd.fuse() {
            FUSE_FIRST => {
                let orphan = self.first_fused.replace(idx);
                if let Some(orphan) = orphan {
                    // Consecutive FIRST without its SECOND: the parked half
                    // dies with a missing-fused abort.
                    self.slab.get_mut(orphan).fused_failed = true;
                    if self.slab.get(orphan).state == ReqState::ReadyToExecute {
                        return Some(orphan);
                    }
                }
                None
            },
            FUSE_SECOND => match self.first_fused.take() {
                Some(first) => {
                    let second_is_write = self.slab.get(idx).cmd.opc == IoOpcode::Write as u8;
                    let first_is_compare =
                        self.slab.get(first).cmd.opc == IoOpcode::Compare as u8;
                    self.slab.get_mut(first).fused_pair = Some(idx);
                    self.slab.get_mut(idx).fused_pair = Some(first);
                    if !second_is_write || !first_is_compare {
                        self.slab.get_mut(first).fused_failed = true;
                        self.slab.get_mut(idx).fused_failed = true;
                        if self.slab.get(first).state == ReqState::ReadyToExecute {
                            return Some(first);
                        }
                    }
                    None
                },
                None => {
                    self.slab.get_mut(idx).fused_failed = true;
                    None
                },
            },
            _ => {
                let orphan = self.first_fused.take();
                if let Some(orphan) = orphan {
                    self.slab.get_mut(orphan).fused_failed = true;
                    if self.slab.get(orphan).state == ReqState::ReadyToExecute {
                        return Some(orphan);
                    }
                }
                None
            },
        }
    }

    /// Resolve buffers for a transport SGL. Returns `false` on suspension.
    async fn req_need_buffer(&mut self, idx: u16) -> Result<bool> {
        let (length, xfer, opc_raw, fused) = {
            let req = self.slab.get(idx);
            (req.length, req.xfer, req.cmd.opc, req.cmd.fuse() != FUSE_NONE)
        };

        // Zero-copy short-circuit for plain reads/writes on capable devices.
        if self.qid.unwrap_or(0) != 0 {
            if let (Some(ns), Some(opc)) = (self.io_namespace(idx), IoOpcode::from_u8(opc_raw))
            {
                if io_cmd::zcopy_eligible(&ns, opc, fused) {
                    return self.begin_zcopy_start(idx, &ns, opc).await;
                }
            }
        }

        let unit = self.data_pool.buf_size();
        let n = (length as usize).div_ceil(unit);
        match self.data_pool.try_get(n) {
            Some(bufs) => {
                self.slab.get_mut(idx).buf = DataBuf::Pooled(bufs);
                if xfer == XferDir::HostToController {
                    self.begin_h2c(idx).await?;
                    return Ok(false);
                }
                self.slab.set_state(idx, ReqState::ReadyToExecute);
                Ok(true)
            },
            None => {
                // Park FIFO on the pool; the grant resumes this request.
                let pool = Arc::clone(&self.data_pool);
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    let bufs = pool.get(n).await;
                    let _ = tx.send(QpairEvent::BufferGranted { idx, bufs });
                });
                Ok(false)
            },
        }
    }

    async fn begin_zcopy_start(
        &mut self,
        idx: u16,
        ns: &Arc<crate::subsystem::Namespace>,
        opc: IoOpcode,
    ) -> Result<bool> {
        let (slba, nlb) = io_cmd::lba_span(self.slab.get(idx));
        let populate = opc == IoOpcode::Read;
        self.slab.get_mut(idx).zcopy_phase = ZcopyPhase::Init;
        self.slab.set_state(idx, ReqState::AwaitingZcopyStart);

        let bdev = Arc::clone(&ns.bdev);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = bdev.zcopy_start(slba, nlb, populate).await;
            let _ = tx.send(QpairEvent::ZcopyStartDone { idx, result });
        });
        Ok(false)
    }

    /// Grant the host its write window: a single R2T for the full length.
    async fn begin_h2c(&mut self, idx: u16) -> Result<()> {
        self.slab.set_state(idx, ReqState::AwaitingR2tAck);
        let (cid, ttag, length) = {
            let req = self.slab.get(idx);
            (req.cid(), req.ttag, req.length)
        };
        let r2t = R2tBuilder::new().cccid(cid).ttag(ttag).window(0, length).header;
        self.send_header_pdu(r2t, R2T_HDR_LEN).await?;
        // The write drained: that is the R2T ack in this transport.
        self.slab.set_state(idx, ReqState::TransferringHostToController);
        Ok(())
    }

    /// Run the command. Returns `false` when the request suspended.
    async fn req_execute(&mut self, idx: u16) -> Result<bool> {
        // Transport-level failures recorded on the way in win over execution.
        if self.slab.get(idx).ddgst_failed {
            let req = self.slab.get_mut(idx);
            req.rsp.set_status(
                Sct::Generic,
                types::generic::COMMAND_TRANSIENT_TRANSPORT_ERROR,
            );
            self.slab.set_state(idx, ReqState::Executed);
            return Ok(true);
        }
        if self.slab.get(idx).fused_failed {
            let sc = if self.slab.get(idx).fused_pair.is_none() {
                types::generic::ABORTED_MISSING_FUSED
            } else {
                types::generic::ABORTED_FAILED_FUSED
            };
            self.fail_req(idx, Sct::Generic, sc);
            return Ok(true);
        }

        if self.slab.get(idx).cmd.is_fabrics() {
            self.execute_fabrics(idx).await?;
            return Ok(true);
        }

        let Some(ctrlr) = self.ctrlr.clone() else {
            // Everything before a successful Connect is out of sequence.
            self.fail_req(idx, Sct::Generic, types::generic::COMMAND_SEQUENCE_ERROR);
            return Ok(true);
        };

        if self.qid.unwrap_or(0) == 0 {
            let env = AdminEnv {
                ctrlr: &ctrlr,
                registry: &self.ctx.registry,
                listeners: self.ctx.listeners(),
            };
            let disposition = handle_admin(&env, self.slab.get_mut(idx)).await;
            match disposition {
                AdminDisposition::Complete => {
                    self.slab.set_state(idx, ReqState::Executed);
                    Ok(true)
                },
                AdminDisposition::AerParked => {
                    let cid = self.slab.get(idx).cid();
                    self.aer_reqs.push((cid, idx));
                    self.slab.set_state(idx, ReqState::Executing);
                    Ok(false)
                },
            }
        } else {
            self.execute_io(idx, &ctrlr).await
        }
    }

    async fn execute_fabrics(&mut self, idx: u16) -> Result<()> {
        let fctype = self.slab.get(idx).cmd.as_bytes()[4];
        match FabricsCmdType::from_u8(fctype) {
            Some(FabricsCmdType::Connect) => self.execute_connect(idx).await,
            Some(FabricsCmdType::PropertyGet) => {
                let Some(ctrlr) = self.admin_ctrlr(idx) else {
                    return Ok(());
                };
                ctrlr.touch_keep_alive();
                let cmd = PropertyGetCmd::from_cmd(&self.slab.get(idx).cmd)?;
                handle_property_get(&ctrlr, &cmd, &mut self.slab.get_mut(idx).rsp);
                self.slab.set_state(idx, ReqState::Executed);
                Ok(())
            },
            Some(FabricsCmdType::PropertySet) => {
                let Some(ctrlr) = self.admin_ctrlr(idx) else {
                    return Ok(());
                };
                ctrlr.touch_keep_alive();
                let cmd = PropertySetCmd::from_cmd(&self.slab.get(idx).cmd)?;
                handle_property_set(&ctrlr, &cmd, &mut self.slab.get_mut(idx).rsp);
                self.slab.set_state(idx, ReqState::Executed);
                Ok(())
            },
            _ => {
                debug!(fctype, "unsupported fabrics command");
                self.fail_req(idx, Sct::Generic, types::generic::INVALID_OPCODE);
                Ok(())
            },
        }
    }

    fn admin_ctrlr(&mut self, idx: u16) -> Option<Arc<Controller>> {
        match (&self.ctrlr, self.qid) {
            (Some(ctrlr), Some(0)) => Some(Arc::clone(ctrlr)),
            _ => {
                self.fail_req(idx, Sct::Generic, types::generic::COMMAND_SEQUENCE_ERROR);
                None
            },
        }
    }

    async fn execute_connect(&mut self, idx: u16) -> Result<()> {
        if self.ctrlr.is_some() {
            self.fail_req(idx, Sct::Generic, types::generic::COMMAND_SEQUENCE_ERROR);
            return Ok(());
        }
        let data = {
            let req = self.slab.get(idx);
            let mut out = Vec::with_capacity(req.length as usize);
            for s in req.data_slices() {
                out.extend_from_slice(s);
            }
            out
        };
        if ConnectData::read_from_bytes(&data[..]).is_err() {
            self.fail_req(idx, Sct::Generic, types::generic::INVALID_FIELD);
            return Ok(());
        }

        let cmd = self.slab.get(idx).cmd;
        let mut rsp = self.slab.get(idx).rsp;
        let local_addr = self
            .stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let outcome = handle_connect(
            &self.ctx.registry,
            &self.ctx.opts,
            &cmd,
            &data,
            &local_addr,
            &mut rsp,
        )
        .await;
        self.slab.get_mut(idx).rsp = rsp;

        if let Some((ctrlr, qid)) = outcome {
            self.qid = Some(qid);
            self.ctrlr = Some(Arc::clone(&ctrlr));
            ctrlr.register_qpair(QpairHandle {
                qid,
                cancel: self.cancel.clone(),
                events: self.events_tx.clone(),
            });

            // The negotiated depth replaces the bootstrap slab once this
            // command's response is out.
            let sqsize = ConnectCmd::from_cmd(&cmd).map(|c| c.sqsize.get()).unwrap_or(1);
            let cap = if qid == 0 {
                self.ctx.opts.max_aq_depth
            } else {
                self.ctx.opts.max_queue_depth
            };
            self.pending_resize = Some(sqsize.min(cap).max(1));
        }
        self.slab.set_state(idx, ReqState::Executed);
        Ok(())
    }

    fn io_namespace(&self, idx: u16) -> Option<Arc<crate::subsystem::Namespace>> {
        let ctrlr = self.ctrlr.as_ref()?;
        let nsid = self.slab.get(idx).cmd.nsid.get();
        ctrlr.subsys.find_ns(nsid)
    }

    /// Submit an NVM command to the block device. Returns `false` when the
    /// request suspended on the device.
    async fn execute_io(&mut self, idx: u16, ctrlr: &Arc<Controller>) -> Result<bool> {
        let enabled = ctrlr.lock().vcprop.cc_en();
        if !enabled {
            self.fail_req(idx, Sct::Generic, types::generic::COMMAND_SEQUENCE_ERROR);
            return Ok(true);
        }

        let opc_raw = self.slab.get(idx).cmd.opc;
        let Some(opc) = IoOpcode::from_u8(opc_raw) else {
            // No passthru surface on this device class.
            self.fail_req(idx, Sct::Generic, types::generic::INVALID_OPCODE);
            return Ok(true);
        };

        let Some(ns) = self.io_namespace(idx) else {
            self.fail_req(idx, Sct::Generic, types::generic::INVALID_NAMESPACE_OR_FORMAT);
            return Ok(true);
        };

        if let Err((sct, sc)) = io_cmd::check_admission(ctrlr, &ns, opc) {
            self.fail_req(idx, sct, sc);
            return Ok(true);
        }

        // Reservation commands serialize on the subsystem and finish inline.
        if matches!(
            opc,
            IoOpcode::ReservationRegister
                | IoOpcode::ReservationAcquire
                | IoOpcode::ReservationRelease
                | IoOpcode::ReservationReport
        ) {
            let _guard = ctrlr.subsys.resv_serialize.lock().await;
            io_cmd::handle_reservation(ctrlr, &ns, self.slab.get_mut(idx));
            self.slab.set_state(idx, ReqState::Executed);
            return Ok(true);
        }

        // Fused pairs wait for both halves, then go down as one atomic op.
        if self.slab.get(idx).cmd.fuse() != FUSE_NONE {
            return self.execute_fused(idx, &ns).await;
        }

        // Zero-copy requests already carry device buffers.
        if self.slab.get(idx).zcopy_phase != ZcopyPhase::None {
            return self.execute_zcopy(idx, &ns, opc).await;
        }

        let (slba, nlb) = io_cmd::lba_span(self.slab.get(idx));
        let block_size = ns.bdev.block_size() as u64;
        let length = self.slab.get(idx).length as u64;

        let io = match opc {
            IoOpcode::Read | IoOpcode::Write | IoOpcode::Compare => {
                if opc == IoOpcode::Compare && !ns.bdev.supports(IoType::Compare) {
                    self.fail_req(idx, Sct::Generic, types::generic::INVALID_OPCODE);
                    return Ok(true);
                }
                if nlb * block_size != length {
                    self.fail_req(idx, Sct::Generic, types::generic::DATA_SGL_LENGTH_INVALID);
                    return Ok(true);
                }
                let bufs = self.take_data_bufs(idx);
                match opc {
                    IoOpcode::Read => {
                        IoRequest::Read { offset_blocks: slba, num_blocks: nlb, bufs }
                    },
                    IoOpcode::Write => {
                        IoRequest::Write { offset_blocks: slba, num_blocks: nlb, bufs }
                    },
                    _ => IoRequest::Compare { offset_blocks: slba, num_blocks: nlb, bufs },
                }
            },
            IoOpcode::WriteZeroes => {
                if !ns.bdev.supports(IoType::WriteZeroes) {
                    self.fail_req(idx, Sct::Generic, types::generic::INVALID_OPCODE);
                    return Ok(true);
                }
                IoRequest::WriteZeroes { offset_blocks: slba, num_blocks: nlb }
            },
            IoOpcode::Flush => IoRequest::Flush,
            IoOpcode::DatasetManagement => {
                if !ns.bdev.supports(IoType::Unmap) {
                    self.fail_req(idx, Sct::Generic, types::generic::INVALID_OPCODE);
                    return Ok(true);
                }
                return self.execute_dsm(idx, &ns).await;
            },
            _ => {
                self.fail_req(idx, Sct::Generic, types::generic::INVALID_OPCODE);
                return Ok(true);
            },
        };

        self.slab.set_state(idx, ReqState::Executing);
        let bdev = Arc::clone(&ns.bdev);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let completion = bdev.submit(io).await;
            let _ = tx.send(QpairEvent::BdevDone { idx, completion });
        });
        Ok(false)
    }

    /// Dataset Management with the deallocate attribute: unmap every range
    /// in the payload, reporting the first failure.
    async fn execute_dsm(
        &mut self,
        idx: u16,
        ns: &Arc<crate::subsystem::Namespace>,
    ) -> Result<bool> {
        let nr = (self.slab.get(idx).cmd.cdw10.get() & 0xFF) as usize + 1;
        let data = {
            let req = self.slab.get(idx);
            let mut flat = Vec::with_capacity(req.length as usize);
            for s in req.data_slices() {
                flat.extend_from_slice(s);
            }
            flat
        };
        let ranges = parse_dsm_ranges(&data, nr);
        if ranges.is_empty() {
            self.fail_req(idx, Sct::Generic, types::generic::INVALID_FIELD);
            return Ok(true);
        }

        self.slab.set_state(idx, ReqState::Executing);
        let bdev = Arc::clone(&ns.bdev);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let mut status = IoStatus::Success;
            for (slba, nlb) in ranges {
                let done =
                    bdev.submit(IoRequest::Unmap { offset_blocks: slba, num_blocks: nlb }).await;
                if done.status != IoStatus::Success {
                    status = done.status;
                    break;
                }
            }
            let _ = tx.send(QpairEvent::BdevDone {
                idx,
                completion: IoCompletion { status, bufs: Vec::new() },
            });
        });
        Ok(false)
    }

    async fn execute_fused(
        &mut self,
        idx: u16,
        ns: &Arc<crate::subsystem::Namespace>,
    ) -> Result<bool> {
        let (first, second) = match self.slab.get(idx).cmd.fuse() {
            FUSE_FIRST => match self.slab.get(idx).fused_pair {
                // Compare half parks until its write arrives.
                None => return Ok(false),
                Some(second) => (idx, second),
            },
            _ => match self.slab.get(idx).fused_pair {
                None => {
                    self.fail_req(idx, Sct::Generic, types::generic::ABORTED_MISSING_FUSED);
                    return Ok(true);
                },
                Some(first) => (first, idx),
            },
        };

        // Both halves must have their data before the pair submits.
        if self.slab.get(first).state != ReqState::ReadyToExecute
            || self.slab.get(second).state != ReqState::ReadyToExecute
        {
            return Ok(false);
        }

        let (slba, nlb) = io_cmd::lba_span(self.slab.get(first));
        let (slba2, nlb2) = io_cmd::lba_span(self.slab.get(second));
        let same_ns =
            self.slab.get(first).cmd.nsid.get() == self.slab.get(second).cmd.nsid.get();
        if slba != slba2 || nlb != nlb2 || !same_ns {
            self.fail_req(first, Sct::Generic, types::generic::ABORTED_FAILED_FUSED);
            self.fail_req(second, Sct::Generic, types::generic::ABORTED_FAILED_FUSED);
            Box::pin(self.req_process(first)).await?;
            return Ok(true);
        }

        let cmp_bufs = self.take_data_bufs(first);
        let write_bufs = self.take_data_bufs(second);
        self.slab.set_state(first, ReqState::Executing);
        self.slab.set_state(second, ReqState::Executing);

        let bdev = Arc::clone(&ns.bdev);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let completion = bdev
                .submit(IoRequest::CompareAndWrite {
                    offset_blocks: slba,
                    num_blocks: nlb,
                    cmp_bufs,
                    write_bufs,
                })
                .await;
            let _ = tx.send(QpairEvent::FusedDone {
                first,
                second,
                status: completion.status,
                bufs: completion.bufs,
            });
        });
        Ok(false)
    }

    async fn execute_zcopy(
        &mut self,
        idx: u16,
        ns: &Arc<crate::subsystem::Namespace>,
        opc: IoOpcode,
    ) -> Result<bool> {
        match opc {
            // Zero-copy reads were populated by the device at start.
            IoOpcode::Read => {
                self.slab.set_state(idx, ReqState::Executed);
                Ok(true)
            },
            // Zero-copy writes commit the filled buffers back.
            IoOpcode::Write => {
                let (slba, nlb) = io_cmd::lba_span(self.slab.get(idx));
                let bufs = match std::mem::take(&mut self.slab.get_mut(idx).buf) {
                    DataBuf::Zcopy(bufs) => bufs,
                    other => {
                        self.slab.get_mut(idx).buf = other;
                        self.fail_req(idx, Sct::Generic, types::generic::INTERNAL_DEVICE_ERROR);
                        return Ok(true);
                    },
                };
                self.slab.get_mut(idx).zcopy_phase = ZcopyPhase::EndPending;
                self.slab.set_state(idx, ReqState::AwaitingZcopyCommit);
                let bdev = Arc::clone(&ns.bdev);
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    let status = bdev.zcopy_end(slba, nlb, bufs, true).await;
                    let _ = tx.send(QpairEvent::ZcopyEndDone { idx, status, commit: true });
                });
                Ok(false)
            },
            _ => {
                self.fail_req(idx, Sct::Generic, types::generic::INVALID_OPCODE);
                Ok(true)
            },
        }
    }

    /// Pull raw buffers out of the request for a device call.
    fn take_data_bufs(&mut self, idx: u16) -> Vec<BytesMut> {
        let length = self.slab.get(idx).length as usize;
        let req = self.slab.get_mut(idx);
        match &mut req.buf {
            DataBuf::Pooled(bufs) => {
                let mut out: Vec<BytesMut> = bufs.iter_mut().map(|b| b.take()).collect();
                trim_bufs(&mut out, length);
                out
            },
            DataBuf::InCapsule => {
                let mut copy = BytesMut::with_capacity(length);
                copy.extend_from_slice(&req.icd[..length]);
                vec![copy]
            },
            DataBuf::CtrlMsg(buf) => {
                let mut taken = buf.take();
                taken.truncate(length);
                vec![taken]
            },
            DataBuf::Zcopy(bufs) => std::mem::take(bufs),
            DataBuf::None => Vec::new(),
        }
    }

    /// Give device buffers back to their pooled owners.
    fn restore_data_bufs(&mut self, idx: u16, mut bufs: Vec<BytesMut>) {
        let req = self.slab.get_mut(idx);
        match &mut req.buf {
            DataBuf::Pooled(pooled) => {
                for pb in pooled.iter_mut() {
                    if bufs.is_empty() {
                        break;
                    }
                    pb.restore(bufs.remove(0));
                }
            },
            DataBuf::CtrlMsg(pb) => {
                if let Some(buf) = bufs.pop() {
                    pb.restore(buf);
                }
            },
            DataBuf::Zcopy(z) => *z = bufs,
            _ => {},
        }
    }

    // ── completion & response emission ───────────────────────────────────

    /// Transfer-out phase: C2H data for successful reads, else a response
    /// capsule; then buffer release.
    async fn req_complete_transfer(&mut self, idx: u16) -> Result<()> {
        let (is_read_data, success) = {
            let req = self.slab.get(idx);
            (req.xfer == XferDir::ControllerToHost && req.length > 0, req.rsp.success())
        };

        self.slab.set_state(idx, ReqState::TransferringControllerToHost);

        let mut sent_success_flag = false;
        if is_read_data && success {
            sent_success_flag = self.send_c2h_data(idx).await?;
        }
        if !sent_success_flag {
            self.send_capsule_resp(idx).await?;
        }

        // Read zero-copy buffers stay device-owned until released.
        if matches!(self.slab.get(idx).buf, DataBuf::Zcopy(_))
            && self.slab.get(idx).zcopy_phase == ZcopyPhase::Execute
        {
            let Some(ns) = self.io_namespace(idx) else {
                self.slab.set_state(idx, ReqState::Completed);
                return Ok(());
            };
            let (slba, nlb) = io_cmd::lba_span(self.slab.get(idx));
            let bufs = match std::mem::take(&mut self.slab.get_mut(idx).buf) {
                DataBuf::Zcopy(bufs) => bufs,
                _ => Vec::new(),
            };
            self.slab.set_state(idx, ReqState::AwaitingZcopyRelease);
            let bdev = Arc::clone(&ns.bdev);
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                let status = bdev.zcopy_end(slba, nlb, bufs, false).await;
                let _ = tx.send(QpairEvent::ZcopyEndDone { idx, status, commit: false });
            });
            return Ok(());
        }

        self.slab.set_state(idx, ReqState::Completed);
        Ok(())
    }

    fn req_free(&mut self, idx: u16) {
        if self.first_fused == Some(idx) {
            self.first_fused = None;
        }
        self.slab.release(idx);

        // Swap in the post-Connect slab once the bootstrap request is free.
        if let Some(count) = self.pending_resize.take() {
            if self.slab.state_count(ReqState::Free) as usize == self.slab.resource_count() {
                let icd = self.ctx.opts.in_capsule_data_size as usize;
                self.slab = ReqSlab::new(count, icd);
                self.resource_count = count;
                debug!(peer = %self.peer, count, "request slab sized to negotiated depth");
            } else {
                self.pending_resize = Some(count);
            }
        }
    }

    fn fail_req(&mut self, idx: u16, sct: Sct, sc: u8) {
        let req = self.slab.get_mut(idx);
        req.rsp.set_status(sct, sc);
        req.rsp.set_dnr();
        self.slab.set_state(idx, ReqState::Executed);
    }

    fn next_sqhd(&mut self) -> u16 {
        self.sqhd = (self.sqhd + 1) % self.resource_count.max(1);
        self.sqhd
    }

    async fn send_capsule_resp(&mut self, idx: u16) -> Result<()> {
        let sqhd = self.next_sqhd();
        let cqe = {
            let req = self.slab.get_mut(idx);
            req.rsp.cid = req.cmd.cid;
            req.rsp.sqhd.set(sqhd);
            req.rsp
        };
        self.send_header_pdu(CapsuleRespBuilder::new(cqe).header, CAPSULE_RESP_HDR_LEN).await
    }

    /// Emit the read payload as C2H_DATA chunks. Returns `true` when the
    /// final chunk carried the SUCCESS flag and no capsule-resp is needed.
    async fn send_c2h_data(&mut self, idx: u16) -> Result<bool> {
        let (cid, length, use_success) = {
            let req = self.slab.get(idx);
            let flag = self.ctx.opts.c2h_success
                && req.rsp.cdw0.get() == 0
                && req.rsp.cdw1.get() == 0;
            (req.cid(), req.length, flag)
        };

        let align = (self.hpda as usize + 1) * 4;
        let mut sent_success = false;

        while self.slab.get(idx).rw_offset < length {
            let rw_offset = self.slab.get(idx).rw_offset;
            let chunk = (length - rw_offset).min(self.maxh2cdata);
            let last = rw_offset + chunk == length;

            let mut builder = C2hDataBuilder::new().cccid(cid).datao(rw_offset).datal(chunk);
            if last {
                builder = builder.last();
                if use_success {
                    builder = builder.success();
                    sent_success = true;
                }
            }
            let mut hdr = builder.header;
            if self.host_hdgst {
                hdr.common.flags.set_hdgst(true);
            }
            if self.host_ddgst {
                hdr.common.flags.set_ddgst(true);
            }
            let hdgst_len = if self.host_hdgst { DIGEST_LEN } else { 0 };
            let pdo = (DATA_HDR_LEN + hdgst_len).next_multiple_of(align);
            let padding = pdo - (DATA_HDR_LEN + hdgst_len);
            hdr.common.pdo = pdo as u8;
            let ddgst_len = if self.host_ddgst { DIGEST_LEN } else { 0 };
            hdr.common.plen.set((pdo + chunk as usize + ddgst_len) as u32);

            let mut header = vec![0u8; DATA_HDR_LEN];
            hdr.to_header_bytes(&mut header)?;
            if self.host_hdgst {
                let crc = calc_header_digest(&header);
                header.extend_from_slice(&digest_to_wire(crc));
            }

            if sent_success {
                // The completion rides on this final PDU: account for it.
                let sqhd = self.next_sqhd();
                self.slab.get_mut(idx).rsp.sqhd.set(sqhd);
            }

            let req = self.slab.get(idx);
            let full = req.data_slices();
            let window = slice_window(&full, rw_offset as usize, chunk as usize);
            let ddgst_word = if self.host_ddgst {
                Some(digest_to_wire(self.digest_engine.data_digest(&window).await))
            } else {
                None
            };

            write_wire(&mut self.stream, &header, padding, &window, ddgst_word).await?;
            self.slab.get_mut(idx).rw_offset += chunk;
        }

        Ok(sent_success)
    }

    /// Serialize and send a header-only PDU (R2T, CAPSULE_RESP).
    async fn send_header_pdu<P: PduHeader>(&mut self, mut pdu: P, hlen: usize) -> Result<()> {
        let digests_apply =
            pdu.common().pdu_type.known().is_some_and(PduType::carries_digests);
        if self.host_hdgst && digests_apply {
            pdu.common_mut().flags.set_hdgst(true);
            pdu.common_mut().plen.set((hlen + DIGEST_LEN) as u32);
        } else {
            pdu.common_mut().plen.set(hlen as u32);
        }
        let mut buf = vec![0u8; hlen];
        pdu.to_header_bytes(&mut buf)?;
        if pdu.common().flags.hdgst() {
            let crc = calc_header_digest(&buf);
            buf.extend_from_slice(&digest_to_wire(crc));
        }
        write_wire(&mut self.stream, &buf, 0, &[], None).await
    }

    // ── protocol errors ──────────────────────────────────────────────────

    /// Send a C2H_TERM_REQ carrying the offending header, park the qpair in
    /// the error state, and arm the exit timer. Inbound bytes are discarded
    /// from here on.
    async fn enter_error(&mut self, fes: Fes, fei: u32) -> Result<()> {
        let offending: Vec<u8> = match self.in_progress.take() {
            Some(pdu) if !pdu.header.is_empty() => pdu.header,
            _ => self
                .recv_buf
                .get(..COMMON_HDR_LEN.min(self.recv_buf.len()))
                .map(|s| s.to_vec())
                .unwrap_or_default(),
        };
        warn!(peer = %self.peer, ?fes, fei, "protocol violation, terminating");

        let term = C2hTermReqBuilder::new(fes, fei).copy_header(&offending);
        let mut header = vec![0u8; TERM_REQ_HDR_LEN];
        term.header.to_header_bytes(&mut header)?;
        let data: [&[u8]; 1] = [&term.data];
        let spans: &[&[u8]] = if term.data.is_empty() { &[] } else { &data };
        if let Err(e) = write_wire(&mut self.stream, &header, 0, spans, None).await {
            debug!("term-req write failed: {e}");
        }

        self.recv_state = RecvState::Error;
        self.state = QpairState::Exiting;
        self.recv_buf.clear();

        // Give the initiator a window to read the diagnostic, then close.
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(QPAIR_EXIT_TIMEOUT_SECS)).await;
            cancel.cancel();
        });
        Ok(())
    }

    // ── events ───────────────────────────────────────────────────────────

    async fn handle_event(&mut self, ev: QpairEvent) -> Result<()> {
        match ev {
            QpairEvent::BdevDone { idx, completion } => {
                if self.slab.get(idx).state != ReqState::Executing {
                    return Ok(());
                }
                self.restore_data_bufs(idx, completion.bufs);
                if let Some(ctrlr) = self.ctrlr.clone() {
                    io_cmd::apply_io_status(
                        &ctrlr,
                        completion.status,
                        &mut self.slab.get_mut(idx).rsp,
                    );
                }
                self.slab.set_state(idx, ReqState::Executed);
                self.req_process(idx).await
            },
            QpairEvent::FusedDone { first, second, status, bufs } => {
                self.finish_fused(first, second, status, bufs).await
            },
            QpairEvent::BufferGranted { idx, bufs } => {
                if self.slab.get(idx).state != ReqState::NeedBuffer {
                    // Granted after abort or teardown: buffers return to the
                    // pool on drop.
                    return Ok(());
                }
                self.slab.get_mut(idx).buf = DataBuf::Pooled(bufs);
                if self.slab.get(idx).xfer == XferDir::HostToController {
                    self.begin_h2c(idx).await
                } else {
                    self.slab.set_state(idx, ReqState::ReadyToExecute);
                    self.req_process(idx).await
                }
            },
            QpairEvent::CtrlMsgGranted { idx, buf } => {
                if self.slab.get(idx).state != ReqState::New {
                    return Ok(());
                }
                self.slab.get_mut(idx).buf = DataBuf::CtrlMsg(buf);
                if let Some(pdu) = self.in_progress.as_mut() {
                    if matches!(pdu.dest, PayloadDest::Pending { idx: p } if p == idx) {
                        pdu.dest = PayloadDest::Request { idx, base: 0 };
                    }
                }
                // The stalled capsule payload can flow again.
                self.drive_recv().await
            },
            QpairEvent::ZcopyStartDone { idx, result } => {
                if self.slab.get(idx).state != ReqState::AwaitingZcopyStart {
                    return Ok(());
                }
                match result {
                    Ok(bufs) => {
                        self.slab.get_mut(idx).buf = DataBuf::Zcopy(bufs);
                        self.slab.get_mut(idx).zcopy_phase = ZcopyPhase::Execute;
                        self.slab.set_state(idx, ReqState::ZcopyStartCompleted);
                    },
                    Err(status) => {
                        if let Some(ctrlr) = self.ctrlr.clone() {
                            io_cmd::apply_io_status(
                                &ctrlr,
                                status,
                                &mut self.slab.get_mut(idx).rsp,
                            );
                        }
                        self.slab.set_state(idx, ReqState::Executed);
                    },
                }
                self.req_process(idx).await
            },
            QpairEvent::ZcopyEndDone { idx, status, commit } => {
                let state = self.slab.get(idx).state;
                match (state, commit) {
                    (ReqState::AwaitingZcopyCommit, true) => {
                        if let Some(ctrlr) = self.ctrlr.clone() {
                            io_cmd::apply_io_status(
                                &ctrlr,
                                status,
                                &mut self.slab.get_mut(idx).rsp,
                            );
                        }
                        self.slab.get_mut(idx).zcopy_phase = ZcopyPhase::None;
                        self.slab.set_state(idx, ReqState::Executed);
                        self.req_process(idx).await
                    },
                    (ReqState::AwaitingZcopyRelease, false) => {
                        self.slab.get_mut(idx).zcopy_phase = ZcopyPhase::None;
                        self.slab.set_state(idx, ReqState::Completed);
                        self.req_process(idx).await
                    },
                    _ => Ok(()),
                }
            },
            QpairEvent::CompleteAer { cid, value } => {
                let Some(pos) = self.aer_reqs.iter().position(|(c, _)| *c == cid) else {
                    return Ok(());
                };
                let (_, idx) = self.aer_reqs.remove(pos);
                {
                    let req = self.slab.get_mut(idx);
                    req.rsp.cdw0.set(value);
                    req.rsp.set_status(Sct::Generic, types::generic::SUCCESS);
                }
                self.slab.set_state(idx, ReqState::Executed);
                self.req_process(idx).await
            },
            QpairEvent::AbortAer { cid } => {
                let Some(pos) = self.aer_reqs.iter().position(|(c, _)| *c == cid) else {
                    return Ok(());
                };
                let (_, idx) = self.aer_reqs.remove(pos);
                {
                    let req = self.slab.get_mut(idx);
                    req.rsp.set_status(Sct::Generic, types::generic::ABORTED_BY_REQUEST);
                }
                self.slab.set_state(idx, ReqState::Executed);
                self.req_process(idx).await
            },
            QpairEvent::Abort { cid, reply } => {
                let aborted = match self.slab.by_cid(cid) {
                    Some(idx) => {
                        // Only requests idle in a wait state can be pulled
                        // back; anything on the device runs to completion.
                        match self.slab.get(idx).state {
                            ReqState::NeedBuffer | ReqState::ReadyToExecute => {
                                let partner = self.slab.get(idx).fused_pair;
                                self.fail_req(idx, Sct::Generic, types::generic::ABORTED_BY_REQUEST);
                                self.req_process(idx).await?;
                                if let Some(partner) = partner {
                                    if self.slab.get(partner).state != ReqState::Free {
                                        self.slab.get_mut(partner).fused_failed = true;
                                        if self.slab.get(partner).state
                                            == ReqState::ReadyToExecute
                                        {
                                            self.fail_req(
                                                partner,
                                                Sct::Generic,
                                                types::generic::ABORTED_FAILED_FUSED,
                                            );
                                            self.req_process(partner).await?;
                                        }
                                    }
                                }
                                true
                            },
                            _ => false,
                        }
                    },
                    None => false,
                };
                let _ = reply.send(aborted);
                Ok(())
            },
        }
    }

    async fn finish_fused(
        &mut self,
        first: u16,
        second: u16,
        status: IoStatus,
        bufs: Vec<BytesMut>,
    ) -> Result<()> {
        // Buffers split back by original share: compare half first.
        let cmp_len = self.slab.get(first).length as usize;
        let mut cmp_bufs = Vec::new();
        let mut write_bufs = Vec::new();
        let mut seen = 0usize;
        for buf in bufs {
            if seen < cmp_len {
                seen += buf.len();
                cmp_bufs.push(buf);
            } else {
                write_bufs.push(buf);
            }
        }
        self.restore_data_bufs(first, cmp_bufs);
        self.restore_data_bufs(second, write_bufs);

        if let Some(ctrlr) = self.ctrlr.clone() {
            match status {
                IoStatus::Success => {
                    io_cmd::apply_io_status(
                        &ctrlr,
                        IoStatus::Success,
                        &mut self.slab.get_mut(first).rsp,
                    );
                    io_cmd::apply_io_status(
                        &ctrlr,
                        IoStatus::Success,
                        &mut self.slab.get_mut(second).rsp,
                    );
                },
                other => {
                    // The failing half reports its own error; its partner
                    // aborts as a failed fused operation.
                    io_cmd::apply_io_status(&ctrlr, other, &mut self.slab.get_mut(first).rsp);
                    let req = self.slab.get_mut(second);
                    req.rsp.set_status(Sct::Generic, types::generic::ABORTED_FAILED_FUSED);
                    req.rsp.set_dnr();
                },
            }
        }
        self.slab.set_state(first, ReqState::Executed);
        self.slab.set_state(second, ReqState::Executed);
        self.req_process(first).await?;
        self.req_process(second).await
    }

    // ── teardown ─────────────────────────────────────────────────────────

    async fn cleanup(&mut self) {
        self.state = QpairState::Exiting;

        // Outstanding AERs die silently; they hold no device work.
        for (_, idx) in std::mem::take(&mut self.aer_reqs) {
            self.slab.set_state(idx, ReqState::Executed);
        }

        // Let in-flight device work land (bounded); no more PDUs go out.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.has_device_inflight() {
            let timeout = tokio::time::sleep_until(deadline);
            tokio::select! {
                _ = timeout => break,
                ev = self.events_rx.recv() => {
                    match ev {
                        Some(QpairEvent::BdevDone { idx, completion }) => {
                            self.restore_data_bufs(idx, completion.bufs);
                            self.slab.set_state(idx, ReqState::Executed);
                        },
                        Some(QpairEvent::FusedDone { first, second, .. }) => {
                            self.slab.set_state(first, ReqState::Executed);
                            self.slab.set_state(second, ReqState::Executed);
                        },
                        Some(QpairEvent::ZcopyStartDone { idx, result }) => {
                            if let Ok(bufs) = result {
                                self.slab.get_mut(idx).buf = DataBuf::Zcopy(bufs);
                            }
                            self.slab.set_state(idx, ReqState::Executed);
                        },
                        Some(QpairEvent::ZcopyEndDone { idx, .. }) => {
                            self.slab.get_mut(idx).zcopy_phase = ZcopyPhase::None;
                            self.slab.set_state(idx, ReqState::Executed);
                        },
                        Some(_) => {},
                        None => break,
                    }
                },
            }
        }

        // Walk every live request home and release its buffers.
        for idx in 0..self.slab.resource_count() as u16 {
            if self.slab.get(idx).state == ReqState::Free {
                continue;
            }
            // Zero-copy windows must be closed even on teardown.
            if let DataBuf::Zcopy(bufs) = std::mem::take(&mut self.slab.get_mut(idx).buf) {
                if let Some(ns) = self.io_namespace(idx) {
                    let (slba, nlb) = io_cmd::lba_span(self.slab.get(idx));
                    let bdev = Arc::clone(&ns.bdev);
                    tokio::spawn(async move {
                        let _ = bdev.zcopy_end(slba, nlb, bufs, false).await;
                    });
                }
            }
            self.slab.set_state(idx, ReqState::Completed);
            self.slab.release(idx);
        }

        if let (Some(ctrlr), Some(qid)) = (self.ctrlr.take(), self.qid) {
            ctrlr.qpair_gone(qid);
        }
        self.state = QpairState::Exited;
        debug!(peer = %self.peer, "qpair down");
    }

    fn has_device_inflight(&self) -> bool {
        self.slab.state_count(ReqState::Executing) > 0
            || self.slab.state_count(ReqState::AwaitingZcopyStart) > 0
            || self.slab.state_count(ReqState::AwaitingZcopyCommit) > 0
            || self.slab.state_count(ReqState::AwaitingZcopyRelease) > 0
    }

    /// Whether oversized in-capsule data may use the control-message pool:
    /// admin and not-yet-connected qpairs only.
    fn admin_capable(&self) -> bool {
        self.qid.unwrap_or(0) == 0
    }
}

/// All (slba, nlb) ranges of a Dataset Management payload.
fn parse_dsm_ranges(data: &[u8], nr: usize) -> Vec<(u64, u64)> {
    let mut out = Vec::with_capacity(nr);
    for chunk in data.chunks_exact(16).take(nr) {
        let nlb = u32::from_le_bytes(chunk[4..8].try_into().expect("4 bytes")) as u64;
        let slba = u64::from_le_bytes(chunk[8..16].try_into().expect("8 bytes"));
        if nlb > 0 {
            out.push((slba, nlb));
        }
    }
    out
}

/// Clamp device buffers to the request length.
fn trim_bufs(bufs: &mut Vec<BytesMut>, mut length: usize) {
    for buf in bufs.iter_mut() {
        let take = buf.len().min(length);
        buf.truncate(take);
        length -= take;
    }
    bufs.retain(|b| !b.is_empty());
}

/// Sub-slice a set of data spans to `[offset, offset + len)`.
fn slice_window<'a>(slices: &[&'a [u8]], mut offset: usize, mut len: usize) -> Vec<&'a [u8]> {
    let mut out = Vec::new();
    for s in slices {
        if len == 0 {
            break;
        }
        if offset >= s.len() {
            offset -= s.len();
            continue;
        }
        let take = (s.len() - offset).min(len);
        out.push(&s[offset..offset + take]);
        offset = 0;
        len -= take;
    }
    out
}

/// Write one PDU with vectored I/O, resuming through short writes.
async fn write_wire(
    stream: &mut TcpStream,
    header: &[u8],
    padding: usize,
    data: &[&[u8]],
    ddgst: Option<[u8; 4]>,
) -> Result<()> {
    let total = header.len()
        + padding
        + data.iter().map(|s| s.len()).sum::<usize>()
        + ddgst.map(|_| DIGEST_LEN).unwrap_or(0);
    let mut offset = 0usize;
    let word = ddgst.unwrap_or_default();

    while offset < total {
        let mut iovs: Vec<IoSlice<'_>> = Vec::with_capacity(MAX_SGL_DESCRIPTORS + 2);
        let mapped = build_iovs(
            &mut iovs,
            MAX_SGL_DESCRIPTORS + 2,
            header,
            padding,
            data,
            ddgst.as_ref().map(|_| &word),
            offset,
        );
        if mapped == 0 {
            bail!("pdu serialization mapped nothing at offset {offset}/{total}");
        }
        let n = stream.write_vectored(&iovs).await?;
        if n == 0 {
            bail!("socket closed mid-pdu");
        }
        offset += n;
    }
    Ok(())
}
