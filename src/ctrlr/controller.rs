// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The controller object created by a Fabrics Connect on an admin queue.
//!
//! A controller is owned by its admin qpair's task; I/O qpairs on other
//! tasks hold an `Arc` and interact through the qpair handles and the
//! shared inner state. Three timers run per controller: keep-alive,
//! association removal, and the cc reset/shutdown bound.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use bitflags::bitflags;
use once_cell::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    nvme::{
        fabrics::{SHST_COMPLETE, VcProp},
        features::{DISCOVERY_KATO_MS, FeatureBlock, MIN_KEEP_ALIVE_TIMEOUT_MS},
        log::{LogPageId, ReservationNotificationLog},
        types::AsyncEvent,
    },
    subsystem::{Subsystem, SubsystemType},
    transport::{TransportOpts, qpair::{QpairEvent, QpairHandle}},
};

/// AER slots a controller keeps outstanding (AERL is this minus one).
pub const MAX_ASYNC_EVENTS: usize = 4;

/// How long controller state survives after a reset/shutdown before the
/// association is torn down.
pub const ASSOCIATION_TIMEOUT_MS: u64 = 120_000;

/// Bound on a CC-initiated reset or shutdown.
pub const CC_TIMEOUT_MS: u64 = 10_000;

/// Changed-namespace list capacity before the overflow sentinel.
pub const CHANGED_NS_MAX: usize = 1024;

bitflags! {
    /// One bit per async-event kind; set while an AEN is outstanding and
    /// cleared by a log-page read with RAE=0.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct AenMask: u8 {
        const CHANGED_NS = 1 << 0;
        const ANA = 1 << 1;
        const RESERVATION = 1 << 2;
        const DISCOVERY = 1 << 3;
        const ERROR = 1 << 4;
    }
}

/// Reset/shutdown progress, kept as an explicit phase rather than a flag so
/// completion and timeout observe the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownPhase {
    #[default]
    None,
    Resetting,
    ShuttingDown,
    Complete,
}

#[derive(Debug)]
pub struct CtrlrInner {
    pub vcprop: VcProp,
    pub feat: FeatureBlock,
    pub acre: bool,
    /// Outstanding AER command ids, oldest first.
    pub aer_cids: VecDeque<u16>,
    /// Events waiting for an AER slot.
    pub pending_events: VecDeque<AsyncEvent>,
    pub aen_mask: AenMask,
    /// Bitset of attached qids.
    pub qpair_mask: Vec<u64>,
    pub changed_ns: Vec<u32>,
    pub changed_ns_overflow: bool,
    pub resv_log: VecDeque<ReservationNotificationLog>,
    pub resv_log_count: u64,
    pub shutdown: ShutdownPhase,
    pub io_qpairs_ever_created: bool,
}

pub struct Controller {
    pub cntlid: u16,
    pub subsys: Arc<Subsystem>,
    pub hostnqn: String,
    pub host_id: [u8; 16],
    pub opts: Arc<TransportOpts>,
    pub kato_ms: AtomicU32,
    last_keep_alive_ms: AtomicU64,
    pub inner: Mutex<CtrlrInner>,
    qpairs: dashmap::DashMap<u16, QpairHandle>,
    /// Listener trid the admin qpair connected through. With ANA reporting
    /// on, every I/O qpair of this association must arrive on the same one.
    listener: OnceCell<String>,
    /// Fires when the whole association goes away.
    pub cancel: CancellationToken,
    keep_alive_cancel: Mutex<Option<CancellationToken>>,
    association_cancel: Mutex<Option<CancellationToken>>,
    epoch: Instant,
}

fn aen_mask_bit(log: LogPageId) -> Option<AenMask> {
    Some(match log {
        LogPageId::ChangedNsList => AenMask::CHANGED_NS,
        LogPageId::Ana => AenMask::ANA,
        LogPageId::ReservationNotification => AenMask::RESERVATION,
        LogPageId::Discovery => AenMask::DISCOVERY,
        LogPageId::Error => AenMask::ERROR,
        _ => return None,
    })
}

impl Controller {
    pub fn new(
        cntlid: u16,
        subsys: Arc<Subsystem>,
        hostnqn: String,
        host_id: [u8; 16],
        kato_ms: u32,
        opts: Arc<TransportOpts>,
    ) -> Arc<Self> {
        let kato_ms = if kato_ms == 0 && subsys.subtype == SubsystemType::Discovery {
            DISCOVERY_KATO_MS
        } else {
            kato_ms
        };
        let mask_words = (opts.max_qpairs_per_ctrlr as usize).div_ceil(64);
        let inner = CtrlrInner {
            vcprop: VcProp::new(opts.max_queue_depth),
            feat: FeatureBlock::new(opts.io_qpairs(), kato_ms),
            acre: false,
            aer_cids: VecDeque::new(),
            pending_events: VecDeque::new(),
            aen_mask: AenMask::empty(),
            qpair_mask: vec![0u64; mask_words],
            changed_ns: Vec::new(),
            changed_ns_overflow: false,
            resv_log: VecDeque::new(),
            resv_log_count: 0,
            shutdown: ShutdownPhase::None,
            io_qpairs_ever_created: false,
        };
        Arc::new(Self {
            cntlid,
            subsys,
            hostnqn,
            host_id,
            opts,
            kato_ms: AtomicU32::new(kato_ms),
            last_keep_alive_ms: AtomicU64::new(0),
            inner: Mutex::new(inner),
            qpairs: dashmap::DashMap::new(),
            listener: OnceCell::new(),
            cancel: CancellationToken::new(),
            keep_alive_cancel: Mutex::new(None),
            association_cancel: Mutex::new(None),
            epoch: Instant::now(),
        })
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, CtrlrInner> {
        self.inner.lock().expect("controller state poisoned")
    }

    // ── qpair attachment ─────────────────────────────────────────────────

    /// Set the qid bit; `false` when the qid is out of range or duplicate.
    pub fn claim_qid(&self, qid: u16) -> bool {
        if qid >= self.opts.max_qpairs_per_ctrlr {
            return false;
        }
        let mut inner = self.lock();
        let (word, bit) = (qid as usize / 64, qid as usize % 64);
        if inner.qpair_mask[word] & (1 << bit) != 0 {
            return false;
        }
        inner.qpair_mask[word] |= 1 << bit;
        if qid != 0 {
            inner.io_qpairs_ever_created = true;
        }
        true
    }

    pub fn register_qpair(&self, handle: QpairHandle) {
        self.qpairs.insert(handle.qid, handle);
    }

    /// Pin the admin qpair's listener trid; set once at Connect.
    pub fn bind_listener(&self, trid: impl Into<String>) {
        let _ = self.listener.set(trid.into());
    }

    pub fn listener(&self) -> Option<&str> {
        self.listener.get().map(String::as_str)
    }

    /// A qpair task finished; clear its bit and handle. When the admin
    /// qpair goes, the association goes with it.
    pub fn qpair_gone(self: &Arc<Self>, qid: u16) {
        self.qpairs.remove(&qid);
        {
            let mut inner = self.lock();
            let (word, bit) = (qid as usize / 64, qid as usize % 64);
            inner.qpair_mask[word] &= !(1 << bit);
        }
        if qid == 0 {
            self.destroy();
        }
    }

    pub fn admin_qpair(&self) -> Option<QpairHandle> {
        self.qpairs.get(&0).map(|e| e.value().clone())
    }

    pub fn io_qpair_count(&self) -> usize {
        self.qpairs.iter().filter(|e| *e.key() != 0).count()
    }

    pub fn each_qpair(&self) -> Vec<QpairHandle> {
        self.qpairs.iter().map(|e| e.value().clone()).collect()
    }

    // ── keep-alive ───────────────────────────────────────────────────────

    /// Refresh the keep-alive deadline; every admin command and the Keep
    /// Alive opcode land here.
    pub fn touch_keep_alive(&self) {
        self.last_keep_alive_ms.store(self.now_ms(), Ordering::SeqCst);
    }

    pub fn arm_keep_alive(self: &Arc<Self>) {
        let kato = self.kato_ms.load(Ordering::SeqCst) as u64;
        if kato == 0 {
            return;
        }
        self.touch_keep_alive();
        let period = kato.max(MIN_KEEP_ALIVE_TIMEOUT_MS as u64);
        let token = self.cancel.child_token();
        *self.keep_alive_cancel.lock().expect("ka poisoned") = Some(token.clone());

        let ctrlr = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(period));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tick.tick() => {},
                }
                let kato = ctrlr.kato_ms.load(Ordering::SeqCst) as u64;
                let last = ctrlr.last_keep_alive_ms.load(Ordering::SeqCst);
                if kato != 0 && ctrlr.now_ms().saturating_sub(last) > kato {
                    warn!(cntlid = ctrlr.cntlid, "keep-alive expired, tearing association down");
                    ctrlr.lock().vcprop.set_csts_cfs();
                    ctrlr.disconnect_all_qpairs();
                    return;
                }
            }
        });
    }

    pub fn stop_keep_alive(&self) {
        if let Some(token) = self.keep_alive_cancel.lock().expect("ka poisoned").take() {
            token.cancel();
        }
    }

    // ── reset / shutdown ─────────────────────────────────────────────────

    /// CC.EN 1→0 or CC.SHN write: disconnect every I/O qpair, then settle
    /// the register bar. Bounded by the cc timeout; overrun latches CFS.
    pub fn begin_reset(self: &Arc<Self>, shutdown: bool) {
        {
            let mut inner = self.lock();
            if inner.shutdown != ShutdownPhase::None {
                return;
            }
            inner.shutdown =
                if shutdown { ShutdownPhase::ShuttingDown } else { ShutdownPhase::Resetting };
        }
        if shutdown {
            self.stop_keep_alive();
        }
        self.disconnect_io_qpairs();

        let ctrlr = Arc::clone(self);
        tokio::spawn(async move {
            let deadline = Instant::now() + Duration::from_millis(CC_TIMEOUT_MS);
            while ctrlr.io_qpair_count() > 0 {
                if Instant::now() >= deadline {
                    warn!(cntlid = ctrlr.cntlid, "cc timeout with transfers outstanding");
                    ctrlr.lock().vcprop.set_csts_cfs();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            {
                let mut inner = ctrlr.lock();
                inner.vcprop.cc = 0;
                inner.vcprop.set_csts_rdy(false);
                if inner.shutdown == ShutdownPhase::ShuttingDown {
                    inner.vcprop.set_csts_shst(SHST_COMPLETE);
                }
                inner.shutdown = ShutdownPhase::Complete;
            }
            ctrlr.arm_association_timer();
        });
    }

    /// After a reset/shutdown the association lingers so the host can fetch
    /// CSTS; this timer bounds that lingering.
    pub fn arm_association_timer(self: &Arc<Self>) {
        let token = self.cancel.child_token();
        *self.association_cancel.lock().expect("assoc poisoned") = Some(token.clone());
        let ctrlr = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {},
                _ = tokio::time::sleep(Duration::from_millis(ASSOCIATION_TIMEOUT_MS)) => {
                    info!(cntlid = ctrlr.cntlid, "association timeout, disconnecting");
                    ctrlr.disconnect_all_qpairs();
                },
            }
        });
    }

    pub fn stop_association_timer(&self) {
        if let Some(token) = self.association_cancel.lock().expect("assoc poisoned").take() {
            token.cancel();
        }
    }

    pub fn disconnect_io_qpairs(&self) {
        for entry in self.qpairs.iter() {
            if *entry.key() != 0 {
                entry.value().cancel.cancel();
            }
        }
    }

    pub fn disconnect_all_qpairs(&self) {
        for entry in self.qpairs.iter() {
            entry.value().cancel.cancel();
        }
    }

    /// Final teardown: detach from the subsystem and stop every timer.
    pub fn destroy(self: &Arc<Self>) {
        debug!(cntlid = self.cntlid, "destroying controller");
        self.stop_keep_alive();
        self.stop_association_timer();
        self.cancel.cancel();
        self.disconnect_all_qpairs();
        self.subsys.remove_ctrlr(self.cntlid);
    }

    // ── async events ─────────────────────────────────────────────────────

    /// Queue an async event; deliver immediately when an AER slot is free.
    /// Duplicate kinds are suppressed until the host re-reads the log page
    /// with RAE=0.
    pub fn queue_async_event(&self, event: AsyncEvent) {
        let admin = self.admin_qpair();
        let mut inner = self.lock();

        if let Some(log) = LogPageId::from_u8(event.log_page()) {
            if let Some(bit) = aen_mask_bit(log) {
                if inner.aen_mask.contains(bit) {
                    return;
                }
                inner.aen_mask.insert(bit);
            }
        }

        if let Some(cid) = inner.aer_cids.pop_front() {
            drop(inner);
            if let Some(handle) = admin {
                let _ = handle.events.send(QpairEvent::CompleteAer { cid, value: event.0 });
            }
        } else {
            inner.pending_events.push_back(event);
        }
    }

    /// An AER command arrived on the admin qpair. Returns the event to
    /// complete it with immediately, or parks the cid.
    pub fn aer_arrived(&self, cid: u16) -> Result<Option<AsyncEvent>, ()> {
        let mut inner = self.lock();
        if let Some(event) = inner.pending_events.pop_front() {
            return Ok(Some(event));
        }
        if inner.aer_cids.len() >= MAX_ASYNC_EVENTS {
            return Err(());
        }
        inner.aer_cids.push_back(cid);
        Ok(None)
    }

    /// Clear the duplicate-suppression bit for `log` (RAE=0 read).
    pub fn unmask_aen(&self, log: LogPageId) {
        if let Some(bit) = aen_mask_bit(log) {
            self.lock().aen_mask.remove(bit);
        }
    }

    /// Record a namespace change for Identify/log-page 0x4 and notify.
    pub fn ns_changed(&self, nsid: u32) {
        {
            let mut inner = self.lock();
            if inner.changed_ns_overflow {
                return;
            }
            if inner.changed_ns.len() >= CHANGED_NS_MAX {
                inner.changed_ns.clear();
                inner.changed_ns_overflow = true;
            } else if !inner.changed_ns.contains(&nsid) {
                inner.changed_ns.push(nsid);
            }
        }
        self.queue_async_event(AsyncEvent::new(
            AsyncEvent::TYPE_NOTICE,
            AsyncEvent::INFO_NS_ATTR_CHANGED,
            LogPageId::ChangedNsList as u8,
        ));
    }

    /// Append a reservation notification and raise the matching AEN.
    pub fn reservation_notice(&self, nsid: u32, notify_type: u8) {
        {
            let mut inner = self.lock();
            inner.resv_log_count += 1;
            let mut entry = ReservationNotificationLog::default();
            entry.log_page_count.set(inner.resv_log_count);
            entry.log_page_type = notify_type;
            entry.nsid.set(nsid);
            entry.num_available = inner.resv_log.len().min(255) as u8;
            inner.resv_log.push_back(entry);
        }
        self.queue_async_event(AsyncEvent::new(
            AsyncEvent::TYPE_IO,
            AsyncEvent::INFO_RESERVATION_LOG_AVAIL,
            LogPageId::ReservationNotification as u8,
        ));
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
