// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Subsystem and namespace registry.
//!
//! A subsystem is the unit a host connects to by NQN. It owns namespaces
//! (each backed by a [`BlockDevice`]), gates host and listener admission,
//! tracks ANA state per namespace, and serializes reservation commands.
//! Controllers attach per host association and are looked up by cntlid when
//! I/O qpairs connect.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering},
};

use anyhow::{Result, bail};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::{
    bdev::BlockDevice,
    ctrlr::controller::Controller,
    nvme::types::IoOpcode,
};

/// Subsystem lifecycle; Connect is only admitted in `Active`, transient
/// states make Connect retry, the rest fail it outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsystemState {
    Inactive,
    Activating,
    Active,
    Pausing,
    Paused,
    Resuming,
    Deactivating,
}

impl SubsystemState {
    /// States worth retrying a Connect against.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Inactive | Self::Activating | Self::Pausing | Self::Paused | Self::Resuming
        )
    }
}

/// Well-known NQN every discovery service answers to.
pub const DISCOVERY_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubsystemType {
    Discovery,
    #[default]
    Nvme,
}

/// Asymmetric Namespace Access state, as reported in the ANA log.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnaState {
    Optimized = 0x1,
    NonOptimized = 0x2,
    Inaccessible = 0x3,
    PersistentLoss = 0x4,
    Change = 0xF,
}

impl AnaState {
    /// I/O is admitted only on reachable paths.
    pub fn allows_io(self) -> bool {
        matches!(self, Self::Optimized | Self::NonOptimized)
    }
}

/// Persistent-reservation types (cdw13 RTYPE).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResvType {
    WriteExclusive = 0x1,
    ExclusiveAccess = 0x2,
    WriteExclusiveRegOnly = 0x3,
    ExclusiveAccessRegOnly = 0x4,
    WriteExclusiveAllReg = 0x5,
    ExclusiveAccessAllReg = 0x6,
}

impl ResvType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x1 => Self::WriteExclusive,
            0x2 => Self::ExclusiveAccess,
            0x3 => Self::WriteExclusiveRegOnly,
            0x4 => Self::ExclusiveAccessRegOnly,
            0x5 => Self::WriteExclusiveAllReg,
            0x6 => Self::ExclusiveAccessAllReg,
            _ => return None,
        })
    }

    /// All-registrants types treat every registrant as a holder.
    pub fn all_registrants(self) -> bool {
        matches!(self, Self::WriteExclusiveAllReg | Self::ExclusiveAccessAllReg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registrant {
    pub hostid: [u8; 16],
    pub rkey: u64,
}

/// Reservation state of one namespace.
#[derive(Debug, Default, Clone)]
pub struct ReservationState {
    pub registrants: Vec<Registrant>,
    pub rtype: Option<ResvType>,
    pub holder: Option<[u8; 16]>,
    pub generation: u32,
}

impl ReservationState {
    pub fn registrant(&self, hostid: &[u8; 16]) -> Option<&Registrant> {
        self.registrants.iter().find(|r| &r.hostid == hostid)
    }

    fn is_holder(&self, hostid: &[u8; 16]) -> bool {
        match self.rtype {
            Some(t) if t.all_registrants() => self.registrant(hostid).is_some(),
            Some(_) => self.holder.as_ref() == Some(hostid),
            None => false,
        }
    }

    /// Reservation admission for an I/O opcode: reads are blocked only
    /// under exclusive-access, writes under both exclusive families.
    pub fn io_allowed(&self, hostid: &[u8; 16], opc: IoOpcode) -> bool {
        let Some(rtype) = self.rtype else {
            return true;
        };
        if self.is_holder(hostid) {
            return true;
        }
        let registered = self.registrant(hostid).is_some();
        match opc {
            IoOpcode::Read | IoOpcode::Compare => match rtype {
                ResvType::ExclusiveAccess => false,
                ResvType::ExclusiveAccessRegOnly | ResvType::ExclusiveAccessAllReg => registered,
                _ => true,
            },
            IoOpcode::Write
            | IoOpcode::Flush
            | IoOpcode::WriteZeroes
            | IoOpcode::DatasetManagement => match rtype {
                ResvType::WriteExclusive | ResvType::ExclusiveAccess => false,
                ResvType::WriteExclusiveRegOnly
                | ResvType::ExclusiveAccessRegOnly
                | ResvType::WriteExclusiveAllReg
                | ResvType::ExclusiveAccessAllReg => registered,
            },
            // Reservation commands themselves are validated by their handlers.
            _ => true,
        }
    }
}

/// One namespace: a block device plus identity and access state.
pub struct Namespace {
    pub nsid: u32,
    pub bdev: Arc<dyn BlockDevice>,
    pub anagrpid: u32,
    pub uuid: [u8; 16],
    pub nguid: [u8; 16],
    pub eui64: [u8; 8],
    ana_state: Mutex<AnaState>,
    pub resv: Mutex<ReservationState>,
}

impl Namespace {
    pub fn new(nsid: u32, bdev: Arc<dyn BlockDevice>) -> Self {
        // Derive a stable identity from the nsid; real deployments override
        // these via configuration.
        let mut uuid = [0u8; 16];
        uuid[12..16].copy_from_slice(&nsid.to_be_bytes());
        let mut nguid = [0u8; 16];
        nguid[0..4].copy_from_slice(&nsid.to_be_bytes());
        let mut eui64 = [0u8; 8];
        eui64[4..8].copy_from_slice(&nsid.to_be_bytes());
        Self {
            nsid,
            bdev,
            anagrpid: nsid,
            uuid,
            nguid,
            eui64,
            ana_state: Mutex::new(AnaState::Optimized),
            resv: Mutex::new(ReservationState::default()),
        }
    }

    pub fn ana_state(&self) -> AnaState {
        *self.ana_state.lock().expect("ana state poisoned")
    }

    pub fn set_ana_state(&self, state: AnaState) {
        *self.ana_state.lock().expect("ana state poisoned") = state;
    }
}

/// A subsystem and the controllers attached to it.
pub struct Subsystem {
    pub nqn: String,
    pub sn: String,
    pub mn: String,
    pub subtype: SubsystemType,
    pub ana_reporting: bool,
    allow_any_host: bool,
    allowed_hosts: Mutex<Vec<String>>,
    namespaces: DashMap<u32, Arc<Namespace>>,
    max_nsid: AtomicU32,
    state_tx: watch::Sender<SubsystemState>,
    pub state_rx: watch::Receiver<SubsystemState>,
    controllers: DashMap<u16, Arc<Controller>>,
    next_cntlid: AtomicU16,
    /// Reservation commands from every qpair funnel through this lock, which
    /// stands in for the subsystem thread they are serialized on.
    pub resv_serialize: tokio::sync::Mutex<()>,
    pub ana_change_count: AtomicU64,
}

impl Subsystem {
    pub fn new(nqn: impl Into<String>, subtype: SubsystemType) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(SubsystemState::Inactive);
        Arc::new(Self {
            nqn: nqn.into(),
            sn: "SPDK00000000000001".to_string(),
            mn: "SPDK bdev Controller".to_string(),
            subtype,
            ana_reporting: false,
            allow_any_host: true,
            allowed_hosts: Mutex::new(Vec::new()),
            namespaces: DashMap::new(),
            max_nsid: AtomicU32::new(0),
            state_tx,
            state_rx,
            controllers: DashMap::new(),
            next_cntlid: AtomicU16::new(1),
            resv_serialize: tokio::sync::Mutex::new(()),
            ana_change_count: AtomicU64::new(0),
        })
    }

    pub fn with_access(
        nqn: impl Into<String>,
        subtype: SubsystemType,
        allow_any_host: bool,
        hosts: Vec<String>,
        ana_reporting: bool,
    ) -> Arc<Self> {
        let sub = Self::new(nqn, subtype);
        // Arc::new just returned a unique reference.
        let mut inner = Arc::into_inner(sub).expect("fresh subsystem is unique");
        inner.allow_any_host = allow_any_host;
        inner.allowed_hosts = Mutex::new(hosts);
        inner.ana_reporting = ana_reporting;
        Arc::new(inner)
    }

    pub fn state(&self) -> SubsystemState {
        *self.state_rx.borrow()
    }

    pub fn set_state(&self, state: SubsystemState) {
        debug!(nqn = %self.nqn, ?state, "subsystem state change");
        let _ = self.state_tx.send(state);
    }

    pub fn add_namespace(&self, ns: Namespace) -> Result<Arc<Namespace>> {
        let nsid = ns.nsid;
        if nsid == 0 || nsid == u32::MAX {
            bail!("invalid nsid {nsid}");
        }
        let ns = Arc::new(ns);
        if self.namespaces.insert(nsid, Arc::clone(&ns)).is_some() {
            bail!("nsid {nsid} already present in {}", self.nqn);
        }
        self.max_nsid.fetch_max(nsid, Ordering::SeqCst);
        Ok(ns)
    }

    pub fn remove_namespace(&self, nsid: u32) -> Option<Arc<Namespace>> {
        self.namespaces.remove(&nsid).map(|(_, ns)| ns)
    }

    pub fn find_ns(&self, nsid: u32) -> Option<Arc<Namespace>> {
        self.namespaces.get(&nsid).map(|e| Arc::clone(e.value()))
    }

    /// Namespaces sorted by nsid.
    pub fn iterate_ns(&self) -> Vec<Arc<Namespace>> {
        let mut out: Vec<_> = self.namespaces.iter().map(|e| Arc::clone(e.value())).collect();
        out.sort_by_key(|ns| ns.nsid);
        out
    }

    pub fn max_nsid(&self) -> u32 {
        self.max_nsid.load(Ordering::SeqCst)
    }

    pub fn host_allowed(&self, hostnqn: &str) -> bool {
        if self.allow_any_host {
            return true;
        }
        self.allowed_hosts
            .lock()
            .expect("hosts poisoned")
            .iter()
            .any(|h| h == hostnqn)
    }

    /// Listener admission. The static provisioning in this target allows all
    /// configured listeners, so only the subsystem state gates here.
    pub fn listener_allowed(&self, _traddr: &str) -> bool {
        true
    }

    pub fn alloc_cntlid(&self) -> Option<u16> {
        // cntlid 0 and 0xFFFF are reserved.
        for _ in 0..u16::MAX {
            let id = self.next_cntlid.fetch_add(1, Ordering::SeqCst);
            if id == 0 || id == u16::MAX {
                continue;
            }
            if !self.controllers.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    pub fn add_ctrlr(&self, ctrlr: Arc<Controller>) -> Result<()> {
        let cntlid = ctrlr.cntlid;
        if self.controllers.insert(cntlid, ctrlr).is_some() {
            bail!("cntlid {cntlid} already attached to {}", self.nqn);
        }
        Ok(())
    }

    pub fn remove_ctrlr(&self, cntlid: u16) {
        self.controllers.remove(&cntlid);
    }

    pub fn get_ctrlr(&self, cntlid: u16) -> Option<Arc<Controller>> {
        self.controllers.get(&cntlid).map(|e| Arc::clone(e.value()))
    }

    pub fn controllers(&self) -> Vec<Arc<Controller>> {
        self.controllers.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Fan an async event out to every attached controller.
    pub fn notify_all(&self, event: crate::nvme::types::AsyncEvent) {
        for ctrlr in self.controllers.iter() {
            ctrlr.value().queue_async_event(event);
        }
    }
}

/// Process-wide subsystem registry.
#[derive(Default)]
pub struct Registry {
    subsystems: DashMap<String, Arc<Subsystem>>,
    pub discovery_genctr: AtomicU64,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, sub: Arc<Subsystem>) -> Result<()> {
        let nqn = sub.nqn.clone();
        if self.subsystems.insert(nqn.clone(), sub).is_some() {
            bail!("subsystem {nqn} already registered");
        }
        self.discovery_genctr.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn find(&self, nqn: &str) -> Option<Arc<Subsystem>> {
        self.subsystems.get(nqn).map(|e| Arc::clone(e.value()))
    }

    pub fn iterate(&self) -> Vec<Arc<Subsystem>> {
        let mut out: Vec<_> = self.subsystems.iter().map(|e| Arc::clone(e.value())).collect();
        out.sort_by(|a, b| a.nqn.cmp(&b.nqn));
        out
    }
}
