// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Admin command dispatch: Identify, Get Log Page, Get/Set Features, Abort,
//! Async Event Request, Keep Alive.

use std::{sync::Arc, time::Duration};

use tracing::{debug, warn};
use zerocopy::IntoBytes;

use crate::{
    ctrlr::controller::{Controller, MAX_ASYNC_EVENTS},
    nvme::{
        features::{
            AEN_CFG_ALLOWED, FEAT_SAVE, FeatureId, MIN_KEEP_ALIVE_TIMEOUT_MS,
        },
        identify::{
            CMIC_ANA_REPORTING, CMIC_MULTI_PORT, Cns, FUSES_COMPARE_AND_WRITE, IDENTIFY_LEN,
            IdentifyController, IdentifyNamespace, NS_LIST_MAX, NsIdType, ONCS_COMPARE,
            ONCS_DSM, ONCS_RESERVATIONS, ONCS_WRITE_ZEROES, SGLS_KEYED, SGLS_OFFSET,
            SGLS_SUPPORTED, push_ns_descriptor,
        },
        log::{
            AnaGroupDescriptor, AnaLogHeader, CHANGED_NS_LIST_MAX, DiscoveryLogEntry,
            DiscoveryLogHeader, EFFECTS_CSUPP, EFFECTS_LOG_LEN, ERROR_LOG_ENTRIES,
            ERROR_LOG_ENTRY_LEN, FirmwareLog, HealthLog, LogPageId,
            SUBTYPE_DISCOVERY, SUBTYPE_NVME, TREQ_SECURE_CHANNEL_NOT_REQUIRED, TRTYPE_TCP,
        },
        types::{self, AdminOpcode, AsyncEvent, IoOpcode, NvmeCpl, Sct},
    },
    subsystem::{AnaState, Registry, SubsystemType},
    transport::{ListenerInfo, qpair::QpairEvent, request::TcpRequest},
};

/// Firmware revision reported in Identify Controller and the firmware log.
pub const FIRMWARE_REV: [u8; 8] = *b"25.01   ";

/// What the qpair should do with the request after dispatch.
#[derive(Debug, PartialEq, Eq)]
pub enum AdminDisposition {
    /// Response is filled; complete the request.
    Complete,
    /// Async Event Request parked; the request stays outstanding.
    AerParked,
}

pub struct AdminEnv<'a> {
    pub ctrlr: &'a Arc<Controller>,
    pub registry: &'a Arc<Registry>,
    pub listeners: Vec<ListenerInfo>,
}

fn invalid_field(rsp: &mut NvmeCpl) {
    rsp.set_status(Sct::Generic, types::generic::INVALID_FIELD);
    rsp.set_dnr();
}

fn invalid_opcode(rsp: &mut NvmeCpl) {
    rsp.set_status(Sct::Generic, types::generic::INVALID_OPCODE);
    rsp.set_dnr();
}

/// Copy a fully built payload into the request's data buffers, zero-filling
/// any remainder the host asked for beyond the source.
fn copy_out(req: &mut TcpRequest, src: &[u8]) {
    let mut off = 0usize;
    for slice in req.data_slices_mut() {
        let take = slice.len().min(src.len().saturating_sub(off));
        slice[..take].copy_from_slice(&src[off..off + take]);
        if take < slice.len() {
            slice[take..].fill(0);
        }
        off += take;
    }
}

/// Gather the request's inbound payload into one contiguous buffer.
fn copy_in(req: &TcpRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(req.length as usize);
    for slice in req.data_slices() {
        out.extend_from_slice(slice);
    }
    out
}

/// Dispatch one admin command. The request's response capsule is filled in
/// place; AERs may park instead of completing.
pub async fn handle_admin(env: &AdminEnv<'_>, req: &mut TcpRequest) -> AdminDisposition {
    env.ctrlr.touch_keep_alive();

    let Some(opc) = AdminOpcode::from_u8(req.cmd.opc) else {
        debug!(opc = req.cmd.opc, "unknown admin opcode");
        invalid_opcode(&mut req.rsp);
        return AdminDisposition::Complete;
    };

    // Discovery controllers expose a narrow admin surface.
    if env.ctrlr.subsys.subtype == SubsystemType::Discovery
        && !matches!(
            opc,
            AdminOpcode::Identify
                | AdminOpcode::GetLogPage
                | AdminOpcode::KeepAlive
                | AdminOpcode::AsyncEventRequest
                | AdminOpcode::GetFeatures
                | AdminOpcode::SetFeatures
        )
    {
        invalid_opcode(&mut req.rsp);
        return AdminDisposition::Complete;
    }

    match opc {
        AdminOpcode::Identify => identify(env, req),
        AdminOpcode::GetLogPage => get_log_page(env, req),
        AdminOpcode::GetFeatures => get_features(env, req),
        AdminOpcode::SetFeatures => set_features(env, req),
        AdminOpcode::KeepAlive => {
            req.rsp.set_status(Sct::Generic, types::generic::SUCCESS);
        },
        AdminOpcode::AsyncEventRequest => {
            return async_event_request(env, req);
        },
        AdminOpcode::Abort => {
            abort(env, req).await;
        },
    }
    AdminDisposition::Complete
}

// ── Identify ─────────────────────────────────────────────────────────────

fn identify(env: &AdminEnv<'_>, req: &mut TcpRequest) {
    let cns = req.cmd.cdw10.get() as u8;
    match Cns::from_u8(cns) {
        Some(Cns::Controller) => identify_ctrlr(env, req),
        Some(Cns::Namespace) => identify_ns(env, req),
        Some(Cns::ActiveNsList) => identify_ns_list(env, req),
        Some(Cns::NsDescriptorList) => identify_ns_descriptors(env, req),
        None => {
            debug!(cns, "unsupported identify cns");
            invalid_field(&mut req.rsp);
        },
    }
}

fn identify_ctrlr(env: &AdminEnv<'_>, req: &mut TcpRequest) {
    let ctrlr = env.ctrlr;
    let opts = &ctrlr.opts;
    let subsys = &ctrlr.subsys;
    let mut id = IdentifyController::default();

    let sn = subsys.sn.as_bytes();
    id.sn[..sn.len().min(20)].copy_from_slice(&sn[..sn.len().min(20)]);
    for b in id.sn.iter_mut().skip(sn.len().min(20)) {
        *b = b' ';
    }
    let mn = subsys.mn.as_bytes();
    id.mn[..mn.len().min(40)].copy_from_slice(&mn[..mn.len().min(40)]);
    for b in id.mn.iter_mut().skip(mn.len().min(40)) {
        *b = b' ';
    }
    id.fr = FIRMWARE_REV;

    id.ieee = [0xE4, 0xD2, 0x5C];
    id.cmic = CMIC_MULTI_PORT;
    if subsys.ana_reporting {
        id.cmic |= CMIC_ANA_REPORTING;
        id.anacap = 0x07;
        id.anatt = 10;
        id.anagrpmax.set(subsys.max_nsid());
        id.nanagrpid.set(subsys.iterate_ns().len() as u32);
    }
    id.mdts = (opts.max_io_size / 4096).ilog2() as u8;
    id.cntlid.set(ctrlr.cntlid);
    id.ver.set(ctrlr.lock().vcprop.vs);
    id.oaes.set(1 << 8); // namespace attribute notices
    id.aerl = (MAX_ASYNC_EVENTS - 1) as u8;
    id.elpe = (ERROR_LOG_ENTRIES - 1) as u8;
    id.frmw = 1 << 1; // one slot, no reset needed
    id.lpa = 1 << 2;  // extended-data Get Log Page
    id.kas.set(100); // 100 ms units of the keep-alive tick
    if ctrlr.lock().acre {
        id.crdt1.set(1);
    }
    id.sqes = 0x66;
    id.cqes = 0x44;
    id.maxcmd.set(opts.max_queue_depth);
    id.nn.set(subsys.max_nsid());

    let mut oncs = ONCS_RESERVATIONS;
    for ns in subsys.iterate_ns() {
        if ns.bdev.supports(crate::bdev::IoType::Unmap) {
            oncs |= ONCS_DSM;
        }
        if ns.bdev.supports(crate::bdev::IoType::Compare) {
            oncs |= ONCS_COMPARE;
        }
        if ns.bdev.supports(crate::bdev::IoType::WriteZeroes) {
            oncs |= ONCS_WRITE_ZEROES;
        }
    }
    id.oncs.set(oncs);
    if oncs & ONCS_COMPARE != 0 {
        id.fuses.set(FUSES_COMPARE_AND_WRITE);
    }
    id.vwc = 0x01;
    id.sgls.set(SGLS_SUPPORTED | SGLS_KEYED | SGLS_OFFSET);

    let nqn = subsys.nqn.as_bytes();
    id.subnqn[..nqn.len().min(255)].copy_from_slice(&nqn[..nqn.len().min(255)]);

    id.ioccsz.set((types::NVME_CMD_LEN as u32 + opts.in_capsule_data_size) / 16);
    id.iorcsz.set(types::NVME_CPL_LEN as u32 / 16);
    id.icdoff.set(0);
    id.msdbd = 1;

    if subsys.subtype == SubsystemType::Discovery {
        id.cntrltype = 2; // discovery controller
        id.maxcmd.set(opts.max_aq_depth);
    } else {
        id.cntrltype = 1; // I/O controller
    }

    copy_out(req, id.as_bytes());
    req.rsp.set_status(Sct::Generic, types::generic::SUCCESS);
}

fn identify_ns(env: &AdminEnv<'_>, req: &mut TcpRequest) {
    let nsid = req.cmd.nsid.get();
    let Some(ns) = env.ctrlr.subsys.find_ns(nsid) else {
        req.rsp.set_status(Sct::Generic, types::generic::INVALID_NAMESPACE_OR_FORMAT);
        req.rsp.set_dnr();
        return;
    };

    let mut id = IdentifyNamespace::default();
    let blocks = ns.bdev.block_count();
    id.nsze.set(blocks);
    id.ncap.set(blocks);
    let ana = ns.ana_state();
    // Unreachable paths report the namespace as unused.
    if matches!(ana, AnaState::Inaccessible | AnaState::PersistentLoss) {
        id.nuse.set(0);
    } else {
        id.nuse.set(blocks);
    }
    id.nlbaf = 0;
    id.flbas = 0;
    id.lbaf[0].lbads = ns.bdev.block_size().ilog2() as u8;
    id.nmic = 0x01; // may be attached to multiple controllers
    id.rescap = 0x7E; // all reservation types, no persist-through-power-loss
    id.anagrpid.set(ns.anagrpid);
    id.nguid = ns.nguid;
    id.eui64 = ns.eui64;

    // NOIOB is expressed in logical blocks and bounded by MDTS.
    let noiob = (env.ctrlr.opts.max_io_size / ns.bdev.block_size()).min(u16::MAX as u32);
    id.noiob.set(noiob as u16);

    copy_out(req, id.as_bytes());
    req.rsp.set_status(Sct::Generic, types::generic::SUCCESS);
}

fn identify_ns_list(env: &AdminEnv<'_>, req: &mut TcpRequest) {
    let floor = req.cmd.nsid.get();
    let mut page = vec![0u8; IDENTIFY_LEN];
    let mut n = 0usize;
    for ns in env.ctrlr.subsys.iterate_ns() {
        if ns.nsid <= floor {
            continue;
        }
        if n >= NS_LIST_MAX {
            break;
        }
        page[n * 4..n * 4 + 4].copy_from_slice(&ns.nsid.to_le_bytes());
        n += 1;
    }
    copy_out(req, &page);
    req.rsp.set_status(Sct::Generic, types::generic::SUCCESS);
}

fn identify_ns_descriptors(env: &AdminEnv<'_>, req: &mut TcpRequest) {
    let nsid = req.cmd.nsid.get();
    let Some(ns) = env.ctrlr.subsys.find_ns(nsid) else {
        req.rsp.set_status(Sct::Generic, types::generic::INVALID_NAMESPACE_OR_FORMAT);
        req.rsp.set_dnr();
        return;
    };
    let mut page = Vec::with_capacity(IDENTIFY_LEN);
    push_ns_descriptor(&mut page, NsIdType::Eui64, &ns.eui64);
    push_ns_descriptor(&mut page, NsIdType::Nguid, &ns.nguid);
    push_ns_descriptor(&mut page, NsIdType::Uuid, &ns.uuid);
    page.resize(IDENTIFY_LEN, 0); // zero terminator and padding
    copy_out(req, &page);
    req.rsp.set_status(Sct::Generic, types::generic::SUCCESS);
}

// ── Get Log Page ─────────────────────────────────────────────────────────

fn get_log_page(env: &AdminEnv<'_>, req: &mut TcpRequest) {
    let cdw10 = req.cmd.cdw10.get();
    let lid = cdw10 as u8;
    let rae = cdw10 & (1 << 15) != 0;
    let numdl = (cdw10 >> 16) & 0xFFFF;
    let numdu = req.cmd.cdw11.get() & 0xFFFF;
    let numd = (numdu << 16) | numdl;
    let len = ((numd as u64) + 1) * 4;
    let offset =
        ((req.cmd.cdw13.get() as u64) << 32) | req.cmd.cdw12.get() as u64;

    let Some(lid) = LogPageId::from_u8(lid) else {
        debug!(lid = cdw10 as u8, "unsupported log page");
        req.rsp.set_status(Sct::CommandSpecific, types::cmd_specific::INVALID_LOG_PAGE);
        req.rsp.set_dnr();
        return;
    };

    if offset % 4 != 0 {
        invalid_field(&mut req.rsp);
        return;
    }

    let page = match lid {
        LogPageId::Error => vec![0u8; ERROR_LOG_ENTRY_LEN * ERROR_LOG_ENTRIES],
        LogPageId::Health => HealthLog::default().as_bytes().to_vec(),
        LogPageId::Firmware => {
            let mut log = FirmwareLog::default();
            log.frs[0] = FIRMWARE_REV;
            log.as_bytes().to_vec()
        },
        LogPageId::ChangedNsList => changed_ns_log(env),
        LogPageId::CommandEffects => effects_log(),
        LogPageId::Ana => ana_log(env),
        LogPageId::Discovery => discovery_log(env),
        LogPageId::ReservationNotification => reservation_log(env),
    };

    let start = (offset as usize).min(page.len());
    let end = (offset as usize).saturating_add(len as usize).min(page.len());
    copy_out(req, &page[start..end]);

    if !rae {
        env.ctrlr.unmask_aen(lid);
        if lid == LogPageId::ChangedNsList {
            let mut inner = env.ctrlr.lock();
            inner.changed_ns.clear();
            inner.changed_ns_overflow = false;
        }
    }
    req.rsp.set_status(Sct::Generic, types::generic::SUCCESS);
}

fn changed_ns_log(env: &AdminEnv<'_>) -> Vec<u8> {
    let inner = env.ctrlr.lock();
    let mut page = vec![0u8; CHANGED_NS_LIST_MAX * 4];
    if inner.changed_ns_overflow {
        page[0..4].copy_from_slice(&crate::nvme::log::CHANGED_NS_OVERFLOW.to_le_bytes());
    } else {
        for (i, nsid) in inner.changed_ns.iter().enumerate() {
            page[i * 4..i * 4 + 4].copy_from_slice(&nsid.to_le_bytes());
        }
    }
    page
}

fn effects_log() -> Vec<u8> {
    let mut page = vec![0u8; EFFECTS_LOG_LEN];
    let mut set = |acs: bool, opc: u8| {
        let base = if acs { 0 } else { 1024 };
        let off = base + opc as usize * 4;
        page[off..off + 4].copy_from_slice(&EFFECTS_CSUPP.to_le_bytes());
    };
    for opc in [
        AdminOpcode::GetLogPage as u8,
        AdminOpcode::Identify as u8,
        AdminOpcode::Abort as u8,
        AdminOpcode::SetFeatures as u8,
        AdminOpcode::GetFeatures as u8,
        AdminOpcode::AsyncEventRequest as u8,
        AdminOpcode::KeepAlive as u8,
    ] {
        set(true, opc);
    }
    for opc in [
        IoOpcode::Flush as u8,
        IoOpcode::Write as u8,
        IoOpcode::Read as u8,
        IoOpcode::Compare as u8,
        IoOpcode::WriteZeroes as u8,
        IoOpcode::DatasetManagement as u8,
        IoOpcode::ReservationRegister as u8,
        IoOpcode::ReservationReport as u8,
        IoOpcode::ReservationAcquire as u8,
        IoOpcode::ReservationRelease as u8,
    ] {
        set(false, opc);
    }
    page
}

/// ANA log: header, then one descriptor per non-empty group followed by the
/// nsids of that group.
fn ana_log(env: &AdminEnv<'_>) -> Vec<u8> {
    let subsys = &env.ctrlr.subsys;
    let change_count =
        subsys.ana_change_count.load(std::sync::atomic::Ordering::SeqCst);

    // Group namespaces by anagrpid, sorted for a stable layout.
    let mut groups: Vec<(u32, Vec<&Arc<crate::subsystem::Namespace>>)> = Vec::new();
    let namespaces = subsys.iterate_ns();
    for ns in &namespaces {
        match groups.binary_search_by_key(&ns.anagrpid, |g| g.0) {
            Ok(i) => groups[i].1.push(ns),
            Err(i) => groups.insert(i, (ns.anagrpid, vec![ns])),
        }
    }

    let mut header = AnaLogHeader::default();
    header.change_count.set(change_count);
    header.num_group_desc.set(groups.len() as u16);

    let mut page = header.as_bytes().to_vec();
    for (anagrpid, members) in &groups {
        let mut desc = AnaGroupDescriptor::default();
        desc.anagrpid.set(*anagrpid);
        desc.num_nsids.set(members.len() as u32);
        desc.change_count.set(change_count);
        desc.ana_state = members[0].ana_state() as u8;
        page.extend_from_slice(desc.as_bytes());
        for ns in members {
            page.extend_from_slice(&ns.nsid.to_le_bytes());
        }
    }
    page
}

fn discovery_log(env: &AdminEnv<'_>) -> Vec<u8> {
    let subsystems: Vec<_> = env
        .registry
        .iterate()
        .into_iter()
        .filter(|s| s.subtype == SubsystemType::Nvme)
        .collect();

    let mut header = DiscoveryLogHeader::default();
    header
        .genctr
        .set(env.registry.discovery_genctr.load(std::sync::atomic::Ordering::SeqCst));
    header.numrec.set((subsystems.len() * env.listeners.len()) as u64);

    let mut page = header.as_bytes().to_vec();
    for sub in &subsystems {
        for listener in &env.listeners {
            let mut entry = DiscoveryLogEntry::default();
            entry.trtype = TRTYPE_TCP;
            entry.adrfam = listener.adrfam;
            entry.subtype = if sub.subtype == SubsystemType::Discovery {
                SUBTYPE_DISCOVERY
            } else {
                SUBTYPE_NVME
            };
            entry.treq = TREQ_SECURE_CHANNEL_NOT_REQUIRED;
            entry.portid.set(listener.portid);
            entry.cntlid.set(crate::nvme::fabrics::CNTLID_DYNAMIC);
            entry.asqsz.set(env.ctrlr.opts.max_aq_depth);
            let svc = listener.trsvcid.as_bytes();
            entry.trsvcid[..svc.len().min(32)].copy_from_slice(&svc[..svc.len().min(32)]);
            let addr = listener.traddr.as_bytes();
            entry.traddr[..addr.len().min(255)].copy_from_slice(&addr[..addr.len().min(255)]);
            let nqn = sub.nqn.as_bytes();
            entry.subnqn[..nqn.len().min(255)].copy_from_slice(&nqn[..nqn.len().min(255)]);
            page.extend_from_slice(entry.as_bytes());
        }
    }
    page
}

fn reservation_log(env: &AdminEnv<'_>) -> Vec<u8> {
    let mut inner = env.ctrlr.lock();
    let mut page = Vec::new();
    while let Some(entry) = inner.resv_log.pop_front() {
        page.extend_from_slice(entry.as_bytes());
    }
    if page.is_empty() {
        page.resize(core::mem::size_of::<crate::nvme::log::ReservationNotificationLog>(), 0);
    }
    page
}

// ── Features ─────────────────────────────────────────────────────────────

fn get_features(env: &AdminEnv<'_>, req: &mut TcpRequest) {
    let fid = req.cmd.cdw10.get() as u8;
    let Some(fid) = FeatureId::from_u8(fid) else {
        invalid_field(&mut req.rsp);
        return;
    };
    let ctrlr = env.ctrlr;
    let inner = ctrlr.lock();
    let value = match fid {
        FeatureId::Arbitration => inner.feat.arbitration,
        FeatureId::PowerManagement => inner.feat.power_management,
        FeatureId::TemperatureThreshold => inner.feat.temperature_threshold,
        FeatureId::ErrorRecovery => inner.feat.error_recovery,
        FeatureId::VolatileWriteCache => inner.feat.volatile_write_cache,
        FeatureId::NumberOfQueues => inner.feat.number_of_queues,
        FeatureId::InterruptCoalescing => inner.feat.interrupt_coalescing,
        FeatureId::InterruptVectorConfiguration => inner.feat.interrupt_vector_configuration,
        FeatureId::WriteAtomicity => inner.feat.write_atomicity,
        FeatureId::AsyncEventConfiguration => inner.feat.async_event_configuration,
        FeatureId::KeepAliveTimer => inner.feat.keep_alive_timer_ms,
        FeatureId::ReservationNotificationMask => inner.feat.reservation_notification_mask,
        FeatureId::ReservationPersistence => inner.feat.reservation_persistence,
        FeatureId::HostIdentifier => {
            // Fabrics hosts always use the extended (16-byte) identifier.
            if req.cmd.cdw11.get() & 1 == 0 {
                drop(inner);
                invalid_field(&mut req.rsp);
                return;
            }
            let host_id = inner.feat.host_identifier;
            drop(inner);
            copy_out(req, &host_id);
            req.rsp.set_status(Sct::Generic, types::generic::SUCCESS);
            return;
        },
        FeatureId::HostBehaviorSupport => {
            let mut page = [0u8; 512];
            page[0] = inner.acre as u8;
            drop(inner);
            copy_out(req, &page);
            req.rsp.set_status(Sct::Generic, types::generic::SUCCESS);
            return;
        },
    };
    drop(inner);
    req.rsp.cdw0.set(value);
    req.rsp.set_status(Sct::Generic, types::generic::SUCCESS);
}

fn set_features(env: &AdminEnv<'_>, req: &mut TcpRequest) {
    if req.cmd.cdw10.get() & FEAT_SAVE != 0 {
        req.rsp
            .set_status(Sct::CommandSpecific, types::cmd_specific::FEATURE_ID_NOT_SAVEABLE);
        req.rsp.set_dnr();
        return;
    }
    let fid = req.cmd.cdw10.get() as u8;
    let Some(fid) = FeatureId::from_u8(fid) else {
        invalid_field(&mut req.rsp);
        return;
    };
    let ctrlr = env.ctrlr;
    let cdw11 = req.cmd.cdw11.get();

    match fid {
        FeatureId::Arbitration => ctrlr.lock().feat.arbitration = cdw11,
        FeatureId::PowerManagement => {
            // Only power state zero exists here.
            if cdw11 & 0x1F != 0 {
                invalid_field(&mut req.rsp);
                return;
            }
            ctrlr.lock().feat.power_management = cdw11;
        },
        FeatureId::TemperatureThreshold => ctrlr.lock().feat.temperature_threshold = cdw11,
        FeatureId::ErrorRecovery => {
            // Deallocated-block error reporting needs bdev support we do not
            // advertise.
            if cdw11 & (1 << 16) != 0 {
                invalid_field(&mut req.rsp);
                return;
            }
            ctrlr.lock().feat.error_recovery = cdw11;
        },
        FeatureId::VolatileWriteCache => ctrlr.lock().feat.volatile_write_cache = cdw11 & 1,
        FeatureId::NumberOfQueues => {
            let inner = ctrlr.lock();
            if inner.io_qpairs_ever_created {
                drop(inner);
                req.rsp
                    .set_status(Sct::Generic, types::generic::COMMAND_SEQUENCE_ERROR);
                req.rsp.set_dnr();
                return;
            }
            // The host's ask is ignored; the pre-configured count is law.
            let value = inner.feat.number_of_queues;
            drop(inner);
            req.rsp.cdw0.set(value);
            req.rsp.set_status(Sct::Generic, types::generic::SUCCESS);
            return;
        },
        FeatureId::InterruptCoalescing => ctrlr.lock().feat.interrupt_coalescing = cdw11,
        FeatureId::InterruptVectorConfiguration => {
            ctrlr.lock().feat.interrupt_vector_configuration = cdw11
        },
        FeatureId::WriteAtomicity => ctrlr.lock().feat.write_atomicity = cdw11,
        FeatureId::AsyncEventConfiguration => {
            ctrlr.lock().feat.async_event_configuration = cdw11 & AEN_CFG_ALLOWED;
        },
        FeatureId::KeepAliveTimer => {
            if cdw11 == 0 {
                req.rsp.set_status(Sct::Generic, types::generic::KEEP_ALIVE_INVALID);
                req.rsp.set_dnr();
                return;
            }
            let kato = cdw11.max(MIN_KEEP_ALIVE_TIMEOUT_MS);
            ctrlr.lock().feat.keep_alive_timer_ms = kato;
            ctrlr.kato_ms.store(kato, std::sync::atomic::Ordering::SeqCst);
            req.rsp.cdw0.set(kato);
        },
        FeatureId::HostIdentifier => {
            if cdw11 & 1 == 0 {
                invalid_field(&mut req.rsp);
                return;
            }
            let data = copy_in(req);
            if data.len() < 16 {
                invalid_field(&mut req.rsp);
                return;
            }
            let mut host_id = [0u8; 16];
            host_id.copy_from_slice(&data[..16]);
            ctrlr.lock().feat.host_identifier = host_id;
        },
        FeatureId::ReservationNotificationMask => {
            ctrlr.lock().feat.reservation_notification_mask = cdw11;
        },
        FeatureId::ReservationPersistence => {
            ctrlr.lock().feat.reservation_persistence = cdw11;
        },
        FeatureId::HostBehaviorSupport => {
            let data = copy_in(req);
            match data.first() {
                Some(0) => ctrlr.lock().acre = false,
                Some(1) => ctrlr.lock().acre = true,
                other => {
                    warn!(?other, "host behavior support with invalid acre");
                    invalid_field(&mut req.rsp);
                    return;
                },
            }
        },
    }
    req.rsp.set_status(Sct::Generic, types::generic::SUCCESS);
}

// ── Async Event Request / Abort ──────────────────────────────────────────

fn async_event_request(env: &AdminEnv<'_>, req: &mut TcpRequest) -> AdminDisposition {
    match env.ctrlr.aer_arrived(req.cid()) {
        Ok(Some(event)) => {
            req.rsp.cdw0.set(event.0);
            req.rsp.set_status(Sct::Generic, types::generic::SUCCESS);
            AdminDisposition::Complete
        },
        Ok(None) => AdminDisposition::AerParked,
        Err(()) => {
            req.rsp.set_status(
                Sct::CommandSpecific,
                types::cmd_specific::ASYNC_EVENT_REQUEST_LIMIT_EXCEEDED,
            );
            req.rsp.set_dnr();
            AdminDisposition::Complete
        },
    }
}

/// Abort: complete a matching parked AER locally, otherwise ask the owning
/// qpair to interrupt the command, bounded by the abort timeout. CDW0 bit 0
/// clear means the command was aborted.
async fn abort(env: &AdminEnv<'_>, req: &mut TcpRequest) {
    let cdw10 = req.cmd.cdw10.get();
    let sqid = (cdw10 & 0xFFFF) as u16;
    let cid = (cdw10 >> 16) as u16;

    // AER slots never reach a qpair's in-flight table; cancel them here.
    if sqid == 0 {
        let mut inner = env.ctrlr.lock();
        if let Some(pos) = inner.aer_cids.iter().position(|&c| c == cid) {
            inner.aer_cids.remove(pos);
            drop(inner);
            if let Some(admin) = env.ctrlr.admin_qpair() {
                let _ = admin.events.send(QpairEvent::AbortAer { cid });
            }
            req.rsp.cdw0.set(0);
            req.rsp.set_status(Sct::Generic, types::generic::SUCCESS);
            return;
        }
    }

    let target = env.ctrlr.each_qpair().into_iter().find(|h| h.qid == sqid);
    let aborted = match target {
        Some(handle) => {
            let (tx, rx) = tokio::sync::oneshot::channel();
            if handle.events.send(QpairEvent::Abort { cid, reply: tx }).is_ok() {
                let timeout = Duration::from_secs(env.ctrlr.opts.abort_timeout_sec as u64);
                matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(true)))
            } else {
                false
            }
        },
        None => false,
    };

    req.rsp.cdw0.set(if aborted { 0 } else { 1 });
    req.rsp.set_status(Sct::Generic, types::generic::SUCCESS);
}

/// AEN raised when a namespace's ANA state changes.
pub fn ana_change_event() -> AsyncEvent {
    AsyncEvent::new(
        AsyncEvent::TYPE_NOTICE,
        AsyncEvent::INFO_ANA_CHANGE,
        LogPageId::Ana as u8,
    )
}
