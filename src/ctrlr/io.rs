// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! I/O command admission and routing.
//!
//! Before anything touches a block device the command passes four gates:
//! the controller must be enabled, the namespace active, the ANA path
//! reachable, and the reservation rules satisfied. Reservation commands
//! themselves are serialized per subsystem and complete inline.

use std::sync::Arc;

use tracing::debug;
use zerocopy::{FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U32, U64};

use crate::{
    bdev::{IoStatus, IoType},
    ctrlr::controller::Controller,
    nvme::{
        log::RESV_NOTIFY_RESERVATION_RELEASED,
        types::{self, IoOpcode, NvmeCpl, Sct},
    },
    subsystem::{AnaState, Namespace, Registrant, ResvType},
    transport::request::TcpRequest,
};

/// Admission verdict: either pass, or a status to complete with.
pub fn check_admission(
    ctrlr: &Arc<Controller>,
    ns: &Namespace,
    opc: IoOpcode,
) -> Result<(), (Sct, u8)> {
    let ana = ns.ana_state();
    if !ana.allows_io() {
        let sc = match ana {
            AnaState::Inaccessible => types::path::ANA_INACCESSIBLE,
            AnaState::PersistentLoss => types::path::ANA_PERSISTENT_LOSS,
            _ => types::path::ANA_TRANSITION,
        };
        return Err((Sct::Path, sc));
    }

    let resv = ns.resv.lock().expect("resv poisoned");
    if !resv.io_allowed(&ctrlr.host_id, opc) {
        return Err((Sct::Generic, types::generic::RESERVATION_CONFLICT));
    }
    Ok(())
}

/// Starting LBA and 1-based block count of a rw-style command.
pub fn lba_span(req: &TcpRequest) -> (u64, u64) {
    let slba = ((req.cmd.cdw11.get() as u64) << 32) | req.cmd.cdw10.get() as u64;
    let nlb = (req.cmd.cdw12.get() & 0xFFFF) as u64 + 1;
    (slba, nlb)
}

/// Map a device completion onto the response capsule. Retryable errors get
/// CRD when the host enabled advanced command retry.
pub fn apply_io_status(ctrlr: &Arc<Controller>, status: IoStatus, rsp: &mut NvmeCpl) {
    match status {
        IoStatus::Success => rsp.set_status(Sct::Generic, types::generic::SUCCESS),
        IoStatus::NoMem => {
            rsp.set_status(Sct::Generic, types::generic::INTERNAL_DEVICE_ERROR);
            if ctrlr.lock().acre {
                rsp.set_crd(1);
            }
        },
        IoStatus::CompareFailure => {
            rsp.set_status(Sct::MediaError, types::media::COMPARE_FAILURE);
            rsp.set_dnr();
        },
        IoStatus::OutOfRange => {
            rsp.set_status(Sct::Generic, types::generic::LBA_OUT_OF_RANGE);
            rsp.set_dnr();
        },
        IoStatus::Failed => {
            rsp.set_status(Sct::Generic, types::generic::INTERNAL_DEVICE_ERROR);
        },
    }
}

/// Whether a read/write on this namespace may go through the zero-copy path.
pub fn zcopy_eligible(ns: &Namespace, opc: IoOpcode, fused: bool) -> bool {
    !fused
        && matches!(opc, IoOpcode::Read | IoOpcode::Write)
        && ns.bdev.supports(IoType::Zcopy)
}

// ── Reservations ─────────────────────────────────────────────────────────

/// Reservation Register data segment.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ResvRegisterData {
    pub crkey: U64<LittleEndian>, // 0..8
    pub nrkey: U64<LittleEndian>, // 8..16
}

/// Reservation Acquire data segment.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ResvAcquireData {
    pub crkey: U64<LittleEndian>, // 0..8
    pub prkey: U64<LittleEndian>, // 8..16
}

/// Reservation Status header (Report output).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ResvStatusHeader {
    pub generation: U32<LittleEndian>, // 0..4
    pub rtype: u8,                     // 4
    pub regctl: U16<LittleEndian>,     // 5..7
    reserved7: [u8; 2],                // 7..9
    pub ptpls: u8,                     // 9
    reserved10: [u8; 14],              // 10..24
}

/// Extended registered-controller entry (EDS=1).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ResvRegisteredCtrlrExt {
    pub cntlid: U16<LittleEndian>, // 0..2
    pub rcsts: u8,                 // 2 (bit 0: holds the reservation)
    reserved3: [u8; 5],            // 3..8
    pub rkey: U64<LittleEndian>,   // 8..16
    pub hostid: [u8; 16],          // 16..32
    reserved32: [u8; 32],          // 32..64
}

fn resv_conflict(rsp: &mut NvmeCpl) {
    rsp.set_status(Sct::Generic, types::generic::RESERVATION_CONFLICT);
    rsp.set_dnr();
}

fn gather(req: &TcpRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(req.length as usize);
    for s in req.data_slices() {
        out.extend_from_slice(s);
    }
    out
}

/// Dispatch a reservation command. Serialized by the caller on the
/// subsystem's reservation lock.
pub fn handle_reservation(ctrlr: &Arc<Controller>, ns: &Namespace, req: &mut TcpRequest) {
    let Some(opc) = IoOpcode::from_u8(req.cmd.opc) else {
        req.rsp.set_status(Sct::Generic, types::generic::INVALID_OPCODE);
        req.rsp.set_dnr();
        return;
    };
    match opc {
        IoOpcode::ReservationRegister => resv_register(ctrlr, ns, req),
        IoOpcode::ReservationAcquire => resv_acquire(ctrlr, ns, req),
        IoOpcode::ReservationRelease => resv_release(ctrlr, ns, req),
        IoOpcode::ReservationReport => resv_report(ctrlr, ns, req),
        _ => {
            req.rsp.set_status(Sct::Generic, types::generic::INVALID_OPCODE);
            req.rsp.set_dnr();
        },
    }
}

fn resv_register(ctrlr: &Arc<Controller>, ns: &Namespace, req: &mut TcpRequest) {
    let data = gather(req);
    let Ok(reg) = ResvRegisterData::read_from_bytes(&data[..]) else {
        req.rsp.set_status(Sct::Generic, types::generic::INVALID_FIELD);
        req.rsp.set_dnr();
        return;
    };
    let cdw10 = req.cmd.cdw10.get();
    let rrega = cdw10 & 0x7;
    let iekey = cdw10 & (1 << 3) != 0;
    let hostid = ctrlr.host_id;

    let mut resv = ns.resv.lock().expect("resv poisoned");
    let existing = resv.registrant(&hostid).copied();
    match rrega {
        // Register a new key.
        0 => {
            match existing {
                Some(r) if r.rkey != reg.nrkey.get() => {
                    resv_conflict(&mut req.rsp);
                    return;
                },
                Some(_) => {},
                None => {
                    resv.registrants.push(Registrant { hostid, rkey: reg.nrkey.get() });
                },
            }
            resv.generation = resv.generation.wrapping_add(1);
        },
        // Unregister.
        1 => {
            match existing {
                Some(r) if iekey || r.rkey == reg.crkey.get() => {
                    resv.registrants.retain(|r| r.hostid != hostid);
                    if resv.holder == Some(hostid) {
                        resv.holder = None;
                        resv.rtype = None;
                    }
                    resv.generation = resv.generation.wrapping_add(1);
                },
                _ => {
                    resv_conflict(&mut req.rsp);
                    return;
                },
            }
        },
        // Replace the key.
        2 => {
            match existing {
                Some(r) if iekey || r.rkey == reg.crkey.get() => {
                    let rkey = reg.nrkey.get();
                    for r in resv.registrants.iter_mut() {
                        if r.hostid == hostid {
                            r.rkey = rkey;
                        }
                    }
                    resv.generation = resv.generation.wrapping_add(1);
                },
                _ => {
                    resv_conflict(&mut req.rsp);
                    return;
                },
            }
        },
        _ => {
            req.rsp.set_status(Sct::Generic, types::generic::INVALID_FIELD);
            req.rsp.set_dnr();
            return;
        },
    }
    req.rsp.set_status(Sct::Generic, types::generic::SUCCESS);
}

fn resv_acquire(ctrlr: &Arc<Controller>, ns: &Namespace, req: &mut TcpRequest) {
    let data = gather(req);
    let Ok(acq) = ResvAcquireData::read_from_bytes(&data[..]) else {
        req.rsp.set_status(Sct::Generic, types::generic::INVALID_FIELD);
        req.rsp.set_dnr();
        return;
    };
    let cdw10 = req.cmd.cdw10.get();
    let racqa = cdw10 & 0x7;
    let Some(rtype) = ResvType::from_u8(((cdw10 >> 8) & 0xFF) as u8) else {
        req.rsp.set_status(Sct::Generic, types::generic::INVALID_FIELD);
        req.rsp.set_dnr();
        return;
    };
    let hostid = ctrlr.host_id;

    let mut resv = ns.resv.lock().expect("resv poisoned");
    let Some(registrant) = resv.registrant(&hostid).copied() else {
        resv_conflict(&mut req.rsp);
        return;
    };
    if registrant.rkey != acq.crkey.get() {
        resv_conflict(&mut req.rsp);
        return;
    }

    match racqa {
        // Acquire.
        0 => {
            if let Some(current) = resv.rtype {
                let held_by_us =
                    current == rtype && (current.all_registrants() || resv.holder == Some(hostid));
                if !held_by_us {
                    resv_conflict(&mut req.rsp);
                    return;
                }
            } else {
                resv.rtype = Some(rtype);
                resv.holder = if rtype.all_registrants() { None } else { Some(hostid) };
            }
        },
        // Preempt (and preempt-and-abort, which this target treats alike:
        // in-flight I/O of the preempted host has already passed admission).
        1 | 2 => {
            let prkey = acq.prkey.get();
            resv.registrants.retain(|r| r.hostid == hostid || r.rkey != prkey);
            resv.rtype = Some(rtype);
            resv.holder = if rtype.all_registrants() { None } else { Some(hostid) };
            resv.generation = resv.generation.wrapping_add(1);
        },
        _ => {
            req.rsp.set_status(Sct::Generic, types::generic::INVALID_FIELD);
            req.rsp.set_dnr();
            return;
        },
    }
    debug!(nsid = ns.nsid, ?rtype, "reservation acquired");
    req.rsp.set_status(Sct::Generic, types::generic::SUCCESS);
}

fn resv_release(ctrlr: &Arc<Controller>, ns: &Namespace, req: &mut TcpRequest) {
    let data = gather(req);
    let crkey = match data.get(..8) {
        Some(bytes) => u64::from_le_bytes(bytes.try_into().expect("8 bytes")),
        None => {
            req.rsp.set_status(Sct::Generic, types::generic::INVALID_FIELD);
            req.rsp.set_dnr();
            return;
        },
    };
    let cdw10 = req.cmd.cdw10.get();
    let rrela = cdw10 & 0x7;
    let hostid = ctrlr.host_id;

    let mut resv = ns.resv.lock().expect("resv poisoned");
    let Some(registrant) = resv.registrant(&hostid).copied() else {
        resv_conflict(&mut req.rsp);
        return;
    };
    if registrant.rkey != crkey {
        resv_conflict(&mut req.rsp);
        return;
    }

    match rrela {
        // Release.
        0 => {
            let holds = match resv.rtype {
                Some(t) if t.all_registrants() => true,
                Some(_) => resv.holder == Some(hostid),
                None => {
                    // Releasing a nonexistent reservation is a no-op success.
                    req.rsp.set_status(Sct::Generic, types::generic::SUCCESS);
                    return;
                },
            };
            if !holds {
                resv_conflict(&mut req.rsp);
                return;
            }
            resv.rtype = None;
            resv.holder = None;
        },
        // Clear: drop the reservation and every registration.
        1 => {
            resv.rtype = None;
            resv.holder = None;
            resv.registrants.clear();
            resv.generation = resv.generation.wrapping_add(1);
        },
        _ => {
            req.rsp.set_status(Sct::Generic, types::generic::INVALID_FIELD);
            req.rsp.set_dnr();
            return;
        },
    }
    drop(resv);

    // Other controllers on this subsystem learn through the reservation log.
    for other in ctrlr.subsys.controllers() {
        if other.cntlid != ctrlr.cntlid {
            other.reservation_notice(ns.nsid, RESV_NOTIFY_RESERVATION_RELEASED);
        }
    }
    req.rsp.set_status(Sct::Generic, types::generic::SUCCESS);
}

fn resv_report(ctrlr: &Arc<Controller>, ns: &Namespace, req: &mut TcpRequest) {
    // Fabrics host identifiers are 16 bytes; only the extended data
    // structure can represent them.
    if req.cmd.cdw11.get() & 1 == 0 {
        req.rsp.set_status(Sct::Generic, types::generic::INVALID_FIELD);
        req.rsp.set_dnr();
        return;
    }

    let resv = ns.resv.lock().expect("resv poisoned");
    let mut header = ResvStatusHeader::default();
    header.generation.set(resv.generation);
    header.rtype = resv.rtype.map(|t| t as u8).unwrap_or(0);
    header.regctl.set(resv.registrants.len() as u16);
    header.ptpls = 0;

    let mut page = header.as_bytes().to_vec();
    for r in &resv.registrants {
        let mut entry = ResvRegisteredCtrlrExt::default();
        // Dynamic controllers report the id of the controller the host used.
        entry.cntlid.set(ctrlr.cntlid);
        let holds = match resv.rtype {
            Some(t) if t.all_registrants() => true,
            Some(_) => resv.holder == Some(r.hostid),
            None => false,
        };
        entry.rcsts = holds as u8;
        entry.rkey.set(r.rkey);
        entry.hostid = r.hostid;
        page.extend_from_slice(entry.as_bytes());
    }
    drop(resv);

    let mut off = 0usize;
    for slice in req.data_slices_mut() {
        let take = slice.len().min(page.len().saturating_sub(off));
        slice[..take].copy_from_slice(&page[off..off + take]);
        if take < slice.len() {
            slice[take..].fill(0);
        }
        off += take;
    }
    req.rsp.set_status(Sct::Generic, types::generic::SUCCESS);
}

const _: () = assert!(core::mem::size_of::<ResvStatusHeader>() == 24);
const _: () = assert!(core::mem::size_of::<ResvRegisteredCtrlrExt>() == 64);
