// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::Result;
use nvmf_tcp_rs::{
    bdev::MemDisk,
    ctrlr::{controller::Controller, io::handle_reservation},
    nvme::types::{IoOpcode, generic},
    subsystem::{Namespace, ResvType, Subsystem, SubsystemState, SubsystemType},
    transport::{TransportOpts, request::{DataBuf, ReqSlab}},
};

fn setup() -> (Arc<Subsystem>, Arc<Namespace>, Arc<Controller>, Arc<Controller>) {
    let sub = Subsystem::new("nqn.2016-06.io.spdk:cnode1", SubsystemType::Nvme);
    let ns = sub
        .add_namespace(Namespace::new(1, Arc::new(MemDisk::new(512, 64))))
        .expect("ns");
    sub.set_state(SubsystemState::Active);
    let opts = Arc::new(TransportOpts::default());
    let a = Controller::new(1, Arc::clone(&sub), "host-a".into(), [0xA; 16], 0, Arc::clone(&opts));
    let b = Controller::new(2, Arc::clone(&sub), "host-b".into(), [0xB; 16], 0, opts);
    sub.add_ctrlr(Arc::clone(&a)).expect("a");
    sub.add_ctrlr(Arc::clone(&b)).expect("b");
    (sub, ns, a, b)
}

/// One request whose in-capsule arena carries `payload`.
fn resv_request(opc: IoOpcode, cdw10: u32, payload: &[u8]) -> (ReqSlab, u16) {
    let mut slab = ReqSlab::new(1, 512);
    let idx = slab.alloc().expect("request");
    let req = slab.get_mut(idx);
    req.cmd.opc = opc as u8;
    req.cmd.nsid.set(1);
    req.cmd.cdw10.set(cdw10);
    req.length = payload.len() as u32;
    req.buf = DataBuf::InCapsule;
    req.icd[..payload.len()].copy_from_slice(payload);
    (slab, idx)
}

fn keys(crkey: u64, nrkey: u64) -> Vec<u8> {
    let mut out = crkey.to_le_bytes().to_vec();
    out.extend_from_slice(&nrkey.to_le_bytes());
    out
}

#[test]
fn register_acquire_blocks_other_hosts() -> Result<()> {
    let (_sub, ns, a, b) = setup();

    // Host A registers key 0x1111 and acquires write-exclusive.
    let (mut slab, idx) = resv_request(IoOpcode::ReservationRegister, 0, &keys(0, 0x1111));
    handle_reservation(&a, &ns, slab.get_mut(idx));
    assert!(slab.get(idx).rsp.success());

    let (mut slab, idx) = resv_request(
        IoOpcode::ReservationAcquire,
        (ResvType::WriteExclusive as u32) << 8,
        &keys(0x1111, 0),
    );
    handle_reservation(&a, &ns, slab.get_mut(idx));
    assert!(slab.get(idx).rsp.success());

    // Non-registrant writes are now conflicts; reads still pass.
    let resv = ns.resv.lock().expect("resv");
    assert!(!resv.io_allowed(&[0xB; 16], IoOpcode::Write));
    assert!(resv.io_allowed(&[0xB; 16], IoOpcode::Read));
    drop(resv);

    // Host B acquiring without registration is a conflict.
    let (mut slab, idx) = resv_request(
        IoOpcode::ReservationAcquire,
        (ResvType::WriteExclusive as u32) << 8,
        &keys(0x2222, 0),
    );
    handle_reservation(&b, &ns, slab.get_mut(idx));
    assert_eq!(slab.get(idx).rsp.sc(), generic::RESERVATION_CONFLICT);
    Ok(())
}

#[test]
fn release_notifies_other_controllers() -> Result<()> {
    let (_sub, ns, a, b) = setup();

    let (mut slab, idx) = resv_request(IoOpcode::ReservationRegister, 0, &keys(0, 0x1111));
    handle_reservation(&a, &ns, slab.get_mut(idx));
    let (mut slab, idx) = resv_request(
        IoOpcode::ReservationAcquire,
        (ResvType::ExclusiveAccess as u32) << 8,
        &keys(0x1111, 0),
    );
    handle_reservation(&a, &ns, slab.get_mut(idx));

    let (mut slab, idx) = resv_request(
        IoOpcode::ReservationRelease,
        (ResvType::ExclusiveAccess as u32) << 8,
        &0x1111u64.to_le_bytes(),
    );
    handle_reservation(&a, &ns, slab.get_mut(idx));
    assert!(slab.get(idx).rsp.success());

    assert!(ns.resv.lock().expect("resv").rtype.is_none());
    // The peer controller got a reservation-released log entry and AEN.
    assert_eq!(b.lock().resv_log.len(), 1);
    assert_eq!(b.lock().pending_events.len(), 1);
    assert_eq!(a.lock().resv_log.len(), 0);
    Ok(())
}

#[test]
fn unregister_with_wrong_key_conflicts() -> Result<()> {
    let (_sub, ns, a, _b) = setup();

    let (mut slab, idx) = resv_request(IoOpcode::ReservationRegister, 0, &keys(0, 0x1111));
    handle_reservation(&a, &ns, slab.get_mut(idx));

    // Unregister (rrega=1) with a stale key and IEKEY clear.
    let (mut slab, idx) = resv_request(IoOpcode::ReservationRegister, 1, &keys(0x9999, 0));
    handle_reservation(&a, &ns, slab.get_mut(idx));
    assert_eq!(slab.get(idx).rsp.sc(), generic::RESERVATION_CONFLICT);

    // With IEKEY set the key is ignored.
    let (mut slab, idx) = resv_request(IoOpcode::ReservationRegister, 1 | (1 << 3), &keys(0, 0));
    handle_reservation(&a, &ns, slab.get_mut(idx));
    assert!(slab.get(idx).rsp.success());
    assert!(ns.resv.lock().expect("resv").registrants.is_empty());
    Ok(())
}

#[test]
fn report_uses_extended_host_ids() -> Result<()> {
    let (_sub, ns, a, _b) = setup();

    let (mut slab, idx) = resv_request(IoOpcode::ReservationRegister, 0, &keys(0, 0x1111));
    handle_reservation(&a, &ns, slab.get_mut(idx));
    let (mut slab, idx) = resv_request(
        IoOpcode::ReservationAcquire,
        (ResvType::WriteExclusive as u32) << 8,
        &keys(0x1111, 0),
    );
    handle_reservation(&a, &ns, slab.get_mut(idx));

    // Report without EDS is rejected: 16-byte host ids need the extended
    // layout.
    let (mut slab, idx) = resv_request(IoOpcode::ReservationReport, 0, &[]);
    slab.get_mut(idx).length = 256;
    slab.get_mut(idx).buf = DataBuf::InCapsule;
    handle_reservation(&a, &ns, slab.get_mut(idx));
    assert_eq!(slab.get(idx).rsp.sc(), generic::INVALID_FIELD);

    let (mut slab, idx) = resv_request(IoOpcode::ReservationReport, 0, &[]);
    {
        let req = slab.get_mut(idx);
        req.cmd.cdw11.set(1); // EDS
        req.length = 256;
        req.buf = DataBuf::InCapsule;
    }
    handle_reservation(&a, &ns, slab.get_mut(idx));
    assert!(slab.get(idx).rsp.success());

    let mut page = Vec::new();
    for s in slab.get(idx).data_slices() {
        page.extend_from_slice(s);
    }
    assert_eq!(page[4], ResvType::WriteExclusive as u8);
    assert_eq!(u16::from_le_bytes(page[5..7].try_into()?), 1); // regctl
    // Extended registrant entry: rkey at 32, hostid at 40.
    assert_eq!(u64::from_le_bytes(page[32..40].try_into()?), 0x1111);
    assert_eq!(&page[40..56], &[0xA; 16]);
    Ok(())
}
