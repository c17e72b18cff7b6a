// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::Result;
use nvmf_tcp_rs::{
    bdev::MemDisk,
    ctrlr::{
        admin::{AdminDisposition, AdminEnv, handle_admin},
        controller::Controller,
    },
    nvme::types::{Sct, cmd_specific, generic},
    subsystem::{Namespace, Registry, Subsystem, SubsystemState, SubsystemType},
    transport::{ListenerInfo, TransportOpts, request::{DataBuf, ReqSlab}},
};

fn test_registry() -> (Arc<Registry>, Arc<Subsystem>) {
    let registry = Registry::new();
    let sub = Subsystem::new("nqn.2016-06.io.spdk:cnode1", SubsystemType::Nvme);
    sub.add_namespace(Namespace::new(1, Arc::new(MemDisk::new(512, 2048)))).expect("ns");
    sub.set_state(SubsystemState::Active);
    registry.add(Arc::clone(&sub)).expect("register");
    (registry, sub)
}

fn test_ctrlr(sub: &Arc<Subsystem>) -> Arc<Controller> {
    let ctrlr = Controller::new(
        1,
        Arc::clone(sub),
        "nqn.2016-06.io.spdk:host1".to_string(),
        [0x11; 16],
        120_000,
        Arc::new(TransportOpts::default()),
    );
    sub.add_ctrlr(Arc::clone(&ctrlr)).expect("attach");
    ctrlr
}

/// A request slab with one claimed request carrying a 4 KiB data window.
fn data_request(out_len: u32) -> (ReqSlab, u16) {
    let mut slab = ReqSlab::new(1, 8192);
    let idx = slab.alloc().expect("request");
    let req = slab.get_mut(idx);
    req.length = out_len;
    req.buf = DataBuf::InCapsule;
    (slab, idx)
}

fn gather(slab: &ReqSlab, idx: u16) -> Vec<u8> {
    let mut out = Vec::new();
    for s in slab.get(idx).data_slices() {
        out.extend_from_slice(s);
    }
    out
}

fn listeners() -> Vec<ListenerInfo> {
    vec![ListenerInfo {
        adrfam: 1,
        traddr: "127.0.0.1".to_string(),
        trsvcid: "4420".to_string(),
        portid: 1,
    }]
}

#[tokio::test]
async fn identify_controller_fields() -> Result<()> {
    let (registry, sub) = test_registry();
    let ctrlr = test_ctrlr(&sub);
    let env = AdminEnv { ctrlr: &ctrlr, registry: &registry, listeners: listeners() };

    let (mut slab, idx) = data_request(4096);
    {
        let req = slab.get_mut(idx);
        req.cmd.opc = 0x06; // Identify
        req.cmd.cdw10.set(1); // CNS controller
    }
    let disp = handle_admin(&env, slab.get_mut(idx)).await;
    assert_eq!(disp, AdminDisposition::Complete);
    assert!(slab.get(idx).rsp.success());

    let page = gather(&slab, idx);
    // mdts = log2(131072 / 4096) = 5, cntlid, version 1.3.
    assert_eq!(page[77], 5);
    assert_eq!(u16::from_le_bytes(page[78..80].try_into()?), 1);
    assert_eq!(u32::from_le_bytes(page[80..84].try_into()?), 0x0001_0300);
    // AERL is 0-based 3, ELPE 0-based 127.
    assert_eq!(page[259], 3);
    assert_eq!(page[262], 127);
    // nn mirrors the largest nsid; maxcmd the queue depth.
    assert_eq!(u16::from_le_bytes(page[514..516].try_into()?), 128);
    assert_eq!(u32::from_le_bytes(page[516..520].try_into()?), 1);
    // sgls: supported + keyed + offset.
    let sgls = u32::from_le_bytes(page[536..540].try_into()?);
    assert_eq!(sgls & 1, 1);
    assert_ne!(sgls & (1 << 2), 0);
    assert_ne!(sgls & (1 << 20), 0);
    // subnqn lands at 768.
    assert!(page[768..].starts_with(b"nqn.2016-06.io.spdk:cnode1"));
    // ioccsz = (64 + 4096) / 16, iorcsz = 1.
    assert_eq!(u32::from_le_bytes(page[1792..1796].try_into()?), (64 + 4096) / 16);
    assert_eq!(u32::from_le_bytes(page[1796..1800].try_into()?), 1);
    Ok(())
}

#[tokio::test]
async fn identify_namespace_and_lists() -> Result<()> {
    let (registry, sub) = test_registry();
    let ctrlr = test_ctrlr(&sub);
    let env = AdminEnv { ctrlr: &ctrlr, registry: &registry, listeners: listeners() };

    // CNS 0: namespace data.
    let (mut slab, idx) = data_request(4096);
    {
        let req = slab.get_mut(idx);
        req.cmd.opc = 0x06;
        req.cmd.nsid.set(1);
        req.cmd.cdw10.set(0);
    }
    handle_admin(&env, slab.get_mut(idx)).await;
    assert!(slab.get(idx).rsp.success());
    let page = gather(&slab, idx);
    assert_eq!(u64::from_le_bytes(page[0..8].try_into()?), 2048); // nsze
    assert_eq!(page[130], 9); // lbaf[0].lbads for 512-byte blocks

    // CNS 2: active namespace list above a floor.
    let (mut slab, idx) = data_request(4096);
    {
        let req = slab.get_mut(idx);
        req.cmd.opc = 0x06;
        req.cmd.nsid.set(0);
        req.cmd.cdw10.set(2);
    }
    handle_admin(&env, slab.get_mut(idx)).await;
    let page = gather(&slab, idx);
    assert_eq!(u32::from_le_bytes(page[0..4].try_into()?), 1);
    assert_eq!(u32::from_le_bytes(page[4..8].try_into()?), 0);

    // CNS 3: descriptor list is typed TLVs, zero-terminated.
    let (mut slab, idx) = data_request(4096);
    {
        let req = slab.get_mut(idx);
        req.cmd.opc = 0x06;
        req.cmd.nsid.set(1);
        req.cmd.cdw10.set(3);
    }
    handle_admin(&env, slab.get_mut(idx)).await;
    let page = gather(&slab, idx);
    assert_eq!(page[0], 0x01); // EUI64
    assert_eq!(page[1], 8);
    assert_eq!(page[12], 0x02); // NGUID
    assert_eq!(page[13], 16);
    assert_eq!(page[32], 0x03); // UUID
    Ok(())
}

#[tokio::test]
async fn identify_unknown_namespace_fails() -> Result<()> {
    let (registry, sub) = test_registry();
    let ctrlr = test_ctrlr(&sub);
    let env = AdminEnv { ctrlr: &ctrlr, registry: &registry, listeners: listeners() };

    let (mut slab, idx) = data_request(4096);
    {
        let req = slab.get_mut(idx);
        req.cmd.opc = 0x06;
        req.cmd.nsid.set(7);
        req.cmd.cdw10.set(0);
    }
    handle_admin(&env, slab.get_mut(idx)).await;
    assert_eq!(slab.get(idx).rsp.sc(), generic::INVALID_NAMESPACE_OR_FORMAT);
    Ok(())
}

#[tokio::test]
async fn keep_alive_feature_clamps_to_floor() -> Result<()> {
    let (registry, sub) = test_registry();
    let ctrlr = test_ctrlr(&sub);
    let env = AdminEnv { ctrlr: &ctrlr, registry: &registry, listeners: listeners() };

    let (mut slab, idx) = data_request(0);
    {
        let req = slab.get_mut(idx);
        req.cmd.opc = 0x09; // Set Features
        req.cmd.cdw10.set(0x0F); // KATO
        req.cmd.cdw11.set(500);
    }
    handle_admin(&env, slab.get_mut(idx)).await;
    assert!(slab.get(idx).rsp.success());
    assert_eq!(slab.get(idx).rsp.cdw0.get(), 10_000);

    // KATO of zero is rejected outright.
    let (mut slab, idx) = data_request(0);
    {
        let req = slab.get_mut(idx);
        req.cmd.opc = 0x09;
        req.cmd.cdw10.set(0x0F);
        req.cmd.cdw11.set(0);
    }
    handle_admin(&env, slab.get_mut(idx)).await;
    assert_eq!(slab.get(idx).rsp.sc(), generic::KEEP_ALIVE_INVALID);
    Ok(())
}

#[tokio::test]
async fn save_bit_and_number_of_queues_rules() -> Result<()> {
    let (registry, sub) = test_registry();
    let ctrlr = test_ctrlr(&sub);
    let env = AdminEnv { ctrlr: &ctrlr, registry: &registry, listeners: listeners() };

    // SV=1 is never saveable.
    let (mut slab, idx) = data_request(0);
    {
        let req = slab.get_mut(idx);
        req.cmd.opc = 0x09;
        req.cmd.cdw10.set(0x06 | (1 << 31));
    }
    handle_admin(&env, slab.get_mut(idx)).await;
    assert_eq!(slab.get(idx).rsp.sct(), Sct::CommandSpecific as u8);
    assert_eq!(slab.get(idx).rsp.sc(), cmd_specific::FEATURE_ID_NOT_SAVEABLE);

    // Number of Queues answers the pre-configured value regardless of ask.
    let (mut slab, idx) = data_request(0);
    {
        let req = slab.get_mut(idx);
        req.cmd.opc = 0x09;
        req.cmd.cdw10.set(0x07);
        req.cmd.cdw11.set(0xFFFF_FFFF);
    }
    handle_admin(&env, slab.get_mut(idx)).await;
    assert!(slab.get(idx).rsp.success());
    let io_queues = 127u32 - 1; // 0-based, max_qpairs_per_ctrlr - 1 queues
    assert_eq!(slab.get(idx).rsp.cdw0.get(), io_queues | (io_queues << 16));

    // Once an I/O qpair exists the feature is frozen.
    assert!(ctrlr.claim_qid(0));
    assert!(ctrlr.claim_qid(1));
    let (mut slab, idx) = data_request(0);
    {
        let req = slab.get_mut(idx);
        req.cmd.opc = 0x09;
        req.cmd.cdw10.set(0x07);
    }
    handle_admin(&env, slab.get_mut(idx)).await;
    assert_eq!(slab.get(idx).rsp.sc(), generic::COMMAND_SEQUENCE_ERROR);
    Ok(())
}

#[tokio::test]
async fn power_management_rejects_nonzero_state() -> Result<()> {
    let (registry, sub) = test_registry();
    let ctrlr = test_ctrlr(&sub);
    let env = AdminEnv { ctrlr: &ctrlr, registry: &registry, listeners: listeners() };

    let (mut slab, idx) = data_request(0);
    {
        let req = slab.get_mut(idx);
        req.cmd.opc = 0x09;
        req.cmd.cdw10.set(0x02);
        req.cmd.cdw11.set(3);
    }
    handle_admin(&env, slab.get_mut(idx)).await;
    assert_eq!(slab.get(idx).rsp.sc(), generic::INVALID_FIELD);
    Ok(())
}

#[tokio::test]
async fn log_pages_window_and_unmask() -> Result<()> {
    let (registry, sub) = test_registry();
    let ctrlr = test_ctrlr(&sub);
    let env = AdminEnv { ctrlr: &ctrlr, registry: &registry, listeners: listeners() };

    // Health page, 512 bytes.
    let (mut slab, idx) = data_request(512);
    {
        let req = slab.get_mut(idx);
        req.cmd.opc = 0x02;
        req.cmd.cdw10.set(0x02 | (((512 / 4) - 1) << 16));
    }
    handle_admin(&env, slab.get_mut(idx)).await;
    assert!(slab.get(idx).rsp.success());

    // Changed-NS list: populated, then cleared by a RAE=0 read.
    ctrlr.ns_changed(1);
    assert_eq!(ctrlr.lock().changed_ns.len(), 1);
    let (mut slab, idx) = data_request(4096);
    {
        let req = slab.get_mut(idx);
        req.cmd.opc = 0x02;
        req.cmd.cdw10.set(0x04 | (((4096 / 4) - 1) << 16));
    }
    handle_admin(&env, slab.get_mut(idx)).await;
    let page = gather(&slab, idx);
    assert_eq!(u32::from_le_bytes(page[0..4].try_into()?), 1);
    assert!(ctrlr.lock().changed_ns.is_empty());
    Ok(())
}

#[tokio::test]
async fn ana_log_layout() -> Result<()> {
    let (registry, sub) = test_registry();
    let ctrlr = test_ctrlr(&sub);
    let env = AdminEnv { ctrlr: &ctrlr, registry: &registry, listeners: listeners() };

    let (mut slab, idx) = data_request(4096);
    {
        let req = slab.get_mut(idx);
        req.cmd.opc = 0x02;
        req.cmd.cdw10.set(0x0C | (((4096 / 4) - 1) << 16));
    }
    handle_admin(&env, slab.get_mut(idx)).await;
    assert!(slab.get(idx).rsp.success());
    let page = gather(&slab, idx);

    // Header: one group (nsid 1 in group 1), then its descriptor + nsid.
    assert_eq!(u16::from_le_bytes(page[8..10].try_into()?), 1);
    assert_eq!(u32::from_le_bytes(page[16..20].try_into()?), 1); // anagrpid
    assert_eq!(u32::from_le_bytes(page[20..24].try_into()?), 1); // nnsids
    assert_eq!(page[32], 0x01); // optimized
    assert_eq!(u32::from_le_bytes(page[48..52].try_into()?), 1); // member nsid
    Ok(())
}

#[tokio::test]
async fn discovery_log_lists_subsystems() -> Result<()> {
    let (registry, sub) = test_registry();
    let ctrlr = test_ctrlr(&sub);
    let env = AdminEnv { ctrlr: &ctrlr, registry: &registry, listeners: listeners() };

    let (mut slab, idx) = data_request(4096);
    {
        let req = slab.get_mut(idx);
        req.cmd.opc = 0x02;
        req.cmd.cdw10.set(0x70 | (((4096 / 4) - 1) << 16));
    }
    handle_admin(&env, slab.get_mut(idx)).await;
    assert!(slab.get(idx).rsp.success());
    let page = gather(&slab, idx);

    assert_eq!(u64::from_le_bytes(page[8..16].try_into()?), 1); // numrec
    let entry = &page[1024..2048];
    assert_eq!(entry[0], 0x03); // TCP
    assert_eq!(entry[3], 0x02); // secure channel not required
    assert!(entry[256..].starts_with(b"nqn.2016-06.io.spdk:cnode1"));
    assert!(entry[512..].starts_with(b"127.0.0.1"));
    Ok(())
}

#[tokio::test]
async fn aer_parks_then_event_completes_via_slot() -> Result<()> {
    let (registry, sub) = test_registry();
    let ctrlr = test_ctrlr(&sub);
    let env = AdminEnv { ctrlr: &ctrlr, registry: &registry, listeners: listeners() };

    let (mut slab, idx) = data_request(0);
    {
        let req = slab.get_mut(idx);
        req.cmd.opc = 0x0C; // AER
        req.cmd.cid.set(0x42);
    }
    let disp = handle_admin(&env, slab.get_mut(idx)).await;
    assert_eq!(disp, AdminDisposition::AerParked);
    assert_eq!(ctrlr.lock().aer_cids.front().copied(), Some(0x42));
    Ok(())
}
