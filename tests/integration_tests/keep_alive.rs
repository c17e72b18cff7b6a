// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use nvmf_tcp_rs::{
    ctrlr::controller::Controller,
    nvme::{fabrics::CSTS_CFS, types::NvmeCmd},
    subsystem::{Subsystem, SubsystemState, SubsystemType},
    transport::{TransportOpts, qpair::{QpairEvent, QpairHandle}},
};
use serial_test::serial;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::integration_tests::common::{TestHost, start_target};

fn bare_controller(kato_ms: u32) -> (Arc<Subsystem>, Arc<Controller>) {
    let sub = Subsystem::new("nqn.2016-06.io.spdk:cnode1", SubsystemType::Nvme);
    sub.set_state(SubsystemState::Active);
    let ctrlr = Controller::new(
        1,
        Arc::clone(&sub),
        "nqn.2016-06.io.spdk:host1".to_string(),
        [0x11; 16],
        kato_ms,
        Arc::new(TransportOpts::default()),
    );
    sub.add_ctrlr(Arc::clone(&ctrlr)).expect("attach");
    (sub, ctrlr)
}

fn fake_qpair(qid: u16) -> (QpairHandle, CancellationToken) {
    let (tx, _rx) = mpsc::unbounded_channel::<QpairEvent>();
    let cancel = CancellationToken::new();
    (QpairHandle { qid, cancel: cancel.clone(), events: tx }, cancel)
}

// Paused time lets the keep-alive period elapse instantly.
#[tokio::test(start_paused = true)]
#[serial]
async fn keep_alive_expiry_latches_cfs_and_disconnects() -> Result<()> {
    let (_sub, ctrlr) = bare_controller(1_000);
    assert!(ctrlr.claim_qid(0));
    let (admin, admin_cancel) = fake_qpair(0);
    ctrlr.register_qpair(admin);
    assert!(ctrlr.claim_qid(1));
    let (io, io_cancel) = fake_qpair(1);
    ctrlr.register_qpair(io);

    ctrlr.arm_keep_alive();

    // Silence beyond KATO: within one poller period every qpair of the
    // association is disconnected and CFS latches.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(admin_cancel.is_cancelled());
    assert!(io_cancel.is_cancelled());
    assert_ne!(ctrlr.lock().vcprop.csts & CSTS_CFS, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
#[serial]
async fn keep_alive_touch_defers_expiry() -> Result<()> {
    let (_sub, ctrlr) = bare_controller(15_000);
    assert!(ctrlr.claim_qid(0));
    let (admin, admin_cancel) = fake_qpair(0);
    ctrlr.register_qpair(admin);

    ctrlr.arm_keep_alive();

    // Regular traffic inside the window keeps the association up.
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_secs(8)).await;
        ctrlr.touch_keep_alive();
    }
    assert!(!admin_cancel.is_cancelled());
    assert_eq!(ctrlr.lock().vcprop.csts & CSTS_CFS, 0);

    // Then silence: the association dies.
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert!(admin_cancel.is_cancelled());
    Ok(())
}

#[tokio::test]
async fn keep_alive_command_succeeds_over_the_wire() -> Result<()> {
    let tgt = start_target().await?;
    let mut host = TestHost::connect(tgt.addr).await?;
    host.admin_session(120_000).await?;

    let cid = host.next_cid();
    let mut ka = NvmeCmd::default();
    ka.opc = 0x18;
    ka.cid.set(cid);
    host.send_capsule(ka, &[]).await?;
    let rsp = host.expect_capsule_resp().await?;
    assert!(rsp.success());
    assert_eq!(rsp.cid.get(), cid);
    Ok(())
}
