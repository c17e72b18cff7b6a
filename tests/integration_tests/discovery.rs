// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::atomic::Ordering;

use anyhow::Result;
use nvmf_tcp_rs::nvme::types::{NvmeCmd, generic};

use crate::integration_tests::common::{
    DISCOVERY_NQN, SUBNQN, TestHost, start_target,
};

#[tokio::test]
async fn discovery_connect_serves_the_log_page() -> Result<()> {
    let tgt = start_target().await?;
    let mut host = TestHost::connect(tgt.addr).await?;

    // Connect to the well-known discovery NQN without asking for keep-alive:
    // the discovery default kicks in.
    let cntlid = host.discovery_session(0).await?;
    let disc = tgt.target.ctx().registry.find(DISCOVERY_NQN).expect("discovery subsystem");
    let ctrlr = disc.get_ctrlr(cntlid).expect("discovery controller");
    assert_eq!(ctrlr.kato_ms.load(Ordering::SeqCst), 120_000);

    // The log lists the NVM subsystem behind this target's listener.
    let sqe = host.get_log_sqe(0x70, 4096);
    let (page, rsp) = host.read_command(sqe, 4096).await?;
    assert!(rsp.is_none(), "c2h success flag carries the completion");

    let numrec = u64::from_le_bytes(page[8..16].try_into()?);
    assert_eq!(numrec, 1);

    let entry = &page[1024..2048];
    assert_eq!(entry[0], 0x03); // TCP
    assert_eq!(entry[2], 0x02); // NVM subsystem
    assert_eq!(entry[3], 0x02); // secure channel not required
    assert!(entry[256..].starts_with(SUBNQN.as_bytes()));
    assert!(entry[512..].starts_with(b"127.0.0.1"));
    let trsvcid = core::str::from_utf8(&entry[32..64])?.trim_end_matches('\0');
    assert_eq!(trsvcid, tgt.addr.port().to_string());
    Ok(())
}

#[tokio::test]
async fn discovery_identify_reports_discovery_controller() -> Result<()> {
    let tgt = start_target().await?;
    let mut host = TestHost::connect(tgt.addr).await?;
    host.discovery_session(0).await?;

    let sqe = host.identify_sqe(1, 0);
    let (page, rsp) = host.read_command(sqe, 4096).await?;
    assert!(rsp.is_none());
    assert_eq!(page[111], 2); // cntrltype: discovery controller
    assert!(page[768..].starts_with(DISCOVERY_NQN.as_bytes()));
    Ok(())
}

#[tokio::test]
async fn discovery_rejects_commands_outside_its_surface() -> Result<()> {
    let tgt = start_target().await?;
    let mut host = TestHost::connect(tgt.addr).await?;
    host.discovery_session(0).await?;

    // Abort is an ordinary admin command everywhere else, but discovery
    // controllers do not carry it.
    let cid = host.next_cid();
    let mut abort = NvmeCmd::default();
    abort.opc = 0x08;
    abort.cid.set(cid);
    host.send_capsule(abort, &[]).await?;

    let rsp = host.expect_capsule_resp().await?;
    assert_eq!(rsp.cid.get(), cid);
    assert_eq!(rsp.sc(), generic::INVALID_OPCODE);
    Ok(())
}
