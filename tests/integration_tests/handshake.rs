// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use nvmf_tcp_rs::{
    nvme::types::{Sct, fabrics},
    pdu::term::Fes,
};

use crate::integration_tests::common::{HOSTNQN, TestHost, start_ana_target, start_target};

#[tokio::test]
async fn ic_handshake_negotiates_digests() -> Result<()> {
    let tgt = start_target().await?;
    let mut host = TestHost::connect(tgt.addr).await?;

    let resp = host.ic_handshake(true, false).await?;
    assert_eq!(resp.pfv.get(), 0);
    assert_eq!(resp.cpda, 0);
    assert_eq!(resp.maxh2cdata.get(), 131072);
    assert!(resp.dgst.hdgst());
    assert!(!resp.dgst.ddgst());
    Ok(())
}

#[tokio::test]
async fn admin_connect_allocates_cntlid() -> Result<()> {
    let tgt = start_target().await?;
    let mut host = TestHost::connect(tgt.addr).await?;

    let cntlid = host.admin_session(120_000).await?;
    assert_eq!(cntlid, 1);

    // The register bar agrees with the transport options: MQES = 127,
    // version 1.3, controller not yet enabled.
    let (cap, rsp) = host.property_get(0x0, true).await?;
    assert!(rsp.success());
    assert_eq!(cap & 0xFFFF, 127);
    let (vs, _) = host.property_get(0x8, false).await?;
    assert_eq!(vs, 0x0001_0300);
    let (csts, _) = host.property_get(0x1C, false).await?;
    assert_eq!(csts & 1, 0);

    let ctrlr = tgt.sub.get_ctrlr(cntlid).expect("controller registered");
    assert_eq!(ctrlr.hostnqn, HOSTNQN);
    Ok(())
}

#[tokio::test]
async fn enabling_cc_raises_rdy() -> Result<()> {
    let tgt = start_target().await?;
    let mut host = TestHost::connect(tgt.addr).await?;
    host.admin_session(120_000).await?;
    host.enable_ctrlr().await?;

    let (cc, _) = host.property_get(0x14, false).await?;
    assert_eq!(cc, 0x0046_0001);
    Ok(())
}

#[tokio::test]
async fn identify_controller_over_the_wire() -> Result<()> {
    let tgt = start_target().await?;
    let mut host = TestHost::connect(tgt.addr).await?;
    host.admin_session(120_000).await?;
    host.enable_ctrlr().await?;

    let sqe = host.identify_sqe(1, 0);
    let (page, rsp) = host.read_command(sqe, 4096).await?;
    assert!(rsp.is_none(), "c2h success flag carries the completion");
    assert_eq!(page.len(), 4096);

    assert_eq!(page[77], 5); // mdts = log2(131072/4096)
    assert_eq!(u16::from_le_bytes(page[78..80].try_into()?), 1); // cntlid
    assert_eq!(u32::from_le_bytes(page[80..84].try_into()?), 0x0001_0300); // ver
    assert_eq!(u32::from_le_bytes(page[516..520].try_into()?), 1); // nn = max nsid
    let sgls = u32::from_le_bytes(page[536..540].try_into()?);
    assert_eq!(sgls & 1, 1);
    assert_ne!(sgls & (1 << 2), 0); // keyed
    assert_ne!(sgls & (1 << 20), 0); // offset
    Ok(())
}

#[tokio::test]
async fn connect_to_unknown_subsystem_fails() -> Result<()> {
    let tgt = start_target().await?;
    let mut host = TestHost::connect(tgt.addr).await?;
    host.ic_handshake(false, false).await?;

    // Same shape as a normal connect but with a subnqn nobody serves.
    let cid = host.next_cid();
    let mut sqe = nvmf_tcp_rs::nvme::types::NvmeCmd::default();
    sqe.opc = nvmf_tcp_rs::nvme::types::FABRIC_OPCODE;
    sqe.cid.set(cid);
    sqe.dptr.length.set(1024);
    sqe.dptr.set_type(
        nvmf_tcp_rs::nvme::types::SGL_TYPE_DATA_BLOCK,
        nvmf_tcp_rs::nvme::types::SGL_SUBTYPE_OFFSET,
    );
    {
        use zerocopy::IntoBytes;
        let raw = sqe.as_mut_bytes();
        raw[4] = 0x01;
        raw[44..46].copy_from_slice(&31u16.to_le_bytes());
    }
    let mut data = vec![0u8; 1024];
    data[16..18].copy_from_slice(&0xFFFFu16.to_le_bytes());
    let wrong = "nqn.2016-06.io.spdk:nowhere";
    data[256..256 + wrong.len()].copy_from_slice(wrong.as_bytes());
    data[512..512 + HOSTNQN.len()].copy_from_slice(HOSTNQN.as_bytes());

    host.send_capsule(sqe, &data).await?;
    let rsp = host.expect_capsule_resp().await?;
    assert_eq!(rsp.sct(), Sct::CommandSpecific as u8);
    assert_eq!(rsp.sc(), fabrics::INVALID_PARAM);

    assert!(tgt.sub.get_ctrlr(1).is_none(), "no controller was created");
    Ok(())
}

#[tokio::test]
async fn capsule_before_ic_is_a_sequence_error() -> Result<()> {
    let tgt = start_target().await?;
    let mut host = TestHost::connect(tgt.addr).await?;

    // Skip the handshake entirely and push a capsule.
    let sqe = nvmf_tcp_rs::nvme::types::NvmeCmd::default();
    host.send_capsule(sqe, &[]).await?;

    let term = host.expect_term().await?;
    assert_eq!(Fes::from_u16(term.fes.get()), Some(Fes::PduSequenceError));
    drop(tgt);
    Ok(())
}

#[tokio::test]
async fn io_connect_requires_enabled_controller() -> Result<()> {
    let tgt = start_target().await?;
    let mut admin = TestHost::connect(tgt.addr).await?;
    let cntlid = admin.admin_session(120_000).await?;

    // Controller exists but CC.EN is still 0: the I/O connect must fail.
    let mut io = TestHost::connect(tgt.addr).await?;
    io.ic_handshake(false, false).await?;
    let rsp = io.connect_qpair(1, 63, 0, cntlid).await?;
    assert_eq!(rsp.sc(), fabrics::INVALID_PARAM);

    // After enable it connects, and a duplicate qid is rejected.
    admin.enable_ctrlr().await?;
    let mut io = TestHost::connect(tgt.addr).await?;
    io.ic_handshake(false, false).await?;
    let rsp = io.connect_qpair(1, 63, 0, cntlid).await?;
    assert!(rsp.success());
    assert_eq!(rsp.cdw0.get() as u16, cntlid);

    let mut dup = TestHost::connect(tgt.addr).await?;
    dup.ic_handshake(false, false).await?;
    let rsp = dup.connect_qpair(1, 63, 0, cntlid).await?;
    assert_eq!(rsp.sc(), fabrics::INVALID_PARAM);
    Ok(())
}

#[tokio::test]
async fn ana_io_connect_requires_matching_listener() -> Result<()> {
    let (tgt, other_addr) = start_ana_target().await?;
    let mut admin = TestHost::connect(tgt.addr).await?;
    let cntlid = admin.admin_session(120_000).await?;
    admin.enable_ctrlr().await?;

    // With ANA reporting on, an I/O qpair arriving on a different listener
    // than the admin qpair is rejected.
    let mut io = TestHost::connect(other_addr).await?;
    io.ic_handshake(false, false).await?;
    let rsp = io.connect_qpair(1, 63, 0, cntlid).await?;
    assert_eq!(rsp.sc(), fabrics::INVALID_PARAM);

    // The admin qpair's own listener is fine.
    let mut io = TestHost::connect(tgt.addr).await?;
    io.ic_handshake(false, false).await?;
    assert!(io.connect_qpair(1, 63, 0, cntlid).await?.success());
    Ok(())
}
