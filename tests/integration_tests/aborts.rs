// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use nvmf_tcp_rs::{
    nvme::types::{
        NvmeCmd, SGL_SUBTYPE_TRANSPORT, SGL_TYPE_TRANSPORT_DATA_BLOCK, generic,
    },
    pdu::term::Fes,
};

use crate::integration_tests::common::{TestHost, start_target};

#[tokio::test]
async fn abort_completes_parked_aer() -> Result<()> {
    let tgt = start_target().await?;
    let mut host = TestHost::connect(tgt.addr).await?;
    host.admin_session(120_000).await?;

    // Park an Async Event Request; no event exists, so no response yet.
    let aer_cid = host.next_cid();
    let mut aer = NvmeCmd::default();
    aer.opc = 0x0C;
    aer.cid.set(aer_cid);
    host.send_capsule(aer, &[]).await?;

    // Abort it: SQID 0 (admin), CID of the AER.
    let abort_cid = host.next_cid();
    let mut abort = NvmeCmd::default();
    abort.opc = 0x08;
    abort.cid.set(abort_cid);
    abort.cdw10.set((aer_cid as u32) << 16);
    host.send_capsule(abort, &[]).await?;

    // The abort answers first (cdw0 bit 0 clear: aborted), then the AER
    // drains with an abort status.
    let first = host.expect_capsule_resp().await?;
    assert_eq!(first.cid.get(), abort_cid);
    assert!(first.success());
    assert_eq!(first.cdw0.get() & 1, 0);

    let second = host.expect_capsule_resp().await?;
    assert_eq!(second.cid.get(), aer_cid);
    assert_eq!(second.sc(), generic::ABORTED_BY_REQUEST);
    Ok(())
}

#[tokio::test]
async fn abort_of_unknown_cid_reports_not_aborted() -> Result<()> {
    let tgt = start_target().await?;
    let mut host = TestHost::connect(tgt.addr).await?;
    host.admin_session(120_000).await?;

    let abort_cid = host.next_cid();
    let mut abort = NvmeCmd::default();
    abort.opc = 0x08;
    abort.cid.set(abort_cid);
    abort.cdw10.set(0x4242_0000);
    host.send_capsule(abort, &[]).await?;

    let rsp = host.expect_capsule_resp().await?;
    assert!(rsp.success());
    assert_eq!(rsp.cdw0.get() & 1, 1);
    Ok(())
}

#[tokio::test]
async fn out_of_order_h2c_terminates() -> Result<()> {
    let tgt = start_target().await?;
    let mut admin = TestHost::connect(tgt.addr).await?;
    let cntlid = admin.admin_session(120_000).await?;
    admin.enable_ctrlr().await?;

    let mut io = TestHost::connect(tgt.addr).await?;
    io.ic_handshake(false, false).await?;
    assert!(io.connect_qpair(1, 63, 0, cntlid).await?.success());

    let mut sqe = io.rw_sqe(0x01, 1, 0, 15);
    let cid = sqe.cid.get();
    sqe.dptr.length.set(8192);
    sqe.dptr.set_type(SGL_TYPE_TRANSPORT_DATA_BLOCK, SGL_SUBTYPE_TRANSPORT);
    io.send_capsule(sqe, &[]).await?;
    let r2t = io.expect_r2t().await?;

    // Second half first: the window must start at offset 0.
    io.send_h2c_data(cid, r2t.ttag.get(), 4096, &[0u8; 4096], false).await?;
    let term = io.expect_term().await?;
    assert_eq!(Fes::from_u16(term.fes.get()), Some(Fes::DataTransferOutOfRange));
    Ok(())
}

#[tokio::test]
async fn h2c_with_unknown_ttag_terminates() -> Result<()> {
    let tgt = start_target().await?;
    let mut admin = TestHost::connect(tgt.addr).await?;
    let cntlid = admin.admin_session(120_000).await?;
    admin.enable_ctrlr().await?;

    let mut io = TestHost::connect(tgt.addr).await?;
    io.ic_handshake(false, false).await?;
    assert!(io.connect_qpair(1, 63, 0, cntlid).await?.success());

    let mut sqe = io.rw_sqe(0x01, 1, 0, 15);
    let cid = sqe.cid.get();
    sqe.dptr.length.set(8192);
    sqe.dptr.set_type(SGL_TYPE_TRANSPORT_DATA_BLOCK, SGL_SUBTYPE_TRANSPORT);
    io.send_capsule(sqe, &[]).await?;
    let r2t = io.expect_r2t().await?;

    io.send_h2c_data(cid, r2t.ttag.get() + 7, 0, &[0u8; 4096], false).await?;
    let term = io.expect_term().await?;
    assert_eq!(Fes::from_u16(term.fes.get()), Some(Fes::InvalidHeaderField));
    Ok(())
}
