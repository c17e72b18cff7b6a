// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use nvmf_tcp_rs::{
    nvme::types::{NvmeCmd, generic},
    pdu::{
        capsule::{CAPSULE_CMD_HDR_LEN, CapsuleCmd},
        common::{CommonHeader, PduType},
        digest::{calc_data_digest, calc_header_digest, digest_to_wire},
        term::Fes,
    },
};
use zerocopy::IntoBytes;

use crate::integration_tests::common::{TestHost, start_target};

#[tokio::test]
async fn digest_enabled_session_works_end_to_end() -> Result<()> {
    let tgt = start_target().await?;
    let mut host = TestHost::connect(tgt.addr).await?;

    let resp = host.ic_handshake(true, true).await?;
    assert!(resp.dgst.hdgst());
    assert!(resp.dgst.ddgst());

    // Connect (with in-capsule data, so both digests are exercised).
    let rsp = host.connect_qpair(0, 31, 120_000, 0xFFFF).await?;
    assert!(rsp.success());
    host.enable_ctrlr().await?;
    Ok(())
}

#[tokio::test]
async fn corrupt_header_digest_terminates() -> Result<()> {
    let tgt = start_target().await?;
    let mut host = TestHost::connect(tgt.addr).await?;
    host.ic_handshake(true, false).await?;
    host.connect_qpair(0, 31, 120_000, 0xFFFF).await?;

    // Hand-rolled keep-alive capsule with a flipped digest bit.
    let mut sqe = NvmeCmd::default();
    sqe.opc = 0x18;
    sqe.cid.set(0x99);
    let mut capsule = CapsuleCmd { common: CommonHeader::new(PduType::CapsuleCmd), sqe };
    capsule.common.flags.set_hdgst(true);
    capsule.common.plen.set((CAPSULE_CMD_HDR_LEN + 4) as u32);

    let mut wire = capsule.as_bytes().to_vec();
    let crc = calc_header_digest(&wire) ^ 0x1; // deliberately wrong
    wire.extend_from_slice(&digest_to_wire(crc));
    host.send_raw(&wire).await?;

    let term = host.expect_term().await?;
    assert_eq!(Fes::from_u16(term.fes.get()), Some(Fes::HdgstError));
    Ok(())
}

#[tokio::test]
async fn corrupt_data_digest_completes_with_transient_status() -> Result<()> {
    let tgt = start_target().await?;

    // Admin + enabled controller + io qpair, all with digests on.
    let mut admin = TestHost::connect(tgt.addr).await?;
    admin.ic_handshake(false, false).await?;
    let rsp = admin.connect_qpair(0, 31, 120_000, 0xFFFF).await?;
    let cntlid = rsp.cdw0.get() as u16;
    admin.enable_ctrlr().await?;

    let mut io = TestHost::connect(tgt.addr).await?;
    io.ic_handshake(true, true).await?;
    let rsp = io.connect_qpair(1, 63, 0, cntlid).await?;
    assert!(rsp.success());

    // A 512-byte in-capsule write whose data digest is wrong.
    let payload = vec![0x77u8; 512];
    let mut sqe = io.rw_sqe(0x01, 1, 0, 0);
    let cid = sqe.cid.get();
    sqe.dptr.length.set(512);
    sqe.dptr.set_type(
        nvmf_tcp_rs::nvme::types::SGL_TYPE_DATA_BLOCK,
        nvmf_tcp_rs::nvme::types::SGL_SUBTYPE_OFFSET,
    );

    let mut capsule = CapsuleCmd { common: CommonHeader::new(PduType::CapsuleCmd), sqe };
    capsule.common.flags.set_hdgst(true);
    capsule.common.flags.set_ddgst(true);
    capsule.common.pdo = (CAPSULE_CMD_HDR_LEN + 4) as u8;
    capsule.common.plen.set((CAPSULE_CMD_HDR_LEN + 4 + 512 + 4) as u32);

    let mut wire = capsule.as_bytes().to_vec();
    let crc = calc_header_digest(&wire);
    wire.extend_from_slice(&digest_to_wire(crc));
    wire.extend_from_slice(&payload);
    let bad = calc_data_digest(&[&payload]) ^ 0xFFFF; // deliberately wrong
    wire.extend_from_slice(&digest_to_wire(bad));
    io.send_raw(&wire).await?;

    // The command still completes, but with the transient transport error
    // so the host retries; the connection survives.
    let rsp = io.expect_capsule_resp().await?;
    assert_eq!(rsp.cid.get(), cid);
    assert_eq!(rsp.sc(), generic::COMMAND_TRANSIENT_TRANSPORT_ERROR);

    // The qpair is still usable afterwards.
    let sqe = io.rw_sqe(0x00, 1, 0, 0);
    io.send_capsule(sqe, &[]).await?;
    let rsp = io.expect_capsule_resp().await?;
    assert!(rsp.success());
    Ok(())
}
