// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use nvmf_tcp_rs::{
    nvme::types::{
        NvmeCpl, SGL_SUBTYPE_TRANSPORT, SGL_TYPE_TRANSPORT_DATA_BLOCK, Sct, XferDir,
        generic,
    },
    pdu::{
        capsule::{CAPSULE_CMD_HDR_LEN, CAPSULE_RESP_HDR_LEN, CapsuleCmd, CapsuleRespBuilder},
        common::{PduHeader, PduType},
        parse::Pdu,
    },
};

use crate::unit_tests::load_fixture;

#[test]
fn test_capsule_cmd_parse() -> Result<()> {
    let bytes = load_fixture("tests/unit_tests/fixtures/pdus/capsule_cmd_identify.hex")?;
    assert_eq!(bytes.len(), CAPSULE_CMD_HDR_LEN);

    let capsule = CapsuleCmd::from_header_bytes(&bytes)?;
    assert_eq!(capsule.common.pdu_type.known(), Some(PduType::CapsuleCmd));
    assert_eq!(capsule.common.hlen as usize, CAPSULE_CMD_HDR_LEN);

    // The embedded SQE: Identify with a 4096-byte transport SGL.
    let sqe = capsule.sqe;
    assert_eq!(sqe.opc, 0x06);
    assert_eq!(sqe.cid.get(), 0x0010);
    assert_eq!(sqe.cdw10.get(), 1);
    assert_eq!(sqe.xfer(), XferDir::ControllerToHost);
    assert_eq!(sqe.dptr.sgl_type(), SGL_TYPE_TRANSPORT_DATA_BLOCK);
    assert_eq!(sqe.dptr.sgl_subtype(), SGL_SUBTYPE_TRANSPORT);
    assert_eq!(sqe.dptr.length.get(), 4096);
    Ok(())
}

#[test]
fn test_capsule_resp_roundtrip() -> Result<()> {
    let mut cqe = NvmeCpl::default();
    cqe.cid.set(0x0010);
    cqe.sqhd.set(3);
    cqe.set_status(Sct::Generic, generic::SUCCESS);

    let resp = CapsuleRespBuilder::new(cqe).header;
    let mut wire = vec![0u8; CAPSULE_RESP_HDR_LEN];
    resp.to_header_bytes(&mut wire)?;

    assert_eq!(wire[0], 0x05);
    assert_eq!(wire[2] as usize, CAPSULE_RESP_HDR_LEN);

    match Pdu::from_header_bytes(&wire)? {
        Pdu::CapsuleResp(parsed) => {
            assert_eq!(parsed.cqe.cid.get(), 0x0010);
            assert_eq!(parsed.cqe.sqhd.get(), 3);
            assert!(parsed.cqe.success());
        },
        other => panic!("expected CapsuleResp, got {other:?}"),
    }
    Ok(())
}

#[test]
fn test_plen_matches_total_written() -> Result<()> {
    let cqe = NvmeCpl::default();
    let mut resp = CapsuleRespBuilder::new(cqe).header;
    resp.common.plen.set(CAPSULE_RESP_HDR_LEN as u32);

    let mut wire = vec![0u8; CAPSULE_RESP_HDR_LEN];
    resp.to_header_bytes(&mut wire)?;
    assert_eq!(resp.common.plen.get() as usize, wire.len());
    Ok(())
}
