// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use hex_literal::hex;
use nvmf_tcp_rs::pdu::{
    common::{PduHeader, PduType},
    ic::{IC_PDU_LEN, IcReq, IcRespBuilder},
    parse::Pdu,
};

use crate::unit_tests::load_fixture;

#[test]
fn test_ic_req_parse() -> Result<()> {
    let bytes = load_fixture("tests/unit_tests/fixtures/pdus/ic_req.hex")?;
    assert_eq!(bytes.len(), IC_PDU_LEN);

    let ic = IcReq::from_header_bytes(&bytes)?;
    assert_eq!(ic.common.pdu_type.known(), Some(PduType::IcReq));
    assert_eq!(ic.common.hlen as usize, IC_PDU_LEN);
    assert_eq!(ic.common.plen.get() as usize, IC_PDU_LEN);
    assert_eq!(ic.pfv.get(), 0);
    assert_eq!(ic.hpda, 0);
    assert!(ic.dgst.hdgst());
    assert!(!ic.dgst.ddgst());
    Ok(())
}

#[test]
fn test_ic_req_via_generic_parse() -> Result<()> {
    let bytes = load_fixture("tests/unit_tests/fixtures/pdus/ic_req.hex")?;
    match Pdu::from_header_bytes(&bytes)? {
        Pdu::IcReq(ic) => assert!(ic.dgst.hdgst()),
        other => panic!("expected IcReq, got {other:?}"),
    }
    Ok(())
}

#[test]
fn test_ic_resp_roundtrip() -> Result<()> {
    let resp = IcRespBuilder::new()
        .cpda(0)
        .hdgst(true)
        .ddgst(false)
        .maxh2cdata(131072)
        .header;

    let mut wire = vec![0u8; IC_PDU_LEN];
    resp.to_header_bytes(&mut wire)?;

    // Wire layout: type 0x01, hlen/plen 128, hdgst bit, maxh2cdata LE at 12.
    assert_eq!(wire[..16], hex!("01 00 80 00 80 00 00 00 00 00 00 01 00 00 02 00"));

    match Pdu::from_header_bytes(&wire)? {
        Pdu::IcResp(parsed) => {
            assert_eq!(parsed, resp);
            assert_eq!(parsed.maxh2cdata.get(), 131072);
            assert!(parsed.dgst.hdgst());
        },
        other => panic!("expected IcResp, got {other:?}"),
    }
    Ok(())
}

#[test]
fn test_ic_req_wrong_type_rejected() -> Result<()> {
    let mut bytes = load_fixture("tests/unit_tests/fixtures/pdus/ic_req.hex")?;
    bytes[0] = 0x04; // claim to be a capsule
    assert!(IcReq::from_header_bytes(&bytes).is_err());
    Ok(())
}
