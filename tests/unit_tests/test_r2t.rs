// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use nvmf_tcp_rs::pdu::{
    common::{PduHeader, PduType},
    parse::Pdu,
    r2t::{R2T_HDR_LEN, R2t, R2tBuilder},
};

use crate::unit_tests::load_fixture;

#[test]
fn test_r2t_parse() -> Result<()> {
    let bytes = load_fixture("tests/unit_tests/fixtures/pdus/r2t.hex")?;
    assert_eq!(bytes.len(), R2T_HDR_LEN);

    let r2t = R2t::from_header_bytes(&bytes)?;
    assert_eq!(r2t.common.pdu_type.known(), Some(PduType::R2t));
    assert_eq!(r2t.cccid.get(), 0x0010);
    assert_eq!(r2t.ttag.get(), 1);
    assert_eq!(r2t.r2to.get(), 0);
    assert_eq!(r2t.r2tl.get(), 8192);
    Ok(())
}

#[test]
fn test_r2t_builder_matches_fixture() -> Result<()> {
    let fixture = load_fixture("tests/unit_tests/fixtures/pdus/r2t.hex")?;

    let mut r2t = R2tBuilder::new().cccid(0x0010).ttag(1).window(0, 8192).header;
    r2t.common.plen.set(R2T_HDR_LEN as u32);

    let mut wire = vec![0u8; R2T_HDR_LEN];
    r2t.to_header_bytes(&mut wire)?;
    assert_eq!(wire, fixture);
    Ok(())
}

#[test]
fn test_r2t_via_generic_parse() -> Result<()> {
    let bytes = load_fixture("tests/unit_tests/fixtures/pdus/r2t.hex")?;
    match Pdu::from_header_bytes(&bytes)? {
        Pdu::R2t(r2t) => assert_eq!(r2t.r2tl.get(), 8192),
        other => panic!("expected R2t, got {other:?}"),
    }
    Ok(())
}
