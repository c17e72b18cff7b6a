// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use nvmf_tcp_rs::pdu::{
    common::{PduHeader, PduType},
    term::{C2hTermReqBuilder, Fes, TERM_REQ_HDR_LEN, TermReq},
};

#[test]
fn test_term_req_roundtrip() -> Result<()> {
    let offending = [0x04u8, 0x00, 0x99, 0x00, 0x48, 0x00, 0x00, 0x00];
    let term = C2hTermReqBuilder::new(Fes::InvalidHeaderField, 2).copy_header(&offending);

    let mut wire = vec![0u8; TERM_REQ_HDR_LEN];
    term.header.to_header_bytes(&mut wire)?;
    wire.extend_from_slice(&term.data);

    assert_eq!(wire[0], 0x03);
    assert_eq!(
        u32::from_le_bytes(wire[4..8].try_into()?),
        (TERM_REQ_HDR_LEN + offending.len()) as u32
    );

    let parsed = TermReq::from_header_bytes(&wire[..TERM_REQ_HDR_LEN], PduType::C2hTermReq)?;
    assert_eq!(Fes::from_u16(parsed.fes.get()), Some(Fes::InvalidHeaderField));
    assert_eq!(parsed.fei.get(), 2);
    assert_eq!(&wire[TERM_REQ_HDR_LEN..], &offending);
    Ok(())
}

#[test]
fn test_fes_codes() {
    assert_eq!(Fes::from_u16(0x01), Some(Fes::InvalidHeaderField));
    assert_eq!(Fes::from_u16(0x02), Some(Fes::PduSequenceError));
    assert_eq!(Fes::from_u16(0x03), Some(Fes::HdgstError));
    assert_eq!(Fes::from_u16(0x04), Some(Fes::DataTransferOutOfRange));
    assert_eq!(Fes::from_u16(0x07), None);
}
