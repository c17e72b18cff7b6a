// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail};
use enum_dispatch::enum_dispatch;

use crate::pdu::{
    capsule::{CapsuleCmd, CapsuleResp},
    common::{CommonHeader, PduHeader, PduType, RawPduType, UnknownPduType},
    data::DataHdr,
    ic::{IcReq, IcResp},
    r2t::R2t,
    term::TermReq,
};

/// A fully parsed PDU header of any type.
#[enum_dispatch(PduHeader)]
#[derive(Debug, Clone, PartialEq)]
pub enum Pdu {
    IcReq(IcReq),
    IcResp(IcResp),
    CapsuleCmd(CapsuleCmd),
    CapsuleResp(CapsuleResp),
    H2cData(DataHdr),
    TermReq(TermReq),
    R2t(R2t),
}

impl Pdu {
    /// Parse a complete header (common + type-specific) from `bytes`. The
    /// caller has already collected `hlen` bytes as announced in the common
    /// header.
    pub fn from_header_bytes(bytes: &[u8]) -> Result<Self> {
        let first = *bytes.first().ok_or_else(|| anyhow::anyhow!("empty header"))?;
        let pdu_type = RawPduType::from_raw(first)
            .known()
            .ok_or(UnknownPduType(first))?;
        match pdu_type {
            PduType::IcReq => Ok(Pdu::IcReq(IcReq::from_header_bytes(bytes)?)),
            PduType::IcResp => Ok(Pdu::IcResp(IcResp::from_header_bytes(bytes)?)),
            PduType::CapsuleCmd => {
                Ok(Pdu::CapsuleCmd(CapsuleCmd::from_header_bytes(bytes)?))
            },
            PduType::CapsuleResp => {
                Ok(Pdu::CapsuleResp(CapsuleResp::from_header_bytes(bytes)?))
            },
            PduType::H2cData | PduType::C2hData => {
                Ok(Pdu::H2cData(DataHdr::from_header_bytes(bytes, pdu_type)?))
            },
            PduType::H2cTermReq | PduType::C2hTermReq => {
                Ok(Pdu::TermReq(TermReq::from_header_bytes(bytes, pdu_type)?))
            },
            PduType::R2t => Ok(Pdu::R2t(R2t::from_header_bytes(bytes)?)),
        }
    }

    /// Peek at the common header alone (first 8 bytes).
    pub fn common_from_bytes(bytes: &[u8]) -> Result<CommonHeader> {
        use zerocopy::FromBytes;
        if bytes.len() < core::mem::size_of::<CommonHeader>() {
            bail!("common header needs 8 bytes, got {}", bytes.len());
        }
        CommonHeader::read_from_bytes(&bytes[..core::mem::size_of::<CommonHeader>()])
            .map_err(|e| anyhow::anyhow!("{e}"))
    }
}
