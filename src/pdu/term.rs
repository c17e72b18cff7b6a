// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Termination-request PDUs, the wire diagnostic a peer sends before
//! dropping the connection. The data segment carries up to 128 bytes of the
//! offending PDU header; term-reqs never carry digests and their `fei` points
//! at the byte offset of the field that failed validation.

use anyhow::{Result, bail};
use thiserror::Error;
use zerocopy::{
    FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U32,
};

use crate::pdu::common::{CommonHeader, PduHeader, PduType};

pub const TERM_REQ_HDR_LEN: usize = 24;
/// Cap on the copied diagnostic data.
pub const TERM_REQ_MAX_DATA: usize = 128;
/// Largest term-req on the wire: header + diagnostic data.
pub const TERM_REQ_PDU_MAX_SIZE: usize = TERM_REQ_HDR_LEN + TERM_REQ_MAX_DATA;

/// Fatal Error Status values of NVMe/TCP 1.3.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fes {
    #[error("invalid PDU header field")]
    InvalidHeaderField = 0x01,
    #[error("PDU sequence error")]
    PduSequenceError = 0x02,
    #[error("header digest error")]
    HdgstError = 0x03,
    #[error("data transfer out of range")]
    DataTransferOutOfRange = 0x04,
    #[error("data transfer limit exceeded")]
    DataTransferLimitExceeded = 0x05,
    #[error("unsupported parameter")]
    UnsupportedParameter = 0x06,
}

impl Fes {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x01 => Self::InvalidHeaderField,
            0x02 => Self::PduSequenceError,
            0x03 => Self::HdgstError,
            0x04 => Self::DataTransferOutOfRange,
            0x05 => Self::DataTransferLimitExceeded,
            0x06 => Self::UnsupportedParameter,
            _ => return None,
        })
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct TermReq {
    pub common: CommonHeader,   // 0..8
    pub fes: U16<LittleEndian>, // 8..10
    pub fei: U32<LittleEndian>, // 10..14 (field-error info: byte offset)
    fei_hi: [u8; 2],            // 14..16 (upper half of the 6-byte FEI, unused)
    reserved: [u8; 8],          // 16..24
}

impl TermReq {
    pub fn from_header_bytes(buf: &[u8], expect: PduType) -> Result<Self> {
        let hdr = Self::read_from_bytes(buf)
            .map_err(|e| anyhow::anyhow!("failed to convert buffer TermReq: {e}"))?;
        if hdr.common.pdu_type.known() != Some(expect) {
            bail!("TermReq: expected {:?}, got {:?}", expect, hdr.common.pdu_type);
        }
        Ok(hdr)
    }
}

impl PduHeader for TermReq {
    #[inline]
    fn common(&self) -> &CommonHeader {
        &self.common
    }

    #[inline]
    fn common_mut(&mut self) -> &mut CommonHeader {
        &mut self.common
    }

    fn to_header_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != TERM_REQ_HDR_LEN {
            bail!("buffer length must be {TERM_REQ_HDR_LEN}, got {}", buf.len());
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }
}

/// Builder for the C2H_TERM_REQ the target emits on a protocol violation.
/// `copy_header` attaches the offending PDU header as diagnostic data and
/// fixes up `plen` accordingly.
#[derive(Debug)]
pub struct C2hTermReqBuilder {
    pub header: TermReq,
    pub data: Vec<u8>,
}

impl C2hTermReqBuilder {
    pub fn new(fes: Fes, fei: u32) -> Self {
        let mut header = TermReq { common: CommonHeader::new(PduType::C2hTermReq), ..Default::default() };
        header.fes.set(fes as u16);
        header.fei.set(fei);
        header.common.plen.set(TERM_REQ_HDR_LEN as u32);
        Self { header, data: Vec::new() }
    }

    pub fn copy_header(mut self, offending: &[u8]) -> Self {
        let take = offending.len().min(TERM_REQ_MAX_DATA);
        self.data = offending[..take].to_vec();
        self.header.common.pdo = TERM_REQ_HDR_LEN as u8;
        self.header.common.plen.set((TERM_REQ_HDR_LEN + take) as u32);
        self
    }
}

const _: () = assert!(core::mem::size_of::<TermReq>() == TERM_REQ_HDR_LEN);
