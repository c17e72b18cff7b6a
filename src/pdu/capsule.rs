// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Command and response capsules: an SQE or CQE framed as a PDU.

use anyhow::{Result, bail};
use zerocopy::{FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    nvme::types::{NvmeCmd, NvmeCpl},
    pdu::common::{CommonHeader, PduHeader, PduType},
};

pub const CAPSULE_CMD_HDR_LEN: usize = 72;
pub const CAPSULE_RESP_HDR_LEN: usize = 24;

/// CAPSULE_CMD — a 64-byte SQE, optionally followed by in-capsule data.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CapsuleCmd {
    pub common: CommonHeader, // 0..8
    pub sqe: NvmeCmd,         // 8..72
}

impl CapsuleCmd {
    pub fn from_header_bytes(buf: &[u8]) -> Result<Self> {
        let hdr = Self::read_from_bytes(buf)
            .map_err(|e| anyhow::anyhow!("failed to convert buffer CapsuleCmd: {e}"))?;
        if hdr.common.pdu_type.known() != Some(PduType::CapsuleCmd) {
            bail!("CapsuleCmd: invalid pdu type {:?}", hdr.common.pdu_type);
        }
        Ok(hdr)
    }
}

impl PduHeader for CapsuleCmd {
    #[inline]
    fn common(&self) -> &CommonHeader {
        &self.common
    }

    #[inline]
    fn common_mut(&mut self) -> &mut CommonHeader {
        &mut self.common
    }

    fn to_header_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != CAPSULE_CMD_HDR_LEN {
            bail!("buffer length must be {CAPSULE_CMD_HDR_LEN}, got {}", buf.len());
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }
}

/// CAPSULE_RESP — a 16-byte CQE; never carries data.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CapsuleResp {
    pub common: CommonHeader, // 0..8
    pub cqe: NvmeCpl,         // 8..24
}

impl CapsuleResp {
    pub fn from_header_bytes(buf: &[u8]) -> Result<Self> {
        let hdr = Self::read_from_bytes(buf)
            .map_err(|e| anyhow::anyhow!("failed to convert buffer CapsuleResp: {e}"))?;
        if hdr.common.pdu_type.known() != Some(PduType::CapsuleResp) {
            bail!("CapsuleResp: invalid pdu type {:?}", hdr.common.pdu_type);
        }
        Ok(hdr)
    }
}

impl PduHeader for CapsuleResp {
    #[inline]
    fn common(&self) -> &CommonHeader {
        &self.common
    }

    #[inline]
    fn common_mut(&mut self) -> &mut CommonHeader {
        &mut self.common
    }

    fn to_header_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != CAPSULE_RESP_HDR_LEN {
            bail!("buffer length must be {CAPSULE_RESP_HDR_LEN}, got {}", buf.len());
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }
}

/// Builder for outbound response capsules.
#[derive(Debug, Default)]
pub struct CapsuleRespBuilder {
    pub header: CapsuleResp,
}

impl CapsuleRespBuilder {
    pub fn new(cqe: NvmeCpl) -> Self {
        let mut header = CapsuleResp { common: CommonHeader::new(PduType::CapsuleResp), cqe };
        header.common.plen.set(CAPSULE_RESP_HDR_LEN as u32);
        Self { header }
    }

    pub fn with_hdgst(mut self) -> Self {
        self.header.common.flags.set_hdgst(true);
        self
    }
}

const _: () = assert!(core::mem::size_of::<CapsuleCmd>() == CAPSULE_CMD_HDR_LEN);
const _: () = assert!(core::mem::size_of::<CapsuleResp>() == CAPSULE_RESP_HDR_LEN);
