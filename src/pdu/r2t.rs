// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Ready-To-Transfer PDU: the target's grant for a byte window of host write
//! data under a transfer tag. This target always grants the full
//! out-of-capsule length with a single R2T (`r2to = 0`,
//! `r2tl = request length`).

use anyhow::{Result, bail};
use zerocopy::{
    FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U32,
};

use crate::pdu::common::{CommonHeader, PduHeader, PduType};

pub const R2T_HDR_LEN: usize = 24;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct R2t {
    pub common: CommonHeader,     // 0..8
    pub cccid: U16<LittleEndian>, // 8..10
    pub ttag: U16<LittleEndian>,  // 10..12
    pub r2to: U32<LittleEndian>,  // 12..16 (window offset)
    pub r2tl: U32<LittleEndian>,  // 16..20 (window length)
    reserved: [u8; 4],            // 20..24
}

impl R2t {
    pub fn from_header_bytes(buf: &[u8]) -> Result<Self> {
        let hdr = Self::read_from_bytes(buf)
            .map_err(|e| anyhow::anyhow!("failed to convert buffer R2t: {e}"))?;
        if hdr.common.pdu_type.known() != Some(PduType::R2t) {
            bail!("R2t: invalid pdu type {:?}", hdr.common.pdu_type);
        }
        Ok(hdr)
    }
}

impl PduHeader for R2t {
    #[inline]
    fn common(&self) -> &CommonHeader {
        &self.common
    }

    #[inline]
    fn common_mut(&mut self) -> &mut CommonHeader {
        &mut self.common
    }

    fn to_header_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != R2T_HDR_LEN {
            bail!("buffer length must be {R2T_HDR_LEN}, got {}", buf.len());
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct R2tBuilder {
    pub header: R2t,
}

impl R2tBuilder {
    pub fn new() -> Self {
        Self { header: R2t { common: CommonHeader::new(PduType::R2t), ..Default::default() } }
    }

    pub fn cccid(mut self, cid: u16) -> Self {
        self.header.cccid.set(cid);
        self
    }

    pub fn ttag(mut self, ttag: u16) -> Self {
        self.header.ttag.set(ttag);
        self
    }

    pub fn window(mut self, offset: u32, len: u32) -> Self {
        self.header.r2to.set(offset);
        self.header.r2tl.set(len);
        self
    }
}

const _: () = assert!(core::mem::size_of::<R2t>() == R2T_HDR_LEN);
