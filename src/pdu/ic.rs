// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Initialize-Connection handshake PDUs (IC_REQ / IC_RESP).
//!
//! The very first PDU on a connection must be an IC_REQ; the target answers
//! with an IC_RESP fixing the digest state and MAXH2CDATA for the lifetime
//! of the qpair. Neither PDU ever carries digests itself.

use anyhow::{Result, bail};
use zerocopy::{
    FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U32,
};

use crate::pdu::common::{CommonHeader, PduHeader, PduType};

/// IC PDUs are 128 bytes on the wire.
pub const IC_PDU_LEN: usize = 128;

/// Largest legal HPDA/CPDA exponent (alignment = (v+1)*4 bytes, max 128).
pub const PDA_MAX: u8 = 31;

/// Digest-enable bits carried in the `dgst` octet of IC PDUs.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawDigestCaps(u8);

impl RawDigestCaps {
    #[inline]
    pub const fn hdgst(&self) -> bool {
        (self.0 & 0x01) != 0
    }

    #[inline]
    pub const fn ddgst(&self) -> bool {
        (self.0 & 0x02) != 0
    }

    #[inline]
    pub fn set_hdgst(&mut self, on: bool) {
        if on {
            self.0 |= 0x01;
        } else {
            self.0 &= !0x01;
        }
    }

    #[inline]
    pub fn set_ddgst(&mut self, on: bool) {
        if on {
            self.0 |= 0x02;
        } else {
            self.0 &= !0x02;
        }
    }
}

impl core::fmt::Debug for RawDigestCaps {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dgst")
            .field("hdgst", &self.hdgst())
            .field("ddgst", &self.ddgst())
            .finish()
    }
}

/// IC_REQ — host side of the connection handshake.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct IcReq {
    pub common: CommonHeader,      // 0..8
    pub pfv: U16<LittleEndian>,    // 8..10 (PDU format version, must be 0)
    pub hpda: u8,                  // 10 (host PDU data alignment exponent)
    pub dgst: RawDigestCaps,       // 11
    pub maxr2t: U32<LittleEndian>, // 12..16 (0-based concurrent R2T limit)
    reserved: [u8; 112],           // 16..128
}

impl Default for IcReq {
    fn default() -> Self {
        Self {
            common: CommonHeader::new(PduType::IcReq),
            pfv: U16::ZERO,
            hpda: 0,
            dgst: RawDigestCaps::default(),
            maxr2t: U32::ZERO,
            reserved: [0u8; 112],
        }
    }
}

impl IcReq {
    pub fn from_header_bytes(buf: &[u8]) -> Result<Self> {
        let hdr = Self::read_from_bytes(buf)
            .map_err(|e| anyhow::anyhow!("failed to convert buffer IcReq: {e}"))?;
        if hdr.common.pdu_type.known() != Some(PduType::IcReq) {
            bail!("IcReq: invalid pdu type {:?}", hdr.common.pdu_type);
        }
        Ok(hdr)
    }
}

impl PduHeader for IcReq {
    #[inline]
    fn common(&self) -> &CommonHeader {
        &self.common
    }

    #[inline]
    fn common_mut(&mut self) -> &mut CommonHeader {
        &mut self.common
    }

    fn to_header_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != IC_PDU_LEN {
            bail!("buffer length must be {IC_PDU_LEN}, got {}", buf.len());
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }
}

/// IC_RESP — the target's answer, fixing the negotiated parameters.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct IcResp {
    pub common: CommonHeader,          // 0..8
    pub pfv: U16<LittleEndian>,        // 8..10
    pub cpda: u8,                      // 10 (controller PDU data alignment)
    pub dgst: RawDigestCaps,           // 11
    pub maxh2cdata: U32<LittleEndian>, // 12..16
    reserved: [u8; 112],               // 16..128
}

impl Default for IcResp {
    fn default() -> Self {
        Self {
            common: CommonHeader::new(PduType::IcResp),
            pfv: U16::ZERO,
            cpda: 0,
            dgst: RawDigestCaps::default(),
            maxh2cdata: U32::ZERO,
            reserved: [0u8; 112],
        }
    }
}

impl IcResp {
    pub fn from_header_bytes(buf: &[u8]) -> Result<Self> {
        let hdr = Self::read_from_bytes(buf)
            .map_err(|e| anyhow::anyhow!("failed to convert buffer IcResp: {e}"))?;
        if hdr.common.pdu_type.known() != Some(PduType::IcResp) {
            bail!("IcResp: invalid pdu type {:?}", hdr.common.pdu_type);
        }
        Ok(hdr)
    }
}

impl PduHeader for IcResp {
    #[inline]
    fn common(&self) -> &CommonHeader {
        &self.common
    }

    #[inline]
    fn common_mut(&mut self) -> &mut CommonHeader {
        &mut self.common
    }

    fn to_header_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != IC_PDU_LEN {
            bail!("buffer length must be {IC_PDU_LEN}, got {}", buf.len());
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }
}

/// Builder for the IC_RESP the target emits after validating an IC_REQ.
#[derive(Debug, Default)]
pub struct IcRespBuilder {
    pub header: IcResp,
}

impl IcRespBuilder {
    pub fn new() -> Self {
        let mut header = IcResp::default();
        header.common.plen.set(IC_PDU_LEN as u32);
        Self { header }
    }

    pub fn cpda(mut self, cpda: u8) -> Self {
        self.header.cpda = cpda;
        self
    }

    pub fn hdgst(mut self, on: bool) -> Self {
        self.header.dgst.set_hdgst(on);
        self
    }

    pub fn ddgst(mut self, on: bool) -> Self {
        self.header.dgst.set_ddgst(on);
        self
    }

    pub fn maxh2cdata(mut self, max: u32) -> Self {
        self.header.maxh2cdata.set(max);
        self
    }
}

const _: () = assert!(core::mem::size_of::<IcReq>() == IC_PDU_LEN);
const _: () = assert!(core::mem::size_of::<IcResp>() == IC_PDU_LEN);
