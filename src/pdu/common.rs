// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The 8-byte common header that starts every NVMe/TCP PDU.
//!
//! ```text
//!  0        1        2        3        4..8
//! +--------+--------+--------+--------+----------------+
//! | type   | flags  | hlen   | pdo    | plen (LE u32)  |
//! +--------+--------+--------+--------+----------------+
//! ```
//!
//! * **type** – PDU type octet (see [`PduType`]).
//! * **flags** – HDGSTF/DDGSTF digest bits plus the C2H_DATA-only
//!   LAST_PDU/SUCCESS bits.
//! * **hlen** – length of the PDU header (common + type-specific), digests
//!   excluded.
//! * **pdo** – data offset from the PDU start; zero when the PDU carries no
//!   data segment.
//! * **plen** – total PDU length on the wire, digests and padding included.

use anyhow::Result;
use enum_dispatch::enum_dispatch;
use thiserror::Error;
use zerocopy::{
    FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U32,
};

/// Size of the common PDU header.
pub const COMMON_HDR_LEN: usize = 8;

/// Digest word length (CRC32C).
pub const DIGEST_LEN: usize = 4;

/// Seconds a qpair lingers in the error state after sending a term-req, so
/// the initiator has a chance to read the diagnostic before the socket dies.
pub const QPAIR_EXIT_TIMEOUT_SECS: u64 = 30;

/// Flags bit: header digest present after the type-specific header.
pub const FLAG_HDGST: u8 = 0x01;
/// Flags bit: data digest word follows the data segment.
pub const FLAG_DDGST: u8 = 0x02;
/// C2H_DATA only: this is the last data PDU of the command.
pub const FLAG_C2H_LAST_PDU: u8 = 0x04;
/// C2H_DATA only: command completed successfully, no capsule-resp follows.
pub const FLAG_C2H_SUCCESS: u8 = 0x08;

/// All PDU types of NVMe/TCP 1.3.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PduType {
    #[default]
    IcReq = 0x00,
    IcResp = 0x01,
    H2cTermReq = 0x02,
    C2hTermReq = 0x03,
    CapsuleCmd = 0x04,
    CapsuleResp = 0x05,
    H2cData = 0x06,
    C2hData = 0x07,
    R2t = 0x09,
}

impl PduType {
    #[inline]
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::IcReq,
            0x01 => Self::IcResp,
            0x02 => Self::H2cTermReq,
            0x03 => Self::C2hTermReq,
            0x04 => Self::CapsuleCmd,
            0x05 => Self::CapsuleResp,
            0x06 => Self::H2cData,
            0x07 => Self::C2hData,
            0x09 => Self::R2t,
            _ => return None,
        })
    }

    /// Expected `hlen` for this PDU type (common + type-specific header).
    #[inline]
    pub const fn header_len(self) -> usize {
        match self {
            Self::IcReq | Self::IcResp => 128,
            Self::H2cTermReq | Self::C2hTermReq => 24,
            Self::CapsuleCmd => 72,
            Self::CapsuleResp => 24,
            Self::H2cData | Self::C2hData => 24,
            Self::R2t => 24,
        }
    }

    /// IC and TERM_REQ PDUs never carry digests, whatever was negotiated.
    #[inline]
    pub const fn carries_digests(self) -> bool {
        !matches!(
            self,
            Self::IcReq | Self::IcResp | Self::H2cTermReq | Self::C2hTermReq
        )
    }

    /// PDU types a target may legally receive.
    #[inline]
    pub const fn host_to_controller(self) -> bool {
        matches!(self, Self::IcReq | Self::H2cTermReq | Self::CapsuleCmd | Self::H2cData)
    }
}

/// Returned when the first octet holds an undefined PDU type.
#[derive(Debug, Error)]
#[error("invalid pdu type: 0x{0:02x}")]
pub struct UnknownPduType(pub u8);

/// Wire-safe, zero-copy PDU type octet.
/// Transparent over `u8`, so it can live inside a zerocopy header struct.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawPduType(u8);

impl RawPduType {
    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn from_raw(v: u8) -> Self {
        Self(v)
    }

    #[inline]
    pub fn known(&self) -> Option<PduType> {
        PduType::from_u8(self.0)
    }

    #[inline]
    pub fn set_known(&mut self, t: PduType) {
        self.0 = t as u8;
    }
}

impl core::fmt::Debug for RawPduType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.known() {
            Some(t) => write!(f, "{t:?}"),
            None => write!(f, "0x{:02x}", self.0),
        }
    }
}

/// Wire-safe flags octet with typed accessors for the defined bits.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawPduFlags(u8);

impl RawPduFlags {
    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn hdgst(&self) -> bool {
        (self.0 & FLAG_HDGST) != 0
    }

    #[inline]
    pub fn set_hdgst(&mut self, on: bool) {
        if on {
            self.0 |= FLAG_HDGST;
        } else {
            self.0 &= !FLAG_HDGST;
        }
    }

    #[inline]
    pub const fn ddgst(&self) -> bool {
        (self.0 & FLAG_DDGST) != 0
    }

    #[inline]
    pub fn set_ddgst(&mut self, on: bool) {
        if on {
            self.0 |= FLAG_DDGST;
        } else {
            self.0 &= !FLAG_DDGST;
        }
    }

    #[inline]
    pub const fn c2h_last(&self) -> bool {
        (self.0 & FLAG_C2H_LAST_PDU) != 0
    }

    #[inline]
    pub fn set_c2h_last(&mut self) {
        self.0 |= FLAG_C2H_LAST_PDU;
    }

    #[inline]
    pub const fn c2h_success(&self) -> bool {
        (self.0 & FLAG_C2H_SUCCESS) != 0
    }

    #[inline]
    pub fn set_c2h_success(&mut self) {
        self.0 |= FLAG_C2H_SUCCESS;
    }
}

impl core::fmt::Debug for RawPduFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// Common header shared by every PDU.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CommonHeader {
    pub pdu_type: RawPduType,    // 0
    pub flags: RawPduFlags,      // 1
    pub hlen: u8,                // 2
    pub pdo: u8,                 // 3
    pub plen: U32<LittleEndian>, // 4..8
}

impl CommonHeader {
    pub fn new(t: PduType) -> Self {
        let mut hdr = Self::default();
        hdr.pdu_type.set_known(t);
        hdr.hlen = t.header_len() as u8;
        hdr
    }

    /// Header-digest length in bytes given the negotiated state.
    #[inline]
    pub fn hdgst_len(&self, negotiated: bool) -> usize {
        let applies = self.pdu_type.known().is_some_and(PduType::carries_digests);
        DIGEST_LEN * (negotiated && applies && self.flags.hdgst()) as usize
    }

    /// Data-digest length in bytes given the negotiated state.
    #[inline]
    pub fn ddgst_len(&self, negotiated: bool) -> usize {
        let applies = self.pdu_type.known().is_some_and(PduType::carries_digests);
        DIGEST_LEN * (negotiated && applies && self.flags.ddgst()) as usize
    }

    /// Data-segment length implied by `plen`, `pdo` and the digest state.
    #[inline]
    pub fn data_len(&self, ddgst: bool) -> usize {
        let plen = self.plen.get() as usize;
        let pdo = self.pdo as usize;
        plen.saturating_sub(pdo).saturating_sub(self.ddgst_len(ddgst))
    }
}

/// Common functionality for typed PDU headers: expose the embedded common
/// header and serialize the full header (common + type-specific) to bytes.
#[enum_dispatch]
pub trait PduHeader: Sized {
    fn common(&self) -> &CommonHeader;

    fn common_mut(&mut self) -> &mut CommonHeader;

    /// Serialize the header into `buf`; `buf.len()` must equal `hlen`.
    fn to_header_bytes(&self, buf: &mut [u8]) -> Result<()>;
}
