// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Data-carrying PDUs: H2C_DATA (host write payload, granted by an R2T) and
//! C2H_DATA (read payload emitted by the target). Both share a 24-byte
//! header; the direction is encoded in the PDU type.

use anyhow::{Result, bail};
use zerocopy::{
    FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U32,
};

use crate::pdu::common::{CommonHeader, PduHeader, PduType};

pub const DATA_HDR_LEN: usize = 24;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct DataHdr {
    pub common: CommonHeader,     // 0..8
    pub cccid: U16<LittleEndian>, // 8..10 (cid of the command capsule)
    pub ttag: U16<LittleEndian>,  // 10..12 (transfer tag, H2C only)
    pub datao: U32<LittleEndian>, // 12..16 (offset of this chunk)
    pub datal: U32<LittleEndian>, // 16..20 (length of this chunk)
    pub reserved: [u8; 4],        // 20..24
}

impl DataHdr {
    pub fn from_header_bytes(buf: &[u8], expect: PduType) -> Result<Self> {
        let hdr = Self::read_from_bytes(buf)
            .map_err(|e| anyhow::anyhow!("failed to convert buffer DataHdr: {e}"))?;
        if hdr.common.pdu_type.known() != Some(expect) {
            bail!("DataHdr: expected {:?}, got {:?}", expect, hdr.common.pdu_type);
        }
        Ok(hdr)
    }
}

impl PduHeader for DataHdr {
    #[inline]
    fn common(&self) -> &CommonHeader {
        &self.common
    }

    #[inline]
    fn common_mut(&mut self) -> &mut CommonHeader {
        &mut self.common
    }

    fn to_header_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != DATA_HDR_LEN {
            bail!("buffer length must be {DATA_HDR_LEN}, got {}", buf.len());
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }
}

/// Builder for outbound C2H_DATA chunks.
///
/// `plen`/`pdo` are filled by the serializer once the digest state and CPDA
/// padding of the connection are known.
#[derive(Debug, Default)]
pub struct C2hDataBuilder {
    pub header: DataHdr,
}

impl C2hDataBuilder {
    pub fn new() -> Self {
        Self { header: DataHdr { common: CommonHeader::new(PduType::C2hData), ..Default::default() } }
    }

    pub fn cccid(mut self, cid: u16) -> Self {
        self.header.cccid.set(cid);
        self
    }

    pub fn datao(mut self, off: u32) -> Self {
        self.header.datao.set(off);
        self
    }

    pub fn datal(mut self, len: u32) -> Self {
        self.header.datal.set(len);
        self
    }

    /// Mark this chunk as the last one of the command.
    pub fn last(mut self) -> Self {
        self.header.common.flags.set_c2h_last();
        self
    }

    /// Piggy-back the successful completion on the final data PDU.
    pub fn success(mut self) -> Self {
        self.header.common.flags.set_c2h_success();
        self
    }
}

const _: () = assert!(core::mem::size_of::<DataHdr>() == DATA_HDR_LEN);
