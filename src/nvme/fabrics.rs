// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Fabrics command set: Connect, Property Get/Set, and the virtual
//! controller register bar those properties expose.
//!
//! Fabrics commands reuse the 64-byte SQE frame with opcode `0x7F`; the
//! command subtype lives in byte 4 (`fctype`). The typed views below are
//! zerocopy reinterpretations of the same 64 bytes.

use anyhow::{Result, anyhow};
use zerocopy::{
    FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U32,
    U64,
};

use crate::nvme::types::{NvmeCmd, SglDescriptor};

/// Fabrics command subtypes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FabricsCmdType {
    PropertySet = 0x00,
    Connect = 0x01,
    PropertyGet = 0x04,
    AuthSend = 0x05,
    AuthRecv = 0x06,
    Disconnect = 0x08,
}

impl FabricsCmdType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::PropertySet,
            0x01 => Self::Connect,
            0x04 => Self::PropertyGet,
            0x05 => Self::AuthSend,
            0x06 => Self::AuthRecv,
            0x08 => Self::Disconnect,
            _ => return None,
        })
    }
}

/// Dynamic controller allocation sentinel in the connect data.
pub const CNTLID_DYNAMIC: u16 = 0xFFFF;

/// Fabrics Connect command (the SQE reinterpreted).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ConnectCmd {
    pub opcode: u8,                // 0 (0x7F)
    reserved1: u8,                 // 1
    pub cid: U16<LittleEndian>,    // 2..4
    pub fctype: u8,                // 4 (0x01)
    reserved2: [u8; 19],           // 5..24
    pub sgl1: SglDescriptor,       // 24..40
    pub recfmt: U16<LittleEndian>, // 40..42
    pub qid: U16<LittleEndian>,    // 42..44
    pub sqsize: U16<LittleEndian>, // 44..46 (0-based)
    pub cattr: u8,                 // 46
    reserved3: u8,                 // 47
    pub kato: U32<LittleEndian>,   // 48..52 (milliseconds)
    reserved4: [u8; 12],           // 52..64
}

/// The 1024-byte data segment of a Connect capsule.
#[repr(C)]
#[derive(Clone, Copy, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ConnectData {
    pub hostid: [u8; 16],          // 0..16
    pub cntlid: U16<LittleEndian>, // 16..18
    reserved: [u8; 238],           // 18..256
    pub subnqn: [u8; 256],         // 256..512
    pub hostnqn: [u8; 256],        // 512..768
    reserved2: [u8; 256],          // 768..1024
}

pub const CONNECT_DATA_LEN: usize = 1024;

impl Default for ConnectData {
    fn default() -> Self {
        Self {
            hostid: [0; 16],
            cntlid: U16::ZERO,
            reserved: [0; 238],
            subnqn: [0; 256],
            hostnqn: [0; 256],
            reserved2: [0; 256],
        }
    }
}

impl core::fmt::Debug for ConnectData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectData")
            .field("cntlid", &self.cntlid.get())
            .field("subnqn", &nqn_str(&self.subnqn).unwrap_or("<invalid>"))
            .field("hostnqn", &nqn_str(&self.hostnqn).unwrap_or("<invalid>"))
            .finish()
    }
}

/// Extract a NUL-terminated NQN from its fixed field. `None` when the
/// terminator is missing or the name is not UTF-8.
pub fn nqn_str(field: &[u8; 256]) -> Option<&str> {
    let nul = field.iter().position(|&b| b == 0)?;
    core::str::from_utf8(&field[..nul]).ok()
}

/// Property Get command view.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PropertyGetCmd {
    pub opcode: u8,              // 0
    reserved1: u8,               // 1
    pub cid: U16<LittleEndian>,  // 2..4
    pub fctype: u8,              // 4 (0x04)
    reserved2: [u8; 35],         // 5..40
    pub attrib: u8,              // 40 (bit 2..0: size, 0 = 4 bytes, 1 = 8 bytes)
    reserved3: [u8; 3],          // 41..44
    pub ofst: U32<LittleEndian>, // 44..48
    reserved4: [u8; 16],         // 48..64
}

impl Default for PropertyGetCmd {
    fn default() -> Self {
        Self {
            opcode: 0,
            reserved1: 0,
            cid: U16::<LittleEndian>::default(),
            fctype: 0,
            reserved2: [0; 35],
            attrib: 0,
            reserved3: [0; 3],
            ofst: U32::<LittleEndian>::default(),
            reserved4: [0; 16],
        }
    }
}

/// Property Set command view.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PropertySetCmd {
    pub opcode: u8,               // 0
    reserved1: u8,                // 1
    pub cid: U16<LittleEndian>,   // 2..4
    pub fctype: u8,               // 4 (0x00)
    reserved2: [u8; 35],          // 5..40
    pub attrib: u8,               // 40
    reserved3: [u8; 3],           // 41..44
    pub ofst: U32<LittleEndian>,  // 44..48
    pub value: U64<LittleEndian>, // 48..56
    reserved4: [u8; 8],           // 56..64
}

impl Default for PropertySetCmd {
    fn default() -> Self {
        Self {
            opcode: 0,
            reserved1: 0,
            cid: U16::<LittleEndian>::default(),
            fctype: 0,
            reserved2: [0; 35],
            attrib: 0,
            reserved3: [0; 3],
            ofst: U32::<LittleEndian>::default(),
            value: U64::<LittleEndian>::default(),
            reserved4: [0; 8],
        }
    }
}

macro_rules! sqe_view {
    ($name:ident) => {
        impl $name {
            /// Reinterpret the generic SQE as this fabrics command.
            pub fn from_cmd(cmd: &NvmeCmd) -> Result<Self> {
                Self::read_from_bytes(cmd.as_bytes()).map_err(|e| anyhow!("{e}"))
            }
        }
    };
}

sqe_view!(ConnectCmd);
sqe_view!(PropertyGetCmd);
sqe_view!(PropertySetCmd);

/// Controller register offsets addressable through Property Get/Set.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropOffset {
    Cap = 0x00,
    Vs = 0x08,
    Cc = 0x14,
    Csts = 0x1C,
    Aqa = 0x24,
    Asq = 0x28,
    Acq = 0x30,
}

impl PropOffset {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0x00 => Self::Cap,
            0x08 => Self::Vs,
            0x14 => Self::Cc,
            0x1C => Self::Csts,
            0x24 => Self::Aqa,
            0x28 => Self::Asq,
            0x30 => Self::Acq,
            _ => return None,
        })
    }

    /// Register width in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::Cap | Self::Asq | Self::Acq => 8,
            Self::Vs | Self::Cc | Self::Csts | Self::Aqa => 4,
        }
    }

    pub const fn writable(self) -> bool {
        matches!(self, Self::Cc | Self::Aqa | Self::Asq | Self::Acq)
    }
}

/// The virtual controller property bar.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct VcProp {
    pub cap: u64,
    pub vs: u32,
    pub cc: u32,
    pub csts: u32,
    pub aqa: u32,
    pub asq: u64,
    pub acq: u64,
}

// CC bit fields.
pub const CC_EN: u32 = 1 << 0;
const CC_CSS_SHIFT: u32 = 4;
const CC_MPS_SHIFT: u32 = 7;
const CC_AMS_SHIFT: u32 = 11;
const CC_SHN_SHIFT: u32 = 14;
const CC_IOSQES_SHIFT: u32 = 16;
const CC_IOCQES_SHIFT: u32 = 20;

// CSTS bit fields.
pub const CSTS_RDY: u32 = 1 << 0;
pub const CSTS_CFS: u32 = 1 << 1;
const CSTS_SHST_SHIFT: u32 = 2;
pub const SHST_NORMAL: u32 = 0;
pub const SHST_OCCURRING: u32 = 1;
pub const SHST_COMPLETE: u32 = 2;

impl VcProp {
    /// Initial bar for a freshly created controller.
    pub fn new(max_queue_depth: u16) -> Self {
        let mqes = (max_queue_depth - 1) as u64;
        let cqr = 1u64 << 16;
        let to = 15u64 << 24; // 7.5 s ready timeout, in 500 ms units
        let css_nvm = 1u64 << 37;
        Self {
            cap: mqes | cqr | to | css_nvm,
            vs: 0x0001_0300, // 1.3
            cc: 0,
            csts: 0,
            aqa: 0,
            asq: 0,
            acq: 0,
        }
    }

    #[inline]
    pub fn cc_en(&self) -> bool {
        self.cc & CC_EN != 0
    }

    #[inline]
    pub fn cc_css(&self) -> u32 {
        (self.cc >> CC_CSS_SHIFT) & 0x7
    }

    #[inline]
    pub fn cc_mps(&self) -> u32 {
        (self.cc >> CC_MPS_SHIFT) & 0xF
    }

    #[inline]
    pub fn cc_ams(&self) -> u32 {
        (self.cc >> CC_AMS_SHIFT) & 0x7
    }

    #[inline]
    pub fn cc_shn(&self) -> u32 {
        (self.cc >> CC_SHN_SHIFT) & 0x3
    }

    #[inline]
    pub fn cc_iosqes(&self) -> u32 {
        (self.cc >> CC_IOSQES_SHIFT) & 0xF
    }

    #[inline]
    pub fn cc_iocqes(&self) -> u32 {
        (self.cc >> CC_IOCQES_SHIFT) & 0xF
    }

    #[inline]
    pub fn csts_rdy(&self) -> bool {
        self.csts & CSTS_RDY != 0
    }

    #[inline]
    pub fn set_csts_rdy(&mut self, rdy: bool) {
        if rdy {
            self.csts |= CSTS_RDY;
        } else {
            self.csts &= !CSTS_RDY;
        }
    }

    #[inline]
    pub fn set_csts_cfs(&mut self) {
        self.csts |= CSTS_CFS;
    }

    #[inline]
    pub fn set_csts_shst(&mut self, shst: u32) {
        self.csts = (self.csts & !(0x3 << CSTS_SHST_SHIFT)) | ((shst & 0x3) << CSTS_SHST_SHIFT);
    }

    pub fn read(&self, off: PropOffset) -> u64 {
        match off {
            PropOffset::Cap => self.cap,
            PropOffset::Vs => self.vs as u64,
            PropOffset::Cc => self.cc as u64,
            PropOffset::Csts => self.csts as u64,
            PropOffset::Aqa => self.aqa as u64,
            PropOffset::Asq => self.asq,
            PropOffset::Acq => self.acq,
        }
    }
}

const _: () = assert!(core::mem::size_of::<ConnectCmd>() == 64);
const _: () = assert!(core::mem::size_of::<PropertyGetCmd>() == 64);
const _: () = assert!(core::mem::size_of::<PropertySetCmd>() == 64);
const _: () = assert!(core::mem::size_of::<ConnectData>() == CONNECT_DATA_LEN);
