// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Identify payloads (CNS 0/1/2/3).

use zerocopy::{
    FromBytes as ZFromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, LittleEndian,
    U16, U32, U64,
};

pub const IDENTIFY_LEN: usize = 4096;
/// Active-namespace list holds up to 1024 nsids.
pub const NS_LIST_MAX: usize = 1024;

/// CNS values handled by the admin path.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cns {
    Namespace = 0x00,
    Controller = 0x01,
    ActiveNsList = 0x02,
    NsDescriptorList = 0x03,
}

impl Cns {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::Namespace,
            0x01 => Self::Controller,
            0x02 => Self::ActiveNsList,
            0x03 => Self::NsDescriptorList,
            _ => return None,
        })
    }
}

/// One LBA format descriptor.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct LbaFormat {
    pub ms: U16<LittleEndian>, // 0..2 metadata size
    pub lbads: u8,             // 2 (log2 of the data size)
    pub rp: u8,                // 3 relative performance
}

/// Identify Namespace data structure (CNS 00h).
#[repr(C)]
#[derive(Clone, Copy, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct IdentifyNamespace {
    pub nsze: U64<LittleEndian>,     // 0..8
    pub ncap: U64<LittleEndian>,     // 8..16
    pub nuse: U64<LittleEndian>,     // 16..24
    pub nsfeat: u8,                  // 24
    pub nlbaf: u8,                   // 25 (0-based)
    pub flbas: u8,                   // 26
    pub mc: u8,                      // 27
    pub dpc: u8,                     // 28
    pub dps: u8,                     // 29
    pub nmic: u8,                    // 30
    pub rescap: u8,                  // 31
    pub fpi: u8,                     // 32
    pub dlfeat: u8,                  // 33
    pub nawun: U16<LittleEndian>,    // 34..36
    pub nawupf: U16<LittleEndian>,   // 36..38
    pub nacwu: U16<LittleEndian>,    // 38..40
    pub nabsn: U16<LittleEndian>,    // 40..42
    pub nabo: U16<LittleEndian>,     // 42..44
    pub nabspf: U16<LittleEndian>,   // 44..46
    pub noiob: U16<LittleEndian>,    // 46..48
    pub nvmcap: [u8; 16],            // 48..64
    reserved64: [u8; 28],            // 64..92
    pub anagrpid: U32<LittleEndian>, // 92..96
    reserved96: [u8; 3],             // 96..99
    pub nsattr: u8,                  // 99
    pub nvmsetid: U16<LittleEndian>, // 100..102
    pub endgid: U16<LittleEndian>,   // 102..104
    pub nguid: [u8; 16],             // 104..120
    pub eui64: [u8; 8],              // 120..128
    pub lbaf: [LbaFormat; 16],       // 128..192
    reserved192: [u8; 192],          // 192..384
    pub vs: [u8; 3712],              // 384..4096
}

impl Default for IdentifyNamespace {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

/// Identify Controller data structure (CNS 01h).
#[repr(C)]
#[derive(Clone, Copy, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct IdentifyController {
    pub vid: U16<LittleEndian>,        // 0..2
    pub ssvid: U16<LittleEndian>,      // 2..4
    pub sn: [u8; 20],                  // 4..24
    pub mn: [u8; 40],                  // 24..64
    pub fr: [u8; 8],                   // 64..72
    pub rab: u8,                       // 72
    pub ieee: [u8; 3],                 // 73..76
    pub cmic: u8,                      // 76 (bit0 multi-port, bit3 ANA reporting)
    pub mdts: u8,                      // 77
    pub cntlid: U16<LittleEndian>,     // 78..80
    pub ver: U32<LittleEndian>,        // 80..84
    pub rtd3r: U32<LittleEndian>,      // 84..88
    pub rtd3e: U32<LittleEndian>,      // 88..92
    pub oaes: U32<LittleEndian>,       // 92..96
    pub ctratt: U32<LittleEndian>,     // 96..100
    pub rrls: U16<LittleEndian>,       // 100..102
    reserved102: [u8; 9],              // 102..111
    pub cntrltype: u8,                 // 111
    pub fguid: [u8; 16],               // 112..128
    pub crdt1: U16<LittleEndian>,      // 128..130
    pub crdt2: U16<LittleEndian>,      // 130..132
    pub crdt3: U16<LittleEndian>,      // 132..134
    reserved134: [u8; 122],            // 134..256
    pub oacs: U16<LittleEndian>,       // 256..258
    pub acl: u8,                       // 258
    pub aerl: u8,                      // 259 (0-based)
    pub frmw: u8,                      // 260
    pub lpa: u8,                       // 261
    pub elpe: u8,                      // 262 (0-based)
    pub npss: u8,                      // 263
    pub avscc: u8,                     // 264
    pub apsta: u8,                     // 265
    pub wctemp: U16<LittleEndian>,     // 266..268
    pub cctemp: U16<LittleEndian>,     // 268..270
    pub mtfa: U16<LittleEndian>,       // 270..272
    pub hmpre: U32<LittleEndian>,      // 272..276
    pub hmmin: U32<LittleEndian>,      // 276..280
    pub tnvmcap: [u8; 16],             // 280..296
    pub unvmcap: [u8; 16],             // 296..312
    pub rpmbs: U32<LittleEndian>,      // 312..316
    pub edstt: U16<LittleEndian>,      // 316..318
    pub dsto: u8,                      // 318
    pub fwug: u8,                      // 319
    pub kas: U16<LittleEndian>,        // 320..322 (100 ms units)
    pub hctma: U16<LittleEndian>,      // 322..324
    pub mntmt: U16<LittleEndian>,      // 324..326
    pub mxtmt: U16<LittleEndian>,      // 326..328
    pub sanicap: U32<LittleEndian>,    // 328..332
    pub hmminds: U32<LittleEndian>,    // 332..336
    pub hmmaxd: U16<LittleEndian>,     // 336..338
    pub nsetidmax: U16<LittleEndian>,  // 338..340
    pub endgidmax: U16<LittleEndian>,  // 340..342
    pub anatt: u8,                     // 342
    pub anacap: u8,                    // 343
    pub anagrpmax: U32<LittleEndian>,  // 344..348
    pub nanagrpid: U32<LittleEndian>,  // 348..352
    reserved352: [u8; 160],            // 352..512
    pub sqes: u8,                      // 512 (min [3:0], max [7:4])
    pub cqes: u8,                      // 513
    pub maxcmd: U16<LittleEndian>,     // 514..516
    pub nn: U32<LittleEndian>,         // 516..520
    pub oncs: U16<LittleEndian>,       // 520..522
    pub fuses: U16<LittleEndian>,      // 522..524
    pub fna: u8,                       // 524
    pub vwc: u8,                       // 525
    pub awun: U16<LittleEndian>,       // 526..528
    pub awupf: U16<LittleEndian>,      // 528..530
    pub nvscc: u8,                     // 530
    pub nwpc: u8,                      // 531
    pub acwu: U16<LittleEndian>,       // 532..534
    reserved534: [u8; 2],              // 534..536
    pub sgls: U32<LittleEndian>,       // 536..540
    pub mnan: U32<LittleEndian>,       // 540..544
    reserved544: [u8; 224],            // 544..768
    pub subnqn: [u8; 256],             // 768..1024
    reserved1024: [u8; 768],           // 1024..1792
    pub ioccsz: U32<LittleEndian>,     // 1792..1796
    pub iorcsz: U32<LittleEndian>,     // 1796..1800
    pub icdoff: U16<LittleEndian>,     // 1800..1802
    pub ctrattr: u8,                   // 1802
    pub msdbd: u8,                     // 1803
    reserved1804: [u8; 244],           // 1804..2048
    pub psd: [u8; 1024],               // 2048..3072
    pub vs: [u8; 1024],                // 3072..4096
}

impl Default for IdentifyController {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

// ONCS capability bits mirrored from the bdev.
pub const ONCS_COMPARE: u16 = 1 << 0;
pub const ONCS_WRITE_UNCORRECTABLE: u16 = 1 << 1;
pub const ONCS_DSM: u16 = 1 << 2;
pub const ONCS_WRITE_ZEROES: u16 = 1 << 3;
pub const ONCS_RESERVATIONS: u16 = 1 << 5;

// FUSES bit 0: compare-and-write supported.
pub const FUSES_COMPARE_AND_WRITE: u16 = 1 << 0;

// CMIC bits.
pub const CMIC_MULTI_PORT: u8 = 1 << 0;
pub const CMIC_ANA_REPORTING: u8 = 1 << 3;

// SGLS dword: supported (dword-aligned), keyed SGL, SGL offset.
pub const SGLS_SUPPORTED: u32 = 1;
pub const SGLS_KEYED: u32 = 1 << 2;
pub const SGLS_OFFSET: u32 = 1 << 20;

/// Namespace identification descriptor types (CNS 03h TLVs).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsIdType {
    Eui64 = 0x01,
    Nguid = 0x02,
    Uuid = 0x03,
}

impl NsIdType {
    pub const fn len(self) -> usize {
        match self {
            Self::Eui64 => 8,
            Self::Nguid => 16,
            Self::Uuid => 16,
        }
    }
}

/// Append one typed descriptor to a CNS 03h payload.
pub fn push_ns_descriptor(out: &mut Vec<u8>, nidt: NsIdType, nid: &[u8]) {
    debug_assert_eq!(nid.len(), nidt.len());
    out.push(nidt as u8);
    out.push(nid.len() as u8);
    out.extend_from_slice(&[0u8; 2]);
    out.extend_from_slice(nid);
}

const _: () = assert!(core::mem::size_of::<IdentifyNamespace>() == IDENTIFY_LEN);
const _: () = assert!(core::mem::size_of::<IdentifyController>() == IDENTIFY_LEN);
