// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Log page identifiers and payload layouts.

use zerocopy::{
    FromBytes as ZFromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, LittleEndian,
    U16, U32, U64,
};

/// Log page IDs the admin path serves.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPageId {
    Error = 0x01,
    Health = 0x02,
    Firmware = 0x03,
    ChangedNsList = 0x04,
    CommandEffects = 0x05,
    Ana = 0x0C,
    Discovery = 0x70,
    ReservationNotification = 0x80,
}

impl LogPageId {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x01 => Self::Error,
            0x02 => Self::Health,
            0x03 => Self::Firmware,
            0x04 => Self::ChangedNsList,
            0x05 => Self::CommandEffects,
            0x0C => Self::Ana,
            0x70 => Self::Discovery,
            0x80 => Self::ReservationNotification,
            _ => return None,
        })
    }
}

/// Error Information entry; the ring holds `ELPE + 1` of these.
pub const ERROR_LOG_ENTRY_LEN: usize = 64;
pub const ERROR_LOG_ENTRIES: usize = 128;

/// SMART / Health Information page (512 bytes).
#[repr(C)]
#[derive(Clone, Copy, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct HealthLog {
    pub critical_warning: u8,            // 0
    pub composite_temp: U16<LittleEndian>, // 1..3 (kelvin)
    pub available_spare: u8,             // 3
    pub available_spare_threshold: u8,   // 4
    pub percentage_used: u8,             // 5
    reserved6: [u8; 26],                 // 6..32
    pub data_units_read: [u8; 16],       // 32..48
    pub data_units_written: [u8; 16],    // 48..64
    pub host_read_commands: [u8; 16],    // 64..80
    pub host_write_commands: [u8; 16],   // 80..96
    pub controller_busy_time: [u8; 16],  // 96..112
    pub power_cycles: [u8; 16],          // 112..128
    pub power_on_hours: [u8; 16],        // 128..144
    pub unsafe_shutdowns: [u8; 16],      // 144..160
    pub media_errors: [u8; 16],          // 160..176
    pub num_error_info_log_entries: [u8; 16], // 176..192
    reserved192: [u8; 320],              // 192..512
}

impl Default for HealthLog {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

/// Firmware Slot Information page (512 bytes).
#[repr(C)]
#[derive(Clone, Copy, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FirmwareLog {
    pub afi: u8,           // 0 (active firmware info: slot 1 running)
    reserved1: [u8; 7],    // 1..8
    pub frs: [[u8; 8]; 7], // 8..64 (revision per slot)
    reserved64: [u8; 448], // 64..512
}

impl Default for FirmwareLog {
    fn default() -> Self {
        let mut log = Self::new_zeroed();
        log.afi = 0x01;
        log
    }
}

/// Commands Supported and Effects page is 4096 bytes: 256 admin + 256 I/O
/// entries. Bit 0 of an entry: command supported.
pub const EFFECTS_LOG_LEN: usize = 4096;
pub const EFFECTS_CSUPP: u32 = 1 << 0;

/// Changed Namespace List page: up to 1024 nsids, 0xFFFFFFFF as the
/// overflow sentinel in the first slot.
pub const CHANGED_NS_LIST_MAX: usize = 1024;
pub const CHANGED_NS_OVERFLOW: u32 = 0xFFFF_FFFF;

/// ANA log page header.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct AnaLogHeader {
    pub change_count: U64<LittleEndian>, // 0..8
    pub num_group_desc: U16<LittleEndian>, // 8..10
    reserved: [u8; 6],                   // 10..16
}

/// ANA group descriptor header; `nnsids` little-endian u32 nsids follow.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct AnaGroupDescriptor {
    pub anagrpid: U32<LittleEndian>,     // 0..4
    pub num_nsids: U32<LittleEndian>,    // 4..8
    pub change_count: U64<LittleEndian>, // 8..16
    pub ana_state: u8,                   // 16 (low nibble)
    reserved: [u8; 15],                  // 17..32
}

/// Reservation Notification log page (64 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ReservationNotificationLog {
    pub log_page_count: U64<LittleEndian>, // 0..8
    pub log_page_type: u8,                 // 8
    pub num_available: u8,                 // 9
    reserved10: [u8; 2],                   // 10..12
    pub nsid: U32<LittleEndian>,           // 12..16
    reserved16: [u8; 48],                  // 16..64
}

impl Default for ReservationNotificationLog {
    fn default() -> Self {
        Self {
            log_page_count: U64::<LittleEndian>::default(),
            log_page_type: 0,
            num_available: 0,
            reserved10: [0; 2],
            nsid: U32::<LittleEndian>::default(),
            reserved16: [0; 48],
        }
    }
}

/// Reservation notification types.
pub const RESV_NOTIFY_EMPTY: u8 = 0x0;
pub const RESV_NOTIFY_REGISTRATION_PREEMPTED: u8 = 0x1;
pub const RESV_NOTIFY_RESERVATION_RELEASED: u8 = 0x2;
pub const RESV_NOTIFY_RESERVATION_PREEMPTED: u8 = 0x3;

/// Discovery log page header (1024 bytes), followed by 1024-byte entries.
#[repr(C)]
#[derive(Clone, Copy, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct DiscoveryLogHeader {
    pub genctr: U64<LittleEndian>, // 0..8
    pub numrec: U64<LittleEndian>, // 8..16
    pub recfmt: U16<LittleEndian>, // 16..18
    reserved: [u8; 1006],          // 18..1024
}

impl Default for DiscoveryLogHeader {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

/// One discovery log entry (1024 bytes).
#[repr(C)]
#[derive(Clone, Copy, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct DiscoveryLogEntry {
    pub trtype: u8,                // 0 (3 = TCP)
    pub adrfam: u8,                // 1 (1 = IPv4, 2 = IPv6)
    pub subtype: u8,               // 2 (1 = discovery, 2 = NVM)
    pub treq: u8,                  // 3 (secure channel not required)
    pub portid: U16<LittleEndian>, // 4..6
    pub cntlid: U16<LittleEndian>, // 6..8 (0xFFFF = dynamic)
    pub asqsz: U16<LittleEndian>,  // 8..10
    reserved10: [u8; 22],          // 10..32
    pub trsvcid: [u8; 32],         // 32..64
    reserved64: [u8; 192],         // 64..256
    pub subnqn: [u8; 256],         // 256..512
    pub traddr: [u8; 256],         // 512..768
    pub tsas: [u8; 256],           // 768..1024
}

impl Default for DiscoveryLogEntry {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

pub const TRTYPE_TCP: u8 = 0x03;
pub const SUBTYPE_DISCOVERY: u8 = 0x01;
pub const SUBTYPE_NVME: u8 = 0x02;
pub const TREQ_SECURE_CHANNEL_NOT_REQUIRED: u8 = 0x02;

const _: () = assert!(core::mem::size_of::<HealthLog>() == 512);
const _: () = assert!(core::mem::size_of::<FirmwareLog>() == 512);
const _: () = assert!(core::mem::size_of::<AnaLogHeader>() == 16);
const _: () = assert!(core::mem::size_of::<AnaGroupDescriptor>() == 32);
const _: () = assert!(core::mem::size_of::<ReservationNotificationLog>() == 64);
const _: () = assert!(core::mem::size_of::<DiscoveryLogHeader>() == 1024);
const _: () = assert!(core::mem::size_of::<DiscoveryLogEntry>() == 1024);
