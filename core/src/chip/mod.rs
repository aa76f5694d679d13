//! Script processor family: variants, capabilities and clock plumbing

pub mod io;
pub mod regs;
pub mod script;
pub mod testchip;

use serde::{Deserialize, Serialize};

/// Supported members of the script-processor family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr)]
pub enum ChipVariant {
    V700,
    V70066,
    V710,
    V720,
    V810,
    V815,
    V820,
    V825,
}

/// Revision differences the driver cares about, folded into flags
#[derive(Debug, Clone, Copy)]
pub struct ChipCaps {
    /// Completion raises an immediate-completion interrupt while the script
    /// keeps running; without it, completion is signaled by a script
    /// interrupt code
    pub intfly: bool,
    /// Carries a synchronous clock-scaling register that the select word
    /// and reprogram snippet must also set
    pub has_scntl3: bool,
    /// The halted command is identified through a host-maintained current
    /// command cell rather than the shared-structure address register
    pub single_current: bool,
    /// Schedule slot publish order: operand word before opcode word
    pub operand_first: bool,
    /// Synchronous offset ceiling
    pub max_offset: u8,
    /// Can reset the synchronous offset latch after a gross error
    pub offset_clear: bool,
    /// SCSI clock when the attach configuration does not override it
    pub default_clock_hz: u32,
}

impl ChipVariant {
    pub const fn caps(self) -> ChipCaps {
        match self {
            Self::V700 | Self::V70066 => ChipCaps {
                intfly: false,
                has_scntl3: false,
                single_current: true,
                // The earliest revision latches the opcode word first
                operand_first: matches!(self, Self::V70066),
                max_offset: 8,
                offset_clear: false,
                default_clock_hz: 25_000_000,
            },
            Self::V710 => ChipCaps {
                intfly: false,
                has_scntl3: false,
                single_current: false,
                operand_first: true,
                max_offset: 8,
                offset_clear: false,
                default_clock_hz: 33_000_000,
            },
            Self::V720 => ChipCaps {
                intfly: true,
                has_scntl3: false,
                single_current: false,
                operand_first: true,
                max_offset: 8,
                offset_clear: false,
                default_clock_hz: 50_000_000,
            },
            Self::V810 | Self::V815 | Self::V820 | Self::V825 => ChipCaps {
                intfly: true,
                has_scntl3: true,
                single_current: false,
                operand_first: true,
                max_offset: 8,
                offset_clear: true,
                default_clock_hz: 50_000_000,
            },
        }
    }
}

/// Largest SCSI clock allowable for a clock conversion factor. Taking the
/// largest means synchronous periods come out at least as long as the
/// device asked for when the actual clock is unknown.
pub const fn ccf_to_clock(ccf: u8) -> Option<u32> {
    match ccf {
        1 => Some(25_000_000),
        2 => Some(37_500_000),
        3 => Some(50_000_000),
        0 | 4 => Some(66_000_000),
        _ => None,
    }
}

/// Clock conversion factor for a given SCSI clock in Hz
pub const fn clock_to_ccf(clock: u32) -> Option<u8> {
    if clock < 16_666_666 {
        None
    } else if clock < 25_000_000 {
        Some(1)
    } else if clock < 37_500_000 {
        Some(2)
    } else if clock < 50_000_000 {
        Some(3)
    } else if clock < 66_000_000 {
        Some(4)
    } else {
        None
    }
}
