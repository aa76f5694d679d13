//! Synchronous transfer negotiation
//!
//! Per-target transfer parameters are kept as the chip register encoding,
//! the packed selection word, and a tiny reprogram snippet the script
//! executes on reselection to restore the registers for that target.

use arrayvec::ArrayVec;

use crate::chip::script::{ScriptInsn, SCRIPT_REG_SCNTL3, SCRIPT_REG_SXFER};

/// Clock scaling field of the synchronous control register
pub(crate) const SCNTL3_SCF_SHIFT: u8 = 4;
pub(crate) const SCNTL3_SCF_MASK: u8 = 0x70;

/// Period divisor field of the transfer register
pub(crate) const SXFER_TP_SHIFT: u8 = 5;

/// Clock divisors the chip can realize: (total divisor * 10, clock
/// scaling factor, transfer period field where period = (4 + tp) clocks)
pub(crate) const SYNC_DIVISORS: &[(u16, u8, u8)] = &[
    (40, 1, 0),
    (50, 1, 1),
    (60, 1, 2),
    (70, 1, 3),
    (75, 2, 1),
    (80, 1, 4),
    (90, 1, 5),
    (100, 1, 6),
    (105, 2, 3),
    (110, 1, 7),
    (120, 2, 4),
    (135, 2, 5),
    (140, 3, 3),
    (150, 2, 6),
    (160, 3, 4),
    (165, 2, 7),
    (180, 3, 5),
    (200, 3, 6),
    (210, 4, 3),
    (220, 3, 7),
    (240, 4, 4),
    (270, 4, 5),
    (300, 4, 6),
    (330, 4, 7),
];

/// Negotiated settings for one target
#[derive(Debug, Clone)]
pub struct SyncParams {
    /// Transfer register encoding: offset and period divisor
    pub sxfer: u8,
    /// Clock scaling register encoding (revisions that carry one)
    pub scntl3: u8,
    /// Packed selection word the control area carries
    pub select_indirect: u32,
    /// Reprogram snippet the script runs on reselection by this target
    pub reprogram: ArrayVec<ScriptInsn, 4>,
    /// Granted period in nanoseconds; None is asynchronous
    pub period_ns: Option<u32>,
    pub offset: u8,
}

impl SyncParams {
    pub(crate) fn program(
        target: u8,
        sxfer: u8,
        scntl3: u8,
        has_scntl3: bool,
        period_ns: Option<u32>,
        offset: u8,
    ) -> Self {
        let select_indirect =
            (u32::from(scntl3) << 24) | (u32::from(target) << 16) | (u32::from(sxfer) << 8);
        let mut reprogram = ArrayVec::new();
        if has_scntl3 {
            reprogram.push(ScriptInsn::set_register(SCRIPT_REG_SCNTL3, scntl3));
        }
        reprogram.push(ScriptInsn::set_register(SCRIPT_REG_SXFER, sxfer));
        reprogram.push(ScriptInsn::ret());
        Self {
            sxfer,
            scntl3,
            select_indirect,
            reprogram,
            period_ns,
            offset,
        }
    }

    /// Asynchronous defaults for one target
    pub(crate) fn asynchronous(target: u8, saved_scntl3: u8, has_scntl3: bool) -> Self {
        let scntl3 = if has_scntl3 { saved_scntl3 } else { 0 };
        Self::program(target, 0, scntl3, has_scntl3, None, 0)
    }
}

/// Result of the SDTR arithmetic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Negotiated {
    /// Granted period in units of 4ns, as carried in the message
    pub period_x4: u8,
    pub offset: u8,
    pub sxfer: u8,
    pub scntl3: u8,
}

impl Negotiated {
    pub fn is_async(&self) -> bool {
        self.offset == 0
    }

    pub fn period_ns(&self) -> Option<u32> {
        if self.offset == 0 {
            None
        } else {
            Some(u32::from(self.period_x4) * 4)
        }
    }
}

/// Answer a synchronous transfer request such that the granted offset is
/// no more than requested (and no more than the hardware can track) and
/// the granted period is no shorter than requested. A zero offset, or a
/// period the chip cannot divide down to, falls back to asynchronous.
pub(crate) fn negotiate(
    scsi_clock: u32,
    req_period_x4: u8,
    req_offset: u8,
    max_offset: u8,
    saved_scntl3: u8,
    has_scntl3: bool,
) -> Negotiated {
    let fallback_scntl3 = if has_scntl3 { saved_scntl3 } else { 0 };
    let asynchronous = Negotiated {
        period_x4: req_period_x4,
        offset: 0,
        sxfer: 0,
        scntl3: fallback_scntl3,
    };

    let offset = req_offset.min(max_offset);
    if offset == 0 || req_period_x4 == 0 {
        return asynchronous;
    }

    // Desired transfer clock in Hz, then the total divisor scaled by ten
    let desire = 1_000_000_000u64 / (u64::from(req_period_x4) * 4);
    let divisor = u64::from(scsi_clock) * 10 / desire;

    let (last_div, _, _) = SYNC_DIVISORS[SYNC_DIVISORS.len() - 1];
    if divisor > u64::from(last_div) {
        // Slower than the largest divisor the chip realizes
        return asynchronous;
    }

    let mut index = 0;
    while index < SYNC_DIVISORS.len() - 1 && divisor > u64::from(SYNC_DIVISORS[index].0) {
        index += 1;
    }
    let (div, scf, tp) = SYNC_DIVISORS[index];

    let granted_x4 =
        ((1_000_000_000u64 / u64::from(scsi_clock)) * u64::from(div) / 10 / 4).min(255) as u8;

    let scntl3 = if has_scntl3 {
        (saved_scntl3 & !SCNTL3_SCF_MASK) | (scf << SCNTL3_SCF_SHIFT)
    } else {
        0
    };
    let sxfer = offset | (tp << SXFER_TP_SHIFT);

    Negotiated {
        period_x4: granted_x4,
        offset,
        sxfer,
        scntl3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLOCK: u32 = 50_000_000;

    #[test]
    fn test_divisor_table_is_sorted() {
        for pair in SYNC_DIVISORS.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
    }

    #[test]
    fn test_exact_divisor_grants_requested_period() {
        // 200ns period at 50MHz is a divisor of exactly 10.0
        let n = negotiate(CLOCK, 50, 8, 8, 0x03, true);
        assert_eq!(n.period_x4, 50);
        assert_eq!(n.offset, 8);
        // tp 6, offset 8
        assert_eq!(n.sxfer, 8 | (6 << SXFER_TP_SHIFT));
        assert_eq!(n.period_ns(), Some(200));
    }

    #[test]
    fn test_period_rounds_up_never_down() {
        // 132ns requested; the chip realizes 140ns next
        let n = negotiate(CLOCK, 33, 4, 8, 0, false);
        assert!(n.period_x4 >= 33);
        assert_eq!(n.period_x4, 35);
        assert_eq!(n.offset, 4);
    }

    #[test]
    fn test_offset_clamped_to_hardware() {
        let n = negotiate(CLOCK, 50, 15, 8, 0, false);
        assert_eq!(n.offset, 8);
        assert!(n.offset <= 15);
    }

    #[test]
    fn test_zero_offset_is_asynchronous() {
        let n = negotiate(CLOCK, 50, 0, 8, 0x03, true);
        assert!(n.is_async());
        assert_eq!(n.sxfer, 0);
        assert_eq!(n.scntl3, 0x03);
        assert_eq!(n.period_ns(), None);
    }

    #[test]
    fn test_period_beyond_table_falls_back_to_async() {
        // 1020ns requested: divisor 510 exceeds the largest entry (330)
        let n = negotiate(CLOCK, 255, 8, 8, 0, false);
        assert!(n.is_async());
    }

    #[test]
    fn test_scntl3_keeps_ccf_bits() {
        let n = negotiate(CLOCK, 50, 8, 8, 0x03, true);
        assert_eq!(n.scntl3 & !SCNTL3_SCF_MASK, 0x03);
        assert_eq!((n.scntl3 & SCNTL3_SCF_MASK) >> SCNTL3_SCF_SHIFT, 1);
    }

    #[test]
    fn test_select_indirect_packing() {
        let p = SyncParams::program(3, 0xc8, 0x13, true, Some(200), 8);
        assert_eq!(p.select_indirect, 0x1303_c800);
        // scntl3 write, sxfer write, return
        assert_eq!(p.reprogram.len(), 3);
        assert_eq!(*p.reprogram.last().unwrap(), ScriptInsn::ret());
    }

    #[test]
    fn test_async_params_have_no_rate() {
        let p = SyncParams::asynchronous(2, 0x03, true);
        assert_eq!(p.sxfer, 0);
        assert_eq!(p.period_ns, None);
        assert_eq!(p.select_indirect, 0x0302_0000);
        assert_eq!(p.reprogram.len(), 3);
    }
}
