//! Operating register file of the script processor
//!
//! Bit layouts differ between family members; the logical registers and the
//! bits the driver actually consumes are uniform and defined here. A
//! [`ScriptProcessor`](crate::chip::io::ScriptProcessor) implementation maps
//! them onto the revision-specific offsets.

use proc_bitfield::bitfield;

/// Logical register index
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    /// Interrupt status / host signal
    Istat,
    /// DMA/script core status (unstacks on read)
    Dstat,
    /// SCSI event status (unstacks on read)
    Sist,
    /// SCSI FIFO latch flags and synchronous FIFO count
    Sfifo,
    /// Script instruction pointer
    Dsp,
    /// Operand of the last INT instruction
    Dsps,
    /// Shared-structure (control area) base of the active command
    Dsa,
    /// Fetched instruction: dcmd byte plus 24-bit transfer count
    Dbc,
    /// Next address pointer of the interrupted transfer
    Dnad,
    /// DMA FIFO byte offset counter
    Dfifo,
    /// Synchronous transfer period/offset
    Sxfer,
    /// SCSI control: bus reset line
    Scntl1,
    /// SCSI control: synchronous clock scaling
    Scntl3,
    /// SCSI bus control lines (phase readback)
    Sbcl,
    /// SCSI output control latch
    Socl,
    /// Chip test: DMA direction latch
    Ctest2,
    /// Chip test: FIFO flush/clear
    Ctest3,
    /// SCSI test: synchronous offset clear
    Stest2,
    /// Own SCSI id / reselection enable
    Scid,
    /// Reselection id mask
    Respid,
    /// SCSI interrupt enables
    Sien,
    /// DMA/script interrupt enables
    Dien,
    /// Selection timeout
    Stime,
    /// DMA control (single step, start)
    Dcntl,
}

bitfield! {
    /// Interrupt status register
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct RegIstat(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// DMA/script interrupt pending
        pub dip: bool @ 0,
        /// SCSI interrupt pending
        pub sip: bool @ 1,
        /// Immediate command completion (write one to clear)
        pub intf: bool @ 2,
        /// Connected to the bus
        pub con: bool @ 3,
        /// Signal the script to re-poll the schedule
        pub sigp: bool @ 5,
        /// Software reset
        pub srst: bool @ 6,
        /// Abort the current script operation
        pub abrt: bool @ 7,
    }
}

bitfield! {
    /// DMA/script core status register
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct RegDstat(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Illegal instruction detected
        pub iid: bool @ 0,
        /// Script INT instruction executed
        pub sir: bool @ 2,
        /// Single step
        pub ssi: bool @ 3,
        /// Abort acknowledged
        pub abrt: bool @ 4,
        /// Host bus fault
        pub bf: bool @ 5,
        /// Master data parity error
        pub mdpe: bool @ 6,
        /// DMA FIFO empty
        pub dfe: bool @ 7,
    }
}

bitfield! {
    /// SCSI event status register
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct RegSist(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Parity error on the SCSI bus
        pub par: bool @ 0,
        /// SCSI bus reset seen
        pub rst: bool @ 1,
        /// Unexpected disconnect
        pub udc: bool @ 2,
        /// Gross error (synchronous offset/FIFO violation)
        pub sge: bool @ 3,
        /// Reselected by a target
        pub sel: bool @ 4,
        /// Selection timeout
        pub sto: bool @ 5,
        /// Phase mismatch before a transfer instruction finished
        pub ma: bool @ 7,
    }
}

bitfield! {
    /// SCSI FIFO latch flags and synchronous FIFO count
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct RegSfifo(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Bytes resident in the synchronous FIFO
        pub ff: u8 @ 0..=3,
        /// Output latch full
        pub olf: bool @ 5,
        /// Output register full (synchronous send)
        pub orf: bool @ 6,
        /// Input latch full
        pub ilf: bool @ 7,
    }
}

bitfield! {
    /// Synchronous transfer register
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct RegSxfer(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Maximum synchronous offset; 0 selects asynchronous transfers
        pub mo: u8 @ 0..=3,
        /// Transfer period divisor (period = (4 + tp) clocks)
        pub tp: u8 @ 5..=7,
    }
}

bitfield! {
    /// SCSI bus control line readback
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct RegSbcl(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub phase_bits: u8 @ 0..=2,

        pub io: bool @ 0,
        pub cd: bool @ 1,
        pub msg: bool @ 2,
        /// Target requesting a transfer
        pub req: bool @ 7,
    }
}

bitfield! {
    /// Chip test register: DMA direction
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct RegCtest2(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// DMA direction: set when receiving from the SCSI bus
        pub ddir: bool @ 7,
    }
}

bitfield! {
    /// Chip test register: FIFO maintenance
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct RegCtest3(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Clear the DMA FIFO (send direction)
        pub clf: bool @ 2,
        /// Flush the DMA FIFO to memory (receive direction)
        pub flf: bool @ 3,
    }
}

bitfield! {
    /// SCSI control register one
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct RegScntl1(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Assert the SCSI RST line
        pub rst: bool @ 3,
    }
}

bitfield! {
    /// Own id / response id register
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct RegScid(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub id: u8 @ 0..=2,
        /// Respond to reselection
        pub rre: bool @ 6,
    }
}

bitfield! {
    /// SCSI test register two
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct RegStest2(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Reset the synchronous offset latch
        pub rof: bool @ 6,
    }
}

/// Mask for the DMA FIFO byte offset counter, also applied to the low
/// bits of the transfer count register when computing the datapath residual
pub const DFIFO_BO_MASK: u8 = 0x7f;
