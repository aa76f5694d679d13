//! Script instruction words, entry points and bus phase encodings
//!
//! The script processor executes a fixed program out of shared memory; the
//! host never rewrites that program at runtime. Everything the host *does*
//! patch (schedule slots, per-command transfer descriptors, the residual
//! recovery area, the per-target synchronous reprogram snippet) is built
//! from the typed instruction words defined here.

use num_derive::{FromPrimitive, ToPrimitive};

/// Bus-visible address of a script or shared-structure location
pub type ScriptAddr = u32;

/// Size of one instruction in bytes (dcmd+count word, address word)
pub const INSN_BYTES: u32 = 8;

// dcmd encodings. The high byte of the first instruction word selects the
// operation; the remaining 24 bits carry the transfer count or condition.
pub const DCMD_TYPE_MASK: u8 = 0xc0;
pub const DCMD_TYPE_BMI: u8 = 0x00;
pub const DCMD_TYPE_RWRI: u8 = 0x40;
pub const DCMD_TYPE_TCI: u8 = 0x80;
pub const DCMD_TYPE_MMI: u8 = 0xc0;

pub const DCMD_BMI_OP_MASK: u8 = 0x38;
/// Table-indirect block move
pub const DCMD_BMI_OP_MOVE_I: u8 = 0x28;
pub const DCMD_BMI_MSG: u8 = 0x04;
pub const DCMD_BMI_CD: u8 = 0x02;
pub const DCMD_BMI_IO: u8 = 0x01;

pub const DCMD_TCI_OP_MASK: u8 = 0x38;
pub const DCMD_TCI_OP_JUMP: u8 = 0x00;
pub const DCMD_TCI_OP_CALL: u8 = 0x08;
pub const DCMD_TCI_OP_RETURN: u8 = 0x10;
pub const DCMD_TCI_OP_INT: u8 = 0x18;
pub const DCMD_TCI_IO: u8 = 0x01;

pub const DCMD_RWRI_OPC_MODIFY: u8 = 0x20;
pub const DCMD_RWRI_OP_MOVE: u8 = 0x18;

/// dcmd of the wait-disconnect instruction, matched when classifying the
/// reselection-before-wait-disconnect race
pub const DCMD_WAIT_DISCONNECT: u8 = 0x48;

pub const DBC_TCI_WAIT_FOR_VALID: u32 = 0x0001_0000;
pub const DBC_TCI_COMPARE_PHASE: u32 = 0x0002_0000;
pub const DBC_TCI_TRUE: u32 = 0x0008_0000;

/// Operand placed in unarmed schedule slots and other dead address words
pub const DEAD_OPERAND: u32 = 0xdead_beef;

/// Script-visible register indexes used by the reprogram snippet
pub const SCRIPT_REG_SCNTL3: u8 = 0x03;
pub const SCRIPT_REG_SXFER: u8 = 0x05;

/// SCSI bus phases as encoded on the MSG/CD/IO lines
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, strum::IntoStaticStr,
)]
pub enum ScsiPhase {
    DataOut = 0,
    DataIn = 1,
    Command = 2,
    Status = 3,
    MsgOut = 6,
    MsgIn = 7,
}

impl ScsiPhase {
    /// Data phase for the given transfer direction
    pub const fn data(input: bool) -> Self {
        if input {
            Self::DataIn
        } else {
            Self::DataOut
        }
    }
}

/// Enumerated codes raised by INT instructions at fixed points in the
/// script. Values outside this set are fatal to the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum SirCode {
    /// A one-byte message landed in the message buffer
    MsgReceived = 0x01,
    /// A synchronous transfer request landed in the message buffer
    SdtrReceived = 0x02,
    /// A wide transfer request landed in the message buffer
    WdtrReceived = 0x03,
    /// Target changed to an unexpected phase inside a handler
    UnexpectedPhase = 0x04,
    /// Another initiator selected us
    Selected = 0x05,
    /// A target reselected us outside the reconnect bookkeeping
    UnexpectedReselect = 0x06,
    /// Command finished with CHECK CONDITION status
    CheckCondition = 0x10,
    /// The abort handler finished breaking the nexus
    Aborted = 0x20,
    /// Command completion marker for revisions without an
    /// immediate-completion interrupt
    Completed = 0x21,
    /// Target disconnected after saving data pointers
    Disconnected = 0x30,
    /// Reconnect bookkeeping matched a disconnected command
    Reselected = 0x31,
    /// Breakpoint INT left in the script for debugging
    DebugBreak = 0x40,
    /// First self-test section passed
    SelfTest1 = 0x50,
    /// Second self-test section passed
    SelfTest2 = 0x51,
}

/// SCSI message bytes
pub mod msg {
    pub const COMMAND_COMPLETE: u8 = 0x00;
    pub const EXTENDED: u8 = 0x01;
    pub const SAVE_POINTERS: u8 = 0x02;
    pub const RESTORE_POINTERS: u8 = 0x03;
    pub const DISCONNECT: u8 = 0x04;
    pub const REJECT: u8 = 0x07;
    pub const INITIATE_RECOVERY: u8 = 0x0f;
    pub const IDENTIFY: u8 = 0x80;
    pub const IDENTIFY_DISCONNECT: u8 = 0x40;

    pub const EXT_SDTR: u8 = 0x01;
    pub const EXT_WDTR: u8 = 0x03;
}

/// One script instruction: dcmd/count word plus address word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScriptInsn {
    pub op: u32,
    pub arg: u32,
}

impl ScriptInsn {
    /// Never-taken jump; the script skips over these
    pub const fn nop() -> Self {
        Self {
            op: ((DCMD_TYPE_TCI | DCMD_TCI_OP_JUMP) as u32) << 24,
            arg: DEAD_OPERAND,
        }
    }

    /// Unconditional jump
    pub const fn jump(to: ScriptAddr) -> Self {
        Self {
            op: (((DCMD_TYPE_TCI | DCMD_TCI_OP_JUMP) as u32) << 24) | DBC_TCI_TRUE,
            arg: to,
        }
    }

    /// Call `to` when the bus settles on `phase`
    pub const fn call_when(phase: ScsiPhase, to: ScriptAddr) -> Self {
        Self {
            op: (((DCMD_TYPE_TCI | DCMD_TCI_OP_CALL) as u32 | phase as u32) << 24)
                | DBC_TCI_WAIT_FOR_VALID
                | DBC_TCI_COMPARE_PHASE,
            arg: to,
        }
    }

    /// Table-indirect block move of `count` bytes at `addr`
    pub const fn block_move(count: u32, addr: ScriptAddr, input: bool) -> Self {
        let io = if input { DCMD_BMI_IO } else { 0 };
        Self {
            op: (((DCMD_TYPE_BMI | DCMD_BMI_OP_MOVE_I | io) as u32) << 24) | (count & 0x00ff_ffff),
            arg: addr,
        }
    }

    /// Write an immediate value into a chip register
    pub const fn set_register(reg: u8, val: u8) -> Self {
        Self {
            op: (((DCMD_TYPE_RWRI | DCMD_RWRI_OPC_MODIFY | DCMD_RWRI_OP_MOVE) as u32) << 24)
                | ((reg as u32) << 16)
                | ((val as u32) << 8),
            arg: 0,
        }
    }

    /// Return from the innermost script CALL
    pub const fn ret() -> Self {
        Self {
            op: (((DCMD_TYPE_TCI | DCMD_TCI_OP_RETURN) as u32) << 24) | DBC_TCI_TRUE,
            arg: 0,
        }
    }

    pub const fn dcmd(&self) -> u8 {
        (self.op >> 24) as u8
    }

    pub const fn count(&self) -> u32 {
        self.op & 0x00ff_ffff
    }

    /// Is this an interruptible multi-byte block move the residual recovery
    /// path knows how to split?
    pub const fn recoverable_move(dcmd: u8) -> bool {
        (dcmd & (DCMD_TYPE_MASK | DCMD_BMI_OP_MASK | DCMD_BMI_MSG | DCMD_BMI_CD))
            == (DCMD_TYPE_BMI | DCMD_BMI_OP_MOVE_I)
    }
}

/// Instruction length in words; memory-to-memory moves carry a third word
pub const fn insn_size_words(dcmd: u8) -> u32 {
    if dcmd & DCMD_TYPE_MASK == DCMD_TYPE_MMI {
        3
    } else {
        2
    }
}

/// Entry points of the fixed script program
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
pub enum Entry {
    /// Top of the schedule polling loop
    Schedule,
    /// Arbitrate and select the target of the active control area
    Select,
    /// Message-out bytes following a selection
    SelectMsgout,
    /// Command-out phase
    Cmdout,
    /// Dispatch into the per-command transfer descriptors
    DataTransfer,
    EndDataTransfer,
    /// Non-data phase handling when no transfer descriptor matches
    OtherTransfer,
    /// Non-data handler entered from an interrupted receive
    OtherIn,
    /// Non-data handler entered from an interrupted send
    OtherOut,
    /// Message-in phase
    MsgIn,
    /// Acknowledge the message currently held in the message buffer
    AcceptMessage,
    /// Reject the message currently held in the message buffer
    RejectMessage,
    /// Send the reply staged in the control area message-out cells
    RespondMessage,
    /// Break the current nexus from the initiator side
    InitiatorAbort,
    /// Break the current nexus after being selected as a target
    TargetAbort,
    /// Idle wait for reselection
    WaitReselect,
    SelfTest1,
    SelfTest2,
}

/// Where the fixed program and its entry points live in bus space
#[derive(Debug, Clone, Copy)]
pub struct ScriptLayout {
    base: ScriptAddr,
}

/// Spacing between entry points in the fixed program
const ENTRY_STRIDE: u32 = 0x80;

/// Instructions between the selection entry and the end of its message-out
/// window, within which an illegal-instruction report is a selection
/// timeout artifact
const SELECT_WINDOW_INSNS: u32 = 8;

impl ScriptLayout {
    pub const fn new(base: ScriptAddr) -> Self {
        Self { base }
    }

    pub const fn addr(&self, entry: Entry) -> ScriptAddr {
        self.base + entry as u32 * ENTRY_STRIDE
    }

    /// Does `addr` fall inside the selection attempt, up to and including
    /// its message-out phase?
    pub const fn in_select_window(&self, addr: ScriptAddr) -> bool {
        addr >= self.addr(Entry::Select)
            && addr <= self.addr(Entry::SelectMsgout) + SELECT_WINDOW_INSNS * INSN_BYTES
    }
}
