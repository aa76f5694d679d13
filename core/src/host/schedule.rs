//! The schedule table shared with the script processor
//!
//! A fixed array of two-word slots the chip polls to find its next
//! command: either a skip placeholder or a jump into a CCB's control area.
//! The chip may be fetching any slot at any moment, so slot transitions go
//! through a single publish routine that writes the two words in the order
//! the chip revision requires, with a release fence between them.

use std::sync::atomic::{fence, Ordering};

use crate::chip::script::{ScriptAddr, ScriptInsn, DEAD_OPERAND, INSN_BYTES};

/// Shared-memory region holding the schedule slots
pub(crate) const SLOT_REGION_BASE: ScriptAddr = 0x000f_0000;

/// Bus address of a slot, used as the restore-to-placeholder pointer the
/// chip writes through when it picks the command up
pub(crate) fn slot_addr(index: usize) -> ScriptAddr {
    SLOT_REGION_BASE + index as u32 * INSN_BYTES
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slot {
    pub opcode: u32,
    pub operand: u32,
}

pub(crate) struct ScheduleTable {
    slots: Vec<Slot>,
    /// Instruction the chip falls through to after the last slot
    tail: ScriptInsn,
    operand_first: bool,
}

impl ScheduleTable {
    pub fn new(capacity: usize, operand_first: bool) -> Self {
        let skip = ScriptInsn::nop();
        Self {
            slots: vec![
                Slot {
                    opcode: skip.op,
                    operand: skip.arg,
                };
                capacity
            ],
            tail: ScriptInsn::nop(),
            operand_first,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_free(&self, index: usize) -> bool {
        self.slots[index].opcode == ScriptInsn::nop().op
    }

    /// First slot holding a skip placeholder
    pub fn find_free(&self) -> Option<usize> {
        (0..self.slots.len()).find(|&i| self.is_free(i))
    }

    pub fn operand(&self, index: usize) -> u32 {
        self.slots[index].operand
    }

    /// Arm a slot with a jump to a control-area entry point. Write order
    /// between operand and opcode words is part of the chip contract.
    pub fn publish(&mut self, index: usize, entry: ScriptAddr) {
        let armed = ScriptInsn::jump(entry);
        let operand_first = self.operand_first;
        let slot = &mut self.slots[index];
        if operand_first {
            slot.operand = armed.arg;
            fence(Ordering::Release);
            slot.opcode = armed.op;
        } else {
            slot.opcode = armed.op;
            fence(Ordering::Release);
            slot.operand = armed.arg;
        }
    }

    /// Return a slot to the skip placeholder. The opcode word goes first
    /// so the chip never fetches a placeholder with a live operand.
    pub fn clear(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.opcode = ScriptInsn::nop().op;
        fence(Ordering::Release);
        slot.operand = DEAD_OPERAND;
    }

    /// Armed slots and the entry points they reference
    pub fn armed(&self) -> Vec<(usize, ScriptAddr)> {
        (0..self.slots.len())
            .filter(|&i| !self.is_free(i))
            .map(|i| (i, self.slots[i].operand))
            .collect()
    }

    /// Reset every slot and point the fall-through at the given address
    pub fn reinit(&mut self, tail_to: ScriptAddr) {
        for i in 0..self.slots.len() {
            self.clear(i);
        }
        self.tail = ScriptInsn::jump(tail_to);
    }

    pub fn tail(&self) -> ScriptInsn {
        self.tail
    }
}
