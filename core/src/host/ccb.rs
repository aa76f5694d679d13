//! Command control blocks and their arena
//!
//! One CCB pairs an in-flight request with the control area the script
//! processor walks to run it. CCBs live in a handle-indexed arena; a
//! membership tag on each makes "where is this command" a single lookup
//! instead of a hunt through three linked structures.

use arrayvec::ArrayVec;

use super::request::{DataSegment, Request, RequestId};
use crate::chip::script::{Entry, ScriptAddr, ScriptInsn, ScriptLayout, INSN_BYTES};

/// Value of the status/message capture cells while the chip still owns the
/// command; both cells turning valid is the completion signal
pub const RESULT_SENTINEL: u8 = 0xff;

pub const MAX_TARGETS: usize = 16;
pub const MAX_LUNS: usize = 8;

/// Bytes fetched by an automatic sense request
pub const SENSE_FETCH_LEN: u32 = 16;

/// Shared-memory region carved up into per-CCB control areas
pub(crate) const CCB_REGION_BASE: ScriptAddr = 0x0010_0000;
pub(crate) const CCB_STRIDE: u32 = 0x400;
const OFF_DATA: u32 = 0x80;
const OFF_RESIDUAL: u32 = 0x380;

/// Transfer descriptors that fit between the data and residual areas
pub(crate) const MAX_DATA_INSNS: usize = ((OFF_RESIDUAL - OFF_DATA) / INSN_BYTES) as usize;

/// Arena handle of a CCB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CcbId(pub(crate) usize);

/// Exactly one place a CCB can be at any time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Membership {
    /// In the free pool
    Free,
    /// In the admission queue, not yet visible to the chip
    Queued,
    /// Published in the given schedule slot
    Slotted(usize),
    /// Picked up by the chip; the slot has been returned to a placeholder
    Running,
    /// Target disconnected; awaiting reselection
    Disconnected,
}

impl Membership {
    /// Has this command been handed to the chip and not yet retired?
    pub(crate) fn dispatched(self) -> bool {
        matches!(self, Self::Slotted(_) | Self::Running | Self::Disconnected)
    }
}

/// Host-side view of where a nexus is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
pub(crate) enum NexusState {
    Selecting,
    DataPhase,
    NonDataPhase,
    Disconnected,
    Reconnecting,
    Completing,
}

/// The coprocessor-visible half of a CCB. The chip reads these cells
/// through its fixed program; the host writes them only while the chip is
/// confirmed halted or before the slot is published.
#[derive(Debug)]
pub(crate) struct ControlArea {
    /// Packed selection word: clock scaling, target id, synchronous params
    pub select: u32,
    /// Selection message: identify byte plus optional negotiation
    pub msgout: ArrayVec<u8, 12>,
    /// Staged reply for message exchanges started by the target
    pub msgout_other: ArrayVec<u8, 8>,
    /// Command descriptor block sent in command-out phase
    pub cmdout: ArrayVec<u8, 16>,
    /// Per-phase transfer descriptors (data-in first, then data-out)
    pub data: Vec<ScriptInsn>,
    /// Where the script dispatches on a data-in phase
    pub datain_entry: ScriptAddr,
    /// Where the script dispatches on a data-out phase
    pub dataout_entry: ScriptAddr,
    /// Status byte capture cell
    pub status: u8,
    /// Command-complete message capture cell
    pub msgin: u8,
    /// Reconnect chain link maintained by the chip; 0 terminates
    pub next: u32,
    /// Slot the chip restores to a placeholder when it starts this command
    pub jump_dest: ScriptAddr,
    /// Where a RESTORE POINTERS message rewinds the transfer to
    pub saved_data_pointer: ScriptAddr,
    /// Patch area for splitting an interrupted block move
    pub residual: [ScriptInsn; 3],
}

impl ControlArea {
    fn new() -> Self {
        Self {
            select: 0,
            msgout: ArrayVec::new(),
            msgout_other: ArrayVec::new(),
            cmdout: ArrayVec::new(),
            data: vec![],
            datain_entry: 0,
            dataout_entry: 0,
            status: RESULT_SENTINEL,
            msgin: RESULT_SENTINEL,
            next: 0,
            jump_dest: 0,
            saved_data_pointer: 0,
            residual: [ScriptInsn::nop(); 3],
        }
    }

    /// Both capture cells hold chip-written values
    pub fn result_valid(&self) -> bool {
        self.status != RESULT_SENTINEL && self.msgin != RESULT_SENTINEL
    }
}

pub(crate) struct Ccb {
    pub id: CcbId,
    /// Bus address of this control area
    pub base: ScriptAddr,
    pub ctrl: ControlArea,
    pub membership: Membership,
    pub nexus: NexusState,
    pub request: Option<Request>,
    /// We put an SDTR in the selection message and await the response
    pub sdtr_sent: bool,
    /// Negotiation settled during this command
    pub did_sdtr: bool,
    /// Flagged by an abort call; reclaimed when the chip reports in
    pub abort_requested: bool,
    /// Rewritten into an automatic REQUEST SENSE after CHECK CONDITION
    pub is_sense: bool,
}

impl Ccb {
    fn new(id: CcbId, base: ScriptAddr) -> Self {
        Self {
            id,
            base,
            ctrl: ControlArea::new(),
            membership: Membership::Free,
            nexus: NexusState::Selecting,
            request: None,
            sdtr_sent: false,
            did_sdtr: false,
            abort_requested: false,
            is_sense: false,
        }
    }

    /// Where a schedule slot jump lands for this command
    pub fn entry_addr(&self) -> ScriptAddr {
        self.base
    }

    pub fn data_start(&self) -> ScriptAddr {
        self.base + OFF_DATA
    }

    pub fn data_end(&self) -> ScriptAddr {
        self.data_start() + self.ctrl.data.len() as u32 * INSN_BYTES
    }

    pub fn in_data_region(&self, addr: ScriptAddr) -> bool {
        addr >= self.data_start() && addr < self.data_end()
    }

    pub fn residual_addr(&self) -> ScriptAddr {
        self.base + OFF_RESIDUAL
    }

    pub fn request_id(&self) -> Option<RequestId> {
        self.request.as_ref().map(|r| r.id)
    }

    /// Clear per-flight state before the control area is rebuilt
    pub fn reset_for_build(&mut self) {
        self.ctrl = ControlArea::new();
        self.nexus = NexusState::Selecting;
        self.sdtr_sent = false;
        self.did_sdtr = false;
        self.abort_requested = false;
        self.is_sense = false;
    }
}

/// Transfer descriptors for one direction: a guarded non-data call and a
/// block move per segment, then a jump back to the shared handler
pub(crate) fn build_data_insns(
    segments: &[DataSegment],
    input: bool,
    layout: &ScriptLayout,
) -> Vec<ScriptInsn> {
    use crate::chip::script::ScsiPhase;

    let other = layout.addr(if input { Entry::OtherIn } else { Entry::OtherOut });
    let mut insns = Vec::with_capacity(segments.len() * 2 + 1);
    for seg in segments {
        insns.push(ScriptInsn::call_when(ScsiPhase::data(input), other));
        insns.push(ScriptInsn::block_move(seg.len, seg.addr, input));
    }
    insns.push(ScriptInsn::jump(layout.addr(Entry::OtherTransfer)));
    insns
}

/// Arena of CCBs. Grown lazily: the first command for a target/lun
/// schedules `cmd_per_lun` more blocks, bounded by the adapter's command
/// ceiling. Freed blocks are reused most-recently-freed first.
pub(crate) struct CcbPool {
    ccbs: Vec<Ccb>,
    free: Vec<CcbId>,
    ceiling: usize,
    /// Bit per lun, set once blocks were reserved for that nexus
    reserved: [u8; MAX_TARGETS],
    /// Scheduled growth not yet materialized
    pending_grow: usize,
}

impl CcbPool {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ccbs: vec![],
            free: vec![],
            ceiling,
            reserved: [0; MAX_TARGETS],
            pending_grow: 0,
        }
    }

    /// Draw a CCB for the given nexus, growing the arena on its first use
    pub fn allocate(&mut self, target: u8, lun: u8, per_lun: usize) -> Option<CcbId> {
        let row = target as usize % MAX_TARGETS;
        let bit = 1u8 << (lun as usize % MAX_LUNS);
        if self.reserved[row] & bit == 0 {
            if self.pending_grow + self.ccbs.len() < self.ceiling {
                self.pending_grow += per_lun;
            }
            self.reserved[row] |= bit;
        }
        while self.pending_grow > 0 && self.ccbs.len() < self.ceiling {
            let id = CcbId(self.ccbs.len());
            let base = CCB_REGION_BASE + id.0 as u32 * CCB_STRIDE;
            self.ccbs.push(Ccb::new(id, base));
            self.free.push(id);
            self.pending_grow -= 1;
        }
        let id = self.free.pop()?;
        self.ccbs[id.0].membership = Membership::Queued;
        Some(id)
    }

    /// Return a CCB to the free pool. The request must have been taken out
    /// and completed first.
    pub fn release(&mut self, id: CcbId) {
        let ccb = &mut self.ccbs[id.0];
        debug_assert!(ccb.request.is_none());
        ccb.membership = Membership::Free;
        self.free.push(id);
    }

    pub fn get(&self, id: CcbId) -> &Ccb {
        &self.ccbs[id.0]
    }

    pub fn get_mut(&mut self, id: CcbId) -> &mut Ccb {
        &mut self.ccbs[id.0]
    }

    pub fn size(&self) -> usize {
        self.ccbs.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// CCB whose control area starts at the given bus address
    pub fn by_base(&self, addr: ScriptAddr) -> Option<CcbId> {
        self.ccbs
            .iter()
            .find(|c| c.base == addr && c.membership != Membership::Free)
            .map(|c| c.id)
    }

    /// CCB whose schedule entry point is the given bus address
    pub fn by_entry(&self, addr: ScriptAddr) -> Option<CcbId> {
        self.by_base(addr)
    }

    /// CCB currently carrying the given request
    pub fn by_request(&self, id: RequestId) -> Option<CcbId> {
        self.ccbs
            .iter()
            .find(|c| c.membership != Membership::Free && c.request_id() == Some(id))
            .map(|c| c.id)
    }

    /// The free list and the membership tags agree, and nothing is lost:
    /// free + accounted-for equals the arena size
    pub fn consistent(&self) -> bool {
        let tagged_free = self
            .ccbs
            .iter()
            .filter(|c| c.membership == Membership::Free)
            .count();
        tagged_free == self.free.len()
            && self
                .free
                .iter()
                .all(|id| self.ccbs[id.0].membership == Membership::Free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::script::ScriptLayout;

    #[test]
    fn test_pool_grows_lazily_per_nexus() {
        let mut pool = CcbPool::new(4);
        assert_eq!(pool.size(), 0);

        let a = pool.allocate(0, 0, 2).unwrap();
        assert_eq!(pool.size(), 2);

        // Same nexus again: no further growth scheduled
        let b = pool.allocate(0, 0, 2).unwrap();
        assert_eq!(pool.size(), 2);
        assert!(pool.free.is_empty());

        // New nexus grows up to the ceiling
        let c = pool.allocate(1, 0, 2).unwrap();
        assert_eq!(pool.size(), 4);

        // Ceiling reached and everything drawn
        pool.allocate(2, 0, 2).unwrap();
        assert!(pool.allocate(3, 0, 2).is_none());

        assert_ne!(a, b);
        assert_ne!(b, c);
    }

    #[test]
    fn test_pool_reuses_lifo() {
        let mut pool = CcbPool::new(4);
        let a = pool.allocate(0, 0, 2).unwrap();
        pool.get_mut(a).request = None;
        pool.release(a);
        let b = pool.allocate(0, 0, 2).unwrap();
        assert_eq!(a, b);
        assert!(pool.consistent());
    }

    #[test]
    fn test_membership_accounting() {
        let mut pool = CcbPool::new(2);
        let a = pool.allocate(0, 0, 2).unwrap();
        assert!(pool.consistent());
        assert_eq!(pool.get(a).membership, Membership::Queued);
        assert_eq!(pool.free_count() + 1, pool.size());
        pool.release(a);
        assert!(pool.consistent());
        assert_eq!(pool.free_count(), pool.size());
    }

    #[test]
    fn test_data_insns_shape() {
        let layout = ScriptLayout::new(0x1000);
        let segs = [
            DataSegment { addr: 0x8000, len: 512 },
            DataSegment { addr: 0x9000, len: 512 },
        ];
        let insns = build_data_insns(&segs, true, &layout);
        // Guard + move per segment, one trailing jump
        assert_eq!(insns.len(), 5);
        assert_eq!(insns[1].count(), 512);
        assert_eq!(insns[1].arg, 0x8000);
        assert!(ScriptInsn::recoverable_move(insns[1].dcmd()));
        assert_eq!(insns[4], ScriptInsn::jump(layout.addr(Entry::OtherTransfer)));
    }

    #[test]
    fn test_ccb_address_regions() {
        let mut pool = CcbPool::new(2);
        let id = pool.allocate(0, 0, 1).unwrap();
        let layout = ScriptLayout::new(0x1000);
        let segs = [DataSegment { addr: 0x8000, len: 512 }];
        {
            let ccb = pool.get_mut(id);
            ccb.ctrl.data = build_data_insns(&segs, true, &layout);
        }
        let ccb = pool.get(id);
        assert!(ccb.in_data_region(ccb.data_start()));
        assert!(ccb.in_data_region(ccb.data_start() + INSN_BYTES));
        assert!(!ccb.in_data_region(ccb.data_end()));
        assert!(ccb.residual_addr() > ccb.data_end());
        assert_eq!(pool.by_base(ccb.base), Some(id));
    }
}
