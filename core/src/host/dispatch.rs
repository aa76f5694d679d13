//! Interrupt dispatch and the per-command phase state machine
//!
//! One service pass reads the pending-interrupt register once, classifies
//! the event against the command the chip was working, and either retires
//! commands, patches their control areas, or escalates. Stacked interrupts
//! unstack on read, so every status register is read at most once per pass
//! and the cached copy drives all decisions.

use num_traits::FromPrimitive;

use super::ccb::{CcbId, Membership, NexusState, SENSE_FETCH_LEN};
use super::recovery::FatalFault;
use super::request::Outcome;
use super::sync::{negotiate, Negotiated, SyncParams};
use super::{Adapter, AdapterState};
use crate::chip::regs::{
    Reg, RegCtest2, RegCtest3, RegDstat, RegIstat, RegSbcl, RegSfifo, RegSist, RegSxfer,
    RegStest2, DFIFO_BO_MASK,
};
use crate::chip::script::{
    insn_size_words, msg, Entry, ScriptInsn, ScsiPhase, SirCode, DCMD_WAIT_DISCONNECT, INSN_BYTES,
};
use crate::types::AdapterEvent;

const INTR_TRACE: bool = false;

/// Spins allowed for a FIFO flush before giving up
const FIFO_SPIN_LIMIT: usize = 100;

/// What a script-interrupt handler wants done afterwards
enum SirAction {
    /// Handled; resume per the dsp bookkeeping
    Handled,
    /// Break the currently established nexus
    AbortNexus,
    Fatal(FatalFault),
}

impl Adapter {
    /// Interrupt service entry. Loops until the chip shows no pending
    /// work, then resumes it and drains the admission queue.
    pub fn service_interrupt(&mut self) {
        loop {
            let mut serviced = false;
            self.dsp_changed = false;

            loop {
                self.dstat_valid = false;
                let istat = RegIstat(self.chip.read8(Reg::Istat));
                let mut interrupted = false;

                if self.caps.intfly && istat.intf() {
                    interrupted = true;
                    // Clearing the completion signal is a write-one-to-reset
                    self.chip.write8(Reg::Istat, istat.with_intf(true).0);
                    if INTR_TRACE {
                        log::debug!("scsi{} : completion signal", self.cfg.unit);
                    }
                    if !self.sweep_completions() {
                        log::warn!(
                            "scsi{} : completion signal with no finished commands",
                            self.cfg.unit
                        );
                    }
                }

                if istat.sip() || istat.dip() {
                    interrupted = true;
                    self.state = AdapterState::Halted;
                    let cmd = self.identify_current();
                    if istat.sip() {
                        self.intr_scsi(cmd);
                    }
                    if istat.dip() {
                        self.intr_dma(cmd);
                    }
                    self.flush_dma_fifo();
                }

                if !interrupted {
                    break;
                }
                serviced = true;
            }

            // Left halted without an explicit resume address: continue at
            // the previously-fetched instruction pointer. Handlers that
            // already restarted or idled the chip changed state themselves.
            if self.state == AdapterState::Halted {
                if !self.dsp_changed {
                    self.dsp = self.chip.read32(Reg::Dsp);
                }
                self.state = AdapterState::Running;
                self.chip.write32(Reg::Dsp, self.dsp);
            }

            if !serviced {
                break;
            }
        }
        self.run_drain();
    }

    /// Which command was the chip working when it halted?
    fn identify_current(&mut self) -> Option<CcbId> {
        if self.caps.single_current {
            return self.current;
        }
        let base = self.chip.read32(Reg::Dsa);
        self.pool.by_base(base)
    }

    /// SCSI-side events: selection timeout, disconnects, parity, gross
    /// errors and phase mismatches. Each is fatal to the current nexus
    /// only.
    fn intr_scsi(&mut self, cmd: Option<CcbId>) {
        let sist = RegSist(self.chip.read8(Reg::Sist));
        if INTR_TRACE {
            log::debug!("scsi{} : scsi events {:?}", self.cfg.unit, sist);
        }

        if sist.sto() {
            self.handle_selection_timeout(cmd);
        }

        if sist.udc() {
            if let Some(id) = cmd {
                log::warn!(
                    "scsi{} : unexpected disconnect, command {:?}",
                    self.cfg.unit,
                    self.pool.get(id).request_id()
                );
                self.abnormal_finished(id, Outcome::DriverError);
            } else {
                log::warn!("scsi{} : unexpected disconnect (no command)", self.cfg.unit);
            }
            self.dsp = self.layout.addr(Entry::Schedule);
            self.dsp_changed = true;
        }

        if sist.par() {
            if let Some(id) = cmd {
                log::error!(
                    "scsi{} : parity error, command {:?}",
                    self.cfg.unit,
                    self.pool.get(id).request_id()
                );
                self.abnormal_finished(id, Outcome::DriverError);
            } else {
                log::error!("scsi{} : parity error", self.cfg.unit);
            }
            self.dsp = self.layout.addr(Entry::InitiatorAbort);
            self.dsp_changed = true;
        }

        if sist.sge() {
            log::error!("scsi{} : gross error", self.cfg.unit);
            if self.caps.offset_clear {
                self.chip
                    .write8(Reg::Stest2, RegStest2(0).with_rof(true).0);
            }
            self.dsp = self.layout.addr(Entry::InitiatorAbort);
            self.dsp_changed = true;
        }

        if sist.ma() {
            self.intr_phase_mismatch(cmd);
        }
    }

    /// A selection that nobody answered. The chip reports it twice, as a
    /// timeout and as an illegal instruction in the selection code;
    /// whichever arrives second is consumed silently.
    fn handle_selection_timeout(&mut self, cmd: Option<CcbId>) {
        if self.selftest_running != 0 {
            self.selftest_running = 0;
            self.selftest_completed = Some(3);
            self.state = AdapterState::Idle;
            self.emit(AdapterEvent::SelfTestPassed(3));
            return;
        }
        self.state = AdapterState::Idle;
        if self.expecting_sto {
            self.expecting_sto = false;
            return;
        }
        self.expecting_iid = true;
        if let Some(id) = cmd {
            log::debug!(
                "scsi{} : selection timeout, command {:?}",
                self.cfg.unit,
                self.pool.get(id).request_id()
            );
            self.abnormal_finished(id, Outcome::BadTarget);
        }
    }

    /// DMA/script-side events: aborts, single step, illegal instructions,
    /// bus faults, script interrupt codes, master parity.
    fn intr_dma(&mut self, cmd: Option<CcbId>) {
        if !self.dstat_valid {
            self.dstat = self.chip.read8(Reg::Dstat);
            self.dstat_valid = true;
        }
        let dstat = RegDstat(self.dstat);
        if INTR_TRACE {
            log::debug!("scsi{} : dma status {:?}", self.cfg.unit, dstat);
        }

        let dbc_dcmd = self.chip.read32(Reg::Dbc);
        let dcmd = (dbc_dcmd >> 24) as u8;
        let next_dsp = self.chip.read32(Reg::Dsp);
        let dsp = next_dsp.wrapping_sub(insn_size_words(dcmd) * 4);

        if dstat.abrt() {
            self.disable(FatalFault::UnexpectedAbort(dsp));
            return;
        }

        if dstat.ssi() {
            log::debug!("scsi{} : single step at {:#010x}", self.cfg.unit, dsp);
        }

        if dstat.iid() {
            if self.layout.in_select_window(dsp) || self.selftest_running == 2 {
                if self.selftest_running == 2 {
                    // Selecting a nonexistent device is the last section
                    self.selftest_running = 0;
                    self.selftest_completed = Some(3);
                    self.state = AdapterState::Idle;
                    self.emit(AdapterEvent::SelfTestPassed(3));
                } else if self.expecting_iid {
                    self.expecting_iid = false;
                    self.state = AdapterState::Idle;
                } else {
                    self.expecting_sto = true;
                    self.state = AdapterState::Idle;
                    if let Some(id) = cmd {
                        self.abnormal_finished(id, Outcome::BadTarget);
                    }
                }
            } else if dcmd == DCMD_WAIT_DISCONNECT
                && RegSbcl(self.chip.read8(Reg::Sbcl)).req()
            {
                // A target can reselect and assert REQ inside the bus-free
                // window before our wait-disconnect executes
                if !self.printed_wait_race {
                    log::warn!(
                        "scsi{} : reselection raced the wait-disconnect",
                        self.cfg.unit
                    );
                    self.printed_wait_race = true;
                }
            } else {
                self.disable(FatalFault::IllegalInstruction(dsp));
                return;
            }
        }

        if dstat.bf() {
            self.disable(FatalFault::BusFault(dsp));
            return;
        }

        if dstat.sir() {
            let code = self.chip.read32(Reg::Dsps);
            match self.script_interrupt(cmd, code, next_dsp) {
                SirAction::Handled => {}
                SirAction::AbortNexus => self.abort_connected(),
                SirAction::Fatal(fault) => {
                    self.disable(fault);
                    return;
                }
            }
        }

        if dstat.mdpe() {
            self.disable(FatalFault::MasterParity);
        }
    }

    /// Numeric codes the script raises at fixed points. Each maps to one
    /// host action; anything unrecognized is fatal.
    fn script_interrupt(&mut self, cmd: Option<CcbId>, code: u32, next_dsp: u32) -> SirAction {
        let Some(sir) = SirCode::from_u32(code) else {
            return SirAction::Fatal(FatalFault::UnknownScriptInterrupt(code));
        };

        match sir {
            SirCode::MsgReceived => {
                match self.msg_buf[0] {
                    msg::REJECT => {
                        self.dsp = self.layout.addr(Entry::AcceptMessage);
                        self.dsp_changed = true;
                        if let Some(id) = cmd {
                            if self.pool.get(id).sdtr_sent {
                                let target = self.pool.get(id).request.as_ref().map(|r| r.target);
                                self.pool.get_mut(id).sdtr_sent = false;
                                if let Some(target) = target {
                                    log::warn!(
                                        "scsi{} : target {} rejected synchronous negotiation",
                                        self.cfg.unit,
                                        target
                                    );
                                    self.set_asynchronous(target, true);
                                }
                            }
                        }
                    }
                    msg::INITIATE_RECOVERY => {
                        log::warn!(
                            "scsi{} : extended contingent allegiance not supported, rejecting",
                            self.cfg.unit
                        );
                        self.dsp = self.layout.addr(Entry::RejectMessage);
                        self.dsp_changed = true;
                    }
                    other => {
                        log::warn!(
                            "scsi{} : unsupported message {:#04x}, rejecting",
                            self.cfg.unit,
                            other
                        );
                        self.dsp = self.layout.addr(Entry::RejectMessage);
                        self.dsp_changed = true;
                    }
                }
                SirAction::Handled
            }

            SirCode::SdtrReceived => self.handle_sdtr(cmd),

            SirCode::WdtrReceived => {
                // Wide transfers are not done here; answer with a reject
                self.dsp = self.layout.addr(Entry::RejectMessage);
                self.dsp_changed = true;
                SirAction::Handled
            }

            SirCode::UnexpectedPhase => SirAction::AbortNexus,

            SirCode::Selected => {
                log::warn!("scsi{} : selected as a target, aborting", self.cfg.unit);
                self.dsp = self.layout.addr(Entry::TargetAbort);
                self.dsp_changed = true;
                SirAction::Handled
            }

            SirCode::UnexpectedReselect => {
                log::warn!("scsi{} : unexpected reselect", self.cfg.unit);
                self.dsp = self.layout.addr(Entry::InitiatorAbort);
                self.dsp_changed = true;
                SirAction::Handled
            }

            SirCode::CheckCondition => self.rewrite_for_sense(cmd),

            SirCode::Aborted => {
                self.dsp = self.layout.addr(Entry::Schedule);
                self.dsp_changed = true;
                if let Some(id) = cmd {
                    let outcome = if self.pool.get(id).abort_requested {
                        Outcome::Aborted
                    } else {
                        Outcome::DriverError
                    };
                    self.abnormal_finished(id, outcome);
                }
                SirAction::Handled
            }

            SirCode::Completed => {
                // Revisions without the immediate-completion interrupt
                // mark completions with this code instead
                if !self.sweep_completions() {
                    log::warn!(
                        "scsi{} : completion marker with no finished commands",
                        self.cfg.unit
                    );
                }
                SirAction::Handled
            }

            SirCode::Disconnected => {
                if let Some(id) = cmd {
                    let ccb = self.pool.get_mut(id);
                    ccb.membership = Membership::Disconnected;
                    ccb.nexus = NexusState::Disconnected;
                }
                SirAction::Handled
            }

            SirCode::Reselected => {
                if let Some(id) = cmd {
                    let ccb = self.pool.get_mut(id);
                    ccb.membership = Membership::Running;
                    ccb.nexus = NexusState::Reconnecting;
                }
                SirAction::Handled
            }

            SirCode::DebugBreak => {
                log::debug!("scsi{} : breakpoint at {:#010x}", self.cfg.unit, next_dsp);
                self.emit(AdapterEvent::DebugBreak(next_dsp));
                SirAction::Handled
            }

            SirCode::SelfTest1 => {
                self.selftest_completed = Some(1);
                self.emit(AdapterEvent::SelfTestPassed(1));
                if self.selftest_running == 1 {
                    self.selftest_running = 2;
                    self.dsp = self.layout.addr(Entry::SelfTest2);
                    self.dsp_changed = true;
                }
                SirAction::Handled
            }

            SirCode::SelfTest2 => {
                self.selftest_completed = Some(2);
                self.selftest_running = 0;
                self.state = AdapterState::Idle;
                self.emit(AdapterEvent::SelfTestPassed(2));
                SirAction::Handled
            }
        }
    }

    /// A synchronous transfer request landed in the message buffer: period
    /// in 4ns units at offset 3, offset at 4. Either the response to our
    /// own SDTR or a target-initiated exchange we must answer.
    fn handle_sdtr(&mut self, cmd: Option<CcbId>) -> SirAction {
        let Some(id) = cmd else {
            // No control area to stage a reply in
            self.dsp = self.layout.addr(Entry::RejectMessage);
            self.dsp_changed = true;
            return SirAction::Handled;
        };

        let period = self.msg_buf[3];
        let offset = self.msg_buf[4];
        let (target, initiated) = {
            let ccb = self.pool.get(id);
            (
                ccb.request.as_ref().map_or(0, |r| r.target),
                ccb.sdtr_sent,
            )
        };

        if initiated {
            // Their answer to our request: program what they granted
            self.pool.get_mut(id).sdtr_sent = false;
            let n = negotiate(
                self.scsi_clock,
                period,
                offset,
                self.caps.max_offset,
                self.saved_scntl3,
                self.caps.has_scntl3,
            );
            self.apply_sync(target, &n, true);
            self.dsp = self.layout.addr(Entry::AcceptMessage);
            self.dsp_changed = true;
        } else {
            // Target-initiated: program our answer and send it back
            let n = if self.cfg.synchronous {
                self.pool.get_mut(id).did_sdtr = true;
                negotiate(
                    self.scsi_clock,
                    period,
                    offset,
                    self.caps.max_offset,
                    self.saved_scntl3,
                    self.caps.has_scntl3,
                )
            } else {
                Negotiated {
                    period_x4: period,
                    offset: 0,
                    sxfer: 0,
                    scntl3: if self.caps.has_scntl3 {
                        self.saved_scntl3
                    } else {
                        0
                    },
                }
            };
            self.apply_sync(target, &n, true);

            let ccb = self.pool.get_mut(id);
            ccb.ctrl.msgout_other.clear();
            for b in [msg::EXTENDED, 3, msg::EXT_SDTR, n.period_x4, n.offset] {
                ccb.ctrl.msgout_other.push(b);
            }
            ccb.nexus = NexusState::NonDataPhase;
            self.dsp = self.layout.addr(Entry::RespondMessage);
            self.dsp_changed = true;
        }
        SirAction::Handled
    }

    /// Install negotiated parameters for a target: the sync table entry,
    /// the reselection reprogram snippet, and (when connected) the live
    /// chip registers.
    pub(crate) fn apply_sync(&mut self, target: u8, n: &Negotiated, now_connected: bool) {
        match n.period_ns() {
            Some(ns) => log::info!(
                "scsi{} : target {} synchronous, period {}ns offset {}",
                self.cfg.unit,
                target,
                ns,
                n.offset
            ),
            None => log::info!("scsi{} : target {} asynchronous", self.cfg.unit, target),
        }
        self.sync[target as usize % super::ccb::MAX_TARGETS] = SyncParams::program(
            target,
            n.sxfer,
            n.scntl3,
            self.caps.has_scntl3,
            n.period_ns(),
            n.offset,
        );
        if now_connected {
            if self.caps.has_scntl3 {
                self.chip.write8(Reg::Scntl3, n.scntl3);
            }
            self.chip.write8(Reg::Sxfer, n.sxfer);
        }
        self.emit(AdapterEvent::NegotiatedSync {
            target,
            period_ns: n.period_ns(),
            offset: n.offset,
        });
    }

    /// Drop a target back to asynchronous transfers
    pub(crate) fn set_asynchronous(&mut self, target: u8, now_connected: bool) {
        let n = Negotiated {
            period_x4: 0,
            offset: 0,
            sxfer: 0,
            scntl3: if self.caps.has_scntl3 {
                self.saved_scntl3
            } else {
                0
            },
        };
        self.apply_sync(target, &n, now_connected);
    }

    /// CHECK CONDITION: the next command to this target clears the sense
    /// data, so rewrite this command in place into a REQUEST SENSE and run
    /// it before anything else reaches the device.
    fn rewrite_for_sense(&mut self, cmd: Option<CcbId>) -> SirAction {
        let Some(id) = cmd else {
            return SirAction::Fatal(FatalFault::OrphanCheckCondition);
        };

        let (target, lun, sense) = {
            let ccb = self.pool.get(id);
            match ccb.request.as_ref() {
                Some(r) => (r.target, r.lun, r.sense),
                None => return SirAction::Fatal(FatalFault::OrphanCheckCondition),
            }
        };
        let sense_len = if sense.len == 0 {
            SENSE_FETCH_LEN
        } else {
            sense.len.min(255)
        };
        let other = self.layout.addr(Entry::OtherTransfer);

        log::warn!(
            "scsi{} : target {} lun {} CHECK CONDITION, fetching sense",
            self.cfg.unit,
            target,
            lun
        );

        let ccb = self.pool.get_mut(id);
        ccb.is_sense = true;
        // One-byte selection message; a six-byte REQUEST SENSE with the
        // lun preserved; data-out disabled; data-in redirected at the
        // sense buffer with overflow detection behind it
        ccb.ctrl.msgout.truncate(1);
        ccb.ctrl.cmdout.clear();
        for b in [0x03, (lun & 7) << 5, 0, 0, sense_len as u8, 0] {
            ccb.ctrl.cmdout.push(b);
        }
        ccb.ctrl.dataout_entry = other;
        ccb.ctrl.data.clear();
        ccb.ctrl.data
            .push(ScriptInsn::block_move(sense_len, sense.addr, true));
        ccb.ctrl.data.push(ScriptInsn::jump(other));
        ccb.ctrl.datain_entry = ccb.data_start();
        ccb.ctrl.status = super::ccb::RESULT_SENTINEL;
        ccb.ctrl.msgin = super::ccb::RESULT_SENTINEL;
        ccb.nexus = NexusState::Selecting;

        self.dsp = self.layout.addr(Entry::Select);
        self.dsp_changed = true;
        SirAction::Handled
    }

    /// An interrupted block transfer left its progress in the chip. Fold
    /// the FIFO residual back into the count and address, patch a split
    /// continuation into the control area, and resume there, when the
    /// failure point is one we recognize.
    fn intr_phase_mismatch(&mut self, cmd: Option<CcbId>) {
        let dbc_dcmd = self.chip.read32(Reg::Dbc);
        let dcmd = (dbc_dcmd >> 24) as u8;
        let next_dsp = self.chip.read32(Reg::Dsp);
        let dsp = next_dsp.wrapping_sub(insn_size_words(dcmd) * 4);
        let sbcl = RegSbcl(self.chip.read8(Reg::Sbcl));
        let phase = ScsiPhase::from_u8(sbcl.phase_bits());

        let mut failed: Option<&'static str> = None;

        match cmd {
            None => failed = Some("no current command"),
            Some(id) => {
                let (in_data, in_patch, residual_addr) = {
                    let ccb = self.pool.get(id);
                    (
                        ccb.in_data_region(dsp),
                        dsp == ccb.residual_addr() + INSN_BYTES,
                        ccb.residual_addr(),
                    )
                };

                if in_data || in_patch {
                    if ScriptInsn::recoverable_move(dcmd) {
                        let residual = self.datapath_residual(dbc_dcmd);
                        if INTR_TRACE {
                            log::debug!(
                                "scsi{} : splitting transfer, {} bytes still in FIFO",
                                self.cfg.unit,
                                residual
                            );
                        }
                        let input = dcmd & crate::chip::script::DCMD_BMI_IO != 0;
                        let handler = self
                            .layout
                            .addr(if input { Entry::OtherIn } else { Entry::OtherOut });
                        let dnad = self.chip.read32(Reg::Dnad);

                        let ccb = self.pool.get_mut(id);
                        if !in_patch {
                            ccb.ctrl.residual[0] =
                                ScriptInsn::call_when(ScsiPhase::data(input), handler);
                        }
                        // The corrected transfer: count grows by what never
                        // left the FIFO, the address backs up by the same
                        ccb.ctrl.residual[1] = ScriptInsn {
                            op: dbc_dcmd.wrapping_add(residual),
                            arg: dnad.wrapping_sub(residual),
                        };
                        if !in_patch {
                            ccb.ctrl.residual[2] = ScriptInsn::jump(next_dsp);
                        }
                        ccb.nexus = NexusState::DataPhase;
                        self.dsp = residual_addr;
                        self.dsp_changed = true;
                    } else {
                        failed = Some("non-move instruction in transfer descriptors");
                    }
                } else if dsp == self.layout.addr(Entry::SelectMsgout) {
                    // Release ATN before deciding
                    self.chip.write8(Reg::Socl, 0);
                    match phase {
                        Some(ScsiPhase::Command) => {
                            // Target took the identify and skipped the rest
                            // of our selection messages
                            log::warn!(
                                "scsi{} : target ignored selection messages, continuing",
                                self.cfg.unit
                            );
                            self.pool.get_mut(id).sdtr_sent = false;
                            self.dsp = dsp + INSN_BYTES;
                            self.dsp_changed = true;
                        }
                        Some(ScsiPhase::MsgIn) => {
                            self.dsp = self.layout.addr(Entry::MsgIn);
                            self.dsp_changed = true;
                        }
                        _ => failed = Some("selection message out"),
                    }
                } else if dsp == self.layout.addr(Entry::Cmdout) {
                    // Target decided mid-command; let the phase dispatcher
                    // pick up whatever it switched to
                    self.dsp = self.layout.addr(Entry::DataTransfer);
                    self.dsp_changed = true;
                } else {
                    failed = Some("unclassified location");
                }
            }
        }

        if let Some(location) = failed {
            log::error!(
                "scsi{} : {} : unexpected phase {}",
                self.cfg.unit,
                location,
                phase.map_or("unknown", <&'static str>::from)
            );
            self.abort_connected();
        }
    }

    /// Bytes the chip accepted into its FIFOs that the count and address
    /// registers no longer reflect
    fn datapath_residual(&mut self, dbc_dcmd: u32) -> u32 {
        let bo_fifo = self.chip.read8(Reg::Dfifo) & DFIFO_BO_MASK;
        let bo_count = (dbc_dcmd as u8) & DFIFO_BO_MASK;
        let mut count = u32::from(bo_fifo.wrapping_sub(bo_count) & DFIFO_BO_MASK);

        let synchronous = RegSxfer(self.chip.read8(Reg::Sxfer)).mo() != 0;
        let fifo = RegSfifo(self.chip.read8(Reg::Sfifo));
        if RegCtest2(self.chip.read8(Reg::Ctest2)).ddir() {
            // Receiving
            if synchronous {
                count += u32::from(fifo.ff());
            } else if fifo.ilf() {
                count += 1;
            }
        } else {
            // Sending
            if fifo.olf() {
                count += 1;
            }
            if synchronous && fifo.orf() {
                count += 1;
            }
        }
        count
    }

    /// Break the established nexus. Each use spends retry budget; running
    /// out means the bus is wedged and the adapter goes down.
    pub(crate) fn abort_connected(&mut self) {
        if self.aborts_left == 0 {
            self.disable(FatalFault::AbortBudgetExhausted);
            return;
        }
        self.aborts_left -= 1;
        log::warn!("scsi{} : breaking established nexus", self.cfg.unit);
        self.dsp = self.layout.addr(Entry::InitiatorAbort);
        self.dsp_changed = true;
    }

    /// A fatal bus event may leave bytes in the DMA FIFO; they must be
    /// gone before the script restarts
    pub(crate) fn flush_dma_fifo(&mut self) {
        if !self.dstat_valid {
            self.dstat = self.chip.read8(Reg::Dstat);
            self.dstat_valid = true;
        }
        if RegDstat(self.dstat).dfe() {
            return;
        }
        log::warn!("scsi{} : DMA FIFO not empty, flushing", self.cfg.unit);

        let receiving = RegCtest2(self.chip.read8(Reg::Ctest2)).ddir();
        let flush = if receiving {
            RegCtest3(0).with_flf(true)
        } else {
            RegCtest3(0).with_clf(true)
        };
        self.chip.write8(Reg::Ctest3, flush.0);

        for _ in 0..FIFO_SPIN_LIMIT {
            if receiving {
                let dstat = RegDstat(self.chip.read8(Reg::Dstat));
                if dstat.dfe() {
                    self.dstat = dstat.0;
                    return;
                }
            } else if !RegCtest3(self.chip.read8(Reg::Ctest3)).clf() {
                self.dstat = RegDstat(self.dstat).with_dfe(true).0;
                return;
            }
        }
        log::error!("scsi{} : DMA FIFO would not drain", self.cfg.unit);
        self.dstat = RegDstat(self.dstat).with_dfe(true).0;
    }
}
