//! Reset sequencing, outstanding-command collection and adapter disable
//!
//! Two escalation levels: a bus reset collects and fails everything, then
//! reinitializes the tables and returns to idle, spending retry budget;
//! disable is terminal: the same collection, but the adapter refuses all
//! further work.

use bit_set::BitSet;
use thiserror::Error;

use super::ccb::{CcbId, Membership};
use super::request::{Outcome, RequestId, ResetOutcome};
use super::sync::SyncParams;
use super::{Adapter, AdapterState};
use crate::chip::regs::{Reg, RegDstat, RegIstat, RegScid, RegScntl1, RegSist};
use crate::chip::script::Entry;
use crate::types::AdapterEvent;

/// Register polls allowed while waiting for the chip to quiesce
const HALT_SPIN_LIMIT: usize = 1000;

/// Selection timeout register value, the recommended 250ms
const SELECTION_TIMEOUT: u8 = 14;

/// Faults that take the whole adapter down
#[derive(Error, Debug)]
pub(crate) enum FatalFault {
    #[error("illegal instruction at {0:#010x}")]
    IllegalInstruction(u32),
    #[error("unexpected abort interrupt at {0:#010x}")]
    UnexpectedAbort(u32),
    #[error("host bus fault at {0:#010x}")]
    BusFault(u32),
    #[error("master data parity error")]
    MasterParity,
    #[error("no free schedule slot with commands outstanding")]
    ScheduleExhausted,
    #[error("contingent allegiance with no active command")]
    OrphanCheckCondition,
    #[error("unrecognized script interrupt code {0:#010x}")]
    UnknownScriptInterrupt(u32),
    #[error("connected-abort retry budget exhausted")]
    AbortBudgetExhausted,
}

impl Adapter {
    /// Hard reset of the SCSI bus and the adapter tables. Every command
    /// below the admission layer fails back with a reset outcome; the
    /// request named as the cause is verified to be among them.
    pub fn reset(&mut self, cause: RequestId) -> ResetOutcome {
        log::warn!("scsi{} : resetting SCSI bus and adapter", self.cfg.unit);
        self.halt_script();
        self.scsi_bus_reset();

        let saw_cause = self.collect_and_fail(Outcome::Reset, Some(cause));
        if !saw_cause {
            log::warn!("scsi{} : lost command {}", self.cfg.unit, cause.0);
        }

        self.driver_init();
        self.soft_reset();
        self.emit(AdapterEvent::BusReset);

        if self.resets_left == 0 {
            self.disable_now();
        } else {
            self.resets_left -= 1;
        }
        self.run_drain();

        if self.state == AdapterState::Disabled {
            ResetOutcome::Disabled
        } else {
            ResetOutcome::Reset
        }
    }

    /// Terminal fault path: quarantine the adapter and fail all work
    pub(crate) fn disable(&mut self, fault: FatalFault) {
        if self.state == AdapterState::Disabled {
            return;
        }
        log::error!("scsi{} : fatal: {}", self.cfg.unit, fault);
        self.disable_now();
    }

    fn disable_now(&mut self) {
        if self.state == AdapterState::Disabled {
            return;
        }
        if self.state != AdapterState::Halted {
            self.halt_script();
        }
        self.scsi_bus_reset();
        self.collect_and_fail(Outcome::DriverError, None);
        self.driver_init();
        self.soft_reset();
        self.state = AdapterState::Disabled;
        self.emit(AdapterEvent::Disabled);
        log::error!("scsi{} : disabled", self.cfg.unit);
    }

    /// Collect every command the adapter still holds (schedule slots, the
    /// reconnect set, the running set and the admission queue) and fail
    /// each exactly once. Slot linkage is verified against the arena on
    /// the way: a slot referencing an unknown control area, or two slots
    /// referencing the same command, is corrupt linkage and gets reported.
    pub(crate) fn collect_and_fail(&mut self, outcome: Outcome, cause: Option<RequestId>) -> bool {
        let mut referenced = BitSet::with_capacity(self.pool.size().max(1));
        let mut saw_cause = false;

        for (slot, entry) in self.schedule.armed() {
            match self.pool.by_entry(entry) {
                Some(id) => {
                    if !referenced.insert(id.0) {
                        log::error!(
                            "scsi{} : command in schedule slot {} twice",
                            self.cfg.unit,
                            slot
                        );
                    }
                }
                None => {
                    log::error!(
                        "scsi{} : schedule slot {} references unknown control area {:#010x}",
                        self.cfg.unit,
                        slot,
                        entry
                    );
                }
            }
            self.schedule.clear(slot);
        }

        for index in 0..self.pool.size() {
            let id = CcbId(index);
            let membership = self.pool.get(id).membership;
            if membership == Membership::Free {
                continue;
            }
            if cause.is_some() && self.pool.get(id).request_id() == cause {
                saw_cause = true;
            }
            self.abnormal_finished(id, outcome);
        }
        debug_assert!(self.issue.is_empty());
        saw_cause
    }

    /// Reset the per-adapter tables to their power-on state. The chip is
    /// expected to be halted or freshly reset.
    pub(crate) fn driver_init(&mut self) {
        for row in &mut self.busy {
            row.fill(0);
        }
        self.outstanding = 0;
        for target in 0..self.sync.len() {
            self.sync[target] =
                SyncParams::asynchronous(target as u8, self.saved_scntl3, self.caps.has_scntl3);
        }
        self.schedule.reinit(self.layout.addr(Entry::WaitReselect));
        self.initiate_sdtr = if self.cfg.synchronous { 0xffff } else { 0 };
        self.expecting_iid = false;
        self.expecting_sto = false;
        self.current = None;
        self.dsp = self.layout.addr(Entry::Schedule);
        self.dsp_changed = false;
        self.dstat_valid = false;
        if self.state != AdapterState::Disabled {
            self.state = AdapterState::Idle;
        }
    }

    /// Stop the script processor: eat stacked interrupts, request an
    /// abort, wait for its acknowledge, then quiesce.
    pub(crate) fn halt_script(&mut self) {
        let mut stage = 0;
        for _ in 0..HALT_SPIN_LIMIT {
            if stage == 1 {
                self.chip
                    .write8(Reg::Istat, RegIstat(0).with_abrt(true).0);
                stage = 2;
            }
            let istat = RegIstat(self.chip.read8(Reg::Istat));
            if istat.sip() {
                let _ = self.chip.read8(Reg::Sist);
            } else if istat.dip() {
                let dstat = RegDstat(self.chip.read8(Reg::Dstat));
                if stage == 2 && dstat.abrt() {
                    self.chip.write8(Reg::Istat, 0);
                    stage = 3;
                }
            }
            if !istat.sip() && !istat.dip() {
                if stage == 0 {
                    stage = 1;
                } else if stage == 3 {
                    self.state = AdapterState::Halted;
                    return;
                }
            }
        }
        log::error!("scsi{} : could not halt script processor", self.cfg.unit);
        self.state = AdapterState::Halted;
    }

    /// Pulse the SCSI RST line with its own interrupt masked
    pub(crate) fn scsi_bus_reset(&mut self) {
        let sien = self.chip.read8(Reg::Sien);
        self.chip
            .write8(Reg::Sien, sien & !RegSist(0).with_rst(true).0);
        self.chip
            .write8(Reg::Scntl1, RegScntl1(0).with_rst(true).0);
        self.chip.write8(Reg::Scntl1, 0);
        self.chip.write8(Reg::Sien, sien);
    }

    /// Soft reset and reprogram the chip to its working configuration
    pub(crate) fn soft_reset(&mut self) {
        self.chip
            .write8(Reg::Istat, RegIstat(0).with_srst(true).0);
        self.chip.write8(Reg::Istat, 0);

        self.chip.write8(
            Reg::Scid,
            RegScid(0)
                .with_id(self.cfg.host_id & 7)
                .with_rre(true)
                .0,
        );
        self.chip
            .write8(Reg::Respid, 1 << (self.cfg.host_id & 7));
        self.chip.write8(Reg::Stime, SELECTION_TIMEOUT);

        // All script-side interrupts; parity reporting only on request
        self.chip.write8(
            Reg::Dien,
            RegDstat(0)
                .with_iid(true)
                .with_sir(true)
                .with_abrt(true)
                .with_bf(true)
                .with_mdpe(true)
                .0,
        );
        self.chip.write8(
            Reg::Sien,
            RegSist(0)
                .with_par(self.cfg.parity)
                .with_rst(true)
                .with_udc(true)
                .with_sge(true)
                .with_sto(true)
                .with_ma(true)
                .0,
        );
        if self.caps.has_scntl3 {
            self.chip.write8(Reg::Scntl3, self.saved_scntl3);
        }
    }

    /// Launch the diagnostic self-test. Section results arrive through the
    /// interrupt path as marker codes; `self_test_result` reports the last
    /// section that passed.
    pub fn start_self_test(&mut self) {
        log::info!("scsi{} : starting self-test", self.cfg.unit);
        self.selftest_running = 1;
        self.selftest_completed = None;
        self.state = AdapterState::Running;
        self.chip
            .write32(Reg::Dsp, self.layout.addr(Entry::SelfTest1));
    }

    pub fn self_test_result(&self) -> Option<u8> {
        self.selftest_completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::script::SirCode;
    use crate::host::request::Outcome;
    use crate::test::{completion_log, read_request, small_config, test_adapter};

    #[test]
    fn test_reset_fails_outstanding_and_returns_to_idle() {
        let log = completion_log();
        let (mut adapter, _chip) = test_adapter(small_config(2));

        adapter.submit(read_request(&log, 1, 0)); // dispatched
        adapter.submit(read_request(&log, 2, 0)); // queued behind 1
        let budget = adapter.resets_left;

        let outcome = adapter.reset(RequestId(1));

        assert_eq!(outcome, ResetOutcome::Reset);
        assert_eq!(adapter.state(), crate::host::AdapterState::Idle);
        assert_eq!(adapter.resets_left, budget - 1);

        // Queued and dispatched commands alike fail back exactly once.
        // Once the tables are reinitialized the drain restarts nothing.
        let mut seen: Vec<u64> = log.borrow().iter().map(|(id, _)| *id).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);
        assert!(log.borrow().iter().all(|(_, o)| *o == Outcome::Reset));
        assert_eq!(adapter.outstanding, 0);
        assert!(adapter.schedule.armed().is_empty());
        assert_eq!(adapter.pool.free_count(), adapter.pool.size());
        assert!(adapter.pool.consistent());
    }

    #[test]
    fn test_reset_budget_exhaustion_disables() {
        let log = completion_log();
        let cfg = crate::host::AdapterConfig {
            reset_budget: 0,
            ..small_config(2)
        };
        let (mut adapter, _chip) = test_adapter(cfg);
        adapter.submit(read_request(&log, 1, 0));

        let outcome = adapter.reset(RequestId(1));

        assert_eq!(outcome, ResetOutcome::Disabled);
        assert_eq!(adapter.state(), crate::host::AdapterState::Disabled);
        assert_eq!(log.borrow().as_slice(), &[(1, Outcome::Reset)]);

        // Still terminal for new work
        adapter.submit(read_request(&log, 2, 0));
        assert_eq!(log.borrow().last(), Some(&(2, Outcome::DriverError)));
    }

    #[test]
    fn test_reset_with_lost_cause_still_succeeds() {
        let (mut adapter, _chip) = test_adapter(small_config(2));

        assert_eq!(adapter.reset(RequestId(99)), ResetOutcome::Reset);
        assert_eq!(adapter.state(), crate::host::AdapterState::Idle);
    }

    #[test]
    fn test_reset_restores_asynchronous_defaults() {
        let log = completion_log();
        let (mut adapter, chip) = test_adapter(small_config(2));
        adapter.submit(read_request(&log, 1, 2));
        let id = adapter.pool.by_request(crate::host::request::RequestId(1)).unwrap();
        adapter.pool.get_mut(id).sdtr_sent = false;
        adapter.msg_buf[3] = 50;
        adapter.msg_buf[4] = 8;
        {
            let mut c = chip.0.borrow_mut();
            c.set_reg(Reg::Dsa, adapter.pool.get(id).base);
            c.set_reg(Reg::Dstat, 0x80);
            c.push_read(Reg::Istat, 0x01);
            c.push_read(Reg::Dstat, 0x84);
            c.set_reg(Reg::Dsps, SirCode::SdtrReceived as u32);
        }
        adapter.service_interrupt();
        assert_eq!(adapter.sync_params(2).offset, 8);

        adapter.reset(RequestId(1));
        assert_eq!(adapter.sync_params(2).offset, 0);
        assert_eq!(adapter.sync_params(2).period_ns, None);
    }

    #[test]
    fn test_detach_fails_outstanding() {
        let log = completion_log();
        let (mut adapter, _chip) = test_adapter(small_config(2));
        adapter.submit(read_request(&log, 1, 0));

        adapter.detach();

        assert_eq!(log.borrow().as_slice(), &[(1, Outcome::DriverError)]);
    }

    #[test]
    fn test_halt_sequences_abort_through_the_chip() {
        let (mut adapter, chip) = test_adapter(small_config(2));
        adapter.halt_script();

        assert_eq!(adapter.state(), crate::host::AdapterState::Halted);
        let abort_bit = u32::from(RegIstat(0).with_abrt(true).0);
        assert!(chip.0.borrow().writes(Reg::Istat).contains(&abort_bit));
    }

    #[test]
    fn test_collect_survives_foreign_slot_reference() {
        let log = completion_log();
        let (mut adapter, _chip) = test_adapter(small_config(2));
        adapter.submit(read_request(&log, 1, 0));
        // Corrupt the second slot behind the driver's back
        adapter.schedule.publish(1, 0x0bad_0000);

        adapter.collect_and_fail(Outcome::DriverError, None);
        adapter.run_drain();

        assert_eq!(log.borrow().as_slice(), &[(1, Outcome::DriverError)]);
        assert!(adapter.schedule.armed().is_empty());
        assert!(adapter.pool.consistent());
    }

    #[test]
    fn test_self_test_marker_sequence() {
        let cfg = crate::host::AdapterConfig {
            self_test: true,
            ..small_config(2)
        };
        let (mut adapter, chip) = test_adapter(cfg);
        assert_eq!(adapter.self_test_result(), None);
        assert_eq!(
            chip.0.borrow().last_write(Reg::Dsp),
            Some(adapter.layout.addr(Entry::SelfTest1))
        );

        chip.0.borrow_mut().set_reg(Reg::Dstat, 0x80);
        for (code, expected) in [
            (SirCode::SelfTest1 as u32, 1u8),
            (SirCode::SelfTest2 as u32, 2),
        ] {
            let mut c = chip.0.borrow_mut();
            c.push_read(Reg::Istat, 0x01);
            c.push_read(Reg::Dstat, 0x84);
            c.set_reg(Reg::Dsps, code);
            drop(c);
            adapter.service_interrupt();
            assert_eq!(adapter.self_test_result(), Some(expected));
        }
        assert_eq!(adapter.state(), crate::host::AdapterState::Idle);

        // The second section's launch went through the instruction pointer
        assert!(chip
            .0
            .borrow()
            .writes(Reg::Dsp)
            .contains(&adapter.layout.addr(Entry::SelfTest2)));
    }

    #[test]
    fn test_events_reported_out_of_band() {
        let log = completion_log();
        let (mut adapter, _chip) = test_adapter(small_config(2));
        let (tx, rx) = crossbeam_channel::unbounded();
        adapter.set_event_sender(tx);
        adapter.submit(read_request(&log, 1, 0));

        adapter.reset(RequestId(1));

        let events: Vec<_> = rx.try_iter().collect();
        assert!(events.contains(&crate::types::AdapterEvent::BusReset));
    }
}
