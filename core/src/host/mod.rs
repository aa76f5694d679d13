//! Host side of the driver: adapter lifecycle, command admission and the
//! drain loop that feeds the schedule table
//!
//! The core is single-threaded: the `&mut` borrow of the adapter is the
//! critical section, standing in for masked interrupt delivery. The script
//! processor runs concurrently regardless, so everything it reads goes
//! through the publish routines with their ordering guarantees.

pub mod ccb;
mod dispatch;
pub mod request;
mod schedule;
pub mod sync;
mod recovery;

use std::collections::VecDeque;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::chip::io::ScriptProcessor;
use crate::chip::regs::{Reg, RegIstat};
use crate::chip::script::{msg, Entry, ScriptAddr, ScriptLayout};
use crate::chip::{clock_to_ccf, ChipCaps, ChipVariant};
use crate::types::{AdapterEvent, AdapterEventSender};

use ccb::{build_data_insns, CcbId, CcbPool, Membership, NexusState, MAX_LUNS, MAX_TARGETS};
use request::{AbortOutcome, Completion, DataDirection, Outcome, Request, RequestId};
use schedule::ScheduleTable;
use sync::SyncParams;

pub use request::ResetOutcome;

const SCHED_TRACE: bool = false;

/// Highest selectable SCSI id
pub const MAX_ID: u8 = 7;

pub const STATUS_GOOD: u8 = 0;
pub const STATUS_CHECK_CONDITION: u8 = 2;

/// Where the fixed script program lives in bus space
const SCRIPT_BASE: ScriptAddr = 0x0000_1000;

/// Period (in 4ns units) and offset we open negotiation with
const SDTR_REQ_PERIOD_X4: u8 = 25;

/// Adapter lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
pub enum AdapterState {
    /// Script processor parked, waiting to be started
    Idle,
    /// Script processor walking the schedule or running a command
    Running,
    /// Stopped for host servicing
    Halted,
    /// Terminal fault state; all work is refused
    Disabled,
}

/// How the chip's register bank is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterMapping {
    Port(u16),
    Memory(u32),
}

/// Everything attach needs to know about one adapter instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Unit number used in log messages
    pub unit: u32,
    pub variant: ChipVariant,
    pub mapping: RegisterMapping,
    pub irq_line: u8,
    pub dma_channel: Option<u8>,
    /// The adapter's own SCSI id
    pub host_id: u8,
    /// Schedule table capacity: commands the chip juggles at once
    pub can_queue: usize,
    /// Control blocks reserved per target/lun on first use
    pub cmd_per_lun: usize,
    /// Permit targets to disconnect during long operations
    pub disconnect: bool,
    /// Negotiate synchronous transfers
    pub synchronous: bool,
    /// Enable SCSI parity checking
    pub parity: bool,
    /// Run the diagnostic self-test after attach
    pub self_test: bool,
    /// Override the SCSI clock; None takes the variant default
    pub scsi_clock_hz: Option<u32>,
    /// Bus resets allowed before a failing adapter is disabled
    pub reset_budget: u32,
    /// Connected-nexus aborts allowed before the adapter is disabled
    pub abort_budget: u32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            unit: 0,
            variant: ChipVariant::V810,
            mapping: RegisterMapping::Memory(0),
            irq_line: 10,
            dma_channel: None,
            host_id: 7,
            can_queue: 8,
            cmd_per_lun: 2,
            disconnect: true,
            synchronous: true,
            parity: false,
            self_test: false,
            scsi_clock_hz: None,
            reset_budget: 4,
            abort_budget: 5,
        }
    }
}

/// One attached host adapter
pub struct Adapter {
    pub(crate) cfg: AdapterConfig,
    pub(crate) caps: ChipCaps,
    pub(crate) chip: Box<dyn ScriptProcessor>,
    pub(crate) layout: ScriptLayout,
    pub(crate) state: AdapterState,

    pub(crate) schedule: ScheduleTable,
    pub(crate) pool: CcbPool,
    /// Admitted requests not yet given a schedule slot
    pub(crate) issue: VecDeque<CcbId>,
    /// Finished requests whose callbacks have not run yet
    pub(crate) finished: VecDeque<Completion>,
    /// Re-entrancy guard for the drain loop
    pub(crate) drain_running: bool,

    pub(crate) busy: [[u8; MAX_LUNS]; MAX_TARGETS],
    /// Commands currently handed to the chip
    pub(crate) outstanding: usize,

    pub(crate) sync: Vec<SyncParams>,
    /// Targets we still owe an SDTR on first contact
    pub(crate) initiate_sdtr: u16,
    /// Message bytes the chip deposited for the host
    pub(crate) msg_buf: [u8; 8],

    pub(crate) dsp: ScriptAddr,
    pub(crate) dsp_changed: bool,
    pub(crate) dstat: u8,
    pub(crate) dstat_valid: bool,
    pub(crate) expecting_iid: bool,
    pub(crate) expecting_sto: bool,
    pub(crate) printed_wait_race: bool,

    pub(crate) resets_left: u32,
    pub(crate) aborts_left: u32,
    pub(crate) saved_scntl3: u8,
    pub(crate) scsi_clock: u32,
    /// Current-command cell for revisions without a usable shared-structure
    /// address register
    pub(crate) current: Option<CcbId>,

    /// 0 when no self-test section is running
    pub(crate) selftest_running: u8,
    pub(crate) selftest_completed: Option<u8>,

    events: Option<AdapterEventSender>,
}

impl Adapter {
    /// Bring up one adapter instance on the given chip
    pub fn attach(cfg: AdapterConfig, chip: Box<dyn ScriptProcessor>) -> Result<Self> {
        if cfg.host_id > MAX_ID {
            bail!("scsi{} : host id {} out of range", cfg.unit, cfg.host_id);
        }
        if cfg.can_queue == 0 || cfg.cmd_per_lun == 0 {
            bail!("scsi{} : zero command depth", cfg.unit);
        }
        let caps = cfg.variant.caps();
        let scsi_clock = cfg.scsi_clock_hz.unwrap_or(caps.default_clock_hz);
        let Some(ccf) = clock_to_ccf(scsi_clock) else {
            bail!("scsi{} : unsupported SCSI clock {} Hz", cfg.unit, scsi_clock);
        };
        let saved_scntl3 = ccf & 0x07;

        log::info!(
            "scsi{} : attaching {} at {:?}, irq {}, clock {} MHz",
            cfg.unit,
            <&'static str>::from(cfg.variant),
            cfg.mapping,
            cfg.irq_line,
            scsi_clock / 1_000_000
        );

        let layout = ScriptLayout::new(SCRIPT_BASE);
        let mut adapter = Self {
            caps,
            chip,
            layout,
            state: AdapterState::Idle,
            schedule: ScheduleTable::new(cfg.can_queue, caps.operand_first),
            // The admission queue may hold a little work beyond what the
            // schedule table can take at once
            pool: CcbPool::new(cfg.can_queue + cfg.cmd_per_lun),
            issue: VecDeque::new(),
            finished: VecDeque::new(),
            drain_running: false,
            busy: [[0; MAX_LUNS]; MAX_TARGETS],
            outstanding: 0,
            sync: (0..MAX_TARGETS)
                .map(|t| SyncParams::asynchronous(t as u8, saved_scntl3, caps.has_scntl3))
                .collect(),
            initiate_sdtr: 0,
            msg_buf: [0; 8],
            dsp: layout.addr(Entry::Schedule),
            dsp_changed: false,
            dstat: 0,
            dstat_valid: false,
            expecting_iid: false,
            expecting_sto: false,
            printed_wait_race: false,
            resets_left: cfg.reset_budget,
            aborts_left: cfg.abort_budget,
            saved_scntl3,
            scsi_clock,
            current: None,
            selftest_running: 0,
            selftest_completed: None,
            events: None,
            cfg,
        };
        adapter.soft_reset();
        adapter.driver_init();
        if adapter.cfg.self_test {
            adapter.start_self_test();
        }
        Ok(adapter)
    }

    /// Shut the adapter down, failing anything still in flight
    pub fn detach(mut self) {
        log::info!("scsi{} : detaching", self.cfg.unit);
        if self.state != AdapterState::Disabled {
            self.halt_script();
            self.scsi_bus_reset();
            self.collect_and_fail(Outcome::DriverError, None);
            self.soft_reset();
            self.state = AdapterState::Disabled;
        }
        self.run_drain();
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }

    pub fn set_event_sender(&mut self, sender: AdapterEventSender) {
        self.events = Some(sender);
    }

    pub(crate) fn emit(&self, event: AdapterEvent) {
        if let Some(sender) = &self.events {
            let _ = sender.send(event);
        }
    }

    /// Admit one request. The result arrives through the request's
    /// completion callback, never through a return value; the callback may
    /// fire during this call.
    pub fn submit(&mut self, request: Request) {
        if SCHED_TRACE {
            log::debug!(
                "scsi{} : submit {} target {} lun {} cdb {}",
                self.cfg.unit,
                request.id.0,
                request.target,
                request.lun,
                hex::encode(request.cdb.as_slice())
            );
        }

        if self.state == AdapterState::Disabled {
            log::warn!("scsi{} : driver disabled", self.cfg.unit);
            self.finished.push_back(Completion {
                request,
                outcome: Outcome::DriverError,
            });
            self.run_drain();
            return;
        }
        if request.target > MAX_ID || request.target == self.cfg.host_id {
            log::warn!(
                "scsi{} : bad target {} lun {} cdb {}",
                self.cfg.unit,
                request.target,
                request.lun,
                hex::encode(request.cdb.as_slice())
            );
            self.finished.push_back(Completion {
                request,
                outcome: Outcome::BadTarget,
            });
            self.run_drain();
            return;
        }

        let Some(id) = self
            .pool
            .allocate(request.target, request.lun, self.cfg.cmd_per_lun)
        else {
            log::error!(
                "scsi{} : can't allocate command for target {} lun {}",
                self.cfg.unit,
                request.target,
                request.lun
            );
            self.finished.push_back(Completion {
                request,
                outcome: Outcome::DriverError,
            });
            self.run_drain();
            return;
        };

        match self.build_control_area(id, request) {
            Ok(()) => {
                // Sense fetches go to the head so an intervening command
                // cannot clear the contingent allegiance they refer to
                let opcode = self
                    .pool
                    .get(id)
                    .request
                    .as_ref()
                    .map(request::Request::opcode)
                    .unwrap_or(0);
                if opcode == 0x03 {
                    self.issue.push_front(id);
                } else {
                    self.issue.push_back(id);
                }
            }
            Err(request) => {
                log::error!(
                    "scsi{} : request {} does not fit a control area",
                    self.cfg.unit,
                    request.id.0
                );
                self.pool.release(id);
                self.finished.push_back(Completion {
                    request,
                    outcome: Outcome::DriverError,
                });
            }
        }
        self.run_drain();
    }

    /// Fill in the control area for a freshly drawn CCB
    fn build_control_area(&mut self, id: CcbId, request: Request) -> std::result::Result<(), Request> {
        let datain = if matches!(request.direction, DataDirection::In | DataDirection::Unknown) {
            build_data_insns(&request.segments, true, &self.layout)
        } else {
            vec![]
        };
        let dataout = if matches!(request.direction, DataDirection::Out | DataDirection::Unknown) {
            build_data_insns(&request.segments, false, &self.layout)
        } else {
            vec![]
        };
        if datain.len() + dataout.len() > ccb::MAX_DATA_INSNS {
            return Err(request);
        }

        let target = request.target;
        let want_sdtr = self.cfg.synchronous && (self.initiate_sdtr & (1 << target)) != 0;
        let identify = msg::IDENTIFY
            | if self.cfg.disconnect {
                msg::IDENTIFY_DISCONNECT
            } else {
                0
            }
            | (request.lun & 7);
        let select = self.sync[target as usize].select_indirect;
        let other = self.layout.addr(Entry::OtherTransfer);
        let saved = self.layout.addr(Entry::DataTransfer);
        let max_offset = self.caps.max_offset;

        {
            let ccb = self.pool.get_mut(id);
            ccb.reset_for_build();
            ccb.ctrl.select = select;
            ccb.ctrl.msgout.push(identify);
            if want_sdtr {
                for b in [msg::EXTENDED, 3, msg::EXT_SDTR, SDTR_REQ_PERIOD_X4, max_offset] {
                    ccb.ctrl.msgout.push(b);
                }
                ccb.sdtr_sent = true;
            }
            for b in &request.cdb {
                ccb.ctrl.cmdout.push(*b);
            }
            ccb.ctrl.datain_entry = if datain.is_empty() {
                other
            } else {
                ccb.data_start()
            };
            ccb.ctrl.dataout_entry = if dataout.is_empty() {
                other
            } else {
                ccb.data_start() + datain.len() as u32 * crate::chip::script::INSN_BYTES
            };
            ccb.ctrl.data = datain;
            ccb.ctrl.data.extend_from_slice(&dataout);
            ccb.ctrl.saved_data_pointer = saved;
            ccb.request = Some(request);
        }
        if want_sdtr {
            self.initiate_sdtr &= !(1 << target);
        }
        Ok(())
    }

    /// Move admitted requests into free schedule slots and run deferred
    /// completion callbacks, looping until a pass makes no progress. A
    /// single process-wide flag stops the recursion that re-entrant
    /// submission from a callback would otherwise cause.
    pub(crate) fn run_drain(&mut self) {
        if self.drain_running {
            return;
        }
        self.drain_running = true;

        loop {
            let mut progress = false;

            if self.state == AdapterState::Disabled {
                while let Some(id) = self.issue.pop_front() {
                    let request = self.pool.get_mut(id).request.take();
                    self.pool.release(id);
                    if let Some(request) = request {
                        self.finished.push_back(Completion {
                            request,
                            outcome: Outcome::DriverError,
                        });
                    }
                    progress = true;
                }
            } else {
                let mut index = 0;
                while index < self.issue.len() {
                    if self.outstanding >= self.schedule.capacity() {
                        break;
                    }
                    let id = self.issue[index];
                    let nexus = self
                        .pool
                        .get(id)
                        .request
                        .as_ref()
                        .map(|r| (r.target as usize, r.lun as usize));
                    let Some((target, lun)) = nexus else {
                        self.issue.remove(index);
                        self.pool.release(id);
                        continue;
                    };
                    // One command per target/lun without tagging; later
                    // commands for the same nexus keep their queue order
                    if self.busy[target % MAX_TARGETS][lun % MAX_LUNS] > 0 {
                        index += 1;
                        continue;
                    }
                    self.issue.remove(index);
                    self.dispatch(id);
                    progress = true;
                    if self.state == AdapterState::Disabled {
                        break;
                    }
                }
            }

            // Completion callbacks run here, outside the structure
            // mutations above. A callback may submit new work; the drain
            // flag turns that into a queue append picked up next pass.
            while let Some(mut completion) = self.finished.pop_front() {
                progress = true;
                if let Some(done) = completion.request.take_done() {
                    done(self, completion.request, completion.outcome);
                }
            }

            if !progress {
                break;
            }
        }

        debug_assert!(self.pool.consistent());
        if SCHED_TRACE {
            self.dump_queues();
        }
        self.drain_running = false;
    }

    /// Publish one admitted command into a schedule slot and kick the chip
    fn dispatch(&mut self, id: CcbId) {
        if self.state == AdapterState::Disabled {
            log::warn!("scsi{} : driver disabled", self.cfg.unit);
            self.abnormal_finished(id, Outcome::DriverError);
            return;
        }

        let Some(slot) = self.schedule.find_free() else {
            // The admission throttle keeps outstanding work within the
            // table; an armed-full table here means the bookkeeping lied
            log::error!("scsi{} : no free slot", self.cfg.unit);
            self.abnormal_finished(id, Outcome::DriverError);
            self.disable(recovery::FatalFault::ScheduleExhausted);
            return;
        };

        let (entry, target, lun) = {
            let slot_addr = schedule::slot_addr(slot);
            let ccb = self.pool.get_mut(id);
            ccb.ctrl.jump_dest = slot_addr;
            ccb.membership = Membership::Slotted(slot);
            ccb.nexus = NexusState::Selecting;
            let (target, lun) = ccb
                .request
                .as_ref()
                .map(|r| (r.target as usize, r.lun as usize))
                .unwrap_or((0, 0));
            (ccb.entry_addr(), target, lun)
        };

        self.schedule.publish(slot, entry);
        self.busy[target % MAX_TARGETS][lun % MAX_LUNS] += 1;
        self.outstanding += 1;
        self.expecting_iid = false;
        self.expecting_sto = false;
        if self.caps.single_current {
            self.current = Some(id);
        }

        if SCHED_TRACE {
            log::debug!(
                "scsi{} : slot {} armed for target {} lun {}",
                self.cfg.unit,
                slot,
                target,
                lun
            );
        }

        if self.state == AdapterState::Idle {
            self.state = AdapterState::Running;
            self.chip
                .write32(Reg::Dsp, self.layout.addr(Entry::Schedule));
        } else {
            self.chip
                .write8(Reg::Istat, RegIstat(0).with_sigp(true).0);
        }
    }

    /// Ask for a request to be taken back. Queued requests die on the
    /// spot; dispatched ones are flagged and reclaimed when the chip
    /// reports them finished or the adapter resets.
    pub fn abort(&mut self, id: RequestId) -> AbortOutcome {
        // A pending interrupt may already carry this command's fate
        if self.chip.irq() {
            log::warn!("scsi{} : servicing dropped interrupt before abort", self.cfg.unit);
            self.service_interrupt();
        }

        if let Some(pos) = self
            .issue
            .iter()
            .position(|&c| self.pool.get(c).request_id() == Some(id))
        {
            let ccb_id = self.issue[pos];
            self.issue.remove(pos);
            self.abnormal_finished(ccb_id, Outcome::Aborted);
            self.run_drain();
            return AbortOutcome::Dequeued;
        }

        if let Some(ccb_id) = self.pool.by_request(id) {
            let ccb = self.pool.get(ccb_id);
            if ccb.membership.dispatched() {
                if ccb.ctrl.result_valid() {
                    // Finished, but the completion signal got lost
                    log::warn!(
                        "scsi{} : found finished command {} during abort",
                        self.cfg.unit,
                        id.0
                    );
                    self.retire(ccb_id);
                    self.run_drain();
                    return AbortOutcome::Completed;
                }
                self.pool.get_mut(ccb_id).abort_requested = true;
                return AbortOutcome::Flagged;
            }
        }
        AbortOutcome::NotFound
    }

    /// Retire a command whose capture cells hold a chip-written result
    pub(crate) fn retire(&mut self, id: CcbId) {
        let outcome = {
            let ccb = self.pool.get_mut(id);
            ccb.nexus = NexusState::Completing;
            if ccb.abort_requested {
                Outcome::Aborted
            } else if ccb.is_sense {
                Outcome::DeviceError {
                    status: STATUS_CHECK_CONDITION,
                    message: ccb.ctrl.msgin,
                }
            } else if ccb.ctrl.status == STATUS_GOOD {
                Outcome::Success {
                    status: ccb.ctrl.status,
                    message: ccb.ctrl.msgin,
                }
            } else {
                Outcome::DeviceError {
                    status: ccb.ctrl.status,
                    message: ccb.ctrl.msgin,
                }
            }
        };
        self.abnormal_finished(id, outcome);
    }

    /// Pull a command out of whatever structure holds it and queue its
    /// completion. The chip must not be executing it when this runs.
    pub(crate) fn abnormal_finished(&mut self, id: CcbId, outcome: Outcome) {
        if let Some(pos) = self.issue.iter().position(|&x| x == id) {
            self.issue.remove(pos);
        }

        let (was_dispatched, slot, request) = {
            let ccb = self.pool.get_mut(id);
            let slot = if let Membership::Slotted(s) = ccb.membership {
                Some(s)
            } else {
                None
            };
            (ccb.membership.dispatched(), slot, ccb.request.take())
        };

        if let Some(slot) = slot {
            self.schedule.clear(slot);
        }
        if was_dispatched {
            if let Some(request) = &request {
                let row = &mut self.busy[request.target as usize % MAX_TARGETS]
                    [request.lun as usize % MAX_LUNS];
                *row = row.saturating_sub(1);
            }
            self.outstanding = self.outstanding.saturating_sub(1);
        }
        if self.current == Some(id) {
            self.current = None;
        }
        self.pool.release(id);
        if let Some(request) = request {
            self.finished.push_back(Completion { request, outcome });
        }
    }

    /// Sweep dispatched commands whose status and message capture cells
    /// both hold chip-written values. Retiring one invalidates the scan,
    /// so restart until a clean pass.
    pub(crate) fn sweep_completions(&mut self) -> bool {
        let mut any = false;
        'restart: loop {
            for index in 0..self.pool.size() {
                let id = CcbId(index);
                let ccb = self.pool.get(id);
                if ccb.membership.dispatched() && ccb.ctrl.result_valid() {
                    self.retire(id);
                    any = true;
                    continue 'restart;
                }
            }
            break;
        }
        any
    }

    /// Negotiated transfer parameters for one target
    pub fn sync_params(&self, target: u8) -> &SyncParams {
        &self.sync[target as usize % MAX_TARGETS]
    }

    fn dump_queues(&self) {
        use itertools::Itertools;
        log::debug!(
            "scsi{} : issue [{}] outstanding {} free {}/{}",
            self.cfg.unit,
            self.issue.iter().map(|id| id.0.to_string()).join(" "),
            self.outstanding,
            self.pool.free_count(),
            self.pool.size()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::request::{AbortOutcome, DataSegment, Outcome, Request, RequestId};
    use super::*;
    use crate::test::{completion_log, read_request, recorded, small_config, test_adapter};

    fn result_cells(adapter: &mut Adapter, id: u64, status: u8, message: u8) {
        let ccb = adapter.pool.by_request(RequestId(id)).unwrap();
        let ctrl = &mut adapter.pool.get_mut(ccb).ctrl;
        ctrl.status = status;
        ctrl.msgin = message;
    }

    fn fire_completion_signal(adapter: &mut Adapter, chip: &crate::chip::testchip::TestChipHandle) {
        chip.0.borrow_mut().push_read(Reg::Istat, 0x04);
        adapter.service_interrupt();
    }

    #[test]
    fn test_submit_starts_idle_chip() {
        let log = completion_log();
        let (mut adapter, chip) = test_adapter(small_config(2));

        adapter.submit(read_request(&log, 1, 0));

        assert_eq!(adapter.state(), AdapterState::Running);
        assert_eq!(adapter.outstanding, 1);
        assert_eq!(adapter.busy[0][0], 1);
        assert_eq!(adapter.schedule.armed().len(), 1);
        assert_eq!(
            chip.0.borrow().last_write(Reg::Dsp),
            Some(adapter.layout.addr(Entry::Schedule))
        );
        assert!(log.borrow().is_empty());
        assert!(adapter.pool.consistent());
    }

    #[test]
    fn test_second_dispatch_signals_re_poll() {
        let log = completion_log();
        let (mut adapter, chip) = test_adapter(small_config(2));

        adapter.submit(read_request(&log, 1, 0));
        let dsp_writes = chip.0.borrow().writes(Reg::Dsp).len();
        adapter.submit(read_request(&log, 2, 1));

        // Second command is published and the chip told to re-poll, not
        // restarted
        assert_eq!(adapter.schedule.armed().len(), 2);
        assert_eq!(chip.0.borrow().writes(Reg::Dsp).len(), dsp_writes);
        assert_eq!(
            chip.0.borrow().last_write(Reg::Istat),
            Some(u32::from(RegIstat(0).with_sigp(true).0))
        );
    }

    #[test]
    fn test_three_targets_two_slots() {
        let log = completion_log();
        let (mut adapter, chip) = test_adapter(small_config(2));

        adapter.submit(read_request(&log, 1, 0));
        adapter.submit(read_request(&log, 2, 1));
        adapter.submit(read_request(&log, 3, 2));

        // Two dispatched, one retained in the admission queue
        assert_eq!(adapter.outstanding, 2);
        assert_eq!(adapter.issue.len(), 1);

        // Completing one frees its slot; the third moves up
        result_cells(&mut adapter, 1, STATUS_GOOD, 0);
        fire_completion_signal(&mut adapter, &chip);

        assert_eq!(adapter.outstanding, 2);
        assert!(adapter.issue.is_empty());
        assert_eq!(
            log.borrow().as_slice(),
            &[(1, Outcome::Success { status: 0, message: 0 })]
        );
        assert!(adapter.pool.consistent());
    }

    #[test]
    fn test_one_command_per_nexus() {
        let log = completion_log();
        let cfg = AdapterConfig {
            cmd_per_lun: 3,
            ..small_config(4)
        };
        let (mut adapter, chip) = test_adapter(cfg);

        adapter.submit(read_request(&log, 1, 0));
        adapter.submit(read_request(&log, 2, 0));
        adapter.submit(read_request(&log, 3, 0));

        assert_eq!(adapter.busy[0][0], 1);
        assert_eq!(adapter.outstanding, 1);
        assert_eq!(adapter.issue.len(), 2);

        result_cells(&mut adapter, 1, STATUS_GOOD, 0);
        fire_completion_signal(&mut adapter, &chip);

        // FIFO per nexus: 2 dispatched next, 3 still waiting
        assert_eq!(adapter.busy[0][0], 1);
        assert_eq!(adapter.issue.len(), 1);
        let next = adapter.issue[0];
        assert_eq!(
            adapter.pool.get(next).request_id(),
            Some(RequestId(3))
        );
    }

    #[test]
    fn test_bad_target_rejected() {
        let log = completion_log();
        let (mut adapter, _chip) = test_adapter(small_config(2));

        adapter.submit(read_request(&log, 1, 9));
        adapter.submit(read_request(&log, 2, 7)); // our own id

        assert_eq!(
            log.borrow().as_slice(),
            &[(1, Outcome::BadTarget), (2, Outcome::BadTarget)]
        );
        assert_eq!(adapter.outstanding, 0);
    }

    #[test]
    fn test_no_free_slot_quarantines() {
        let log = completion_log();
        let (mut adapter, _chip) = test_adapter(small_config(1));

        // Inject the invariant violation: the table claims no free slot
        // while the outstanding bookkeeping says there is room
        adapter.schedule.publish(0, 0xdead_0000);
        adapter.submit(read_request(&log, 1, 0));

        assert_eq!(adapter.state(), AdapterState::Disabled);
        assert_eq!(log.borrow().as_slice(), &[(1, Outcome::DriverError)]);

        // Everything submitted afterwards fails immediately
        adapter.submit(read_request(&log, 2, 1));
        assert_eq!(log.borrow().last(), Some(&(2, Outcome::DriverError)));
        assert!(adapter.pool.consistent());
    }

    #[test]
    fn test_abort_queued_command_no_chip_interaction() {
        let log = completion_log();
        let (mut adapter, chip) = test_adapter(small_config(2));

        adapter.submit(read_request(&log, 1, 0));
        adapter.submit(read_request(&log, 2, 0)); // queued behind 1

        let trace_before = chip.0.borrow().trace_len();
        let outcome = adapter.abort(RequestId(2));

        assert_eq!(outcome, AbortOutcome::Dequeued);
        assert_eq!(log.borrow().as_slice(), &[(2, Outcome::Aborted)]);
        assert_eq!(chip.0.borrow().trace_len(), trace_before);
        assert!(adapter.pool.consistent());
    }

    #[test]
    fn test_abort_dispatched_command_is_deferred() {
        let log = completion_log();
        let (mut adapter, chip) = test_adapter(small_config(2));

        adapter.submit(read_request(&log, 1, 0));
        assert_eq!(adapter.abort(RequestId(1)), AbortOutcome::Flagged);
        assert!(log.borrow().is_empty());

        // Physically reclaimed only once the chip reports it finished
        result_cells(&mut adapter, 1, STATUS_GOOD, 0);
        fire_completion_signal(&mut adapter, &chip);
        assert_eq!(log.borrow().as_slice(), &[(1, Outcome::Aborted)]);
    }

    #[test]
    fn test_abort_unknown_request() {
        let (mut adapter, _chip) = test_adapter(small_config(2));
        assert_eq!(adapter.abort(RequestId(42)), AbortOutcome::NotFound);
    }

    #[test]
    fn test_reentrant_submit_from_completion_callback() {
        let log = completion_log();
        let log_outer = log.clone();
        let log_inner = log.clone();
        let (mut adapter, chip) = test_adapter(small_config(2));

        let first = Request::new(1, 0, 0, &[0x08, 0, 0, 0, 1, 0], move |adapter, req, out| {
            log_outer.borrow_mut().push((req.id.0, out));
            adapter.submit(
                Request::new(2, 1, 0, &[0x00, 0, 0, 0, 0, 0], recorded(&log_inner)),
            );
        })
        .with_data(
            request::DataDirection::In,
            vec![DataSegment { addr: 0x8000, len: 512 }],
        );
        adapter.submit(first);

        result_cells(&mut adapter, 1, STATUS_GOOD, 0);
        fire_completion_signal(&mut adapter, &chip);

        // The callback's submission got dispatched by the same drain
        assert_eq!(
            log.borrow().as_slice(),
            &[(1, Outcome::Success { status: 0, message: 0 })]
        );
        assert_eq!(adapter.outstanding, 1);
        assert_eq!(
            adapter.pool.by_request(RequestId(2)).map(|c| adapter.pool.get(c).membership),
            Some(Membership::Slotted(0))
        );
        assert!(adapter.pool.consistent());
    }

    #[test]
    fn test_request_sense_jumps_the_queue() {
        let log = completion_log();
        let (mut adapter, _chip) = test_adapter(small_config(1));

        adapter.submit(read_request(&log, 1, 0));
        adapter.submit(read_request(&log, 2, 1)); // waits: table full
        adapter.submit(Request::new(3, 2, 0, &[0x03, 0, 0, 0, 16, 0], recorded(&log)));

        assert_eq!(adapter.issue.len(), 2);
        assert_eq!(
            adapter.pool.get(adapter.issue[0]).request_id(),
            Some(RequestId(3))
        );
    }

    #[test]
    fn test_exactly_one_completion_across_disable() {
        let log = completion_log();
        let (mut adapter, _chip) = test_adapter(small_config(4));

        for (id, target) in [(1u64, 0u8), (2, 1), (3, 2), (4, 3)] {
            adapter.submit(read_request(&log, id, target));
        }
        adapter.submit(read_request(&log, 5, 0)); // queued behind 1
        assert_eq!(adapter.outstanding, 4);
        assert_eq!(adapter.issue.len(), 1);

        adapter.disable(recovery::FatalFault::MasterParity);
        adapter.run_drain();

        let mut seen: Vec<u64> = log.borrow().iter().map(|(id, _)| *id).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert!(log.borrow().iter().all(|(_, o)| *o == Outcome::DriverError));
        assert_eq!(adapter.pool.free_count(), adapter.pool.size());
        assert!(adapter.pool.consistent());
    }

    #[test]
    fn test_pool_conservation_through_traffic() {
        let log = completion_log();
        let (mut adapter, chip) = test_adapter(small_config(3));

        for round in 0..3u64 {
            for target in 0..3u8 {
                adapter.submit(read_request(&log, round * 3 + u64::from(target) + 1, target));
            }
            for target in 0..3u8 {
                result_cells(&mut adapter, round * 3 + u64::from(target) + 1, STATUS_GOOD, 0);
            }
            fire_completion_signal(&mut adapter, &chip);

            assert!(adapter.pool.consistent());
            assert_eq!(adapter.pool.free_count(), adapter.pool.size());
            assert_eq!(adapter.outstanding, 0);
        }
        assert_eq!(log.borrow().len(), 9);
    }

    #[test]
    fn test_control_area_contract() {
        let log = completion_log();
        let (mut adapter, _chip) = test_adapter(small_config(2));

        adapter.submit(read_request(&log, 1, 3));
        let id = adapter.pool.by_request(RequestId(1)).unwrap();
        let ccb = adapter.pool.get(id);

        // The chip-visible cells carry exactly what the fixed program
        // expects to find
        assert_eq!(ccb.ctrl.select, adapter.sync_params(3).select_indirect);
        assert_eq!(ccb.ctrl.jump_dest, schedule::slot_addr(0));
        assert_eq!(
            ccb.ctrl.saved_data_pointer,
            adapter.layout.addr(Entry::DataTransfer)
        );
        assert_eq!(ccb.ctrl.next, 0);
        // Identify with disconnect privilege, then our opening SDTR
        assert_eq!(ccb.ctrl.msgout[0], 0xc0);
        assert_eq!(ccb.ctrl.msgout.len(), 6);
        assert_eq!(ccb.ctrl.msgout[3..5], [msg::EXT_SDTR, SDTR_REQ_PERIOD_X4]);
        assert!(ccb.sdtr_sent);
        assert_eq!(ccb.ctrl.cmdout.as_slice(), &[0x08, 0, 0, 0, 1, 0]);
        // One data-in descriptor set; data-out parked on the shared handler
        assert_eq!(ccb.ctrl.datain_entry, ccb.data_start());
        assert_eq!(
            ccb.ctrl.dataout_entry,
            adapter.layout.addr(Entry::OtherTransfer)
        );
        assert_eq!(ccb.ctrl.status, ccb::RESULT_SENTINEL);
        assert_eq!(ccb.ctrl.msgin, ccb::RESULT_SENTINEL);
    }

    #[test]
    fn test_oversized_request_fails_cleanly() {
        let log = completion_log();
        let (mut adapter, _chip) = test_adapter(small_config(2));

        let segments = (0..100)
            .map(|i| DataSegment { addr: 0x8000 + i * 512, len: 512 })
            .collect();
        let request = Request::new(1, 0, 0, &[0x28, 0, 0, 0, 0, 0, 0, 0, 100, 0], recorded(&log))
            .with_data(request::DataDirection::In, segments);
        adapter.submit(request);

        assert_eq!(log.borrow().as_slice(), &[(1, Outcome::DriverError)]);
        assert!(adapter.pool.consistent());
    }
}
