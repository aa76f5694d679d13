//! Shared test fixtures

use std::cell::RefCell;
use std::rc::Rc;

use crate::chip::testchip::TestChipHandle;
use crate::host::request::{DataDirection, DataSegment, Outcome, Request};
use crate::host::{Adapter, AdapterConfig};

/// Record of (request id, outcome) pairs delivered through callbacks
pub type CompletionLog = Rc<RefCell<Vec<(u64, Outcome)>>>;

pub fn completion_log() -> CompletionLog {
    Rc::new(RefCell::new(vec![]))
}

/// Completion callback appending to the given log
pub fn recorded(log: &CompletionLog) -> impl FnOnce(&mut Adapter, Request, Outcome) + 'static {
    let log = log.clone();
    move |_, request, outcome| log.borrow_mut().push((request.id.0, outcome))
}

/// Attach an adapter driving a register-level test chip; the handle stays
/// with the caller for programming and inspection
pub fn test_adapter(cfg: AdapterConfig) -> (Adapter, TestChipHandle) {
    let chip = TestChipHandle::new();
    let adapter = Adapter::attach(cfg, Box::new(chip.clone())).unwrap();
    (adapter, chip)
}

pub fn small_config(can_queue: usize) -> AdapterConfig {
    AdapterConfig {
        can_queue,
        ..Default::default()
    }
}

/// A one-block READ(6) for the given target
pub fn read_request(log: &CompletionLog, id: u64, target: u8) -> Request {
    Request::new(id, target, 0, &[0x08, 0, 0, 0, 1, 0], recorded(log)).with_data(
        DataDirection::In,
        vec![DataSegment {
            addr: 0x8000,
            len: 512,
        }],
    )
}
