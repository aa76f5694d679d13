//! Units of work handed in by the owning subsystem

use arrayvec::ArrayVec;

use super::Adapter;

/// Longest command descriptor block carried in a control area
pub const MAX_CDB: usize = 12;

/// Caller-chosen token identifying a request for abort/reset calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// One physically-contiguous stretch of a data buffer, in bus addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataSegment {
    pub addr: u32,
    pub len: u32,
}

/// Which data phases a command may enter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    None,
    In,
    Out,
    /// Unknown commands get descriptors for both directions
    Unknown,
}

impl DataDirection {
    /// Default direction by command opcode
    pub const fn for_opcode(op: u8) -> Self {
        match op {
            // INQUIRY, MODE SENSE, READ(6), READ(10), READ CAPACITY,
            // REQUEST SENSE
            0x12 | 0x1a | 0x08 | 0x28 | 0x25 | 0x03 => Self::In,
            // MODE SELECT, WRITE(6), WRITE(10)
            0x15 | 0x0a | 0x2a => Self::Out,
            // TEST UNIT READY, START/STOP
            0x00 | 0x1b => Self::None,
            _ => Self::Unknown,
        }
    }
}

/// Final disposition of a request, delivered through its completion
/// callback exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Command ran to completion with GOOD status
    Success { status: u8, message: u8 },
    /// The device reported a non-GOOD status; for CHECK CONDITION the
    /// sense data has already been fetched into the request's sense buffer
    DeviceError { status: u8, message: u8 },
    /// Target out of range, our own id, or nobody answered selection
    BadTarget,
    /// The driver or adapter failed the command
    DriverError,
    Aborted,
    /// Lost to a bus reset
    Reset,
}

/// Disposition of an abort call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// Removed from the admission queue before it ever reached the chip
    Dequeued,
    /// Already dispatched; flagged, reclaimed when the chip lets go of it
    Flagged,
    /// The command had already finished; completion ran normally
    Completed,
    NotFound,
}

/// Disposition of a bus reset call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// Bus reset and adapter reinitialized
    Reset,
    /// The retry budget ran out; the adapter is now disabled
    Disabled,
}

/// Completion callback. Runs inside the drain loop, so it may submit new
/// work re-entrantly through the adapter reference.
pub type DoneFn = Box<dyn FnOnce(&mut Adapter, Request, Outcome)>;

/// A unit of work from the owning subsystem. The core never drops a
/// request on the floor: every submitted request gets its callback invoked
/// exactly once, whatever happens to the adapter.
pub struct Request {
    pub id: RequestId,
    pub target: u8,
    pub lun: u8,
    pub cdb: ArrayVec<u8, MAX_CDB>,
    pub direction: DataDirection,
    pub segments: Vec<DataSegment>,
    /// Where an automatic sense fetch lands after CHECK CONDITION
    pub sense: DataSegment,
    done: Option<DoneFn>,
}

impl Request {
    pub fn new(
        id: u64,
        target: u8,
        lun: u8,
        cdb: &[u8],
        done: impl FnOnce(&mut Adapter, Request, Outcome) + 'static,
    ) -> Self {
        let mut bytes = ArrayVec::new();
        for b in cdb.iter().take(MAX_CDB) {
            bytes.push(*b);
        }
        let direction = if cdb.is_empty() {
            DataDirection::None
        } else {
            DataDirection::for_opcode(cdb[0])
        };
        Self {
            id: RequestId(id),
            target,
            lun,
            cdb: bytes,
            direction,
            segments: vec![],
            sense: DataSegment::default(),
            done: Some(Box::new(done)),
        }
    }

    pub fn with_data(mut self, direction: DataDirection, segments: Vec<DataSegment>) -> Self {
        self.direction = direction;
        self.segments = segments;
        self
    }

    pub fn with_sense(mut self, sense: DataSegment) -> Self {
        self.sense = sense;
        self
    }

    pub fn opcode(&self) -> u8 {
        self.cdb.first().copied().unwrap_or(0)
    }

    pub(crate) fn take_done(&mut self) -> Option<DoneFn> {
        self.done.take()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("lun", &self.lun)
            .field("cdb", &self.cdb)
            .finish_non_exhaustive()
    }
}

/// A finished request waiting for its callback, queued so callbacks run
/// outside the structure mutations that produced them
pub(crate) struct Completion {
    pub request: Request,
    pub outcome: Outcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_by_opcode() {
        assert_eq!(DataDirection::for_opcode(0x08), DataDirection::In); // READ(6)
        assert_eq!(DataDirection::for_opcode(0x12), DataDirection::In); // INQUIRY
        assert_eq!(DataDirection::for_opcode(0x0a), DataDirection::Out); // WRITE(6)
        assert_eq!(DataDirection::for_opcode(0x00), DataDirection::None); // TEST UNIT READY
        assert_eq!(DataDirection::for_opcode(0xee), DataDirection::Unknown);
    }

    #[test]
    fn test_done_can_be_taken_exactly_once() {
        let mut request = Request::new(1, 0, 0, &[0x00], |_, _, _| {});
        assert!(request.take_done().is_some());
        assert!(request.take_done().is_none());
    }

    #[test]
    fn test_cdb_is_bounded() {
        let long = [0u8; 32];
        let request = Request::new(1, 0, 0, &long, |_, _, _| {});
        assert_eq!(request.cdb.len(), MAX_CDB);
    }
}
