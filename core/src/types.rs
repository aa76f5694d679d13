//! Shared small types and host-facing event channels

pub type Byte = u8;
pub type Word = u16;
pub type Long = u32;

/// Communication channel (sender) for out-of-band adapter notices
pub type AdapterEventSender = crossbeam_channel::Sender<AdapterEvent>;

/// Communication channel (receiver) for out-of-band adapter notices
pub type AdapterEventReceiver = crossbeam_channel::Receiver<AdapterEvent>;

/// Out-of-band notice to the owning subsystem. Command results never travel
/// here; they go through the per-request completion callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// Transfer parameters (re)negotiated for a target; no period means
    /// asynchronous
    NegotiatedSync {
        target: u8,
        period_ns: Option<u32>,
        offset: u8,
    },
    /// The SCSI bus was reset as part of recovery
    BusReset,
    /// The adapter entered the terminal disabled state
    Disabled,
    /// A diagnostic self-test section passed
    SelfTestPassed(u8),
    /// A debugging breakpoint INT fired at the given script address
    DebugBreak(Long),
}
