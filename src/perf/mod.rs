//! Kernel event sources: `perf_event_open` attribute construction,
//! availability probing, fd guards, and the mapped ring-buffer reader.

pub mod event;
pub mod guard;
pub mod pmu;
pub mod ring_buffer;
pub mod sys;
pub mod tracepoint;

pub use event::{Availability, EventAttr, OpenTarget};
pub use guard::EventGuard;
pub use ring_buffer::{RecordHandler, RingBuffer, SampleParser};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    /// `perf_event_open` failed; carries the original errno.
    #[error("failed to open perf event: {0}")]
    OpenFailed(nix::errno::Errno),

    /// Sysfs parse failure, unknown PMU, unreadable format file. The event
    /// is dropped from the selection, measurement continues without it.
    #[error("invalid event: {0}")]
    InvalidEvent(String),
}
