//! The trace archive sink.
//!
//! An OTF2 archive is a directory holding a global set of typed definition
//! records plus one event stream per location. This module owns the typed
//! definition data, the per-location event writers (including the monotonic
//! timestamp fixup), and the on-disk serialization of both.

pub mod archive;
pub mod definitions;
pub mod writer;

pub use archive::{expand_trace_path, update_output_link, Archive};
pub use definitions::*;
pub use writer::{Event, EventSink, EventWriter, MetricValue};

use std::fmt;

/// A point in the local trace clock domain, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_nanos(ns: u64) -> Timestamp {
        Timestamp(ns)
    }

    pub fn nanos(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}
