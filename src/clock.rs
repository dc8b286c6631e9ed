//! Synchronization between the kernel's event clock and the local trace
//! clock, plus the local clock itself.

use std::sync::OnceLock;

use nix::errno::Errno;

use crate::otf2::Timestamp;
use crate::perf::ring_buffer::{RecordHandler, TaskRecord};
use crate::perf::sys::PERF_SAMPLE_TIME;
use crate::perf::{EventAttr, OpenTarget, RingBuffer, SampleParser};
use crate::types::Thread;

static TRACE_CLOCK: OnceLock<libc::clockid_t> = OnceLock::new();

/// Selects the clock used for local timestamps and, where supported, for the
/// kernel event timestamps via `perf_event_attr.clockid`. Must be called
/// before the first `now()`.
pub fn set_trace_clock(clockid: libc::clockid_t) {
    let _ = TRACE_CLOCK.set(clockid);
}

pub fn trace_clock() -> libc::clockid_t {
    *TRACE_CLOCK.get_or_init(|| libc::CLOCK_MONOTONIC)
}

/// Parses a clock name from the command line.
pub fn clockid_from_name(name: &str) -> Option<libc::clockid_t> {
    match name {
        "monotonic" => Some(libc::CLOCK_MONOTONIC),
        "monotonic-raw" => Some(libc::CLOCK_MONOTONIC_RAW),
        "boottime" => Some(libc::CLOCK_BOOTTIME),
        "realtime" => Some(libc::CLOCK_REALTIME),
        "tai" => Some(libc::CLOCK_TAI),
        _ => None,
    }
}

pub fn now() -> Timestamp {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(trace_clock(), &mut ts);
    }
    Timestamp(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
}

/// The additive offset between kernel event timestamps and the local trace
/// clock: `local = kernel + offset`.
#[derive(Debug, Clone, Copy)]
pub struct ClockConverter {
    offset: i64,
}

impl ClockConverter {
    pub fn identity() -> ClockConverter {
        ClockConverter { offset: 0 }
    }

    pub fn with_offset(offset: i64) -> ClockConverter {
        ClockConverter { offset }
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn convert(&self, kernel_time: u64) -> Timestamp {
        Timestamp((kernel_time as i64).wrapping_add(self.offset) as u64)
    }
}

struct SyncSampleHandler {
    parser: SampleParser,
    kernel_time: Option<u64>,
}

impl RecordHandler for SyncSampleHandler {
    fn handle_sample(&mut self, data: &[u8], _misc: u16) {
        if let Some(sample) = self.parser.parse(data) {
            if self.kernel_time.is_none() {
                self.kernel_time = sample.time;
            }
        }
    }

    fn handle_fork(&mut self, record: &TaskRecord) {
        if self.kernel_time.is_none() && record.time != 0 {
            self.kernel_time = Some(record.time);
        }
    }
}

/// Establishes the clock offset once at startup.
///
/// The precise protocol arms an 8-byte write watchpoint on a local cell and
/// writes the current local time into it; the kernel synthesizes a sample
/// whose `time` field is that same instant in the kernel domain. Hardened or
/// old kernels refuse breakpoint events, then a one-shot instructions event
/// observing a fork gives a coarser estimate. If both fail the offset is
/// zero and timestamps are only as good as the configured clockid.
pub fn synchronize() -> ClockConverter {
    match breakpoint_sync() {
        Ok(converter) => {
            log::info!("clock offset: {} ns", converter.offset());
            return converter;
        }
        Err(err) => {
            log::debug!("breakpoint clock synchronization unavailable: {err}");
        }
    }

    match fork_sync() {
        Ok(converter) => {
            log::info!("clock offset (fork fallback): {} ns", converter.offset());
            converter
        }
        Err(err) => {
            log::warn!("could not determine the clock offset, assuming zero: {err}");
            ClockConverter::identity()
        }
    }
}

fn breakpoint_sync() -> Result<ClockConverter, Errno> {
    // The watched cell must stay at a stable address until the event is
    // drained.
    let mut cell: Box<u64> = Box::new(0);
    let cell_addr = &*cell as *const u64 as u64;

    let mut attr = EventAttr::breakpoint(cell_addr);
    attr.set_disabled();
    let guard = attr
        .open(OpenTarget::Thread(Thread(0)), None, None)
        .map_err(|_| Errno::ENODEV)?;
    let mut ring = RingBuffer::new(guard.fd(), 1).map_err(|_| Errno::ENOMEM)?;
    guard.enable()?;

    let t0 = now();
    unsafe {
        std::ptr::write_volatile(&mut *cell, t0.nanos());
    }

    guard.disable()?;

    let mut handler = SyncSampleHandler {
        parser: SampleParser::new(PERF_SAMPLE_TIME),
        kernel_time: None,
    };
    ring.drain(&mut handler);

    let kernel_time = handler.kernel_time.ok_or(Errno::ENODATA)?;
    Ok(ClockConverter::with_offset(
        t0.nanos() as i64 - kernel_time as i64,
    ))
}

fn fork_sync() -> Result<ClockConverter, Errno> {
    let mut attr = EventAttr::predefined("instructions").map_err(|_| Errno::ENODEV)?;
    attr.set_disabled();
    attr.set_task();
    attr.set_sample_id_all();
    attr.set_sample_type(PERF_SAMPLE_TIME);
    // One sample at most; we only want the fork record.
    attr.sample_period(u64::MAX / 2);

    let guard = attr
        .open(OpenTarget::Thread(Thread(0)), None, None)
        .map_err(|_| Errno::ENODEV)?;
    let mut ring = RingBuffer::new(guard.fd(), 1).map_err(|_| Errno::ENOMEM)?;
    guard.enable()?;

    let t0 = now();
    match unsafe { nix::unistd::fork() }? {
        nix::unistd::ForkResult::Child => unsafe { libc::_exit(0) },
        nix::unistd::ForkResult::Parent { child } => {
            let _ = nix::sys::wait::waitpid(child, None);
        }
    }
    guard.disable()?;

    let mut handler = SyncSampleHandler {
        parser: SampleParser::new(PERF_SAMPLE_TIME),
        kernel_time: None,
    };
    ring.drain(&mut handler);

    let kernel_time = handler.kernel_time.ok_or(Errno::ENODATA)?;
    Ok(ClockConverter::with_offset(
        t0.nanos() as i64 - kernel_time as i64,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_is_affine() {
        let converter = ClockConverter::with_offset(500);
        assert_eq!(converter.convert(1000), Timestamp(1500));
        let converter = ClockConverter::with_offset(-300);
        assert_eq!(converter.convert(1000), Timestamp(700));
    }

    #[test]
    fn identity_offset_passes_through() {
        let converter = ClockConverter::identity();
        assert_eq!(converter.convert(123456789), Timestamp(123456789));
    }

    #[test]
    fn clock_names() {
        assert_eq!(clockid_from_name("monotonic"), Some(libc::CLOCK_MONOTONIC));
        assert_eq!(
            clockid_from_name("monotonic-raw"),
            Some(libc::CLOCK_MONOTONIC_RAW)
        );
        assert_eq!(clockid_from_name("no-such-clock"), None);
    }
}
