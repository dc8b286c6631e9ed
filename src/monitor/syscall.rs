//! Per-thread syscall recording through the `raw_syscalls` tracepoints,
//! filtered to the configured syscall numbers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{MonitorHandle, PollSet};
use crate::cctx::{CallingContext, LocalCctxTree};
use crate::clock::{self, ClockConverter};
use crate::config::Config;
use crate::otf2::{CommRef, Event};
use crate::perf::ring_buffer::RecordHandler;
use crate::perf::sys::{PERF_SAMPLE_IDENTIFIER, PERF_SAMPLE_RAW, PERF_SAMPLE_TIME};
use crate::perf::tracepoint::TracepointFormat;
use crate::perf::{EventAttr, EventError, EventGuard, OpenTarget, RingBuffer, SampleParser};
use crate::trace::Trace;
use crate::types::{MeasurementScope, Thread};

/// The calling-context level syscall nodes live at, below process and
/// thread.
const SYSCALL_LEVEL: u64 = 3;

pub struct SyscallMonitor {
    thread: Thread,
    trace: Arc<Trace>,
    converter: ClockConverter,
    tree: LocalCctxTree,
    parser: SampleParser,
    enter_guard: EventGuard,
    exit_guard: EventGuard,
    enter_id: u64,
    ring: RingBuffer,
    id_field_offset: usize,
    id_field_size: usize,
    comm: CommRef,
}

impl SyscallMonitor {
    pub fn create(
        trace: Arc<Trace>,
        converter: ClockConverter,
        thread: Thread,
        config: &Config,
    ) -> Result<SyscallMonitor, EventError> {
        let enter_format = TracepointFormat::by_name("raw_syscalls:sys_enter")?;
        let id_field = enter_format.field("id")?.clone();

        let sample_type = PERF_SAMPLE_IDENTIFIER | PERF_SAMPLE_TIME | PERF_SAMPLE_RAW;
        let mut enter_attr = EventAttr::tracepoint("raw_syscalls:sys_enter")?;
        enter_attr.set_sample_type(sample_type);
        enter_attr.set_clockid(config.clockid);
        enter_attr.set_disabled();
        enter_attr.set_watermark(crate::perf::ring_buffer::watermark_bytes(config.mmap_pages));

        let mut exit_attr = EventAttr::tracepoint("raw_syscalls:sys_exit")?;
        exit_attr.set_sample_type(sample_type);
        exit_attr.set_clockid(config.clockid);
        exit_attr.set_disabled();

        let target = OpenTarget::Thread(thread);
        let enter_guard = enter_attr.open(target, None, None)?;
        let exit_guard = exit_attr.open(target, None, None)?;

        enter_guard
            .set_syscall_filter(&config.syscall_filter)
            .map_err(EventError::OpenFailed)?;
        exit_guard
            .set_syscall_filter(&config.syscall_filter)
            .map_err(EventError::OpenFailed)?;

        // Both streams share one ring so enter/exit stay ordered.
        exit_guard
            .set_output(&enter_guard)
            .map_err(EventError::OpenFailed)?;
        enter_guard.set_nonblocking().map_err(EventError::OpenFailed)?;

        let ring = RingBuffer::new(enter_guard.fd(), config.mmap_pages)
            .map_err(|err| EventError::InvalidEvent(format!("ring buffer mmap failed: {err}")))?;
        let enter_id = enter_guard.id().map_err(EventError::OpenFailed)?;

        let tree = trace
            .create_local_cctx_tree(MeasurementScope::syscall(thread.as_scope()))
            .map_err(|err| EventError::InvalidEvent(format!("writer creation failed: {err}")))?;
        let comm = trace.process_comm(thread);

        Ok(SyscallMonitor {
            thread,
            trace,
            converter,
            tree,
            parser: SampleParser::new(sample_type),
            enter_guard,
            exit_guard,
            enter_id,
            ring,
            id_field_offset: id_field.offset,
            id_field_size: id_field.size,
            comm,
        })
    }

    pub fn spawn(self) -> MonitorHandle {
        let name = format!("syscalls {}", self.thread);
        super::spawn(&name, move |stop| self.run(stop))
    }

    fn run(mut self, stop: Arc<AtomicBool>) {
        let process = self
            .trace
            .get_process_of(self.thread)
            .unwrap_or_else(|| self.thread.as_process());

        let now = clock::now();
        self.tree.writer().write(Event::ThreadBegin {
            time: now,
            comm: self.comm,
        });
        self.tree.cctx_enter(
            now,
            &[
                CallingContext::Process(process),
                CallingContext::Thread(self.thread),
            ],
        );

        if let Err(err) = self.enter_guard.enable() {
            log::error!("failed to enable syscall recording on {}: {err}", self.thread);
        }
        let _ = self.exit_guard.enable();

        let mut poll = PollSet::new();
        poll.add_fd(self.enter_guard.fd());

        loop {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            poll.poll();
            self.drain();
        }

        let _ = self.enter_guard.disable();
        let _ = self.exit_guard.disable();
        self.drain();

        let now = clock::now();
        self.tree.finalize(now);
        self.tree.writer().write(Event::ThreadEnd {
            time: now,
            comm: self.comm,
        });
        self.trace.submit_local_tree(self.tree);
    }

    fn drain(&mut self) {
        let mut handler = SyscallHandler {
            converter: &self.converter,
            tree: &mut self.tree,
            parser: &self.parser,
            enter_id: self.enter_id,
            id_field_offset: self.id_field_offset,
            id_field_size: self.id_field_size,
        };
        self.ring.drain(&mut handler);
    }
}

struct SyscallHandler<'a> {
    converter: &'a ClockConverter,
    tree: &'a mut LocalCctxTree,
    parser: &'a SampleParser,
    enter_id: u64,
    id_field_offset: usize,
    id_field_size: usize,
}

impl RecordHandler for SyscallHandler<'_> {
    fn handle_sample(&mut self, data: &[u8], _misc: u16) {
        let Some(sample) = self.parser.parse(data) else {
            return;
        };
        let (Some(time), Some(identifier), Some(raw)) =
            (sample.time, sample.identifier, &sample.raw)
        else {
            return;
        };
        let time = self.converter.convert(time);
        let time = self.tree.writer().adjust_time(time);

        if identifier == self.enter_id {
            let Some(bytes) = raw.get(self.id_field_offset..self.id_field_offset + self.id_field_size)
            else {
                return;
            };
            let mut buf = [0u8; 8];
            buf[..bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
            let nr = i64::from_ne_bytes(buf);
            self.tree
                .cctx_enter_at(time, SYSCALL_LEVEL, &[CallingContext::Syscall(nr)]);
        } else {
            self.tree.cctx_leave(time, SYSCALL_LEVEL);
        }
    }
}
