//! The per-scope sampling monitor: owns the sampling event, its ring
//! buffer, the local calling-context tree and the periodic counter reads of
//! one CPU or one thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::counters::{CounterSet, UserspaceCounters};
use super::{MonitorHandle, PollSet};
use crate::clock::{self, ClockConverter};
use crate::config::Config;
use crate::otf2::{CommRef, Event, InterruptGeneratorRef};
use crate::perf::ring_buffer::{
    CommRecord, MmapRecord, RecordHandler, SwitchCpuWideRecord, SwitchRecord, TaskRecord,
};
use crate::perf::sys::*;
use crate::perf::{EventAttr, EventError, EventGuard, OpenTarget, RingBuffer, SampleParser};
use crate::trace::Trace;
use crate::types::{ExecutionScope, MeasurementScope, Process, Thread};
use crate::cctx::{CallingContext, LocalCctxTree};

pub struct ScopeMonitor {
    scope: ExecutionScope,
    trace: Arc<Trace>,
    converter: ClockConverter,
    tree: LocalCctxTree,
    parser: SampleParser,
    guard: EventGuard,
    ring: RingBuffer,
    counters: Option<CounterSet>,
    userspace: Option<UserspaceCounters>,
    comm: CommRef,
    interrupt_generator: InterruptGeneratorRef,
    enable_callgraph: bool,
    enabled_on_exec: bool,
    read_interval: std::time::Duration,
}

impl ScopeMonitor {
    /// Opens the sampling event for `scope` and builds the monitor. With
    /// sampling disabled a dummy event still delivers mmap, comm and
    /// context-switch records.
    pub fn create(
        trace: Arc<Trace>,
        converter: ClockConverter,
        scope: ExecutionScope,
        config: &Config,
        enable_on_exec: bool,
    ) -> Result<ScopeMonitor, EventError> {
        let mut attr = if config.sampling {
            let mut attr = EventAttr::resolve(&config.perf_sampling_event)?;
            attr.sample_period(config.perf_sampling_period);
            attr.set_sample_type(
                PERF_SAMPLE_IP | PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_CPU
                    | PERF_SAMPLE_PERIOD,
            );
            if config.enable_callgraph {
                attr.set_sample_type(PERF_SAMPLE_CALLCHAIN);
            }
            if config.use_pebs {
                attr.set_precise_ip(3);
            }
            attr
        } else {
            let mut attr = EventAttr::predefined("dummy")?;
            attr.set_sample_type(PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_CPU);
            attr
        };

        if config.exclude_kernel {
            attr.set_exclude_kernel();
        }
        attr.set_mmap();
        attr.set_comm();
        attr.set_task();
        attr.set_context_switch();
        attr.set_sample_id_all();
        attr.set_clockid(config.clockid);
        attr.set_watermark(crate::perf::ring_buffer::watermark_bytes(config.mmap_pages));
        if enable_on_exec {
            attr.set_enable_on_exec();
        } else {
            attr.set_disabled();
        }

        let guard = attr.open(OpenTarget::from(scope), None, config.cgroup_fd)?;
        guard.set_nonblocking().map_err(EventError::OpenFailed)?;
        let ring = RingBuffer::new(guard.fd(), config.mmap_pages)
            .map_err(|err| EventError::InvalidEvent(format!("ring buffer mmap failed: {err}")))?;

        let tree = trace
            .create_local_cctx_tree(MeasurementScope::sample(scope))
            .map_err(|err| EventError::InvalidEvent(format!("writer creation failed: {err}")))?;

        let counters = CounterSet::open(&trace, scope, config);
        let userspace = UserspaceCounters::open(&trace, scope, config);

        let comm = match scope {
            ExecutionScope::Thread(thread) => trace.process_comm(thread),
            ExecutionScope::Process(process) => trace.process_comm(process.as_thread()),
            ExecutionScope::Cpu(_) => trace.hardware_comm(),
        };

        let interrupt_generator = trace.interrupt_generator();
        Ok(ScopeMonitor {
            scope,
            trace,
            converter,
            tree,
            parser: SampleParser::new(attr.sample_type()),
            guard,
            ring,
            counters,
            userspace,
            comm,
            interrupt_generator,
            enable_callgraph: config.enable_callgraph,
            enabled_on_exec: enable_on_exec,
            read_interval: config.read_interval,
        })
    }

    pub fn spawn(self) -> MonitorHandle {
        let name = format!("{}", self.scope);
        super::spawn(&name, move |stop| self.run(stop))
    }

    fn run(mut self, stop: Arc<AtomicBool>) {
        let tid = nix::unistd::gettid().as_raw();
        self.trace
            .emplace_monitoring_thread(Thread(tid), &format!("{}", self.scope));

        // Run near the monitored thread; that keeps the ring reads on the
        // same package.
        if let ExecutionScope::Thread(thread) = self.scope {
            if let Ok(mask) =
                nix::sched::sched_getaffinity(nix::unistd::Pid::from_raw(thread.as_raw()))
            {
                let _ = nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &mask);
            }
        }

        self.tree.writer().write(Event::ThreadBegin {
            time: clock::now(),
            comm: self.comm,
        });

        if !self.enabled_on_exec {
            if let Err(err) = self.guard.enable() {
                log::error!("failed to enable sampling on {}: {err}", self.scope);
            }
        }

        let mut poll = PollSet::new();
        poll.add_fd(self.guard.fd());
        if let Err(err) = poll.set_interval(self.read_interval) {
            log::error!("failed to create read timer for {}: {err}", self.scope);
        }

        loop {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            let outcome = poll.poll();
            self.drain();
            if outcome.timer_expired {
                let time = self.converter.convert(clock::now().nanos());
                if let Some(counters) = &mut self.counters {
                    counters.read_and_write(time);
                }
                if let Some(userspace) = &mut self.userspace {
                    userspace.read_and_write(time);
                }
            }
        }

        // Pending records in the kernel ring after disable count as loss.
        let _ = self.guard.disable();
        self.drain();
        self.finish();
    }

    fn drain(&mut self) {
        let mut handler = DrainHandler {
            scope: self.scope,
            trace: &self.trace,
            converter: &self.converter,
            tree: &mut self.tree,
            parser: &self.parser,
            interrupt_generator: self.interrupt_generator,
            enable_callgraph: self.enable_callgraph,
        };
        self.ring.drain(&mut handler);
    }

    fn finish(mut self) {
        let now = clock::now();
        self.tree.finalize(now);
        self.tree.writer().write(Event::ThreadEnd {
            time: now,
            comm: self.comm,
        });
        if let Some(counters) = self.counters.take() {
            counters.finish();
        }
        if let Some(userspace) = self.userspace.take() {
            userspace.finish();
        }
        self.trace.submit_local_tree(self.tree);
    }
}

struct DrainHandler<'a> {
    scope: ExecutionScope,
    trace: &'a Trace,
    converter: &'a ClockConverter,
    tree: &'a mut LocalCctxTree,
    parser: &'a SampleParser,
    interrupt_generator: InterruptGeneratorRef,
    enable_callgraph: bool,
}

impl DrainHandler<'_> {
    /// Makes `[process, thread]` the current context, leaving and entering
    /// as needed.
    fn update_context(
        &mut self,
        time: crate::otf2::Timestamp,
        process: Process,
        thread: Thread,
    ) {
        if self.tree.is_current(&CallingContext::Thread(thread)) {
            return;
        }
        self.tree.cctx_enter_at(
            time,
            1,
            &[
                CallingContext::Process(process),
                CallingContext::Thread(thread),
            ],
        );
    }
}

impl RecordHandler for DrainHandler<'_> {
    fn handle_sample(&mut self, data: &[u8], _misc: u16) {
        let Some(sample) = self.parser.parse(data) else {
            return;
        };
        let (Some(time), Some(ip)) = (sample.time, sample.ip) else {
            return;
        };
        let time = self.converter.convert(time);
        let time = self.tree.writer().adjust_time(time);

        let process = Process(sample.pid.unwrap_or(-1));
        let thread = Thread(sample.tid.unwrap_or(-1));
        self.update_context(time, process, thread);

        let (cctx_ref, unwind_distance) = match &sample.callchain {
            Some(ips) if self.enable_callgraph && !ips.is_empty() => {
                (self.tree.sample_ref_callchain(ips), ips.len() as u32)
            }
            _ => (self.tree.sample_ref(ip), 2),
        };
        self.tree
            .write_sample(time, cctx_ref, unwind_distance, self.interrupt_generator);
    }

    fn handle_mmap(&mut self, record: &MmapRecord) {
        log::debug!(
            "mmap event for {}: {:#x}+{:#x} pgoff {:#x}, {}",
            self.scope,
            record.addr,
            record.len,
            record.pgoff,
            record.filename
        );
        self.trace.resolvers().mmap(
            Process(record.pid),
            clock::now().nanos(),
            crate::address::Address(record.addr),
            crate::address::Address(record.addr.wrapping_add(record.len)),
            crate::address::Address(record.pgoff),
            &record.filename,
        );
    }

    fn handle_fork(&mut self, record: &TaskRecord) {
        let process = Process(record.pid);
        let thread = Thread(record.tid);
        if record.pid == record.tid {
            let parent = Process(record.ppid);
            self.trace.add_process(Some(parent), process);
        } else {
            self.trace.add_thread_to_process(thread, process);
        }
    }

    fn handle_comm(&mut self, record: &CommRecord) {
        let process = Process(record.pid);
        let thread = Thread(record.tid);
        if record.is_exec {
            // The address space was replaced; resolve later samples against
            // a fresh overlay.
            self.trace
                .resolvers()
                .new_version(process, clock::now().nanos());
            self.trace
                .update_process_name(None, process, &record.name);
        }
        self.trace.emplace_thread(Some(process), thread, &record.name);
    }

    fn handle_switch(&mut self, record: &SwitchRecord, body: &[u8]) {
        let Some(trailer) = self.parser.parse_id_trailer(body) else {
            return;
        };
        let Some(time) = trailer.time else {
            return;
        };
        let time = self.converter.convert(time);
        let time = self.tree.writer().adjust_time(time);

        if record.is_switch_out {
            self.tree.cctx_leave(time, 1);
        } else {
            let process = Process(trailer.pid.unwrap_or(-1));
            let thread = Thread(trailer.tid.unwrap_or(-1));
            self.update_context(time, process, thread);
        }
    }

    fn handle_switch_cpu_wide(&mut self, record: &SwitchCpuWideRecord, body: &[u8]) {
        let Some(trailer) = self.parser.parse_id_trailer(body) else {
            return;
        };
        let Some(time) = trailer.time else {
            return;
        };
        let time = self.converter.convert(time);
        let time = self.tree.writer().adjust_time(time);

        if record.is_switch_out {
            self.tree.cctx_leave(time, 1);
        } else {
            let process = Process(trailer.pid.unwrap_or(0));
            let thread = Thread(trailer.tid.unwrap_or(0));
            self.update_context(time, process, thread);
        }
    }
}
