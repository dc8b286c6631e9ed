//! Whole-system recording: one sampling monitor per CPU, plus block I/O,
//! POSIX I/O, tracepoint and control-socket monitors, plus a lifecycle
//! watcher when a command or pid is given.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;

use super::bio::{BioMonitor, NvmeMonitor};
use super::posix_io::{PosixIoMonitor, ThreadEvent};
use super::sample::ScopeMonitor;
use super::socket::SocketMonitor;
use super::tracepoint::TracepointMonitor;
use super::MonitorHandle;
use crate::clock;
use crate::config::Config;
use crate::process::tracker::{LifecycleObserver, ProcessTracker, SuspendedProcess, TracerError};
use crate::process::{self, maps};
use crate::topology::Topology;
use crate::trace::Trace;
use crate::types::{Process, Thread};

/// Checks `/proc/sys/kernel/perf_event_paranoid` to give actionable advice
/// when opening events fails with permission errors.
fn paranoid_level() -> Option<i32> {
    std::fs::read_to_string("/proc/sys/kernel/perf_event_paranoid")
        .ok()?
        .trim()
        .parse()
        .ok()
}

pub fn run(config: &Config) -> io::Result<i32> {
    if let Some(clockid) = config.clockid {
        clock::set_trace_clock(clockid);
    }
    crate::symbols::resolver::set_use_dwarf(config.dwarf != crate::config::DwarfUsage::None);

    let trace = Arc::new(Trace::new(config)?);
    let converter = clock::synchronize();

    prefill_from_proc(&trace, config);

    let (posix_tx, posix_rx) = crossbeam_channel::unbounded();
    let mut monitors: Vec<MonitorHandle> = Vec::new();

    for cpu in Topology::instance().cpus() {
        match ScopeMonitor::create(trace.clone(), converter, cpu.as_scope(), config, false) {
            Ok(monitor) => monitors.push(monitor.spawn()),
            Err(err) => {
                if let Some(level) = paranoid_level() {
                    if level > 1 {
                        log::error!(
                            "/proc/sys/kernel/perf_event_paranoid is {level}; \
                             system-wide monitoring needs 1 or lower"
                        );
                    }
                }
                for monitor in monitors {
                    monitor.join();
                }
                return Err(io::Error::other(format!(
                    "failed to create the monitor for {cpu}: {err}"
                )));
            }
        }
        if !config.tracepoint_events.is_empty() {
            if let Some(monitor) = TracepointMonitor::create(trace.clone(), converter, cpu, config)
            {
                monitors.push(monitor.spawn());
            }
        }
    }

    if config.use_block_io {
        match BioMonitor::create(trace.clone(), converter, config) {
            Ok(monitor) => monitors.push(monitor.spawn()),
            Err(err) => log::error!("block i/o recording disabled: {err}"),
        }
        if let Some(monitor) = NvmeMonitor::create(trace.clone(), converter, config) {
            monitors.push(monitor.spawn());
        }
    }

    if config.use_posix_io {
        match PosixIoMonitor::create(trace.clone(), converter, config, posix_rx) {
            Ok(monitor) => {
                // Whole-system mode watches everything that exists already.
                for (_, threads) in process::get_comms_for_running_threads() {
                    for (thread, _) in threads {
                        let _ = posix_tx.send(ThreadEvent::Insert(thread));
                    }
                }
                monitors.push(monitor.spawn());
            }
            Err(err) => log::warn!("posix i/o recording disabled: {err}"),
        }
    }

    if let Some(socket_path) = &config.socket_path {
        match SocketMonitor::create(trace.clone(), socket_path) {
            Ok(monitor) => monitors.push(monitor.spawn()),
            Err(err) => log::error!("control socket disabled: {err}"),
        }
    }

    trace.begin_record();

    let exit_code = if config.has_target() {
        run_target(&trace, config, posix_tx)
    } else {
        wait_for_sigint();
        Ok(0)
    };

    trace.end_record();

    for monitor in &monitors {
        monitor.request_stop();
    }
    for monitor in monitors {
        monitor.join();
    }

    // Register any names learned after the initial scan.
    for (_, threads) in process::get_comms_for_running_threads() {
        for (thread, comm) in threads {
            trace.update_thread_name(thread, &comm);
        }
    }

    trace.finalize()?;
    eprintln!("[ otter: trace written to {} ]", trace.path().display());

    match exit_code {
        Ok(code) => Ok(code),
        Err(TracerError::Killed(signal)) => Ok(128 + signal as i32),
        Err(err) => Err(io::Error::other(err.to_string())),
    }
}

/// Registers the processes, threads and executable mappings that exist
/// before recording starts.
fn prefill_from_proc(trace: &Arc<Trace>, config: &Config) {
    for (process, threads) in process::get_comms_for_running_threads() {
        let name = threads
            .get(&process.as_thread())
            .cloned()
            .unwrap_or_default();
        trace.emplace_process(None, process, &name);
        for (thread, comm) in threads {
            trace.emplace_thread(Some(process), thread, &comm);
        }

        if config.sampling {
            trace.resolvers().new_version(process, 0);
            for region in maps::read_maps(process) {
                if !region.is_executable {
                    continue;
                }
                trace.resolvers().mmap(
                    process,
                    0,
                    region.start,
                    region.end,
                    region.file_offset,
                    &region.name,
                );
            }
        }
    }
}

fn wait_for_sigint() {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_handler = stop.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        stop_for_handler.store(true, Ordering::SeqCst);
    }) {
        log::error!("cannot install the SIGINT handler: {err}");
        return;
    }
    log::info!("recording whole system until SIGINT");
    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(super::POLL_TIMEOUT);
    }
    eprintln!("[ otter: stopping measurements and closing the trace ]");
}

/// Tracks fork/clone/exec/exit of the target so new threads show up in the
/// trace and in the POSIX I/O filter.
struct SystemObserver {
    trace: Arc<Trace>,
    posix_tx: Sender<ThreadEvent>,
}

impl LifecycleObserver for SystemObserver {
    fn process_created(&self, parent: Option<Process>, process: Process, name: &str) {
        self.trace.emplace_process(parent, process, name);
        self.trace
            .resolvers()
            .new_version(process, clock::now().nanos());
        let _ = self.posix_tx.send(ThreadEvent::Insert(process.as_thread()));
    }

    fn thread_created(&self, process: Process, thread: Thread, name: &str) {
        self.trace.emplace_thread(Some(process), thread, name);
        let _ = self.posix_tx.send(ThreadEvent::Insert(thread));
    }

    fn process_exec(&self, process: Process, name: &str) {
        self.trace
            .resolvers()
            .new_version(process, clock::now().nanos());
        self.trace.update_process_name(None, process, name);
    }

    fn thread_exited(&self, thread: Thread) {
        let _ = self.posix_tx.send(ThreadEvent::Remove(thread));
    }
}

fn run_target(
    trace: &Arc<Trace>,
    config: &Config,
    posix_tx: Sender<ThreadEvent>,
) -> Result<i32, TracerError> {
    if config.attach_mode() {
        let process = config.process;
        let observer = Box::new(SystemObserver {
            trace: trace.clone(),
            posix_tx,
        });
        let mut tracker = ProcessTracker::new(process, true, observer);
        tracker.attach()?;

        let detach = tracker.detach_flag();
        let target = process;
        if let Err(err) = ctrlc::set_handler(move || {
            detach.store(true, Ordering::SeqCst);
            // The tracee must enter signal-delivery-stop for the detach.
            unsafe {
                libc::kill(target.as_raw(), libc::SIGSTOP);
            }
        }) {
            log::warn!("cannot install the SIGINT handler: {err}");
        }
        log::info!("attached to {process}, recording until SIGINT");
        tracker.run()
    } else {
        let suspended = SuspendedProcess::launch(&config.command)?;
        let process = suspended.process();
        let name = config.command[0].to_string_lossy().into_owned();
        trace.emplace_process(None, process, &name);
        let _ = posix_tx.send(ThreadEvent::Insert(process.as_thread()));

        let observer = Box::new(SystemObserver {
            trace: trace.clone(),
            posix_tx,
        });
        let mut tracker = ProcessTracker::new(process, false, observer);
        suspended.resume(&config.command[0])?;
        tracker.run()
    }
}
