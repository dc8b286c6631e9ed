//! Per-process recording: one sampling monitor per observed thread, driven
//! by the ptrace lifecycle tracker.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::sample::ScopeMonitor;
use super::syscall::SyscallMonitor;
use super::MonitorHandle;
use crate::clock::{self, ClockConverter};
use crate::config::Config;
use crate::process::tracker::{LifecycleObserver, ProcessTracker, SuspendedProcess, TracerError};
use crate::process::{get_threads, maps};
use crate::trace::Trace;
use crate::types::{Process, Thread};

/// Spawns and stops per-thread monitors as the tracker reports topology
/// changes. The map is shared with the control plane for the final join.
struct ProcessObserver {
    trace: Arc<Trace>,
    converter: ClockConverter,
    config: Config,
    monitors: Arc<Mutex<FxHashMap<Thread, Vec<MonitorHandle>>>>,
    /// The first monitored process starts its events on exec, so the
    /// spawned command is measured from its very first instruction.
    enable_on_exec: AtomicBool,
}

impl ProcessObserver {
    fn prefill_resolvers(&self, process: Process) {
        self.trace
            .resolvers()
            .new_version(process, clock::now().nanos());
        for region in maps::read_maps(process) {
            if !region.is_executable {
                continue;
            }
            self.trace.resolvers().mmap(
                process,
                clock::now().nanos(),
                region.start,
                region.end,
                region.file_offset,
                &region.name,
            );
        }
    }

    fn start_monitors(&self, thread: Thread) {
        let enable_on_exec = self.enable_on_exec.swap(false, Ordering::SeqCst);

        let mut handles = Vec::new();
        match ScopeMonitor::create(
            self.trace.clone(),
            self.converter,
            thread.as_scope(),
            &self.config,
            enable_on_exec,
        ) {
            Ok(monitor) => handles.push(monitor.spawn()),
            Err(err) => {
                log::error!("failed to create the monitor for {thread}: {err}");
            }
        }

        if !self.config.syscall_filter.is_empty() {
            match SyscallMonitor::create(
                self.trace.clone(),
                self.converter,
                thread,
                &self.config,
            ) {
                Ok(monitor) => handles.push(monitor.spawn()),
                Err(err) => {
                    log::warn!("failed to create the syscall monitor for {thread}: {err}");
                }
            }
        }

        self.monitors.lock().insert(thread, handles);
    }
}

impl LifecycleObserver for ProcessObserver {
    fn process_created(&self, parent: Option<Process>, process: Process, name: &str) {
        self.trace.emplace_process(parent, process, name);
        self.prefill_resolvers(process);
        self.start_monitors(process.as_thread());
    }

    fn thread_created(&self, process: Process, thread: Thread, name: &str) {
        self.trace.emplace_thread(Some(process), thread, name);
        self.start_monitors(thread);
    }

    fn process_exec(&self, process: Process, name: &str) {
        // A fresh address layout; later samples resolve against it.
        self.prefill_resolvers(process);
        self.trace.update_process_name(None, process, name);
    }

    fn thread_exited(&self, thread: Thread) {
        if let Some(handles) = self.monitors.lock().get(&thread) {
            for handle in handles {
                handle.request_stop();
            }
        }
    }
}

pub fn run(config: &Config) -> io::Result<i32> {
    if let Some(clockid) = config.clockid {
        clock::set_trace_clock(clockid);
    }
    crate::symbols::resolver::set_use_dwarf(config.dwarf != crate::config::DwarfUsage::None);

    let trace = Arc::new(Trace::new(config)?);
    let converter = clock::synchronize();
    let monitors: Arc<Mutex<FxHashMap<Thread, Vec<MonitorHandle>>>> =
        Arc::new(Mutex::new(FxHashMap::default()));

    trace.begin_record();

    let result = if config.attach_mode() {
        let observer = Box::new(ProcessObserver {
            trace: trace.clone(),
            converter,
            config: config.clone(),
            monitors: monitors.clone(),
            enable_on_exec: AtomicBool::new(false),
        });
        let process = config.process;
        let mut tracker = ProcessTracker::new(process, true, observer);
        tracker.attach().map_err(io::Error::other)?;

        let detach = tracker.detach_flag();
        if let Err(err) = ctrlc::set_handler(move || {
            detach.store(true, Ordering::SeqCst);
            unsafe {
                libc::kill(process.as_raw(), libc::SIGSTOP);
            }
        }) {
            log::warn!("cannot install the SIGINT handler: {err}");
        }
        log::info!(
            "attached to {process} ({} threads), recording until SIGINT",
            get_threads(process).len()
        );
        tracker.run()
    } else {
        let suspended = SuspendedProcess::launch(&config.command).map_err(io::Error::other)?;
        let process = suspended.process();
        let name = config.command[0].to_string_lossy().into_owned();

        let observer = Box::new(ProcessObserver {
            trace: trace.clone(),
            converter,
            config: config.clone(),
            monitors: monitors.clone(),
            enable_on_exec: AtomicBool::new(true),
        });
        observer.process_created(None, process, &name);

        let mut tracker = ProcessTracker::new(process, false, observer);
        suspended
            .resume(&config.command[0])
            .map_err(io::Error::other)?;
        tracker.run()
    };

    trace.end_record();

    let handles: Vec<MonitorHandle> = monitors
        .lock()
        .drain()
        .flat_map(|(_, handles)| handles)
        .collect();
    for handle in &handles {
        handle.request_stop();
    }
    for handle in handles {
        handle.join();
    }

    trace.finalize()?;
    eprintln!("[ otter: trace written to {} ]", trace.path().display());

    match result {
        Ok(code) => Ok(code),
        Err(TracerError::Killed(signal)) => Ok(128 + signal as i32),
        Err(err) => Err(io::Error::other(err.to_string())),
    }
}
