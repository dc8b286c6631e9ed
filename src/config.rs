//! The configuration object the measurement core consumes. Produced from
//! the command line in `cli.rs`; nothing in the core reads arguments
//! directly.

use std::ffi::OsString;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::Process;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorType {
    /// One monitor per thread of one observed process tree.
    Process,
    /// One monitor per CPU, whole-system.
    CpuSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwarfUsage {
    Full,
    Local,
    None,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub monitor_type: MonitorType,
    /// Attach to this process instead of spawning one.
    pub process: Process,
    /// The command to spawn and observe.
    pub command: Vec<OsString>,
    pub trace_path: String,

    pub mmap_pages: usize,
    pub read_interval: Duration,
    pub perf_sampling_event: String,
    pub perf_sampling_period: u64,
    pub sampling: bool,
    pub use_pebs: bool,
    pub exclude_kernel: bool,
    pub enable_callgraph: bool,
    pub clockid: Option<libc::clockid_t>,

    pub metric_leader: String,
    pub metric_count: Option<u64>,
    pub metric_frequency: Option<u64>,
    pub group_counters: Vec<String>,
    pub userspace_counters: Vec<PathBuf>,
    pub tracepoint_events: Vec<String>,
    pub syscall_filter: Vec<i64>,

    pub use_block_io: bool,
    pub use_posix_io: bool,
    pub use_nec: bool,
    pub dwarf: DwarfUsage,
    pub disassemble: bool,

    pub cgroup_fd: Option<RawFd>,
    pub socket_path: Option<PathBuf>,
    pub posix_io_bpf_object: Option<PathBuf>,

    /// The full invocation, recorded as the archive description.
    pub command_line: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            monitor_type: MonitorType::Process,
            process: Process::invalid(),
            command: Vec::new(),
            trace_path: "otter_trace_{DATE}".into(),
            mmap_pages: 16,
            read_interval: Duration::from_millis(100),
            perf_sampling_event: "instructions".into(),
            perf_sampling_period: 11010113,
            sampling: true,
            use_pebs: false,
            exclude_kernel: false,
            enable_callgraph: false,
            clockid: Some(libc::CLOCK_MONOTONIC),
            metric_leader: "cpu-clock".into(),
            metric_count: None,
            metric_frequency: Some(10),
            group_counters: Vec::new(),
            userspace_counters: Vec::new(),
            tracepoint_events: Vec::new(),
            syscall_filter: Vec::new(),
            use_block_io: false,
            use_posix_io: false,
            use_nec: false,
            dwarf: DwarfUsage::Full,
            disassemble: false,
            cgroup_fd: None,
            socket_path: None,
            posix_io_bpf_object: None,
            command_line: String::new(),
        }
    }
}

impl Config {
    pub fn attach_mode(&self) -> bool {
        !self.process.is_invalid()
    }

    pub fn has_target(&self) -> bool {
        self.attach_mode() || !self.command.is_empty()
    }
}
