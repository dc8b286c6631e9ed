use std::ffi::OsString;
use std::os::fd::IntoRawFd;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::{Config, DwarfUsage, MonitorType};
use crate::types::Process;

#[derive(Debug, Parser)]
#[command(
    name = "otter",
    version,
    about = r#"
otter records whole-system or per-process activity on Linux into an OTF2
trace archive: sampled instruction pointers with calling contexts, hardware
counters, kernel tracepoints, and block/POSIX I/O.

EXAMPLES:
    # Profile a freshly launched command:
    otter ./yourcommand yourargs

    # Profile an existing process by pid:
    otter -p 12345

    # Record the whole system until Ctrl+C:
    otter -a

    # Record the whole system while a command runs, with block I/O:
    otter -a --block-io ./yourcommand
"#
)]
pub struct Opt {
    /// Record the whole system, one monitor per CPU.
    #[arg(short = 'a', long = "all-cpus")]
    pub all_cpus: bool,

    /// Attach to the process with this pid instead of launching a command.
    #[arg(short = 'p', long = "pid")]
    pub pid: Option<libc::pid_t>,

    /// Output trace directory. {DATE}, {HOSTNAME} and {ENV=NAME} are
    /// expanded.
    #[arg(long = "output-trace", default_value = "otter_trace_{DATE}")]
    pub output_trace: String,

    /// Number of pages of each perf ring buffer (a power of two).
    #[arg(short = 'm', long = "mmap-pages", default_value = "16")]
    pub mmap_pages: usize,

    /// Interval between counter readouts, e.g. "100ms".
    #[arg(short = 'i', long = "readout-interval", default_value = "100ms")]
    pub readout_interval: humantime::Duration,

    /// The event used for sampling interrupts.
    #[arg(short = 'e', long = "event", default_value = "instructions")]
    pub event: String,

    /// Sampling period in event counts.
    #[arg(short = 'c', long = "count", default_value = "11010113")]
    pub count: u64,

    /// Collect samples; without this only topology and switches are
    /// recorded.
    #[arg(long = "no-sampling", action = clap::ArgAction::SetTrue)]
    pub no_sampling: bool,

    /// Request maximally precise sample addresses (PEBS or equivalent).
    #[arg(long = "pebs")]
    pub pebs: bool,

    /// Exclude kernel activity from samples and counters.
    #[arg(short = 'k', long = "exclude-kernel")]
    pub exclude_kernel: bool,

    /// Record full call stacks with every sample.
    #[arg(short = 'g', long = "call-graph")]
    pub call_graph: bool,

    /// The clock used for timestamps (monotonic, monotonic-raw, boottime,
    /// realtime, tai).
    #[arg(long = "clockid", default_value = "monotonic")]
    pub clockid: String,

    /// The event leading each counter group.
    #[arg(long = "metric-leader", default_value = "cpu-clock")]
    pub metric_leader: String,

    /// Read counters every N occurrences of the metric leader.
    #[arg(long = "metric-count", conflicts_with = "metric_frequency")]
    pub metric_count: Option<u64>,

    /// Read counters N times per second.
    #[arg(long = "metric-frequency", default_value = "10")]
    pub metric_frequency: Option<u64>,

    /// Counter to record in the metric group (can be given multiple times).
    #[arg(short = 'E', long = "metric-event")]
    pub metric_event: Vec<String>,

    /// File whose numeric content is sampled as a userspace counter.
    #[arg(short = 'U', long = "userspace-metric-event")]
    pub userspace_metric_event: Vec<PathBuf>,

    /// Kernel tracepoint to record as a metric (group:name, can be given
    /// multiple times).
    #[arg(short = 't', long = "tracepoint")]
    pub tracepoint: Vec<String>,

    /// Record these syscalls on every observed thread (numbers).
    #[arg(long = "syscall")]
    pub syscall: Vec<i64>,

    /// Record block-layer I/O.
    #[arg(long = "block-io")]
    pub block_io: bool,

    /// Record POSIX I/O through the eBPF probe.
    #[arg(long = "posix-io")]
    pub posix_io: bool,

    /// Record NEC vector engine activity.
    #[arg(long = "nec", hide = true)]
    pub nec: bool,

    /// How much DWARF information to use for symbol resolution.
    #[arg(long = "dwarf", value_enum, default_value = "full")]
    pub dwarf: DwarfArg,

    /// Annotate calling contexts with disassembled instructions.
    #[arg(long = "disassemble")]
    pub disassemble: bool,

    /// Restrict whole-system monitoring to this cgroup.
    #[arg(long = "cgroup")]
    pub cgroup: Option<String>,

    /// Path of the control socket for GPU/OpenMP agents.
    #[arg(long = "socket")]
    pub socket: Option<PathBuf>,

    /// Path of the compiled POSIX I/O BPF object.
    #[arg(long = "posix-io-bpf", hide = true)]
    pub posix_io_bpf: Option<PathBuf>,

    /// The command to launch and observe.
    #[arg(trailing_var_arg = true)]
    pub command: Vec<OsString>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DwarfArg {
    Full,
    Local,
    None,
}

impl Opt {
    pub fn into_config(self) -> Result<Config, String> {
        if self.pid.is_some() && !self.command.is_empty() {
            return Err("a pid and a command cannot both be given".into());
        }
        if !self.all_cpus && self.pid.is_none() && self.command.is_empty() {
            return Err(
                "nothing to record; give a command, a pid, or -a for the whole system".into(),
            );
        }
        if self.mmap_pages == 0 || !self.mmap_pages.is_power_of_two() {
            return Err(format!(
                "--mmap-pages must be a power of two, got {}",
                self.mmap_pages
            ));
        }

        let clockid = crate::clock::clockid_from_name(&self.clockid)
            .ok_or_else(|| format!("unknown clock '{}'", self.clockid))?;

        let cgroup_fd = match &self.cgroup {
            Some(name) => {
                let path = PathBuf::from("/sys/fs/cgroup").join(name);
                let file = std::fs::File::open(&path)
                    .map_err(|err| format!("cannot open cgroup {}: {err}", path.display()))?;
                Some(file.into_raw_fd())
            }
            None => None,
        };

        let command_line = std::env::args().collect::<Vec<_>>().join(" ");

        Ok(Config {
            monitor_type: if self.all_cpus {
                MonitorType::CpuSet
            } else {
                MonitorType::Process
            },
            process: self.pid.map(Process).unwrap_or_else(Process::invalid),
            command: self.command,
            trace_path: self.output_trace,
            mmap_pages: self.mmap_pages,
            read_interval: self.readout_interval.into(),
            perf_sampling_event: self.event,
            perf_sampling_period: self.count,
            sampling: !self.no_sampling,
            use_pebs: self.pebs,
            exclude_kernel: self.exclude_kernel,
            enable_callgraph: self.call_graph,
            clockid: Some(clockid),
            metric_leader: self.metric_leader,
            metric_count: self.metric_count,
            metric_frequency: if self.metric_count.is_some() {
                None
            } else {
                self.metric_frequency
            },
            group_counters: self.metric_event,
            userspace_counters: self.userspace_metric_event,
            tracepoint_events: self.tracepoint,
            syscall_filter: self.syscall,
            use_block_io: self.block_io,
            use_posix_io: self.posix_io,
            use_nec: self.nec,
            dwarf: match self.dwarf {
                DwarfArg::Full => DwarfUsage::Full,
                DwarfArg::Local => DwarfUsage::Local,
                DwarfArg::None => DwarfUsage::None,
            },
            disassemble: self.disassemble,
            cgroup_fd,
            socket_path: self.socket,
            posix_io_bpf_object: self.posix_io_bpf,
            command_line,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_mode_is_the_default() {
        let opt = Opt::parse_from(["otter", "echo", "hi"]);
        let config = opt.into_config().unwrap();
        assert_eq!(config.monitor_type, MonitorType::Process);
        assert_eq!(config.command.len(), 2);
        assert!(!config.attach_mode());
    }

    #[test]
    fn all_cpus_selects_cpu_set_mode() {
        let opt = Opt::parse_from(["otter", "-a"]);
        let config = opt.into_config().unwrap();
        assert_eq!(config.monitor_type, MonitorType::CpuSet);
        assert!(!config.has_target());
    }

    #[test]
    fn pid_and_command_conflict() {
        let opt = Opt::parse_from(["otter", "-p", "1234", "echo"]);
        assert!(opt.into_config().is_err());
    }

    #[test]
    fn nothing_to_record_is_an_error() {
        let opt = Opt::parse_from(["otter"]);
        assert!(opt.into_config().is_err());
    }

    #[test]
    fn mmap_pages_must_be_a_power_of_two() {
        let opt = Opt::parse_from(["otter", "-m", "17", "echo"]);
        assert!(opt.into_config().is_err());
    }

    #[test]
    fn unknown_clock_is_rejected() {
        let opt = Opt::parse_from(["otter", "--clockid", "sundial", "echo"]);
        assert!(opt.into_config().is_err());
    }
}
