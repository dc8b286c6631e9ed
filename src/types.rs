use std::fmt;

use libc::pid_t;

/// A kernel task id. `Thread(0)` is the idle-task sentinel that per-CPU
/// context switch records report when a CPU goes idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Thread(pub pid_t);

impl Thread {
    pub fn invalid() -> Thread {
        Thread(-1)
    }

    pub fn is_invalid(self) -> bool {
        self.0 == -1
    }

    pub fn as_raw(self) -> pid_t {
        self.0
    }

    /// The process with the same id. Only valid for main threads.
    pub fn as_process(self) -> Process {
        Process(self.0)
    }

    pub fn as_scope(self) -> ExecutionScope {
        ExecutionScope::Thread(self)
    }
}

impl fmt::Display for Thread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "thread {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Process(pub pid_t);

impl Process {
    pub fn invalid() -> Process {
        Process(-1)
    }

    pub fn idle() -> Process {
        Process(0)
    }

    pub fn is_invalid(self) -> bool {
        self.0 == -1
    }

    pub fn as_raw(self) -> pid_t {
        self.0
    }

    pub fn as_thread(self) -> Thread {
        Thread(self.0)
    }

    pub fn as_scope(self) -> ExecutionScope {
        ExecutionScope::Process(self)
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "process {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cpu(pub i32);

impl Cpu {
    pub fn invalid() -> Cpu {
        Cpu(-1)
    }

    pub fn as_raw(self) -> i32 {
        self.0
    }

    pub fn as_scope(self) -> ExecutionScope {
        ExecutionScope::Cpu(self)
    }
}

impl fmt::Display for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "cpu {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Core {
    pub core: i32,
    pub package: i32,
}

impl Core {
    pub fn new(core: i32, package: i32) -> Core {
        Core { core, package }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Package(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlockDeviceKind {
    Disk,
    Partition,
}

/// A block device from `/sys/dev/block`. Partitions carry the `dev_t` of
/// their parent disk so I/O on a partition can be attributed to the disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockDevice {
    pub dev: u64,
    pub kind: BlockDeviceKind,
    pub parent: Option<u64>,
    pub name: String,
}

impl BlockDevice {
    pub fn disk(dev: u64, name: String) -> BlockDevice {
        BlockDevice {
            dev,
            kind: BlockDeviceKind::Disk,
            parent: None,
            name,
        }
    }

    pub fn partition(dev: u64, name: String, parent: u64) -> BlockDevice {
        BlockDevice {
            dev,
            kind: BlockDeviceKind::Partition,
            parent: Some(parent),
            name,
        }
    }
}

impl fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Something that can execute code and therefore be measured: a thread, a
/// whole process, or a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExecutionScope {
    Thread(Thread),
    Process(Process),
    Cpu(Cpu),
}

impl ExecutionScope {
    pub fn is_cpu(self) -> bool {
        matches!(self, ExecutionScope::Cpu(_))
    }

    pub fn is_thread(self) -> bool {
        matches!(self, ExecutionScope::Thread(_))
    }

    pub fn is_process(self) -> bool {
        matches!(self, ExecutionScope::Process(_))
    }

    pub fn as_cpu(self) -> Option<Cpu> {
        match self {
            ExecutionScope::Cpu(cpu) => Some(cpu),
            _ => None,
        }
    }

    pub fn as_thread(self) -> Option<Thread> {
        match self {
            ExecutionScope::Thread(t) => Some(t),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionScope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecutionScope::Thread(t) => t.fmt(f),
            ExecutionScope::Process(p) => p.fmt(f),
            ExecutionScope::Cpu(c) => c.fmt(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MeasurementKind {
    Sample,
    GroupMetric,
    UserspaceMetric,
    Tracepoint,
    Syscall,
    PosixIo,
    Bio,
    Gpu,
    OpenMp,
}

/// The recording target of one writer: what is measured, and on what.
/// Every local event writer is keyed by its measurement scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MeasurementScope {
    pub kind: MeasurementKind,
    pub target: ScopeTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScopeTarget {
    Scope(ExecutionScope),
    BlockDevice(u64),
}

impl MeasurementScope {
    pub fn sample(scope: ExecutionScope) -> MeasurementScope {
        MeasurementScope {
            kind: MeasurementKind::Sample,
            target: ScopeTarget::Scope(scope),
        }
    }

    pub fn group_metric(scope: ExecutionScope) -> MeasurementScope {
        MeasurementScope {
            kind: MeasurementKind::GroupMetric,
            target: ScopeTarget::Scope(scope),
        }
    }

    pub fn userspace_metric(scope: ExecutionScope) -> MeasurementScope {
        MeasurementScope {
            kind: MeasurementKind::UserspaceMetric,
            target: ScopeTarget::Scope(scope),
        }
    }

    pub fn tracepoint(scope: ExecutionScope) -> MeasurementScope {
        MeasurementScope {
            kind: MeasurementKind::Tracepoint,
            target: ScopeTarget::Scope(scope),
        }
    }

    pub fn syscall(scope: ExecutionScope) -> MeasurementScope {
        MeasurementScope {
            kind: MeasurementKind::Syscall,
            target: ScopeTarget::Scope(scope),
        }
    }

    pub fn posix_io(thread: Thread) -> MeasurementScope {
        MeasurementScope {
            kind: MeasurementKind::PosixIo,
            target: ScopeTarget::Scope(ExecutionScope::Thread(thread)),
        }
    }

    pub fn bio(dev: u64) -> MeasurementScope {
        MeasurementScope {
            kind: MeasurementKind::Bio,
            target: ScopeTarget::BlockDevice(dev),
        }
    }

    /// One scope per agent connection on the control socket.
    pub fn gpu(process: Process) -> MeasurementScope {
        MeasurementScope {
            kind: MeasurementKind::Gpu,
            target: ScopeTarget::Scope(ExecutionScope::Process(process)),
        }
    }

    pub fn openmp(thread: Thread) -> MeasurementScope {
        MeasurementScope {
            kind: MeasurementKind::OpenMp,
            target: ScopeTarget::Scope(ExecutionScope::Thread(thread)),
        }
    }

    pub fn execution_scope(&self) -> Option<ExecutionScope> {
        match self.target {
            ScopeTarget::Scope(scope) => Some(scope),
            ScopeTarget::BlockDevice(_) => None,
        }
    }
}

impl fmt::Display for MeasurementScope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let what = match self.kind {
            MeasurementKind::Sample => "samples",
            MeasurementKind::GroupMetric => "metrics",
            MeasurementKind::UserspaceMetric => "userspace metrics",
            MeasurementKind::Tracepoint => "tracepoints",
            MeasurementKind::Syscall => "syscalls",
            MeasurementKind::PosixIo => "posix i/o",
            MeasurementKind::Bio => "block i/o",
            MeasurementKind::Gpu => "gpu kernels",
            MeasurementKind::OpenMp => "openmp",
        };
        match &self.target {
            ScopeTarget::Scope(scope) => write!(f, "{what} for {scope}"),
            ScopeTarget::BlockDevice(dev) => write!(f, "{what} for device {dev}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels() {
        assert!(Thread::invalid().is_invalid());
        assert!(Process::invalid().is_invalid());
        assert_eq!(Process::idle().as_thread(), Thread(0));
    }

    #[test]
    fn scope_display() {
        let scope = MeasurementScope::sample(Cpu(3).as_scope());
        assert_eq!(scope.to_string(), "samples for cpu 3");
        let scope = MeasurementScope::bio(0x800010);
        assert_eq!(scope.to_string(), "block i/o for device 8388624");
    }
}
