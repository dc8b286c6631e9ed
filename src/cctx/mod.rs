//! Calling-context trees: per-writer local trees built during recording and
//! the global tree they merge into at teardown.

pub mod global;
pub mod local;

pub use global::GlobalCctxTree;
pub use local::LocalCctxTree;

use std::fmt;

use crate::address::Address;
use crate::types::{Process, Thread};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OmpType {
    Parallel,
    Sync,
    Task,
    Loop,
    Other,
}

/// One edge in a calling-context tree. Equal contexts at the same tree level
/// collapse into a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CallingContext {
    Root,
    Process(Process),
    Thread(Thread),
    SampleAddr(Address),
    GpuKernel(u64),
    OpenMp {
        kind: OmpType,
        addr: Address,
        thread: Thread,
        num_threads: Option<u32>,
    },
    Syscall(i64),
}

impl fmt::Display for CallingContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CallingContext::Root => write!(f, "ROOT"),
            CallingContext::Process(p) => write!(f, "{p}"),
            CallingContext::Thread(t) => write!(f, "{t}"),
            CallingContext::SampleAddr(addr) => write!(f, "sample {addr}"),
            CallingContext::GpuKernel(id) => write!(f, "gpu kernel {id}"),
            CallingContext::OpenMp { kind, addr, .. } => write!(f, "omp {kind:?} {addr}"),
            CallingContext::Syscall(nr) => write!(f, "syscall {nr}"),
        }
    }
}
