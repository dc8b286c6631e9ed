//! Per-process symbol overlays, versioned by timestamp so that post-`exec`
//! address layouts do not contaminate pre-`exec` samples.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::map::MemoryMap;
use super::resolver::{
    resolver_for_file, KallsymsResolver, PerfMapResolver, StubResolver, UnknownInstructionResolver,
};
use super::LineInfo;
use crate::address::{Address, Mapping};
use crate::types::Process;

/// Filenames that cannot be symbolized and only produce noise.
const IGNORED_PREFIXES: [&str; 6] = [
    "//anon",
    "/dev/zero",
    "/anon_hugepage",
    "/memfd",
    "/SYSV",
    "/dev",
];

/// The symbol overlay of one process at one point in its life.
#[derive(Clone, Default)]
pub struct ProcessMap {
    map: MemoryMap,
}

impl ProcessMap {
    /// A fresh overlay, pre-seeded with the kernel symbols and, if present,
    /// the process's JIT perf map.
    pub fn new(process: Process) -> ProcessMap {
        let mut map = MemoryMap::new();

        let kallsyms = KallsymsResolver::cached();
        if !kallsyms.is_empty() {
            let start = kallsyms.start();
            if let Ok(mapping) = Mapping::new(start, Address(u64::MAX - 1), Address(0)) {
                map.emplace(mapping, kallsyms, Arc::new(UnknownInstructionResolver));
            }
        }

        if let Some(perf_map) = PerfMapResolver::open(process) {
            if let Some((start, end)) = perf_map.range() {
                if let Ok(mapping) = Mapping::new(start, end, start) {
                    map.emplace(mapping, Arc::new(perf_map), Arc::new(UnknownInstructionResolver));
                }
            }
        }

        ProcessMap { map }
    }

    /// Installs a mapping from an mmap event or a `/proc/<pid>/maps` scan.
    pub fn mmap(&mut self, start: Address, end: Address, pgoff: Address, filename: &str) {
        if filename.is_empty()
            || IGNORED_PREFIXES
                .iter()
                .any(|prefix| filename.starts_with(prefix))
        {
            log::debug!("mmap: skipping {filename}");
            return;
        }

        let mapping = match Mapping::new(start, end, pgoff) {
            Ok(mapping) => mapping,
            Err(err) => {
                log::debug!("mmap: {err}");
                return;
            }
        };

        log::debug!("mmap: {mapping} {filename}");

        let resolver = if filename.starts_with('[') {
            Arc::new(StubResolver::new(filename)) as Arc<dyn super::FunctionResolver>
        } else {
            resolver_for_file(filename)
        };

        self.map
            .emplace(mapping, resolver, Arc::new(UnknownInstructionResolver));
    }

    pub fn lookup_line_info(&self, ip: Address) -> LineInfo {
        self.map.lookup_line_info(ip)
    }

    pub fn lookup_instruction(&self, ip: Address) -> Result<String, super::LookupError> {
        self.map.lookup_instruction(ip)
    }

    pub fn num_mappings(&self) -> usize {
        self.map.len()
    }
}

/// All per-process overlays, versioned by the timestamp at which the layout
/// came into existence (process start or exec).
#[derive(Default)]
pub struct Resolvers {
    processes: RwLock<BTreeMap<Process, BTreeMap<u64, ProcessMap>>>,
}

impl Resolvers {
    pub fn new() -> Resolvers {
        Resolvers::default()
    }

    /// Starts a new overlay version at `time`, seeded with kernel and JIT
    /// symbols. Called on first observation of a process and again on exec.
    pub fn new_version(&self, process: Process, time: u64) {
        let mut processes = self.processes.write();
        processes
            .entry(process)
            .or_default()
            .insert(time, ProcessMap::new(process));
    }

    /// Applies an mmap to the overlay version active at `time`.
    pub fn mmap(
        &self,
        process: Process,
        time: u64,
        start: Address,
        end: Address,
        pgoff: Address,
        filename: &str,
    ) {
        let mut processes = self.processes.write();
        let versions = processes.entry(process).or_default();
        if versions.is_empty() {
            versions.insert(0, ProcessMap::new(process));
        }
        let map = match versions.range_mut(..=time).next_back() {
            Some((_, map)) => map,
            // Event predates the first version; apply it there.
            None => versions.values_mut().next().unwrap(),
        };
        map.mmap(start, end, pgoff, filename);
    }

    /// Runs `f` on the overlay whose version is the greatest lower bound of
    /// `time` (clamped to the earliest version for events that predate it).
    fn with_map<R>(&self, process: Process, time: u64, f: impl FnOnce(&ProcessMap) -> R) -> Option<R> {
        let processes = self.processes.read();
        let versions = processes.get(&process)?;
        let map = versions
            .range(..=time)
            .next_back()
            .or_else(|| versions.iter().next())
            .map(|(_, map)| map)?;
        Some(f(map))
    }

    pub fn lookup_line_info(&self, process: Process, time: u64, ip: Address) -> LineInfo {
        self.with_map(process, time, |map| map.lookup_line_info(ip))
            .unwrap_or_else(|| LineInfo::for_address(ip.truncate_bits(48)))
    }

    pub fn lookup_instruction(
        &self,
        process: Process,
        time: u64,
        ip: Address,
    ) -> Result<String, super::LookupError> {
        self.with_map(process, time, |map| map.lookup_instruction(ip))
            .unwrap_or(Err(super::LookupError(ip)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignored_filenames_produce_no_mapping() {
        let mut map = ProcessMap::default();
        map.mmap(Address(0x1000), Address(0x2000), Address(0), "//anon");
        map.mmap(Address(0x1000), Address(0x2000), Address(0), "/dev/zero");
        map.mmap(Address(0x1000), Address(0x2000), Address(0), "/SYSV0123");
        map.mmap(Address(0x1000), Address(0x2000), Address(0), "");
        assert_eq!(map.num_mappings(), 0);
    }

    #[test]
    fn bracketed_names_bind_to_a_stub() {
        let mut map = ProcessMap::default();
        map.mmap(Address(0x1000), Address(0x2000), Address(0), "[vdso]");
        let info = map.lookup_line_info(Address(0x1800));
        assert_eq!(info.function, "[vdso]");
    }

    #[test]
    fn malformed_range_is_dropped() {
        let mut map = ProcessMap::default();
        map.mmap(Address(0x2000), Address(0x1000), Address(0), "[vdso]");
        assert_eq!(map.num_mappings(), 0);
    }

    #[test]
    fn versions_do_not_leak_backwards() {
        let resolvers = Resolvers::new();
        let process = Process(1234);

        resolvers.new_version(process, 100);
        resolvers.mmap(
            process,
            150,
            Address(0x1000),
            Address(0x2000),
            Address(0),
            "[old]",
        );

        resolvers.new_version(process, 200);
        resolvers.mmap(
            process,
            250,
            Address(0x1000),
            Address(0x2000),
            Address(0),
            "[new]",
        );

        let info = resolvers.lookup_line_info(process, 160, Address(0x1800));
        assert_eq!(info.function, "[old]");
        let info = resolvers.lookup_line_info(process, 260, Address(0x1800));
        assert_eq!(info.function, "[new]");
        // Before the first version: clamps to the earliest one.
        let info = resolvers.lookup_line_info(process, 50, Address(0x1800));
        assert_eq!(info.function, "[old]");
    }
}
