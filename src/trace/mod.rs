//! The trace: owns the archive, the definition registry, the process/thread
//! membership table and the global calling-context tree, and drives the
//! final merge.

pub mod registry;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use chrono::Local;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::cctx::global::{CctxDefinitionFactory, MergeContext};
use crate::cctx::{CallingContext, GlobalCctxTree, LocalCctxTree, OmpType};
use crate::clock;
use crate::config::Config;
use crate::otf2::{
    self, expand_trace_path, Archive, ClockProperties, EventWriter, InterruptGeneratorRef,
    IoAccessMode, LocationGroupType, LocationType, Timestamp,
};
use crate::symbols::{LineInfo, Resolvers};
use crate::types::{
    BlockDevice, BlockDeviceKind, ExecutionScope, MeasurementScope, Process, ScopeTarget, Thread,
};
use registry::{DefKey, Registry};

use crate::otf2::{
    CallingContextRef, Comm, CommGroup, CommRef, IoHandle, IoHandleRef, IoParadigm, IoParadigmRef,
    IoPreCreatedHandleState, IoRegularFile, Location, LocationGroup, LocationRef, MetricClass,
    MetricClassRef, MetricInstance, MetricInstanceRef, MetricMember, MetricMode, Paradigm, Region,
    RegionRef, SourceCodeLocation, SystemTreeNode, SystemTreeNodeProperty, SystemTreeNodeRef,
};

struct Inner {
    archive: Archive,
    registry: Registry,
    root_node: SystemTreeNodeRef,
    bio_node: Option<SystemTreeNodeRef>,
    bio_paradigm: Option<IoParadigmRef>,
    posix_paradigm: Option<IoParadigmRef>,

    thread_names: BTreeMap<Thread, String>,
    threads: FxHashMap<Thread, Process>,
    process_parents: FxHashMap<Process, Option<Process>>,
    gpu_kernel_names: FxHashMap<u64, String>,
    block_devices: FxHashMap<u64, BlockDevice>,

    global_cctx: GlobalCctxTree,
    local_trees: Vec<LocalCctxTree>,
    cctx_finalized: bool,

    start_time: Timestamp,
    stop_time: Timestamp,
}

pub struct Trace {
    inner: Mutex<Inner>,
    resolvers: Resolvers,
    interrupt_generator: InterruptGeneratorRef,
    trace_dir: PathBuf,
    disassemble: bool,
}

impl Trace {
    pub fn new(config: &Config) -> io::Result<Trace> {
        let trace_dir = PathBuf::from(expand_trace_path(&config.trace_path, Local::now()));
        let mut archive = Archive::create(&trace_dir)?;
        log::info!("using trace directory: {}", trace_dir.display());

        archive.set_creator(format!("otter {}", env!("CARGO_PKG_VERSION")));
        archive.set_description(config.command_line.clone());

        let mut registry = Registry::new();

        let hostname = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".into());
        let machine = registry.intern(&hostname);
        let machine_class = registry.intern("machine");
        let root_node = registry.defs.add_system_tree_node(SystemTreeNode {
            name: machine,
            class_name: machine_class,
            parent: None,
        });

        let generator_name = registry.intern("perf interrupt generator");
        let interrupt_generator = registry.defs.add_interrupt_generator(otf2::InterruptGenerator {
            name: generator_name,
            period: config.perf_sampling_period,
        });

        let mut inner = Inner {
            archive,
            registry,
            root_node,
            bio_node: None,
            bio_paradigm: None,
            posix_paradigm: None,
            thread_names: BTreeMap::new(),
            threads: FxHashMap::default(),
            process_parents: FxHashMap::default(),
            gpu_kernel_names: FxHashMap::default(),
            block_devices: FxHashMap::default(),
            global_cctx: GlobalCctxTree::new(),
            local_trees: Vec::new(),
            cctx_finalized: false,
            start_time: Timestamp::ZERO,
            stop_time: Timestamp::ZERO,
        };

        if let Ok(uname) = uname::uname() {
            add_machine_property(&mut inner, "UNAME::SYSNAME", &uname.sysname);
            add_machine_property(&mut inner, "UNAME::NODENAME", &uname.nodename);
            add_machine_property(&mut inner, "UNAME::RELEASE", &uname.release);
            add_machine_property(&mut inner, "UNAME::VERSION", &uname.version);
            add_machine_property(&mut inner, "UNAME::MACHINE", &uname.machine);
        }

        build_cpu_tree(&mut inner);

        if config.use_block_io {
            build_block_io_tree(&mut inner);
        }
        if config.use_posix_io {
            let identification = inner.registry.intern("POSIX");
            let name = inner.registry.intern("POSIX I/O");
            inner.posix_paradigm = Some(inner.registry.defs.add_io_paradigm(IoParadigm {
                identification,
                name,
            }));
        }
        if config.use_nec {
            let name = inner.registry.intern("NEC sampling timer");
            inner.registry.defs.add_interrupt_generator(otf2::InterruptGenerator {
                name,
                period: config.perf_sampling_period,
            });
        }

        Ok(Trace {
            inner: Mutex::new(inner),
            resolvers: Resolvers::new(),
            interrupt_generator,
            trace_dir,
            disassemble: config.disassemble,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.trace_dir
    }

    pub fn resolvers(&self) -> &Resolvers {
        &self.resolvers
    }

    pub fn interrupt_generator(&self) -> InterruptGeneratorRef {
        self.interrupt_generator
    }

    /// The first possible timestamp of the trace.
    pub fn begin_record(&self) {
        let mut inner = self.inner.lock();
        inner.start_time = clock::now();
        let starting_time = Local::now().format("%Y-%m-%dT%H:%M:%S%z").to_string();
        add_machine_property(&mut inner, "STARTING_TIME", &starting_time);
        log::info!("initialization done, start recording");
    }

    /// The last possible timestamp of the trace.
    pub fn end_record(&self) {
        let mut inner = self.inner.lock();
        inner.stop_time = clock::now();
        log::info!("recording done, start finalization");
    }

    pub fn add_property(&self, name: &str, value: &str) {
        let mut inner = self.inner.lock();
        add_machine_property(&mut inner, name, value);
    }

    pub fn add_process(&self, parent: Option<Process>, process: Process) {
        let mut inner = self.inner.lock();
        inner.threads.insert(process.as_thread(), process);
        inner.process_parents.entry(process).or_insert(parent);
    }

    pub fn add_thread_to_process(&self, thread: Thread, process: Process) {
        let mut inner = self.inner.lock();
        inner.threads.insert(thread, process);
    }

    pub fn get_process_of(&self, thread: Thread) -> Option<Process> {
        self.inner.lock().threads.get(&thread).copied()
    }

    /// Registers a process in the system tree, or renames it if it already
    /// exists.
    pub fn emplace_process(&self, parent: Option<Process>, process: Process, name: &str) {
        let mut inner = self.inner.lock();
        inner.threads.insert(process.as_thread(), process);
        inner.process_parents.entry(process).or_insert(parent);

        if inner.registry.has_system_tree_node(&DefKey::Process(process)) {
            drop(inner);
            self.update_process_name(parent, process, name);
            return;
        }

        inner
            .thread_names
            .insert(process.as_thread(), name.to_owned());

        let parent_node = parent
            .and_then(|p| inner.registry.get_system_tree_node(&DefKey::Process(p)))
            .unwrap_or(inner.root_node);

        let registry = &mut inner.registry;
        let iname = registry.intern(name);
        let class = registry.intern("process");
        let node = registry.emplace_system_tree_node(DefKey::Process(process), |_| SystemTreeNode {
            name: iname,
            class_name: class,
            parent: Some(parent_node),
        });
        registry.emplace_location_group(
            DefKey::ExecutionScope(ExecutionScope::Process(process)),
            |_| LocationGroup {
                name: iname,
                group_type: LocationGroupType::Process,
                parent: node,
            },
        );
        let comm_group = registry.emplace_comm_group(DefKey::Process(process), |_| CommGroup {
            name: iname,
            paradigm: Paradigm::Pthread,
        });
        registry.emplace_comm(DefKey::Process(process), |_| Comm {
            name: iname,
            group: comm_group,
        });
    }

    pub fn update_process_name(&self, parent: Option<Process>, process: Process, name: &str) {
        let mut inner = self.inner.lock();
        if !name.is_empty() {
            if !inner.registry.has_system_tree_node(&DefKey::Process(process)) {
                log::warn!("attempting to rename unknown {process} ({name})");
            } else {
                let iname = inner.registry.intern(name);
                let node = inner
                    .registry
                    .get_system_tree_node(&DefKey::Process(process))
                    .unwrap();
                inner.registry.defs.set_system_tree_node_name(node, iname);
                if let Some(group) = inner
                    .registry
                    .get_location_group(&DefKey::ExecutionScope(ExecutionScope::Process(process)))
                {
                    inner.registry.defs.set_location_group_name(group, iname);
                }
                if let Some(comm) = inner.registry.get_comm(&DefKey::Process(process)) {
                    inner.registry.defs.set_comm_name(comm, iname);
                }
                if let Some(group) = inner.registry.get_comm_group(&DefKey::Process(process)) {
                    inner.registry.defs.set_comm_group_name(group, iname);
                }
            }
            drop(inner);
            self.update_thread_name(process.as_thread(), name);
            inner = self.inner.lock();
        }

        if let Some(parent) = parent {
            if let (Some(node), Some(parent_node)) = (
                inner.registry.get_system_tree_node(&DefKey::Process(process)),
                inner.registry.get_system_tree_node(&DefKey::Process(parent)),
            ) {
                inner
                    .registry
                    .defs
                    .set_system_tree_node_parent(node, parent_node);
            }
        }
    }

    /// Registers a thread: its region, its calling-context definition and
    /// its membership in the owning process.
    pub fn emplace_thread(&self, process: Option<Process>, thread: Thread, name: &str) {
        let mut inner = self.inner.lock();
        let process = process
            .or_else(|| inner.threads.get(&thread).copied())
            .unwrap_or_else(|| thread.as_process());
        inner.threads.insert(thread, process);
        drop(inner);

        if !self
            .inner
            .lock()
            .registry
            .has_system_tree_node(&DefKey::Process(process))
        {
            self.emplace_process(None, process, "");
        }

        let mut inner = self.inner.lock();
        if inner.registry.has_calling_context(&DefKey::Thread(thread)) {
            drop(inner);
            self.update_thread_name(thread, name);
            return;
        }

        let display_name = if thread == Thread(0) {
            "<idle>".to_owned()
        } else if name.is_empty() {
            format!("({})", thread.as_raw())
        } else {
            format!("{} ({})", name, thread.as_raw())
        };
        inner.thread_names.insert(thread, name.to_owned());

        let registry = &mut inner.registry;
        let iname = registry.intern(&display_name);
        let region = registry.emplace_region(DefKey::Thread(thread), |_| Region {
            name: iname,
            canonical_name: iname,
            description: iname,
            paradigm: Paradigm::User,
            source_file: iname,
            begin_line: 0,
        });
        registry.emplace_calling_context(DefKey::Thread(thread), |_| otf2::CallingContext {
            region,
            source_code_location: None,
            parent: None,
        });
    }

    pub fn update_thread_name(&self, thread: Thread, name: &str) {
        if name.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        if !inner.registry.has_region(&DefKey::Thread(thread)) {
            log::warn!("attempting to rename unknown {thread} ({name})");
            return;
        }
        let display = format!("{} ({})", name, thread.as_raw());
        let registry = &mut inner.registry;
        let iname = registry.intern(&display);
        let region = registry.get_region(&DefKey::Thread(thread)).unwrap();
        registry.defs.set_region_name(region, iname);
        if let Some(location) = registry.get_location(&DefKey::MeasurementScope(
            MeasurementScope::sample(thread.as_scope()),
        )) {
            registry.defs.set_location_name(location, iname);
        }
        inner.thread_names.insert(thread, name.to_owned());
    }

    /// A thread of the tool itself; gets its own region so time spent in
    /// monitors is attributable.
    pub fn emplace_monitoring_thread(&self, thread: Thread, name: &str) {
        let mut inner = self.inner.lock();
        let registry = &mut inner.registry;
        let iname = registry.intern(&format!("otter::{name}"));
        let region = registry.emplace_region(DefKey::Thread(thread), |_| Region {
            name: iname,
            canonical_name: iname,
            description: iname,
            paradigm: Paradigm::User,
            source_file: iname,
            begin_line: 0,
        });
        registry.emplace_calling_context(DefKey::Thread(thread), |_| otf2::CallingContext {
            region,
            source_code_location: None,
            parent: None,
        });
    }

    /// The comm events of a writer reference the comm of the owning process.
    pub fn process_comm(&self, thread: Thread) -> CommRef {
        let process = self.get_process_of(thread).unwrap_or(thread.as_process());
        let mut inner = self.inner.lock();
        let registry = &mut inner.registry;
        if let Some(comm) = registry.get_comm(&DefKey::Process(process)) {
            return comm;
        }
        let iname = registry.intern(&format!("process {}", process.as_raw()));
        let comm_group = registry.emplace_comm_group(DefKey::Process(process), |_| CommGroup {
            name: iname,
            paradigm: Paradigm::Pthread,
        });
        registry.emplace_comm(DefKey::Process(process), |_| Comm {
            name: iname,
            group: comm_group,
        })
    }

    /// A comm for hardware scopes (CPUs, block devices).
    pub fn hardware_comm(&self) -> CommRef {
        let mut inner = self.inner.lock();
        let registry = &mut inner.registry;
        let iname = registry.intern("hardware");
        let group = registry.emplace_comm_group(DefKey::String("hardware".into()), |_| CommGroup {
            name: iname,
            paradigm: Paradigm::Hardware,
        });
        registry.emplace_comm(DefKey::String("hardware".into()), |_| Comm {
            name: iname,
            group,
        })
    }

    /// Creates the local calling-context tree and event writer of one
    /// measurement scope. No new trees may be created after finalize.
    pub fn create_local_cctx_tree(&self, scope: MeasurementScope) -> io::Result<LocalCctxTree> {
        let writer = self.create_writer(scope, LocationType::CpuThread)?;
        Ok(LocalCctxTree::new(scope, writer))
    }

    /// An event writer without a cctx tree, for metric and I/O scopes.
    pub fn create_writer(
        &self,
        scope: MeasurementScope,
        location_type: LocationType,
    ) -> io::Result<EventWriter> {
        let mut inner = self.inner.lock();
        assert!(
            !inner.cctx_finalized,
            "no writers may be created after finalize"
        );

        let group = self.location_group_for(&mut *inner, &scope);
        let registry = &mut inner.registry;
        let name = registry.intern(&scope.to_string());
        let location = registry.emplace_location(DefKey::MeasurementScope(scope), |_| Location {
            name,
            location_type,
            group,
        });

        let sink = inner.archive.event_sink(location)?;
        Ok(EventWriter::new(location, Box::new(sink)))
    }

    fn location_group_for(&self, inner: &mut Inner, scope: &MeasurementScope) -> otf2::LocationGroupRef {
        let root = inner.root_node;
        match scope.target {
            ScopeTarget::Scope(ExecutionScope::Cpu(cpu)) => {
                let registry = &mut inner.registry;
                let name = registry.intern(&format!("cpu {}", cpu.as_raw()));
                let node = registry
                    .get_system_tree_node(&DefKey::Cpu(cpu))
                    .unwrap_or(root);
                registry.emplace_location_group(
                    DefKey::ExecutionScope(ExecutionScope::Cpu(cpu)),
                    |_| LocationGroup {
                        name,
                        group_type: LocationGroupType::Process,
                        parent: node,
                    },
                )
            }
            ScopeTarget::Scope(ExecutionScope::Thread(thread)) => {
                let process = inner
                    .threads
                    .get(&thread)
                    .copied()
                    .unwrap_or_else(|| thread.as_process());
                let registry = &mut inner.registry;
                let key = DefKey::ExecutionScope(ExecutionScope::Process(process));
                if let Some(group) = registry.get_location_group(&key) {
                    return group;
                }
                let name = registry.intern(&format!("process {}", process.as_raw()));
                registry.emplace_location_group(key, |_| LocationGroup {
                    name,
                    group_type: LocationGroupType::Process,
                    parent: root,
                })
            }
            ScopeTarget::Scope(ExecutionScope::Process(process)) => {
                let registry = &mut inner.registry;
                let name = registry.intern(&format!("process {}", process.as_raw()));
                registry.emplace_location_group(
                    DefKey::ExecutionScope(ExecutionScope::Process(process)),
                    |_| LocationGroup {
                        name,
                        group_type: LocationGroupType::Process,
                        parent: root,
                    },
                )
            }
            ScopeTarget::BlockDevice(dev) => {
                let node = inner.bio_node.unwrap_or(root);
                let device_name = inner
                    .block_devices
                    .get(&dev)
                    .map(|d| d.name.clone())
                    .unwrap_or_else(|| format!("device {dev}"));
                let registry = &mut inner.registry;
                let name = registry.intern(&device_name);
                registry.emplace_location_group(DefKey::BlockDevice(dev), |_| LocationGroup {
                    name,
                    group_type: LocationGroupType::Process,
                    parent: node,
                })
            }
        }
    }

    /// A metric class for a set of named counters.
    pub fn metric_class(&self, members: &[(String, String)]) -> MetricClassRef {
        let mut inner = self.inner.lock();
        let registry = &mut inner.registry;
        let key = members
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        registry.emplace_metric_class(DefKey::String(format!("metric::{key}")), |registry| {
            let members = members
                .iter()
                .map(|(name, unit)| {
                    let name = registry.intern(name);
                    let unit = registry.intern(unit);
                    registry.defs.add_metric_member(MetricMember {
                        name,
                        description: name,
                        mode: MetricMode::AccumulatedStart,
                        unit,
                    })
                })
                .collect();
            MetricClass { members }
        })
    }

    pub fn metric_instance(
        &self,
        class: MetricClassRef,
        recorder: LocationRef,
        scope: LocationRef,
    ) -> MetricInstanceRef {
        let mut inner = self.inner.lock();
        inner.registry.defs.add_metric_instance(MetricInstance {
            class,
            recorder,
            scope,
        })
    }

    /// The pre-created I/O handle of a block device. Partitions resolve to
    /// their parent disk.
    pub fn block_io_handle(&self, dev: u64) -> Option<IoHandleRef> {
        let mut inner = self.inner.lock();
        let disk = match inner.block_devices.get(&dev) {
            Some(device) if device.kind == BlockDeviceKind::Partition => {
                device.parent.unwrap_or(dev)
            }
            Some(_) => dev,
            None => dev,
        };

        if let Some(handle) = inner.registry.get_io_handle(&DefKey::BlockDevice(disk)) {
            return Some(handle);
        }

        let paradigm = inner.bio_paradigm?;
        let node = inner.bio_node?;
        let device_name = inner
            .block_devices
            .get(&disk)
            .map(|d| d.name.clone())
            .unwrap_or_else(|| format!("{}:{}", major(disk), minor(disk)));

        let registry = &mut inner.registry;
        let name = registry.intern(&device_name);
        let file = registry.emplace_io_regular_file(DefKey::BlockDevice(disk), |_| IoRegularFile {
            name,
            scope: node,
        });
        let handle = registry.emplace_io_handle(DefKey::BlockDevice(disk), |_| IoHandle {
            name,
            file,
            paradigm,
            comm: None,
        });
        registry
            .defs
            .add_io_pre_created_handle_state(IoPreCreatedHandleState {
                handle,
                access_mode: IoAccessMode::ReadWrite,
            });
        Some(handle)
    }

    pub fn block_device(&self, dev: u64) -> Option<BlockDevice> {
        self.inner.lock().block_devices.get(&dev).cloned()
    }

    /// The I/O handle of one (thread, fd, reuse generation) triple.
    pub fn posix_io_handle(
        &self,
        thread: Thread,
        fd: i32,
        instance: u64,
        name: &str,
    ) -> Option<IoHandleRef> {
        let mut inner = self.inner.lock();
        let paradigm = inner.posix_paradigm?;
        let root = inner.root_node;
        let registry = &mut inner.registry;
        let iname = registry.intern(name);
        let file = registry
            .emplace_io_regular_file(DefKey::String(format!("posix::{name}")), |_| IoRegularFile {
                name: iname,
                scope: root,
            });
        Some(
            registry.emplace_io_handle(DefKey::PosixHandle(thread, fd, instance), |_| IoHandle {
                name: iname,
                file,
                paradigm,
                comm: None,
            }),
        )
    }

    pub fn register_gpu_kernel(&self, id: u64, name: &str) {
        let mut inner = self.inner.lock();
        inner.gpu_kernel_names.insert(id, name.to_owned());
    }

    /// Hands a finished local tree back for the merge at teardown.
    pub fn submit_local_tree(&self, tree: LocalCctxTree) {
        let mut inner = self.inner.lock();
        assert!(
            !inner.cctx_finalized,
            "local tree submitted after finalize"
        );
        inner.local_trees.push(tree);
    }

    /// Merges all local trees into the global one, writes the per-writer
    /// mapping tables, and closes the archive.
    pub fn finalize(&self) -> io::Result<()> {
        let mut inner = self.inner.lock();
        if inner.cctx_finalized {
            log::error!("trace finalized twice; this is a bug, please report it");
            return Ok(());
        }
        inner.cctx_finalized = true;

        let Inner {
            registry,
            global_cctx,
            local_trees,
            thread_names,
            gpu_kernel_names,
            ..
        } = &mut *inner;

        let mut factory = TraceDefinitionFactory {
            registry,
            resolvers: &self.resolvers,
            thread_names,
            gpu_kernel_names,
            disassemble: self.disassemble,
        };

        for mut tree in local_trees.drain(..) {
            if tree.num_cctx() > 0 {
                let table = global_cctx.merge(&tree, &mut factory);
                tree.writer().write_mapping_table(&table);
            }
            tree.writer().finish();
        }

        let mut stop_time = inner.stop_time;
        if stop_time < inner.start_time {
            stop_time = inner.start_time;
        }
        let clock_properties = ClockProperties {
            ticks_per_second: 1_000_000_000,
            global_offset: inner.start_time,
            trace_length: stop_time.nanos() - inner.start_time.nanos(),
        };

        inner.archive.finish(&inner.registry.defs, &clock_properties)?;
        otf2::update_output_link(&self.trace_dir);
        Ok(())
    }
}

fn add_machine_property(inner: &mut Inner, name: &str, value: &str) {
    let property_name = format!("LO2S::{name}");
    inner
        .archive
        .set_property(property_name.clone(), value.to_owned());

    let root = inner.root_node;
    let registry = &mut inner.registry;
    let name_ref = registry.intern(&property_name);
    let value_ref = registry.intern(value);
    registry.defs.add_system_tree_node_property(SystemTreeNodeProperty {
        node: root,
        name: name_ref,
        value: value_ref,
    });
}

/// Registers package -> core -> cpu system tree nodes.
fn build_cpu_tree(inner: &mut Inner) {
    let topology = crate::topology::Topology::instance();
    let root = inner.root_node;
    for cpu in topology.cpus() {
        let core = topology.core_of(cpu);
        let package = topology.package_of(cpu);
        let registry = &mut inner.registry;

        let package_class = registry.intern("package");
        let package_name = registry.intern(&package.0.to_string());
        let package_node =
            registry.emplace_system_tree_node(DefKey::Package(package), |_| SystemTreeNode {
                name: package_name,
                class_name: package_class,
                parent: Some(root),
            });

        let core_class = registry.intern("core");
        let core_name = registry.intern(&format!("{}:{}", package.0, core.core));
        let core_node = registry.emplace_system_tree_node(DefKey::Core(core), |_| SystemTreeNode {
            name: core_name,
            class_name: core_class,
            parent: Some(package_node),
        });

        let cpu_class = registry.intern("cpu");
        let cpu_name = registry.intern(&cpu.as_raw().to_string());
        registry.emplace_system_tree_node(DefKey::Cpu(cpu), |_| SystemTreeNode {
            name: cpu_name,
            class_name: cpu_class,
            parent: Some(core_node),
        });
    }
}

fn build_block_io_tree(inner: &mut Inner) {
    let registry = &mut inner.registry;
    let name = registry.intern("block devices");
    let class = registry.intern("hardware");
    let root = inner.root_node;
    inner.bio_node = Some(registry.defs.add_system_tree_node(SystemTreeNode {
        name,
        class_name: class,
        parent: Some(root),
    }));

    let identification = registry.intern("block_io");
    let paradigm_name = registry.intern("block layer I/O");
    inner.bio_paradigm = Some(registry.defs.add_io_paradigm(IoParadigm {
        identification,
        name: paradigm_name,
    }));

    inner.block_devices = crate::monitor::bio::enumerate_block_devices();
}

pub fn major(dev: u64) -> u32 {
    unsafe { libc::major(dev as libc::dev_t) }
}

pub fn minor(dev: u64) -> u32 {
    unsafe { libc::minor(dev as libc::dev_t) }
}

/// A readable name for a syscall number; only the hot ones get names, the
/// rest keep their number.
pub fn syscall_name(nr: i64) -> String {
    let name = match nr {
        0 => "read",
        1 => "write",
        2 => "open",
        3 => "close",
        9 => "mmap",
        11 => "munmap",
        22 => "pipe",
        56 => "clone",
        57 => "fork",
        59 => "execve",
        60 => "exit",
        61 => "wait4",
        202 => "futex",
        231 => "exit_group",
        257 => "openat",
        _ => return format!("syscall {nr}"),
    };
    name.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cctx::CallingContext as Ctx;
    use crate::types::Cpu;

    fn test_config(name: &str) -> Config {
        let dir = std::env::temp_dir().join(format!("otter-test-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        Config {
            trace_path: dir.to_string_lossy().into_owned(),
            ..Config::default()
        }
    }

    fn tree_with_one_sample(trace: &Trace) -> LocalCctxTree {
        let mut tree = trace
            .create_local_cctx_tree(MeasurementScope::sample(Cpu(0).as_scope()))
            .unwrap();
        tree.cctx_enter(
            Timestamp(10),
            &[Ctx::Process(Process(100)), Ctx::Thread(Thread(101))],
        );
        let cctx_ref = tree.sample_ref(0x4000);
        tree.write_sample(Timestamp(11), cctx_ref, 2, trace.interrupt_generator());
        tree.finalize(Timestamp(20));
        tree
    }

    #[test]
    fn records_a_minimal_trace() {
        let config = test_config("minimal");
        let trace = Trace::new(&config).unwrap();
        trace.begin_record();

        trace.emplace_process(None, Process(100), "echo hi");
        trace.emplace_thread(Some(Process(100)), Thread(101), "echo");

        let tree = tree_with_one_sample(&trace);
        trace.submit_local_tree(tree);

        trace.end_record();
        trace.finalize().unwrap();

        let definitions =
            std::fs::read_to_string(trace.path().join("definitions")).unwrap();
        assert!(definitions.contains("ClockProperties"));
        assert!(definitions.contains("CallingContext"));
        let strings = std::fs::read_to_string(trace.path().join("definitions")).unwrap();
        assert!(strings.contains("echo hi"));
        assert!(trace.path().join("traces").join("0.evt").exists());

        let _ = std::fs::remove_dir_all(trace.path());
    }

    #[test]
    fn identical_trees_get_identical_mapping_tables() {
        let config = test_config("merge");
        let trace = Trace::new(&config).unwrap();
        trace.begin_record();
        trace.emplace_process(None, Process(100), "worker");

        let first = tree_with_one_sample(&trace);
        let first_refs = first.num_cctx();
        let mut second = trace
            .create_local_cctx_tree(MeasurementScope::sample(Cpu(1).as_scope()))
            .unwrap();
        second.cctx_enter(
            Timestamp(10),
            &[Ctx::Process(Process(100)), Ctx::Thread(Thread(101))],
        );
        second.sample_ref(0x4000);
        second.finalize(Timestamp(20));
        assert_eq!(first_refs, second.num_cctx());

        trace.submit_local_tree(first);
        trace.submit_local_tree(second);
        trace.end_record();
        trace.finalize().unwrap();

        // Both writers end in a mapping table of three refs; the shared
        // global tree means the tables are identical.
        let a = std::fs::read(trace.path().join("traces").join("0.evt")).unwrap();
        let b = std::fs::read(trace.path().join("traces").join("1.evt")).unwrap();
        let table_len = 1 + 4 + 3 * 4;
        assert_eq!(a[a.len() - table_len..], b[b.len() - table_len..]);

        let _ = std::fs::remove_dir_all(trace.path());
    }

    #[test]
    fn syscall_names() {
        assert_eq!(syscall_name(0), "read");
        assert_eq!(syscall_name(59), "execve");
        assert_eq!(syscall_name(9999), "syscall 9999");
    }
}

/// Creates the archive definitions behind new global cctx nodes.
struct TraceDefinitionFactory<'a> {
    registry: &'a mut Registry,
    resolvers: &'a Resolvers,
    thread_names: &'a BTreeMap<Thread, String>,
    gpu_kernel_names: &'a FxHashMap<u64, String>,
    disassemble: bool,
}

impl TraceDefinitionFactory<'_> {
    fn region_for_line_info(&mut self, info: &LineInfo) -> RegionRef {
        let registry = &mut *self.registry;
        let name = registry.intern(&info.function);
        let file = registry.intern(&info.file);
        let line = info.line;
        registry.emplace_region(DefKey::LineInfo(info.clone()), |_| Region {
            name,
            canonical_name: name,
            description: name,
            paradigm: Paradigm::Sampling,
            source_file: file,
            begin_line: line,
        })
    }

    fn scl_for_line_info(&mut self, info: &LineInfo) -> otf2::SourceCodeLocationRef {
        let registry = &mut *self.registry;
        let file = registry.intern(&info.file);
        let line = info.line;
        registry.emplace_source_code_location(DefKey::LineInfo(info.clone()), |_| {
            SourceCodeLocation { file, line }
        })
    }

    fn named_region(&mut self, key: DefKey, name: &str, paradigm: Paradigm) -> RegionRef {
        let registry = &mut *self.registry;
        let iname = registry.intern(name);
        registry.emplace_region(key, |_| Region {
            name: iname,
            canonical_name: iname,
            description: iname,
            paradigm,
            source_file: iname,
            begin_line: 0,
        })
    }
}

impl CctxDefinitionFactory for TraceDefinitionFactory<'_> {
    fn define_cctx(
        &mut self,
        ctx: &CallingContext,
        parent: Option<CallingContextRef>,
        merge: &MergeContext,
    ) -> CallingContextRef {
        match ctx {
            CallingContext::Root => unreachable!("the root never appears in a merge"),

            CallingContext::Process(process) => {
                let name = self
                    .thread_names
                    .get(&process.as_thread())
                    .cloned()
                    .unwrap_or_else(|| format!("process {}", process.as_raw()));
                let region =
                    self.named_region(DefKey::Process(*process), &name, Paradigm::User);
                self.registry
                    .emplace_calling_context(DefKey::Process(*process), |_| otf2::CallingContext {
                        region,
                        source_code_location: None,
                        parent,
                    })
            }

            CallingContext::Thread(thread) => {
                let name = self
                    .thread_names
                    .get(thread)
                    .map(|name| format!("{} ({})", name, thread.as_raw()))
                    .unwrap_or_else(|| format!("thread {}", thread.as_raw()));
                let region = self.named_region(DefKey::Thread(*thread), &name, Paradigm::User);
                self.registry
                    .emplace_calling_context(DefKey::Thread(*thread), |_| otf2::CallingContext {
                        region,
                        source_code_location: None,
                        parent,
                    })
            }

            CallingContext::SampleAddr(addr) => {
                let info = match merge.process {
                    Some(process) => {
                        self.resolvers
                            .lookup_line_info(process, u64::MAX, *addr)
                    }
                    None => LineInfo::for_address(*addr),
                };
                let region = self.region_for_line_info(&info);
                let scl = self.scl_for_line_info(&info);
                let cctx = self.registry.defs.add_calling_context(otf2::CallingContext {
                    region,
                    source_code_location: Some(scl),
                    parent,
                });

                if self.disassemble {
                    if let Some(process) = merge.process {
                        if let Ok(instruction) =
                            self.resolvers.lookup_instruction(process, u64::MAX, *addr)
                        {
                            let name = self.registry.intern("instruction");
                            let value = self.registry.intern(&instruction);
                            self.registry.defs.add_calling_context_property(
                                otf2::CallingContextProperty {
                                    calling_context: cctx,
                                    name,
                                    value,
                                },
                            );
                        }
                    }
                }
                cctx
            }

            CallingContext::GpuKernel(id) => {
                let name = self
                    .gpu_kernel_names
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| format!("kernel {id}"));
                let region = self.named_region(
                    DefKey::String(format!("gpu::{name}")),
                    &name,
                    Paradigm::Compiler,
                );
                self.registry.defs.add_calling_context(otf2::CallingContext {
                    region,
                    source_code_location: None,
                    parent,
                })
            }

            CallingContext::OpenMp {
                kind,
                addr,
                num_threads,
                ..
            } => {
                let name = match (kind, num_threads) {
                    (OmpType::Parallel, Some(n)) => format!("omp parallel ({n} threads) @{addr}"),
                    _ => format!("omp {kind:?} @{addr}"),
                };
                let region = self.named_region(
                    DefKey::String(format!("omp::{name}")),
                    &name,
                    Paradigm::Compiler,
                );
                self.registry.defs.add_calling_context(otf2::CallingContext {
                    region,
                    source_code_location: None,
                    parent,
                })
            }

            CallingContext::Syscall(nr) => {
                let name = syscall_name(*nr);
                let region = self.named_region(DefKey::Syscall(*nr), &name, Paradigm::User);
                let registry = &mut *self.registry;
                let file = registry.intern(&name);
                let scl = registry
                    .emplace_source_code_location(DefKey::Syscall(*nr), |_| SourceCodeLocation {
                        file,
                        line: 0,
                    });
                registry.emplace_calling_context(DefKey::Syscall(*nr), |_| otf2::CallingContext {
                    region,
                    source_code_location: Some(scl),
                    parent,
                })
            }
        }
    }
}
