//! Deduplicating store of archive definitions, keyed by semantic handles.

use rustc_hash::FxHashMap;

use crate::address::Address;
use crate::otf2::*;
use crate::symbols::LineInfo;
use crate::types::{
    Core, Cpu, ExecutionScope, MeasurementScope, Package, Process, Thread,
};

/// The key flavors under which definitions are registered. One definition
/// type can be indexable under several flavors (a `Location` both by its
/// measurement scope and by its execution scope).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DefKey {
    Process(Process),
    Thread(Thread),
    Cpu(Cpu),
    Core(Core),
    Package(Package),
    BlockDevice(u64),
    Syscall(i64),
    Address(Address),
    LineInfo(LineInfo),
    MeasurementScope(MeasurementScope),
    ExecutionScope(ExecutionScope),
    String(String),
    /// One POSIX I/O handle per (thread, fd, fd reuse generation).
    PosixHandle(Thread, i32, u64),
}

macro_rules! keyed_store {
    ($field:ident, $emplace:ident, $get:ident, $has:ident, $def:ty, $ref_ty:ty, $add:ident) => {
        /// Returns the existing definition for `key`, or constructs it via
        /// `make`. Emplacement is idempotent.
        pub fn $emplace(
            &mut self,
            key: DefKey,
            make: impl FnOnce(&mut Registry) -> $def,
        ) -> $ref_ty {
            if let Some(&existing) = self.$field.get(&key) {
                return existing;
            }
            let def = make(self);
            let r = self.defs.$add(def);
            self.$field.insert(key, r);
            r
        }

        pub fn $get(&self, key: &DefKey) -> Option<$ref_ty> {
            self.$field.get(key).copied()
        }

        pub fn $has(&self, key: &DefKey) -> bool {
            self.$field.contains_key(key)
        }
    };
    ($field:ident, $emplace:ident, $get:ident, $has:ident, $def:ty, $ref_ty:ty, $add:ident, alias = $alias:ident) => {
        keyed_store!($field, $emplace, $get, $has, $def, $ref_ty, $add);

        /// Registers an existing definition under an additional key flavor.
        pub fn $alias(&mut self, key: DefKey, existing: $ref_ty) {
            self.$field.insert(key, existing);
        }
    };
}

/// The process-wide definition registry. All mutation is serialized by the
/// mutex of the owning trace; nothing foreign is called while a definition
/// is being constructed.
#[derive(Default)]
pub struct Registry {
    pub defs: Definitions,
    strings: FxHashMap<String, StringRef>,
    system_tree_nodes: FxHashMap<DefKey, SystemTreeNodeRef>,
    location_groups: FxHashMap<DefKey, LocationGroupRef>,
    locations: FxHashMap<DefKey, LocationRef>,
    regions: FxHashMap<DefKey, RegionRef>,
    source_code_locations: FxHashMap<DefKey, SourceCodeLocationRef>,
    calling_contexts: FxHashMap<DefKey, CallingContextRef>,
    comm_groups: FxHashMap<DefKey, CommGroupRef>,
    comms: FxHashMap<DefKey, CommRef>,
    metric_classes: FxHashMap<DefKey, MetricClassRef>,
    io_regular_files: FxHashMap<DefKey, IoRegularFileRef>,
    io_handles: FxHashMap<DefKey, IoHandleRef>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Interns a string, idempotently.
    pub fn intern(&mut self, s: &str) -> StringRef {
        if let Some(&existing) = self.strings.get(s) {
            return existing;
        }
        let r = self.defs.add_string(s.to_owned());
        self.strings.insert(s.to_owned(), r);
        r
    }

    keyed_store!(
        system_tree_nodes,
        emplace_system_tree_node,
        get_system_tree_node,
        has_system_tree_node,
        SystemTreeNode,
        SystemTreeNodeRef,
        add_system_tree_node
    );
    keyed_store!(
        location_groups,
        emplace_location_group,
        get_location_group,
        has_location_group,
        LocationGroup,
        LocationGroupRef,
        add_location_group
    );
    keyed_store!(
        locations,
        emplace_location,
        get_location,
        has_location,
        Location,
        LocationRef,
        add_location,
        alias = alias_location
    );
    keyed_store!(regions, emplace_region, get_region, has_region, Region, RegionRef, add_region);
    keyed_store!(
        source_code_locations,
        emplace_source_code_location,
        get_source_code_location,
        has_source_code_location,
        SourceCodeLocation,
        SourceCodeLocationRef,
        add_source_code_location
    );
    keyed_store!(
        calling_contexts,
        emplace_calling_context,
        get_calling_context,
        has_calling_context,
        CallingContext,
        CallingContextRef,
        add_calling_context
    );
    keyed_store!(
        comm_groups,
        emplace_comm_group,
        get_comm_group,
        has_comm_group,
        CommGroup,
        CommGroupRef,
        add_comm_group
    );
    keyed_store!(comms, emplace_comm, get_comm, has_comm, Comm, CommRef, add_comm);
    keyed_store!(
        metric_classes,
        emplace_metric_class,
        get_metric_class,
        has_metric_class,
        MetricClass,
        MetricClassRef,
        add_metric_class
    );
    keyed_store!(
        io_regular_files,
        emplace_io_regular_file,
        get_io_regular_file,
        has_io_regular_file,
        IoRegularFile,
        IoRegularFileRef,
        add_io_regular_file
    );
    keyed_store!(
        io_handles,
        emplace_io_handle,
        get_io_handle,
        has_io_handle,
        IoHandle,
        IoHandleRef,
        add_io_handle
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut registry = Registry::new();
        let a = registry.intern("hello");
        let b = registry.intern("hello");
        let c = registry.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(registry.defs.strings.len(), 2);
    }

    #[test]
    fn emplacement_constructs_once() {
        let mut registry = Registry::new();
        let key = DefKey::Process(Process(42));

        let mut calls = 0;
        for _ in 0..3 {
            registry.emplace_system_tree_node(key.clone(), |r| {
                calls += 1;
                let name = r.intern("proc");
                let class = r.intern("process");
                SystemTreeNode {
                    name,
                    class_name: class,
                    parent: None,
                }
            });
        }
        assert_eq!(calls, 1);
        assert_eq!(registry.defs.system_tree_nodes.len(), 1);
    }

    #[test]
    fn alias_key_registration() {
        let mut registry = Registry::new();
        let scope = Cpu(1).as_scope();
        let name = registry.intern("x");
        let group = registry.emplace_location_group(DefKey::ExecutionScope(scope), |_| {
            LocationGroup {
                name,
                group_type: LocationGroupType::Process,
                parent: SystemTreeNodeRef(0),
            }
        });
        let location = registry.emplace_location(DefKey::ExecutionScope(scope), |_| Location {
            name,
            location_type: LocationType::CpuThread,
            group,
        });
        registry.alias_location(DefKey::MeasurementScope(MeasurementScope::sample(scope)), location);
        assert_eq!(
            registry.get_location(&DefKey::MeasurementScope(MeasurementScope::sample(scope))),
            Some(location)
        );
    }
}
