use super::Timestamp;

macro_rules! def_ref {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
            pub struct $name(pub u32);

            impl $name {
                pub fn index(self) -> usize {
                    self.0 as usize
                }
            }
        )+
    };
}

def_ref!(
    StringRef,
    SystemTreeNodeRef,
    LocationGroupRef,
    LocationRef,
    RegionRef,
    SourceCodeLocationRef,
    CallingContextRef,
    CommRef,
    CommGroupRef,
    MetricMemberRef,
    MetricClassRef,
    MetricInstanceRef,
    IoParadigmRef,
    IoRegularFileRef,
    IoHandleRef,
    InterruptGeneratorRef,
);

#[derive(Debug, Clone)]
pub struct SystemTreeNode {
    pub name: StringRef,
    pub class_name: StringRef,
    pub parent: Option<SystemTreeNodeRef>,
}

#[derive(Debug, Clone)]
pub struct SystemTreeNodeProperty {
    pub node: SystemTreeNodeRef,
    pub name: StringRef,
    pub value: StringRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationGroupType {
    Process,
    AcceleratorDevice,
}

#[derive(Debug, Clone)]
pub struct LocationGroup {
    pub name: StringRef,
    pub group_type: LocationGroupType,
    pub parent: SystemTreeNodeRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationType {
    CpuThread,
    Metric,
    IoDevice,
}

#[derive(Debug, Clone)]
pub struct Location {
    pub name: StringRef,
    pub location_type: LocationType,
    pub group: LocationGroupRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Paradigm {
    Sampling,
    User,
    Compiler,
    Pthread,
    Hardware,
}

#[derive(Debug, Clone)]
pub struct Region {
    pub name: StringRef,
    pub canonical_name: StringRef,
    pub description: StringRef,
    pub paradigm: Paradigm,
    pub source_file: StringRef,
    pub begin_line: u32,
}

#[derive(Debug, Clone)]
pub struct SourceCodeLocation {
    pub file: StringRef,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct CallingContext {
    pub region: RegionRef,
    pub source_code_location: Option<SourceCodeLocationRef>,
    pub parent: Option<CallingContextRef>,
}

#[derive(Debug, Clone)]
pub struct CallingContextProperty {
    pub calling_context: CallingContextRef,
    pub name: StringRef,
    pub value: StringRef,
}

#[derive(Debug, Clone)]
pub struct CommGroup {
    pub name: StringRef,
    pub paradigm: Paradigm,
}

#[derive(Debug, Clone)]
pub struct Comm {
    pub name: StringRef,
    pub group: CommGroupRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricMode {
    AccumulatedStart,
    Absolute,
}

#[derive(Debug, Clone)]
pub struct MetricMember {
    pub name: StringRef,
    pub description: StringRef,
    pub mode: MetricMode,
    pub unit: StringRef,
}

#[derive(Debug, Clone)]
pub struct MetricClass {
    pub members: Vec<MetricMemberRef>,
}

#[derive(Debug, Clone)]
pub struct MetricInstance {
    pub class: MetricClassRef,
    pub recorder: LocationRef,
    pub scope: LocationRef,
}

#[derive(Debug, Clone)]
pub struct IoParadigm {
    pub identification: StringRef,
    pub name: StringRef,
}

#[derive(Debug, Clone)]
pub struct IoRegularFile {
    pub name: StringRef,
    pub scope: SystemTreeNodeRef,
}

#[derive(Debug, Clone)]
pub struct IoHandle {
    pub name: StringRef,
    pub file: IoRegularFileRef,
    pub paradigm: IoParadigmRef,
    pub comm: Option<CommRef>,
}

/// Marks a handle as already open when the trace starts (stdin/stdout/stderr
/// and block devices).
#[derive(Debug, Clone)]
pub struct IoPreCreatedHandleState {
    pub handle: IoHandleRef,
    pub access_mode: IoAccessMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoAccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOperationMode {
    Read,
    Write,
    Flush,
}

#[derive(Debug, Clone)]
pub struct InterruptGenerator {
    pub name: StringRef,
    pub period: u64,
}

#[derive(Debug, Clone)]
pub struct ClockProperties {
    pub ticks_per_second: u64,
    pub global_offset: Timestamp,
    pub trace_length: u64,
}

/// The flat stores behind all definition references. Deduplication lives a
/// layer up, in the registry; this type only hands out refs in creation
/// order, which is also the order they are serialized in.
#[derive(Debug, Default)]
pub struct Definitions {
    pub strings: Vec<String>,
    pub system_tree_nodes: Vec<SystemTreeNode>,
    pub system_tree_node_properties: Vec<SystemTreeNodeProperty>,
    pub location_groups: Vec<LocationGroup>,
    pub locations: Vec<Location>,
    pub regions: Vec<Region>,
    pub source_code_locations: Vec<SourceCodeLocation>,
    pub calling_contexts: Vec<CallingContext>,
    pub calling_context_properties: Vec<CallingContextProperty>,
    pub comm_groups: Vec<CommGroup>,
    pub comms: Vec<Comm>,
    pub metric_members: Vec<MetricMember>,
    pub metric_classes: Vec<MetricClass>,
    pub metric_instances: Vec<MetricInstance>,
    pub io_paradigms: Vec<IoParadigm>,
    pub io_regular_files: Vec<IoRegularFile>,
    pub io_handles: Vec<IoHandle>,
    pub io_pre_created_handle_states: Vec<IoPreCreatedHandleState>,
    pub interrupt_generators: Vec<InterruptGenerator>,
}

macro_rules! push_def {
    ($fn_name:ident, $field:ident, $def:ty, $ref_ty:ident) => {
        pub fn $fn_name(&mut self, def: $def) -> $ref_ty {
            let r = $ref_ty(self.$field.len() as u32);
            self.$field.push(def);
            r
        }
    };
}

impl Definitions {
    pub fn add_string(&mut self, s: String) -> StringRef {
        let r = StringRef(self.strings.len() as u32);
        self.strings.push(s);
        r
    }

    pub fn string(&self, r: StringRef) -> &str {
        &self.strings[r.index()]
    }

    push_def!(add_system_tree_node, system_tree_nodes, SystemTreeNode, SystemTreeNodeRef);
    push_def!(add_location_group, location_groups, LocationGroup, LocationGroupRef);
    push_def!(add_location, locations, Location, LocationRef);
    push_def!(add_region, regions, Region, RegionRef);
    push_def!(
        add_source_code_location,
        source_code_locations,
        SourceCodeLocation,
        SourceCodeLocationRef
    );
    push_def!(add_calling_context, calling_contexts, CallingContext, CallingContextRef);
    push_def!(add_comm_group, comm_groups, CommGroup, CommGroupRef);
    push_def!(add_comm, comms, Comm, CommRef);
    push_def!(add_metric_member, metric_members, MetricMember, MetricMemberRef);
    push_def!(add_metric_class, metric_classes, MetricClass, MetricClassRef);
    push_def!(add_metric_instance, metric_instances, MetricInstance, MetricInstanceRef);
    push_def!(add_io_paradigm, io_paradigms, IoParadigm, IoParadigmRef);
    push_def!(add_io_regular_file, io_regular_files, IoRegularFile, IoRegularFileRef);
    push_def!(add_io_handle, io_handles, IoHandle, IoHandleRef);
    push_def!(
        add_interrupt_generator,
        interrupt_generators,
        InterruptGenerator,
        InterruptGeneratorRef
    );

    pub fn add_system_tree_node_property(&mut self, p: SystemTreeNodeProperty) {
        self.system_tree_node_properties.push(p);
    }

    pub fn add_calling_context_property(&mut self, p: CallingContextProperty) {
        self.calling_context_properties.push(p);
    }

    pub fn add_io_pre_created_handle_state(&mut self, s: IoPreCreatedHandleState) {
        self.io_pre_created_handle_states.push(s);
    }

    pub fn set_system_tree_node_name(&mut self, node: SystemTreeNodeRef, name: StringRef) {
        self.system_tree_nodes[node.index()].name = name;
    }

    pub fn set_system_tree_node_parent(&mut self, node: SystemTreeNodeRef, parent: SystemTreeNodeRef) {
        self.system_tree_nodes[node.index()].parent = Some(parent);
    }

    pub fn set_location_group_name(&mut self, group: LocationGroupRef, name: StringRef) {
        self.location_groups[group.index()].name = name;
    }

    pub fn set_location_name(&mut self, location: LocationRef, name: StringRef) {
        self.locations[location.index()].name = name;
    }

    pub fn set_region_name(&mut self, region: RegionRef, name: StringRef) {
        let r = &mut self.regions[region.index()];
        r.name = name;
        r.canonical_name = name;
        r.description = name;
        r.source_file = name;
    }

    pub fn set_comm_name(&mut self, comm: CommRef, name: StringRef) {
        self.comms[comm.index()].name = name;
    }

    pub fn set_comm_group_name(&mut self, group: CommGroupRef, name: StringRef) {
        self.comm_groups[group.index()].name = name;
    }
}
