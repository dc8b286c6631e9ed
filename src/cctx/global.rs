use std::collections::BTreeMap;

use super::local::{LocalCctxNode, LocalCctxTree};
use super::CallingContext;
use crate::otf2::CallingContextRef;
use crate::types::Process;

/// Context carried down the merge recursion. Addresses can only be resolved
/// against the symbol overlay of their enclosing process, which is known
/// once a `Process` node has been visited on the way down.
#[derive(Debug, Default, Clone, Copy)]
pub struct MergeContext {
    pub process: Option<Process>,
}

/// Creates the archive definition for one global cctx node. Implemented by
/// the trace, which interns regions, source code locations and calling
/// contexts behind this call.
pub trait CctxDefinitionFactory {
    fn define_cctx(
        &mut self,
        ctx: &CallingContext,
        parent: Option<CallingContextRef>,
        merge: &MergeContext,
    ) -> CallingContextRef;
}

struct GlobalCctxNode {
    /// `None` only for the root.
    cctx: Option<CallingContextRef>,
    children: BTreeMap<CallingContext, usize>,
}

const ROOT: usize = 0;

/// The single tree all local trees merge into. Nodes hold the interned
/// calling-context definition created on first emplacement.
pub struct GlobalCctxTree {
    nodes: Vec<GlobalCctxNode>,
}

impl Default for GlobalCctxTree {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalCctxTree {
    pub fn new() -> GlobalCctxTree {
        GlobalCctxTree {
            nodes: vec![GlobalCctxNode {
                cctx: None,
                children: BTreeMap::new(),
            }],
        }
    }

    /// Number of non-root nodes, i.e. of distinct calling contexts.
    pub fn num_cctx(&self) -> usize {
        self.nodes.len() - 1
    }

    /// Depth-first merge of one local tree. Returns the local-ref to
    /// global-ref mapping table for that tree's writer; every local ref in
    /// `[0, num_cctx)` gets an entry.
    pub fn merge(
        &mut self,
        local: &LocalCctxTree,
        factory: &mut dyn CctxDefinitionFactory,
    ) -> Vec<u32> {
        debug_assert!(local.is_finalized(), "merging a non-finalized local tree");

        let mut table = vec![u32::MAX; local.num_cctx() as usize];
        let mut merge = MergeContext::default();
        self.merge_nodes(local, local.root(), ROOT, factory, &mut table, &mut merge);

        debug_assert!(
            table.iter().all(|&entry| entry != u32::MAX),
            "local refs without mapping entry after merge"
        );
        table
    }

    fn merge_nodes(
        &mut self,
        local: &LocalCctxTree,
        local_node: &LocalCctxNode,
        global_node: usize,
        factory: &mut dyn CctxDefinitionFactory,
        table: &mut [u32],
        merge: &mut MergeContext,
    ) {
        for (ctx, &local_child) in &local_node.children {
            let local_child = local.node(local_child);

            let global_child = match self.nodes[global_node].children.get(ctx) {
                Some(&existing) => existing,
                None => {
                    let parent_cctx = self.nodes[global_node].cctx;
                    let cctx = factory.define_cctx(ctx, parent_cctx, merge);
                    let index = self.nodes.len();
                    self.nodes.push(GlobalCctxNode {
                        cctx: Some(cctx),
                        children: BTreeMap::new(),
                    });
                    self.nodes[global_node].children.insert(*ctx, index);
                    index
                }
            };

            table[local_child.cctx_ref as usize] =
                self.nodes[global_child].cctx.expect("non-root node").0;

            let saved_process = merge.process;
            if let CallingContext::Process(process) = ctx {
                merge.process = Some(*process);
            }
            self.merge_nodes(local, local_child, global_child, factory, table, merge);
            merge.process = saved_process;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::otf2::writer::RecordingSink;
    use crate::otf2::{EventWriter, LocationRef, Timestamp};
    use crate::types::{Cpu, MeasurementScope, Thread};

    /// Hands out sequential refs and records what it was asked to define.
    #[derive(Default)]
    struct CountingFactory {
        defined: Vec<(CallingContext, Option<CallingContextRef>, Option<Process>)>,
    }

    impl CctxDefinitionFactory for CountingFactory {
        fn define_cctx(
            &mut self,
            ctx: &CallingContext,
            parent: Option<CallingContextRef>,
            merge: &MergeContext,
        ) -> CallingContextRef {
            let cctx = CallingContextRef(self.defined.len() as u32);
            self.defined.push((*ctx, parent, merge.process));
            cctx
        }
    }

    fn local_tree_with_one_sample() -> LocalCctxTree {
        let writer = EventWriter::new(LocationRef(0), Box::new(RecordingSink::default()));
        let mut tree = LocalCctxTree::new(MeasurementScope::sample(Cpu(0).as_scope()), writer);
        tree.cctx_enter(
            Timestamp(1),
            &[
                CallingContext::Process(Process(10)),
                CallingContext::Thread(Thread(11)),
            ],
        );
        tree.sample_ref(0x4000);
        tree.finalize(Timestamp(2));
        tree
    }

    #[test]
    fn merge_fills_the_whole_mapping_table() {
        let mut global = GlobalCctxTree::new();
        let mut factory = CountingFactory::default();
        let local = local_tree_with_one_sample();

        let table = global.merge(&local, &mut factory);
        assert_eq!(table.len(), 3);
        assert!(table.iter().all(|&r| r != u32::MAX));
        assert_eq!(global.num_cctx(), 3);
    }

    #[test]
    fn identical_trees_share_global_nodes() {
        let mut global = GlobalCctxTree::new();
        let mut factory = CountingFactory::default();

        let first = local_tree_with_one_sample();
        let second = local_tree_with_one_sample();

        let table_a = global.merge(&first, &mut factory);
        let defined_after_first = factory.defined.len();
        let table_b = global.merge(&second, &mut factory);

        // The second merge found everything already in place.
        assert_eq!(factory.defined.len(), defined_after_first);
        assert_eq!(table_a, table_b);
        assert_eq!(global.num_cctx(), 3);
    }

    #[test]
    fn merge_carries_the_enclosing_process() {
        let mut global = GlobalCctxTree::new();
        let mut factory = CountingFactory::default();
        let local = local_tree_with_one_sample();
        global.merge(&local, &mut factory);

        // The sample node was defined with process 10 in scope.
        let (ctx, _, process) = factory
            .defined
            .iter()
            .find(|(ctx, _, _)| matches!(ctx, CallingContext::SampleAddr(_)))
            .unwrap();
        assert!(matches!(ctx, CallingContext::SampleAddr(_)));
        assert_eq!(*process, Some(Process(10)));

        // And its parent is the thread's calling context.
        let (_, parent, _) = factory.defined.last().unwrap();
        assert_eq!(*parent, Some(CallingContextRef(1)));
    }

    #[test]
    fn sibling_processes_reset_the_merge_context() {
        let writer = EventWriter::new(LocationRef(0), Box::new(RecordingSink::default()));
        let mut tree = LocalCctxTree::new(MeasurementScope::sample(Cpu(0).as_scope()), writer);
        tree.cctx_enter(Timestamp(1), &[CallingContext::Process(Process(10))]);
        tree.sample_ref(0x4000);
        tree.cctx_leave_top(Timestamp(2));
        tree.cctx_leave_top(Timestamp(2));
        tree.cctx_enter(Timestamp(3), &[CallingContext::Process(Process(20))]);
        tree.sample_ref(0x4000);
        tree.finalize(Timestamp(4));

        let mut global = GlobalCctxTree::new();
        let mut factory = CountingFactory::default();
        global.merge(&tree, &mut factory);

        let processes: Vec<Option<Process>> = factory
            .defined
            .iter()
            .filter(|(ctx, _, _)| matches!(ctx, CallingContext::SampleAddr(_)))
            .map(|(_, _, process)| *process)
            .collect();
        assert_eq!(processes, vec![Some(Process(10)), Some(Process(20))]);
    }
}
