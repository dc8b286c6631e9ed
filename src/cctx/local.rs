use std::collections::BTreeMap;

use super::CallingContext;
use crate::address::Address;
use crate::otf2::{
    CallingContextRef, Event, EventWriter, InterruptGeneratorRef, Timestamp,
};
use crate::types::MeasurementScope;

const ROOT: usize = 0;

#[derive(Debug)]
pub struct LocalCctxNode {
    pub ctx: CallingContext,
    pub cctx_ref: u64,
    pub children: BTreeMap<CallingContext, usize>,
}

/// The calling-context tree of one writer.
///
/// Nodes live in an arena and are addressed by index; each node carries the
/// local ref that events of this writer use. The mapping to global refs is
/// produced at merge time and appended to the event stream as a mapping
/// table.
pub struct LocalCctxTree {
    scope: MeasurementScope,
    nodes: Vec<LocalCctxNode>,
    /// The current call stack; `cur[0]` is always the root.
    cur: Vec<usize>,
    next_ref: u64,
    finalized: bool,
    writer: EventWriter,
}

impl LocalCctxTree {
    pub fn new(scope: MeasurementScope, writer: EventWriter) -> LocalCctxTree {
        LocalCctxTree {
            scope,
            nodes: vec![LocalCctxNode {
                ctx: CallingContext::Root,
                cctx_ref: u64::MAX,
                children: BTreeMap::new(),
            }],
            cur: vec![ROOT],
            next_ref: 0,
            finalized: false,
            writer,
        }
    }

    pub fn scope(&self) -> MeasurementScope {
        self.scope
    }

    pub fn writer(&mut self) -> &mut EventWriter {
        &mut self.writer
    }

    /// Levels below the root; the root itself is level 0.
    pub fn cur_level(&self) -> u64 {
        (self.cur.len() - 1) as u64
    }

    pub fn cur_ctx(&self) -> &CallingContext {
        &self.nodes[*self.cur.last().unwrap()].ctx
    }

    pub fn is_current(&self, ctx: &CallingContext) -> bool {
        self.cur_ctx() == ctx
    }

    /// Total number of refs handed out. Only meaningful for the merge after
    /// `finalize`.
    pub fn num_cctx(&self) -> u64 {
        self.next_ref
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Enters `ctxs` below the current stack top. Returns the level of the
    /// first entered node, suitable for a later `cctx_leave` of the whole
    /// group.
    pub fn cctx_enter(&mut self, time: Timestamp, ctxs: &[CallingContext]) -> u64 {
        let level = self.cur_level() + 1;
        self.cctx_enter_at(time, level, ctxs);
        level
    }

    /// Enters `ctxs` starting at an explicit stack level. Level 0 is the
    /// root and cannot be entered; entering more than one level past the
    /// current stack depth would leave a gap.
    pub fn cctx_enter_at(&mut self, time: Timestamp, level: u64, ctxs: &[CallingContext]) {
        let mut level = level;
        for ctx in ctxs {
            self.handle_enter(time, level, *ctx);
            level += 1;
        }
    }

    fn handle_enter(&mut self, time: Timestamp, level: u64, ctx: CallingContext) {
        assert!(level > 0, "level 0 is reserved for the root");
        assert!(
            level <= self.cur_level() + 1,
            "cannot enter at level {level} with stack depth {}",
            self.cur_level()
        );

        if level == self.cur_level() + 1 {
            // A new part of the call stack.
            let node = self.child_of(*self.cur.last().unwrap(), ctx);
            self.cur.push(node);
            self.write_enter(time, node);
        } else {
            let existing = self.cur[level as usize];
            if self.nodes[existing].ctx == ctx {
                // The stack did not change at this level.
                return;
            }
            self.cctx_leave(time, level);
            let node = self.child_of(*self.cur.last().unwrap(), ctx);
            self.cur.push(node);
            self.write_enter(time, node);
        }
    }

    /// Leaves every node at `level` and deeper. The root never leaves.
    /// Returns the new stack level.
    pub fn cctx_leave(&mut self, time: Timestamp, level: u64) -> u64 {
        while level > 0 && self.cur_level() >= level {
            let node = self.cur.pop().unwrap();
            let cctx_ref = self.nodes[node].cctx_ref;
            self.writer.write(Event::CallingContextLeave {
                time,
                calling_context: CallingContextRef(cctx_ref as u32),
            });
        }
        self.cur_level()
    }

    pub fn cctx_leave_top(&mut self, time: Timestamp) -> u64 {
        self.cctx_leave(time, self.cur_level())
    }

    /// The ref for a single-IP sample under the current stack top.
    pub fn sample_ref(&mut self, ip: u64) -> u64 {
        let node = self.ip_child(*self.cur.last().unwrap(), ip);
        self.nodes[node].cctx_ref
    }

    /// The ref for a full callchain, walked from the outermost caller. The
    /// first (deepest) entry always belongs to the kernel entry frame and is
    /// discarded.
    pub fn sample_ref_callchain(&mut self, ips: &[u64]) -> u64 {
        if ips.len() < 2 {
            return self.sample_ref(ips.first().copied().unwrap_or(0));
        }

        let mut node = *self.cur.last().unwrap();
        for i in (1..ips.len()).rev() {
            node = self.ip_child(node, ips[i]);
        }
        self.nodes[node].cctx_ref
    }

    pub fn write_sample(
        &mut self,
        time: Timestamp,
        cctx_ref: u64,
        unwind_distance: u32,
        interrupt_generator: InterruptGeneratorRef,
    ) {
        self.writer.write(Event::CallingContextSample {
            time,
            calling_context: CallingContextRef(cctx_ref as u32),
            unwind_distance,
            interrupt_generator,
        });
    }

    /// Leaves whatever is still on the stack and freezes the ref counter.
    pub fn finalize(&mut self, time: Timestamp) {
        self.cctx_leave(time, 1);
        self.finalized = true;
    }

    pub fn root(&self) -> &LocalCctxNode {
        &self.nodes[ROOT]
    }

    pub fn node(&self, index: usize) -> &LocalCctxNode {
        &self.nodes[index]
    }

    fn write_enter(&mut self, time: Timestamp, node: usize) {
        let cctx_ref = self.nodes[node].cctx_ref;
        self.writer.write(Event::CallingContextEnter {
            time,
            calling_context: CallingContextRef(cctx_ref as u32),
            unwind_distance: 2,
        });
    }

    fn ip_child(&mut self, parent: usize, ip: u64) -> usize {
        // An all-ones address would form the impossible range [-1, 0) in the
        // overlay maps later on.
        let addr = if ip == u64::MAX {
            log::debug!("invalid ip (-1) in call stack, replacing with -2");
            Address(u64::MAX - 1)
        } else {
            Address(ip)
        };
        self.child_of(parent, CallingContext::SampleAddr(addr))
    }

    fn child_of(&mut self, parent: usize, ctx: CallingContext) -> usize {
        if let Some(&existing) = self.nodes[parent].children.get(&ctx) {
            return existing;
        }
        let index = self.nodes.len();
        let cctx_ref = self.next_ref;
        self.next_ref += 1;
        self.nodes.push(LocalCctxNode {
            ctx,
            cctx_ref,
            children: BTreeMap::new(),
        });
        self.nodes[parent].children.insert(ctx, index);
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::otf2::writer::RecordingSink;
    use crate::otf2::LocationRef;
    use crate::types::{Cpu, Process, Thread};

    fn tree() -> (LocalCctxTree, std::sync::Arc<parking_lot::Mutex<Vec<Event>>>) {
        let sink = RecordingSink::default();
        let events = sink.events.clone();
        let writer = EventWriter::new(LocationRef(0), Box::new(sink));
        let scope = MeasurementScope::sample(Cpu(0).as_scope());
        (LocalCctxTree::new(scope, writer), events)
    }

    fn process(pid: i32) -> CallingContext {
        CallingContext::Process(Process(pid))
    }

    fn thread(tid: i32) -> CallingContext {
        CallingContext::Thread(Thread(tid))
    }

    #[test]
    fn enter_then_leave_restores_the_level() {
        let (mut t, events) = tree();
        let level = t.cctx_enter(Timestamp(1), &[process(10), thread(11)]);
        assert_eq!(level, 1);
        assert_eq!(t.cur_level(), 2);

        let after = t.cctx_leave(Timestamp(2), level);
        assert_eq!(after, 0);
        assert_eq!(t.cur_level(), 0);

        // Two enters, two leaves, in stack order.
        let events = events.lock();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], Event::CallingContextEnter { .. }));
        assert!(matches!(events[3], Event::CallingContextLeave { .. }));

        // The nodes persist after leaving.
        assert_eq!(t.num_cctx(), 2);
    }

    #[test]
    fn reentering_the_same_ctx_is_a_no_op() {
        let (mut t, events) = tree();
        t.cctx_enter(Timestamp(1), &[process(10), thread(11)]);
        let before = events.lock().len();

        t.cctx_enter_at(Timestamp(2), 1, &[process(10), thread(11)]);
        assert_eq!(events.lock().len(), before);
        assert_eq!(t.num_cctx(), 2);
    }

    #[test]
    fn entering_a_different_ctx_leaves_deeper_frames_first() {
        let (mut t, events) = tree();
        t.cctx_enter(Timestamp(1), &[process(10), thread(11)]);
        t.cctx_enter_at(Timestamp(2), 2, &[thread(12)]);

        assert_eq!(t.cur_level(), 2);
        assert!(t.is_current(&thread(12)));

        // enter P, enter T11, leave T11, enter T12
        let events = events.lock();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[2], Event::CallingContextLeave { .. }));

        // Three distinct nodes now: P, T11, T12.
        assert_eq!(t.num_cctx(), 3);
    }

    #[test]
    fn internal_node_persists_with_its_children() {
        let (mut t, _) = tree();
        let level = t.cctx_enter(Timestamp(1), &[process(10)]);
        t.cctx_enter(Timestamp(1), &[thread(11)]);
        t.cctx_leave(Timestamp(2), level);

        let root = t.root();
        assert_eq!(root.children.len(), 1);
        let p = t.node(root.children[&process(10)]);
        assert_eq!(p.children.len(), 1);
        assert!(p.children.contains_key(&thread(11)));
    }

    #[test]
    fn sample_ref_is_deterministic() {
        let (mut t, _) = tree();
        t.cctx_enter(Timestamp(1), &[process(10), thread(11)]);

        let chain = [0xffff_8000_0000_0000, 0x4000, 0x4100, 0x4200];
        let first = t.sample_ref_callchain(&chain);
        let second = t.sample_ref_callchain(&chain);
        assert_eq!(first, second);

        // A different chain from the same thread gets a different ref.
        let other = t.sample_ref_callchain(&[0xffff_8000_0000_0000, 0x4000, 0x4300]);
        assert_ne!(first, other);
    }

    #[test]
    fn callchain_discards_the_kernel_frame() {
        let (mut t, _) = tree();
        t.cctx_enter(Timestamp(1), &[process(10), thread(11)]);
        t.sample_ref_callchain(&[0xffff_8000_0000_0000, 0x4000]);

        // Only the user frame became a node below the thread.
        let root = t.root();
        let p = t.node(root.children[&process(10)]);
        let th = t.node(p.children[&thread(11)]);
        assert_eq!(th.children.len(), 1);
        assert!(th
            .children
            .contains_key(&CallingContext::SampleAddr(Address(0x4000))));
    }

    #[test]
    fn invalid_ip_is_remapped() {
        let (mut t, _) = tree();
        t.cctx_enter(Timestamp(1), &[process(10)]);
        t.sample_ref(u64::MAX);
        let root = t.root();
        let p = t.node(root.children[&process(10)]);
        assert!(p
            .children
            .contains_key(&CallingContext::SampleAddr(Address(u64::MAX - 1))));
    }

    #[test]
    fn num_cctx_counts_distinct_emplacements() {
        let (mut t, _) = tree();
        t.cctx_enter(Timestamp(1), &[process(10), thread(11)]);
        t.sample_ref(0x4000);
        t.sample_ref(0x4000);
        t.sample_ref(0x4100);
        // process + thread + two distinct sample nodes
        assert_eq!(t.num_cctx(), 4);

        // Refs are dense and below num_cctx.
        t.finalize(Timestamp(2));
        let mut seen = vec![false; t.num_cctx() as usize];
        fn walk(t: &LocalCctxTree, node: &LocalCctxNode, seen: &mut Vec<bool>) {
            for &child in node.children.values() {
                let child = t.node(child);
                assert!(child.cctx_ref < seen.len() as u64);
                assert!(!seen[child.cctx_ref as usize], "ref assigned twice");
                seen[child.cctx_ref as usize] = true;
                walk(t, child, seen);
            }
        }
        walk(&t, t.root(), &mut seen);
        assert!(seen.into_iter().all(|s| s));
    }

    #[test]
    fn finalize_leaves_the_whole_stack() {
        let (mut t, events) = tree();
        t.cctx_enter(Timestamp(1), &[process(10), thread(11)]);
        t.finalize(Timestamp(5));
        assert_eq!(t.cur_level(), 0);
        assert!(t.is_finalized());
        let leaves = events
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::CallingContextLeave { .. }))
            .count();
        assert_eq!(leaves, 2);
    }
}
