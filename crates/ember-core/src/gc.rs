//! Cycle collection over the refcounted heap
//!
//! Plain reference counting reclaims everything except cycles: a table that
//! (transitively) contains itself keeps a positive count forever. The
//! [`CycleCollector`] is the escape hatch: containers whose count stays
//! positive after a release can be buffered as candidates, and
//! [`CycleCollector::collect`] runs trial deletion over the buffered
//! subgraph. Detection never runs in the release hot path.
//!
//! Buffering interacts with ordinary teardown through the `GC_BUFFERED`
//! header flag: a buffered object that dies through plain refcounting has its
//! children drained immediately but leaves its husk allocated for the
//! collector to reclaim, so the candidate buffer never dangles.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::heap::{self, HeapBody, HeapKind, HeapRef};
use crate::value::Value;

/// Default candidate-buffer size that should trigger a collection
pub const DEFAULT_GC_THRESHOLD: usize = 10_000;

/// Visit every value directly owned by `value`'s payload: table entries, an
/// object's property storage (via its `enumerate_children` handler), or a
/// reference cell's inner value. Scalars have no children.
pub fn enumerate_children(value: &Value, visit: &mut dyn FnMut(&Value)) {
    let Some(raw) = value.heap_ref() else {
        return;
    };
    match raw.body() {
        HeapBody::Str(_) => {}
        HeapBody::Table(t) => {
            for (_, v) in t.iter() {
                visit(v);
            }
        }
        HeapBody::Object(o) => o.enumerate_children(visit),
        HeapBody::Ref(cell) => visit(&cell.value),
    }
}

/// Counted ownership edges out of a heap object, as bare handles. String
/// keys are skipped: strings have no outgoing edges, so they can never keep
/// a cycle alive, and their own storage falls out through plain refcounting.
fn heap_children(raw: HeapRef, visit: &mut impl FnMut(HeapRef)) {
    let mut on_value = |v: &Value| {
        if !v.is_refcounted() {
            return;
        }
        if let Some(child) = v.heap_ref() {
            if !child.header().is_immutable() {
                visit(child);
            }
        }
    };
    match raw.body() {
        HeapBody::Str(_) => {}
        HeapBody::Table(t) => {
            for (_, v) in t.iter() {
                on_value(v);
            }
        }
        HeapBody::Object(o) => o.enumerate_children(&mut on_value),
        HeapBody::Ref(cell) => on_value(&cell.value),
    }
}

struct Node {
    raw: HeapRef,
    /// References into this node from inside the candidate subgraph
    internal: u32,
    live: bool,
}

/// Candidate buffer plus the trial-deletion pass
///
/// Owned by the runtime context; single-threaded like everything else that
/// touches the heap.
pub struct CycleCollector {
    buffer: Vec<HeapRef>,
    threshold: usize,
}

impl CycleCollector {
    /// Collector with the given buffer threshold
    pub fn new(threshold: usize) -> Self {
        Self {
            buffer: Vec::new(),
            threshold: threshold.max(1),
        }
    }

    /// Buffer `value` as a possible cycle root. Only mutable containers
    /// qualify; already-buffered objects are not buffered twice.
    pub fn consider(&mut self, value: &Value) {
        if !value.is_refcounted() {
            return;
        }
        let Some(raw) = value.heap_ref() else {
            return;
        };
        let header = raw.header();
        if header.kind() == HeapKind::Str || header.is_immutable() || header.is_buffered() {
            return;
        }
        header.set_buffered();
        self.buffer.push(raw);
    }

    /// Number of buffered candidates
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer has grown past its threshold
    pub fn should_collect(&self) -> bool {
        self.buffer.len() >= self.threshold
    }

    /// Run trial deletion over the buffered candidates. Returns the number
    /// of heap objects reclaimed.
    ///
    /// Three phases over the subgraph reachable from the candidates: count
    /// how many references into each object come from inside the subgraph;
    /// mark everything reachable from an object with external references as
    /// live; tear down the rest. Dead candidates (husks left by refcount
    /// teardown) are reclaimed up front.
    pub fn collect(&mut self) -> usize {
        let mut freed = 0;
        let mut roots: Vec<HeapRef> = Vec::new();
        for raw in self.buffer.drain(..) {
            raw.header().clear_buffered();
            if raw.header().refcount() == 0 {
                // Children were already drained when the count hit zero;
                // only the husk remains.
                unsafe { raw.force_free() };
                freed += 1;
            } else {
                roots.push(raw);
            }
        }
        if roots.is_empty() {
            return freed;
        }

        // Phase 1: the reachable closure of the candidates.
        let mut index: FxHashMap<HeapRef, usize> = FxHashMap::default();
        let mut nodes: Vec<Node> = Vec::new();
        let mut work = roots;
        while let Some(raw) = work.pop() {
            if index.contains_key(&raw) {
                continue;
            }
            index.insert(raw, nodes.len());
            nodes.push(Node {
                raw,
                internal: 0,
                live: false,
            });
            heap_children(raw, &mut |child| work.push(child));
        }

        // Phase 2: internal reference counts.
        for i in 0..nodes.len() {
            let raw = nodes[i].raw;
            heap_children(raw, &mut |child| {
                if let Some(&j) = index.get(&child) {
                    nodes[j].internal += 1;
                }
            });
        }

        // Phase 3: anything holding counts from outside the subgraph is
        // live, and so is everything it reaches.
        let mut mark: Vec<usize> = (0..nodes.len())
            .filter(|&i| nodes[i].raw.header().refcount() > nodes[i].internal)
            .collect();
        while let Some(i) = mark.pop() {
            if std::mem::replace(&mut nodes[i].live, true) {
                continue;
            }
            let raw = nodes[i].raw;
            heap_children(raw, &mut |child| {
                if let Some(&j) = index.get(&child) {
                    if !nodes[j].live {
                        mark.push(j);
                    }
                }
            });
        }

        // The rest is cyclic garbage. Draining every garbage object's
        // children releases each internal edge exactly once, so every
        // garbage count reaches zero and the teardown queue frees it.
        let mut pending: VecDeque<HeapRef> = VecDeque::new();
        let mut garbage = 0;
        for node in &nodes {
            if node.live {
                continue;
            }
            garbage += 1;
            match node.raw.body_mut() {
                HeapBody::Str(_) => {}
                HeapBody::Table(t) => t.release_children_into(&mut pending),
                HeapBody::Object(o) => {
                    let free = o.handlers().free;
                    free(o, &mut pending);
                }
                HeapBody::Ref(cell) => {
                    let value = std::mem::take(&mut cell.value);
                    value.release_into(&mut pending);
                }
            }
        }
        heap::drain_dead(&mut pending);
        freed + garbage
    }
}

impl Default for CycleCollector {
    fn default() -> Self {
        Self::new(DEFAULT_GC_THRESHOLD)
    }
}

impl Drop for CycleCollector {
    fn drop(&mut self) {
        // Un-buffer survivors so ordinary teardown frees them again, and
        // reclaim any husks the collector still owns.
        for raw in self.buffer.drain(..) {
            raw.header().clear_buffered();
            if raw.header().refcount() == 0 {
                unsafe { raw.force_free() };
            }
        }
    }
}
