//! The runtime context
//!
//! One [`Context`] is one independent runtime instance: its interner, class
//! registry, constant table, cycle collector and tasks. There is no process
//! global state anywhere in this crate: embedders create as many contexts
//! as they need, each pinned to the thread that created it. The only
//! cross-thread surface is the [`InterruptHandle`], an atomic flag another
//! thread may set to request a controlled unwind.
//!
//! A `Context` is neither `Send` nor `Sync`: every composite value it owns
//! carries raw heap handles, so the whole object graph stays on one thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::gc::CycleCollector;
use crate::object::{Class, ClassDesc, Instance};
use crate::stack::ValueStack;
use crate::string::{Interner, StrRef};
use crate::table::{Key, Table};
use crate::task::{TaskId, TaskSet};
use crate::value::Value;
use crate::{RuntimeError, RuntimeResult};

/// Context configuration; plain data with sensible defaults
#[derive(Debug, Clone, Copy)]
pub struct ContextOptions {
    /// Slots per call-stack page
    pub stack_page_slots: usize,
    /// Total call-stack slot budget per task
    pub stack_max_slots: usize,
    /// Cycle-candidate buffer size that marks a collection as due
    pub gc_threshold: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            stack_page_slots: crate::stack::DEFAULT_PAGE_SLOTS,
            stack_max_slots: crate::stack::DEFAULT_MAX_SLOTS,
            gc_threshold: crate::gc::DEFAULT_GC_THRESHOLD,
        }
    }
}

/// Cloneable, thread-safe handle for interrupting a context
///
/// The context polls the flag at frame-advance points; setting it never
/// stops execution mid-operation.
#[derive(Debug, Clone)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    /// Ask the context to stop at its next poll point
    pub fn request(&self) {
        // A bare flag; no data is published through it.
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether an interrupt is pending
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Poll from inside a dispatch loop, against the stack being driven
    /// (useful while a task borrow is outstanding). A pending interrupt
    /// consumes the flag, unwinds `stack` and reports `Interrupted`.
    pub fn poll(&self, stack: &mut ValueStack) -> RuntimeResult<()> {
        if self.0.swap(false, Ordering::Relaxed) {
            stack.unwind_all();
            return Err(RuntimeError::Interrupted);
        }
        Ok(())
    }
}

/// One independent runtime instance
///
/// Field order is teardown order: values (constants, task stacks) drop
/// before the class registry, and the interner goes last so interned-string
/// handles released by earlier fields still find live headers.
pub struct Context {
    constants: Table,
    tasks: TaskSet,
    classes: FxHashMap<Box<str>, Arc<Class>>,
    collector: CycleCollector,
    interrupt: Arc<AtomicBool>,
    options: ContextOptions,
    interner: Interner,
}

impl Context {
    /// Context with default options
    pub fn new() -> Self {
        Self::with_options(ContextOptions::default())
    }

    /// Context with explicit options
    pub fn with_options(options: ContextOptions) -> Self {
        Self {
            constants: Table::new(),
            tasks: TaskSet::new(),
            classes: FxHashMap::default(),
            collector: CycleCollector::new(options.gc_threshold),
            interrupt: Arc::new(AtomicBool::new(false)),
            options,
            interner: Interner::new(),
        }
    }

    /// The configuration this context was created with
    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    // ========================================================================
    // Symbols and constants
    // ========================================================================

    /// Canonical interned handle for `s`
    pub fn intern(&mut self, s: &str) -> StrRef {
        self.interner.intern(s)
    }

    /// The interner
    pub fn interner(&self) -> &Interner {
        &self.interner
    }

    /// Define a named constant. Returns false (and leaves the existing
    /// binding) when the name is already defined.
    pub fn define_constant(&mut self, name: &str, value: Value) -> bool {
        let key = Key::Str(self.interner.intern(name));
        if self.constants.find(&key).is_some() {
            return false;
        }
        self.constants.insert_or_update(Some(key), value);
        true
    }

    /// Counted copy of a constant's value
    pub fn constant(&self, name: &str) -> Option<Value> {
        let interned = self.interner.get(name)?;
        self.constants.get(&Key::Str(interned)).cloned()
    }

    // ========================================================================
    // Classes
    // ========================================================================

    /// Validate and link a class, registering it by name. The handler table
    /// is resolved here, once; instances share it from then on.
    pub fn link_class(&mut self, desc: ClassDesc) -> RuntimeResult<Arc<Class>> {
        if self.classes.contains_key(desc.name.as_str()) {
            return Err(RuntimeError::InvalidClass(
                desc.name,
                "already defined".into(),
            ));
        }
        let class = Class::link(desc)?;
        self.interner.intern(class.name());
        self.classes.insert(class.name().into(), Arc::clone(&class));
        Ok(class)
    }

    /// Look up a linked class
    pub fn class(&self, name: &str) -> Option<&Arc<Class>> {
        self.classes.get(name)
    }

    /// Instantiate a linked class by name
    pub fn instantiate(&self, name: &str) -> RuntimeResult<Instance> {
        let class = self
            .classes
            .get(name)
            .ok_or_else(|| RuntimeError::Runtime(format!("unknown class `{name}`")))?;
        Ok(Instance::new(class))
    }

    // ========================================================================
    // Stacks and tasks
    // ========================================================================

    /// A fresh frame stack sized by this context's options
    pub fn new_stack(&self) -> ValueStack {
        ValueStack::with_limits(self.options.stack_page_slots, self.options.stack_max_slots)
    }

    /// Spawn a cooperative task with its own frame stack
    pub fn spawn_task(&mut self) -> TaskId {
        let stack = self.new_stack();
        self.tasks.spawn(stack)
    }

    /// The task set
    pub fn tasks(&self) -> &TaskSet {
        &self.tasks
    }

    /// The task set, mutable
    pub fn tasks_mut(&mut self) -> &mut TaskSet {
        &mut self.tasks
    }

    // ========================================================================
    // Interrupts
    // ========================================================================

    /// A handle other threads may use to interrupt this context
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle(Arc::clone(&self.interrupt))
    }

    /// Whether an interrupt is pending
    pub fn interrupt_requested(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    /// Poll the interrupt flag; called at frame-advance points. A pending
    /// interrupt consumes the flag, unwinds every frame of `stack` (local
    /// destructors run) and reports `Interrupted`.
    pub fn poll_interrupt(&self, stack: &mut ValueStack) -> RuntimeResult<()> {
        if self.interrupt.swap(false, Ordering::Relaxed) {
            stack.unwind_all();
            return Err(RuntimeError::Interrupted);
        }
        Ok(())
    }

    /// Clear a pending interrupt without unwinding anything
    pub fn clear_interrupt(&self) {
        self.interrupt.store(false, Ordering::Relaxed);
    }

    // ========================================================================
    // Cycle collection
    // ========================================================================

    /// Buffer a container as a possible cycle root
    pub fn consider(&mut self, value: &Value) {
        self.collector.consider(value);
    }

    /// Run the cycle collector now; returns objects reclaimed
    pub fn collect_cycles(&mut self) -> usize {
        self.collector.collect()
    }

    /// Run the collector only if the candidate buffer has passed its
    /// threshold; returns objects reclaimed
    pub fn maybe_collect(&mut self) -> usize {
        if self.collector.should_collect() {
            self.collector.collect()
        } else {
            0
        }
    }

    /// The cycle collector
    pub fn collector(&self) -> &CycleCollector {
        &self.collector
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
