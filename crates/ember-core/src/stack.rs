//! Call frames and the paged value stack
//!
//! Frames are allocated from fixed-size pages of value slots. A frame plus
//! its locals must fit contiguously in the current page; otherwise a new page
//! is pushed and linked behind it. Live frames never move: growing the
//! stack never reallocates or copies, and a page is released only once every
//! frame on it has unwound.
//!
//! Frame lifecycle:
//!
//! ```text
//! pushed → executing → returning → popped
//!                    ↘ unwinding ↗
//! ```
//!
//! Unwinding consults the frame's unit's protected-range table: an error
//! either resumes at a handler within some live frame or pops frame after
//! frame, running each frame's local destructors exactly once, until it
//! escapes the instance.

use std::sync::Arc;

use crate::unit::CodeUnit;
use crate::value::Value;
use crate::{RuntimeError, RuntimeResult};

/// Default slots per stack page
pub const DEFAULT_PAGE_SLOTS: usize = 1024;

/// Default total slot budget
pub const DEFAULT_MAX_SLOTS: usize = 64 * 1024;

/// Frame lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Allocated; locals uninitialized (`Undef`)
    Pushed,
    /// Instructions advancing
    Executing,
    /// Return value written, about to pop
    Returning,
    /// An error is propagating through this frame
    Unwinding,
    /// Storage reclaimed
    Popped,
}

/// One activation record
#[derive(Debug)]
pub struct Frame {
    unit: Arc<CodeUnit>,
    /// Current instruction offset within the unit
    pub ip: u32,
    /// Frame currently being called into, if a call is being set up.
    /// Distinct from the previous frame (the caller this frame returns to),
    /// which is implicit in stack order.
    pub call: Option<u32>,
    state: FrameState,
    page: u32,
    base: u32,
    locals: u16,
    ret: Value,
}

impl Frame {
    /// The unit this frame executes
    pub fn unit(&self) -> &Arc<CodeUnit> {
        &self.unit
    }

    /// Lifecycle state
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Number of local slots
    pub fn locals(&self) -> u16 {
        self.locals
    }
}

#[derive(Debug)]
struct Page {
    slots: Vec<Value>,
    cap: usize,
}

impl Page {
    fn new(cap: usize) -> Self {
        Self {
            slots: Vec::with_capacity(cap),
            cap,
        }
    }

    fn remaining(&self) -> usize {
        self.cap - self.slots.len()
    }
}

/// Where execution resumes after a handled throw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resume {
    /// Index of the frame whose handler runs (0 = outermost)
    pub depth: usize,
    /// Handler instruction offset within that frame's unit
    pub handler: u32,
}

/// The paged frame/locals stack of one execution context
#[derive(Debug)]
pub struct ValueStack {
    pages: Vec<Page>,
    frames: Vec<Frame>,
    total: usize,
    page_slots: usize,
    max_slots: usize,
}

impl ValueStack {
    /// Stack with default page size and budget
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_PAGE_SLOTS, DEFAULT_MAX_SLOTS)
    }

    /// Stack with explicit page size and total slot budget
    pub fn with_limits(page_slots: usize, max_slots: usize) -> Self {
        Self {
            pages: Vec::new(),
            frames: Vec::new(),
            total: 0,
            page_slots: page_slots.max(1),
            max_slots,
        }
    }

    // ========================================================================
    // Frame lifecycle
    // ========================================================================

    /// Push a frame for `unit`. Locals are allocated contiguously (a new
    /// page is linked if the current one is too full) and start as `Undef`.
    /// Returns the frame's depth.
    pub fn push_frame(&mut self, unit: &Arc<CodeUnit>) -> RuntimeResult<usize> {
        let need = unit.locals() as usize;
        if self.total + need > self.max_slots {
            return Err(RuntimeError::StackOverflow);
        }
        let fits = self.pages.last().is_some_and(|p| p.remaining() >= need);
        if !fits {
            // Oversized frames get an oversized page; the link structure is
            // the same either way.
            self.pages.push(Page::new(self.page_slots.max(need)));
        }
        let page = self.pages.len() - 1;
        let base = self.pages[page].slots.len();
        let slots = &mut self.pages[page].slots;
        for _ in 0..need {
            slots.push(Value::undef());
        }
        self.total += need;
        self.frames.push(Frame {
            unit: Arc::clone(unit),
            ip: 0,
            call: None,
            state: FrameState::Pushed,
            page: page as u32,
            base: base as u32,
            locals: unit.locals(),
            ret: Value::undef(),
        });
        Ok(self.frames.len() - 1)
    }

    /// Transition the current frame from pushed to executing
    pub fn enter(&mut self) -> RuntimeResult<()> {
        let frame = self.frames.last_mut().ok_or(RuntimeError::NoFrame)?;
        debug_assert_eq!(frame.state, FrameState::Pushed);
        frame.state = FrameState::Executing;
        Ok(())
    }

    /// Write the current frame's return slot and mark it returning
    pub fn set_return(&mut self, value: Value) -> RuntimeResult<()> {
        let frame = self.frames.last_mut().ok_or(RuntimeError::NoFrame)?;
        frame.ret = value;
        frame.state = FrameState::Returning;
        Ok(())
    }

    /// Pop the current frame, dropping its locals (their destructors run
    /// here, exactly once) and releasing its page if now empty. Returns the
    /// frame's return value.
    pub fn pop_frame(&mut self) -> RuntimeResult<Value> {
        let mut frame = self.frames.pop().ok_or(RuntimeError::NoFrame)?;
        frame.state = FrameState::Popped;
        let page = frame.page as usize;
        debug_assert_eq!(page, self.pages.len() - 1, "frames unwind in LIFO order");
        self.pages[page].slots.truncate(frame.base as usize);
        self.total -= frame.locals as usize;
        // The outermost page stays resident for reuse.
        if page > 0 && self.pages[page].slots.is_empty() {
            self.pages.pop();
        }
        Ok(std::mem::take(&mut frame.ret))
    }

    /// Reuse the current frame for a tail call: locals are torn down and
    /// reallocated in place for `unit`, the frame itself never moves.
    pub fn reuse_frame(&mut self, unit: &Arc<CodeUnit>) -> RuntimeResult<()> {
        let (page, base, old) = {
            let frame = self.frames.last().ok_or(RuntimeError::NoFrame)?;
            (
                frame.page as usize,
                frame.base as usize,
                frame.locals as usize,
            )
        };
        let need = unit.locals() as usize;
        if self.total - old + need > self.max_slots {
            return Err(RuntimeError::StackOverflow);
        }
        if base + need > self.pages[page].cap {
            return Err(RuntimeError::StackOverflow);
        }
        let slots = &mut self.pages[page].slots;
        slots.truncate(base);
        for _ in 0..need {
            slots.push(Value::undef());
        }
        self.total = self.total - old + need;
        let frame = self.frames.last_mut().expect("frame checked above");
        frame.unit = Arc::clone(unit);
        frame.ip = 0;
        frame.call = None;
        frame.state = FrameState::Pushed;
        frame.locals = unit.locals();
        frame.ret = Value::undef();
        Ok(())
    }

    // ========================================================================
    // Unwinding
    // ========================================================================

    /// Propagate a raised value: pop frames (running their local
    /// destructors) until one's protected-range table covers its current
    /// `ip`, then resume at that handler. If no frame handles it, the stack
    /// is left empty and the exception escapes as `Unhandled`.
    pub fn throw(&mut self, exception: Value) -> RuntimeResult<Resume> {
        loop {
            let Some(frame) = self.frames.last_mut() else {
                return Err(RuntimeError::Unhandled(exception));
            };
            frame.state = FrameState::Unwinding;
            let handler = frame.unit.handler_for(frame.ip).map(|r| r.handler);
            if let Some(handler) = handler {
                frame.ip = handler;
                frame.state = FrameState::Executing;
                return Ok(Resume {
                    depth: self.frames.len() - 1,
                    handler,
                });
            }
            self.pop_frame()?;
        }
    }

    /// Controlled teardown of every live frame (interrupt path). All local
    /// destructors run.
    pub fn unwind_all(&mut self) {
        while !self.frames.is_empty() {
            let _ = self.pop_frame();
        }
    }

    // ========================================================================
    // Locals
    // ========================================================================

    fn local_slot(&self, index: usize) -> RuntimeResult<(usize, usize)> {
        let frame = self.frames.last().ok_or(RuntimeError::NoFrame)?;
        if index >= frame.locals as usize {
            return Err(RuntimeError::Runtime(format!(
                "local index {} out of bounds (frame has {})",
                index, frame.locals
            )));
        }
        Ok((frame.page as usize, frame.base as usize + index))
    }

    /// Counted copy of a local of the current frame
    pub fn load_local(&self, index: usize) -> RuntimeResult<Value> {
        let (page, slot) = self.local_slot(index)?;
        Ok(self.pages[page].slots[slot].clone())
    }

    /// Store into a local of the current frame
    pub fn store_local(&mut self, index: usize, value: Value) -> RuntimeResult<()> {
        let (page, slot) = self.local_slot(index)?;
        self.pages[page].slots[slot].assign(&value);
        Ok(())
    }

    /// Mutable access to a local of the current frame
    pub fn local_mut(&mut self, index: usize) -> RuntimeResult<&mut Value> {
        let (page, slot) = self.local_slot(index)?;
        Ok(&mut self.pages[page].slots[slot])
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Number of live frames
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// The current (innermost) frame
    pub fn current_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// The current frame, mutable
    pub fn current_frame_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    /// Frame at `depth` (0 = outermost)
    pub fn frame(&self, depth: usize) -> Option<&Frame> {
        self.frames.get(depth)
    }

    /// Total locals currently allocated
    pub fn depth(&self) -> usize {
        self.total
    }

    /// Number of linked pages
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Visit every live local (root enumeration for the cycle collector)
    pub fn visit_roots(&self, visit: &mut dyn FnMut(&Value)) {
        for page in &self.pages {
            for slot in &page.slots {
                visit(slot);
            }
        }
    }
}

impl Default for ValueStack {
    fn default() -> Self {
        Self::new()
    }
}
