//! Refcounted heap objects
//!
//! Every heap-allocated runtime object is a [`HeapBox`]: a [`RcHeader`]
//! followed by the payload. The header carries the reference count, the heap
//! kind tag and flag bits; reaching a zero count runs the type-specific
//! teardown immediately and frees the storage. There is no deferred sweep on
//! this path; reclamation is deterministic.
//!
//! [`HeapRef`] is a `Copy` raw handle to a `HeapBox`, in the spirit of a GC
//! pointer type: it never owns a count by itself. Ownership lives in
//! [`Value`](crate::value::Value) cells and typed wrappers such as
//! [`StrRef`](crate::string::StrRef), whose `Clone`/`Drop` impls adjust the
//! count.
//!
//! # Single execution context
//!
//! All mutation of a given object graph happens from one execution context at
//! a time (one thread, no preemption between designated suspension points).
//! The `body_mut` accessor relies on this invariant; handing a `HeapRef`
//! across threads is unsound and prevented at the API boundary by `Context`
//! being neither `Send` nor `Sync`.

use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::ptr::NonNull;

use crate::object::Instance;
use crate::string::StrPayload;
use crate::table::Table;
use crate::value::Value;

/// Immutable/interned object: retain and release are no-ops, storage is freed
/// only at context teardown.
pub const GC_IMMUTABLE: u32 = 1 << 8;

/// Object currently sits in the cycle-collector candidate buffer.
pub const GC_BUFFERED: u32 = 1 << 9;

const KIND_MASK: u32 = 0xff;

/// Heap payload discriminant, stored in the low byte of the header's
/// `type_info` so teardown and the cycle collector can switch on it without
/// touching the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeapKind {
    /// String payload
    Str = 0,
    /// Ordered map/array table
    Table = 1,
    /// Object instance
    Object = 2,
    /// Reference cell (alias-through-assignment indirection)
    Ref = 3,
}

/// Common ownership header embedded at the start of every heap allocation
///
/// Layout mirrors the classic `{ refcount: u32, type_info: u32 }` pair: the
/// count in the first word, kind and flags packed into the second.
#[derive(Debug)]
pub struct RcHeader {
    refcount: Cell<u32>,
    type_info: Cell<u32>,
}

impl RcHeader {
    fn new(kind: HeapKind) -> Self {
        Self {
            refcount: Cell::new(1),
            type_info: Cell::new(kind as u32),
        }
    }

    /// Current reference count
    #[inline]
    pub fn refcount(&self) -> u32 {
        self.refcount.get()
    }

    /// Heap kind tag
    #[inline]
    pub fn kind(&self) -> HeapKind {
        match self.type_info.get() & KIND_MASK {
            0 => HeapKind::Str,
            1 => HeapKind::Table,
            2 => HeapKind::Object,
            _ => HeapKind::Ref,
        }
    }

    /// Whether this object opted out of refcounting (interned/static data)
    #[inline]
    pub fn is_immutable(&self) -> bool {
        self.type_info.get() & GC_IMMUTABLE != 0
    }

    /// Mark this object immutable; subsequent retain/release are no-ops
    #[inline]
    pub fn set_immutable(&self) {
        self.type_info.set(self.type_info.get() | GC_IMMUTABLE);
    }

    /// Whether this object is buffered as a cycle candidate
    #[inline]
    pub fn is_buffered(&self) -> bool {
        self.type_info.get() & GC_BUFFERED != 0
    }

    pub(crate) fn set_buffered(&self) {
        self.type_info.set(self.type_info.get() | GC_BUFFERED);
    }

    pub(crate) fn clear_buffered(&self) {
        self.type_info.set(self.type_info.get() & !GC_BUFFERED);
    }

    /// Increment the count. No-op for immutable objects.
    ///
    /// # Panics
    ///
    /// Panics if the object has already been destroyed (zero count). That is
    /// a defect in the embedding VM layer, never a recoverable condition.
    #[inline]
    pub fn addref(&self) {
        if self.is_immutable() {
            return;
        }
        let rc = self.refcount.get();
        assert!(rc > 0, "retain on a destroyed object");
        self.refcount.set(rc + 1);
    }

    /// Decrement the count, returning the new value. No-op (returns 1) for
    /// immutable objects.
    #[inline]
    pub(crate) fn delref(&self) -> u32 {
        if self.is_immutable() {
            return 1;
        }
        let rc = self.refcount.get();
        assert!(rc > 0, "release on a destroyed object");
        self.refcount.set(rc - 1);
        rc - 1
    }
}

/// One heap allocation: header plus payload
pub struct HeapBox {
    /// Ownership metadata, always the first field
    pub header: RcHeader,
    /// The payload
    pub body: HeapBody,
}

/// Heap payload variants
pub enum HeapBody {
    /// String data plus its cached hash
    Str(StrPayload),
    /// Ordered map/array table
    Table(Table),
    /// Object instance
    Object(Instance),
    /// Reference cell wrapping a single value
    Ref(RefEntry),
}

/// Reference cell payload: a boxed value two variables can alias
pub struct RefEntry {
    /// The shared storage
    pub value: Value,
}

/// Raw handle to a heap allocation
///
/// `Copy` and unowned: cloning a `HeapRef` does not touch the count. Equality
/// and hashing are by address.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HeapRef(NonNull<HeapBox>);

impl HeapRef {
    /// Allocate a new heap object with a count of one
    pub fn alloc(body: HeapBody) -> HeapRef {
        let kind = match &body {
            HeapBody::Str(_) => HeapKind::Str,
            HeapBody::Table(_) => HeapKind::Table,
            HeapBody::Object(_) => HeapKind::Object,
            HeapBody::Ref(_) => HeapKind::Ref,
        };
        let boxed = Box::new(HeapBox {
            header: RcHeader::new(kind),
            body,
        });
        HeapRef(NonNull::from(Box::leak(boxed)))
    }

    /// The ownership header
    #[inline]
    pub fn header(&self) -> &RcHeader {
        unsafe { &self.0.as_ref().header }
    }

    /// Shared access to the payload
    ///
    /// The returned lifetime is decoupled from the handle: `HeapRef` is a
    /// `Copy` handle and the referent outlives any borrow of it, so a borrow
    /// obtained through a temporary handle stays valid for as long as some
    /// owner keeps the object alive.
    #[inline]
    pub fn body<'a>(&self) -> &'a HeapBody {
        unsafe { &self.0.as_ref().body }
    }

    /// Mutable access to the payload, with the same decoupled lifetime as
    /// [`body`](Self::body)
    ///
    /// Relies on the single-execution-context invariant documented at module
    /// level: no two live `&mut` borrows of the same object can exist because
    /// only one mutation site runs at a time and borrows never survive a
    /// suspension point.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub fn body_mut<'a>(&self) -> &'a mut HeapBody {
        unsafe { &mut (*self.0.as_ptr()).body }
    }

    /// Address of the allocation (for hashing/identity)
    #[inline]
    pub fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Increment the count on behalf of a new owner
    #[inline]
    pub fn retain(&self) {
        self.header().addref();
    }

    /// Release one strong count; on reaching zero, tears the object down and
    /// frees it. Returns whether the object died.
    pub fn release(&self) -> bool {
        if self.header().is_immutable() {
            return false;
        }
        if self.header().delref() == 0 {
            destroy(*self);
            true
        } else {
            false
        }
    }

    /// Release one strong count, deferring any resulting teardown onto
    /// `pending` instead of recursing. Used by container teardown so that
    /// self-referential tables cannot overflow the native stack.
    pub(crate) fn release_deferred(&self, pending: &mut VecDeque<HeapRef>) {
        if self.header().is_immutable() {
            return;
        }
        if self.header().delref() == 0 {
            pending.push_back(*self);
        }
    }

    /// Free the allocation outright, ignoring count and immutability.
    ///
    /// Only the interner's teardown uses this, to reclaim immortal strings at
    /// context shutdown. The caller must guarantee no live referents remain.
    pub(crate) unsafe fn force_free(self) {
        drop(Box::from_raw(self.0.as_ptr()));
    }
}

impl fmt::Debug for HeapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HeapRef({:?}@{:#x} rc={})",
            self.header().kind(),
            self.addr(),
            self.header().refcount()
        )
    }
}

impl std::hash::Hash for HeapRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

/// Tear down a dead object and everything that dies with it.
///
/// Children are drained into a work queue rather than released recursively,
/// so arbitrarily deep (or cyclic) ownership chains run in bounded stack
/// space. Each object's destructor runs exactly once: the count is already
/// zero when the object enters the queue, and nothing can resurrect it.
fn destroy(first: HeapRef) {
    let mut pending: VecDeque<HeapRef> = VecDeque::new();
    pending.push_back(first);
    drain_dead(&mut pending);
}

/// Process a queue of zero-count objects: run each one's teardown, pushing
/// any children that die in turn, and free the storage.
///
/// Storage of a buffered object is owned by the cycle-collector candidate
/// buffer: its children are drained here, but the empty husk stays allocated
/// (count zero, kind intact) until the collector reclaims it. Without this
/// the buffer would hold a dangling handle.
pub(crate) fn drain_dead(pending: &mut VecDeque<HeapRef>) {
    while let Some(r) = pending.pop_front() {
        debug_assert_eq!(r.header().refcount(), 0);
        match r.body_mut() {
            HeapBody::Str(_) => {}
            HeapBody::Table(t) => t.release_children_into(pending),
            HeapBody::Object(o) => {
                let free = o.handlers().free;
                free(o, pending);
            }
            HeapBody::Ref(cell) => {
                let value = std::mem::take(&mut cell.value);
                value.release_into(pending);
            }
        }
        if r.header().is_buffered() {
            continue;
        }
        // All children have been drained; the payload drop is now shallow.
        unsafe { r.force_free() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::string::StrRef;

    fn new_str(s: &str) -> HeapRef {
        StrRef::alloc(s).into_raw()
    }

    #[test]
    fn test_alloc_starts_at_one() {
        let r = new_str("hello");
        assert_eq!(r.header().refcount(), 1);
        assert_eq!(r.header().kind(), HeapKind::Str);
        assert!(r.release());
    }

    #[test]
    fn test_body_borrow_outlives_handle_temporary() {
        let r = new_str("payload");
        // The borrow must survive the copied handle it was taken through;
        // only the object's own lifetime bounds it.
        let body = {
            let tmp = r;
            tmp.body()
        };
        let HeapBody::Str(p) = body else {
            panic!("expected a string body")
        };
        assert_eq!(p.as_str(), "payload");
        assert!(r.release());
    }

    #[test]
    fn test_retain_release_balance() {
        let r = new_str("x");
        for _ in 0..100 {
            r.retain();
        }
        for _ in 0..100 {
            assert!(!r.release());
        }
        assert_eq!(r.header().refcount(), 1);
        assert!(r.release());
    }

    #[test]
    fn test_immutable_skips_counting() {
        let r = new_str("static");
        r.header().set_immutable();
        r.retain();
        assert!(!r.release());
        assert!(!r.release());
        assert_eq!(r.header().refcount(), 1);
        unsafe { r.force_free() };
    }

    #[test]
    #[should_panic(expected = "retain on a destroyed object")]
    fn test_retain_after_death_panics() {
        let header = RcHeader::new(HeapKind::Str);
        header.delref();
        header.addref();
    }

    #[test]
    fn test_header_kind_roundtrip() {
        for kind in [HeapKind::Str, HeapKind::Table, HeapKind::Object, HeapKind::Ref] {
            let h = RcHeader::new(kind);
            assert_eq!(h.kind(), kind);
            assert!(!h.is_immutable());
        }
    }

    #[test]
    fn test_buffered_flag() {
        let h = RcHeader::new(HeapKind::Table);
        assert!(!h.is_buffered());
        h.set_buffered();
        assert!(h.is_buffered());
        h.clear_buffered();
        assert!(!h.is_buffered());
    }
}
