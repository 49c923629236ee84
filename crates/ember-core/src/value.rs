//! Tagged value cells
//!
//! [`Value`] is the universal 16-byte cell used for every variable, argument,
//! return slot and table entry: an 8-byte payload union, a type tag, a flag
//! byte and a 4-byte auxiliary word.
//!
//! Ownership is enforced by the type system: `Clone` retains a refcounted
//! payload, `Drop` releases it. Copying the bit pattern without adjusting the
//! count (the classic VM bug) is not expressible in safe code.
//!
//! The `aux` word is never interpreted here. The table reuses it as the hash
//! collision chain link; frames may stash cache-slot indices or line numbers
//! in it. Generic code paths must treat it as opaque.

use std::collections::VecDeque;
use std::fmt;

use crate::heap::{HeapBody, HeapRef, RefEntry};
use crate::object::Instance;
use crate::string::StrRef;
use crate::table::Table;

/// Payload owns one strong count on a heap object.
pub(crate) const VAL_REFCOUNTED: u8 = 1 << 0;

/// Payload is a reference cell (alias-through-assignment indirection).
pub(crate) const VAL_REF_CELL: u8 = 1 << 1;

/// Active payload variant selector
///
/// Numbering follows the conventional scalar-first order so that tag
/// comparisons can double as cheap type-class checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TypeTag {
    /// Unused slot / tombstone
    Undef = 0,
    /// Null
    Null = 1,
    /// Boolean false
    False = 2,
    /// Boolean true
    True = 3,
    /// 64-bit integer
    Int = 4,
    /// 64-bit float
    Float = 5,
    /// String
    Str = 6,
    /// Ordered map/array table
    Table = 7,
    /// Object instance
    Object = 8,
    /// Reference cell
    Ref = 9,
}

#[derive(Clone, Copy)]
union Payload {
    int: i64,
    float: f64,
    heap: HeapRef,
    raw: u64,
}

/// The universal tagged value cell
pub struct Value {
    payload: Payload,
    tag: TypeTag,
    flags: u8,
    aux: u32,
}

impl Value {
    // ========================================================================
    // Constructors
    // ========================================================================

    /// Unused/absent value (tombstone tag)
    #[inline]
    pub const fn undef() -> Self {
        Value {
            payload: Payload { raw: 0 },
            tag: TypeTag::Undef,
            flags: 0,
            aux: 0,
        }
    }

    /// Null value
    #[inline]
    pub const fn null() -> Self {
        Value {
            payload: Payload { raw: 0 },
            tag: TypeTag::Null,
            flags: 0,
            aux: 0,
        }
    }

    /// Boolean value
    #[inline]
    pub const fn bool(b: bool) -> Self {
        Value {
            payload: Payload { raw: 0 },
            tag: if b { TypeTag::True } else { TypeTag::False },
            flags: 0,
            aux: 0,
        }
    }

    /// Integer value
    #[inline]
    pub const fn int(i: i64) -> Self {
        Value {
            payload: Payload { int: i },
            tag: TypeTag::Int,
            flags: 0,
            aux: 0,
        }
    }

    /// Float value
    #[inline]
    pub const fn float(f: f64) -> Self {
        Value {
            payload: Payload { float: f },
            tag: TypeTag::Float,
            flags: 0,
            aux: 0,
        }
    }

    /// String value, taking over the `StrRef`'s count
    pub fn str(s: StrRef) -> Self {
        let raw = s.into_raw();
        Value::from_heap(raw, TypeTag::Str)
    }

    /// Table value; allocates the heap box, count starts at one
    pub fn table(t: Table) -> Self {
        let raw = HeapRef::alloc(HeapBody::Table(t));
        Value::from_heap(raw, TypeTag::Table)
    }

    /// Object value; allocates the heap box, count starts at one
    pub fn object(inst: Instance) -> Self {
        let raw = HeapRef::alloc(HeapBody::Object(inst));
        Value::from_heap(raw, TypeTag::Object)
    }

    /// Box `inner` in a new reference cell so several variables can alias it
    pub fn new_ref(inner: Value) -> Self {
        let raw = HeapRef::alloc(HeapBody::Ref(RefEntry { value: inner }));
        let mut v = Value::from_heap(raw, TypeTag::Ref);
        v.flags |= VAL_REF_CELL;
        v
    }

    /// Wrap an existing heap allocation. Takes over one strong count.
    pub(crate) fn from_heap(raw: HeapRef, tag: TypeTag) -> Self {
        // Immutable (interned) payloads skip counting entirely, so their
        // cells are not flagged refcounted: clone/drop stay on the fast path.
        let flags = if raw.header().is_immutable() {
            0
        } else {
            VAL_REFCOUNTED
        };
        Value {
            payload: Payload { heap: raw },
            tag,
            flags,
            aux: 0,
        }
    }

    // ========================================================================
    // Type tests
    // ========================================================================

    /// Active type tag
    #[inline]
    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    /// True for the `Undef` tombstone tag
    #[inline]
    pub fn is_undef(&self) -> bool {
        self.tag == TypeTag::Undef
    }

    /// True for `Null`
    #[inline]
    pub fn is_null(&self) -> bool {
        self.tag == TypeTag::Null
    }

    /// True for either boolean tag
    #[inline]
    pub fn is_bool(&self) -> bool {
        matches!(self.tag, TypeTag::True | TypeTag::False)
    }

    /// True if the payload owns a strong count
    #[inline]
    pub fn is_refcounted(&self) -> bool {
        self.flags & VAL_REFCOUNTED != 0
    }

    /// True for reference cells
    #[inline]
    pub fn is_ref(&self) -> bool {
        self.flags & VAL_REF_CELL != 0
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Extract a boolean
    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self.tag {
            TypeTag::True => Some(true),
            TypeTag::False => Some(false),
            _ => None,
        }
    }

    /// Extract an integer
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        if self.tag == TypeTag::Int {
            Some(unsafe { self.payload.int })
        } else {
            None
        }
    }

    /// Extract a float
    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        if self.tag == TypeTag::Float {
            Some(unsafe { self.payload.float })
        } else {
            None
        }
    }

    /// String slice of a string payload
    pub fn as_str(&self) -> Option<&str> {
        if self.tag != TypeTag::Str {
            return None;
        }
        match self.heap_ref()?.body() {
            HeapBody::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Shared table access
    pub fn as_table(&self) -> Option<&Table> {
        if self.tag != TypeTag::Table {
            return None;
        }
        match self.heap_ref()?.body() {
            HeapBody::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Mutable table access (single-execution-context invariant applies)
    pub fn as_table_mut(&mut self) -> Option<&mut Table> {
        if self.tag != TypeTag::Table {
            return None;
        }
        match self.heap_ref()?.body_mut() {
            HeapBody::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Shared instance access
    pub fn as_instance(&self) -> Option<&Instance> {
        if self.tag != TypeTag::Object {
            return None;
        }
        match self.heap_ref()?.body() {
            HeapBody::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Mutable instance access (single-execution-context invariant applies)
    pub fn as_instance_mut(&mut self) -> Option<&mut Instance> {
        if self.tag != TypeTag::Object {
            return None;
        }
        match self.heap_ref()?.body_mut() {
            HeapBody::Object(o) => Some(o),
            _ => None,
        }
    }

    /// The heap allocation behind this cell, if any
    #[inline]
    pub fn heap_ref(&self) -> Option<HeapRef> {
        match self.tag {
            TypeTag::Str | TypeTag::Table | TypeTag::Object | TypeTag::Ref => {
                Some(unsafe { self.payload.heap })
            }
            _ => None,
        }
    }

    // ========================================================================
    // Assignment and reference cells
    // ========================================================================

    /// Assign `src` into this cell with correct ownership transfer: the
    /// source is retained before the old destination value is released, so
    /// assigning a value to the cell that (transitively) owns it is safe.
    ///
    /// The auxiliary word belongs to the containing slot, not the value:
    /// assignment preserves the destination's `aux` (a table bucket's chain
    /// link survives in-place updates).
    #[inline]
    pub fn assign(&mut self, src: &Value) {
        let mut copy = src.clone();
        copy.aux = self.aux;
        *self = copy;
    }

    /// Read through a reference cell: returns a counted copy of the inner
    /// value, or of `self` when it is not a reference. Dereferencing is
    /// explicit; nothing else in this crate chases the indirection.
    pub fn deref(&self) -> Value {
        if self.tag == TypeTag::Ref {
            match self.heap_ref().map(|r| r.body()) {
                Some(HeapBody::Ref(cell)) => cell.value.clone(),
                _ => Value::undef(),
            }
        } else {
            self.clone()
        }
    }

    /// Write through a reference cell: stores into the shared inner slot when
    /// `self` is a reference, otherwise plain assignment.
    pub fn set_through(&mut self, src: &Value) {
        if self.tag == TypeTag::Ref {
            if let Some(HeapBody::Ref(cell)) = self.heap_ref().map(|r| r.body_mut()) {
                cell.value.assign(src);
                return;
            }
        }
        self.assign(src);
    }

    // ========================================================================
    // Auxiliary word
    // ========================================================================

    /// The context-dependent scratch word
    #[inline]
    pub fn aux(&self) -> u32 {
        self.aux
    }

    /// Overwrite the scratch word
    #[inline]
    pub fn set_aux(&mut self, aux: u32) {
        self.aux = aux;
    }

    // ========================================================================
    // Teardown plumbing
    // ========================================================================

    /// Give up this cell's count without recursing: a payload that dies goes
    /// onto `pending` for the teardown loop in `heap` to process.
    pub(crate) fn release_into(self, pending: &mut VecDeque<HeapRef>) {
        if self.is_refcounted() {
            let raw = unsafe { self.payload.heap };
            raw.release_deferred(pending);
        }
        std::mem::forget(self);
    }

    /// Truthiness under the usual dynamic-language rules
    pub fn is_truthy(&self) -> bool {
        match self.tag {
            TypeTag::Undef | TypeTag::Null | TypeTag::False => false,
            TypeTag::True => true,
            TypeTag::Int => unsafe { self.payload.int != 0 },
            TypeTag::Float => unsafe { self.payload.float != 0.0 },
            TypeTag::Str => self.as_str().is_some_and(|s| !s.is_empty() && s != "0"),
            _ => true,
        }
    }

    /// Type name for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self.tag {
            TypeTag::Undef => "undef",
            TypeTag::Null => "null",
            TypeTag::False | TypeTag::True => "bool",
            TypeTag::Int => "int",
            TypeTag::Float => "float",
            TypeTag::Str => "string",
            TypeTag::Table => "table",
            TypeTag::Object => "object",
            TypeTag::Ref => "reference",
        }
    }
}

impl Clone for Value {
    #[inline]
    fn clone(&self) -> Self {
        if self.is_refcounted() {
            unsafe { self.payload.heap }.retain();
        }
        Value {
            payload: self.payload,
            tag: self.tag,
            flags: self.flags,
            aux: self.aux,
        }
    }
}

impl Drop for Value {
    #[inline]
    fn drop(&mut self) {
        if self.is_refcounted() {
            unsafe { self.payload.heap }.release();
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::undef()
    }
}

/// Scalar equality by value, heap equality by identity. Containers with equal
/// contents but distinct allocations compare unequal; deep comparison is a
/// dispatch concern, not a cell concern.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if self.tag != other.tag {
            return false;
        }
        match self.tag {
            TypeTag::Undef | TypeTag::Null | TypeTag::False | TypeTag::True => true,
            TypeTag::Int => self.as_int() == other.as_int(),
            TypeTag::Float => self.as_float() == other.as_float(),
            TypeTag::Str => self.as_str() == other.as_str(),
            _ => self.heap_ref().map(|r| r.addr()) == other.heap_ref().map(|r| r.addr()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag {
            TypeTag::Undef => write!(f, "undef"),
            TypeTag::Null => write!(f, "null"),
            TypeTag::False => write!(f, "false"),
            TypeTag::True => write!(f, "true"),
            TypeTag::Int => write!(f, "int({})", self.as_int().unwrap_or(0)),
            TypeTag::Float => write!(f, "float({})", self.as_float().unwrap_or(0.0)),
            TypeTag::Str => write!(f, "str({:?})", self.as_str().unwrap_or("")),
            TypeTag::Table => write!(f, "table@{:#x}", self.heap_ref().map_or(0, |r| r.addr())),
            TypeTag::Object => write!(f, "object@{:#x}", self.heap_ref().map_or(0, |r| r.addr())),
            TypeTag::Ref => write!(f, "ref@{:#x}", self.heap_ref().map_or(0, |r| r.addr())),
        }
    }
}

// Display mirrors loose string conversion: null/false render empty, true as
// "1", references through their target.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag {
            TypeTag::Undef | TypeTag::Null | TypeTag::False => Ok(()),
            TypeTag::True => write!(f, "1"),
            TypeTag::Int => write!(f, "{}", self.as_int().unwrap_or(0)),
            TypeTag::Float => write!(f, "{}", self.as_float().unwrap_or(0.0)),
            TypeTag::Str => write!(f, "{}", self.as_str().unwrap_or("")),
            TypeTag::Table => write!(f, "Table"),
            TypeTag::Object => write!(f, "Object"),
            TypeTag::Ref => write!(f, "{}", self.deref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Key;

    #[test]
    fn test_cell_size() {
        // payload (8) + tag (1) + flags (1) + aux (4) + padding = 16 bytes
        assert_eq!(std::mem::size_of::<Value>(), 16);
    }

    #[test]
    fn test_scalar_roundtrip() {
        assert_eq!(Value::int(42).as_int(), Some(42));
        assert_eq!(Value::int(i64::MIN).as_int(), Some(i64::MIN));
        assert_eq!(Value::float(1.5).as_float(), Some(1.5));
        assert_eq!(Value::bool(true).as_bool(), Some(true));
        assert_eq!(Value::bool(false).as_bool(), Some(false));
        assert!(Value::null().is_null());
        assert!(Value::undef().is_undef());
    }

    #[test]
    fn test_scalars_not_refcounted() {
        assert!(!Value::int(1).is_refcounted());
        assert!(!Value::float(0.5).is_refcounted());
        assert!(!Value::null().is_refcounted());
        assert!(!Value::bool(true).is_refcounted());
    }

    #[test]
    fn test_string_value() {
        let v = Value::str(StrRef::alloc("hello"));
        assert_eq!(v.tag(), TypeTag::Str);
        assert!(v.is_refcounted());
        assert_eq!(v.as_str(), Some("hello"));
    }

    #[test]
    fn test_clone_retains_drop_releases() {
        let v = Value::str(StrRef::alloc("shared"));
        let raw = v.heap_ref().unwrap();
        assert_eq!(raw.header().refcount(), 1);

        let copy = v.clone();
        assert_eq!(raw.header().refcount(), 2);

        drop(copy);
        assert_eq!(raw.header().refcount(), 1);
        drop(v);
    }

    #[test]
    fn test_assign_releases_old_value() {
        let src = Value::str(StrRef::alloc("new"));
        let old_raw;
        let mut dst = Value::str(StrRef::alloc("old"));
        old_raw = dst.heap_ref().unwrap();
        assert_eq!(old_raw.header().refcount(), 1);

        dst.assign(&src);
        assert_eq!(dst.as_str(), Some("new"));
        assert_eq!(src.heap_ref().unwrap().header().refcount(), 2);
    }

    #[test]
    fn test_self_assignment_survives() {
        // dst and src alias the same heap object with a single outside count:
        // retain-then-release ordering must keep the payload alive.
        let mut t = Table::new();
        t.insert_or_update(None, Value::int(7));
        let mut v = Value::table(t);
        let alias = v.clone();
        drop(alias);

        let raw = v.heap_ref().unwrap();
        assert_eq!(raw.header().refcount(), 1);

        let src = v.clone();
        v.assign(&src);
        drop(src);

        assert_eq!(raw.header().refcount(), 1);
        assert_eq!(
            v.as_table().unwrap().get(&Key::Int(0)).unwrap().as_int(),
            Some(7)
        );
    }

    #[test]
    fn test_reference_cell_aliasing() {
        let shared = Value::new_ref(Value::int(1));
        let mut a = shared.clone();
        let b = shared.clone();

        a.set_through(&Value::int(99));
        assert_eq!(b.deref().as_int(), Some(99));
        assert_eq!(shared.deref().as_int(), Some(99));
    }

    #[test]
    fn test_deref_of_plain_value_is_copy() {
        let v = Value::int(5);
        assert_eq!(v.deref().as_int(), Some(5));
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::null().is_truthy());
        assert!(!Value::undef().is_truthy());
        assert!(!Value::int(0).is_truthy());
        assert!(Value::int(-1).is_truthy());
        assert!(!Value::float(0.0).is_truthy());
        assert!(!Value::str(StrRef::alloc("")).is_truthy());
        assert!(!Value::str(StrRef::alloc("0")).is_truthy());
        assert!(Value::str(StrRef::alloc("a")).is_truthy());
        assert!(Value::table(Table::new()).is_truthy());
    }

    #[test]
    fn test_aux_is_opaque() {
        let mut v = Value::int(3);
        assert_eq!(v.aux(), 0);
        v.set_aux(12345);
        assert_eq!(v.aux(), 12345);
        assert_eq!(v.as_int(), Some(3));
        // aux travels with clones but does not affect equality
        assert_eq!(v.clone(), Value::int(3));
    }

    #[test]
    fn test_heap_equality_is_identity() {
        let a = Value::table(Table::new());
        let b = Value::table(Table::new());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }
}
