//! Runtime strings and the interner
//!
//! Runtime strings carry their hash alongside the bytes so table buckets can
//! persist it. The hash function is the classic times-33 string hash with the
//! top bit forced on, which doubles as a "hash already computed" sentinel and
//! keeps string hashes disjoint from small integer keys.
//!
//! The [`Interner`] deduplicates strings used as symbols (property names,
//! class names, constants). Interned strings are flagged immutable: retain
//! and release on them are no-ops, and the interner frees them in one pass at
//! context teardown.

use std::collections::VecDeque;
use std::fmt;

use rustc_hash::FxHashMap;

use crate::heap::{HeapBody, HeapRef};

/// Times-33 string hash (DJBX33A), top bit set.
pub fn hash_str(s: &str) -> u64 {
    let mut h: u64 = 5381;
    for &b in s.as_bytes() {
        h = h.wrapping_mul(33).wrapping_add(b as u64);
    }
    h | 1 << 63
}

/// String payload: cached hash plus the bytes
pub struct StrPayload {
    hash: u64,
    data: Box<str>,
}

impl StrPayload {
    /// The cached hash
    #[inline]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// The string contents
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.data
    }
}

/// Owning handle to a heap-allocated string
///
/// `Clone` retains, `Drop` releases; for interned (immutable) strings both
/// are no-ops.
pub struct StrRef(HeapRef);

impl StrRef {
    /// Allocate a fresh, non-interned string with a count of one
    pub fn alloc(s: &str) -> StrRef {
        let raw = HeapRef::alloc(HeapBody::Str(StrPayload {
            hash: hash_str(s),
            data: s.into(),
        }));
        StrRef(raw)
    }

    /// Adopt an existing allocation. Takes over one strong count.
    pub(crate) fn from_raw(raw: HeapRef) -> StrRef {
        debug_assert!(matches!(raw.body(), HeapBody::Str(_)));
        StrRef(raw)
    }

    /// Give up ownership of the underlying allocation without releasing
    pub(crate) fn into_raw(self) -> HeapRef {
        let raw = self.0;
        std::mem::forget(self);
        raw
    }

    /// The underlying heap handle (still owned by this `StrRef`)
    #[inline]
    pub fn heap_ref(&self) -> HeapRef {
        self.0
    }

    fn payload(&self) -> &StrPayload {
        match self.0.body() {
            HeapBody::Str(s) => s,
            // Kind is checked at construction.
            _ => unreachable!("StrRef over a non-string allocation"),
        }
    }

    /// The cached hash
    #[inline]
    pub fn hash(&self) -> u64 {
        self.payload().hash()
    }

    /// The string contents
    #[inline]
    pub fn as_str(&self) -> &str {
        self.payload().as_str()
    }

    /// True when this string is interned (immutable)
    #[inline]
    pub fn is_interned(&self) -> bool {
        self.0.header().is_immutable()
    }

    /// Release without recursing (strings have no children, but the teardown
    /// queue keeps call sites uniform).
    pub(crate) fn release_into(self, pending: &mut VecDeque<HeapRef>) {
        self.0.release_deferred(pending);
        std::mem::forget(self);
    }
}

impl Clone for StrRef {
    fn clone(&self) -> Self {
        self.0.retain();
        StrRef(self.0)
    }
}

impl Drop for StrRef {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl PartialEq for StrRef {
    fn eq(&self, other: &Self) -> bool {
        // Interned strings are unique per content; fall back to bytes.
        self.0 == other.0 || (self.hash() == other.hash() && self.as_str() == other.as_str())
    }
}

impl Eq for StrRef {}

impl fmt::Debug for StrRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StrRef({:?})", self.as_str())
    }
}

/// Deduplicating store for symbol strings, owned by the runtime context
///
/// Interned strings are immortal for the lifetime of the context: shared
/// constants skip refcount traffic entirely. The side index maps contents to
/// the canonical allocation.
pub struct Interner {
    index: FxHashMap<Box<str>, HeapRef>,
}

impl Interner {
    /// Create an empty interner
    pub fn new() -> Self {
        Self {
            index: FxHashMap::default(),
        }
    }

    /// Return the canonical handle for `s`, interning it on first sight
    pub fn intern(&mut self, s: &str) -> StrRef {
        if let Some(&raw) = self.index.get(s) {
            return StrRef::from_raw(raw);
        }
        let sref = StrRef::alloc(s);
        let raw = sref.into_raw();
        raw.header().set_immutable();
        self.index.insert(s.into(), raw);
        StrRef::from_raw(raw)
    }

    /// Look up without interning
    pub fn get(&self, s: &str) -> Option<StrRef> {
        self.index.get(s).map(|&raw| StrRef::from_raw(raw))
    }

    /// Number of interned strings
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// True when nothing has been interned
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Interner {
    fn drop(&mut self) {
        // Immortal strings are freed exactly once, here. Any StrRef handles
        // still alive at this point are a context-teardown ordering bug in
        // the embedder.
        for (_, raw) in self.index.drain() {
            unsafe { raw.force_free() };
        }
    }
}
