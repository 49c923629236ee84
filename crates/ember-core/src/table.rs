//! The hybrid ordered-array/hash-map table
//!
//! One container backs arrays, object property overflow and symbol tables:
//! a dense, insertion-ordered bucket arena plus a separate hash index into
//! it. Iteration walks the arena (cheap, ordered); lookup goes through the
//! index (expected O(1)); the index is rebuilt wholesale on resize, which is
//! also the only point where tombstones are compacted away.
//!
//! # Layout
//!
//! ```text
//! index:   [ head₀ | head₁ | ... | head_mask ]      hash & mask → bucket slot
//! buckets: [ b₀ | b₁ | b₂ | ... ]                   insertion order, tombstones kept
//! ```
//!
//! Collision chains thread through the buckets via the value cell's auxiliary
//! word (the slot's `aux` is the "next bucket with this index head" link).
//! Deleted buckets are tombstoned (`Undef` value, unlinked from their chain)
//! so that in-progress iteration never sees a shifted arena.

use std::collections::VecDeque;
use std::fmt;

use crate::heap::HeapRef;
use crate::string::StrRef;
use crate::value::Value;

/// Smallest arena/index capacity (power of two)
pub const HT_MIN_SIZE: u32 = 8;

/// Empty index head / end-of-chain marker
const EMPTY: u32 = u32::MAX;

/// Lookup key: integer or string
///
/// String keys own their count; cloning a key retains the string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    /// Integer key (also what key-less appends are assigned)
    Int(i64),
    /// String key
    Str(StrRef),
}

impl Key {
    /// Convenience constructor for a fresh (non-interned) string key
    pub fn str(s: &str) -> Key {
        Key::Str(StrRef::alloc(s))
    }

    /// Hash of this key. Integer keys hash to themselves; string hashes have
    /// the top bit forced on, so the two spaces stay disjoint for
    /// non-negative integers.
    #[inline]
    pub fn hash(&self) -> u64 {
        match self {
            Key::Int(i) => *i as u64,
            Key::Str(s) => s.hash(),
        }
    }
}

/// Borrowed view of a bucket's key during iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRef<'a> {
    /// Integer key
    Int(i64),
    /// String key
    Str(&'a str),
}

/// Stable reference to a bucket slot
///
/// Valid until the next structural mutation of the table: any insert that
/// triggers a resize, or the resize itself, invalidates outstanding slot
/// references (deletes of *other* keys do not). Using a stale slot is a
/// caller contract violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef(pub u32);

/// One arena entry: value, cached hash, optional string key
///
/// Integer-keyed buckets store the key in `hash` and leave `key` empty. The
/// collision chain link lives in `val.aux()`.
pub struct Bucket {
    val: Value,
    hash: u64,
    key: Option<StrRef>,
}

impl Bucket {
    /// The stored value
    #[inline]
    pub fn value(&self) -> &Value {
        &self.val
    }

    /// The key, borrowed
    #[inline]
    pub fn key(&self) -> KeyRef<'_> {
        match &self.key {
            Some(s) => KeyRef::Str(s.as_str()),
            None => KeyRef::Int(self.hash as i64),
        }
    }

    #[inline]
    fn is_tombstone(&self) -> bool {
        self.val.is_undef()
    }

    fn matches(&self, h: u64, key: &Key) -> bool {
        if self.hash != h {
            return false;
        }
        match (key, &self.key) {
            (Key::Int(_), None) => true,
            (Key::Str(s), Some(k)) => k.heap_ref() == s.heap_ref() || k.as_str() == s.as_str(),
            _ => false,
        }
    }
}

/// The ordered map/array table
pub struct Table {
    buckets: Vec<Bucket>,
    index: Box<[u32]>,
    mask: u32,
    table_size: u32,
    len: u32,
    next_free: i64,
}

impl Table {
    /// Create an empty table with the minimum capacity
    pub fn new() -> Self {
        Self::with_capacity(HT_MIN_SIZE as usize)
    }

    /// Create an empty table pre-sized for at least `capacity` elements
    pub fn with_capacity(capacity: usize) -> Self {
        let size = (capacity.max(HT_MIN_SIZE as usize))
            .next_power_of_two()
            .min(u32::MAX as usize / 2) as u32;
        Self {
            buckets: Vec::with_capacity(size as usize),
            index: vec![EMPTY; size as usize].into_boxed_slice(),
            mask: size - 1,
            table_size: size,
            len: 0,
            next_free: 0,
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Number of live elements
    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    /// True when no live elements remain
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Arena slots in use, tombstones included
    #[inline]
    pub fn used(&self) -> u32 {
        self.buckets.len() as u32
    }

    /// Current arena/index capacity
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.table_size
    }

    /// The next auto-assigned integer key. Monotonically non-decreasing,
    /// deletes never roll it back.
    #[inline]
    pub fn next_free_element(&self) -> i64 {
        self.next_free
    }

    /// Locate `key`, if present
    pub fn find(&self, key: &Key) -> Option<SlotRef> {
        if self.len == 0 {
            return None;
        }
        let h = key.hash();
        let mut idx = self.index[(h & self.mask as u64) as usize];
        while idx != EMPTY {
            let b = &self.buckets[idx as usize];
            if !b.is_tombstone() && b.matches(h, key) {
                return Some(SlotRef(idx));
            }
            idx = b.val.aux();
        }
        None
    }

    /// The value stored under `key`, if present
    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.find(key).map(|s| &self.buckets[s.0 as usize].val)
    }

    /// The bucket behind a slot reference
    pub fn slot(&self, slot: SlotRef) -> Option<&Bucket> {
        self.buckets.get(slot.0 as usize).filter(|b| !b.is_tombstone())
    }

    /// Mutable access to a slot's value. Overwrite through
    /// [`Value::assign`], which preserves the slot's chain link.
    pub fn slot_value_mut(&mut self, slot: SlotRef) -> Option<&mut Value> {
        self.buckets
            .get_mut(slot.0 as usize)
            .filter(|b| !b.is_tombstone())
            .map(|b| &mut b.val)
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Insert or update. `None` appends under the next free integer key.
    /// Returns the slot written, stable until the next structural mutation.
    ///
    /// # Panics
    ///
    /// An `Undef` value marks tombstoned buckets internally; storing one
    /// would leave the entry invisible to lookup and iteration while still
    /// counted in `len`. Passing an undef value is a contract violation.
    pub fn insert_or_update(&mut self, key: Option<Key>, val: Value) -> SlotRef {
        assert!(!val.is_undef(), "cannot store an undef value in a table");
        match key {
            None => {
                let k = self.next_free;
                self.next_free += 1;
                self.insert_int(k, val)
            }
            Some(Key::Int(i)) => self.insert_int(i, val),
            Some(Key::Str(s)) => self.insert_str(s, val),
        }
    }

    /// Append under the next free integer key
    pub fn push(&mut self, val: Value) -> SlotRef {
        self.insert_or_update(None, val)
    }

    fn insert_int(&mut self, ikey: i64, val: Value) -> SlotRef {
        let key = Key::Int(ikey);
        if let Some(slot) = self.find(&key) {
            self.buckets[slot.0 as usize].val.assign(&val);
            return slot;
        }
        if ikey >= self.next_free {
            self.next_free = ikey + 1;
        }
        self.insert_bucket(ikey as u64, None, val)
    }

    fn insert_str(&mut self, skey: StrRef, val: Value) -> SlotRef {
        let key = Key::Str(skey);
        if let Some(slot) = self.find(&key) {
            // Bucket keeps its existing key allocation.
            self.buckets[slot.0 as usize].val.assign(&val);
            return slot;
        }
        let Key::Str(skey) = key else { unreachable!() };
        let h = skey.hash();
        self.insert_bucket(h, Some(skey), val)
    }

    fn insert_bucket(&mut self, h: u64, key: Option<StrRef>, mut val: Value) -> SlotRef {
        if self.buckets.len() as u32 == self.table_size {
            self.resize();
        }
        let slot = self.buckets.len() as u32;
        let head = (h & self.mask as u64) as usize;
        val.set_aux(self.index[head]);
        self.index[head] = slot;
        self.buckets.push(Bucket { val, hash: h, key });
        self.len += 1;
        SlotRef(slot)
    }

    /// Remove `key`. The stored value's destructor runs immediately; the
    /// bucket is tombstoned and unlinked from its collision chain but not
    /// compacted, so iteration positions survive. Returns whether the key
    /// was present.
    pub fn delete(&mut self, key: &Key) -> bool {
        if self.len == 0 {
            return false;
        }
        let h = key.hash();
        let head = (h & self.mask as u64) as usize;
        let mut idx = self.index[head];
        let mut prev: Option<u32> = None;
        while idx != EMPTY {
            let found = {
                let b = &self.buckets[idx as usize];
                !b.is_tombstone() && b.matches(h, key)
            };
            if found {
                let next = self.buckets[idx as usize].val.aux();
                match prev {
                    None => self.index[head] = next,
                    Some(p) => self.buckets[p as usize].val.set_aux(next),
                }
                let b = &mut self.buckets[idx as usize];
                let old_val = std::mem::replace(&mut b.val, Value::undef());
                let old_key = b.key.take();
                drop(old_val);
                drop(old_key);
                self.len -= 1;
                return true;
            }
            prev = Some(idx);
            idx = self.buckets[idx as usize].val.aux();
        }
        false
    }

    /// Grow (or, if tombstones suffice, merely compact) and rebuild the hash
    /// index from the arena. Amortized O(1) per insert. Invalidates all
    /// outstanding [`SlotRef`]s.
    fn resize(&mut self) {
        if (self.len as usize) < self.buckets.len() {
            // Enough dead weight: compacting alone frees arena slots.
            // Vec::retain preserves insertion order.
            self.buckets.retain(|b| !b.is_tombstone());
        } else {
            let new_size = self
                .table_size
                .checked_mul(2)
                .expect("table capacity overflow");
            self.table_size = new_size;
            self.mask = new_size - 1;
            self.index = vec![EMPTY; new_size as usize].into_boxed_slice();
            self.buckets.reserve(new_size as usize - self.buckets.len());
        }
        self.rehash();
    }

    fn rehash(&mut self) {
        for head in self.index.iter_mut() {
            *head = EMPTY;
        }
        for i in 0..self.buckets.len() {
            let head = (self.buckets[i].hash & self.mask as u64) as usize;
            let next = self.index[head];
            self.buckets[i].val.set_aux(next);
            self.index[head] = i as u32;
        }
    }

    // ========================================================================
    // Iteration
    // ========================================================================

    /// Borrowing iterator in insertion order, skipping tombstones
    pub fn iter(&self) -> TableIter<'_> {
        TableIter { table: self, pos: 0 }
    }

    /// Detached cursor for iteration interleaved with mutation. Positions
    /// index the arena, so deletes of other keys (and of the current key,
    /// whose tombstone the cursor simply advances past) never invalidate it.
    /// Structural compaction (resize) does.
    pub fn cursor(&self) -> TableCursor {
        TableCursor { pos: 0 }
    }

    /// Shallow duplicate: fresh arena and index, values and keys retained,
    /// tombstones dropped. `next_free` carries over so append semantics match
    /// the source.
    pub fn duplicate(&self) -> Table {
        let mut out = Table::with_capacity(self.len as usize);
        for (k, v) in self.iter() {
            let key = match k {
                KeyRef::Int(i) => Key::Int(i),
                KeyRef::Str(s) => Key::str(s),
            };
            out.insert_or_update(Some(key), v.clone());
        }
        out.next_free = self.next_free;
        out
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Drain every owned value and key into the deferred-release queue.
    /// Called by heap teardown; bounded stack space even for cyclic tables.
    pub(crate) fn release_children_into(&mut self, pending: &mut VecDeque<HeapRef>) {
        for b in self.buckets.drain(..) {
            let Bucket { val, key, .. } = b;
            val.release_into(pending);
            if let Some(k) = key {
                k.release_into(pending);
            }
        }
        self.len = 0;
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("len", &self.len)
            .field("used", &self.buckets.len())
            .field("capacity", &self.table_size)
            .field("next_free", &self.next_free)
            .finish()
    }
}

/// Iterator over `(key, value)` pairs in insertion order
pub struct TableIter<'a> {
    table: &'a Table,
    pos: usize,
}

impl<'a> Iterator for TableIter<'a> {
    type Item = (KeyRef<'a>, &'a Value);

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.table.buckets.len() {
            let b = &self.table.buckets[self.pos];
            self.pos += 1;
            if !b.is_tombstone() {
                return Some((b.key(), &b.val));
            }
        }
        None
    }
}

/// Restartable iteration position decoupled from the table borrow
#[derive(Debug, Clone, Copy, Default)]
pub struct TableCursor {
    pos: u32,
}

impl TableCursor {
    /// A cursor at the start of the table
    pub fn new() -> Self {
        Self { pos: 0 }
    }

    /// Advance to the next live slot, if any
    pub fn next(&mut self, table: &Table) -> Option<SlotRef> {
        while (self.pos as usize) < table.buckets.len() {
            let slot = self.pos;
            self.pos += 1;
            if !table.buckets[slot as usize].is_tombstone() {
                return Some(SlotRef(slot));
            }
        }
        None
    }

    /// Rewind to the start
    pub fn rewind(&mut self) {
        self.pos = 0;
    }
}
