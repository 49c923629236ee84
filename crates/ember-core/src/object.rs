//! Object model: classes, handler tables, instances
//!
//! Polymorphism here is capability-based, not inheritance-based: a class
//! supplies a fixed-shape table of handler functions ([`Handlers`]) resolved
//! once at linkage time, and every instance of the class shares that one
//! table. New object flavors (proxies, closures, iterators) plug in by
//! supplying their own handler set; the structural shape of an instance never
//! changes.
//!
//! Properties live in one of two places behind the same accessor contract:
//! declared properties in fixed inline slots (offset known at linkage time,
//! fast path), dynamically added properties in a lazily-created overflow
//! [`Table`] (slow path). The split is static; a property never migrates
//! between the two at runtime.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use crate::heap::HeapRef;
use crate::table::{Key, KeyRef, Table};
use crate::value::{TypeTag, Value};
use crate::{RuntimeError, RuntimeResult};

/// Variant of a `has_property` query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropQuery {
    /// Property exists at all (isset-style, but including null)
    Exists,
    /// Property exists and is not null
    NotNull,
    /// Property exists and is truthy
    Truthy,
}

/// Which consumer a property enumeration serves; purposes differ in which
/// properties are visible and how uninitialized slots are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropPurpose {
    /// Debug dumps: everything, uninitialized declared slots shown as null
    Debug,
    /// Array casts: initialized declared properties plus dynamic ones
    ArrayCast,
    /// Serialization: same visibility as array casts
    Serialize,
    /// Clone/export: declared properties only
    CloneExport,
}

// ============================================================================
// Handler signatures
// ============================================================================

/// Read a property; `None` means structurally absent.
pub type ReadPropertyFn = fn(&mut Instance, &str) -> Option<Value>;
/// Write a property (creating it dynamically if undeclared).
pub type WritePropertyFn = fn(&mut Instance, &str, &Value);
/// Read an indexed element.
pub type ReadElementFn = fn(&mut Instance, &Key) -> RuntimeResult<Option<Value>>;
/// Write an indexed element; `None` key appends.
pub type WriteElementFn = fn(&mut Instance, Option<Key>, Value) -> RuntimeResult<()>;
/// Property existence query.
pub type HasPropertyFn = fn(&Instance, &str, PropQuery) -> bool;
/// Remove a property; returns whether it existed.
pub type UnsetPropertyFn = fn(&mut Instance, &str) -> bool;
/// Enumerate visible properties for a purpose, as a fresh table.
pub type GetPropertiesForFn = fn(&Instance, PropPurpose) -> Table;
/// Class name for diagnostics. Must never fail.
pub type GetClassNameFn = fn(&Instance) -> &str;
/// Visit every value this instance owns (cycle-collector traversal).
pub type EnumerateChildrenFn = fn(&Instance, &mut dyn FnMut(&Value));
/// Drain owned values into the deferred-release queue at teardown.
pub type FreeFn = fn(&mut Instance, &mut VecDeque<HeapRef>);
/// Cast to a scalar type, if this flavor supports it.
pub type CastFn = fn(&Instance, TypeTag) -> Option<Value>;
/// Three-way compare with another instance, if supported.
pub type CompareFn = fn(&Instance, &Instance) -> Option<Ordering>;
/// Element count, if this flavor has a notion of one.
pub type CountElementsFn = fn(&Instance) -> Option<i64>;
/// View this instance as a callable, if it is one.
pub type GetClosureFn = fn(&Instance) -> Option<Value>;
/// Duplicate this instance.
pub type CloneObjFn = fn(&Instance) -> Instance;

/// Per-class dispatch table
///
/// Resolved once when the class links and immutable thereafter; all
/// instances of a class share the identical table. Required slots are plain
/// function pointers; optional capabilities are `Option` and fall back to
/// nothing rather than a default behavior.
pub struct Handlers {
    /// Read a property (required)
    pub read_property: ReadPropertyFn,
    /// Write a property (required)
    pub write_property: WritePropertyFn,
    /// Read an indexed element (required)
    pub read_element: ReadElementFn,
    /// Write an indexed element (required)
    pub write_element: WriteElementFn,
    /// Property existence query (required)
    pub has_property: HasPropertyFn,
    /// Remove a property (required)
    pub unset_property: UnsetPropertyFn,
    /// Enumerate visible properties for a purpose (required)
    pub get_properties_for: GetPropertiesForFn,
    /// Class name for diagnostics (required)
    pub get_class_name: GetClassNameFn,
    /// Owned-value traversal for the cycle collector (required)
    pub enumerate_children: EnumerateChildrenFn,
    /// Teardown: drain owned values (required)
    pub free: FreeFn,
    /// Cast to scalar (optional)
    pub cast: Option<CastFn>,
    /// Three-way compare (optional)
    pub compare: Option<CompareFn>,
    /// Element count (optional)
    pub count_elements: Option<CountElementsFn>,
    /// Callable view (optional)
    pub get_closure: Option<GetClosureFn>,
    /// Duplicate (optional)
    pub clone_obj: Option<CloneObjFn>,
}

impl Handlers {
    /// Builder seeded with the plain-instance handler set
    pub fn builder() -> HandlersBuilder {
        HandlersBuilder::std()
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("cast", &self.cast.is_some())
            .field("compare", &self.compare.is_some())
            .field("count_elements", &self.count_elements.is_some())
            .field("get_closure", &self.get_closure.is_some())
            .field("clone_obj", &self.clone_obj.is_some())
            .finish()
    }
}

/// Builder for a class's handler table
///
/// Start from [`HandlersBuilder::std`] to override selected capabilities of a
/// plain instance, or from [`HandlersBuilder::empty`] when a flavor replaces
/// the whole surface. `build` fails if any required slot is still vacant.
#[derive(Default)]
pub struct HandlersBuilder {
    read_property: Option<ReadPropertyFn>,
    write_property: Option<WritePropertyFn>,
    read_element: Option<ReadElementFn>,
    write_element: Option<WriteElementFn>,
    has_property: Option<HasPropertyFn>,
    unset_property: Option<UnsetPropertyFn>,
    get_properties_for: Option<GetPropertiesForFn>,
    get_class_name: Option<GetClassNameFn>,
    enumerate_children: Option<EnumerateChildrenFn>,
    free: Option<FreeFn>,
    cast: Option<CastFn>,
    compare: Option<CompareFn>,
    count_elements: Option<CountElementsFn>,
    get_closure: Option<GetClosureFn>,
    clone_obj: Option<CloneObjFn>,
    /// Still the untouched [`std`](Self::std) set; linkage shares the one
    /// [`STD_HANDLERS`] table instead of freezing a duplicate.
    is_std: bool,
}

macro_rules! builder_setters {
    ($($name:ident: $ty:ty),* $(,)?) => {
        $(
            /// Override this handler slot
            pub fn $name(mut self, f: $ty) -> Self {
                self.$name = Some(f);
                self.is_std = false;
                self
            }
        )*
    };
}

impl HandlersBuilder {
    /// All slots vacant; every required handler must be supplied
    pub fn empty() -> Self {
        Self::default()
    }

    /// Seeded with the plain-instance handlers
    pub fn std() -> Self {
        Self {
            read_property: Some(std_read_property),
            write_property: Some(std_write_property),
            read_element: Some(std_read_element),
            write_element: Some(std_write_element),
            has_property: Some(std_has_property),
            unset_property: Some(std_unset_property),
            get_properties_for: Some(std_get_properties_for),
            get_class_name: Some(std_get_class_name),
            enumerate_children: Some(std_enumerate_children),
            free: Some(std_free),
            cast: None,
            compare: None,
            count_elements: None,
            get_closure: None,
            clone_obj: Some(std_clone_obj),
            is_std: true,
        }
    }

    builder_setters! {
        read_property: ReadPropertyFn,
        write_property: WritePropertyFn,
        read_element: ReadElementFn,
        write_element: WriteElementFn,
        has_property: HasPropertyFn,
        unset_property: UnsetPropertyFn,
        get_properties_for: GetPropertiesForFn,
        get_class_name: GetClassNameFn,
        enumerate_children: EnumerateChildrenFn,
        free: FreeFn,
        cast: CastFn,
        compare: CompareFn,
        count_elements: CountElementsFn,
        get_closure: GetClosureFn,
        clone_obj: CloneObjFn,
    }

    /// Validate and freeze the table. `class_name` only feeds the error.
    pub fn build(self, class_name: &str) -> RuntimeResult<Handlers> {
        macro_rules! required {
            ($field:ident) => {
                self.$field.ok_or_else(|| {
                    RuntimeError::InvalidClass(
                        class_name.to_string(),
                        concat!("missing required handler `", stringify!($field), "`").to_string(),
                    )
                })?
            };
        }
        Ok(Handlers {
            read_property: required!(read_property),
            write_property: required!(write_property),
            read_element: required!(read_element),
            write_element: required!(write_element),
            has_property: required!(has_property),
            unset_property: required!(unset_property),
            get_properties_for: required!(get_properties_for),
            get_class_name: required!(get_class_name),
            enumerate_children: required!(enumerate_children),
            free: required!(free),
            cast: self.cast,
            compare: self.compare,
            count_elements: self.count_elements,
            get_closure: self.get_closure,
            clone_obj: self.clone_obj,
        })
    }
}

/// The shared plain-instance handler table
pub static STD_HANDLERS: Lazy<Arc<Handlers>> = Lazy::new(|| {
    Arc::new(
        HandlersBuilder::std()
            .build("<std>")
            .expect("std handler table is complete"),
    )
});

// ============================================================================
// Class
// ============================================================================

/// Class registration input
///
/// Declared properties get inline slots in declaration order, after any
/// inherited ones. Methods override parent methods by name.
pub struct ClassDesc {
    /// Class name
    pub name: String,
    /// Linked parent, if any
    pub parent: Option<Arc<Class>>,
    /// Own declared properties, in layout order
    pub properties: Vec<String>,
    /// Own methods: name and function id
    pub methods: Vec<(String, u32)>,
    /// Behavior flags, opaque to the core
    pub flags: u32,
    /// Handler table under construction
    pub handlers: HandlersBuilder,
}

impl ClassDesc {
    /// A plain class with std handlers and no members
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            properties: Vec::new(),
            methods: Vec::new(),
            flags: 0,
            handlers: HandlersBuilder::std(),
        }
    }

    /// Set the parent class
    pub fn parent(mut self, parent: Arc<Class>) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Declare a property (inline slot)
    pub fn property(mut self, name: impl Into<String>) -> Self {
        self.properties.push(name.into());
        self
    }

    /// Declare a method
    pub fn method(mut self, name: impl Into<String>, function_id: u32) -> Self {
        self.methods.push((name.into(), function_id));
        self
    }

    /// Replace the handler builder
    pub fn handlers(mut self, handlers: HandlersBuilder) -> Self {
        self.handlers = handlers;
        self
    }
}

/// Linked class metadata, shared by all instances
pub struct Class {
    name: String,
    parent: Option<Arc<Class>>,
    declared: FxHashMap<Box<str>, u32>,
    layout: Vec<Box<str>>,
    methods: FxHashMap<Box<str>, u32>,
    flags: u32,
    handlers: Arc<Handlers>,
}

impl Class {
    /// Resolve a descriptor into an immutable, linked class. This is the one
    /// point where the handler table is validated and frozen.
    pub fn link(desc: ClassDesc) -> RuntimeResult<Arc<Class>> {
        // Plain classes share the one std table; only customized builders
        // freeze a table of their own.
        let handlers = if desc.handlers.is_std {
            Arc::clone(&STD_HANDLERS)
        } else {
            Arc::new(desc.handlers.build(&desc.name)?)
        };

        let mut declared = FxHashMap::default();
        let mut layout: Vec<Box<str>> = Vec::new();
        let mut methods = FxHashMap::default();
        if let Some(parent) = &desc.parent {
            declared = parent.declared.clone();
            layout = parent.layout.clone();
            methods = parent.methods.clone();
        }
        for prop in &desc.properties {
            let name: Box<str> = prop.as_str().into();
            if !declared.contains_key(&name) {
                // Redeclaration keeps the inherited slot.
                declared.insert(name.clone(), layout.len() as u32);
                layout.push(name);
            }
        }
        for (name, id) in &desc.methods {
            methods.insert(name.as_str().into(), *id);
        }

        Ok(Arc::new(Class {
            name: desc.name,
            parent: desc.parent,
            declared,
            layout,
            methods,
            flags: desc.flags,
            handlers,
        }))
    }

    /// Class name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent class, if any
    pub fn parent(&self) -> Option<&Arc<Class>> {
        self.parent.as_ref()
    }

    /// Inline slot of a declared property (inherited included)
    pub fn slot_of(&self, name: &str) -> Option<u32> {
        self.declared.get(name).copied()
    }

    /// Number of inline slots an instance carries
    pub fn slot_count(&self) -> u32 {
        self.layout.len() as u32
    }

    /// Declared property names in slot order
    pub fn layout(&self) -> impl Iterator<Item = &str> {
        self.layout.iter().map(|s| &**s)
    }

    /// Function id of a method (inherited included)
    pub fn method(&self, name: &str) -> Option<u32> {
        self.methods.get(name).copied()
    }

    /// Behavior flags
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// The frozen handler table
    pub fn handlers(&self) -> &Arc<Handlers> {
        &self.handlers
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name)
            .field("slots", &self.layout.len())
            .field("methods", &self.methods.len())
            .finish()
    }
}

// ============================================================================
// Instance
// ============================================================================

/// One object instance: class pointer, handler pointer, inline slots and the
/// optional dynamic-property overflow table
pub struct Instance {
    class: Arc<Class>,
    handlers: Arc<Handlers>,
    slots: Box<[Value]>,
    dynamic: Option<Value>,
}

impl Instance {
    /// Instantiate a linked class; declared slots start as null
    pub fn new(class: &Arc<Class>) -> Instance {
        let slots = vec![Value::null(); class.slot_count() as usize].into_boxed_slice();
        Instance {
            class: Arc::clone(class),
            handlers: Arc::clone(class.handlers()),
            slots,
            dynamic: None,
        }
    }

    /// The class this instance was created from
    pub fn class(&self) -> &Arc<Class> {
        &self.class
    }

    /// The shared handler table
    pub fn handlers(&self) -> &Arc<Handlers> {
        &self.handlers
    }

    /// Inline slot by offset
    pub fn slot(&self, offset: u32) -> Option<&Value> {
        self.slots.get(offset as usize)
    }

    /// Inline slot by offset, mutable
    pub fn slot_mut(&mut self, offset: u32) -> Option<&mut Value> {
        self.slots.get_mut(offset as usize)
    }

    /// The dynamic overflow table, if it has been created
    pub fn dynamic(&self) -> Option<&Table> {
        self.dynamic.as_ref().and_then(|v| v.as_table())
    }

    fn dynamic_mut(&mut self) -> &mut Table {
        if self.dynamic.is_none() {
            self.dynamic = Some(Value::table(Table::new()));
        }
        self.dynamic
            .as_mut()
            .and_then(|v| v.as_table_mut())
            .expect("dynamic slot always holds a table")
    }

    // Dispatch entry points: every access goes through the handler table.

    /// Read a property via the class's handler
    pub fn read_property(&mut self, name: &str) -> Option<Value> {
        let f = self.handlers.read_property;
        f(self, name)
    }

    /// Write a property via the class's handler
    pub fn write_property(&mut self, name: &str, value: &Value) {
        let f = self.handlers.write_property;
        f(self, name, value)
    }

    /// Read an indexed element via the class's handler
    pub fn read_element(&mut self, key: &Key) -> RuntimeResult<Option<Value>> {
        let f = self.handlers.read_element;
        f(self, key)
    }

    /// Write an indexed element via the class's handler
    pub fn write_element(&mut self, key: Option<Key>, value: Value) -> RuntimeResult<()> {
        let f = self.handlers.write_element;
        f(self, key, value)
    }

    /// Property existence query via the class's handler
    pub fn has_property(&self, name: &str, query: PropQuery) -> bool {
        (self.handlers.has_property)(self, name, query)
    }

    /// Remove a property via the class's handler
    pub fn unset_property(&mut self, name: &str) -> bool {
        let f = self.handlers.unset_property;
        f(self, name)
    }

    /// Enumerate visible properties for a purpose
    pub fn properties_for(&self, purpose: PropPurpose) -> Table {
        (self.handlers.get_properties_for)(self, purpose)
    }

    /// Class name via the handler (proxies may lie)
    pub fn class_name(&self) -> &str {
        (self.handlers.get_class_name)(self)
    }

    /// Visit every owned value
    pub fn enumerate_children(&self, visit: &mut dyn FnMut(&Value)) {
        (self.handlers.enumerate_children)(self, visit)
    }

    /// Duplicate, if the flavor supports cloning
    pub fn clone_instance(&self) -> Option<Instance> {
        self.handlers.clone_obj.map(|f| f(self))
    }

    /// Element count, if the flavor has one
    pub fn count_elements(&self) -> Option<i64> {
        self.handlers.count_elements.and_then(|f| f(self))
    }

    pub(crate) fn release_children_into(&mut self, pending: &mut VecDeque<HeapRef>) {
        for slot in self.slots.iter_mut() {
            std::mem::take(slot).release_into(pending);
        }
        if let Some(dynamic) = self.dynamic.take() {
            dynamic.release_into(pending);
        }
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("class", &self.class.name())
            .field("slots", &self.slots.len())
            .field("dynamic", &self.dynamic().map(|t| t.len()))
            .finish()
    }
}

// ============================================================================
// Std (plain-instance) handlers
// ============================================================================

fn std_read_property(inst: &mut Instance, name: &str) -> Option<Value> {
    if let Some(offset) = inst.class.slot_of(name) {
        let v = &inst.slots[offset as usize];
        if v.is_undef() {
            return None;
        }
        return Some(v.clone());
    }
    inst.dynamic()?.get(&Key::str(name)).cloned()
}

fn std_write_property(inst: &mut Instance, name: &str, value: &Value) {
    if let Some(offset) = inst.class.slot_of(name) {
        inst.slots[offset as usize].assign(value);
        return;
    }
    inst.dynamic_mut()
        .insert_or_update(Some(Key::str(name)), value.clone());
}

fn std_read_element(inst: &mut Instance, _key: &Key) -> RuntimeResult<Option<Value>> {
    Err(RuntimeError::TypeError(format!(
        "cannot use object of class {} as array",
        inst.class.name()
    )))
}

fn std_write_element(inst: &mut Instance, _key: Option<Key>, _value: Value) -> RuntimeResult<()> {
    Err(RuntimeError::TypeError(format!(
        "cannot use object of class {} as array",
        inst.class.name()
    )))
}

fn std_has_property(inst: &Instance, name: &str, query: PropQuery) -> bool {
    let value = if let Some(offset) = inst.class.slot_of(name) {
        let v = &inst.slots[offset as usize];
        if v.is_undef() {
            return false;
        }
        v.clone()
    } else {
        match inst.dynamic().and_then(|t| t.get(&Key::str(name))) {
            Some(v) => v.clone(),
            None => return false,
        }
    };
    match query {
        PropQuery::Exists => true,
        PropQuery::NotNull => !value.is_null(),
        PropQuery::Truthy => value.is_truthy(),
    }
}

fn std_unset_property(inst: &mut Instance, name: &str) -> bool {
    if let Some(offset) = inst.class.slot_of(name) {
        let slot = &mut inst.slots[offset as usize];
        if slot.is_undef() {
            return false;
        }
        // Tombstone the inline slot; reads treat Undef as absent.
        *slot = Value::undef();
        return true;
    }
    match inst.dynamic.as_mut().and_then(|v| v.as_table_mut()) {
        Some(t) => t.delete(&Key::str(name)),
        None => false,
    }
}

fn std_get_properties_for(inst: &Instance, purpose: PropPurpose) -> Table {
    let mut out = Table::new();
    for name in inst.class.layout() {
        let offset = inst.class.slot_of(name).expect("layout name has a slot");
        let v = &inst.slots[offset as usize];
        if v.is_undef() {
            if purpose == PropPurpose::Debug {
                out.insert_or_update(Some(Key::str(name)), Value::null());
            }
            continue;
        }
        out.insert_or_update(Some(Key::str(name)), v.clone());
    }
    if purpose != PropPurpose::CloneExport {
        if let Some(dynamic) = inst.dynamic() {
            for (k, v) in dynamic.iter() {
                let key = match k {
                    KeyRef::Int(i) => Key::Int(i),
                    KeyRef::Str(s) => Key::str(s),
                };
                out.insert_or_update(Some(key), v.clone());
            }
        }
    }
    out
}

fn std_get_class_name(inst: &Instance) -> &str {
    inst.class.name()
}

fn std_enumerate_children(inst: &Instance, visit: &mut dyn FnMut(&Value)) {
    for slot in inst.slots.iter() {
        visit(slot);
    }
    if let Some(dynamic) = &inst.dynamic {
        // The overflow table itself is an owned child; its entries are
        // reached when the traversal visits the table.
        visit(dynamic);
    }
}

fn std_free(inst: &mut Instance, pending: &mut VecDeque<HeapRef>) {
    inst.release_children_into(pending);
}

fn std_clone_obj(inst: &Instance) -> Instance {
    let mut copy = Instance::new(&inst.class);
    for (i, slot) in inst.slots.iter().enumerate() {
        copy.slots[i] = slot.clone();
    }
    if let Some(dynamic) = inst.dynamic() {
        copy.dynamic = Some(Value::table(dynamic.duplicate()));
    }
    copy
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point_class() -> Arc<Class> {
        Class::link(ClassDesc::new("Point").property("x").property("y")).unwrap()
    }

    #[test]
    fn test_link_assigns_slots_in_order() {
        let class = point_class();
        assert_eq!(class.slot_of("x"), Some(0));
        assert_eq!(class.slot_of("y"), Some(1));
        assert_eq!(class.slot_of("z"), None);
        assert_eq!(class.slot_count(), 2);
    }

    #[test]
    fn test_inherited_layout_extends_parent() {
        let parent = point_class();
        let class = Class::link(
            ClassDesc::new("Point3")
                .parent(Arc::clone(&parent))
                .property("z"),
        )
        .unwrap();
        assert_eq!(class.slot_of("x"), Some(0));
        assert_eq!(class.slot_of("z"), Some(2));
        assert_eq!(class.slot_count(), 3);
    }

    #[test]
    fn test_method_override_by_name() {
        let parent = Class::link(ClassDesc::new("Base").method("run", 1).method("stop", 2)).unwrap();
        let class = Class::link(
            ClassDesc::new("Derived")
                .parent(Arc::clone(&parent))
                .method("run", 9),
        )
        .unwrap();
        assert_eq!(class.method("run"), Some(9));
        assert_eq!(class.method("stop"), Some(2));
    }

    #[test]
    fn test_instances_share_one_vtable() {
        let class = point_class();
        let a = Instance::new(&class);
        let b = Instance::new(&class);
        assert!(Arc::ptr_eq(a.handlers(), b.handlers()));
        assert!(Arc::ptr_eq(a.handlers(), class.handlers()));
    }

    #[test]
    fn test_plain_classes_share_std_handler_table() {
        let a = Class::link(ClassDesc::new("A")).unwrap();
        let b = Class::link(ClassDesc::new("B").property("x")).unwrap();
        assert!(Arc::ptr_eq(a.handlers(), &STD_HANDLERS));
        assert!(Arc::ptr_eq(a.handlers(), b.handlers()));

        // A single overridden slot forces a private table.
        let custom = Class::link(
            ClassDesc::new("C").handlers(HandlersBuilder::std().has_property(|_, _, _| false)),
        )
        .unwrap();
        assert!(!Arc::ptr_eq(custom.handlers(), &STD_HANDLERS));
    }

    #[test]
    fn test_declared_property_roundtrip() {
        let class = point_class();
        let mut p = Instance::new(&class);
        p.write_property("x", &Value::int(3));
        assert_eq!(p.read_property("x").unwrap().as_int(), Some(3));
        // Declared but never written reads as its default, not absent.
        assert!(p.read_property("y").unwrap().is_null());
        // Declared writes stay inline: no overflow table appears.
        assert!(p.dynamic().is_none());
    }

    #[test]
    fn test_dynamic_property_goes_to_overflow() {
        let class = point_class();
        let mut p = Instance::new(&class);
        p.write_property("color", &Value::int(7));
        assert_eq!(p.read_property("color").unwrap().as_int(), Some(7));
        assert_eq!(p.dynamic().unwrap().len(), 1);
    }

    #[test]
    fn test_dynamic_write_does_not_touch_other_instance() {
        let class = point_class();
        let mut a = Instance::new(&class);
        let mut b = Instance::new(&class);
        a.write_property("x", &Value::int(1));
        a.write_property("extra", &Value::int(2));

        assert!(b.read_property("x").unwrap().is_null());
        assert!(b.read_property("extra").is_none());
        b.write_property("x", &Value::int(10));
        assert_eq!(a.read_property("x").unwrap().as_int(), Some(1));
    }

    #[test]
    fn test_has_property_queries() {
        let class = point_class();
        let mut p = Instance::new(&class);
        assert!(p.has_property("x", PropQuery::Exists));
        assert!(!p.has_property("x", PropQuery::NotNull));
        p.write_property("x", &Value::int(0));
        assert!(p.has_property("x", PropQuery::NotNull));
        assert!(!p.has_property("x", PropQuery::Truthy));
        p.write_property("x", &Value::int(5));
        assert!(p.has_property("x", PropQuery::Truthy));
        assert!(!p.has_property("nope", PropQuery::Exists));
    }

    #[test]
    fn test_unset_declared_and_dynamic() {
        let class = point_class();
        let mut p = Instance::new(&class);
        p.write_property("x", &Value::int(1));
        p.write_property("dyn", &Value::int(2));

        assert!(p.unset_property("x"));
        assert!(p.read_property("x").is_none());
        assert!(!p.unset_property("x"));

        assert!(p.unset_property("dyn"));
        assert!(p.read_property("dyn").is_none());
    }

    #[test]
    fn test_properties_for_purposes() {
        let class = point_class();
        let mut p = Instance::new(&class);
        p.write_property("x", &Value::int(1));
        p.unset_property("y");
        p.write_property("dyn", &Value::int(2));

        let debug = p.properties_for(PropPurpose::Debug);
        assert_eq!(debug.len(), 3); // x, y (as null), dyn

        let cast = p.properties_for(PropPurpose::ArrayCast);
        assert_eq!(cast.len(), 2); // x, dyn

        let export = p.properties_for(PropPurpose::CloneExport);
        assert_eq!(export.len(), 1); // x only
    }

    #[test]
    fn test_element_access_rejected_by_default() {
        let class = point_class();
        let mut p = Instance::new(&class);
        assert!(matches!(
            p.read_element(&Key::Int(0)),
            Err(RuntimeError::TypeError(_))
        ));
        assert!(matches!(
            p.write_element(None, Value::int(1)),
            Err(RuntimeError::TypeError(_))
        ));
    }

    #[test]
    fn test_missing_required_handler_fails_linkage() {
        let desc = ClassDesc::new("Broken").handlers(HandlersBuilder::empty());
        match Class::link(desc) {
            Err(RuntimeError::InvalidClass(name, msg)) => {
                assert_eq!(name, "Broken");
                assert!(msg.contains("read_property"));
            }
            other => panic!("expected InvalidClass, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_custom_flavor_overrides_capability() {
        fn fixed_count(_inst: &Instance) -> Option<i64> {
            Some(42)
        }
        let class = Class::link(
            ClassDesc::new("Counted").handlers(Handlers::builder().count_elements(fixed_count)),
        )
        .unwrap();
        let inst = Instance::new(&class);
        assert_eq!(inst.count_elements(), Some(42));

        // Plain classes have no count capability at all.
        let plain = Instance::new(&point_class());
        assert_eq!(plain.count_elements(), None);
    }

    #[test]
    fn test_clone_is_shallow_and_independent() {
        let class = point_class();
        let mut p = Instance::new(&class);
        p.write_property("x", &Value::int(1));
        p.write_property("dyn", &Value::int(2));

        let mut q = p.clone_instance().unwrap();
        q.write_property("x", &Value::int(9));
        q.write_property("dyn", &Value::int(8));

        assert_eq!(p.read_property("x").unwrap().as_int(), Some(1));
        assert_eq!(p.read_property("dyn").unwrap().as_int(), Some(2));
        assert!(Arc::ptr_eq(p.handlers(), q.handlers()));
    }
}
