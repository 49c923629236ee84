//! Integration tests for the object model
//!
//! Tests cover:
//! - Class linkage through the context and instance property access
//! - Inline declared slots vs the dynamic overflow table
//! - Handler-table sharing across instances of one class
//! - A collection flavor supplying its own element handlers
//! - Property export by purpose
//! - Shallow instance cloning

use std::sync::Arc;

use ember_core::context::Context;
use ember_core::object::{ClassDesc, HandlersBuilder, Instance, PropPurpose, PropQuery};
use ember_core::table::{Key, KeyRef, Table};
use ember_core::value::Value;
use ember_core::{RuntimeError, RuntimeResult};

#[test]
fn test_declared_and_dynamic_properties() {
    let mut ctx = Context::new();
    ctx.link_class(ClassDesc::new("Point").property("x").property("y"))
        .unwrap();
    let mut p = ctx.instantiate("Point").unwrap();

    // Declared slots exist from birth (as null) and never touch the
    // overflow table.
    assert!(p.read_property("x").unwrap().is_null());
    p.write_property("x", &Value::int(3));
    p.write_property("y", &Value::int(4));
    assert_eq!(p.read_property("x").unwrap().as_int(), Some(3));
    assert!(p.dynamic().is_none());

    // A write to an undeclared name creates the overflow table lazily.
    p.write_property("label", &Value::str(ctx.intern("origin")));
    assert_eq!(p.read_property("label").unwrap().as_str(), Some("origin"));
    assert_eq!(p.dynamic().unwrap().len(), 1);

    assert!(p.has_property("x", PropQuery::Exists));
    assert!(p.has_property("label", PropQuery::Exists));
    assert!(!p.has_property("z", PropQuery::Exists));

    // Unset removes a dynamic property; a declared slot cannot be removed.
    assert!(p.unset_property("label"));
    assert!(p.read_property("label").is_none());
}

#[test]
fn test_instances_share_one_handler_table() {
    let mut ctx = Context::new();
    let class = ctx.link_class(ClassDesc::new("Widget")).unwrap();
    let a = ctx.instantiate("Widget").unwrap();
    let b = ctx.instantiate("Widget").unwrap();
    assert!(Arc::ptr_eq(a.handlers(), b.handlers()));
    assert!(Arc::ptr_eq(a.handlers(), class.handlers()));
    assert_eq!(a.class_name(), "Widget");
}

#[test]
fn test_inheritance_keeps_parent_slots() {
    let mut ctx = Context::new();
    let base = ctx
        .link_class(ClassDesc::new("Shape").property("id").method("area", 1))
        .unwrap();
    let circle = ctx
        .link_class(
            ClassDesc::new("Circle")
                .parent(base)
                .property("radius")
                .method("area", 2),
        )
        .unwrap();

    // Inherited slot keeps its offset; own properties append after.
    assert_eq!(circle.slot_of("id"), Some(0));
    assert_eq!(circle.slot_of("radius"), Some(1));
    // Method override replaces the inherited function id.
    assert_eq!(circle.method("area"), Some(2));

    let mut c = Instance::new(&circle);
    c.write_property("id", &Value::int(9));
    c.write_property("radius", &Value::float(2.5));
    assert_eq!(c.read_property("id").unwrap().as_int(), Some(9));
    assert_eq!(c.read_property("radius").unwrap().as_float(), Some(2.5));
}

// A list flavor: element access goes to a table held in a declared slot
// instead of being rejected like a plain instance.

fn list_items_slot(inst: &Instance) -> u32 {
    inst.class().slot_of("items").expect("List declares `items`")
}

fn list_read_element(inst: &mut Instance, key: &Key) -> RuntimeResult<Option<Value>> {
    let slot = list_items_slot(inst);
    let Some(items) = inst.slot(slot).and_then(|v| v.as_table()) else {
        return Ok(None);
    };
    Ok(items.get(key).cloned())
}

fn list_write_element(inst: &mut Instance, key: Option<Key>, value: Value) -> RuntimeResult<()> {
    let slot = list_items_slot(inst);
    let cell = inst.slot_mut(slot).expect("declared slot exists");
    if cell.as_table().is_none() {
        *cell = Value::table(Table::new());
    }
    cell.as_table_mut()
        .expect("just initialized")
        .insert_or_update(key, value);
    Ok(())
}

fn list_count(inst: &Instance) -> Option<i64> {
    let slot = list_items_slot(inst);
    Some(inst.slot(slot)?.as_table()?.len() as i64)
}

#[test]
fn test_collection_flavor_overrides_element_handlers() {
    let mut ctx = Context::new();
    ctx.link_class(
        ClassDesc::new("List").property("items").handlers(
            HandlersBuilder::std()
                .read_element(list_read_element)
                .write_element(list_write_element)
                .count_elements(list_count),
        ),
    )
    .unwrap();

    let mut list = ctx.instantiate("List").unwrap();
    list.write_element(None, Value::int(10)).unwrap();
    list.write_element(None, Value::int(20)).unwrap();
    list.write_element(Some(Key::str("name")), Value::str(ctx.intern("xs")))
        .unwrap();

    assert_eq!(
        list.read_element(&Key::Int(1)).unwrap().unwrap().as_int(),
        Some(20)
    );
    assert_eq!(
        list.read_element(&Key::str("name")).unwrap().unwrap().as_str(),
        Some("xs")
    );
    assert!(list.read_element(&Key::Int(5)).unwrap().is_none());
    assert_eq!(list.count_elements(), Some(3));

    // A plain instance still rejects element access outright.
    ctx.link_class(ClassDesc::new("Plain")).unwrap();
    let mut plain = ctx.instantiate("Plain").unwrap();
    assert!(matches!(
        plain.write_element(None, Value::int(1)),
        Err(RuntimeError::TypeError(_))
    ));
    assert!(matches!(
        plain.read_element(&Key::Int(0)),
        Err(RuntimeError::TypeError(_))
    ));
    assert_eq!(plain.count_elements(), None);
}

#[test]
fn test_properties_for_purposes() {
    let mut ctx = Context::new();
    ctx.link_class(ClassDesc::new("Rec").property("a").property("b"))
        .unwrap();
    let mut rec = ctx.instantiate("Rec").unwrap();
    rec.write_property("a", &Value::int(1));
    rec.write_property("extra", &Value::int(2));

    // Debug export shows every declared slot plus dynamic properties.
    let debug = rec.properties_for(PropPurpose::Debug);
    assert_eq!(debug.len(), 3);

    // Array-cast export: `b` is null (a value, not undef), so all three
    // properties appear, in declaration-then-insertion order.
    let cast = rec.properties_for(PropPurpose::ArrayCast);
    let keys: Vec<String> = cast
        .iter()
        .map(|(k, _)| match k {
            KeyRef::Str(s) => s.to_string(),
            KeyRef::Int(i) => i.to_string(),
        })
        .collect();
    assert_eq!(keys, vec!["a", "b", "extra"]);

    // Clone export covers declared slots only.
    let export = rec.properties_for(PropPurpose::CloneExport);
    assert_eq!(export.len(), 2);
    assert!(export.get(&Key::str("extra")).is_none());
}

#[test]
fn test_clone_is_shallow() {
    let mut ctx = Context::new();
    ctx.link_class(ClassDesc::new("Holder").property("data"))
        .unwrap();
    let mut holder = ctx.instantiate("Holder").unwrap();

    let mut shared = Value::table(Table::new());
    shared.as_table_mut().unwrap().push(Value::int(1));
    holder.write_property("data", &shared);
    holder.write_property("note", &Value::int(5));

    let mut copy = holder.clone_instance().unwrap();

    // The declared slot aliases the same table.
    shared.as_table_mut().unwrap().push(Value::int(2));
    let via_copy = copy.read_property("data").unwrap();
    assert_eq!(via_copy.as_table().unwrap().len(), 2);
    assert_eq!(
        via_copy.heap_ref().unwrap(),
        shared.heap_ref().unwrap()
    );

    // The dynamic table itself is duplicated: new dynamic writes on the
    // copy do not appear on the original.
    copy.write_property("note", &Value::int(6));
    assert_eq!(holder.read_property("note").unwrap().as_int(), Some(5));
}
