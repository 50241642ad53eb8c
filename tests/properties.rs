//! Cross-component guarantees of the marshaling runtime, checked against the
//! headless engine.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{Harness, install_address_of, install_concat};
use enginebind::frame::live_slots;
use enginebind::prelude::*;
use enginebind::variant::ObjectValue;
use enginebind::{
    ArrayProxy, DictionaryProxy, PackPolicy, PackedArray, PtrArg, TypedArray, VariantProxy,
};

#[test]
fn dropping_an_owned_handle_returns_exactly_its_reference() {
    let harness = Harness::new();
    let resource = harness.runtime.construct("Resource").unwrap();
    let ptr = resource.ptr().unwrap();
    assert_eq!(resource.reference_count(), Some(1));

    // Someone else in the engine takes a reference.
    assert!(harness.engine.reference(ptr));
    let clone = resource.clone();
    assert_eq!(resource.reference_count(), Some(2));

    drop(resource);
    assert_eq!(harness.engine.reference_count(ptr), Some(2));
    drop(clone);
    assert_eq!(harness.engine.reference_count(ptr), Some(1));

    assert!(harness.engine.unreference(ptr));
    assert!(!harness.engine.is_alive(ptr));
}

#[test]
fn retain_and_release_balance() {
    let harness = Harness::new();
    let resource = harness.runtime.construct("Resource").unwrap();
    let ptr = resource.ptr().unwrap();

    resource.retain().unwrap();
    resource.retain().unwrap();
    assert_eq!(resource.reference_count(), Some(3));
    resource.release().unwrap();
    resource.release().unwrap();
    assert_eq!(resource.reference_count(), Some(1));

    drop(resource);
    assert!(!harness.engine.is_alive(ptr));
}

#[test]
fn readopting_an_owned_object_keeps_a_single_host_reference() {
    let harness = Harness::build(Vec::new(), |engine| {
        engine
            .add_method("RefCounted", "get_self", 0, |call| {
                // SAFETY: object return.
                unsafe { call.return_object(call.receiver()) };
                Ok(())
            })
            .unwrap();
    });
    let resource = harness.runtime.construct("Resource").unwrap();

    let same: Handle<Owned> = harness
        .runtime
        .call_method(&resource, "get_self", |_| Ok(()))
        .unwrap();
    assert_eq!(same, resource);
    assert_eq!(resource.reference_count(), Some(1));
}

#[test]
fn borrowed_handle_turns_null_when_its_parent_is_released() {
    let harness = Harness::new();
    let parent = harness.runtime.construct("Node").unwrap();
    let child_ptr = harness.engine.construct_object("Node").unwrap();
    let child = harness
        .context()
        .handles()
        .adopt_borrowed(child_ptr, "Node".into(), &parent)
        .unwrap();
    assert_eq!(child.ptr().unwrap(), child_ptr);
    assert_eq!(child.ownership(), Some(OwnershipState::Borrowed));

    parent.free().unwrap();

    // The engine object itself is still there; the view is not.
    assert!(harness.engine.is_alive(child_ptr));
    assert!(matches!(child.ptr(), Err(BindError::NullHandle { .. })));
    harness.engine.destroy_object(child_ptr);
}

#[test]
fn observed_handle_survives_address_reuse_as_null() {
    let harness = Harness::new();
    let ptr = harness.engine.construct_object("Node").unwrap();
    let observed = harness.context().handles().observe(ptr, "Node".into()).unwrap();

    harness.engine.destroy_object(ptr);
    let reused = harness.engine.construct_object("Node").unwrap();
    assert_eq!(reused, ptr);

    assert!(!observed.is_alive());
    assert!(matches!(observed.ptr(), Err(BindError::NullHandle { .. })));
    harness.engine.destroy_object(reused);
}

#[test]
fn cast_up_and_back_is_the_same_handle() {
    let harness = Harness::new();
    let resource = harness.runtime.construct("Resource").unwrap();

    let base = resource.cast("RefCounted").unwrap();
    let back = base.cast("Resource").unwrap();
    assert_eq!(back, resource);
    assert_eq!(back.class(), resource.class());
    assert_eq!(resource.reference_count(), Some(1));

    let err = resource.cast("Node").unwrap_err();
    assert!(matches!(err, BindError::TypeMismatch { .. }));

    drop(base);
    drop(back);
    assert_eq!(resource.reference_count(), Some(1));
    assert_eq!(resource.ownership(), Some(OwnershipState::OwnedShared));
}

#[test]
fn frames_release_everything_on_success_and_failure() {
    let harness = Harness::build(Vec::new(), install_concat);
    let slots = live_slots();
    let builtins = harness.engine.builtin_count();

    let joined: String = harness
        .runtime
        .call_static("Object", "concat", |frame| {
            frame.arg("left")?;
            frame.arg("right")
        })
        .unwrap();
    assert_eq!(joined, "leftright");
    assert_eq!(live_slots(), slots);
    assert_eq!(harness.engine.builtin_count(), builtins);

    let err = harness
        .runtime
        .call_static::<String, _>("Object", "concat", |frame| frame.arg("only"))
        .unwrap_err();
    assert!(matches!(
        err,
        BindError::ArityMismatch {
            expected: 2,
            found: 1,
            ..
        }
    ));
    assert_eq!(live_slots(), slots);
    assert_eq!(harness.engine.builtin_count(), builtins);
}

#[test]
fn nested_variants_survive_a_trip_through_the_engine() {
    let harness = Harness::new();
    let context = harness.context();
    let variants = harness.engine.variant_count();
    let builtins = harness.engine.builtin_count();

    let mut stats = VarDictionary::new();
    stats.insert(Variant::String("hp".into()), Variant::Int(10));
    stats.insert(Variant::Int(2), Variant::Float(0.5));
    let value = Variant::Array(vec![
        Variant::Int(1),
        Variant::Float(2.5),
        Variant::String("x".into()),
        Variant::StringName("name".into()),
        Variant::Dictionary(stats),
        Variant::PackedByteArray(vec![1, 2, 3]),
        Variant::PackedStringArray(vec!["a".into(), "b".into()]),
        Variant::Array(vec![Variant::Bool(true), Variant::Nil]),
    ]);

    let packed = VariantBridge::pack_any(context, &value).unwrap();
    let unpacked = VariantBridge::unpack_any(context, &packed).unwrap();
    assert_eq!(unpacked, value);

    drop(packed);
    assert_eq!(harness.engine.variant_count(), variants);
    assert_eq!(harness.engine.builtin_count(), builtins);
}

#[test]
fn strong_object_carrier_round_trips_without_extra_references() {
    let harness = Harness::new();
    let context = harness.context();
    let resource = harness.runtime.construct("Resource").unwrap();

    let value = Variant::Object(ObjectValue::Strong(resource.clone()));
    let packed = VariantBridge::pack_any(context, &value).unwrap();
    assert_eq!(resource.reference_count(), Some(2));

    let unpacked = VariantBridge::unpack_any(context, &packed).unwrap();
    assert_eq!(unpacked, value);
    assert_eq!(resource.reference_count(), Some(2));

    drop(packed);
    drop(unpacked);
    drop(value);
    assert_eq!(resource.reference_count(), Some(1));
}

#[test]
fn signal_receivers_fire_in_connection_order() {
    let harness = Harness::new();
    let emitter = harness.runtime.construct("Node").unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    for name in ["A", "B"] {
        let order = Rc::clone(&order);
        harness
            .runtime
            .signals()
            .connect(&emitter, "changed", ConnectFlags::empty(), move |_| {
                order.borrow_mut().push(name);
                Ok(())
            })
            .unwrap();
    }

    let delivered = harness
        .engine
        .emit_signal(emitter.ptr().unwrap(), "changed", &[]);
    assert_eq!(delivered, 2);
    assert_eq!(*order.borrow(), ["A", "B"]);

    emitter.free().unwrap();
    assert_eq!(SignalBridge::subscription_count(), 0);
}

fn builtin_address<T: PtrArg + ?Sized>(harness: &Harness, value: &T) -> BindResult<i64> {
    harness
        .runtime
        .call_static("Object", "builtin_address", |frame| frame.arg(value))
}

fn variant_address(harness: &Harness, value: &VariantProxy) -> BindResult<i64> {
    harness
        .runtime
        .call_static("Object", "variant_address", |frame| frame.arg(value))
}

#[test]
fn array_proxy_packs_by_borrow_clone_or_move() {
    let harness = Harness::build(Vec::new(), install_address_of);
    let context = harness.context();
    let builtins = harness.engine.builtin_count();

    let array = ArrayProxy::from_variants(context, &[Variant::Int(1), Variant::Int(2)]).unwrap();
    let with_array = harness.engine.builtin_count();
    let own = array.as_builtin().addr() as i64;
    assert_eq!(array.policy(), PackPolicy::Borrow);
    assert_eq!(builtin_address(&harness, &array).unwrap(), own);

    let array = array.with_policy(PackPolicy::Clone);
    let seen = builtin_address(&harness, &array).unwrap();
    assert_ne!(seen, own);
    assert_eq!(harness.engine.builtin_count(), with_array);
    assert_eq!(array.to_vec().unwrap(), [Variant::Int(1), Variant::Int(2)]);

    let array = array.with_policy(PackPolicy::Move);
    assert_eq!(builtin_address(&harness, &array).unwrap(), own);
    assert_eq!(harness.engine.builtin_count(), builtins);
    assert!(matches!(
        builtin_address(&harness, &array),
        Err(BindError::Codec { .. })
    ));
    assert!(array.duplicate().is_err());
    drop(array);
    assert_eq!(harness.engine.builtin_count(), builtins);
}

#[test]
fn typed_array_and_dictionary_honour_their_policy() {
    let harness = Harness::build(Vec::new(), install_address_of);
    let context = harness.context();
    let builtins = harness.engine.builtin_count();

    let ints = TypedArray::<i64>::from_slice(context, &[7, 8]).unwrap();
    let own = ints.as_array().as_builtin().addr() as i64;
    let ints = ints.with_policy(PackPolicy::Clone);
    assert_eq!(ints.policy(), PackPolicy::Clone);
    assert_ne!(builtin_address(&harness, &ints).unwrap(), own);
    assert_eq!(ints.to_vec().unwrap(), [7, 8]);

    let mut host = VarDictionary::new();
    host.insert(Variant::String("k".into()), Variant::Int(1));
    let dictionary = DictionaryProxy::from_host(context, &host)
        .unwrap()
        .with_policy(PackPolicy::Move);
    let own = dictionary.as_builtin().addr() as i64;
    let before_move = harness.engine.builtin_count();
    assert_eq!(builtin_address(&harness, &dictionary).unwrap(), own);
    assert!(harness.engine.builtin_count() < before_move);

    drop(ints);
    drop(dictionary);
    assert_eq!(harness.engine.builtin_count(), builtins);
}

#[test]
fn variant_proxy_packs_by_borrow_clone_or_move() {
    let harness = Harness::build(Vec::new(), install_address_of);
    let context = harness.context();
    let variants = harness.engine.variant_count();

    let value = VariantProxy::from_raw(context, &RawVariant::Int(5));
    let own = value.as_ptr().addr() as i64;
    assert_eq!(variant_address(&harness, &value).unwrap(), own);

    let value = value.with_policy(PackPolicy::Clone);
    assert_ne!(variant_address(&harness, &value).unwrap(), own);
    assert_eq!(harness.engine.variant_count(), variants + 1);
    assert_eq!(value.to_host().unwrap(), Variant::Int(5));

    let value = value.with_policy(PackPolicy::Move);
    assert_eq!(variant_address(&harness, &value).unwrap(), own);
    assert_eq!(harness.engine.variant_count(), variants);
    assert!(value.raw().is_err());
    assert!(variant_address(&harness, &value).is_err());
    drop(value);
    assert_eq!(harness.engine.variant_count(), variants);
}

#[test]
fn packed_array_is_viewable_under_any_policy() {
    let harness = Harness::build(Vec::new(), install_address_of);
    let context = harness.context();
    let builtins = harness.engine.builtin_count();

    let floats = PackedArray::from_slice(context, &[0.5f32, 1.5]).unwrap();
    assert_eq!(floats.view().unwrap().get(1), Some(1.5));
    assert_eq!(floats.view().unwrap().get(2), None);

    let floats = floats.with_policy(PackPolicy::Clone);
    let own = floats.as_builtin().addr() as i64;
    assert_ne!(builtin_address(&harness, &floats).unwrap(), own);
    assert_eq!(floats.view().unwrap().iter().collect::<Vec<_>>(), [0.5, 1.5]);

    let floats = floats.with_policy(PackPolicy::Move);
    assert_eq!(builtin_address(&harness, &floats).unwrap(), own);
    assert!(floats.view().is_err());
    assert!(floats.is_empty());
    drop(floats);
    assert_eq!(harness.engine.builtin_count(), builtins);
}

#[test]
fn owned_frame_argument_is_released_with_the_frame() {
    let harness = Harness::build(Vec::new(), install_address_of);
    let context = harness.context();
    let builtins = harness.engine.builtin_count();

    let array = ArrayProxy::from_variants(context, &[Variant::Bool(true)]).unwrap();
    let own = array.as_builtin().addr() as i64;
    let seen: i64 = harness
        .runtime
        .call_static("Object", "builtin_address", |frame| frame.arg_owned(array))
        .unwrap();
    assert_eq!(seen, own);
    assert_eq!(harness.engine.builtin_count(), builtins);
}

#[test]
fn engine_receivers_are_checked_before_use() {
    let harness = Harness::new();
    let handles = harness.context().handles();
    let resource = harness.runtime.construct("Resource").unwrap();
    let ptr = resource.ptr().unwrap();

    assert!(matches!(
        handles.must_assert_instance(None, ClassTag::new("Resource")),
        Err(BindError::NullHandle { class }) if class == "Resource"
    ));

    let view = handles
        .must_assert_instance(Some(ptr), ClassTag::new("RefCounted"))
        .unwrap();
    assert_eq!(view.ptr().unwrap(), ptr);
    assert_eq!(resource.reference_count(), Some(1));

    assert!(matches!(
        handles.must_assert_instance(Some(ptr), ClassTag::new("Node")),
        Err(BindError::TypeMismatch { expected, actual }) if expected == "Node" && actual == "Resource"
    ));
    drop(view);

    let node = harness.runtime.construct("Node").unwrap();
    let node_ptr = node.ptr().unwrap();
    node.free().unwrap();
    assert!(matches!(
        handles.must_assert_instance(Some(node_ptr), ClassTag::new("Node")),
        Err(BindError::NullHandle { .. })
    ));
}
