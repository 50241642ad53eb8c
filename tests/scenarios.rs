//! End-to-end flows a generated binding goes through.

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, bail};
use common::{Harness, install_echo_bytes};
use enginebind::prelude::*;
use enginebind::{DictionaryProxy, ExtensionClass, PackedArray};

#[test]
fn refcounted_object_lives_exactly_as_long_as_its_handle() {
    let harness = Harness::build(Vec::new(), |engine| {
        engine.add_class("Texture", "RefCounted").unwrap();
    });

    let texture = harness.runtime.construct("Texture").unwrap();
    let ptr = texture.ptr().unwrap();
    assert_eq!(texture.reference_count(), Some(1));
    assert_eq!(texture.ownership(), Some(OwnershipState::OwnedShared));

    let count: i64 = harness
        .runtime
        .call_method(&texture, "get_reference_count", |_| Ok(()))
        .unwrap();
    assert_eq!(count, 1);

    drop(texture);
    assert!(!harness.engine.is_alive(ptr));
    assert!(harness.runtime.shutdown().unwrap().is_empty());
}

#[test]
fn downcast_to_a_sibling_class_is_rejected() {
    let harness = Harness::build(Vec::new(), |engine| {
        engine.add_class("Base", "RefCounted").unwrap();
        engine.add_class("Derived", "Base").unwrap();
    });

    let base = harness.runtime.construct("Base").unwrap();
    let err = base.cast("Derived").unwrap_err();
    match err {
        BindError::TypeMismatch { expected, actual } => {
            assert_eq!(expected, "Derived");
            assert_eq!(actual, "Base");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(base.is_alive());
    assert_eq!(base.reference_count(), Some(1));

    let derived = harness.runtime.construct("Derived").unwrap();
    let as_base = derived.cast("Base").unwrap();
    assert_eq!(as_base.cast("Derived").unwrap(), derived);
}

#[test]
fn signal_delivers_emitted_arguments() {
    let harness = Harness::new();
    let timer = harness.runtime.construct("Node").unwrap();
    let received = Rc::new(RefCell::new(Vec::new()));

    let sink = Rc::clone(&received);
    harness
        .runtime
        .signals()
        .connect(&timer, "tick", ConnectFlags::empty(), move |args| {
            for arg in args {
                sink.borrow_mut().push(i64::from_variant(arg)?);
            }
            Ok(())
        })
        .unwrap();

    let delivered = harness
        .engine
        .emit_signal(timer.ptr().unwrap(), "tick", &[RawVariant::Int(42)]);
    assert_eq!(delivered, 1);
    assert_eq!(*received.borrow(), [42]);
    assert!(harness.sink.snapshot().is_empty());

    timer.free().unwrap();
}

#[test]
fn failing_signal_callback_is_reported_not_propagated() {
    let harness = Harness::new();
    let timer = harness.runtime.construct("Node").unwrap();
    harness
        .runtime
        .signals()
        .connect(&timer, "tick", ConnectFlags::empty(), |args| {
            bail!("expected no arguments, got {}", args.len())
        })
        .unwrap();
    harness
        .runtime
        .signals()
        .connect(&timer, "tick", ConnectFlags::empty(), |_| panic!("boom"))
        .unwrap();

    let delivered = harness
        .engine
        .emit_signal(timer.ptr().unwrap(), "tick", &[RawVariant::Bool(true)]);
    assert_eq!(delivered, 2);

    let diagnostics = harness.sink.take();
    assert_eq!(diagnostics.error_count(), 2);
    assert!(
        diagnostics
            .errors()
            .all(|d| matches!(&d.origin, DiagnosticOrigin::Signal { signal } if signal == "tick"))
    );

    timer.free().unwrap();
}

#[test]
fn one_shot_deferred_and_disconnected_subscriptions() {
    let harness = Harness::new();
    let node = harness.runtime.construct("Node").unwrap();
    let ptr = node.ptr().unwrap();
    let hits = Rc::new(RefCell::new(Vec::new()));
    let signals = harness.runtime.signals();

    let connect = |label: &'static str, flags: ConnectFlags| {
        let hits = Rc::clone(&hits);
        signals
            .connect(&node, "ready", flags, move |_| {
                hits.borrow_mut().push(label);
                Ok(())
            })
            .unwrap()
    };
    connect("once", ConnectFlags::ONE_SHOT);
    connect("later", ConnectFlags::DEFERRED);
    let removed = connect("removed", ConnectFlags::empty());
    signals.disconnect(&node, "ready", removed).unwrap();
    assert!(signals.disconnect(&node, "ready", removed).is_err());

    assert_eq!(harness.engine.emit_signal(ptr, "ready", &[]), 1);
    assert_eq!(harness.engine.emit_signal(ptr, "ready", &[]), 0);
    assert_eq!(*hits.borrow(), ["once"]);

    assert_eq!(harness.engine.flush_deferred(), 2);
    assert_eq!(*hits.borrow(), ["once", "later", "later"]);
    assert_eq!(harness.engine.connection_count(ptr), 1);

    node.free().unwrap();
    assert_eq!(SignalBridge::subscription_count(), 0);
}

#[test]
fn dictionary_proxy_reads_nested_values() {
    let harness = Harness::new();
    let context = harness.context();
    let builtins = harness.engine.builtin_count();

    let mut host = VarDictionary::new();
    host.insert(Variant::String("a".into()), Variant::Int(1));
    host.insert(
        Variant::String("b".into()),
        Variant::Array(vec![Variant::Bool(true), Variant::String("x".into())]),
    );

    let dictionary = DictionaryProxy::from_host(context, &host).unwrap();
    assert_eq!(dictionary.len(), 2);
    assert_eq!(
        dictionary.get(&Variant::String("a".into())).unwrap(),
        Some(Variant::Int(1))
    );
    assert_eq!(
        dictionary.get(&Variant::String("b".into())).unwrap(),
        Some(Variant::Array(vec![
            Variant::Bool(true),
            Variant::String("x".into())
        ]))
    );
    assert_eq!(dictionary.get(&Variant::String("c".into())).unwrap(), None);
    assert_eq!(
        dictionary.keys().unwrap(),
        [Variant::String("a".into()), Variant::String("b".into())]
    );
    assert_eq!(dictionary.to_host().unwrap(), host);

    drop(dictionary);
    assert_eq!(harness.engine.builtin_count(), builtins);
}

#[test]
fn packed_bytes_cross_an_engine_call_unchanged() {
    let harness = Harness::build(Vec::new(), install_echo_bytes);
    let bytes = vec![0u8, 1, 255];

    let echoed: Vec<u8> = harness
        .runtime
        .call_static("Object", "echo_bytes", |frame| frame.arg(&bytes))
        .unwrap();
    assert_eq!(echoed, bytes);

    let packed = PackedArray::from_slice(harness.context(), &bytes).unwrap();
    let echoed: PackedArray<u8> = harness
        .runtime
        .call_static("Object", "echo_bytes", |frame| frame.arg(&packed))
        .unwrap();
    assert_eq!(echoed.len(), 3);
    assert_eq!(echoed.view().unwrap().as_bytes(), &[0, 1, 255]);
    assert_eq!(packed.to_vec().unwrap(), bytes);
}

struct Poller {
    base: Handle<Observed>,
    polls: i64,
}

/// `Poller` extends `Node`; `poll` adds one plus its argument count.
fn poller_class(calls: &Arc<AtomicUsize>) -> ExtensionClass {
    let counter = Arc::clone(calls);
    ClassBuilder::new("Poller", "Node", |base| Poller { base, polls: 0 })
        .method("poll", move |this: &mut Poller, args| {
            counter.fetch_add(1, Ordering::SeqCst);
            assert!(this.base.is_alive());
            this.polls += args.len() as i64 + 1;
            Ok(Variant::Int(this.polls))
        })
        .build()
}

#[test]
fn engine_calls_host_override() {
    let calls = Arc::new(AtomicUsize::new(0));
    let harness = Harness::with_classes(vec![poller_class(&calls)]);

    let object = harness.runtime.construct("Poller").unwrap();
    let ptr = object.ptr().unwrap();
    assert_eq!(object.ownership(), Some(OwnershipState::OwnedUnique));

    let ret = harness.engine.call_virtual(ptr, "poll", &[]).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let ret = ret.expect("poll returns a value");
    assert_eq!(harness.engine.variant_get(ret), Some(RawVariant::Int(1)));
    harness.engine.variant_destroy(ret);

    let class: String = harness
        .runtime
        .call_method(&object, "get_class", |_| Ok(()))
        .unwrap();
    assert_eq!(class, "Poller");

    assert_eq!(
        harness.engine.call_virtual(ptr, "process", &[]),
        Err(CallStatus::NotOverridden)
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    object.free().unwrap();
    assert!(!harness.engine.is_alive(ptr));
    assert!(harness.sink.snapshot().is_empty());
}

struct FastPoller {
    poller: Poller,
    boost: i64,
}

#[test]
fn derived_host_class_inherits_its_parents_override() {
    let calls = Arc::new(AtomicUsize::new(0));
    let fast = ClassBuilder::new("FastPoller", "Poller", |base| FastPoller {
        poller: Poller { base, polls: 0 },
        boost: 10,
    })
    .extends(|fast: &mut FastPoller| &mut fast.poller)
    .method("boost", |fast: &mut FastPoller, _args| {
        Ok(Variant::Int(fast.boost + fast.poller.polls))
    })
    .build();
    let harness = Harness::with_classes(vec![poller_class(&calls), fast]);

    let object = harness.runtime.construct("FastPoller").unwrap();
    let ptr = object.ptr().unwrap();

    let ret = harness
        .engine
        .call_virtual(ptr, "poll", &[RawVariant::Int(7)])
        .unwrap()
        .expect("poll returns a value");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.engine.variant_get(ret), Some(RawVariant::Int(2)));
    harness.engine.variant_destroy(ret);

    let ret = harness
        .engine
        .call_virtual(ptr, "boost", &[])
        .unwrap()
        .expect("boost returns a value");
    assert_eq!(harness.engine.variant_get(ret), Some(RawVariant::Int(12)));
    harness.engine.variant_destroy(ret);

    object.free().unwrap();
    assert!(harness.sink.snapshot().is_empty());
}

#[test]
fn host_class_with_unreachable_parent_type_is_rejected() {
    let calls = Arc::new(AtomicUsize::new(0));
    let stray = ClassBuilder::new("Stray", "Poller", |_base| 0u32).build();
    let mut builder = RuntimeBuilder::new(Arc::new(HeadlessEngine::new()));
    builder.register_class(poller_class(&calls)).unwrap();
    builder.register_class(stray).unwrap();
    assert!(matches!(
        builder.build(),
        Err(BindError::TypeMismatch { expected, .. }) if expected.ends_with("Poller")
    ));
}

struct Relay {
    base: Handle<Observed>,
}

#[test]
fn reentrant_virtual_call_is_skipped_with_a_warning() {
    let engine_slot: Arc<OnceLock<Arc<HeadlessEngine>>> = Arc::new(OnceLock::new());
    let inner = Arc::clone(&engine_slot);
    let relay = ClassBuilder::new("Relay", "Node", |base| Relay { base })
        .method("relay", move |this: &mut Relay, _args| {
            let engine = inner.get().ok_or_else(|| anyhow!("engine not installed"))?;
            let nested = engine.call_virtual(this.base.ptr()?, "relay", &[]);
            Ok(Variant::Bool(nested == Ok(None)))
        })
        .build();
    let harness = Harness::with_classes(vec![relay]);
    assert!(engine_slot.set(Arc::clone(&harness.engine)).is_ok());

    let object = harness.runtime.construct("Relay").unwrap();
    let ret = harness
        .engine
        .call_virtual(object.ptr().unwrap(), "relay", &[])
        .unwrap()
        .expect("relay returns a value");
    assert_eq!(harness.engine.variant_get(ret), Some(RawVariant::Bool(true)));
    harness.engine.variant_destroy(ret);

    let diagnostics = harness.sink.take();
    assert_eq!(diagnostics.error_count(), 0);
    assert_eq!(diagnostics.warnings().count(), 1);

    object.free().unwrap();
}
