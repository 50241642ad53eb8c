//! The process-wide runtime. Kept in its own test binary since it can only
//! be installed once per process.

mod common;

use std::sync::Arc;

use enginebind::prelude::*;

#[test]
fn global_runtime_installs_once_and_checks_leaks() {
    common::init_tracing();
    let engine = Arc::new(HeadlessEngine::new());
    let sink = Arc::new(CollectingSink::new());

    assert!(Runtime::global().is_none());
    let mut builder = RuntimeBuilder::new(engine.clone());
    builder
        .diagnostic_sink(sink.clone())
        .frame_capacity(4)
        .leak_check(true);
    let runtime = Runtime::install_global(builder.build().unwrap()).unwrap();
    assert!(std::ptr::eq(runtime, Runtime::global().unwrap()));
    assert_eq!(runtime.frame_capacity(), 4);
    assert_eq!(runtime.new_frame().capacity(), 4);

    let second = RuntimeBuilder::new(engine.clone()).build().unwrap();
    assert!(matches!(
        Runtime::install_global(second),
        Err(BindError::AlreadyInitialized)
    ));

    // A unique object dropped without `free` stays alive in the engine.
    let node = runtime.construct("Node").unwrap();
    let ptr = node.ptr().unwrap();
    drop(node);
    assert!(engine.is_alive(ptr));

    let err = runtime.shutdown().unwrap_err();
    assert!(matches!(err, BindError::Leak { count: 1 }));
    let diagnostics = sink.take();
    assert!(diagnostics.has_leaks());
    assert_eq!(diagnostics.leaks().count(), 1);

    engine.destroy_object(ptr);
    assert!(runtime.shutdown().unwrap().is_empty());
}
