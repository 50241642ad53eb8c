//! Shared fixtures for the integration tests.
//!
//! Every test gets its own [`HeadlessEngine`] and a runtime that reports into
//! a [`CollectingSink`], so diagnostics can be asserted on.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use enginebind::prelude::*;
use enginebind::{BuiltinPtr, ExtensionClass, VariantPtr};

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness writer.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// A headless engine with a runtime wired to it.
pub struct Harness {
    pub engine: Arc<HeadlessEngine>,
    pub sink: Arc<CollectingSink>,
    pub runtime: Runtime,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_classes(Vec::new())
    }

    /// Harness whose runtime registers `classes` with the engine.
    pub fn with_classes(classes: Vec<ExtensionClass>) -> Self {
        Self::build(classes, |_| {})
    }

    /// Harness whose engine is prepared by `setup` before the runtime is
    /// built (extra engine classes, methods).
    pub fn build<F>(classes: Vec<ExtensionClass>, setup: F) -> Self
    where
        F: FnOnce(&HeadlessEngine),
    {
        init_tracing();
        let engine = Arc::new(HeadlessEngine::new());
        setup(&engine);
        let sink = Arc::new(CollectingSink::new());

        let mut builder = RuntimeBuilder::new(engine.clone());
        for class in classes {
            builder.register_class(class).expect("class registers once");
        }
        builder.diagnostic_sink(sink.clone());
        let runtime = builder.build().expect("runtime builds");

        Harness {
            engine,
            sink,
            runtime,
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        self.runtime.context()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        // Extension instances hold handles back into the runtime.
        self.engine.teardown();
    }
}

/// Engine method `echo_bytes(PackedByteArray) -> PackedByteArray` on
/// `Object`, returning a copy of its argument.
pub fn install_echo_bytes(engine: &HeadlessEngine) {
    engine
        .add_method("Object", "echo_bytes", 1, |call| {
            // SAFETY: one packed-array argument, packed-array return.
            let input = unsafe { call.arg::<BuiltinPtr>(0) };
            let copy = call
                .engine()
                .builtin_duplicate(input)
                .ok_or(ErrorCode::InvalidParameter)?;
            unsafe { call.write_return(Some(copy)) };
            Ok(())
        })
        .expect("Object exists");
}

/// Engine method `concat(String, String) -> String` on `Object`.
pub fn install_concat(engine: &HeadlessEngine) {
    engine
        .add_method("Object", "concat", 2, |call| {
            // SAFETY: two string arguments, string return.
            let (a, b) = unsafe { (call.arg_string(0), call.arg_string(1)) };
            let (a, b) = a.zip(b).ok_or(ErrorCode::InvalidParameter)?;
            unsafe { call.return_string(VariantType::String, &format!("{a}{b}")) };
            Ok(())
        })
        .expect("Object exists");
}

/// Engine methods `builtin_address(builtin) -> int` and
/// `variant_address(Variant) -> int` on `Object`. Each returns the address of
/// the live value it was passed.
pub fn install_address_of(engine: &HeadlessEngine) {
    engine
        .add_method("Object", "builtin_address", 1, |call| {
            // SAFETY: one builtin argument, int return.
            let ptr = unsafe { call.arg::<BuiltinPtr>(0) };
            call.engine()
                .builtin_type(ptr)
                .ok_or(ErrorCode::InvalidParameter)?;
            unsafe { call.write_return(ptr.addr() as i64) };
            Ok(())
        })
        .expect("Object exists");
    engine
        .add_method("Object", "variant_address", 1, |call| {
            // SAFETY: one variant argument, int return.
            let ptr = unsafe { call.arg::<VariantPtr>(0) };
            call.engine()
                .variant_get(ptr)
                .ok_or(ErrorCode::InvalidParameter)?;
            unsafe { call.write_return(ptr.addr() as i64) };
            Ok(())
        })
        .expect("Object exists");
}
