//! Top-level runtime tying the marshaling core to one engine.
//!
//! A `Runtime` owns the engine context (engine, handle registry, diagnostic
//! sink), the method-bind cache, the sealed class registry and the signal
//! bridge. Generated bindings reach all of them through it.
//!
//! # Example
//!
//! ```ignore
//! use enginebind::prelude::*;
//! use std::sync::Arc;
//!
//! let engine = Arc::new(HeadlessEngine::new());
//! let mut builder = RuntimeBuilder::new(engine);
//! builder
//!     .register_class(ClassBuilder::new("Player", "Node", |base| Player::new(base)).build())?
//!     .leak_check(true);
//! let runtime = Runtime::install_global(builder.build()?)?;
//!
//! let player = runtime.construct("Player")?;
//! let name: String = runtime.call_method(&player, "get_class", |_| Ok(()))?;
//! ```

use std::fmt;
use std::sync::{Arc, OnceLock};

use tracing::{debug, info, warn};

use enginebind_core::diagnostics::{Diagnostic, DiagnosticOrigin, DiagnosticSink, TracingSink};
use enginebind_core::frame::DEFAULT_FRAME_CAPACITY;
use enginebind_core::handle::LeakedRecord;
use enginebind_core::{
    ArgumentFrame, BindError, BindResult, ClassTag, EngineContext, EngineInterface, Handle,
    HandleMode, ObjectPtr, Owned, PtrReturn,
};
use enginebind_registry::{
    ClassRegistry, ClassRegistryBuilder, ExtensionClass, MethodBindCache, SignalBridge,
};

static GLOBAL: OnceLock<Runtime> = OnceLock::new();

/// Collects host classes and settings before the runtime is built.
///
/// Not `Debug` because registered classes hold closures.
pub struct RuntimeBuilder {
    engine: Arc<dyn EngineInterface>,
    classes: ClassRegistryBuilder,
    sink: Option<Arc<dyn DiagnosticSink>>,
    frame_capacity: usize,
    leak_check: bool,
}

impl RuntimeBuilder {
    pub fn new(engine: Arc<dyn EngineInterface>) -> Self {
        RuntimeBuilder {
            engine,
            classes: ClassRegistryBuilder::new(),
            sink: None,
            frame_capacity: DEFAULT_FRAME_CAPACITY,
            leak_check: false,
        }
    }

    /// Add a host class.
    ///
    /// # Errors
    ///
    /// Returns [`BindError::AlreadyRegistered`] if a class with the same tag
    /// was already added.
    pub fn register_class(&mut self, class: ExtensionClass) -> BindResult<&mut Self> {
        self.classes.register(class)?;
        Ok(self)
    }

    /// Where diagnostics from reverse calls and the leak check go. Defaults
    /// to [`TracingSink`].
    pub fn diagnostic_sink(&mut self, sink: Arc<dyn DiagnosticSink>) -> &mut Self {
        self.sink = Some(sink);
        self
    }

    /// Argument slots in frames created by [`Runtime::new_frame`].
    pub fn frame_capacity(&mut self, capacity: usize) -> &mut Self {
        self.frame_capacity = capacity;
        self
    }

    /// Make [`Runtime::shutdown`] fail when handles leaked.
    pub fn leak_check(&mut self, enabled: bool) -> &mut Self {
        self.leak_check = enabled;
        self
    }

    /// Seal the class registry, register its classes with the engine and
    /// build the runtime.
    ///
    /// # Errors
    ///
    /// Returns the engine's error if it rejects a class registration.
    pub fn build(self) -> BindResult<Runtime> {
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));
        let context = EngineContext::new(Arc::clone(&self.engine), sink);
        let classes = Arc::new(self.classes.build()?);
        classes.register_with_engine(&context)?;
        debug!(
            target: "enginebind::runtime",
            classes = classes.len(),
            frame_capacity = self.frame_capacity,
            leak_check = self.leak_check,
            "runtime built"
        );
        Ok(Runtime {
            binds: MethodBindCache::new(self.engine),
            signals: SignalBridge::new(&context),
            context,
            classes,
            frame_capacity: self.frame_capacity,
            leak_check: self.leak_check,
        })
    }
}

/// The marshaling runtime for one engine.
pub struct Runtime {
    context: Arc<EngineContext>,
    binds: MethodBindCache,
    classes: Arc<ClassRegistry>,
    signals: SignalBridge,
    frame_capacity: usize,
    leak_check: bool,
}

impl Runtime {
    /// Install `runtime` as the process-wide instance.
    ///
    /// # Errors
    ///
    /// Returns [`BindError::AlreadyInitialized`] if one is already installed.
    pub fn install_global(runtime: Runtime) -> BindResult<&'static Runtime> {
        GLOBAL
            .set(runtime)
            .map_err(|_| BindError::AlreadyInitialized)?;
        info!(target: "enginebind::runtime", "global runtime installed");
        GLOBAL.get().ok_or(BindError::AlreadyInitialized)
    }

    /// The process-wide runtime, if installed.
    pub fn global() -> Option<&'static Runtime> {
        GLOBAL.get()
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub fn binds(&self) -> &MethodBindCache {
        &self.binds
    }

    pub fn classes(&self) -> &Arc<ClassRegistry> {
        &self.classes
    }

    pub fn signals(&self) -> &SignalBridge {
        &self.signals
    }

    pub fn frame_capacity(&self) -> usize {
        self.frame_capacity
    }

    /// An empty argument frame sized by the runtime's configuration.
    pub fn new_frame(&self) -> ArgumentFrame {
        ArgumentFrame::with_capacity(&self.context, self.frame_capacity)
    }

    /// Construct an engine object of `class` and take ownership of it.
    pub fn construct(&self, class: impl Into<ClassTag>) -> BindResult<Handle<Owned>> {
        self.classes.construct_by_name(&self.context, class)
    }

    /// Call `method` on `receiver`.
    ///
    /// `stage` pushes the arguments into the frame; the result is decoded as
    /// `R` (use `()` for void methods).
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn call_method<M, R, F>(&self, receiver: &Handle<M>, method: &str, stage: F) -> BindResult<R>
    where
        M: HandleMode,
        R: PtrReturn,
        F: FnOnce(&mut ArgumentFrame) -> BindResult<()>,
    {
        let object = receiver.ptr()?;
        self.call(receiver.class(), Some(object), method, stage)
    }

    /// Call a method that takes no receiver.
    pub fn call_static<R, F>(&self, class: impl Into<ClassTag>, method: &str, stage: F) -> BindResult<R>
    where
        R: PtrReturn,
        F: FnOnce(&mut ArgumentFrame) -> BindResult<()>,
    {
        self.call(class.into(), None, method, stage)
    }

    fn call<R, F>(
        &self,
        class: ClassTag,
        receiver: Option<ObjectPtr>,
        method: &str,
        stage: F,
    ) -> BindResult<R>
    where
        R: PtrReturn,
        F: FnOnce(&mut ArgumentFrame) -> BindResult<()>,
    {
        let bind = self.binds.resolve(class, method)?;
        let mut frame = self.new_frame();
        stage(&mut frame)?;
        let ret = frame.reserve_return::<R>();
        self.binds.invoke(&bind, receiver, &frame)?;
        let value = ret.read(&frame);
        frame.free();
        value
    }

    /// Run the shutdown leak check.
    ///
    /// Every leaked handle record is reported to the diagnostic sink. With
    /// leak checking enabled, any leak also fails with [`BindError::Leak`].
    pub fn shutdown(&self) -> BindResult<Vec<LeakedRecord>> {
        let leaks = self.context.handles().leak_report();
        for leak in &leaks {
            warn!(
                target: "enginebind::runtime",
                object = ?leak.object,
                class = %leak.class,
                reason = %leak.reason,
                "leaked handle"
            );
            self.context.report(Diagnostic::leak(
                DiagnosticOrigin::Handle {
                    class: leak.class,
                    object: leak.object.addr(),
                },
                leak.reason.to_string(),
            ));
        }
        if self.leak_check && !leaks.is_empty() {
            return Err(BindError::Leak { count: leaks.len() });
        }
        info!(target: "enginebind::runtime", leaks = leaks.len(), "shutdown");
        Ok(leaks)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("context", &self.context)
            .field("binds", &self.binds)
            .field("classes", &self.classes.len())
            .field("frame_capacity", &self.frame_capacity)
            .field("leak_check", &self.leak_check)
            .finish()
    }
}
