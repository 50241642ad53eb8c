//! Host-defined classes and their reverse-call trampolines.
//!
//! A host class extends an engine class: the engine owns the object, the host
//! owns an instance value attached to it, and overridable ("virtual") methods
//! called by the engine are dispatched to host closures.
//!
//! ## Lifecycle
//!
//! 1. Classes are described with [`ClassBuilder`] and collected in a
//!    [`ClassRegistryBuilder`].
//! 2. [`ClassRegistryBuilder::build`] seals the set into a [`ClassRegistry`];
//!    nothing can be added afterwards.
//! 3. [`ClassRegistry::register_with_engine`] hands every class to the
//!    engine's class database, parents first.
//!
//! A host class may extend another host class with a different instance
//! type. [`ClassBuilder::extends`] names the projection from the derived
//! instance to its parent's, so inherited overrides run on the right value.
//!
//! ## Example
//!
//! ```ignore
//! let mut classes = ClassRegistryBuilder::new();
//! classes.register(
//!     ClassBuilder::new("Player", "Node", |base| Player { base, score: 0 })
//!         .method("poll", |player, _args| {
//!             player.score += 1;
//!             Ok(Variant::Int(player.score))
//!         })
//!         .build(),
//! )?;
//! let registry = Arc::new(classes.build()?);
//! registry.register_with_engine(&context)?;
//! ```

use std::any::{Any, TypeId, type_name};
use std::cell::RefCell;
use std::ffi::c_void;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use enginebind_core::abi::{ExtensionClassInfo, ObjectPtr, UserData, VariantPtr};
use enginebind_core::diagnostics::{Diagnostic, DiagnosticOrigin};
use enginebind_core::{
    BindError, BindResult, CallStatus, ClassTag, EngineContext, ErrorCode, Handle, Observed,
    Owned, Variant, VariantBridge,
};

use crate::panic_message;

/// Builds the host instance for a freshly constructed engine object. The
/// argument is an observed handle to that object.
pub type Constructor = Arc<dyn Fn(Handle<Observed>) -> anyhow::Result<Box<dyn Any>> + Send + Sync>;

/// Runs one overridable method on a host instance.
pub type VirtualDispatcher =
    Arc<dyn Fn(&mut dyn Any, &[Variant]) -> anyhow::Result<Variant> + Send + Sync>;

/// Projects a host instance onto the instance of its host parent class.
trait Upcast: Send + Sync {
    fn upcast<'a>(&self, this: &'a mut dyn Any) -> Option<&'a mut dyn Any>;

    fn target(&self) -> TypeId;

    fn target_name(&self) -> &'static str;
}

struct Projection<T, P>(fn(&mut T) -> &mut P);

impl<T: 'static, P: 'static> Upcast for Projection<T, P> {
    fn upcast<'a>(&self, this: &'a mut dyn Any) -> Option<&'a mut dyn Any> {
        let this = this.downcast_mut::<T>()?;
        let parent: &'a mut dyn Any = (self.0)(this);
        Some(parent)
    }

    fn target(&self) -> TypeId {
        TypeId::of::<P>()
    }

    fn target_name(&self) -> &'static str {
        type_name::<P>()
    }
}

/// A host class: its engine parent, constructor and virtual overrides.
pub struct ExtensionClass {
    tag: ClassTag,
    parent: ClassTag,
    type_id: TypeId,
    type_name: &'static str,
    upcast: Option<Arc<dyn Upcast>>,
    constructor: Constructor,
    methods: FxHashMap<String, VirtualDispatcher>,
}

impl ExtensionClass {
    pub fn tag(&self) -> ClassTag {
        self.tag
    }

    pub fn parent(&self) -> ClassTag {
        self.parent
    }

    /// Rust type of the instance value.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether this class itself overrides `method`.
    pub fn overrides(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }
}

impl fmt::Debug for ExtensionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        methods.sort_unstable();
        f.debug_struct("ExtensionClass")
            .field("tag", &self.tag)
            .field("parent", &self.parent)
            .field("type", &self.type_name)
            .field("extends", &self.upcast.as_ref().map(|u| u.target_name()))
            .field("methods", &methods)
            .finish()
    }
}

/// Typed builder for an [`ExtensionClass`] whose instances are `T`.
pub struct ClassBuilder<T> {
    tag: ClassTag,
    parent: ClassTag,
    upcast: Option<Arc<dyn Upcast>>,
    constructor: Constructor,
    methods: FxHashMap<String, VirtualDispatcher>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: 'static> ClassBuilder<T> {
    pub fn new<F>(class: impl Into<ClassTag>, parent: impl Into<ClassTag>, constructor: F) -> Self
    where
        F: Fn(Handle<Observed>) -> T + Send + Sync + 'static,
    {
        Self::try_new(class, parent, move |base| Ok(constructor(base)))
    }

    /// Like [`ClassBuilder::new`] with a fallible constructor. A failed
    /// construction is reported and the engine object gets no instance.
    pub fn try_new<F>(class: impl Into<ClassTag>, parent: impl Into<ClassTag>, constructor: F) -> Self
    where
        F: Fn(Handle<Observed>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        ClassBuilder {
            tag: class.into(),
            parent: parent.into(),
            upcast: None,
            constructor: Arc::new(move |base| -> anyhow::Result<Box<dyn Any>> {
                Ok(Box::new(constructor(base)?))
            }),
            methods: FxHashMap::default(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Declare that `T` embeds the instance type `P` of its host parent
    /// class. Overrides inherited from the parent run on `project(this)`.
    ///
    /// Without this, a host parent must use the same instance type.
    pub fn extends<P: 'static>(mut self, project: fn(&mut T) -> &mut P) -> Self {
        self.upcast = Some(Arc::new(Projection(project)));
        self
    }

    /// Override `name`. The dispatcher receives the decoded arguments; its
    /// return value is packed back for the engine (`Variant::Nil` for none).
    pub fn method<F>(mut self, name: &str, dispatcher: F) -> Self
    where
        F: Fn(&mut T, &[Variant]) -> anyhow::Result<Variant> + Send + Sync + 'static,
    {
        let dispatcher: VirtualDispatcher = Arc::new(move |this: &mut dyn Any, args: &[Variant]| -> anyhow::Result<Variant> {
            let this = this
                .downcast_mut::<T>()
                .ok_or_else(|| anyhow!("instance is not a {}", type_name::<T>()))?;
            dispatcher(this, args)
        });
        self.methods.insert(name.to_owned(), dispatcher);
        self
    }

    pub fn build(self) -> ExtensionClass {
        ExtensionClass {
            tag: self.tag,
            parent: self.parent,
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            upcast: self.upcast,
            constructor: self.constructor,
            methods: self.methods,
        }
    }
}

/// Collects host classes before they are sealed.
#[derive(Debug, Default)]
pub struct ClassRegistryBuilder {
    classes: Vec<ExtensionClass>,
    index: FxHashMap<ClassTag, usize>,
}

impl ClassRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a class. Registering the same tag twice fails with
    /// [`BindError::AlreadyRegistered`].
    pub fn register(&mut self, class: ExtensionClass) -> BindResult<()> {
        if self.index.contains_key(&class.tag) {
            return Err(BindError::AlreadyRegistered {
                class: class.tag.name().to_owned(),
            });
        }
        debug!(target: "enginebind::class_registry", class = %class.tag, parent = %class.parent, "register");
        self.index.insert(class.tag, self.classes.len());
        self.classes.push(class);
        Ok(())
    }

    pub fn contains(&self, class: ClassTag) -> bool {
        self.index.contains_key(&class)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Seal the registry.
    ///
    /// Fails with [`BindError::TypeMismatch`] when a class extends a host
    /// class whose instance type it cannot reach: either the types differ
    /// and no [`ClassBuilder::extends`] projection was given, or the
    /// projection targets another type.
    pub fn build(self) -> BindResult<ClassRegistry> {
        for class in &self.classes {
            let Some(&parent) = self.index.get(&class.parent) else {
                continue;
            };
            let parent = &self.classes[parent];
            let (reached, reached_name) = match &class.upcast {
                Some(upcast) => (upcast.target(), upcast.target_name()),
                None => (class.type_id, class.type_name),
            };
            if reached != parent.type_id {
                warn!(target: "enginebind::class_registry", class = %class.tag, parent = %parent.tag, "instance type does not extend parent");
                return Err(BindError::type_mismatch(parent.type_name, reached_name));
            }
        }
        Ok(ClassRegistry {
            classes: self.classes,
            index: self.index,
        })
    }
}

/// Sealed set of host classes.
#[derive(Debug)]
pub struct ClassRegistry {
    classes: Vec<ExtensionClass>,
    index: FxHashMap<ClassTag, usize>,
}

impl ClassRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        ClassRegistry {
            classes: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    pub fn get(&self, class: ClassTag) -> Option<&ExtensionClass> {
        self.index.get(&class).map(|&i| &self.classes[i])
    }

    pub fn contains(&self, class: ClassTag) -> bool {
        self.index.contains_key(&class)
    }

    /// Classes in registration order.
    pub fn classes(&self) -> impl Iterator<Item = &ExtensionClass> {
        self.classes.iter()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Find the dispatcher for `method` on `class`, walking up through host
    /// parent classes. An inherited override is wrapped so that it receives
    /// the ancestor's instance, projected out of the derived one.
    ///
    /// Fails with [`BindError::NotRegistered`] when neither the class nor any
    /// host ancestor overrides it; the engine then runs its default.
    pub fn dispatch_virtual(&self, class: ClassTag, method: &str) -> BindResult<VirtualDispatcher> {
        let mut current = self
            .get(class)
            .ok_or_else(|| BindError::not_registered(class.name()))?;
        let mut path: Vec<Arc<dyn Upcast>> = Vec::new();
        loop {
            if let Some(dispatcher) = current.methods.get(method) {
                let dispatcher = Arc::clone(dispatcher);
                if path.is_empty() {
                    return Ok(dispatcher);
                }
                return Ok(Arc::new(move |this: &mut dyn Any, args: &[Variant]| -> anyhow::Result<Variant> {
                    let mut this = this;
                    for step in &path {
                        this = step
                            .upcast(this)
                            .ok_or_else(|| anyhow!("instance does not extend {}", step.target_name()))?;
                    }
                    dispatcher(this, args)
                }));
            }
            let Some(parent) = self.get(current.parent) else {
                return Err(BindError::member_not_registered(class.name(), method));
            };
            if let Some(upcast) = &current.upcast {
                path.push(Arc::clone(upcast));
            }
            current = parent;
        }
    }

    /// Construct an object of `class` through the engine and take ownership
    /// of it.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn construct_by_name(
        &self,
        context: &Arc<EngineContext>,
        class: impl Into<ClassTag>,
    ) -> BindResult<Handle<Owned>> {
        let class = class.into();
        let engine = context.engine();
        if !engine.class_exists(class.name()) {
            return Err(BindError::not_registered(class.name()));
        }
        let ptr = engine
            .construct_object(class.name())
            .ok_or(BindError::Engine(ErrorCode::CantCreate))?;
        trace!(target: "enginebind::class_registry", %class, ?ptr, "constructed");
        context.handles().adopt_owned(ptr, class)
    }

    /// Register every class with the engine, in registration order.
    ///
    /// Each registration carries a class binding that holds only weak
    /// references to this registry and to `context`, so the engine never
    /// keeps either alive.
    pub fn register_with_engine(self: &Arc<Self>, context: &Arc<EngineContext>) -> BindResult<()> {
        for class in &self.classes {
            let binding = Arc::new(ClassBinding {
                tag: class.tag,
                registry: Arc::downgrade(self),
                context: Arc::downgrade(context),
            });
            let userdata = UserData(Arc::into_raw(binding) as *mut c_void);
            let info = ExtensionClassInfo {
                class: class.tag.name().to_owned(),
                parent: class.parent.name().to_owned(),
                userdata,
                create_instance: create_instance_trampoline,
                free_instance: free_instance_trampoline,
                call_virtual: call_virtual_trampoline,
                free_class: free_class_trampoline,
            };
            let status = context.engine().register_extension_class(info);
            if let Err(err) = ErrorCode::check(status) {
                // The engine did not take the registration; reclaim the binding.
                // SAFETY: `userdata` came from `Arc::into_raw` above and was not
                // retained by the engine.
                unsafe { free_class_trampoline(userdata) };
                return Err(err);
            }
            debug!(target: "enginebind::class_registry", class = %class.tag, "registered with engine");
        }
        Ok(())
    }
}

/// Class userdata handed to the engine.
struct ClassBinding {
    tag: ClassTag,
    registry: Weak<ClassRegistry>,
    context: Weak<EngineContext>,
}

impl ClassBinding {
    fn upgrade(&self) -> Option<(Arc<ClassRegistry>, Arc<EngineContext>)> {
        Some((self.registry.upgrade()?, self.context.upgrade()?))
    }
}

/// Instance userdata handed to the engine.
struct InstanceBinding {
    class: ClassTag,
    object: ObjectPtr,
    value: RefCell<Box<dyn Any>>,
}

/// # Safety
///
/// `class` must be a pointer produced by `register_with_engine`.
unsafe fn binding_ref<'a>(class: UserData) -> &'a ClassBinding {
    // SAFETY: guaranteed by the caller; the engine keeps the registration
    // alive until `free_class_trampoline`.
    unsafe { &*(class.0 as *const ClassBinding) }
}

unsafe fn create_instance_trampoline(class: UserData, object: ObjectPtr) -> Option<UserData> {
    // SAFETY: the engine passes back the userdata it was registered with.
    let binding = unsafe { binding_ref(class) };
    let (registry, context) = binding.upgrade()?;
    let entry = registry.get(binding.tag)?;
    let origin = || DiagnosticOrigin::Instance { class: binding.tag };

    let base = match context.handles().observe(object, binding.tag) {
        Ok(base) => base,
        Err(err) => {
            context.report(Diagnostic::error(origin(), err.to_string()));
            return None;
        }
    };

    match catch_unwind(AssertUnwindSafe(|| (entry.constructor)(base))) {
        Ok(Ok(value)) => {
            trace!(target: "enginebind::class_registry", class = %binding.tag, ?object, "instance created");
            let instance = Box::new(InstanceBinding {
                class: binding.tag,
                object,
                value: RefCell::new(value),
            });
            Some(UserData(Box::into_raw(instance) as *mut c_void))
        }
        Ok(Err(err)) => {
            context.report(Diagnostic::error(origin(), format!("constructor failed: {err:#}")));
            None
        }
        Err(payload) => {
            context.report(Diagnostic::error(
                origin(),
                format!("constructor panicked: {}", panic_message(payload.as_ref())),
            ));
            None
        }
    }
}

unsafe fn free_instance_trampoline(class: UserData, instance: UserData) {
    if instance.is_null() {
        return;
    }
    // SAFETY: `instance` came from `Box::into_raw` in create_instance and the
    // engine frees it exactly once.
    let instance = unsafe { Box::from_raw(instance.0 as *mut InstanceBinding) };
    let tag = instance.class;
    if catch_unwind(AssertUnwindSafe(move || drop(instance))).is_err() {
        // SAFETY: the engine passes back the userdata it was registered with.
        let binding = unsafe { binding_ref(class) };
        if let Some(context) = binding.context.upgrade() {
            context.report(Diagnostic::error(
                DiagnosticOrigin::Instance { class: tag },
                "instance destructor panicked",
            ));
        }
    }
}

unsafe fn call_virtual_trampoline(
    class: UserData,
    instance: UserData,
    method: &str,
    args: *const VariantPtr,
    argc: usize,
    ret: *mut Option<VariantPtr>,
) -> CallStatus {
    // SAFETY: the engine passes back the userdata it was registered with.
    let binding = unsafe { binding_ref(class) };
    let Some((registry, context)) = binding.upgrade() else {
        return CallStatus::InstanceIsNull;
    };
    let Ok(dispatcher) = registry.dispatch_virtual(binding.tag, method) else {
        return CallStatus::NotOverridden;
    };
    if instance.is_null() {
        return CallStatus::InstanceIsNull;
    }
    // SAFETY: `instance` came from create_instance and lives until
    // free_instance, which the engine never runs during a call on it.
    let instance = unsafe { &*(instance.0 as *const InstanceBinding) };
    let origin = || DiagnosticOrigin::Virtual {
        class: instance.class,
        method: method.to_owned(),
    };
    let receiver = match context
        .handles()
        .must_assert_instance(Some(instance.object), binding.tag)
    {
        Ok(receiver) => receiver,
        Err(err) => {
            context.report(Diagnostic::error(origin(), err.to_string()));
            return CallStatus::InstanceIsNull;
        }
    };

    let args = if argc == 0 || args.is_null() {
        &[][..]
    } else {
        // SAFETY: the engine passes `argc` variants valid for this call.
        unsafe { std::slice::from_raw_parts(args, argc) }
    };
    let values: BindResult<Vec<Variant>> = args
        .iter()
        .map(|&arg| VariantBridge::unpack_ptr(&context, arg))
        .collect();
    let values = match values {
        Ok(values) => values,
        Err(err) => {
            context.report(Diagnostic::error(origin(), format!("bad arguments: {err}")));
            return CallStatus::Ok;
        }
    };

    let Ok(mut this) = instance.value.try_borrow_mut() else {
        warn!(target: "enginebind::class_registry", class = %instance.class, method, "re-entrant virtual call");
        context.report(Diagnostic::warning(origin(), "instance is already in use by another call"));
        return CallStatus::Ok;
    };
    let outcome = catch_unwind(AssertUnwindSafe(|| dispatcher(&mut **this, &values)));
    drop(this);
    drop(receiver);

    match outcome {
        Ok(Ok(value)) => {
            if ret.is_null() || value.is_nil() {
                return CallStatus::Ok;
            }
            match VariantBridge::pack_any(&context, &value) {
                // SAFETY: `ret` is non-null and points at the engine's
                // return slot for this call.
                Ok(packed) => unsafe { *ret = Some(packed.into_raw()) },
                Err(err) => {
                    context.report(Diagnostic::error(origin(), format!("bad return value: {err}")))
                }
            }
        }
        Ok(Err(err)) => context.report(Diagnostic::error(origin(), format!("{err:#}"))),
        Err(payload) => context.report(Diagnostic::error(
            origin(),
            format!("panicked: {}", panic_message(payload.as_ref())),
        )),
    }
    CallStatus::Ok
}

unsafe fn free_class_trampoline(class: UserData) {
    if !class.is_null() {
        // SAFETY: `class` came from `Arc::into_raw` in register_with_engine
        // and is released exactly once.
        drop(unsafe { Arc::from_raw(class.0 as *const ClassBinding) });
    }
}
