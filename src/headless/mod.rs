//! An in-process engine.
//!
//! [`HeadlessEngine`] implements [`EngineInterface`] entirely in host memory:
//! a class database with the core `Object` / `RefCounted` / `Node` /
//! `Resource` hierarchy, reference-counted objects, string, array,
//! dictionary and packed storage, variants, signals and extension classes.
//! Tests, benches and tools use it in place of a real engine.
//!
//! Methods are ordinary closures registered with
//! [`HeadlessEngine::add_method`]; they read their arguments and write their
//! result through a [`PtrCall`], using the same slot layouts as the argument
//! frame.
//!
//! ```ignore
//! let engine = Arc::new(HeadlessEngine::new());
//! engine.add_method("Node", "add", 2, |call| {
//!     // SAFETY: both arguments and the return are `int` slots.
//!     unsafe {
//!         let sum = call.arg::<i64>(0) + call.arg::<i64>(1);
//!         call.write_return(sum);
//!     }
//!     Ok(())
//! })?;
//! ```

mod store;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use enginebind_core::abi::{
    ArgPtr, BuiltinPtr, CallableInfo, ConnectFlags, EngineInterface, ExtensionClassInfo,
    InstanceId, MethodBindInfo, MethodBindPtr, ObjectPtr, RawVariant, RetPtr, UserData,
    VariantPtr, VariantType,
};
use enginebind_core::{CallStatus, ErrorCode};

use store::{Builtin, Connection, Deferred, InstanceSlot, MethodDef, Pending, Store};

pub use store::MethodFn;

/// One pointer-call as seen by a headless method body.
pub struct PtrCall<'a> {
    engine: &'a HeadlessEngine,
    receiver: Option<ObjectPtr>,
    args: *const ArgPtr,
    argc: u32,
    ret: RetPtr,
}

impl<'a> PtrCall<'a> {
    pub fn engine(&self) -> &'a HeadlessEngine {
        self.engine
    }

    pub fn receiver(&self) -> Option<ObjectPtr> {
        self.receiver
    }

    pub fn argc(&self) -> u32 {
        self.argc
    }

    /// Whether the caller supplied a return slot.
    pub fn has_return(&self) -> bool {
        !self.ret.is_null()
    }

    /// Read argument `index`.
    ///
    /// # Safety
    ///
    /// `T` must be the slot layout of that argument.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub unsafe fn arg<T: Copy>(&self, index: usize) -> T {
        assert!(index < self.argc as usize, "argument {index} out of range");
        // SAFETY: `args` holds `argc` pointers to live slots, and the caller
        // guarantees the layout.
        unsafe { *(*self.args.add(index) as *const T) }
    }

    /// Read a string argument.
    ///
    /// # Safety
    ///
    /// Argument `index` must be a string slot.
    pub unsafe fn arg_string(&self, index: usize) -> Option<String> {
        // SAFETY: forwarded to the caller.
        let ptr = unsafe { self.arg::<BuiltinPtr>(index) };
        self.engine.string_to_utf8(ptr)
    }

    /// Write the return value. Does nothing for void calls.
    ///
    /// # Safety
    ///
    /// `T` must be the slot layout of the method's return.
    pub unsafe fn write_return<T: Copy>(&self, value: T) {
        if !self.ret.is_null() {
            // SAFETY: the caller reserved a slot of this layout.
            unsafe { (self.ret as *mut T).write(value) }
        }
    }

    /// Return a new engine string.
    ///
    /// # Safety
    ///
    /// The method must return a string.
    pub unsafe fn return_string(&self, ty: VariantType, value: &str) {
        if self.has_return() {
            let ptr = self.engine.string_new(ty, value);
            // SAFETY: forwarded to the caller.
            unsafe { self.write_return(Some(ptr)) }
        }
    }

    /// Return an object, passing one reference to the caller for
    /// ref-counted objects.
    ///
    /// # Safety
    ///
    /// The method must return an object.
    pub unsafe fn return_object(&self, object: Option<ObjectPtr>) {
        if !self.has_return() {
            return;
        }
        if let Some(object) = object {
            self.engine.reference(object);
        }
        // SAFETY: forwarded to the caller.
        unsafe { self.write_return(object) }
    }
}

/// Engine state kept in host memory. See the [module docs](self).
pub struct HeadlessEngine {
    store: Mutex<Store>,
}

impl Default for HeadlessEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessEngine {
    /// Engine with the core class hierarchy and its introspection methods.
    pub fn new() -> Self {
        let mut store = Store::new();
        store.add_class("Object", None, false);
        store.add_class("RefCounted", Some("Object"), true);
        store.add_class("Node", Some("Object"), false);
        store.add_class("Resource", Some("RefCounted"), false);

        let engine = HeadlessEngine {
            store: Mutex::new(store),
        };
        engine.install_core_methods();
        engine
    }

    fn install_core_methods(&self) {
        let methods: [(&str, &str, MethodFn); 3] = [
            (
                "Object",
                "get_class",
                Arc::new(|call: &PtrCall<'_>| -> Result<(), ErrorCode> {
                    let receiver = call.receiver().ok_or(ErrorCode::InvalidParameter)?;
                    let class = call
                        .engine()
                        .object_class(receiver)
                        .ok_or(ErrorCode::Unavailable)?;
                    // SAFETY: `get_class` returns a String.
                    unsafe { call.return_string(VariantType::String, &class) };
                    Ok(())
                }),
            ),
            (
                "Object",
                "get_instance_id",
                Arc::new(|call: &PtrCall<'_>| -> Result<(), ErrorCode> {
                    let receiver = call.receiver().ok_or(ErrorCode::InvalidParameter)?;
                    let id = call
                        .engine()
                        .object_instance_id(receiver)
                        .ok_or(ErrorCode::Unavailable)?;
                    // SAFETY: `get_instance_id` returns an int.
                    unsafe { call.write_return(id.0 as i64) };
                    Ok(())
                }),
            ),
            (
                "RefCounted",
                "get_reference_count",
                Arc::new(|call: &PtrCall<'_>| -> Result<(), ErrorCode> {
                    let receiver = call.receiver().ok_or(ErrorCode::InvalidParameter)?;
                    let count = call.engine().reference_count(receiver).unwrap_or(0);
                    // SAFETY: `get_reference_count` returns an int.
                    unsafe { call.write_return(i64::from(count)) };
                    Ok(())
                }),
            ),
        ];
        let mut store = self.lock();
        for (class, method, call) in methods {
            store.add_method(class, method, MethodDef { arity: 0, call });
        }
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run host callbacks collected under the lock.
    fn finish(&self, pending: Vec<Pending>) {
        for work in pending {
            // SAFETY: each pending entry is produced once, by the store
            // operation that released the userdata.
            unsafe { work.run() };
        }
    }

    // ---- test surface ----------------------------------------------------

    /// Add a class deriving from `parent`. Ref-counting is inherited.
    pub fn add_class(&self, name: &str, parent: &str) -> Result<(), ErrorCode> {
        let mut store = self.lock();
        if store.classes.contains_key(name) {
            return Err(ErrorCode::AlreadyExists);
        }
        if !store.classes.contains_key(parent) {
            return Err(ErrorCode::DoesNotExist);
        }
        store.add_class(name, Some(parent), false);
        Ok(())
    }

    /// Add a method with `arity` arguments to `class`.
    pub fn add_method<F>(
        &self,
        class: &str,
        method: &str,
        arity: u32,
        body: F,
    ) -> Result<MethodBindPtr, ErrorCode>
    where
        F: Fn(&PtrCall<'_>) -> Result<(), ErrorCode> + Send + Sync + 'static,
    {
        let def = MethodDef {
            arity,
            call: Arc::new(body),
        };
        self.lock()
            .add_method(class, method, def)
            .ok_or(ErrorCode::DoesNotExist)
    }

    /// Emit `signal` on `object` with copies of `args`.
    ///
    /// Connections fire in registration order. Deferred connections are
    /// queued for [`HeadlessEngine::flush_deferred`]; one-shot connections
    /// are dropped as they fire. Returns the number of callables invoked now.
    pub fn emit_signal(&self, object: ObjectPtr, signal: &str, args: &[RawVariant]) -> usize {
        let (immediate, argv) = {
            let mut store = self.lock();
            let Some(slot) = store.objects.get_mut(&object) else {
                return 0;
            };
            let mut targets: Vec<Connection> = Vec::new();
            slot.connections.retain(|connection| {
                if connection.signal != signal {
                    return true;
                }
                targets.push(connection.clone());
                !connection.flags.contains(ConnectFlags::ONE_SHOT)
            });

            let mut immediate = Vec::new();
            for target in targets {
                if target.flags.contains(ConnectFlags::DEFERRED) {
                    let args = args.iter().map(|arg| store.new_variant(arg)).collect();
                    store.deferred.push_back(Deferred {
                        object,
                        connection: target.id,
                        callable: target.callable,
                        owned: target.flags.contains(ConnectFlags::ONE_SHOT),
                        args,
                    });
                } else {
                    immediate.push(target);
                }
            }
            let argv: Vec<VariantPtr> = args.iter().map(|arg| store.new_variant(arg)).collect();
            (immediate, argv)
        };
        trace!(target: "enginebind::headless", ?object, signal, receivers = immediate.len(), "emit");

        let mut delivered = 0;
        for target in immediate {
            let one_shot = target.flags.contains(ConnectFlags::ONE_SHOT);
            // An earlier receiver may have disconnected this one.
            if !one_shot && !self.is_connected(object, target.id) {
                continue;
            }
            self.deliver(target.callable, &argv);
            delivered += 1;
            if one_shot {
                self.finish(vec![Pending::FreeCallable(target.callable)]);
            }
        }
        self.destroy_variants(argv);
        delivered
    }

    /// Deliver every deferred emission queued so far. Returns the number of
    /// callables invoked.
    pub fn flush_deferred(&self) -> usize {
        let batch = std::mem::take(&mut self.lock().deferred);
        let mut delivered = 0;
        for item in batch {
            if item.owned || self.is_connected(item.object, item.connection) {
                self.deliver(item.callable, &item.args);
                delivered += 1;
            }
            if item.owned {
                self.finish(vec![Pending::FreeCallable(item.callable)]);
            }
            self.destroy_variants(item.args);
        }
        delivered
    }

    /// Invoke the host override of `method` on an extension object, the way
    /// the engine does for overridable callbacks.
    ///
    /// Returns the result variant (owned by the caller) or the status the
    /// host reported.
    pub fn call_virtual(
        &self,
        object: ObjectPtr,
        method: &str,
        args: &[RawVariant],
    ) -> Result<Option<VariantPtr>, CallStatus> {
        let (instance, argv) = {
            let mut store = self.lock();
            let slot = store.objects.get(&object).ok_or(CallStatus::InstanceIsNull)?;
            let instance = slot.instance.ok_or(CallStatus::NotOverridden)?;
            let argv: Vec<VariantPtr> = args.iter().map(|arg| store.new_variant(arg)).collect();
            (instance, argv)
        };

        let mut ret: Option<VariantPtr> = None;
        // SAFETY: the function and userdata words came from the class
        // registration and the instance is alive until `free_instance`.
        let status = unsafe {
            (instance.call_virtual)(
                instance.class,
                instance.instance,
                method,
                argv.as_ptr(),
                argv.len(),
                &mut ret,
            )
        };
        self.destroy_variants(argv);
        trace!(target: "enginebind::headless", ?object, method, ?status, "virtual call");
        match status {
            CallStatus::Ok => Ok(ret),
            other => {
                if let Some(ret) = ret {
                    self.variant_destroy(ret);
                }
                Err(other)
            }
        }
    }

    /// Drop every object, queued delivery and class registration, running
    /// the host's free callbacks.
    pub fn teardown(&self) {
        let mut pending = Vec::new();
        self.lock().teardown(&mut pending);
        debug!(target: "enginebind::headless", callbacks = pending.len(), "teardown");
        self.finish(pending);
    }

    fn deliver(&self, callable: CallableInfo, args: &[VariantPtr]) {
        let mut ret: Option<VariantPtr> = None;
        // SAFETY: the callable is registered and not yet freed; `args` are
        // live variants owned by this call.
        unsafe { (callable.call)(callable.userdata, args.as_ptr(), args.len(), &mut ret) };
        if let Some(ret) = ret {
            self.variant_destroy(ret);
        }
    }

    fn destroy_variants(&self, variants: Vec<VariantPtr>) {
        let mut pending = Vec::new();
        {
            let mut store = self.lock();
            for variant in variants {
                store.destroy_variant(variant, &mut pending);
            }
        }
        self.finish(pending);
    }

    fn is_connected(&self, object: ObjectPtr, connection: u64) -> bool {
        self.lock()
            .objects
            .get(&object)
            .is_some_and(|slot| slot.connections.iter().any(|c| c.id == connection))
    }

    // ---- inspection ------------------------------------------------------

    pub fn is_alive(&self, object: ObjectPtr) -> bool {
        self.lock().objects.contains_key(&object)
    }

    /// Live signal connections on `object`.
    pub fn connection_count(&self, object: ObjectPtr) -> usize {
        self.lock()
            .objects
            .get(&object)
            .map_or(0, |slot| slot.connections.len())
    }

    /// Number of `method_bind` lookups served so far.
    pub fn method_bind_lookups(&self) -> usize {
        self.lock().method_lookups
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn builtin_count(&self) -> usize {
        self.lock().builtins.len()
    }

    pub fn variant_count(&self) -> usize {
        self.lock().variants.len()
    }

    pub fn deferred_count(&self) -> usize {
        self.lock().deferred.len()
    }
}

impl EngineInterface for HeadlessEngine {
    fn construct_object(&self, class: &str) -> Option<ObjectPtr> {
        let (ptr, extension) = {
            let mut store = self.lock();
            let ptr = store.new_object(class)?;
            let extension = store
                .extension_of(class)
                .map(|info| (info.userdata, info.create_instance, info.free_instance, info.call_virtual));
            (ptr, extension)
        };
        trace!(target: "enginebind::headless", class, ?ptr, "construct");

        if let Some((class_data, create, free, call_virtual)) = extension {
            // SAFETY: the registration is alive while its class is.
            let instance = unsafe { create(class_data, ptr) }.unwrap_or(UserData::NULL);
            let orphaned = {
                let mut store = self.lock();
                match store.objects.get_mut(&ptr) {
                    Some(slot) => {
                        slot.instance = Some(InstanceSlot {
                            class: class_data,
                            free,
                            call_virtual,
                            instance,
                        });
                        false
                    }
                    None => true,
                }
            };
            if orphaned && !instance.is_null() {
                // SAFETY: the instance was never attached to an object.
                unsafe { free(class_data, instance) };
            }
        }
        Some(ptr)
    }

    fn destroy_object(&self, object: ObjectPtr) {
        let mut pending = Vec::new();
        let destroyed = self.lock().destroy_object(object, &mut pending);
        trace!(target: "enginebind::headless", ?object, destroyed, "destroy");
        self.finish(pending);
    }

    fn object_class(&self, object: ObjectPtr) -> Option<String> {
        self.lock().objects.get(&object).map(|slot| slot.class.clone())
    }

    fn object_instance_id(&self, object: ObjectPtr) -> Option<InstanceId> {
        self.lock().objects.get(&object).map(|slot| slot.instance_id)
    }

    fn object_from_instance_id(&self, id: InstanceId) -> Option<ObjectPtr> {
        self.lock().by_instance.get(&id).copied()
    }

    fn reference(&self, object: ObjectPtr) -> bool {
        self.lock().reference(object)
    }

    fn unreference(&self, object: ObjectPtr) -> bool {
        let mut pending = Vec::new();
        let destroyed = self.lock().unreference(object, &mut pending);
        self.finish(pending);
        destroyed
    }

    fn reference_count(&self, object: ObjectPtr) -> Option<u32> {
        self.lock().objects.get(&object).and_then(|slot| slot.refcount)
    }

    fn class_exists(&self, class: &str) -> bool {
        self.lock().classes.contains_key(class)
    }

    fn class_parent(&self, class: &str) -> Option<String> {
        self.lock().classes.get(class).and_then(|def| def.parent.clone())
    }

    fn class_is_refcounted(&self, class: &str) -> bool {
        self.lock().classes.get(class).is_some_and(|def| def.refcounted)
    }

    fn method_bind(&self, class: &str, method: &str) -> Option<MethodBindInfo> {
        let mut store = self.lock();
        store.method_lookups += 1;
        let ptr = store
            .chain(class)
            .find_map(|def| def.methods.get(method).copied())?;
        let arity = store.methods.get(&ptr)?.arity;
        Some(MethodBindInfo { ptr, arity })
    }

    unsafe fn ptrcall(
        &self,
        bind: MethodBindPtr,
        receiver: Option<ObjectPtr>,
        args: *const ArgPtr,
        ret: RetPtr,
    ) -> i32 {
        let (body, arity) = {
            let store = self.lock();
            let Some(def) = store.methods.get(&bind) else {
                return ErrorCode::MethodNotFound.as_i32();
            };
            if let Some(receiver) = receiver
                && !store.objects.contains_key(&receiver)
            {
                return ErrorCode::Unavailable.as_i32();
            }
            (Arc::clone(&def.call), def.arity)
        };
        let call = PtrCall {
            engine: self,
            receiver,
            args,
            argc: arity,
            ret,
        };
        match body(&call) {
            Ok(()) => ErrorCode::Ok.as_i32(),
            Err(code) => code.as_i32(),
        }
    }

    fn register_extension_class(&self, info: ExtensionClassInfo) -> i32 {
        let mut store = self.lock();
        if store.classes.contains_key(&info.class) {
            return ErrorCode::AlreadyExists.as_i32();
        }
        if !store.classes.contains_key(&info.parent) {
            return ErrorCode::DoesNotExist.as_i32();
        }
        debug!(target: "enginebind::headless", class = %info.class, parent = %info.parent, "extension class");
        let class = info.class.clone();
        store.add_class(&class, Some(info.parent.as_str()), false);
        if let Some(def) = store.classes.get_mut(&class) {
            def.extension = Some(info);
        }
        ErrorCode::Ok.as_i32()
    }

    fn string_new(&self, ty: VariantType, utf8: &str) -> BuiltinPtr {
        self.lock().new_builtin(Builtin::Text {
            ty,
            value: utf8.to_owned(),
        })
    }

    fn string_to_utf8(&self, string: BuiltinPtr) -> Option<String> {
        match self.lock().builtins.get(&string)? {
            Builtin::Text { value, .. } => Some(value.clone()),
            _ => None,
        }
    }

    fn builtin_type(&self, value: BuiltinPtr) -> Option<VariantType> {
        self.lock().builtins.get(&value).map(Builtin::ty)
    }

    fn builtin_duplicate(&self, value: BuiltinPtr) -> Option<BuiltinPtr> {
        self.lock().duplicate_builtin(value)
    }

    fn builtin_destroy(&self, value: BuiltinPtr) {
        let mut pending = Vec::new();
        self.lock().destroy_builtin(value, &mut pending);
        self.finish(pending);
    }

    fn array_new(&self) -> BuiltinPtr {
        self.lock().new_builtin(Builtin::Array(Vec::new()))
    }

    fn array_len(&self, array: BuiltinPtr) -> usize {
        match self.lock().builtins.get(&array) {
            Some(Builtin::Array(items)) => items.len(),
            _ => 0,
        }
    }

    fn array_get(&self, array: BuiltinPtr, index: usize) -> Option<VariantPtr> {
        let mut store = self.lock();
        let item = match store.builtins.get(&array)? {
            Builtin::Array(items) => *items.get(index)?,
            _ => return None,
        };
        Some(store.copy_variant(item))
    }

    fn array_push(&self, array: BuiltinPtr, value: VariantPtr) {
        let mut store = self.lock();
        if !matches!(store.builtins.get(&array), Some(Builtin::Array(_))) {
            return;
        }
        let copy = store.copy_variant(value);
        if let Some(Builtin::Array(items)) = store.builtins.get_mut(&array) {
            items.push(copy);
        }
    }

    fn array_set(&self, array: BuiltinPtr, index: usize, value: VariantPtr) -> bool {
        let mut pending = Vec::new();
        let replaced = {
            let mut store = self.lock();
            let in_range = matches!(
                store.builtins.get(&array),
                Some(Builtin::Array(items)) if index < items.len()
            );
            if in_range {
                let copy = store.copy_variant(value);
                let old = match store.builtins.get_mut(&array) {
                    Some(Builtin::Array(items)) => Some(std::mem::replace(&mut items[index], copy)),
                    _ => None,
                };
                if let Some(old) = old {
                    store.destroy_variant(old, &mut pending);
                }
            }
            in_range
        };
        self.finish(pending);
        replaced
    }

    fn dictionary_new(&self) -> BuiltinPtr {
        self.lock().new_builtin(Builtin::Dictionary(Vec::new()))
    }

    fn dictionary_len(&self, dictionary: BuiltinPtr) -> usize {
        match self.lock().builtins.get(&dictionary) {
            Some(Builtin::Dictionary(entries)) => entries.len(),
            _ => 0,
        }
    }

    fn dictionary_key_at(&self, dictionary: BuiltinPtr, index: usize) -> Option<VariantPtr> {
        let mut store = self.lock();
        let key = match store.builtins.get(&dictionary)? {
            Builtin::Dictionary(entries) => entries.get(index)?.0,
            _ => return None,
        };
        Some(store.copy_variant(key))
    }

    fn dictionary_get(&self, dictionary: BuiltinPtr, key: VariantPtr) -> Option<VariantPtr> {
        let mut store = self.lock();
        let index = store.dictionary_find(dictionary, key)?;
        let value = match store.builtins.get(&dictionary)? {
            Builtin::Dictionary(entries) => entries[index].1,
            _ => return None,
        };
        Some(store.copy_variant(value))
    }

    fn dictionary_set(&self, dictionary: BuiltinPtr, key: VariantPtr, value: VariantPtr) {
        let mut pending = Vec::new();
        {
            let mut store = self.lock();
            if !matches!(store.builtins.get(&dictionary), Some(Builtin::Dictionary(_))) {
                return;
            }
            let existing = store.dictionary_find(dictionary, key);
            let value = store.copy_variant(value);
            let key = match existing {
                Some(_) => None,
                None => Some(store.copy_variant(key)),
            };
            let old = match store.builtins.get_mut(&dictionary) {
                Some(Builtin::Dictionary(entries)) => match (existing, key) {
                    (Some(index), _) => Some(std::mem::replace(&mut entries[index].1, value)),
                    (None, Some(key)) => {
                        entries.push((key, value));
                        None
                    }
                    (None, None) => None,
                },
                _ => None,
            };
            if let Some(old) = old {
                store.destroy_variant(old, &mut pending);
            }
        }
        self.finish(pending);
    }

    fn packed_new(&self, ty: VariantType, bytes: &[u8]) -> Option<BuiltinPtr> {
        if !ty.is_packed() || ty == VariantType::PackedStringArray {
            return None;
        }
        Some(self.lock().new_builtin(Builtin::Packed {
            ty,
            bytes: bytes.to_vec(),
        }))
    }

    fn packed_bytes(&self, packed: BuiltinPtr) -> Option<(*const u8, usize)> {
        match self.lock().builtins.get(&packed)? {
            Builtin::Packed { bytes, .. } => Some((bytes.as_ptr(), bytes.len())),
            _ => None,
        }
    }

    fn packed_strings_new(&self, values: &[&str]) -> BuiltinPtr {
        let values = values.iter().map(|value| (*value).to_owned()).collect();
        self.lock().new_builtin(Builtin::PackedStrings(values))
    }

    fn packed_strings_get(&self, packed: BuiltinPtr) -> Option<Vec<String>> {
        match self.lock().builtins.get(&packed)? {
            Builtin::PackedStrings(values) => Some(values.clone()),
            _ => None,
        }
    }

    fn variant_new(&self, value: &RawVariant) -> VariantPtr {
        self.lock().new_variant(value)
    }

    fn variant_get(&self, variant: VariantPtr) -> Option<RawVariant> {
        self.lock().read_variant(variant)
    }

    fn variant_destroy(&self, variant: VariantPtr) {
        let mut pending = Vec::new();
        self.lock().destroy_variant(variant, &mut pending);
        self.finish(pending);
    }

    fn signal_connect(
        &self,
        object: ObjectPtr,
        signal: &str,
        callable: CallableInfo,
        flags: ConnectFlags,
    ) -> Result<u64, ErrorCode> {
        let mut store = self.lock();
        if !store.objects.contains_key(&object) {
            return Err(ErrorCode::InvalidParameter);
        }
        let id = store.next_connection();
        let slot = store.objects.get_mut(&object).ok_or(ErrorCode::InvalidParameter)?;
        slot.connections.push(Connection {
            id,
            signal: signal.to_owned(),
            callable,
            flags,
        });
        Ok(id)
    }

    fn signal_disconnect(&self, object: ObjectPtr, signal: &str, connection: u64) -> i32 {
        let removed = {
            let mut store = self.lock();
            store.objects.get_mut(&object).and_then(|slot| {
                let index = slot
                    .connections
                    .iter()
                    .position(|c| c.id == connection && c.signal == signal)?;
                Some(slot.connections.remove(index))
            })
        };
        match removed {
            Some(connection) => {
                self.finish(vec![Pending::FreeCallable(connection.callable)]);
                ErrorCode::Ok.as_i32()
            }
            None => ErrorCode::InvalidParameter.as_i32(),
        }
    }
}

impl Drop for HeadlessEngine {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.store
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .teardown(&mut pending);
        self.finish(pending);
    }
}

impl fmt::Debug for HeadlessEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let store = self.lock();
        f.debug_struct("HeadlessEngine")
            .field("classes", &store.classes.len())
            .field("objects", &store.objects.len())
            .field("builtins", &store.builtins.len())
            .field("variants", &store.variants.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_hierarchy() {
        let engine = HeadlessEngine::new();
        assert!(engine.class_is_refcounted("Resource"));
        assert!(!engine.class_is_refcounted("Node"));
        assert_eq!(engine.class_parent("Resource").as_deref(), Some("RefCounted"));
        assert_eq!(engine.class_parent("Object"), None);
    }

    #[test]
    fn refcount_lifecycle() {
        let engine = HeadlessEngine::new();
        let object = engine.construct_object("RefCounted").unwrap();
        assert_eq!(engine.reference_count(object), Some(1));
        assert!(engine.reference(object));
        assert!(!engine.unreference(object));
        assert!(engine.unreference(object));
        assert!(!engine.is_alive(object));
    }

    #[test]
    fn addresses_are_reused_with_new_instance_ids() {
        let engine = HeadlessEngine::new();
        let first = engine.construct_object("Node").unwrap();
        let first_id = engine.object_instance_id(first).unwrap();
        engine.destroy_object(first);
        let second = engine.construct_object("Node").unwrap();
        assert_eq!(first, second);
        assert_ne!(engine.object_instance_id(second), Some(first_id));
        assert_eq!(engine.object_from_instance_id(first_id), None);
    }

    #[test]
    fn method_lookup_walks_parents() {
        let engine = HeadlessEngine::new();
        let info = engine.method_bind("Resource", "get_reference_count").unwrap();
        assert_eq!(info.arity, 0);
        assert!(engine.method_bind("Node", "get_reference_count").is_none());
        assert_eq!(engine.method_bind_lookups(), 2);
    }

    #[test]
    fn dictionary_keys_compare_by_value() {
        let engine = HeadlessEngine::new();
        let dictionary = engine.dictionary_new();
        let name = engine.string_new(VariantType::String, "hp");
        let key = engine.variant_new(&RawVariant::Builtin {
            ty: VariantType::String,
            ptr: name,
        });
        let value = engine.variant_new(&RawVariant::Int(10));
        engine.dictionary_set(dictionary, key, value);
        engine.dictionary_set(dictionary, key, value);
        assert_eq!(engine.dictionary_len(dictionary), 1);

        let other_name = engine.string_new(VariantType::String, "hp");
        let lookup = engine.variant_new(&RawVariant::Builtin {
            ty: VariantType::String,
            ptr: other_name,
        });
        let found = engine.dictionary_get(dictionary, lookup).unwrap();
        assert_eq!(engine.variant_get(found), Some(RawVariant::Int(10)));
    }

    #[test]
    fn strong_variant_holds_a_reference() {
        let engine = HeadlessEngine::new();
        let object = engine.construct_object("Resource").unwrap();
        let variant = engine.variant_new(&RawVariant::Object {
            ptr: Some(object),
            strong: true,
        });
        assert_eq!(engine.reference_count(object), Some(2));
        engine.variant_destroy(variant);
        assert_eq!(engine.reference_count(object), Some(1));
    }

    #[test]
    fn weak_variant_reads_null_after_free() {
        let engine = HeadlessEngine::new();
        let object = engine.construct_object("Node").unwrap();
        let variant = engine.variant_new(&RawVariant::Object {
            ptr: Some(object),
            strong: false,
        });
        engine.destroy_object(object);
        assert_eq!(
            engine.variant_get(variant),
            Some(RawVariant::Object {
                ptr: None,
                strong: false
            })
        );
    }

    #[test]
    fn ptrcall_reads_arguments() {
        let engine = HeadlessEngine::new();
        let bind = engine
            .add_method("Object", "twice", 1, |call| {
                // SAFETY: one int argument, int return.
                unsafe { call.write_return(call.arg::<i64>(0) * 2) };
                Ok(())
            })
            .unwrap();
        let arg: i64 = 21;
        let args = [&arg as *const i64 as ArgPtr];
        let mut ret: i64 = 0;
        let status = unsafe { engine.ptrcall(bind, None, args.as_ptr(), &mut ret as *mut i64 as RetPtr) };
        assert_eq!(status, 0);
        assert_eq!(ret, 42);
    }
}
