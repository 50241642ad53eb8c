//! Storage behind the headless engine: class database, objects, builtins
//! and variants.
//!
//! Everything here runs under the engine lock. Host callbacks that an
//! operation triggers (freeing an instance or a callable) are queued as
//! [`Pending`] work and run by the caller after the lock is released.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use enginebind_core::abi::{
    BuiltinPtr, CallVirtualFn, CallableInfo, ConnectFlags, ExtensionClassInfo, FreeInstanceFn,
    InstanceId, MethodBindPtr, ObjectPtr, RawVariant, UserData, VariantPtr, VariantType,
};
use enginebind_core::ErrorCode;

use super::PtrCall;

/// Body of a headless method.
pub type MethodFn = Arc<dyn Fn(&PtrCall<'_>) -> Result<(), ErrorCode> + Send + Sync>;

const FIRST_ADDRESS: NonZeroUsize = NonZeroUsize::new(0x1000).unwrap();
const ADDRESS_STRIDE: usize = 0x10;

/// Host callback to run once the lock is released.
pub(super) enum Pending {
    FreeInstance {
        free: FreeInstanceFn,
        class: UserData,
        instance: UserData,
    },
    FreeCallable(CallableInfo),
    FreeClass(ExtensionClassInfo),
}

impl Pending {
    /// # Safety
    ///
    /// Each pending entry must be run at most once.
    pub(super) unsafe fn run(self) {
        // SAFETY: the userdata words were handed to the engine together with
        // these functions and are released exactly once.
        unsafe {
            match self {
                Pending::FreeInstance {
                    free,
                    class,
                    instance,
                } => free(class, instance),
                Pending::FreeCallable(callable) => (callable.free)(callable.userdata),
                Pending::FreeClass(info) => (info.free_class)(info.userdata),
            }
        }
    }
}

pub(super) struct ClassDef {
    pub parent: Option<String>,
    pub refcounted: bool,
    pub methods: FxHashMap<String, MethodBindPtr>,
    pub extension: Option<ExtensionClassInfo>,
}

pub(super) struct MethodDef {
    pub arity: u32,
    pub call: MethodFn,
}

/// Host instance attached to an extension object.
#[derive(Clone, Copy)]
pub(super) struct InstanceSlot {
    pub class: UserData,
    pub free: FreeInstanceFn,
    pub call_virtual: CallVirtualFn,
    pub instance: UserData,
}

#[derive(Clone)]
pub(super) struct Connection {
    pub id: u64,
    pub signal: String,
    pub callable: CallableInfo,
    pub flags: ConnectFlags,
}

pub(super) struct ObjectSlot {
    pub class: String,
    pub instance_id: InstanceId,
    /// `Some` for ref-counted objects.
    pub refcount: Option<u32>,
    pub instance: Option<InstanceSlot>,
    /// In registration order.
    pub connections: Vec<Connection>,
}

pub(super) enum Builtin {
    Text { ty: VariantType, value: String },
    Array(Vec<VariantPtr>),
    Dictionary(Vec<(VariantPtr, VariantPtr)>),
    Packed { ty: VariantType, bytes: Vec<u8> },
    PackedStrings(Vec<String>),
}

impl Builtin {
    pub fn ty(&self) -> VariantType {
        match self {
            Builtin::Text { ty, .. } | Builtin::Packed { ty, .. } => *ty,
            Builtin::Array(_) => VariantType::Array,
            Builtin::Dictionary(_) => VariantType::Dictionary,
            Builtin::PackedStrings(_) => VariantType::PackedStringArray,
        }
    }
}

/// A queued deferred delivery.
pub(super) struct Deferred {
    pub object: ObjectPtr,
    pub connection: u64,
    pub callable: CallableInfo,
    /// One-shot deliveries own the callable and free it afterwards.
    pub owned: bool,
    pub args: Vec<VariantPtr>,
}

pub(super) struct Store {
    pub classes: FxHashMap<String, ClassDef>,
    pub methods: FxHashMap<MethodBindPtr, MethodDef>,
    pub objects: FxHashMap<ObjectPtr, ObjectSlot>,
    pub by_instance: FxHashMap<InstanceId, ObjectPtr>,
    pub builtins: FxHashMap<BuiltinPtr, Builtin>,
    pub variants: FxHashMap<VariantPtr, RawVariant>,
    pub deferred: VecDeque<Deferred>,
    pub method_lookups: usize,
    free_objects: Vec<NonZeroUsize>,
    next_address: NonZeroUsize,
    next_instance_id: u64,
    next_connection: u64,
}

impl Store {
    pub fn new() -> Self {
        Store {
            classes: FxHashMap::default(),
            methods: FxHashMap::default(),
            objects: FxHashMap::default(),
            by_instance: FxHashMap::default(),
            builtins: FxHashMap::default(),
            variants: FxHashMap::default(),
            deferred: VecDeque::new(),
            method_lookups: 0,
            free_objects: Vec::new(),
            next_address: FIRST_ADDRESS,
            next_instance_id: 0,
            next_connection: 0,
        }
    }

    fn address(&mut self) -> NonZeroUsize {
        let addr = self.next_address;
        self.next_address = addr.saturating_add(ADDRESS_STRIDE);
        addr
    }

    pub fn next_connection(&mut self) -> u64 {
        self.next_connection += 1;
        self.next_connection
    }

    // ---- class database --------------------------------------------------

    pub fn add_class(&mut self, name: &str, parent: Option<&str>, refcounted: bool) {
        let refcounted = refcounted
            || parent
                .and_then(|p| self.classes.get(p))
                .is_some_and(|p| p.refcounted);
        self.classes.insert(
            name.to_owned(),
            ClassDef {
                parent: parent.map(str::to_owned),
                refcounted,
                methods: FxHashMap::default(),
                extension: None,
            },
        );
    }

    /// `class` followed by its ancestors.
    pub fn chain<'a>(&'a self, class: &str) -> impl Iterator<Item = &'a ClassDef> + use<'a> {
        let mut next = self.classes.get(class);
        std::iter::from_fn(move || {
            let current = next?;
            next = current.parent.as_deref().and_then(|p| self.classes.get(p));
            Some(current)
        })
    }

    pub fn add_method(&mut self, class: &str, method: &str, def: MethodDef) -> Option<MethodBindPtr> {
        if !self.classes.contains_key(class) {
            return None;
        }
        let ptr = MethodBindPtr::from_non_zero(self.address());
        let entry = self.classes.get_mut(class)?;
        entry.methods.insert(method.to_owned(), ptr);
        self.methods.insert(ptr, def);
        Some(ptr)
    }

    // ---- objects ---------------------------------------------------------

    /// Allocate an object. Freed object addresses are reused, newest first,
    /// the way a real allocator hands back recently freed blocks.
    pub fn new_object(&mut self, class: &str) -> Option<ObjectPtr> {
        let refcounted = self.classes.get(class)?.refcounted;
        let addr = match self.free_objects.pop() {
            Some(addr) => addr,
            None => self.address(),
        };
        let ptr = ObjectPtr::from_non_zero(addr);
        self.next_instance_id += 1;
        let instance_id = InstanceId(self.next_instance_id);
        self.objects.insert(
            ptr,
            ObjectSlot {
                class: class.to_owned(),
                instance_id,
                refcount: refcounted.then_some(1),
                instance: None,
                connections: Vec::new(),
            },
        );
        self.by_instance.insert(instance_id, ptr);
        Some(ptr)
    }

    /// Nearest extension registration in the chain of `class`.
    pub fn extension_of(&self, class: &str) -> Option<&ExtensionClassInfo> {
        self.chain(class).find_map(|def| def.extension.as_ref())
    }

    pub fn destroy_object(&mut self, ptr: ObjectPtr, pending: &mut Vec<Pending>) -> bool {
        let Some(slot) = self.objects.remove(&ptr) else {
            return false;
        };
        self.by_instance.remove(&slot.instance_id);
        if let Some(addr) = NonZeroUsize::new(ptr.addr()) {
            self.free_objects.push(addr);
        }
        if let Some(instance) = slot.instance {
            pending.push(Pending::FreeInstance {
                free: instance.free,
                class: instance.class,
                instance: instance.instance,
            });
        }
        pending.extend(
            slot.connections
                .into_iter()
                .map(|connection| Pending::FreeCallable(connection.callable)),
        );
        true
    }

    pub fn reference(&mut self, ptr: ObjectPtr) -> bool {
        match self.objects.get_mut(&ptr).and_then(|slot| slot.refcount.as_mut()) {
            Some(count) => {
                *count += 1;
                true
            }
            None => false,
        }
    }

    pub fn unreference(&mut self, ptr: ObjectPtr, pending: &mut Vec<Pending>) -> bool {
        let Some(count) = self.objects.get_mut(&ptr).and_then(|slot| slot.refcount.as_mut()) else {
            return false;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            return self.destroy_object(ptr, pending);
        }
        false
    }

    // ---- builtins --------------------------------------------------------

    pub fn new_builtin(&mut self, value: Builtin) -> BuiltinPtr {
        let ptr = BuiltinPtr::from_non_zero(self.address());
        self.builtins.insert(ptr, value);
        ptr
    }

    pub fn duplicate_builtin(&mut self, ptr: BuiltinPtr) -> Option<BuiltinPtr> {
        let copy = match self.builtins.get(&ptr)? {
            Builtin::Text { ty, value } => Builtin::Text {
                ty: *ty,
                value: value.clone(),
            },
            Builtin::Packed { ty, bytes } => Builtin::Packed {
                ty: *ty,
                bytes: bytes.clone(),
            },
            Builtin::PackedStrings(values) => Builtin::PackedStrings(values.clone()),
            Builtin::Array(items) => {
                let items = items.clone();
                Builtin::Array(items.into_iter().map(|item| self.copy_variant(item)).collect())
            }
            Builtin::Dictionary(entries) => {
                let entries = entries.clone();
                Builtin::Dictionary(
                    entries
                        .into_iter()
                        .map(|(k, v)| (self.copy_variant(k), self.copy_variant(v)))
                        .collect(),
                )
            }
        };
        Some(self.new_builtin(copy))
    }

    pub fn destroy_builtin(&mut self, ptr: BuiltinPtr, pending: &mut Vec<Pending>) {
        match self.builtins.remove(&ptr) {
            Some(Builtin::Array(items)) => {
                for item in items {
                    self.destroy_variant(item, pending);
                }
            }
            Some(Builtin::Dictionary(entries)) => {
                for (key, value) in entries {
                    self.destroy_variant(key, pending);
                    self.destroy_variant(value, pending);
                }
            }
            _ => {}
        }
    }

    // ---- variants --------------------------------------------------------

    /// Store a variant holding a copy of `value`.
    pub fn new_variant(&mut self, value: &RawVariant) -> VariantPtr {
        let stored = match *value {
            RawVariant::Builtin { ty, ptr } => match self.duplicate_builtin(ptr) {
                Some(copy) => RawVariant::Builtin { ty, ptr: copy },
                None => RawVariant::Nil,
            },
            RawVariant::Object {
                ptr: Some(ptr),
                strong,
            } => {
                if !self.objects.contains_key(&ptr) {
                    RawVariant::Object { ptr: None, strong }
                } else {
                    // Only ref-counted objects can be held strongly.
                    let strong = strong && self.reference(ptr);
                    RawVariant::Object {
                        ptr: Some(ptr),
                        strong,
                    }
                }
            }
            other => other,
        };
        let ptr = VariantPtr::from_non_zero(self.address());
        self.variants.insert(ptr, stored);
        ptr
    }

    pub fn copy_variant(&mut self, ptr: VariantPtr) -> VariantPtr {
        let value = self.variants.get(&ptr).copied().unwrap_or(RawVariant::Nil);
        self.new_variant(&value)
    }

    /// What a variant currently holds. A weak object reference to a freed
    /// object reads as null.
    pub fn read_variant(&self, ptr: VariantPtr) -> Option<RawVariant> {
        let value = *self.variants.get(&ptr)?;
        Some(match value {
            RawVariant::Object {
                ptr: Some(object),
                strong,
            } if !self.objects.contains_key(&object) => RawVariant::Object { ptr: None, strong },
            other => other,
        })
    }

    pub fn destroy_variant(&mut self, ptr: VariantPtr, pending: &mut Vec<Pending>) {
        match self.variants.remove(&ptr) {
            Some(RawVariant::Builtin { ptr, .. }) => self.destroy_builtin(ptr, pending),
            Some(RawVariant::Object {
                ptr: Some(object),
                strong: true,
            }) => {
                self.unreference(object, pending);
            }
            _ => {}
        }
    }

    /// Deep value equality, as used for dictionary keys.
    pub fn variants_equal(&self, a: VariantPtr, b: VariantPtr) -> bool {
        match (self.read_variant(a), self.read_variant(b)) {
            (Some(a), Some(b)) => self.raw_equal(&a, &b),
            _ => false,
        }
    }

    fn raw_equal(&self, a: &RawVariant, b: &RawVariant) -> bool {
        match (a, b) {
            (RawVariant::Builtin { ptr: a, .. }, RawVariant::Builtin { ptr: b, .. }) => {
                self.builtins_equal(*a, *b)
            }
            (RawVariant::Object { ptr: a, .. }, RawVariant::Object { ptr: b, .. }) => a == b,
            (a, b) => a == b,
        }
    }

    fn builtins_equal(&self, a: BuiltinPtr, b: BuiltinPtr) -> bool {
        match (self.builtins.get(&a), self.builtins.get(&b)) {
            (Some(Builtin::Text { ty: ta, value: va }), Some(Builtin::Text { ty: tb, value: vb })) => {
                ta == tb && va == vb
            }
            (Some(Builtin::Packed { ty: ta, bytes: ba }), Some(Builtin::Packed { ty: tb, bytes: bb })) => {
                ta == tb && ba == bb
            }
            (Some(Builtin::PackedStrings(a)), Some(Builtin::PackedStrings(b))) => a == b,
            (Some(Builtin::Array(a)), Some(Builtin::Array(b))) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| self.variants_equal(*x, *y))
            }
            (Some(Builtin::Dictionary(a)), Some(Builtin::Dictionary(b))) => {
                a.len() == b.len()
                    && a.iter().all(|(key, value)| {
                        b.iter().any(|(other_key, other_value)| {
                            self.variants_equal(*key, *other_key)
                                && self.variants_equal(*value, *other_value)
                        })
                    })
            }
            _ => false,
        }
    }

    // ---- dictionaries ----------------------------------------------------

    pub fn dictionary_find(&self, dictionary: BuiltinPtr, key: VariantPtr) -> Option<usize> {
        match self.builtins.get(&dictionary)? {
            Builtin::Dictionary(entries) => entries
                .iter()
                .position(|(existing, _)| self.variants_equal(*existing, key)),
            _ => None,
        }
    }

    /// Drop every object, queued delivery and class registration.
    pub fn teardown(&mut self, pending: &mut Vec<Pending>) {
        let mut objects: Vec<ObjectPtr> = self.objects.keys().copied().collect();
        objects.sort_unstable();
        for object in objects {
            self.destroy_object(object, pending);
        }
        for deferred in std::mem::take(&mut self.deferred) {
            if deferred.owned {
                pending.push(Pending::FreeCallable(deferred.callable));
            }
            for arg in deferred.args {
                self.destroy_variant(arg, pending);
            }
        }
        let mut extensions: Vec<(String, ExtensionClassInfo)> = self
            .classes
            .iter_mut()
            .filter_map(|(name, def)| def.extension.take().map(|info| (name.clone(), info)))
            .collect();
        extensions.sort_by(|a, b| a.0.cmp(&b.0));
        pending.extend(extensions.into_iter().map(|(_, info)| Pending::FreeClass(info)));
    }
}
