//! The engine ABI as seen from the host.
//!
//! Everything the core knows about the engine goes through
//! [`EngineInterface`]. Pointers handed out by the engine are opaque machine
//! words ([`ObjectPtr`], [`BuiltinPtr`], [`VariantPtr`], [`MethodBindPtr`]);
//! the core stores and forwards them but never dereferences them.
//!
//! Reverse calls (engine → host) use plain `unsafe fn` pointers plus an
//! opaque [`UserData`] word that the host chose at registration time.

use std::ffi::c_void;
use std::fmt;
use std::num::NonZeroUsize;

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{CallStatus, ErrorCode};

macro_rules! opaque_ptr {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(transparent)]
        pub struct $name(NonZeroUsize);

        impl $name {
            /// Wrap a raw engine address. Returns `None` for null.
            #[inline]
            pub fn from_addr(addr: usize) -> Option<Self> {
                NonZeroUsize::new(addr).map(Self)
            }

            #[inline]
            pub const fn from_non_zero(addr: NonZeroUsize) -> Self {
                Self(addr)
            }

            /// The raw engine address.
            #[inline]
            pub fn addr(self) -> usize {
                self.0.get()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }
    };
}

opaque_ptr!(
    /// Opaque pointer to an engine object.
    ObjectPtr
);
opaque_ptr!(
    /// Opaque pointer to an engine builtin value (string, array, dictionary,
    /// packed array).
    BuiltinPtr
);
opaque_ptr!(
    /// Opaque pointer to an engine variant.
    VariantPtr
);
opaque_ptr!(
    /// Opaque pointer identifying one method of one class.
    MethodBindPtr
);

/// Pointer to one argument slot of a pointer-call.
pub type ArgPtr = *const c_void;

/// Pointer to the return slot of a pointer-call. Null for void calls.
pub type RetPtr = *mut c_void;

/// Engine-assigned object identity that survives pointer reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(pub u64);

/// Opaque host word carried through reverse calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct UserData(pub *mut c_void);

impl UserData {
    /// Null user data.
    pub const NULL: UserData = UserData(std::ptr::null_mut());

    /// Encode a plain integer id.
    #[inline]
    pub fn from_id(id: u64) -> Self {
        UserData(id as usize as *mut c_void)
    }

    /// Decode a plain integer id.
    #[inline]
    pub fn as_id(self) -> u64 {
        self.0 as usize as u64
    }

    /// Whether the word is null.
    #[inline]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

// UserData is an opaque word; whatever it points at is only touched on the
// engine's main thread by the trampolines that created it.
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

/// Type tag of an engine variant.
///
/// Only the types the bridge understands are listed. Any other tag read back
/// from the engine is a codec error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum VariantType {
    Nil = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    String = 4,
    Vector2 = 5,
    Vector3 = 9,
    Color = 20,
    StringName = 21,
    NodePath = 22,
    Object = 24,
    Dictionary = 27,
    Array = 28,
    PackedByteArray = 29,
    PackedInt32Array = 30,
    PackedInt64Array = 31,
    PackedFloat32Array = 32,
    PackedFloat64Array = 33,
    PackedStringArray = 34,
    PackedVector2Array = 35,
    PackedVector3Array = 36,
    PackedColorArray = 37,
}

impl VariantType {
    /// Engine-facing name of the type.
    pub fn name(self) -> &'static str {
        match self {
            VariantType::Nil => "Nil",
            VariantType::Bool => "bool",
            VariantType::Int => "int",
            VariantType::Float => "float",
            VariantType::String => "String",
            VariantType::Vector2 => "Vector2",
            VariantType::Vector3 => "Vector3",
            VariantType::Color => "Color",
            VariantType::StringName => "StringName",
            VariantType::NodePath => "NodePath",
            VariantType::Object => "Object",
            VariantType::Dictionary => "Dictionary",
            VariantType::Array => "Array",
            VariantType::PackedByteArray => "PackedByteArray",
            VariantType::PackedInt32Array => "PackedInt32Array",
            VariantType::PackedInt64Array => "PackedInt64Array",
            VariantType::PackedFloat32Array => "PackedFloat32Array",
            VariantType::PackedFloat64Array => "PackedFloat64Array",
            VariantType::PackedStringArray => "PackedStringArray",
            VariantType::PackedVector2Array => "PackedVector2Array",
            VariantType::PackedVector3Array => "PackedVector3Array",
            VariantType::PackedColorArray => "PackedColorArray",
        }
    }

    /// Whether values of this type live in engine storage behind a
    /// [`BuiltinPtr`].
    pub fn is_builtin(self) -> bool {
        matches!(
            self,
            VariantType::String
                | VariantType::StringName
                | VariantType::NodePath
                | VariantType::Dictionary
                | VariantType::Array
        ) || self.is_packed()
    }

    /// Whether this is one of the packed array types.
    pub fn is_packed(self) -> bool {
        matches!(
            self,
            VariantType::PackedByteArray
                | VariantType::PackedInt32Array
                | VariantType::PackedInt64Array
                | VariantType::PackedFloat32Array
                | VariantType::PackedFloat64Array
                | VariantType::PackedStringArray
                | VariantType::PackedVector2Array
                | VariantType::PackedVector3Array
                | VariantType::PackedColorArray
        )
    }

    /// Whether this is one of the string family types.
    pub fn is_string(self) -> bool {
        matches!(
            self,
            VariantType::String | VariantType::StringName | VariantType::NodePath
        )
    }
}

impl fmt::Display for VariantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload of an engine variant as reported by [`EngineInterface::variant_get`].
///
/// Builtin pointers inside a `RawVariant` read from the engine are borrowed
/// from the variant and stay valid only while it is alive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawVariant {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Vector2([f32; 2]),
    Vector3([f32; 3]),
    Color([f32; 4]),
    /// A value stored behind a builtin pointer.
    Builtin { ty: VariantType, ptr: BuiltinPtr },
    /// An engine object. `strong` carriers hold a reference on ref-counted
    /// objects; weak carriers do not.
    Object { ptr: Option<ObjectPtr>, strong: bool },
    /// A type tag the bridge does not understand.
    Unsupported(i32),
}

impl RawVariant {
    /// Raw type tag of the payload.
    pub fn type_id(&self) -> i32 {
        match self {
            RawVariant::Nil => VariantType::Nil.into(),
            RawVariant::Bool(_) => VariantType::Bool.into(),
            RawVariant::Int(_) => VariantType::Int.into(),
            RawVariant::Float(_) => VariantType::Float.into(),
            RawVariant::Vector2(_) => VariantType::Vector2.into(),
            RawVariant::Vector3(_) => VariantType::Vector3.into(),
            RawVariant::Color(_) => VariantType::Color.into(),
            RawVariant::Builtin { ty, .. } => (*ty).into(),
            RawVariant::Object { .. } => VariantType::Object.into(),
            RawVariant::Unsupported(id) => *id,
        }
    }
}

/// Method-bind as returned by the engine's class database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodBindInfo {
    pub ptr: MethodBindPtr,
    pub arity: u32,
}

bitflags! {
    /// Flags passed with a signal connection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ConnectFlags: u32 {
        /// Deliver on the engine's idle step instead of synchronously.
        const DEFERRED = 1;
        /// Keep the connection when the emitter is serialized.
        const PERSIST = 2;
        /// Disconnect after the first delivery.
        const ONE_SHOT = 4;
        /// Allow connecting the same callable multiple times.
        const REFERENCE_COUNTED = 8;
    }
}

/// Reverse-call entry for a host callable (signal delivery).
///
/// `args` points at `argc` engine variants borrowed for the duration of the
/// call. The callee may store an owned variant into `ret`.
pub type CallableCallFn = unsafe fn(
    userdata: UserData,
    args: *const VariantPtr,
    argc: usize,
    ret: *mut Option<VariantPtr>,
) -> CallStatus;

/// Releases host state attached to a [`UserData`] word.
pub type UserDataFreeFn = unsafe fn(userdata: UserData);

/// Creates the host instance for a freshly constructed extension object.
pub type CreateInstanceFn = unsafe fn(class: UserData, object: ObjectPtr) -> Option<UserData>;

/// Destroys the host instance of an extension object.
pub type FreeInstanceFn = unsafe fn(class: UserData, instance: UserData);

/// Invokes an overridable method on a host instance.
pub type CallVirtualFn = unsafe fn(
    class: UserData,
    instance: UserData,
    method: &str,
    args: *const VariantPtr,
    argc: usize,
    ret: *mut Option<VariantPtr>,
) -> CallStatus;

/// A host callable handed to the engine. The engine owns the registration
/// and calls `free` exactly once when it drops it.
#[derive(Debug, Clone, Copy)]
pub struct CallableInfo {
    pub userdata: UserData,
    pub call: CallableCallFn,
    pub free: UserDataFreeFn,
}

/// A host-defined class registered into the engine's class database.
#[derive(Debug, Clone)]
pub struct ExtensionClassInfo {
    pub class: String,
    pub parent: String,
    pub userdata: UserData,
    pub create_instance: CreateInstanceFn,
    pub free_instance: FreeInstanceFn,
    pub call_virtual: CallVirtualFn,
    /// Called once when the engine drops the class registration.
    pub free_class: UserDataFreeFn,
}

/// Entry points the engine exposes to the host.
///
/// Implementations must be callable re-entrantly: a pointer-call may run host
/// code (virtual overrides, signal callables) that calls back into the engine.
pub trait EngineInterface: Send + Sync {
    // ---- objects ---------------------------------------------------------

    /// Construct an object by class name. The caller receives the
    /// construction reference of ref-counted classes.
    fn construct_object(&self, class: &str) -> Option<ObjectPtr>;

    /// Destroy an object immediately.
    fn destroy_object(&self, object: ObjectPtr);

    /// Runtime class of a live object.
    fn object_class(&self, object: ObjectPtr) -> Option<String>;

    /// Instance id of a live object.
    fn object_instance_id(&self, object: ObjectPtr) -> Option<InstanceId>;

    /// Resolve an instance id back to a live object.
    fn object_from_instance_id(&self, id: InstanceId) -> Option<ObjectPtr>;

    /// Add one reference to a ref-counted object. Returns `false` if the
    /// object is not ref-counted or not alive.
    fn reference(&self, object: ObjectPtr) -> bool;

    /// Drop one reference. Returns `true` if this destroyed the object.
    fn unreference(&self, object: ObjectPtr) -> bool;

    /// Current reference count of a ref-counted object.
    fn reference_count(&self, object: ObjectPtr) -> Option<u32>;

    // ---- class database --------------------------------------------------

    /// Whether the class database knows `class`.
    fn class_exists(&self, class: &str) -> bool;

    /// Declared parent of `class`.
    fn class_parent(&self, class: &str) -> Option<String>;

    /// Whether instances of `class` are reference-counted.
    fn class_is_refcounted(&self, class: &str) -> bool;

    /// Resolve a method-bind, searching the class chain.
    fn method_bind(&self, class: &str, method: &str) -> Option<MethodBindInfo>;

    /// Invoke a method-bind.
    ///
    /// # Safety
    ///
    /// `args` must point at as many valid argument pointers as the bind's
    /// arity, each pointing at a slot of the layout the method expects, and
    /// `ret` must be null or point at a writable slot of the method's return
    /// layout.
    unsafe fn ptrcall(
        &self,
        bind: MethodBindPtr,
        receiver: Option<ObjectPtr>,
        args: *const ArgPtr,
        ret: RetPtr,
    ) -> i32;

    /// Register a host-defined class. Returns an [`ErrorCode`] value.
    fn register_extension_class(&self, info: ExtensionClassInfo) -> i32;

    // ---- builtin storage -------------------------------------------------

    /// Create a string-family value (`String`, `StringName`, `NodePath`).
    fn string_new(&self, ty: VariantType, utf8: &str) -> BuiltinPtr;

    /// Read a string-family value.
    fn string_to_utf8(&self, string: BuiltinPtr) -> Option<String>;

    /// Type of a builtin value.
    fn builtin_type(&self, value: BuiltinPtr) -> Option<VariantType>;

    /// Deep copy of a builtin value.
    fn builtin_duplicate(&self, value: BuiltinPtr) -> Option<BuiltinPtr>;

    /// Release a builtin value.
    fn builtin_destroy(&self, value: BuiltinPtr);

    fn array_new(&self) -> BuiltinPtr;
    fn array_len(&self, array: BuiltinPtr) -> usize;

    /// Owned copy of the element at `index`.
    fn array_get(&self, array: BuiltinPtr, index: usize) -> Option<VariantPtr>;

    /// Append a copy of `value`.
    fn array_push(&self, array: BuiltinPtr, value: VariantPtr);

    /// Replace the element at `index` with a copy of `value`.
    fn array_set(&self, array: BuiltinPtr, index: usize, value: VariantPtr) -> bool;

    fn dictionary_new(&self) -> BuiltinPtr;
    fn dictionary_len(&self, dictionary: BuiltinPtr) -> usize;

    /// Owned copy of the key at insertion position `index`.
    fn dictionary_key_at(&self, dictionary: BuiltinPtr, index: usize) -> Option<VariantPtr>;

    /// Owned copy of the value stored under `key`.
    fn dictionary_get(&self, dictionary: BuiltinPtr, key: VariantPtr) -> Option<VariantPtr>;

    /// Store copies of `key` and `value`.
    fn dictionary_set(&self, dictionary: BuiltinPtr, key: VariantPtr, value: VariantPtr);

    /// Create a packed array of plain elements from their native-endian bytes.
    fn packed_new(&self, ty: VariantType, bytes: &[u8]) -> Option<BuiltinPtr>;

    /// Read-only view of a plain packed array's storage. The view stays valid
    /// until the value is destroyed.
    fn packed_bytes(&self, packed: BuiltinPtr) -> Option<(*const u8, usize)>;

    fn packed_strings_new(&self, values: &[&str]) -> BuiltinPtr;
    fn packed_strings_get(&self, packed: BuiltinPtr) -> Option<Vec<String>>;

    // ---- variants --------------------------------------------------------

    /// Create a variant holding a copy of `value`.
    fn variant_new(&self, value: &RawVariant) -> VariantPtr;

    /// Inspect a variant. Builtin pointers in the result are borrowed.
    fn variant_get(&self, variant: VariantPtr) -> Option<RawVariant>;

    fn variant_destroy(&self, variant: VariantPtr);

    // ---- signals ---------------------------------------------------------

    /// Connect a callable to `signal` on `object`. Returns a connection id.
    fn signal_connect(
        &self,
        object: ObjectPtr,
        signal: &str,
        callable: CallableInfo,
        flags: ConnectFlags,
    ) -> Result<u64, ErrorCode>;

    /// Drop a connection. Returns an [`ErrorCode`] value.
    fn signal_disconnect(&self, object: ObjectPtr, signal: &str, connection: u64) -> i32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_ptr_null_is_none() {
        assert!(ObjectPtr::from_addr(0).is_none());
        assert_eq!(ObjectPtr::from_addr(0x40).map(|p| p.addr()), Some(0x40));
        assert_eq!(
            std::mem::size_of::<Option<ObjectPtr>>(),
            std::mem::size_of::<usize>()
        );
    }

    #[test]
    fn user_data_round_trips_ids() {
        let data = UserData::from_id(77);
        assert_eq!(data.as_id(), 77);
        assert!(UserData::NULL.is_null());
    }

    #[test]
    fn variant_type_tags_are_stable() {
        assert_eq!(i32::from(VariantType::Object), 24);
        assert_eq!(i32::from(VariantType::Dictionary), 27);
        assert_eq!(i32::from(VariantType::PackedByteArray), 29);
        assert_eq!(VariantType::try_from(28).ok(), Some(VariantType::Array));
        assert!(VariantType::try_from(23).is_err());
    }

    #[test]
    fn variant_type_classification() {
        assert!(VariantType::String.is_builtin());
        assert!(VariantType::PackedInt32Array.is_packed());
        assert!(VariantType::NodePath.is_string());
        assert!(!VariantType::Int.is_builtin());
        assert!(!VariantType::Object.is_builtin());
    }

    #[test]
    fn raw_variant_type_id() {
        assert_eq!(RawVariant::Int(3).type_id(), 2);
        assert_eq!(RawVariant::Unsupported(23).type_id(), 23);
        assert_eq!(
            RawVariant::Object {
                ptr: None,
                strong: false
            }
            .type_id(),
            24
        );
    }

    #[test]
    fn connect_flags_combine() {
        let flags = ConnectFlags::ONE_SHOT | ConnectFlags::DEFERRED;
        assert!(flags.contains(ConnectFlags::ONE_SHOT));
        assert!(!flags.contains(ConnectFlags::PERSIST));
        assert_eq!(flags.bits(), 5);
    }
}
