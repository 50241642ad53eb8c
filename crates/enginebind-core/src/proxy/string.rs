//! Engine string proxies.
//!
//! All three string types travel as owned engine string handles. The host
//! decides per call site whether to copy into a `String` (`to_host`) or keep
//! the engine value and pass it on without copying.

use std::fmt;
use std::sync::Arc;

use super::OwnedBuiltin;
use crate::abi::{BuiltinPtr, VariantType};
use crate::context::EngineContext;
use crate::error::{BindError, BindResult};
use crate::frame::{ArgumentFrame, PtrArg, PtrReturn};

macro_rules! engine_string {
    ($(#[$meta:meta])* $name:ident => $ty:expr) => {
        $(#[$meta])*
        pub struct $name {
            raw: OwnedBuiltin,
        }

        impl $name {
            /// Create an engine string holding `value`.
            pub fn new(context: &Arc<EngineContext>, value: &str) -> Self {
                let ptr = context.engine().string_new($ty, value);
                $name {
                    raw: OwnedBuiltin::new(context, ptr),
                }
            }

            /// Take ownership of an engine string.
            pub fn from_owned_ptr(context: &Arc<EngineContext>, ptr: BuiltinPtr) -> BindResult<Self> {
                OwnedBuiltin::adopt(context, ptr, $ty).map(|raw| $name { raw })
            }

            /// Copy an engine string the host does not own.
            pub fn from_borrowed_ptr(context: &Arc<EngineContext>, ptr: BuiltinPtr) -> BindResult<Self> {
                OwnedBuiltin::copy_of(context, ptr, $ty).map(|raw| $name { raw })
            }

            #[inline]
            pub fn as_builtin(&self) -> BuiltinPtr {
                self.raw.ptr()
            }

            /// Copy the contents into host memory.
            pub fn to_host(&self) -> BindResult<String> {
                self.raw
                    .context()
                    .engine()
                    .string_to_utf8(self.raw.ptr())
                    .ok_or_else(|| BindError::codec(concat!(stringify!($name), " is not valid UTF-8")))
            }

            pub fn duplicate(&self) -> BindResult<Self> {
                self.raw.duplicate().map(|raw| $name { raw })
            }

            /// Give up ownership; the caller must hand the pointer to the engine.
            pub fn into_raw(self) -> BuiltinPtr {
                self.raw.into_raw()
            }
        }

        impl PtrArg for $name {
            type Slot = BuiltinPtr;

            fn to_slot(&self, _: &mut ArgumentFrame) -> BindResult<BuiltinPtr> {
                Ok(self.as_builtin())
            }
        }

        impl PtrReturn for $name {
            type Slot = Option<BuiltinPtr>;

            fn empty_slot() -> Self::Slot {
                None
            }

            fn from_slot(slot: Self::Slot, context: &Arc<EngineContext>) -> BindResult<Self> {
                let ptr = slot.ok_or_else(|| {
                    BindError::codec(concat!("engine wrote no ", stringify!($name)))
                })?;
                Self::from_owned_ptr(context, ptr)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.to_host() {
                    Ok(value) => write!(f, concat!(stringify!($name), "({:?})"), value),
                    Err(_) => write!(f, concat!(stringify!($name), "(<invalid>)")),
                }
            }
        }
    };
}

engine_string!(
    /// Owned engine `String`.
    GString => VariantType::String
);
engine_string!(
    /// Owned engine `StringName` (interned identifier).
    StringName => VariantType::StringName
);
engine_string!(
    /// Owned engine `NodePath`.
    NodePath => VariantType::NodePath
);
