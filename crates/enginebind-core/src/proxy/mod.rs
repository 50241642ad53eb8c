//! Host proxies for values that live in engine storage.
//!
//! A proxy owns exactly one engine builtin (or variant) and destroys it when
//! dropped. Proxies are passed by pointer in argument frames, borrowed,
//! cloned or moved according to their [`PackPolicy`]. Reading them out into
//! host memory is explicit (`to_host`, `to_vec`, `view`).

mod array;
mod dictionary;
pub(crate) mod packed;
mod string;
mod variant;

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

pub use array::{ArrayProxy, TypedArray};
pub use dictionary::DictionaryProxy;
pub use packed::{PackedArray, PackedElement, PackedStringArray, PackedView};
pub use string::{GString, NodePath, StringName};
pub use variant::VariantProxy;

use crate::abi::{BuiltinPtr, VariantType};
use crate::context::EngineContext;
use crate::error::{BindError, BindResult};
use crate::frame::ArgumentFrame;

/// How a proxy is packed into an argument frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackPolicy {
    /// The engine reads the proxy's own storage for the duration of the call.
    #[default]
    Borrow,
    /// The frame passes a duplicate and destroys it when freed.
    Clone,
    /// Ownership moves into the frame. The proxy is left empty and refuses
    /// to be packed again.
    Move,
}

pub(crate) fn moved_out() -> BindError {
    BindError::codec("proxy was moved into an argument frame")
}

/// One engine builtin owned by the host.
pub(crate) struct OwnedBuiltin {
    context: Arc<EngineContext>,
    ptr: BuiltinPtr,
    owned: Cell<bool>,
}

impl OwnedBuiltin {
    pub(crate) fn new(context: &Arc<EngineContext>, ptr: BuiltinPtr) -> Self {
        OwnedBuiltin {
            context: Arc::clone(context),
            ptr,
            owned: Cell::new(true),
        }
    }

    /// Take ownership of `ptr` after checking it holds an `expected` value.
    /// On mismatch the value is destroyed.
    pub(crate) fn adopt(
        context: &Arc<EngineContext>,
        ptr: BuiltinPtr,
        expected: VariantType,
    ) -> BindResult<Self> {
        let owned = OwnedBuiltin::new(context, ptr);
        match context.engine().builtin_type(ptr) {
            Some(ty) if ty == expected => Ok(owned),
            Some(ty) => Err(BindError::type_mismatch(expected.name(), ty.name())),
            None => Err(BindError::codec(format!(
                "builtin {:#x} is not a live engine value",
                ptr.addr()
            ))),
        }
    }

    /// Take ownership of a copy of a value borrowed from the engine.
    pub(crate) fn copy_of(
        context: &Arc<EngineContext>,
        ptr: BuiltinPtr,
        expected: VariantType,
    ) -> BindResult<Self> {
        let copy = context
            .engine()
            .builtin_duplicate(ptr)
            .ok_or_else(|| BindError::codec(format!("cannot copy builtin {:#x}", ptr.addr())))?;
        Self::adopt(context, copy, expected)
    }

    pub(crate) fn duplicate(&self) -> BindResult<Self> {
        if !self.owned.get() {
            return Err(moved_out());
        }
        let copy = self
            .context
            .engine()
            .builtin_duplicate(self.ptr)
            .ok_or_else(|| BindError::codec("engine refused to duplicate builtin"))?;
        Ok(OwnedBuiltin::new(&self.context, copy))
    }

    #[inline]
    pub(crate) fn ptr(&self) -> BuiltinPtr {
        self.ptr
    }

    #[inline]
    pub(crate) fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    #[inline]
    pub(crate) fn is_moved(&self) -> bool {
        !self.owned.get()
    }

    /// Move ownership out into a new value, leaving this one empty.
    pub(crate) fn take(&self) -> BindResult<Self> {
        if !self.owned.replace(false) {
            return Err(moved_out());
        }
        Ok(OwnedBuiltin::new(&self.context, self.ptr))
    }

    /// Pointer to pass in `frame` under `policy`. Cloned and moved values are
    /// held by the frame until it is freed.
    pub(crate) fn pack(
        &self,
        policy: PackPolicy,
        frame: &mut ArgumentFrame,
    ) -> BindResult<BuiltinPtr> {
        let held = match policy {
            PackPolicy::Borrow if self.is_moved() => return Err(moved_out()),
            PackPolicy::Borrow => return Ok(self.ptr),
            PackPolicy::Clone => self.duplicate()?,
            PackPolicy::Move => self.take()?,
        };
        let ptr = held.ptr;
        frame.hold(held);
        Ok(ptr)
    }

    /// Give up ownership without destroying the value.
    pub(crate) fn into_raw(self) -> BuiltinPtr {
        self.owned.set(false);
        self.ptr
    }
}

impl Drop for OwnedBuiltin {
    fn drop(&mut self) {
        if self.owned.get() {
            self.context.engine().builtin_destroy(self.ptr);
        }
    }
}

impl fmt::Debug for OwnedBuiltin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnedBuiltin({:#x})", self.ptr.addr())
    }
}
