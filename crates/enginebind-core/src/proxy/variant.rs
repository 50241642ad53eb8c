use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

use super::{PackPolicy, moved_out};
use crate::abi::{RawVariant, VariantPtr, VariantType};
use crate::context::EngineContext;
use crate::error::{BindError, BindResult};
use crate::frame::{ArgumentFrame, PtrArg, PtrReturn};
use crate::variant::{Variant, VariantBridge};

/// One engine variant owned by the host.
pub struct VariantProxy {
    context: Arc<EngineContext>,
    ptr: VariantPtr,
    owned: Cell<bool>,
    policy: PackPolicy,
}

impl VariantProxy {
    /// Create an engine variant holding a copy of `value`.
    pub fn from_raw(context: &Arc<EngineContext>, value: &RawVariant) -> Self {
        let ptr = context.engine().variant_new(value);
        Self::from_owned_ptr(context, ptr)
    }

    pub fn nil(context: &Arc<EngineContext>) -> Self {
        Self::from_raw(context, &RawVariant::Nil)
    }

    /// Take ownership of an engine variant.
    pub fn from_owned_ptr(context: &Arc<EngineContext>, ptr: VariantPtr) -> Self {
        VariantProxy {
            context: Arc::clone(context),
            ptr,
            owned: Cell::new(true),
            policy: PackPolicy::default(),
        }
    }

    /// Choose how this variant is packed into argument frames.
    pub fn with_policy(mut self, policy: PackPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> PackPolicy {
        self.policy
    }

    #[inline]
    pub fn as_ptr(&self) -> VariantPtr {
        self.ptr
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    /// Raw payload. Builtin pointers in it are borrowed from this proxy.
    pub fn raw(&self) -> BindResult<RawVariant> {
        if !self.owned.get() {
            return Err(moved_out());
        }
        self.context
            .engine()
            .variant_get(self.ptr)
            .ok_or_else(|| BindError::codec("variant is not alive"))
    }

    /// Type tag of the payload.
    pub fn variant_type(&self) -> BindResult<VariantType> {
        let id = self.raw()?.type_id();
        VariantType::try_from(id)
            .map_err(|_| BindError::codec(format!("unsupported variant type tag {id}")))
    }

    /// Decode into host memory.
    pub fn to_host(&self) -> BindResult<Variant> {
        VariantBridge::unpack_any(&self.context, self)
    }

    pub fn duplicate(&self) -> BindResult<Self> {
        let raw = self.raw()?;
        Ok(Self::from_raw(&self.context, &raw).with_policy(self.policy))
    }

    /// Give up ownership; the caller must hand the pointer to the engine.
    pub fn into_raw(self) -> VariantPtr {
        self.owned.set(false);
        self.ptr
    }
}

impl Drop for VariantProxy {
    fn drop(&mut self) {
        if self.owned.get() {
            self.context.engine().variant_destroy(self.ptr);
        }
    }
}

impl fmt::Debug for VariantProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VariantProxy({:#x})", self.ptr.addr())
    }
}

impl PtrArg for VariantProxy {
    type Slot = VariantPtr;

    fn to_slot(&self, frame: &mut ArgumentFrame) -> BindResult<VariantPtr> {
        let held = match self.policy {
            PackPolicy::Borrow if self.owned.get() => return Ok(self.ptr),
            PackPolicy::Borrow => return Err(moved_out()),
            PackPolicy::Clone => self.duplicate()?,
            PackPolicy::Move => {
                if !self.owned.replace(false) {
                    return Err(moved_out());
                }
                VariantProxy::from_owned_ptr(&self.context, self.ptr)
            }
        };
        let ptr = held.ptr;
        frame.hold(held);
        Ok(ptr)
    }
}

impl PtrReturn for VariantProxy {
    type Slot = Option<VariantPtr>;

    fn empty_slot() -> Self::Slot {
        None
    }

    fn from_slot(slot: Self::Slot, context: &Arc<EngineContext>) -> BindResult<Self> {
        Ok(match slot {
            Some(ptr) => VariantProxy::from_owned_ptr(context, ptr),
            None => VariantProxy::nil(context),
        })
    }
}

/// A host variant crosses as a temporary engine variant owned by the frame.
impl PtrArg for Variant {
    type Slot = VariantPtr;

    fn to_slot(&self, frame: &mut ArgumentFrame) -> BindResult<VariantPtr> {
        let proxy = VariantBridge::pack_any(frame.context(), self)?;
        let ptr = proxy.as_ptr();
        frame.hold(proxy);
        Ok(ptr)
    }
}

impl PtrReturn for Variant {
    type Slot = Option<VariantPtr>;

    fn empty_slot() -> Self::Slot {
        None
    }

    fn from_slot(slot: Self::Slot, context: &Arc<EngineContext>) -> BindResult<Self> {
        match slot {
            Some(ptr) => VariantProxy::from_owned_ptr(context, ptr).to_host(),
            None => Ok(Variant::Nil),
        }
    }
}
