use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use super::{OwnedBuiltin, PackPolicy, VariantProxy};
use crate::abi::{BuiltinPtr, VariantType};
use crate::context::EngineContext;
use crate::error::{BindError, BindResult, ErrorCode};
use crate::frame::{ArgumentFrame, PtrArg, PtrReturn};
use crate::variant::{FromVariant, ToVariant, Variant, VariantBridge};

/// Owned engine `Array`. Elements are decoded lazily, one per access.
pub struct ArrayProxy {
    raw: OwnedBuiltin,
    policy: PackPolicy,
}

impl ArrayProxy {
    pub fn new(context: &Arc<EngineContext>) -> Self {
        let ptr = context.engine().array_new();
        Self::wrap(OwnedBuiltin::new(context, ptr))
    }

    fn wrap(raw: OwnedBuiltin) -> Self {
        ArrayProxy {
            raw,
            policy: PackPolicy::default(),
        }
    }

    /// Build an engine array from host values.
    pub fn from_variants(context: &Arc<EngineContext>, values: &[Variant]) -> BindResult<Self> {
        let array = ArrayProxy::new(context);
        for value in values {
            array.push(value)?;
        }
        Ok(array)
    }

    pub fn from_owned_ptr(context: &Arc<EngineContext>, ptr: BuiltinPtr) -> BindResult<Self> {
        OwnedBuiltin::adopt(context, ptr, VariantType::Array).map(Self::wrap)
    }

    pub fn from_borrowed_ptr(context: &Arc<EngineContext>, ptr: BuiltinPtr) -> BindResult<Self> {
        OwnedBuiltin::copy_of(context, ptr, VariantType::Array).map(Self::wrap)
    }

    /// Choose how this array is packed into argument frames.
    pub fn with_policy(mut self, policy: PackPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> PackPolicy {
        self.policy
    }

    #[inline]
    pub fn as_builtin(&self) -> BuiltinPtr {
        self.raw.ptr()
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        self.raw.context()
    }

    pub fn len(&self) -> usize {
        self.context().engine().array_len(self.raw.ptr())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owned engine copy of the element at `index`.
    pub fn get_proxy(&self, index: usize) -> BindResult<VariantProxy> {
        self.context()
            .engine()
            .array_get(self.raw.ptr(), index)
            .map(|ptr| VariantProxy::from_owned_ptr(self.context(), ptr))
            .ok_or(BindError::Engine(ErrorCode::ParameterRangeError))
    }

    /// Decode the element at `index`.
    pub fn get(&self, index: usize) -> BindResult<Variant> {
        self.get_proxy(index)?.to_host()
    }

    pub fn push(&self, value: &Variant) -> BindResult<()> {
        let element = VariantBridge::pack_any(self.context(), value)?;
        self.context().engine().array_push(self.raw.ptr(), element.as_ptr());
        Ok(())
    }

    pub fn set(&self, index: usize, value: &Variant) -> BindResult<()> {
        let element = VariantBridge::pack_any(self.context(), value)?;
        if self
            .context()
            .engine()
            .array_set(self.raw.ptr(), index, element.as_ptr())
        {
            Ok(())
        } else {
            Err(BindError::Engine(ErrorCode::ParameterRangeError))
        }
    }

    /// Decode every element.
    pub fn to_vec(&self) -> BindResult<Vec<Variant>> {
        (0..self.len()).map(|index| self.get(index)).collect()
    }

    pub fn duplicate(&self) -> BindResult<Self> {
        Ok(Self::wrap(self.raw.duplicate()?).with_policy(self.policy))
    }

    pub fn into_raw(self) -> BuiltinPtr {
        self.raw.into_raw()
    }
}

impl fmt::Debug for ArrayProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayProxy")
            .field("ptr", &self.raw.ptr())
            .field("len", &self.len())
            .field("policy", &self.policy)
            .finish()
    }
}

impl PtrArg for ArrayProxy {
    type Slot = BuiltinPtr;

    fn to_slot(&self, frame: &mut ArgumentFrame) -> BindResult<BuiltinPtr> {
        self.raw.pack(self.policy, frame)
    }
}

impl PtrReturn for ArrayProxy {
    type Slot = Option<BuiltinPtr>;

    fn empty_slot() -> Self::Slot {
        None
    }

    fn from_slot(slot: Self::Slot, context: &Arc<EngineContext>) -> BindResult<Self> {
        let ptr = slot.ok_or_else(|| BindError::codec("engine wrote no Array"))?;
        ArrayProxy::from_owned_ptr(context, ptr)
    }
}

/// Engine `Array` whose elements are all `T`.
///
/// The element type is checked on access: reading an element of another type
/// fails with [`BindError::TypeMismatch`].
pub struct TypedArray<T> {
    inner: ArrayProxy,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ToVariant + FromVariant> TypedArray<T> {
    pub fn new(context: &Arc<EngineContext>) -> Self {
        Self::from_array(ArrayProxy::new(context))
    }

    pub fn from_slice(context: &Arc<EngineContext>, values: &[T]) -> BindResult<Self> {
        let array = Self::new(context);
        for value in values {
            array.push(value)?;
        }
        Ok(array)
    }

    pub fn from_array(inner: ArrayProxy) -> Self {
        TypedArray {
            inner,
            _marker: PhantomData,
        }
    }

    pub fn with_policy(self, policy: PackPolicy) -> Self {
        Self::from_array(self.inner.with_policy(policy))
    }

    pub fn policy(&self) -> PackPolicy {
        self.inner.policy()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn get(&self, index: usize) -> BindResult<T> {
        T::from_variant(&self.inner.get(index)?)
    }

    pub fn push(&self, value: &T) -> BindResult<()> {
        self.inner.push(&value.to_variant())
    }

    pub fn to_vec(&self) -> BindResult<Vec<T>> {
        (0..self.len()).map(|index| self.get(index)).collect()
    }

    pub fn as_array(&self) -> &ArrayProxy {
        &self.inner
    }

    pub fn into_inner(self) -> ArrayProxy {
        self.inner
    }
}

impl<T> fmt::Debug for TypedArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypedArray<{}>({:?})", std::any::type_name::<T>(), self.inner)
    }
}

impl<T> PtrArg for TypedArray<T> {
    type Slot = BuiltinPtr;

    fn to_slot(&self, frame: &mut ArgumentFrame) -> BindResult<BuiltinPtr> {
        self.inner.to_slot(frame)
    }
}

impl<T: ToVariant + FromVariant> PtrReturn for TypedArray<T> {
    type Slot = Option<BuiltinPtr>;

    fn empty_slot() -> Self::Slot {
        None
    }

    fn from_slot(slot: Self::Slot, context: &Arc<EngineContext>) -> BindResult<Self> {
        ArrayProxy::from_slot(slot, context).map(TypedArray::from_array)
    }
}
