//! Packed arrays: contiguous engine buffers of plain elements.
//!
//! Elements cross as their native-endian bytes. Reading out copies into a
//! host `Vec`; an explicit [`PackedView`] borrows the engine buffer instead.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use super::{OwnedBuiltin, PackPolicy};
use crate::abi::{BuiltinPtr, VariantType};
use crate::context::EngineContext;
use crate::error::{BindError, BindResult};
use crate::frame::{ArgumentFrame, PtrArg, PtrReturn};
use crate::variant::{Color, Vector2, Vector3};

/// Element type of a plain packed array.
pub trait PackedElement: Copy + 'static {
    /// Engine type of `Packed<Self>Array`.
    const TYPE: VariantType;
    /// Encoded size in bytes.
    const SIZE: usize;

    fn write_ne(self, out: &mut Vec<u8>);

    /// Decode one element; `bytes` is exactly [`Self::SIZE`] long.
    fn read_ne(bytes: &[u8]) -> Self;
}

macro_rules! impl_packed_scalar {
    ($($ty:ty => $variant:ident),*) => {
        $(
            impl PackedElement for $ty {
                const TYPE: VariantType = VariantType::$variant;
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn write_ne(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_ne_bytes());
                }

                fn read_ne(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(bytes);
                    <$ty>::from_ne_bytes(buf)
                }
            }
        )*
    };
}

impl_packed_scalar!(
    u8 => PackedByteArray,
    i32 => PackedInt32Array,
    i64 => PackedInt64Array,
    f32 => PackedFloat32Array,
    f64 => PackedFloat64Array
);

macro_rules! impl_packed_vector {
    ($($ty:ident = $n:literal => $variant:ident),*) => {
        $(
            impl PackedElement for $ty {
                const TYPE: VariantType = VariantType::$variant;
                const SIZE: usize = $n * 4;

                fn write_ne(self, out: &mut Vec<u8>) {
                    for component in self.to_array() {
                        component.write_ne(out);
                    }
                }

                fn read_ne(bytes: &[u8]) -> Self {
                    let mut components = [0.0f32; $n];
                    for (component, chunk) in components.iter_mut().zip(bytes.chunks_exact(4)) {
                        *component = f32::read_ne(chunk);
                    }
                    $ty::from_array(components)
                }
            }
        )*
    };
}

impl_packed_vector!(
    Vector2 = 2 => PackedVector2Array,
    Vector3 = 3 => PackedVector3Array,
    Color = 4 => PackedColorArray
);

/// Encode elements into their byte layout.
pub(crate) fn encode<T: PackedElement>(values: &[T]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * T::SIZE);
    for value in values {
        value.write_ne(&mut bytes);
    }
    bytes
}

/// Decode a byte buffer, rejecting a length that is not a whole number of
/// elements.
pub(crate) fn decode<T: PackedElement>(bytes: &[u8]) -> BindResult<Vec<T>> {
    if bytes.len() % T::SIZE != 0 {
        return Err(BindError::codec(format!(
            "{} buffer of {} bytes is not a multiple of {}",
            T::TYPE,
            bytes.len(),
            T::SIZE
        )));
    }
    Ok(bytes.chunks_exact(T::SIZE).map(T::read_ne).collect())
}

/// Borrowed engine bytes of a live packed value.
///
/// # Safety
///
/// The returned slice must not outlive the builtin `ptr`.
pub(crate) unsafe fn engine_bytes<'a>(
    context: &EngineContext,
    ptr: BuiltinPtr,
) -> BindResult<&'a [u8]> {
    let (data, len) = context
        .engine()
        .packed_bytes(ptr)
        .ok_or_else(|| BindError::codec("packed array storage is not available"))?;
    if len == 0 || data.is_null() {
        return Ok(&[]);
    }
    // SAFETY: the engine guarantees `len` readable bytes at `data` until the
    // value is destroyed, and the caller bounds the lifetime.
    Ok(unsafe { std::slice::from_raw_parts(data, len) })
}

/// Owned engine packed array of `T`.
pub struct PackedArray<T: PackedElement> {
    raw: OwnedBuiltin,
    policy: PackPolicy,
    _marker: PhantomData<T>,
}

impl<T: PackedElement> PackedArray<T> {
    /// Copy `values` into a new engine buffer.
    pub fn from_slice(context: &Arc<EngineContext>, values: &[T]) -> BindResult<Self> {
        let ptr = context
            .engine()
            .packed_new(T::TYPE, &encode(values))
            .ok_or_else(|| BindError::codec(format!("engine cannot create {}", T::TYPE)))?;
        Ok(Self::wrap(OwnedBuiltin::new(context, ptr)))
    }

    pub fn from_owned_ptr(context: &Arc<EngineContext>, ptr: BuiltinPtr) -> BindResult<Self> {
        OwnedBuiltin::adopt(context, ptr, T::TYPE).map(Self::wrap)
    }

    pub fn from_borrowed_ptr(context: &Arc<EngineContext>, ptr: BuiltinPtr) -> BindResult<Self> {
        OwnedBuiltin::copy_of(context, ptr, T::TYPE).map(Self::wrap)
    }

    fn wrap(raw: OwnedBuiltin) -> Self {
        PackedArray {
            raw,
            policy: PackPolicy::default(),
            _marker: PhantomData,
        }
    }

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

    fn bytes(&self) -> BindResult<&[u8]> {
        if self.raw.is_moved() {
            return Err(super::moved_out());
        }
        // SAFETY: the slice borrows `self`, which owns the builtin.
        unsafe { engine_bytes(self.raw.context(), self.raw.ptr()) }
    }

    pub fn len(&self) -> usize {
        self.bytes().map(|b| b.len() / T::SIZE).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the elements into host memory.
    pub fn to_vec(&self) -> BindResult<Vec<T>> {
        decode(self.bytes()?)
    }

    /// Borrow the engine buffer without copying.
    pub fn view(&self) -> BindResult<PackedView<'_, T>> {
        let bytes = self.bytes()?;
        if bytes.len() % T::SIZE != 0 {
            return Err(BindError::codec(format!(
                "{} buffer of {} bytes is not a multiple of {}",
                T::TYPE,
                bytes.len(),
                T::SIZE
            )));
        }
        Ok(PackedView {
            bytes,
            _marker: PhantomData,
        })
    }

    pub fn duplicate(&self) -> BindResult<Self> {
        Ok(Self::wrap(self.raw.duplicate()?).with_policy(self.policy))
    }

    pub fn into_raw(self) -> BuiltinPtr {
        self.raw.into_raw()
    }
}

impl<T: PackedElement> fmt::Debug for PackedArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackedArray")
            .field("type", &T::TYPE)
            .field("len", &self.len())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Read-only view over an engine packed buffer.
#[derive(Clone, Copy)]
pub struct PackedView<'a, T: PackedElement> {
    bytes: &'a [u8],
    _marker: PhantomData<T>,
}

impl<'a, T: PackedElement> PackedView<'a, T> {
    pub fn len(&self) -> usize {
        self.bytes.len() / T::SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<T> {
        let start = index.checked_mul(T::SIZE)?;
        let end = start.checked_add(T::SIZE)?;
        self.bytes.get(start..end).map(T::read_ne)
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + use<'a, T> {
        self.bytes.chunks_exact(T::SIZE).map(T::read_ne)
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

impl<T: PackedElement + fmt::Debug> fmt::Debug for PackedView<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T: PackedElement> PtrArg for PackedArray<T> {
    type Slot = BuiltinPtr;

    fn to_slot(&self, frame: &mut ArgumentFrame) -> BindResult<BuiltinPtr> {
        self.raw.pack(self.policy, frame)
    }
}

impl<T: PackedElement> PtrReturn for PackedArray<T> {
    type Slot = Option<BuiltinPtr>;

    fn empty_slot() -> Self::Slot {
        None
    }

    fn from_slot(slot: Self::Slot, context: &Arc<EngineContext>) -> BindResult<Self> {
        let ptr = slot.ok_or_else(|| BindError::codec(format!("engine wrote no {}", T::TYPE)))?;
        PackedArray::from_owned_ptr(context, ptr)
    }
}

/// A host slice crosses as a temporary packed array owned by the frame.
impl<T: PackedElement> PtrArg for [T] {
    type Slot = BuiltinPtr;

    fn to_slot(&self, frame: &mut ArgumentFrame) -> BindResult<BuiltinPtr> {
        let packed = PackedArray::from_slice(frame.context(), self)?;
        let ptr = packed.as_builtin();
        frame.hold(packed);
        Ok(ptr)
    }
}

impl<T: PackedElement> PtrArg for Vec<T> {
    type Slot = BuiltinPtr;

    fn to_slot(&self, frame: &mut ArgumentFrame) -> BindResult<BuiltinPtr> {
        self.as_slice().to_slot(frame)
    }
}

/// Copies the returned packed array out and destroys the engine value.
impl<T: PackedElement> PtrReturn for Vec<T> {
    type Slot = Option<BuiltinPtr>;

    fn empty_slot() -> Self::Slot {
        None
    }

    fn from_slot(slot: Self::Slot, context: &Arc<EngineContext>) -> BindResult<Self> {
        PackedArray::<T>::from_slot(slot, context)?.to_vec()
    }
}

/// Owned engine `PackedStringArray`.
pub struct PackedStringArray {
    raw: OwnedBuiltin,
}

impl PackedStringArray {
    pub fn new(context: &Arc<EngineContext>, values: &[&str]) -> Self {
        let ptr = context.engine().packed_strings_new(values);
        PackedStringArray {
            raw: OwnedBuiltin::new(context, ptr),
        }
    }

    pub fn from_owned_ptr(context: &Arc<EngineContext>, ptr: BuiltinPtr) -> BindResult<Self> {
        OwnedBuiltin::adopt(context, ptr, VariantType::PackedStringArray)
            .map(|raw| PackedStringArray { raw })
    }

    #[inline]
    pub fn as_builtin(&self) -> BuiltinPtr {
        self.raw.ptr()
    }

    pub fn to_vec(&self) -> BindResult<Vec<String>> {
        self.raw
            .context()
            .engine()
            .packed_strings_get(self.raw.ptr())
            .ok_or_else(|| BindError::codec("PackedStringArray is not readable"))
    }

    pub fn len(&self) -> usize {
        self.to_vec().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_raw(self) -> BuiltinPtr {
        self.raw.into_raw()
    }
}

impl fmt::Debug for PackedStringArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PackedStringArray")
            .field(&self.to_vec().unwrap_or_default())
            .finish()
    }
}

impl PtrArg for PackedStringArray {
    type Slot = BuiltinPtr;

    fn to_slot(&self, _: &mut ArgumentFrame) -> BindResult<BuiltinPtr> {
        Ok(self.as_builtin())
    }
}

impl PtrReturn for PackedStringArray {
    type Slot = Option<BuiltinPtr>;

    fn empty_slot() -> Self::Slot {
        None
    }

    fn from_slot(slot: Self::Slot, context: &Arc<EngineContext>) -> BindResult<Self> {
        let ptr = slot.ok_or_else(|| BindError::codec("engine wrote no PackedStringArray"))?;
        PackedStringArray::from_owned_ptr(context, ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_encode_verbatim() {
        assert_eq!(encode(&[0u8, 1, 0xFF]), vec![0, 1, 0xFF]);
        assert_eq!(decode::<u8>(&[0, 1, 0xFF]).ok(), Some(vec![0, 1, 0xFF]));
    }

    #[test]
    fn ints_use_native_endianness() {
        let bytes = encode(&[1i32, -2]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[..4], &1i32.to_ne_bytes());
        assert_eq!(decode::<i32>(&bytes).ok(), Some(vec![1, -2]));
    }

    #[test]
    fn vectors_are_flattened() {
        let v = [Vector2::new(1.0, 2.0), Vector2::new(3.0, 4.0)];
        let bytes = encode(&v);
        assert_eq!(bytes.len(), 16);
        assert_eq!(decode::<Vector2>(&bytes).ok(), Some(v.to_vec()));
    }

    #[test]
    fn ragged_buffer_is_a_codec_error() {
        assert!(matches!(
            decode::<i64>(&[0u8; 12]),
            Err(BindError::Codec { .. })
        ));
    }

    fn view_of<T: PackedElement>(bytes: &[u8]) -> PackedView<'_, T> {
        PackedView {
            bytes,
            _marker: PhantomData,
        }
    }

    #[test]
    fn view_get_stays_in_bounds() {
        let bytes = encode(&[10i32, 20, 30]);
        let view = view_of::<i32>(&bytes);
        assert_eq!(view.len(), 3);
        assert_eq!(view.get(0), Some(10));
        assert_eq!(view.get(2), Some(30));
        assert_eq!(view.get(3), None);
        assert_eq!(view.get(usize::MAX / 4), None);
        assert_eq!(view.get(usize::MAX), None);
        assert_eq!(view.iter().collect::<Vec<_>>(), [10, 20, 30]);
    }

    #[test]
    fn empty_view_has_no_elements() {
        let view = view_of::<Color>(&[]);
        assert!(view.is_empty());
        assert_eq!(view.get(0), None);
    }

    #[test]
    fn element_sizes() {
        assert_eq!(<u8 as PackedElement>::SIZE, 1);
        assert_eq!(<f64 as PackedElement>::SIZE, 8);
        assert_eq!(<Color as PackedElement>::SIZE, 16);
        assert_eq!(<Vector3 as PackedElement>::TYPE, VariantType::PackedVector3Array);
    }
}
