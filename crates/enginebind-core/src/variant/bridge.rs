//! Conversion between host [`Variant`]s and engine variants.
//!
//! Packing builds engine storage for every builtin in the value; unpacking
//! copies everything back into host memory. Object carriers keep their
//! strength across the boundary: unpacking a strong carrier yields an owned
//! shared handle (taking one engine reference unless the host already owns
//! the object), a weak carrier yields an observed handle.

use std::sync::Arc;

use tracing::trace;

use crate::abi::{BuiltinPtr, ObjectPtr, RawVariant, VariantPtr, VariantType};
use crate::context::EngineContext;
use crate::error::{BindError, BindResult};
use crate::proxy::{
    packed, ArrayProxy, DictionaryProxy, GString, NodePath, PackedArray, PackedElement,
    PackedStringArray, StringName, VariantProxy,
};
use crate::variant::value::{Color, ObjectValue, VarDictionary, Variant, Vector2, Vector3};
use crate::ClassTag;

/// Stateless codec between host and engine variants.
pub struct VariantBridge;

impl VariantBridge {
    /// Pack a host value into a new engine variant.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn pack_any(context: &Arc<EngineContext>, value: &Variant) -> BindResult<VariantProxy> {
        let ptr = pack_ptr(context, value)?;
        Ok(VariantProxy::from_owned_ptr(context, ptr))
    }

    /// Decode an engine variant the host owns.
    pub fn unpack_any(context: &Arc<EngineContext>, variant: &VariantProxy) -> BindResult<Variant> {
        Self::unpack_ptr(context, variant.as_ptr())
    }

    /// Decode an engine variant the host borrows (callback arguments).
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn unpack_ptr(context: &Arc<EngineContext>, ptr: VariantPtr) -> BindResult<Variant> {
        let raw = context
            .engine()
            .variant_get(ptr)
            .ok_or_else(|| BindError::codec(format!("variant {:#x} is not alive", ptr.addr())))?;
        Self::unpack_raw(context, raw)
    }

    /// Decode a raw payload. Builtin pointers in `raw` are borrowed.
    pub fn unpack_raw(context: &Arc<EngineContext>, raw: RawVariant) -> BindResult<Variant> {
        Ok(match raw {
            RawVariant::Nil => Variant::Nil,
            RawVariant::Bool(v) => Variant::Bool(v),
            RawVariant::Int(v) => Variant::Int(v),
            RawVariant::Float(v) => Variant::Float(v),
            RawVariant::Vector2(v) => Variant::Vector2(Vector2::from_array(v)),
            RawVariant::Vector3(v) => Variant::Vector3(Vector3::from_array(v)),
            RawVariant::Color(v) => Variant::Color(Color::from_array(v)),
            RawVariant::Builtin { ty, ptr } => unpack_builtin(context, ty, ptr)?,
            RawVariant::Object { ptr: None, .. } => Variant::Nil,
            RawVariant::Object {
                ptr: Some(ptr),
                strong,
            } => Variant::Object(unpack_object(context, ptr, strong)?),
            RawVariant::Unsupported(id) => {
                return Err(BindError::codec(format!("unsupported variant type tag {id}")));
            }
        })
    }

    /// Look `key` up in an engine dictionary.
    pub fn dictionary_get(
        context: &Arc<EngineContext>,
        dictionary: &DictionaryProxy,
        key: &Variant,
    ) -> BindResult<Option<Variant>> {
        let key = Self::pack_any(context, key)?;
        match context
            .engine()
            .dictionary_get(dictionary.as_builtin(), key.as_ptr())
        {
            Some(value) => VariantProxy::from_owned_ptr(context, value).to_host().map(Some),
            None => Ok(None),
        }
    }

    /// Store `value` under `key` in an engine dictionary.
    pub fn dictionary_set(
        context: &Arc<EngineContext>,
        dictionary: &DictionaryProxy,
        key: &Variant,
        value: &Variant,
    ) -> BindResult<()> {
        let key = Self::pack_any(context, key)?;
        let value = Self::pack_any(context, value)?;
        context
            .engine()
            .dictionary_set(dictionary.as_builtin(), key.as_ptr(), value.as_ptr());
        Ok(())
    }
}

/// Build an engine variant for `value` and return the owning pointer.
fn pack_ptr(context: &Arc<EngineContext>, value: &Variant) -> BindResult<VariantPtr> {
    let engine = context.engine();
    let builtin = |ty: VariantType, ptr: BuiltinPtr| engine.variant_new(&RawVariant::Builtin { ty, ptr });

    Ok(match value {
        Variant::Nil => engine.variant_new(&RawVariant::Nil),
        Variant::Bool(v) => engine.variant_new(&RawVariant::Bool(*v)),
        Variant::Int(v) => engine.variant_new(&RawVariant::Int(*v)),
        Variant::Float(v) => engine.variant_new(&RawVariant::Float(*v)),
        Variant::Vector2(v) => engine.variant_new(&RawVariant::Vector2(v.to_array())),
        Variant::Vector3(v) => engine.variant_new(&RawVariant::Vector3(v.to_array())),
        Variant::Color(v) => engine.variant_new(&RawVariant::Color(v.to_array())),
        Variant::String(s) => builtin(VariantType::String, GString::new(context, s).as_builtin()),
        Variant::StringName(s) => {
            builtin(VariantType::StringName, StringName::new(context, s).as_builtin())
        }
        Variant::NodePath(s) => builtin(VariantType::NodePath, NodePath::new(context, s).as_builtin()),
        Variant::Object(object) => {
            let ptr = match object {
                ObjectValue::Strong(handle) => Some(handle.ptr()?),
                // A dead weak reference packs as a null object.
                ObjectValue::Weak(handle) => handle.ptr().ok(),
            };
            engine.variant_new(&RawVariant::Object {
                ptr,
                strong: object.is_strong(),
            })
        }
        Variant::Array(items) => {
            let array = ArrayProxy::from_variants(context, items)?;
            builtin(VariantType::Array, array.as_builtin())
        }
        Variant::Dictionary(entries) => {
            let dictionary = DictionaryProxy::from_host(context, entries)?;
            builtin(VariantType::Dictionary, dictionary.as_builtin())
        }
        Variant::PackedByteArray(v) => pack_plain(context, v)?,
        Variant::PackedInt32Array(v) => pack_plain(context, v)?,
        Variant::PackedInt64Array(v) => pack_plain(context, v)?,
        Variant::PackedFloat32Array(v) => pack_plain(context, v)?,
        Variant::PackedFloat64Array(v) => pack_plain(context, v)?,
        Variant::PackedVector2Array(v) => pack_plain(context, v)?,
        Variant::PackedVector3Array(v) => pack_plain(context, v)?,
        Variant::PackedColorArray(v) => pack_plain(context, v)?,
        Variant::PackedStringArray(v) => {
            let strings: Vec<&str> = v.iter().map(String::as_str).collect();
            let packed = PackedStringArray::new(context, &strings);
            builtin(VariantType::PackedStringArray, packed.as_builtin())
        }
    })
}

fn pack_plain<T: PackedElement>(context: &Arc<EngineContext>, values: &[T]) -> BindResult<VariantPtr> {
    let packed = PackedArray::from_slice(context, values)?;
    Ok(context.engine().variant_new(&RawVariant::Builtin {
        ty: T::TYPE,
        ptr: packed.as_builtin(),
    }))
}

fn unpack_builtin(context: &Arc<EngineContext>, ty: VariantType, ptr: BuiltinPtr) -> BindResult<Variant> {
    let engine = context.engine();
    let string = || {
        engine
            .string_to_utf8(ptr)
            .ok_or_else(|| BindError::codec(format!("{ty} is not valid UTF-8")))
    };

    Ok(match ty {
        VariantType::String => Variant::String(string()?),
        VariantType::StringName => Variant::StringName(string()?),
        VariantType::NodePath => Variant::NodePath(string()?),
        VariantType::Array => {
            let len = engine.array_len(ptr);
            let mut items = Vec::with_capacity(len);
            for index in 0..len {
                let element = engine
                    .array_get(ptr, index)
                    .ok_or_else(|| BindError::codec(format!("array element {index} vanished")))?;
                let element = VariantProxy::from_owned_ptr(context, element);
                items.push(VariantBridge::unpack_any(context, &element)?);
            }
            Variant::Array(items)
        }
        VariantType::Dictionary => {
            let mut entries = VarDictionary::new();
            for index in 0..engine.dictionary_len(ptr) {
                let key = engine
                    .dictionary_key_at(ptr, index)
                    .ok_or_else(|| BindError::codec(format!("dictionary key {index} vanished")))?;
                let key = VariantProxy::from_owned_ptr(context, key);
                let value = match engine.dictionary_get(ptr, key.as_ptr()) {
                    Some(value) => VariantProxy::from_owned_ptr(context, value).to_host()?,
                    None => Variant::Nil,
                };
                entries.insert(key.to_host()?, value);
            }
            Variant::Dictionary(entries)
        }
        VariantType::PackedByteArray => Variant::PackedByteArray(unpack_plain(context, ptr)?),
        VariantType::PackedInt32Array => Variant::PackedInt32Array(unpack_plain(context, ptr)?),
        VariantType::PackedInt64Array => Variant::PackedInt64Array(unpack_plain(context, ptr)?),
        VariantType::PackedFloat32Array => Variant::PackedFloat32Array(unpack_plain(context, ptr)?),
        VariantType::PackedFloat64Array => Variant::PackedFloat64Array(unpack_plain(context, ptr)?),
        VariantType::PackedVector2Array => Variant::PackedVector2Array(unpack_plain(context, ptr)?),
        VariantType::PackedVector3Array => Variant::PackedVector3Array(unpack_plain(context, ptr)?),
        VariantType::PackedColorArray => Variant::PackedColorArray(unpack_plain(context, ptr)?),
        VariantType::PackedStringArray => Variant::PackedStringArray(
            engine
                .packed_strings_get(ptr)
                .ok_or_else(|| BindError::codec("PackedStringArray is not readable"))?,
        ),
        other => {
            return Err(BindError::codec(format!(
                "variant tagged {other} carries a builtin pointer"
            )));
        }
    })
}

fn unpack_plain<T: PackedElement>(context: &Arc<EngineContext>, ptr: BuiltinPtr) -> BindResult<Vec<T>> {
    // SAFETY: the bytes are decoded before this function returns, while the
    // borrowed builtin is still alive.
    let bytes = unsafe { packed::engine_bytes(context, ptr)? };
    packed::decode(bytes)
}

fn unpack_object(context: &Arc<EngineContext>, ptr: ObjectPtr, strong: bool) -> BindResult<ObjectValue> {
    let engine = context.engine();
    let class = engine
        .object_class(ptr)
        .map(|class| ClassTag::new(&class))
        .ok_or_else(|| BindError::NullHandle {
            class: "Object".to_owned(),
        })?;

    if strong && engine.reference(ptr) {
        trace!(target: "enginebind::variant", ?ptr, %class, "strong object carrier");
        return context
            .handles()
            .adopt_owned(ptr, class)
            .map(ObjectValue::Strong);
    }
    context.handles().observe(ptr, class).map(ObjectValue::Weak)
}
