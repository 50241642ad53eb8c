//! Host-side variant values.

use std::hash::{Hash, Hasher};

use ordered_float::OrderedFloat;
use rustc_hash::{FxHashMap, FxHasher};

use crate::abi::{ObjectPtr, VariantType};
use crate::handle::{Handle, Observed, Owned};

macro_rules! float_vector {
    ($(#[$meta:meta])* $name:ident { $($field:ident),+ } = $n:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name {
            $(pub $field: f32,)+
        }

        impl $name {
            pub const fn new($($field: f32),+) -> Self {
                $name { $($field),+ }
            }

            /// Components in engine layout order.
            pub fn to_array(self) -> [f32; $n] {
                [$(self.$field),+]
            }

            pub fn from_array(array: [f32; $n]) -> Self {
                let [$($field),+] = array;
                $name { $($field),+ }
            }

            fn ordered(&self) -> [OrderedFloat<f32>; $n] {
                [$(OrderedFloat(self.$field)),+]
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.ordered() == other.ordered()
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.ordered().hash(state);
            }
        }
    };
}

float_vector!(
    /// 2D vector.
    Vector2 { x, y } = 2
);
float_vector!(
    /// 3D vector.
    Vector3 { x, y, z } = 3
);
float_vector!(
    /// RGBA color.
    Color { r, g, b, a } = 4
);

/// An engine object carried inside a [`Variant`].
///
/// A strong carrier owns one engine reference on a ref-counted object; a weak
/// carrier only observes. Two carriers are equal when they point at the same
/// engine object.
#[derive(Debug, Clone)]
pub enum ObjectValue {
    Strong(Handle<Owned>),
    Weak(Handle<Observed>),
}

impl ObjectValue {
    pub fn raw_ptr(&self) -> ObjectPtr {
        match self {
            ObjectValue::Strong(handle) => handle.raw_ptr(),
            ObjectValue::Weak(handle) => handle.raw_ptr(),
        }
    }

    pub fn is_strong(&self) -> bool {
        matches!(self, ObjectValue::Strong(_))
    }

    pub fn is_alive(&self) -> bool {
        match self {
            ObjectValue::Strong(handle) => handle.is_alive(),
            ObjectValue::Weak(handle) => handle.is_alive(),
        }
    }

    pub fn as_strong(&self) -> Option<&Handle<Owned>> {
        match self {
            ObjectValue::Strong(handle) => Some(handle),
            ObjectValue::Weak(_) => None,
        }
    }

    /// Observed view of the object regardless of carrier strength.
    pub fn observe(&self) -> Handle<Observed> {
        match self {
            ObjectValue::Strong(handle) => handle.downgrade(),
            ObjectValue::Weak(handle) => handle.clone(),
        }
    }
}

impl PartialEq for ObjectValue {
    fn eq(&self, other: &Self) -> bool {
        self.raw_ptr() == other.raw_ptr()
    }
}

impl Eq for ObjectValue {}

impl Hash for ObjectValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw_ptr().hash(state);
    }
}

/// A dynamically typed engine value, decoded into host memory.
///
/// Floats compare and hash by total order (`NaN == NaN`), so any variant can
/// be a dictionary key. `Int(1)` and `Float(1.0)` are different values.
#[derive(Debug, Clone, Default)]
pub enum Variant {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    StringName(String),
    NodePath(String),
    Vector2(Vector2),
    Vector3(Vector3),
    Color(Color),
    Object(ObjectValue),
    Array(Vec<Variant>),
    Dictionary(VarDictionary),
    PackedByteArray(Vec<u8>),
    PackedInt32Array(Vec<i32>),
    PackedInt64Array(Vec<i64>),
    PackedFloat32Array(Vec<f32>),
    PackedFloat64Array(Vec<f64>),
    PackedStringArray(Vec<String>),
    PackedVector2Array(Vec<Vector2>),
    PackedVector3Array(Vec<Vector3>),
    PackedColorArray(Vec<Color>),
}

impl Variant {
    /// Engine type tag of this value.
    pub fn variant_type(&self) -> VariantType {
        match self {
            Variant::Nil => VariantType::Nil,
            Variant::Bool(_) => VariantType::Bool,
            Variant::Int(_) => VariantType::Int,
            Variant::Float(_) => VariantType::Float,
            Variant::String(_) => VariantType::String,
            Variant::StringName(_) => VariantType::StringName,
            Variant::NodePath(_) => VariantType::NodePath,
            Variant::Vector2(_) => VariantType::Vector2,
            Variant::Vector3(_) => VariantType::Vector3,
            Variant::Color(_) => VariantType::Color,
            Variant::Object(_) => VariantType::Object,
            Variant::Array(_) => VariantType::Array,
            Variant::Dictionary(_) => VariantType::Dictionary,
            Variant::PackedByteArray(_) => VariantType::PackedByteArray,
            Variant::PackedInt32Array(_) => VariantType::PackedInt32Array,
            Variant::PackedInt64Array(_) => VariantType::PackedInt64Array,
            Variant::PackedFloat32Array(_) => VariantType::PackedFloat32Array,
            Variant::PackedFloat64Array(_) => VariantType::PackedFloat64Array,
            Variant::PackedStringArray(_) => VariantType::PackedStringArray,
            Variant::PackedVector2Array(_) => VariantType::PackedVector2Array,
            Variant::PackedVector3Array(_) => VariantType::PackedVector3Array,
            Variant::PackedColorArray(_) => VariantType::PackedColorArray,
        }
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Variant::Nil)
    }

    /// Name used in type-mismatch errors.
    pub fn type_name(&self) -> &'static str {
        self.variant_type().name()
    }
}

fn floats_eq<F: Copy>(a: &[F], b: &[F]) -> bool
where
    OrderedFloat<F>: PartialEq,
{
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| OrderedFloat(*x) == OrderedFloat(*y))
}

fn hash_floats<F: Copy, H: Hasher>(values: &[F], state: &mut H)
where
    OrderedFloat<F>: Hash,
{
    values.len().hash(state);
    for value in values {
        OrderedFloat(*value).hash(state);
    }
}

impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Variant::Nil, Variant::Nil) => true,
            (Variant::Bool(a), Variant::Bool(b)) => a == b,
            (Variant::Int(a), Variant::Int(b)) => a == b,
            (Variant::Float(a), Variant::Float(b)) => OrderedFloat(*a) == OrderedFloat(*b),
            (Variant::String(a), Variant::String(b))
            | (Variant::StringName(a), Variant::StringName(b))
            | (Variant::NodePath(a), Variant::NodePath(b)) => a == b,
            (Variant::Vector2(a), Variant::Vector2(b)) => a == b,
            (Variant::Vector3(a), Variant::Vector3(b)) => a == b,
            (Variant::Color(a), Variant::Color(b)) => a == b,
            (Variant::Object(a), Variant::Object(b)) => a == b,
            (Variant::Array(a), Variant::Array(b)) => a == b,
            (Variant::Dictionary(a), Variant::Dictionary(b)) => a == b,
            (Variant::PackedByteArray(a), Variant::PackedByteArray(b)) => a == b,
            (Variant::PackedInt32Array(a), Variant::PackedInt32Array(b)) => a == b,
            (Variant::PackedInt64Array(a), Variant::PackedInt64Array(b)) => a == b,
            (Variant::PackedFloat32Array(a), Variant::PackedFloat32Array(b)) => floats_eq(a, b),
            (Variant::PackedFloat64Array(a), Variant::PackedFloat64Array(b)) => floats_eq(a, b),
            (Variant::PackedStringArray(a), Variant::PackedStringArray(b)) => a == b,
            (Variant::PackedVector2Array(a), Variant::PackedVector2Array(b)) => a == b,
            (Variant::PackedVector3Array(a), Variant::PackedVector3Array(b)) => a == b,
            (Variant::PackedColorArray(a), Variant::PackedColorArray(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Variant {}

impl Hash for Variant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Variant::Nil => {}
            Variant::Bool(v) => v.hash(state),
            Variant::Int(v) => v.hash(state),
            Variant::Float(v) => OrderedFloat(*v).hash(state),
            Variant::String(v) | Variant::StringName(v) | Variant::NodePath(v) => v.hash(state),
            Variant::Vector2(v) => v.hash(state),
            Variant::Vector3(v) => v.hash(state),
            Variant::Color(v) => v.hash(state),
            Variant::Object(v) => v.hash(state),
            Variant::Array(v) => v.hash(state),
            Variant::Dictionary(v) => v.hash(state),
            Variant::PackedByteArray(v) => v.hash(state),
            Variant::PackedInt32Array(v) => v.hash(state),
            Variant::PackedInt64Array(v) => v.hash(state),
            Variant::PackedFloat32Array(v) => hash_floats(v, state),
            Variant::PackedFloat64Array(v) => hash_floats(v, state),
            Variant::PackedStringArray(v) => v.hash(state),
            Variant::PackedVector2Array(v) => v.hash(state),
            Variant::PackedVector3Array(v) => v.hash(state),
            Variant::PackedColorArray(v) => v.hash(state),
        }
    }
}

/// Insertion-ordered dictionary of variants.
///
/// Iteration follows insertion order, matching the engine's dictionary.
/// Equality ignores order.
#[derive(Debug, Clone, Default)]
pub struct VarDictionary {
    entries: Vec<(Variant, Variant)>,
    index: FxHashMap<Variant, usize>,
}

impl VarDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace. Replacing keeps the key's original position.
    pub fn insert(&mut self, key: Variant, value: Variant) -> Option<Variant> {
        if let Some(&slot) = self.index.get(&key) {
            return Some(std::mem::replace(&mut self.entries[slot].1, value));
        }
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push((key, value));
        None
    }

    pub fn get(&self, key: &Variant) -> Option<&Variant> {
        self.index.get(key).map(|&slot| &self.entries[slot].1)
    }

    pub fn contains_key(&self, key: &Variant) -> bool {
        self.index.contains_key(key)
    }

    pub fn remove(&mut self, key: &Variant) -> Option<Variant> {
        let slot = self.index.remove(key)?;
        let (_, value) = self.entries.remove(slot);
        for position in self.index.values_mut() {
            if *position > slot {
                *position -= 1;
            }
        }
        Some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Variant, &Variant)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &Variant> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &Variant> {
        self.entries.iter().map(|(_, v)| v)
    }
}

impl PartialEq for VarDictionary {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl Eq for VarDictionary {}

impl Hash for VarDictionary {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Order-independent: combine per-entry hashes commutatively.
        let mut combined = 0u64;
        for (key, value) in &self.entries {
            let mut entry = FxHasher::default();
            key.hash(&mut entry);
            value.hash(&mut entry);
            combined = combined.wrapping_add(entry.finish());
        }
        self.len().hash(state);
        combined.hash(state);
    }
}

impl FromIterator<(Variant, Variant)> for VarDictionary {
    fn from_iter<I: IntoIterator<Item = (Variant, Variant)>>(iter: I) -> Self {
        let mut dictionary = VarDictionary::new();
        for (key, value) in iter {
            dictionary.insert(key, value);
        }
        dictionary
    }
}

impl IntoIterator for VarDictionary {
    type Item = (Variant, Variant);
    type IntoIter = std::vec::IntoIter<(Variant, Variant)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

macro_rules! impl_variant_from {
    ($($ty:ty => $arm:ident),* $(,)?) => {
        $(
            impl From<$ty> for Variant {
                fn from(value: $ty) -> Self {
                    Variant::$arm(value.into())
                }
            }
        )*
    };
}

impl_variant_from! {
    bool => Bool,
    i64 => Int,
    i32 => Int,
    f64 => Float,
    f32 => Float,
    String => String,
    &str => String,
    Vector2 => Vector2,
    Vector3 => Vector3,
    Color => Color,
    Vec<Variant> => Array,
    VarDictionary => Dictionary,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = FxHasher::default();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn int_and_float_differ() {
        assert_ne!(Variant::Int(1), Variant::Float(1.0));
    }

    #[test]
    fn nan_is_a_usable_key() {
        let mut dict = VarDictionary::new();
        dict.insert(Variant::Float(f64::NAN), Variant::from("nan"));
        assert_eq!(
            dict.get(&Variant::Float(f64::NAN)),
            Some(&Variant::from("nan"))
        );
    }

    #[test]
    fn string_family_is_distinct() {
        assert_ne!(
            Variant::String("a".into()),
            Variant::StringName("a".into())
        );
    }

    #[test]
    fn dictionary_preserves_insertion_order() {
        let mut dict = VarDictionary::new();
        dict.insert(Variant::from("b"), Variant::Int(2));
        dict.insert(Variant::from("a"), Variant::Int(1));
        dict.insert(Variant::from("b"), Variant::Int(3));

        let keys: Vec<_> = dict.keys().cloned().collect();
        assert_eq!(keys, vec![Variant::from("b"), Variant::from("a")]);
        assert_eq!(dict.get(&Variant::from("b")), Some(&Variant::Int(3)));
    }

    #[test]
    fn dictionary_remove_reindexes() {
        let mut dict: VarDictionary = [
            (Variant::Int(1), Variant::from("one")),
            (Variant::Int(2), Variant::from("two")),
            (Variant::Int(3), Variant::from("three")),
        ]
        .into_iter()
        .collect();

        assert_eq!(dict.remove(&Variant::Int(1)), Some(Variant::from("one")));
        assert_eq!(dict.get(&Variant::Int(3)), Some(&Variant::from("three")));
        assert_eq!(dict.len(), 2);
    }

    #[test]
    fn dictionary_equality_ignores_order() {
        let a: VarDictionary = [
            (Variant::Int(1), Variant::Bool(true)),
            (Variant::Int(2), Variant::Bool(false)),
        ]
        .into_iter()
        .collect();
        let b: VarDictionary = [
            (Variant::Int(2), Variant::Bool(false)),
            (Variant::Int(1), Variant::Bool(true)),
        ]
        .into_iter()
        .collect();

        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn vectors_round_trip_arrays() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        assert_eq!(Vector3::from_array(v.to_array()), v);
        assert_eq!(Color::new(0.0, 0.5, 1.0, 1.0).to_array(), [0.0, 0.5, 1.0, 1.0]);
    }

    #[test]
    fn variant_type_tags() {
        assert_eq!(Variant::Nil.variant_type(), VariantType::Nil);
        assert_eq!(
            Variant::PackedByteArray(vec![1]).variant_type(),
            VariantType::PackedByteArray
        );
        assert_eq!(Variant::from(vec![Variant::Nil]).type_name(), "Array");
    }
}
