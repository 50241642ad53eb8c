//! Conversions between host types and [`Variant`].
//!
//! - [`ToVariant`]: wrap a host value as a variant
//! - [`FromVariant`]: extract a host value, failing with
//!   [`BindError::TypeMismatch`] on the wrong type or an out-of-range integer
//!
//! ```
//! use enginebind_core::variant::{FromVariant, ToVariant, Variant};
//!
//! let v = 300i64.to_variant();
//! assert_eq!(i64::from_variant(&v).ok(), Some(300));
//! assert!(u8::from_variant(&v).is_err());
//! ```

use crate::error::{BindError, BindResult};
use crate::handle::{Handle, Observed, Owned};
use crate::variant::value::{Color, ObjectValue, VarDictionary, Variant, Vector2, Vector3};

/// Extract a host value from a [`Variant`].
pub trait FromVariant: Sized {
    fn from_variant(variant: &Variant) -> BindResult<Self>;
}

/// Wrap a host value as a [`Variant`].
pub trait ToVariant {
    fn to_variant(&self) -> Variant;
}

fn mismatch(expected: &str, variant: &Variant) -> BindError {
    BindError::type_mismatch(expected, variant.type_name())
}

// ============================================================================
// Integer implementations
// ============================================================================

macro_rules! impl_int {
    ($($ty:ty),*) => {
        $(
            impl FromVariant for $ty {
                fn from_variant(variant: &Variant) -> BindResult<Self> {
                    match variant {
                        Variant::Int(v) => <$ty>::try_from(*v).map_err(|_| {
                            BindError::type_mismatch(stringify!($ty), format!("int {v} (out of range)"))
                        }),
                        other => Err(mismatch("int", other)),
                    }
                }
            }

            impl ToVariant for $ty {
                fn to_variant(&self) -> Variant {
                    Variant::Int(i64::from(*self))
                }
            }
        )*
    };
}

impl_int!(i8, i16, i32, i64, u8, u16, u32);

impl FromVariant for u64 {
    fn from_variant(variant: &Variant) -> BindResult<Self> {
        match variant {
            Variant::Int(v) => u64::try_from(*v)
                .map_err(|_| BindError::type_mismatch("u64", format!("int {v} (out of range)"))),
            other => Err(mismatch("int", other)),
        }
    }
}

// ============================================================================
// Float implementations
// ============================================================================

// Integers widen to floats, as the engine does for float parameters.
impl FromVariant for f64 {
    fn from_variant(variant: &Variant) -> BindResult<Self> {
        match variant {
            Variant::Float(v) => Ok(*v),
            Variant::Int(v) => Ok(*v as f64),
            other => Err(mismatch("float", other)),
        }
    }
}

impl FromVariant for f32 {
    fn from_variant(variant: &Variant) -> BindResult<Self> {
        f64::from_variant(variant).map(|v| v as f32)
    }
}

impl ToVariant for f64 {
    fn to_variant(&self) -> Variant {
        Variant::Float(*self)
    }
}

impl ToVariant for f32 {
    fn to_variant(&self) -> Variant {
        Variant::Float(f64::from(*self))
    }
}

// ============================================================================
// Scalars and strings
// ============================================================================

macro_rules! impl_plain {
    ($($ty:ty => $arm:ident, $name:literal);* $(;)?) => {
        $(
            impl FromVariant for $ty {
                fn from_variant(variant: &Variant) -> BindResult<Self> {
                    match variant {
                        Variant::$arm(v) => Ok(v.clone()),
                        other => Err(mismatch($name, other)),
                    }
                }
            }

            impl ToVariant for $ty {
                fn to_variant(&self) -> Variant {
                    Variant::$arm(self.clone())
                }
            }
        )*
    };
}

impl_plain! {
    bool => Bool, "bool";
    Vector2 => Vector2, "Vector2";
    Vector3 => Vector3, "Vector3";
    Color => Color, "Color";
    VarDictionary => Dictionary, "Dictionary";
}

impl FromVariant for String {
    fn from_variant(variant: &Variant) -> BindResult<Self> {
        match variant {
            Variant::String(s) | Variant::StringName(s) | Variant::NodePath(s) => Ok(s.clone()),
            other => Err(mismatch("String", other)),
        }
    }
}

impl ToVariant for String {
    fn to_variant(&self) -> Variant {
        Variant::String(self.clone())
    }
}

impl ToVariant for str {
    fn to_variant(&self) -> Variant {
        Variant::String(self.to_owned())
    }
}

impl FromVariant for () {
    fn from_variant(variant: &Variant) -> BindResult<Self> {
        match variant {
            Variant::Nil => Ok(()),
            other => Err(mismatch("Nil", other)),
        }
    }
}

impl ToVariant for () {
    fn to_variant(&self) -> Variant {
        Variant::Nil
    }
}

// ============================================================================
// Containers
// ============================================================================

impl<T: FromVariant> FromVariant for Vec<T> {
    fn from_variant(variant: &Variant) -> BindResult<Self> {
        match variant {
            Variant::Array(items) => items.iter().map(T::from_variant).collect(),
            other => Err(mismatch("Array", other)),
        }
    }
}

impl<T: ToVariant> ToVariant for Vec<T> {
    fn to_variant(&self) -> Variant {
        self.as_slice().to_variant()
    }
}

impl<T: ToVariant> ToVariant for [T] {
    fn to_variant(&self) -> Variant {
        Variant::Array(self.iter().map(ToVariant::to_variant).collect())
    }
}

impl<T: FromVariant> FromVariant for Option<T> {
    fn from_variant(variant: &Variant) -> BindResult<Self> {
        match variant {
            Variant::Nil => Ok(None),
            other => T::from_variant(other).map(Some),
        }
    }
}

impl<T: ToVariant> ToVariant for Option<T> {
    fn to_variant(&self) -> Variant {
        match self {
            Some(value) => value.to_variant(),
            None => Variant::Nil,
        }
    }
}

impl FromVariant for Variant {
    fn from_variant(variant: &Variant) -> BindResult<Self> {
        Ok(variant.clone())
    }
}

impl ToVariant for Variant {
    fn to_variant(&self) -> Variant {
        self.clone()
    }
}

impl<T: ToVariant + ?Sized> ToVariant for &T {
    fn to_variant(&self) -> Variant {
        (**self).to_variant()
    }
}

// ============================================================================
// Objects
// ============================================================================

impl FromVariant for Handle<Owned> {
    fn from_variant(variant: &Variant) -> BindResult<Self> {
        match variant {
            Variant::Object(ObjectValue::Strong(handle)) => Ok(handle.clone()),
            Variant::Object(ObjectValue::Weak(handle)) => Err(BindError::type_mismatch(
                "strong object reference",
                format!("weak {}", handle.class()),
            )),
            other => Err(mismatch("Object", other)),
        }
    }
}

impl FromVariant for Handle<Observed> {
    fn from_variant(variant: &Variant) -> BindResult<Self> {
        match variant {
            Variant::Object(object) => Ok(object.observe()),
            other => Err(mismatch("Object", other)),
        }
    }
}

impl ToVariant for Handle<Owned> {
    fn to_variant(&self) -> Variant {
        Variant::Object(ObjectValue::Strong(self.clone()))
    }
}

impl ToVariant for Handle<Observed> {
    fn to_variant(&self) -> Variant {
        Variant::Object(ObjectValue::Weak(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_range_checks() {
        let big = Variant::Int(300);
        assert_eq!(i32::from_variant(&big).ok(), Some(300));
        assert!(matches!(
            u8::from_variant(&big),
            Err(BindError::TypeMismatch { .. })
        ));
        assert!(u32::from_variant(&Variant::Int(-1)).is_err());
        assert!(u64::from_variant(&Variant::Int(-1)).is_err());
    }

    #[test]
    fn wrong_type_reports_both_names() {
        let err = i64::from_variant(&Variant::from("x")).err();
        match err {
            Some(BindError::TypeMismatch { expected, actual }) => {
                assert_eq!(expected, "int");
                assert_eq!(actual, "String");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn int_widens_to_float() {
        assert_eq!(f64::from_variant(&Variant::Int(2)).ok(), Some(2.0));
        assert!(i64::from_variant(&Variant::Float(2.0)).is_err());
    }

    #[test]
    fn string_family_reads_as_string() {
        let name = Variant::StringName("ready".into());
        assert_eq!(String::from_variant(&name).ok().as_deref(), Some("ready"));
        assert_eq!("x".to_variant(), Variant::String("x".into()));
    }

    #[test]
    fn arrays_convert_elementwise() {
        let v = vec![1i32, 2, 3].to_variant();
        assert_eq!(
            v,
            Variant::Array(vec![Variant::Int(1), Variant::Int(2), Variant::Int(3)])
        );
        assert_eq!(Vec::<i32>::from_variant(&v).ok(), Some(vec![1, 2, 3]));

        let mixed = Variant::Array(vec![Variant::Int(1), Variant::Bool(true)]);
        assert!(Vec::<i32>::from_variant(&mixed).is_err());
    }

    #[test]
    fn option_maps_nil() {
        assert_eq!(Option::<i64>::from_variant(&Variant::Nil).ok(), Some(None));
        assert_eq!(Some(5i64).to_variant(), Variant::Int(5));
        assert_eq!(None::<i64>.to_variant(), Variant::Nil);
    }
}
