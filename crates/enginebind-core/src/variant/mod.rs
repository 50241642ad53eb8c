//! Dynamically typed values and their engine codec.

mod bridge;
mod convert;
mod value;

pub use bridge::VariantBridge;
pub use convert::{FromVariant, ToVariant};
pub use value::{Color, ObjectValue, VarDictionary, Variant, Vector2, Vector3};
