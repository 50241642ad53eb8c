//! Marshaling substrate for generated engine bindings.
//!
//! This crate moves values across the engine ABI:
//!
//! - [`frame`]: argument frames for pointer-calls
//! - [`handle`]: ownership records for engine objects
//! - [`proxy`]: host proxies for engine strings, arrays, dictionaries,
//!   packed arrays and variants
//! - [`variant`]: host variants and the bridge to engine variants
//!
//! Everything the engine provides is reached through [`abi::EngineInterface`].

pub mod abi;
pub mod class_tag;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod frame;
pub mod handle;
pub mod proxy;
pub mod type_hash;
pub mod variant;

// Errors
pub use error::{BindError, BindResult, CallStatus, ErrorCode};
// Identities
pub use class_tag::ClassTag;
pub use type_hash::TypeHash;
// Engine ABI
pub use abi::{
    ArgPtr, BuiltinPtr, ConnectFlags, EngineInterface, InstanceId, MethodBindPtr, ObjectPtr,
    RawVariant, RetPtr, UserData, VariantPtr, VariantType,
};
// Marshaling
pub use context::EngineContext;
pub use diagnostics::{Diagnostic, DiagnosticKind, DiagnosticOrigin, DiagnosticSink};
pub use frame::{ArgumentFrame, PtrArg, PtrReturn, ReturnSlot};
pub use handle::{Borrowed, Handle, HandleMode, HandleRegistry, Observed, Owned, OwnershipState};
pub use proxy::{
    ArrayProxy, DictionaryProxy, GString, NodePath, PackPolicy, PackedArray, PackedStringArray,
    StringName, TypedArray, VariantProxy,
};
pub use variant::{FromVariant, ToVariant, VarDictionary, Variant, VariantBridge};
