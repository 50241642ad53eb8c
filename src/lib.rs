//! Marshaling runtime for generated engine bindings.
//!
//! Generated bindings call engine methods through argument frames, hold
//! engine objects through typed ownership handles, and expose host classes
//! and signal callables to the engine through fixed trampolines. This crate
//! assembles those pieces into a [`Runtime`] and ships [`headless`], an
//! in-process engine for tests and tools.
//!
//! The building blocks live in two crates, re-exported here:
//!
//! - `enginebind-core`: frames, handles, proxies and the variant bridge
//! - `enginebind-registry`: method-bind cache, class registry and signals

pub mod headless;
mod runtime;

pub use enginebind_core::*;
pub use enginebind_registry::{
    ClassBuilder, ClassRegistry, ClassRegistryBuilder, ExtensionClass, MethodBind,
    MethodBindCache, SignalBridge, SubscriptionId,
};

pub use runtime::{Runtime, RuntimeBuilder};

// Re-export main types
pub mod prelude {
    pub use crate::headless::{HeadlessEngine, PtrCall};
    pub use crate::runtime::{Runtime, RuntimeBuilder};
    pub use enginebind_core::diagnostics::{CollectingSink, Diagnostics, TracingSink};
    pub use enginebind_core::{
        ArgumentFrame, BindError, BindResult, CallStatus, ClassTag, ConnectFlags, Diagnostic,
        DiagnosticKind, DiagnosticOrigin, DiagnosticSink, EngineContext, EngineInterface,
        ErrorCode, FromVariant, Handle, HandleMode, Observed, Owned, OwnershipState, RawVariant,
        ToVariant, VarDictionary, Variant, VariantBridge, VariantType,
    };
    pub use enginebind_registry::{ClassBuilder, SignalBridge, SubscriptionId};
}
