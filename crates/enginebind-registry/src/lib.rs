//! Engine-facing registries: method-bind resolution, host class registration
//! and signal connections.
//!
//! Everything here sits on top of `enginebind-core`. Forward calls go through
//! [`MethodBindCache`]; reverse calls arrive through the fixed trampolines
//! installed by [`ClassRegistry::register_with_engine`] and
//! [`SignalBridge::connect`].

pub mod class_registry;
pub mod method_bind;
pub mod signal;

use std::any::Any;

pub use class_registry::{
    ClassBuilder, ClassRegistry, ClassRegistryBuilder, Constructor, ExtensionClass,
    VirtualDispatcher,
};
pub use method_bind::{MethodBind, MethodBindCache};
pub use signal::{SignalBridge, SubscriptionId};

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::catch_unwind;

    #[test]
    fn panic_message_reads_str_and_string() {
        let payload = catch_unwind(|| panic!("plain")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "plain");

        let payload = catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 7");

        let payload = catch_unwind(|| std::panic::panic_any(3u8)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
