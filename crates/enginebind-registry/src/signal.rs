//! Host callables connected to engine signals.
//!
//! The callable itself stays on the host side in a thread-local table; the
//! engine only receives an id in the callable's userdata word plus the two
//! fixed trampolines below. The engine owns the registration: it calls
//! `free` on disconnect, after a one-shot emission, or when the emitter is
//! destroyed, which removes the table entry.

use std::cell::RefCell;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use enginebind_core::abi::{CallableInfo, ConnectFlags, UserData, VariantPtr};
use enginebind_core::diagnostics::{Diagnostic, DiagnosticOrigin};
use enginebind_core::{
    BindError, BindResult, CallStatus, EngineContext, ErrorCode, Handle, HandleMode, Variant,
    VariantBridge,
};

use crate::panic_message;

type SignalCallback = Box<dyn FnMut(&[Variant]) -> anyhow::Result<()>>;

struct Subscription {
    signal: String,
    context: Weak<EngineContext>,
    /// `None` while the callback is running.
    callback: Option<SignalCallback>,
}

thread_local! {
    static SUBSCRIPTIONS: RefCell<FxHashMap<u64, Subscription>> = RefCell::new(FxHashMap::default());
}

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/// Engine-assigned identity of one signal connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connects host closures to engine signals.
#[derive(Debug, Clone)]
pub struct SignalBridge {
    context: Arc<EngineContext>,
}

impl SignalBridge {
    pub fn new(context: &Arc<EngineContext>) -> Self {
        SignalBridge {
            context: Arc::clone(context),
        }
    }

    /// Connect `callback` to `signal` on `source`.
    ///
    /// The callback receives the emitted arguments decoded to host values.
    /// Errors and panics it raises are reported to the diagnostic sink. The
    /// source's handle record is flagged as part of a potential cycle, since
    /// callbacks commonly capture a handle to their own emitter.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn connect<M, F>(
        &self,
        source: &Handle<M>,
        signal: &str,
        flags: ConnectFlags,
        callback: F,
    ) -> BindResult<SubscriptionId>
    where
        M: HandleMode,
        F: FnMut(&[Variant]) -> anyhow::Result<()> + 'static,
    {
        let object = source.ptr()?;
        let key = NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed);
        SUBSCRIPTIONS.with_borrow_mut(|table| {
            table.insert(
                key,
                Subscription {
                    signal: signal.to_owned(),
                    context: Arc::downgrade(&self.context),
                    callback: Some(Box::new(callback)),
                },
            )
        });

        let info = CallableInfo {
            userdata: UserData::from_id(key),
            call: signal_call_trampoline,
            free: signal_free_trampoline,
        };
        match self.context.engine().signal_connect(object, signal, info, flags) {
            Ok(id) => {
                source.mark_cyclic();
                debug!(target: "enginebind::signal", signal, ?object, id, ?flags, "connected");
                Ok(SubscriptionId(id))
            }
            Err(code) => {
                // The engine did not take ownership of the callable.
                let rejected = SUBSCRIPTIONS.with_borrow_mut(|table| table.remove(&key));
                drop(rejected);
                Err(BindError::Engine(code))
            }
        }
    }

    /// Disconnect a subscription made with [`SignalBridge::connect`].
    pub fn disconnect<M: HandleMode>(
        &self,
        source: &Handle<M>,
        signal: &str,
        id: SubscriptionId,
    ) -> BindResult<()> {
        let object = source.ptr()?;
        trace!(target: "enginebind::signal", signal, ?object, %id, "disconnect");
        ErrorCode::check(self.context.engine().signal_disconnect(object, signal, id.0))
    }

    /// Host callables currently registered on this thread.
    pub fn subscription_count() -> usize {
        SUBSCRIPTIONS.with_borrow(|table| table.len())
    }
}

unsafe fn signal_call_trampoline(
    userdata: UserData,
    args: *const VariantPtr,
    argc: usize,
    _ret: *mut Option<VariantPtr>,
) -> CallStatus {
    let key = userdata.as_id();
    let taken = SUBSCRIPTIONS.with_borrow_mut(|table| {
        table.get_mut(&key).map(|entry| {
            (
                entry.signal.clone(),
                entry.context.clone(),
                entry.callback.take(),
            )
        })
    });
    let Some((signal, context, callback)) = taken else {
        warn!(target: "enginebind::signal", key, "emission for unknown subscription");
        return CallStatus::InstanceIsNull;
    };
    let Some(context) = context.upgrade() else {
        restore(key, callback);
        return CallStatus::InstanceIsNull;
    };
    let origin = || DiagnosticOrigin::Signal {
        signal: signal.clone(),
    };
    let Some(mut callback) = callback else {
        context.report(Diagnostic::error(origin(), "callable re-entered during its own emission"));
        return CallStatus::Ok;
    };

    let args = if argc == 0 || args.is_null() {
        &[][..]
    } else {
        // SAFETY: the engine passes `argc` variants valid for this call.
        unsafe { std::slice::from_raw_parts(args, argc) }
    };
    let values: BindResult<Vec<Variant>> = args
        .iter()
        .map(|&arg| VariantBridge::unpack_ptr(&context, arg))
        .collect();

    match values {
        Ok(values) => match catch_unwind(AssertUnwindSafe(|| callback(&values))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => context.report(Diagnostic::error(origin(), format!("{err:#}"))),
            Err(payload) => context.report(Diagnostic::error(
                origin(),
                format!("panicked: {}", panic_message(payload.as_ref())),
            )),
        },
        Err(err) => context.report(Diagnostic::error(origin(), format!("bad arguments: {err}"))),
    }

    restore(key, Some(callback));
    CallStatus::Ok
}

/// Put a callback back after an emission. If the subscription was freed in
/// the meantime the callback is dropped here, outside the table borrow.
fn restore(key: u64, callback: Option<SignalCallback>) {
    let leftover = SUBSCRIPTIONS.with_borrow_mut(|table| match table.get_mut(&key) {
        Some(entry) if entry.callback.is_none() => {
            entry.callback = callback;
            None
        }
        _ => callback,
    });
    drop(leftover);
}

unsafe fn signal_free_trampoline(userdata: UserData) {
    let key = userdata.as_id();
    // The table may already be gone during thread teardown.
    let removed = SUBSCRIPTIONS
        .try_with(|table| table.borrow_mut().remove(&key))
        .ok()
        .flatten();
    if removed.is_some() {
        trace!(target: "enginebind::signal", key, "callable freed");
    }
    drop(removed);
}
