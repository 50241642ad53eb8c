//! Memoized method-bind lookup and pointer-call dispatch.

use std::fmt;
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;
use tracing::{debug, error, trace};

use enginebind_core::abi::{EngineInterface, MethodBindPtr, ObjectPtr};
use enginebind_core::frame::ArgumentFrame;
use enginebind_core::{BindError, BindResult, ClassTag, ErrorCode, TypeHash};

/// A resolved method of an engine class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodBind {
    pub ptr: MethodBindPtr,
    /// Number of arguments the engine expects.
    pub arity: u32,
    pub class: ClassTag,
    pub method: String,
}

impl MethodBind {
    /// `Class::method`, for diagnostics.
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.class, self.method)
    }
}

/// Process-wide cache of method-binds keyed by `(class, method)`.
///
/// Each key is looked up in the engine at most once; later resolutions are
/// a read-locked map hit. Failed lookups are not cached.
pub struct MethodBindCache {
    engine: Arc<dyn EngineInterface>,
    binds: RwLock<FxHashMap<TypeHash, MethodBind>>,
}

impl MethodBindCache {
    pub fn new(engine: Arc<dyn EngineInterface>) -> Self {
        MethodBindCache {
            engine,
            binds: RwLock::new(FxHashMap::default()),
        }
    }

    /// Resolve `method` on `class`, consulting the engine on first use.
    ///
    /// Fails with `BindError::Engine(ErrorCode::MethodNotFound)` when the
    /// engine does not know the method.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn resolve(&self, class: impl Into<ClassTag>, method: &str) -> BindResult<MethodBind> {
        let class = class.into();
        let key = TypeHash::from_method(class.hash(), method);

        if let Some(bind) = self
            .binds
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key)
        {
            return Ok(bind.clone());
        }

        let Some(info) = self.engine.method_bind(class.name(), method) else {
            error!(target: "enginebind::method_bind", %class, method, "method-bind lookup failed");
            return Err(BindError::Engine(ErrorCode::MethodNotFound));
        };

        let mut binds = self
            .binds
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Another thread may have resolved the same key meanwhile; keep the
        // first entry so every caller sees the same bind.
        let bind = binds.entry(key).or_insert_with(|| {
            debug!(target: "enginebind::method_bind", %class, method, arity = info.arity, "resolved");
            MethodBind {
                ptr: info.ptr,
                arity: info.arity,
                class,
                method: method.to_owned(),
            }
        });
        Ok(bind.clone())
    }

    /// Pointer-call `bind` with the arguments staged in `frame`.
    ///
    /// The frame's return slot (if any) receives the result. A non-OK
    /// engine status surfaces as `BindError::Engine`.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn invoke(
        &self,
        bind: &MethodBind,
        receiver: Option<ObjectPtr>,
        frame: &ArgumentFrame,
    ) -> BindResult<()> {
        let found = frame.arg_count() as u32;
        if found != bind.arity {
            return Err(BindError::ArityMismatch {
                method: bind.qualified_name(),
                expected: bind.arity,
                found,
            });
        }
        trace!(
            target: "enginebind::method_bind",
            class = %bind.class,
            method = %bind.method,
            ?receiver,
            "ptrcall"
        );
        // SAFETY: the frame holds exactly `arity` argument slots staged by the
        // binding for this method, and its return slot is either null or
        // reserved with the method's return layout. Both stay alive for the
        // duration of the call because `frame` is borrowed.
        let status = unsafe {
            self.engine
                .ptrcall(bind.ptr, receiver, frame.array_ptr(), frame.return_ptr())
        };
        ErrorCode::check(status)
    }

    /// Number of cached binds.
    pub fn len(&self) -> usize {
        self.binds
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for MethodBindCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodBindCache")
            .field("binds", &self.len())
            .finish()
    }
}
