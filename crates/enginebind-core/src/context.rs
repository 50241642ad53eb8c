//! Shared state every marshaling operation needs.

use std::fmt;
use std::sync::Arc;

use crate::abi::EngineInterface;
use crate::diagnostics::{Diagnostic, DiagnosticSink, TracingSink};
use crate::handle::HandleRegistry;

/// The engine entry points, the handle registry and the diagnostic sink.
///
/// One context exists per loaded engine. Proxies and frames hold an
/// `Arc<EngineContext>`; reverse-call trampolines hold a `Weak` so the engine
/// never keeps the context alive.
pub struct EngineContext {
    engine: Arc<dyn EngineInterface>,
    handles: Arc<HandleRegistry>,
    sink: Arc<dyn DiagnosticSink>,
}

impl EngineContext {
    pub fn new(engine: Arc<dyn EngineInterface>, sink: Arc<dyn DiagnosticSink>) -> Arc<Self> {
        let handles = Arc::new(HandleRegistry::new(Arc::clone(&engine)));
        Arc::new(EngineContext {
            engine,
            handles,
            sink,
        })
    }

    /// Context reporting diagnostics through `tracing`.
    pub fn with_tracing(engine: Arc<dyn EngineInterface>) -> Arc<Self> {
        Self::new(engine, Arc::new(TracingSink))
    }

    #[inline]
    pub fn engine(&self) -> &Arc<dyn EngineInterface> {
        &self.engine
    }

    #[inline]
    pub fn handles(&self) -> &Arc<HandleRegistry> {
        &self.handles
    }

    #[inline]
    pub fn sink(&self) -> &Arc<dyn DiagnosticSink> {
        &self.sink
    }

    /// Route a diagnostic to the installed sink.
    pub fn report(&self, diagnostic: Diagnostic) {
        self.sink.report(diagnostic);
    }
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("handles", &self.handles.len())
            .finish_non_exhaustive()
    }
}
