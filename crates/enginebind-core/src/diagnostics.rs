//! Diagnostics for failures that cannot be returned to a caller.
//!
//! Reverse calls (signal callables, virtual overrides) run under the engine's
//! stack: an error there has nowhere to propagate, so it is turned into a
//! [`Diagnostic`] and handed to the installed [`DiagnosticSink`]. Shutdown
//! leak reports travel the same way.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use tracing::{error, info, warn};

use crate::ClassTag;

/// A single diagnostic message.
///
/// ```
/// use enginebind_core::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticOrigin};
///
/// let diagnostic = Diagnostic::error(
///     DiagnosticOrigin::Signal { signal: "tick".into() },
///     "callable failed",
/// );
/// assert_eq!(diagnostic.kind, DiagnosticKind::Error);
/// assert_eq!(diagnostic.to_string(), "signal 'tick': error: callable failed");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// The severity of this diagnostic
    pub kind: DiagnosticKind,
    /// Where the failure happened
    pub origin: DiagnosticOrigin,
    /// The diagnostic message text
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, origin: DiagnosticOrigin, message: impl Into<String>) -> Self {
        Diagnostic {
            kind,
            origin,
            message: message.into(),
        }
    }

    pub fn error(origin: DiagnosticOrigin, message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::Error, origin, message)
    }

    pub fn warning(origin: DiagnosticOrigin, message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::Warning, origin, message)
    }

    pub fn leak(origin: DiagnosticOrigin, message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::Leak, origin, message)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.origin, self.kind, self.message)
    }
}

/// The severity level of a diagnostic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    /// A host callable failed or panicked.
    Error,

    /// Something recoverable looked wrong, such as a delivery to a callable
    /// whose runtime has already shut down.
    Warning,

    /// An engine object was still owned by the host at shutdown.
    Leak,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticKind::Error => write!(f, "error"),
            DiagnosticKind::Warning => write!(f, "warning"),
            DiagnosticKind::Leak => write!(f, "leak"),
        }
    }
}

/// The reverse call or subsystem a diagnostic came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticOrigin {
    /// A signal callable.
    Signal { signal: String },
    /// A virtual override on a host class.
    Virtual { class: ClassTag, method: String },
    /// Construction or destruction of a host instance.
    Instance { class: ClassTag },
    /// A handle record reported by the shutdown leak check.
    Handle { class: ClassTag, object: usize },
    /// Runtime lifecycle.
    Runtime,
}

impl fmt::Display for DiagnosticOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticOrigin::Signal { signal } => write!(f, "signal '{signal}'"),
            DiagnosticOrigin::Virtual { class, method } => write!(f, "{class}::{method}"),
            DiagnosticOrigin::Instance { class } => write!(f, "{class} instance"),
            DiagnosticOrigin::Handle { class, object } => write!(f, "{class}@{object:#x}"),
            DiagnosticOrigin::Runtime => write!(f, "runtime"),
        }
    }
}

/// Receiver of diagnostics.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, diagnostic: Diagnostic);
}

/// Default sink: forwards every diagnostic to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, diagnostic: Diagnostic) {
        match diagnostic.kind {
            DiagnosticKind::Error => error!(
                target: "enginebind::diagnostics",
                origin = %diagnostic.origin,
                "{}", diagnostic.message
            ),
            DiagnosticKind::Warning => warn!(
                target: "enginebind::diagnostics",
                origin = %diagnostic.origin,
                "{}", diagnostic.message
            ),
            DiagnosticKind::Leak => info!(
                target: "enginebind::diagnostics",
                origin = %diagnostic.origin,
                leak = true,
                "{}", diagnostic.message
            ),
        }
    }
}

/// A collection of diagnostics, in the order they were reported.
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    diagnostics: VecDeque<Diagnostic>,
    has_errors: bool,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a diagnostic to the collection.
    pub fn add_diagnostic(&mut self, diagnostic: Diagnostic) {
        if diagnostic.kind == DiagnosticKind::Error {
            self.has_errors = true;
        }
        self.diagnostics.push_back(diagnostic);
    }

    pub fn has_errors(&self) -> bool {
        self.has_errors
    }

    pub fn has_leaks(&self) -> bool {
        self.leaks().next().is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn clear(&mut self) {
        self.diagnostics.clear();
        self.has_errors = false;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.kind == DiagnosticKind::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.kind == DiagnosticKind::Warning)
    }

    pub fn leaks(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.kind == DiagnosticKind::Leak)
    }

    pub fn count(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn error_count(&self) -> usize {
        self.errors().count()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, diagnostic) in self.diagnostics.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{diagnostic}")?;
        }
        Ok(())
    }
}

/// Sink that keeps every diagnostic, for tests and tooling.
///
/// Diagnostics are also forwarded to [`TracingSink`] so they show up in logs.
#[derive(Debug, Default)]
pub struct CollectingSink {
    diagnostics: Mutex<Diagnostics>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Diagnostics> {
        self.diagnostics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of everything reported so far.
    pub fn snapshot(&self) -> Diagnostics {
        self.lock().clone()
    }

    /// Drain everything reported so far.
    pub fn take(&self) -> Diagnostics {
        std::mem::take(&mut *self.lock())
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&self, diagnostic: Diagnostic) {
        TracingSink.report(diagnostic.clone());
        self.lock().add_diagnostic(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_tracks_errors() {
        let mut diagnostics = Diagnostics::new();
        assert!(!diagnostics.has_errors());

        diagnostics.add_diagnostic(Diagnostic::warning(DiagnosticOrigin::Runtime, "late call"));
        assert!(!diagnostics.has_errors());

        diagnostics.add_diagnostic(Diagnostic::error(
            DiagnosticOrigin::Signal {
                signal: "tick".into(),
            },
            "boom",
        ));
        assert!(diagnostics.has_errors());
        assert_eq!(diagnostics.count(), 2);
        assert_eq!(diagnostics.error_count(), 1);

        diagnostics.clear();
        assert!(diagnostics.is_empty());
        assert!(!diagnostics.has_errors());
    }

    #[test]
    fn display_formats() {
        let diagnostic = Diagnostic::error(
            DiagnosticOrigin::Virtual {
                class: ClassTag::new("Player"),
                method: "poll".into(),
            },
            "panicked",
        );
        assert_eq!(diagnostic.to_string(), "Player::poll: error: panicked");

        let leak = Diagnostic::leak(
            DiagnosticOrigin::Handle {
                class: ClassTag::new("Node"),
                object: 0x10,
            },
            "owned handle never freed",
        );
        assert_eq!(leak.to_string(), "Node@0x10: leak: owned handle never freed");
    }

    #[test]
    fn collecting_sink_snapshot_and_take() {
        let sink = CollectingSink::new();
        sink.report(Diagnostic::leak(DiagnosticOrigin::Runtime, "one"));
        assert!(sink.snapshot().has_leaks());
        assert_eq!(sink.take().count(), 1);
        assert!(sink.snapshot().is_empty());
    }
}
