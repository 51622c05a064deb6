//! Reporting of warnings and errors produced during compilation.
//!
//! A [`Reporter`] is the consumer-facing sink: it receives every diagnostic
//! together with its source span and decides whether compilation of the
//! current file should continue. A [`Handler`] wraps the reporter for the
//! duration of one file's compilation and tracks the first error plus the
//! bookkeeping the executor needs (error counts, entangled files).

use crate::{error::Error, error::Result, path::ResolvedPath};
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

/// Consumer-supplied sink for diagnostics.
pub trait Reporter: Send + Sync {
    /// Receives an error. Returning `false` short-circuits compilation of the
    /// file that produced it; returning `true` lets it accumulate further
    /// diagnostics.
    fn error(&self, err: &Error) -> bool;

    /// Receives a warning. The default implementation drops it.
    fn warning(&self, _warn: &Error) {}
}

/// A reporter that accumulates everything it is handed and never
/// short-circuits.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    errors: Mutex<Vec<Error>>,
    warnings: Mutex<Vec<Error>>,
}

impl CollectingReporter {
    /// All errors received so far.
    pub fn errors(&self) -> Vec<Error> {
        self.errors.lock().clone()
    }

    /// All warnings received so far.
    pub fn warnings(&self) -> Vec<Error> {
        self.warnings.lock().clone()
    }
}

impl Reporter for CollectingReporter {
    fn error(&self, err: &Error) -> bool {
        self.errors.lock().push(err.clone());
        true
    }

    fn warning(&self, warn: &Error) {
        self.warnings.lock().push(warn.clone());
    }
}

/// A reporter that forwards diagnostics to `tracing` and keeps compiling.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn error(&self, err: &Error) -> bool {
        match err.span() {
            Some(span) => error!(%span, "{err}"),
            None => error!("{err}"),
        }
        true
    }

    fn warning(&self, warn: &Error) {
        match warn.span() {
            Some(span) => warn!(%span, "{warn}"),
            None => warn!("{warn}"),
        }
    }
}

/// Per-file diagnostic sink threaded through parsing and linking.
pub struct Handler {
    reporter: Arc<dyn Reporter>,
    first: Mutex<Option<Error>>,
    errors: AtomicUsize,
    entangled: Mutex<HashSet<ResolvedPath>>,
}

impl Handler {
    pub fn new(reporter: Arc<dyn Reporter>) -> Self {
        Self {
            reporter,
            first: Mutex::new(None),
            errors: AtomicUsize::new(0),
            entangled: Mutex::new(HashSet::new()),
        }
    }

    /// Routes an error to the reporter.
    ///
    /// Returns `Err` when the reporter asks to short-circuit, handing the
    /// error back so callers can abort with `?`.
    pub fn error(&self, err: Error) -> Result<()> {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.first.lock().get_or_insert_with(|| err.clone());
        if let Some(other) = err.entangled() {
            self.entangled.lock().insert(other.clone());
        }
        if self.reporter.error(&err) {
            Ok(())
        } else {
            Err(err)
        }
    }

    /// Routes a warning to the reporter.
    pub fn warn(&self, warn: Error) {
        self.reporter.warning(&warn);
    }

    /// The first error routed through this handler, if any.
    pub fn first_error(&self) -> Option<Error> {
        self.first.lock().clone()
    }

    /// How many errors (not warnings) were routed through this handler.
    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }

    /// Files named as the other side of a cross-file collision.
    pub(crate) fn take_entangled(&self) -> HashSet<ResolvedPath> {
        std::mem::take(&mut self.entangled.lock())
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler").field("errors", &self.error_count()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailFast;

    impl Reporter for FailFast {
        fn error(&self, _err: &Error) -> bool {
            false
        }
    }

    #[test]
    fn accumulates_first_error() {
        let handler = Handler::new(Arc::new(CollectingReporter::default()));
        assert!(handler.first_error().is_none());

        handler.error(Error::msg("one")).unwrap();
        handler.error(Error::msg("two")).unwrap();

        assert_eq!(handler.first_error().unwrap().to_string(), "one");
        assert_eq!(handler.error_count(), 2);
    }

    #[test]
    fn short_circuits_when_the_reporter_asks() {
        let handler = Handler::new(Arc::new(FailFast));
        let err = handler.error(Error::msg("boom")).unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
