//! Error taxonomy for resolution, parsing and linking.
//!
//! Every diagnostic the compiler can produce is one variant of [`Error`].
//! Variants carry an optional [`Span`] pointing at the offending source
//! region; the span is deliberately not part of the rendered message so that
//! reporters can choose their own layout.

use crate::{path::ResolvedPath, path::UnresolvedPath, span::Span};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A compilation diagnostic.
///
/// Recoverable errors let the current link step continue so that further
/// diagnostics can accumulate; unrecoverable ones abort the file. See
/// [`Error::is_recoverable`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The resolver had no mapping for an import path.
    #[error("could not resolve import \"{path}\"")]
    FailedToResolve { path: UnresolvedPath, span: Option<Span> },

    /// The resolver failed while looking up a path. Constructed through
    /// [`Error::resolver`], which names the offending path exactly once.
    #[error("{message}")]
    Resolver { path: UnresolvedPath, message: String },

    /// A search result embedded a file name other than the one it resolved
    /// to. The embedded name is rejected rather than rewritten.
    #[error("resolver returned a file named \"{embedded}\" for a lookup of \"{requested}\"")]
    PathMismatch { requested: ResolvedPath, embedded: String },

    /// The source could not be parsed.
    #[error("{file}: {message}")]
    Parse { file: ResolvedPath, message: String },

    /// A fully-qualified name was declared more than once.
    #[error("symbol \"{name}\" already declared at {existing}{}", enum_value_note(.is_enum_value))]
    SymbolRedeclared {
        name: String,
        span: Option<Span>,
        existing: Span,
        /// At least one of the colliding symbols is an enum value.
        is_enum_value: bool,
        /// The other file involved, when the collision crosses files.
        entangled: Option<ResolvedPath>,
    },

    /// A package name collides with a non-package symbol (or vice versa).
    #[error("symbol \"{name}\" collides with a package of the same name declared at {existing}")]
    PackageCollision {
        name: String,
        span: Option<Span>,
        existing: Span,
        entangled: Option<ResolvedPath>,
    },

    /// A type reference did not resolve in any enclosing scope.
    #[error("\"{name}\" is not defined in \"{file}\"{}", hint_note(.hint))]
    UndeclaredName {
        name: String,
        /// The fully-qualified form tried in the innermost scope.
        hint: Option<String>,
        file: ResolvedPath,
        span: Option<Span>,
    },

    /// A name resolved, but to something that cannot be used where it was
    /// referenced (e.g. a service named in a field type).
    #[error("\"{name}\" is not {expected}")]
    InvalidType {
        name: String,
        expected: &'static str,
        file: ResolvedPath,
        span: Option<Span>,
    },

    /// Two extensions of the same message claim the same number.
    #[error("extension number {number} for \"{extendee}\" already registered at {existing}")]
    ExtensionCollision {
        extendee: String,
        number: i32,
        span: Option<Span>,
        existing: Span,
        entangled: Option<ResolvedPath>,
    },

    /// A chain of imports that leads back to its own start.
    #[error("import cycle: {}", render_chain(.chain))]
    ImportCycle { chain: Vec<ResolvedPath>, span: Option<Span> },

    /// An import whose symbols are never referenced. A warning.
    #[error("unused import \"{path}\"")]
    UnusedImport { path: UnresolvedPath, span: Option<Span> },

    /// The linker was handed a dependency list that does not match the
    /// descriptor's `dependency` entries.
    #[error("\"{file}\" lists {listed} dependencies but {supplied} were supplied")]
    DependencyCount { file: ResolvedPath, listed: usize, supplied: usize },

    /// A resolver or parser panicked; converted per task instead of crashing
    /// the process.
    #[error("panic while compiling \"{file}\": {message}")]
    Panic { file: ResolvedPath, message: String },

    /// The shared cancellation token fired.
    #[error("compilation cancelled")]
    Cancelled,

    /// A general purpose error message.
    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Creates a general purpose error message.
    pub fn msg(msg: impl Into<String>) -> Self {
        Error::Message(msg.into())
    }

    /// Wraps a resolver failure with the offending unresolved path. If the
    /// underlying message already names the path it is kept as-is.
    pub fn resolver(path: UnresolvedPath, err: impl std::fmt::Display) -> Self {
        let message = err.to_string();
        let message = if message.contains(path.as_str()) {
            message
        } else {
            format!("error resolving \"{path}\": {message}")
        };
        Error::Resolver { path, message }
    }

    /// Whether the link step can still produce a usable result after this
    /// error.
    ///
    /// Redeclarations, extension-number collisions and unresolvable imports
    /// are recoverable: linking continues and more diagnostics accumulate.
    /// Undeclared names fail the reference they occur on (the resolution pass
    /// still visits the remaining references), and package-vs-symbol
    /// collisions abort the file outright.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::SymbolRedeclared { .. }
                | Error::ExtensionCollision { .. }
                | Error::FailedToResolve { .. }
                | Error::UnusedImport { .. }
        )
    }

    /// Whether this diagnostic is a warning rather than an error.
    pub fn is_warning(&self) -> bool {
        matches!(self, Error::UnusedImport { .. })
    }

    /// The source region the diagnostic points at, when one is known.
    pub fn span(&self) -> Option<&Span> {
        match self {
            Error::FailedToResolve { span, .. }
            | Error::SymbolRedeclared { span, .. }
            | Error::PackageCollision { span, .. }
            | Error::UndeclaredName { span, .. }
            | Error::InvalidType { span, .. }
            | Error::ExtensionCollision { span, .. }
            | Error::ImportCycle { span, .. }
            | Error::UnusedImport { span, .. } => span.as_ref(),
            _ => None,
        }
    }

    /// Attaches a span to diagnostics that can carry one, for re-reporting an
    /// error against the statement that triggered it.
    pub(crate) fn with_span(mut self, at: Span) -> Self {
        match &mut self {
            Error::FailedToResolve { span, .. }
            | Error::SymbolRedeclared { span, .. }
            | Error::PackageCollision { span, .. }
            | Error::UndeclaredName { span, .. }
            | Error::InvalidType { span, .. }
            | Error::ExtensionCollision { span, .. }
            | Error::ImportCycle { span, .. }
            | Error::UnusedImport { span, .. } => *span = Some(at),
            _ => {}
        }
        self
    }

    /// The other file involved in a cross-file collision. The executor
    /// force-recompiles entangled files on the next round so both sides of
    /// the collision are re-reported.
    pub fn entangled(&self) -> Option<&ResolvedPath> {
        match self {
            Error::SymbolRedeclared { entangled, .. }
            | Error::PackageCollision { entangled, .. }
            | Error::ExtensionCollision { entangled, .. } => entangled.as_ref(),
            _ => None,
        }
    }
}

/// Outcome of a [`Resolver`](crate::Resolver) lookup failure.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ResolveError {
    /// The resolver does not know the path. The executor maps this onto
    /// [`Error::FailedToResolve`] with the importing statement's span.
    #[error("file not found")]
    NotFound,
    /// The resolver knows the path but failed to produce it.
    #[error(transparent)]
    Error(#[from] Error),
}

impl From<std::io::Error> for ResolveError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            ResolveError::NotFound
        } else {
            ResolveError::Error(Error::msg(err.to_string()))
        }
    }
}

fn enum_value_note(is_enum_value: &bool) -> &'static str {
    if *is_enum_value {
        "; note that enum values use C++ scoping rules, meaning that enum \
         values are siblings of their type, not children of it"
    } else {
        ""
    }
}

fn hint_note(hint: &Option<String>) -> String {
    match hint {
        Some(hint) => format!(" (did you mean \"{hint}\"?)"),
        None => String::new(),
    }
}

fn render_chain(chain: &[ResolvedPath]) -> String {
    let mut out = String::new();
    for (i, path) in chain.iter().enumerate() {
        if i > 0 {
            out.push_str(" -> ");
        }
        out.push('"');
        out.push_str(path.as_str());
        out.push('"');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolver_errors_name_the_path_once() {
        let path = UnresolvedPath::from("a/b.proto");
        let wrapped = Error::resolver(path.clone(), "permission denied");
        assert_eq!(wrapped.to_string(), "error resolving \"a/b.proto\": permission denied");

        let already = Error::resolver(path, "cannot open a/b.proto: permission denied");
        assert_eq!(already.to_string(), "cannot open a/b.proto: permission denied");
    }

    #[test]
    fn cycle_chain_rendering() {
        let err = Error::ImportCycle {
            chain: vec!["x.proto".into(), "y.proto".into(), "x.proto".into()],
            span: None,
        };
        assert_eq!(err.to_string(), "import cycle: \"x.proto\" -> \"y.proto\" -> \"x.proto\"");
    }

    #[test]
    fn recoverability_split() {
        let redeclared = Error::SymbolRedeclared {
            name: "a.M".into(),
            span: None,
            existing: Span::file_only("a.proto".into()),
            is_enum_value: false,
            entangled: None,
        };
        assert!(redeclared.is_recoverable());

        let package = Error::PackageCollision {
            name: "foo".into(),
            span: None,
            existing: Span::file_only("p.proto".into()),
            entangled: None,
        };
        assert!(!package.is_recoverable());
        assert!(Error::UnusedImport { path: "u.proto".into(), span: None }.is_warning());
    }
}
