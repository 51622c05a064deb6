//! Path newtypes separating an import path as written from the canonical
//! identity of a file.

use std::{borrow::Borrow, fmt, sync::Arc};

/// An import path exactly as it appears in an `import "…";` statement, or as
/// handed to [`Compiler::compile`](crate::Compiler::compile).
///
/// Nothing is known about an `UnresolvedPath` except its spelling; only the
/// [`Resolver`](crate::Resolver) can turn it into a [`ResolvedPath`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnresolvedPath(Arc<str>);

/// A path that uniquely identifies one file within the compilation universe.
///
/// Two distinct [`UnresolvedPath`]s may resolve to the same `ResolvedPath`
/// (e.g. an absolute filesystem path and the include-relative spelling of the
/// same file); the resolver is the sole authority for that mapping. The
/// executor keys all of its state by `ResolvedPath`, which is what guarantees
/// at most one in-flight task per file.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResolvedPath(Arc<str>);

macro_rules! impl_path {
    ($ty:ident) => {
        impl $ty {
            /// Returns the path as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $ty {
            fn from(s: &str) -> Self {
                Self(Arc::from(s))
            }
        }

        impl From<String> for $ty {
            fn from(s: String) -> Self {
                Self(Arc::from(s.as_str()))
            }
        }

        impl From<&String> for $ty {
            fn from(s: &String) -> Self {
                Self(Arc::from(s.as_str()))
            }
        }

        impl Borrow<str> for $ty {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $ty {
            fn eq(&self, other: &str) -> bool {
                self.as_str() == other
            }
        }

        impl PartialEq<&str> for $ty {
            fn eq(&self, other: &&str) -> bool {
                self.as_str() == *other
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:?}", &*self.0)
            }
        }
    };
}

impl_path!(UnresolvedPath);
impl_path!(ResolvedPath);

impl UnresolvedPath {
    /// Reinterprets the path as already resolved.
    ///
    /// Used when the resolver fails: the executor still needs a stable key
    /// for the failing file, and the spelling of the import is the best
    /// identity available.
    pub fn assume_resolved(&self) -> ResolvedPath {
        ResolvedPath(self.0.clone())
    }
}

impl ResolvedPath {
    /// Reinterprets the resolved path as an import spelling, for lookups that
    /// go back through a resolver.
    pub fn as_unresolved(&self) -> UnresolvedPath {
        UnresolvedPath(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_cheap_identity_wrappers() {
        let u = UnresolvedPath::from("google/protobuf/descriptor.proto");
        let r = u.assume_resolved();
        assert_eq!(u.as_str(), r.as_str());
        assert_eq!(r, "google/protobuf/descriptor.proto");
        assert_eq!(format!("{r}"), "google/protobuf/descriptor.proto");
    }
}
