//! Import resolution.
//!
//! A [`Resolver`] maps an import path to the file it names. What comes back
//! is a [`SearchResult`]: the canonical [`ResolvedPath`] for the file plus
//! the most processed form of it the resolver has on hand: raw source, a
//! parsed AST, an unlinked descriptor proto, or an already-linked [`File`].
//! The executor picks up compilation from whichever stage it was given.

use crate::{
    error::ResolveError,
    file::File,
    parse::{Ast, ParseResult},
    path::{ResolvedPath, UnresolvedPath},
};
use prost_types::FileDescriptorProto;
use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
};

/// The payload of a successful resolver lookup, from least to most processed.
#[derive(Clone, Debug)]
pub enum SearchSource {
    /// Raw source text, to be parsed.
    Source(String),
    /// A parsed AST, to be converted and linked.
    Ast(Ast),
    /// An unlinked descriptor proto, to be linked.
    Proto(FileDescriptorProto),
    /// An already-linked file; compilation short-circuits.
    Linked(File),
}

/// A resolver hit: the canonical path the import maps to and the file's
/// contents in some form.
///
/// Whichever payload is present, an embedded file name must equal `resolved`;
/// the executor rejects mismatches.
#[derive(Clone, Debug)]
pub struct SearchResult {
    pub resolved: ResolvedPath,
    pub source: SearchSource,
}

impl SearchResult {
    pub fn from_source(resolved: ResolvedPath, source: impl Into<String>) -> Self {
        Self { resolved, source: SearchSource::Source(source.into()) }
    }

    pub fn from_ast(resolved: ResolvedPath, ast: Ast) -> Self {
        Self { resolved, source: SearchSource::Ast(ast) }
    }

    pub fn from_proto(resolved: ResolvedPath, proto: FileDescriptorProto) -> Self {
        Self { resolved, source: SearchSource::Proto(proto) }
    }

    pub fn from_file(file: File) -> Self {
        Self { resolved: file.path().clone(), source: SearchSource::Linked(file) }
    }

    /// The file name embedded in the payload, if the payload carries one.
    pub fn embedded_name(&self) -> Option<&str> {
        match &self.source {
            SearchSource::Source(_) => None,
            SearchSource::Ast(ast) => Some(ast.name().as_str()),
            SearchSource::Proto(proto) => proto.name.as_deref(),
            SearchSource::Linked(file) => Some(file.path().as_str()),
        }
    }
}

/// Maps import paths to files. Consumer-supplied.
///
/// `import_context` is the parse result of the importing file, when the
/// lookup comes from an `import` statement; resolvers can use it for
/// relative or workspace-aware resolution. It is `None` for top-level
/// requests.
pub trait Resolver: Send + Sync {
    fn find_file_by_path(
        &self,
        path: &UnresolvedPath,
        import_context: Option<&ParseResult>,
    ) -> Result<SearchResult, ResolveError>;
}

impl<R: Resolver + ?Sized> Resolver for std::sync::Arc<R> {
    fn find_file_by_path(
        &self,
        path: &UnresolvedPath,
        import_context: Option<&ParseResult>,
    ) -> Result<SearchResult, ResolveError> {
        (**self).find_file_by_path(path, import_context)
    }
}

/// An in-memory resolver mapping proto names to source strings.
///
/// Import paths are the canonical names; no remapping happens.
#[derive(Clone, Debug, Default)]
pub struct MemoryResolver {
    files: HashMap<String, String>,
}

impl MemoryResolver {
    /// Adds a file, replacing any previous content under the same name.
    #[must_use]
    pub fn with_file(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.files.insert(name.into(), source.into());
        self
    }

    /// Adds or replaces a file in place.
    pub fn insert(&mut self, name: impl Into<String>, source: impl Into<String>) {
        self.files.insert(name.into(), source.into());
    }

    /// Removes a file, so later lookups report it as not found.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.files.remove(name)
    }
}

impl Resolver for MemoryResolver {
    fn find_file_by_path(
        &self,
        path: &UnresolvedPath,
        _import_context: Option<&ParseResult>,
    ) -> Result<SearchResult, ResolveError> {
        match self.files.get(path.as_str()) {
            Some(source) => Ok(SearchResult::from_source(path.assume_resolved(), source.clone())),
            None => Err(ResolveError::NotFound),
        }
    }
}

/// Resolves imports against one include directory on disk.
///
/// The import path doubles as the canonical proto name; the file is read from
/// `<include>/<path>`. Paths escaping the include root (absolute, or with
/// `..` components) are rejected as not found.
#[derive(Clone, Debug)]
pub struct IncludeResolver {
    include: PathBuf,
}

impl IncludeResolver {
    pub fn new(include: impl Into<PathBuf>) -> Self {
        Self { include: include.into() }
    }

    /// The include directory lookups are rooted at.
    pub fn include(&self) -> &Path {
        &self.include
    }
}

impl Resolver for IncludeResolver {
    fn find_file_by_path(
        &self,
        path: &UnresolvedPath,
        _import_context: Option<&ParseResult>,
    ) -> Result<SearchResult, ResolveError> {
        let relative = Path::new(path.as_str());
        let sane = relative.components().all(|c| matches!(c, Component::Normal(_)));
        if !sane {
            return Err(ResolveError::NotFound);
        }
        let disk = self.include.join(relative);
        trace!(path = %path, disk = %disk.display(), "reading import from include dir");
        let source = std::fs::read_to_string(disk)?;
        Ok(SearchResult::from_source(path.assume_resolved(), source))
    }
}

/// Tries a sequence of resolvers in order; the first hit wins.
#[derive(Default)]
pub struct ChainResolver {
    resolvers: Vec<Box<dyn Resolver>>,
}

impl ChainResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a resolver to the chain.
    #[must_use]
    pub fn with(mut self, resolver: impl Resolver + 'static) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }
}

impl Resolver for ChainResolver {
    fn find_file_by_path(
        &self,
        path: &UnresolvedPath,
        import_context: Option<&ParseResult>,
    ) -> Result<SearchResult, ResolveError> {
        for resolver in &self.resolvers {
            match resolver.find_file_by_path(path, import_context) {
                Err(ResolveError::NotFound) => continue,
                other => return other,
            }
        }
        Err(ResolveError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_resolver_is_an_identity_mapping() {
        let resolver = MemoryResolver::default().with_file("a.proto", "syntax = \"proto3\";");
        let hit = resolver.find_file_by_path(&"a.proto".into(), None).unwrap();
        assert_eq!(hit.resolved, "a.proto");
        assert!(matches!(hit.source, SearchSource::Source(_)));

        assert!(matches!(
            resolver.find_file_by_path(&"missing.proto".into(), None),
            Err(ResolveError::NotFound)
        ));
    }

    #[test]
    fn include_resolver_rejects_escaping_paths() {
        let resolver = IncludeResolver::new("/nonexistent-include-root");
        for path in ["../etc/passwd", "/etc/passwd"] {
            assert!(matches!(
                resolver.find_file_by_path(&path.into(), None),
                Err(ResolveError::NotFound)
            ));
        }
    }

    #[test]
    fn chain_takes_the_first_hit() {
        let chain = ChainResolver::new()
            .with(MemoryResolver::default().with_file("a.proto", "// first"))
            .with(
                MemoryResolver::default()
                    .with_file("a.proto", "// shadowed")
                    .with_file("b.proto", "// second"),
            );

        let a = chain.find_file_by_path(&"a.proto".into(), None).unwrap();
        match a.source {
            SearchSource::Source(text) => assert_eq!(text, "// first"),
            other => panic!("unexpected search source: {other:?}"),
        }
        assert!(chain.find_file_by_path(&"b.proto".into(), None).is_ok());
        assert!(chain.find_file_by_path(&"c.proto".into(), None).is_err());
    }
}
