//! Linked files and collections of them.
//!
//! A [`File`] is the immutable result of linking one descriptor proto. Its
//! descriptors live in an arena owned by the file and addressed by stable
//! indices; a [`Descriptor`] handle is a `(file, index)` pair, which is how
//! the naturally cyclic descriptor graph (messages referencing themselves,
//! nested types referencing their container) is represented without aliased
//! owned pointers.

use crate::{
    error::ResolveError,
    parse::ParseResult,
    path::{ResolvedPath, UnresolvedPath},
    resolver::{Resolver, SearchResult},
    span::Span,
    symbols::SymbolKind,
};
use prost_types::{FileDescriptorProto, FileDescriptorSet};
use std::{collections::HashMap, fmt, sync::Arc};

/// What a [`Descriptor`] describes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DescriptorKind {
    Message,
    Enum,
    EnumValue { number: i32 },
    Field { number: i32 },
    Oneof,
    Service,
    Method,
    Extension { extendee: String, number: i32 },
}

impl DescriptorKind {
    pub(crate) fn symbol_kind(&self) -> SymbolKind {
        match self {
            DescriptorKind::Message => SymbolKind::Message,
            DescriptorKind::Enum => SymbolKind::Enum,
            DescriptorKind::EnumValue { .. } => SymbolKind::EnumValue,
            DescriptorKind::Field { .. } => SymbolKind::Field,
            DescriptorKind::Oneof => SymbolKind::Oneof,
            DescriptorKind::Service => SymbolKind::Service,
            DescriptorKind::Method => SymbolKind::Method,
            DescriptorKind::Extension { .. } => SymbolKind::Extension,
        }
    }
}

/// Arena entry for one descriptor.
#[derive(Clone, Debug)]
pub(crate) struct DescriptorData {
    pub fqn: String,
    pub kind: DescriptorKind,
    pub span: Span,
    pub parent: Option<u32>,
    /// Location path of the node in the descriptor proto.
    pub locpath: Vec<i32>,
}

#[derive(Debug)]
struct FileInner {
    path: ResolvedPath,
    package: String,
    package_span: Span,
    proto: FileDescriptorProto,
    deps: Vec<File>,
    arena: Vec<DescriptorData>,
    by_name: HashMap<String, u32>,
    placeholder: bool,
}

/// A linked file. Cheap to clone and immutable.
///
/// When an import cannot be resolved its dependency slot is filled with a
/// *placeholder* file that knows nothing but the requested path; check
/// [`is_placeholder`](File::is_placeholder) before treating lookups as
/// authoritative.
#[derive(Clone)]
pub struct File {
    inner: Arc<FileInner>,
}

impl File {
    pub(crate) fn from_parts(
        path: ResolvedPath,
        package: String,
        package_span: Span,
        proto: FileDescriptorProto,
        deps: Vec<File>,
        arena: Vec<DescriptorData>,
        by_name: HashMap<String, u32>,
    ) -> Self {
        Self {
            inner: Arc::new(FileInner {
                path,
                package,
                package_span,
                proto,
                deps,
                arena,
                by_name,
                placeholder: false,
            }),
        }
    }

    /// A stand-in for an import that could not be resolved. All lookups on it
    /// return empty.
    pub fn placeholder(path: ResolvedPath) -> Self {
        let proto =
            FileDescriptorProto { name: Some(path.as_str().to_owned()), ..Default::default() };
        Self {
            inner: Arc::new(FileInner {
                package_span: Span::file_only(path.clone()),
                path,
                package: String::new(),
                proto,
                deps: Vec::new(),
                arena: Vec::new(),
                by_name: HashMap::new(),
                placeholder: true,
            }),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.inner.placeholder
    }

    /// The resolved path that uniquely names this file.
    pub fn path(&self) -> &ResolvedPath {
        &self.inner.path
    }

    /// The file's package, possibly empty.
    pub fn package(&self) -> &str {
        &self.inner.package
    }

    pub(crate) fn package_span(&self) -> &Span {
        &self.inner.package_span
    }

    /// The underlying descriptor proto, with all type references resolved to
    /// fully-qualified form.
    pub fn proto(&self) -> &FileDescriptorProto {
        &self.inner.proto
    }

    /// Direct dependencies, index-aligned with the descriptor's `dependency`
    /// list. Unresolved imports appear as placeholders.
    pub fn dependencies(&self) -> &[File] {
        &self.inner.deps
    }

    /// Finds a descriptor defined in this file by fully-qualified name.
    pub fn find_descriptor(&self, name: &str) -> Option<Descriptor> {
        let index = *self.inner.by_name.get(name)?;
        Some(Descriptor { file: self.clone(), index })
    }

    /// Finds a direct dependency by its path, either the resolved path or the
    /// spelling in the descriptor's `dependency` list.
    pub fn find_import_by_path(&self, path: &str) -> Option<&File> {
        for (i, dep) in self.inner.deps.iter().enumerate() {
            if *dep.path() == *path {
                return Some(dep);
            }
            if self.inner.proto.dependency.get(i).map(String::as_str) == Some(path) {
                return Some(dep);
            }
        }
        None
    }

    /// Finds the extension of `msg_fqn` with the given number, searching the
    /// file's top-level extensions first and nested messages after.
    pub fn find_extension_by_number(&self, msg_fqn: &str, number: i32) -> Option<Descriptor> {
        let matches = |data: &DescriptorData| match &data.kind {
            DescriptorKind::Extension { extendee, number: n } => {
                *n == number && extendee == msg_fqn
            }
            _ => false,
        };
        let top_level = self
            .inner
            .arena
            .iter()
            .position(|data| data.parent.is_none() && matches(data));
        let index = top_level
            .or_else(|| self.inner.arena.iter().position(|data| data.parent.is_some() && matches(data)))?;
        Some(Descriptor { file: self.clone(), index: index as u32 })
    }

    /// Iterates every descriptor defined in this file.
    pub fn descriptors(&self) -> impl Iterator<Item = Descriptor> + '_ {
        (0..self.inner.arena.len() as u32).map(move |index| Descriptor { file: self.clone(), index })
    }

    /// `(fqn, kind, span)` of every descriptor, for symbol registration.
    pub(crate) fn symbols(&self) -> impl Iterator<Item = (&str, SymbolKind, &Span)> + '_ {
        self.inner
            .arena
            .iter()
            .map(|data| (data.fqn.as_str(), data.kind.symbol_kind(), &data.span))
    }

    /// `(extendee, number, span)` of every extension defined in this file.
    pub(crate) fn extensions(&self) -> impl Iterator<Item = (&str, i32, &Span)> + '_ {
        self.inner.arena.iter().filter_map(|data| match &data.kind {
            DescriptorKind::Extension { extendee, number } => {
                Some((extendee.as_str(), *number, &data.span))
            }
            _ => None,
        })
    }

    /// Wraps this file as a resolver over itself, its direct imports, and
    /// everything reachable through public imports, but nothing beyond.
    ///
    /// Queries are linear in the visible-file count, which is small and
    /// cache-friendly in practice.
    pub fn as_resolver(&self) -> FileResolver {
        let mut visible = vec![self.clone()];
        visible.extend(self.dependencies().iter().cloned());
        // everything a visible dependency re-exports becomes visible too
        let mut i = 1;
        while i < visible.len() {
            let file = visible[i].clone();
            for &public in &file.proto().public_dependency {
                if let Some(dep) = file.dependencies().get(public as usize) {
                    if !visible.iter().any(|v| v.path() == dep.path()) {
                        visible.push(dep.clone());
                    }
                }
            }
            i += 1;
        }
        FileResolver { visible }
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("path", &self.inner.path)
            .field("package", &self.inner.package)
            .field("placeholder", &self.inner.placeholder)
            .field("descriptors", &self.inner.arena.len())
            .finish()
    }
}

/// A handle to one descriptor inside a [`File`].
#[derive(Clone, Debug)]
pub struct Descriptor {
    file: File,
    index: u32,
}

impl Descriptor {
    fn data(&self) -> &DescriptorData {
        &self.file.inner.arena[self.index as usize]
    }

    /// The fully-qualified name, without a leading dot.
    pub fn full_name(&self) -> &str {
        &self.data().fqn
    }

    pub fn kind(&self) -> &DescriptorKind {
        &self.data().kind
    }

    /// Where the descriptor was declared.
    pub fn span(&self) -> &Span {
        &self.data().span
    }

    /// The file that defines this descriptor.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// The enclosing descriptor, if any (e.g. the message containing a field).
    pub fn parent(&self) -> Option<Descriptor> {
        let parent = self.data().parent?;
        Some(Descriptor { file: self.file.clone(), index: parent })
    }

    /// The location path addressing this descriptor's node in the proto.
    pub fn location_path(&self) -> &[i32] {
        &self.data().locpath
    }
}

/// An ordered set of linked files.
#[derive(Clone, Debug, Default)]
pub struct Files {
    files: Vec<File>,
}

impl Files {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a file, keeping the first entry when a path repeats.
    pub fn push(&mut self, file: File) {
        if self.find_file_by_path(file.path().as_str()).is_none() {
            self.files.push(file);
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &File> {
        self.files.iter()
    }

    pub fn get(&self, index: usize) -> Option<&File> {
        self.files.get(index)
    }

    /// Finds a file by resolved path.
    ///
    /// Linear on purpose: sets stay small enough that a sorted binary-search
    /// variant would only buy a constant factor.
    pub fn find_file_by_path(&self, path: &str) -> Option<&File> {
        self.files.iter().find(|file| *file.path() == *path)
    }

    /// Finds a descriptor by fully-qualified name across all files.
    pub fn find_descriptor(&self, name: &str) -> Option<Descriptor> {
        self.files.iter().find_map(|file| file.find_descriptor(name))
    }

    /// Finds an extension by extendee and number across all files.
    pub fn find_extension_by_number(&self, msg_fqn: &str, number: i32) -> Option<Descriptor> {
        self.files.iter().find_map(|file| file.find_extension_by_number(msg_fqn, number))
    }

    /// Assembles the conventional interchange form of the set.
    pub fn to_file_descriptor_set(&self) -> FileDescriptorSet {
        FileDescriptorSet { file: self.files.iter().map(|f| f.proto().clone()).collect() }
    }
}

impl FromIterator<File> for Files {
    fn from_iter<T: IntoIterator<Item = File>>(iter: T) -> Self {
        let mut files = Files::new();
        for file in iter {
            files.push(file);
        }
        files
    }
}

impl<'a> IntoIterator for &'a Files {
    type Item = &'a File;
    type IntoIter = std::slice::Iter<'a, File>;

    fn into_iter(self) -> Self::IntoIter {
        self.files.iter()
    }
}

impl Resolver for Files {
    fn find_file_by_path(
        &self,
        path: &UnresolvedPath,
        _import_context: Option<&ParseResult>,
    ) -> Result<SearchResult, ResolveError> {
        match Files::find_file_by_path(self, path.as_str()) {
            Some(file) => Ok(SearchResult::from_file(file.clone())),
            None => Err(ResolveError::NotFound),
        }
    }
}

/// Resolver over one file's visible set; see [`File::as_resolver`].
#[derive(Clone, Debug)]
pub struct FileResolver {
    visible: Vec<File>,
}

impl FileResolver {
    /// The files visible through this resolver, starting with the wrapped
    /// file itself.
    pub fn visible(&self) -> &[File] {
        &self.visible
    }

    pub fn find_descriptor(&self, name: &str) -> Option<Descriptor> {
        self.visible.iter().find_map(|file| file.find_descriptor(name))
    }

    pub fn find_extension_by_number(&self, msg_fqn: &str, number: i32) -> Option<Descriptor> {
        self.visible.iter().find_map(|file| file.find_extension_by_number(msg_fqn, number))
    }
}

impl Resolver for FileResolver {
    fn find_file_by_path(
        &self,
        path: &UnresolvedPath,
        _import_context: Option<&ParseResult>,
    ) -> Result<SearchResult, ResolveError> {
        match self.visible.iter().find(|file| *file.path() == *path.as_str()) {
            Some(file) => Ok(SearchResult::from_file(file.clone())),
            None => Err(ResolveError::NotFound),
        }
    }
}
