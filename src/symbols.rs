//! The global symbol table.
//!
//! Fully-qualified names live in a trie of package nodes: each node guards
//! its own children, the symbols declared directly inside that package, and
//! the extension numbers registered against messages of that package, behind
//! its own read/write lock. One more lock guards the per-file refcounts and
//! one the global extension registry. Lock order is always root-toward-leaves.
//!
//! The table is transactional at the granularity of one link step: the
//! executor clones the live table, links against the clone, and swaps it in
//! on success. A failed link discards the clone, so no observer ever sees
//! half-committed symbols. Within the live table, `import`/`delete` are
//! refcounted and symmetric: importing a file and deleting it restores the
//! table to its previous state.

use crate::{
    error::{Error, Result},
    file::File,
    path::ResolvedPath,
    report::Handler,
    span::Span,
};
use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, sync::Arc};

/// What kind of declaration a symbol is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SymbolKind {
    Package,
    Message,
    Enum,
    EnumValue,
    Field,
    Oneof,
    Service,
    Method,
    Extension,
}

impl SymbolKind {
    pub fn is_package(self) -> bool {
        self == SymbolKind::Package
    }

    pub fn is_enum_value(self) -> bool {
        self == SymbolKind::EnumValue
    }
}

/// One registered symbol: where it was declared and what it is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolEntry {
    pub span: Span,
    pub kind: SymbolKind,
}

impl SymbolEntry {
    pub fn is_package(&self) -> bool {
        self.kind.is_package()
    }

    pub fn is_enum_value(&self) -> bool {
        self.kind.is_enum_value()
    }
}

#[derive(Default)]
struct NodeInner {
    children: HashMap<String, Arc<PackageNode>>,
    symbols: HashMap<String, SymbolEntry>,
    // extension registrations inside this package; the first span is the
    // winning registration, later ones are retained for diagnostics
    exts: HashMap<(String, i32), Vec<Span>>,
}

struct PackageNode {
    /// Fully-qualified package name; empty at the root.
    fqn: String,
    inner: RwLock<NodeInner>,
}

impl PackageNode {
    fn new(fqn: String) -> Arc<Self> {
        Arc::new(Self { fqn, inner: RwLock::new(NodeInner::default()) })
    }
}

/// The shared symbol table. See the module docs for the locking and
/// transaction model.
pub struct SymbolTable {
    root: Arc<PackageNode>,
    files: Mutex<HashMap<ResolvedPath, usize>>,
    exts: RwLock<HashMap<(String, i32), Span>>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            root: PackageNode::new(String::new()),
            files: Mutex::new(HashMap::new()),
            exts: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `file` and its placeholder-free imports, transitively.
    ///
    /// Every import edge increments the target's refcount; symbols and
    /// extensions are committed only on a file's first import, so repeated
    /// imports are idempotent apart from the count.
    pub fn import(&self, file: &File, handler: &Handler) -> Result<()> {
        for dep in file.dependencies() {
            if !dep.is_placeholder() {
                self.import(dep, handler)?;
            }
        }
        let first = {
            let mut files = self.files.lock();
            let count = files.entry(file.path().clone()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first {
            trace!(file = %file.path(), "committing symbols");
            self.commit_file(file, handler)?;
        }
        Ok(())
    }

    /// Unregisters `file` and its placeholder-free imports, transitively.
    ///
    /// When a file's refcount reaches zero, every symbol and extension whose
    /// recorded span names the file is removed and emptied package subtrees
    /// collapse up to the first non-empty ancestor.
    pub fn delete(&self, file: &File) {
        for dep in file.dependencies() {
            if !dep.is_placeholder() {
                self.delete(dep);
            }
        }
        let gone = {
            let mut files = self.files.lock();
            match files.get_mut(file.path()) {
                Some(count) => {
                    *count -= 1;
                    let gone = *count == 0;
                    if gone {
                        files.remove(file.path());
                    }
                    gone
                }
                None => false,
            }
        };
        if gone {
            trace!(file = %file.path(), "deleting symbols");
            self.purge(file.path());
        }
    }

    /// Registers all descriptors of a freshly-linked file, before the
    /// [`File`] value exists. Used by the linker for the file being linked;
    /// dependencies go through [`import`](Self::import).
    pub(crate) fn import_parts(
        &self,
        file: &ResolvedPath,
        package: &str,
        package_span: Span,
        symbols: impl IntoIterator<Item = (String, SymbolKind, Span)>,
        handler: &Handler,
    ) -> Result<()> {
        let first = {
            let mut files = self.files.lock();
            let count = files.entry(file.clone()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if !first {
            return Ok(());
        }
        let node = self.import_package(package, package_span, handler)?;
        self.commit_symbols(&node, file, symbols, handler)
    }

    fn commit_file(&self, file: &File, handler: &Handler) -> Result<()> {
        let node = self.import_package(file.package(), file.package_span().clone(), handler)?;
        self.commit_symbols(
            &node,
            file.path(),
            file.symbols().map(|(fqn, kind, span)| (fqn.to_owned(), kind, span.clone())),
            handler,
        )?;
        for (extendee, number, span) in file.extensions() {
            self.add_extension(
                &self.package_of(extendee),
                extendee,
                number,
                span.clone(),
                handler,
            )?;
        }
        Ok(())
    }

    /// Walks the package trie, creating nodes and package symbol entries as
    /// needed. A non-package symbol sitting on the path is an unrecoverable
    /// collision.
    fn import_package(
        &self,
        package: &str,
        span: Span,
        handler: &Handler,
    ) -> Result<Arc<PackageNode>> {
        let mut node = Arc::clone(&self.root);
        for prefix in name_prefixes(package) {
            let child = {
                let mut inner = node.inner.write();
                match inner.symbols.get(prefix).cloned() {
                    Some(existing) if !existing.is_package() => {
                        let err = Error::PackageCollision {
                            name: prefix.to_owned(),
                            span: Some(span.clone()),
                            existing: existing.span.clone(),
                            entangled: entangled_file(&existing.span, &span),
                        };
                        handler.error(err.clone())?;
                        return Err(err);
                    }
                    Some(_) => {}
                    None => {
                        inner.symbols.insert(
                            prefix.to_owned(),
                            SymbolEntry { span: span.clone(), kind: SymbolKind::Package },
                        );
                    }
                }
                Arc::clone(
                    inner
                        .children
                        .entry(last_segment(prefix).to_owned())
                        .or_insert_with(|| PackageNode::new(prefix.to_owned())),
                )
            };
            node = child;
        }
        Ok(node)
    }

    fn commit_symbols(
        &self,
        node: &Arc<PackageNode>,
        file: &ResolvedPath,
        symbols: impl IntoIterator<Item = (String, SymbolKind, Span)>,
        handler: &Handler,
    ) -> Result<()> {
        let mut inner = node.inner.write();
        for (fqn, kind, span) in symbols {
            match inner.symbols.get(&fqn).cloned() {
                Some(existing) if existing.is_package() => {
                    let err = Error::PackageCollision {
                        name: fqn,
                        span: Some(span),
                        existing: existing.span.clone(),
                        entangled: entangled_file(&existing.span, &Span::file_only(file.clone())),
                    };
                    handler.error(err.clone())?;
                    return Err(err);
                }
                Some(existing) => {
                    // recoverable: the existing declaration wins, linking of
                    // the current file continues
                    let err = Error::SymbolRedeclared {
                        name: fqn,
                        is_enum_value: existing.is_enum_value() || kind.is_enum_value(),
                        existing: existing.span.clone(),
                        entangled: if existing.span.file != *file {
                            Some(existing.span.file.clone())
                        } else {
                            None
                        },
                        span: Some(span),
                    };
                    handler.error(err)?;
                }
                None => {
                    inner.symbols.insert(fqn, SymbolEntry { span, kind });
                }
            }
        }
        Ok(())
    }

    /// Registers an extension number for `extendee`.
    ///
    /// The pair is recorded both inside the extendee's package and in the
    /// global registry. A duplicate pair is an error naming both spans; the
    /// existing registration wins globally, but the incoming span is still
    /// retained in the package for later diagnostics.
    pub fn add_extension(
        &self,
        pkg: &str,
        extendee: &str,
        number: i32,
        span: Span,
        handler: &Handler,
    ) -> Result<()> {
        if !pkg.is_empty() && !extendee.starts_with(&format!("{pkg}.")) {
            return Err(Error::msg(format!(
                "extendee \"{extendee}\" does not belong to package \"{pkg}\""
            )));
        }
        let node = self.package_node(pkg);
        node.inner
            .write()
            .exts
            .entry((extendee.to_owned(), number))
            .or_default()
            .push(span.clone());

        let existing = {
            let mut exts = self.exts.write();
            let existing = exts.get(&(extendee.to_owned(), number)).cloned();
            if existing.is_none() {
                exts.insert((extendee.to_owned(), number), span.clone());
            }
            existing
        };
        if let Some(existing) = existing {
            handler.error(Error::ExtensionCollision {
                extendee: extendee.to_owned(),
                number,
                entangled: entangled_file(&existing, &span),
                span: Some(span),
                existing,
            })?;
        }
        Ok(())
    }

    /// Finds the entry registered for a fully-qualified name.
    pub fn lookup(&self, fqn: &str) -> Option<SymbolEntry> {
        let mut node = Arc::clone(&self.root);
        if let Some(entry) = node.inner.read().symbols.get(fqn) {
            return Some(entry.clone());
        }
        for segment in fqn.split('.') {
            let child = node.inner.read().children.get(segment).cloned();
            match child {
                Some(child) => {
                    node = child;
                    if let Some(entry) = node.inner.read().symbols.get(fqn) {
                        return Some(entry.clone());
                    }
                }
                None => break,
            }
        }
        None
    }

    /// The winning registration for an `(extendee, number)` pair.
    pub fn lookup_extension(&self, extendee: &str, number: i32) -> Option<Span> {
        self.exts.read().get(&(extendee.to_owned(), number)).cloned()
    }

    /// The deepest registered package enclosing `fqn` (possibly the empty
    /// root package).
    pub fn package_of(&self, fqn: &str) -> String {
        let mut node = Arc::clone(&self.root);
        for segment in fqn.split('.') {
            let child = node.inner.read().children.get(segment).cloned();
            match child {
                Some(child) => node = child,
                None => break,
            }
        }
        node.fqn.clone()
    }

    fn package_node(&self, pkg: &str) -> Arc<PackageNode> {
        let mut node = Arc::clone(&self.root);
        for prefix in name_prefixes(pkg) {
            let child = {
                let mut inner = node.inner.write();
                Arc::clone(
                    inner
                        .children
                        .entry(last_segment(prefix).to_owned())
                        .or_insert_with(|| PackageNode::new(prefix.to_owned())),
                )
            };
            node = child;
        }
        node
    }

    fn purge(&self, path: &ResolvedPath) {
        self.exts.write().retain(|_, span| span.file != *path);
        Self::purge_node(&self.root, path);
    }

    // Removes everything `path` contributed below `node` and collapses
    // emptied subtrees. Returns whether `node` itself is now empty.
    fn purge_node(node: &Arc<PackageNode>, path: &ResolvedPath) -> bool {
        let mut inner = node.inner.write();
        // package entries are owned by the subtree, not by a single file;
        // they go away when their node collapses
        inner.symbols.retain(|_, entry| entry.is_package() || entry.span.file != *path);
        inner.exts.retain(|_, spans| {
            spans.retain(|span| span.file != *path);
            !spans.is_empty()
        });
        let mut collapsed = Vec::new();
        inner.children.retain(|_, child| {
            let empty = Self::purge_node(child, path);
            if empty {
                collapsed.push(child.fqn.clone());
            }
            !empty
        });
        for fqn in collapsed {
            inner.symbols.remove(&fqn);
        }
        inner.children.is_empty() && inner.symbols.is_empty() && inner.exts.is_empty()
    }

    /// Renders the table into a sorted, comparable form.
    pub fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::default();
        Self::snapshot_node(&self.root, &mut snapshot);
        for ((extendee, number), span) in self.exts.read().iter() {
            snapshot.extensions.push((extendee.clone(), *number, span.file.clone()));
        }
        for (path, count) in self.files.lock().iter() {
            snapshot.files.push((path.clone(), *count));
        }
        snapshot.symbols.sort();
        snapshot.extensions.sort();
        snapshot.package_extensions.sort();
        snapshot.files.sort();
        snapshot
    }

    fn snapshot_node(node: &Arc<PackageNode>, out: &mut Snapshot) {
        let inner = node.inner.read();
        for (fqn, entry) in &inner.symbols {
            out.symbols.push((fqn.clone(), entry.kind, entry.span.file.clone()));
        }
        for ((extendee, number), spans) in &inner.exts {
            for span in spans {
                out.package_extensions.push((
                    node.fqn.clone(),
                    extendee.clone(),
                    *number,
                    span.file.clone(),
                ));
            }
        }
        for child in inner.children.values() {
            Self::snapshot_node(child, out);
        }
    }

    fn clone_node(node: &Arc<PackageNode>) -> Arc<PackageNode> {
        let inner = node.inner.read();
        Arc::new(PackageNode {
            fqn: node.fqn.clone(),
            inner: RwLock::new(NodeInner {
                children: inner
                    .children
                    .iter()
                    .map(|(name, child)| (name.clone(), Self::clone_node(child)))
                    .collect(),
                symbols: inner.symbols.clone(),
                exts: inner.exts.clone(),
            }),
        })
    }
}

impl Clone for SymbolTable {
    /// Deep copy, used as the pending table for one link transaction. Read
    /// locks are taken root-toward-leaves over the entire tree.
    fn clone(&self) -> Self {
        Self {
            root: Self::clone_node(&self.root),
            files: Mutex::new(self.files.lock().clone()),
            exts: RwLock::new(self.exts.read().clone()),
        }
    }
}

impl std::fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolTable").field("files", &self.files.lock().len()).finish()
    }
}

/// A comparable rendering of a [`SymbolTable`]: every symbol, extension
/// registration and file refcount, sorted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub symbols: Vec<(String, SymbolKind, ResolvedPath)>,
    pub extensions: Vec<(String, i32, ResolvedPath)>,
    pub package_extensions: Vec<(String, String, i32, ResolvedPath)>,
    pub files: Vec<(ResolvedPath, usize)>,
}

fn entangled_file(existing: &Span, incoming: &Span) -> Option<ResolvedPath> {
    (existing.file != incoming.file).then(|| existing.file.clone())
}

/// Yields each dotted prefix of `name` as a full-name slice: `a.b.c` yields
/// `a`, `a.b`, `a.b.c`. The empty name yields nothing. Allocation-free.
pub(crate) fn name_prefixes(name: &str) -> impl Iterator<Item = &str> {
    let mut done = name.is_empty();
    let mut from = 0;
    std::iter::from_fn(move || {
        if done {
            return None;
        }
        match name[from..].find('.') {
            Some(dot) => {
                let end = from + dot;
                from = end + 1;
                Some(&name[..end])
            }
            None => {
                done = true;
                Some(name)
            }
        }
    })
}

/// The last dotted segment of a name; the name itself when it has no dots.
pub(crate) fn last_segment(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}
