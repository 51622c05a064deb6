//! The linker: resolves every type reference in a parsed file against its
//! dependencies and produces a queryable [`File`].
//!
//! Linking runs against a *pending* symbol table, a clone of the live one,
//! so a failed link leaves no trace. The pass order is fixed: dependency
//! registration, hierarchy construction, own-symbol import, then a single
//! reference-resolution sweep that rewrites names to fully-qualified form
//! (with a leading dot), fixes up `MESSAGE` vs `ENUM` field types, and
//! registers extension numbers.

use crate::{
    error::{Error, Result},
    file::{DescriptorData, DescriptorKind, File},
    options::OptionIndex,
    parse::{loc, Ast, ParseResult, SourceIndex},
    path::ResolvedPath,
    report::Handler,
    span::Span,
    symbols::{SymbolEntry, SymbolKind, SymbolTable},
};
use prost_types::{
    field_descriptor_proto::Type, DescriptorProto, EnumDescriptorProto, FieldDescriptorProto,
    FileDescriptorProto, ServiceDescriptorProto,
};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

// FieldDescriptorProto / MethodDescriptorProto field numbers, for addressing
// the reference site inside a node's location path.
const FIELD_EXTENDEE: i32 = 2;
const FIELD_TYPE_NAME: i32 = 6;
const METHOD_INPUT_TYPE: i32 = 2;
const METHOD_OUTPUT_TYPE: i32 = 3;

/// A successfully (or partially) linked file: the [`File`] itself plus the
/// parse-result parts carried through linking and the resolved-references
/// index.
#[derive(Clone, Debug)]
pub struct Linked {
    file: File,
    ast: Option<Ast>,
    index: Arc<SourceIndex>,
    resolved: HashMap<Vec<i32>, String>,
    options: Option<OptionIndex>,
}

impl Linked {
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn ast(&self) -> Option<&Ast> {
        self.ast.as_ref()
    }

    pub fn index(&self) -> &SourceIndex {
        &self.index
    }

    /// Location path of each reference site → the fully-qualified name it
    /// resolved to (without the leading dot).
    pub fn resolved_references(&self) -> &HashMap<Vec<i32>, String> {
        &self.resolved
    }

    /// The option index, when an option interpreter ran on this file.
    pub fn option_index(&self) -> Option<&OptionIndex> {
        self.options.as_ref()
    }

    pub(crate) fn set_option_index(&mut self, options: OptionIndex) {
        self.options = Some(options);
    }

    pub(crate) fn drop_ast(&mut self) {
        self.ast = None;
    }

    /// Wraps a file that arrived from the resolver already linked. Spans come
    /// from whatever source info the descriptor proto carries.
    pub(crate) fn from_file(file: File) -> Self {
        let index = SourceIndex::from_info(
            file.path().clone(),
            file.proto().source_code_info.as_ref(),
        );
        Linked {
            file,
            ast: None,
            index: Arc::new(index),
            resolved: HashMap::new(),
            options: None,
        }
    }
}

/// Everything `link` produces besides the mutated parse result.
#[derive(Debug)]
pub(crate) struct LinkOutput {
    package: String,
    package_span: Span,
    arena: Vec<DescriptorData>,
    by_name: HashMap<String, u32>,
    resolved: HashMap<Vec<i32>, String>,
}

/// Builds the final [`Linked`] once the executor decides to keep the result.
pub(crate) fn assemble(parse: ParseResult, deps: Vec<File>, out: LinkOutput) -> Linked {
    let (proto, ast, index) = parse.into_parts();
    let file = File::from_parts(
        index.file().clone(),
        out.package,
        out.package_span,
        proto,
        deps,
        out.arena,
        out.by_name,
    );
    Linked { file, ast, index, resolved: out.resolved, options: None }
}

/// Links `parse` against its dependencies using `symtab` as the pending
/// symbol table.
///
/// Recoverable diagnostics are routed through `handler` and linking
/// continues; the returned error is the fatal kind that aborts the file
/// (package collisions, dependency miscounts, a short-circuiting reporter).
pub(crate) fn link(
    parse: &mut ParseResult,
    deps: &[File],
    symtab: &SymbolTable,
    handler: &Handler,
) -> Result<LinkOutput> {
    let file = parse.file().clone();
    let index = parse.index_arc();
    let listed = parse.proto().dependency.len();

    // the one allowed off-by-one is an implicitly added descriptor.proto
    if deps.len() != listed && deps.len() != listed + 1 {
        let err = Error::DependencyCount { file, listed, supplied: deps.len() };
        handler.error(err.clone())?;
        return Err(err);
    }

    for (i, dep) in deps.iter().enumerate() {
        if dep.is_placeholder() {
            let span = index.span_or_file(&[loc::FILE_DEPENDENCY, i as i32]);
            handler.error(Error::FailedToResolve {
                path: dep.path().as_unresolved(),
                span: Some(span),
            })?;
        } else {
            symtab.import(dep, handler)?;
        }
    }

    let package = parse.proto().package().to_owned();
    let package_span = index.span_or_file(&[loc::FILE_PACKAGE]);
    let (arena, by_name, by_locpath) = build_hierarchy(parse.proto(), &index, &package);

    symtab.import_parts(
        &file,
        &package,
        package_span.clone(),
        arena.iter().map(|d| (d.fqn.clone(), d.kind.symbol_kind(), d.span.clone())),
        handler,
    )?;

    let mut pass = ResolvePass {
        file,
        symtab,
        handler,
        index: &index,
        resolved: HashMap::new(),
        extendees: HashMap::new(),
    };
    pass.run(parse.proto_mut(), &package)?;

    let ResolvePass { resolved, extendees, .. } = pass;
    let mut arena = arena;
    for (locpath, extendee) in extendees {
        if let Some(&i) = by_locpath.get(&locpath) {
            if let DescriptorKind::Extension { extendee: e, .. } = &mut arena[i as usize].kind {
                *e = extendee;
            }
        }
    }

    Ok(LinkOutput { package, package_span, arena, by_name, resolved })
}

/// Warnings for imports whose symbols are never referenced. Only the first
/// `listed` dependencies are considered; an implicitly added descriptor.proto
/// never warns.
pub(crate) fn unused_imports(linked: &Linked) -> Vec<Error> {
    let proto = linked.file().proto();
    let public: HashSet<usize> =
        proto.public_dependency.iter().map(|&i| i as usize).collect();
    let referenced: HashSet<&str> =
        linked.resolved.values().map(String::as_str).collect();

    let mut warnings = Vec::new();
    for (i, name) in proto.dependency.iter().enumerate() {
        if public.contains(&i) {
            continue;
        }
        let Some(dep) = linked.file().dependencies().get(i) else { continue };
        if dep.is_placeholder() {
            continue;
        }
        let resolver = dep.as_resolver();
        let used = referenced.iter().any(|fqn| resolver.find_descriptor(fqn).is_some());
        if !used {
            warnings.push(Error::UnusedImport {
                path: name.as_str().into(),
                span: linked.index.span(&[loc::FILE_DEPENDENCY, i as i32]),
            });
        }
    }
    warnings
}

fn join(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_owned()
    } else {
        format!("{scope}.{name}")
    }
}

/// Outward scope chain: `a.b.M` → `a.b.M`, `a.b`, `a`, ``.
fn scopes(scope: &str) -> impl Iterator<Item = &str> {
    let mut cur = Some(scope);
    std::iter::from_fn(move || {
        let s = cur?;
        cur = if s.is_empty() { None } else { Some(s.rfind('.').map_or("", |i| &s[..i])) };
        Some(s)
    })
}

fn build_hierarchy(
    proto: &FileDescriptorProto,
    index: &SourceIndex,
    package: &str,
) -> (Vec<DescriptorData>, HashMap<String, u32>, HashMap<Vec<i32>, u32>) {
    let mut builder = Hierarchy { index, arena: Vec::new() };
    for (i, message) in proto.message_type.iter().enumerate() {
        builder.message(message, package, vec![loc::FILE_MESSAGE, i as i32], None);
    }
    for (i, item) in proto.enum_type.iter().enumerate() {
        builder.enumeration(item, package, vec![loc::FILE_ENUM, i as i32], None);
    }
    for (i, service) in proto.service.iter().enumerate() {
        builder.service(service, package, vec![loc::FILE_SERVICE, i as i32]);
    }
    for (i, ext) in proto.extension.iter().enumerate() {
        builder.field(ext, package, vec![loc::FILE_EXTENSION, i as i32], None, true);
    }

    let arena = builder.arena;
    let mut by_name = HashMap::with_capacity(arena.len());
    let mut by_locpath = HashMap::with_capacity(arena.len());
    for (i, data) in arena.iter().enumerate() {
        by_name.entry(data.fqn.clone()).or_insert(i as u32);
        by_locpath.insert(data.locpath.clone(), i as u32);
    }
    (arena, by_name, by_locpath)
}

struct Hierarchy<'a> {
    index: &'a SourceIndex,
    arena: Vec<DescriptorData>,
}

impl Hierarchy<'_> {
    fn push(
        &mut self,
        fqn: String,
        kind: DescriptorKind,
        locpath: Vec<i32>,
        parent: Option<u32>,
    ) -> u32 {
        let span = self.index.span_or_file(&locpath);
        self.arena.push(DescriptorData { fqn, kind, span, parent, locpath });
        (self.arena.len() - 1) as u32
    }

    fn message(
        &mut self,
        message: &DescriptorProto,
        scope: &str,
        locpath: Vec<i32>,
        parent: Option<u32>,
    ) {
        let fqn = join(scope, message.name());
        let me = self.push(fqn.clone(), DescriptorKind::Message, locpath.clone(), parent);
        for (i, field) in message.field.iter().enumerate() {
            let mut at = locpath.clone();
            at.extend([loc::MESSAGE_FIELD, i as i32]);
            self.field(field, &fqn, at, Some(me), false);
        }
        for (i, oneof) in message.oneof_decl.iter().enumerate() {
            let mut at = locpath.clone();
            at.extend([loc::MESSAGE_ONEOF, i as i32]);
            self.push(join(&fqn, oneof.name()), DescriptorKind::Oneof, at, Some(me));
        }
        for (i, nested) in message.nested_type.iter().enumerate() {
            let mut at = locpath.clone();
            at.extend([loc::MESSAGE_NESTED, i as i32]);
            self.message(nested, &fqn, at, Some(me));
        }
        for (i, nested) in message.enum_type.iter().enumerate() {
            let mut at = locpath.clone();
            at.extend([loc::MESSAGE_ENUM, i as i32]);
            self.enumeration(nested, &fqn, at, Some(me));
        }
        for (i, ext) in message.extension.iter().enumerate() {
            let mut at = locpath.clone();
            at.extend([loc::MESSAGE_EXTENSION, i as i32]);
            self.field(ext, &fqn, at, Some(me), true);
        }
    }

    fn enumeration(
        &mut self,
        item: &EnumDescriptorProto,
        scope: &str,
        locpath: Vec<i32>,
        parent: Option<u32>,
    ) {
        let me =
            self.push(join(scope, item.name()), DescriptorKind::Enum, locpath.clone(), parent);
        for (i, value) in item.value.iter().enumerate() {
            let mut at = locpath.clone();
            at.extend([loc::ENUM_VALUE, i as i32]);
            // enum values scope C++-style: they are siblings of their type
            self.push(
                join(scope, value.name()),
                DescriptorKind::EnumValue { number: value.number() },
                at,
                Some(me),
            );
        }
    }

    fn service(&mut self, service: &ServiceDescriptorProto, scope: &str, locpath: Vec<i32>) {
        let fqn = join(scope, service.name());
        let me = self.push(fqn.clone(), DescriptorKind::Service, locpath.clone(), None);
        for (i, method) in service.method.iter().enumerate() {
            let mut at = locpath.clone();
            at.extend([loc::SERVICE_METHOD, i as i32]);
            self.push(join(&fqn, method.name()), DescriptorKind::Method, at, Some(me));
        }
    }

    fn field(
        &mut self,
        field: &FieldDescriptorProto,
        scope: &str,
        locpath: Vec<i32>,
        parent: Option<u32>,
        extension: bool,
    ) {
        let fqn = join(scope, field.name());
        let kind = if extension {
            DescriptorKind::Extension {
                extendee: field.extendee().trim_start_matches('.').to_owned(),
                number: field.number(),
            }
        } else {
            DescriptorKind::Field { number: field.number() }
        };
        self.push(fqn, kind, locpath, parent);
    }
}

struct ResolvePass<'a> {
    file: ResolvedPath,
    symtab: &'a SymbolTable,
    handler: &'a Handler,
    index: &'a SourceIndex,
    resolved: HashMap<Vec<i32>, String>,
    /// Location path of each extension node → resolved extendee fqn, for
    /// patching the arena afterwards.
    extendees: HashMap<Vec<i32>, String>,
}

impl ResolvePass<'_> {
    fn run(&mut self, proto: &mut FileDescriptorProto, package: &str) -> Result<()> {
        for (i, message) in proto.message_type.iter_mut().enumerate() {
            self.message(message, package, vec![loc::FILE_MESSAGE, i as i32])?;
        }
        for (i, service) in proto.service.iter_mut().enumerate() {
            self.service(service, package, vec![loc::FILE_SERVICE, i as i32])?;
        }
        for (i, ext) in proto.extension.iter_mut().enumerate() {
            self.field(ext, package, vec![loc::FILE_EXTENSION, i as i32], true)?;
        }
        Ok(())
    }

    fn message(
        &mut self,
        message: &mut DescriptorProto,
        scope: &str,
        locpath: Vec<i32>,
    ) -> Result<()> {
        let fqn = join(scope, message.name());
        for (i, field) in message.field.iter_mut().enumerate() {
            let mut at = locpath.clone();
            at.extend([loc::MESSAGE_FIELD, i as i32]);
            self.field(field, &fqn, at, false)?;
        }
        for (i, nested) in message.nested_type.iter_mut().enumerate() {
            let mut at = locpath.clone();
            at.extend([loc::MESSAGE_NESTED, i as i32]);
            self.message(nested, &fqn, at)?;
        }
        for (i, ext) in message.extension.iter_mut().enumerate() {
            let mut at = locpath.clone();
            at.extend([loc::MESSAGE_EXTENSION, i as i32]);
            self.field(ext, &fqn, at, true)?;
        }
        Ok(())
    }

    fn service(
        &mut self,
        service: &mut ServiceDescriptorProto,
        package: &str,
        locpath: Vec<i32>,
    ) -> Result<()> {
        let scope = join(package, service.name());
        for (i, method) in service.method.iter_mut().enumerate() {
            let mut at = locpath.clone();
            at.extend([loc::SERVICE_METHOD, i as i32]);

            for (child, slot) in [
                (METHOD_INPUT_TYPE, &mut method.input_type),
                (METHOD_OUTPUT_TYPE, &mut method.output_type),
            ] {
                let Some(name) = slot.clone().filter(|n| !n.is_empty()) else { continue };
                let mut site = at.clone();
                site.push(child);
                match self.resolve(&scope, &name, &site)? {
                    Some((fqn, entry)) => {
                        if entry.kind != SymbolKind::Message {
                            self.report_invalid(&name, "a message type", &site)?;
                            continue;
                        }
                        *slot = Some(format!(".{fqn}"));
                        self.resolved.insert(site, fqn);
                    }
                    None => continue,
                }
            }
        }
        Ok(())
    }

    fn field(
        &mut self,
        field: &mut FieldDescriptorProto,
        scope: &str,
        locpath: Vec<i32>,
        extension: bool,
    ) -> Result<()> {
        if extension {
            if let Some(extendee) = field.extendee.clone().filter(|e| !e.is_empty()) {
                let mut site = locpath.clone();
                site.push(FIELD_EXTENDEE);
                if let Some((fqn, entry)) = self.resolve(scope, &extendee, &site)? {
                    if entry.kind != SymbolKind::Message {
                        self.report_invalid(&extendee, "a message type", &site)?;
                    } else {
                        field.extendee = Some(format!(".{fqn}"));
                        // register under the extension node's own span, the
                        // same one the arena records
                        let span = self.index.span_or_file(&locpath);
                        self.symtab.add_extension(
                            &self.symtab.package_of(&fqn),
                            &fqn,
                            field.number(),
                            span,
                            self.handler,
                        )?;
                        self.extendees.insert(locpath.clone(), fqn.clone());
                        self.resolved.insert(site, fqn);
                    }
                }
            }
        }

        let Some(name) = field.type_name.clone().filter(|n| !n.is_empty()) else {
            return Ok(());
        };
        // groups keep their type untouched; everything else gets MESSAGE or
        // ENUM assigned from what the name resolves to
        if field.r#type == Some(Type::Group as i32) {
            return Ok(());
        }
        let mut site = locpath.clone();
        site.push(FIELD_TYPE_NAME);
        if let Some((fqn, entry)) = self.resolve(scope, &name, &site)? {
            match entry.kind {
                SymbolKind::Message => {
                    field.r#type = Some(Type::Message as i32);
                }
                SymbolKind::Enum => {
                    field.r#type = Some(Type::Enum as i32);
                }
                _ => {
                    self.report_invalid(&name, "a type", &site)?;
                    return Ok(());
                }
            }
            field.type_name = Some(format!(".{fqn}"));
            self.resolved.insert(site, fqn);
        }
        Ok(())
    }

    /// Searches enclosing scopes outward for `name`. Reports an undeclared
    /// name through the handler and returns `Ok(None)` on a miss, so the pass
    /// keeps sweeping.
    fn resolve(
        &self,
        scope: &str,
        name: &str,
        site: &[i32],
    ) -> Result<Option<(String, SymbolEntry)>> {
        if let Some(absolute) = name.strip_prefix('.') {
            if let Some(entry) = self.symtab.lookup(absolute) {
                return Ok(Some((absolute.to_owned(), entry)));
            }
            self.report_undeclared(name, None, site)?;
            return Ok(None);
        }

        let mut hint = None;
        for enclosing in scopes(scope) {
            let candidate = join(enclosing, name);
            if let Some(entry) = self.symtab.lookup(&candidate) {
                return Ok(Some((candidate, entry)));
            }
            hint.get_or_insert(candidate);
        }
        self.report_undeclared(name, hint, site)?;
        Ok(None)
    }

    fn report_undeclared(&self, name: &str, hint: Option<String>, site: &[i32]) -> Result<()> {
        self.handler.error(Error::UndeclaredName {
            name: name.to_owned(),
            hint,
            file: self.file.clone(),
            span: self.index.span(site),
        })
    }

    fn report_invalid(&self, name: &str, expected: &'static str, site: &[i32]) -> Result<()> {
        self.handler.error(Error::InvalidType {
            name: name.to_owned(),
            expected,
            file: self.file.clone(),
            span: self.index.span(site),
        })
    }
}
