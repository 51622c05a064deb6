//! The compilation executor.
//!
//! The executor owns one [`Slot`] per resolved path, the memo that
//! guarantees at most one in-flight task per file, and drives each task
//! through resolve → parse → dependency fan-out → link. Tasks run on a
//! bounded worker pool; the only suspension points are acquiring a permit,
//! waiting on a dependency (which includes waiting on block-resolution
//! signals during cycle detection), and cancellation.
//!
//! Two details carry the deadlock-freedom story:
//!
//! - a task *releases its permit* before waiting on dependencies and
//!   reacquires it afterwards, so a cycle of N mutually dependent files
//!   cannot exhaust a pool smaller than N;
//! - a task records *all* of its dependency blocks, closes each block's
//!   resolved signal as soon as the resolver returns (well before the
//!   dependency finishes compiling), and only then spawns the dependency
//!   tasks. A dependency that walks the importer's blocks therefore always
//!   sees the complete list, which is what makes cycle detection reliable.
//!
//! Symbol-table commits are transactional: each link step clones the live
//! table, links against the clone under a dedicated mutex, and swaps it in
//! only on success.

use crate::{
    error::{Error, ResolveError, Result},
    file::{File, Files},
    hooks::Hooks,
    link::{self, Linked},
    options::OptionInterpreter,
    parse::{filter_source_info, loc, ParseResult, Parser, SourceInfoMode},
    path::{ResolvedPath, UnresolvedPath},
    report::{Handler, Reporter},
    resolver::{Resolver, SearchResult, SearchSource},
    symbols::SymbolTable,
};
use futures::{future::BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// The well-known descriptor path that, when the resolver overrides it,
/// becomes an implicit dependency of every compiled file.
pub(crate) const DESCRIPTOR_PROTO: &str = "google/protobuf/descriptor.proto";

/// Terminal state of one file's compilation.
#[derive(Debug)]
pub enum Outcome {
    /// Fully linked and committed to the symbol table.
    Linked(Linked),
    /// Linked structurally, but with errors; nothing was committed.
    Partial { linked: Linked, error: Error },
    /// Parsed, but linking failed or never ran (e.g. an import cycle).
    Parsed { parse: ParseResult, error: Error },
    /// Nothing usable was produced.
    Failed(Error),
}

impl Outcome {
    /// The error carried by a non-linked outcome.
    pub fn error(&self) -> Option<&Error> {
        match self {
            Outcome::Linked(_) => None,
            Outcome::Partial { error, .. }
            | Outcome::Parsed { error, .. }
            | Outcome::Failed(error) => Some(error),
        }
    }

    /// The linked result, for fully or partially linked outcomes.
    pub fn linked(&self) -> Option<&Linked> {
        match self {
            Outcome::Linked(linked) | Outcome::Partial { linked, .. } => Some(linked),
            _ => None,
        }
    }

    pub fn is_linked(&self) -> bool {
        matches!(self, Outcome::Linked(_))
    }
}

/// What [`Compiler::compile`](crate::Compiler::compile) returns.
#[derive(Debug, Default)]
pub struct CompileOutput {
    /// Fully linked files, in request order. With
    /// `include_dependencies_in_results` the reflexive transitive closure
    /// follows the requested files.
    pub files: Files,
    /// Files that linked structurally but carry errors.
    pub partial: Vec<Linked>,
    /// Files that parsed but never linked.
    pub unlinked: Vec<ParseResult>,
    /// The first error across all requested files, in request order.
    pub first_error: Option<Error>,
}

impl CompileOutput {
    pub fn is_success(&self) -> bool {
        self.first_error.is_none()
    }

    /// Panics with the first error if compilation failed.
    #[track_caller]
    pub fn assert_success(&self) {
        if let Some(err) = &self.first_error {
            panic!("compilation failed: {err}");
        }
    }
}

/// A dependency wait recorded on a slot. The resolved signal closes as soon
/// as the import's resolved path is known, well before the dependency
/// finishes compiling; cycle detection relies on that ordering.
struct Block {
    imported_as: UnresolvedPath,
    resolved: watch::Sender<Option<ResolvedPath>>,
}

impl Block {
    fn new(imported_as: UnresolvedPath) -> Arc<Self> {
        let (resolved, _) = watch::channel(None);
        Arc::new(Self { imported_as, resolved })
    }
}

#[derive(Default)]
struct SlotState {
    outcome: Option<Arc<Outcome>>,
    blocks: Vec<Arc<Block>>,
}

/// Per-resolved-path compilation record: the readiness latch, the terminal
/// outcome, and the dependency blocks the task is waiting on.
struct Slot {
    path: ResolvedPath,
    explicit: AtomicBool,
    done: watch::Sender<bool>,
    blocks_ready: watch::Sender<bool>,
    state: Mutex<SlotState>,
}

impl Slot {
    fn new(path: ResolvedPath, explicit: bool) -> Arc<Self> {
        let (done, _) = watch::channel(false);
        let (blocks_ready, _) = watch::channel(false);
        Arc::new(Self {
            path,
            explicit: AtomicBool::new(explicit),
            done,
            blocks_ready,
            state: Mutex::new(SlotState::default()),
        })
    }

    /// Awaits the slot's terminal state; `None` on cancellation.
    async fn wait(&self, cancel: &CancellationToken) -> Option<Arc<Outcome>> {
        let mut rx = self.done.subscribe();
        let finished = tokio::select! {
            res = rx.wait_for(|done| *done) => res.is_ok(),
            _ = cancel.cancelled() => false,
        };
        if !finished {
            return None;
        }
        self.state.lock().outcome.clone()
    }

    /// Transitions the slot to its terminal state. Called exactly once per
    /// task; both latches close on every exit path so walkers never hang.
    fn finish(&self, outcome: Arc<Outcome>) {
        self.state.lock().outcome = Some(outcome);
        self.blocks_ready.send_replace(true);
        self.done.send_replace(true);
    }
}

pub(crate) struct ExecutorOptions {
    pub max_parallelism: usize,
    pub source_info_mode: SourceInfoMode,
    pub retain_asts: bool,
    pub include_dependencies: bool,
    pub interpreter: Option<Arc<dyn OptionInterpreter>>,
}

pub(crate) struct Executor {
    resolver: Arc<dyn Resolver>,
    parser: Arc<dyn Parser>,
    reporter: Arc<dyn Reporter>,
    hooks: Hooks,
    opts: ExecutorOptions,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    slots: Mutex<HashMap<ResolvedPath, Arc<Slot>>>,
    /// The live symbol table; swapped wholesale when a link commits.
    symtab: RwLock<Arc<SymbolTable>>,
    /// Serializes every clone → link → commit transaction.
    link_lock: tokio::sync::Mutex<()>,
    /// Files named by cross-file collisions, force-recompiled next round.
    entangled: Mutex<HashSet<ResolvedPath>>,
    /// Whether the resolver overrides `google/protobuf/descriptor.proto`;
    /// probed lazily, reset when that path is invalidated.
    descriptor_override: Mutex<Option<bool>>,
}

impl Executor {
    pub(crate) fn new(
        resolver: Arc<dyn Resolver>,
        parser: Arc<dyn Parser>,
        reporter: Arc<dyn Reporter>,
        hooks: Hooks,
        opts: ExecutorOptions,
    ) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(opts.max_parallelism.max(1)));
        Arc::new(Self {
            resolver,
            parser,
            reporter,
            hooks,
            opts,
            permits,
            cancel: CancellationToken::new(),
            slots: Mutex::new(HashMap::new()),
            symtab: RwLock::new(Arc::new(SymbolTable::new())),
            link_lock: tokio::sync::Mutex::new(()),
            entangled: Mutex::new(HashSet::new()),
            descriptor_override: Mutex::new(None),
        })
    }

    /// Cancels all in-flight and future work on this executor.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The live symbol table.
    pub(crate) fn symbol_table(&self) -> Arc<SymbolTable> {
        self.symtab.read().clone()
    }

    pub(crate) async fn compile(
        self: &Arc<Self>,
        paths: Vec<UnresolvedPath>,
    ) -> Result<CompileOutput> {
        // collision-entangled files from earlier rounds join the round trip
        let entangled: Vec<ResolvedPath> = self.entangled.lock().drain().collect();

        // resolve every requested path up front; the probe doubles as the
        // `will_recompile` answer during invalidation and as the search
        // result the spawned task starts from
        let probes: Vec<(ResolvedPath, std::result::Result<SearchResult, ResolveError>)> =
            paths.iter().map(|path| self.probe(path)).collect();

        let mut roots: Vec<ResolvedPath> = probes.iter().map(|(key, _)| key.clone()).collect();
        roots.extend(entangled.iter().cloned());
        let known: HashMap<ResolvedPath, bool> =
            probes.iter().map(|(key, res)| (key.clone(), res.is_ok())).collect();
        self.invalidate(&roots, &known).await;

        // respawn entangled files that were not themselves requested, so both
        // sides of a cross-file collision re-report
        let respawned: Vec<Arc<Slot>> = entangled
            .iter()
            .filter(|path| !known.contains_key(*path))
            .filter_map(|path| {
                let (key, search) = self.probe(&path.as_unresolved());
                search
                    .is_ok()
                    .then(|| self.get_or_spawn(key, search, false, path.as_unresolved()))
            })
            .collect();

        enum Request {
            Slot(Arc<Slot>),
            Failed(Error),
        }

        let requests: Vec<Request> = paths
            .iter()
            .zip(probes)
            .map(|(path, (key, search))| match search {
                Err(ResolveError::NotFound) => {
                    Request::Failed(Error::FailedToResolve { path: path.clone(), span: None })
                }
                Err(ResolveError::Error(err @ Error::Panic { .. })) => Request::Failed(err),
                Err(ResolveError::Error(err)) => {
                    Request::Failed(Error::resolver(path.clone(), err))
                }
                Ok(search) => {
                    Request::Slot(self.get_or_spawn(key, Ok(search), true, path.clone()))
                }
            })
            .collect();

        let mut outcomes: Vec<Arc<Outcome>> = Vec::with_capacity(requests.len());
        for request in requests {
            let outcome = match request {
                Request::Failed(err) => Arc::new(Outcome::Failed(err)),
                Request::Slot(slot) => {
                    slot.wait(&self.cancel).await.ok_or(Error::Cancelled)?
                }
            };
            outcomes.push(outcome);
        }

        let mut out = CompileOutput::default();
        for outcome in &outcomes {
            match &**outcome {
                Outcome::Linked(linked) => out.files.push(linked.file().clone()),
                Outcome::Partial { linked, .. } => out.partial.push(linked.clone()),
                Outcome::Parsed { parse, .. } => out.unlinked.push(parse.clone()),
                Outcome::Failed(_) => {}
            }
            if out.first_error.is_none() {
                out.first_error = outcome.error().cloned();
            }
        }

        // entangled respawns settle before the call returns, but stay out of
        // the requested output set
        for slot in respawned {
            let _ = slot.wait(&self.cancel).await;
        }

        if self.opts.include_dependencies {
            let mut queue: VecDeque<File> = out.files.iter().cloned().collect();
            while let Some(file) = queue.pop_front() {
                for dep in file.dependencies() {
                    if !dep.is_placeholder()
                        && out.files.find_file_by_path(dep.path().as_str()).is_none()
                    {
                        out.files.push(dep.clone());
                        queue.push_back(dep.clone());
                    }
                }
            }
        }

        Ok(out)
    }

    /// Removes the given paths and everything that depends on them.
    ///
    /// `known` carries resolver-probe answers already taken this round;
    /// anything else is probed on demand for the `will_recompile` flag.
    pub(crate) async fn invalidate(
        &self,
        roots: &[ResolvedPath],
        known: &HashMap<ResolvedPath, bool>,
    ) {
        // cause-first order: a file is invalidated before its dependents
        let order: Vec<Arc<Slot>> = {
            let slots = self.slots.lock();
            let mut reverse: HashMap<ResolvedPath, Vec<ResolvedPath>> = HashMap::new();
            for (path, slot) in slots.iter() {
                for block in &slot.state.lock().blocks {
                    if let Some(dep) = block.resolved.borrow().clone() {
                        reverse.entry(dep).or_default().push(path.clone());
                    }
                }
            }
            let mut seen = HashSet::new();
            let mut order = Vec::new();
            let mut queue: VecDeque<ResolvedPath> = roots.iter().cloned().collect();
            while let Some(path) = queue.pop_front() {
                if !seen.insert(path.clone()) {
                    continue;
                }
                if let Some(slot) = slots.get(&path) {
                    order.push(Arc::clone(slot));
                }
                if let Some(dependents) = reverse.get(&path) {
                    queue.extend(dependents.iter().cloned());
                }
            }
            order
        };

        for slot in &order {
            self.hooks.pre_invalidate(&slot.path);
            trace!(path = %slot.path, "invalidating");
            self.slots.lock().remove(&slot.path);
            let outcome = slot.state.lock().outcome.clone();
            if let Some(outcome) = &outcome {
                if let Outcome::Linked(linked) = &**outcome {
                    let _guard = self.link_lock.lock().await;
                    self.symbol_table().delete(linked.file());
                }
            }
            if slot.path == DESCRIPTOR_PROTO {
                *self.descriptor_override.lock() = None;
            }
        }

        // post hooks only after the whole cascade settled
        for slot in &order {
            let will_recompile = match known.get(&slot.path) {
                Some(flag) => *flag,
                None => self
                    .resolver
                    .find_file_by_path(&slot.path.as_unresolved(), None)
                    .is_ok(),
            };
            let previous = slot.state.lock().outcome.clone();
            self.hooks.post_invalidate(&slot.path, previous.as_deref(), will_recompile);
        }
    }

    fn probe(
        &self,
        path: &UnresolvedPath,
    ) -> (ResolvedPath, std::result::Result<SearchResult, ResolveError>) {
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.resolver.find_file_by_path(path, None)
        }))
        .unwrap_or_else(|panic| {
            Err(ResolveError::Error(Error::Panic {
                file: path.assume_resolved(),
                message: panic_message(panic),
            }))
        });
        let key = match &result {
            Ok(search) => search.resolved.clone(),
            Err(_) => path.assume_resolved(),
        };
        (key, result)
    }

    fn resolve_import(
        &self,
        import: &UnresolvedPath,
        context: &ParseResult,
    ) -> (ResolvedPath, std::result::Result<SearchResult, ResolveError>) {
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.resolver.find_file_by_path(import, Some(context))
        }))
        .unwrap_or_else(|panic| {
            Err(ResolveError::Error(Error::Panic {
                file: import.assume_resolved(),
                message: panic_message(panic),
            }))
        });
        let key = match &result {
            Ok(search) => search.resolved.clone(),
            Err(_) => import.assume_resolved(),
        };
        (key, result)
    }

    fn get_or_spawn(
        self: &Arc<Self>,
        key: ResolvedPath,
        search: std::result::Result<SearchResult, ResolveError>,
        explicit: bool,
        origin: UnresolvedPath,
    ) -> Arc<Slot> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(&key) {
            if explicit {
                slot.explicit.store(true, Ordering::Relaxed);
            }
            return Arc::clone(slot);
        }
        let slot = Slot::new(key.clone(), explicit);
        slots.insert(key, Arc::clone(&slot));
        drop(slots);

        trace!(path = %slot.path, "spawning compilation task");
        let executor = Arc::clone(self);
        let task_slot = Arc::clone(&slot);
        tokio::spawn(async move { executor.run_task(task_slot, search, origin).await });
        slot
    }

    async fn run_task(
        self: Arc<Self>,
        slot: Arc<Slot>,
        search: std::result::Result<SearchResult, ResolveError>,
        origin: UnresolvedPath,
    ) {
        let outcome =
            match AssertUnwindSafe(self.task_body(&slot, search, origin)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => Outcome::Failed(Error::Panic {
                    file: slot.path.clone(),
                    message: panic_message(panic),
                }),
            };
        if let Some(err) = outcome.error() {
            trace!(path = %slot.path, %err, "task finished with error");
        } else {
            trace!(path = %slot.path, "task finished");
        }
        let outcome = Arc::new(outcome);
        slot.finish(Arc::clone(&outcome));
        self.hooks.post_compile(&slot.path, &outcome);
    }

    async fn task_body(
        self: &Arc<Self>,
        slot: &Arc<Slot>,
        search: std::result::Result<SearchResult, ResolveError>,
        origin: UnresolvedPath,
    ) -> Outcome {
        let permit = match self.acquire_permit().await {
            Some(permit) => permit,
            None => return Outcome::Failed(Error::Cancelled),
        };
        self.hooks.pre_compile(&slot.path);

        let handler = Handler::new(Arc::clone(&self.reporter));

        let search = match search {
            Ok(search) => search,
            Err(ResolveError::NotFound) => {
                return Outcome::Failed(Error::FailedToResolve { path: origin, span: None })
            }
            Err(ResolveError::Error(err @ Error::Panic { .. })) => {
                return Outcome::Failed(err)
            }
            Err(ResolveError::Error(err)) => {
                return Outcome::Failed(Error::resolver(origin, err))
            }
        };

        // derive a parse result from whatever stage the resolver produced;
        // an already-linked file short-circuits the whole pipeline
        let mut parse = match search.source {
            SearchSource::Linked(file) => {
                if *file.path() != slot.path {
                    return Outcome::Failed(Error::PathMismatch {
                        requested: slot.path.clone(),
                        embedded: file.path().as_str().to_owned(),
                    });
                }
                return self.commit_prelinked(file, &handler).await;
            }
            SearchSource::Source(text) => {
                let ast = match self.parser.parse(&slot.path, &text, &handler) {
                    Ok(ast) => ast,
                    Err(err) => return Outcome::Failed(err),
                };
                match self.parser.result_from_ast(ast, true, &handler) {
                    Ok(parse) => parse,
                    Err(err) => return Outcome::Failed(err),
                }
            }
            SearchSource::Ast(ast) => {
                if *ast.name() != slot.path {
                    return Outcome::Failed(Error::PathMismatch {
                        requested: slot.path.clone(),
                        embedded: ast.name().as_str().to_owned(),
                    });
                }
                match self.parser.result_from_ast(ast, true, &handler) {
                    Ok(parse) => parse,
                    Err(err) => return Outcome::Failed(err),
                }
            }
            SearchSource::Proto(mut proto) => {
                match proto.name.as_deref() {
                    None | Some("") => proto.name = Some(slot.path.as_str().to_owned()),
                    Some(name) if name != slot.path.as_str() => {
                        return Outcome::Failed(Error::PathMismatch {
                            requested: slot.path.clone(),
                            embedded: name.to_owned(),
                        })
                    }
                    Some(_) => {}
                }
                self.parser.result_without_ast(proto)
            }
        };

        // implicit descriptor.proto dependency when the resolver overrides it
        let mut imports: Vec<UnresolvedPath> =
            parse.proto().dependency.iter().map(UnresolvedPath::from).collect();
        let listed = imports.len();
        let implicit = self.wants_implicit_descriptor(&slot.path, &imports);
        if implicit {
            imports.push(UnresolvedPath::from(DESCRIPTOR_PROTO));
        }

        // record every block first, then resolve (closing each signal), and
        // only then spawn dependency tasks; see the module docs for why this
        // ordering is load-bearing
        let blocks: Vec<Arc<Block>> = imports.iter().map(|i| Block::new(i.clone())).collect();
        slot.state.lock().blocks.extend(blocks.iter().cloned());

        let mut resolutions = Vec::with_capacity(imports.len());
        for (import, block) in imports.iter().zip(&blocks) {
            let (key, search) = self.resolve_import(import, &parse);
            block.resolved.send_replace(Some(key.clone()));
            resolutions.push((key, search));
        }
        slot.blocks_ready.send_replace(true);

        let dep_slots: Vec<Arc<Slot>> = imports
            .iter()
            .zip(resolutions)
            .map(|(import, (key, search))| self.get_or_spawn(key, search, false, import.clone()))
            .collect();

        // dependency waits happen without a permit
        drop(permit);

        // trivial cycle: a file that imports itself
        for (i, dep) in dep_slots.iter().enumerate() {
            if dep.path == slot.path {
                let err = Error::ImportCycle {
                    chain: vec![slot.path.clone(), slot.path.clone()],
                    span: parse.index().span(&[loc::FILE_DEPENDENCY, i as i32]),
                };
                let _ = handler.error(err.clone());
                return Outcome::Parsed { parse, error: err };
            }
        }

        for (i, dep) in dep_slots.iter().enumerate() {
            let mut stack = vec![slot.path.clone(), dep.path.clone()];
            let mut visited: HashSet<ResolvedPath> = stack.iter().cloned().collect();
            if let Some(chain) = self.find_cycle(dep, &mut stack, &mut visited).await {
                let err = Error::ImportCycle {
                    chain,
                    span: parse.index().span(&[loc::FILE_DEPENDENCY, i as i32]),
                };
                let _ = handler.error(err.clone());
                return Outcome::Parsed { parse, error: err };
            }
        }

        // wait for every dependency to reach its terminal state
        let mut dep_files: Vec<File> = Vec::with_capacity(dep_slots.len());
        let mut implicit_file: Option<File> = None;
        for (i, dep) in dep_slots.iter().enumerate() {
            let outcome = match dep.wait(&self.cancel).await {
                Some(outcome) => outcome,
                None => return Outcome::Failed(Error::Cancelled),
            };
            let is_implicit = implicit && i == listed;
            let dep_file = match &*outcome {
                Outcome::Linked(linked) => Some(linked.file().clone()),
                // a partial link still carries a usable file; linking against
                // it surfaces more errors than a placeholder would
                Outcome::Partial { linked, .. } => Some(linked.file().clone()),
                Outcome::Parsed { error, .. } | Outcome::Failed(error) => {
                    if let Error::ImportCycle { chain, .. } = error {
                        if !is_implicit && chain.contains(&slot.path) {
                            // the cycle was already reported by the file that
                            // closed it; adopt it from our own perspective
                            let err = Error::ImportCycle {
                                chain: rotate_chain(chain, &slot.path),
                                span: parse.index().span(&[loc::FILE_DEPENDENCY, i as i32]),
                            };
                            return Outcome::Parsed { parse, error: err };
                        }
                    }
                    // unresolvable imports become placeholders and are
                    // reported by the linker against the import statement;
                    // invalid sources also fall through so the link step can
                    // still report structural errors
                    None
                }
            };
            match dep_file {
                Some(file) if is_implicit => implicit_file = Some(file),
                Some(file) => dep_files.push(file),
                // an implicit descriptor.proto failure is ignored wholesale
                None if is_implicit => {}
                None => dep_files.push(File::placeholder(dep.path.clone())),
            }
        }
        if let Some(file) = implicit_file {
            dep_files.push(file);
        }

        // reacquire the permit for the CPU-bound link, then run one
        // serialized clone → link → commit transaction
        let _permit = match self.acquire_permit().await {
            Some(permit) => permit,
            None => return Outcome::Failed(Error::Cancelled),
        };

        let guard = self.link_lock.lock().await;
        let pending = (*self.symbol_table()).clone();
        trace!(path = %slot.path, deps = dep_files.len(), "linking");
        match link::link(&mut parse, &dep_files, &pending, &handler) {
            Err(error) => {
                drop(guard);
                self.remember_entangled(&slot.path, &handler);
                Outcome::Parsed { parse, error }
            }
            Ok(output) => {
                if !self.opts.source_info_mode.is_empty() {
                    if let (Some(ast), true) =
                        (parse.ast(), parse.proto().source_code_info.is_none())
                    {
                        if let Some(info) = ast.source_info() {
                            let filtered = filter_source_info(info, self.opts.source_info_mode);
                            parse.proto_mut().source_code_info = Some(filtered);
                        }
                    }
                }
                if !self.opts.retain_asts {
                    parse.drop_ast();
                }
                let mut linked = link::assemble(parse, dep_files, output);
                if let Some(interpreter) = &self.opts.interpreter {
                    match interpreter.interpret_options(&linked, &handler) {
                        Ok(index) => linked.set_option_index(index),
                        Err(err) => {
                            let _ = handler.error(err);
                        }
                    }
                }
                let errors = handler.error_count();
                if errors == 0 {
                    *self.symtab.write() = Arc::new(pending);
                    drop(guard);
                    trace!(path = %slot.path, "linked and committed");
                    if slot.explicit.load(Ordering::Relaxed) {
                        for warning in link::unused_imports(&linked) {
                            handler.warn(warning);
                        }
                    }
                    Outcome::Linked(linked)
                } else {
                    // the pending table is discarded untouched
                    drop(guard);
                    self.remember_entangled(&slot.path, &handler);
                    let error = handler
                        .first_error()
                        .unwrap_or_else(|| Error::msg("link failed"));
                    Outcome::Partial { linked, error }
                }
            }
        }
    }

    /// Registers a resolver-provided, already-linked file in the symbol
    /// table through the same transactional path a fresh link takes.
    async fn commit_prelinked(&self, file: File, handler: &Handler) -> Outcome {
        let _guard = self.link_lock.lock().await;
        let pending = (*self.symbol_table()).clone();
        if let Err(error) = pending.import(&file, handler) {
            return Outcome::Failed(error);
        }
        *self.symtab.write() = Arc::new(pending);
        Outcome::Linked(Linked::from_file(file))
    }

    fn remember_entangled(&self, own: &ResolvedPath, handler: &Handler) {
        for path in handler.take_entangled() {
            if path != *own {
                self.entangled.lock().insert(path);
            }
        }
    }

    fn wants_implicit_descriptor(&self, path: &ResolvedPath, imports: &[UnresolvedPath]) -> bool {
        if *path == DESCRIPTOR_PROTO {
            return false;
        }
        if imports.iter().any(|import| *import == DESCRIPTOR_PROTO) {
            return false;
        }
        let mut cached = self.descriptor_override.lock();
        *cached.get_or_insert_with(|| {
            let probe = UnresolvedPath::from(DESCRIPTOR_PROTO);
            std::panic::catch_unwind(AssertUnwindSafe(|| {
                self.resolver.find_file_by_path(&probe, None).is_ok()
            }))
            .unwrap_or(false)
        })
    }

    /// Walks a dependency's recorded blocks looking for a path already on the
    /// stack. Waits on each block's resolved signal (or cancellation), never
    /// on compilation itself.
    fn find_cycle<'a>(
        &'a self,
        slot: &'a Arc<Slot>,
        stack: &'a mut Vec<ResolvedPath>,
        visited: &'a mut HashSet<ResolvedPath>,
    ) -> BoxFuture<'a, Option<Vec<ResolvedPath>>> {
        async move {
            let mut ready = slot.blocks_ready.subscribe();
            let recorded = tokio::select! {
                res = ready.wait_for(|ready| *ready) => res.is_ok(),
                _ = self.cancel.cancelled() => false,
            };
            if !recorded {
                return None;
            }

            let blocks: Vec<Arc<Block>> = slot.state.lock().blocks.clone();
            for block in blocks {
                let mut rx = block.resolved.subscribe();
                let path = tokio::select! {
                    res = rx.wait_for(|resolved| resolved.is_some()) => match res {
                        Ok(guard) => match guard.as_ref() {
                            Some(path) => path.clone(),
                            None => continue,
                        },
                        Err(_) => continue,
                    },
                    _ = self.cancel.cancelled() => return None,
                };
                if stack.contains(&path) {
                    let mut chain = stack.clone();
                    chain.push(path);
                    trace!(importer = %block.imported_as, "import cycle detected");
                    return Some(chain);
                }
                if visited.insert(path.clone()) {
                    let next = self.slots.lock().get(&path).cloned();
                    if let Some(next) = next {
                        stack.push(path);
                        if let Some(chain) = self.find_cycle(&next, stack, visited).await {
                            return Some(chain);
                        }
                        stack.pop();
                    }
                }
            }
            None
        }
        .boxed()
    }

    async fn acquire_permit(&self) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
            _ = self.cancel.cancelled() => None,
        }
    }
}

/// Rebuilds a cycle chain to start (and end) at `to`.
fn rotate_chain(chain: &[ResolvedPath], to: &ResolvedPath) -> Vec<ResolvedPath> {
    let base = &chain[..chain.len().saturating_sub(1)];
    match base.iter().position(|path| path == to) {
        Some(at) => {
            let mut rotated: Vec<ResolvedPath> =
                base[at..].iter().chain(base[..at].iter()).cloned().collect();
            rotated.push(to.clone());
            rotated
        }
        None => chain.to_vec(),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic of unknown type".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chains_rotate_to_the_observer() {
        let chain: Vec<ResolvedPath> =
            vec!["z.proto".into(), "x.proto".into(), "y.proto".into(), "z.proto".into()];
        let rotated = rotate_chain(&chain, &"y.proto".into());
        let as_strs: Vec<&str> = rotated.iter().map(|p| p.as_str()).collect();
        assert_eq!(as_strs, vec!["y.proto", "z.proto", "x.proto", "y.proto"]);

        // a path outside the chain leaves it untouched
        let untouched = rotate_chain(&chain, &"w.proto".into());
        assert_eq!(untouched, chain);
    }

    #[test]
    fn panic_payloads_render() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("kapow"))), "kapow");
        assert_eq!(panic_message(Box::new(17_u32)), "panic of unknown type");
    }
}
