#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{Error, ResolveError, Result};

mod path;
pub use path::{ResolvedPath, UnresolvedPath};

mod span;
pub use span::{LineCol, Span};

pub mod report;
pub use report::{CollectingReporter, Handler, Reporter, TracingReporter};

pub mod resolver;
pub use resolver::{
    ChainResolver, IncludeResolver, MemoryResolver, Resolver, SearchResult, SearchSource,
};

pub mod parse;
pub use parse::{Ast, ParseResult, Parser, ProtoxParser, SourceIndex, SourceInfoMode};

pub mod symbols;
pub use symbols::{Snapshot, SymbolEntry, SymbolKind, SymbolTable};

mod file;
pub use file::{Descriptor, DescriptorKind, File, FileResolver, Files};

mod link;
pub use link::Linked;

pub mod options;
pub use options::{OptionIndex, OptionInterpreter};

mod executor;
pub use executor::{CompileOutput, Outcome};

mod hooks;
pub use hooks::Hooks;

use executor::{Executor, ExecutorOptions};
use parking_lot::Mutex;
use std::sync::Arc;

/// An incremental protobuf compiler: resolves, parses and links `.proto`
/// files into [`File`]s, memoizing per-file work across a call, and across
/// calls with [`retain_results`](CompilerBuilder::retain_results).
///
/// # Examples
///
/// ```no_run
/// use protolink::{Compiler, MemoryResolver};
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let resolver = MemoryResolver::default()
///     .with_file("a.proto", "syntax = \"proto3\"; package a; message A {}");
/// let compiler = Compiler::builder(resolver).build();
/// let output = compiler.compile(["a.proto"]).await?;
/// output.assert_success();
/// # Ok(())
/// # }
/// ```
pub struct Compiler {
    resolver: Arc<dyn Resolver>,
    parser: Arc<dyn Parser>,
    reporter: Arc<dyn Reporter>,
    interpreter: Option<Arc<dyn OptionInterpreter>>,
    hooks: Hooks,
    max_parallelism: usize,
    source_info_mode: SourceInfoMode,
    retain_asts: bool,
    retain_results: bool,
    include_dependencies_in_results: bool,
    /// The executor lives here between calls when incremental mode is on.
    executor: Mutex<Option<Arc<Executor>>>,
}

impl Compiler {
    /// Convenience function to configure a compiler over the given resolver.
    pub fn builder(resolver: impl Resolver + 'static) -> CompilerBuilder {
        CompilerBuilder::new(resolver)
    }

    /// Compiles the given paths and everything they import.
    ///
    /// Paths are resolved through the compiler's [`Resolver`]; each resolved
    /// file is compiled at most once per executor lifetime. Previously
    /// retained results for the requested paths (and their dependents) are
    /// invalidated first, so edits picked up by the resolver take effect.
    pub async fn compile<I, P>(&self, paths: I) -> Result<CompileOutput>
    where
        I: IntoIterator<Item = P>,
        P: Into<UnresolvedPath>,
    {
        let paths: Vec<UnresolvedPath> = paths.into_iter().map(Into::into).collect();
        trace!(files = paths.len(), "compile requested");
        let executor = self.executor();
        let result = executor.compile(paths).await;
        if !self.retain_results {
            self.executor.lock().take();
        }
        result
    }

    /// Cancels in-flight work. A retained executor is discarded, so the next
    /// [`compile`](Self::compile) starts fresh.
    pub fn cancel(&self) {
        if let Some(executor) = self.executor.lock().take() {
            executor.cancel();
        }
    }

    /// The live symbol table of the retained executor, if there is one.
    pub fn symbol_table(&self) -> Option<Arc<SymbolTable>> {
        self.executor.lock().as_ref().map(|executor| executor.symbol_table())
    }

    fn executor(&self) -> Arc<Executor> {
        let mut guard = self.executor.lock();
        match &*guard {
            Some(executor) => Arc::clone(executor),
            None => {
                let executor = Executor::new(
                    Arc::clone(&self.resolver),
                    Arc::clone(&self.parser),
                    Arc::clone(&self.reporter),
                    self.hooks.clone(),
                    ExecutorOptions {
                        max_parallelism: self.max_parallelism,
                        source_info_mode: self.source_info_mode,
                        retain_asts: self.retain_asts,
                        include_dependencies: self.include_dependencies_in_results,
                        interpreter: self.interpreter.clone(),
                    },
                );
                *guard = Some(Arc::clone(&executor));
                executor
            }
        }
    }
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler")
            .field("max_parallelism", &self.max_parallelism)
            .field("source_info_mode", &self.source_info_mode)
            .field("retain_asts", &self.retain_asts)
            .field("retain_results", &self.retain_results)
            .field("include_dependencies_in_results", &self.include_dependencies_in_results)
            .finish()
    }
}

/// Builder for [`Compiler`].
pub struct CompilerBuilder {
    resolver: Arc<dyn Resolver>,
    parser: Option<Arc<dyn Parser>>,
    reporter: Option<Arc<dyn Reporter>>,
    interpreter: Option<Arc<dyn OptionInterpreter>>,
    hooks: Hooks,
    max_parallelism: usize,
    source_info_mode: SourceInfoMode,
    retain_asts: bool,
    retain_results: bool,
    include_dependencies_in_results: bool,
}

impl CompilerBuilder {
    pub fn new(resolver: impl Resolver + 'static) -> Self {
        Self {
            resolver: Arc::new(resolver),
            parser: None,
            reporter: None,
            interpreter: None,
            hooks: Hooks::default(),
            max_parallelism: 0,
            source_info_mode: SourceInfoMode::empty(),
            retain_asts: false,
            retain_results: false,
            include_dependencies_in_results: false,
        }
    }

    /// Caps the worker pool. `0` (the default) means the lesser of the
    /// runtime's reported parallelism and the physical CPU count.
    #[must_use]
    pub fn max_parallelism(mut self, jobs: usize) -> Self {
        self.max_parallelism = jobs;
        self
    }

    /// Replaces the default `protox-parse`-backed parser.
    #[must_use]
    pub fn parser(mut self, parser: impl Parser + 'static) -> Self {
        self.parser = Some(Arc::new(parser));
        self
    }

    /// Sets the error/warning sink. The default keeps compiling and logs
    /// nothing; diagnostics still surface through
    /// [`CompileOutput::first_error`].
    #[must_use]
    pub fn reporter(mut self, reporter: impl Reporter + 'static) -> Self {
        self.reporter = Some(Arc::new(reporter));
        self
    }

    /// Shares a reporter that is also observed elsewhere.
    #[must_use]
    pub fn shared_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Installs the option-interpretation pass, run on each file after
    /// linking. Without one, options stay uninterpreted.
    #[must_use]
    pub fn option_interpreter(mut self, interpreter: impl OptionInterpreter + 'static) -> Self {
        self.interpreter = Some(Arc::new(interpreter));
        self
    }

    /// What source info to attach to compiled descriptors; none by default.
    #[must_use]
    pub fn source_info_mode(mut self, mode: SourceInfoMode) -> Self {
        self.source_info_mode = mode;
        self
    }

    /// Keeps ASTs (and retained source text) in results after compilation.
    #[must_use]
    pub fn retain_asts(mut self, retain: bool) -> Self {
        self.retain_asts = retain;
        self
    }

    /// Keeps executor state across [`Compiler::compile`] calls, enabling
    /// incremental recompilation.
    #[must_use]
    pub fn retain_results(mut self, retain: bool) -> Self {
        self.retain_results = retain;
        self
    }

    /// Returns the reflexive transitive closure of the requested files
    /// instead of just the files themselves.
    #[must_use]
    pub fn include_dependencies_in_results(mut self, include: bool) -> Self {
        self.include_dependencies_in_results = include;
        self
    }

    /// Installs observer callbacks.
    #[must_use]
    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn build(self) -> Compiler {
        let Self {
            resolver,
            parser,
            reporter,
            interpreter,
            hooks,
            max_parallelism,
            source_info_mode,
            retain_asts,
            retain_results,
            include_dependencies_in_results,
        } = self;

        struct SilentReporter;
        impl Reporter for SilentReporter {
            fn error(&self, _err: &Error) -> bool {
                true
            }
        }

        Compiler {
            resolver,
            parser: parser.unwrap_or_else(|| Arc::new(ProtoxParser)),
            reporter: reporter.unwrap_or_else(|| Arc::new(SilentReporter)),
            interpreter,
            hooks,
            max_parallelism: if max_parallelism == 0 {
                default_parallelism()
            } else {
                max_parallelism
            },
            source_info_mode,
            retain_asts,
            retain_results,
            include_dependencies_in_results,
            executor: Mutex::new(None),
        }
    }
}

/// The lesser of the runtime's reported parallelism and the physical CPU
/// count, but at least one worker.
fn default_parallelism() -> usize {
    let hint = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    hint.min(num_cpus::get_physical()).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_parallelism_is_at_least_one() {
        assert!(default_parallelism() >= 1);
    }

    #[test]
    fn builder_defaults() {
        let compiler = Compiler::builder(MemoryResolver::default()).build();
        assert!(compiler.max_parallelism >= 1);
        assert!(compiler.symbol_table().is_none());
        assert_eq!(compiler.source_info_mode, SourceInfoMode::empty());
    }
}
