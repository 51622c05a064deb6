//! Observer callbacks around invalidation and compilation.

use crate::{executor::Outcome, path::ResolvedPath};
use std::{fmt, sync::Arc};

type PathHook = Arc<dyn Fn(&ResolvedPath) + Send + Sync>;
type InvalidateHook = Arc<dyn Fn(&ResolvedPath, Option<&Outcome>, bool) + Send + Sync>;
type CompileHook = Arc<dyn Fn(&ResolvedPath, &Outcome) + Send + Sync>;

/// Optional observer callbacks fired by the executor.
///
/// Ordering guarantees: `pre_invalidate` fires for a file before any of its
/// dependents are invalidated, `post_invalidate` fires after the whole
/// cascade (with the previous outcome and whether the path will recompile),
/// and `pre_compile`/`post_compile` bracket each task.
#[derive(Clone, Default)]
pub struct Hooks {
    pre_invalidate: Option<PathHook>,
    post_invalidate: Option<InvalidateHook>,
    pre_compile: Option<PathHook>,
    post_compile: Option<CompileHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_pre_invalidate(mut self, hook: impl Fn(&ResolvedPath) + Send + Sync + 'static) -> Self {
        self.pre_invalidate = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_post_invalidate(
        mut self,
        hook: impl Fn(&ResolvedPath, Option<&Outcome>, bool) + Send + Sync + 'static,
    ) -> Self {
        self.post_invalidate = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_pre_compile(mut self, hook: impl Fn(&ResolvedPath) + Send + Sync + 'static) -> Self {
        self.pre_compile = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_post_compile(
        mut self,
        hook: impl Fn(&ResolvedPath, &Outcome) + Send + Sync + 'static,
    ) -> Self {
        self.post_compile = Some(Arc::new(hook));
        self
    }

    pub(crate) fn pre_invalidate(&self, path: &ResolvedPath) {
        if let Some(hook) = &self.pre_invalidate {
            hook(path);
        }
    }

    pub(crate) fn post_invalidate(
        &self,
        path: &ResolvedPath,
        previous: Option<&Outcome>,
        will_recompile: bool,
    ) {
        if let Some(hook) = &self.post_invalidate {
            hook(path, previous, will_recompile);
        }
    }

    pub(crate) fn pre_compile(&self, path: &ResolvedPath) {
        if let Some(hook) = &self.pre_compile {
            hook(path);
        }
    }

    pub(crate) fn post_compile(&self, path: &ResolvedPath, outcome: &Outcome) {
        if let Some(hook) = &self.post_compile {
            hook(path, outcome);
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("pre_invalidate", &self.pre_invalidate.is_some())
            .field("post_invalidate", &self.post_invalidate.is_some())
            .field("pre_compile", &self.pre_compile.is_some())
            .field("post_compile", &self.post_compile.is_some())
            .finish()
    }
}
