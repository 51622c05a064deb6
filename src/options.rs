//! The option-interpretation contract.
//!
//! Interpreting options (resolving every `uninterpreted_option` on a linked
//! file against its option descriptors) is an external pass. The executor
//! invokes a configured [`OptionInterpreter`] on each file right after
//! linking, before the result is published; option errors fail the file the
//! same way link errors do.

use crate::{error::Result, link::Linked, report::Handler};
use std::collections::HashMap;

/// Index produced by option interpretation: where each interpreted option
/// lives and what it resolved to.
#[derive(Clone, Debug, Default)]
pub struct OptionIndex {
    /// Location path of each interpreted option → the fully-qualified name of
    /// the field or extension it resolved to.
    pub resolved: HashMap<Vec<i32>, String>,
}

/// Consumer-supplied pass that resolves uninterpreted option values.
pub trait OptionInterpreter: Send + Sync {
    /// Interprets the options of a freshly linked file. Diagnostics go
    /// through `handler`; an `Err` (or any reported error) fails the file.
    fn interpret_options(&self, linked: &Linked, handler: &Handler) -> Result<OptionIndex>;
}
