//! Lifecycle hooks.
//!
//! Before-hooks are fallible and abort the surrounding pipeline on error;
//! after-hooks observe the outcome and cannot fail.

use crate::instance::Instance;
use liverow_core::Result;
use std::fmt;
use std::sync::Arc;

/// Fallible hook run before a pipeline stage.
pub type BeforeHook = Arc<dyn Fn(&Instance) -> Result<()> + Send + Sync>;

/// Observer hook run after a pipeline stage, with its success flag.
pub type AfterHook = Arc<dyn Fn(&Instance, bool) + Send + Sync>;

/// Before-hook attachment points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeforeKind {
    Validation,
    Create,
    Save,
    Remove,
}

/// After-hook attachment points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterKind {
    Create,
    Save,
    Remove,
    Load,
    AutoFetch,
}

/// Hook registry for one model.
#[derive(Clone, Default)]
pub struct Hooks {
    before_validation: Vec<BeforeHook>,
    before_create: Vec<BeforeHook>,
    before_save: Vec<BeforeHook>,
    before_remove: Vec<BeforeHook>,
    after_create: Vec<AfterHook>,
    after_save: Vec<AfterHook>,
    after_remove: Vec<AfterHook>,
    after_load: Vec<AfterHook>,
    after_auto_fetch: Vec<AfterHook>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("before_validation", &self.before_validation.len())
            .field("before_create", &self.before_create.len())
            .field("before_save", &self.before_save.len())
            .field("before_remove", &self.before_remove.len())
            .field("after_create", &self.after_create.len())
            .field("after_save", &self.after_save.len())
            .field("after_remove", &self.after_remove.len())
            .field("after_load", &self.after_load.len())
            .field("after_auto_fetch", &self.after_auto_fetch.len())
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a before-hook.
    pub fn add_before(&mut self, kind: BeforeKind, hook: BeforeHook) {
        match kind {
            BeforeKind::Validation => self.before_validation.push(hook),
            BeforeKind::Create => self.before_create.push(hook),
            BeforeKind::Save => self.before_save.push(hook),
            BeforeKind::Remove => self.before_remove.push(hook),
        }
    }

    /// Register an after-hook.
    pub fn add_after(&mut self, kind: AfterKind, hook: AfterHook) {
        match kind {
            AfterKind::Create => self.after_create.push(hook),
            AfterKind::Save => self.after_save.push(hook),
            AfterKind::Remove => self.after_remove.push(hook),
            AfterKind::Load => self.after_load.push(hook),
            AfterKind::AutoFetch => self.after_auto_fetch.push(hook),
        }
    }

    /// Run before-hooks in registration order, stopping at the first error.
    pub fn wait(&self, kind: BeforeKind, instance: &Instance) -> Result<()> {
        let hooks = match kind {
            BeforeKind::Validation => &self.before_validation,
            BeforeKind::Create => &self.before_create,
            BeforeKind::Save => &self.before_save,
            BeforeKind::Remove => &self.before_remove,
        };
        for hook in hooks {
            hook(instance)?;
        }
        Ok(())
    }

    /// Fire after-hooks in registration order. Hook results are ignored.
    pub fn trigger(&self, kind: AfterKind, instance: &Instance, success: bool) {
        let hooks = match kind {
            AfterKind::Create => &self.after_create,
            AfterKind::Save => &self.after_save,
            AfterKind::Remove => &self.after_remove,
            AfterKind::Load => &self.after_load,
            AfterKind::AutoFetch => &self.after_auto_fetch,
        };
        for hook in hooks {
            hook(instance, success);
        }
    }
}
