//! Schema declarations consumed by the model factory.

use crate::hooks::{AfterHook, AfterKind, BeforeHook, BeforeKind, Hooks};
use liverow_core::{PropertyDecl, Validation};

/// Declarative description of one model: table, properties, validations,
/// hooks, and per-model setting overrides.
///
/// # Example
///
/// ```ignore
/// let person = orm.define(
///     Schema::new("person")
///         .property("name", PropertyType::Text)
///         .property("age", Property::new("age", PropertyType::Integer).with_required(true))
///         .validation(Validation::new("age", Rule::Range { min: Some(0.0), max: None })),
/// )?;
/// ```
#[derive(Clone)]
pub struct Schema {
    pub(crate) table: String,
    pub(crate) properties: Vec<(String, PropertyDecl)>,
    pub(crate) validations: Vec<Validation>,
    pub(crate) hooks: Hooks,
    pub(crate) identity_cache: Option<bool>,
    pub(crate) identity_cache_save_check: Option<bool>,
    pub(crate) auto_save: Option<bool>,
    pub(crate) auto_fetch: Option<bool>,
    pub(crate) auto_fetch_limit: Option<u32>,
    pub(crate) cascade_remove: Option<bool>,
    pub(crate) return_all_errors: Option<bool>,
}

impl Schema {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            properties: Vec::new(),
            validations: Vec::new(),
            hooks: Hooks::new(),
            identity_cache: None,
            identity_cache_save_check: None,
            auto_save: None,
            auto_fetch: None,
            auto_fetch_limit: None,
            cascade_remove: None,
            return_all_errors: None,
        }
    }

    /// Declare a property, shorthand or full.
    #[must_use]
    pub fn property(mut self, name: impl Into<String>, decl: impl Into<PropertyDecl>) -> Self {
        self.properties.push((name.into(), decl.into()));
        self
    }

    /// Attach a validation rule.
    #[must_use]
    pub fn validation(mut self, validation: Validation) -> Self {
        self.validations.push(validation);
        self
    }

    /// Attach a before-hook.
    #[must_use]
    pub fn before(mut self, kind: BeforeKind, hook: BeforeHook) -> Self {
        self.hooks.add_before(kind, hook);
        self
    }

    /// Attach an after-hook.
    #[must_use]
    pub fn after(mut self, kind: AfterKind, hook: AfterHook) -> Self {
        self.hooks.add_after(kind, hook);
        self
    }

    /// Override the engine-wide identity cache setting for this model.
    #[must_use]
    pub const fn identity_cache(mut self, enabled: bool) -> Self {
        self.identity_cache = Some(enabled);
        self
    }

    #[must_use]
    pub const fn identity_cache_save_check(mut self, enabled: bool) -> Self {
        self.identity_cache_save_check = Some(enabled);
        self
    }

    #[must_use]
    pub const fn auto_save(mut self, enabled: bool) -> Self {
        self.auto_save = Some(enabled);
        self
    }

    #[must_use]
    pub const fn auto_fetch(mut self, enabled: bool) -> Self {
        self.auto_fetch = Some(enabled);
        self
    }

    #[must_use]
    pub const fn auto_fetch_limit(mut self, limit: u32) -> Self {
        self.auto_fetch_limit = Some(limit);
        self
    }

    #[must_use]
    pub const fn cascade_remove(mut self, enabled: bool) -> Self {
        self.cascade_remove = Some(enabled);
        self
    }

    #[must_use]
    pub const fn return_all_errors(mut self, enabled: bool) -> Self {
        self.return_all_errors = Some(enabled);
        self
    }
}
