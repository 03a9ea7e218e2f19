//! The engine factory: driver, settings, identity cache, and the model
//! registry.

use crate::identity::IdentityCache;
use crate::model::{Model, ModelDef};
use crate::schema::Schema;
use liverow_core::{Driver, Error, Property, Result, Settings};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

/// Shared engine state behind every model and instance handle.
pub(crate) struct OrmCore {
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) settings: Settings,
    pub(crate) cache: IdentityCache,
    models: RwLock<HashMap<String, Arc<ModelDef>>>,
    custom_types: RwLock<HashSet<String>>,
}

impl fmt::Debug for OrmCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrmCore")
            .field("driver", &self.driver.uid())
            .field("settings", &self.settings)
            .field("models", &self.models.read().expect("lock poisoned").len())
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl OrmCore {
    pub(crate) fn custom_type_names(&self) -> HashSet<String> {
        self.custom_types.read().expect("lock poisoned").clone()
    }
}

/// The engine entry point.
///
/// Owns the driver, the engine-wide settings, and the identity cache.
/// Cheap to clone; all clones share state.
#[derive(Debug, Clone)]
pub struct Orm {
    inner: Arc<OrmCore>,
}

impl Orm {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self::with_settings(driver, Settings::default())
    }

    pub fn with_settings(driver: Arc<dyn Driver>, settings: Settings) -> Self {
        Self {
            inner: Arc::new(OrmCore {
                driver,
                settings,
                cache: IdentityCache::new(),
                models: RwLock::new(HashMap::new()),
                custom_types: RwLock::new(HashSet::new()),
            }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn driver_uid(&self) -> String {
        self.inner.driver.uid().to_string()
    }

    /// Compile a schema into a model and register it by table name.
    pub fn define(&self, schema: Schema) -> Result<Model> {
        define_model(&self.inner, schema)
    }

    /// Register a custom property type name accepted by
    /// [`liverow_core::PropertyType::Custom`] declarations.
    pub fn register_type(&self, name: impl Into<String>) {
        self.inner
            .custom_types
            .write()
            .expect("lock poisoned")
            .insert(name.into());
    }

    /// Look up a previously defined model.
    pub fn model(&self, table: &str) -> Result<Model> {
        let models = self.inner.models.read().expect("lock poisoned");
        models
            .get(table)
            .map(|def| Model::new(Arc::clone(def), Arc::clone(&self.inner)))
            .ok_or_else(|| Error::NotDefined(format!("model '{table}'")))
    }

    /// Defined table names, sorted.
    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self
            .inner
            .models
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect();
        tables.sort();
        tables
    }

    /// Drop every identity cache entry.
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }
}

/// Compile and register a schema. Also reachable from `extends_to`, which
/// defines extension models while holding only the core.
pub(crate) fn define_model(core: &Arc<OrmCore>, schema: Schema) -> Result<Model> {
    {
        let models = core.models.read().expect("lock poisoned");
        if models.contains_key(&schema.table) {
            return Err(Error::BadModel(format!(
                "table '{}' is already defined",
                schema.table
            )));
        }
    }

    let mut settings = core.settings.clone();
    if let Some(v) = schema.identity_cache {
        settings.identity_cache = v;
    }
    if let Some(v) = schema.identity_cache_save_check {
        settings.identity_cache_save_check = v;
    }
    if let Some(v) = schema.auto_save {
        settings.auto_save = v;
    }
    if let Some(v) = schema.auto_fetch {
        settings.auto_fetch = v;
    }
    if let Some(v) = schema.auto_fetch_limit {
        settings.auto_fetch_limit = v;
    }
    if let Some(v) = schema.cascade_remove {
        settings.cascade_remove = v;
    }
    if let Some(v) = schema.return_all_errors {
        settings.return_all_errors = v;
    }

    let custom_types = core.custom_type_names();
    let mut properties = Vec::with_capacity(schema.properties.len());
    let mut has_key = false;
    for (name, decl) in schema.properties {
        let property = Property::normalize(&name, decl, &custom_types)?;
        has_key |= property.key;
        properties.push(property);
    }

    let def = Arc::new(ModelDef::new(schema.table.clone(), settings));
    if !has_key {
        if properties.iter().any(|p| p.name == "id") {
            return Err(Error::BadModel(format!(
                "table '{}' has an 'id' property but no key; mark a key property",
                schema.table
            )));
        }
        def.add_property(Property::serial_key("id"))?;
    }
    for property in properties {
        def.add_property(property)?;
    }
    for validation in schema.validations {
        def.add_validation(validation);
    }
    def.set_hooks(schema.hooks);

    tracing::debug!(table = %schema.table, "model defined");
    core.models
        .write()
        .expect("lock poisoned")
        .insert(schema.table, Arc::clone(&def));
    Ok(Model::new(def, Arc::clone(core)))
}
