//! Compiled model descriptors and the model handle.

use crate::associations::{
    AssociationRef, ExtendAssociation, ManyAssociation, OneAssociation,
};
use crate::chain::Chain;
use crate::hooks::{AfterHook, AfterKind, BeforeHook, BeforeKind, Hooks};
use crate::identity::ResolveOptions;
use crate::instance::{ExtraLink, Instance};
use crate::orm::{self, OrmCore};
use crate::schema::Schema;
use liverow_core::{
    Conditions, Cx, DriverFuture, Error, FindOptions, Merge, MergeHop, Outcome, Property,
    PropertyDecl, PropertyType, Result, Rule, Settings, Validation, Value, try_outcome,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

/// Compiled descriptor for one model: table, properties, keys,
/// associations, validations, and hooks.
///
/// Compiled once at definition time; association wiring may extend it
/// while the model graph is being declared. Association targets are held
/// weakly, so mutually-referencing models do not leak.
#[derive(Debug)]
pub struct ModelDef {
    pub table: String,
    pub settings: Settings,
    state: RwLock<ModelState>,
}

#[derive(Debug, Default)]
struct ModelState {
    properties: Vec<Property>,
    index: HashMap<String, usize>,
    by_column: HashMap<String, String>,
    keys: Vec<String>,
    default_fields: Vec<String>,
    one: Vec<OneAssociation>,
    many: Vec<ManyAssociation>,
    extends: Vec<ExtendAssociation>,
    validations: Vec<Validation>,
    hooks: Hooks,
}

impl ModelDef {
    pub(crate) fn new(table: String, settings: Settings) -> Self {
        Self {
            table,
            settings,
            state: RwLock::new(ModelState::default()),
        }
    }

    /// Register a property. Key properties extend the key list; non-lazy
    /// properties extend the default projection.
    pub(crate) fn add_property(&self, property: Property) -> Result<()> {
        let mut state = self.state.write().expect("lock poisoned");
        if state.index.contains_key(&property.name) {
            return Err(Error::BadModel(format!(
                "duplicate property '{}' on '{}'",
                property.name, self.table
            )));
        }
        if property.required {
            state
                .validations
                .push(Validation::new(&property.name, Rule::Required));
        }
        if property.key {
            state.keys.push(property.name.clone());
        }
        if !property.lazyload {
            state.default_fields.push(property.maps_to.clone());
        }
        state
            .by_column
            .insert(property.maps_to.clone(), property.name.clone());
        let slot = state.properties.len();
        state.index.insert(property.name.clone(), slot);
        state.properties.push(property);
        Ok(())
    }

    pub(crate) fn add_validation(&self, validation: Validation) {
        self.state
            .write()
            .expect("lock poisoned")
            .validations
            .push(validation);
    }

    pub(crate) fn add_one(&self, association: OneAssociation) {
        self.state
            .write()
            .expect("lock poisoned")
            .one
            .push(association);
    }

    pub(crate) fn add_many(&self, association: ManyAssociation) {
        self.state
            .write()
            .expect("lock poisoned")
            .many
            .push(association);
    }

    pub(crate) fn add_extend(&self, association: ExtendAssociation) {
        self.state
            .write()
            .expect("lock poisoned")
            .extends
            .push(association);
    }

    pub(crate) fn add_before_hook(&self, kind: BeforeKind, hook: BeforeHook) {
        self.state
            .write()
            .expect("lock poisoned")
            .hooks
            .add_before(kind, hook);
    }

    pub(crate) fn add_after_hook(&self, kind: AfterKind, hook: AfterHook) {
        self.state
            .write()
            .expect("lock poisoned")
            .hooks
            .add_after(kind, hook);
    }

    pub(crate) fn set_hooks(&self, hooks: Hooks) {
        self.state.write().expect("lock poisoned").hooks = hooks;
    }

    /// Look up a property by logical name.
    pub fn property(&self, name: &str) -> Option<Property> {
        let state = self.state.read().expect("lock poisoned");
        state
            .index
            .get(name)
            .map(|&idx| state.properties[idx].clone())
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.state
            .read()
            .expect("lock poisoned")
            .index
            .contains_key(name)
    }

    /// Logical name for a storage column, if any property maps to it.
    pub fn property_for_column(&self, column: &str) -> Option<Property> {
        let state = self.state.read().expect("lock poisoned");
        let name = state.by_column.get(column)?;
        state.index.get(name).map(|&idx| state.properties[idx].clone())
    }

    pub fn properties(&self) -> Vec<Property> {
        self.state.read().expect("lock poisoned").properties.clone()
    }

    pub fn property_names(&self) -> Vec<String> {
        self.state
            .read()
            .expect("lock poisoned")
            .properties
            .iter()
            .map(|p| p.name.clone())
            .collect()
    }

    /// Key property names in declaration order.
    pub fn keys(&self) -> Vec<String> {
        self.state.read().expect("lock poisoned").keys.clone()
    }

    pub fn key_properties(&self) -> Vec<Property> {
        let state = self.state.read().expect("lock poisoned");
        state
            .keys
            .iter()
            .filter_map(|name| state.index.get(name).map(|&idx| state.properties[idx].clone()))
            .collect()
    }

    /// Storage columns of the key properties.
    pub fn key_columns(&self) -> Vec<String> {
        self.key_properties().iter().map(|p| p.maps_to.clone()).collect()
    }

    /// Default projection: storage columns of every non-lazy property.
    pub fn default_fields(&self) -> Vec<String> {
        self.state
            .read()
            .expect("lock poisoned")
            .default_fields
            .clone()
    }

    /// Storage column for a logical name; names without a property pass
    /// through unchanged (merged join columns, raw fragments).
    pub fn column_for(&self, name: &str) -> String {
        self.property(name)
            .map_or_else(|| name.to_string(), |p| p.maps_to)
    }

    pub(crate) fn one_assoc(&self, name: &str) -> Option<OneAssociation> {
        self.state
            .read()
            .expect("lock poisoned")
            .one
            .iter()
            .find(|a| a.name == name)
            .cloned()
    }

    pub(crate) fn many_assoc(&self, name: &str) -> Option<ManyAssociation> {
        self.state
            .read()
            .expect("lock poisoned")
            .many
            .iter()
            .find(|a| a.name == name)
            .cloned()
    }

    pub(crate) fn extend_assoc(&self, name: &str) -> Option<ExtendAssociation> {
        self.state
            .read()
            .expect("lock poisoned")
            .extends
            .iter()
            .find(|a| a.name == name)
            .cloned()
    }

    pub(crate) fn find_association(&self, name: &str) -> Option<AssociationRef> {
        if let Some(a) = self.one_assoc(name) {
            return Some(AssociationRef::One(a));
        }
        if let Some(a) = self.many_assoc(name) {
            return Some(AssociationRef::Many(a));
        }
        self.extend_assoc(name).map(AssociationRef::Extend)
    }

    pub(crate) fn association_refs(&self) -> Vec<AssociationRef> {
        let state = self.state.read().expect("lock poisoned");
        let mut refs: Vec<AssociationRef> =
            state.one.iter().cloned().map(AssociationRef::One).collect();
        refs.extend(state.many.iter().cloned().map(AssociationRef::Many));
        refs.extend(state.extends.iter().cloned().map(AssociationRef::Extend));
        refs
    }

    pub(crate) fn extend_associations(&self) -> Vec<ExtendAssociation> {
        self.state.read().expect("lock poisoned").extends.clone()
    }

    pub(crate) fn validations(&self) -> Vec<Validation> {
        self.state.read().expect("lock poisoned").validations.clone()
    }

    pub(crate) fn hooks(&self) -> Hooks {
        self.state.read().expect("lock poisoned").hooks.clone()
    }
}

/// Lookup options for [`Model::get_with`] and chain runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    pub identity_cache: Option<bool>,
    pub save_check: Option<bool>,
    pub auto_fetch: Option<bool>,
    pub auto_fetch_limit: Option<u32>,
}

/// Query shape for [`Model::one`].
#[derive(Debug, Clone, Default)]
pub struct OneQuery {
    pub conditions: Option<Conditions>,
    pub order: Option<String>,
}

/// Configuration for [`Model::has_one`].
#[derive(Debug, Clone, Default)]
pub struct OneOptions {
    /// Foreign key property names; defaults to `{name}_{target key}`
    pub fields: Option<Vec<String>>,
    /// The reference must be set for the owner to validate
    pub required: bool,
    /// Auto-define the inverse association on the target under this name
    pub reverse: Option<String>,
    pub auto_fetch: bool,
    pub auto_fetch_limit: Option<u32>,
}

/// Configuration for [`Model::has_many`].
#[derive(Debug, Clone, Default)]
pub struct ManyOptions {
    /// Join table name; defaults to `{owner}_{name}`
    pub join_table: Option<String>,
    /// Extra properties stored on the join table
    pub extra: Vec<(String, PropertyDecl)>,
    pub auto_fetch: bool,
    pub auto_fetch_limit: Option<u32>,
}

/// Configuration for [`Model::extends_to`].
#[derive(Debug, Clone, Default)]
pub struct ExtendOptions {
    /// Extension table name; defaults to `{owner}_{name}`
    pub table: Option<String>,
    pub auto_fetch: bool,
    pub auto_fetch_limit: Option<u32>,
}

/// Options threaded through row instantiation.
#[derive(Debug, Clone, Default)]
pub(crate) struct InstantiateOptions {
    pub identity: bool,
    pub save_check: bool,
    pub auto_fetch: bool,
    pub depth: u32,
    pub uid_suffix: Option<String>,
    pub extra_properties: Vec<Property>,
    pub extra_link: Option<ExtraLink>,
}

/// Handle to a defined model.
///
/// Cheap to clone; all handles for one table share the same descriptor.
#[derive(Debug, Clone)]
pub struct Model {
    pub(crate) def: Arc<ModelDef>,
    pub(crate) core: Arc<OrmCore>,
}

impl Model {
    pub(crate) fn new(def: Arc<ModelDef>, core: Arc<OrmCore>) -> Self {
        Self { def, core }
    }

    /// Re-materialize a handle from a weak association target.
    pub(crate) fn from_weak(target: &Weak<ModelDef>, core: &Arc<OrmCore>) -> Result<Self> {
        let def = target.upgrade().ok_or_else(|| {
            Error::NotDefined("association target model is no longer defined".to_string())
        })?;
        Ok(Self::new(def, Arc::clone(core)))
    }

    pub fn table(&self) -> &str {
        &self.def.table
    }

    /// The compiled descriptor backing this handle.
    pub fn def(&self) -> &Arc<ModelDef> {
        &self.def
    }

    /// Identity uid for a set of key values.
    pub fn uid_for_keys(&self, keys: &[Value]) -> String {
        let mut uid = format!("{}/{}", self.core.driver.uid(), self.def.table);
        for key in keys {
            uid.push('/');
            uid.push_str(&key.uid_fragment());
        }
        uid
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Build an unsaved instance from plain data.
    ///
    /// Property defaults are applied first, then `data` over them. If every
    /// key property is present and non-null the result is a shell pointing
    /// at an existing row; otherwise it is a new instance.
    pub fn build(&self, data: Vec<(String, Value)>) -> Result<Instance> {
        self.build_inner(data, false)
    }

    /// `force_new` keeps the instance fresh even when every key value is
    /// supplied, so a save inserts instead of treating it as a shell.
    fn build_inner(&self, data: Vec<(String, Value)>, force_new: bool) -> Result<Instance> {
        let instance = Instance::blank(Arc::clone(&self.def), Arc::clone(&self.core));

        for property in self.def.properties() {
            if let Some(default) = property.default_value() {
                instance.hydrate_value(&property.name, property.coerce(default));
            }
        }
        for (name, value) in data {
            instance.assign(&name, value)?;
        }

        if !force_new {
            let keys = self.def.keys();
            let all_keys_present = !keys.is_empty()
                && keys
                    .iter()
                    .all(|k| instance.get(k).is_some_and(|v| !v.is_null()));
            if all_keys_present {
                instance.mark_shell();
            }
        }
        Ok(instance)
    }

    /// Build a shell instance pointing at an existing row by key.
    pub fn shell(&self, keys: Vec<Value>) -> Result<Instance> {
        let key_names = self.def.keys();
        if keys.len() != key_names.len() {
            return Err(Error::ParamMismatch(format!(
                "'{}' has {} key properties, got {} values",
                self.def.table,
                key_names.len(),
                keys.len()
            )));
        }
        let data = key_names.into_iter().zip(keys).collect();
        self.build(data)
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// Fetch one instance by key values.
    pub async fn get(&self, cx: &Cx, keys: Vec<Value>) -> Outcome<Instance, Error> {
        self.get_with(cx, keys, GetOptions::default()).await
    }

    /// Fetch one instance by key values with per-call overrides.
    #[tracing::instrument(level = "debug", skip(self, cx, keys), fields(table = %self.def.table))]
    pub async fn get_with(
        &self,
        cx: &Cx,
        keys: Vec<Value>,
        options: GetOptions,
    ) -> Outcome<Instance, Error> {
        let key_properties = self.def.key_properties();
        if keys.len() != key_properties.len() {
            return Outcome::Err(Error::ParamMismatch(format!(
                "'{}' has {} key properties, got {} values",
                self.def.table,
                key_properties.len(),
                keys.len()
            )));
        }

        let mut conditions = Conditions::new();
        for (property, value) in key_properties.iter().zip(keys) {
            conditions = conditions.eq(property.maps_to.clone(), property.coerce(value));
        }

        let fields = self.def.default_fields();
        let find_options = FindOptions {
            limit: Some(1),
            ..FindOptions::default()
        };
        let rows = try_outcome!(
            self.core
                .driver
                .find(cx, &fields, &self.def.table, &conditions, &find_options)
                .await
        );
        let Some(row) = rows.into_iter().next() else {
            return Outcome::Err(Error::not_found(&self.def.table));
        };

        let settings = &self.def.settings;
        let instantiate = InstantiateOptions {
            identity: options.identity_cache.unwrap_or(settings.identity_cache),
            save_check: options
                .save_check
                .unwrap_or(settings.identity_cache_save_check),
            auto_fetch: options.auto_fetch.unwrap_or(settings.auto_fetch),
            depth: options.auto_fetch_limit.unwrap_or(settings.auto_fetch_limit),
            ..InstantiateOptions::default()
        };
        self.instantiate(cx, row.into_pairs(), instantiate).await
    }

    /// Start a chain with the given conditions.
    pub fn find(&self, conditions: Conditions) -> Chain {
        Chain::new(self.clone()).find(conditions)
    }

    /// Start an unfiltered chain.
    pub fn all(&self) -> Chain {
        Chain::new(self.clone())
    }

    /// Fetch the first matching instance, or `None`.
    pub async fn one(&self, cx: &Cx, query: OneQuery) -> Outcome<Option<Instance>, Error> {
        let mut chain = Chain::new(self.clone());
        if let Some(conditions) = query.conditions {
            chain = chain.find(conditions);
        }
        if let Some(order) = &query.order {
            chain = chain.order(order);
        }
        chain.limit(1).first(cx).await
    }

    /// Count matching rows.
    pub async fn count(&self, cx: &Cx, conditions: Conditions) -> Outcome<i64, Error> {
        Chain::new(self.clone()).find(conditions).count(cx).await
    }

    /// Whether any row matches.
    pub async fn exists(&self, cx: &Cx, conditions: Conditions) -> Outcome<bool, Error> {
        let count = try_outcome!(self.count(cx, conditions).await);
        Outcome::Ok(count > 0)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Build and save one instance. Explicit key values insert a new row;
    /// they never turn the instance into a shell over an existing one.
    pub async fn create(&self, cx: &Cx, data: Vec<(String, Value)>) -> Outcome<Instance, Error> {
        let instance = match self.build_inner(data, true) {
            Ok(instance) => instance,
            Err(err) => return Outcome::Err(err),
        };
        try_outcome!(instance.save(cx).await);
        Outcome::Ok(instance)
    }

    /// Build and save a batch sequentially.
    ///
    /// The first failure aborts the batch; its error names the offending
    /// index. Previously saved items stay saved.
    pub async fn create_many(
        &self,
        cx: &Cx,
        items: Vec<Vec<(String, Value)>>,
    ) -> Outcome<Vec<Instance>, Error> {
        let mut created = Vec::with_capacity(items.len());
        for (index, data) in items.into_iter().enumerate() {
            let instance = match self.build_inner(data, true) {
                Ok(instance) => instance,
                Err(err) => {
                    return Outcome::Err(Error::Custom(format!(
                        "create failed at index {index}: {err}"
                    )));
                }
            };
            match instance.save(cx).await {
                Outcome::Ok(()) => created.push(instance),
                Outcome::Err(err) => {
                    return Outcome::Err(Error::Custom(format!(
                        "create failed at index {index}: {err}"
                    )));
                }
                Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
                Outcome::Panicked(payload) => return Outcome::Panicked(payload),
            }
        }
        Outcome::Ok(created)
    }

    /// Delete every row of the table and evict its cache entries.
    pub async fn clear(&self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(self.core.driver.clear(cx, &self.def.table).await);
        let prefix = format!("{}/{}/", self.core.driver.uid(), self.def.table);
        self.core.cache.evict_prefix(&prefix);
        Outcome::Ok(())
    }

    // ------------------------------------------------------------------
    // Hooks and validations after definition
    // ------------------------------------------------------------------

    pub fn before(&self, kind: BeforeKind, hook: BeforeHook) {
        self.def.add_before_hook(kind, hook);
    }

    pub fn after(&self, kind: AfterKind, hook: AfterHook) {
        self.def.add_after_hook(kind, hook);
    }

    pub fn add_validation(&self, validation: Validation) {
        self.def.add_validation(validation);
    }

    // ------------------------------------------------------------------
    // Association definition
    // ------------------------------------------------------------------

    /// Declare a scalar reference to `target`.
    ///
    /// Injects foreign key properties on this model and, when `reverse` is
    /// set, the inverse association on the target.
    pub fn has_one(&self, name: &str, target: &Model, options: OneOptions) -> Result<()> {
        self.has_one_inner(name, target, options, false)
    }

    fn has_one_inner(
        &self,
        name: &str,
        target: &Model,
        options: OneOptions,
        extension: bool,
    ) -> Result<()> {
        let target_keys = target.def.key_properties();
        if target_keys.is_empty() {
            return Err(Error::BadModel(format!(
                "'{}' has no key properties to reference",
                target.def.table
            )));
        }

        let fields = match options.fields {
            Some(fields) => {
                if fields.len() != target_keys.len() {
                    return Err(Error::ParamMismatch(format!(
                        "association '{name}' needs {} foreign key fields",
                        target_keys.len()
                    )));
                }
                fields
            }
            None => target_keys
                .iter()
                .map(|key| format!("{name}_{}", key.name))
                .collect(),
        };

        for (field, key) in fields.iter().zip(&target_keys) {
            if self.def.has_property(field) {
                continue;
            }
            let kind = foreign_key_kind(&key.kind);
            self.def
                .add_property(Property::new(field.clone(), kind).with_enumerable(false))?;
        }

        if options.required {
            for field in &fields {
                self.def.add_validation(Validation::new(field, Rule::Required));
            }
        }

        let limit = options
            .auto_fetch_limit
            .unwrap_or(self.def.settings.auto_fetch_limit);
        self.def.add_one(OneAssociation {
            name: name.to_string(),
            target: Arc::downgrade(&target.def),
            fields: fields.clone(),
            reversed: false,
            required: options.required,
            extension,
            auto_fetch: options.auto_fetch,
            auto_fetch_limit: limit,
        });

        if let Some(reverse) = options.reverse {
            target.def.add_one(OneAssociation {
                name: reverse,
                target: Arc::downgrade(&self.def),
                fields,
                reversed: true,
                required: false,
                extension: false,
                auto_fetch: options.auto_fetch,
                auto_fetch_limit: limit,
            });
        }
        Ok(())
    }

    /// Declare a collection of `target` rows linked through a join table.
    pub fn has_many(&self, name: &str, target: &Model, options: ManyOptions) -> Result<()> {
        let join_table = options
            .join_table
            .unwrap_or_else(|| format!("{}_{name}", self.def.table));
        let owner_link: Vec<String> = self
            .def
            .key_properties()
            .iter()
            .map(|key| format!("{}_{}", self.def.table, key.name))
            .collect();
        let related_link: Vec<String> = target
            .def
            .key_properties()
            .iter()
            .map(|key| format!("{}_{}", target.def.table, key.name))
            .collect();

        let custom_types = self.core.custom_type_names();
        let mut extra = Vec::with_capacity(options.extra.len());
        for (prop_name, decl) in options.extra {
            extra.push(Property::normalize(&prop_name, decl, &custom_types)?);
        }

        self.def.add_many(ManyAssociation {
            name: name.to_string(),
            target: Arc::downgrade(&target.def),
            join_table,
            owner_link,
            related_link,
            extra,
            auto_fetch: options.auto_fetch,
            auto_fetch_limit: options
                .auto_fetch_limit
                .unwrap_or(self.def.settings.auto_fetch_limit),
        });
        Ok(())
    }

    /// Define an extension model holding optional columns for this model.
    ///
    /// The extension table is keyed by this model's key and carries a back
    /// reference association named after this model's table.
    pub fn extends_to(
        &self,
        name: &str,
        properties: Vec<(String, PropertyDecl)>,
        options: ExtendOptions,
    ) -> Result<Model> {
        let table = options
            .table
            .unwrap_or_else(|| format!("{}_{name}", self.def.table));
        let owner_keys = self.def.key_properties();
        let fields: Vec<String> = owner_keys
            .iter()
            .map(|key| format!("{}_{}", self.def.table, key.name))
            .collect();

        let mut schema = Schema::new(table);
        for (field, key) in fields.iter().zip(&owner_keys) {
            let kind = foreign_key_kind(&key.kind);
            schema = schema.property(
                field.clone(),
                Property::new(field.clone(), kind)
                    .with_key(true)
                    .with_enumerable(false),
            );
        }
        for (prop_name, decl) in properties {
            schema = schema.property(prop_name, decl);
        }

        let extension = orm::define_model(&self.core, schema)?;
        extension.has_one_inner(
            &self.def.table,
            self,
            OneOptions {
                fields: Some(fields.clone()),
                ..OneOptions::default()
            },
            true,
        )?;

        self.def.add_extend(ExtendAssociation {
            name: name.to_string(),
            target: Arc::downgrade(&extension.def),
            fields,
            auto_fetch: options.auto_fetch,
            auto_fetch_limit: options
                .auto_fetch_limit
                .unwrap_or(self.def.settings.auto_fetch_limit),
        });
        Ok(extension)
    }

    /// Start a chain over this model filtered by a related row.
    ///
    /// The chain joins through the association and applies `conditions` to
    /// the related side.
    pub fn find_by(&self, association: &str, conditions: Conditions) -> Result<Chain> {
        if conditions.is_empty() {
            return Err(Error::ParamMismatch(format!(
                "find_by('{association}') requires conditions"
            )));
        }

        if let Some(assoc) = self.def.one_assoc(association) {
            let target = Model::from_weak(&assoc.target, &self.core)?;
            let merge = if assoc.reversed {
                // Keys on the declaring side point back at us.
                Merge {
                    from_table: target.def.table.clone(),
                    from_fields: assoc
                        .fields
                        .iter()
                        .map(|f| target.def.column_for(f))
                        .collect(),
                    to_table: self.def.table.clone(),
                    to_fields: self.def.key_columns(),
                    hop: None,
                    conditions: conditions
                        .map_fields(|f| target.def.column_for(f)),
                    select_extra: Vec::new(),
                }
            } else {
                Merge {
                    from_table: target.def.table.clone(),
                    from_fields: target.def.key_columns(),
                    to_table: self.def.table.clone(),
                    to_fields: assoc
                        .fields
                        .iter()
                        .map(|f| self.def.column_for(f))
                        .collect(),
                    hop: None,
                    conditions: conditions
                        .map_fields(|f| target.def.column_for(f)),
                    select_extra: Vec::new(),
                }
            };
            return Ok(Chain::new(self.clone()).with_merge(merge));
        }

        if let Some(assoc) = self.def.many_assoc(association) {
            let target = Model::from_weak(&assoc.target, &self.core)?;
            let merge = Merge {
                from_table: assoc.join_table.clone(),
                from_fields: assoc.owner_link.clone(),
                to_table: self.def.table.clone(),
                to_fields: self.def.key_columns(),
                hop: Some(MergeHop {
                    table: target.def.table.clone(),
                    from: assoc.related_link.clone(),
                    to: target.def.key_columns(),
                }),
                conditions: conditions.map_fields(|f| target.def.column_for(f)),
                select_extra: Vec::new(),
            };
            return Ok(Chain::new(self.clone()).with_merge(merge));
        }

        if let Some(assoc) = self.def.extend_assoc(association) {
            let target = Model::from_weak(&assoc.target, &self.core)?;
            let merge = Merge {
                from_table: target.def.table.clone(),
                from_fields: assoc
                    .fields
                    .iter()
                    .map(|f| target.def.column_for(f))
                    .collect(),
                to_table: self.def.table.clone(),
                to_fields: self.def.key_columns(),
                hop: None,
                conditions: conditions.map_fields(|f| target.def.column_for(f)),
                select_extra: Vec::new(),
            };
            return Ok(Chain::new(self.clone()).with_merge(merge));
        }

        Err(Error::NotDefined(format!(
            "association '{association}' on '{}'",
            self.def.table
        )))
    }

    // ------------------------------------------------------------------
    // Instantiation from fetched rows
    // ------------------------------------------------------------------

    /// Turn a fetched row into a live instance.
    ///
    /// Resolves through the identity cache; freshly constructed instances
    /// run after-load hooks and auto-fetch outside the cache lock.
    pub(crate) fn instantiate<'a>(
        &'a self,
        cx: &'a Cx,
        pairs: Vec<(String, Value)>,
        options: InstantiateOptions,
    ) -> DriverFuture<'a, Instance> {
        Box::pin(async move {
            let mut values: Vec<(String, Value)> = Vec::with_capacity(pairs.len());
            let mut extras: Vec<(String, Value)> = Vec::new();

            for (column, value) in pairs {
                if column == liverow_core::PARENT_KEY_COLUMN {
                    continue;
                }
                if let Some(extra) = options
                    .extra_properties
                    .iter()
                    .find(|p| p.maps_to == column)
                {
                    extras.push((extra.name.clone(), extra.coerce(value)));
                    continue;
                }
                if let Some(property) = self.def.property_for_column(&column) {
                    let coerced = self.core.driver.value_to_property(value, &property);
                    values.push((property.name.clone(), coerced));
                }
                // Unknown columns from merged joins are dropped.
            }

            let key_values: Vec<Value> = self
                .def
                .keys()
                .iter()
                .map(|key| {
                    values
                        .iter()
                        .find(|(name, _)| name == key)
                        .map_or(Value::Null, |(_, v)| v.clone())
                })
                .collect();

            // Partial projections cannot safely share identity.
            let identity = options.identity && !key_values.iter().any(Value::is_null);

            let mut uid = self.uid_for_keys(&key_values);
            if let Some(suffix) = &options.uid_suffix {
                uid.push('+');
                uid.push_str(suffix);
            }

            let resolve = ResolveOptions {
                enabled: identity,
                save_check: options.save_check,
            };
            let def = Arc::clone(&self.def);
            let core = Arc::clone(&self.core);
            let extra_link = options.extra_link.clone();
            let instance_uid = uid.clone();
            let constructed = self.core.cache.resolve(&uid, resolve, move || {
                Ok(Instance::hydrated(def, core, values, extras, extra_link, instance_uid))
            });

            let (instance, fresh) = match constructed {
                Ok(resolved) => resolved,
                Err(err) => return Outcome::Err(err),
            };

            if fresh {
                instance.trigger_after_load();
                if options.auto_fetch && options.depth > 0 {
                    try_outcome!(
                        crate::associations::auto_fetch(cx, &instance, options.depth).await
                    );
                }
                instance.mark_ready();
            }
            Outcome::Ok(instance)
        })
    }
}

/// Storage type for a foreign key referencing the given key type.
fn foreign_key_kind(kind: &PropertyType) -> PropertyType {
    match kind {
        PropertyType::Serial => PropertyType::Integer,
        other => other.clone(),
    }
}
