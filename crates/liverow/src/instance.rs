//! Live instances: typed row state, dirty tracking, and the save and
//! remove pipelines.

use crate::associations::{self, AssociationRef, Related, extend, many, one};
use crate::hooks::{AfterKind, BeforeKind, Hooks};
use crate::model::{Model, ModelDef};
use crate::orm::OrmCore;
use liverow_core::{
    Conditions, ConnectionToken, Cx, DriverFuture, Error, FindOptions, Outcome, PropertyType,
    Result, Rule, ValidationFailure, Value, try_outcome,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Join table row backing extra association properties on this instance.
#[derive(Debug, Clone)]
pub(crate) struct ExtraLink {
    pub join_table: String,
    /// Column-space conditions pinpointing the join row
    pub conditions: Conditions,
}

/// Lifecycle events observable per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceEvent {
    Save,
    Remove,
    /// Fired once the instance is fully loaded, after auto-fetch resolution
    Ready,
}

/// Event observer. Receives the instance and the error, if the operation
/// failed.
pub type EventHandler = Arc<dyn Fn(&Instance, Option<&Error>) + Send + Sync>;

/// Options for [`Instance::save_with`].
#[derive(Debug, Clone, Copy)]
pub struct SaveOptions {
    /// Save staged associations and propagate foreign keys
    pub cascade: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self { cascade: true }
    }
}

#[derive(Default)]
struct InstanceState {
    values: HashMap<String, Value>,
    extras: HashMap<String, Value>,
    /// Changed property names in change order, no duplicates
    dirty: Vec<String>,
    extra_dirty: Vec<String>,
    /// Key values as last synchronized with the store
    original_keys: Vec<(String, Value)>,
    /// The row exists in the store
    persisted: bool,
    /// Never saved
    fresh: bool,
    /// Built from key values only, column data not loaded
    shell: bool,
    saving: bool,
    removed: bool,
    connection: Option<ConnectionToken>,
    related: HashMap<String, Related>,
    /// Association names staged for the next cascading save, in staging
    /// order, no duplicates
    staged: Vec<String>,
    extra_link: Option<ExtraLink>,
    uid: Option<String>,
    handlers: Vec<(InstanceEvent, EventHandler)>,
}

/// A live, mutable view of one logical row.
///
/// Handles are cheap to clone and share state, which is what makes the
/// identity cache meaningful: every fetch of the same row yields a handle
/// onto the same state.
#[derive(Clone)]
pub struct Instance {
    def: Arc<ModelDef>,
    core: Arc<OrmCore>,
    state: Arc<RwLock<InstanceState>>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read().expect("lock poisoned");
        f.debug_struct("Instance")
            .field("table", &self.def.table)
            .field("keys", &state.original_keys)
            .field("fresh", &state.fresh)
            .field("persisted", &state.persisted)
            .field("dirty", &state.dirty)
            .field("removed", &state.removed)
            .finish_non_exhaustive()
    }
}

impl Instance {
    pub(crate) fn blank(def: Arc<ModelDef>, core: Arc<OrmCore>) -> Self {
        Self {
            def,
            core,
            state: Arc::new(RwLock::new(InstanceState {
                fresh: true,
                ..InstanceState::default()
            })),
        }
    }

    pub(crate) fn hydrated(
        def: Arc<ModelDef>,
        core: Arc<OrmCore>,
        values: Vec<(String, Value)>,
        extras: Vec<(String, Value)>,
        extra_link: Option<ExtraLink>,
        uid: String,
    ) -> Self {
        let values: HashMap<String, Value> = values.into_iter().collect();
        let original_keys = def
            .keys()
            .iter()
            .map(|key| (key.clone(), values.get(key).cloned().unwrap_or(Value::Null)))
            .collect();
        Self {
            def,
            core,
            state: Arc::new(RwLock::new(InstanceState {
                values,
                extras: extras.into_iter().collect(),
                original_keys,
                persisted: true,
                extra_link,
                uid: Some(uid),
                ..InstanceState::default()
            })),
        }
    }

    // ------------------------------------------------------------------
    // State queries
    // ------------------------------------------------------------------

    pub fn table(&self) -> &str {
        &self.def.table
    }

    pub fn model_def(&self) -> &Arc<ModelDef> {
        &self.def
    }

    /// A model handle for this instance's table.
    pub fn model(&self) -> Model {
        Model {
            def: Arc::clone(&self.def),
            core: Arc::clone(&self.core),
        }
    }

    pub(crate) fn core(&self) -> &Arc<OrmCore> {
        &self.core
    }

    /// Whether two handles share the same underlying state.
    pub fn same_as(&self, other: &Instance) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// No pending changes and at least one save behind it.
    pub fn saved(&self) -> bool {
        let state = self.state.read().expect("lock poisoned");
        !state.fresh && state.dirty.is_empty()
    }

    /// The row exists in the store.
    pub fn is_persisted(&self) -> bool {
        self.state.read().expect("lock poisoned").persisted
    }

    /// Built from key values only; column data has not been loaded.
    pub fn is_shell(&self) -> bool {
        self.state.read().expect("lock poisoned").shell
    }

    pub fn is_removed(&self) -> bool {
        self.state.read().expect("lock poisoned").removed
    }

    /// Dirty properties or dirty join-table extras.
    pub fn has_unsaved_changes(&self) -> bool {
        let state = self.state.read().expect("lock poisoned");
        !state.dirty.is_empty() || !state.extra_dirty.is_empty()
    }

    /// Identity uid, present once the instance maps to a cached row.
    pub fn uid(&self) -> Option<String> {
        self.state.read().expect("lock poisoned").uid.clone()
    }

    /// Changed property names in change order.
    pub fn dirty_properties(&self) -> Vec<String> {
        self.state.read().expect("lock poisoned").dirty.clone()
    }

    pub fn is_dirty(&self, name: &str) -> bool {
        self.state
            .read()
            .expect("lock poisoned")
            .dirty
            .iter()
            .any(|d| d == name)
    }

    /// Force a property into the next save, even if its value is unchanged.
    pub fn mark_as_dirty(&self, name: &str) {
        let mut state = self.state.write().expect("lock poisoned");
        if !state.dirty.iter().any(|d| d == name) {
            state.dirty.push(name.to_string());
        }
    }

    /// Pin driver work for this instance to one connection.
    pub fn use_connection(&self, connection: ConnectionToken) {
        self.state.write().expect("lock poisoned").connection = Some(connection);
    }

    pub fn connection(&self) -> Option<ConnectionToken> {
        self.state.read().expect("lock poisoned").connection
    }

    /// Subscribe to lifecycle events on this instance.
    pub fn on(&self, event: InstanceEvent, handler: EventHandler) {
        self.state
            .write()
            .expect("lock poisoned")
            .handlers
            .push((event, handler));
    }

    fn emit(&self, event: InstanceEvent, error: Option<&Error>) {
        let handlers: Vec<EventHandler> = {
            let state = self.state.read().expect("lock poisoned");
            state
                .handlers
                .iter()
                .filter(|(e, _)| *e == event)
                .map(|(_, h)| Arc::clone(h))
                .collect()
        };
        for handler in handlers {
            handler(self, error);
        }
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    /// Current value of a property.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.state
            .read()
            .expect("lock poisoned")
            .values
            .get(name)
            .cloned()
    }

    /// Current value of a join-table extra property.
    pub fn get_extra(&self, name: &str) -> Option<Value> {
        self.state
            .read()
            .expect("lock poisoned")
            .extras
            .get(name)
            .cloned()
    }

    /// Enumerable properties as plain data pairs, in declaration order.
    pub fn to_pairs(&self) -> Vec<(String, Value)> {
        let state = self.state.read().expect("lock poisoned");
        self.def
            .properties()
            .into_iter()
            .filter(|p| p.enumerable)
            .map(|p| {
                let value = state.values.get(&p.name).cloned().unwrap_or(Value::Null);
                (p.name, value)
            })
            .collect()
    }

    /// Write a value without dirty tracking, for defaults and loads.
    pub(crate) fn hydrate_value(&self, name: &str, value: Value) {
        self.state
            .write()
            .expect("lock poisoned")
            .values
            .insert(name.to_string(), value);
    }

    /// Change a property value, coercing toward its storage type.
    ///
    /// No-op when the coerced value equals the current one. Serial keys are
    /// immutable once the instance is persisted.
    pub fn assign(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let Some(property) = self.def.property(name) else {
            return Err(Error::NotDefined(format!(
                "property '{name}' on '{}'",
                self.def.table
            )));
        };
        let coerced = self.core.driver.value_to_property(value.into(), &property);

        let mut state = self.state.write().expect("lock poisoned");
        let current = state.values.get(name);
        if current == Some(&coerced) {
            return Ok(());
        }
        if property.is_serial()
            && state.persisted
            && current.is_some_and(|v| !v.is_null())
        {
            return Err(Error::ParamMismatch(format!(
                "key property '{name}' cannot change on a persisted instance"
            )));
        }
        state.values.insert(name.to_string(), coerced);
        if !state.dirty.iter().any(|d| d == name) {
            state.dirty.push(name.to_string());
        }
        Ok(())
    }

    /// Change a property and, with auto-save enabled, flush it immediately.
    pub async fn set(
        &self,
        cx: &Cx,
        name: &str,
        value: impl Into<Value>,
    ) -> Outcome<(), Error> {
        if let Err(err) = self.assign(name, value) {
            return Outcome::Err(err);
        }
        if self.def.settings.auto_save && self.is_persisted() && self.is_dirty(name) {
            let current = self.get(name).unwrap_or(Value::Null);
            try_outcome!(self.save_property(cx, name, current).await);
        }
        Outcome::Ok(())
    }

    /// Assign into a nested path of an object property, `"profile.city"`
    /// style. Intermediate objects are created as needed.
    pub fn assign_path(&self, path: &str, value: impl Into<Value>) -> Result<()> {
        let Some((root, rest)) = path.split_once('.') else {
            return self.assign(path, value);
        };
        let Some(property) = self.def.property(root) else {
            return Err(Error::NotDefined(format!(
                "property '{root}' on '{}'",
                self.def.table
            )));
        };
        if property.kind != PropertyType::Object {
            return Err(Error::NoSupport(format!(
                "path assignment needs an object property, '{root}' is {}",
                property.kind.name()
            )));
        }

        let tree = match self.get(root) {
            Some(Value::Json(tree)) => tree,
            _ => serde_json::Value::Object(serde_json::Map::new()),
        };
        let segments: Vec<&str> = rest.split('.').collect();
        let tree = set_json_path(tree, &segments, value_to_json(value.into()));
        self.assign(root, Value::Json(tree))
    }

    /// Join-table extra property assignment; flushed on the next save.
    pub fn assign_extra(&self, name: &str, value: impl Into<Value>) {
        let mut state = self.state.write().expect("lock poisoned");
        state.extras.insert(name.to_string(), value.into());
        if !state.extra_dirty.iter().any(|d| d == name) {
            state.extra_dirty.push(name.to_string());
        }
    }

    pub(crate) fn mark_shell(&self) {
        {
            let mut state = self.state.write().expect("lock poisoned");
            state.fresh = false;
            state.persisted = true;
            state.shell = true;
            state.dirty.clear();
        }
        self.remember_keys();
    }

    /// Current key property values, in key order.
    pub(crate) fn key_values(&self) -> Vec<Value> {
        let state = self.state.read().expect("lock poisoned");
        self.def
            .keys()
            .iter()
            .map(|key| state.values.get(key).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Column-space conditions addressing this row by its last synchronized
    /// key values, so updates still land after an in-memory key change.
    pub(crate) fn original_key_conditions(&self) -> Conditions {
        let state = self.state.read().expect("lock poisoned");
        let mut conditions = Conditions::new();
        for (name, value) in &state.original_keys {
            conditions = conditions.eq(self.def.column_for(name), value.clone());
        }
        conditions
    }

    fn remember_keys(&self) {
        let keys = self.def.keys();
        let mut state = self.state.write().expect("lock poisoned");
        state.original_keys = keys
            .iter()
            .map(|key| (key.clone(), state.values.get(key).cloned().unwrap_or(Value::Null)))
            .collect();
    }

    /// Re-register under the uid of the current key values, evicting any
    /// stale registration.
    fn register_identity(&self) {
        if !self.def.settings.identity_cache {
            return;
        }
        let keys = self.key_values();
        if keys.is_empty() || keys.iter().any(Value::is_null) {
            return;
        }
        let mut uid = format!("{}/{}", self.core.driver.uid(), self.def.table);
        for key in &keys {
            uid.push('/');
            uid.push_str(&key.uid_fragment());
        }
        let previous = {
            let mut state = self.state.write().expect("lock poisoned");
            state.uid.replace(uid.clone())
        };
        if let Some(previous) = previous {
            if previous != uid {
                self.core.cache.evict(&previous);
            }
        }
        self.core.cache.insert(&uid, self.clone());
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    /// Run all model validations against current values.
    ///
    /// Null values skip every rule except `Required`, unless the property
    /// opted into always-validate. With `return_all_errors` off, the first
    /// failure short-circuits.
    pub fn validate(&self) -> Vec<ValidationFailure> {
        let return_all = self.def.settings.return_all_errors;
        let mut failures = Vec::new();
        for validation in self.def.validations() {
            let value = self.get(&validation.property).unwrap_or(Value::Null);
            let always = self
                .def
                .property(&validation.property)
                .is_some_and(|p| p.always_validate);
            if value.is_null() && !matches!(validation.rule, Rule::Required) && !always {
                continue;
            }
            if let Some(failure) = validation.check(&value) {
                failures.push(failure);
                if !return_all {
                    break;
                }
            }
        }
        failures
    }

    // ------------------------------------------------------------------
    // Save pipeline
    // ------------------------------------------------------------------

    /// Save with cascading association writes.
    pub fn save<'a>(&'a self, cx: &'a Cx) -> DriverFuture<'a, ()> {
        self.save_with(cx, SaveOptions::default())
    }

    /// Assign the given property values, then save.
    pub fn save_values<'a>(
        &'a self,
        cx: &'a Cx,
        data: Vec<(String, Value)>,
    ) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            for (name, value) in data {
                if let Err(err) = self.assign(&name, value) {
                    return Outcome::Err(err);
                }
            }
            self.save(cx).await
        })
    }

    /// Run the save pipeline: before-hooks, validation, insert or update,
    /// staged associations, join-table extras, after-hooks.
    ///
    /// A cascading save re-entering an instance already mid-save is a
    /// success no-op; non-cascading re-entry runs fully, which is how
    /// association writers flush freshly copied foreign keys.
    pub fn save_with<'a>(&'a self, cx: &'a Cx, options: SaveOptions) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            {
                let state = self.state.read().expect("lock poisoned");
                if state.removed {
                    return Outcome::Err(Error::NotDefined(format!(
                        "instance of '{}' was removed",
                        self.def.table
                    )));
                }
                if state.saving && options.cascade {
                    return Outcome::Ok(());
                }
            }
            let was_saving = {
                let mut state = self.state.write().expect("lock poisoned");
                std::mem::replace(&mut state.saving, true)
            };
            let result = self.run_save_pipeline(cx, options).await;
            self.state.write().expect("lock poisoned").saving = was_saving;

            match result {
                Outcome::Ok(was_fresh) => {
                    let hooks = self.def.hooks();
                    if was_fresh {
                        hooks.trigger(AfterKind::Create, self, true);
                    }
                    hooks.trigger(AfterKind::Save, self, true);
                    self.emit(InstanceEvent::Save, None);
                    Outcome::Ok(())
                }
                Outcome::Err(err) => {
                    self.def.hooks().trigger(AfterKind::Save, self, false);
                    self.emit(InstanceEvent::Save, Some(&err));
                    Outcome::Err(err)
                }
                Outcome::Cancelled(reason) => Outcome::Cancelled(reason),
                Outcome::Panicked(payload) => Outcome::Panicked(payload),
            }
        })
    }

    async fn run_save_pipeline(&self, cx: &Cx, options: SaveOptions) -> Outcome<bool, Error> {
        let hooks = self.def.hooks();
        if let Err(err) = hooks.wait(BeforeKind::Validation, self) {
            return Outcome::Err(err);
        }
        let failures = self.validate();
        if !failures.is_empty() {
            return Outcome::Err(Error::Validation(failures));
        }

        let was_fresh = self.state.read().expect("lock poisoned").fresh;
        if was_fresh {
            try_outcome!(self.save_new(cx, &hooks).await);
        } else {
            try_outcome!(self.save_existing(cx, &hooks).await);
        }
        if options.cascade {
            try_outcome!(self.save_staged_associations(cx).await);
        }
        try_outcome!(self.flush_extras(cx).await);
        Outcome::Ok(was_fresh)
    }

    #[tracing::instrument(level = "debug", skip(self, cx, hooks), fields(table = %self.def.table))]
    async fn save_new(&self, cx: &Cx, hooks: &Hooks) -> Outcome<(), Error> {
        if let Err(err) = hooks.wait(BeforeKind::Create, self) {
            return Outcome::Err(err);
        }
        if let Err(err) = hooks.wait(BeforeKind::Save, self) {
            return Outcome::Err(err);
        }

        let mut data = Vec::new();
        for property in self.def.properties() {
            let value = self.get(&property.name).unwrap_or(Value::Null);
            // The store generates missing serials.
            if property.is_serial() && value.is_null() {
                continue;
            }
            data.push((
                property.maps_to.clone(),
                self.core.driver.property_to_value(value, &property),
            ));
        }

        let key_properties = self.def.key_properties();
        let result = try_outcome!(
            self.core
                .driver
                .insert(cx, &self.def.table, &data, &key_properties, self.connection())
                .await
        );

        {
            let mut state = self.state.write().expect("lock poisoned");
            for (name, value) in result.generated {
                if let Some(property) = self.def.property(&name) {
                    let coerced = self.core.driver.value_to_property(value, &property);
                    state.values.insert(name, coerced);
                }
            }
            state.fresh = false;
            state.persisted = true;
            state.shell = false;
            state.dirty.clear();
        }
        self.remember_keys();
        self.register_identity();
        Outcome::Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, cx, hooks), fields(table = %self.def.table))]
    async fn save_existing(&self, cx: &Cx, hooks: &Hooks) -> Outcome<(), Error> {
        if let Err(err) = hooks.wait(BeforeKind::Save, self) {
            return Outcome::Err(err);
        }

        let dirty = self.dirty_properties();
        if dirty.is_empty() {
            // Idempotent: nothing changed, no write issued.
            return Outcome::Ok(());
        }

        let mut changes = Vec::new();
        for name in &dirty {
            let Some(property) = self.def.property(name) else {
                continue;
            };
            let value = self.get(name).unwrap_or(Value::Null);
            changes.push((
                property.maps_to.clone(),
                self.core.driver.property_to_value(value, &property),
            ));
        }

        let conditions = self.original_key_conditions();
        try_outcome!(
            self.core
                .driver
                .update(cx, &self.def.table, &changes, &conditions, self.connection())
                .await
        );
        self.state.write().expect("lock poisoned").dirty.clear();
        self.remember_keys();
        self.register_identity();
        Outcome::Ok(())
    }

    async fn save_staged_associations(&self, cx: &Cx) -> Outcome<(), Error> {
        let staged: Vec<String> = {
            let state = self.state.read().expect("lock poisoned");
            state.staged.clone()
        };

        for name in staged {
            let related = {
                let state = self.state.read().expect("lock poisoned");
                state.related.get(&name).cloned()
            };
            let Some(related) = related else { continue };

            match self.def.find_association(&name) {
                Some(AssociationRef::One(assoc)) if !assoc.reversed => match related {
                    Related::One(Some(other)) => {
                        try_outcome!(one::set(cx, self, &assoc, &other).await);
                    }
                    Related::One(None) => {
                        try_outcome!(one::clear(cx, self, &assoc).await);
                    }
                    Related::Many(_) => {
                        return Outcome::Err(Error::ParamMismatch(format!(
                            "association '{name}' holds a single reference"
                        )));
                    }
                },
                Some(AssociationRef::One(assoc)) => match related {
                    Related::Many(items) => {
                        try_outcome!(one::set_reversed(cx, self, &assoc, &items).await);
                    }
                    Related::One(Some(other)) => {
                        let items = [other];
                        try_outcome!(one::set_reversed(cx, self, &assoc, &items).await);
                    }
                    Related::One(None) => {}
                },
                Some(AssociationRef::Many(assoc)) => match related {
                    Related::Many(items) => {
                        try_outcome!(many::set(cx, self, &assoc, &items).await);
                    }
                    Related::One(_) => {
                        return Outcome::Err(Error::ParamMismatch(format!(
                            "association '{name}' holds a collection"
                        )));
                    }
                },
                Some(AssociationRef::Extend(assoc)) => match related {
                    Related::One(Some(extension)) => {
                        try_outcome!(extend::set(cx, self, &assoc, &extension).await);
                    }
                    Related::One(None) => {
                        try_outcome!(extend::remove_extensions(cx, self, &assoc).await);
                    }
                    Related::Many(_) => {
                        return Outcome::Err(Error::ParamMismatch(format!(
                            "association '{name}' holds a single extension"
                        )));
                    }
                },
                None => {}
            }
        }

        self.state.write().expect("lock poisoned").staged.clear();
        Outcome::Ok(())
    }

    async fn flush_extras(&self, cx: &Cx) -> Outcome<(), Error> {
        let (dirty, link) = {
            let state = self.state.read().expect("lock poisoned");
            (state.extra_dirty.clone(), state.extra_link.clone())
        };
        if dirty.is_empty() {
            return Outcome::Ok(());
        }
        let Some(link) = link else {
            return Outcome::Ok(());
        };

        let changes: Vec<(String, Value)> = dirty
            .iter()
            .map(|name| (name.clone(), self.get_extra(name).unwrap_or(Value::Null)))
            .collect();
        try_outcome!(
            self.core
                .driver
                .update(cx, &link.join_table, &changes, &link.conditions, self.connection())
                .await
        );
        self.state.write().expect("lock poisoned").extra_dirty.clear();
        Outcome::Ok(())
    }

    // ------------------------------------------------------------------
    // Remove pipeline
    // ------------------------------------------------------------------

    /// Delete the backing row. Extension rows cascade when the model's
    /// cascade-remove setting is on. Unsaved instances are a no-op.
    pub fn remove<'a>(&'a self, cx: &'a Cx) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            {
                let state = self.state.read().expect("lock poisoned");
                if state.removed || (state.fresh && !state.persisted) {
                    return Outcome::Ok(());
                }
            }

            let hooks = self.def.hooks();
            if let Err(err) = hooks.wait(BeforeKind::Remove, self) {
                return Outcome::Err(err);
            }

            if self.def.settings.cascade_remove {
                for assoc in self.def.extend_associations() {
                    try_outcome!(extend::remove_extensions(cx, self, &assoc).await);
                }
            }

            let conditions = self.original_key_conditions();
            match self
                .core
                .driver
                .remove(cx, &self.def.table, &conditions, self.connection())
                .await
            {
                Outcome::Ok(_) => {}
                Outcome::Err(err) => {
                    hooks.trigger(AfterKind::Remove, self, false);
                    self.emit(InstanceEvent::Remove, Some(&err));
                    return Outcome::Err(err);
                }
                Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
                Outcome::Panicked(payload) => return Outcome::Panicked(payload),
            }

            if let Some(uid) = self.uid() {
                self.core.cache.evict(&uid);
            }
            {
                let mut state = self.state.write().expect("lock poisoned");
                state.removed = true;
                state.persisted = false;
            }
            hooks.trigger(AfterKind::Remove, self, true);
            self.emit(InstanceEvent::Remove, None);
            Outcome::Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Lazy properties
    // ------------------------------------------------------------------

    /// Fetch one property from the store, bypassing the identity cache,
    /// and remember it without dirtying.
    pub async fn load_property(&self, cx: &Cx, name: &str) -> Outcome<Value, Error> {
        let Some(property) = self.def.property(name) else {
            return Outcome::Err(Error::NotDefined(format!(
                "property '{name}' on '{}'",
                self.def.table
            )));
        };

        let fields = vec![property.maps_to.clone()];
        let conditions = self.original_key_conditions();
        let options = FindOptions {
            limit: Some(1),
            ..FindOptions::default()
        };
        let rows = try_outcome!(
            self.core
                .driver
                .find(cx, &fields, &self.def.table, &conditions, &options)
                .await
        );
        let Some(row) = rows.into_iter().next() else {
            return Outcome::Err(Error::not_found(&self.def.table));
        };

        let value = row.get(&property.maps_to).cloned().unwrap_or(Value::Null);
        let value = self.core.driver.value_to_property(value, &property);
        self.hydrate_value(name, value.clone());
        Outcome::Ok(value)
    }

    /// Write one property straight to the store, skipping the save
    /// pipeline. The property leaves the dirty set on success.
    pub async fn save_property(
        &self,
        cx: &Cx,
        name: &str,
        value: impl Into<Value>,
    ) -> Outcome<(), Error> {
        let Some(property) = self.def.property(name) else {
            return Outcome::Err(Error::NotDefined(format!(
                "property '{name}' on '{}'",
                self.def.table
            )));
        };

        let coerced = self.core.driver.value_to_property(value.into(), &property);
        self.hydrate_value(name, coerced.clone());
        let stored = self.core.driver.property_to_value(coerced, &property);
        let conditions = self.original_key_conditions();
        try_outcome!(
            self.core
                .driver
                .update(
                    cx,
                    &self.def.table,
                    &[(property.maps_to.clone(), stored)],
                    &conditions,
                    self.connection(),
                )
                .await
        );
        self.state
            .write()
            .expect("lock poisoned")
            .dirty
            .retain(|d| d != name);
        Outcome::Ok(())
    }

    /// Null a property in memory and in the store.
    pub async fn clear_property(&self, cx: &Cx, name: &str) -> Outcome<(), Error> {
        self.save_property(cx, name, Value::Null).await
    }

    // ------------------------------------------------------------------
    // Associations
    // ------------------------------------------------------------------

    /// Resolve an association by name, preferring a previously fetched or
    /// staged value.
    pub async fn get_related(&self, cx: &Cx, name: &str) -> Outcome<Related, Error> {
        if let Some(related) = self.cached_related(name) {
            return Outcome::Ok(related);
        }
        self.get_related_with_depth(cx, name, self.def.settings.auto_fetch_limit)
            .await
    }

    /// Resolve an association from the store, with `depth` levels of
    /// auto-fetch left for the fetched instances.
    pub(crate) fn get_related_with_depth<'a>(
        &'a self,
        cx: &'a Cx,
        name: &'a str,
        depth: u32,
    ) -> DriverFuture<'a, Related> {
        Box::pin(async move {
            match self.def.find_association(name) {
                Some(AssociationRef::One(assoc)) => {
                    if assoc.reversed {
                        let items = try_outcome!(one::get_reversed(cx, self, &assoc, depth).await);
                        Outcome::Ok(Related::Many(items))
                    } else {
                        let item = try_outcome!(one::get(cx, self, &assoc, depth).await);
                        Outcome::Ok(Related::One(item))
                    }
                }
                Some(AssociationRef::Many(assoc)) => {
                    let items = try_outcome!(many::get(cx, self, &assoc, None, depth).await);
                    Outcome::Ok(Related::Many(items))
                }
                Some(AssociationRef::Extend(assoc)) => {
                    let item = try_outcome!(extend::get(cx, self, &assoc, depth).await);
                    Outcome::Ok(Related::One(item))
                }
                None => Outcome::Err(Error::NotDefined(format!(
                    "association '{name}' on '{}'",
                    self.def.table
                ))),
            }
        })
    }

    /// Resolve a collection association filtered by extra conditions on
    /// the related table.
    pub async fn find_related(
        &self,
        cx: &Cx,
        name: &str,
        conditions: Conditions,
    ) -> Outcome<Vec<Instance>, Error> {
        let Some(assoc) = self.def.many_assoc(name) else {
            return Outcome::Err(Error::ParamMismatch(format!(
                "'{name}' is not a collection association on '{}'",
                self.def.table
            )));
        };
        many::get(cx, self, &assoc, Some(conditions), 0).await
    }

    /// Replace an association's value in the store immediately.
    pub async fn set_related(
        &self,
        cx: &Cx,
        name: &str,
        related: Related,
    ) -> Outcome<(), Error> {
        match self.def.find_association(name) {
            Some(AssociationRef::One(assoc)) if !assoc.reversed => match &related {
                Related::One(Some(other)) => {
                    try_outcome!(one::set(cx, self, &assoc, other).await);
                }
                Related::One(None) => {
                    try_outcome!(one::clear(cx, self, &assoc).await);
                }
                Related::Many(_) => {
                    return Outcome::Err(Error::ParamMismatch(format!(
                        "association '{name}' holds a single reference"
                    )));
                }
            },
            Some(AssociationRef::One(assoc)) => match &related {
                Related::Many(items) => {
                    try_outcome!(one::set_reversed(cx, self, &assoc, items).await);
                }
                Related::One(Some(other)) => {
                    let items = [other.clone()];
                    try_outcome!(one::set_reversed(cx, self, &assoc, &items).await);
                }
                Related::One(None) => {}
            },
            Some(AssociationRef::Many(assoc)) => match &related {
                Related::Many(items) => {
                    try_outcome!(many::set(cx, self, &assoc, items).await);
                }
                Related::One(_) => {
                    return Outcome::Err(Error::ParamMismatch(format!(
                        "association '{name}' holds a collection"
                    )));
                }
            },
            Some(AssociationRef::Extend(assoc)) => match &related {
                Related::One(Some(extension)) => {
                    try_outcome!(extend::set(cx, self, &assoc, extension).await);
                }
                Related::One(None) => {
                    try_outcome!(extend::remove_extensions(cx, self, &assoc).await);
                }
                Related::Many(_) => {
                    return Outcome::Err(Error::ParamMismatch(format!(
                        "association '{name}' holds a single extension"
                    )));
                }
            },
            None => {
                return Outcome::Err(Error::NotDefined(format!(
                    "association '{name}' on '{}'",
                    self.def.table
                )));
            }
        }
        self.store_related(name, related);
        Outcome::Ok(())
    }

    /// Link items into a collection association, with optional join-table
    /// extra values.
    pub async fn add_related(
        &self,
        cx: &Cx,
        name: &str,
        items: &[Instance],
        extra: Vec<(String, Value)>,
    ) -> Outcome<(), Error> {
        let Some(assoc) = self.def.many_assoc(name) else {
            return Outcome::Err(Error::ParamMismatch(format!(
                "'{name}' is not a collection association on '{}'",
                self.def.table
            )));
        };
        try_outcome!(many::add(cx, self, &assoc, items, &extra).await);
        self.clear_cached_related(name);
        Outcome::Ok(())
    }

    /// Whether the given items are all linked through the association.
    pub async fn has_related(
        &self,
        cx: &Cx,
        name: &str,
        items: &[Instance],
    ) -> Outcome<bool, Error> {
        match self.def.find_association(name) {
            Some(AssociationRef::One(assoc)) => one::has(cx, self, &assoc, items).await,
            Some(AssociationRef::Many(assoc)) => many::has(cx, self, &assoc, items).await,
            Some(AssociationRef::Extend(assoc)) => extend::has(cx, self, &assoc).await,
            None => Outcome::Err(Error::NotDefined(format!(
                "association '{name}' on '{}'",
                self.def.table
            ))),
        }
    }

    /// Unlink items, or everything when `items` is empty.
    pub async fn remove_related(
        &self,
        cx: &Cx,
        name: &str,
        items: &[Instance],
    ) -> Outcome<(), Error> {
        match self.def.find_association(name) {
            Some(AssociationRef::One(assoc)) => {
                if assoc.reversed {
                    return Outcome::Err(Error::ParamMismatch(format!(
                        "'{name}' is a reversed reference, remove it from the owning side"
                    )));
                }
                try_outcome!(one::clear(cx, self, &assoc).await);
            }
            Some(AssociationRef::Many(assoc)) => {
                try_outcome!(many::remove(cx, self, &assoc, items).await);
            }
            Some(AssociationRef::Extend(assoc)) => {
                try_outcome!(extend::remove_extensions(cx, self, &assoc).await);
            }
            None => {
                return Outcome::Err(Error::NotDefined(format!(
                    "association '{name}' on '{}'",
                    self.def.table
                )));
            }
        }
        self.clear_cached_related(name);
        Outcome::Ok(())
    }

    /// Stage an association value for the next cascading save.
    pub fn stage_related(&self, name: &str, related: Related) {
        let mut state = self.state.write().expect("lock poisoned");
        state.related.insert(name.to_string(), related);
        if !state.staged.iter().any(|s| s == name) {
            state.staged.push(name.to_string());
        }
    }

    /// Flag the cached association value as changed so the next cascading
    /// save writes it, without replacing the cached value itself.
    pub fn mark_related_changed(&self, name: &str) -> Result<()> {
        if self.def.find_association(name).is_none() {
            return Err(Error::NotDefined(format!(
                "association '{name}' on '{}'",
                self.def.table
            )));
        }
        let mut state = self.state.write().expect("lock poisoned");
        if !state.staged.iter().any(|s| s == name) {
            state.staged.push(name.to_string());
        }
        Ok(())
    }

    /// Remember a resolved association value without staging it.
    pub(crate) fn store_related(&self, name: &str, related: Related) {
        self.state
            .write()
            .expect("lock poisoned")
            .related
            .insert(name.to_string(), related);
    }

    /// A previously fetched or staged association value.
    pub fn cached_related(&self, name: &str) -> Option<Related> {
        self.state
            .read()
            .expect("lock poisoned")
            .related
            .get(name)
            .cloned()
    }

    fn clear_cached_related(&self, name: &str) {
        self.state
            .write()
            .expect("lock poisoned")
            .related
            .remove(name);
    }

    pub(crate) fn trigger_after_load(&self) {
        self.def.hooks().trigger(AfterKind::Load, self, true);
    }

    pub(crate) fn trigger_after_auto_fetch(&self) {
        self.def.hooks().trigger(AfterKind::AutoFetch, self, true);
    }

    pub(crate) fn mark_ready(&self) {
        self.emit(InstanceEvent::Ready, None);
    }

    /// Hydrate a shell instance's columns from the store, preserving any
    /// dirty values assigned before the load.
    pub async fn hydrate(&self, cx: &Cx) -> Outcome<(), Error> {
        if !self.is_shell() {
            return Outcome::Ok(());
        }
        let fields = self.def.default_fields();
        let conditions = self.original_key_conditions();
        let options = FindOptions {
            limit: Some(1),
            ..FindOptions::default()
        };
        let rows = try_outcome!(
            self.core
                .driver
                .find(cx, &fields, &self.def.table, &conditions, &options)
                .await
        );
        let Some(row) = rows.into_iter().next() else {
            return Outcome::Err(Error::not_found(&self.def.table));
        };

        {
            let mut state = self.state.write().expect("lock poisoned");
            for (column, value) in row.into_pairs() {
                if let Some(property) = self.def.property_for_column(&column) {
                    if state.dirty.iter().any(|d| *d == property.name) {
                        continue;
                    }
                    let coerced = self.core.driver.value_to_property(value, &property);
                    state.values.insert(property.name, coerced);
                }
            }
            state.shell = false;
        }
        Outcome::Ok(())
    }

    /// Resolve auto-fetched associations for this instance.
    pub async fn auto_fetch(&self, cx: &Cx, depth: u32) -> Outcome<(), Error> {
        associations::auto_fetch(cx, self, depth).await
    }
}

/// Set a leaf inside a JSON tree, creating intermediate objects and
/// replacing non-object nodes along the way.
fn set_json_path(
    tree: serde_json::Value,
    segments: &[&str],
    leaf: serde_json::Value,
) -> serde_json::Value {
    let Some((head, rest)) = segments.split_first() else {
        return leaf;
    };
    let mut map = match tree {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    let child = map.remove(*head).unwrap_or(serde_json::Value::Null);
    map.insert((*head).to_string(), set_json_path(child, rest, leaf));
    serde_json::Value::Object(map)
}

/// Render an engine value as plain JSON.
fn value_to_json(value: Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(b),
        Value::Integer(i) => serde_json::Value::from(i),
        Value::Real(r) => serde_json::Number::from_f64(r)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::Text(t) => serde_json::Value::String(t),
        Value::Bytes(bytes) => serde_json::Value::Array(
            bytes
                .into_iter()
                .map(|byte| serde_json::Value::from(i64::from(byte)))
                .collect(),
        ),
        Value::Date(d) => serde_json::Value::from(d),
        Value::Json(v) => v,
    }
}
