//! Lazy query chains.
//!
//! A chain accumulates conditions, projection, ordering, and joins in
//! logical property-name space; nothing touches the driver until a
//! terminal runs. Property names are translated to storage columns at the
//! last moment, and condition fields naming a single-field scalar
//! association are rewritten to its foreign key.

use crate::associations::{ManyAssociation, Related};
use crate::instance::{ExtraLink, Instance};
use crate::model::{InstantiateOptions, Model};
use liverow_core::{
    Conditions, CountOptions, Cx, Direction, EagerSpec, Error, ExistsLink, FindOptions, Merge,
    Order, Outcome, PARENT_KEY_COLUMN, Property, Value, try_outcome,
};
use std::collections::HashMap;

/// Join-table context threaded to instances materialized by a collection
/// association chain, so extra properties can be written back.
#[derive(Debug, Clone)]
pub(crate) struct ExtraLinkSpec {
    pub join_table: String,
    /// Join columns pinned to the owning instance's key values
    pub owner_pairs: Vec<(String, Value)>,
    /// Join columns matched against each materialized instance's keys
    pub related_link: Vec<String>,
    pub properties: Vec<Property>,
}

/// A lazy query over one model.
#[derive(Debug, Clone)]
pub struct Chain {
    model: Model,
    conditions: Conditions,
    only: Option<Vec<String>>,
    order: Vec<Order>,
    limit: Option<usize>,
    offset: Option<usize>,
    merge: Option<Merge>,
    exists: Vec<ExistsLink>,
    eager: Vec<String>,
    fetch_depth: Option<u32>,
    extra_link: Option<ExtraLinkSpec>,
}

impl Chain {
    pub(crate) fn new(model: Model) -> Self {
        Self {
            model,
            conditions: Conditions::new(),
            only: None,
            order: Vec::new(),
            limit: None,
            offset: None,
            merge: None,
            exists: Vec::new(),
            eager: Vec::new(),
            fetch_depth: None,
            extra_link: None,
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Narrow the chain with more conditions (conjunction).
    #[must_use]
    pub fn find(mut self, conditions: Conditions) -> Self {
        self.conditions.merge(conditions);
        self
    }

    /// Attach a raw driver condition fragment.
    #[must_use]
    pub fn raw_condition(mut self, expr: impl Into<String>, params: Vec<Value>) -> Self {
        self.conditions = self.conditions.raw(expr, params);
        self
    }

    /// Project only the given properties. Projected runs bypass the
    /// identity cache so narrowed views never alias cached full instances.
    #[must_use]
    pub fn only<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Project every property except the given ones.
    #[must_use]
    pub fn omit<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let omitted: Vec<String> = names.into_iter().map(Into::into).collect();
        let kept: Vec<String> = self
            .model
            .def()
            .property_names()
            .into_iter()
            .filter(|name| !omitted.contains(name))
            .collect();
        self.only(kept)
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Alias for [`Chain::offset`].
    #[must_use]
    pub fn skip(self, offset: usize) -> Self {
        self.offset(offset)
    }

    /// Append an order entry using the `"field"` / `"-field"` shorthand.
    #[must_use]
    pub fn order(mut self, spec: &str) -> Self {
        self.order.push(Order::parse(spec));
        self
    }

    /// Append a raw driver order fragment.
    #[must_use]
    pub fn order_raw(mut self, expr: impl Into<String>, params: Vec<Value>) -> Self {
        self.order.push(Order::Raw {
            expr: expr.into(),
            params,
        });
        self
    }

    /// Batch-load a collection association onto every result.
    #[must_use]
    pub fn eager(mut self, association: impl Into<String>) -> Self {
        self.eager.push(association.into());
        self
    }

    /// Keep only rows linked to all of `items` through a collection
    /// association.
    pub fn has_related(
        mut self,
        association: &str,
        items: &[Instance],
    ) -> Result<Self, Error> {
        let Some(assoc) = self.model.def().many_assoc(association) else {
            return Err(Error::NotDefined(format!(
                "collection association '{association}' on '{}'",
                self.model.table()
            )));
        };

        let mut conditions = Conditions::new();
        if !items.is_empty() {
            let groups: Vec<Conditions> = items
                .iter()
                .map(|item| {
                    let mut group = Conditions::new();
                    for (link, value) in assoc.related_link.iter().zip(item.key_values()) {
                        group = group.eq(link.clone(), value);
                    }
                    group
                })
                .collect();
            conditions = conditions.or(groups);
        }

        self.exists.push(ExistsLink {
            table: assoc.join_table,
            link: assoc.owner_link,
            base_keys: self.model.def().key_columns(),
            conditions,
        });
        Ok(self)
    }

    #[must_use]
    pub(crate) fn with_merge(mut self, merge: Merge) -> Self {
        self.merge = Some(merge);
        self
    }

    #[must_use]
    pub(crate) fn with_fetch_depth(mut self, depth: u32) -> Self {
        self.fetch_depth = Some(depth);
        self
    }

    #[must_use]
    pub(crate) fn with_extra_link(mut self, spec: ExtraLinkSpec) -> Self {
        self.extra_link = Some(spec);
        self
    }

    /// Translate a condition or order field to column space, routing
    /// single-field scalar association names through their foreign key.
    fn rename(&self, field: &str) -> String {
        let def = self.model.def();
        if let Some(assoc) = def.one_assoc(field) {
            if assoc.fields.len() == 1 {
                return def.column_for(&assoc.fields[0]);
            }
        }
        def.column_for(field)
    }

    fn compiled_fields(&self) -> Vec<String> {
        let def = self.model.def();
        match &self.only {
            Some(names) => names.iter().map(|name| def.column_for(name)).collect(),
            None => def.default_fields(),
        }
    }

    fn compiled_options(&self) -> FindOptions {
        FindOptions {
            limit: self.limit,
            offset: self.offset,
            order: self
                .order
                .iter()
                .cloned()
                .map(|order| order.map_field(|f| self.rename(f)))
                .collect(),
            merge: self.merge.clone(),
            exists: self.exists.clone(),
        }
    }

    /// Materialize the chain.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(table = %self.model.table()))]
    pub async fn run(&self, cx: &Cx) -> Outcome<Vec<Instance>, Error> {
        let def = self.model.def();
        let conditions = self.conditions.clone().map_fields(|f| self.rename(f));
        let fields = self.compiled_fields();
        let options = self.compiled_options();

        let rows = try_outcome!(
            self.model
                .core
                .driver
                .find(cx, &fields, self.model.table(), &conditions, &options)
                .await
        );

        let settings = &def.settings;
        let (auto_fetch, depth) = match self.fetch_depth {
            Some(depth) => (depth > 0, depth),
            None => (settings.auto_fetch, settings.auto_fetch_limit),
        };
        let key_columns = def.key_columns();

        let mut instances = Vec::with_capacity(rows.len());
        for row in rows {
            let pairs = row.into_pairs();
            let extra_link = self.extra_link.as_ref().map(|spec| {
                let mut link_conditions = Conditions::new();
                for (column, value) in &spec.owner_pairs {
                    link_conditions = link_conditions.eq(column.clone(), value.clone());
                }
                for (link, key_column) in spec.related_link.iter().zip(&key_columns) {
                    let value = pairs
                        .iter()
                        .find(|(column, _)| column == key_column)
                        .map_or(Value::Null, |(_, v)| v.clone());
                    link_conditions = link_conditions.eq(link.clone(), value);
                }
                ExtraLink {
                    join_table: spec.join_table.clone(),
                    conditions: link_conditions,
                }
            });

            // Explicit projections never resolve (or register) cached full
            // instances; the caller asked for a narrowed view.
            let instantiate = InstantiateOptions {
                identity: settings.identity_cache && self.only.is_none(),
                save_check: settings.identity_cache_save_check,
                auto_fetch,
                depth,
                uid_suffix: self.extra_link.as_ref().map(|s| s.join_table.clone()),
                extra_properties: self
                    .extra_link
                    .as_ref()
                    .map(|s| s.properties.clone())
                    .unwrap_or_default(),
                extra_link,
            };
            instances.push(try_outcome!(self.model.instantiate(cx, pairs, instantiate).await));
        }

        for name in &self.eager {
            let Some(assoc) = def.many_assoc(name) else {
                return Outcome::Err(Error::NotDefined(format!(
                    "collection association '{name}' on '{}'",
                    self.model.table()
                )));
            };
            try_outcome!(self.run_eager(cx, &assoc, &instances).await);
        }

        Outcome::Ok(instances)
    }

    /// One batched round-trip per eager association: fetch every related
    /// row for all parents at once, then bucket them by the synthetic
    /// parent key column.
    async fn run_eager(
        &self,
        cx: &Cx,
        assoc: &ManyAssociation,
        parents: &[Instance],
    ) -> Outcome<(), Error> {
        if parents.is_empty() {
            return Outcome::Ok(());
        }
        let target = match Model::from_weak(&assoc.target, &self.model.core) {
            Ok(target) => target,
            Err(err) => return Outcome::Err(err),
        };

        let keys = self.model.def().keys();
        let Some(key) = keys.first().filter(|_| keys.len() == 1) else {
            return Outcome::Err(Error::NoSupport(format!(
                "eager loading needs a single key property on '{}'",
                self.model.table()
            )));
        };

        let parent_keys: Vec<Value> = parents
            .iter()
            .map(|parent| parent.get(key).unwrap_or(Value::Null))
            .collect();
        let spec = EagerSpec {
            join_table: assoc.join_table.clone(),
            owner_link: assoc.owner_link.clone(),
            related_link: assoc.related_link.clone(),
            related_table: target.table().to_string(),
            related_keys: target.def().key_columns(),
            fields: target.def().default_fields(),
            extra_fields: assoc.extra.iter().map(|p| p.maps_to.clone()).collect(),
        };

        let rows = try_outcome!(
            self.model
                .core
                .driver
                .eager_query(cx, &spec, &parent_keys)
                .await
        );

        let mut buckets: HashMap<String, Vec<Vec<(String, Value)>>> = HashMap::new();
        for row in rows {
            let pairs = row.into_pairs();
            let parent_fragment = pairs
                .iter()
                .find(|(column, _)| column == PARENT_KEY_COLUMN)
                .map_or_else(|| Value::Null.uid_fragment(), |(_, v)| v.uid_fragment());
            buckets.entry(parent_fragment).or_default().push(pairs);
        }

        let target_settings = &target.def().settings;
        for parent in parents {
            let fragment = parent.get(key).unwrap_or(Value::Null).uid_fragment();
            let mut related = Vec::new();
            for pairs in buckets.remove(&fragment).unwrap_or_default() {
                let options = InstantiateOptions {
                    identity: target_settings.identity_cache,
                    save_check: target_settings.identity_cache_save_check,
                    ..InstantiateOptions::default()
                };
                related.push(try_outcome!(target.instantiate(cx, pairs, options).await));
            }
            parent.store_related(&assoc.name, Related::Many(related));
        }
        Outcome::Ok(())
    }

    /// Count matching rows. Projection, order, and pagination are ignored.
    pub async fn count(&self, cx: &Cx) -> Outcome<i64, Error> {
        let conditions = self.conditions.clone().map_fields(|f| self.rename(f));
        let options = CountOptions {
            merge: self.merge.clone(),
        };
        self.model
            .core
            .driver
            .count(cx, self.model.table(), &conditions, &options)
            .await
    }

    /// Delete matching rows in two phases: select key tuples with the full
    /// chain semantics, then delete by key. Returns the number of rows
    /// removed.
    pub async fn remove(&self, cx: &Cx) -> Outcome<u64, Error> {
        let def = self.model.def();
        let key_columns = def.key_columns();
        let conditions = self.conditions.clone().map_fields(|f| self.rename(f));
        let options = self.compiled_options();

        let rows = try_outcome!(
            self.model
                .core
                .driver
                .find(cx, &key_columns, self.model.table(), &conditions, &options)
                .await
        );
        if rows.is_empty() {
            return Outcome::Ok(0);
        }

        let mut key_tuples = Vec::with_capacity(rows.len());
        let groups: Vec<Conditions> = rows
            .into_iter()
            .map(|row| {
                let pairs = row.into_pairs();
                let tuple: Vec<Value> = key_columns
                    .iter()
                    .map(|column| {
                        pairs
                            .iter()
                            .find(|(c, _)| c == column)
                            .map_or(Value::Null, |(_, v)| v.clone())
                    })
                    .collect();
                let mut group = Conditions::new();
                for (column, value) in key_columns.iter().zip(tuple.iter().cloned()) {
                    group = group.eq(column.clone(), value);
                }
                key_tuples.push(tuple);
                group
            })
            .collect();
        let delete = Conditions::new().or(groups);

        let removed = try_outcome!(
            self.model
                .core
                .driver
                .remove(cx, self.model.table(), &delete, None)
                .await
        );

        for tuple in key_tuples {
            let uid = self.model.uid_for_keys(&tuple);
            self.model.core.cache.evict(&uid);
        }
        Outcome::Ok(removed)
    }

    /// The first matching instance in chain order.
    pub async fn first(mut self, cx: &Cx) -> Outcome<Option<Instance>, Error> {
        self.limit = Some(1);
        let instances = try_outcome!(self.run(cx).await);
        Outcome::Ok(instances.into_iter().next())
    }

    /// The last matching instance: reversed order, limit one. With no
    /// explicit order, keys descending.
    pub async fn last(mut self, cx: &Cx) -> Outcome<Option<Instance>, Error> {
        if self.order.is_empty() {
            self.order = self
                .model
                .def()
                .keys()
                .into_iter()
                .map(|key| Order::By {
                    field: key,
                    direction: Direction::Descending,
                })
                .collect();
        } else {
            self.order = self
                .order
                .into_iter()
                .map(|order| match order {
                    Order::By { field, direction } => Order::By {
                        field,
                        direction: match direction {
                            Direction::Ascending => Direction::Descending,
                            Direction::Descending => Direction::Ascending,
                        },
                    },
                    raw @ Order::Raw { .. } => raw,
                })
                .collect();
        }
        self.limit = Some(1);
        let instances = try_outcome!(self.run(cx).await);
        Outcome::Ok(instances.into_iter().next())
    }

    /// Switch to in-memory iteration over one materialized run.
    #[must_use]
    pub fn each(self) -> crate::chain_iter::ChainIterate {
        crate::chain_iter::ChainIterate::new(self)
    }
}
