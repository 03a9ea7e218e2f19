//! Collection association resolution through a join table.

use crate::associations::ManyAssociation;
use crate::chain::{Chain, ExtraLinkSpec};
use crate::instance::{Instance, SaveOptions};
use crate::model::Model;
use liverow_core::{
    Conditions, CountOptions, Cx, Error, Merge, Outcome, Result, Value, try_outcome,
};

/// Chain over the target model restricted to rows linked to `owner`.
///
/// The merge joins the join table onto the target by its key columns;
/// extra join-table columns are projected onto results and wired up so
/// instances can write them back.
pub(crate) fn chain(owner: &Instance, assoc: &ManyAssociation) -> Result<Chain> {
    let target = Model::from_weak(&assoc.target, owner.core())?;
    let owner_keys = owner.key_values();

    let mut conditions = Conditions::new();
    for (link, value) in assoc.owner_link.iter().zip(owner_keys.iter().cloned()) {
        conditions = conditions.eq(link.clone(), value);
    }

    let merge = Merge {
        from_table: assoc.join_table.clone(),
        from_fields: assoc.related_link.clone(),
        to_table: target.table().to_string(),
        to_fields: target.def().key_columns(),
        hop: None,
        conditions,
        select_extra: assoc.extra.iter().map(|p| p.maps_to.clone()).collect(),
    };

    let mut chain = Chain::new(target).with_merge(merge);
    if !assoc.extra.is_empty() {
        chain = chain.with_extra_link(ExtraLinkSpec {
            join_table: assoc.join_table.clone(),
            owner_pairs: assoc
                .owner_link
                .iter()
                .cloned()
                .zip(owner_keys)
                .collect(),
            related_link: assoc.related_link.clone(),
            properties: assoc.extra.clone(),
        });
    }
    Ok(chain)
}

/// Fetch linked instances, optionally filtered by target-side conditions.
pub(crate) async fn get(
    cx: &Cx,
    owner: &Instance,
    assoc: &ManyAssociation,
    conditions: Option<Conditions>,
    depth: u32,
) -> Outcome<Vec<Instance>, Error> {
    let mut chain = match chain(owner, assoc) {
        Ok(chain) => chain,
        Err(err) => return Outcome::Err(err),
    };
    if let Some(conditions) = conditions {
        chain = chain.find(conditions);
    }
    chain.with_fetch_depth(depth).run(cx).await
}

/// Link items to the owner, saving unsaved items first. `extra` values are
/// stored on the new join rows.
pub(crate) async fn add(
    cx: &Cx,
    owner: &Instance,
    assoc: &ManyAssociation,
    items: &[Instance],
    extra: &[(String, Value)],
) -> Outcome<(), Error> {
    if !owner.is_persisted() {
        return Outcome::Err(Error::NotDefined(format!(
            "save the '{}' instance before linking '{}'",
            owner.table(),
            assoc.name
        )));
    }
    let owner_keys = owner.key_values();
    let driver = &owner.core().driver;

    for item in items {
        if !item.saved() || !item.is_persisted() {
            try_outcome!(item.save_with(cx, SaveOptions { cascade: false }).await);
        }

        let mut data: Vec<(String, Value)> = assoc
            .owner_link
            .iter()
            .cloned()
            .zip(owner_keys.iter().cloned())
            .collect();
        data.extend(
            assoc
                .related_link
                .iter()
                .cloned()
                .zip(item.key_values()),
        );
        for (name, value) in extra {
            let Some(property) = assoc.extra.iter().find(|p| p.name == *name) else {
                return Outcome::Err(Error::NotDefined(format!(
                    "extra property '{name}' on association '{}'",
                    assoc.name
                )));
            };
            data.push((property.maps_to.clone(), property.coerce(value.clone())));
        }

        try_outcome!(
            driver
                .insert(cx, &assoc.join_table, &data, &[], owner.connection())
                .await
        );
    }
    Outcome::Ok(())
}

/// Replace the linked set with exactly `items`.
pub(crate) async fn set(
    cx: &Cx,
    owner: &Instance,
    assoc: &ManyAssociation,
    items: &[Instance],
) -> Outcome<(), Error> {
    try_outcome!(remove(cx, owner, assoc, &[]).await);
    add(cx, owner, assoc, items, &[]).await
}

/// Whether every item is linked to the owner. With no items, whether any
/// link exists.
pub(crate) async fn has(
    cx: &Cx,
    owner: &Instance,
    assoc: &ManyAssociation,
    items: &[Instance],
) -> Outcome<bool, Error> {
    let owner_keys = owner.key_values();
    let driver = &owner.core().driver;

    if items.is_empty() {
        let mut conditions = Conditions::new();
        for (link, value) in assoc.owner_link.iter().zip(owner_keys) {
            conditions = conditions.eq(link.clone(), value);
        }
        let count = try_outcome!(
            driver
                .count(cx, &assoc.join_table, &conditions, &CountOptions::default())
                .await
        );
        return Outcome::Ok(count > 0);
    }

    for item in items {
        let mut conditions = Conditions::new();
        for (link, value) in assoc.owner_link.iter().zip(owner_keys.iter().cloned()) {
            conditions = conditions.eq(link.clone(), value);
        }
        for (link, value) in assoc.related_link.iter().zip(item.key_values()) {
            conditions = conditions.eq(link.clone(), value);
        }
        let count = try_outcome!(
            driver
                .count(cx, &assoc.join_table, &conditions, &CountOptions::default())
                .await
        );
        if count == 0 {
            return Outcome::Ok(false);
        }
    }
    Outcome::Ok(true)
}

/// Unlink items from the owner, or every link when `items` is empty. Only
/// join rows are touched; target rows stay.
pub(crate) async fn remove(
    cx: &Cx,
    owner: &Instance,
    assoc: &ManyAssociation,
    items: &[Instance],
) -> Outcome<(), Error> {
    let mut conditions = Conditions::new();
    for (link, value) in assoc.owner_link.iter().zip(owner.key_values()) {
        conditions = conditions.eq(link.clone(), value);
    }

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

    try_outcome!(
        owner
            .core()
            .driver
            .remove(cx, &assoc.join_table, &conditions, owner.connection())
            .await
    );
    Outcome::Ok(())
}
