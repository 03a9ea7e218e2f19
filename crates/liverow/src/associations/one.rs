//! Scalar reference resolution.
//!
//! The foreign key fields live on the owner; setting the reference saves
//! the other side first, copies its key values into the owner, then
//! flushes the owner without cascading.

use crate::associations::OneAssociation;
use crate::instance::{Instance, SaveOptions};
use crate::model::{GetOptions, Model};
use liverow_core::{Conditions, Cx, Error, Outcome, Value, try_outcome};

/// Resolve the referenced instance, or `None` when the foreign key is
/// unset or the referenced row is gone.
pub(crate) async fn get(
    cx: &Cx,
    owner: &Instance,
    assoc: &OneAssociation,
    depth: u32,
) -> Outcome<Option<Instance>, Error> {
    let target = match Model::from_weak(&assoc.target, owner.core()) {
        Ok(target) => target,
        Err(err) => return Outcome::Err(err),
    };

    // Shell owners may not carry the foreign key columns yet.
    if owner.is_shell() && assoc.fields.iter().any(|f| owner.get(f).is_none()) {
        try_outcome!(owner.hydrate(cx).await);
    }

    let mut keys = Vec::with_capacity(assoc.fields.len());
    for field in &assoc.fields {
        let value = owner.get(field).unwrap_or(Value::Null);
        if value.is_null() {
            return Outcome::Ok(None);
        }
        keys.push(value);
    }

    let options = GetOptions {
        auto_fetch: Some(depth > 0),
        auto_fetch_limit: Some(depth),
        ..GetOptions::default()
    };
    match target.get_with(cx, keys, options).await {
        Outcome::Ok(instance) => Outcome::Ok(Some(instance)),
        Outcome::Err(Error::NotFound(_)) => Outcome::Ok(None),
        Outcome::Err(err) => Outcome::Err(err),
        Outcome::Cancelled(reason) => Outcome::Cancelled(reason),
        Outcome::Panicked(payload) => Outcome::Panicked(payload),
    }
}

/// Resolve the inverse view: every declaring-side row whose foreign key
/// points at the owner.
pub(crate) async fn get_reversed(
    cx: &Cx,
    owner: &Instance,
    assoc: &OneAssociation,
    depth: u32,
) -> Outcome<Vec<Instance>, Error> {
    let target = match Model::from_weak(&assoc.target, owner.core()) {
        Ok(target) => target,
        Err(err) => return Outcome::Err(err),
    };

    let owner_keys = owner.key_values();
    if owner_keys.is_empty() || owner_keys.iter().any(Value::is_null) {
        return Outcome::Ok(Vec::new());
    }

    let mut conditions = Conditions::new();
    for (field, value) in assoc.fields.iter().zip(owner_keys) {
        conditions = conditions.eq(field.clone(), value);
    }
    target.find(conditions).with_fetch_depth(depth).run(cx).await
}

/// Point the owner's foreign key at `other`, saving both sides.
pub(crate) async fn set(
    cx: &Cx,
    owner: &Instance,
    assoc: &OneAssociation,
    other: &Instance,
) -> Outcome<(), Error> {
    try_outcome!(other.save_with(cx, SaveOptions { cascade: false }).await);

    for (field, value) in assoc.fields.iter().zip(other.key_values()) {
        if let Err(err) = owner.assign(field, value) {
            return Outcome::Err(err);
        }
    }
    owner.save_with(cx, SaveOptions { cascade: false }).await
}

/// Inverse set: point every item's foreign key at the owner.
pub(crate) async fn set_reversed(
    cx: &Cx,
    owner: &Instance,
    assoc: &OneAssociation,
    items: &[Instance],
) -> Outcome<(), Error> {
    try_outcome!(owner.save_with(cx, SaveOptions { cascade: false }).await);

    let owner_keys = owner.key_values();
    for item in items {
        for (field, value) in assoc.fields.iter().zip(owner_keys.iter().cloned()) {
            if let Err(err) = item.assign(field, value) {
                return Outcome::Err(err);
            }
        }
        try_outcome!(item.save_with(cx, SaveOptions { cascade: false }).await);
    }
    Outcome::Ok(())
}

/// Null the owner's foreign key fields.
pub(crate) async fn clear(
    cx: &Cx,
    owner: &Instance,
    assoc: &OneAssociation,
) -> Outcome<(), Error> {
    for field in &assoc.fields {
        if let Err(err) = owner.assign(field, Value::Null) {
            return Outcome::Err(err);
        }
    }
    owner.save_with(cx, SaveOptions { cascade: false }).await
}

/// Whether the reference currently points at all of `items`. With no
/// items, whether it points anywhere.
pub(crate) async fn has(
    cx: &Cx,
    owner: &Instance,
    assoc: &OneAssociation,
    items: &[Instance],
) -> Outcome<bool, Error> {
    if assoc.reversed {
        let found = try_outcome!(get_reversed(cx, owner, assoc, 0).await);
        let all_present = items.iter().all(|item| {
            found
                .iter()
                .any(|f| f.same_as(item) || f.key_values() == item.key_values())
        });
        return Outcome::Ok(!found.is_empty() && all_present);
    }

    match try_outcome!(get(cx, owner, assoc, 0).await) {
        None => Outcome::Ok(false),
        Some(found) => Outcome::Ok(
            items
                .iter()
                .all(|item| found.same_as(item) || found.key_values() == item.key_values()),
        ),
    }
}
