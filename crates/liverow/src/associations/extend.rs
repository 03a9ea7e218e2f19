//! Extension table resolution.
//!
//! An extension is a one-row side table keyed by the owner's key, defined
//! through `Model::extends_to`. Setting replaces any previous row.

use crate::associations::ExtendAssociation;
use crate::instance::{Instance, SaveOptions};
use crate::model::{GetOptions, InstantiateOptions, Model};
use liverow_core::{
    Conditions, CountOptions, Cx, Error, FindOptions, Outcome, Value, try_outcome,
};

/// Fetch the extension row, or `None` when the owner has none.
pub(crate) async fn get(
    cx: &Cx,
    owner: &Instance,
    assoc: &ExtendAssociation,
    depth: u32,
) -> Outcome<Option<Instance>, Error> {
    let target = match Model::from_weak(&assoc.target, owner.core()) {
        Ok(target) => target,
        Err(err) => return Outcome::Err(err),
    };

    let owner_keys = owner.key_values();
    if owner_keys.is_empty() || owner_keys.iter().any(Value::is_null) {
        return Outcome::Err(Error::NotDefined(format!(
            "save the '{}' instance before reading '{}'",
            owner.table(),
            assoc.name
        )));
    }

    let options = GetOptions {
        auto_fetch: Some(depth > 0),
        auto_fetch_limit: Some(depth),
        ..GetOptions::default()
    };
    match target.get_with(cx, owner_keys, options).await {
        Outcome::Ok(instance) => Outcome::Ok(Some(instance)),
        Outcome::Err(Error::NotFound(_)) => Outcome::Ok(None),
        Outcome::Err(err) => Outcome::Err(err),
        Outcome::Cancelled(reason) => Outcome::Cancelled(reason),
        Outcome::Panicked(payload) => Outcome::Panicked(payload),
    }
}

/// Whether an extension row exists for the owner.
pub(crate) async fn has(
    cx: &Cx,
    owner: &Instance,
    assoc: &ExtendAssociation,
) -> Outcome<bool, Error> {
    let target = match Model::from_weak(&assoc.target, owner.core()) {
        Ok(target) => target,
        Err(err) => return Outcome::Err(err),
    };

    let owner_keys = owner.key_values();
    if owner_keys.is_empty() || owner_keys.iter().any(Value::is_null) {
        return Outcome::Ok(false);
    }

    let mut conditions = Conditions::new();
    for (field, value) in assoc.fields.iter().zip(owner_keys) {
        conditions = conditions.eq(target.def().column_for(field), value);
    }
    let count = try_outcome!(
        owner
            .core()
            .driver
            .count(cx, target.table(), &conditions, &CountOptions::default())
            .await
    );
    Outcome::Ok(count > 0)
}

/// Replace the owner's extension row with `extension`.
///
/// Saves the owner first so its key values exist, drops any previous
/// extension row, then saves the new one keyed by the owner.
pub(crate) async fn set(
    cx: &Cx,
    owner: &Instance,
    assoc: &ExtendAssociation,
    extension: &Instance,
) -> Outcome<(), Error> {
    try_outcome!(owner.save_with(cx, SaveOptions { cascade: false }).await);
    try_outcome!(remove_extensions(cx, owner, assoc).await);

    for (field, value) in assoc.fields.iter().zip(owner.key_values()) {
        if let Err(err) = extension.assign(field, value) {
            return Outcome::Err(err);
        }
    }
    extension.save_with(cx, SaveOptions { cascade: false }).await
}

/// Delete every extension row pointing at the owner, evicting each from
/// the identity cache through the instance remove pipeline.
pub(crate) async fn remove_extensions(
    cx: &Cx,
    owner: &Instance,
    assoc: &ExtendAssociation,
) -> Outcome<(), Error> {
    let target = match Model::from_weak(&assoc.target, owner.core()) {
        Ok(target) => target,
        Err(err) => return Outcome::Err(err),
    };

    let owner_keys = owner.key_values();
    if owner_keys.is_empty() || owner_keys.iter().any(Value::is_null) {
        return Outcome::Ok(());
    }

    let mut conditions = Conditions::new();
    for (field, value) in assoc.fields.iter().zip(owner_keys) {
        conditions = conditions.eq(target.def().column_for(field), value);
    }

    let fields = target.def().default_fields();
    let rows = try_outcome!(
        owner
            .core()
            .driver
            .find(cx, &fields, target.table(), &conditions, &FindOptions::default())
            .await
    );

    for row in rows {
        let options = InstantiateOptions {
            identity: target.def().settings.identity_cache,
            save_check: false,
            ..InstantiateOptions::default()
        };
        let instance = try_outcome!(target.instantiate(cx, row.into_pairs(), options).await);
        try_outcome!(instance.remove(cx).await);
    }
    Outcome::Ok(())
}
