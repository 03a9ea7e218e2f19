//! Association descriptors and resolvers.
//!
//! Three shapes are supported: a scalar reference through foreign key
//! fields (`one`), a collection through a join table (`many`), and a
//! one-row extension table keyed by the owner (`extend`). Descriptors hold
//! weak references to their target models so model graphs with mutual
//! references do not leak.

pub mod extend;
pub mod many;
pub mod one;

use crate::instance::Instance;
use crate::model::ModelDef;
use liverow_core::{Cx, DriverFuture, Outcome, Property};
use std::sync::Weak;

/// Scalar reference association.
///
/// Non-reversed: the owner carries foreign key fields pointing at the
/// target's keys. Reversed: the inverse view auto-defined on the target of
/// a non-reversed declaration; the foreign keys live on the declaring side.
#[derive(Debug, Clone)]
pub struct OneAssociation {
    pub name: String,
    pub target: Weak<ModelDef>,
    /// Foreign key property names, on the owner unless reversed
    pub fields: Vec<String>,
    pub reversed: bool,
    pub required: bool,
    /// Back-reference from an extension model to its owner
    pub extension: bool,
    pub auto_fetch: bool,
    pub auto_fetch_limit: u32,
}

/// Collection association through a join table.
#[derive(Debug, Clone)]
pub struct ManyAssociation {
    pub name: String,
    pub target: Weak<ModelDef>,
    pub join_table: String,
    /// Join table columns pointing at owner keys
    pub owner_link: Vec<String>,
    /// Join table columns pointing at target keys
    pub related_link: Vec<String>,
    /// Extra properties stored on the join table
    pub extra: Vec<Property>,
    pub auto_fetch: bool,
    pub auto_fetch_limit: u32,
}

/// One-row extension table keyed by the owner's key.
#[derive(Debug, Clone)]
pub struct ExtendAssociation {
    pub name: String,
    /// The auto-defined extension model
    pub target: Weak<ModelDef>,
    /// Foreign key property names on the extension model
    pub fields: Vec<String>,
    pub auto_fetch: bool,
    pub auto_fetch_limit: u32,
}

/// A resolved association value.
#[derive(Debug, Clone)]
pub enum Related {
    /// Scalar reference (one, extend, and empty reversed lookups)
    One(Option<Instance>),
    /// Collection (many, and reversed one lookups)
    Many(Vec<Instance>),
}

/// Lookup result for name-based dispatch.
#[derive(Debug, Clone)]
pub(crate) enum AssociationRef {
    One(OneAssociation),
    Many(ManyAssociation),
    Extend(ExtendAssociation),
}

impl AssociationRef {
    pub(crate) fn auto_fetch(&self) -> bool {
        match self {
            AssociationRef::One(a) => a.auto_fetch,
            AssociationRef::Many(a) => a.auto_fetch,
            AssociationRef::Extend(a) => a.auto_fetch,
        }
    }

    pub(crate) fn name(&self) -> &str {
        match self {
            AssociationRef::One(a) => &a.name,
            AssociationRef::Many(a) => &a.name,
            AssociationRef::Extend(a) => &a.name,
        }
    }
}

/// Resolve auto-fetched associations after construction.
///
/// Skipped entirely for unsaved and non-persisted instances. Resolution
/// errors on individual associations are ignored so a broken reference
/// never poisons a load; cancellation still propagates.
pub(crate) fn auto_fetch<'a>(
    cx: &'a Cx,
    instance: &'a Instance,
    depth: u32,
) -> DriverFuture<'a, ()> {
    Box::pin(async move {
        if depth == 0 || !instance.saved() || !instance.is_persisted() {
            return Outcome::Ok(());
        }

        let associations = instance.model_def().association_refs();
        let model_auto_fetch = instance.model_def().settings.auto_fetch;
        let mut fetched = false;

        for assoc in associations {
            if !assoc.auto_fetch() && !model_auto_fetch {
                continue;
            }
            fetched = true;
            match instance
                .get_related_with_depth(cx, assoc.name(), depth.saturating_sub(1))
                .await
            {
                Outcome::Ok(related) => instance.store_related(assoc.name(), related),
                Outcome::Err(err) => {
                    tracing::debug!(
                        association = assoc.name(),
                        error = %err,
                        "auto-fetch resolution failed"
                    );
                }
                Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
                Outcome::Panicked(payload) => return Outcome::Panicked(payload),
            }
        }

        if fetched {
            instance.trigger_after_auto_fetch();
        }
        Outcome::Ok(())
    })
}
