//! Row-to-object mapping engine with identity-consistent instances.
//!
//! The engine turns fetched rows into live [`Instance`] handles that track
//! dirty properties, validate before saving, resolve associations, and
//! share state through an identity cache: fetching the same logical row
//! twice yields handles onto the same state.
//!
//! # Example
//!
//! ```ignore
//! let orm = Orm::new(driver);
//! let person = orm.define(
//!     Schema::new("person")
//!         .property("name", PropertyType::Text)
//!         .property("age", PropertyType::Integer),
//! )?;
//!
//! let jane = person
//!     .create(cx, vec![("name".into(), "Jane".into()), ("age".into(), 32i64.into())])
//!     .await?;
//! let found = person.get(cx, vec![jane.get("id").unwrap()]).await?;
//! assert!(found.same_as(&jane));
//! ```

pub mod associations;
pub mod chain;
pub mod chain_iter;
pub mod hooks;
pub mod identity;
pub mod instance;
pub mod model;
pub mod orm;
pub mod schema;

pub use associations::Related;
pub use chain::Chain;
pub use chain_iter::ChainIterate;
pub use hooks::{AfterHook, AfterKind, BeforeHook, BeforeKind, Hooks};
pub use identity::IdentityCache;
pub use instance::{EventHandler, Instance, InstanceEvent, SaveOptions};
pub use model::{
    ExtendOptions, GetOptions, ManyOptions, Model, ModelDef, OneOptions, OneQuery,
};
pub use orm::Orm;
pub use schema::Schema;

// The driver vocabulary and value types come from liverow-core; re-export
// the pieces callers touch directly.
pub use liverow_core::{
    Budget, Clause, Comparator, Conditions, ConnectionToken, CountOptions, Cx, Direction, Driver,
    DriverFuture, EagerSpec, Error, ExistsLink, FindOptions, InsertResult, Merge, MergeHop, Order,
    Outcome, Property, PropertyDecl, PropertyType, QueryError, Result, Row, Rule, Settings,
    Validation, ValidationFailure, Value, try_outcome,
};
