//! Core types and traits for liverow.
//!
//! This crate provides the foundational abstractions for the mapping engine:
//!
//! - `Value` and `Row` for dynamically-typed row data
//! - `Property` descriptors with normalization and coercion
//! - `Conditions`, `FindOptions`, and friends: the driver query vocabulary
//! - `Driver` trait for pluggable storage backends
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod driver;
pub mod error;
pub mod property;
pub mod query;
pub mod row;
pub mod settings;
pub mod validate;
pub mod value;

pub use driver::{ConnectionToken, Driver, DriverFuture, InsertResult};
pub use error::{Error, QueryError, Result, ValidationFailure};
pub use property::{DefaultFn, Property, PropertyDecl, PropertyType};
pub use query::{
    Clause, Comparator, Conditions, CountOptions, Direction, EagerSpec, ExistsLink, FindOptions,
    Merge, MergeHop, Order, PARENT_KEY_COLUMN,
};
pub use row::{ColumnInfo, Row};
pub use settings::Settings;
pub use validate::{CustomCheck, Rule, Validation};
pub use value::Value;

/// Unwrap an `Outcome`, propagating every non-success arm to the caller.
///
/// # Example
///
/// ```ignore
/// let rows = try_outcome!(driver.find(cx, &fields, table, &conditions, &options).await);
/// ```
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(value) => value,
            $crate::Outcome::Err(err) => return $crate::Outcome::Err(err.into()),
            $crate::Outcome::Cancelled(reason) => return $crate::Outcome::Cancelled(reason),
            $crate::Outcome::Panicked(payload) => return $crate::Outcome::Panicked(payload),
        }
    };
}
