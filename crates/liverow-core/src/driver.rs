//! The pluggable storage driver contract.

use crate::error::Error;
use crate::property::Property;
use crate::query::{Conditions, CountOptions, EagerSpec, FindOptions};
use crate::row::Row;
use crate::value::Value;
use asupersync::Cx;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

/// Boxed future returned by driver methods.
///
/// The trait must stay object-safe so engines can hold `Arc<dyn Driver>`,
/// so every async method returns a boxed future.
pub type DriverFuture<'a, T> =
    Pin<Box<dyn Future<Output = asupersync::Outcome<T, Error>> + Send + 'a>>;

/// Handle scoping driver work to one logical connection or transaction.
///
/// Tokens are opaque to the engine; a driver maps them to whatever its
/// connection model is. Operations without a token use the driver's
/// default connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionToken(u64);

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

impl ConnectionToken {
    /// Allocate a fresh token.
    pub fn new() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of an insert: key values the store generated.
#[derive(Debug, Clone, Default)]
pub struct InsertResult {
    /// Generated (property name, value) pairs, serial keys typically
    pub generated: Vec<(String, Value)>,
}

/// A storage backend.
///
/// Drivers receive storage column names throughout; the engine translates
/// logical property names before calling in. All methods are sequential
/// from the engine's point of view.
pub trait Driver: Send + Sync + fmt::Debug {
    /// Stable identifier for this driver instance, used in identity uids.
    fn uid(&self) -> &str;

    /// Fetch rows matching `conditions`, projected to `fields`.
    fn find<'a>(
        &'a self,
        cx: &'a Cx,
        fields: &'a [String],
        table: &'a str,
        conditions: &'a Conditions,
        options: &'a FindOptions,
    ) -> DriverFuture<'a, Vec<Row>>;

    /// Count rows matching `conditions`.
    fn count<'a>(
        &'a self,
        cx: &'a Cx,
        table: &'a str,
        conditions: &'a Conditions,
        options: &'a CountOptions,
    ) -> DriverFuture<'a, i64>;

    /// Insert one row; returns any generated key values.
    fn insert<'a>(
        &'a self,
        cx: &'a Cx,
        table: &'a str,
        data: &'a [(String, Value)],
        key_properties: &'a [Property],
        connection: Option<ConnectionToken>,
    ) -> DriverFuture<'a, InsertResult>;

    /// Update matching rows with the given column changes.
    fn update<'a>(
        &'a self,
        cx: &'a Cx,
        table: &'a str,
        changes: &'a [(String, Value)],
        conditions: &'a Conditions,
        connection: Option<ConnectionToken>,
    ) -> DriverFuture<'a, u64>;

    /// Delete matching rows.
    fn remove<'a>(
        &'a self,
        cx: &'a Cx,
        table: &'a str,
        conditions: &'a Conditions,
        connection: Option<ConnectionToken>,
    ) -> DriverFuture<'a, u64>;

    /// Delete every row in a table.
    fn clear<'a>(&'a self, cx: &'a Cx, table: &'a str) -> DriverFuture<'a, ()>;

    /// Fetch related rows for a batch of parents in one round-trip.
    ///
    /// Each returned row carries [`crate::query::PARENT_KEY_COLUMN`] with
    /// the owning parent's key value.
    fn eager_query<'a>(
        &'a self,
        cx: &'a Cx,
        spec: &'a EagerSpec,
        parent_keys: &'a [Value],
    ) -> DriverFuture<'a, Vec<Row>>;

    /// Coerce a fetched value toward a property's storage type.
    fn value_to_property(&self, value: Value, property: &Property) -> Value {
        property.coerce(value)
    }

    /// Coerce a property value for storage. Identity by default.
    fn property_to_value(&self, value: Value, _property: &Property) -> Value {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tokens_are_unique() {
        let a = ConnectionToken::new();
        let b = ConnectionToken::new();
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
    }
}
