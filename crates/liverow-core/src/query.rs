//! Driver-neutral query vocabulary.
//!
//! Chains and association resolvers compile down to these structures; a
//! driver evaluates them against its store. No SQL text is produced here.

use crate::value::Value;

/// Synthetic column carrying the parent key in eager query results.
pub const PARENT_KEY_COLUMN: &str = "$p";

/// Comparison operator in a condition clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
}

/// One clause of a condition tree.
#[derive(Debug, Clone)]
pub enum Clause {
    /// Compare a column against a value
    Compare {
        field: String,
        op: Comparator,
        value: Value,
    },
    /// Column must equal any of the given values
    AnyOf { field: String, values: Vec<Value> },
    /// At least one of the nested groups must match
    Or(Vec<Conditions>),
    /// Raw driver-specific fragment with positional parameters
    Raw { expr: String, params: Vec<Value> },
}

/// A conjunction of clauses. Empty conditions match every row.
#[derive(Debug, Clone, Default)]
pub struct Conditions {
    pub clauses: Vec<Clause>,
}

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Add an equality clause.
    #[must_use]
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Compare {
            field: field.into(),
            op: Comparator::Eq,
            value: value.into(),
        });
        self
    }

    /// Add a comparison clause.
    #[must_use]
    pub fn compare(
        mut self,
        field: impl Into<String>,
        op: Comparator,
        value: impl Into<Value>,
    ) -> Self {
        self.clauses.push(Clause::Compare {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    /// Add a membership clause.
    #[must_use]
    pub fn any_of(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.clauses.push(Clause::AnyOf {
            field: field.into(),
            values,
        });
        self
    }

    /// Add a disjunction of nested condition groups.
    #[must_use]
    pub fn or(mut self, groups: Vec<Conditions>) -> Self {
        self.clauses.push(Clause::Or(groups));
        self
    }

    /// Add a raw driver fragment.
    #[must_use]
    pub fn raw(mut self, expr: impl Into<String>, params: Vec<Value>) -> Self {
        self.clauses.push(Clause::Raw {
            expr: expr.into(),
            params,
        });
        self
    }

    /// Merge another condition set into this one (conjunction).
    pub fn merge(&mut self, other: Conditions) {
        self.clauses.extend(other.clauses);
    }

    /// Rename condition fields through a mapping function.
    ///
    /// Used to translate logical property names to storage column names
    /// before handing conditions to a driver.
    #[must_use]
    pub fn map_fields<F: Fn(&str) -> String + Copy>(self, rename: F) -> Self {
        let clauses = self
            .clauses
            .into_iter()
            .map(|clause| match clause {
                Clause::Compare { field, op, value } => Clause::Compare {
                    field: rename(&field),
                    op,
                    value,
                },
                Clause::AnyOf { field, values } => Clause::AnyOf {
                    field: rename(&field),
                    values,
                },
                Clause::Or(groups) => Clause::Or(
                    groups
                        .into_iter()
                        .map(|group| group.map_fields(rename))
                        .collect(),
                ),
                raw @ Clause::Raw { .. } => raw,
            })
            .collect();
        Self { clauses }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// One entry in an order list.
#[derive(Debug, Clone)]
pub enum Order {
    /// Order by a column
    By { field: String, direction: Direction },
    /// Raw driver-specific order fragment
    Raw { expr: String, params: Vec<Value> },
}

impl Order {
    /// Parse the `"field"` / `"-field"` shorthand.
    pub fn parse(spec: &str) -> Self {
        if let Some(field) = spec.strip_prefix('-') {
            Order::By {
                field: field.to_string(),
                direction: Direction::Descending,
            }
        } else {
            Order::By {
                field: spec.to_string(),
                direction: Direction::Ascending,
            }
        }
    }

    /// Rename the ordered field through a mapping function.
    #[must_use]
    pub fn map_field<F: Fn(&str) -> String>(self, rename: F) -> Self {
        match self {
            Order::By { field, direction } => Order::By {
                field: rename(&field),
                direction,
            },
            raw @ Order::Raw { .. } => raw,
        }
    }
}

/// Join directive for reverse lookups through another table.
///
/// `find_by` and reversed association reads run the base query joined
/// from `from_table` onto the target table, with extra conditions applied
/// on the joined side.
#[derive(Debug, Clone)]
pub struct Merge {
    /// Table joined in
    pub from_table: String,
    /// Columns on `from_table` pointing at the base table keys
    pub from_fields: Vec<String>,
    /// Base table being queried
    pub to_table: String,
    /// Key columns on the base table
    pub to_fields: Vec<String>,
    /// Second join hop, used when the lookup goes through a join table
    pub hop: Option<MergeHop>,
    /// Conditions evaluated against the hop table if present, else `from_table`
    pub conditions: Conditions,
    /// Extra `from_table` columns projected onto results
    pub select_extra: Vec<String>,
}

/// Second join hop of a [`Merge`]: `from_table.from` columns joined onto
/// `table.to` columns.
#[derive(Debug, Clone)]
pub struct MergeHop {
    pub table: String,
    /// Columns on the merge's `from_table`
    pub from: Vec<String>,
    /// Columns on `table` matched by `from`
    pub to: Vec<String>,
}

/// Membership filter through a join table.
#[derive(Debug, Clone)]
pub struct ExistsLink {
    /// Join table to probe
    pub table: String,
    /// Join table columns pointing at the base table keys
    pub link: Vec<String>,
    /// Base table key columns matched by `link`
    pub base_keys: Vec<String>,
    /// Conditions evaluated against the join table
    pub conditions: Conditions,
}

/// Options accepted by `Driver::find`.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub order: Vec<Order>,
    pub merge: Option<Merge>,
    pub exists: Vec<ExistsLink>,
}

/// Options accepted by `Driver::count`.
#[derive(Debug, Clone, Default)]
pub struct CountOptions {
    pub merge: Option<Merge>,
}

/// Specification for one eager association round-trip.
///
/// The driver returns related rows, each extended with the synthetic
/// [`PARENT_KEY_COLUMN`] holding the owning row's key.
#[derive(Debug, Clone)]
pub struct EagerSpec {
    /// Join table linking owners to related rows
    pub join_table: String,
    /// Join table columns pointing at owner keys
    pub owner_link: Vec<String>,
    /// Join table columns pointing at related keys
    pub related_link: Vec<String>,
    /// Related table
    pub related_table: String,
    /// Key columns on the related table
    pub related_keys: Vec<String>,
    /// Projection on the related table
    pub fields: Vec<String>,
    /// Extra join table columns projected onto results
    pub extra_fields: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conditions_builder() {
        let conditions = Conditions::new()
            .eq("name", "Jane")
            .compare("age", Comparator::Gte, 18i64)
            .any_of("status", vec![Value::Integer(1), Value::Integer(2)]);

        assert_eq!(conditions.clauses.len(), 3);
        assert!(!conditions.is_empty());
    }

    #[test]
    fn test_order_parse() {
        match Order::parse("name") {
            Order::By { field, direction } => {
                assert_eq!(field, "name");
                assert_eq!(direction, Direction::Ascending);
            }
            Order::Raw { .. } => panic!("expected column order"),
        }

        match Order::parse("-createdAt") {
            Order::By { field, direction } => {
                assert_eq!(field, "createdAt");
                assert_eq!(direction, Direction::Descending);
            }
            Order::Raw { .. } => panic!("expected column order"),
        }
    }

    #[test]
    fn test_map_fields_recurses_into_or() {
        let conditions = Conditions::new().eq("name", "x").or(vec![
            Conditions::new().eq("age", 1i64),
            Conditions::new().eq("name", "y"),
        ]);

        let mapped = conditions.map_fields(|f| format!("col_{f}"));

        match &mapped.clauses[0] {
            Clause::Compare { field, .. } => assert_eq!(field, "col_name"),
            other => panic!("unexpected clause {other:?}"),
        }
        match &mapped.clauses[1] {
            Clause::Or(groups) => match &groups[0].clauses[0] {
                Clause::Compare { field, .. } => assert_eq!(field, "col_age"),
                other => panic!("unexpected clause {other:?}"),
            },
            other => panic!("unexpected clause {other:?}"),
        }
    }

    #[test]
    fn test_merge_preserved_by_default_options() {
        let options = FindOptions::default();
        assert!(options.merge.is_none());
        assert!(options.exists.is_empty());
        assert!(options.order.is_empty());
    }
}
