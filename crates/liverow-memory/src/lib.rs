//! In-memory reference driver.
//!
//! Backs the engine with plain vectors of rows. Supports the full query
//! vocabulary except raw fragments, which have no meaning without a query
//! language underneath. Write operations are counted per call so tests
//! can assert on write traffic.

use liverow_core::{
    Clause, ColumnInfo, Comparator, Conditions, ConnectionToken, CountOptions, Cx, Direction,
    Driver, DriverFuture, EagerSpec, Error, ExistsLink, FindOptions, InsertResult, Merge, Order,
    PARENT_KEY_COLUMN, Property, PropertyType, Row, Value,
};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

type StoredRow = HashMap<String, Value>;

#[derive(Debug, Default, Clone)]
struct Table {
    rows: Vec<StoredRow>,
    /// Last issued value per serial column
    serials: HashMap<String, i64>,
}

#[derive(Debug, Default)]
struct Store {
    tables: HashMap<String, Table>,
}

/// Number of write calls issued, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub inserts: u64,
    pub updates: u64,
    pub removes: u64,
}

static NEXT_DRIVER: AtomicU64 = AtomicU64::new(1);

/// A driver storing everything in process memory.
#[derive(Debug)]
pub struct MemoryDriver {
    uid: String,
    state: Mutex<Store>,
    counts: Mutex<WriteCounts>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        let id = NEXT_DRIVER.fetch_add(1, AtomicOrdering::Relaxed);
        Self {
            uid: format!("memory-{id}"),
            state: Mutex::new(Store::default()),
            counts: Mutex::new(WriteCounts::default()),
        }
    }

    /// Snapshot of write traffic since construction.
    pub fn write_counts(&self) -> WriteCounts {
        *self.counts.lock().expect("lock poisoned")
    }

    /// Raw row count of a table, for test assertions.
    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .expect("lock poisoned")
            .tables
            .get(table)
            .map_or(0, |t| t.rows.len())
    }

    fn run_find(
        &self,
        fields: &[String],
        table: &str,
        conditions: &Conditions,
        options: &FindOptions,
    ) -> Result<Vec<Row>, Error> {
        let store = self.state.lock().expect("lock poisoned");
        let mut rows = collect_matching(
            &store,
            table,
            conditions,
            options.merge.as_ref(),
            &options.exists,
        )?;

        if options
            .order
            .iter()
            .any(|order| matches!(order, Order::Raw { .. }))
        {
            return Err(Error::NoSupport(
                "raw order fragments in the memory driver".to_string(),
            ));
        }
        rows.sort_by(|a, b| {
            for order in &options.order {
                if let Order::By { field, direction } = order {
                    let left = a.get(field).cloned().unwrap_or(Value::Null);
                    let right = b.get(field).cloned().unwrap_or(Value::Null);
                    let mut ord = compare_values(&left, &right);
                    if *direction == Direction::Descending {
                        ord = ord.reverse();
                    }
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
            }
            Ordering::Equal
        });

        let offset = options.offset.unwrap_or(0);
        let rows: Vec<StoredRow> = rows
            .into_iter()
            .skip(offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();

        let mut columns: Vec<String> = fields.to_vec();
        if let Some(merge) = &options.merge {
            for extra in &merge.select_extra {
                if !columns.contains(extra) {
                    columns.push(extra.clone());
                }
            }
        }
        let info = Arc::new(ColumnInfo::new(columns.clone()));
        Ok(rows
            .into_iter()
            .map(|row| {
                let values = columns
                    .iter()
                    .map(|column| row.get(column).cloned().unwrap_or(Value::Null))
                    .collect();
                Row::with_columns(Arc::clone(&info), values)
            })
            .collect())
    }

    fn run_count(
        &self,
        table: &str,
        conditions: &Conditions,
        options: &CountOptions,
    ) -> Result<i64, Error> {
        let store = self.state.lock().expect("lock poisoned");
        let rows = collect_matching(&store, table, conditions, options.merge.as_ref(), &[])?;
        Ok(rows.len() as i64)
    }

    fn run_insert(
        &self,
        table: &str,
        data: &[(String, Value)],
        key_properties: &[Property],
    ) -> Result<InsertResult, Error> {
        let mut store = self.state.lock().expect("lock poisoned");
        let entry = store.tables.entry(table.to_string()).or_default();

        let mut row: StoredRow = data.iter().cloned().collect();
        let mut generated = Vec::new();
        for key in key_properties {
            if key.kind != PropertyType::Serial {
                continue;
            }
            let current = row.get(&key.maps_to);
            if current.is_none() || current.is_some_and(Value::is_null) {
                let next = entry.serials.entry(key.maps_to.clone()).or_insert(0);
                *next += 1;
                row.insert(key.maps_to.clone(), Value::Integer(*next));
                generated.push((key.name.clone(), Value::Integer(*next)));
            } else if let Some(explicit) = current.and_then(Value::as_i64) {
                let next = entry.serials.entry(key.maps_to.clone()).or_insert(0);
                *next = (*next).max(explicit);
            }
        }
        entry.rows.push(row);
        drop(store);

        self.counts.lock().expect("lock poisoned").inserts += 1;
        Ok(InsertResult { generated })
    }

    fn run_update(
        &self,
        table: &str,
        changes: &[(String, Value)],
        conditions: &Conditions,
    ) -> Result<u64, Error> {
        let mut store = self.state.lock().expect("lock poisoned");
        let mut touched = 0u64;
        if let Some(entry) = store.tables.get_mut(table) {
            for row in &mut entry.rows {
                if matches_conditions(row, conditions)? {
                    for (column, value) in changes {
                        row.insert(column.clone(), value.clone());
                    }
                    touched += 1;
                }
            }
        }
        drop(store);

        self.counts.lock().expect("lock poisoned").updates += 1;
        Ok(touched)
    }

    fn run_remove(&self, table: &str, conditions: &Conditions) -> Result<u64, Error> {
        let mut store = self.state.lock().expect("lock poisoned");
        let mut removed = 0u64;
        if let Some(entry) = store.tables.get_mut(table) {
            let mut kept = Vec::with_capacity(entry.rows.len());
            for row in entry.rows.drain(..) {
                if matches_conditions(&row, conditions)? {
                    removed += 1;
                } else {
                    kept.push(row);
                }
            }
            entry.rows = kept;
        }
        drop(store);

        self.counts.lock().expect("lock poisoned").removes += 1;
        Ok(removed)
    }

    fn run_eager(&self, spec: &EagerSpec, parent_keys: &[Value]) -> Result<Vec<Row>, Error> {
        let store = self.state.lock().expect("lock poisoned");
        let join_rows = store
            .tables
            .get(&spec.join_table)
            .map(|t| t.rows.clone())
            .unwrap_or_default();
        let related_rows = store
            .tables
            .get(&spec.related_table)
            .map(|t| t.rows.clone())
            .unwrap_or_default();
        drop(store);

        let Some(owner_link) = spec.owner_link.first() else {
            return Ok(Vec::new());
        };

        let mut columns: Vec<String> = spec.fields.clone();
        columns.extend(spec.extra_fields.iter().cloned());
        columns.push(PARENT_KEY_COLUMN.to_string());
        let info = Arc::new(ColumnInfo::new(columns));

        let mut out = Vec::new();
        for join in &join_rows {
            let parent = join.get(owner_link).cloned().unwrap_or(Value::Null);
            if !parent_keys.iter().any(|key| values_equal(key, &parent)) {
                continue;
            }
            for related in &related_rows {
                if !columns_match(related, &spec.related_keys, join, &spec.related_link) {
                    continue;
                }
                let mut values: Vec<Value> = spec
                    .fields
                    .iter()
                    .map(|field| related.get(field).cloned().unwrap_or(Value::Null))
                    .collect();
                values.extend(
                    spec.extra_fields
                        .iter()
                        .map(|field| join.get(field).cloned().unwrap_or(Value::Null)),
                );
                values.push(parent.clone());
                out.push(Row::with_columns(Arc::clone(&info), values));
            }
        }
        Ok(out)
    }
}

impl Driver for MemoryDriver {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn find<'a>(
        &'a self,
        _cx: &'a Cx,
        fields: &'a [String],
        table: &'a str,
        conditions: &'a Conditions,
        options: &'a FindOptions,
    ) -> DriverFuture<'a, Vec<Row>> {
        Box::pin(async move {
            self.run_find(fields, table, conditions, options)
                .map_or_else(liverow_core::Outcome::Err, liverow_core::Outcome::Ok)
        })
    }

    fn count<'a>(
        &'a self,
        _cx: &'a Cx,
        table: &'a str,
        conditions: &'a Conditions,
        options: &'a CountOptions,
    ) -> DriverFuture<'a, i64> {
        Box::pin(async move {
            self.run_count(table, conditions, options)
                .map_or_else(liverow_core::Outcome::Err, liverow_core::Outcome::Ok)
        })
    }

    fn insert<'a>(
        &'a self,
        _cx: &'a Cx,
        table: &'a str,
        data: &'a [(String, Value)],
        key_properties: &'a [Property],
        _connection: Option<ConnectionToken>,
    ) -> DriverFuture<'a, InsertResult> {
        Box::pin(async move {
            self.run_insert(table, data, key_properties)
                .map_or_else(liverow_core::Outcome::Err, liverow_core::Outcome::Ok)
        })
    }

    fn update<'a>(
        &'a self,
        _cx: &'a Cx,
        table: &'a str,
        changes: &'a [(String, Value)],
        conditions: &'a Conditions,
        _connection: Option<ConnectionToken>,
    ) -> DriverFuture<'a, u64> {
        Box::pin(async move {
            self.run_update(table, changes, conditions)
                .map_or_else(liverow_core::Outcome::Err, liverow_core::Outcome::Ok)
        })
    }

    fn remove<'a>(
        &'a self,
        _cx: &'a Cx,
        table: &'a str,
        conditions: &'a Conditions,
        _connection: Option<ConnectionToken>,
    ) -> DriverFuture<'a, u64> {
        Box::pin(async move {
            self.run_remove(table, conditions)
                .map_or_else(liverow_core::Outcome::Err, liverow_core::Outcome::Ok)
        })
    }

    fn clear<'a>(&'a self, _cx: &'a Cx, table: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let mut store = self.state.lock().expect("lock poisoned");
            if let Some(entry) = store.tables.get_mut(table) {
                tracing::debug!(table, rows = entry.rows.len(), "clearing table");
                entry.rows.clear();
            }
            drop(store);
            self.counts.lock().expect("lock poisoned").removes += 1;
            liverow_core::Outcome::Ok(())
        })
    }

    fn eager_query<'a>(
        &'a self,
        _cx: &'a Cx,
        spec: &'a EagerSpec,
        parent_keys: &'a [Value],
    ) -> DriverFuture<'a, Vec<Row>> {
        Box::pin(async move {
            self.run_eager(spec, parent_keys)
                .map_or_else(liverow_core::Outcome::Err, liverow_core::Outcome::Ok)
        })
    }
}

/// Base rows matching the conditions, with merge joins and exists links
/// applied. Merge joins yield one row per (base, join) pair when extra
/// columns are projected, otherwise distinct base rows.
fn collect_matching(
    store: &Store,
    table: &str,
    conditions: &Conditions,
    merge: Option<&Merge>,
    exists: &[ExistsLink],
) -> Result<Vec<StoredRow>, Error> {
    let base_rows = store
        .tables
        .get(table)
        .map(|t| t.rows.clone())
        .unwrap_or_default();

    let mut composites = Vec::new();
    if let Some(merge) = merge {
        let join_rows = store
            .tables
            .get(&merge.from_table)
            .map(|t| t.rows.clone())
            .unwrap_or_default();
        let hop_rows = merge.hop.as_ref().map(|hop| {
            store
                .tables
                .get(&hop.table)
                .map(|t| t.rows.clone())
                .unwrap_or_default()
        });

        for base in &base_rows {
            if !matches_conditions(base, conditions)? {
                continue;
            }
            for join in &join_rows {
                if !columns_match(join, &merge.from_fields, base, &merge.to_fields) {
                    continue;
                }
                if let (Some(hop), Some(hop_rows)) = (&merge.hop, &hop_rows) {
                    let mut linked = false;
                    for hop_row in hop_rows {
                        if columns_match(hop_row, &hop.to, join, &hop.from)
                            && matches_conditions(hop_row, &merge.conditions)?
                        {
                            linked = true;
                            break;
                        }
                    }
                    if !linked {
                        continue;
                    }
                } else if !matches_conditions(join, &merge.conditions)? {
                    continue;
                }

                let mut composite = base.clone();
                for column in &merge.select_extra {
                    composite.insert(
                        column.clone(),
                        join.get(column).cloned().unwrap_or(Value::Null),
                    );
                }
                composites.push(composite);
                if merge.select_extra.is_empty() {
                    break;
                }
            }
        }
    } else {
        for row in base_rows {
            if matches_conditions(&row, conditions)? {
                composites.push(row);
            }
        }
    }

    let mut filtered = Vec::with_capacity(composites.len());
    'row: for row in composites {
        for link in exists {
            let link_rows = store
                .tables
                .get(&link.table)
                .map(|t| t.rows.clone())
                .unwrap_or_default();
            let mut linked = false;
            for link_row in &link_rows {
                if columns_match(link_row, &link.link, &row, &link.base_keys)
                    && matches_conditions(link_row, &link.conditions)?
                {
                    linked = true;
                    break;
                }
            }
            if !linked {
                continue 'row;
            }
        }
        filtered.push(row);
    }
    Ok(filtered)
}

fn matches_conditions(row: &StoredRow, conditions: &Conditions) -> Result<bool, Error> {
    for clause in &conditions.clauses {
        let ok = match clause {
            Clause::Compare { field, op, value } => {
                let current = row.get(field).cloned().unwrap_or(Value::Null);
                match op {
                    Comparator::Eq => values_equal(&current, value),
                    Comparator::Ne => !values_equal(&current, value),
                    Comparator::Gt | Comparator::Gte | Comparator::Lt | Comparator::Lte => {
                        if current.is_null() || value.is_null() {
                            false
                        } else {
                            let ord = compare_values(&current, value);
                            match op {
                                Comparator::Gt => ord == Ordering::Greater,
                                Comparator::Gte => ord != Ordering::Less,
                                Comparator::Lt => ord == Ordering::Less,
                                _ => ord != Ordering::Greater,
                            }
                        }
                    }
                    Comparator::Like => match (current.as_str(), value.as_str()) {
                        (Some(text), Some(pattern)) => like_match(text, pattern),
                        _ => false,
                    },
                }
            }
            Clause::AnyOf { field, values } => {
                let current = row.get(field).cloned().unwrap_or(Value::Null);
                values.iter().any(|value| values_equal(&current, value))
            }
            Clause::Or(groups) => {
                let mut any = false;
                for group in groups {
                    if matches_conditions(row, group)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            Clause::Raw { .. } => {
                return Err(Error::NoSupport(
                    "raw condition fragments in the memory driver".to_string(),
                ));
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn columns_match(
    left: &StoredRow,
    left_columns: &[String],
    right: &StoredRow,
    right_columns: &[String],
) -> bool {
    left_columns.len() == right_columns.len()
        && left_columns.iter().zip(right_columns).all(|(l, r)| {
            let left_value = left.get(l).cloned().unwrap_or(Value::Null);
            let right_value = right.get(r).cloned().unwrap_or(Value::Null);
            !left_value.is_null() && values_equal(&left_value, &right_value)
        })
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(i) => Some(*i as f64),
        Value::Real(r) => Some(*r),
        Value::Date(d) => Some(*d as f64),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return (x - y).abs() < f64::EPSILON;
    }
    a == b
}

/// Total order over values for sorting: null first, then numbers, text,
/// booleans, bytes.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    match (a, b) {
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Integer(_) | Value::Real(_) | Value::Date(_) => 1,
        Value::Text(_) => 2,
        Value::Bool(_) => 3,
        Value::Bytes(_) => 4,
        Value::Json(_) => 5,
    }
}

/// SQL-style LIKE with `%` wildcards.
fn like_match(text: &str, pattern: &str) -> bool {
    let segments: Vec<&str> = pattern.split('%').collect();
    if segments.len() == 1 {
        return text == pattern;
    }
    let mut position = 0;
    let last = segments.len() - 1;
    for (index, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if index == 0 {
            if !text.starts_with(segment) {
                return false;
            }
            position = segment.len();
        } else if index == last {
            return text.len() >= position + segment.len() && text[position..].ends_with(segment);
        } else if let Some(found) = text[position..].find(segment) {
            position += found + segment.len();
        } else {
            return false;
        }
    }
    true
}
