use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::lock;
use crate::error::StorageError;
use crate::meta::{Meta, Value};

/// A row of values, addressed by column name.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&Value> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.values.get(index)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// The row as a flat configuration node, one key per column.
    pub fn to_meta(&self) -> Meta {
        let mut builder = Meta::builder();
        for (column, value) in self.columns.iter().zip(&self.values) {
            // Column names that don't parse as names are skipped.
            builder.set(column.as_str(), value.clone()).ok();
        }
        builder.build()
    }
}

/// Append-only destination for rows.
pub trait Loader: Send + Sync {
    fn columns(&self) -> &[String];

    fn push(&self, values: Vec<Value>) -> Result<(), StorageError>;

    fn is_open(&self) -> bool;

    /// Releases the loader. Further pushes fail with [`StorageError::Closed`].
    fn close(&self);
}

/// A loader keeping rows sorted by a key column.
pub trait IndexedLoader: Loader {
    fn lookup(&self, key: &Value) -> Option<Row>;

    /// Rows with `from <= key <= to`, in key order.
    fn select(&self, from: &Value, to: &Value) -> Vec<Row>;
}

/// Pushes a row and logs a failure instead of returning it. Returns whether
/// the row was stored.
pub fn push_logged(loader: &dyn Loader, values: Vec<Value>) -> bool {
    match loader.push(values) {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(%error, "row dropped");
            false
        }
    }
}

fn check(columns: &[String], open: &AtomicBool, values: &[Value]) -> Result<(), StorageError> {
    if !open.load(Ordering::Acquire) {
        return Err(StorageError::Closed);
    }
    if values.len() != columns.len() {
        return Err(StorageError::Arity(values.len(), columns.len()));
    }
    Ok(())
}

/// In-memory loader keeping rows in insertion order.
pub struct MemoryTable {
    columns: Arc<[String]>,
    rows: Mutex<Vec<Vec<Value>>>,
    open: AtomicBool,
}

impl MemoryTable {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        }
    }

    pub fn rows(&self) -> Vec<Row> {
        lock(&self.rows)
            .iter()
            .map(|values| Row {
                columns: Arc::clone(&self.columns),
                values: values.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Loader for MemoryTable {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn push(&self, values: Vec<Value>) -> Result<(), StorageError> {
        check(&self.columns, &self.open, &values)?;
        lock(&self.rows).push(values);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// In-memory loader with rows sorted by key. Keys are unique.
///
/// Rows are keyed by their insertion position, starting at 0, unless a key
/// column is chosen with [`IndexedTable::keyed`].
pub struct IndexedTable {
    columns: Arc<[String]>,
    key: Option<usize>,
    rows: Mutex<BTreeMap<Value, Vec<Value>>>,
    pushed: AtomicUsize,
    open: AtomicBool,
}

impl IndexedTable {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            key: None,
            rows: Mutex::new(BTreeMap::new()),
            pushed: AtomicUsize::new(0),
            open: AtomicBool::new(true),
        }
    }

    /// Keys rows by the column named `key`. Falls back to positions if no
    /// column has that name.
    pub fn keyed<S: Into<String>>(columns: impl IntoIterator<Item = S>, key: &str) -> Self {
        let mut table = Self::new(columns);
        table.key = table.columns.iter().position(|c| c == key);
        table
    }

    pub fn key_column(&self) -> Option<&str> {
        self.key
            .and_then(|key| self.columns.get(key))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn row(&self, values: &[Value]) -> Row {
        Row {
            columns: Arc::clone(&self.columns),
            values: values.to_vec(),
        }
    }
}

impl Loader for IndexedTable {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn push(&self, values: Vec<Value>) -> Result<(), StorageError> {
        check(&self.columns, &self.open, &values)?;

        let mut rows = lock(&self.rows);

        let key = match self.key {
            Some(column) => match &values[column] {
                Value::Null => {
                    return Err(StorageError::MissingKey(self.columns[column].clone()));
                }
                key => key.clone(),
            },
            None => Value::from(self.pushed.load(Ordering::Acquire)),
        };

        if rows.contains_key(&key) {
            return Err(StorageError::DuplicateKey(key.to_string()));
        }
        rows.insert(key, values);
        self.pushed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

impl IndexedLoader for IndexedTable {
    fn lookup(&self, key: &Value) -> Option<Row> {
        lock(&self.rows).get(key).map(|values| self.row(values))
    }

    fn select(&self, from: &Value, to: &Value) -> Vec<Row> {
        if from > to {
            return vec![];
        }

        lock(&self.rows)
            .range((Bound::Included(from), Bound::Included(to)))
            .map(|(_, values)| self.row(values))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MetaProvider;

    fn row(values: [i64; 3]) -> Vec<Value> {
        values.into_iter().map(Value::from).collect()
    }

    fn table() -> IndexedTable {
        let table = IndexedTable::new(["a", "b", "c"]);
        table.push(row([1, 2, 3])).unwrap();
        table.push(row([2, 3, 4])).unwrap();
        table
    }

    #[test]
    fn test_lookup() {
        let table = table();
        let found = table.lookup(&Value::from(1)).unwrap();
        assert_eq!(found.get("b"), Some(&Value::from(3)));
        assert_eq!(table.lookup(&Value::from(0)).unwrap().get("b"), Some(&Value::from(2)));
        assert!(table.lookup(&Value::from(2)).is_none());
        assert!(found.get("d").is_none());
    }

    #[test]
    fn test_select_inclusive() {
        let table = IndexedTable::keyed(["k", "v"], "k");
        assert_eq!(table.key_column(), Some("k"));
        for k in 0..10i64 {
            table.push(vec![Value::from(k), Value::from(k * k)]).unwrap();
        }

        let rows = table.select(&Value::from(3), &Value::from(5));
        let keys: Vec<i64> = rows.iter().filter_map(|r| r.get("k")?.as_i64()).collect();
        assert_eq!(keys, vec![3, 4, 5]);
        assert!(table.select(&Value::from(5), &Value::from(3)).is_empty());
    }

    #[test]
    fn test_push_errors() {
        let table = IndexedTable::keyed(["a", "b", "c"], "a");
        table.push(row([1, 2, 3])).unwrap();
        assert!(matches!(table.push(row([1, 0, 0])), Err(StorageError::DuplicateKey(_))));
        assert!(matches!(
            table.push(vec![Value::from(9)]),
            Err(StorageError::Arity(1, 3))
        ));
        assert!(matches!(
            table.push(vec![Value::Null, Value::from(1), Value::from(2)]),
            Err(StorageError::MissingKey(column)) if column == "a"
        ));
    }

    #[test]
    fn test_closed() {
        let table = MemoryTable::new(["x"]);
        assert!(push_logged(&table, vec![Value::from(1)]));
        table.close();

        assert!(!table.is_open());
        assert!(!push_logged(&table, vec![Value::from(2)]));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_row_meta() {
        let found = table().lookup(&Value::from(1)).unwrap();
        let meta = found.to_meta();
        assert_eq!(meta.get_i64("c"), Some(4));
    }
}
