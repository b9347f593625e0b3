//! In-memory reference backends.
//!
//! These back the integration tests and small single-process setups: a
//! byte-object store, an ordered key-value store, and a record store with
//! predicate evaluation, nested-loop joins, and snapshot-based batch
//! transactions.

use crate::{DbBackend, Error, KvBackend, ObjectBackend};
use bson::{Bson, Document};
use indexmap::IndexMap;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[derive(Clone)]
struct StoredObject {
    data: Vec<u8>,
    modification_time: i64,
}

#[derive(Default)]
pub struct MemoryObject {
    objects: Mutex<HashMap<(String, String), StoredObject>>,
}

impl MemoryObject {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectBackend for MemoryObject {
    fn create(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut objects = self.objects.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        if objects.contains_key(&key) {
            return Err(Error::Exists(format!("object {namespace}/{name}")));
        }
        objects.insert(
            key,
            StoredObject {
                data: Vec::new(),
                modification_time: now(),
            },
        );
        Ok(())
    }

    fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.objects
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("object {namespace}/{name}")))
    }

    fn read(
        &self,
        namespace: &str,
        name: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, Error> {
        let objects = self.objects.lock().unwrap();
        let object = objects
            .get(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Error::NotFound(format!("object {namespace}/{name}")))?;

        let start = (offset as usize).min(object.data.len());
        let end = ((offset + length) as usize).min(object.data.len());
        Ok(object.data[start..end].to_vec())
    }

    fn write(&self, namespace: &str, name: &str, offset: u64, data: &[u8]) -> Result<u64, Error> {
        let mut objects = self.objects.lock().unwrap();
        let object = objects
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Error::NotFound(format!("object {namespace}/{name}")))?;

        let end = offset as usize + data.len();
        if object.data.len() < end {
            object.data.resize(end, 0);
        }
        object.data[offset as usize..end].copy_from_slice(data);
        object.modification_time = now();
        Ok(data.len() as u64)
    }

    fn status(&self, namespace: &str, name: &str) -> Result<(i64, u64), Error> {
        let objects = self.objects.lock().unwrap();
        let object = objects
            .get(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Error::NotFound(format!("object {namespace}/{name}")))?;
        Ok((object.modification_time, object.data.len() as u64))
    }

    fn sync(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let objects = self.objects.lock().unwrap();
        objects
            .get(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("object {namespace}/{name}")))
    }
}

#[derive(Default)]
pub struct MemoryKv {
    namespaces: Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemoryKv {
    fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<(), Error> {
        self.namespaces
            .lock()
            .unwrap()
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Vec<u8>, Error> {
        self.namespaces
            .lock()
            .unwrap()
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("key {namespace}/{key}")))
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<(), Error> {
        self.namespaces
            .lock()
            .unwrap()
            .get_mut(namespace)
            .and_then(|ns| ns.remove(key))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("key {namespace}/{key}")))
    }

    fn scan(&self, namespace: &str, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, Error> {
        let namespaces = self.namespaces.lock().unwrap();
        let Some(ns) = namespaces.get(namespace) else {
            return Ok(Vec::new());
        };
        Ok(ns
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

#[derive(Clone)]
struct Table {
    /// Declared field name → type code.
    fields: IndexMap<String, i32>,
    /// The full schema document as the client sent it.
    schema: Document,
    /// Rows in insertion order, each carrying its `_id`.
    rows: Vec<Document>,
}

#[derive(Clone, Default)]
struct DbState {
    tables: HashMap<(String, String), Table>,
    next_id: u64,
}

#[derive(Default)]
pub struct MemoryDb {
    state: Mutex<DbState>,
    snapshot: Mutex<Option<DbState>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DbBackend for MemoryDb {
    fn schema_create(&self, namespace: &str, name: &str, schema: &Document) -> Result<(), Error> {
        let fields = parse_fields(schema)?;
        if fields.is_empty() {
            return Err(Error::Invalid("schema declares no fields".to_string()));
        }

        let mut state = self.state.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        if state.tables.contains_key(&key) {
            return Err(Error::Exists(format!("schema {namespace}/{name}")));
        }
        state.tables.insert(
            key,
            Table {
                fields,
                schema: schema.clone(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    fn schema_get(&self, namespace: &str, name: &str) -> Result<Document, Error> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(&(namespace.to_string(), name.to_string()))
            .map(|table| table.schema.clone())
            .ok_or_else(|| Error::NotFound(format!("schema {namespace}/{name}")))
    }

    fn schema_delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .tables
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("schema {namespace}/{name}")))
    }

    fn insert(&self, namespace: &str, name: &str, row: &Document) -> Result<u64, Error> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;

        let table = state
            .tables
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Error::NotFound(format!("schema {namespace}/{name}")))?;

        for (field, _) in row {
            if !table.fields.contains_key(field) {
                return Err(Error::Invalid(format!("unknown field '{field}'")));
            }
        }

        let mut stored = Document::new();
        stored.insert("_id", Bson::Int64(id as i64));
        for (field, value) in row {
            stored.insert(field.clone(), value.clone());
        }
        table.rows.push(stored);
        Ok(id)
    }

    fn update(
        &self,
        namespace: &str,
        name: &str,
        selector: &Document,
        values: &Document,
    ) -> Result<u64, Error> {
        let mut state = self.state.lock().unwrap();
        let table = state
            .tables
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Error::NotFound(format!("schema {namespace}/{name}")))?;

        for (field, _) in values {
            if !table.fields.contains_key(field) {
                return Err(Error::Invalid(format!("unknown field '{field}'")));
            }
        }

        let mut touched = 0;
        for row in table.rows.iter_mut() {
            if matches(row, selector)? {
                for (field, value) in values {
                    row.insert(field.clone(), value.clone());
                }
                touched += 1;
            }
        }
        Ok(touched)
    }

    fn delete(&self, namespace: &str, name: &str, selector: &Document) -> Result<u64, Error> {
        let mut state = self.state.lock().unwrap();
        let table = state
            .tables
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Error::NotFound(format!("schema {namespace}/{name}")))?;

        let mut removed = 0;
        let mut kept = Vec::with_capacity(table.rows.len());
        for row in table.rows.drain(..) {
            if matches(&row, selector)? {
                removed += 1;
            } else {
                kept.push(row);
            }
        }
        table.rows = kept;
        Ok(removed)
    }

    fn query(
        &self,
        namespace: &str,
        name: &str,
        selector: &Document,
    ) -> Result<Vec<Document>, Error> {
        let state = self.state.lock().unwrap();

        let joins = selector
            .get_array("joins")
            .map(|a| !a.is_empty())
            .unwrap_or(false);
        if joins {
            query_joined(&state, namespace, name, selector)
        } else {
            let table = state
                .tables
                .get(&(namespace.to_string(), name.to_string()))
                .ok_or_else(|| Error::NotFound(format!("schema {namespace}/{name}")))?;

            let mut rows = Vec::new();
            for row in &table.rows {
                if matches(row, selector)? {
                    rows.push(row.clone());
                }
            }
            Ok(rows)
        }
    }

    fn transaction_begin(&self) {
        let state = self.state.lock().unwrap().clone();
        *self.snapshot.lock().unwrap() = Some(state);
    }

    fn transaction_commit(&self) {
        *self.snapshot.lock().unwrap() = None;
    }

    fn transaction_rollback(&self) {
        if let Some(snapshot) = self.snapshot.lock().unwrap().take() {
            *self.state.lock().unwrap() = snapshot;
        }
    }
}

fn parse_fields(schema: &Document) -> Result<IndexMap<String, i32>, Error> {
    let field_doc = schema
        .get_document("fields")
        .map_err(|_| Error::Invalid("schema document lacks fields".to_string()))?;

    let mut fields = IndexMap::new();
    for (name, value) in field_doc {
        let Bson::Int32(code) = value else {
            return Err(Error::Invalid(format!(
                "field '{name}' has a malformed type"
            )));
        };
        if !(0..=8).contains(code) {
            return Err(Error::Invalid(format!(
                "field '{name}' has unknown type code {code}"
            )));
        }
        fields.insert(name.clone(), *code);
    }
    Ok(fields)
}

/// Evaluate a selector tree against one row. A selector without a mode —
/// the empty document — matches everything.
fn matches(row: &Document, selector: &Document) -> Result<bool, Error> {
    let Ok(mode) = selector.get_i32("mode") else {
        return Ok(true);
    };
    let conjunction = mode == 0;

    let mut any_predicate = false;
    let mut all = true;
    let mut any = false;

    if let Ok(fields) = selector.get_array("fields") {
        for field in fields {
            let Bson::Document(predicate) = field else {
                return Err(Error::Invalid("malformed field predicate".to_string()));
            };
            any_predicate = true;
            let hit = match_predicate(row, predicate)?;
            all &= hit;
            any |= hit;
        }
    }

    if let Ok(subs) = selector.get_array("subs") {
        for sub in subs {
            let Bson::Document(sub) = sub else {
                return Err(Error::Invalid("malformed sub-selector".to_string()));
            };
            any_predicate = true;
            let hit = matches(row, sub)?;
            all &= hit;
            any |= hit;
        }
    }

    if !any_predicate {
        return Ok(true);
    }
    Ok(if conjunction { all } else { any })
}

fn match_predicate(row: &Document, predicate: &Document) -> Result<bool, Error> {
    let name = predicate
        .get_str("name")
        .map_err(|_| Error::Invalid("predicate lacks a field name".to_string()))?;
    let op = predicate
        .get_i32("op")
        .map_err(|_| Error::Invalid("predicate lacks an operator".to_string()))?;
    let value = predicate
        .get("value")
        .ok_or_else(|| Error::Invalid("predicate lacks a value".to_string()))?;

    let Some(actual) = row.get(name) else {
        return Ok(false);
    };

    let order = compare(actual, value);
    Ok(match op {
        0 => order == Some(Ordering::Equal),
        1 => order == Some(Ordering::Less),
        2 => matches!(order, Some(Ordering::Less | Ordering::Equal)),
        3 => order == Some(Ordering::Greater),
        4 => matches!(order, Some(Ordering::Greater | Ordering::Equal)),
        5 => order.is_some() && order != Some(Ordering::Equal),
        other => return Err(Error::Invalid(format!("unknown operator {other}"))),
    })
}

/// Type-coerced comparison of two wire values. Integers compare as signed
/// 64-bit, mixed integer/double as double; incomparable kinds yield `None`.
fn compare(a: &Bson, b: &Bson) -> Option<Ordering> {
    fn as_i64(v: &Bson) -> Option<i64> {
        match v {
            Bson::Int32(v) => Some(i64::from(*v)),
            Bson::Int64(v) => Some(*v),
            _ => None,
        }
    }

    match (a, b) {
        (Bson::String(a), Bson::String(b)) => Some(a.cmp(b)),
        (Bson::Binary(a), Bson::Binary(b)) => Some(a.bytes.cmp(&b.bytes)),
        (Bson::Double(a), Bson::Double(b)) => a.partial_cmp(b),
        (Bson::Double(a), b) => as_i64(b).and_then(|b| a.partial_cmp(&(b as f64))),
        (a, Bson::Double(b)) => as_i64(a).and_then(|a| (a as f64).partial_cmp(b)),
        (a, b) => match (as_i64(a), as_i64(b)) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => None,
        },
    }
}

struct JoinSpec {
    local_field: String,
    other_field: String,
    namespace: String,
    name: String,
    selector: Document,
}

fn parse_joins(selector: &Document) -> Result<Vec<JoinSpec>, Error> {
    let mut specs = Vec::new();
    if let Ok(joins) = selector.get_array("joins") {
        for join in joins {
            let Bson::Document(join) = join else {
                return Err(Error::Invalid("malformed join".to_string()));
            };
            let get = |key: &str| -> Result<String, Error> {
                join.get_str(key)
                    .map(str::to_string)
                    .map_err(|_| Error::Invalid(format!("join lacks '{key}'")))
            };
            specs.push(JoinSpec {
                local_field: get("local")?,
                other_field: get("field")?,
                namespace: get("namespace")?,
                name: get("name")?,
                selector: join
                    .get_document("selector")
                    .map(Document::clone)
                    .unwrap_or_default(),
            });
        }
    }
    Ok(specs)
}

/// Nested-loop join in insertion order. Every participating row's fields
/// are emitted under schema-qualified keys (`table.field`).
fn query_joined(
    state: &DbState,
    namespace: &str,
    name: &str,
    selector: &Document,
) -> Result<Vec<Document>, Error> {
    let table = state
        .tables
        .get(&(namespace.to_string(), name.to_string()))
        .ok_or_else(|| Error::NotFound(format!("schema {namespace}/{name}")))?;
    let joins = parse_joins(selector)?;

    let mut results = Vec::new();
    for row in &table.rows {
        if !matches(row, selector)? {
            continue;
        }

        let mut partials = vec![qualify(name, row)];
        for join in &joins {
            let Some(local_value) = row.get(&join.local_field) else {
                partials.clear();
                break;
            };

            // Joined rows may themselves carry further joins.
            let others = query_joined_or_flat(state, &join.namespace, &join.name, &join.selector)?;
            let other_key = format!("{}.{}", join.name, join.other_field);

            let mut next = Vec::new();
            for partial in &partials {
                for other in &others {
                    let Some(other_value) = other.get(&other_key) else {
                        continue;
                    };
                    if compare(local_value, other_value) == Some(Ordering::Equal) {
                        let mut merged = partial.clone();
                        for (key, value) in other {
                            merged.insert(key.clone(), value.clone());
                        }
                        next.push(merged);
                    }
                }
            }
            partials = next;
            if partials.is_empty() {
                break;
            }
        }

        results.extend(partials);
    }
    Ok(results)
}

/// Like [`query_joined`], but rows come back qualified even without joins
/// so merged documents always use one key shape.
fn query_joined_or_flat(
    state: &DbState,
    namespace: &str,
    name: &str,
    selector: &Document,
) -> Result<Vec<Document>, Error> {
    let has_joins = selector
        .get_array("joins")
        .map(|a| !a.is_empty())
        .unwrap_or(false);
    if has_joins {
        return query_joined(state, namespace, name, selector);
    }

    let table = state
        .tables
        .get(&(namespace.to_string(), name.to_string()))
        .ok_or_else(|| Error::NotFound(format!("schema {namespace}/{name}")))?;

    let mut rows = Vec::new();
    for row in &table.rows {
        if matches(row, selector)? {
            rows.push(qualify(name, row));
        }
    }
    Ok(rows)
}

fn qualify(name: &str, row: &Document) -> Document {
    let mut qualified = Document::new();
    for (key, value) in row {
        qualified.insert(format!("{name}.{key}"), value.clone());
    }
    qualified
}

#[cfg(test)]
mod test {
    use super::*;

    fn schema_doc(fields: &[(&str, i32)]) -> Document {
        let mut field_doc = Document::new();
        for (name, code) in fields {
            field_doc.insert(name.to_string(), Bson::Int32(*code));
        }
        let mut doc = Document::new();
        doc.insert("fields", field_doc);
        doc.insert("indices", Vec::<Bson>::new());
        doc
    }

    fn predicate(name: &str, op: i32, value: Bson) -> Bson {
        let mut doc = Document::new();
        doc.insert("name", name);
        doc.insert("op", Bson::Int32(op));
        doc.insert("value", value);
        Bson::Document(doc)
    }

    fn selector(mode: i32, fields: Vec<Bson>) -> Document {
        let mut doc = Document::new();
        doc.insert("mode", Bson::Int32(mode));
        doc.insert("fields", fields);
        doc.insert("subs", Vec::<Bson>::new());
        doc.insert("joins", Vec::<Bson>::new());
        doc
    }

    #[test]
    fn operators_compare_with_coercion() {
        let db = MemoryDb::new();
        db.schema_create("ns", "t", &schema_doc(&[("n", 3), ("s", 6)]))
            .unwrap();

        for (n, s) in [(1i64, "a"), (2, "b"), (3, "c")] {
            let mut row = Document::new();
            row.insert("n", Bson::Int64(n));
            row.insert("s", s);
            db.insert("ns", "t", &row).unwrap();
        }

        let count = |sel: &Document| db.query("ns", "t", sel).unwrap().len();

        assert_eq!(count(&selector(0, vec![predicate("n", 0, Bson::Int64(2))])), 1);
        assert_eq!(count(&selector(0, vec![predicate("n", 1, Bson::Int64(3))])), 2);
        assert_eq!(count(&selector(0, vec![predicate("n", 2, Bson::Int64(2))])), 2);
        assert_eq!(count(&selector(0, vec![predicate("n", 3, Bson::Int64(1))])), 2);
        assert_eq!(count(&selector(0, vec![predicate("n", 4, Bson::Int64(3))])), 1);
        assert_eq!(count(&selector(0, vec![predicate("n", 5, Bson::Int64(2))])), 2);
        // Doubles compare against integer columns.
        assert_eq!(
            count(&selector(0, vec![predicate("n", 3, Bson::Double(1.5))])),
            2
        );
        assert_eq!(count(&selector(0, vec![predicate("s", 0, "b".into())])), 1);

        // and / or over two predicates.
        let and = selector(
            0,
            vec![
                predicate("n", 3, Bson::Int64(1)),
                predicate("s", 0, "b".into()),
            ],
        );
        assert_eq!(count(&and), 1);
        let or = selector(
            1,
            vec![
                predicate("n", 0, Bson::Int64(1)),
                predicate("s", 0, "b".into()),
            ],
        );
        assert_eq!(count(&or), 2);

        // The empty selector matches everything.
        assert_eq!(count(&Document::new()), 3);
    }

    #[test]
    fn snapshot_rollback_restores_rows() {
        let db = MemoryDb::new();
        db.schema_create("ns", "t", &schema_doc(&[("n", 3)])).unwrap();

        let mut row = Document::new();
        row.insert("n", Bson::Int64(1));
        db.insert("ns", "t", &row).unwrap();

        db.transaction_begin();
        let mut row = Document::new();
        row.insert("n", Bson::Int64(2));
        db.insert("ns", "t", &row).unwrap();
        db.transaction_rollback();

        assert_eq!(db.query("ns", "t", &Document::new()).unwrap().len(), 1);
    }

    #[test]
    fn three_table_join_in_insertion_order() {
        let db = MemoryDb::new();
        db.schema_create("ns", "emp", &schema_doc(&[("emp_id", 3), ("emp_name", 6)]))
            .unwrap();
        db.schema_create("ns", "dept", &schema_doc(&[("dept_id", 3), ("dept_name", 6)]))
            .unwrap();
        db.schema_create("ns", "ref", &schema_doc(&[("emp_id", 3), ("dept_id", 3)]))
            .unwrap();

        for (id, name) in [(1i64, "James"), (2, "Jack"), (3, "Henry"), (4, "Tom")] {
            let mut row = Document::new();
            row.insert("emp_id", Bson::Int64(id));
            row.insert("emp_name", name);
            db.insert("ns", "emp", &row).unwrap();
        }
        for (id, name) in [(1i64, "Sales"), (2, "Marketing"), (3, "Finance")] {
            let mut row = Document::new();
            row.insert("dept_id", Bson::Int64(id));
            row.insert("dept_name", name);
            db.insert("ns", "dept", &row).unwrap();
        }
        for (emp, dept) in [(1i64, 1i64), (2, 2), (3, 3), (4, 2)] {
            let mut row = Document::new();
            row.insert("emp_id", Bson::Int64(emp));
            row.insert("dept_id", Bson::Int64(dept));
            db.insert("ns", "ref", &row).unwrap();
        }

        let join = |local: &str, field: &str, name: &str| -> Bson {
            let mut doc = Document::new();
            doc.insert("local", local);
            doc.insert("field", field);
            doc.insert("namespace", "ns");
            doc.insert("name", name);
            doc.insert("selector", Document::new());
            Bson::Document(doc)
        };
        let mut sel = selector(0, Vec::new());
        sel.insert("joins", vec![join("emp_id", "emp_id", "emp"), join("dept_id", "dept_id", "dept")]);

        let rows = db.query("ns", "ref", &sel).unwrap();
        let pairs: Vec<(String, String)> = rows
            .iter()
            .map(|row| {
                (
                    row.get_str("emp.emp_name").unwrap().to_string(),
                    row.get_str("dept.dept_name").unwrap().to_string(),
                )
            })
            .collect();

        assert_eq!(
            pairs,
            vec![
                ("James".to_string(), "Sales".to_string()),
                ("Jack".to_string(), "Marketing".to_string()),
                ("Henry".to_string(), "Finance".to_string()),
                ("Tom".to_string(), "Marketing".to_string()),
            ],
        );
    }
}
