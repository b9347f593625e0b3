//! Typed record schemas with field and index metadata.
//!
//! A schema starts client-side and mutable. `create` and `fetch` hand it to
//! the server and freeze it: further field or index additions are `state`
//! errors. Entries, selectors, and iterators hold the schema for field
//! validation.

use super::DbType;
use crate::operation::Operation;
use crate::{Batch, Error};
use bson::{Bson, Document};
use indexmap::IndexMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct State {
    fields: IndexMap<String, DbType>,
    indices: Vec<Vec<String>>,
    server_side: bool,
}

struct SchemaInner {
    namespace: String,
    name: String,
    state: Mutex<State>,
}

/// Handle to a record schema. Clones share one underlying schema.
#[derive(Clone)]
pub struct Schema {
    inner: Arc<SchemaInner>,
}

impl Schema {
    pub fn new(namespace: &str, name: &str) -> Result<Self, Error> {
        if namespace.is_empty() || name.is_empty() {
            return Err(Error::Invalid(
                "schema namespace and name must be non-empty".to_string(),
            ));
        }
        Ok(Self {
            inner: Arc::new(SchemaInner {
                namespace: namespace.to_string(),
                name: name.to_string(),
                state: Mutex::new(State::default()),
            }),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub fn is_server_side(&self) -> bool {
        self.inner.state.lock().unwrap().server_side
    }

    /// Declare a field. Fails with `state` once the schema is server-side
    /// and with `invalid` on duplicates or empty names.
    pub fn add_field(&self, name: &str, db_type: DbType) -> Result<(), Error> {
        if name.is_empty() {
            return Err(Error::Invalid("field name must be non-empty".to_string()));
        }
        let mut state = self.inner.state.lock().unwrap();
        if state.server_side {
            return Err(Error::State(format!(
                "schema {} is server-side, fields can no longer be added",
                self.inner.name
            )));
        }
        if state.fields.contains_key(name) {
            return Err(Error::Invalid(format!("duplicate field '{name}'")));
        }
        state.fields.insert(name.to_string(), db_type);
        Ok(())
    }

    /// Append an index template over previously declared fields.
    pub fn add_index(&self, fields: &[&str]) -> Result<(), Error> {
        if fields.is_empty() {
            return Err(Error::Invalid("index needs at least one field".to_string()));
        }
        let mut state = self.inner.state.lock().unwrap();
        if state.server_side {
            return Err(Error::State(format!(
                "schema {} is server-side, indices can no longer be added",
                self.inner.name
            )));
        }
        for field in fields {
            if !state.fields.contains_key(*field) {
                return Err(Error::Invalid(format!(
                    "index references undeclared field '{field}'"
                )));
            }
        }
        state
            .indices
            .push(fields.iter().map(|f| f.to_string()).collect());
        Ok(())
    }

    /// The declared type of `name`, if any. The implicit row id is typed
    /// [`DbType::Id`].
    pub fn field_type(&self, name: &str) -> Option<DbType> {
        if name == "_id" {
            return Some(DbType::Id);
        }
        self.inner.state.lock().unwrap().fields.get(name).copied()
    }

    /// All declared fields in declaration order.
    pub fn fields(&self) -> Vec<(String, DbType)> {
        self.inner
            .state
            .lock()
            .unwrap()
            .fields
            .iter()
            .map(|(name, db_type)| (name.clone(), *db_type))
            .collect()
    }

    /// Same namespace, same name, same field name→type mapping. Index
    /// templates are ignored.
    pub fn equals(&self, other: &Schema) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        if self.namespace() != other.namespace() || self.name() != other.name() {
            return false;
        }
        let ours = self.inner.state.lock().unwrap();
        let theirs = other.inner.state.lock().unwrap();
        if ours.fields.len() != theirs.fields.len() {
            return false;
        }
        ours.fields
            .iter()
            .all(|(name, db_type)| theirs.fields.get(name) == Some(db_type))
    }

    /// Queue schema creation. The schema transitions to server-side
    /// immediately; a failed execute reports through the batch.
    pub fn create(&self, batch: &mut Batch) -> Result<(), Error> {
        let document = {
            let mut state = self.inner.state.lock().unwrap();
            if state.server_side {
                return Err(Error::State(format!(
                    "schema {} is already server-side",
                    self.inner.name
                )));
            }
            if state.fields.is_empty() {
                return Err(Error::Invalid(
                    "schema has no fields to create".to_string(),
                ));
            }
            state.server_side = true;
            encode(&state)
        };

        batch.add(Operation::DbSchemaCreate {
            schema: self.clone(),
            document,
        });
        Ok(())
    }

    /// Queue a fetch of the server-side definition into this handle. The
    /// fields are filled in during reply dispatch.
    pub fn fetch(&self, batch: &mut Batch) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.server_side {
                return Err(Error::State(format!(
                    "schema {} is already server-side",
                    self.inner.name
                )));
            }
            if !state.fields.is_empty() {
                return Err(Error::State(
                    "cannot fetch into a schema with declared fields".to_string(),
                ));
            }
            state.server_side = true;
        }

        batch.add(Operation::DbSchemaGet {
            schema: self.clone(),
        });
        Ok(())
    }

    /// Queue deletion of the server-side schema.
    pub fn delete(&self, batch: &mut Batch) -> Result<(), Error> {
        batch.add(Operation::DbSchemaDelete {
            schema: self.clone(),
        });
        Ok(())
    }

    /// Fill this handle from a fetched definition document.
    pub(crate) fn apply_document(&self, document: &Document) -> Result<(), Error> {
        let mut fields = IndexMap::new();
        let field_doc = document
            .get_document("fields")
            .map_err(|_| Error::Protocol("schema document lacks fields".to_string()))?;
        for (name, value) in field_doc {
            let Bson::Int32(code) = value else {
                return Err(Error::Protocol(format!(
                    "schema field '{name}' has a malformed type"
                )));
            };
            fields.insert(name.clone(), DbType::from_code(*code)?);
        }

        let mut indices = Vec::new();
        if let Ok(raw) = document.get_array("indices") {
            for index in raw {
                let Bson::Array(names) = index else {
                    continue;
                };
                indices.push(
                    names
                        .iter()
                        .filter_map(|n| n.as_str().map(str::to_string))
                        .collect(),
                );
            }
        }

        let mut state = self.inner.state.lock().unwrap();
        state.fields = fields;
        state.indices = indices;
        Ok(())
    }

    pub(crate) fn index_templates(&self) -> Vec<Vec<String>> {
        self.inner.state.lock().unwrap().indices.clone()
    }
}

fn encode(state: &State) -> Document {
    let mut fields = Document::new();
    for (name, db_type) in &state.fields {
        fields.insert(name.clone(), Bson::Int32(db_type.code()));
    }

    let indices: Vec<Bson> = state
        .indices
        .iter()
        .map(|index| {
            Bson::Array(
                index
                    .iter()
                    .map(|name| Bson::String(name.clone()))
                    .collect(),
            )
        })
        .collect();

    let mut document = Document::new();
    document.insert("fields", fields);
    document.insert("indices", indices);
    document
}

#[cfg(test)]
mod test {
    use super::*;

    fn variables_schema() -> Schema {
        let schema = Schema::new("adios2", "variables").unwrap();
        schema.add_field("file", DbType::String).unwrap();
        schema.add_field("name", DbType::String).unwrap();
        schema.add_field("dimensions", DbType::Uint64).unwrap();
        schema.add_field("min", DbType::Float64).unwrap();
        schema.add_field("max", DbType::Float64).unwrap();
        schema
    }

    #[test]
    fn duplicate_and_empty_fields_rejected() {
        let schema = variables_schema();
        assert!(matches!(
            schema.add_field("file", DbType::String),
            Err(Error::Invalid(_)),
        ));
        assert!(matches!(
            schema.add_field("", DbType::String),
            Err(Error::Invalid(_)),
        ));
    }

    #[test]
    fn index_requires_declared_fields() {
        let schema = variables_schema();
        schema.add_index(&["file"]).unwrap();
        schema.add_index(&["file", "name"]).unwrap();

        assert!(matches!(schema.add_index(&[]), Err(Error::Invalid(_))));
        assert!(matches!(
            schema.add_index(&["missing"]),
            Err(Error::Invalid(_)),
        ));
    }

    #[test]
    fn equals_ignores_indices_and_is_symmetric() {
        let a = variables_schema();
        let b = variables_schema();
        b.add_index(&["file"]).unwrap();

        assert!(a.equals(&a));
        assert!(a.equals(&b));
        assert!(b.equals(&a));

        let c = Schema::new("adios2", "variables").unwrap();
        c.add_field("file", DbType::String).unwrap();
        assert!(!a.equals(&c));

        let d = Schema::new("adios2", "attributes").unwrap();
        assert!(!a.equals(&d));
    }

    #[test]
    fn schema_document_round_trip() {
        let schema = variables_schema();
        schema.add_index(&["file"]).unwrap();
        let document = encode(&schema.inner.state.lock().unwrap());

        let copy = Schema::new("adios2", "variables").unwrap();
        copy.apply_document(&document).unwrap();

        assert!(schema.equals(&copy));
        assert_eq!(copy.field_type("min"), Some(DbType::Float64));
        assert_eq!(copy.index_templates(), vec![vec!["file".to_string()]]);
    }

    #[test]
    fn implicit_id_field() {
        let schema = variables_schema();
        assert_eq!(schema.field_type("_id"), Some(DbType::Id));
        assert_eq!(schema.field_type("missing"), None);
    }
}
