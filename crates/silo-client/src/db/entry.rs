//! Row templates bound to a schema.

use super::{DbValue, Schema, Selector};
use crate::operation::Operation;
use crate::{Batch, Error};
use bson::Document;
use indexmap::IndexMap;
use std::sync::{Arc, Mutex};

struct EntryInner {
    schema: Schema,
    values: Mutex<IndexMap<String, DbValue>>,
    id: Mutex<Option<u64>>,
}

/// A row template: field values staged for insert or update, plus the
/// server-assigned row id after a successful insert.
#[derive(Clone)]
pub struct Entry {
    inner: Arc<EntryInner>,
}

impl Entry {
    pub fn new(schema: &Schema) -> Self {
        Self {
            inner: Arc::new(EntryInner {
                schema: schema.clone(),
                values: Mutex::new(IndexMap::new()),
                id: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// Stage a field value. The field must be declared in the schema and
    /// the value must match its type.
    pub fn set_field(&self, name: &str, value: impl Into<DbValue>) -> Result<(), Error> {
        if name == "_id" {
            return Err(Error::Invalid("row ids are server-assigned".to_string()));
        }
        let value = value.into();
        let declared = self
            .inner
            .schema
            .field_type(name)
            .ok_or_else(|| Error::Invalid(format!("field '{name}' is not in the schema")))?;
        if declared != value.db_type() {
            return Err(Error::Invalid(format!(
                "field '{name}' is {declared:?}, value is {:?}",
                value.db_type()
            )));
        }

        self.inner
            .values
            .lock()
            .unwrap()
            .insert(name.to_string(), value);
        Ok(())
    }

    /// Queue an insert of the staged values as a new row.
    pub fn insert(&self, batch: &mut Batch) -> Result<(), Error> {
        let document = self.document()?;
        batch.add(Operation::DbInsert {
            entry: self.clone(),
            document,
        });
        Ok(())
    }

    /// Queue an update of every row matching `selector` with the staged
    /// values.
    pub fn update(&self, selector: &Selector, batch: &mut Batch) -> Result<(), Error> {
        self.check_selector(selector)?;
        let document = self.document()?;
        batch.add(Operation::DbUpdate {
            entry: self.clone(),
            selector: selector.to_document(),
            document,
        });
        Ok(())
    }

    /// Queue deletion of every row matching `selector`.
    pub fn delete(&self, selector: &Selector, batch: &mut Batch) -> Result<(), Error> {
        self.check_selector(selector)?;
        batch.add(Operation::DbDelete {
            entry: self.clone(),
            selector: selector.to_document(),
        });
        Ok(())
    }

    fn check_selector(&self, selector: &Selector) -> Result<(), Error> {
        if !selector.schema().equals(&self.inner.schema) {
            return Err(Error::Invalid(
                "selector belongs to a different schema".to_string(),
            ));
        }
        Ok(())
    }

    /// The server-assigned row id, available after a successful insert.
    pub fn id(&self) -> Option<u64> {
        *self.inner.id.lock().unwrap()
    }

    pub(crate) fn set_id(&self, id: u64) {
        *self.inner.id.lock().unwrap() = Some(id);
    }

    fn document(&self) -> Result<Document, Error> {
        let values = self.inner.values.lock().unwrap();
        if values.is_empty() {
            return Err(Error::Invalid("entry has no staged values".to_string()));
        }
        let mut document = Document::new();
        for (name, value) in values.iter() {
            document.insert(name.clone(), value.to_bson());
        }
        Ok(document)
    }
}
