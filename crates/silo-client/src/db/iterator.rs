//! Cursor iteration over query results.
//!
//! `db-query` plans the query on the server and returns a cursor id;
//! `db-fetch` drains it in fixed-size chunks. The iterator buffers one
//! chunk at a time; a short chunk marks the cursor exhausted and disposed.

use super::protocol::{append_document, document_bytes, get_document, server_index};
use super::{DbType, DbValue, Schema, Selector};
use crate::wire::read_status;
use crate::{BackendKind, Client, Error};
use bson::Document;
use silo_message::{Kind, Message};
use std::collections::VecDeque;

const FETCH_CHUNK: u32 = 256;

pub struct DbIterator {
    client: Client,
    /// Primary schema first, joined schemas after, in join order.
    schemas: Vec<Schema>,
    joined: bool,
    cursor: u64,
    buffer: VecDeque<Document>,
    current: Option<Document>,
    exhausted: bool,
}

impl DbIterator {
    /// Send the query and hold its server-side cursor. `None` selects every
    /// row of the schema.
    pub async fn new(
        client: &Client,
        schema: &Schema,
        selector: Option<&Selector>,
    ) -> Result<Self, Error> {
        let (document, schemas, joined) = match selector {
            Some(selector) => {
                if !selector.schema().equals(schema) {
                    return Err(Error::Invalid(
                        "selector belongs to a different schema".to_string(),
                    ));
                }
                (
                    selector.to_document(),
                    selector.schemas(),
                    selector.has_joins(),
                )
            }
            None => (Document::new(), vec![schema.clone()], false),
        };

        let bytes = document_bytes(&document)?;
        let size = Message::string_len(schema.namespace())
            + Message::string_len(schema.name())
            + 4
            + bytes.len();
        let mut message = Message::new(Kind::DbQuery, size);
        message.add_operation(0);
        message.append_string(schema.namespace());
        message.append_string(schema.name());
        append_document(&mut message, &bytes);

        let index = server_index(client, schema.namespace());
        let (connection, mut reply) = client.round_trip(BackendKind::Db, index, &message).await?;
        read_status(&mut reply)?;
        let cursor = reply.get_u64()?;
        connection.release();

        Ok(Self {
            client: client.clone(),
            schemas,
            joined,
            cursor,
            buffer: VecDeque::new(),
            current: None,
            exhausted: false,
        })
    }

    /// Advance to the next row. Returns `false` once the query is drained.
    pub async fn next(&mut self) -> Result<bool, Error> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch().await?;
        }
        self.current = self.buffer.pop_front();
        Ok(self.current.is_some())
    }

    async fn fetch(&mut self) -> Result<(), Error> {
        let mut message = Message::new(Kind::DbFetch, 0);
        message.add_operation(12);
        message.append_u64(self.cursor);
        message.append_u32(FETCH_CHUNK);

        let index = server_index(&self.client, self.schemas[0].namespace());
        let (connection, mut reply) = self
            .client
            .round_trip(BackendKind::Db, index, &message)
            .await?;
        read_status(&mut reply)?;

        let count = reply.get_u32()?;
        for _ in 0..count {
            self.buffer.push_back(get_document(&mut reply)?);
        }
        if count < FETCH_CHUNK {
            self.exhausted = true;
        }
        connection.release();
        Ok(())
    }

    /// Read a field of the current row by name. In join results the name is
    /// resolved across all participating schemas and must be unambiguous.
    pub fn get_field(&self, name: &str) -> Result<(DbType, DbValue), Error> {
        let row = self.current_row()?;

        if !self.joined {
            let db_type = self.schemas[0]
                .field_type(name)
                .ok_or_else(|| Error::Invalid(format!("field '{name}' is not in the schema")))?;
            let value = row
                .get(name)
                .ok_or_else(|| Error::NotFound(format!("field '{name}' missing from row")))?;
            return Ok((db_type, DbValue::from_bson(db_type, value)?));
        }

        let mut matches = Vec::new();
        for schema in &self.schemas {
            if let Some(db_type) = schema.field_type(name) {
                let key = format!("{}.{name}", schema.name());
                if row.contains_key(&key) {
                    matches.push((db_type, key));
                }
            }
        }
        match matches.len() {
            0 => Err(Error::Invalid(format!(
                "field '{name}' is not in any joined schema"
            ))),
            1 => {
                let (db_type, key) = matches.remove(0);
                let value = row
                    .get(&key)
                    .ok_or_else(|| Error::NotFound(format!("field '{key}' missing from row")))?;
                Ok((db_type, DbValue::from_bson(db_type, value)?))
            }
            _ => Err(Error::Invalid(format!(
                "field '{name}' is ambiguous, qualify it with a schema name"
            ))),
        }
    }

    /// Read a field of the current row, disambiguated by schema name.
    pub fn get_field_ex(
        &self,
        schema_name: &str,
        name: &str,
    ) -> Result<(DbType, DbValue), Error> {
        let row = self.current_row()?;

        let schema = self
            .schemas
            .iter()
            .find(|s| s.name() == schema_name)
            .ok_or_else(|| {
                Error::Invalid(format!("schema '{schema_name}' is not part of this query"))
            })?;
        let db_type = schema.field_type(name).ok_or_else(|| {
            Error::Invalid(format!("field '{name}' is not in schema '{schema_name}'"))
        })?;

        let key = if self.joined {
            format!("{schema_name}.{name}")
        } else {
            name.to_string()
        };
        let value = row
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("field '{key}' missing from row")))?;
        Ok((db_type, DbValue::from_bson(db_type, value)?))
    }

    /// The current row's server-assigned id.
    pub fn id(&self) -> Result<u64, Error> {
        let (_, value) = if self.joined {
            self.get_field_ex(self.schemas[0].name(), "_id")?
        } else {
            self.get_field("_id")?
        };
        match value {
            DbValue::Id(id) => Ok(id),
            _ => Err(Error::Protocol("row id has a malformed type".to_string())),
        }
    }

    fn current_row(&self) -> Result<&Document, Error> {
        self.current
            .as_ref()
            .ok_or_else(|| Error::State("iterator has no current row".to_string()))
    }
}
