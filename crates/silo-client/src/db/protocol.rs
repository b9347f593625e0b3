//! DB operation envelopes.
//!
//! Every request is a parameter template: per operation an ordered list of
//! in-params (NUL-terminated strings and length-prefixed BSON documents),
//! per reply a status plus optional result documents. A grouped request
//! carries `op_count × in_params` serialized values; replies dispatch
//! per-operation outcomes independently, so one round trip can mix
//! successes and per-row failures.

use crate::operation::Operation;
use crate::wire::read_status;
use crate::{hash, BackendKind, Client, Error};
use bson::Document;
use silo_message::{Kind, Message};
use silo_semantics::Semantics;

pub(crate) fn document_bytes(document: &Document) -> Result<Vec<u8>, Error> {
    bson::to_vec(document).map_err(|err| Error::Invalid(format!("document encoding: {err}")))
}

pub(crate) fn append_document(message: &mut Message, bytes: &[u8]) {
    message.append_u32(bytes.len() as u32);
    message.append_n(bytes);
}

pub(crate) fn get_document(reply: &mut Message) -> Result<Document, Error> {
    let length = reply.get_u32()? as usize;
    let bytes = reply.get_n(length)?;
    bson::from_slice(&bytes).map_err(|err| Error::Protocol(format!("document decoding: {err}")))
}

/// All operations of one namespace execute on one server, so multi-schema
/// joins inside a namespace never cross servers.
pub(crate) fn server_index(client: &Client, namespace: &str) -> u32 {
    hash::server_index(&[namespace], client.config().server_count(BackendKind::Db))
}

/// Execute one group of DB operations as a single round trip.
pub(crate) async fn execute(
    client: &Client,
    semantics: &Semantics,
    group: Vec<Operation>,
) -> Vec<Result<(), Error>> {
    let (kind, namespace) = match &group[0] {
        Operation::DbSchemaCreate { schema, .. } => (Kind::DbSchemaCreate, schema.namespace()),
        Operation::DbSchemaGet { schema } => (Kind::DbSchemaGet, schema.namespace()),
        Operation::DbSchemaDelete { schema } => (Kind::DbSchemaDelete, schema.namespace()),
        Operation::DbInsert { entry, .. } => (Kind::DbInsert, entry.schema().namespace()),
        Operation::DbUpdate { entry, .. } => (Kind::DbUpdate, entry.schema().namespace()),
        Operation::DbDelete { entry, .. } => (Kind::DbDelete, entry.schema().namespace()),
        _ => {
            return (0..group.len())
                .map(|_| Err(Error::Protocol("mixed operation group".to_string())))
                .collect()
        }
    };
    let index = server_index(client, namespace);

    let mut message = Message::new(kind, 0);
    message.set_semantics(semantics);
    if let Err(err) = pack(&mut message, &group) {
        return (0..group.len()).map(|_| Err(err.clone())).collect();
    }

    let (connection, mut reply) = match client.round_trip(BackendKind::Db, index, &message).await {
        Ok(exchange) => exchange,
        Err(err) => return (0..group.len()).map(|_| Err(err.clone())).collect(),
    };

    let results = group
        .into_iter()
        .map(|op| unpack(&mut reply, op))
        .collect();
    connection.release();
    results
}

/// Append every operation's in-params.
fn pack(message: &mut Message, group: &[Operation]) -> Result<(), Error> {
    for op in group {
        match op {
            Operation::DbSchemaCreate { schema, document } => {
                let bytes = document_bytes(document)?;
                message.add_operation(names_len(schema.namespace(), schema.name()) + 4 + bytes.len());
                append_names(message, schema.namespace(), schema.name());
                append_document(message, &bytes);
            }
            Operation::DbSchemaGet { schema } | Operation::DbSchemaDelete { schema } => {
                message.add_operation(names_len(schema.namespace(), schema.name()));
                append_names(message, schema.namespace(), schema.name());
            }
            Operation::DbInsert { entry, document } => {
                let schema = entry.schema();
                let bytes = document_bytes(document)?;
                message.add_operation(names_len(schema.namespace(), schema.name()) + 4 + bytes.len());
                append_names(message, schema.namespace(), schema.name());
                append_document(message, &bytes);
            }
            Operation::DbUpdate {
                entry,
                selector,
                document,
            } => {
                let schema = entry.schema();
                let selector_bytes = document_bytes(selector)?;
                let entry_bytes = document_bytes(document)?;
                message.add_operation(
                    names_len(schema.namespace(), schema.name())
                        + 8
                        + selector_bytes.len()
                        + entry_bytes.len(),
                );
                append_names(message, schema.namespace(), schema.name());
                append_document(message, &selector_bytes);
                append_document(message, &entry_bytes);
            }
            Operation::DbDelete { entry, selector } => {
                let schema = entry.schema();
                let bytes = document_bytes(selector)?;
                message.add_operation(names_len(schema.namespace(), schema.name()) + 4 + bytes.len());
                append_names(message, schema.namespace(), schema.name());
                append_document(message, &bytes);
            }
            _ => return Err(Error::Protocol("mixed operation group".to_string())),
        }
    }
    Ok(())
}

fn names_len(namespace: &str, name: &str) -> usize {
    Message::string_len(namespace) + Message::string_len(name)
}

fn append_names(message: &mut Message, namespace: &str, name: &str) {
    message.append_string(namespace);
    message.append_string(name);
}

/// Dispatch one operation's reply parameters.
fn unpack(reply: &mut Message, op: Operation) -> Result<(), Error> {
    match op {
        Operation::DbSchemaGet { schema } => {
            read_status(reply)?;
            let document = get_document(reply)?;
            schema.apply_document(&document)
        }
        Operation::DbInsert { entry, .. } => {
            read_status(reply)?;
            let document = get_document(reply)?;
            let id = document
                .get_i64("id")
                .map_err(|_| Error::Protocol("insert reply lacks a row id".to_string()))?;
            entry.set_id(id as u64);
            Ok(())
        }
        Operation::DbSchemaCreate { .. }
        | Operation::DbSchemaDelete { .. }
        | Operation::DbUpdate { .. }
        | Operation::DbDelete { .. } => read_status(reply),
        _ => Err(Error::Protocol("mixed operation group".to_string())),
    }
}
