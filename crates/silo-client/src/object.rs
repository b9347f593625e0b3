//! Byte-object client: create/delete/read/write/status/sync over the wire
//! protocol, the connection pool, and the distribution engine.
//!
//! A plain object lives on the single server selected by hashing
//! `namespace ∥ name`; a distributed object carries a [`Distribution`] and
//! stripes its byte range across servers. Metadata operations on
//! distributed objects fan out to every object server.

use crate::operation::{ByteCount, Operation, OutVal};
use crate::pool::Connection;
use crate::wire::read_status;
use crate::{hash, BackendKind, Batch, Client, Error};
use bytes::Bytes;
use silo_distribution::Distribution;
use silo_message::{Kind, Message};
use silo_semantics::Semantics;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectStatus {
    pub modification_time: i64,
    pub size: u64,
}

struct ObjectInner {
    namespace: String,
    name: String,
    distribution: Option<Distribution>,
}

/// Handle to a server-resident byte object.
#[derive(Clone)]
pub struct Object {
    inner: Arc<ObjectInner>,
}

impl Object {
    /// A plain object, mapped to one server by its name hash.
    pub fn new(namespace: &str, name: &str) -> Result<Self, Error> {
        Self::build(namespace, name, None)
    }

    /// A distributed object, striped per `distribution`.
    pub fn with_distribution(
        namespace: &str,
        name: &str,
        distribution: Distribution,
    ) -> Result<Self, Error> {
        Self::build(namespace, name, Some(distribution))
    }

    fn build(
        namespace: &str,
        name: &str,
        distribution: Option<Distribution>,
    ) -> Result<Self, Error> {
        if namespace.is_empty() || name.is_empty() {
            return Err(Error::Invalid(
                "object namespace and name must be non-empty".to_string(),
            ));
        }
        Ok(Self {
            inner: Arc::new(ObjectInner {
                namespace: namespace.to_string(),
                name: name.to_string(),
                distribution,
            }),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_distributed(&self) -> bool {
        self.inner.distribution.is_some()
    }

    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub fn create(&self, batch: &mut Batch) {
        batch.add(Operation::ObjectCreate {
            object: self.clone(),
        });
    }

    pub fn delete(&self, batch: &mut Batch) {
        batch.add(Operation::ObjectDelete {
            object: self.clone(),
        });
    }

    /// Queue a write of `data` at `offset`. `nbytes` is reset now and
    /// accumulates transferred bytes at execute time.
    pub fn write(&self, data: Bytes, offset: u64, nbytes: &ByteCount, batch: &mut Batch) {
        nbytes.reset();
        batch.add(Operation::ObjectWrite {
            object: self.clone(),
            data,
            offset,
            nbytes: nbytes.clone(),
        });
    }

    /// Queue a read of `length` bytes at `offset`. The returned slot holds
    /// the read buffer after a successful execute; `nbytes` accumulates the
    /// transferred count (shorter than `length` past end of object).
    pub fn read(
        &self,
        length: u64,
        offset: u64,
        nbytes: &ByteCount,
        batch: &mut Batch,
    ) -> OutVal<Bytes> {
        nbytes.reset();
        let out = OutVal::new();
        batch.add(Operation::ObjectRead {
            object: self.clone(),
            length,
            offset,
            nbytes: nbytes.clone(),
            out: out.clone(),
        });
        out
    }

    /// Queue a status query: modification time and total size, aggregated
    /// over all servers for distributed objects.
    pub fn status(&self, batch: &mut Batch) -> OutVal<ObjectStatus> {
        let out = OutVal::new();
        batch.add(Operation::ObjectStatus {
            object: self.clone(),
            out: out.clone(),
        });
        out
    }

    /// Queue a flush hint to every server holding part of the object.
    pub fn sync(&self, batch: &mut Batch) {
        batch.add(Operation::ObjectSync {
            object: self.clone(),
        });
    }

    /// Servers a metadata operation must reach.
    fn metadata_targets(&self, client: &Client) -> Vec<u32> {
        let count = client.config().server_count(BackendKind::Object);
        match &self.inner.distribution {
            Some(_) => (0..count).collect(),
            None => vec![self.hash_index(count)],
        }
    }

    fn hash_index(&self, server_count: u32) -> u32 {
        hash::server_index(&[&self.inner.namespace, &self.inner.name], server_count)
    }
}

/// One data chunk bound for a server: at most one stripe, at most
/// `max-operation-size` long.
struct Chunk {
    op_index: usize,
    server_offset: u64,
    length: u64,
    /// Position within the operation's logical range, for buffer assembly
    /// and write slicing.
    buffer_position: u64,
}

/// Walk an operation's `(length, offset)` range into per-server chunks.
fn chunks_for(
    object: &Object,
    client: &Client,
    op_index: usize,
    length: u64,
    offset: u64,
) -> Result<Vec<(u32, Chunk)>, Error> {
    let max_operation_size = client.config().max_operation_size();
    let mut chunks = Vec::new();
    let mut buffer_position = 0u64;

    let mut push = |server: u32, server_offset: u64, length: u64, buffer_position: u64| {
        chunks.push((
            server,
            Chunk {
                op_index,
                server_offset,
                length,
                buffer_position,
            },
        ));
    };

    match &object.inner.distribution {
        Some(distribution) => {
            let count = client.config().server_count(BackendKind::Object);
            if distribution.server_count() != count {
                return Err(Error::Invalid(format!(
                    "distribution built for {} servers, {} configured",
                    distribution.server_count(),
                    count
                )));
            }

            // The handle is shared; iterate a private cursor.
            let mut distribution = distribution.clone();
            distribution.reset(length, offset);

            while let Some(stripe) = distribution.next_stripe() {
                let mut done = 0u64;
                while done < stripe.length {
                    let part = (stripe.length - done).min(max_operation_size);
                    push(stripe.index, stripe.offset + done, part, buffer_position);
                    buffer_position += part;
                    done += part;
                }
            }
        }
        None => {
            let server = object.hash_index(client.config().server_count(BackendKind::Object));
            let mut done = 0u64;
            while done < length {
                let part = (length - done).min(max_operation_size);
                push(server, offset + done, part, buffer_position);
                buffer_position += part;
                done += part;
            }
        }
    }

    Ok(chunks)
}

fn record(slot: &mut Option<Error>, error: Error) {
    if slot.is_none() {
        *slot = Some(error);
    }
}

/// Execute a group of create/delete/status/sync operations. The group
/// shares one handle; each target server receives one message carrying the
/// whole group.
pub(crate) async fn execute_metadata(
    client: &Client,
    semantics: &Semantics,
    group: Vec<Operation>,
) -> Vec<Result<(), Error>> {
    let (object, kind) = match &group[0] {
        Operation::ObjectCreate { object } => (object.clone(), Kind::ObjectCreate),
        Operation::ObjectDelete { object } => (object.clone(), Kind::ObjectDelete),
        Operation::ObjectStatus { object, .. } => (object.clone(), Kind::ObjectStatus),
        Operation::ObjectSync { object } => (object.clone(), Kind::ObjectSync),
        _ => return invalid_group(group.len()),
    };

    let targets = object.metadata_targets(client);
    let mut errors: Vec<Option<Error>> = (0..group.len()).map(|_| None).collect();
    let mut statuses: Vec<ObjectStatus> = vec![ObjectStatus::default(); group.len()];

    let size = Message::string_len(object.namespace()) + Message::string_len(object.name());
    let mut exchanges: Vec<(u32, Connection, Message)> = Vec::new();

    for &server in &targets {
        let mut message = Message::new(kind, size);
        message.set_semantics(semantics);
        message.append_string(object.namespace());
        message.append_string(object.name());
        for _ in &group {
            message.add_operation(0);
        }

        match client.round_trip(BackendKind::Object, server, &message).await {
            Ok((connection, reply)) => exchanges.push((server, connection, reply)),
            Err(err) => {
                for slot in errors.iter_mut() {
                    record(slot, err.clone());
                }
            }
        }
    }

    for (server, connection, mut reply) in exchanges {
        for (op_index, op) in group.iter().enumerate() {
            match read_status(&mut reply) {
                Ok(()) => {
                    if let Operation::ObjectStatus { .. } = op {
                        match (reply.get_u64(), reply.get_u64()) {
                            (Ok(mtime), Ok(size)) => {
                                let status = &mut statuses[op_index];
                                status.modification_time =
                                    status.modification_time.max(mtime as i64);
                                status.size += size;
                            }
                            _ => record(
                                &mut errors[op_index],
                                Error::Protocol("truncated status reply".to_string()),
                            ),
                        }
                    }
                }
                // The operation result is the AND over all targets: an
                // object absent on any broadcast target fails the
                // operation, like every other per-target error.
                Err(err) => {
                    record(
                        &mut errors[op_index],
                        annotate_server(err, server),
                    );
                }
            }
        }
        connection.release();
    }

    group
        .into_iter()
        .enumerate()
        .map(|(op_index, op)| match errors[op_index].take() {
            Some(err) => Err(err),
            None => {
                if let Operation::ObjectStatus { out, .. } = op {
                    out.set(statuses[op_index]);
                }
                Ok(())
            }
        })
        .collect()
}

/// A failing operation reports which server rejected it.
fn annotate_server(error: Error, server: u32) -> Error {
    match error {
        Error::NotFound(message) => Error::NotFound(format!("{message} (server {server})")),
        Error::Exists(message) => Error::Exists(format!("{message} (server {server})")),
        Error::Backend(message) => Error::Backend(format!("{message} (server {server})")),
        other => other,
    }
}

fn invalid_group(len: usize) -> Vec<Result<(), Error>> {
    (0..len)
        .map(|_| Err(Error::Protocol("mixed operation group".to_string())))
        .collect()
}

struct Pending {
    message: Message,
    chunks: Vec<Chunk>,
}

impl Pending {
    fn new(kind: Kind, semantics: &Semantics, object: &Object) -> Self {
        let size =
            Message::string_len(object.namespace()) + Message::string_len(object.name());
        let mut message = Message::new(kind, size);
        message.set_semantics(semantics);
        message.append_string(object.namespace());
        message.append_string(object.name());
        Self {
            message,
            chunks: Vec::new(),
        }
    }
}

pub(crate) async fn execute_write(
    client: &Client,
    semantics: &Semantics,
    group: Vec<Operation>,
) -> Vec<Result<(), Error>> {
    let Some(Operation::ObjectWrite { object, .. }) = group.first() else {
        return invalid_group(group.len());
    };
    let object = object.clone();

    let mut errors: Vec<Option<Error>> = (0..group.len()).map(|_| None).collect();
    let mut pending: BTreeMap<u32, Pending> = BTreeMap::new();

    for (op_index, op) in group.iter().enumerate() {
        let Operation::ObjectWrite { data, offset, .. } = op else {
            return invalid_group(group.len());
        };

        let chunks = match chunks_for(&object, client, op_index, data.len() as u64, *offset) {
            Ok(chunks) => chunks,
            Err(err) => {
                record(&mut errors[op_index], err);
                continue;
            }
        };

        for (server, chunk) in chunks {
            let entry = pending
                .entry(server)
                .or_insert_with(|| Pending::new(Kind::ObjectWrite, semantics, &object));
            entry.message.add_operation(16);
            entry.message.append_u64(chunk.server_offset);
            entry.message.append_u64(chunk.length);
            entry.message.add_send(data.slice(
                chunk.buffer_position as usize..(chunk.buffer_position + chunk.length) as usize,
            ));
            entry.chunks.push(chunk);
        }
    }

    let exchanges = send_all(client, pending, &mut errors).await;

    for (_server, connection, mut reply, chunks) in exchanges {
        for chunk in &chunks {
            match read_status(&mut reply) {
                Ok(()) => match reply.get_u64() {
                    Ok(transferred) => {
                        if let Operation::ObjectWrite { nbytes, .. } = &group[chunk.op_index] {
                            nbytes.add(transferred);
                        }
                        if transferred < chunk.length {
                            record(
                                &mut errors[chunk.op_index],
                                Error::ShortTransfer {
                                    requested: chunk.length,
                                    transferred,
                                },
                            );
                        }
                    }
                    Err(err) => record(&mut errors[chunk.op_index], err.into()),
                },
                Err(err) => record(&mut errors[chunk.op_index], err),
            }
        }
        connection.release();
    }

    errors
        .into_iter()
        .map(|slot| match slot {
            Some(err) => Err(err),
            None => Ok(()),
        })
        .collect()
}

pub(crate) async fn execute_read(
    client: &Client,
    semantics: &Semantics,
    group: Vec<Operation>,
) -> Vec<Result<(), Error>> {
    let Some(Operation::ObjectRead { object, .. }) = group.first() else {
        return invalid_group(group.len());
    };
    let object = object.clone();

    let mut errors: Vec<Option<Error>> = (0..group.len()).map(|_| None).collect();
    let mut buffers: Vec<Vec<u8>> = Vec::with_capacity(group.len());
    let mut pending: BTreeMap<u32, Pending> = BTreeMap::new();

    for (op_index, op) in group.iter().enumerate() {
        let Operation::ObjectRead { length, offset, .. } = op else {
            return invalid_group(group.len());
        };
        buffers.push(vec![0u8; *length as usize]);

        let chunks = match chunks_for(&object, client, op_index, *length, *offset) {
            Ok(chunks) => chunks,
            Err(err) => {
                record(&mut errors[op_index], err);
                continue;
            }
        };

        for (server, chunk) in chunks {
            let entry = pending
                .entry(server)
                .or_insert_with(|| Pending::new(Kind::ObjectRead, semantics, &object));
            entry.message.add_operation(16);
            entry.message.append_u64(chunk.server_offset);
            entry.message.append_u64(chunk.length);
            entry.chunks.push(chunk);
        }
    }

    let exchanges = send_all(client, pending, &mut errors).await;

    for (_server, mut connection, mut reply, chunks) in exchanges {
        // First pass: per-chunk status and transfer counts from the
        // envelope; the chunk payloads trail it in the same order.
        let mut transfers: Vec<(usize, u64, u64)> = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            match read_status(&mut reply) {
                Ok(()) => match reply.get_u64() {
                    Ok(transferred) => {
                        transfers.push((chunk.op_index, chunk.buffer_position, transferred));
                        if let Operation::ObjectRead { nbytes, .. } = &group[chunk.op_index] {
                            nbytes.add(transferred);
                        }
                    }
                    Err(err) => record(&mut errors[chunk.op_index], err.into()),
                },
                Err(err) => record(&mut errors[chunk.op_index], err),
            }
        }

        let mut failed = false;
        for position in 0..transfers.len() {
            let (op_index, buffer_position, transferred) = transfers[position];
            let start = buffer_position as usize;
            let end = start + transferred as usize;
            let target = &mut buffers[op_index][start..end];
            if let Err(err) =
                tokio::io::AsyncReadExt::read_exact(connection.stream(), target).await
            {
                // The stream is torn; everything not yet received is lost.
                let err = Error::Net(err.to_string());
                for &(late_op, _, _) in &transfers[position..] {
                    record(&mut errors[late_op], err.clone());
                }
                failed = true;
                break;
            }
        }

        if !failed {
            connection.release();
        }
    }

    let mut buffers = buffers.into_iter();
    group
        .into_iter()
        .enumerate()
        .map(|(op_index, op)| {
            let buffer = buffers.next().unwrap_or_default();
            match errors[op_index].take() {
                Some(err) => Err(err),
                None => {
                    if let Operation::ObjectRead { out, .. } = op {
                        out.set(Bytes::from(buffer));
                    }
                    Ok(())
                }
            }
        })
        .collect()
}

/// Send every pending message, pairing each with its borrowed connection
/// and reply. Failed exchanges mark all of their chunks' operations.
async fn send_all(
    client: &Client,
    pending: BTreeMap<u32, Pending>,
    errors: &mut [Option<Error>],
) -> Vec<(u32, Connection, Message, Vec<Chunk>)> {
    let mut exchanges = Vec::new();

    for (server, entry) in pending {
        match client
            .round_trip(BackendKind::Object, server, &entry.message)
            .await
        {
            Ok((connection, reply)) => {
                exchanges.push((server, connection, reply, entry.chunks))
            }
            Err(err) => {
                for chunk in &entry.chunks {
                    record(&mut errors[chunk.op_index], err.clone());
                }
            }
        }
    }

    exchanges
}
