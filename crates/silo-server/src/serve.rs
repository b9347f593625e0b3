//! Accept loop and request execution.
//!
//! One task per connection; within a connection, requests and replies
//! alternate in lockstep, so a connection never interleaves two requests.
//! Bulk data follows its envelope in operation order, both ways.

use crate::{DbBackend, Error, KvBackend, MemoryDb, MemoryKv, MemoryObject, ObjectBackend};
use bson::Document;
use bytes::Bytes;
use silo_message::{Code, Kind, Message};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

pub struct Server {
    object: Arc<dyn ObjectBackend>,
    kv: Arc<dyn KvBackend>,
    db: Arc<dyn DbBackend>,

    /// Open query cursors, disposed when drained.
    cursors: Mutex<HashMap<u64, VecDeque<Document>>>,
    next_cursor: AtomicU64,
}

impl Server {
    pub fn new(
        object: Arc<dyn ObjectBackend>,
        kv: Arc<dyn KvBackend>,
        db: Arc<dyn DbBackend>,
    ) -> Arc<Self> {
        Arc::new(Self {
            object,
            kv,
            db,
            cursors: Mutex::new(HashMap::new()),
            next_cursor: AtomicU64::new(1),
        })
    }

    /// A server over fresh in-memory backends.
    pub fn memory() -> Arc<Self> {
        Self::new(
            Arc::new(MemoryObject::new()),
            Arc::new(MemoryKv::new()),
            Arc::new(MemoryDb::new()),
        )
    }

    /// Run the accept loop until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            tracing::debug!(%peer, "client connected");
            stream.set_nodelay(true).ok();

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(server, stream).await {
                    tracing::debug!(%peer, error = %err, "connection closed");
                }
            });
        }
    }
}

async fn handle_connection(
    server: Arc<Server>,
    mut stream: TcpStream,
) -> Result<(), silo_message::Error> {
    loop {
        let mut request = match Message::receive(&mut stream).await {
            Ok(request) => request,
            // Peer hung up between requests.
            Err(_) => return Ok(()),
        };

        let reply = server.execute(&mut request, &mut stream).await?;
        reply.send(&mut stream).await?;
    }
}

fn ok(reply: &mut Message) {
    reply.add_operation(0);
    reply.append_u32(Code::Ok as u32);
}

fn fail(reply: &mut Message, error: &Error) {
    reply.add_operation(0);
    reply.append_u32(error.code() as u32);
    reply.append_string(&error.to_string());
}

fn get_document(request: &mut Message) -> Result<Document, silo_message::Error> {
    let length = request.get_u32()? as usize;
    let bytes = request.get_n(length)?;
    bson::from_slice(&bytes)
        .map_err(|err| silo_message::Error::Malformed(format!("document decoding: {err}")))
}

impl Server {
    /// Execute one request. Backend failures become per-operation statuses;
    /// only framing breakdowns abort the connection.
    async fn execute(
        &self,
        request: &mut Message,
        stream: &mut TcpStream,
    ) -> Result<Message, silo_message::Error> {
        tracing::trace!(request = ?request, "executing");

        match request.kind() {
            Kind::ObjectCreate | Kind::ObjectDelete | Kind::ObjectSync | Kind::ObjectStatus => {
                self.object_metadata(request)
            }
            Kind::ObjectWrite => self.object_write(request, stream).await,
            Kind::ObjectRead => self.object_read(request),
            Kind::KvPut | Kind::KvDelete | Kind::KvGet => self.kv_ops(request),
            Kind::KvScan => self.kv_scan(request),
            Kind::DbSchemaCreate
            | Kind::DbSchemaGet
            | Kind::DbSchemaDelete
            | Kind::DbInsert
            | Kind::DbUpdate
            | Kind::DbDelete => self.db_ops(request),
            Kind::DbQuery => self.db_query(request),
            Kind::DbFetch => self.db_fetch(request),
            Kind::None => Ok(Message::reply(request, 0)),
        }
    }

    fn object_metadata(&self, request: &mut Message) -> Result<Message, silo_message::Error> {
        let namespace = request.get_string()?;
        let name = request.get_string()?;
        let mut reply = Message::reply(request, 0);

        for _ in 0..request.op_count() {
            let result = match request.kind() {
                Kind::ObjectCreate => self.object.create(&namespace, &name),
                Kind::ObjectDelete => self.object.delete(&namespace, &name),
                Kind::ObjectSync => self.object.sync(&namespace, &name),
                Kind::ObjectStatus => match self.object.status(&namespace, &name) {
                    Ok((modification_time, size)) => {
                        ok(&mut reply);
                        reply.append_u64(modification_time as u64);
                        reply.append_u64(size);
                        continue;
                    }
                    Err(err) => Err(err),
                },
                _ => unreachable!("dispatched by kind"),
            };
            match result {
                Ok(()) => ok(&mut reply),
                Err(err) => fail(&mut reply, &err),
            }
        }
        Ok(reply)
    }

    async fn object_write(
        &self,
        request: &mut Message,
        stream: &mut TcpStream,
    ) -> Result<Message, silo_message::Error> {
        let namespace = request.get_string()?;
        let name = request.get_string()?;

        let mut chunks = Vec::with_capacity(request.op_count() as usize);
        for _ in 0..request.op_count() {
            let offset = request.get_u64()?;
            let length = request.get_u64()?;
            chunks.push((offset, length));
        }

        let mut reply = Message::reply(request, 0);
        for (offset, length) in chunks {
            // Bulk data must be drained even when the backend rejects the
            // write, or the stream loses framing.
            let mut data = vec![0u8; length as usize];
            stream.read_exact(&mut data).await?;

            match self.object.write(&namespace, &name, offset, &data) {
                Ok(written) => {
                    ok(&mut reply);
                    reply.append_u64(written);
                }
                Err(err) => fail(&mut reply, &err),
            }
        }
        Ok(reply)
    }

    fn object_read(&self, request: &mut Message) -> Result<Message, silo_message::Error> {
        let namespace = request.get_string()?;
        let name = request.get_string()?;

        let mut reply = Message::reply(request, 0);
        for _ in 0..request.op_count() {
            let offset = request.get_u64()?;
            let length = request.get_u64()?;

            match self.object.read(&namespace, &name, offset, length) {
                Ok(data) => {
                    ok(&mut reply);
                    reply.append_u64(data.len() as u64);
                    reply.add_send(Bytes::from(data));
                }
                Err(err) => fail(&mut reply, &err),
            }
        }
        Ok(reply)
    }

    fn kv_ops(&self, request: &mut Message) -> Result<Message, silo_message::Error> {
        let namespace = request.get_string()?;
        let key = request.get_string()?;

        let mut reply = Message::reply(request, 0);
        for _ in 0..request.op_count() {
            match request.kind() {
                Kind::KvPut => {
                    let length = request.get_u32()? as usize;
                    let value = request.get_n(length)?;
                    match self.kv.put(&namespace, &key, value.to_vec()) {
                        Ok(()) => ok(&mut reply),
                        Err(err) => fail(&mut reply, &err),
                    }
                }
                Kind::KvDelete => match self.kv.delete(&namespace, &key) {
                    Ok(()) => ok(&mut reply),
                    Err(err) => fail(&mut reply, &err),
                },
                Kind::KvGet => match self.kv.get(&namespace, &key) {
                    Ok(value) => {
                        ok(&mut reply);
                        reply.append_u32(value.len() as u32);
                        reply.append_n(&value);
                    }
                    Err(err) => fail(&mut reply, &err),
                },
                _ => unreachable!("dispatched by kind"),
            }
        }
        Ok(reply)
    }

    fn kv_scan(&self, request: &mut Message) -> Result<Message, silo_message::Error> {
        let namespace = request.get_string()?;
        let prefix = request.get_string()?;

        let mut reply = Message::reply(request, 0);
        match self.kv.scan(&namespace, &prefix) {
            Ok(pairs) => {
                ok(&mut reply);
                reply.append_u32(pairs.len() as u32);
                for (key, value) in pairs {
                    reply.append_string(&key);
                    reply.append_u32(value.len() as u32);
                    reply.append_n(&value);
                }
            }
            Err(err) => fail(&mut reply, &err),
        }
        Ok(reply)
    }

    fn db_ops(&self, request: &mut Message) -> Result<Message, silo_message::Error> {
        let atomic = request.atomic_batch();
        if atomic {
            self.db.transaction_begin();
        }

        let mut reply = Message::reply(request, 0);
        let mut failed = false;

        for _ in 0..request.op_count() {
            let namespace = request.get_string()?;
            let name = request.get_string()?;

            let result: Result<(), Error> = match request.kind() {
                Kind::DbSchemaCreate => {
                    let schema = get_document(request)?;
                    self.db.schema_create(&namespace, &name, &schema)
                }
                Kind::DbSchemaGet => match self.db.schema_get(&namespace, &name) {
                    Ok(schema) => {
                        ok(&mut reply);
                        append_document(&mut reply, &schema);
                        continue;
                    }
                    Err(err) => Err(err),
                },
                Kind::DbSchemaDelete => self.db.schema_delete(&namespace, &name),
                Kind::DbInsert => {
                    let row = get_document(request)?;
                    match self.db.insert(&namespace, &name, &row) {
                        Ok(id) => {
                            ok(&mut reply);
                            let mut id_doc = Document::new();
                            id_doc.insert("id", bson::Bson::Int64(id as i64));
                            append_document(&mut reply, &id_doc);
                            continue;
                        }
                        Err(err) => Err(err),
                    }
                }
                Kind::DbUpdate => {
                    let selector = get_document(request)?;
                    let values = get_document(request)?;
                    self.db
                        .update(&namespace, &name, &selector, &values)
                        .map(|_| ())
                }
                Kind::DbDelete => {
                    let selector = get_document(request)?;
                    self.db.delete(&namespace, &name, &selector).map(|_| ())
                }
                _ => unreachable!("dispatched by kind"),
            };

            match result {
                Ok(()) => ok(&mut reply),
                Err(err) => {
                    failed = true;
                    fail(&mut reply, &err);
                }
            }
        }

        if atomic {
            if failed {
                self.db.transaction_rollback();
            } else {
                self.db.transaction_commit();
            }
        }
        Ok(reply)
    }

    fn db_query(&self, request: &mut Message) -> Result<Message, silo_message::Error> {
        let namespace = request.get_string()?;
        let name = request.get_string()?;
        let selector = get_document(request)?;

        let mut reply = Message::reply(request, 0);
        match self.db.query(&namespace, &name, &selector) {
            Ok(rows) => {
                let cursor = self.next_cursor.fetch_add(1, Ordering::Relaxed);
                self.cursors
                    .lock()
                    .unwrap()
                    .insert(cursor, rows.into());
                ok(&mut reply);
                reply.append_u64(cursor);
            }
            Err(err) => fail(&mut reply, &err),
        }
        Ok(reply)
    }

    fn db_fetch(&self, request: &mut Message) -> Result<Message, silo_message::Error> {
        let cursor = request.get_u64()?;
        let limit = request.get_u32()? as usize;

        let mut reply = Message::reply(request, 0);
        let mut cursors = self.cursors.lock().unwrap();
        match cursors.get_mut(&cursor) {
            Some(rows) => {
                let take = rows.len().min(limit);
                ok(&mut reply);
                reply.append_u32(take as u32);
                for _ in 0..take {
                    let row = rows.pop_front().expect("bounded by queue length");
                    append_document(&mut reply, &row);
                }
                // A short chunk tells the client the cursor is exhausted;
                // dispose of it only then, so a full final chunk still has
                // a cursor to answer the follow-up fetch.
                if take < limit {
                    cursors.remove(&cursor);
                }
            }
            None => fail(
                &mut reply,
                &Error::NotFound(format!("cursor {cursor}")),
            ),
        }
        Ok(reply)
    }
}

fn append_document(reply: &mut Message, document: &Document) {
    let bytes = bson::to_vec(document).expect("document encoding is infallible for built docs");
    reply.append_u32(bytes.len() as u32);
    reply.append_n(&bytes);
}
