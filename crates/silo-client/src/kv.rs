//! Key-value client: string-keyed opaque blobs, each key living on exactly
//! one server.

use crate::operation::{Operation, OutVal};
use crate::wire::read_status;
use crate::{hash, BackendKind, Batch, Client, Error};
use bytes::Bytes;
use silo_message::{Kind, Message};
use silo_semantics::Semantics;
use std::collections::VecDeque;
use std::sync::Arc;

struct KvInner {
    namespace: String,
    key: String,
    /// Pinned server index; by default the key hash decides.
    index: Option<u32>,
}

/// Handle to one key in one namespace.
#[derive(Clone)]
pub struct Kv {
    inner: Arc<KvInner>,
}

impl Kv {
    pub fn new(namespace: &str, key: &str) -> Self {
        Self {
            inner: Arc::new(KvInner {
                namespace: namespace.to_string(),
                key: key.to_string(),
                index: None,
            }),
        }
    }

    /// Pin the key to a specific server instead of hashing.
    pub fn new_for_index(index: u32, namespace: &str, key: &str) -> Self {
        Self {
            inner: Arc::new(KvInner {
                namespace: namespace.to_string(),
                key: key.to_string(),
                index: Some(index),
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn key_name(&self) -> &str {
        &self.inner.key
    }

    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    fn server_index(&self, server_count: u32) -> u32 {
        match self.inner.index {
            Some(index) => index,
            None => hash::server_index(&[&self.inner.namespace, &self.inner.key], server_count),
        }
    }

    /// Queue a put. Successive puts to the same key overwrite in program
    /// order.
    pub fn put(&self, value: impl Into<Bytes>, batch: &mut Batch) {
        batch.add(Operation::KvPut {
            kv: self.clone(),
            value: value.into(),
        });
    }

    pub fn delete(&self, batch: &mut Batch) {
        batch.add(Operation::KvDelete { kv: self.clone() });
    }

    /// Queue a get; the slot is filled at execute time, and a missing key
    /// fails the operation with `not-found`.
    pub fn get(&self, batch: &mut Batch) -> OutVal<Bytes> {
        let out = OutVal::new();
        batch.add(Operation::KvGet {
            kv: self.clone(),
            out: Some(out.clone()),
            callback: None,
        });
        out
    }

    /// Queue a get whose value is handed to `callback` during reply
    /// dispatch. The callback fires exactly once and owns the buffer; it is
    /// not invoked when the key is missing.
    pub fn get_with<F>(&self, callback: F, batch: &mut Batch)
    where
        F: FnOnce(Bytes) + Send + 'static,
    {
        batch.add(Operation::KvGet {
            kv: self.clone(),
            out: None,
            callback: Some(Box::new(callback)),
        });
    }
}

/// Shared preamble: all grouped operations address one `(namespace, key)`.
fn head_message(kind: Kind, semantics: &Semantics, kv: &Kv) -> Message {
    let size = Message::string_len(kv.namespace()) + Message::string_len(kv.key_name());
    let mut message = Message::new(kind, size);
    message.set_semantics(semantics);
    message.append_string(kv.namespace());
    message.append_string(kv.key_name());
    message
}

async fn exchange(
    client: &Client,
    kv: &Kv,
    message: &Message,
) -> Result<(crate::pool::Connection, Message), Error> {
    let index = kv.server_index(client.config().server_count(BackendKind::Kv));
    client.round_trip(BackendKind::Kv, index, message).await
}

pub(crate) async fn execute_put(
    client: &Client,
    semantics: &Semantics,
    group: Vec<Operation>,
) -> Vec<Result<(), Error>> {
    let Some(Operation::KvPut { kv, .. }) = group.first() else {
        return mixed_group(group.len());
    };
    let kv = kv.clone();

    let mut message = head_message(Kind::KvPut, semantics, &kv);
    for op in &group {
        let Operation::KvPut { value, .. } = op else {
            return mixed_group(group.len());
        };
        message.add_operation(4 + value.len());
        message.append_u32(value.len() as u32);
        message.append_n(value);
    }

    dispatch_statuses(client, &kv, message, group.len()).await
}

pub(crate) async fn execute_delete(
    client: &Client,
    semantics: &Semantics,
    group: Vec<Operation>,
) -> Vec<Result<(), Error>> {
    let Some(Operation::KvDelete { kv }) = group.first() else {
        return mixed_group(group.len());
    };
    let kv = kv.clone();

    let mut message = head_message(Kind::KvDelete, semantics, &kv);
    for _ in &group {
        message.add_operation(0);
    }

    dispatch_statuses(client, &kv, message, group.len()).await
}

/// Exchange a message whose reply is one status per operation.
async fn dispatch_statuses(
    client: &Client,
    kv: &Kv,
    message: Message,
    operations: usize,
) -> Vec<Result<(), Error>> {
    let (connection, mut reply) = match exchange(client, kv, &message).await {
        Ok(exchange) => exchange,
        Err(err) => return vec![Err(err); operations],
    };

    let results = (0..operations).map(|_| read_status(&mut reply)).collect();
    connection.release();
    results
}

pub(crate) async fn execute_get(
    client: &Client,
    semantics: &Semantics,
    group: Vec<Operation>,
) -> Vec<Result<(), Error>> {
    let Some(Operation::KvGet { kv, .. }) = group.first() else {
        return mixed_group(group.len());
    };
    let kv = kv.clone();

    let mut message = head_message(Kind::KvGet, semantics, &kv);
    for _ in &group {
        message.add_operation(0);
    }

    let (connection, mut reply) = match exchange(client, &kv, &message).await {
        Ok(exchange) => exchange,
        Err(err) => return vec![Err(err); group.len()],
    };

    let mut results = Vec::with_capacity(group.len());
    for op in group {
        let Operation::KvGet { out, callback, .. } = op else {
            results.push(Err(Error::Protocol("mixed operation group".to_string())));
            continue;
        };

        let result = read_status(&mut reply).and_then(|()| {
            let length = reply.get_u32()? as usize;
            let value = reply.get_n(length)?;
            if let Some(out) = out {
                out.set(value.clone());
            }
            if let Some(callback) = callback {
                callback(value);
            }
            Ok(())
        });
        results.push(result);
    }

    connection.release();
    results
}

fn mixed_group(len: usize) -> Vec<Result<(), Error>> {
    (0..len)
        .map(|_| Err(Error::Protocol("mixed operation group".to_string())))
        .collect()
}

/// Scan over the keys of a namespace, optionally prefix-filtered, visiting
/// all KV servers in index order or one pinned server.
///
/// The iterator drives its own request/reply exchanges outside any batch.
pub struct KvIterator {
    client: Client,
    namespace: String,
    prefix: Option<String>,
    servers: std::ops::Range<u32>,
    buffer: VecDeque<(String, Bytes)>,
}

impl KvIterator {
    pub fn new(client: &Client, namespace: &str, prefix: Option<&str>) -> Self {
        let count = client.config().server_count(BackendKind::Kv);
        Self::build(client, namespace, prefix, 0..count)
    }

    pub fn new_for_index(client: &Client, index: u32, namespace: &str, prefix: Option<&str>) -> Self {
        Self::build(client, namespace, prefix, index..index + 1)
    }

    fn build(
        client: &Client,
        namespace: &str,
        prefix: Option<&str>,
        servers: std::ops::Range<u32>,
    ) -> Self {
        Self {
            client: client.clone(),
            namespace: namespace.to_string(),
            prefix: prefix.map(str::to_string),
            servers,
            buffer: VecDeque::new(),
        }
    }

    /// The next `(key, value)` pair, or `None` once every server is
    /// exhausted.
    pub async fn next(&mut self) -> Result<Option<(String, Bytes)>, Error> {
        loop {
            if let Some(pair) = self.buffer.pop_front() {
                return Ok(Some(pair));
            }
            let Some(index) = self.servers.next() else {
                return Ok(None);
            };
            self.fetch(index).await?;
        }
    }

    async fn fetch(&mut self, index: u32) -> Result<(), Error> {
        let prefix = self.prefix.as_deref().unwrap_or("");
        let size = Message::string_len(&self.namespace) + Message::string_len(prefix);
        let mut message = Message::new(Kind::KvScan, size);
        message.append_string(&self.namespace);
        message.append_string(prefix);
        message.add_operation(0);

        let (connection, mut reply) =
            self.client.round_trip(BackendKind::Kv, index, &message).await?;

        read_status(&mut reply)?;
        let count = reply.get_u32()?;
        for _ in 0..count {
            let key = reply.get_string()?;
            let length = reply.get_u32()? as usize;
            let value = reply.get_n(length)?;
            self.buffer.push_back((key, value));
        }

        connection.release();
        Ok(())
    }
}
