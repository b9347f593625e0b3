//! Connection pool: per (backend kind, server index) a stack of idle
//! connections plus a semaphore bounding outstanding connections at
//! `max-connections`.
//!
//! A [`Connection`] is a lease. Releasing it returns the socket to the idle
//! stack; dropping it without release — every error path — closes the
//! socket instead, so a stream whose request/reply framing may be out of
//! sync is never handed to another borrower.

use crate::{BackendKind, Configuration, Error};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub(crate) struct Pool {
    shards: [Vec<Arc<Shard>>; 3],
}

struct Shard {
    kind: BackendKind,
    index: u32,
    endpoint: String,
    idle: Mutex<Vec<TcpStream>>,
    limit: Arc<Semaphore>,
}

pub(crate) struct Connection {
    stream: Option<TcpStream>,
    shard: Arc<Shard>,
    reusable: bool,
    _permit: OwnedSemaphorePermit,
}

impl Pool {
    pub fn new(config: &Configuration) -> Result<Self, Error> {
        let mut shards: [Vec<Arc<Shard>>; 3] = [Vec::new(), Vec::new(), Vec::new()];

        for kind in BackendKind::ALL {
            let slot = &mut shards[kind_slot(kind)];
            for index in 0..config.server_count(kind) {
                slot.push(Arc::new(Shard {
                    kind,
                    index,
                    endpoint: config.endpoint(kind, index)?,
                    idle: Mutex::new(Vec::new()),
                    limit: Arc::new(Semaphore::new(config.max_connections())),
                }));
            }
        }

        Ok(Self { shards })
    }

    /// Borrow a connection to `(kind, index)`, dialing a new one when the
    /// idle stack is empty and the shard is below its connection limit,
    /// waiting otherwise.
    pub async fn acquire(&self, kind: BackendKind, index: u32) -> Result<Connection, Error> {
        let shard = self.shards[kind_slot(kind)]
            .get(index as usize)
            .cloned()
            .ok_or_else(|| {
                Error::Invalid(format!("{} server index {index} out of range", kind.as_str()))
            })?;

        let permit = shard
            .limit
            .clone()
            .acquire_owned()
            .await
            .expect("connection limit semaphore closed");

        let idle = shard.idle.lock().unwrap().pop();
        let stream = match idle {
            Some(stream) => stream,
            None => {
                tracing::debug!(
                    kind = kind.as_str(),
                    index,
                    endpoint = %shard.endpoint,
                    "dialing server"
                );
                let stream = TcpStream::connect(&shard.endpoint)
                    .await
                    .map_err(Error::net)?;
                stream.set_nodelay(true).map_err(Error::net)?;
                stream
            }
        };

        Ok(Connection {
            stream: Some(stream),
            shard,
            reusable: false,
            _permit: permit,
        })
    }
}

fn kind_slot(kind: BackendKind) -> usize {
    match kind {
        BackendKind::Object => 0,
        BackendKind::Kv => 1,
        BackendKind::Db => 2,
    }
}

impl Connection {
    pub fn stream(&mut self) -> &mut TcpStream {
        self.stream.as_mut().expect("connection already released")
    }

    /// Return the connection to the pool for reuse. Call this only after a
    /// complete request/reply exchange.
    pub fn release(mut self) {
        self.reusable = true;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if self.reusable {
                self.shard.idle.lock().unwrap().push(stream);
            } else {
                tracing::debug!(
                    kind = self.shard.kind.as_str(),
                    index = self.shard.index,
                    "discarding connection"
                );
            }
        }
    }
}
