//! Client runtime of the silo storage framework.
//!
//! Applications manipulate three kinds of server-resident state — opaque
//! byte objects, string-keyed values, and structured records — through one
//! library. Operations are queued on a [`Batch`] whose [`Semantics`] govern
//! atomicity, ordering, and safety; executing the batch groups adjacent
//! operations that share a scheduler key, packs them into wire messages,
//! and dispatches them over pooled server connections.
//!
//! ```no_run
//! # async fn example() -> Result<(), silo_client::Error> {
//! use silo_client::{semantics::Template, Client, Kv};
//!
//! let client = Client::from_default_config()?;
//! let mut batch = client.batch(Template::Default);
//!
//! let kv = Kv::new("posts", "hello");
//! kv.put("world", &mut batch);
//! let value = kv.get(&mut batch);
//!
//! batch.execute().await?;
//! assert_eq!(value.take().unwrap().as_ref(), b"world");
//! # Ok(())
//! # }
//! ```

mod background;
mod batch;
mod client;
mod config;
pub mod db;
mod kv;
mod object;
mod operation;
mod pool;

pub(crate) mod hash;
pub(crate) mod wire;

pub use background::BackgroundOperation;
pub use batch::Batch;
pub use client::Client;
pub use config::{BackendConfig, BackendKind, Component, Configuration, HsmPolicy};
pub use kv::{Kv, KvIterator};
pub use object::{Object, ObjectStatus};
pub use operation::{ByteCount, OutVal};

pub use silo_distribution::{Distribution, Stripe};
pub use silo_semantics as semantics;
pub use silo_semantics::Semantics;

use silo_message::Code;

/// The typed error record surfaced by every operation and batch execution.
///
/// Kinds form a closed set; errors are never swallowed and never become
/// panics. The record is cheap to clone so one failure can live both in an
/// operation's result slot and in the batch-level result.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("network: {0}")]
    Net(String),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    Exists(String),
    #[error("invalid argument: {0}")]
    Invalid(String),
    #[error("backend: {0}")]
    Backend(String),
    #[error("short transfer: {transferred} of {requested} bytes")]
    ShortTransfer { requested: u64, transferred: u64 },
    #[error("invalid state: {0}")]
    State(String),
}

impl Error {
    pub(crate) fn net(err: std::io::Error) -> Self {
        Error::Net(err.to_string())
    }

    /// Map a per-operation wire status and its diagnostic back into the
    /// typed record.
    pub(crate) fn from_wire(code: Code, message: String) -> Self {
        match code {
            Code::Ok => Error::Protocol("status code ok is not an error".to_string()),
            Code::NotFound => Error::NotFound(message),
            Code::Exists => Error::Exists(message),
            Code::Invalid => Error::Invalid(message),
            Code::Backend => Error::Backend(message),
            Code::State => Error::State(message),
            Code::Io => Error::Net(message),
            Code::Protocol => Error::Protocol(message),
        }
    }
}

impl From<silo_message::Error> for Error {
    fn from(err: silo_message::Error) -> Self {
        match err {
            silo_message::Error::Io(io) => Error::Net(io.to_string()),
            other => Error::Protocol(other.to_string()),
        }
    }
}

impl From<silo_distribution::Error> for Error {
    fn from(err: silo_distribution::Error) -> Self {
        Error::Invalid(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
