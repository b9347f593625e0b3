//! Wire-protocol server: backend traits, in-memory reference backends, and
//! the accept loop that executes client messages against them.
//!
//! Production deployments plug real storage engines into the backend
//! traits; the in-memory implementations back the integration tests and
//! small single-process setups.

mod backend;
mod memory;
mod serve;

pub use backend::{DbBackend, KvBackend, ObjectBackend};
pub use memory::{MemoryDb, MemoryKv, MemoryObject};
pub use serve::Server;

use silo_message::Code;

/// Backend-level failure, mapped onto a per-operation wire status.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    Exists(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("invalid state: {0}")]
    State(String),
    #[error("backend: {0}")]
    Backend(String),
}

impl Error {
    pub(crate) fn code(&self) -> Code {
        match self {
            Error::NotFound(_) => Code::NotFound,
            Error::Exists(_) => Code::Exists,
            Error::Invalid(_) => Code::Invalid,
            Error::State(_) => Code::State,
            Error::Backend(_) => Code::Backend,
        }
    }
}
