//! The process-wide client: configuration plus connection pool.

use crate::pool::{Connection, Pool};
use crate::{BackendKind, Batch, Configuration, Error};
use silo_distribution::Distribution;
use silo_message::Message;
use silo_semantics::{Semantics, Template};
use std::sync::Arc;

/// Shared handle to the client runtime. Cloning is cheap; all clones share
/// the configuration and the connection pool.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    config: Configuration,
    pool: Pool,
}

impl Client {
    pub fn new(config: Configuration) -> Result<Self, Error> {
        let pool = Pool::new(&config)?;
        Ok(Self {
            inner: Arc::new(Inner { config, pool }),
        })
    }

    /// Load the configuration from the standard search path and build a
    /// client from it.
    pub fn from_default_config() -> Result<Self, Error> {
        Self::new(Configuration::load()?)
    }

    pub fn config(&self) -> &Configuration {
        &self.inner.config
    }

    /// A new batch using a semantics template.
    pub fn batch(&self, template: Template) -> Batch {
        self.batch_with_semantics(Semantics::new(template))
    }

    pub fn batch_with_semantics(&self, semantics: Semantics) -> Batch {
        Batch::new(self.clone(), semantics)
    }

    /// Distribution constructors bound to the configured object servers and
    /// stripe size.
    pub fn round_robin_distribution(&self) -> Distribution {
        self.prepared(Distribution::round_robin(
            self.config().server_count(BackendKind::Object),
        ))
    }

    pub fn single_server_distribution(&self) -> Distribution {
        self.prepared(Distribution::single_server(
            self.config().server_count(BackendKind::Object),
        ))
    }

    pub fn weighted_distribution(&self) -> Distribution {
        self.prepared(Distribution::weighted(
            self.config().server_count(BackendKind::Object),
        ))
    }

    fn prepared(&self, mut distribution: Distribution) -> Distribution {
        // stripe-size is validated non-zero at configuration load.
        distribution
            .set_block_size(self.config().stripe_size())
            .expect("validated stripe size");
        distribution
    }

    pub(crate) async fn acquire(
        &self,
        kind: BackendKind,
        index: u32,
    ) -> Result<Connection, Error> {
        self.inner.pool.acquire(kind, index).await
    }

    /// One full request/reply exchange. The returned connection is still
    /// leased so the caller can read bulk reply data; release it once the
    /// exchange is complete.
    pub(crate) async fn round_trip(
        &self,
        kind: BackendKind,
        index: u32,
        message: &Message,
    ) -> Result<(Connection, Message), Error> {
        let mut connection = self.acquire(kind, index).await?;
        message.send(connection.stream()).await?;
        let reply = Message::receive(connection.stream()).await?;
        if reply.reply_to() != message.id() {
            // The connection is out of sync; dropping the lease discards it.
            return Err(Error::Protocol(format!(
                "reply correlates to request {}, expected {}",
                reply.reply_to(),
                message.id()
            )));
        }
        Ok((connection, reply))
    }
}
