//! Batches: ordered operation containers executed as one scheduling unit.

use crate::operation::{Class, Operation};
use crate::{db, kv, object, BackgroundOperation, Client, Error};
use silo_semantics::Semantics;
use std::sync::Arc;

/// An ordered sequence of operations plus the semantics governing their
/// execution.
///
/// Operations are appended in program order and consumed by `execute`; a
/// batch is owned by one task at a time and carries no internal locking.
pub struct Batch {
    client: Client,
    semantics: Arc<Semantics>,
    operations: Vec<Operation>,
    results: Vec<Result<(), Error>>,
}

impl Batch {
    pub(crate) fn new(client: Client, semantics: Semantics) -> Self {
        Self {
            client,
            semantics: Arc::new(semantics),
            operations: Vec::new(),
            results: Vec::new(),
        }
    }

    pub fn semantics(&self) -> &Semantics {
        &self.semantics
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn add(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    /// Execute all queued operations.
    ///
    /// Walks operations in program order, grouping adjacent ones that share
    /// a scheduler key into single wire round trips. Returns the first
    /// error when any operation failed; per-operation outcomes stay
    /// observable through [`results`](Batch::results) so partial successes
    /// are not lost. The batch is emptied either way.
    pub async fn execute(&mut self) -> Result<(), Error> {
        let operations = std::mem::take(&mut self.operations);
        self.results.clear();

        if operations.is_empty() {
            return Err(Error::Invalid("batch is empty".to_string()));
        }

        tracing::debug!(operations = operations.len(), "executing batch");

        let mut group: Vec<Operation> = Vec::new();
        for operation in operations {
            if group
                .last()
                .map_or(false, |last| last.groups_with(&operation))
            {
                group.push(operation);
                continue;
            }
            if !group.is_empty() {
                let flushed = std::mem::take(&mut group);
                let results = Self::flush(self.client.clone(), self.semantics.clone(), flushed).await;
                self.results.extend(results);
            }
            group.push(operation);
        }
        let results = Self::flush(self.client.clone(), self.semantics.clone(), group).await;
        self.results.extend(results);

        match self.results.iter().find_map(|r| r.as_ref().err()) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Run the execute path on the background worker pool. The callback
    /// fires exactly once, on the worker, with the finished batch and its
    /// overall result; `wait` on the returned handle joins it.
    pub fn execute_async<F>(mut self, callback: F) -> BackgroundOperation<(Batch, Result<(), Error>)>
    where
        F: FnOnce(&Batch, &Result<(), Error>) + Send + 'static,
    {
        BackgroundOperation::spawn(async move {
            let result = self.execute().await;
            callback(&self, &result);
            (self, result)
        })
    }

    /// Per-operation outcomes of the last `execute`, in program order.
    pub fn results(&self) -> &[Result<(), Error>] {
        &self.results
    }

    async fn flush(
        client: Client,
        semantics: Arc<Semantics>,
        group: Vec<Operation>,
    ) -> Vec<Result<(), Error>> {
        let Some(first) = group.first() else {
            return Vec::new();
        };

        tracing::trace!(class = ?first.class(), operations = group.len(), "flushing group");

        match first.class() {
            Class::ObjectCreate
            | Class::ObjectDelete
            | Class::ObjectSync
            | Class::ObjectStatus => {
                object::execute_metadata(&client, &semantics, group).await
            }
            Class::ObjectWrite => object::execute_write(&client, &semantics, group).await,
            Class::ObjectRead => object::execute_read(&client, &semantics, group).await,

            Class::KvPut => kv::execute_put(&client, &semantics, group).await,
            Class::KvDelete => kv::execute_delete(&client, &semantics, group).await,
            Class::KvGet => kv::execute_get(&client, &semantics, group).await,

            Class::DbSchemaCreate
            | Class::DbSchemaGet
            | Class::DbSchemaDelete
            | Class::DbInsert
            | Class::DbUpdate
            | Class::DbDelete => {
                db::protocol::execute(&client, &semantics, group).await
            }
        }
    }
}
