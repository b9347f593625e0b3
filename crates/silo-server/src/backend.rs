//! Storage-engine interfaces.
//!
//! One trait per backend kind, mirroring the operations the wire protocol
//! carries. Implementations must be thread-safe; the server calls them from
//! one task per client connection.

use crate::Error;
use bson::Document;

pub trait ObjectBackend: Send + Sync {
    fn create(&self, namespace: &str, name: &str) -> Result<(), Error>;
    fn delete(&self, namespace: &str, name: &str) -> Result<(), Error>;
    /// Read up to `length` bytes at `offset`; shorter past end of object.
    fn read(&self, namespace: &str, name: &str, offset: u64, length: u64)
        -> Result<Vec<u8>, Error>;
    /// Returns the number of bytes written.
    fn write(&self, namespace: &str, name: &str, offset: u64, data: &[u8]) -> Result<u64, Error>;
    /// `(modification time, size)`.
    fn status(&self, namespace: &str, name: &str) -> Result<(i64, u64), Error>;
    fn sync(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

pub trait KvBackend: Send + Sync {
    fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<(), Error>;
    fn get(&self, namespace: &str, key: &str) -> Result<Vec<u8>, Error>;
    fn delete(&self, namespace: &str, key: &str) -> Result<(), Error>;
    /// All `(key, value)` pairs of a namespace whose keys start with
    /// `prefix`, in key order.
    fn scan(&self, namespace: &str, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, Error>;
}

pub trait DbBackend: Send + Sync {
    fn schema_create(&self, namespace: &str, name: &str, schema: &Document) -> Result<(), Error>;
    fn schema_get(&self, namespace: &str, name: &str) -> Result<Document, Error>;
    fn schema_delete(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Insert one row, returning its assigned id.
    fn insert(&self, namespace: &str, name: &str, row: &Document) -> Result<u64, Error>;
    /// Update matching rows, returning how many were touched.
    fn update(
        &self,
        namespace: &str,
        name: &str,
        selector: &Document,
        values: &Document,
    ) -> Result<u64, Error>;
    /// Delete matching rows, returning how many were removed.
    fn delete(&self, namespace: &str, name: &str, selector: &Document) -> Result<u64, Error>;
    /// Matching rows in insertion order; join queries yield merged rows
    /// with schema-qualified keys.
    fn query(&self, namespace: &str, name: &str, selector: &Document)
        -> Result<Vec<Document>, Error>;

    /// Transaction hooks for batch atomicity. Backends without transaction
    /// support may treat these as best-effort no-ops.
    fn transaction_begin(&self);
    fn transaction_commit(&self);
    fn transaction_rollback(&self);
}
