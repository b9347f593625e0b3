//! Operations: the tagged variant queued on a batch, one tag per
//! (client, verb) pair, plus the out-parameter slots results are delivered
//! through.

use crate::db::{Entry, Schema};
use crate::kv::Kv;
use crate::object::{Object, ObjectStatus};
use bson::Document;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Out-parameter slot filled during reply dispatch. Clone to keep a reader
/// while the batch owns the writer.
pub struct OutVal<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> OutVal<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn set(&self, value: T) {
        *self.slot.lock().unwrap() = Some(value);
    }

    /// Take the delivered value, if the operation succeeded.
    pub fn take(&self) -> Option<T> {
        self.slot.lock().unwrap().take()
    }
}

impl<T> Clone for OutVal<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

/// Accumulating byte counter shared between the caller and queued
/// read/write operations. Queuing an operation resets it; each completed
/// stripe adds its transferred length, so several operations sharing one
/// counter sum their transfers.
#[derive(Clone, Default)]
pub struct ByteCount(Arc<AtomicU64>);

impl ByteCount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }

    pub(crate) fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::AcqRel);
    }
}

pub(crate) type KvCallback = Box<dyn FnOnce(Bytes) + Send>;

pub(crate) enum Operation {
    ObjectCreate {
        object: Object,
    },
    ObjectDelete {
        object: Object,
    },
    ObjectWrite {
        object: Object,
        data: Bytes,
        offset: u64,
        nbytes: ByteCount,
    },
    ObjectRead {
        object: Object,
        length: u64,
        offset: u64,
        nbytes: ByteCount,
        out: OutVal<Bytes>,
    },
    ObjectStatus {
        object: Object,
        out: OutVal<ObjectStatus>,
    },
    ObjectSync {
        object: Object,
    },

    KvPut {
        kv: Kv,
        value: Bytes,
    },
    KvDelete {
        kv: Kv,
    },
    KvGet {
        kv: Kv,
        out: Option<OutVal<Bytes>>,
        callback: Option<KvCallback>,
    },

    DbSchemaCreate {
        schema: Schema,
        document: Document,
    },
    DbSchemaGet {
        schema: Schema,
    },
    DbSchemaDelete {
        schema: Schema,
    },
    DbInsert {
        entry: Entry,
        document: Document,
    },
    DbUpdate {
        entry: Entry,
        selector: Document,
        document: Document,
    },
    DbDelete {
        entry: Entry,
        selector: Document,
    },
}

/// Operation classes: two adjacent operations may share one wire round
/// trip only when class and scheduler key both match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Class {
    ObjectCreate,
    ObjectDelete,
    ObjectWrite,
    ObjectRead,
    ObjectStatus,
    ObjectSync,
    KvPut,
    KvDelete,
    KvGet,
    DbSchemaCreate,
    DbSchemaGet,
    DbSchemaDelete,
    DbInsert,
    DbUpdate,
    DbDelete,
}

impl Operation {
    pub fn class(&self) -> Class {
        match self {
            Operation::ObjectCreate { .. } => Class::ObjectCreate,
            Operation::ObjectDelete { .. } => Class::ObjectDelete,
            Operation::ObjectWrite { .. } => Class::ObjectWrite,
            Operation::ObjectRead { .. } => Class::ObjectRead,
            Operation::ObjectStatus { .. } => Class::ObjectStatus,
            Operation::ObjectSync { .. } => Class::ObjectSync,
            Operation::KvPut { .. } => Class::KvPut,
            Operation::KvDelete { .. } => Class::KvDelete,
            Operation::KvGet { .. } => Class::KvGet,
            Operation::DbSchemaCreate { .. } => Class::DbSchemaCreate,
            Operation::DbSchemaGet { .. } => Class::DbSchemaGet,
            Operation::DbSchemaDelete { .. } => Class::DbSchemaDelete,
            Operation::DbInsert { .. } => Class::DbInsert,
            Operation::DbUpdate { .. } => Class::DbUpdate,
            Operation::DbDelete { .. } => Class::DbDelete,
        }
    }

    /// Scheduler key: the identity of the subject handle. Opaque and only
    /// compared for equality.
    pub fn key(&self) -> usize {
        match self {
            Operation::ObjectCreate { object }
            | Operation::ObjectDelete { object }
            | Operation::ObjectWrite { object, .. }
            | Operation::ObjectRead { object, .. }
            | Operation::ObjectStatus { object, .. }
            | Operation::ObjectSync { object } => object.key(),

            Operation::KvPut { kv, .. }
            | Operation::KvDelete { kv }
            | Operation::KvGet { kv, .. } => kv.key(),

            Operation::DbSchemaCreate { schema, .. }
            | Operation::DbSchemaGet { schema }
            | Operation::DbSchemaDelete { schema } => schema.key(),

            // Entry operations group per schema, so inserts into the same
            // schema coalesce into one round trip.
            Operation::DbInsert { entry, .. }
            | Operation::DbUpdate { entry, .. }
            | Operation::DbDelete { entry, .. } => entry.schema().key(),
        }
    }

    pub fn groups_with(&self, other: &Operation) -> bool {
        self.class() == other.class() && self.key() == other.key()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::{DbType, Entry, Schema};
    use crate::kv::Kv;

    #[test]
    fn adjacent_operations_group_per_handle_and_class() {
        let kv = Kv::new("ns", "key");
        let put_a = Operation::KvPut {
            kv: kv.clone(),
            value: Bytes::from_static(b"a"),
        };
        let put_b = Operation::KvPut {
            kv: kv.clone(),
            value: Bytes::from_static(b"b"),
        };
        let get = Operation::KvGet {
            kv: kv.clone(),
            out: Some(OutVal::new()),
            callback: None,
        };

        assert!(put_a.groups_with(&put_b));
        // The verb differs, so the group breaks.
        assert!(!put_a.groups_with(&get));

        // Same namespace and key, but a distinct handle identity.
        let other = Operation::KvPut {
            kv: Kv::new("ns", "key"),
            value: Bytes::from_static(b"c"),
        };
        assert!(!put_a.groups_with(&other));
    }

    #[test]
    fn entry_operations_group_by_schema() {
        let schema = Schema::new("ns", "table").unwrap();
        schema.add_field("n", DbType::Uint64).unwrap();

        let insert_a = Operation::DbInsert {
            entry: Entry::new(&schema),
            document: Document::new(),
        };
        let insert_b = Operation::DbInsert {
            entry: Entry::new(&schema),
            document: Document::new(),
        };
        assert!(insert_a.groups_with(&insert_b));

        let foreign = Schema::new("ns", "table").unwrap();
        let insert_c = Operation::DbInsert {
            entry: Entry::new(&foreign),
            document: Document::new(),
        };
        assert!(!insert_a.groups_with(&insert_c));
    }

    #[test]
    fn byte_count_accumulates_until_reset() {
        let count = ByteCount::new();
        count.add(3);
        count.add(4);
        assert_eq!(count.get(), 7);

        count.reset();
        assert_eq!(count.get(), 0);

        // Clones share the counter.
        let clone = count.clone();
        clone.add(5);
        assert_eq!(count.get(), 5);
    }
}
