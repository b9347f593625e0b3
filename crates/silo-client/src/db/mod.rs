//! Structured-record client: typed schemas, row templates, predicate
//! selectors with joins, and cursor iterators, marshalled through the DB
//! protocol envelope.

mod entry;
mod iterator;
mod schema;
mod selector;

pub(crate) mod protocol;

pub use entry::Entry;
pub use iterator::DbIterator;
pub use schema::Schema;
pub use selector::{Selector, SelectorMode, SelectorOp};

use crate::Error;
use bson::spec::BinarySubtype;
use bson::{Binary, Bson};

/// Field types a schema can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DbType {
    Sint32 = 0,
    Uint32 = 1,
    Sint64 = 2,
    Uint64 = 3,
    Float32 = 4,
    Float64 = 5,
    String = 6,
    Blob = 7,
    Id = 8,
}

impl DbType {
    pub(crate) fn from_code(code: i32) -> Result<Self, Error> {
        Ok(match code {
            0 => DbType::Sint32,
            1 => DbType::Uint32,
            2 => DbType::Sint64,
            3 => DbType::Uint64,
            4 => DbType::Float32,
            5 => DbType::Float64,
            6 => DbType::String,
            7 => DbType::Blob,
            8 => DbType::Id,
            other => return Err(Error::Invalid(format!("unknown field type code {other}"))),
        })
    }

    pub(crate) fn code(&self) -> i32 {
        *self as i32
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Sint32(i32),
    Uint32(u32),
    Sint64(i64),
    Uint64(u64),
    Float32(f32),
    Float64(f64),
    String(String),
    Blob(Vec<u8>),
    Id(u64),
}

impl DbValue {
    pub fn db_type(&self) -> DbType {
        match self {
            DbValue::Sint32(_) => DbType::Sint32,
            DbValue::Uint32(_) => DbType::Uint32,
            DbValue::Sint64(_) => DbType::Sint64,
            DbValue::Uint64(_) => DbType::Uint64,
            DbValue::Float32(_) => DbType::Float32,
            DbValue::Float64(_) => DbType::Float64,
            DbValue::String(_) => DbType::String,
            DbValue::Blob(_) => DbType::Blob,
            DbValue::Id(_) => DbType::Id,
        }
    }

    /// Document encoding. Unsigned 64-bit values are bit-cast into the
    /// signed wire integer; the schema type directs the decode back.
    pub(crate) fn to_bson(&self) -> Bson {
        match self {
            DbValue::Sint32(v) => Bson::Int32(*v),
            DbValue::Uint32(v) => Bson::Int64(i64::from(*v)),
            DbValue::Sint64(v) => Bson::Int64(*v),
            DbValue::Uint64(v) => Bson::Int64(*v as i64),
            DbValue::Float32(v) => Bson::Double(f64::from(*v)),
            DbValue::Float64(v) => Bson::Double(*v),
            DbValue::String(v) => Bson::String(v.clone()),
            DbValue::Blob(v) => Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: v.clone(),
            }),
            DbValue::Id(v) => Bson::Int64(*v as i64),
        }
    }

    pub(crate) fn from_bson(db_type: DbType, value: &Bson) -> Result<Self, Error> {
        let mismatch = || {
            Error::Protocol(format!(
                "field value {value} does not decode as {db_type:?}"
            ))
        };

        Ok(match (db_type, value) {
            (DbType::Sint32, Bson::Int32(v)) => DbValue::Sint32(*v),
            (DbType::Sint32, Bson::Int64(v)) => DbValue::Sint32(*v as i32),
            (DbType::Uint32, Bson::Int32(v)) => DbValue::Uint32(*v as u32),
            (DbType::Uint32, Bson::Int64(v)) => DbValue::Uint32(*v as u32),
            (DbType::Sint64, Bson::Int32(v)) => DbValue::Sint64(i64::from(*v)),
            (DbType::Sint64, Bson::Int64(v)) => DbValue::Sint64(*v),
            (DbType::Uint64, Bson::Int32(v)) => DbValue::Uint64(*v as u64),
            (DbType::Uint64, Bson::Int64(v)) => DbValue::Uint64(*v as u64),
            (DbType::Float32, Bson::Double(v)) => DbValue::Float32(*v as f32),
            (DbType::Float64, Bson::Double(v)) => DbValue::Float64(*v),
            (DbType::String, Bson::String(v)) => DbValue::String(v.clone()),
            (DbType::Blob, Bson::Binary(v)) => DbValue::Blob(v.bytes.clone()),
            (DbType::Id, Bson::Int32(v)) => DbValue::Id(*v as u64),
            (DbType::Id, Bson::Int64(v)) => DbValue::Id(*v as u64),
            _ => return Err(mismatch()),
        })
    }
}

impl From<i32> for DbValue {
    fn from(v: i32) -> Self {
        DbValue::Sint32(v)
    }
}
impl From<u32> for DbValue {
    fn from(v: u32) -> Self {
        DbValue::Uint32(v)
    }
}
impl From<i64> for DbValue {
    fn from(v: i64) -> Self {
        DbValue::Sint64(v)
    }
}
impl From<u64> for DbValue {
    fn from(v: u64) -> Self {
        DbValue::Uint64(v)
    }
}
impl From<f32> for DbValue {
    fn from(v: f32) -> Self {
        DbValue::Float32(v)
    }
}
impl From<f64> for DbValue {
    fn from(v: f64) -> Self {
        DbValue::Float64(v)
    }
}
impl From<&str> for DbValue {
    fn from(v: &str) -> Self {
        DbValue::String(v.to_string())
    }
}
impl From<String> for DbValue {
    fn from(v: String) -> Self {
        DbValue::String(v)
    }
}
impl From<Vec<u8>> for DbValue {
    fn from(v: Vec<u8>) -> Self {
        DbValue::Blob(v)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn values_round_trip_through_bson() {
        let cases: Vec<DbValue> = vec![
            DbValue::Sint32(-7),
            DbValue::Uint32(7),
            DbValue::Sint64(-1 << 40),
            DbValue::Uint64(u64::MAX),
            DbValue::Float32(0.5),
            DbValue::Float64(42.25),
            DbValue::String("demo.bp".to_string()),
            DbValue::Blob(vec![0, 1, 2, 255]),
            DbValue::Id(99),
        ];

        for value in cases {
            let encoded = value.to_bson();
            let decoded = DbValue::from_bson(value.db_type(), &encoded).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn type_codes_round_trip() {
        for code in 0..=8 {
            let db_type = DbType::from_code(code).unwrap();
            assert_eq!(db_type.code(), code);
        }
        assert!(DbType::from_code(9).is_err());
    }
}
