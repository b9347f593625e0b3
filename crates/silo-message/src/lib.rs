//! Framed wire envelope shared by the client runtime and servers.
//!
//! A message is a 32-byte little-endian header followed by an inline
//! payload, optionally trailed by out-of-band bulk data that is streamed
//! after the envelope to avoid double-buffering large writes:
//!
//! ```text
//! [ length:u32 | type:u32 | op_count:u32 | flags:u32 | id:u64 | reply_to:u64 ]
//! [ inline payload (`length` bytes) ]
//! [ deferred bulk sends, raw, in attach order ]
//! ```
//!
//! Bulk data is *not* covered by `length`; its extent is encoded in the
//! inline parameters of the operations that own it.

use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

mod wire;
pub use wire::Code;

pub const HEADER_LEN: usize = 32;

/// Low two bits of `flags` carry the safety level, bit 2 requests one
/// backend transaction for the whole grouped message.
const FLAG_SAFETY_MASK: u32 = 0b011;
const FLAG_ATOMIC_BATCH: u32 = 0b100;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("message payload over-read: wanted {wanted} more bytes, {available} available")]
    OverRead { wanted: usize, available: usize },
    #[error("unterminated string in message payload")]
    UnterminatedString,
    #[error("message payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("unknown message type: {0}")]
    UnknownKind(u32),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One discriminant per (client, verb) pair understood by servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Kind {
    None = 0,

    ObjectCreate = 1,
    ObjectDelete = 2,
    ObjectRead = 3,
    ObjectWrite = 4,
    ObjectStatus = 5,
    ObjectSync = 6,

    KvPut = 16,
    KvDelete = 17,
    KvGet = 18,
    KvScan = 19,

    DbSchemaCreate = 32,
    DbSchemaGet = 33,
    DbSchemaDelete = 34,
    DbInsert = 35,
    DbUpdate = 36,
    DbDelete = 37,
    DbQuery = 38,
    DbFetch = 39,
}

impl TryFrom<u32> for Kind {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self, Error> {
        use Kind::*;

        Ok(match raw {
            0 => None,
            1 => ObjectCreate,
            2 => ObjectDelete,
            3 => ObjectRead,
            4 => ObjectWrite,
            5 => ObjectStatus,
            6 => ObjectSync,
            16 => KvPut,
            17 => KvDelete,
            18 => KvGet,
            19 => KvScan,
            32 => DbSchemaCreate,
            33 => DbSchemaGet,
            34 => DbSchemaDelete,
            35 => DbInsert,
            36 => DbUpdate,
            37 => DbDelete,
            38 => DbQuery,
            39 => DbFetch,
            other => return Err(Error::UnknownKind(other)),
        })
    }
}

pub struct Message {
    kind: Kind,
    op_count: u32,
    flags: u32,
    id: u64,
    reply_to: u64,

    data: BytesMut,
    cursor: usize,
    /// Declared upper bound for the payload, kept tight by `add_operation`
    /// and grown lazily when appends overflow it.
    declared: usize,
    sends: Vec<Bytes>,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("op_count", &self.op_count)
            .field("flags", &self.flags)
            .field("id", &self.id)
            .field("reply_to", &self.reply_to)
            .field("payload_len", &self.data.len())
            .field("sends", &self.sends.len())
            .finish()
    }
}

impl Message {
    /// Create a request envelope. `size` is the upper bound of the payload
    /// that will be appended before any operations are added.
    pub fn new(kind: Kind, size: usize) -> Self {
        Self {
            kind,
            op_count: 0,
            flags: 0,
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            reply_to: 0,
            data: BytesMut::with_capacity(size),
            cursor: 0,
            declared: size,
            sends: Vec::new(),
        }
    }

    /// Create a reply envelope for a received request.
    pub fn reply(request: &Message, size: usize) -> Self {
        let mut reply = Self::new(request.kind, size);
        reply.reply_to = request.id;
        reply.flags = request.flags;
        reply
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }
    pub fn op_count(&self) -> u32 {
        self.op_count
    }
    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn reply_to(&self) -> u64 {
        self.reply_to
    }
    pub fn payload_len(&self) -> usize {
        self.data.len()
    }

    /// Register one more operation carried by this message and grow the
    /// declared payload bound by its inline size.
    pub fn add_operation(&mut self, size: usize) {
        self.op_count += 1;
        self.declared += size;
        self.data.reserve(size);
    }

    pub fn append_u8(&mut self, value: u8) {
        self.reserve_overflow(1);
        self.data.extend_from_slice(&[value]);
    }

    pub fn append_u32(&mut self, value: u32) {
        self.reserve_overflow(4);
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn append_u64(&mut self, value: u64) {
        self.reserve_overflow(8);
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn append_n(&mut self, bytes: &[u8]) {
        self.reserve_overflow(bytes.len());
        self.data.extend_from_slice(bytes);
    }

    /// Strings travel NUL-terminated.
    pub fn append_string(&mut self, value: &str) {
        debug_assert!(!value.as_bytes().contains(&0));
        self.reserve_overflow(value.len() + 1);
        self.data.extend_from_slice(value.as_bytes());
        self.data.extend_from_slice(&[0]);
    }

    /// Appends beyond the declared total reserve overflow space lazily:
    /// the declared size stays a tight allocation bound at creation time
    /// while callers that under-estimated pay one bounded reallocation.
    fn reserve_overflow(&mut self, additional: usize) {
        let needed = self.data.len() + additional;
        if needed > self.declared {
            self.declared = needed;
            self.data.reserve(needed - self.data.len());
        }
    }

    /// Wire size of a string appended with [`append_string`].
    pub fn string_len(value: &str) -> usize {
        value.len() + 1
    }

    /// Queue bulk data to be streamed after the envelope.
    pub fn add_send(&mut self, data: Bytes) {
        self.sends.push(data);
    }

    /// Derive the flags word from a batch's effective semantics.
    pub fn set_semantics(&mut self, semantics: &silo_semantics::Semantics) {
        self.force_safety(semantics.safety());
        if semantics.atomicity() == silo_semantics::Atomicity::Batch {
            self.flags |= FLAG_ATOMIC_BATCH;
        } else {
            self.flags &= !FLAG_ATOMIC_BATCH;
        }
    }

    pub fn force_safety(&mut self, safety: silo_semantics::Safety) {
        let bits = match safety {
            silo_semantics::Safety::None => 0,
            silo_semantics::Safety::Network => 1,
            silo_semantics::Safety::Storage => 2,
        };
        self.flags = (self.flags & !FLAG_SAFETY_MASK) | bits;
    }

    pub fn safety(&self) -> silo_semantics::Safety {
        match self.flags & FLAG_SAFETY_MASK {
            1 => silo_semantics::Safety::Network,
            2 => silo_semantics::Safety::Storage,
            _ => silo_semantics::Safety::None,
        }
    }

    pub fn atomic_batch(&self) -> bool {
        self.flags & FLAG_ATOMIC_BATCH != 0
    }

    fn take(&mut self, wanted: usize) -> Result<&[u8], Error> {
        let available = self.data.len() - self.cursor;
        if wanted > available {
            return Err(Error::OverRead { wanted, available });
        }
        let slice = &self.data[self.cursor..self.cursor + wanted];
        self.cursor += wanted;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_n(&mut self, len: usize) -> Result<Bytes, Error> {
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    pub fn get_string(&mut self) -> Result<String, Error> {
        let rest = &self.data[self.cursor..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(Error::UnterminatedString)?;
        let value = std::str::from_utf8(&rest[..nul])
            .map_err(|_| Error::InvalidUtf8)?
            .to_string();
        self.cursor += nul + 1;
        Ok(value)
    }

    /// Remaining unread payload bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    /// Write the envelope and all deferred bulk sends to `stream`.
    pub async fn send<W>(&self, stream: &mut W) -> Result<(), Error>
    where
        W: AsyncWrite + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&(self.data.len() as u32).to_le_bytes());
        header[4..8].copy_from_slice(&(self.kind as u32).to_le_bytes());
        header[8..12].copy_from_slice(&self.op_count.to_le_bytes());
        header[12..16].copy_from_slice(&self.flags.to_le_bytes());
        header[16..24].copy_from_slice(&self.id.to_le_bytes());
        header[24..32].copy_from_slice(&self.reply_to.to_le_bytes());

        stream.write_all(&header).await?;
        stream.write_all(&self.data).await?;
        for send in &self.sends {
            stream.write_all(send).await?;
        }
        stream.flush().await?;

        Ok(())
    }

    /// Read one envelope from `stream`. Bulk data attached by the peer is
    /// *not* consumed here; the caller reads it according to the inline
    /// parameters.
    pub async fn receive<R>(stream: &mut R) -> Result<Message, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        stream.read_exact(&mut header).await?;

        let length = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let kind = Kind::try_from(u32::from_le_bytes(header[4..8].try_into().unwrap()))?;
        let op_count = u32::from_le_bytes(header[8..12].try_into().unwrap());
        let flags = u32::from_le_bytes(header[12..16].try_into().unwrap());
        let id = u64::from_le_bytes(header[16..24].try_into().unwrap());
        let reply_to = u64::from_le_bytes(header[24..32].try_into().unwrap());

        let mut data = BytesMut::with_capacity(length);
        data.resize(length, 0);
        stream.read_exact(&mut data).await?;

        Ok(Message {
            kind,
            op_count,
            flags,
            id,
            reply_to,
            declared: length,
            data,
            cursor: 0,
            sends: Vec::new(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use silo_semantics::{Safety, Semantics, Template};

    #[test]
    fn header_counts_operations() {
        let mut message = Message::new(Kind::ObjectRead, 42);

        message.add_operation(0);
        message.add_operation(0);
        message.add_operation(0);

        assert_eq!(message.kind(), Kind::ObjectRead);
        assert_eq!(message.op_count(), 3);
    }

    #[test]
    fn append_get_round_trip() {
        let mut message = Message::new(Kind::None, 64);

        message.append_u8(23);
        message.append_u32(42);
        message.append_u64(2342);
        message.append_n(b"2\0");
        message.append_string("42");

        assert_eq!(message.get_u8().unwrap(), 23);
        assert_eq!(message.get_u32().unwrap(), 42);
        assert_eq!(message.get_u64().unwrap(), 2342);
        assert_eq!(message.get_n(2).unwrap().as_ref(), b"2\0");
        assert_eq!(message.get_string().unwrap(), "42");
    }

    #[test]
    fn appends_beyond_the_declared_size_reserve_lazily() {
        let mut message = Message::new(Kind::None, 0);

        for _ in 0..=10 {
            message.add_operation(1);
            message.append_u8(7);
        }
        // Past every declared bound: grows instead of failing.
        message.append_n(&[0u8; 64]);

        assert_eq!(message.payload_len(), 11 + 64);
        assert_eq!(message.op_count(), 11);
    }

    #[test]
    fn over_read_is_an_error_not_corruption() {
        let mut message = Message::new(Kind::None, 4);
        message.append_u32(7);

        assert_eq!(message.get_u32().unwrap(), 7);
        assert!(matches!(message.get_u8(), Err(Error::OverRead { .. })));
        assert!(matches!(message.get_string(), Err(Error::UnterminatedString)));
    }

    #[tokio::test]
    async fn write_then_read_stream() {
        let mut request = Message::new(Kind::KvPut, 32);
        request.add_operation(0);
        request.append_string("namespace");
        request.append_u32(5);
        request.append_n(b"hello");
        request.add_send(Bytes::from_static(b"bulk-data"));

        let mut wire = Vec::new();
        request.send(&mut wire).await.unwrap();

        let mut reader = wire.as_slice();
        let mut received = Message::receive(&mut reader).await.unwrap();

        assert_eq!(received.kind(), Kind::KvPut);
        assert_eq!(received.op_count(), 1);
        assert_eq!(received.id(), request.id());
        assert_eq!(received.get_string().unwrap(), "namespace");
        assert_eq!(received.get_u32().unwrap(), 5);
        assert_eq!(received.get_n(5).unwrap().as_ref(), b"hello");

        // Bulk data trails the envelope and is read separately.
        assert_eq!(reader, b"bulk-data");
    }

    #[tokio::test]
    async fn reply_links_request_id() {
        let request = Message::new(Kind::DbInsert, 0);
        let reply = Message::reply(&request, 0);

        assert_eq!(reply.kind(), Kind::DbInsert);
        assert_eq!(reply.reply_to(), request.id());
        assert_ne!(reply.id(), request.id());
    }

    #[test]
    fn safety_flags_from_semantics() {
        let mut message = Message::new(Kind::ObjectWrite, 0);

        let mut semantics = Semantics::new(Template::Default);
        semantics.set_safety(Safety::Storage);
        semantics.set_atomicity(silo_semantics::Atomicity::Batch);

        message.set_semantics(&semantics);
        assert_eq!(message.safety(), Safety::Storage);
        assert!(message.atomic_batch());

        message.force_safety(Safety::None);
        assert_eq!(message.safety(), Safety::None);
        assert!(message.atomic_batch());
    }
}
