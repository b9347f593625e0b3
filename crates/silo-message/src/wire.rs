//! Per-operation status codes shared by client and server.
//!
//! Every reply carries one code per operation; `Ok` is followed by the
//! operation's result parameters, anything else by a NUL-terminated
//! diagnostic string.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Code {
    Ok = 0,
    NotFound = 1,
    Exists = 2,
    Invalid = 3,
    Backend = 4,
    State = 5,
    Io = 6,
    Protocol = 7,
}

impl From<u32> for Code {
    fn from(raw: u32) -> Self {
        match raw {
            0 => Code::Ok,
            1 => Code::NotFound,
            2 => Code::Exists,
            3 => Code::Invalid,
            4 => Code::Backend,
            5 => Code::State,
            6 => Code::Io,
            // Anything unknown is a protocol-level failure.
            _ => Code::Protocol,
        }
    }
}

impl Code {
    pub fn is_ok(&self) -> bool {
        *self == Code::Ok
    }
}
