//! Postgres wire protocol: message codecs and protocol leaf types.
pub mod backend;
pub mod frontend;
pub(crate) mod sasl;
mod server_error;

pub use backend::{BackendMessage, BackendProtocol};
pub use frontend::FrontendProtocol;
pub use sasl::ScramClient;
pub use server_error::ServerError;

use bytes::{Buf, Bytes};

use crate::common::ByteStr;

/// Read a nul terminated string off the front of a message body.
///
/// Shared by every backend decoder that meets a protocol string; a missing
/// terminator means the frame is broken, not that more bytes are coming,
/// since framing already delivered the full body.
pub(crate) fn take_cstr(body: &mut Bytes) -> Result<ByteStr, ProtocolError> {
    let Some(nul) = body.iter().position(|b| *b == 0) else {
        return Err(ProtocolError::UnterminatedString);
    };
    let value = ByteStr::try_from(body.split_to(nul))?;
    body.advance(1);
    Ok(value)
}

/// Postgres object identifier.
///
/// The oid type is implemented as an unsigned four-byte integer.
///
/// <https://www.postgresql.org/docs/current/datatype-oid.html>
pub type Oid = u32;

/// A type that have a corresponding postgres oid.
pub trait PgType {
    const OID: Oid;
}

macro_rules! oid {
    ($ty:ty, $oid:literal $(, $doc:literal)? ) => {
        impl PgType for $ty {
            $(#[doc = $doc])?
            const OID: Oid = $oid;
        }
    };
}

oid!(bool, 16);
oid!(i64, 20, "`int8` ~18 digit integer, 8-byte storage");
oid!(i16, 21, "`int2` -32 thousand to 32 thousand, 2-byte storage");
oid!(i32, 23, "`int4` -2 billion to 2 billion integer, 4-byte storage");
oid!(str, 25, "`text` variable-length string, no limit specified");
oid!(String, 25, "`text` variable-length string, no limit specified");
oid!(f32, 700, "`float4` single-precision floating point number, 4-byte storage");
oid!(f64, 701, "`float8` double-precision floating point number, 8-byte storage");

/// A format code of a parameter or result column.
///
/// Each must presently be zero (text) or one (binary).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i16)]
pub enum PgFormat {
    Text = 0,
    Binary = 1,
}

impl PgFormat {
    pub(crate) fn from_code(code: i16) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(Self::Text),
            1 => Ok(Self::Binary),
            _ => Err(ProtocolError::UnknownFormat { code }),
        }
    }

    pub const fn code(self) -> i16 {
        self as i16
    }
}

/// Backend transaction status reported by `ReadyForQuery`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransactionStatus {
    /// `I`, idle (not in a transaction block).
    #[default]
    Idle,
    /// `T`, in a transaction block.
    Transaction,
    /// `E`, in a failed transaction block, queries rejected until block end.
    FailedTransaction,
}

impl TransactionStatus {
    pub(crate) fn from_u8(status: u8) -> Result<Self, ProtocolError> {
        match status {
            b'I' => Ok(Self::Idle),
            b'T' => Ok(Self::Transaction),
            b'E' => Ok(Self::FailedTransaction),
            _ => Err(ProtocolError::UnknownTransactionStatus { status }),
        }
    }
}

/// An error when translating buffers from or to postgres.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("unexpected backend message type 0x{found:02x}")]
    Unexpected {
        expect: Option<u8>,
        found: u8,
        phase: Option<&'static str>,
    },
    #[error("unknown authentication method ({auth})")]
    UnknownAuth { auth: i32 },
    #[error("unknown format code ({code})")]
    UnknownFormat { code: i16 },
    #[error("unknown transaction status (0x{status:02x})")]
    UnknownTransactionStatus { status: u8 },
    #[error("postgres sent non utf8 string: {source}")]
    NonUtf8 {
        #[from]
        source: std::str::Utf8Error,
    },
    #[error("postgres string missing its nul terminator")]
    UnterminatedString,
    #[error("sasl exchange failed: {reason}")]
    Sasl { reason: String },
    #[error("malformed {msg} message")]
    Malformed { msg: &'static str, body: Bytes },
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unexpected { expect: None, found, phase: None }
    }

    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Unexpected { expect: Some(expect), found, phase: None }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected { expect: None, found, phase: Some(phase) }
    }

    pub(crate) fn sasl(reason: impl Into<String>) -> ProtocolError {
        Self::Sasl { reason: reason.into() }
    }
}
