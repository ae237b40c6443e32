//! Postgres frontend messages.
//!
//! Every message is a 1-byte type, a 4-byte big-endian length inclusive of
//! the length field itself, then the body. `Startup`, `SslRequest` and
//! `CancelRequest` predate the type byte and omit it.
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>
use bytes::{BufMut, BytesMut};

use super::Oid;
use crate::{common::ByteStr, encode::Encoded, postgres::PgFormat};

/// Write a nul terminated protocol string.
fn put_cstr(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

/// Counts on the wire are Int16; the bind path pre-checks its limit, so an
/// overflow here is a caller bug.
fn int16_len(len: usize) -> i16 {
    len.try_into().expect("count exceeds the protocol Int16 range")
}

/// Lengths on the wire are Int32.
fn int32_len(len: usize) -> u32 {
    len.try_into().expect("length exceeds the protocol Int32 range")
}

/// The protocol version number.
///
/// The most significant 16 bits are the major version number (3), the least
/// significant 16 bits the minor version number (0).
pub const PROTOCOL_VERSION: i32 = 196608;

/// Magic request code of [`SslRequest`], chosen to not collide with any
/// protocol version number.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Magic request code of [`CancelRequest`].
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// A type that can be encoded into a postgres frontend message.
pub trait FrontendProtocol {
    /// The message type byte.
    const FORMAT: u8;

    /// Write the message body, excluding type and length.
    fn encode_body(&self, buf: &mut BytesMut);
}

/// Write a frontend message with its type byte and backfilled length.
pub fn write<F: FrontendProtocol>(msg: &F, buf: &mut BytesMut) {
    buf.put_u8(F::FORMAT);
    let offset = buf.len();
    buf.put_u32(0);
    msg.encode_body(buf);
    backfill_len(buf, offset);
}

/// Write the length of everything after `offset` at `offset`.
///
/// The length field counts itself but never the message type byte.
fn backfill_len(buf: &mut BytesMut, offset: usize) {
    let len = int32_len(buf.len() - offset);
    buf[offset..offset + 4].copy_from_slice(&len.to_be_bytes());
}

/// The startup message, sent once after the (optionally TLS-wrapped) socket
/// is established.
///
/// For historical reasons the very first message sent by the client has no
/// message-type byte, so `Startup` does not implement [`FrontendProtocol`].
#[derive(Debug)]
pub struct Startup<'a> {
    /// The database user name to connect as. Required; there is no default.
    pub user: &'a str,
    /// The database to connect to. Defaults to the user name.
    pub database: Option<&'a str>,
    /// Used to connect in streaming replication mode.
    ///
    /// Value can be true, false, or database, and the default is false.
    pub replication: Option<&'a str>,
}

impl Startup<'_> {
    pub fn write(&self, buf: &mut BytesMut) {
        let offset = buf.len();
        buf.put_u32(0);
        buf.put_i32(PROTOCOL_VERSION);

        // pairs of parameter name and value strings
        put_cstr(buf, "user");
        put_cstr(buf, self.user);

        if let Some(db) = self.database {
            put_cstr(buf, "database");
            put_cstr(buf, db);
        }

        if let Some(repl) = self.replication {
            put_cstr(buf, "replication");
            put_cstr(buf, repl);
        }

        // a zero byte terminates the pair list
        buf.put_u8(0);
        backfill_len(buf, offset);
    }
}

/// Requests the TLS upgrade; the server answers with a single byte,
/// `S` (proceed with the handshake) or `N` (unwilling).
#[derive(Debug)]
pub struct SslRequest;

impl SslRequest {
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_i32(8);
        buf.put_i32(SSL_REQUEST_CODE);
    }
}

/// Requests cancellation of a query in progress on another connection.
///
/// Sent on a fresh connection instead of a startup message.
#[derive(Debug)]
pub struct CancelRequest {
    /// The process ID of the target backend.
    pub process_id: i32,
    /// The secret key for the target backend.
    pub secret_key: i32,
}

impl CancelRequest {
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_i32(16);
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_i32(self.process_id);
        buf.put_i32(self.secret_key);
    }
}

/// A password response, cleartext or already md5-hashed.
#[derive(Debug)]
pub struct PasswordMessage<'a> {
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    const FORMAT: u8 = b'p';

    fn encode_body(&self, buf: &mut BytesMut) {
        put_cstr(buf, self.password);
    }
}

/// The initial SASL response, selecting a mechanism.
#[derive(Debug)]
pub struct SaslInitialResponse<'a> {
    /// Name of the selected SASL authentication mechanism.
    pub mechanism: &'a str,
    /// SASL mechanism specific "initial response".
    pub data: &'a [u8],
}

impl FrontendProtocol for SaslInitialResponse<'_> {
    const FORMAT: u8 = b'p';

    fn encode_body(&self, buf: &mut BytesMut) {
        put_cstr(buf, self.mechanism);
        // Int32 data length, or -1 if there is no initial response
        buf.put_u32(int32_len(self.data.len()));
        buf.put_slice(self.data);
    }
}

/// A follow-up SASL response; the body is raw mechanism data.
#[derive(Debug)]
pub struct SaslResponse<'a> {
    pub data: &'a [u8],
}

impl FrontendProtocol for SaslResponse<'_> {
    const FORMAT: u8 = b'p';

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_slice(self.data);
    }
}

/// Identifies the message as a Parse command.
#[derive(Debug)]
pub struct Parse<'a> {
    /// The prepared statement name (an empty string selects the unnamed
    /// prepared statement).
    pub name: &'a str,
    /// The query string to be parsed.
    pub sql: &'a str,
    /// Object IDs of the parameter data types the frontend wants to
    /// prespecify; zero here leaves the type unspecified.
    ///
    /// Note that this is not an indication of the number of parameters that
    /// might appear in the query string, only the number prespecified.
    pub param_oids: &'a [Oid],
}

impl FrontendProtocol for Parse<'_> {
    const FORMAT: u8 = b'P';

    fn encode_body(&self, buf: &mut BytesMut) {
        put_cstr(buf, self.name);
        put_cstr(buf, self.sql);
        buf.put_i16(int16_len(self.param_oids.len()));
        for oid in self.param_oids {
            buf.put_u32(*oid);
        }
    }
}

/// Identifies the message as a Bind command.
///
/// Parameters are always sent in binary format, and a single-element result
/// format array requests binary for every result column.
#[derive(Debug)]
pub struct Bind<'a> {
    /// The destination portal (an empty string selects the unnamed portal).
    pub portal: &'a str,
    /// The source prepared statement (an empty string selects the unnamed
    /// prepared statement).
    pub statement: &'a str,
    /// The parameter values, already encoded in binary format.
    pub params: &'a [Encoded],
}

impl FrontendProtocol for Bind<'_> {
    const FORMAT: u8 = b'B';

    fn encode_body(&self, buf: &mut BytesMut) {
        put_cstr(buf, self.portal);
        put_cstr(buf, self.statement);

        // one parameter format code, applied to all parameters
        buf.put_i16(1);
        buf.put_i16(PgFormat::Binary.code());

        buf.put_i16(int16_len(self.params.len()));
        for param in self.params {
            match param.value() {
                // Int32(-1) indicates a NULL parameter value,
                // no value bytes follow
                None => buf.put_i32(-1),
                Some(value) => {
                    buf.put_u32(int32_len(value.len()));
                    buf.put_slice(value);
                },
            }
        }

        // one result format code, applied to all result columns
        buf.put_i16(1);
        buf.put_i16(PgFormat::Binary.code());
    }
}

/// Identifies the message as a Describe command.
#[derive(Debug)]
pub struct Describe<'a> {
    /// `S` to describe a prepared statement, `P` to describe a portal.
    kind: u8,
    name: &'a str,
}

impl<'a> Describe<'a> {
    pub fn statement(name: &'a str) -> Self {
        Self { kind: b'S', name }
    }

    pub fn portal(name: &'a str) -> Self {
        Self { kind: b'P', name }
    }
}

impl FrontendProtocol for Describe<'_> {
    const FORMAT: u8 = b'D';

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind);
        put_cstr(buf, self.name);
    }
}

/// Identifies the message as an Execute command.
#[derive(Debug)]
pub struct Execute<'a> {
    /// The portal to execute (an empty string selects the unnamed portal).
    pub portal: &'a str,
    /// Maximum number of rows to return, if portal contains a query that
    /// returns rows (ignored otherwise). Zero denotes "no limit".
    pub max_rows: i32,
}

impl FrontendProtocol for Execute<'_> {
    const FORMAT: u8 = b'E';

    fn encode_body(&self, buf: &mut BytesMut) {
        put_cstr(buf, self.portal);
        buf.put_i32(self.max_rows);
    }
}

/// Identifies the message as a Close command.
#[derive(Debug, Clone)]
pub struct Close {
    kind: u8,
    name: ByteStr,
}

impl Close {
    pub fn statement(name: impl Into<ByteStr>) -> Self {
        Self { kind: b'S', name: name.into() }
    }

    pub fn portal(name: impl Into<ByteStr>) -> Self {
        Self { kind: b'P', name: name.into() }
    }

    /// The wire name of the closed object.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` when this closes a portal rather than a prepared statement.
    pub fn is_portal(&self) -> bool {
        self.kind == b'P'
    }
}

impl FrontendProtocol for Close {
    const FORMAT: u8 = b'C';

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind);
        put_cstr(buf, &self.name);
    }
}

/// Identifies the message as a simple query.
///
/// The core issues extended queries only; the encoder exists for protocol
/// completeness.
#[derive(Debug)]
pub struct Query<'a> {
    /// The query string itself.
    pub sql: &'a str,
}

impl FrontendProtocol for Query<'_> {
    const FORMAT: u8 = b'Q';

    fn encode_body(&self, buf: &mut BytesMut) {
        put_cstr(buf, self.sql);
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name;

        impl FrontendProtocol for $name {
            const FORMAT: u8 = $ty;

            fn encode_body(&self, _: &mut BytesMut) {}
        }
    )*};
}

unit_msg! {
    /// Identifies the message as a Flush command.
    ///
    /// Forces the backend to deliver pending output without ending the
    /// extended-query sequence.
    struct Flush, b'H';

    /// Identifies the message as a Sync command.
    ///
    /// Ends the extended-query sequence; the backend answers with
    /// ReadyForQuery once the implicit transaction closes.
    struct Sync, b'S';

    /// Identifies the message as a termination.
    ///
    /// The frontend closes the socket immediately after.
    struct Terminate, b'X';
}

#[cfg(test)]
mod test {
    use bytes::Buf;

    use super::*;
    use crate::encode::Encode;

    fn written<F: FrontendProtocol>(msg: &F) -> BytesMut {
        let mut buf = BytesMut::new();
        write(msg, &mut buf);
        buf
    }

    /// The length field counts everything after the type byte.
    fn assert_framing(buf: &[u8], format: u8) {
        assert_eq!(buf[0], format);
        let len = i32::from_be_bytes(buf[1..5].try_into().unwrap());
        assert_eq!(len as usize, buf.len() - 1);
    }

    #[test]
    fn sync_is_five_bytes() {
        let buf = written(&Sync);
        assert_eq!(&buf[..], &[b'S', 0, 0, 0, 4]);
    }

    #[test]
    fn startup_has_no_type_byte() {
        let mut buf = BytesMut::new();
        Startup { user: "crab", database: Some("marina"), replication: None }.write(&mut buf);

        let mut read = &buf[..];
        assert_eq!(read.get_i32() as usize, buf.len());
        assert_eq!(read.get_i32(), PROTOCOL_VERSION);
        let rest = std::str::from_utf8(read).unwrap();
        assert!(rest.contains("user\0crab\0"));
        assert!(rest.contains("database\0marina\0"));
        assert!(rest.ends_with('\0'));
    }

    #[test]
    fn ssl_request_magic() {
        let mut buf = BytesMut::new();
        SslRequest.write(&mut buf);
        assert_eq!(&buf[..], &[0, 0, 0, 8, 4, 210, 22, 47]);
    }

    #[test]
    fn cancel_request_magic() {
        let mut buf = BytesMut::new();
        CancelRequest { process_id: 7, secret_key: 42 }.write(&mut buf);
        let mut read = &buf[..];
        assert_eq!(read.get_i32(), 16);
        assert_eq!(read.get_i32(), CANCEL_REQUEST_CODE);
        assert_eq!(read.get_i32(), 7);
        assert_eq!(read.get_i32(), 42);
    }

    #[test]
    fn bind_writes_binary_formats_and_null() {
        let params = [1i32.encode(), Encoded::null(0)];
        let buf = written(&Bind { portal: "", statement: "s0001", params: &params });
        assert_framing(&buf, b'B');

        let mut read = &buf[5..];
        assert_eq!(read.get_u8(), b'\0'); // unnamed portal
        read.advance("s0001\0".len());
        assert_eq!(read.get_i16(), 1);
        assert_eq!(read.get_i16(), PgFormat::Binary.code());
        assert_eq!(read.get_i16(), 2); // param count
        assert_eq!(read.get_i32(), 4); // i32 payload
        assert_eq!(read.get_i32(), 1);
        assert_eq!(read.get_i32(), -1); // NULL, no bytes follow
        assert_eq!(read.get_i16(), 1);
        assert_eq!(read.get_i16(), PgFormat::Binary.code());
        assert!(read.is_empty());
    }

    #[test]
    fn parse_carries_oids() {
        let buf = written(&Parse { name: "s0002", sql: "SELECT $1", param_oids: &[23] });
        assert_framing(&buf, b'P');
        let tail = &buf[buf.len() - 6..];
        assert_eq!(tail, &[0, 1, 0, 0, 0, 23]);
    }

    #[test]
    fn describe_and_close_kinds() {
        let buf = written(&Describe::statement("s1"));
        assert_framing(&buf, b'D');
        assert_eq!(buf[5], b'S');

        let buf = written(&Close::portal("p1"));
        assert_framing(&buf, b'C');
        assert_eq!(buf[5], b'P');
    }

    #[test]
    fn query_is_nul_terminated() {
        let buf = written(&Query { sql: "SELECT 1" });
        assert_framing(&buf, b'Q');
        assert_eq!(&buf[5..], b"SELECT 1\0");
    }
}
