//! Postgres backend messages.
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>
use bytes::{Buf, Bytes};

use super::{take_cstr, Oid, PgFormat, ProtocolError, TransactionStatus};
use crate::common::ByteStr;

/// A type that can be decoded from a postgres backend message.
pub trait BackendProtocol: Sized {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError>;
}

/// Postgres backend messages.
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData(BackendKeyData),
    BindComplete(BindComplete),
    CloseComplete(CloseComplete),
    CommandComplete(CommandComplete),
    DataRow(DataRow),
    EmptyQueryResponse(EmptyQueryResponse),
    ErrorResponse(ErrorResponse),
    NegotiateProtocolVersion(NegotiateProtocolVersion),
    NoData(NoData),
    NoticeResponse(NoticeResponse),
    NotificationResponse(NotificationResponse),
    ParameterDescription(ParameterDescription),
    ParameterStatus(ParameterStatus),
    ParseComplete(ParseComplete),
    PortalSuspended(PortalSuspended),
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription),
}

macro_rules! match_backend {
    ($($name:ident,)*) => {
        impl BackendMessage {
            pub fn msgtype(&self) -> u8 {
                match self {
                    $(Self::$name(_) => $name::MSGTYPE,)*
                }
            }
        }

        impl BackendProtocol for BackendMessage {
            fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
                let message = match msgtype {
                    $($name::MSGTYPE => Self::$name(<$name as BackendProtocol>::decode(msgtype, body)?),)*
                    _ => return Err(ProtocolError::unknown(msgtype)),
                };
                Ok(message)
            }
        }
    };
}

match_backend! {
    Authentication,
    BackendKeyData,
    BindComplete,
    CloseComplete,
    CommandComplete,
    DataRow,
    EmptyQueryResponse,
    ErrorResponse,
    NegotiateProtocolVersion,
    NoData,
    NoticeResponse,
    NotificationResponse,
    ParameterDescription,
    ParameterStatus,
    ParseComplete,
    PortalSuspended,
    ReadyForQuery,
    RowDescription,
}

impl BackendMessage {
    /// A protocol error for a message which is valid on its own but not in
    /// the current phase.
    pub fn unexpected(&self, phase: &'static str) -> ProtocolError {
        ProtocolError::unexpected_phase(self.msgtype(), phase)
    }
}

macro_rules! assert_msgtype {
    ($self:ident,$typ:ident) => {
        if $self::MSGTYPE != $typ {
            return Err(ProtocolError::unexpected($self::MSGTYPE, $typ));
        }
    };
}

/// Identifies the message as an authentication request.
#[derive(Debug)]
pub enum Authentication {
    /// Int32(0) Specifies that the authentication was successful.
    Ok,
    /// Int32(2) Specifies that Kerberos V5 authentication is required.
    KerberosV5,
    /// Int32(3) Specifies that a clear-text password is required.
    CleartextPassword,
    /// Int32(5) Specifies that an MD5-encrypted password is required.
    /// Byte4 The salt to use when encrypting the password.
    MD5Password { salt: [u8; 4] },
    /// Int32(6) Specifies that an SCM credentials message is expected.
    SCMCredential,
    /// Int32(7) Specifies that GSSAPI authentication is required.
    GSS,
    /// Int32(9) Specifies that SSPI authentication is required.
    SSPI,
    /// Int32(10) Specifies that SASL authentication is required.
    ///
    /// The message body is a list of SASL authentication mechanisms, in the
    /// server's order of preference, terminated by a zero byte after the
    /// last mechanism name.
    SASL { mechanisms: Vec<ByteStr> },
    /// Int32(11) Specifies that this message contains a SASL challenge.
    ///
    /// Byte(n) SASL data, specific to the SASL mechanism being used.
    SASLContinue { data: Bytes },
    /// Int32(12) Specifies that SASL authentication has completed.
    ///
    /// Byte(n) SASL outcome "additional data", specific to the mechanism.
    SASLFinal { data: Bytes },
}

impl Authentication {
    pub const MSGTYPE: u8 = b'R';
}

impl BackendProtocol for Authentication {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(Authentication, msgtype);
        let auth = match body.get_i32() {
            0 => Authentication::Ok,
            2 => Authentication::KerberosV5,
            3 => Authentication::CleartextPassword,
            5 => {
                if body.remaining() < 4 {
                    return Err(ProtocolError::Malformed { msg: "Authentication", body });
                }
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Authentication::MD5Password { salt }
            },
            6 => Authentication::SCMCredential,
            7 => Authentication::GSS,
            9 => Authentication::SSPI,
            10 => {
                let mut mechanisms = vec![];
                while body.first().is_some_and(|b| *b != b'\0') {
                    mechanisms.push(take_cstr(&mut body)?);
                }
                Authentication::SASL { mechanisms }
            },
            11 => Authentication::SASLContinue { data: body },
            12 => Authentication::SASLFinal { data: body },
            auth => return Err(ProtocolError::UnknownAuth { auth }),
        };
        Ok(auth)
    }
}

/// Identifies the message as cancellation key data.
///
/// The frontend must save these values if it wishes to be able to issue
/// CancelRequest messages later.
#[derive(Debug, Clone, Copy)]
pub struct BackendKeyData {
    /// The process ID of this backend.
    pub process_id: i32,
    /// The secret key of this backend.
    pub secret_key: i32,
}

impl BackendKeyData {
    pub const MSGTYPE: u8 = b'K';
}

impl BackendProtocol for BackendKeyData {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(BackendKeyData, msgtype);
        Ok(Self {
            process_id: body.get_i32(),
            secret_key: body.get_i32(),
        })
    }
}

/// Identifies the message as a command-completed response.
///
/// The tag is usually a single word that identifies which SQL command was
/// completed, followed by the affected row count where applicable, e.g.
/// `DELETE 3` or `SELECT 1`.
#[derive(Debug, Clone)]
pub struct CommandComplete {
    /// The command tag.
    pub tag: ByteStr,
}

impl CommandComplete {
    pub const MSGTYPE: u8 = b'C';
}

impl BackendProtocol for CommandComplete {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(CommandComplete, msgtype);
        Ok(Self { tag: take_cstr(&mut body)? })
    }
}

/// Identifies the message as a data row.
#[derive(Debug)]
pub struct DataRow {
    /// The number of column values that follow (possibly zero).
    pub field_len: i16,
    /// For each column: Int32 length (`-1` denotes NULL, no bytes follow),
    /// then that many value bytes.
    pub body: Bytes,
}

impl DataRow {
    pub const MSGTYPE: u8 = b'D';

    /// Splits the raw body into per-column values, `None` for NULL.
    ///
    /// A zero length column yields an empty (non-NULL) value.
    pub fn values(&self) -> Vec<Option<Bytes>> {
        let mut body = self.body.clone();
        let mut values = Vec::with_capacity(self.field_len.max(0) as usize);
        for _ in 0..self.field_len {
            let len = body.get_i32();
            if len < 0 {
                values.push(None);
            } else {
                values.push(Some(body.split_to(len as usize)));
            }
        }
        values
    }
}

impl BackendProtocol for DataRow {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(DataRow, msgtype);
        let field_len = body.get_i16();
        Ok(Self { field_len, body })
    }
}

/// Identifies the message as an error.
///
/// The message body consists of one or more identified fields, followed by
/// a zero byte as a terminator. Fields can appear in any order.
///
/// For each field there is a Byte1 code identifying the field type, then the
/// field value as a nul terminated string.
#[derive(Debug)]
pub struct ErrorResponse {
    pub body: Bytes,
}

impl ErrorResponse {
    pub const MSGTYPE: u8 = b'E';

    /// Parse the identified fields into a [`ServerError`][super::ServerError].
    pub fn into_server_error(self) -> super::ServerError {
        super::ServerError::from_fields(self.body)
    }
}

impl BackendProtocol for ErrorResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(ErrorResponse, msgtype);
        Ok(Self { body })
    }
}

/// A warning message. The frontend should display the message.
///
/// Shares the identified-fields body format with [`ErrorResponse`].
#[derive(Debug)]
pub struct NoticeResponse {
    pub body: Bytes,
}

impl NoticeResponse {
    pub const MSGTYPE: u8 = b'N';

    pub fn into_server_error(self) -> super::ServerError {
        super::ServerError::from_fields(self.body)
    }
}

impl BackendProtocol for NoticeResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(NoticeResponse, msgtype);
        Ok(Self { body })
    }
}

/// Identifies the message as a protocol version negotiation message.
#[derive(Debug)]
pub struct NegotiateProtocolVersion {
    /// Newest minor protocol version supported by the server for the major
    /// protocol version requested by the client.
    pub minor: i32,
    /// Number of protocol options not recognized by the server.
    pub len: i32,
    /// For each option not recognized by the server, its name.
    pub opt_names: Bytes,
}

impl NegotiateProtocolVersion {
    pub const MSGTYPE: u8 = b'v';
}

impl BackendProtocol for NegotiateProtocolVersion {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(NegotiateProtocolVersion, msgtype);
        Ok(Self {
            minor: body.get_i32(),
            len: body.get_i32(),
            opt_names: body,
        })
    }
}

/// Identifies the message as a notification response.
///
/// Sent for `NOTIFY` events on channels the session `LISTEN`s on; can arrive
/// between any two messages.
#[derive(Debug, Clone)]
pub struct NotificationResponse {
    /// The process ID of the notifying backend process.
    pub process_id: i32,
    /// The name of the channel that the notify has been raised on.
    pub channel: ByteStr,
    /// The "payload" string passed from the notifying process.
    pub payload: ByteStr,
}

impl NotificationResponse {
    pub const MSGTYPE: u8 = b'A';
}

impl BackendProtocol for NotificationResponse {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(NotificationResponse, msgtype);
        Ok(Self {
            process_id: body.get_i32(),
            channel: take_cstr(&mut body)?,
            payload: take_cstr(&mut body)?,
        })
    }
}

/// Identifies the message as a parameter description.
#[derive(Debug)]
pub struct ParameterDescription {
    /// The object ID of each parameter data type used by the statement.
    pub oids: Vec<Oid>,
}

impl ParameterDescription {
    pub const MSGTYPE: u8 = b't';
}

impl BackendProtocol for ParameterDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(ParameterDescription, msgtype);
        let len = body.get_i16();
        let mut oids = Vec::with_capacity(len.max(0) as usize);
        for _ in 0..len {
            oids.push(body.get_u32());
        }
        Ok(Self { oids })
    }
}

/// Identifies the message as a run-time parameter status report.
#[derive(Debug)]
pub struct ParameterStatus {
    /// The name of the run-time parameter being reported.
    pub name: ByteStr,
    /// The current value of the parameter.
    pub value: ByteStr,
}

impl ParameterStatus {
    pub const MSGTYPE: u8 = b'S';
}

impl BackendProtocol for ParameterStatus {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(ParameterStatus, msgtype);
        Ok(Self {
            name: take_cstr(&mut body)?,
            value: take_cstr(&mut body)?,
        })
    }
}

/// ReadyForQuery is sent whenever the backend is ready for a new query cycle.
#[derive(Debug, Clone, Copy)]
pub struct ReadyForQuery {
    /// Current backend transaction status indicator.
    pub status: TransactionStatus,
}

impl ReadyForQuery {
    pub const MSGTYPE: u8 = b'Z';
}

impl BackendProtocol for ReadyForQuery {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(ReadyForQuery, msgtype);
        Ok(Self { status: TransactionStatus::from_u8(body.get_u8())? })
    }
}

/// One field of a [`RowDescription`] message.
#[derive(Debug, Clone)]
pub struct ColumnDescription {
    /// The field name.
    pub name: ByteStr,
    /// If the field can be identified as a column of a specific table, the
    /// object ID of the table; otherwise zero.
    pub table_oid: u32,
    /// If the field can be identified as a column of a specific table, the
    /// attribute number of the column; otherwise zero.
    pub attribute_num: i16,
    /// The object ID of the field's data type.
    pub oid: Oid,
    /// The data type size (see pg_type.typlen).
    ///
    /// Note that negative values denote variable-width types.
    pub type_size: i16,
    /// The type modifier (see pg_attribute.atttypmod).
    pub type_modifier: i32,
    /// The format code being used for the field.
    ///
    /// In a RowDescription returned from the statement variant of Describe,
    /// the format code is not yet known and will always be zero.
    pub format: PgFormat,
}

/// Identifies the message as a row description.
///
/// Describes the column layout of the rows which follow as DataRow messages.
#[derive(Debug)]
pub struct RowDescription {
    pub columns: Vec<ColumnDescription>,
}

impl RowDescription {
    pub const MSGTYPE: u8 = b'T';
}

impl BackendProtocol for RowDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(RowDescription, msgtype);
        let field_len = body.get_i16();
        let mut columns = Vec::with_capacity(field_len.max(0) as usize);
        for _ in 0..field_len {
            columns.push(ColumnDescription {
                name: take_cstr(&mut body)?,
                table_oid: body.get_u32(),
                attribute_num: body.get_i16(),
                oid: body.get_u32(),
                type_size: body.get_i16(),
                type_modifier: body.get_i32(),
                format: PgFormat::from_code(body.get_i16())?,
            });
        }
        Ok(Self { columns })
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name;

        impl $name {
            pub const MSGTYPE: u8 = $ty;
        }

        impl BackendProtocol for $name {
            fn decode(msgtype: u8, _: Bytes) -> Result<Self, ProtocolError> {
                assert_msgtype!($name, msgtype);
                Ok(Self)
            }
        }
    )*};
}

unit_msg! {
    /// Identifies the message as a Bind-complete indicator.
    struct BindComplete, b'2';

    /// Identifies the message as a Close-complete indicator.
    struct CloseComplete, b'3';

    /// Identifies the message as a response to an empty query string.
    ///
    /// This substitutes for CommandComplete.
    struct EmptyQueryResponse, b'I';

    /// Identifies the message as a no-data indicator.
    struct NoData, b'n';

    /// Identifies the message as a Parse-complete indicator.
    struct ParseComplete, b'1';

    /// Identifies the message as a portal-suspended indicator.
    ///
    /// Note this only appears if an Execute message's row-count limit was
    /// reached.
    struct PortalSuspended, b's';
}

#[cfg(test)]
mod test {
    use bytes::{BufMut, BytesMut};

    use super::*;

    fn decode<B: BackendProtocol>(msgtype: u8, body: &[u8]) -> B {
        B::decode(msgtype, Bytes::copy_from_slice(body)).unwrap()
    }

    #[test]
    fn authentication_variants() {
        let auth: Authentication = decode(b'R', &0i32.to_be_bytes());
        assert!(matches!(auth, Authentication::Ok));

        let mut body = BytesMut::new();
        body.put_i32(5);
        body.put_slice(&[1, 2, 3, 4]);
        let auth: Authentication = decode(b'R', &body);
        assert!(matches!(auth, Authentication::MD5Password { salt: [1, 2, 3, 4] }));

        let mut body = BytesMut::new();
        body.put_i32(10);
        body.put_slice(b"SCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0");
        let Authentication::SASL { mechanisms } = decode(b'R', &body) else {
            panic!("expected SASL");
        };
        assert_eq!(mechanisms.len(), 2);
        assert_eq!(mechanisms[1], "SCRAM-SHA-256");
    }

    #[test]
    fn data_row_null_and_empty_are_distinct() {
        let mut body = BytesMut::new();
        body.put_i16(3);
        body.put_i32(-1); // NULL
        body.put_i32(0); // empty value
        body.put_i32(2);
        body.put_slice(b"ok");
        let row: DataRow = decode(b'D', &body);
        let values = row.values();
        assert_eq!(values[0], None);
        assert_eq!(values[1].as_deref(), Some(&b""[..]));
        assert_eq!(values[2].as_deref(), Some(&b"ok"[..]));
    }

    #[test]
    fn row_description_columns() {
        let mut body = BytesMut::new();
        body.put_i16(1);
        body.put_slice(b"version\0");
        body.put_u32(0); // table oid
        body.put_i16(0); // attribute
        body.put_u32(25); // text
        body.put_i16(-1);
        body.put_i32(-1);
        body.put_i16(0); // declared text format
        let rd: RowDescription = decode(b'T', &body);
        assert_eq!(rd.columns.len(), 1);
        assert_eq!(rd.columns[0].name, "version");
        assert_eq!(rd.columns[0].oid, 25);
        assert_eq!(rd.columns[0].format, PgFormat::Text);
    }

    #[test]
    fn ready_for_query_status() {
        let ready: ReadyForQuery = decode(b'Z', b"I");
        assert_eq!(ready.status, TransactionStatus::Idle);
        let ready: ReadyForQuery = decode(b'Z', b"E");
        assert_eq!(ready.status, TransactionStatus::FailedTransaction);
    }

    #[test]
    fn msgtype_missmatch_is_rejected() {
        let err = BindComplete::decode(b'1', Bytes::new()).unwrap_err();
        assert!(matches!(err, ProtocolError::Unexpected { .. }));
    }
}
