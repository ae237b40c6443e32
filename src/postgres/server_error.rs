use bytes::{Buf, Bytes};

use super::take_cstr;
use crate::common::ByteStr;

/// The identified fields of an `ErrorResponse` or `NoticeResponse`.
///
/// Each field is a Byte1 code and a nul terminated string; a zero code
/// terminates the list. Fields can appear in any order, and unrecognized
/// codes are silently ignored since more may be added in the future.
///
/// <https://www.postgresql.org/docs/current/protocol-error-fields.html>
#[derive(Debug, Default, Clone, thiserror::Error)]
#[error("{} ({}): {}", .severity, .code, .message)]
pub struct ServerError {
    /// `ERROR`, `FATAL`, `PANIC`, or a notice severity.
    pub severity: ByteStr,
    /// The SQLSTATE code, always present.
    pub code: ByteStr,
    /// The primary human-readable error message.
    pub message: ByteStr,
    /// Optional secondary message carrying more detail.
    pub detail: Option<ByteStr>,
    /// Optional suggestion what to do about the problem.
    pub hint: Option<ByteStr>,
    /// Error cursor position as an index into the original query string,
    /// counted in characters, 1 based.
    pub position: Option<ByteStr>,
    /// Context in which the error occurred, e.g. a call stack traceback.
    pub where_: Option<ByteStr>,
    pub schema: Option<ByteStr>,
    pub table: Option<ByteStr>,
    pub column: Option<ByteStr>,
    pub data_type: Option<ByteStr>,
    pub constraint: Option<ByteStr>,
    /// Source-code file name where the error was reported.
    pub file: Option<ByteStr>,
    /// Source-code line number where the error was reported.
    pub line: Option<ByteStr>,
    /// Source-code routine name reporting the error.
    pub routine: Option<ByteStr>,
}

impl ServerError {
    pub(crate) fn from_fields(mut body: Bytes) -> Self {
        let mut err = Self::default();

        while let Some(code) = body.first().copied() {
            if code == 0 {
                break;
            }
            body.advance(1);
            let Ok(value) = take_cstr(&mut body) else {
                break;
            };
            match code {
                b'S' => err.severity = value,
                // 'V' is the nonlocalized severity, preferred when present
                b'V' => err.severity = value,
                b'C' => err.code = value,
                b'M' => err.message = value,
                b'D' => err.detail = Some(value),
                b'H' => err.hint = Some(value),
                b'P' => err.position = Some(value),
                b'W' => err.where_ = Some(value),
                b's' => err.schema = Some(value),
                b't' => err.table = Some(value),
                b'c' => err.column = Some(value),
                b'd' => err.data_type = Some(value),
                b'n' => err.constraint = Some(value),
                b'F' => err.file = Some(value),
                b'L' => err.line = Some(value),
                b'R' => err.routine = Some(value),
                _ => {},
            }
        }

        err
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn parses_identified_fields_in_any_order() {
        let body = Bytes::from_static(
            b"C42P01\0Mrelation \"foo\" does not exist\0SERROR\0Fparse_relation.c\0\0",
        );
        let err = ServerError::from_fields(body);
        assert_eq!(err.severity, "ERROR");
        assert_eq!(err.code, "42P01");
        assert_eq!(err.message, "relation \"foo\" does not exist");
        assert_eq!(err.file.as_deref(), Some("parse_relation.c"));
        assert_eq!(err.hint, None);
    }

    #[test]
    fn unknown_field_codes_are_ignored() {
        let body = Bytes::from_static(b"SFATAL\0C28P01\0Mno\0Zfuture-field\0\0");
        let err = ServerError::from_fields(body);
        assert_eq!(err.severity, "FATAL");
        assert_eq!(err.code, "28P01");
    }
}
