//! Binary parameter encoding.
//!
//! Every parameter travels in binary format; the [`Bind`] message declares a
//! single binary format code for all of them.
//!
//! [`Bind`]: crate::postgres::frontend::Bind
use bytes::Bytes;

use crate::postgres::{Oid, PgType};

/// An encoded query parameter: an oid and a binary payload.
///
/// Parameters outlive the caller (tasks wait in the connection queue), so
/// values are owned.
#[derive(Debug, Clone)]
pub struct Encoded {
    oid: Oid,
    /// `None` is the SQL NULL, distinct from an empty payload.
    value: Option<Bytes>,
}

impl Encoded {
    /// A NULL parameter of the given declared type.
    pub fn null(oid: Oid) -> Self {
        Self { oid, value: None }
    }

    pub fn owned(value: Vec<u8>, oid: Oid) -> Self {
        Self { oid, value: Some(value.into()) }
    }

    pub fn bytes(value: Bytes, oid: Oid) -> Self {
        Self { oid, value: Some(value) }
    }

    /// The parameter type oid sent in `Parse`.
    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// The binary payload, `None` for NULL.
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }
}

/// A type that can be encoded into a binary query parameter.
pub trait Encode {
    fn encode(self) -> Encoded;
}

impl Encode for Encoded {
    fn encode(self) -> Encoded {
        self
    }
}

impl Encode for bool {
    fn encode(self) -> Encoded {
        Encoded::owned(vec![self as u8], Self::OID)
    }
}

macro_rules! encode_be {
    ($($ty:ty),*) => {$(
        impl Encode for $ty {
            fn encode(self) -> Encoded {
                Encoded::owned(self.to_be_bytes().into(), Self::OID)
            }
        }
    )*};
}

encode_be!(i16, i32, i64, f32, f64);

impl Encode for &str {
    fn encode(self) -> Encoded {
        Encoded::owned(self.as_bytes().into(), str::OID)
    }
}

impl Encode for String {
    fn encode(self) -> Encoded {
        Encoded::owned(self.into_bytes(), Self::OID)
    }
}

impl Encode for &String {
    fn encode(self) -> Encoded {
        self.as_str().encode()
    }
}

impl<T> Encode for Option<T>
where
    T: Encode + PgType,
{
    fn encode(self) -> Encoded {
        match self {
            Some(value) => value.encode(),
            None => Encoded::null(T::OID),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn numbers_are_big_endian() {
        let enc = 0x0102i16.encode();
        assert_eq!(enc.oid(), 21);
        assert_eq!(enc.value(), Some(&[1u8, 2][..]));

        let enc = 1i32.encode();
        assert_eq!(enc.value(), Some(&[0u8, 0, 0, 1][..]));
    }

    #[test]
    fn option_none_is_null_with_typed_oid() {
        let enc = Option::<i64>::None.encode();
        assert_eq!(enc.oid(), 20);
        assert_eq!(enc.value(), None);
    }

    #[test]
    fn empty_string_is_not_null() {
        let enc = "".encode();
        assert_eq!(enc.value(), Some(&b""[..]));
    }
}
