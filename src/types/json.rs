use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    encode::{Encode, Encoded},
    postgres::{Oid, PgType},
    row::{Column, DecodeError, FromColumn},
};

/// Encode and decode a postgres `jsonb` value through serde.
///
/// # Panics
///
/// When performing [`Encode`], a failing [`Serialize`] implementation
/// panics.
#[derive(Debug, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T> PgType for Json<T> {
    /// jsonb, Binary JSON
    const OID: Oid = 3802;
}

impl<T> FromColumn for Json<T>
where
    T: DeserializeOwned,
{
    fn decode(column: Column) -> Result<Self, DecodeError> {
        if column.oid() != Self::OID {
            return Err(column.casting::<Self>());
        }
        let Some(value) = column.value() else {
            return Err(column.casting::<Self>());
        };
        // the jsonb binary payload leads with a version byte
        let Some((1, payload)) = value.split_first() else {
            return Err(column.casting::<Self>());
        };
        serde_json::from_slice(payload)
            .map(Json)
            .map_err(|_| column.casting::<Self>())
    }
}

impl<T: Serialize> Encode for Json<T> {
    fn encode(self) -> Encoded {
        let mut buf = vec![1u8];
        serde_json::to_writer(&mut buf, &self.0).unwrap();
        Encoded::owned(buf, Self::OID)
    }
}

impl<T: Serialize> Serialize for Json<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Json<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Self(T::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encodes_with_jsonb_version_byte() {
        let encoded = Json(serde_json::json!({"a": 1})).encode();
        assert_eq!(encoded.oid(), 3802);
        let value = encoded.value().unwrap();
        assert_eq!(value[0], 1);
        assert_eq!(&value[1..], br#"{"a":1}"#);
    }
}
