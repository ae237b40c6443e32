//! Postgres row operation.
//!
//! - [`RowSchema`]: normalized column layout shared by every row of one
//!   result.
//! - [`Row`] / [`Column`]: one decoded `DataRow`.
//! - [`FromRow`] / [`FromColumn`]: conversion into caller types.
use std::{collections::HashMap, sync::Arc};

use bytes::{Buf, Bytes};

use crate::{
    common::ByteStr,
    postgres::{
        backend::{ColumnDescription, DataRow},
        Oid, PgFormat, PgType,
    },
};

/// The column layout of a streamed result.
///
/// Built once per stream from the server's `RowDescription`. Since the
/// client requests binary results in `Bind`, every declared format is
/// rewritten to [`PgFormat::Binary`] here; decoders must trust the
/// requested format, not the advertised one.
#[derive(Debug)]
pub struct RowSchema {
    columns: Vec<ColumnDescription>,
    by_name: HashMap<ByteStr, usize>,
}

impl RowSchema {
    pub(crate) fn new(mut columns: Vec<ColumnDescription>) -> Arc<Self> {
        for column in &mut columns {
            column.format = PgFormat::Binary;
        }
        let by_name = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
        Arc::new(Self { columns, by_name })
    }

    pub(crate) fn empty() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn columns(&self) -> &[ColumnDescription] {
        &self.columns
    }

    /// First column index with the given name, if any.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }
}

/// One result row.
#[derive(Debug, Clone)]
pub struct Row {
    schema: Arc<RowSchema>,
    values: Vec<Option<Bytes>>,
}

impl Row {
    pub(crate) fn new(schema: Arc<RowSchema>, data: &DataRow) -> Self {
        debug_assert_eq!(
            schema.len(),
            data.field_len.max(0) as usize,
            "RowDescription length missmatch with DataRow",
        );
        Self { schema, values: data.values() }
    }

    pub fn schema(&self) -> &RowSchema {
        &self.schema
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Borrow a column by index or name.
    pub fn column<I: RowIndex>(&self, index: I) -> Result<Column<'_>, DecodeError> {
        let at = index.position(&self.schema)?;
        Ok(Column {
            description: &self.schema.columns[at],
            value: self.values[at].as_ref(),
        })
    }

    /// Get and decode a column by index or name.
    pub fn try_get<I: RowIndex, T: FromColumn>(&self, index: I) -> Result<T, DecodeError> {
        T::decode(self.column(index)?)
    }

    /// Decode the whole row into `T`.
    pub fn decode<T: FromRow>(self) -> Result<T, DecodeError> {
        T::from_row(self)
    }
}

/// A borrowed view of one column of a [`Row`].
#[derive(Debug, Clone, Copy)]
pub struct Column<'a> {
    description: &'a ColumnDescription,
    value: Option<&'a Bytes>,
}

impl<'a> Column<'a> {
    pub fn name(&self) -> &'a str {
        &self.description.name
    }

    pub fn oid(&self) -> Oid {
        self.description.oid
    }

    /// Always [`PgFormat::Binary`], the normalization is applied before any
    /// column reaches a decoder.
    pub fn format(&self) -> PgFormat {
        self.description.format
    }

    /// The raw value bytes, `None` for SQL NULL.
    ///
    /// An empty slice is an empty value, not NULL.
    pub fn value(&self) -> Option<&'a [u8]> {
        self.value.map(|b| &b[..])
    }

    pub(crate) fn casting<T>(&self) -> DecodeError {
        DecodeError::Casting {
            target: std::any::type_name::<T>(),
            oid: self.oid(),
            value: self.value.cloned(),
        }
    }
}

/// A type that can be constructed from a [`Row`].
pub trait FromRow: Sized {
    fn from_row(row: Row) -> Result<Self, DecodeError>;
}

impl FromRow for Row {
    fn from_row(row: Row) -> Result<Self, DecodeError> {
        Ok(row)
    }
}

impl FromRow for () {
    fn from_row(_: Row) -> Result<Self, DecodeError> {
        Ok(())
    }
}

macro_rules! from_row_tuple {
    ($($t:ident $i:literal),*) => {
        impl<$($t),*> FromRow for ($($t),*,)
        where
            $($t: FromColumn),*
        {
            fn from_row(row: Row) -> Result<Self, DecodeError> {
                Ok((
                    $(row.try_get($i)?),*,
                ))
            }
        }
    };
}

from_row_tuple!(T0 0);
from_row_tuple!(T0 0, T1 1);
from_row_tuple!(T0 0, T1 1, T2 2);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3);

/// A type that can be constructed from a [`Column`].
pub trait FromColumn: Sized {
    fn decode(column: Column) -> Result<Self, DecodeError>;
}

impl<T: FromColumn> FromColumn for Option<T> {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        match column.value() {
            None => Ok(None),
            Some(_) => T::decode(column).map(Some),
        }
    }
}

impl FromColumn for Bytes {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        match column.value {
            Some(value) => Ok(value.clone()),
            None => Err(column.casting::<Self>()),
        }
    }
}

impl FromColumn for String {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        if column.oid() != Self::OID {
            return Err(column.casting::<Self>());
        }
        let Some(value) = column.value() else {
            return Err(column.casting::<Self>());
        };
        std::str::from_utf8(value)
            .map(str::to_owned)
            .map_err(|_| column.casting::<Self>())
    }
}

impl FromColumn for bool {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        match (column.oid() == Self::OID).then(|| column.value()).flatten() {
            Some([0]) => Ok(false),
            Some([_]) => Ok(true),
            _ => Err(column.casting::<Self>()),
        }
    }
}

macro_rules! from_column_be {
    ($($ty:ty),*) => {$(
        impl FromColumn for $ty {
            fn decode(column: Column) -> Result<Self, DecodeError> {
                if column.oid() != Self::OID {
                    return Err(column.casting::<Self>());
                }
                let Some(mut value) = column.value() else {
                    return Err(column.casting::<Self>());
                };
                if value.len() != size_of::<Self>() {
                    return Err(column.casting::<Self>());
                }
                let mut be = [0u8; size_of::<Self>()];
                value.copy_to_slice(&mut be);
                Ok(<$ty>::from_be_bytes(be))
            }
        }
    )*};
}

from_column_be!(i16, i32, i64, f32, f64);

/// A type that can index a column, sealed to `usize` and `&str`.
pub trait RowIndex: sealed::Sealed {
    fn position(&self, schema: &RowSchema) -> Result<usize, DecodeError>;
}

impl RowIndex for usize {
    fn position(&self, schema: &RowSchema) -> Result<usize, DecodeError> {
        if *self < schema.len() {
            Ok(*self)
        } else {
            Err(DecodeError::ColumnNotFound(
                itoa::Buffer::new().format(*self).to_owned().into(),
            ))
        }
    }
}

impl RowIndex for &str {
    fn position(&self, schema: &RowSchema) -> Result<usize, DecodeError> {
        schema
            .index_of(self)
            .ok_or_else(|| DecodeError::ColumnNotFound(String::from(*self).into()))
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for usize {}
    impl Sealed for &str {}
}

/// An error when decoding a row value.
///
/// Local to the caller reading a column; never invalidates the connection.
#[derive(Clone)]
pub enum DecodeError {
    /// Column requested not found.
    ColumnNotFound(std::borrow::Cow<'static, str>),
    /// The raw value cannot be read as the requested type.
    Casting {
        /// Rust type the caller requested.
        target: &'static str,
        /// Declared oid of the column.
        oid: Oid,
        /// The raw value, `None` for NULL.
        value: Option<Bytes>,
    },
}

impl std::error::Error for DecodeError {}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("failed to decode value, ")?;
        match self {
            Self::ColumnNotFound(name) => write!(f, "column not found: {name}"),
            Self::Casting { target, oid, value } => match value.as_deref() {
                None => write!(f, "cannot cast NULL of oid {oid} into `{target}`"),
                Some([]) => {
                    write!(f, "cannot cast the empty value of oid {oid} into `{target}`")
                },
                Some(value) => {
                    // a short hex preview keeps casting failures greppable
                    // without dumping whole cells into logs
                    write!(f, "cannot cast 0x")?;
                    for byte in value.iter().take(12) {
                        write!(f, "{byte:02x}")?;
                    }
                    if value.len() > 12 {
                        write!(f, ".. ({} bytes)", value.len())?;
                    }
                    write!(f, " of oid {oid} into `{target}`")
                },
            },
        }
    }
}

impl std::fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{self}\"")
    }
}
