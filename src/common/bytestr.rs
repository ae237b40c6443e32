use bytes::Bytes;

/// A utf8-validated, cheaply cloneable slice of a protocol buffer.
///
/// Backend frames carry many short strings (column names, parameter
/// statuses, error fields); keeping them as slices of the frame skips one
/// allocation per string.
#[derive(Clone, Default)]
pub struct ByteStr(Bytes);

impl ByteStr {
    /// Wrap a static str without copying.
    pub const fn from_static(value: &'static str) -> Self {
        Self(Bytes::from_static(value.as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: every constructor validates utf8 and the buffer is
        // immutable afterwards
        unsafe { std::str::from_utf8_unchecked(&self.0) }
    }

    /// Self without surrounding whitespace, sharing the same buffer.
    pub fn trimmed(&self) -> Self {
        Self(self.0.slice_ref(self.as_str().trim().as_bytes()))
    }
}

impl TryFrom<Bytes> for ByteStr {
    type Error = std::str::Utf8Error;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        std::str::from_utf8(&bytes)?;
        Ok(Self(bytes))
    }
}

impl From<&str> for ByteStr {
    /// Copies; use [`from_static`][ByteStr::from_static] where the value
    /// lives forever anyway.
    fn from(value: &str) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for ByteStr {
    fn from(value: String) -> Self {
        Self(Bytes::from(value.into_bytes()))
    }
}

impl std::ops::Deref for ByteStr {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl AsRef<str> for ByteStr {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl std::borrow::Borrow<str> for ByteStr {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

/// One comparison against anything str-shaped covers `ByteStr`, `str`,
/// `&str` and `String` alike.
impl<T> PartialEq<T> for ByteStr
where
    T: AsRef<str> + ?Sized,
{
    fn eq(&self, other: &T) -> bool {
        self.as_str() == other.as_ref()
    }
}

impl Eq for ByteStr {}

impl std::hash::Hash for ByteStr {
    /// Hashes as str, consistent with the [`Borrow<str>`] lookup path.
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_str().hash(state)
    }
}

impl std::fmt::Display for ByteStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self)
    }
}

impl std::fmt::Debug for ByteStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self.as_str(), f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trimmed_shares_the_buffer() {
        let raw = ByteStr::from("  SELECT 1\n");
        let trimmed = raw.trimmed();
        assert_eq!(trimmed, "SELECT 1");
        assert_eq!(raw, "  SELECT 1\n");
    }

    #[test]
    fn try_from_rejects_invalid_utf8() {
        assert!(ByteStr::try_from(Bytes::from_static(&[0xff, 0xfe])).is_err());
        assert_eq!(ByteStr::try_from(Bytes::from_static(b"ok")).unwrap(), "ok");
    }
}
