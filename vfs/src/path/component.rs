use bstr::ByteSlice;
use std::fmt::{self, Debug, Display};

/// A wrapper type for validated path components, i.e. names of entries
/// inside a directory.
/// Internally uses a [bytes::Bytes], but disallows
/// slashes, and null bytes to be present, as well as
/// '.', '..' and the empty string.
#[repr(transparent)]
#[derive(Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PathComponent {
    pub(super) inner: bytes::Bytes,
}

/// Errors created when parsing / validating [PathComponent].
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum PathComponentError {
    #[error("cannot be empty")]
    Empty,
    #[error("cannot contain null bytes")]
    Null,
    #[error("cannot be '.' or '..'")]
    Dot,
    #[error("cannot contain slashes")]
    ContainsSlashes,
    #[error("invalid name: {0:?}")]
    Invalid(bytes::Bytes),
}

impl PathComponent {
    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    /// Returns the name as a string, replacing invalid UTF-8 sequences.
    pub fn to_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        self.inner.to_str_lossy()
    }
}

impl AsRef<[u8]> for PathComponent {
    fn as_ref(&self) -> &[u8] {
        self.inner.as_ref()
    }
}

impl From<PathComponent> for bytes::Bytes {
    fn from(value: PathComponent) -> Self {
        value.inner
    }
}

pub(super) fn validate_name<B: AsRef<[u8]>>(name: B) -> Result<(), PathComponentError> {
    match name.as_ref() {
        b"" => Err(PathComponentError::Empty),
        b".." | b"." => Err(PathComponentError::Dot),
        v if v.contains(&0x00) => Err(PathComponentError::Null),
        v if v.contains(&b'/') => Err(PathComponentError::ContainsSlashes),
        _ => Ok(()),
    }
}

impl TryFrom<bytes::Bytes> for PathComponent {
    type Error = PathComponentError;

    fn try_from(value: bytes::Bytes) -> Result<Self, Self::Error> {
        validate_name(&value)?;
        Ok(Self { inner: value })
    }
}

impl TryFrom<&[u8]> for PathComponent {
    type Error = PathComponentError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        validate_name(value)?;
        Ok(Self {
            inner: bytes::Bytes::copy_from_slice(value),
        })
    }
}

impl TryFrom<&str> for PathComponent {
    type Error = PathComponentError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.as_bytes().try_into()
    }
}

impl TryFrom<&std::ffi::OsStr> for PathComponent {
    type Error = PathComponentError;

    fn try_from(value: &std::ffi::OsStr) -> Result<Self, Self::Error> {
        value.as_encoded_bytes().try_into()
    }
}

impl Debug for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(self.inner.as_bstr(), f)
    }
}

impl Display for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(self.inner.as_bstr(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::{PathComponent, PathComponentError};
    use rstest::rstest;

    #[rstest]
    #[case::empty("", PathComponentError::Empty)]
    #[case::dot(".", PathComponentError::Dot)]
    #[case::dotdot("..", PathComponentError::Dot)]
    #[case::slash("a/b", PathComponentError::ContainsSlashes)]
    #[case::null("a\0b", PathComponentError::Null)]
    fn invalid(#[case] name: &str, #[case] expected: PathComponentError) {
        assert_eq!(
            expected,
            PathComponent::try_from(name).expect_err("must fail")
        );
    }

    #[test]
    fn ordering_is_bytewise() {
        let a = PathComponent::try_from("B").unwrap();
        let b = PathComponent::try_from("a").unwrap();
        assert!(a < b);
    }
}
