//! Contains data structures to deal with paths inside a file provider.
use bstr::ByteSlice;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    borrow::Borrow,
    collections::BTreeMap,
    ops::Bound,
    fmt::{self, Debug, Display},
    mem,
    ops::Deref,
    str::FromStr,
};

mod component;
pub use component::{PathComponent, PathComponentError};

/// Represents a path inside a file provider.
/// These are always relative to the root of the provider, and
/// platform-independent, which distinguishes them from the ones provided in
/// the standard library.
#[derive(Eq, Hash, PartialEq, PartialOrd, Ord)]
#[repr(transparent)] // SAFETY: Representation has to match [u8]
pub struct Path {
    // As component names cannot contain slashes,
    // we use them as component separators here.
    inner: [u8],
}

impl Path {
    // SAFETY: The empty path is valid.
    pub const ROOT: &'static Path = unsafe { Path::from_bytes_unchecked(&[]) };

    /// Convert a byte slice to a path, without checking validity.
    const unsafe fn from_bytes_unchecked(bytes: &[u8]) -> &Path {
        // SAFETY: &[u8] and &Path have the same representation.
        unsafe { mem::transmute(bytes) }
    }

    fn from_bytes(bytes: &[u8]) -> Option<&Path> {
        if !bytes.is_empty() {
            // Ensure all components are valid names.
            for component in bytes.split_str(b"/") {
                if component::validate_name(component).is_err() {
                    return None;
                }
            }
        }

        // SAFETY: We have verified that the path contains no empty components.
        Some(unsafe { Path::from_bytes_unchecked(bytes) })
    }

    pub fn is_root(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns the path without its final component, if there is one.
    ///
    /// Note that the parent of a bare file name is [Path::ROOT].
    /// [Path::ROOT] is the only path without a parent.
    pub fn parent(&self) -> Option<&Path> {
        // The root does not have a parent.
        if self.inner.is_empty() {
            return None;
        }

        Some(
            if let Some((parent, _file_name)) = self.inner.rsplit_once_str(b"/") {
                // SAFETY: The parent of a valid Path is a valid Path.
                unsafe { Path::from_bytes_unchecked(parent) }
            } else {
                // The parent of a bare file name is the root.
                Path::ROOT
            },
        )
    }

    /// Creates a PathBuf with `name` adjoined to self.
    pub fn try_join(&self, name: &[u8]) -> Result<PathBuf, PathComponentError> {
        let mut v = PathBuf::with_capacity(self.inner.len() + name.len() + 1);
        v.inner.extend_from_slice(&self.inner);
        v.try_push(name)?;

        Ok(v)
    }

    /// Creates a PathBuf with an already validated `name` adjoined to self.
    pub fn join(&self, name: &PathComponent) -> PathBuf {
        let mut v = self.to_owned();
        v.push(name);
        v
    }

    /// Appends all components of `other` to self.
    pub fn join_path(&self, other: &Path) -> PathBuf {
        let mut v = self.to_owned();
        if !other.inner.is_empty() {
            if !v.inner.is_empty() {
                v.inner.push(b'/');
            }
            v.inner.extend_from_slice(&other.inner);
        }
        v
    }

    /// Provides an iterator over the components of the path,
    /// which are invividual [PathComponent].
    /// In case the path is empty, an empty iterator is returned.
    pub fn components(&self) -> impl Iterator<Item = PathComponent> + '_ {
        self.components_bytes().map(|b| PathComponent {
            inner: bytes::Bytes::copy_from_slice(b),
        })
    }

    /// Produces an iterator over the components of the path, which are
    /// individual byte slices.
    /// In case the path is empty, an empty iterator is returned.
    pub fn components_bytes(&self) -> impl Iterator<Item = &[u8]> {
        let mut iter = self.inner.split_str(&b"/");

        // We don't want to return an empty element, consume it if it's the only one.
        if self.inner.is_empty() {
            let _ = iter.next();
        }

        iter
    }

    /// Returns the final component of the Path, if there is one.
    pub fn file_name(&self) -> Option<PathComponent> {
        self.components().last()
    }

    /// Returns true if `base` is self, or one of its ancestors.
    /// [Path::ROOT] is the ancestor of every path.
    pub fn starts_with(&self, base: &Path) -> bool {
        if base.inner.is_empty() {
            return true;
        }
        match self.inner.strip_prefix(&base.inner) {
            Some(rest) => rest.is_empty() || rest[0] == b'/',
            None => false,
        }
    }

    /// Returns the remainder of self after `base`, if `base` is an ancestor
    /// of (or equal to) self.
    pub fn strip_prefix(&self, base: &Path) -> Option<&Path> {
        if !self.starts_with(base) {
            return None;
        }
        let rest = &self.inner[base.inner.len()..];
        let rest = rest.strip_prefix(b"/").unwrap_or(rest);
        // SAFETY: A suffix of a valid path starting at a component boundary is valid.
        Some(unsafe { Path::from_bytes_unchecked(rest) })
    }

    /// Number of components in this path.
    pub fn name_count(&self) -> usize {
        self.components_bytes().count()
    }

    /// Resolves self below a host directory.
    pub fn to_host_path(&self, root: &std::path::Path) -> std::path::PathBuf {
        let mut p = root.to_path_buf();
        for c in self.components_bytes() {
            p.push(c.to_os_str_lossy());
        }
        p
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }
}

impl Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(self.inner.as_bstr(), f)
    }
}

impl Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(self.inner.as_bstr(), f)
    }
}

impl AsRef<Path> for Path {
    fn as_ref(&self) -> &Path {
        self
    }
}

/// Represents an owned [Path].
#[derive(Clone, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct PathBuf {
    inner: Vec<u8>,
}

impl Deref for PathBuf {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        // SAFETY: PathBuf always contains a valid Path.
        unsafe { Path::from_bytes_unchecked(&self.inner) }
    }
}

impl AsRef<Path> for PathBuf {
    fn as_ref(&self) -> &Path {
        self
    }
}

impl ToOwned for Path {
    type Owned = PathBuf;

    fn to_owned(&self) -> Self::Owned {
        PathBuf {
            inner: self.inner.to_owned(),
        }
    }
}

impl Borrow<Path> for PathBuf {
    fn borrow(&self) -> &Path {
        self
    }
}

impl From<&Path> for PathBuf {
    fn from(value: &Path) -> Self {
        value.to_owned()
    }
}

impl From<PathComponent> for PathBuf {
    fn from(value: PathComponent) -> Self {
        PathBuf {
            inner: value.inner.to_vec(),
        }
    }
}

impl TryFrom<Vec<u8>> for PathBuf {
    type Error = PathComponentError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if !value.is_empty() {
            for component in value.split_str(b"/") {
                component::validate_name(component)?;
            }
        }
        Ok(PathBuf { inner: value })
    }
}

impl FromStr for PathBuf {
    type Err = PathComponentError;

    fn from_str(s: &str) -> Result<PathBuf, Self::Err> {
        Ok(Path::from_bytes(s.as_bytes())
            .ok_or_else(|| PathComponentError::Invalid(bytes::Bytes::copy_from_slice(s.as_bytes())))?
            .to_owned())
    }
}

impl Debug for PathBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&**self, f)
    }
}

impl Display for PathBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&**self, f)
    }
}

impl Serialize for PathBuf {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.inner)
    }
}

impl<'de> Deserialize<'de> for PathBuf {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v: Vec<u8> = Deserialize::deserialize(deserializer)?;
        PathBuf::try_from(v).map_err(serde::de::Error::custom)
    }
}

impl PathBuf {
    pub fn new() -> PathBuf {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> PathBuf {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Adjoins `name` to self.
    pub fn try_push(&mut self, name: &[u8]) -> Result<(), PathComponentError> {
        component::validate_name(name)?;

        if !self.inner.is_empty() {
            self.inner.push(b'/');
        }

        self.inner.extend_from_slice(name);

        Ok(())
    }

    /// Adjoins an already validated `name` to self.
    pub fn push(&mut self, name: &PathComponent) {
        if !self.inner.is_empty() {
            self.inner.push(b'/');
        }
        self.inner.extend_from_slice(name.as_bytes());
    }

    /// Convert from a [&std::path::Path] to [Self].
    ///
    /// - Self uses `/` as path separator.
    /// - Absolute paths are always rejected, are are these with custom prefixes.
    /// - Repeated separators are deduplicated.
    /// - Occurrences of `.` are normalized away.
    /// - A trailing slash is normalized away.
    /// - `..` is rejected.
    #[cfg(unix)]
    pub fn from_host_path(host_path: &std::path::Path) -> Result<Self, PathComponentError> {
        let mut p = PathBuf::with_capacity(host_path.as_os_str().len());

        for component in host_path.components() {
            match component {
                std::path::Component::Prefix(_) | std::path::Component::RootDir => {
                    return Err(PathComponentError::Invalid(bytes::Bytes::copy_from_slice(
                        host_path.as_os_str().as_encoded_bytes(),
                    )))
                }
                std::path::Component::CurDir => continue, // ignore
                std::path::Component::ParentDir => return Err(PathComponentError::Dot),
                std::path::Component::Normal(s) => p.try_push(s.as_encoded_bytes())?,
            }
        }

        Ok(p)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.inner
    }
}

/// Iterates over the entries of `map` at `base` (if `include_self`), and
/// below it.
pub(crate) fn subtree<'a, V>(
    map: &'a BTreeMap<PathBuf, V>,
    base: &Path,
    include_self: bool,
) -> impl Iterator<Item = (&'a PathBuf, &'a V)> + 'a {
    let own = if include_self {
        map.get_key_value(base)
    } else {
        None
    };

    // all descendants share the "base/" prefix, which makes them a
    // contiguous range. This bound is not a valid path, but only used for
    // comparisons.
    let mut start = base.inner.to_vec();
    if !start.is_empty() {
        start.push(b'/');
    }
    let prefix_len = start.len();
    let start = PathBuf { inner: start };
    let descendants = map
        .range((Bound::Excluded(start.clone()), Bound::Unbounded))
        .take_while(move |(k, _)| k.inner.len() > prefix_len && k.inner.starts_with(&start.inner));

    own.into_iter().chain(descendants)
}
