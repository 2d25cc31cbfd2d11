//! The narrow contract through which the content database and the file tree
//! access a backing store, plus two implementations of it.
use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::path::{Path, PathBuf, PathComponent};

mod local;
mod memory;

pub use local::LocalFileProvider;
pub use memory::MemoryFileProvider;

/// Identifies a backing store.
/// Two providers pointing at the same physical store must yield equal keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderKey(uuid::Uuid);

impl ProviderKey {
    pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::str::FromStr for ProviderKey {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// A location: the identity of a backing store, and a path inside of it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathKey {
    pub provider: ProviderKey,
    pub path: PathBuf,
}

impl PathKey {
    pub fn new(provider: ProviderKey, path: PathBuf) -> Self {
        Self { provider, path }
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:/{}", self.provider, self.path)
    }
}

/// A [PathKey] together with the provider that can actually access it.
#[derive(Clone)]
pub struct ProviderPathKey {
    provider: Arc<dyn FileProvider>,
    key: PathKey,
}

impl ProviderPathKey {
    pub fn new(provider: Arc<dyn FileProvider>, path: PathBuf) -> Self {
        let key = PathKey::new(provider.provider_key(), path);
        Self { provider, key }
    }

    pub fn provider(&self) -> &Arc<dyn FileProvider> {
        &self.provider
    }

    pub fn key(&self) -> &PathKey {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.key.path
    }

    /// Returns the key of the child `name`, on the same provider.
    pub fn child(&self, name: &PathComponent) -> Self {
        Self {
            provider: self.provider.clone(),
            key: PathKey::new(self.key.provider, self.key.path.join(name)),
        }
    }

    /// Returns the key of a descendant at the relative path `rel`.
    pub fn resolve(&self, rel: &Path) -> Self {
        Self {
            provider: self.provider.clone(),
            key: PathKey::new(self.key.provider, self.key.path.join_path(rel)),
        }
    }
}

impl fmt::Debug for ProviderPathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.key, f)
    }
}

impl fmt::Display for ProviderPathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.key, f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    File,
    Directory,
    Other,
}

/// Basic attributes of an entry in a backing store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileAttributes {
    pub kind: FileKind,
    pub size: u64,
    /// Last modification time, in milliseconds since the unix epoch.
    pub modified_millis: i64,
}

impl FileAttributes {
    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// Returns true if the two attribute sets describe different contents.
    pub fn changed(&self, other: &FileAttributes) -> bool {
        self.size != other.size || self.modified_millis != other.modified_millis
    }
}

bitflags! {
    /// Flags for [FileProvider::ensure_write_request].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct WriteRequestFlags: u8 {
        /// Delete intermediate non-directory entries that block the path.
        const DELETE_INTERMEDIATE = 1 << 0;
    }

    /// Result of [FileProvider::ensure_write_request].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct WriteRequestResult: u8 {
        /// Some files were deleted to fulfill the request.
        const FILES_DELETED = 1 << 0;
        const DIRECTORY_CREATED = 1 << 1;
    }
}

fn not_a_directory(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::Other,
        format!("intermediate path is not a directory: {}", path),
    )
}

/// Access to a backing store.
/// Must be safely callable concurrently for different paths.
pub trait FileProvider: Send + Sync {
    fn provider_key(&self) -> ProviderKey;

    /// Returns the attributes of the entry at `path`.
    fn attributes(&self, path: &Path) -> io::Result<FileAttributes>;

    fn open_input(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;

    /// Opens the file at `path` for writing, truncating it.
    /// The parent directory must exist.
    fn open_output(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;

    /// Lists the direct children of the directory at `path`.
    fn list_directory(&self, path: &Path) -> io::Result<BTreeMap<PathComponent, FileAttributes>>;

    /// Deletes the entry at `path`, and all of its children.
    /// Deleting a missing entry succeeds.
    fn delete_recursively(&self, path: &Path) -> io::Result<()>;

    /// Creates the directory at `path`, and all of its missing ancestors.
    fn create_directories(&self, path: &Path) -> io::Result<()>;

    fn read_all_bytes(&self, path: &Path) -> io::Result<Bytes> {
        let mut buf = Vec::new();
        self.open_input(path)?.read_to_end(&mut buf)?;
        Ok(buf.into())
    }

    /// Copies the contents of the file at `path` into `sink`.
    fn write_to(&self, path: &Path, sink: &mut dyn Write) -> io::Result<u64> {
        let mut input = self.open_input(path)?;
        io::copy(&mut input, sink)
    }

    fn set_file_bytes(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut out = self.open_output(path)?;
        out.write_all(data)?;
        out.flush()
    }

    /// Lists every descendant of the directory at `path`, keyed by the path
    /// relative to it.
    fn list_directory_recursive(
        &self,
        path: &Path,
    ) -> io::Result<BTreeMap<PathBuf, FileAttributes>> {
        let mut result = BTreeMap::new();
        let mut pending = vec![PathBuf::new()];
        while let Some(rel) = pending.pop() {
            for (name, attrs) in self.list_directory(&path.join_path(&rel))? {
                let child = rel.join(&name);
                if attrs.is_directory() {
                    pending.push(child.clone());
                }
                result.insert(child, attrs);
            }
        }
        Ok(result)
    }

    /// Deletes every child of the directory at `path` whose name is not in
    /// `keep`. Returns the names of the deleted children.
    fn delete_children_recursively_if_not_in(
        &self,
        path: &Path,
        keep: &BTreeSet<PathComponent>,
    ) -> io::Result<BTreeSet<PathComponent>> {
        let children = match self.list_directory(path) {
            Ok(children) => children,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(e),
        };
        let mut deleted = BTreeSet::new();
        for name in children.into_keys() {
            if keep.contains(&name) {
                continue;
            }
            self.delete_recursively(&path.join(&name))?;
            deleted.insert(name);
        }
        Ok(deleted)
    }

    /// Prepares `path` to be written as an entry of the given kind.
    ///
    /// Missing ancestors are created. Conflicting entries at `path` are
    /// deleted, as are intermediate non-directories if
    /// [WriteRequestFlags::DELETE_INTERMEDIATE] is given.
    fn ensure_write_request(
        &self,
        path: &Path,
        kind: FileKind,
        flags: WriteRequestFlags,
    ) -> io::Result<WriteRequestResult> {
        let mut result = WriteRequestResult::empty();

        // check ancestors top-down, stopping at the first missing one.
        let mut ancestor = PathBuf::new();
        let parent_count = path.name_count().saturating_sub(1);
        for name in path.components().take(parent_count) {
            ancestor.push(&name);
            match self.attributes(&ancestor) {
                Ok(attrs) if attrs.is_directory() => continue,
                Ok(_) => {
                    if !flags.contains(WriteRequestFlags::DELETE_INTERMEDIATE) {
                        return Err(not_a_directory(&ancestor));
                    }
                    self.delete_recursively(&ancestor)?;
                    result |= WriteRequestResult::FILES_DELETED;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(e) => return Err(e),
            }
        }
        if let Some(parent) = path.parent() {
            self.create_directories(parent)?;
        }

        let existing = match self.attributes(path) {
            Ok(attrs) => Some(attrs),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };

        match (kind, existing) {
            (FileKind::Directory, Some(attrs)) if attrs.is_directory() => {}
            (FileKind::Directory, existing) => {
                if existing.is_some() {
                    self.delete_recursively(path)?;
                    result |= WriteRequestResult::FILES_DELETED;
                }
                self.create_directories(path)?;
                result |= WriteRequestResult::DIRECTORY_CREATED;
            }
            (_, Some(attrs)) if attrs.is_directory() => {
                self.delete_recursively(path)?;
                result |= WriteRequestResult::FILES_DELETED;
            }
            (_, _) => {}
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use super::{FileKind, FileProvider, MemoryFileProvider, WriteRequestFlags, WriteRequestResult};
    use crate::path::{PathBuf, PathComponent};

    fn p(s: &str) -> PathBuf {
        s.parse().unwrap()
    }

    #[rstest]
    fn ensure_write_request_creates_parents() {
        let provider = MemoryFileProvider::default();
        let result = provider
            .ensure_write_request(&p("a/b/c.txt"), FileKind::File, WriteRequestFlags::empty())
            .expect("must succeed");
        assert_eq!(WriteRequestResult::empty(), result);
        assert!(provider.attributes(&p("a/b")).unwrap().is_directory());
    }

    #[rstest]
    fn ensure_write_request_deletes_intermediate_file() {
        let provider = MemoryFileProvider::default();
        provider.set_file_bytes(&p("a"), b"file").unwrap();

        provider
            .ensure_write_request(&p("a/b"), FileKind::File, WriteRequestFlags::empty())
            .expect_err("intermediate file must not be deleted without flag");

        let result = provider
            .ensure_write_request(
                &p("a/b"),
                FileKind::File,
                WriteRequestFlags::DELETE_INTERMEDIATE,
            )
            .expect("must succeed");
        assert!(result.contains(WriteRequestResult::FILES_DELETED));
        assert!(provider.attributes(&p("a")).unwrap().is_directory());
    }

    #[rstest]
    fn ensure_write_request_directory_over_file() {
        let provider = MemoryFileProvider::default();
        provider.set_file_bytes(&p("d"), b"file").unwrap();
        let result = provider
            .ensure_write_request(&p("d"), FileKind::Directory, WriteRequestFlags::empty())
            .unwrap();
        assert_eq!(
            WriteRequestResult::FILES_DELETED | WriteRequestResult::DIRECTORY_CREATED,
            result
        );

        // a second request is a no-op
        let result = provider
            .ensure_write_request(&p("d"), FileKind::Directory, WriteRequestFlags::empty())
            .unwrap();
        assert_eq!(WriteRequestResult::empty(), result);
    }

    #[rstest]
    fn delete_children_if_not_in() {
        let provider: Arc<dyn FileProvider> = Arc::new(MemoryFileProvider::default());
        for name in ["a", "b", "c"] {
            provider.set_file_bytes(&p(name), name.as_bytes()).unwrap();
        }
        let keep: BTreeSet<PathComponent> = [PathComponent::try_from("a").unwrap()].into();
        let deleted = provider
            .delete_children_recursively_if_not_in(&PathBuf::new(), &keep)
            .unwrap();
        assert_eq!(2, deleted.len());
        assert_eq!(
            vec![PathComponent::try_from("a").unwrap()],
            provider
                .list_directory(&PathBuf::new())
                .unwrap()
                .into_keys()
                .collect::<Vec<_>>()
        );
    }

    #[rstest]
    fn list_recursive() {
        let provider = MemoryFileProvider::default();
        provider.create_directories(&p("a/b")).unwrap();
        provider.set_file_bytes(&p("a/b/f"), b"x").unwrap();
        provider.set_file_bytes(&p("g"), b"y").unwrap();

        let listing = provider.list_directory_recursive(&PathBuf::new()).unwrap();
        assert_eq!(
            vec![p("a"), p("a/b"), p("a/b/f"), p("g")],
            listing.into_keys().collect::<Vec<_>>()
        );
    }
}
