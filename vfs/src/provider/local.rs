use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::time::UNIX_EPOCH;
use tracing::{instrument, warn};
use walkdir::WalkDir;

use super::{FileAttributes, FileKind, FileProvider, ProviderKey};
use crate::path::{Path, PathBuf, PathComponent};

/// A [FileProvider] backed by a directory on the local filesystem.
///
/// Its [ProviderKey] is derived from the canonical path of the root, so two
/// instances pointing at the same directory compare equal.
#[derive(Clone, Debug)]
pub struct LocalFileProvider {
    root: std::path::PathBuf,
    key: ProviderKey,
}

impl LocalFileProvider {
    /// Creates a provider rooted at `root`, which must be an existing directory.
    pub fn new(root: impl AsRef<std::path::Path>) -> io::Result<Self> {
        let root = fs::canonicalize(root)?;
        if !fs::metadata(&root)?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", root.display()),
            ));
        }
        let key = ProviderKey::from_uuid(uuid::Uuid::new_v5(
            &uuid::Uuid::NAMESPACE_URL,
            root.as_os_str().as_encoded_bytes(),
        ));

        Ok(Self { root, key })
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn host_path(&self, path: &Path) -> std::path::PathBuf {
        path.to_host_path(&self.root)
    }
}

fn attributes_from_metadata(metadata: &fs::Metadata) -> FileAttributes {
    let kind = if metadata.is_dir() {
        FileKind::Directory
    } else if metadata.is_file() {
        FileKind::File
    } else {
        FileKind::Other
    };
    let modified_millis = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    FileAttributes {
        kind,
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        modified_millis,
    }
}

impl FileProvider for LocalFileProvider {
    fn provider_key(&self) -> ProviderKey {
        self.key
    }

    fn attributes(&self, path: &Path) -> io::Result<FileAttributes> {
        Ok(attributes_from_metadata(&fs::metadata(self.host_path(path))?))
    }

    fn open_input(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(fs::File::open(self.host_path(path))?))
    }

    fn open_output(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(fs::File::create(self.host_path(path))?))
    }

    fn read_all_bytes(&self, path: &Path) -> io::Result<bytes::Bytes> {
        Ok(fs::read(self.host_path(path))?.into())
    }

    fn set_file_bytes(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        fs::write(self.host_path(path), data)
    }

    fn list_directory(&self, path: &Path) -> io::Result<BTreeMap<PathComponent, FileAttributes>> {
        let mut result = BTreeMap::new();
        for entry in fs::read_dir(self.host_path(path))? {
            let entry = entry?;
            let name = match PathComponent::try_from(entry.file_name().as_os_str()) {
                Ok(name) => name,
                Err(e) => {
                    warn!(err = %e, name = ?entry.file_name(), "skipping unrepresentable entry");
                    continue;
                }
            };
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                // removed concurrently
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            result.insert(name, attributes_from_metadata(&metadata));
        }
        Ok(result)
    }

    #[instrument(skip(self), fields(path = %path), err)]
    fn list_directory_recursive(
        &self,
        path: &Path,
    ) -> io::Result<BTreeMap<PathBuf, FileAttributes>> {
        let base = self.host_path(path);
        let mut result = BTreeMap::new();
        for entry in WalkDir::new(&base).min_depth(1).follow_links(false) {
            let entry = entry.map_err(io::Error::from)?;
            let rel = entry
                .path()
                .strip_prefix(&base)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            let rel = match PathBuf::from_host_path(rel) {
                Ok(rel) => rel,
                Err(e) => {
                    warn!(err = %e, path = %entry.path().display(), "skipping unrepresentable entry");
                    continue;
                }
            };
            result.insert(rel, attributes_from_metadata(&entry.metadata().map_err(io::Error::from)?));
        }
        Ok(result)
    }

    fn delete_recursively(&self, path: &Path) -> io::Result<()> {
        let host_path = self.host_path(path);
        let metadata = match fs::symlink_metadata(&host_path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if metadata.is_dir() {
            fs::remove_dir_all(host_path)
        } else {
            fs::remove_file(host_path)
        }
    }

    fn create_directories(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(self.host_path(path))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tempfile::TempDir;

    use super::LocalFileProvider;
    use crate::path::PathBuf;
    use crate::provider::{FileKind, FileProvider};

    #[rstest]
    fn same_root_same_key() {
        let tmpdir = TempDir::new().unwrap();
        let a = LocalFileProvider::new(tmpdir.path()).unwrap();
        let b = LocalFileProvider::new(tmpdir.path().join(".")).unwrap();
        assert_eq!(a.provider_key(), b.provider_key());

        let other = TempDir::new().unwrap();
        assert_ne!(
            a.provider_key(),
            LocalFileProvider::new(other.path()).unwrap().provider_key()
        );
    }

    #[rstest]
    fn write_list_delete() {
        let tmpdir = TempDir::new().unwrap();
        let provider = LocalFileProvider::new(tmpdir.path()).unwrap();
        let dir: PathBuf = "dir".parse().unwrap();
        let file: PathBuf = "dir/file".parse().unwrap();

        provider.create_directories(&dir).unwrap();
        provider.set_file_bytes(&file, b"content").unwrap();

        let listing = provider.list_directory(&dir).unwrap();
        assert_eq!(1, listing.len());
        let attrs = listing.values().next().unwrap();
        assert_eq!(FileKind::File, attrs.kind);
        assert_eq!(7, attrs.size);

        let recursive = provider.list_directory_recursive(&PathBuf::new()).unwrap();
        assert_eq!(vec![dir.clone(), file.clone()], recursive.into_keys().collect::<Vec<_>>());

        provider.delete_recursively(&dir).unwrap();
        assert!(!tmpdir.path().join("dir").exists());
        // deleting again is fine
        provider.delete_recursively(&dir).unwrap();
    }
}
