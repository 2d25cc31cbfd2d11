use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::{self, Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{instrument, trace};

use super::{FileAttributes, FileKind, FileProvider, ProviderKey};
use crate::path::{Path, PathBuf, PathComponent};

#[derive(Clone, Debug)]
enum Entry {
    File { data: Bytes, modified: i64 },
    Directory { modified: i64 },
}

impl Entry {
    fn attributes(&self) -> FileAttributes {
        match self {
            Entry::File { data, modified } => FileAttributes {
                kind: FileKind::File,
                size: data.len() as u64,
                modified_millis: *modified,
            },
            Entry::Directory { modified } => FileAttributes {
                kind: FileKind::Directory,
                size: 0,
                modified_millis: *modified,
            },
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: RwLock<BTreeMap<PathBuf, Entry>>,
    /// Logical clock used as modification time.
    clock: AtomicI64,
    writes: AtomicUsize,
    read_only: AtomicBool,
    unavailable: AtomicBool,
}

/// A [FileProvider] keeping all of its contents in memory.
///
/// The root directory always exists. Modification times come from a logical
/// clock, so every write produces distinct attributes.
/// All clones share the same contents.
#[derive(Clone)]
pub struct MemoryFileProvider {
    key: ProviderKey,
    inner: Arc<Inner>,
}

impl Default for MemoryFileProvider {
    fn default() -> Self {
        Self::new(ProviderKey::from_uuid(uuid::Uuid::new_v4()))
    }
}

impl MemoryFileProvider {
    pub fn new(key: ProviderKey) -> Self {
        Self {
            key,
            inner: Default::default(),
        }
    }

    /// Number of files opened for writing so far.
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// While set, every attempt to write a file fails with
    /// [io::ErrorKind::PermissionDenied].
    pub fn set_read_only(&self, read_only: bool) {
        self.inner.read_only.store(read_only, Ordering::SeqCst);
    }

    /// While set, every read fails with [io::ErrorKind::Other], like a
    /// store that is temporarily unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> io::Result<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "provider is unavailable"));
        }
        Ok(())
    }

    fn tick(&self) -> i64 {
        self.inner.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn get(&self, path: &Path) -> Option<Entry> {
        if path.is_root() {
            return Some(Entry::Directory { modified: 0 });
        }
        self.inner.entries.read().get(path).cloned()
    }

    fn ensure_parent_directory(&self, path: &Path) -> io::Result<()> {
        match path.parent().and_then(|parent| self.get(parent)) {
            Some(Entry::Directory { .. }) => Ok(()),
            Some(Entry::File { .. }) => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("parent of {} is not a directory", path),
            )),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("parent of {} does not exist", path),
            )),
        }
    }

    fn commit(&self, path: &Path, data: Vec<u8>) {
        let modified = self.tick();
        self.inner.entries.write().insert(
            path.to_owned(),
            Entry::File {
                data: data.into(),
                modified,
            },
        );
    }
}

/// Buffers written data, and stores it in the provider when dropped.
/// Flushing doesn't publish anything, so every write ticks the clock once.
struct MemoryFileWriter {
    provider: MemoryFileProvider,
    path: PathBuf,
    buf: Vec<u8>,
}

impl Write for MemoryFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MemoryFileWriter {
    fn drop(&mut self) {
        self.provider.commit(&self.path, std::mem::take(&mut self.buf));
    }
}

impl FileProvider for MemoryFileProvider {
    fn provider_key(&self) -> ProviderKey {
        self.key
    }

    fn attributes(&self, path: &Path) -> io::Result<FileAttributes> {
        self.check_available()?;
        self.get(path)
            .map(|e| e.attributes())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))
    }

    fn open_input(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.read_all_bytes(path)?)))
    }

    fn read_all_bytes(&self, path: &Path) -> io::Result<Bytes> {
        self.check_available()?;
        match self.get(path) {
            Some(Entry::File { data, .. }) => Ok(data),
            Some(Entry::Directory { .. }) => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is a directory", path),
            )),
            None => Err(io::Error::new(io::ErrorKind::NotFound, path.to_string())),
        }
    }

    #[instrument(skip(self), fields(path = %path), err)]
    fn open_output(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        if self.inner.read_only.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "provider is read-only",
            ));
        }
        self.ensure_parent_directory(path)?;
        if let Some(Entry::Directory { .. }) = self.get(path) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} is a directory", path),
            ));
        }
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        trace!("opened for writing");

        Ok(Box::new(MemoryFileWriter {
            provider: self.clone(),
            path: path.to_owned(),
            buf: Vec::new(),
        }))
    }

    fn list_directory(&self, path: &Path) -> io::Result<BTreeMap<PathComponent, FileAttributes>> {
        self.check_available()?;
        match self.get(path) {
            Some(Entry::Directory { .. }) => {}
            Some(Entry::File { .. }) => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("{} is not a directory", path),
                ))
            }
            None => return Err(io::Error::new(io::ErrorKind::NotFound, path.to_string())),
        }

        let entries = self.inner.entries.read();
        Ok(entries
            .iter()
            .filter_map(|(p, e)| {
                let rest = p.strip_prefix(path)?;
                if rest.name_count() != 1 {
                    return None;
                }
                Some((rest.file_name()?, e.attributes()))
            })
            .collect())
    }

    fn delete_recursively(&self, path: &Path) -> io::Result<()> {
        let mut entries = self.inner.entries.write();
        entries.retain(|p, _| !p.starts_with(path));
        Ok(())
    }

    fn create_directories(&self, path: &Path) -> io::Result<()> {
        let mut current = PathBuf::new();
        for name in path.components() {
            current.push(&name);
            match self.get(&current) {
                Some(Entry::Directory { .. }) => {}
                Some(Entry::File { .. }) => {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        format!("{} is not a directory", current),
                    ))
                }
                None => {
                    let modified = self.tick();
                    self.inner
                        .entries
                        .write()
                        .insert(current.clone(), Entry::Directory { modified });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::MemoryFileProvider;
    use crate::path::PathBuf;
    use crate::provider::FileProvider;

    #[test]
    fn write_and_read() {
        let provider = MemoryFileProvider::default();
        let path: PathBuf = "hello.txt".parse().unwrap();

        let mut out = provider.open_output(&path).expect("must open");
        out.write_all(b"Hello World!").unwrap();
        drop(out);

        assert_eq!(1, provider.write_count());
        assert_eq!(
            &b"Hello World!"[..],
            &provider.read_all_bytes(&path).unwrap()[..]
        );
        assert_eq!(12, provider.attributes(&path).unwrap().size);
    }

    #[test]
    fn missing_parent() {
        let provider = MemoryFileProvider::default();
        let err = provider
            .set_file_bytes(&"a/b".parse::<PathBuf>().unwrap(), b"")
            .expect_err("must fail");
        assert_eq!(std::io::ErrorKind::NotFound, err.kind());
    }

    #[test]
    fn read_only() {
        let provider = MemoryFileProvider::default();
        provider.set_read_only(true);
        assert!(provider
            .set_file_bytes(&"a".parse::<PathBuf>().unwrap(), b"")
            .is_err());
        assert_eq!(0, provider.write_count());
    }

    #[test]
    fn one_tick_per_write() {
        let provider = MemoryFileProvider::default();
        let a: PathBuf = "a".parse().unwrap();
        let b: PathBuf = "b".parse().unwrap();
        provider.set_file_bytes(&a, b"1").unwrap();
        let before = provider.attributes(&a).unwrap().modified_millis;

        let mut out = provider.open_output(&a).unwrap();
        out.write_all(b"22").unwrap();
        out.flush().unwrap();
        // flushing doesn't publish.
        assert_eq!(&b"1"[..], &provider.read_all_bytes(&a).unwrap()[..]);
        out.flush().unwrap();
        drop(out);

        let after = provider.attributes(&a).unwrap();
        assert_eq!(2, after.size);
        assert_eq!(before + 1, after.modified_millis);

        provider.set_file_bytes(&b, b"3").unwrap();
        assert_eq!(
            after.modified_millis + 1,
            provider.attributes(&b).unwrap().modified_millis
        );
    }

    #[test]
    fn unavailable() {
        let provider = MemoryFileProvider::default();
        let path: PathBuf = "a".parse().unwrap();
        provider.set_file_bytes(&path, b"1").unwrap();

        provider.set_unavailable(true);
        let err = provider.attributes(&path).expect_err("must fail");
        assert_eq!(std::io::ErrorKind::Other, err.kind());
        assert!(provider.read_all_bytes(&path).is_err());
        assert!(provider.list_directory(&PathBuf::new()).is_err());

        provider.set_unavailable(false);
        assert!(provider.attributes(&path).is_ok());
    }

    #[test]
    fn modification_changes_attributes() {
        let provider = MemoryFileProvider::default();
        let path: PathBuf = "a".parse().unwrap();
        provider.set_file_bytes(&path, b"1").unwrap();
        let first = provider.attributes(&path).unwrap();
        provider.set_file_bytes(&path, b"2").unwrap();
        assert!(first.changed(&provider.attributes(&path).unwrap()));
    }
}
