//! The content database remembers what the build put at each location, and
//! what the disk looked like afterwards. It decides whether a location needs
//! to be written, and serializes all writes to a location.
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{btree_map, hash_map, BTreeMap, BTreeSet, HashMap};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::content::{ContentDescriptor, ContentDescriptorSupplier};
use crate::path::{self, Path, PathBuf, PathComponent};
use crate::provider::{
    FileAttributes, FileKind, FileProvider, PathKey, ProviderKey, ProviderPathKey,
    WriteRequestFlags, WriteRequestResult,
};
use crate::Error;

mod config;
mod handle;
mod protection;
mod snapshot;

pub use config::{DatabaseConfig, SupplierKind};
pub use handle::{ContentHandle, ExpectedContent};
pub use protection::{WritePrompter, WriteProtection};

/// Performs the actual write of some contents to their location.
pub trait ContentUpdater: Send + Sync {
    /// Writes the contents to their location.
    fn update(&self) -> Result<(), Error>;

    /// Writes the contents to their location, and optionally copies them into
    /// `sink` at the same time.
    ///
    /// Returns true if `sink` received the full contents. If only writing to
    /// `sink` failed, [Error::SecondaryStream] is returned after the location
    /// was written.
    fn update_with_stream(&self, _sink: &mut dyn Write) -> Result<bool, Error> {
        self.update()?;
        Ok(false)
    }
}

/// Writes into a primary sink, and an optional secondary one.
/// Failures of the secondary sink are recorded, and it is not written to
/// anymore afterwards.
pub(crate) struct TeeWriter<P, S> {
    pub(crate) primary: P,
    secondary: Option<S>,
    pub(crate) secondary_error: Option<io::Error>,
}

impl<P: Write, S: Write> TeeWriter<P, S> {
    pub(crate) fn new(primary: P, secondary: Option<S>) -> Self {
        Self {
            primary,
            secondary,
            secondary_error: None,
        }
    }
}

impl<P: Write, S: Write> Write for TeeWriter<P, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.primary.write_all(buf)?;
        if let Some(secondary) = self.secondary.as_mut() {
            if let Err(e) = secondary.write_all(buf) {
                self.secondary = None;
                self.secondary_error = Some(e);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.primary.flush()?;
        if let Some(secondary) = self.secondary.as_mut() {
            if let Err(e) = secondary.flush() {
                self.secondary = None;
                self.secondary_error = Some(e);
            }
        }
        Ok(())
    }
}

type HandleMap = BTreeMap<PathBuf, Arc<ContentHandle>>;

struct Inner {
    config: DatabaseConfig,
    handles: RwLock<HashMap<ProviderKey, HandleMap>>,
    /// Entries loaded from the snapshot, whose provider was not used yet.
    dormant: Mutex<HashMap<ProviderKey, Vec<(PathBuf, ExpectedContent)>>>,
    /// One lock per location, created lazily and never removed.
    path_locks: Mutex<HashMap<PathKey, Arc<Mutex<()>>>>,
    dirty: AtomicBool,
    track_attributes: AtomicBool,
    task_results: Mutex<Bytes>,
    protection: RwLock<Option<Arc<WriteProtection>>>,
    /// Serializes access to the snapshot file.
    io_lock: Mutex<()>,
}

/// Registry of [ContentHandle]s, keyed by location.
///
/// Clones share the same state.
#[derive(Clone)]
pub struct ContentDatabase {
    inner: Arc<Inner>,
}

impl ContentDatabase {
    /// Opens a database with the given config, loading its snapshot if one
    /// is configured. An unreadable snapshot yields an empty database.
    #[instrument(skip_all, fields(snapshot = ?config.snapshot))]
    pub fn open(config: DatabaseConfig) -> Self {
        let mut dormant = HashMap::new();
        let mut task_results = Bytes::new();
        if let Some(path) = &config.snapshot {
            let loaded = snapshot::read(path);
            for (provider, entries) in loaded.groups {
                dormant
                    .entry(provider)
                    .or_insert_with(Vec::new)
                    .extend(entries);
            }
            task_results = loaded.task_results;
            debug!(providers = dormant.len(), "loaded snapshot");
        }

        let track_attributes = config.track_attributes;
        Self {
            inner: Arc::new(Inner {
                config,
                handles: Default::default(),
                dormant: Mutex::new(dormant),
                path_locks: Default::default(),
                dirty: AtomicBool::new(false),
                track_attributes: AtomicBool::new(track_attributes),
                task_results: Mutex::new(task_results),
                protection: Default::default(),
                io_lock: Default::default(),
            }),
        }
    }

    /// A database which is not persisted, and uses the default suppliers.
    pub fn in_memory() -> Self {
        Self::open(DatabaseConfig::default())
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    pub fn is_persisting(&self) -> bool {
        self.inner.config.snapshot.is_some()
    }

    /// Returns true if the configured snapshot file exists.
    pub fn is_snapshot_present(&self) -> bool {
        self.inner
            .config
            .snapshot
            .as_ref()
            .is_some_and(|p| p.is_file())
    }

    pub fn set_protection(&self, protection: Option<WriteProtection>) {
        *self.inner.protection.write() = protection.map(Arc::new);
    }

    pub fn set_track_attributes(&self, track: bool) {
        self.inner.track_attributes.store(track, Ordering::SeqCst);
    }

    fn track_attributes(&self) -> bool {
        self.inner.track_attributes.load(Ordering::SeqCst)
    }

    pub fn task_results(&self) -> Bytes {
        self.inner.task_results.lock().clone()
    }

    pub fn set_task_results(&self, task_results: Bytes) {
        *self.inner.task_results.lock() = task_results;
        self.set_dirty();
    }

    fn set_dirty(&self) {
        self.inner.dirty.store(true, Ordering::SeqCst);
    }

    fn supplier_for(&self, provider: &ProviderKey) -> Arc<dyn ContentDescriptorSupplier> {
        self.inner.config.supplier_for(provider).build()
    }

    /// Turns snapshot entries of a provider into handles, now that the
    /// provider is known.
    fn adopt_dormant(&self, provider: &Arc<dyn FileProvider>) -> HandleMap {
        let provider_key = provider.provider_key();
        let Some(entries) = self.inner.dormant.lock().remove(&provider_key) else {
            return HandleMap::new();
        };
        let supplier = self.supplier_for(&provider_key);
        entries
            .into_iter()
            .map(|(path, expected)| {
                let key = ProviderPathKey::new(provider.clone(), path.clone());
                let handle = ContentHandle::with_expected(key, supplier.clone(), expected);
                (path, Arc::new(handle))
            })
            .collect()
    }

    /// Returns the handle for `key`, creating it if needed.
    pub fn handle(&self, key: &ProviderPathKey) -> Arc<ContentHandle> {
        let provider_key = key.key().provider;
        {
            let handles = self.inner.handles.read();
            if let Some(handle) = handles.get(&provider_key).and_then(|m| m.get(key.path())) {
                return handle.clone();
            }
        }

        let mut handles = self.inner.handles.write();
        let group = match handles.entry(provider_key) {
            hash_map::Entry::Occupied(e) => e.into_mut(),
            hash_map::Entry::Vacant(e) => e.insert(self.adopt_dormant(key.provider())),
        };
        match group.entry(key.path().to_owned()) {
            btree_map::Entry::Occupied(e) => e.get().clone(),
            btree_map::Entry::Vacant(e) => e
                .insert(Arc::new(ContentHandle::new(
                    key.clone(),
                    self.supplier_for(&provider_key),
                )))
                .clone(),
        }
    }

    fn handle_if_present(&self, key: &PathKey) -> Option<Arc<ContentHandle>> {
        self.inner
            .handles
            .read()
            .get(&key.provider)
            .and_then(|m| m.get(&key.path))
            .cloned()
    }

    fn path_lock(&self, key: &PathKey) -> Arc<Mutex<()>> {
        self.inner
            .path_locks
            .lock()
            .entry(key.clone())
            .or_default()
            .clone()
    }

    fn check_write_enabled(&self, key: &PathKey) -> Result<(), Error> {
        let protection = self.inner.protection.read().clone();
        match protection {
            Some(protection) => protection.check(&key.provider, &key.path),
            None => Ok(()),
        }
    }

    fn attributes_if_tracked(&self, key: &ProviderPathKey) -> io::Result<Option<FileAttributes>> {
        if !self.track_attributes() {
            return Ok(None);
        }
        Ok(Some(key.provider().attributes(key.path())?))
    }

    /// Computes the current disk contents of a location, through the
    /// attributes if those are tracked.
    fn describe_disk(
        &self,
        handle: &ContentHandle,
        key: &ProviderPathKey,
    ) -> io::Result<(ContentDescriptor, Option<FileAttributes>)> {
        match self.attributes_if_tracked(key)? {
            Some(attrs) => Ok((handle.supplier().get_using_attributes(key, &attrs)?, Some(attrs))),
            None => Ok((handle.supplier().get(key)?, None)),
        }
    }

    /// Returns the content at `key`, or None if there's nothing there.
    pub fn content_descriptor(&self, key: &ProviderPathKey) -> Option<ContentDescriptor> {
        self.handle(key).content().map(|cd| (*cd).clone())
    }

    /// Like [Self::content_descriptor], but doesn't start tracking `key`.
    pub fn content_descriptor_if_present(&self, key: &PathKey) -> Option<ContentDescriptor> {
        self.handle_if_present(key)?.content().map(|cd| (*cd).clone())
    }

    /// Writes `content` to its location, unless it's already there.
    #[instrument(skip_all, fields(key = %key, content = %content), err)]
    pub fn synchronize(
        &self,
        key: &ProviderPathKey,
        content: ContentDescriptor,
        updater: &dyn ContentUpdater,
    ) -> Result<(), Error> {
        let handle = self.handle(key);
        if !content.changed(handle.content().as_deref()) {
            return Ok(());
        }

        let lock = self.path_lock(key.key());
        let _guard = lock.lock();
        // check again, someone might have written it in the meantime.
        if !content.changed(handle.content().as_deref()) {
            return Ok(());
        }
        self.execute_synchronize_locked(&handle, key, Arc::new(content), updater, None)
    }

    /// Decides now whether `content` needs to be written, but defers the
    /// actual write. Returns None if it's already up to date.
    pub fn synchronize_deferred(
        &self,
        key: &ProviderPathKey,
        content: ContentDescriptor,
        updater: Box<dyn ContentUpdater>,
    ) -> Option<DeferredSynchronizer> {
        let handle = self.handle(key);
        let current = handle.content();
        if !content.changed(current.as_deref()) {
            return None;
        }
        Some(DeferredSynchronizer {
            db: self.clone(),
            handle,
            key: key.clone(),
            content: Arc::new(content),
            updater,
            identity: Mutex::new(Some(current)),
        })
    }

    /// Performs the write, and records the new state.
    /// Must be called with the path lock of `key` held.
    fn execute_synchronize_locked(
        &self,
        handle: &ContentHandle,
        key: &ProviderPathKey,
        content: Arc<ContentDescriptor>,
        updater: &dyn ContentUpdater,
        sink: Option<&mut dyn Write>,
    ) -> Result<(), Error> {
        self.check_write_enabled(key.key())?;
        self.set_dirty();

        let mut secondary_error = None;
        match self.write_and_describe(handle, key, updater, sink, &mut secondary_error) {
            Ok((disk, attrs)) => {
                debug!(disk = %disk, "synchronized");
                handle.set_content(content, disk, attrs);
            }
            Err(e) => {
                handle.invalidate();
                return Err(e);
            }
        }

        match secondary_error {
            Some(e) => Err(Error::SecondaryStream(e)),
            None => Ok(()),
        }
    }

    fn write_and_describe(
        &self,
        handle: &ContentHandle,
        key: &ProviderPathKey,
        updater: &dyn ContentUpdater,
        mut sink: Option<&mut dyn Write>,
        secondary_error: &mut Option<io::Error>,
    ) -> Result<(ContentDescriptor, Option<FileAttributes>), Error> {
        let supplier = handle.supplier();

        let streamed = match supplier.calculating_output() {
            Some(calc) => {
                // the tee borrows the sink, which is needed again below.
                let (calc, calculated, tee_error) = {
                    let mut tee = TeeWriter::new(calc, sink.as_deref_mut());
                    let calculated = match updater.update_with_stream(&mut tee) {
                        Ok(calculated) => calculated,
                        Err(Error::SecondaryStream(e)) => {
                            *secondary_error = Some(e);
                            false
                        }
                        Err(e) => return Err(e),
                    };
                    (tee.primary, calculated, tee.secondary_error)
                };
                if let Some(e) = tee_error {
                    *secondary_error = Some(e);
                }
                if calculated {
                    let disk = supplier.calculated_output(key, calc)?;
                    return Ok((disk, self.attributes_if_tracked(key)?));
                }
                calculated
            }
            None => match sink.as_deref_mut() {
                Some(sink) => match updater.update_with_stream(sink) {
                    Ok(streamed) => streamed,
                    Err(Error::SecondaryStream(e)) => {
                        *secondary_error = Some(e);
                        true
                    }
                    Err(e) => return Err(e),
                },
                None => {
                    updater.update()?;
                    true
                }
            },
        };

        let described = self.describe_disk(handle, key)?;

        // the sink didn't receive the contents yet, serve them from disk.
        if let Some(sink) = sink {
            if !streamed && secondary_error.is_none() {
                if let Err(e) = key.provider().write_to(key.path(), sink) {
                    *secondary_error = Some(e);
                }
            }
        }

        Ok(described)
    }

    /// Makes sure `content` is at `key`, and opens it for reading.
    #[instrument(skip_all, fields(key = %key), err)]
    pub fn open_input_with_content_or_synchronize(
        &self,
        key: &ProviderPathKey,
        content: ContentDescriptor,
        updater: &dyn ContentUpdater,
    ) -> Result<Box<dyn Read + Send>, Error> {
        let handle = self.handle(key);
        let lock = self.path_lock(key.key());
        let _guard = lock.lock();

        if content.changed(handle.content().as_deref()) {
            self.execute_synchronize_locked(&handle, key, Arc::new(content), updater, None)?;
        }
        Ok(key.provider().open_input(key.path())?)
    }

    /// Makes sure `content` is at `key`, and copies it into `sink`.
    ///
    /// If the contents need to be written, they are copied into `sink` while
    /// being written, if possible.
    #[instrument(skip_all, fields(key = %key), err)]
    pub fn write_to_with_content_or_synchronize(
        &self,
        key: &ProviderPathKey,
        content: ContentDescriptor,
        sink: &mut dyn Write,
        updater: &dyn ContentUpdater,
    ) -> Result<(), Error> {
        let handle = self.handle(key);
        let lock = self.path_lock(key.key());
        let _guard = lock.lock();

        if !content.changed(handle.content().as_deref()) {
            key.provider().write_to(key.path(), sink)?;
            return Ok(());
        }
        self.execute_synchronize_locked(&handle, key, Arc::new(content), updater, Some(sink))
    }

    /// Makes sure `content` is at `key`, and returns it.
    #[instrument(skip_all, fields(key = %key), err)]
    pub fn get_bytes_with_content_or_synchronize(
        &self,
        key: &ProviderPathKey,
        content: ContentDescriptor,
        updater: &dyn ContentUpdater,
    ) -> Result<Bytes, Error> {
        let handle = self.handle(key);
        let lock = self.path_lock(key.key());
        let _guard = lock.lock();

        if !content.changed(handle.content().as_deref()) {
            return Ok(key.provider().read_all_bytes(key.path())?);
        }
        let mut buf = Vec::new();
        self.execute_synchronize_locked(&handle, key, Arc::new(content), updater, Some(&mut buf))?;
        Ok(buf.into())
    }

    /// Copies the contents at `key` into `sink`, if they are exactly
    /// `content`. Returns the number of bytes copied, or None if the
    /// contents differ.
    pub fn write_to_with_exact_content(
        &self,
        key: &ProviderPathKey,
        content: &ContentDescriptor,
        sink: &mut dyn Write,
    ) -> Result<Option<u64>, Error> {
        let handle = self.handle(key);
        let lock = self.path_lock(key.key());
        let _guard = lock.lock();

        if handle.content().as_deref() != Some(content) {
            return Ok(None);
        }
        Ok(Some(key.provider().write_to(key.path(), sink)?))
    }

    /// Records that `content` is already at `key`, as observed on disk.
    /// Fails if there's nothing, or a directory at `key`.
    #[instrument(skip_all, fields(key = %key), err)]
    pub fn discover(
        &self,
        key: &ProviderPathKey,
        content: ContentDescriptor,
    ) -> Result<Arc<ContentHandle>, Error> {
        let handle = self.handle(key);
        let lock = self.path_lock(key.key());
        let _guard = lock.lock();

        let (disk, attrs) = self.describe_disk(&handle, key)?;
        if disk == ContentDescriptor::Directory {
            return Err(Error::InvalidFileType(format!(
                "expected a file, found a directory at {}",
                key
            )));
        }
        handle.set_content(Arc::new(content), disk, attrs);
        self.set_dirty();
        Ok(handle)
    }

    /// Reads the attributes of `key`, and primes its handle with them.
    pub fn discover_file_attributes(
        &self,
        key: &ProviderPathKey,
    ) -> Result<(Arc<ContentHandle>, FileAttributes), Error> {
        let attrs = key.provider().attributes(key.path())?;
        let handle = self.handle(key);
        let tracked = self.track_attributes().then_some(attrs);
        handle.discover_attributes(&attrs, tracked);
        Ok((handle, attrs))
    }

    /// Lists the directory at `key`, and primes the handles of its children.
    #[instrument(skip_all, fields(key = %key), err)]
    pub fn discover_directory_children_attributes(
        &self,
        key: &ProviderPathKey,
    ) -> Result<BTreeMap<PathComponent, (Arc<ContentHandle>, FileAttributes)>, Error> {
        let listing = key.provider().list_directory(key.path())?;
        let track = self.track_attributes();
        Ok(listing
            .into_iter()
            .map(|(name, attrs)| {
                let handle = self.handle(&key.child(&name));
                handle.discover_attributes(&attrs, track.then_some(attrs));
                (name, (handle, attrs))
            })
            .collect())
    }

    fn for_each_in_subtree(
        &self,
        key: &PathKey,
        include_self: bool,
        f: impl Fn(&ContentHandle),
    ) {
        let handles = self.inner.handles.read();
        if let Some(group) = handles.get(&key.provider) {
            for (_, handle) in path::subtree(group, &key.path, include_self) {
                f(handle.as_ref());
            }
        }
    }

    /// Forgets the disk contents at `key` and everything below it.
    pub fn invalidate(&self, key: &PathKey) {
        self.for_each_in_subtree(key, true, ContentHandle::invalidate);
    }

    /// Forgets everything known at `key` and below it.
    pub fn invalidate_hard(&self, key: &PathKey) {
        self.for_each_in_subtree(key, true, ContentHandle::invalidate_hard);
        self.set_dirty();
    }

    /// Invalidates `key` and everything below it, then returns the content
    /// at `key`.
    pub fn invalidate_content_descriptor(
        &self,
        key: &ProviderPathKey,
    ) -> Option<ContentDescriptor> {
        self.invalidate(key.key());
        self.content_descriptor(key)
    }

    pub fn invalidate_all(&self) {
        let handles = self.inner.handles.read();
        for handle in handles.values().flat_map(|m| m.values()) {
            handle.invalidate();
        }
    }

    fn ensure_tracking(&self) -> Result<(), Error> {
        if !self.track_attributes() {
            return Err(Error::InvalidState(
                "handle attributes are not tracked".to_string(),
            ));
        }
        Ok(())
    }

    /// Invalidates the handle at `path` if its contents changed, judging by
    /// the new attributes of the entry.
    pub fn invalidate_entry(
        &self,
        provider: &ProviderKey,
        path: &Path,
        attrs: &FileAttributes,
    ) -> Result<(), Error> {
        self.ensure_tracking()?;
        let handles = self.inner.handles.read();
        let Some(group) = handles.get(provider) else {
            return Ok(());
        };

        if attrs.is_directory() {
            // only the entry itself, children are checked separately.
            if let Some(handle) = group.get(path) {
                handle.invalidate();
            }
            return Ok(());
        }

        match group.get(path) {
            None => {
                // the entry is a file now, so nothing can be below it.
                for (_, handle) in path::subtree(group, path, false) {
                    handle.invalidate();
                }
            }
            Some(handle) => {
                if let Some(known) = handle.attributes() {
                    if !attrs.changed(&known) {
                        return Ok(());
                    }
                }
                for (_, handle) in path::subtree(group, path, true) {
                    handle.invalidate();
                }
                handle.set_disk_attributes(Some(*attrs));
            }
        }
        Ok(())
    }

    /// Invalidates the handles below the directory `dir`, using the new
    /// attributes of its direct children.
    pub fn invalidate_entries(
        &self,
        provider: &ProviderKey,
        dir: &Path,
        children: &BTreeMap<PathComponent, FileAttributes>,
    ) -> Result<(), Error> {
        self.ensure_tracking()?;
        let handles = self.inner.handles.read();
        let Some(group) = handles.get(provider) else {
            return Ok(());
        };

        // direct children come before their descendants.
        let mut changed = BTreeSet::new();
        for (path, handle) in path::subtree(group, dir, false) {
            let Some(rest) = path.strip_prefix(dir) else {
                continue;
            };
            let Some(name) = rest.components().next() else {
                continue;
            };
            let attrs = children.get(&name);

            if rest.name_count() == 1 {
                if let (Some(attrs), Some(known)) = (attrs, handle.attributes()) {
                    if !attrs.changed(&known) {
                        continue;
                    }
                }
                handle.set_disk_attributes(attrs.copied());
                changed.insert(name);
            } else if changed.contains(&name) || !attrs.is_some_and(|a| a.is_directory()) {
                // the parent changed, is gone, or became a file.
                handle.invalidate();
            }
        }
        Ok(())
    }

    /// Invalidates exactly the given tracked paths.
    pub fn recheck_content_changes(&self, paths: &HashMap<ProviderKey, BTreeSet<PathBuf>>) {
        let handles = self.inner.handles.read();
        for (provider, paths) in paths {
            let Some(group) = handles.get(provider) else {
                continue;
            };
            for path in paths {
                if let Some(handle) = group.get(path) {
                    handle.invalidate();
                }
            }
        }
    }

    pub fn tracked_provider_keys(&self) -> BTreeSet<ProviderKey> {
        self.inner.handles.read().keys().copied().collect()
    }

    pub fn tracked_paths(&self, provider: &ProviderKey) -> BTreeSet<PathBuf> {
        self.inner
            .handles
            .read()
            .get(provider)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Deletes the children of the directory at `key` which are not in
    /// `keep`, and invalidates their handles.
    #[instrument(skip_all, fields(key = %key), err)]
    pub fn delete_children_if_not_in(
        &self,
        key: &ProviderPathKey,
        keep: &BTreeSet<PathComponent>,
    ) -> Result<(), Error> {
        self.check_write_enabled(key.key())?;
        let deleted = key
            .provider()
            .delete_children_recursively_if_not_in(key.path(), keep)?;
        for name in &deleted {
            self.invalidate(key.child(name).key());
        }
        if !deleted.is_empty() {
            debug!(count = deleted.len(), "deleted stray children");
        }
        Ok(())
    }

    fn ensure_directory_locked(&self, key: &ProviderPathKey) -> Result<(), Error> {
        let result = key.provider().ensure_write_request(
            key.path(),
            FileKind::Directory,
            WriteRequestFlags::DELETE_INTERMEDIATE,
        )?;
        if result.contains(WriteRequestResult::FILES_DELETED) {
            self.invalidate(key.key());
        }
        Ok(())
    }

    /// Makes sure there's a directory at `key`.
    pub fn create_directory_at_path(&self, key: &ProviderPathKey) -> Result<(), Error> {
        self.check_write_enabled(key.key())?;
        let lock = self.path_lock(key.key());
        let _guard = lock.lock();
        self.ensure_directory_locked(key)
    }

    /// Makes sure there's a directory at `key`, then calls `f` while still
    /// holding the lock of `key`.
    pub fn synchronize_directory<T>(
        &self,
        key: &ProviderPathKey,
        f: impl FnOnce() -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.check_write_enabled(key.key())?;
        let lock = self.path_lock(key.key());
        let _guard = lock.lock();
        self.ensure_directory_locked(key)?;
        f()
    }

    /// Persists the database, if anything changed since the last flush.
    #[instrument(skip_all, err)]
    pub fn flush(&self) -> Result<(), Error> {
        let Some(path) = &self.inner.config.snapshot else {
            return Ok(());
        };
        let _io_guard = self.inner.io_lock.lock();
        if !self.inner.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut data = snapshot::Snapshot {
            groups: Vec::new(),
            task_results: self.task_results(),
        };
        {
            let handles = self.inner.handles.read();
            for (provider, group) in handles.iter() {
                let entries: Vec<_> = group
                    .iter()
                    .filter_map(|(path, handle)| Some((path.clone(), handle.expected()?)))
                    .collect();
                data.groups.push((*provider, entries));
            }
        }
        for (provider, entries) in self.inner.dormant.lock().iter() {
            data.groups.push((*provider, entries.clone()));
        }

        if let Err(e) = snapshot::write(path, &data) {
            self.set_dirty();
            return Err(e.into());
        }
        Ok(())
    }

    /// Flushes the database. Equivalent to [Self::flush], but consumes this
    /// instance.
    pub fn close(self) -> Result<(), Error> {
        self.flush()
    }

    /// Forgets everything, and deletes the snapshot.
    pub fn clean(&self) {
        let _io_guard = self.inner.io_lock.lock();
        self.set_dirty();
        self.inner.handles.write().clear();
        self.inner.dormant.lock().clear();
        *self.inner.task_results.lock() = Bytes::new();

        let Some(path) = &self.inner.config.snapshot else {
            return;
        };
        match std::fs::remove_file(path) {
            Ok(()) => self.inner.dirty.store(false, Ordering::SeqCst),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.inner.dirty.store(false, Ordering::SeqCst)
            }
            Err(e) => warn!(err = %e, "failed to delete snapshot"),
        }
    }
}

/// A synchronization decided earlier, to be executed by calling
/// [DeferredSynchronizer::update].
pub struct DeferredSynchronizer {
    db: ContentDatabase,
    handle: Arc<ContentHandle>,
    key: ProviderPathKey,
    content: Arc<ContentDescriptor>,
    updater: Box<dyn ContentUpdater>,
    /// The content observed when the decision was made. Cleared after the
    /// first update.
    identity: Mutex<Option<Option<Arc<ContentDescriptor>>>>,
}

impl DeferredSynchronizer {
    pub fn key(&self) -> &ProviderPathKey {
        &self.key
    }

    /// Executes the synchronization, if it's still needed.
    #[instrument(skip_all, fields(key = %self.key), err)]
    pub fn update(&self) -> Result<(), Error> {
        let lock = self.db.path_lock(self.key.key());
        let _guard = lock.lock();

        let current = self.handle.content();
        let unchanged_since_decision = match self.identity.lock().take() {
            Some(Some(observed)) => current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &observed)),
            Some(None) => current.is_none(),
            None => false,
        };
        if !unchanged_since_decision && !self.content.changed(current.as_deref()) {
            return Ok(());
        }
        self.db.execute_synchronize_locked(
            &self.handle,
            &self.key,
            self.content.clone(),
            self.updater.as_ref(),
            None,
        )
    }
}
