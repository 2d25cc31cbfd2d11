use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::Arc;
use tracing::warn;

use crate::content::{ContentDescriptor, ContentDescriptorSupplier};
use crate::provider::{FileAttributes, ProviderPathKey};

/// The database's belief about the current contents on disk.
#[derive(Clone)]
enum DiskContent {
    NotComputed,
    Invalidated,
    /// None if there is no file at the location.
    Computed(Option<Arc<ContentDescriptor>>),
}

/// The content the build put at a location, and what the disk looked like
/// right after.
#[derive(Clone, Debug)]
pub struct ExpectedContent {
    pub user: Arc<ContentDescriptor>,
    pub disk: Arc<ContentDescriptor>,
}

struct HandleState {
    disk: DiskContent,
    /// Bumped on every change of `disk`, so racing computations don't
    /// install stale results.
    generation: u64,
    expected: Option<ExpectedContent>,
    attributes: Option<FileAttributes>,
}

/// Tracks the contents of a single location.
pub struct ContentHandle {
    key: ProviderPathKey,
    supplier: Arc<dyn ContentDescriptorSupplier>,
    state: Mutex<HandleState>,
}

impl ContentHandle {
    pub(crate) fn new(key: ProviderPathKey, supplier: Arc<dyn ContentDescriptorSupplier>) -> Self {
        Self {
            key,
            supplier,
            state: Mutex::new(HandleState {
                disk: DiskContent::NotComputed,
                generation: 0,
                expected: None,
                attributes: None,
            }),
        }
    }

    pub(crate) fn with_expected(
        key: ProviderPathKey,
        supplier: Arc<dyn ContentDescriptorSupplier>,
        expected: ExpectedContent,
    ) -> Self {
        let handle = Self::new(key, supplier);
        handle.state.lock().expected = Some(expected);
        handle
    }

    pub fn key(&self) -> &ProviderPathKey {
        &self.key
    }

    pub(crate) fn supplier(&self) -> &Arc<dyn ContentDescriptorSupplier> {
        &self.supplier
    }

    fn calculate_disk_content(&self) -> Option<Arc<ContentDescriptor>> {
        match self.supplier.get(&self.key) {
            Ok(cd) => Some(Arc::new(cd)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(key = %self.key, err = %e, "failed to compute disk content");
                None
            }
        }
    }

    /// Returns the current contents on disk, computing them if needed.
    pub fn disk_content(&self) -> Option<Arc<ContentDescriptor>> {
        let generation = {
            let state = self.state.lock();
            if let DiskContent::Computed(cd) = &state.disk {
                return cd.clone();
            }
            state.generation
        };

        // don't hold the lock while doing I/O.
        let computed = self.calculate_disk_content();

        let mut state = self.state.lock();
        if state.generation == generation {
            state.disk = DiskContent::Computed(computed.clone());
            state.generation += 1;
            return computed;
        }
        match &state.disk {
            DiskContent::Computed(cd) => cd.clone(),
            _ => computed,
        }
    }

    /// Returns the content at the location.
    ///
    /// This is the expected content if the disk didn't change since it was
    /// set, otherwise it's the current disk content.
    pub fn content(&self) -> Option<Arc<ContentDescriptor>> {
        let disk = self.disk_content()?;
        let expected = self.state.lock().expected.clone();
        match expected {
            Some(expected) if !disk.changed(Some(&expected.disk)) => Some(expected.user),
            _ => Some(disk),
        }
    }

    pub fn expected(&self) -> Option<ExpectedContent> {
        self.state.lock().expected.clone()
    }

    pub fn attributes(&self) -> Option<FileAttributes> {
        self.state.lock().attributes
    }

    fn reset_disk(state: &mut HandleState) {
        state.disk = DiskContent::Invalidated;
        state.generation += 1;
    }

    /// Forgets the disk content, keeping the expected content.
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        Self::reset_disk(&mut state);
        state.attributes = None;
    }

    /// Forgets everything known about the location.
    pub fn invalidate_hard(&self) {
        let mut state = self.state.lock();
        Self::reset_disk(&mut state);
        state.attributes = None;
        state.expected = None;
    }

    /// Invalidates the disk content, but records the attributes it was
    /// invalidated with.
    pub(crate) fn set_disk_attributes(&self, attributes: Option<FileAttributes>) {
        let mut state = self.state.lock();
        Self::reset_disk(&mut state);
        state.attributes = attributes;
    }

    pub(crate) fn set_content(
        &self,
        user: Arc<ContentDescriptor>,
        disk: ContentDescriptor,
        attributes: Option<FileAttributes>,
    ) {
        let disk = Arc::new(disk);
        let mut state = self.state.lock();
        state.expected = Some(ExpectedContent {
            user,
            disk: disk.clone(),
        });
        state.disk = DiskContent::Computed(Some(disk));
        state.generation += 1;
        state.attributes = attributes;
    }

    /// Primes the disk content from attributes found by listing the parent.
    ///
    /// Only has an effect if the disk content was never computed, as
    /// otherwise it may already reflect a newer state.
    pub(crate) fn discover_attributes(
        &self,
        attributes: &FileAttributes,
        tracked: Option<FileAttributes>,
    ) {
        let mut state = self.state.lock();
        if !matches!(state.disk, DiskContent::NotComputed) {
            return;
        }
        if self.supplier.is_attribute_based() {
            state.disk = DiskContent::Computed(Some(Arc::new(ContentDescriptor::from_attributes(
                self.key.key().provider,
                self.key.path().to_owned(),
                attributes,
            ))));
            state.generation += 1;
        }
        state.attributes = tracked;
    }
}

impl fmt::Debug for ContentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentHandle").field("key", &self.key).finish()
    }
}
