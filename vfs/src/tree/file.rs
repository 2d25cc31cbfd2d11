use bitflags::bitflags;
use bytes::Bytes;
use serde::Serialize;
use std::io::{self, Read, Write};
use std::ops::Deref;
use std::sync::Arc;
use tracing::instrument;

use super::ParentCell;
use crate::content::{ContentDescriptor, Md5Supplier};
use crate::database::{ContentDatabase, ContentUpdater, DeferredSynchronizer, TeeWriter};
use crate::path::PathComponent;
use crate::provider::{FileKind, ProviderPathKey, WriteRequestFlags};
use crate::Error;

bitflags! {
    /// Ways of reading file contents that don't require them to be on disk.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpeningMethods: u8 {
        const WRITE_TO_STREAM = 1 << 0;
        const OPEN_INPUT = 1 << 1;
        const GET_BYTES = 1 << 2;
        const GET_STRING = 1 << 3;
    }
}

pub type StreamFactory = Arc<dyn Fn() -> io::Result<Box<dyn Read + Send>> + Send + Sync>;

/// Where the contents of a [File] come from.
#[derive(Clone)]
pub enum FileContents {
    Bytes {
        data: Bytes,
        descriptor: ContentDescriptor,
    },
    /// The contents of another file.
    Delegate(Arc<File>),
    /// A location in a backing store, tracked by the database.
    Provider {
        db: ContentDatabase,
        key: ProviderPathKey,
        /// Overrides the descriptor the database reports.
        descriptor: Option<ContentDescriptor>,
    },
    Stream {
        factory: StreamFactory,
        descriptor: ContentDescriptor,
    },
    /// The bincode encoding of a value.
    Serialized {
        data: Bytes,
        descriptor: ContentDescriptor,
    },
}

/// Read access to file contents.
pub trait ContentSource {
    fn content_descriptor(&self) -> ContentDescriptor;

    /// The methods which read the contents without writing them to their
    /// location first.
    fn efficient_opening_methods(&self) -> OpeningMethods;

    fn get_bytes(&self) -> io::Result<Bytes>;

    fn open_input(&self) -> io::Result<Box<dyn Read + Send>>;

    fn write_to(&self, sink: &mut dyn Write) -> io::Result<u64> {
        let mut input = self.open_input()?;
        io::copy(&mut input, sink)
    }
}

impl ContentSource for FileContents {
    fn content_descriptor(&self) -> ContentDescriptor {
        match self {
            FileContents::Bytes { descriptor, .. }
            | FileContents::Stream { descriptor, .. }
            | FileContents::Serialized { descriptor, .. } => descriptor.clone(),
            FileContents::Delegate(file) => file.content_descriptor(),
            FileContents::Provider {
                db,
                key,
                descriptor,
            } => match descriptor {
                Some(descriptor) => descriptor.clone(),
                None => db
                    .content_descriptor(key)
                    .unwrap_or(ContentDescriptor::NonExistent),
            },
        }
    }

    fn efficient_opening_methods(&self) -> OpeningMethods {
        match self {
            FileContents::Bytes { .. } | FileContents::Serialized { .. } => {
                OpeningMethods::GET_BYTES
                    | OpeningMethods::WRITE_TO_STREAM
                    | OpeningMethods::OPEN_INPUT
            }
            FileContents::Delegate(file) => file.contents.efficient_opening_methods(),
            FileContents::Provider { .. } => OpeningMethods::all(),
            FileContents::Stream { .. } => OpeningMethods::OPEN_INPUT,
        }
    }

    fn get_bytes(&self) -> io::Result<Bytes> {
        match self {
            FileContents::Bytes { data, .. } | FileContents::Serialized { data, .. } => {
                Ok(data.clone())
            }
            FileContents::Delegate(file) => file.contents.get_bytes(),
            FileContents::Provider { key, .. } => key.provider().read_all_bytes(key.path()),
            FileContents::Stream { factory, .. } => {
                let mut buf = Vec::new();
                factory()?.read_to_end(&mut buf)?;
                Ok(buf.into())
            }
        }
    }

    fn open_input(&self) -> io::Result<Box<dyn Read + Send>> {
        match self {
            FileContents::Bytes { data, .. } | FileContents::Serialized { data, .. } => {
                Ok(Box::new(io::Cursor::new(data.clone())))
            }
            FileContents::Delegate(file) => file.contents.open_input(),
            FileContents::Provider { key, .. } => key.provider().open_input(key.path()),
            FileContents::Stream { factory, .. } => factory(),
        }
    }

    fn write_to(&self, sink: &mut dyn Write) -> io::Result<u64> {
        match self {
            FileContents::Bytes { data, .. } | FileContents::Serialized { data, .. } => {
                sink.write_all(data)?;
                Ok(data.len() as u64)
            }
            FileContents::Delegate(file) => file.contents.write_to(sink),
            FileContents::Provider { key, .. } => key.provider().write_to(key.path(), sink),
            FileContents::Stream { factory, .. } => io::copy(&mut factory()?, sink),
        }
    }
}

pub struct File {
    name: PathComponent,
    parent: ParentCell,
    contents: FileContents,
}

impl File {
    pub fn new(name: PathComponent, contents: FileContents) -> Arc<Self> {
        Arc::new(Self {
            name,
            parent: ParentCell::default(),
            contents,
        })
    }

    /// A file with the given contents, described by their MD5 hash.
    pub fn from_bytes(name: PathComponent, data: impl Into<Bytes>) -> Arc<Self> {
        let data = data.into();
        let descriptor = Md5Supplier::describe(&data);
        Self::new(name, FileContents::Bytes { data, descriptor })
    }

    pub fn with_descriptor(
        name: PathComponent,
        data: impl Into<Bytes>,
        descriptor: ContentDescriptor,
    ) -> Arc<Self> {
        Self::new(
            name,
            FileContents::Bytes {
                data: data.into(),
                descriptor,
            },
        )
    }

    pub fn delegate(name: PathComponent, target: Arc<File>) -> Arc<Self> {
        Self::new(name, FileContents::Delegate(target))
    }

    pub fn from_provider(name: PathComponent, db: ContentDatabase, key: ProviderPathKey) -> Arc<Self> {
        Self::new(
            name,
            FileContents::Provider {
                db,
                key,
                descriptor: None,
            },
        )
    }

    pub fn from_stream(
        name: PathComponent,
        factory: StreamFactory,
        descriptor: ContentDescriptor,
    ) -> Arc<Self> {
        Self::new(
            name,
            FileContents::Stream {
                factory,
                descriptor,
            },
        )
    }

    /// A file with the bincode encoding of `value` as contents. Unless
    /// given, the descriptor is the MD5 hash of the encoding.
    pub fn serialized<T: Serialize>(
        name: PathComponent,
        value: &T,
        descriptor: Option<ContentDescriptor>,
    ) -> Result<Arc<Self>, Error> {
        let data: Bytes = bincode::serialize(value)
            .map_err(|e| Error::InvalidArgument(format!("unable to serialize: {}", e)))?
            .into();
        let descriptor = descriptor.unwrap_or_else(|| Md5Supplier::describe(&data));
        Ok(Self::new(name, FileContents::Serialized { data, descriptor }))
    }

    pub fn name(&self) -> &PathComponent {
        &self.name
    }

    pub fn contents(&self) -> &FileContents {
        &self.contents
    }

    pub(crate) fn parent_cell(&self) -> &ParentCell {
        &self.parent
    }

    pub fn parent(&self) -> Option<Arc<super::Directory>> {
        self.parent.parent()
    }

    pub fn content_descriptor(&self) -> ContentDescriptor {
        self.contents.content_descriptor()
    }

    /// The location this file synchronizes to, derived from its parent.
    pub fn location(&self) -> Option<(ContentDatabase, ProviderPathKey)> {
        let (db, key) = self.parent()?.location()?;
        Some((db, key.child(&self.name)))
    }

    fn is_efficient(&self, methods: OpeningMethods) -> bool {
        self.contents.efficient_opening_methods().intersects(methods)
    }

    /// Returns the contents, writing them to the location of this file
    /// first if that's the cheapest way to get them.
    pub fn bytes(&self) -> Result<Bytes, Error> {
        match self.location() {
            Some((db, key)) if !self.is_efficient(OpeningMethods::GET_BYTES) => {
                let updater = FileUpdater::new(self, key.clone());
                db.get_bytes_with_content_or_synchronize(&key, self.content_descriptor(), &updater)
            }
            _ => Ok(self.contents.get_bytes()?),
        }
    }

    pub fn string(&self) -> Result<String, Error> {
        let bytes = match self.location() {
            Some((db, key))
                if !self.is_efficient(OpeningMethods::GET_STRING | OpeningMethods::GET_BYTES) =>
            {
                let updater = FileUpdater::new(self, key.clone());
                db.get_bytes_with_content_or_synchronize(&key, self.content_descriptor(), &updater)?
            }
            _ => self.contents.get_bytes()?,
        };
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::InvalidArgument(format!("{} is not valid utf-8: {}", self.name, e)))
    }

    pub fn open_input(&self) -> Result<Box<dyn Read + Send>, Error> {
        match self.location() {
            Some((db, key)) if !self.is_efficient(OpeningMethods::OPEN_INPUT) => {
                let updater = FileUpdater::new(self, key.clone());
                db.open_input_with_content_or_synchronize(&key, self.content_descriptor(), &updater)
            }
            _ => Ok(self.contents.open_input()?),
        }
    }

    pub fn write_to(&self, sink: &mut dyn Write) -> Result<(), Error> {
        match self.location() {
            Some((db, key)) if !self.is_efficient(OpeningMethods::WRITE_TO_STREAM) => {
                let updater = FileUpdater::new(self, key.clone());
                db.write_to_with_content_or_synchronize(
                    &key,
                    self.content_descriptor(),
                    sink,
                    &updater,
                )
            }
            _ => {
                self.contents.write_to(sink)?;
                Ok(())
            }
        }
    }

    /// Writes this file to its location, if it isn't there yet.
    pub fn synchronize(&self) -> Result<(), Error> {
        let (db, key) = self.location().ok_or_else(|| {
            Error::InvalidState(format!("{} has no location to synchronize to", self.name))
        })?;
        self.synchronize_to(&db, &key)
    }

    #[instrument(skip_all, fields(name = %self.name, key = %key), err)]
    pub fn synchronize_to(&self, db: &ContentDatabase, key: &ProviderPathKey) -> Result<(), Error> {
        db.synchronize(
            key,
            self.content_descriptor(),
            &FileUpdater::new(self, key.clone()),
        )
    }

    pub(crate) fn synchronize_deferred(
        self: &Arc<Self>,
        db: &ContentDatabase,
        key: &ProviderPathKey,
    ) -> Option<DeferredSynchronizer> {
        db.synchronize_deferred(
            key,
            self.content_descriptor(),
            Box::new(FileUpdater::new(self.clone(), key.clone())),
        )
    }
}

/// Writes a file to a location.
struct FileUpdater<F> {
    file: F,
    key: ProviderPathKey,
}

impl<F: Deref<Target = File>> FileUpdater<F> {
    fn new(file: F, key: ProviderPathKey) -> Self {
        Self { file, key }
    }

    fn open_output(&self) -> Result<Box<dyn Write + Send>, Error> {
        let provider = self.key.provider();
        provider.ensure_write_request(
            self.key.path(),
            FileKind::File,
            WriteRequestFlags::DELETE_INTERMEDIATE,
        )?;
        Ok(provider.open_output(self.key.path())?)
    }
}

impl<F: Deref<Target = File> + Send + Sync> ContentUpdater for FileUpdater<F> {
    fn update(&self) -> Result<(), Error> {
        let mut output = self.open_output()?;
        self.file.contents.write_to(&mut output)?;
        output.flush()?;
        Ok(())
    }

    fn update_with_stream(&self, sink: &mut dyn Write) -> Result<bool, Error> {
        let output = self.open_output()?;
        let mut tee = TeeWriter::new(output, Some(sink));
        self.file.contents.write_to(&mut tee)?;
        tee.primary.flush()?;
        match tee.secondary_error.take() {
            Some(e) => Err(Error::SecondaryStream(e)),
            None => Ok(true),
        }
    }
}
