use bytes::Bytes;
use digest::Digest;
use std::io::{self, Write};
use std::marker::PhantomData;
use tracing::{debug, instrument};

use super::ContentDescriptor;
use crate::provider::{FileAttributes, ProviderPathKey};

/// Computes a [ContentDescriptor] for a location in a backing store.
pub trait ContentDescriptorSupplier: Send + Sync {
    fn get(&self, key: &ProviderPathKey) -> io::Result<ContentDescriptor>;

    /// Computes the descriptor, given the already known attributes of the
    /// location.
    fn get_using_attributes(
        &self,
        key: &ProviderPathKey,
        _attrs: &FileAttributes,
    ) -> io::Result<ContentDescriptor> {
        self.get(key)
    }

    /// Computes the descriptor, given the contents that were just written to
    /// the location.
    fn get_using_content(
        &self,
        key: &ProviderPathKey,
        _content: &[u8],
        attrs: Option<&FileAttributes>,
    ) -> io::Result<ContentDescriptor> {
        match attrs {
            Some(attrs) => self.get_using_attributes(key, attrs),
            None => self.get(key),
        }
    }

    /// Returns a sink which computes the descriptor of the bytes written
    /// into it, if this supplier supports that.
    fn calculating_output(&self) -> Option<Box<dyn ContentCalculator>> {
        None
    }

    /// Retrieves the descriptor from a sink created by
    /// [ContentDescriptorSupplier::calculating_output], after all contents
    /// of `key` were written into it.
    fn calculated_output(
        &self,
        _key: &ProviderPathKey,
        output: Box<dyn ContentCalculator>,
    ) -> io::Result<ContentDescriptor> {
        Ok(output.finish())
    }

    /// True if the descriptors only depend on the file attributes, so that
    /// listing a directory is enough to compute them.
    fn is_attribute_based(&self) -> bool {
        false
    }
}

/// A sink computing a [ContentDescriptor] of everything written to it.
pub trait ContentCalculator: Write + Send {
    fn finish(self: Box<Self>) -> ContentDescriptor;
}

/// A hash function usable by [HashSupplier].
pub trait ContentHasher: Send + 'static {
    fn new() -> Self;

    fn update(&mut self, data: &[u8]);

    /// Returns the digest of everything passed to [ContentHasher::update].
    fn finalize(self) -> Bytes;
}

impl ContentHasher for md5::Md5 {
    fn new() -> Self {
        <md5::Md5 as Digest>::new()
    }

    fn update(&mut self, data: &[u8]) {
        <md5::Md5 as Digest>::update(self, data)
    }

    fn finalize(self) -> Bytes {
        Bytes::copy_from_slice(&<md5::Md5 as Digest>::finalize(self))
    }
}

impl ContentHasher for blake3::Hasher {
    fn new() -> Self {
        blake3::Hasher::new()
    }

    fn update(&mut self, data: &[u8]) {
        blake3::Hasher::update(self, data);
    }

    fn finalize(self) -> Bytes {
        Bytes::copy_from_slice(blake3::Hasher::finalize(&self).as_bytes())
    }
}

/// Computes the digest, and counts the bytes written into it.
/// The hash function is configurable by type parameter.
pub struct HashingWriter<H: ContentHasher> {
    hasher: H,
    count: u64,
}

impl<H: ContentHasher> Default for HashingWriter<H> {
    fn default() -> Self {
        Self {
            hasher: H::new(),
            count: 0,
        }
    }
}

impl<H: ContentHasher> HashingWriter<H> {
    /// Return the digest and the number of bytes hashed.
    pub fn digest(self) -> (Bytes, u64) {
        (self.hasher.finalize(), self.count)
    }

    pub fn into_descriptor(self) -> ContentDescriptor {
        let (digest, size) = self.digest();
        ContentDescriptor::Hash { digest, size }
    }
}

impl<H: ContentHasher> Write for HashingWriter<H> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hasher.update(buf);
        self.count += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<H: ContentHasher> ContentCalculator for HashingWriter<H> {
    fn finish(self: Box<Self>) -> ContentDescriptor {
        (*self).into_descriptor()
    }
}

/// Hashes the contents of files, with the hash function `H`.
///
/// Directories are described by [ContentDescriptor::Directory]. They are
/// detected when reading fails, by checking the attributes.
pub struct HashSupplier<H> {
    _hasher: PhantomData<fn() -> H>,
}

pub type Md5Supplier = HashSupplier<md5::Md5>;
pub type Blake3Supplier = HashSupplier<blake3::Hasher>;

impl<H> Default for HashSupplier<H> {
    fn default() -> Self {
        Self {
            _hasher: PhantomData,
        }
    }
}

impl<H: ContentHasher> HashSupplier<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Describes the given contents directly.
    pub fn describe(content: &[u8]) -> ContentDescriptor {
        let mut w = HashingWriter::<H>::default();
        w.hasher.update(content);
        w.count = content.len() as u64;
        w.into_descriptor()
    }
}

impl<H: ContentHasher> ContentDescriptorSupplier for HashSupplier<H> {
    #[instrument(skip_all, fields(key = %key), err)]
    fn get(&self, key: &ProviderPathKey) -> io::Result<ContentDescriptor> {
        let provider = key.provider();
        let mut w = HashingWriter::<H>::default();

        match provider.write_to(key.path(), &mut w) {
            Ok(_) => Ok(w.into_descriptor()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(e),
            Err(e) => {
                // reading a directory fails, check if that's what happened.
                match provider.attributes(key.path()) {
                    Ok(attrs) if attrs.is_directory() => {
                        debug!("reading failed on a directory");
                        Ok(ContentDescriptor::Directory)
                    }
                    _ => Err(e),
                }
            }
        }
    }

    fn get_using_content(
        &self,
        _key: &ProviderPathKey,
        content: &[u8],
        _attrs: Option<&FileAttributes>,
    ) -> io::Result<ContentDescriptor> {
        Ok(Self::describe(content))
    }

    fn calculating_output(&self) -> Option<Box<dyn ContentCalculator>> {
        Some(Box::new(HashingWriter::<H>::default()))
    }
}

/// Describes files by their attributes, see
/// [ContentDescriptor::FileAttributes].
#[derive(Default)]
pub struct AttributesSupplier;

impl ContentDescriptorSupplier for AttributesSupplier {
    fn get(&self, key: &ProviderPathKey) -> io::Result<ContentDescriptor> {
        let attrs = key.provider().attributes(key.path())?;
        self.get_using_attributes(key, &attrs)
    }

    fn get_using_attributes(
        &self,
        key: &ProviderPathKey,
        attrs: &FileAttributes,
    ) -> io::Result<ContentDescriptor> {
        Ok(ContentDescriptor::from_attributes(
            key.key().provider,
            key.path().to_owned(),
            attrs,
        ))
    }

    fn is_attribute_based(&self) -> bool {
        true
    }
}
