//! Content descriptors capture "enough" about some content to detect changes
//! without comparing the full contents.
use bytes::Bytes;
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::path::PathBuf;
use crate::provider::{FileAttributes, ProviderKey};

mod supplier;

pub use supplier::{
    AttributesSupplier, Blake3Supplier, ContentCalculator, ContentDescriptorSupplier,
    ContentHasher, HashSupplier, HashingWriter, Md5Supplier,
};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentDescriptor {
    /// Describes empty contents.
    Empty,
    /// Marks a directory. Equal to every other directory marker.
    Directory,
    /// A digest of the contents, and the number of bytes hashed.
    Hash { digest: Bytes, size: u64 },
    /// Attributes of a file in a backing store, and its location.
    FileAttributes {
        provider: ProviderKey,
        path: PathBuf,
        size: u64,
        modified_millis: i64,
    },
    /// An ordered composition of descriptors.
    Multi(Vec<ContentDescriptor>),
    /// A composition of descriptors keyed by path.
    MultiPath(BTreeMap<PathBuf, ContentDescriptor>),
    /// Describes a missing file.
    NonExistent,
    /// Reports a change against everything, itself included.
    AlwaysChanged,
    /// An externally supplied descriptor, compared by its serialized form.
    Opaque { kind: String, data: Bytes },
    Uuid(uuid::Uuid),
}

impl ContentDescriptor {
    /// Creates a descriptor of the given file attributes at a location.
    pub fn from_attributes(provider: ProviderKey, path: PathBuf, attrs: &FileAttributes) -> Self {
        if attrs.is_directory() {
            return ContentDescriptor::Directory;
        }
        ContentDescriptor::FileAttributes {
            provider,
            path,
            size: attrs.size,
            modified_millis: attrs.modified_millis,
        }
    }

    /// Composes a list of descriptors.
    /// An empty list yields [ContentDescriptor::Empty], and a single element is
    /// returned as-is.
    pub fn multi(mut descriptors: Vec<ContentDescriptor>) -> Self {
        match descriptors.len() {
            0 => ContentDescriptor::Empty,
            1 => descriptors.remove(0),
            _ => ContentDescriptor::Multi(descriptors),
        }
    }

    pub fn multi_path(descriptors: BTreeMap<PathBuf, ContentDescriptor>) -> Self {
        if descriptors.is_empty() {
            return ContentDescriptor::Empty;
        }
        ContentDescriptor::MultiPath(descriptors)
    }

    /// A fresh random UUID descriptor, which is changed compared to anything
    /// created before.
    pub fn random_uuid() -> Self {
        ContentDescriptor::Uuid(uuid::Uuid::new_v4())
    }

    /// Creates a descriptor from some serializable value, by encoding it.
    pub fn opaque<T: Serialize>(kind: impl Into<String>, value: &T) -> Result<Self, bincode::Error> {
        Ok(ContentDescriptor::Opaque {
            kind: kind.into(),
            data: bincode::serialize(value)?.into(),
        })
    }

    /// Checks if the content described by self differs from `previous`.
    ///
    /// This is not the same as inequality: a [ContentDescriptor::NonExistent]
    /// is unchanged compared to no previous content at all, while
    /// [ContentDescriptor::AlwaysChanged] reports a change even compared to
    /// itself.
    pub fn changed(&self, previous: Option<&ContentDescriptor>) -> bool {
        use ContentDescriptor::*;

        match (self, previous) {
            (AlwaysChanged, _) => true,
            (NonExistent, None) | (NonExistent, Some(NonExistent)) => false,
            (_, None) => true,
            (Directory, Some(Directory)) => false,
            (
                Hash { digest, size },
                Some(Hash {
                    digest: prev_digest,
                    size: prev_size,
                }),
            ) => digest != prev_digest || size != prev_size,
            (Multi(list), Some(Multi(prev_list))) => {
                list.len() != prev_list.len()
                    || list
                        .iter()
                        .zip(prev_list.iter())
                        .any(|(c, p)| c.changed(Some(p)))
            }
            (MultiPath(map), Some(MultiPath(prev_map))) => {
                map.len() != prev_map.len()
                    || map.iter().any(|(path, c)| c.changed(prev_map.get(path)))
            }
            (this, Some(prev)) => this != prev,
        }
    }
}

impl fmt::Display for ContentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentDescriptor::Empty => write!(f, "empty"),
            ContentDescriptor::Directory => write!(f, "directory"),
            ContentDescriptor::Hash { digest, size } => {
                write!(f, "{}:{}", HEXLOWER.encode(digest), size)
            }
            ContentDescriptor::FileAttributes {
                provider,
                path,
                size,
                modified_millis,
            } => write!(f, "attrs({}:/{}, {}, {})", provider, path, size, modified_millis),
            ContentDescriptor::Multi(list) => write!(f, "multi[{}]", list.len()),
            ContentDescriptor::MultiPath(map) => write!(f, "multi-path[{}]", map.len()),
            ContentDescriptor::NonExistent => write!(f, "non-existent"),
            ContentDescriptor::AlwaysChanged => write!(f, "always-changed"),
            ContentDescriptor::Opaque { kind, data } => {
                write!(f, "{}({})", kind, HEXLOWER.encode(data))
            }
            ContentDescriptor::Uuid(uuid) => write!(f, "uuid:{}", uuid),
        }
    }
}
