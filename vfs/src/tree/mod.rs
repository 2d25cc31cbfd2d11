//! The in-memory file tree build tasks operate on.
//!
//! Directories are either synthetic, or backed by a location in a
//! [crate::provider::FileProvider], in which case their children are
//! discovered lazily. Nodes are attached to at most one directory during
//! their lifetime.
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use crate::content::ContentDescriptor;
use crate::path::PathComponent;
use crate::Error;

mod directory;
mod file;
mod sync;
mod visit;

pub use directory::{Backing, Directory, Population};
pub use file::{ContentSource, File, FileContents, OpeningMethods, StreamFactory};
pub use visit::{CommonVisitPredicate, DirectoryVisitPredicate, FixedVisitPredicate};

/// A node of the tree.
#[derive(Clone)]
pub enum Node {
    File(Arc<File>),
    Directory(Arc<Directory>),
}

impl Node {
    /// The name of the node. Only root directories have none.
    pub fn name(&self) -> Option<&PathComponent> {
        match self {
            Node::File(f) => Some(f.name()),
            Node::Directory(d) => d.name(),
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Node::Directory(_))
    }

    pub fn as_file(&self) -> Option<&Arc<File>> {
        match self {
            Node::File(f) => Some(f),
            Node::Directory(_) => None,
        }
    }

    pub fn as_directory(&self) -> Option<&Arc<Directory>> {
        match self {
            Node::File(_) => None,
            Node::Directory(d) => Some(d),
        }
    }

    /// The directory this node is attached to.
    pub fn parent(&self) -> Option<Arc<Directory>> {
        self.parent_cell().parent()
    }

    /// Returns true if this node was removed from its directory, and can't
    /// be attached anymore.
    pub fn is_removed(&self) -> bool {
        self.parent_cell().is_removed()
    }

    pub fn content_descriptor(&self) -> ContentDescriptor {
        match self {
            Node::File(f) => f.content_descriptor(),
            Node::Directory(d) => d.content_descriptor(),
        }
    }

    /// Returns true if both refer to the same node.
    pub fn same(&self, other: &Node) -> bool {
        match (self, other) {
            (Node::File(a), Node::File(b)) => Arc::ptr_eq(a, b),
            (Node::Directory(a), Node::Directory(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub(crate) fn parent_cell(&self) -> &ParentCell {
        match self {
            Node::File(f) => f.parent_cell(),
            Node::Directory(d) => d.parent_cell(),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Node::File(file) => write!(f, "File({})", file.name()),
            Node::Directory(dir) => match dir.name() {
                Some(name) => write!(f, "Directory({})", name),
                None => write!(f, "Directory(<root>)"),
            },
        }
    }
}

impl From<Arc<File>> for Node {
    fn from(value: Arc<File>) -> Self {
        Node::File(value)
    }
}

impl From<Arc<Directory>> for Node {
    fn from(value: Arc<Directory>) -> Self {
        Node::Directory(value)
    }
}

enum ParentState {
    Unattached,
    AttachedTo(Weak<Directory>),
    /// Terminal.
    Removed,
}

/// The parent of a node.
///
/// Only allows compare-and-set transitions: Unattached → AttachedTo once,
/// AttachedTo → Removed once, and AttachedTo → Unattached to roll back an
/// attach that didn't make it into the directory.
pub(crate) struct ParentCell(Mutex<ParentState>);

impl Default for ParentCell {
    fn default() -> Self {
        Self(Mutex::new(ParentState::Unattached))
    }
}

fn is_same_dir(weak: &Weak<Directory>, dir: &Directory) -> bool {
    std::ptr::eq(weak.as_ptr(), dir)
}

impl ParentCell {
    pub(crate) fn attach(&self, dir: &Arc<Directory>) -> Result<(), Error> {
        let mut state = self.0.lock();
        match *state {
            ParentState::Unattached => {
                *state = ParentState::AttachedTo(Arc::downgrade(dir));
                Ok(())
            }
            ParentState::AttachedTo(_) => Err(Error::InvalidState(
                "node is already attached to a directory".to_string(),
            )),
            ParentState::Removed => Err(Error::InvalidState(
                "node was removed and can't be attached again".to_string(),
            )),
        }
    }

    /// Marks the node as removed, if it's attached to `dir`.
    pub(crate) fn detach(&self, dir: &Directory) -> bool {
        let mut state = self.0.lock();
        match &*state {
            ParentState::AttachedTo(weak) if is_same_dir(weak, dir) => {
                *state = ParentState::Removed;
                true
            }
            _ => false,
        }
    }

    /// Undoes an attach to `dir`.
    pub(crate) fn reset(&self, dir: &Directory) -> bool {
        let mut state = self.0.lock();
        match &*state {
            ParentState::AttachedTo(weak) if is_same_dir(weak, dir) => {
                *state = ParentState::Unattached;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_attached_to(&self, dir: &Directory) -> bool {
        matches!(&*self.0.lock(), ParentState::AttachedTo(weak) if is_same_dir(weak, dir))
    }

    pub(crate) fn is_removed(&self) -> bool {
        matches!(&*self.0.lock(), ParentState::Removed)
    }

    pub(crate) fn parent(&self) -> Option<Arc<Directory>> {
        match &*self.0.lock() {
            ParentState::AttachedTo(weak) => weak.upgrade(),
            _ => None,
        }
    }
}
