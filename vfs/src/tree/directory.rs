use parking_lot::{Mutex, RwLock};
use std::collections::{btree_map, BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::{DirectoryVisitPredicate, File, Node, ParentCell};
use crate::content::ContentDescriptor;
use crate::database::ContentDatabase;
use crate::path::{Path, PathBuf, PathComponent};
use crate::pool::{SyncOptions, WorkPool};
use crate::provider::{FileAttributes, ProviderPathKey};
use crate::Error;

/// How much of the backing listing a directory has seen.
/// Only ever increases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Population {
    Unpopulated = 0,
    /// Some names were looked up individually.
    Partial = 1,
    Populated = 2,
}

impl Population {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Population::Unpopulated,
            1 => Population::Partial,
            _ => Population::Populated,
        }
    }
}

/// The location a directory discovers its children from.
#[derive(Clone)]
pub struct Backing {
    pub db: ContentDatabase,
    pub key: ProviderPathKey,
}

enum Slot {
    Present(Node),
    /// Known to not exist, or removed before the directory was populated.
    Absent,
}

pub struct Directory {
    name: Option<PathComponent>,
    parent: ParentCell,
    children: RwLock<BTreeMap<PathComponent, Slot>>,
    population: AtomicU8,
    /// Taken for population transitions only.
    population_lock: Mutex<()>,
    backing: Option<Backing>,
}

impl Directory {
    fn with(name: Option<PathComponent>, backing: Option<Backing>) -> Arc<Self> {
        let population = match backing {
            Some(_) => Population::Unpopulated,
            None => Population::Populated,
        };
        Arc::new(Self {
            name,
            parent: ParentCell::default(),
            children: Default::default(),
            population: AtomicU8::new(population as u8),
            population_lock: Mutex::new(()),
            backing,
        })
    }

    /// Creates an empty synthetic directory.
    pub fn new(name: PathComponent) -> Arc<Self> {
        Self::with(Some(name), None)
    }

    /// Creates an empty synthetic directory without a name.
    pub fn new_root() -> Arc<Self> {
        Self::with(None, None)
    }

    /// Creates a directory whose children are discovered from `key`.
    pub fn backed(name: PathComponent, db: ContentDatabase, key: ProviderPathKey) -> Arc<Self> {
        Self::with(Some(name), Some(Backing { db, key }))
    }

    /// Like [Directory::backed], but without a name.
    pub fn backed_root(db: ContentDatabase, key: ProviderPathKey) -> Arc<Self> {
        Self::with(None, Some(Backing { db, key }))
    }

    pub fn name(&self) -> Option<&PathComponent> {
        self.name.as_ref()
    }

    pub fn backing(&self) -> Option<&Backing> {
        self.backing.as_ref()
    }

    pub fn population(&self) -> Population {
        Population::from_u8(self.population.load(Ordering::Acquire))
    }

    pub(crate) fn parent_cell(&self) -> &ParentCell {
        &self.parent
    }

    pub fn parent(&self) -> Option<Arc<Directory>> {
        self.parent.parent()
    }

    fn advance_population(&self, to: Population) {
        self.population.fetch_max(to as u8, Ordering::AcqRel);
    }

    /// The path of this directory, relative to the root of its tree.
    pub fn path(&self) -> PathBuf {
        // the name of the topmost directory is not part of the path.
        let mut names = Vec::new();
        let mut name = self.name.clone();
        let mut parent = self.parent();
        while let Some(dir) = parent {
            names.extend(name);
            name = dir.name.clone();
            parent = dir.parent();
        }
        let mut path = PathBuf::new();
        for name in names.iter().rev() {
            path.push(name);
        }
        path
    }

    /// The location this directory synchronizes to: its own backing, or the
    /// one of the nearest backed ancestor, extended by the names in between.
    pub fn location(&self) -> Option<(ContentDatabase, ProviderPathKey)> {
        if let Some(backing) = &self.backing {
            return Some((backing.db.clone(), backing.key.clone()));
        }
        let (db, key) = self.parent()?.location()?;
        Some((db, key.child(self.name.as_ref()?)))
    }

    pub fn content_descriptor(&self) -> ContentDescriptor {
        ContentDescriptor::Directory
    }

    fn create_discovered(
        self: &Arc<Self>,
        backing: &Backing,
        name: &PathComponent,
        attrs: &FileAttributes,
    ) -> Node {
        let key = backing.key.child(name);
        let node = if attrs.is_directory() {
            Node::Directory(Directory::backed(name.clone(), backing.db.clone(), key))
        } else {
            Node::File(File::from_provider(name.clone(), backing.db.clone(), key))
        };
        // fresh nodes are always attachable.
        let _ = node.parent_cell().attach(self);
        node
    }

    /// Looks up a single child, asking the backing store if it wasn't seen
    /// yet. Failures other than a missing child are returned, and the name
    /// is looked up again on the next call.
    pub fn get(self: &Arc<Self>, name: &PathComponent) -> Result<Option<Node>, Error> {
        if let Some(slot) = self.children.read().get(name) {
            return Ok(match slot {
                Slot::Present(node) => Some(node.clone()),
                Slot::Absent => None,
            });
        }
        let backing = match &self.backing {
            Some(backing) if self.population() != Population::Populated => backing,
            _ => return Ok(None),
        };

        let discovered = match backing
            .db
            .discover_file_attributes(&backing.key.child(name))
        {
            Ok((_, attrs)) => Some(self.create_discovered(backing, name, &attrs)),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!(name = %name, err = %e, "failed to look up child");
                return Err(e);
            }
        };

        let mut children = self.children.write();
        if self.population() == Population::Populated {
            // a full listing won the race, and is authoritative.
            return Ok(match children.get(name) {
                Some(Slot::Present(node)) => Some(node.clone()),
                _ => None,
            });
        }
        let result = match children.entry(name.clone()) {
            btree_map::Entry::Occupied(e) => match e.get() {
                Slot::Present(node) => Some(node.clone()),
                Slot::Absent => None,
            },
            btree_map::Entry::Vacant(e) => match discovered {
                Some(node) => {
                    e.insert(Slot::Present(node.clone()));
                    Some(node)
                }
                None => {
                    e.insert(Slot::Absent);
                    None
                }
            },
        };
        drop(children);
        self.advance_population(Population::Partial);
        Ok(result)
    }

    /// Discovers every child from the backing store, once.
    pub fn ensure_populated(self: &Arc<Self>) -> Result<(), Error> {
        if self.population() == Population::Populated {
            return Ok(());
        }
        let _guard = self.population_lock.lock();
        if self.population() == Population::Populated {
            return Ok(());
        }

        if let Some(backing) = &self.backing {
            let listing = match backing
                .db
                .discover_directory_children_attributes(&backing.key)
            {
                Ok(listing) => listing,
                Err(e) if e.is_not_found() => BTreeMap::new(),
                Err(e) => return Err(e),
            };
            debug!(key = %backing.key, count = listing.len(), "populating");

            let mut children = self.children.write();
            for (name, (_, attrs)) in listing {
                if let btree_map::Entry::Vacant(e) = children.entry(name) {
                    let node = self.create_discovered(backing, e.key(), &attrs);
                    e.insert(Slot::Present(node));
                }
            }
            children.retain(|_, slot| matches!(slot, Slot::Present(_)));
            self.advance_population(Population::Populated);
        } else {
            self.advance_population(Population::Populated);
        }
        Ok(())
    }

    /// Returns every child, populating the directory first.
    pub fn children(self: &Arc<Self>) -> Result<BTreeMap<PathComponent, Node>, Error> {
        self.ensure_populated()?;
        Ok(self
            .children
            .read()
            .iter()
            .filter_map(|(name, slot)| match slot {
                Slot::Present(node) => Some((name.clone(), node.clone())),
                Slot::Absent => None,
            })
            .collect())
    }

    pub fn children_names(self: &Arc<Self>) -> Result<BTreeSet<PathComponent>, Error> {
        Ok(self.children()?.into_keys().collect())
    }

    pub fn is_empty(self: &Arc<Self>) -> Result<bool, Error> {
        self.ensure_populated()?;
        Ok(!self
            .children
            .read()
            .values()
            .any(|slot| matches!(slot, Slot::Present(_))))
    }

    fn check_addable(self: &Arc<Self>, node: &Node) -> Result<PathComponent, Error> {
        let name = node
            .name()
            .ok_or_else(|| Error::InvalidArgument("can't add a directory without a name".into()))?
            .clone();
        if let Node::Directory(dir) = node {
            // adding an ancestor, or ourselves, would create a cycle.
            let mut current = Some(self.clone());
            while let Some(ancestor) = current {
                if Arc::ptr_eq(&ancestor, dir) {
                    return Err(Error::InvalidState(
                        "can't add a directory to itself or its descendants".into(),
                    ));
                }
                current = ancestor.parent();
            }
        }
        Ok(name)
    }

    /// Called after `node` was inserted. If a concurrent removal detached
    /// it in the meantime, the entry is rolled back.
    fn validate_inserted(&self, name: &PathComponent, node: &Node) -> Result<(), Error> {
        if node.parent_cell().is_attached_to(self) {
            return Ok(());
        }
        self.remove_entry(name, node);
        Err(Error::InvalidState(format!(
            "{} was removed while being added",
            name
        )))
    }

    fn remove_entry(&self, name: &PathComponent, node: &Node) -> bool {
        let mut children = self.children.write();
        match children.get(name) {
            Some(Slot::Present(present)) if present.same(node) => {
                if self.population() == Population::Populated {
                    children.remove(name);
                } else {
                    // keep the backing store from resurrecting it.
                    children.insert(name.clone(), Slot::Absent);
                }
                true
            }
            _ => false,
        }
    }

    /// Adds `node`, replacing any child with the same name. Returns the
    /// replaced child, which is marked removed.
    #[instrument(skip_all, fields(name = ?node.name()), err)]
    pub fn add(self: &Arc<Self>, node: Node) -> Result<Option<Node>, Error> {
        let name = self.check_addable(&node)?;
        node.parent_cell().attach(self)?;

        let previous = self
            .children
            .write()
            .insert(name.clone(), Slot::Present(node.clone()));
        let previous = match previous {
            Some(Slot::Present(previous)) => {
                previous.parent_cell().detach(self);
                Some(previous)
            }
            _ => None,
        };

        self.validate_inserted(&name, &node)?;
        Ok(previous)
    }

    /// Adds `node` unless a child with the same name exists, in which case
    /// that child is returned.
    pub fn add_if_absent(self: &Arc<Self>, node: Node) -> Result<Option<Node>, Error> {
        let name = self.check_addable(&node)?;
        // the backing store takes precedence.
        if let Some(existing) = self.get(&name)? {
            return Ok(Some(existing));
        }
        node.parent_cell().attach(self)?;

        let existing = {
            let mut children = self.children.write();
            match children.get(&name) {
                Some(Slot::Present(existing)) => Some(existing.clone()),
                _ => {
                    children.insert(name.clone(), Slot::Present(node.clone()));
                    None
                }
            }
        };
        if let Some(existing) = existing {
            node.parent_cell().reset(self);
            return Ok(Some(existing));
        }

        self.validate_inserted(&name, &node)?;
        Ok(None)
    }

    /// Adds `node`, replacing any child with the same name unless it's a
    /// directory. Returns that directory if it refused.
    pub fn add_overwrite_if_not_directory(
        self: &Arc<Self>,
        node: Node,
    ) -> Result<Option<Node>, Error> {
        let name = self.check_addable(&node)?;
        if let Some(existing @ Node::Directory(_)) = self.get(&name)? {
            return Ok(Some(existing));
        }
        node.parent_cell().attach(self)?;

        let previous = {
            let mut children = self.children.write();
            match children.get(&name) {
                Some(Slot::Present(existing @ Node::Directory(_))) => {
                    let existing = existing.clone();
                    drop(children);
                    node.parent_cell().reset(self);
                    return Ok(Some(existing));
                }
                _ => children.insert(name.clone(), Slot::Present(node.clone())),
            }
        };
        if let Some(Slot::Present(previous)) = previous {
            previous.parent_cell().detach(self);
        }

        self.validate_inserted(&name, &node)?;
        Ok(None)
    }

    /// Removes `node` from this directory. It can't be attached anywhere
    /// afterwards.
    pub fn remove(&self, node: &Node) -> Result<(), Error> {
        let name = node
            .name()
            .ok_or_else(|| Error::InvalidArgument("node has no name".into()))?;
        if !node.parent_cell().detach(self) {
            return Err(Error::InvalidState(format!(
                "{} is not a child of this directory",
                name
            )));
        }
        self.remove_entry(name, node);
        Ok(())
    }

    /// Removes every child, without consulting the backing store.
    pub fn clear(&self) {
        let removed = {
            let _guard = self.population_lock.lock();
            self.advance_population(Population::Populated);
            std::mem::take(&mut *self.children.write())
        };
        for slot in removed.into_values() {
            if let Slot::Present(node) = slot {
                node.parent_cell().detach(self);
            }
        }
    }

    /// Returns the directory `name`, replacing a file of that name with a
    /// new synthetic directory.
    pub fn get_directory_create(
        self: &Arc<Self>,
        name: &PathComponent,
    ) -> Result<Arc<Directory>, Error> {
        if let Some(Node::Directory(dir)) = self.get(name)? {
            return Ok(dir);
        }
        let dir = Directory::new(name.clone());
        match self.add_overwrite_if_not_directory(Node::Directory(dir.clone()))? {
            Some(Node::Directory(existing)) => Ok(existing),
            _ => Ok(dir),
        }
    }

    /// Returns the directory `name`, creating it if there's nothing of that
    /// name. Returns None if a file has that name.
    pub fn get_directory_create_if_absent(
        self: &Arc<Self>,
        name: &PathComponent,
    ) -> Result<Option<Arc<Directory>>, Error> {
        match self.get(name)? {
            Some(Node::Directory(dir)) => return Ok(Some(dir)),
            Some(Node::File(_)) => return Ok(None),
            None => {}
        }
        let dir = Directory::new(name.clone());
        match self.add_if_absent(Node::Directory(dir.clone()))? {
            None => Ok(Some(dir)),
            Some(Node::Directory(existing)) => Ok(Some(existing)),
            Some(Node::File(_)) => Ok(None),
        }
    }

    /// Looks up a descendant by relative path.
    pub fn resolve(self: &Arc<Self>, path: &Path) -> Result<Option<Node>, Error> {
        let mut node = Node::Directory(self.clone());
        for name in path.components() {
            let Some(dir) = node.as_directory() else {
                return Ok(None);
            };
            match dir.get(&name)? {
                Some(child) => node = child,
                None => return Ok(None),
            }
        }
        Ok(Some(node))
    }

    /// Collects the nodes below this directory selected by `predicate`,
    /// keyed by their path relative to this directory.
    pub fn files_recursive(
        self: &Arc<Self>,
        predicate: Arc<dyn DirectoryVisitPredicate>,
    ) -> Result<BTreeMap<PathBuf, Node>, Error> {
        self.files_recursive_by_path(Path::ROOT, predicate)
    }

    /// Like [Directory::files_recursive], with the paths resolved against
    /// `base`.
    pub fn files_recursive_by_path(
        self: &Arc<Self>,
        base: &Path,
        predicate: Arc<dyn DirectoryVisitPredicate>,
    ) -> Result<BTreeMap<PathBuf, Node>, Error> {
        self.files_recursive_with(base, predicate, &SyncOptions::default())
    }

    #[instrument(skip_all, fields(base = %base), err)]
    pub fn files_recursive_with(
        self: &Arc<Self>,
        base: &Path,
        predicate: Arc<dyn DirectoryVisitPredicate>,
        options: &SyncOptions,
    ) -> Result<BTreeMap<PathBuf, Node>, Error> {
        let pool = WorkPool::new(options);
        let result = Arc::new(Mutex::new(BTreeMap::new()));

        let inline = collect(self.clone(), base.to_owned(), predicate, &pool, &result);
        let joined = pool.join();
        inline?;
        joined?;

        let collected = std::mem::take(&mut *result.lock());
        Ok(collected)
    }
}

type Collected = Arc<Mutex<BTreeMap<PathBuf, Node>>>;

fn collect(
    dir: Arc<Directory>,
    base: PathBuf,
    predicate: Arc<dyn DirectoryVisitPredicate>,
    pool: &WorkPool,
    result: &Collected,
) -> Result<(), Error> {
    for (name, node) in dir.children()? {
        let path = base.join(&name);
        match &node {
            Node::File(file) => {
                if predicate.visit_file(&name, file) {
                    result.lock().insert(path, node);
                }
            }
            Node::Directory(sub) => {
                if predicate.visit_directory(&name, sub) {
                    result.lock().insert(path.clone(), node.clone());
                }
                let Some(visitor) = predicate.directory_visitor(&name, sub) else {
                    continue;
                };
                if sub.population() == Population::Populated {
                    collect(sub.clone(), path, visitor, pool, result)?;
                } else {
                    // listing is I/O, overlap it.
                    let (sub, task_pool, result) = (sub.clone(), pool.clone(), result.clone());
                    pool.execute(move || collect(sub, path, visitor, &task_pool, &result));
                }
            }
        }
    }
    Ok(())
}
