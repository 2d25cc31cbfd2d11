use std::collections::BTreeSet;
use std::sync::Arc;

use super::{Directory, File};
use crate::path::{PathBuf, PathComponent};

/// Selects the nodes visited by recursive collection and synchronization.
pub trait DirectoryVisitPredicate: Send + Sync {
    fn visit_file(&self, name: &PathComponent, file: &File) -> bool;

    /// Whether the directory itself is visited.
    fn visit_directory(&self, name: &PathComponent, dir: &Directory) -> bool;

    /// The predicate for the children of `dir`, or None to not descend into
    /// it.
    fn directory_visitor(
        &self,
        name: &PathComponent,
        dir: &Directory,
    ) -> Option<Arc<dyn DirectoryVisitPredicate>>;

    /// Names of on-disk children to keep during synchronization, in
    /// addition to the ones present in memory. None keeps everything.
    fn synchronize_files_to_keep(&self) -> Option<BTreeSet<PathComponent>> {
        Some(BTreeSet::new())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommonVisitPredicate {
    /// Every file and directory, recursively.
    Everything,
    Nothing,
    /// Direct children.
    Children,
    ChildDirectories,
    ChildFiles,
    /// Directories, recursively.
    SubDirectories,
    /// Files, recursively.
    SubFiles,
}

impl CommonVisitPredicate {
    fn visits_files(self) -> bool {
        matches!(
            self,
            Self::Everything | Self::Children | Self::ChildFiles | Self::SubFiles
        )
    }

    fn visits_directories(self) -> bool {
        matches!(
            self,
            Self::Everything | Self::Children | Self::ChildDirectories | Self::SubDirectories
        )
    }

    fn recurses(self) -> bool {
        matches!(self, Self::Everything | Self::SubDirectories | Self::SubFiles)
    }
}

impl DirectoryVisitPredicate for CommonVisitPredicate {
    fn visit_file(&self, _name: &PathComponent, _file: &File) -> bool {
        self.visits_files()
    }

    fn visit_directory(&self, _name: &PathComponent, _dir: &Directory) -> bool {
        self.visits_directories()
    }

    fn directory_visitor(
        &self,
        _name: &PathComponent,
        _dir: &Directory,
    ) -> Option<Arc<dyn DirectoryVisitPredicate>> {
        self.recurses().then(|| Arc::new(*self) as Arc<dyn DirectoryVisitPredicate>)
    }

    fn synchronize_files_to_keep(&self) -> Option<BTreeSet<PathComponent>> {
        match self {
            Self::Nothing => None,
            _ => Some(BTreeSet::new()),
        }
    }
}

/// Visits exactly the given paths, relative to the starting directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FixedVisitPredicate {
    paths: BTreeSet<PathBuf>,
}

impl FixedVisitPredicate {
    pub fn new(paths: BTreeSet<PathBuf>) -> Self {
        Self { paths }
    }
}

impl DirectoryVisitPredicate for FixedVisitPredicate {
    fn visit_file(&self, name: &PathComponent, _file: &File) -> bool {
        self.paths.contains(&PathBuf::from(name.clone()))
    }

    fn visit_directory(&self, name: &PathComponent, _dir: &Directory) -> bool {
        self.paths.contains(&PathBuf::from(name.clone()))
    }

    fn directory_visitor(
        &self,
        name: &PathComponent,
        _dir: &Directory,
    ) -> Option<Arc<dyn DirectoryVisitPredicate>> {
        let base = PathBuf::from(name.clone());
        let paths: BTreeSet<PathBuf> = self
            .paths
            .iter()
            .filter_map(|p| p.strip_prefix(&base))
            .filter(|rest| !rest.is_root())
            .map(|rest| rest.to_owned())
            .collect();
        if paths.is_empty() {
            return None;
        }
        Some(Arc::new(FixedVisitPredicate { paths }))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use std::collections::BTreeSet;

    use super::{CommonVisitPredicate, DirectoryVisitPredicate, FixedVisitPredicate};
    use crate::tree::{Directory, File};

    #[rstest]
    #[case::everything(CommonVisitPredicate::Everything, true, true, true, true)]
    #[case::nothing(CommonVisitPredicate::Nothing, false, false, false, false)]
    #[case::children(CommonVisitPredicate::Children, true, true, false, true)]
    #[case::child_directories(CommonVisitPredicate::ChildDirectories, false, true, false, true)]
    #[case::child_files(CommonVisitPredicate::ChildFiles, true, false, false, true)]
    #[case::sub_directories(CommonVisitPredicate::SubDirectories, false, true, true, true)]
    #[case::sub_files(CommonVisitPredicate::SubFiles, true, false, true, true)]
    fn common(
        #[case] predicate: CommonVisitPredicate,
        #[case] files: bool,
        #[case] dirs: bool,
        #[case] recurses: bool,
        #[case] keeps: bool,
    ) {
        let name = "x".try_into().unwrap();
        let file = File::from_bytes("x".try_into().unwrap(), &b"x"[..]);
        let dir = Directory::new("x".try_into().unwrap());

        assert_eq!(files, predicate.visit_file(&name, &file));
        assert_eq!(dirs, predicate.visit_directory(&name, &dir));
        assert_eq!(recurses, predicate.directory_visitor(&name, &dir).is_some());
        assert_eq!(keeps, predicate.synchronize_files_to_keep().is_some());
    }

    #[rstest]
    fn fixed() {
        let predicate = FixedVisitPredicate::new(BTreeSet::from([
            "a".parse().unwrap(),
            "d/b".parse().unwrap(),
            "d/e/c".parse().unwrap(),
        ]));
        let file = File::from_bytes("x".try_into().unwrap(), &b"x"[..]);
        let dir = Directory::new("d".try_into().unwrap());

        assert!(predicate.visit_file(&"a".try_into().unwrap(), &file));
        assert!(!predicate.visit_file(&"b".try_into().unwrap(), &file));
        assert!(!predicate.visit_directory(&"d".try_into().unwrap(), &dir));
        assert!(predicate
            .directory_visitor(&"a".try_into().unwrap(), &dir)
            .is_none());

        let sub = predicate
            .directory_visitor(&"d".try_into().unwrap(), &dir)
            .expect("must descend");
        assert!(sub.visit_file(&"b".try_into().unwrap(), &file));
        assert!(sub.directory_visitor(&"e".try_into().unwrap(), &dir).is_some());
        assert!(sub.directory_visitor(&"b".try_into().unwrap(), &dir).is_none());
    }
}
