use std::sync::Arc;
use tracing::{debug, instrument};

use super::{Directory, DirectoryVisitPredicate, Node};
use crate::database::ContentDatabase;
use crate::pool::{SyncOptions, WorkPool};
use crate::provider::ProviderPathKey;
use crate::Error;

impl Directory {
    /// Writes this directory and the nodes selected by `predicate` to the
    /// location of this directory, deleting on-disk children that don't
    /// exist in memory.
    pub fn synchronize(
        self: &Arc<Self>,
        predicate: Arc<dyn DirectoryVisitPredicate>,
    ) -> Result<(), Error> {
        let (db, key) = self.location().ok_or_else(|| {
            Error::InvalidState("directory has no location to synchronize to".into())
        })?;
        self.synchronize_to(&db, &key, predicate, &SyncOptions::default())
    }

    /// Like [Directory::synchronize], to an explicit location.
    #[instrument(skip_all, fields(key = %key), err)]
    pub fn synchronize_to(
        self: &Arc<Self>,
        db: &ContentDatabase,
        key: &ProviderPathKey,
        predicate: Arc<dyn DirectoryVisitPredicate>,
        options: &SyncOptions,
    ) -> Result<(), Error> {
        let pool = WorkPool::new(options);
        let inline = synchronize_directory(self.clone(), db.clone(), key.clone(), predicate, &pool);
        let joined = pool.join();
        inline?;
        joined
    }
}

fn synchronize_directory(
    dir: Arc<Directory>,
    db: ContentDatabase,
    key: ProviderPathKey,
    predicate: Arc<dyn DirectoryVisitPredicate>,
    pool: &WorkPool,
) -> Result<(), Error> {
    db.synchronize_directory(&key, || {
        let children = dir.children()?;

        match predicate.synchronize_files_to_keep() {
            Some(keep) if children.is_empty() => {
                db.delete_children_if_not_in(&key, &keep)?;
                return Ok(());
            }
            Some(mut keep) => {
                keep.extend(children.keys().cloned());
                let (db, key) = (db.clone(), key.clone());
                pool.execute(move || db.delete_children_if_not_in(&key, &keep));
            }
            None if children.is_empty() => return Ok(()),
            None => {}
        }

        for (name, node) in children {
            let child_key = key.child(&name);
            match node {
                Node::Directory(sub) => {
                    if let Some(visitor) = predicate.directory_visitor(&name, &sub) {
                        let (db, task_pool) = (db.clone(), pool.clone());
                        pool.execute(move || {
                            synchronize_directory(sub, db, child_key, visitor, &task_pool)
                        });
                    } else if predicate.visit_directory(&name, &sub) {
                        let db = db.clone();
                        pool.execute(move || db.create_directory_at_path(&child_key));
                    }
                }
                Node::File(file) => {
                    if !predicate.visit_file(&name, &file) {
                        continue;
                    }
                    if let Some(token) = file.synchronize_deferred(&db, &child_key) {
                        pool.execute(move || token.update());
                    } else {
                        debug!(key = %child_key, "up to date");
                    }
                }
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use crate::database::ContentDatabase;
    use crate::fixtures::{CONTENTS_A, CONTENTS_B};
    use crate::path::{PathBuf, PathComponent};
    use crate::provider::{FileProvider, MemoryFileProvider, ProviderPathKey};
    use crate::tree::{CommonVisitPredicate, Directory, File, Node};
    use crate::Error;

    fn name(s: &str) -> PathComponent {
        s.try_into().unwrap()
    }

    fn p(s: &str) -> PathBuf {
        s.parse().unwrap()
    }

    fn setup() -> (MemoryFileProvider, ContentDatabase, Arc<Directory>) {
        let provider = MemoryFileProvider::default();
        let db = ContentDatabase::in_memory();
        let key = ProviderPathKey::new(Arc::new(provider.clone()), "out".parse().unwrap());
        let root = Directory::backed_root(db.clone(), key);
        (provider, db, root)
    }

    #[test]
    fn writes_tree() {
        let (provider, _db, root) = setup();
        root.add(File::from_bytes(name("a"), CONTENTS_A.clone()).into())
            .unwrap();
        let sub = root.get_directory_create(&name("sub")).unwrap();
        sub.add(File::from_bytes(name("b"), CONTENTS_B.clone()).into())
            .unwrap();

        root.synchronize(Arc::new(CommonVisitPredicate::Everything))
            .unwrap();

        assert_eq!(
            CONTENTS_A.clone(),
            provider.read_all_bytes(&p("out/a")).unwrap()
        );
        assert_eq!(
            CONTENTS_B.clone(),
            provider.read_all_bytes(&p("out/sub/b")).unwrap()
        );
        assert_eq!(2, provider.write_count());

        // nothing changed.
        root.synchronize(Arc::new(CommonVisitPredicate::Everything))
            .unwrap();
        assert_eq!(2, provider.write_count());
    }

    #[test]
    fn children_predicate_creates_but_does_not_recurse() {
        let (provider, _db, root) = setup();
        let sub = root.get_directory_create(&name("sub")).unwrap();
        sub.add(File::from_bytes(name("b"), CONTENTS_B.clone()).into())
            .unwrap();

        root.synchronize(Arc::new(CommonVisitPredicate::Children))
            .unwrap();

        assert!(provider
            .attributes(&p("out/sub"))
            .unwrap()
            .is_directory());
        assert!(provider.attributes(&p("out/sub/b")).is_err());
    }

    #[test]
    fn nothing_keeps_strays() {
        let (provider, _db, root) = setup();
        provider.create_directories(&p("out")).unwrap();
        provider
            .set_file_bytes(&p("out/stray"), b"x")
            .unwrap();

        root.synchronize(Arc::new(CommonVisitPredicate::Nothing))
            .unwrap();
        assert!(provider.attributes(&p("out/stray")).is_ok());
    }

    #[test]
    fn failures_are_aggregated() {
        let (provider, _db, root) = setup();
        root.add(Node::File(File::from_bytes(name("a"), CONTENTS_A.clone())))
            .unwrap();
        root.add(Node::File(File::from_bytes(name("b"), CONTENTS_B.clone())))
            .unwrap();
        provider.create_directories(&p("out")).unwrap();
        provider.set_read_only(true);

        match root.synchronize(Arc::new(CommonVisitPredicate::Everything)) {
            Err(Error::SynchronizationFailed(errors)) => assert_eq!(2, errors.len()),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn keeps_extra_names() {
        struct KeepStray;
        impl crate::tree::DirectoryVisitPredicate for KeepStray {
            fn visit_file(&self, _: &PathComponent, _: &File) -> bool {
                true
            }
            fn visit_directory(&self, _: &PathComponent, _: &Directory) -> bool {
                true
            }
            fn directory_visitor(
                &self,
                _: &PathComponent,
                _: &Directory,
            ) -> Option<Arc<dyn crate::tree::DirectoryVisitPredicate>> {
                None
            }
            fn synchronize_files_to_keep(&self) -> Option<BTreeSet<PathComponent>> {
                Some(BTreeSet::from([name("keep")]))
            }
        }

        let (provider, db, _) = setup();
        provider.create_directories(&p("out")).unwrap();
        for stray in ["out/keep", "out/drop"] {
            provider
                .set_file_bytes(&p(stray), b"x")
                .unwrap();
        }
        // a synthetic directory, synchronized to an explicit location.
        let dir = Directory::new_root();
        dir.add(File::from_bytes(name("a"), CONTENTS_A.clone()).into())
            .unwrap();
        let key = ProviderPathKey::new(Arc::new(provider.clone()), "out".parse().unwrap());
        dir.synchronize_to(&db, &key, Arc::new(KeepStray), &Default::default())
            .unwrap();

        let names: BTreeSet<_> = provider
            .list_directory(key.path())
            .unwrap()
            .into_keys()
            .collect();
        assert_eq!(BTreeSet::from([name("a"), name("keep")]), names);
    }
}
