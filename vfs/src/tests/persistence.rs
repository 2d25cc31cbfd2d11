use pretty_assertions::assert_eq;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tempfile::TempDir;

use crate::database::{ContentDatabase, DatabaseConfig, WriteProtection};
use crate::fixtures::{CONTENTS_A, CONTENTS_B};
use crate::path::{Path, PathBuf, PathComponent};
use crate::provider::{
    FileProvider, LocalFileProvider, MemoryFileProvider, ProviderKey, ProviderPathKey,
};
use crate::tree::{CommonVisitPredicate, Directory, File, Node};
use crate::Error;

fn name(s: &str) -> PathComponent {
    s.try_into().unwrap()
}

fn p(s: &str) -> PathBuf {
    s.parse().unwrap()
}

fn tree() -> Arc<Directory> {
    let dir = Directory::new_root();
    dir.add(Node::File(File::from_bytes(name("a"), CONTENTS_A.clone())))
        .unwrap();
    let sub = dir.get_directory_create(&name("sub")).unwrap();
    sub.add(Node::File(File::from_bytes(name("b"), CONTENTS_B.clone())))
        .unwrap();
    dir
}

#[test]
fn strays_are_deleted() {
    let tmpdir = TempDir::new().unwrap();
    for stray in ["a", "b", "c"] {
        std::fs::write(tmpdir.path().join(stray), b"stray").unwrap();
    }
    std::fs::create_dir(tmpdir.path().join("d")).unwrap();
    std::fs::write(tmpdir.path().join("d/e"), b"stray").unwrap();

    let provider = Arc::new(LocalFileProvider::new(tmpdir.path()).unwrap());
    let db = ContentDatabase::in_memory();
    let dir = Directory::new_root();
    dir.add(Node::File(File::from_bytes(name("a"), CONTENTS_A.clone())))
        .unwrap();

    dir.synchronize_to(
        &db,
        &ProviderPathKey::new(provider, PathBuf::new()),
        Arc::new(CommonVisitPredicate::Everything),
        &Default::default(),
    )
    .unwrap();

    let names: BTreeSet<_> = std::fs::read_dir(tmpdir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(BTreeSet::from(["a".to_string()]), names);
    assert_eq!(
        CONTENTS_A.to_vec(),
        std::fs::read(tmpdir.path().join("a")).unwrap()
    );
}

#[test]
fn reopened_database_skips_writes() {
    let snapshots = TempDir::new().unwrap();
    let config = DatabaseConfig {
        snapshot: Some(snapshots.path().join("content.db")),
        ..Default::default()
    };
    let provider_key = ProviderKey::from_uuid(uuid::Uuid::new_v4());
    let provider = MemoryFileProvider::new(provider_key);
    let key = ProviderPathKey::new(Arc::new(provider.clone()), p("out"));

    let db = ContentDatabase::open(config.clone());
    tree()
        .synchronize_to(
            &db,
            &key,
            Arc::new(CommonVisitPredicate::Everything),
            &Default::default(),
        )
        .unwrap();
    assert_eq!(2, provider.write_count());
    db.close().unwrap();

    // a provider with the same key is considered the same location.
    let db = ContentDatabase::open(config);
    let key = ProviderPathKey::new(Arc::new(provider.clone()), p("out"));
    tree()
        .synchronize_to(
            &db,
            &key,
            Arc::new(CommonVisitPredicate::Everything),
            &Default::default(),
        )
        .unwrap();
    assert_eq!(2, provider.write_count());
}

#[test]
fn protected_location_is_untouched() {
    let tmpdir = TempDir::new().unwrap();
    std::fs::write(tmpdir.path().join("precious"), b"keep me").unwrap();
    let provider = Arc::new(LocalFileProvider::new(tmpdir.path()).unwrap());

    let db = ContentDatabase::in_memory();
    let enabled = HashMap::from([(provider.provider_key(), BTreeSet::from([p("build")]))]);
    db.set_protection(Some(WriteProtection::new(
        enabled,
        Arc::new(|_: &ProviderKey, _: &Path| false),
    )));

    let key = ProviderPathKey::new(provider.clone(), PathBuf::new());
    let err = File::from_bytes(name("precious"), CONTENTS_A.clone())
        .synchronize_to(&db, &key.child(&name("precious")))
        .expect_err("must be denied");
    assert!(matches!(err, Error::WriteForbidden { .. }));
    assert_eq!(
        b"keep me".to_vec(),
        std::fs::read(tmpdir.path().join("precious")).unwrap()
    );

    // writes below enabled directories don't ask.
    tree()
        .synchronize_to(
            &db,
            &key.child(&name("build")),
            Arc::new(CommonVisitPredicate::Everything),
            &Default::default(),
        )
        .unwrap();
    assert_eq!(
        CONTENTS_B.to_vec(),
        std::fs::read(tmpdir.path().join("build/sub/b")).unwrap()
    );
}
