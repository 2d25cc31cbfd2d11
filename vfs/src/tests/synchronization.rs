//! Synchronization scenarios. Most of them run against every
//! [DatabaseConfig] flavour, using an [rstest_reuse] template.
use bytes::Bytes;
use pretty_assertions::assert_eq;
use rstest::rstest;
use rstest_reuse::{self, *};
use std::io::{self, Read};
use std::sync::{Arc, Barrier};
use tempfile::TempDir;

use crate::content::{ContentDescriptor, Md5Supplier};
use crate::database::{ContentDatabase, DatabaseConfig};
use crate::fixtures::{BytesUpdater, CONTENTS_A, CONTENTS_B, HASH_A, HASH_B};
use crate::path::{PathBuf, PathComponent};
use crate::provider::{FileProvider, LocalFileProvider, MemoryFileProvider, ProviderPathKey};
use crate::tree::{Directory, File, Node, StreamFactory};

fn name(s: &str) -> PathComponent {
    s.try_into().unwrap()
}

fn p(s: &str) -> PathBuf {
    s.parse().unwrap()
}

fn stream_of(data: Bytes) -> StreamFactory {
    Arc::new(move || Ok::<_, io::Error>(Box::new(io::Cursor::new(data.clone())) as Box<dyn Read + Send>))
}

#[template]
#[rstest]
#[case::md5(DatabaseConfig::from_url("memory://").unwrap())]
#[case::blake3(DatabaseConfig::from_url("memory://?supplier=blake3").unwrap())]
#[case::attributes(DatabaseConfig::from_url("memory://?supplier=attributes").unwrap())]
#[case::tracking(DatabaseConfig::from_url("memory://?track_attributes=true").unwrap())]
pub fn database_configs(#[case] config: DatabaseConfig) {}

#[apply(database_configs)]
fn file_sync_is_idempotent(config: DatabaseConfig) {
    let provider = MemoryFileProvider::default();
    let db = ContentDatabase::open(config);
    let root = Directory::backed_root(
        db.clone(),
        ProviderPathKey::new(Arc::new(provider.clone()), PathBuf::new()),
    );
    let file = File::from_bytes(name("out.txt"), CONTENTS_A.clone());
    root.add(Node::File(file.clone())).unwrap();

    file.synchronize().unwrap();
    file.synchronize().unwrap();

    assert_eq!(1, provider.write_count());
    assert_eq!(
        Some(HASH_A.clone()),
        db.content_descriptor(&file.location().unwrap().1)
    );
}

#[apply(database_configs)]
fn external_modification_is_corrected(config: DatabaseConfig) {
    let tmpdir = TempDir::new().unwrap();
    let provider = Arc::new(LocalFileProvider::new(tmpdir.path()).unwrap());
    let db = ContentDatabase::open(config);
    let key = ProviderPathKey::new(provider.clone(), p("file"));
    let updater = BytesUpdater::new(&key, CONTENTS_A.clone());

    db.synchronize(&key, HASH_A.clone(), &updater).unwrap();
    std::fs::write(tmpdir.path().join("file"), b"modified").unwrap();

    // without invalidation, the database trusts what it wrote.
    db.synchronize(&key, HASH_A.clone(), &updater).unwrap();
    assert_eq!(1, updater.calls());

    db.invalidate(key.key());
    db.synchronize(&key, HASH_A.clone(), &updater).unwrap();
    assert_eq!(2, updater.calls());
    assert_eq!(
        CONTENTS_A.to_vec(),
        std::fs::read(tmpdir.path().join("file")).unwrap()
    );
}

#[apply(database_configs)]
fn concurrent_sync_writes_once(config: DatabaseConfig) {
    let provider = MemoryFileProvider::default();
    let db = ContentDatabase::open(config);
    let key = ProviderPathKey::new(Arc::new(provider.clone()), p("shared"));
    let barrier = Barrier::new(8);

    // every caller brings its own updater, and only one of them may run.
    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (db, key, barrier) = (&db, &key, &barrier);
                s.spawn(move || {
                    let updater = BytesUpdater::new(key, CONTENTS_B.clone());
                    barrier.wait();
                    db.synchronize(key, HASH_B.clone(), &updater).unwrap();
                    (updater.calls(), db.content_descriptor(key))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(1, results.iter().map(|(calls, _)| calls).sum::<usize>());
    for (_, descriptor) in &results {
        assert_eq!(Some(HASH_B.clone()), *descriptor);
    }
    assert_eq!(1, provider.write_count());
    assert_eq!(CONTENTS_B.clone(), provider.read_all_bytes(&p("shared")).unwrap());
}

#[test]
fn streamed_read_records_hash() {
    let provider = MemoryFileProvider::default();
    let db = ContentDatabase::in_memory();
    let root = Directory::backed_root(
        db.clone(),
        ProviderPathKey::new(Arc::new(provider.clone()), p("out")),
    );
    let user = ContentDescriptor::Uuid(uuid::Uuid::nil());
    let file = File::from_stream(
        name("gen"),
        stream_of(CONTENTS_B.clone()),
        user.clone(),
    );
    root.add(Node::File(file.clone())).unwrap();

    // streams are read by writing them to disk first.
    assert_eq!(CONTENTS_B.clone(), file.bytes().unwrap());
    assert_eq!(CONTENTS_B.clone(), file.bytes().unwrap());
    assert_eq!(1, provider.write_count());

    let (_, key) = file.location().unwrap();
    let expected = db.handle(&key).expected().unwrap();
    assert_eq!(Md5Supplier::describe(&CONTENTS_B), *expected.disk);
    assert_eq!(user, *expected.user);
}

#[test]
fn write_to_streams_into_sink() {
    let provider = MemoryFileProvider::default();
    let db = ContentDatabase::in_memory();
    let root = Directory::backed_root(
        db,
        ProviderPathKey::new(Arc::new(provider.clone()), PathBuf::new()),
    );
    let file = File::from_stream(
        name("gen"),
        stream_of(CONTENTS_A.clone()),
        HASH_A.clone(),
    );
    root.add(Node::File(file.clone())).unwrap();

    let mut sink = Vec::new();
    file.write_to(&mut sink).unwrap();
    assert_eq!(CONTENTS_A.to_vec(), sink);
    assert_eq!(CONTENTS_A.clone(), provider.read_all_bytes(&p("gen")).unwrap());
}

#[apply(database_configs)]
fn deferred_token_writes_once(config: DatabaseConfig) {
    let provider = MemoryFileProvider::default();
    let db = ContentDatabase::open(config);
    let key = ProviderPathKey::new(Arc::new(provider.clone()), p("a"));
    let file = File::from_bytes(name("a"), Bytes::from_static(b"deferred"));

    let token = file
        .synchronize_deferred(&db, &key)
        .expect("must need a write");
    assert_eq!(0, provider.write_count());

    token.update().unwrap();
    token.update().unwrap();
    assert_eq!(1, provider.write_count());
    assert!(file.synchronize_deferred(&db, &key).is_none());
}

#[test]
fn provider_file_is_copied() {
    let provider = MemoryFileProvider::default();
    let db = ContentDatabase::in_memory();
    provider.set_file_bytes(&p("src"), &CONTENTS_A).unwrap();

    let source = File::from_provider(
        name("src"),
        db.clone(),
        ProviderPathKey::new(Arc::new(provider.clone()), p("src")),
    );
    let copy = File::delegate(name("dst"), source);
    let key = ProviderPathKey::new(Arc::new(provider.clone()), p("dst"));
    copy.synchronize_to(&db, &key).unwrap();

    assert_eq!(CONTENTS_A.clone(), provider.read_all_bytes(&p("dst")).unwrap());
    assert_eq!(Some(HASH_A.clone()), db.content_descriptor(&key));
}
