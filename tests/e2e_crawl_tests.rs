use deep_index::cancel::WorkerContext;
use deep_index::config::AppConfig;
use deep_index::equality::{self, EqualityMode};
use deep_index::lock::Priority;
use deep_index::model::{EntryStatus, EntryType};
use deep_index::reconciler::Dispatcher;
use deep_index::storage::{shared, CountingWriter, Database, DirectWriter, Mutation};
use deep_index::{Indexer, SilentReporter};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn build_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_700_000_000);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn indexer_for(dir: &Path) -> (Indexer, i64) {
    let indexer =
        Indexer::with_database(AppConfig::default(), Database::open_in_memory().unwrap()).unwrap();
    let root = indexer.add_root(dir).unwrap();
    (indexer, root)
}

/// A 100-byte file next to a tar holding one member: the first crawl
/// inserts and checksums everything, the second writes nothing.
#[test]
fn test_file_and_tar_scenario() {
    let dir = tempdir().unwrap();
    let content = vec![b'x'; 100];
    fs::write(dir.path().join("a.txt"), &content).unwrap();
    fs::write(
        dir.path().join("b.tar"),
        build_tar(&[("x.txt", b"inside the archive")]),
    )
    .unwrap();

    let db = shared(Database::open_in_memory().unwrap());
    let writer = Arc::new(CountingWriter::new(DirectWriter::new(
        Arc::clone(&db),
        Priority::High,
    )));
    let dispatcher = Dispatcher::new(Arc::clone(&db), writer.clone(), &AppConfig::default());
    let root_path = deep_index::model::folder_path(&dir.path().canonicalize().unwrap());
    let mut live = deep_index::lister::directory::stat(&root_path)
        .unwrap()
        .unwrap();
    live.path = root_path.clone();
    let root = db.lock_high().insert_root(&live).unwrap();
    let ctx = WorkerContext::foreground();

    let summary = dispatcher.crawl_once(&ctx, root).unwrap();
    assert_eq!(summary.disabled, 0);
    assert!(writer.mutations() > 0);

    {
        let guard = db.lock_high();
        let a = guard
            .entry_by_path(&format!("{}a.txt", root_path))
            .unwrap()
            .unwrap();
        assert_eq!(a.entry.size, 100);
        assert!(a.entry.checksum.is_some());
        assert_eq!(a.status, EntryStatus::Clean);

        let archive = guard
            .entry_by_path(&format!("{}b.tar", root_path))
            .unwrap()
            .unwrap();
        assert_eq!(archive.status, EntryStatus::Clean);
        assert!(archive.entry.checksum.is_some());

        let member = guard
            .entry_by_path(&format!("{}b.tar/x.txt", root_path))
            .unwrap()
            .unwrap();
        assert_eq!(member.entry_type(), EntryType::CompressedFile);
        assert_eq!(member.parent_id, Some(archive.id));
        assert_eq!(member.root_id, root);
        assert_eq!(member.entry.size, 18);
        assert!(member.entry.checksum.is_some());
        assert_eq!(member.status, EntryStatus::Clean);
    }

    writer.reset();
    dispatcher.crawl_once(&ctx, root).unwrap();
    assert_eq!(writer.mutations(), 0);
}

#[test]
fn test_nested_archive_members_are_reachable() {
    let dir = tempdir().unwrap();
    let inner = build_tar(&[("deep.txt", b"nested twice")]);
    let outer = build_tar(&[("docs/readme.txt", b"readme"), ("inner.tar", &inner)]);
    fs::write(dir.path().join("outer.tgz"), gzip(&outer)).unwrap();

    let (indexer, _) = indexer_for(dir.path());
    indexer.index_now(&SilentReporter).unwrap();

    let root_path = deep_index::model::folder_path(&dir.path().canonicalize().unwrap());
    indexer.foreground(|db| {
        let docs = db
            .entry_by_path(&format!("{}outer.tgz/docs/", root_path))
            .unwrap()
            .unwrap();
        assert_eq!(docs.entry_type(), EntryType::CompressedFolder);

        let readme = db
            .entry_by_path(&format!("{}outer.tgz/docs/readme.txt", root_path))
            .unwrap()
            .unwrap();
        assert_eq!(readme.parent_id, Some(docs.id));

        let deep = db
            .entry_by_path(&format!("{}outer.tgz/inner.tar/deep.txt", root_path))
            .unwrap()
            .unwrap();
        assert_eq!(deep.entry.size, 12);
        assert!(deep.entry.checksum.is_some());
    });
}

#[test]
fn test_gzip_member_matches_plain_copy() {
    let dir = tempdir().unwrap();
    let content = b"the same bytes in two places".to_vec();
    fs::write(dir.path().join("plain.txt"), &content).unwrap();
    fs::write(dir.path().join("packed.txt.gz"), gzip(&content)).unwrap();

    let (indexer, _) = indexer_for(dir.path());
    indexer.index_now(&SilentReporter).unwrap();

    let root_path = deep_index::model::folder_path(&dir.path().canonicalize().unwrap());
    let (plain, member) = indexer.foreground(|db| {
        (
            db.entry_by_path(&format!("{}plain.txt", root_path))
                .unwrap()
                .unwrap(),
            db.entry_by_path(&format!("{}packed.txt.gz/packed.txt", root_path))
                .unwrap()
                .unwrap(),
        )
    });
    assert_eq!(plain.entry.checksum, member.entry.checksum);

    let ctx = WorkerContext::foreground();
    let registry = Arc::new(deep_index::lister::ListerRegistry::new(
        &AppConfig::default().archive_extensions,
    ));
    assert!(equality::check_equality(
        &ctx,
        indexer.db(),
        &registry,
        &plain,
        &member,
        EqualityMode::Bytes
    )
    .unwrap());
    let mutation =
        equality::verify_pair(&ctx, indexer.db(), &registry, &plain, &member).unwrap();
    assert!(matches!(mutation, Mutation::UpsertEquality(_)));
}

#[test]
fn test_removed_archive_member_is_orphaned() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("set.tar");
    fs::write(&path, build_tar(&[("one.txt", b"1"), ("two.txt", b"2")])).unwrap();

    let (indexer, _) = indexer_for(dir.path());
    indexer.index_now(&SilentReporter).unwrap();

    // Rewritten within the same second at the same length, the archive can
    // look unchanged; flag it for re-listing.
    fs::write(&path, build_tar(&[("one.txt", b"1"), ("three.txt", b"333")])).unwrap();
    let root_path = deep_index::model::folder_path(&dir.path().canonicalize().unwrap());
    let archive = indexer.foreground(|db| {
        db.entry_by_path(&format!("{}set.tar", root_path))
            .unwrap()
            .unwrap()
    });
    indexer.foreground(|db| db.update_status(archive.id, EntryStatus::Dirty).unwrap());
    indexer.index_now(&SilentReporter).unwrap();

    indexer.foreground(|db| {
        let two = db
            .entry_by_path(&format!("{}set.tar/two.txt", root_path))
            .unwrap()
            .unwrap();
        assert!(two.orphan);
        let three = db
            .entry_by_path(&format!("{}set.tar/three.txt", root_path))
            .unwrap()
            .unwrap();
        assert!(!three.orphan);
        assert_eq!(three.entry.size, 3);
    });
}
