use deep_index::cancel::CancellationToken;
use deep_index::config::{AppConfig, Watermarks};
use deep_index::model::{folder_path, EntryStatus};
use deep_index::queue::{job, UpdateQueue};
use deep_index::scheduler::{AlwaysIdle, ManualIdle, Scheduler, SchedulerEnv};
use deep_index::storage::{shared, Database, SharedDb};
use deep_index::Indexer;
use parking_lot::Mutex;
use std::fs;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn register_root(db: &SharedDb, dir: &Path) -> i64 {
    let path = folder_path(&dir.canonicalize().unwrap());
    let mut live = deep_index::lister::directory::stat(&path).unwrap().unwrap();
    live.path = path;
    db.lock_high().insert_root(&live).unwrap()
}

/// Step until `done` holds, letting queued work finish between steps.
fn step_until(scheduler: &mut Scheduler, max_steps: usize, done: impl Fn(&Database) -> bool) -> bool {
    for _ in 0..max_steps {
        scheduler.step();
        scheduler.env().insertable.wait_idle();
        scheduler.env().maintenance.wait_idle();
        scheduler.env().updates.wait_drained();
        if done(&scheduler.env().db.lock_high()) {
            return true;
        }
    }
    false
}

#[test]
fn test_insertable_backpressure_hysteresis() {
    let db = shared(Database::open_in_memory().unwrap());
    let updates = UpdateQueue::start(Arc::clone(&db)).unwrap();
    let config = AppConfig {
        insertable_watermarks: Watermarks::new(2, 4),
        crawl_threads: 1,
        ..AppConfig::default()
    };
    let env = SchedulerEnv::new(db, config, Arc::clone(&updates), CancellationToken::new());

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Arc::new(Mutex::new(release_rx));
    for _ in 0..4 {
        let rx = Arc::clone(&release_rx);
        env.insertable
            .enqueue(
                1,
                None,
                job(move |_| {
                    rx.lock().recv_timeout(Duration::from_secs(5)).ok();
                    Ok(())
                }),
            )
            .unwrap();
    }
    assert!(!env.admits_insertable());

    // Down to 3: still above the low mark, still blocked.
    release_tx.send(()).unwrap();
    while env.insertable.len() > 3 {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(!env.admits_insertable());

    for _ in 0..3 {
        release_tx.send(()).unwrap();
    }
    env.insertable.wait_idle();
    assert!(env.admits_insertable());

    env.insertable.close();
    updates.close();
}

#[test]
fn test_scheduler_finds_duplicates() {
    let dir = tempdir().unwrap();
    let payload = vec![7u8; 4096];
    fs::write(dir.path().join("one.bin"), &payload).unwrap();
    fs::create_dir(dir.path().join("nested")).unwrap();
    fs::write(dir.path().join("nested").join("two.bin"), &payload).unwrap();
    fs::write(dir.path().join("other.bin"), vec![8u8; 4096]).unwrap();

    let db = shared(Database::open_in_memory().unwrap());
    let updates = UpdateQueue::start(Arc::clone(&db)).unwrap();
    register_root(&db, dir.path());
    let mut scheduler = Scheduler::new(
        Arc::clone(&db),
        AppConfig::default(),
        Arc::clone(&updates),
        Arc::new(AlwaysIdle),
    );

    let found = step_until(&mut scheduler, 200, |db| {
        db.equality_count().unwrap() == 1
            && db.stats().unwrap().dedupable_bytes == 4096
    });
    assert!(found, "duplicate pair was not confirmed");

    let guard = db.lock_high();
    let pairs = guard.duplicate_pairs(0, 10).unwrap();
    assert_eq!(pairs.len(), 1);
    let mut names = vec![pairs[0].path1.clone(), pairs[0].path2.clone()];
    names.sort();
    assert!(names[0].ends_with("nested/two.bin"));
    assert!(names[1].ends_with("one.bin"));
    drop(guard);

    scheduler.shutdown();
    updates.close();
}

#[test]
fn test_scheduler_builds_closure_and_cleans_orphans() {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("a").join("b")).unwrap();
    fs::write(dir.path().join("a").join("b").join("leaf.txt"), b"leaf").unwrap();

    let db = shared(Database::open_in_memory().unwrap());
    let updates = UpdateQueue::start(Arc::clone(&db)).unwrap();
    let root = register_root(&db, dir.path());
    let mut scheduler = Scheduler::new(
        Arc::clone(&db),
        AppConfig::default(),
        Arc::clone(&updates),
        Arc::new(AlwaysIdle),
    );

    let built = step_until(&mut scheduler, 200, |db| {
        db.descendant_count(root).unwrap() == 3
    });
    assert!(built, "closure never covered the tree");

    let leaf_dir = db
        .lock_high()
        .entry_by_path(&format!(
            "{}a/",
            folder_path(&dir.path().canonicalize().unwrap())
        ))
        .unwrap()
        .unwrap();
    db.lock_high().orphanize_entry(leaf_dir.id).unwrap();

    let cleaned = step_until(&mut scheduler, 200, |db| {
        db.stats().unwrap().orphans == 0 && db.descendant_count(root).unwrap() == 0
    });
    assert!(cleaned, "orphaned subtree was not reaped");

    scheduler.shutdown();
    updates.close();
}

#[test]
fn test_busy_host_suspends_scheduler() {
    let db = shared(Database::open_in_memory().unwrap());
    let updates = UpdateQueue::start(Arc::clone(&db)).unwrap();
    let probe = Arc::new(ManualIdle::default());
    probe.set_busy(true);
    let config = AppConfig {
        idle_threshold_secs: 60,
        ..AppConfig::default()
    };
    let mut scheduler = Scheduler::new(Arc::clone(&db), config, Arc::clone(&updates), probe.clone());

    let step = scheduler.step();
    assert!(step.suspended);
    assert_eq!(step.ran, 0);

    probe.set_busy(false);
    let step = scheduler.step();
    assert!(!step.suspended);

    scheduler.shutdown();
    updates.close();
}

#[test]
fn test_foreground_preempts_background_registrant() {
    let dir = tempdir().unwrap();
    let indexer =
        Indexer::with_database(AppConfig::default(), Database::open_in_memory().unwrap()).unwrap();
    indexer.add_root(dir.path()).unwrap();

    let db = Arc::clone(indexer.db());
    let order = Arc::new(Mutex::new(Vec::new()));
    let holder = db.lock_low();

    let background = {
        let db = Arc::clone(&db);
        let order = Arc::clone(&order);
        thread::spawn(move || {
            let _g = db.lock_low();
            order.lock().push("background");
        })
    };
    while db.waiting_count() < 1 {
        thread::sleep(Duration::from_millis(1));
    }

    thread::scope(|s| {
        let foreground = s.spawn(|| {
            indexer.foreground(|db| {
                assert_eq!(db.stats().unwrap().folders, 1);
            });
            order.lock().push("foreground");
        });
        while db.waiting_count() < 2 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(db.has_waiting_high());
        drop(holder);
        foreground.join().unwrap();
    });
    background.join().unwrap();

    assert_eq!(*order.lock(), vec!["foreground", "background"]);
}

#[test]
fn test_status_after_background_crawl() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("f.txt"), b"data").unwrap();
    let mut indexer =
        Indexer::with_database(AppConfig::default(), Database::open_in_memory().unwrap()).unwrap();
    indexer.add_root(dir.path()).unwrap();
    indexer.start(Arc::new(AlwaysIdle)).unwrap();

    let mut clean = false;
    for _ in 0..500 {
        let stats = indexer.stats().unwrap();
        if stats.files == 1 && stats.dirty == 0 {
            clean = true;
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    indexer.shutdown();
    assert!(clean, "background crawl did not settle");

    let path = format!("{}f.txt", folder_path(&dir.path().canonicalize().unwrap()));
    let file = indexer.foreground(|db| db.entry_by_path(&path).unwrap().unwrap());
    assert_eq!(file.status, EntryStatus::Clean);
    assert!(file.entry.checksum.is_some());
}
