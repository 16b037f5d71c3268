mod test_utils;

use std::{sync::Arc, thread};

use mavi_db::{Database, DbConfig};

use crate::test_utils::{collect_keys, insert_range, key, new_long_tree, setup, val, DB_FILE};

fn shared_db() -> (tempfile::TempDir, Arc<Database>) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join(DB_FILE), DbConfig::default()).unwrap();
    (dir, Arc::new(db))
}

#[test]
fn test_pinned_reader_is_isolated_from_commits() {
    setup();
    let (_dir, db) = shared_db();

    let mut txn = db.begin_write().unwrap();
    let tree = new_long_tree(&mut txn, "t", 8);
    insert_range(&tree, &mut txn, 0..100);
    txn.commit().unwrap();

    let (pinned_tx, pinned_rx) = crossbeam::channel::bounded::<()>(0);
    let (committed_tx, committed_rx) = crossbeam::channel::bounded::<()>(0);

    let reader_db = Arc::clone(&db);
    let reader = thread::spawn(move || {
        let rtx = reader_db.begin_read();
        let tree = rtx.open_tree("t").unwrap();
        assert_eq!(collect_keys(&tree, &rtx), (0..100).collect::<Vec<_>>());

        // let the writer commit while we stay pinned
        pinned_tx.send(()).unwrap();
        committed_rx.recv().unwrap();

        // identical results before and after the commit
        assert_eq!(collect_keys(&tree, &rtx), (0..100).collect::<Vec<_>>());
        assert!(!tree.contains(&rtx, &key(100)).unwrap());
        tree.check_integrity(&rtx).unwrap();
    });

    pinned_rx.recv().unwrap();
    let mut txn = db.begin_write().unwrap();
    let tree = txn.open_tree("t").unwrap();
    insert_range(&tree, &mut txn, 100..200);
    txn.commit().unwrap();
    committed_tx.send(()).unwrap();

    reader.join().unwrap();

    let rtx = db.begin_read();
    let tree = rtx.open_tree("t").unwrap();
    assert_eq!(collect_keys(&tree, &rtx), (0..200).collect::<Vec<_>>());
}

#[test]
fn test_committed_keys_are_visible_to_readers() {
    setup();
    let (_dir, db) = shared_db();

    let mut txn = db.begin_write().unwrap();
    new_long_tree(&mut txn, "t", 8);
    txn.commit().unwrap();

    let (s, r) = crossbeam::channel::unbounded::<u64>();

    // every key arrives at the reader only after its commit, so a
    // fresh snapshot must always see it
    let reader_db = Arc::clone(&db);
    let reader = thread::spawn(move || {
        for k in r.iter() {
            let rtx = reader_db.begin_read();
            let tree = rtx.open_tree("t").unwrap();
            assert_eq!(tree.get(&rtx, &key(k)).unwrap(), val(k));
        }
    });

    for k in 0..200u64 {
        let mut txn = db.begin_write().unwrap();
        let tree = txn.open_tree("t").unwrap();
        tree.insert(&mut txn, &key(k), &val(k)).unwrap();
        txn.commit().unwrap();
        s.send(k).unwrap();
    }
    drop(s);
    reader.join().unwrap();
}

#[test]
fn test_many_readers_across_churning_writer() {
    setup();
    let (_dir, db) = shared_db();

    let mut txn = db.begin_write().unwrap();
    let tree = new_long_tree(&mut txn, "t", 8);
    insert_range(&tree, &mut txn, 0..500);
    txn.commit().unwrap();

    let (stop_tx, stop_rx) = crossbeam::channel::bounded::<()>(0);

    let mut readers = Vec::new();
    for _ in 0..4 {
        let reader_db = Arc::clone(&db);
        let stop = stop_rx.clone();
        readers.push(thread::spawn(move || {
            let mut scans = 0usize;
            while let Err(crossbeam::channel::TryRecvError::Empty) = stop.try_recv() {
                let rtx = reader_db.begin_read();
                let tree = rtx.open_tree("t").unwrap();
                // whatever the pinned revision holds must be a complete
                // consistent range starting at some lower bound
                let keys = collect_keys(&tree, &rtx);
                assert_eq!(keys.len() as u64, tree.element_count(&rtx).unwrap());
                assert!(keys.windows(2).all(|w| w[0] < w[1]));
                scans += 1;
            }
            scans
        }));
    }

    // churn: drop the lowest hundred, append a new hundred
    for round in 0..20u64 {
        let mut txn = db.begin_write().unwrap();
        let tree = txn.open_tree("t").unwrap();
        for k in (round * 100)..(round * 100 + 100) {
            tree.delete(&mut txn, &key(k)).unwrap();
        }
        insert_range(&tree, &mut txn, (round + 5) * 100..(round + 6) * 100);
        txn.commit().unwrap();
    }

    drop(stop_tx);
    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }

    let rtx = db.begin_read();
    let tree = rtx.open_tree("t").unwrap();
    tree.check_integrity(&rtx).unwrap();
    assert_eq!(
        collect_keys(&tree, &rtx),
        (2000..2500).collect::<Vec<_>>()
    );
}

#[test]
fn test_writers_queue_on_the_writer_lock() {
    setup();
    let (_dir, db) = shared_db();

    let mut txn = db.begin_write().unwrap();
    new_long_tree(&mut txn, "t", 8);
    txn.commit().unwrap();

    let mut writers = Vec::new();
    for worker in 0..4u64 {
        let writer_db = Arc::clone(&db);
        writers.push(thread::spawn(move || {
            for i in 0..25u64 {
                let k = worker * 1000 + i;
                let mut txn = writer_db.begin_write().unwrap();
                let tree = txn.open_tree("t").unwrap();
                tree.insert(&mut txn, &key(k), &val(k)).unwrap();
                txn.commit().unwrap();
            }
        }));
    }
    for writer in writers {
        writer.join().unwrap();
    }

    let rtx = db.begin_read();
    let tree = rtx.open_tree("t").unwrap();
    tree.check_integrity(&rtx).unwrap();
    assert_eq!(tree.element_count(&rtx).unwrap(), 100);

    let expected: Vec<u64> = (0..4u64)
        .flat_map(|w| (w * 1000..w * 1000 + 25))
        .collect();
    assert_eq!(collect_keys(&tree, &rtx), expected);
}
