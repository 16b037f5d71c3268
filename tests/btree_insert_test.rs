mod test_utils;

use mavi_db::{btree::serializer::LongSerializer, MaviError};
use rand::prelude::*;

use crate::test_utils::{
    assert_true, collect_keys, insert_range, key, leaf_counts, new_long_tree, setup,
    temp_db, tree_height, val,
};

#[test]
fn test_insert_and_get() {
    setup();
    let (_dir, db) = temp_db();

    let mut txn = db.begin_write().unwrap();
    let tree = new_long_tree(&mut txn, "t", 4);

    tree.insert(&mut txn, &key(1), b"a").unwrap();
    assert_eq!(tree.get(&txn, &key(1)).unwrap(), b"a");
    assert_eq!(tree.element_count(&txn).unwrap(), 1);

    let mut cursor = tree.browse(&txn).unwrap();
    assert_eq!(
        cursor.next().unwrap().unwrap(),
        (key(1), b"a".to_vec())
    );
    assert!(cursor.next().unwrap().is_none());
    txn.commit().unwrap();

    let rtx = db.begin_read();
    let tree = rtx.open_tree("t").unwrap();
    assert_eq!(tree.get(&rtx, &key(1)).unwrap(), b"a");
}

#[test]
fn test_sequential_inserts_build_two_levels() {
    setup();
    let (_dir, db) = temp_db();

    let mut txn = db.begin_write().unwrap();
    let tree = new_long_tree(&mut txn, "t", 4);
    insert_range(&tree, &mut txn, 1..11);

    // ten keys at fanout 4: one root node over a row of leaves
    tree.check_integrity(&txn).unwrap();
    assert_true(tree_height(&tree, &txn) == 2, &tree, &txn);
    assert_eq!(tree.element_count(&txn).unwrap(), 10);
    assert_eq!(collect_keys(&tree, &txn), (1..11).collect::<Vec<_>>());

    // in-order insertion splits F+1 elements into a larger left half
    let counts = leaf_counts(&tree, &txn);
    assert_true(counts.iter().sum::<usize>() == 10, &tree, &txn);
    assert_true(counts.iter().all(|&n| n >= 2 && n <= 4), &tree, &txn);

    txn.commit().unwrap();
}

#[test]
fn test_insert_existing_key_replaces() {
    setup();
    let (_dir, db) = temp_db();

    let mut txn = db.begin_write().unwrap();
    let tree = new_long_tree(&mut txn, "t", 4);

    assert_eq!(tree.insert(&mut txn, &key(7), b"one").unwrap(), None);
    let old = tree.insert(&mut txn, &key(7), b"two").unwrap();
    assert_eq!(old.unwrap(), b"one");
    assert_eq!(tree.get(&txn, &key(7)).unwrap(), b"two");
    // a replacement is not an addition
    assert_eq!(tree.element_count(&txn).unwrap(), 1);
}

#[test]
fn test_get_missing_key() {
    setup();
    let (_dir, db) = temp_db();

    let mut txn = db.begin_write().unwrap();
    let tree = new_long_tree(&mut txn, "t", 4);
    tree.insert(&mut txn, &key(1), b"a").unwrap();

    match tree.get(&txn, &key(2)) {
        Err(MaviError::NotFound) => {}
        other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
    }
    assert!(!tree.contains(&txn, &key(2)).unwrap());
}

#[test]
fn test_random_inserts_keep_invariants() {
    setup();
    let (_dir, db) = temp_db();

    let mut keys: Vec<u64> = (0..500).collect();
    keys.shuffle(&mut rand::thread_rng());

    let mut txn = db.begin_write().unwrap();
    let tree = new_long_tree(&mut txn, "t", 8);
    for &k in &keys {
        tree.insert(&mut txn, &key(k), &val(k)).unwrap();
    }

    tree.check_integrity(&txn).unwrap();
    assert_eq!(tree.element_count(&txn).unwrap(), 500);
    assert_eq!(collect_keys(&tree, &txn), (0..500).collect::<Vec<_>>());
    txn.commit().unwrap();

    // and again through a fresh snapshot
    let rtx = db.begin_read();
    let tree = rtx.open_tree("t").unwrap();
    tree.check_integrity(&rtx).unwrap();
    assert_eq!(tree.get(&rtx, &key(250)).unwrap(), val(250));
}

#[test]
fn test_deep_tree_from_many_inserts() {
    setup();
    let (_dir, db) = temp_db();

    let mut txn = db.begin_write().unwrap();
    let tree = new_long_tree(&mut txn, "t", 4);
    insert_range(&tree, &mut txn, 0..300);

    tree.check_integrity(&txn).unwrap();
    assert_true(tree_height(&tree, &txn) >= 3, &tree, &txn);
    assert_eq!(collect_keys(&tree, &txn), (0..300).collect::<Vec<_>>());
    txn.commit().unwrap();
}

#[test]
fn test_fanout_is_normalized() {
    setup();
    let (_dir, db) = temp_db();

    let mut txn = db.begin_write().unwrap();
    // 6 rounds up to 8
    let tree = new_long_tree(&mut txn, "t", 6);
    assert_eq!(tree.fanout(), 8);
}

#[test]
fn test_create_tree_rejects_bad_arguments() {
    setup();
    let (_dir, db) = temp_db();

    let mut txn = db.begin_write().unwrap();
    match txn.create_tree("t", mavi_db::btree::serializer::LONG_SERIALIZER, 3, 2) {
        Err(MaviError::InvalidArgument(_)) => {}
        _ => panic!("fanout 2 must be rejected"),
    }
    match txn.create_tree("#internal", 1, 3, 8) {
        Err(MaviError::InvalidArgument(_)) => {}
        _ => panic!("reserved names must be rejected"),
    }

    new_long_tree(&mut txn, "t", 4);
    match txn.create_tree("t", 1, 3, 8) {
        Err(MaviError::AlreadyExists(name)) => assert_eq!(name, "t"),
        _ => panic!("duplicate tree name must be rejected"),
    }
}

#[test]
fn test_string_keys_sort_lexicographically() {
    setup();
    let (_dir, db) = temp_db();

    let mut txn = db.begin_write().unwrap();
    let tree = txn
        .create_tree(
            "names",
            mavi_db::btree::serializer::STRING_SERIALIZER,
            mavi_db::btree::serializer::STRING_SERIALIZER,
            4,
        )
        .unwrap();

    for name in ["delta", "alpha", "charlie", "bravo", "echo"].iter() {
        tree.insert(&mut txn, name.as_bytes(), b"x").unwrap();
    }

    let mut cursor = tree.browse(&txn).unwrap();
    let mut seen = Vec::new();
    while let Some((k, _)) = cursor.next().unwrap() {
        seen.push(String::from_utf8(k).unwrap());
    }
    assert_eq!(seen, ["alpha", "bravo", "charlie", "delta", "echo"]);
}

#[test]
fn test_large_values_span_physical_pages() {
    setup();
    let (_dir, db) = temp_db();

    // value far bigger than one 4096-byte physical page
    let big: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();

    let mut txn = db.begin_write().unwrap();
    let tree = new_long_tree(&mut txn, "t", 4);
    tree.insert(&mut txn, &key(1), &big).unwrap();
    tree.insert(&mut txn, &key(2), b"small").unwrap();
    txn.commit().unwrap();

    let rtx = db.begin_read();
    let tree = rtx.open_tree("t").unwrap();
    assert_eq!(tree.get(&rtx, &key(1)).unwrap(), big);
    assert_eq!(tree.get(&rtx, &key(2)).unwrap(), b"small");
    assert_eq!(
        LongSerializer::decode(&key(2)).unwrap(),
        2,
        "sanity: key codec round-trips"
    );
}
