mod test_utils;

use crate::test_utils::{
    collect_keys, collect_keys_backward, insert_range, key, new_long_tree, setup, temp_db,
};

#[test]
fn test_forward_and_backward_scans_agree() {
    setup();
    let (_dir, db) = temp_db();

    let mut txn = db.begin_write().unwrap();
    let tree = new_long_tree(&mut txn, "t", 4);
    insert_range(&tree, &mut txn, 0..100);
    txn.commit().unwrap();

    let rtx = db.begin_read();
    let tree = rtx.open_tree("t").unwrap();

    let forward = collect_keys(&tree, &rtx);
    let mut backward = collect_keys_backward(&tree, &rtx);
    backward.reverse();

    assert_eq!(forward, (0..100).collect::<Vec<_>>());
    assert_eq!(forward, backward);
}

#[test]
fn test_browse_from_positions_at_first_key_geq() {
    setup();
    let (_dir, db) = temp_db();

    let mut txn = db.begin_write().unwrap();
    let tree = new_long_tree(&mut txn, "t", 4);
    // even keys only
    for k in (0..100).filter(|k| k % 2 == 0) {
        tree.insert(&mut txn, &key(k), b"v").unwrap();
    }
    txn.commit().unwrap();

    let rtx = db.begin_read();
    let tree = rtx.open_tree("t").unwrap();

    // exact hit
    let mut cursor = tree.browse_from(&rtx, &key(40)).unwrap();
    assert_eq!(cursor.next().unwrap().unwrap().0, key(40));

    // miss lands on the next larger key
    let mut cursor = tree.browse_from(&rtx, &key(41)).unwrap();
    assert_eq!(cursor.next().unwrap().unwrap().0, key(42));

    // beyond the last key: forward exhausted, backward walks the tail
    let mut cursor = tree.browse_from(&rtx, &key(1000)).unwrap();
    assert!(cursor.next().unwrap().is_none());
    let mut cursor = tree.browse_from(&rtx, &key(1000)).unwrap();
    assert_eq!(cursor.prev().unwrap().unwrap().0, key(98));
}

#[test]
fn test_cursor_direction_changes() {
    setup();
    let (_dir, db) = temp_db();

    let mut txn = db.begin_write().unwrap();
    let tree = new_long_tree(&mut txn, "t", 4);
    insert_range(&tree, &mut txn, 0..20);
    txn.commit().unwrap();

    let rtx = db.begin_read();
    let tree = rtx.open_tree("t").unwrap();
    let mut cursor = tree.browse_from(&rtx, &key(10)).unwrap();

    assert_eq!(cursor.next().unwrap().unwrap().0, key(10));
    assert_eq!(cursor.next().unwrap().unwrap().0, key(11));
    // stepping back re-reads what next just yielded
    assert_eq!(cursor.prev().unwrap().unwrap().0, key(11));
    assert_eq!(cursor.prev().unwrap().unwrap().0, key(10));
    assert_eq!(cursor.prev().unwrap().unwrap().0, key(9));
}

#[test]
fn test_cursor_restarts_from_either_end() {
    setup();
    let (_dir, db) = temp_db();

    let mut txn = db.begin_write().unwrap();
    let tree = new_long_tree(&mut txn, "t", 4);
    insert_range(&tree, &mut txn, 0..30);
    txn.commit().unwrap();

    let rtx = db.begin_read();
    let tree = rtx.open_tree("t").unwrap();
    let mut cursor = tree.browse(&rtx).unwrap();

    assert_eq!(cursor.next().unwrap().unwrap().0, key(0));
    cursor.after_last().unwrap();
    assert_eq!(cursor.prev().unwrap().unwrap().0, key(29));
    cursor.before_first().unwrap();
    assert_eq!(cursor.next().unwrap().unwrap().0, key(0));
}

#[test]
fn test_empty_tree_cursor() {
    setup();
    let (_dir, db) = temp_db();

    let mut txn = db.begin_write().unwrap();
    let tree = new_long_tree(&mut txn, "t", 4);

    let mut cursor = tree.browse(&txn).unwrap();
    assert!(cursor.next().unwrap().is_none());
    assert!(cursor.prev().unwrap().is_none());

    let mut cursor = tree.browse_from(&txn, &key(5)).unwrap();
    assert!(cursor.next().unwrap().is_none());
}

#[test]
fn test_scan_crosses_page_boundaries_both_ways() {
    setup();
    let (_dir, db) = temp_db();

    let mut txn = db.begin_write().unwrap();
    let tree = new_long_tree(&mut txn, "t", 4);
    // enough keys for a three-level tree at fanout 4
    insert_range(&tree, &mut txn, 0..250);
    txn.commit().unwrap();

    let rtx = db.begin_read();
    let tree = rtx.open_tree("t").unwrap();

    // zig-zag over a subtree boundary
    let mut cursor = tree.browse_from(&rtx, &key(125)).unwrap();
    let mut walked = Vec::new();
    for _ in 0..50 {
        walked.push(cursor.next().unwrap().unwrap().0);
    }
    for _ in 0..50 {
        assert!(cursor.prev().unwrap().is_some());
    }
    assert_eq!(cursor.next().unwrap().unwrap().0, walked[0]);
}
