#![allow(dead_code)]

use std::ops::Range;

use tempfile::TempDir;

use mavi_db::{
    btree::serializer::{LongSerializer, BYTES_SERIALIZER, LONG_SERIALIZER},
    transaction::{Snapshot, WriteTransaction},
    utils, BTree, Database, DbConfig,
};

pub const DB_FILE: &str = "mavi.db";

/// Set up logging. Safe to call from every test.
pub fn setup() {
    utils::init_log();
}

pub fn temp_db() -> (TempDir, Database) {
    temp_db_with(DbConfig::default())
}

pub fn temp_db_with(config: DbConfig) -> (TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join(DB_FILE), config).unwrap();
    (dir, db)
}

/// Reopen the store living in `dir`, after the previous handle was
/// dropped.
pub fn reopen(dir: &TempDir) -> Database {
    Database::open(dir.path().join(DB_FILE), DbConfig::default()).unwrap()
}

pub fn key(k: u64) -> Vec<u8> {
    LongSerializer::encode(k)
}

pub fn val(k: u64) -> Vec<u8> {
    format!("value-{}", k).into_bytes()
}

pub fn new_long_tree(txn: &mut WriteTransaction, name: &str, fanout: u32) -> BTree {
    txn.create_tree(name, LONG_SERIALIZER, BYTES_SERIALIZER, fanout)
        .unwrap()
}

pub fn insert_range(tree: &BTree, txn: &mut WriteTransaction, range: Range<u64>) {
    for k in range {
        tree.insert(txn, &key(k), &val(k)).unwrap();
    }
}

pub fn delete_range(tree: &BTree, txn: &mut WriteTransaction, range: Range<u64>) {
    for k in range {
        tree.delete(txn, &key(k)).unwrap();
    }
}

/// All keys in cursor order, decoded.
pub fn collect_keys(tree: &BTree, txn: &dyn Snapshot) -> Vec<u64> {
    let mut cursor = tree.browse(txn).unwrap();
    let mut keys = Vec::new();
    while let Some((k, _)) = cursor.next().unwrap() {
        keys.push(LongSerializer::decode(&k).unwrap());
    }
    keys
}

/// All keys in reverse cursor order, decoded.
pub fn collect_keys_backward(tree: &BTree, txn: &dyn Snapshot) -> Vec<u64> {
    let mut cursor = tree.browse(txn).unwrap();
    cursor.after_last().unwrap();
    let mut keys = Vec::new();
    while let Some((k, _)) = cursor.prev().unwrap() {
        keys.push(LongSerializer::decode(&k).unwrap());
    }
    keys
}

/// Tree height in levels, read off the drawn shape: a lone leaf root
/// is height 1.
pub fn tree_height(tree: &BTree, txn: &dyn Snapshot) -> usize {
    let drawing = tree.draw_tree(txn).unwrap();
    drawing
        .lines()
        .skip(1)
        .map(|line| line.len() - line.trim_start().len())
        .max()
        .map(|indent| indent / 2 + 1)
        .unwrap_or(0)
}

/// Element counts of every leaf, left to right.
pub fn leaf_counts(tree: &BTree, txn: &dyn Snapshot) -> Vec<usize> {
    let drawing = tree.draw_tree(txn).unwrap();
    drawing
        .lines()
        .filter(|line| line.trim_start().starts_with("leaf["))
        .map(|line| {
            let n = line.split("n=").nth(1).unwrap();
            n.split_whitespace().next().unwrap().parse().unwrap()
        })
        .collect()
}

/// Assert with the tree shape dumped on failure.
pub fn assert_true(predicate: bool, tree: &BTree, txn: &dyn Snapshot) {
    if !predicate {
        eprintln!("assertion failed, tree shape:");
        eprintln!("{}", tree.draw_tree(txn).unwrap());
        tree.check_integrity(txn).unwrap();
        panic!("assertion failed");
    }
}
