//! End-to-end behavior of the table handle on real files.

use keeldb_core::{Database, Table};
use keeldb_testkit::prelude::*;
use std::ops::Bound;

#[test]
fn alice_bob_carol() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("db1");

    let mut users = Table::open(&root, "users").unwrap();
    users.write(b"alice", b"30").unwrap();
    users.write(b"bob", b"25").unwrap();
    assert_eq!(users.read(b"alice").unwrap(), Some(b"30".to_vec()));
    assert_eq!(users.read(b"carol").unwrap(), None);
    users.close().unwrap();

    let users = Table::open(&root, "users").unwrap();
    assert_eq!(users.read(b"alice").unwrap(), Some(b"30".to_vec()));
    assert_eq!(users.read(b"bob").unwrap(), Some(b"25".to_vec()));
    assert_eq!(users.read(b"carol").unwrap(), None);
}

#[test]
fn handles_on_one_root_share_state() {
    let dir = tempfile::tempdir().unwrap();
    let users = Table::open(dir.path(), "users").unwrap();
    let again = Table::open(dir.path(), "users").unwrap();
    let orders = Table::open(dir.path(), "orders").unwrap();

    users.write(b"alice", b"30").unwrap();
    assert_eq!(again.read(b"alice").unwrap(), Some(b"30".to_vec()));
    assert_eq!(orders.read(b"alice").unwrap(), None);
    assert_eq!(again.database().unwrap().recovery_report().replayed, 0);
}

#[test]
fn closing_one_handle_keeps_the_others_working() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = Table::open(dir.path(), "t").unwrap();
    let second = Table::open(dir.path(), "t").unwrap();

    first.write(b"k", b"v").unwrap();
    first.close().unwrap();
    assert!(!first.is_open());
    assert!(first.read(b"k").is_err());
    assert_eq!(second.read(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn overwrite_delete_and_listing() {
    let mut test_db = TestDatabase::file();
    let t = test_db.table("inventory").unwrap();
    t.write(b"apple", b"3").unwrap();
    t.write(b"pear", b"1").unwrap();
    t.write(b"apple", b"4").unwrap();
    t.write(b"fig", b"").unwrap();
    assert!(t.delete(b"pear").unwrap());
    assert!(!t.delete(b"pear").unwrap());

    test_db.reopen();
    let t = test_db.table("inventory").unwrap();
    assert_eq!(
        t.range(Bound::Unbounded, Bound::Unbounded).unwrap(),
        vec![
            (b"apple".to_vec(), b"4".to_vec()),
            (b"fig".to_vec(), Vec::new()),
        ]
    );
    assert!(t.read_entry(b"apple").unwrap().unwrap().updated_at > 0);
}

#[test]
fn large_population_survives_reopen() {
    let mut test_db = TestDatabase::file();
    let expected = scenarios::populate(&test_db.table("bulk").unwrap(), 1_500);
    test_db.reopen();

    let t = test_db.table("bulk").unwrap();
    assert_eq!(scenarios::contents(&t), expected);
    let report = test_db.verify().unwrap();
    assert_eq!(report.entries, 1_500);
    assert!(report.max_depth >= 2);
    assert_eq!(report.unaccounted, 0);
}

#[test]
fn emptied_tables_disappear() {
    with_file_db(|db: &Database, _root| {
        let t = db.table("gone").unwrap();
        t.write(b"only", b"1").unwrap();
        assert_eq!(db.tables().unwrap().len(), 1);
        t.delete(b"only").unwrap();
        assert!(db.tables().unwrap().is_empty());
        assert!(t.is_empty().unwrap());
    });
}
