//! Benchmark utilities.

use keeldb_core::{Database, Table};
use rand::Rng;

/// Generate random value bytes of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Fixed-width key for index `i`, so keys sort in insertion order.
pub fn key(i: usize) -> Vec<u8> {
    format!("key-{i:08}").into_bytes()
}

/// Generate `count` key-value pairs with values of `value_size` bytes.
pub fn generate_pairs(count: usize, value_size: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    (0..count).map(|i| (key(i), random_data(value_size))).collect()
}

/// Writes `count` pairs into `tag` in one transaction and returns the table.
pub fn populate(db: &Database, tag: &str, count: usize, value_size: usize) -> Table {
    let table = db.table(tag).expect("valid bench tag");
    let pairs = generate_pairs(count, value_size);
    db.transaction(|txn| {
        for (k, v) in &pairs {
            txn.put(table.tag(), k, v)?;
        }
        Ok(())
    })
    .expect("populate bench table");
    table
}
