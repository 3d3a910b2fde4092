//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random test data that stays within
//! the engine's limits, plus a reference model to check results against.

use keeldb_core::{CoreResult, Database, MAX_KEY_SIZE};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Strategy for generating valid table tags.
pub fn table_tag_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_.-]{0,15}").expect("Invalid regex")
}

/// Strategy for keys drawn from a small space, so operations collide.
pub fn small_key_strategy() -> impl Strategy<Value = Vec<u8>> {
    (0u8..48).prop_map(|k| vec![b'k', k])
}

/// Strategy for arbitrary keys up to the size limit.
pub fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        4 => prop::collection::vec(any::<u8>(), 0..32),
        1 => prop::collection::vec(any::<u8>(), 0..=MAX_KEY_SIZE),
    ]
}

/// Strategy for values: mostly inline sizes, sometimes overflow chains.
pub fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        6 => prop::collection::vec(any::<u8>(), 0..256),
        2 => prop::collection::vec(any::<u8>(), 256..2048),
        1 => prop::collection::vec(any::<u8>(), 4000..20_000),
    ]
}

/// One step of a generated workload.
#[derive(Debug, Clone)]
pub enum TableOperation {
    /// Write a key.
    Write {
        /// Table index into the workload's table list.
        table: usize,
        /// Key bytes.
        key: Vec<u8>,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Delete a key.
    Delete {
        /// Table index.
        table: usize,
        /// Key bytes.
        key: Vec<u8>,
    },
    /// Write several keys in one transaction.
    Batch {
        /// Table index.
        table: usize,
        /// Key-value pairs.
        pairs: Vec<(Vec<u8>, Vec<u8>)>,
    },
    /// Force a checkpoint.
    Checkpoint,
}

/// Strategy for one operation over `tables` tables.
pub fn table_operation_strategy(tables: usize) -> impl Strategy<Value = TableOperation> {
    let table = 0..tables.max(1);
    prop_oneof![
        6 => (table.clone(), small_key_strategy(), value_strategy())
            .prop_map(|(table, key, value)| TableOperation::Write { table, key, value }),
        2 => (table.clone(), small_key_strategy())
            .prop_map(|(table, key)| TableOperation::Delete { table, key }),
        1 => (table, prop::collection::vec((small_key_strategy(), value_strategy()), 1..6))
            .prop_map(|(table, pairs)| TableOperation::Batch { table, pairs }),
        1 => Just(TableOperation::Checkpoint),
    ]
}

/// Strategy for generating a sequence of operations.
pub fn operation_sequence_strategy(
    tables: usize,
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<TableOperation>> {
    prop::collection::vec(table_operation_strategy(tables), min_ops..max_ops)
}

/// Reference model: what every table should contain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Model {
    /// Expected contents per table tag.
    pub tables: BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl Model {
    /// Records the effect of `op` after it committed.
    pub fn apply(&mut self, tags: &[String], op: &TableOperation) {
        match op {
            TableOperation::Write { table, key, value } => {
                self.table_mut(&tags[*table]).insert(key.clone(), value.clone());
            }
            TableOperation::Delete { table, key } => {
                self.table_mut(&tags[*table]).remove(key);
            }
            TableOperation::Batch { table, pairs } => {
                let t = self.table_mut(&tags[*table]);
                for (key, value) in pairs {
                    t.insert(key.clone(), value.clone());
                }
            }
            TableOperation::Checkpoint => {}
        }
        self.tables.retain(|_, t| !t.is_empty());
    }

    fn table_mut(&mut self, tag: &str) -> &mut BTreeMap<Vec<u8>, Vec<u8>> {
        self.tables.entry(tag.to_string()).or_default()
    }

    /// Reads the database's full contents into a model.
    pub fn read_from(db: &Database) -> CoreResult<Self> {
        let mut model = Self::default();
        for tag in db.tables()? {
            let rows = db
                .table(tag.as_str())?
                .range(std::ops::Bound::Unbounded, std::ops::Bound::Unbounded)?;
            model.tables.insert(tag.to_string(), rows.into_iter().collect());
        }
        Ok(model)
    }
}

/// Runs `op` against the database.
pub fn execute(db: &Database, tags: &[String], op: &TableOperation) -> CoreResult<()> {
    match op {
        TableOperation::Write { table, key, value } => db.table(&tags[*table])?.write(key, value),
        TableOperation::Delete { table, key } => {
            db.table(&tags[*table])?.delete(key)?;
            Ok(())
        }
        TableOperation::Batch { table, pairs } => {
            let t = db.table(&tags[*table])?;
            db.transaction(|txn| {
                for (key, value) in pairs {
                    txn.put(t.tag(), key, value)?;
                }
                Ok(())
            })
        }
        TableOperation::Checkpoint => db.checkpoint(),
    }
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 64,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 16,
            max_shrink_iters: 100,
        }
    }

    /// Converts into a proptest runner configuration.
    #[must_use]
    pub fn to_proptest(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeldb_core::TableTag;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest())]

        #[test]
        fn generated_tags_are_valid(tag in table_tag_strategy()) {
            prop_assert!(TableTag::new(tag).is_ok());
        }

        #[test]
        fn workload_matches_model(ops in operation_sequence_strategy(3, 1, 40)) {
            let tags: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
            let db = Database::open_in_memory().unwrap();
            let mut model = Model::default();
            for op in &ops {
                execute(&db, &tags, op).unwrap();
                model.apply(&tags, op);
            }
            prop_assert_eq!(Model::read_from(&db).unwrap(), model);
        }
    }
}
