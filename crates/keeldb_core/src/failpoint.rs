//! Named crash points for fault-injection tests.
//!
//! A failpoint is armed per thread with [`enable`], or process-wide through
//! the `KEELDB_FAILPOINTS` environment variable (comma-separated names). The
//! variable is read once, on the first failpoint check in the process.
//! Armed points make [`maybe_fail`] return an error at that spot.
//!
//! Points compiled into the engine:
//!
//! - `wal.before_flush`: commit record appended, not yet flushed
//! - `commit.before_publish`: commit record durable, new roots not yet visible
//! - `checkpoint.before_wal_clear`: superblock written, WAL not yet cleared

use std::cell::RefCell;
use std::collections::HashSet;
use std::io;
use std::sync::OnceLock;

/// Environment variable listing failpoints armed for every thread.
pub const FAILPOINTS_ENV: &str = "KEELDB_FAILPOINTS";

/// Commit record appended, not yet flushed.
pub const WAL_BEFORE_FLUSH: &str = "wal.before_flush";
/// Commit record durable, new roots not yet visible.
pub const COMMIT_BEFORE_PUBLISH: &str = "commit.before_publish";
/// Superblock durable, WAL not yet cleared.
pub const CHECKPOINT_BEFORE_WAL_CLEAR: &str = "checkpoint.before_wal_clear";

static ENV_FAILPOINTS: OnceLock<HashSet<String>> = OnceLock::new();

thread_local! {
    static FAILPOINTS: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
}

/// Arms `name` on the current thread.
pub fn enable(name: &str) {
    FAILPOINTS.with(|set| {
        set.borrow_mut().insert(name.to_string());
    });
}

/// Disarms `name` on the current thread.
pub fn disable(name: &str) {
    FAILPOINTS.with(|set| {
        set.borrow_mut().remove(name);
    });
}

/// Disarms every failpoint on the current thread.
pub fn clear() {
    FAILPOINTS.with(|set| set.borrow_mut().clear());
}

/// Whether `name` is armed for the current thread.
#[must_use]
pub fn is_enabled(name: &str) -> bool {
    if FAILPOINTS.with(|set| set.borrow().contains(name)) {
        return true;
    }
    env_failpoints().contains(name)
}

fn env_failpoints() -> &'static HashSet<String> {
    ENV_FAILPOINTS.get_or_init(|| {
        std::env::var(FAILPOINTS_ENV)
            .map(|raw| parse_list(&raw))
            .unwrap_or_default()
    })
}

fn parse_list(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Fails with an I/O error if `name` is armed.
pub fn maybe_fail(name: &str) -> io::Result<()> {
    if is_enabled(name) {
        tracing::debug!(failpoint = name, "failpoint triggered");
        Err(io::Error::other(format!("failpoint triggered: {name}")))
    } else {
        Ok(())
    }
}
