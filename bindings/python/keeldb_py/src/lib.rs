//! Python bindings for keeldb.
//!
//! Exposes a single `Store(path, tag)` class backed by a [`keeldb_core::Table`].
//! Keys and values are `bytes`; blocking engine calls release the GIL.

use keeldb_core::{CoreError, Table};
use pyo3::create_exception;
use pyo3::exceptions::{PyException, PyOSError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyBytes;

/// Library version.
const VERSION: &str = env!("CARGO_PKG_VERSION");

create_exception!(keeldb, KeelError, PyException, "Base class for keeldb errors.");
create_exception!(keeldb, WriterBusyError, KeelError, "Another writer holds the database.");
create_exception!(keeldb, StorageFullError, KeelError, "The block file cannot grow.");
create_exception!(keeldb, CorruptionError, KeelError, "A block or log record failed validation.");
create_exception!(keeldb, CommitFailedError, KeelError, "The commit did not become durable.");
create_exception!(keeldb, RecoveryError, KeelError, "The database could not be recovered.");
create_exception!(keeldb, ClosedError, KeelError, "The store or database is closed.");

fn to_py_err(err: CoreError) -> PyErr {
    let message = err.to_string();
    match err {
        CoreError::PathUnavailable { .. } | CoreError::Io(_) => PyOSError::new_err(message),
        CoreError::InvalidArgument { .. } => PyValueError::new_err(message),
        CoreError::WriterBusy | CoreError::DatabaseLocked => WriterBusyError::new_err(message),
        CoreError::StorageFull { .. } => StorageFullError::new_err(message),
        CoreError::CorruptBlock { .. }
        | CoreError::WalCorruption { .. }
        | CoreError::InvalidFormat { .. } => CorruptionError::new_err(message),
        CoreError::CommitFailed { .. } => CommitFailedError::new_err(message),
        CoreError::RecoveryFailed { .. } | CoreError::Poisoned => RecoveryError::new_err(message),
        CoreError::DatabaseClosed | CoreError::TransactionInactive => {
            ClosedError::new_err(message)
        }
        _ => KeelError::new_err(message),
    }
}

/// A handle on one table of a database directory.
///
/// Opening the same directory twice shares one engine; the engine closes
/// when the last store on it is closed or dropped. Entering a closed store
/// in a `with` block opens it again.
///
/// ```python
/// with keeldb.Store("/tmp/db1", "users") as users:
///     users.write(b"alice", b"30")
///     assert users.read(b"alice") == b"30"
/// with users:
///     users.write(b"bob", b"25")
/// ```
#[pyclass(module = "keeldb")]
pub struct Store {
    table: Table,
}

#[pymethods]
impl Store {
    /// Opens (creating if needed) the database at `path` and selects `tag`.
    #[new]
    fn new(py: Python<'_>, path: &str, tag: &str) -> PyResult<Self> {
        let path = path.to_owned();
        let tag = tag.to_owned();
        py.allow_threads(move || Table::open(&path, &tag))
            .map(|table| Self { table })
            .map_err(to_py_err)
    }

    /// Stores `value` under `key`, replacing any previous value.
    fn write(&self, py: Python<'_>, key: &[u8], value: &[u8]) -> PyResult<()> {
        py.allow_threads(|| self.table.write(key, value))
            .map_err(to_py_err)
    }

    /// Returns the value stored under `key`, or `None`.
    fn read<'py>(&self, py: Python<'py>, key: &[u8]) -> PyResult<Option<Bound<'py, PyBytes>>> {
        let value = py
            .allow_threads(|| self.table.read(key))
            .map_err(to_py_err)?;
        Ok(value.map(|v| PyBytes::new(py, &v)))
    }

    /// Returns `(value, updated_at_millis)` for `key`, or `None`.
    fn read_entry<'py>(
        &self,
        py: Python<'py>,
        key: &[u8],
    ) -> PyResult<Option<(Bound<'py, PyBytes>, u64)>> {
        let entry = py
            .allow_threads(|| self.table.read_entry(key))
            .map_err(to_py_err)?;
        Ok(entry.map(|e| (PyBytes::new(py, &e.value), e.updated_at)))
    }

    /// Removes `key`. Returns whether it was present.
    fn delete(&self, py: Python<'_>, key: &[u8]) -> PyResult<bool> {
        py.allow_threads(|| self.table.delete(key))
            .map_err(to_py_err)
    }

    /// All keys of the table in ascending byte order.
    fn keys<'py>(&self, py: Python<'py>) -> PyResult<Vec<Bound<'py, PyBytes>>> {
        let keys = py
            .allow_threads(|| self.table.keys())
            .map_err(to_py_err)?;
        Ok(keys.iter().map(|k| PyBytes::new(py, k)).collect())
    }

    /// Closes this store. Closing twice is a no-op.
    fn close(&mut self, py: Python<'_>) -> PyResult<()> {
        let table = &mut self.table;
        py.allow_threads(|| table.close()).map_err(to_py_err)
    }

    /// The table tag this store reads and writes.
    #[getter]
    fn tag(&self) -> &str {
        self.table.tag().as_str()
    }

    /// Whether the store is still open.
    #[getter]
    fn is_open(&self) -> bool {
        self.table.is_open()
    }

    fn __len__(&self, py: Python<'_>) -> PyResult<usize> {
        let len = py
            .allow_threads(|| self.table.len())
            .map_err(to_py_err)?;
        usize::try_from(len).map_err(|e| PyValueError::new_err(e.to_string()))
    }

    fn __contains__(&self, py: Python<'_>, key: &[u8]) -> PyResult<bool> {
        py.allow_threads(|| self.table.contains(key))
            .map_err(to_py_err)
    }

    fn __repr__(&self) -> String {
        let state = if self.table.is_open() { "open" } else { "closed" };
        format!("Store(tag={:?}, {state})", self.table.tag().as_str())
    }

    /// Acquires the store, reopening it if a previous `with` block closed it.
    fn __enter__<'py>(
        mut slf: PyRefMut<'py, Self>,
        py: Python<'py>,
    ) -> PyResult<PyRefMut<'py, Self>> {
        let table = &mut slf.table;
        py.allow_threads(|| table.reopen()).map_err(to_py_err)?;
        Ok(slf)
    }

    #[pyo3(signature = (_exc_type=None, _exc_val=None, _exc_tb=None))]
    fn __exit__(
        &mut self,
        py: Python<'_>,
        _exc_type: Option<PyObject>,
        _exc_val: Option<PyObject>,
        _exc_tb: Option<PyObject>,
    ) -> PyResult<bool> {
        self.close(py)?;
        Ok(false)
    }
}

/// Python module initialization.
#[pymodule]
fn keeldb(m: &Bound<'_, PyModule>) -> PyResult<()> {
    let py = m.py();
    m.add_class::<Store>()?;
    m.add("KeelError", py.get_type::<KeelError>())?;
    m.add("WriterBusyError", py.get_type::<WriterBusyError>())?;
    m.add("StorageFullError", py.get_type::<StorageFullError>())?;
    m.add("CorruptionError", py.get_type::<CorruptionError>())?;
    m.add("CommitFailedError", py.get_type::<CommitFailedError>())?;
    m.add("RecoveryError", py.get_type::<RecoveryError>())?;
    m.add("ClosedError", py.get_type::<ClosedError>())?;
    m.add_function(wrap_pyfunction!(version, m)?)?;
    Ok(())
}

/// Returns the keeldb library version.
#[pyfunction]
fn version() -> &'static str {
    VERSION
}
