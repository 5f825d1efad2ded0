//! Access to kernel-resident tables.
//!
//! The rest of the crate only sees the traits here. [`bpf`] implements them
//! with libbpf on Linux builds with the `bpf` feature; [`memory`] provides
//! in-process tables for tests and dry runs.

#[cfg(all(target_os = "linux", feature = "bpf"))]
pub mod bpf;
pub mod memory;
#[cfg(all(target_os = "linux", feature = "bpf"))]
pub mod ringbuf;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tc_common::{TableId, TableIdentity, TableKind};
use thiserror::Error;

/// Default bpffs mount point.
pub const DEFAULT_PINNED_ROOT: &str = "/sys/fs/bpf";

/// One key/value pair read out of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl TableEntry {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        TableEntry {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Entries with an all-zero value do not count as members.
    pub fn value_is_zero(&self) -> bool {
        self.value.iter().all(|b| *b == 0)
    }
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("{path}: not a table: {reason}")]
    NotATable { path: PathBuf, reason: String },

    #[error("{path}: open failed: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("table {table} has unsupported kind {kind}")]
    UnsupportedKind { table: String, kind: TableKind },

    #[error("{op} on table {table} failed: {source}")]
    Syscall {
        op: &'static str,
        table: String,
        #[source]
        source: io::Error,
    },

    #[error("no table with id {0}")]
    NotFound(TableId),

    #[error("reading enumeration output {path}: {source}")]
    Enumeration {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("kernel table access needs Linux and the `bpf` feature")]
    UnsupportedPlatform,
}

impl KernelError {
    fn io_source(&self) -> Option<&io::Error> {
        match self {
            KernelError::Open { source, .. }
            | KernelError::Syscall { source, .. }
            | KernelError::Enumeration { source, .. } => Some(source),
            _ => None,
        }
    }

    /// EPERM and EACCES both land here.
    pub fn is_permission_denied(&self) -> bool {
        self.io_source()
            .is_some_and(|e| e.kind() == io::ErrorKind::PermissionDenied)
    }
}

impl From<KernelError> for tc_common::Error {
    fn from(err: KernelError) -> Self {
        if err.is_permission_denied() {
            return tc_common::Error::PermissionDenied(err.to_string());
        }
        match err {
            KernelError::NotATable { ref path, .. } | KernelError::Open { ref path, .. } => {
                tc_common::Error::TableUnavailable {
                    table: path.display().to_string(),
                    reason: err.to_string(),
                }
            }
            KernelError::UnsupportedKind { ref table, .. } => tc_common::Error::TableUnavailable {
                table: table.clone(),
                reason: err.to_string(),
            },
            KernelError::Syscall { ref table, .. } => tc_common::Error::EnumerationFailed {
                table: table.clone(),
                reason: err.to_string(),
            },
            KernelError::NotFound(id) => tc_common::Error::TableUnavailable {
                table: id.to_string(),
                reason: err.to_string(),
            },
            KernelError::Enumeration { .. } => tc_common::Error::SourceUnavailable(err.to_string()),
            KernelError::UnsupportedPlatform => {
                tc_common::Error::UnsupportedPlatform(err.to_string())
            }
        }
    }
}

/// An opened table.
pub trait KernelTable: Send {
    fn identity(&self) -> &TableIdentity;

    /// Read every current entry.
    fn entries(&mut self) -> Result<Vec<TableEntry>, KernelError>;
}

/// Opens tables pinned in the persistent-object namespace.
pub trait TableOpener: Send + Sync {
    fn open_pinned(&self, path: &Path) -> Result<Box<dyn KernelTable>, KernelError>;
}

/// Resolves a table's identity from its numeric id.
pub trait TableCatalog: Send + Sync {
    fn describe(&self, id: TableId) -> Result<TableIdentity, KernelError>;
}

/// Runs one kernel-side enumeration and returns its text output.
pub trait EnumerationSource: Send {
    fn enumerate(&mut self) -> Result<String, KernelError>;
}

impl<T: EnumerationSource + ?Sized> EnumerationSource for Box<T> {
    fn enumerate(&mut self) -> Result<String, KernelError> {
        (**self).enumerate()
    }
}

/// A pinned `iter/bpf_map` link. Every read of the pin re-runs the iterator.
#[derive(Debug, Clone)]
pub struct PinnedIterator {
    path: PathBuf,
}

impl PinnedIterator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        PinnedIterator { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EnumerationSource for PinnedIterator {
    fn enumerate(&mut self) -> Result<String, KernelError> {
        std::fs::read_to_string(&self.path).map_err(|source| KernelError::Enumeration {
            path: self.path.clone(),
            source,
        })
    }
}

/// Opener backed by the running kernel.
pub fn system_opener() -> Result<Arc<dyn TableOpener>, KernelError> {
    #[cfg(all(target_os = "linux", feature = "bpf"))]
    {
        Ok(Arc::new(bpf::BpfOpener))
    }
    #[cfg(not(all(target_os = "linux", feature = "bpf")))]
    {
        Err(KernelError::UnsupportedPlatform)
    }
}

/// Catalog backed by the running kernel.
pub fn system_catalog() -> Result<Arc<dyn TableCatalog>, KernelError> {
    #[cfg(all(target_os = "linux", feature = "bpf"))]
    {
        Ok(Arc::new(bpf::BpfCatalog))
    }
    #[cfg(not(all(target_os = "linux", feature = "bpf")))]
    {
        Err(KernelError::UnsupportedPlatform)
    }
}
