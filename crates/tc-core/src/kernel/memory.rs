//! In-process tables, catalogs and enumeration output.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use tc_common::{TableId, TableIdentity};

use super::{
    EnumerationSource, KernelError, KernelTable, TableCatalog, TableEntry, TableOpener,
};

/// A table held in memory.
#[derive(Debug, Clone)]
pub struct MemoryTable {
    identity: TableIdentity,
    entries: Vec<TableEntry>,
    fail_reads: bool,
}

impl MemoryTable {
    pub fn new(identity: TableIdentity) -> Self {
        MemoryTable {
            identity,
            entries: Vec::new(),
            fail_reads: false,
        }
    }

    pub fn with_entry(mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        self.entries.push(TableEntry::new(key, value));
        self
    }

    /// Make every read fail, as a table torn down mid-walk would.
    pub fn failing(mut self) -> Self {
        self.fail_reads = true;
        self
    }
}

impl KernelTable for MemoryTable {
    fn identity(&self) -> &TableIdentity {
        &self.identity
    }

    fn entries(&mut self) -> Result<Vec<TableEntry>, KernelError> {
        if self.fail_reads {
            return Err(KernelError::Syscall {
                op: "get_next_key",
                table: self.identity.to_string(),
                source: io::Error::from_raw_os_error(libc::EBADF),
            });
        }
        Ok(self.entries.clone())
    }
}

/// Opener resolving paths to [`MemoryTable`]s. Unknown paths are not tables.
#[derive(Debug, Default)]
pub struct MemoryOpener {
    tables: HashMap<PathBuf, MemoryTable>,
}

impl MemoryOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(mut self, path: impl Into<PathBuf>, table: MemoryTable) -> Self {
        self.tables.insert(path.into(), table);
        self
    }
}

impl TableOpener for MemoryOpener {
    fn open_pinned(&self, path: &Path) -> Result<Box<dyn KernelTable>, KernelError> {
        match self.tables.get(path) {
            Some(table) => Ok(Box::new(table.clone())),
            None => Err(KernelError::NotATable {
                path: path.to_path_buf(),
                reason: "no table pinned here".to_string(),
            }),
        }
    }
}

/// Catalog over a fixed set of identities.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    tables: HashMap<TableId, TableIdentity>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, identity: TableIdentity) -> Self {
        self.tables.insert(identity.id, identity);
        self
    }
}

impl TableCatalog for MemoryCatalog {
    fn describe(&self, id: TableId) -> Result<TableIdentity, KernelError> {
        self.tables.get(&id).cloned().ok_or(KernelError::NotFound(id))
    }
}

/// Enumeration source replaying queued outputs. Once the queue is empty
/// the last output repeats; an empty script reports an unavailable source.
#[derive(Debug, Default)]
pub struct ScriptedEnumeration {
    outputs: VecDeque<Option<String>>,
    last: Option<String>,
}

impl ScriptedEnumeration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_output(self, output: impl Into<String>) -> Self {
        self.push(Some(output.into()))
    }

    /// Queue one failed read.
    pub fn then_failure(self) -> Self {
        self.push(None)
    }

    fn push(mut self, item: Option<String>) -> Self {
        self.outputs.push_back(item);
        self
    }
}

impl EnumerationSource for ScriptedEnumeration {
    fn enumerate(&mut self) -> Result<String, KernelError> {
        let output = match self.outputs.pop_front() {
            Some(item) => item,
            None => self.last.clone(),
        };
        match output {
            Some(text) => {
                self.last = Some(text.clone());
                Ok(text)
            }
            None => Err(KernelError::Enumeration {
                path: PathBuf::from("<scripted>"),
                source: io::Error::new(io::ErrorKind::NotFound, "no enumeration output"),
            }),
        }
    }
}
