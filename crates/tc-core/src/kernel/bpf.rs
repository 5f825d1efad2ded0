//! Table access through libbpf.
//!
//! Pinned tables are opened with [`MapHandle::from_pinned_path`], tables seen
//! only by id with [`MapHandle::from_map_id`]. Needs the `bpf` feature.

use libbpf_rs::{MapCore, MapFlags, MapHandle};
use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::path::Path;
use tc_common::{TableId, TableIdentity, TableKind, TableName};

use super::{KernelError, KernelTable, TableCatalog, TableEntry, TableOpener};

/// Carry libbpf's error kind over so permission checks keep working.
pub(crate) fn io_error(err: libbpf_rs::Error) -> io::Error {
    let kind = match err.kind() {
        libbpf_rs::ErrorKind::NotFound => io::ErrorKind::NotFound,
        libbpf_rs::ErrorKind::PermissionDenied => io::ErrorKind::PermissionDenied,
        libbpf_rs::ErrorKind::InvalidInput => io::ErrorKind::InvalidInput,
        libbpf_rs::ErrorKind::Interrupted => io::ErrorKind::Interrupted,
        libbpf_rs::ErrorKind::Unsupported => io::ErrorKind::Unsupported,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err)
}

/// Program and link pins open too; the fd's anon inode says what it is.
fn is_map(handle: &MapHandle) -> bool {
    let link = format!("/proc/self/fd/{}", handle.as_fd().as_raw_fd());
    std::fs::read_link(link)
        .map(|target| target.as_os_str() == "anon_inode:bpf-map")
        .unwrap_or(false)
}

fn identity_from_parts(
    map_type: u32,
    id: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    name: &[u8],
) -> TableIdentity {
    TableIdentity::partial(TableId(id), TableName::from_padded(name))
        .with_capacity(max_entries)
        .with_key_size(key_size)
        .with_value_size(value_size)
        .with_kind(TableKind::from_kernel_type(map_type))
}

fn identity_of(handle: &MapHandle) -> io::Result<TableIdentity> {
    let info = handle.info().map_err(io_error)?.info;
    let name = info.name.map(|c| c as u8);
    Ok(identity_from_parts(
        info.type_,
        info.id,
        info.key_size,
        info.value_size,
        info.max_entries,
        &name,
    ))
}

/// An open table.
pub struct BpfTable {
    handle: MapHandle,
    identity: TableIdentity,
}

impl BpfTable {
    fn new(handle: MapHandle, label: &str) -> Result<Self, KernelError> {
        let identity = identity_of(&handle).map_err(|source| KernelError::Syscall {
            op: "map_info",
            table: label.to_string(),
            source,
        })?;
        // Per-CPU and special tables do not have one value per key.
        if let TableKind::Other(_) = identity.kind {
            return Err(KernelError::UnsupportedKind {
                table: identity.to_string(),
                kind: identity.kind,
            });
        }
        Ok(BpfTable { handle, identity })
    }

    fn syscall_err(&self, op: &'static str, source: libbpf_rs::Error) -> KernelError {
        KernelError::Syscall {
            op,
            table: self.identity.to_string(),
            source: io_error(source),
        }
    }
}

impl KernelTable for BpfTable {
    fn identity(&self) -> &TableIdentity {
        &self.identity
    }

    fn entries(&mut self) -> Result<Vec<TableEntry>, KernelError> {
        // Hash iteration restarts from the head when the cursor key is
        // deleted underneath us; bound the walk so churn cannot spin it.
        let budget = (self.identity.capacity as usize).saturating_mul(2).max(1);

        let mut entries = Vec::new();
        for key in self.handle.keys().take(budget) {
            // Deleted between the key walk and the lookup.
            let Some(value) = self
                .handle
                .lookup(&key, MapFlags::ANY)
                .map_err(|e| self.syscall_err("map_lookup_elem", e))?
            else {
                continue;
            };
            entries.push(TableEntry::new(key, value));
        }
        Ok(entries)
    }
}

/// Opens tables pinned on bpffs.
#[derive(Debug, Clone, Copy, Default)]
pub struct BpfOpener;

impl TableOpener for BpfOpener {
    fn open_pinned(&self, path: &Path) -> Result<Box<dyn KernelTable>, KernelError> {
        let handle = MapHandle::from_pinned_path(path).map_err(|e| KernelError::Open {
            path: path.to_path_buf(),
            source: io_error(e),
        })?;
        if !is_map(&handle) {
            return Err(KernelError::NotATable {
                path: path.to_path_buf(),
                reason: "pinned object is not a map".to_string(),
            });
        }
        let table = BpfTable::new(handle, &path.display().to_string())?;
        Ok(Box::new(table))
    }
}

/// Resolves tables by id. Needs CAP_SYS_ADMIN.
#[derive(Debug, Clone, Copy, Default)]
pub struct BpfCatalog;

impl TableCatalog for BpfCatalog {
    fn describe(&self, id: TableId) -> Result<TableIdentity, KernelError> {
        let handle = MapHandle::from_map_id(id.0).map_err(|e| match e.kind() {
            libbpf_rs::ErrorKind::NotFound => KernelError::NotFound(id),
            _ => KernelError::Syscall {
                op: "map_get_fd_by_id",
                table: id.to_string(),
                source: io_error(e),
            },
        })?;
        identity_of(&handle).map_err(|source| KernelError::Syscall {
            op: "map_info",
            table: id.to_string(),
            source,
        })
    }
}
