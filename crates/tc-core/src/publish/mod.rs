//! Metrics publishing interface.
//!
//! Both census strategies hand per-table values to a [`CensusSink`] through a
//! [`Publisher`], which owns the labeling mode and decides which series a
//! strategy may write. When both strategies run, only the designated
//! authority writes the primary `table_item_count` / `table_pressure`
//! series; the other writes its own comparison series, so no series ever has
//! two writers.

pub mod prometheus;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tc_common::{TableId, TableName};

/// Pressure published when a table's capacity is unknown (0).
pub const PRESSURE_UNKNOWN: f64 = -1.0;

/// Occupied fraction of a table, or [`PRESSURE_UNKNOWN`] when `capacity`
/// is zero.
pub fn pressure(cardinality: u64, capacity: u32) -> f64 {
    if capacity == 0 {
        PRESSURE_UNKNOWN
    } else {
        cardinality as f64 / f64::from(capacity)
    }
}

/// How tables are labeled in published series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelMode {
    /// Numeric id: unique, but changes when a table is recreated.
    #[default]
    Id,
    /// Table name: stable across recreation, possibly shared by tables.
    Name,
}

/// Value of the `table` label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableLabel(String);

impl TableLabel {
    pub fn new(mode: LabelMode, id: TableId, name: &TableName) -> Self {
        match mode {
            LabelMode::Id => TableLabel(id.to_string()),
            // Unnamed tables fall back to their id so the label is never empty.
            LabelMode::Name if name.is_empty() => TableLabel(id.to_string()),
            LabelMode::Name => TableLabel(name.as_str().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TableLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A published per-table field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CensusField {
    ItemCount,
    Pressure,
    Capacity,
    /// Replica count while the poller is the authority.
    ReplicaItemCount,
    /// Kernel-reported count while the replica is the authority.
    KernelItemCount,
}

impl CensusField {
    pub fn metric_name(&self) -> &'static str {
        match self {
            CensusField::ItemCount => "table_item_count",
            CensusField::Pressure => "table_pressure",
            CensusField::Capacity => "table_capacity",
            CensusField::ReplicaItemCount => "table_replica_item_count",
            CensusField::KernelItemCount => "table_kernel_item_count",
        }
    }
}

/// The census strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Shadow replica fed by mutation events.
    Replica,
    /// Periodic kernel-side enumeration.
    Poller,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Replica => write!(f, "replica"),
            Strategy::Poller => write!(f, "poller"),
        }
    }
}

/// Destination for census values.
///
/// `set` must tolerate concurrent callers: writes to one series are
/// serialized, writes to distinct tables must not block each other. The
/// counters are self-observability and default to no-ops.
pub trait CensusSink: Send + Sync {
    fn set(&self, table: &TableLabel, field: CensusField, value: f64);

    /// Count one applied mutation by outcome.
    fn record_event(&self, _outcome: &str) {}

    /// Count one poll cycle by status and observe its duration.
    fn record_poll(&self, _status: &str, _duration_secs: f64) {}

    /// Count one error by type.
    fn record_error(&self, _error_type: &str) {}
}

/// Routes one strategy's values to the series it owns.
#[derive(Clone)]
pub struct Publisher {
    sink: Arc<dyn CensusSink>,
    label_mode: LabelMode,
    strategy: Strategy,
    authority: Strategy,
}

impl Publisher {
    pub fn new(
        sink: Arc<dyn CensusSink>,
        label_mode: LabelMode,
        strategy: Strategy,
        authority: Strategy,
    ) -> Self {
        Publisher {
            sink,
            label_mode,
            strategy,
            authority,
        }
    }

    /// Publisher for a strategy running alone.
    pub fn sole(sink: Arc<dyn CensusSink>, label_mode: LabelMode, strategy: Strategy) -> Self {
        Self::new(sink, label_mode, strategy, strategy)
    }

    pub fn is_authority(&self) -> bool {
        self.strategy == self.authority
    }

    pub fn label(&self, id: TableId, name: &TableName) -> TableLabel {
        TableLabel::new(self.label_mode, id, name)
    }

    pub fn sink(&self) -> &dyn CensusSink {
        self.sink.as_ref()
    }

    /// Publish one table's census.
    pub fn publish(&self, label: &TableLabel, cardinality: u64, capacity: u32) {
        if self.is_authority() {
            self.sink
                .set(label, CensusField::ItemCount, cardinality as f64);
            self.sink
                .set(label, CensusField::Pressure, pressure(cardinality, capacity));
            if capacity > 0 {
                self.sink
                    .set(label, CensusField::Capacity, f64::from(capacity));
            }
        } else {
            let field = match self.strategy {
                Strategy::Replica => CensusField::ReplicaItemCount,
                Strategy::Poller => CensusField::KernelItemCount,
            };
            self.sink.set(label, field, cardinality as f64);
        }
    }
}

/// In-memory sink keeping the latest value of every series.
#[derive(Debug, Default)]
pub struct MemorySink {
    values: Mutex<HashMap<(TableLabel, CensusField), f64>>,
    counters: Mutex<HashMap<String, u64>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest value written for a series.
    pub fn get(&self, table: &str, field: CensusField) -> Option<f64> {
        let values = self.values.lock().ok()?;
        values
            .get(&(TableLabel(table.to_string()), field))
            .copied()
    }

    /// Number of distinct series written.
    pub fn series_count(&self) -> usize {
        self.values.lock().map(|v| v.len()).unwrap_or(0)
    }

    /// Value of a self-observability counter, e.g. `event.inserted`.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .ok()
            .and_then(|c| c.get(name).copied())
            .unwrap_or(0)
    }

    /// All series sorted by table then field.
    pub fn entries(&self) -> Vec<(String, CensusField, f64)> {
        let mut out: Vec<_> = match self.values.lock() {
            Ok(values) => values
                .iter()
                .map(|((label, field), v)| (label.0.clone(), *field, *v))
                .collect(),
            Err(_) => Vec::new(),
        };
        out.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        out
    }

    fn bump(&self, name: String) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(name).or_insert(0) += 1;
        }
    }
}

impl CensusSink for MemorySink {
    fn set(&self, table: &TableLabel, field: CensusField, value: f64) {
        if let Ok(mut values) = self.values.lock() {
            values.insert((table.clone(), field), value);
        }
    }

    fn record_event(&self, outcome: &str) {
        self.bump(format!("event.{}", outcome));
    }

    fn record_poll(&self, status: &str, _duration_secs: f64) {
        self.bump(format!("poll.{}", status));
    }

    fn record_error(&self, error_type: &str) {
        self.bump(format!("error.{}", error_type));
    }
}
