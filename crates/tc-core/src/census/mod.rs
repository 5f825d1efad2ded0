//! Periodic ground-truth census from kernel enumeration.
//!
//! Each cycle re-runs the enumeration program, parses its output strictly and
//! publishes every table's count and pressure. A cycle either publishes all
//! of its lines or none of them. Consecutive failed cycles are counted; past
//! the configured budget the loop stops with a protocol error.

pub mod line;

pub use line::{parse_census_line, parse_census_output, CensusLine, CensusParseError, PollLineError};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::kernel::{EnumerationSource, DEFAULT_PINNED_ROOT};
use crate::publish::Publisher;
use crate::shutdown::Shutdown;

pub const DEFAULT_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Poller settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub enabled: bool,
    /// Delay between cycles.
    pub interval_ms: u64,
    /// Pinned `iter/bpf_map` link.
    pub iterator_path: PathBuf,
    /// Failed cycles in a row before the poller gives up. 0 never gives up.
    pub max_consecutive_failures: u32,
    /// Table names to publish. Empty publishes every table.
    pub tables: Vec<String>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: DEFAULT_INTERVAL_MS,
            iterator_path: PathBuf::from(DEFAULT_PINNED_ROOT).join("table_census/census_iter"),
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            tables: Vec::new(),
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Outcome of one successful cycle.
#[derive(Debug, Clone, Serialize)]
pub struct PollCycle {
    /// Every parsed line, published or not.
    pub lines: Vec<CensusLine>,
    pub published: usize,
    pub duration_ms: u64,
}

/// Counters kept across cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollerStats {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub consecutive_failures: u32,
}

/// Periodic census driven by an [`EnumerationSource`].
pub struct CensusPoller<E> {
    source: E,
    publisher: Publisher,
    interval: Duration,
    max_consecutive_failures: u32,
    allow: Option<HashSet<String>>,
    stats: PollerStats,
}

impl<E: EnumerationSource> CensusPoller<E> {
    pub fn new(source: E, publisher: Publisher) -> Self {
        CensusPoller {
            source,
            publisher,
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            allow: None,
            stats: PollerStats::default(),
        }
    }

    pub fn from_config(source: E, publisher: Publisher, config: &PollerConfig) -> Self {
        Self::new(source, publisher)
            .with_interval(config.interval())
            .with_max_consecutive_failures(config.max_consecutive_failures)
            .with_tables(config.tables.iter().cloned())
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max;
        self
    }

    /// Restrict publishing to tables matching by name or id. An empty list
    /// allows all.
    pub fn with_tables<I: IntoIterator<Item = String>>(mut self, tables: I) -> Self {
        let allow: HashSet<String> = tables.into_iter().collect();
        self.allow = if allow.is_empty() { None } else { Some(allow) };
        self
    }

    pub fn stats(&self) -> PollerStats {
        self.stats
    }

    fn allowed(&self, line: &CensusLine) -> bool {
        self.allow.as_ref().map_or(true, |allow| {
            allow.contains(line.name.as_str()) || allow.contains(&line.id.to_string())
        })
    }

    /// Run one enumeration cycle and publish it.
    pub fn poll_once(&mut self) -> tc_common::Result<PollCycle> {
        let started = Instant::now();
        self.stats.cycles += 1;

        let result = self
            .source
            .enumerate()
            .map_err(tc_common::Error::from)
            .and_then(|output| parse_census_output(&output).map_err(tc_common::Error::from));
        let elapsed = started.elapsed();
        let sink = self.publisher.sink();

        let lines = match result {
            Ok(lines) => lines,
            Err(e) => {
                self.stats.failed_cycles += 1;
                self.stats.consecutive_failures += 1;
                sink.record_poll("failed", elapsed.as_secs_f64());
                sink.record_error(match &e {
                    tc_common::Error::MalformedCensusLine { .. } => "malformed_census_line",
                    _ => "enumeration",
                });
                return Err(e);
            }
        };

        let mut published = 0;
        for line in lines.iter().filter(|l| self.allowed(l)) {
            let label = self.publisher.label(line.id, &line.name);
            self.publisher.publish(&label, line.cardinality, line.capacity);
            published += 1;
        }
        self.stats.consecutive_failures = 0;
        sink.record_poll("success", elapsed.as_secs_f64());
        debug!(tables = lines.len(), published, "census cycle published");

        Ok(PollCycle {
            lines,
            published,
            duration_ms: elapsed.as_millis() as u64,
        })
    }

    /// Poll until shutdown or until the failure budget is spent.
    pub fn run(&mut self, shutdown: &Shutdown) -> tc_common::Result<()> {
        while !shutdown.is_triggered() {
            if let Err(e) = self.poll_once() {
                let failures = self.stats.consecutive_failures;
                warn!(error = %e, consecutive_failures = failures, "census cycle failed");
                if self.max_consecutive_failures > 0 && failures >= self.max_consecutive_failures {
                    return Err(tc_common::Error::PollBudgetExhausted { failures });
                }
            }
            if shutdown.wait_timeout(self.interval) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::memory::ScriptedEnumeration;
    use crate::publish::{CensusField, LabelMode, MemorySink, Strategy};
    use std::sync::Arc;

    fn poller(source: ScriptedEnumeration) -> (CensusPoller<ScriptedEnumeration>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let publisher = Publisher::sole(sink.clone(), LabelMode::Id, Strategy::Poller);
        (CensusPoller::new(source, publisher), sink)
    }

    #[test]
    fn test_cycle_publishes_ground_truth() {
        let (mut poller, sink) =
            poller(ScriptedEnumeration::new().then_output("  12 my_table   1024   37\n"));
        let cycle = poller.poll_once().unwrap();
        assert_eq!(cycle.published, 1);
        assert_eq!(sink.get("12", CensusField::ItemCount), Some(37.0));
        assert_eq!(sink.get("12", CensusField::Pressure), Some(37.0 / 1024.0));
        assert_eq!(sink.counter("poll.success"), 1);
    }

    #[test]
    fn test_malformed_cycle_publishes_nothing() {
        let (mut poller, sink) =
            poller(ScriptedEnumeration::new().then_output("1 a 16 2\n2 b 32\n"));
        let err = poller.poll_once().unwrap_err();
        assert_eq!(err.code(), 21);
        assert_eq!(sink.series_count(), 0);
        assert_eq!(poller.stats().consecutive_failures, 1);
        assert_eq!(sink.counter("error.malformed_census_line"), 1);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let (mut poller, _) = poller(
            ScriptedEnumeration::new()
                .then_failure()
                .then_output("1 a 16 2\n"),
        );
        assert!(poller.poll_once().is_err());
        assert!(poller.poll_once().is_ok());
        assert_eq!(poller.stats().consecutive_failures, 0);
        assert_eq!(poller.stats().failed_cycles, 1);
    }

    #[test]
    fn test_allow_list_filters_publishing() {
        let (poller, sink) = poller(ScriptedEnumeration::new().then_output("1 keep 16 2\n2 drop 16 3\n"));
        let mut poller = poller.with_tables(vec!["keep".to_string()]);
        let cycle = poller.poll_once().unwrap();
        assert_eq!(cycle.lines.len(), 2);
        assert_eq!(cycle.published, 1);
        assert_eq!(sink.get("1", CensusField::ItemCount), Some(2.0));
        assert_eq!(sink.get("2", CensusField::ItemCount), None);
    }

    #[test]
    fn test_run_gives_up_after_budget() {
        let (poller, _) = poller(ScriptedEnumeration::new().then_output("garbage\n"));
        let mut poller = poller
            .with_interval(Duration::from_millis(1))
            .with_max_consecutive_failures(3);
        let err = poller.run(&Shutdown::new()).unwrap_err();
        assert!(matches!(
            err,
            tc_common::Error::PollBudgetExhausted { failures: 3 }
        ));
    }

    #[test]
    fn test_run_stops_on_shutdown() {
        let (poller, _) = poller(ScriptedEnumeration::new().then_output("1 a 16 2\n"));
        let mut poller = poller.with_interval(Duration::from_secs(30));
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            trigger.trigger();
        });
        poller.run(&shutdown).unwrap();
        handle.join().unwrap();
        assert_eq!(poller.stats().cycles, 1);
    }
}
