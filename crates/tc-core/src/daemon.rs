//! Long-running census controller.
//!
//! Wires the strategies onto dedicated threads:
//!
//! - **consumer**: opens the record source, waits for the startup snapshot,
//!   then drains events into the replica store
//! - **poller**: runs the census poller on its interval
//! - **metrics**: serves the Prometheus endpoint
//!
//! The supervisor loop on the calling thread forwards signals to the shared
//! [`Shutdown`] and stops everything when any worker fails.
//!
//! ## Startup race
//!
//! The snapshot and the event stream are not mutually exclusive. The source
//! is opened before the snapshot runs so that events emitted meanwhile queue
//! up in it; inserts seen by both paths collapse because inserts are
//! idempotent and seeding merges. A delete that lands before the snapshot
//! reads its key is still lost. Deployments that need exact counts should
//! make the poller the authority.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info_span};

use crate::census::{CensusPoller, PollerStats};
use crate::config::{CensusConfig, RecordSourceKind};
use crate::kernel::{self, EnumerationSource, PinnedIterator, TableCatalog, TableOpener};
use crate::logging::{event_names, LogContext, Stage};
use crate::publish::prometheus::{CensusMetrics, MetricsError, MetricsServer};
use crate::publish::{CensusSink, Publisher, Strategy};
use crate::replica::{ReplicaOptions, ShadowReplicaStore};
use crate::shutdown::{signal_received, Shutdown};
use crate::snapshot::{SnapshotLoader, SnapshotReport};
use crate::stream::{ConsumerStats, EventConsumer, ReaderSource, RecordSource};

/// Opens the record source on the consumer thread.
pub type RecordOpener =
    Box<dyn FnOnce() -> std::io::Result<Box<dyn RecordSource>> + Send + 'static>;

const SUPERVISOR_TICK: Duration = Duration::from_millis(200);
const JOIN_GRACE: Duration = Duration::from_secs(1);

/// External collaborators the daemon runs against.
#[derive(Default)]
pub struct DaemonSources {
    /// Required when the replica is enabled.
    pub opener: Option<Arc<dyn TableOpener>>,
    pub catalog: Option<Arc<dyn TableCatalog>>,
    /// Required when the replica is enabled.
    pub records: Option<RecordOpener>,
    /// Required when the poller is enabled.
    pub enumeration: Option<Box<dyn EnumerationSource>>,
    /// Tables the process already holds, seeded alongside pinned ones.
    pub handles: Vec<Box<dyn kernel::KernelTable>>,
}

impl DaemonSources {
    /// Sources backed by the running kernel and the configured paths.
    pub fn system(config: &CensusConfig) -> tc_common::Result<Self> {
        let mut sources = DaemonSources::default();

        if config.replica.enabled {
            sources.opener = Some(kernel::system_opener()?);
            if config.replica.resolve_unknown_tables {
                sources.catalog = kernel::system_catalog().ok();
            }
            let path: PathBuf = config
                .replica
                .record_path
                .clone()
                .ok_or_else(|| tc_common::Error::Config("replica.record_path is not set".into()))?;
            sources.records = Some(record_opener(
                config.replica.record_source,
                path,
                config.replica.record_stride,
            ));
        }

        if config.poller.enabled {
            sources.enumeration = Some(Box::new(PinnedIterator::new(
                config.poller.iterator_path.clone(),
            )));
        }

        Ok(sources)
    }
}

/// Opener for the configured record source.
pub fn record_opener(kind: RecordSourceKind, path: PathBuf, stride: usize) -> RecordOpener {
    match kind {
        RecordSourceKind::Fifo => Box::new(move || {
            let file = std::fs::File::open(&path)?;
            Ok(Box::new(ReaderSource::with_record_len(file, stride)) as Box<dyn RecordSource>)
        }),
        RecordSourceKind::Ringbuf => Box::new(move || open_ringbuf(&path)),
    }
}

#[cfg(all(target_os = "linux", feature = "bpf"))]
fn open_ringbuf(path: &std::path::Path) -> std::io::Result<Box<dyn RecordSource>> {
    let source = kernel::ringbuf::RingBufSource::open(path)?;
    Ok(Box::new(source))
}

#[cfg(not(all(target_os = "linux", feature = "bpf")))]
fn open_ringbuf(path: &std::path::Path) -> std::io::Result<Box<dyn RecordSource>> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!(
            "{}: reading the ring buffer needs Linux and the `bpf` feature",
            path.display()
        ),
    ))
}

/// What a daemon run did.
#[derive(Debug, Default, Serialize)]
pub struct DaemonSummary {
    pub interrupted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer: Option<ConsumerStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poller: Option<PollerStats>,
    pub uptime_secs: u64,
}

enum WorkerExit {
    Consumer(ConsumerStats),
    Poller(PollerStats),
}

struct Worker {
    name: &'static str,
    handle: JoinHandle<tc_common::Result<WorkerExit>>,
}

/// The census controller.
pub struct Daemon {
    config: CensusConfig,
    ctx: LogContext,
    metrics: CensusMetrics,
    store: Option<Arc<ShadowReplicaStore>>,
}

impl Daemon {
    pub fn new(config: CensusConfig, ctx: LogContext) -> tc_common::Result<Self> {
        let metrics = CensusMetrics::new().map_err(MetricsError::from)?;
        Ok(Daemon {
            config,
            ctx,
            metrics,
            store: None,
        })
    }

    pub fn metrics(&self) -> &CensusMetrics {
        &self.metrics
    }

    /// The replica store, once [`Daemon::run`] has created it.
    pub fn store(&self) -> Option<&Arc<ShadowReplicaStore>> {
        self.store.as_ref()
    }

    fn publisher(&self, strategy: Strategy) -> Publisher {
        let sink: Arc<dyn CensusSink> = Arc::new(self.metrics.clone());
        let authority = self.config.authority().unwrap_or(strategy);
        Publisher::new(sink, self.config.label_mode, strategy, authority)
    }

    /// Run until shutdown, a signal, or a fatal worker error.
    pub fn run(
        &mut self,
        mut sources: DaemonSources,
        shutdown: &Shutdown,
    ) -> tc_common::Result<DaemonSummary> {
        let started = Instant::now();
        let ctx = self.ctx.clone();
        crate::log_event!(
            ctx,
            INFO,
            event_names::RUN_STARTED,
            Stage::Daemon,
            "census controller starting",
            replica = self.config.replica.enabled,
            poller = self.config.poller.enabled,
            authority = ?self.config.authority()
        );

        let server = if self.config.metrics.enabled {
            let server = MetricsServer::start(&self.config.metrics, self.metrics.clone())?;
            crate::log_event!(
                ctx,
                INFO,
                event_names::METRICS_STARTED,
                Stage::Publish,
                "metrics endpoint listening",
                addr = %server.addr(),
                path = %self.config.metrics.path
            );
            Some(server)
        } else {
            None
        };

        let mut summary = DaemonSummary::default();
        let mut workers = Vec::new();

        let result = self
            .start_workers(&mut sources, shutdown, &mut workers, &mut summary)
            .and_then(|_| self.supervise(&mut workers, shutdown, &mut summary));

        shutdown.trigger();
        self.join_workers(workers, &mut summary);
        if let Some(server) = server {
            server.shutdown();
        }

        summary.uptime_secs = started.elapsed().as_secs();
        match &result {
            Ok(()) => crate::log_event!(
                ctx,
                INFO,
                event_names::RUN_FINISHED,
                Stage::Daemon,
                "census controller stopped",
                interrupted = summary.interrupted,
                uptime_secs = summary.uptime_secs
            ),
            Err(e) => crate::log_event!(
                ctx,
                ERROR,
                event_names::RUN_FINISHED,
                Stage::Daemon,
                "census controller failed",
                error = %e,
                code = e.code()
            ),
        }
        result.map(|_| summary)
    }

    fn start_workers(
        &mut self,
        sources: &mut DaemonSources,
        shutdown: &Shutdown,
        workers: &mut Vec<Worker>,
        summary: &mut DaemonSummary,
    ) -> tc_common::Result<()> {
        if self.config.replica.enabled {
            let store = Arc::new(ShadowReplicaStore::new(
                self.publisher(Strategy::Replica),
                ReplicaOptions {
                    track_members: self.config.replica.track_members,
                },
            ));
            self.store = Some(store.clone());

            let records = sources.records.take().ok_or_else(|| {
                tc_common::Error::SourceUnavailable("no record source configured".into())
            })?;
            let (opened_tx, opened_rx) = mpsc::channel();
            let (start_tx, start_rx) = mpsc::channel::<()>();
            workers.push(self.spawn_consumer(
                records,
                store.clone(),
                sources.catalog.clone(),
                shutdown.clone(),
                opened_tx,
                start_rx,
            )?);

            // The source must be open before the snapshot reads the tables.
            loop {
                match opened_rx.recv_timeout(SUPERVISOR_TICK) {
                    Ok(()) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if signal_received() {
                            summary.interrupted = true;
                            return Ok(());
                        }
                        if shutdown.is_triggered() {
                            return Ok(());
                        }
                    }
                    // The consumer exited before opening; its error is
                    // collected by the supervisor.
                    Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(()),
                }
            }

            let opener = sources.opener.clone().ok_or_else(|| {
                tc_common::Error::UnsupportedPlatform("no table opener available".into())
            })?;
            let report = self.run_snapshot(opener, std::mem::take(&mut sources.handles), &store);
            summary.snapshot = Some(report);
            let _ = start_tx.send(());
        }

        if self.config.poller.enabled {
            let enumeration = sources.enumeration.take().ok_or_else(|| {
                tc_common::Error::SourceUnavailable("no enumeration source configured".into())
            })?;
            workers.push(self.spawn_poller(enumeration, shutdown.clone())?);
        }
        Ok(())
    }

    fn run_snapshot(
        &self,
        opener: Arc<dyn TableOpener>,
        handles: Vec<Box<dyn kernel::KernelTable>>,
        store: &ShadowReplicaStore,
    ) -> SnapshotReport {
        let span = info_span!("snapshot", run_id = %self.ctx.run_id, stage = %Stage::Snapshot);
        let _guard = span.enter();

        let loader = SnapshotLoader::new(opener).with_max_depth(self.config.replica.max_depth);
        let mut report = SnapshotReport::default();
        if let Some(root) = &self.config.replica.pinned_root {
            loader.load_namespace(root, store, &mut report);
        }
        loader.load_paths(&self.config.replica.pinned_paths, store, &mut report);
        loader.load_handles(handles, store, &mut report);

        crate::log_event!(
            self.ctx,
            INFO,
            event_names::SNAPSHOT_FINISHED,
            Stage::Snapshot,
            "startup snapshot loaded",
            tables = report.tables_seeded(),
            entries = report.entries_read,
            zero_valued = report.zero_valued_skipped,
            skipped = report.skipped.len()
        );
        report
    }

    fn spawn_consumer(
        &self,
        records: RecordOpener,
        store: Arc<ShadowReplicaStore>,
        catalog: Option<Arc<dyn TableCatalog>>,
        shutdown: Shutdown,
        opened_tx: mpsc::Sender<()>,
        start_rx: mpsc::Receiver<()>,
    ) -> tc_common::Result<Worker> {
        let ctx = self.ctx.clone();
        let handle = thread::Builder::new()
            .name("tc-consumer".to_string())
            .spawn(move || {
                let span = info_span!("consumer", run_id = %ctx.run_id, stage = %Stage::Stream);
                let _guard = span.enter();

                let source = records()
                    .map_err(|e| tc_common::Error::SourceUnavailable(e.to_string()))?;
                let _ = opened_tx.send(());
                // Dropped sender means the daemon is stopping.
                if start_rx.recv().is_err() {
                    return Ok(WorkerExit::Consumer(ConsumerStats::default()));
                }

                crate::log_event!(ctx, INFO, event_names::STREAM_STARTED, Stage::Stream, "draining mutation events");
                let mut consumer = EventConsumer::new(source, store);
                if let Some(catalog) = catalog {
                    consumer = consumer.with_catalog(catalog);
                }
                let stats = consumer.run(&shutdown)?;
                crate::log_event!(
                    ctx,
                    INFO,
                    event_names::STREAM_FINISHED,
                    Stage::Stream,
                    "event stream closed",
                    records = stats.records
                );
                Ok(WorkerExit::Consumer(stats))
            })?;
        Ok(Worker {
            name: "consumer",
            handle,
        })
    }

    fn spawn_poller(
        &self,
        enumeration: Box<dyn EnumerationSource>,
        shutdown: Shutdown,
    ) -> tc_common::Result<Worker> {
        let ctx = self.ctx.clone();
        let publisher = self.publisher(Strategy::Poller);
        let config = self.config.poller.clone();
        let handle = thread::Builder::new()
            .name("tc-poller".to_string())
            .spawn(move || {
                let span = info_span!("poller", run_id = %ctx.run_id, stage = %Stage::Poll);
                let _guard = span.enter();

                crate::log_event!(
                    ctx,
                    INFO,
                    event_names::POLL_STARTED,
                    Stage::Poll,
                    "census poller started",
                    interval_ms = config.interval_ms,
                    iterator = %config.iterator_path.display()
                );
                let mut poller = CensusPoller::from_config(enumeration, publisher, &config);
                poller.run(&shutdown)?;
                crate::log_event!(
                    ctx,
                    INFO,
                    event_names::POLL_STOPPED,
                    Stage::Poll,
                    "census poller stopped",
                    cycles = poller.stats().cycles
                );
                Ok(WorkerExit::Poller(poller.stats()))
            })?;
        Ok(Worker {
            name: "poller",
            handle,
        })
    }

    /// Wait for a signal, shutdown, or the first worker to exit.
    fn supervise(
        &self,
        workers: &mut Vec<Worker>,
        shutdown: &Shutdown,
        summary: &mut DaemonSummary,
    ) -> tc_common::Result<()> {
        while !shutdown.is_triggered() {
            if signal_received() {
                summary.interrupted = true;
                break;
            }
            if let Some(idx) = workers.iter().position(|w| w.handle.is_finished()) {
                let worker = workers.remove(idx);
                match worker.handle.join() {
                    Ok(Ok(exit)) => record_exit(exit, summary),
                    Ok(Err(e)) => {
                        self.report_worker_error(worker.name, &e);
                        return Err(e);
                    }
                    Err(_) => {
                        return Err(tc_common::Error::Io(std::io::Error::other(format!(
                            "{} thread panicked",
                            worker.name
                        ))))
                    }
                }
                // A source that closed cleanly ends the run only when
                // nothing else is left to do.
                if workers.is_empty() {
                    break;
                }
            }
            shutdown.wait_timeout(SUPERVISOR_TICK);
        }
        Ok(())
    }

    fn report_worker_error(&self, name: &str, err: &tc_common::Error) {
        self.metrics.record_error(&format!("{}_failed", name));
        // Event names are tracing targets and must be constants.
        match name {
            "poller" => crate::log_event!(
                self.ctx,
                ERROR,
                event_names::POLL_FAILED,
                Stage::Daemon,
                "worker terminated",
                worker = name,
                error = %err,
                code = err.code(),
                fatal = err.is_fatal()
            ),
            _ => crate::log_event!(
                self.ctx,
                ERROR,
                event_names::STREAM_FAILED,
                Stage::Daemon,
                "worker terminated",
                worker = name,
                error = %err,
                code = err.code(),
                fatal = err.is_fatal()
            ),
        }
    }

    fn join_workers(&self, workers: Vec<Worker>, summary: &mut DaemonSummary) {
        for worker in workers {
            let deadline = Instant::now() + JOIN_GRACE;
            while !worker.handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if !worker.handle.is_finished() {
                // Blocked on a read that only ends when the writer closes.
                debug!(worker = worker.name, "worker still blocked at shutdown, detaching");
                continue;
            }
            match worker.handle.join() {
                Ok(Ok(exit)) => record_exit(exit, summary),
                Ok(Err(e)) => self.report_worker_error(worker.name, &e),
                Err(_) => debug!(worker = worker.name, "worker panicked during shutdown"),
            }
        }
    }
}

fn record_exit(exit: WorkerExit, summary: &mut DaemonSummary) {
    match exit {
        WorkerExit::Consumer(stats) => summary.consumer = Some(stats),
        WorkerExit::Poller(stats) => summary.poller = Some(stats),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::memory::{MemoryOpener, MemoryTable, ScriptedEnumeration};
    use crate::logging::LogContext;
    use crate::stream::{ChannelSource, MutationEvent, MutationKind, RECORD_LEN};
    use std::io::Write;
    use tc_common::{TableId, TableIdentity, TableName};

    fn config(replica: bool, poller: bool) -> CensusConfig {
        let mut config = CensusConfig::default();
        config.metrics.enabled = false;
        config.replica.enabled = replica;
        config.replica.record_path = Some(PathBuf::from("/unused"));
        config.replica.pinned_root = None;
        config.poller.enabled = poller;
        config.poller.interval_ms = 5;
        config
    }

    fn ctx() -> LogContext {
        LogContext::new("run-test", "host-test")
    }

    fn insert(id: u32, key: u32) -> Vec<u8> {
        MutationEvent {
            table_id: TableId(id),
            table_name: TableName::new("tbl"),
            kind: MutationKind::Insert,
            owner_pid: 1,
            key_size: 4,
            value_size: 4,
            key_bytes: key.to_le_bytes(),
            value_bytes: [1, 0, 0, 0],
        }
        .to_record()
        .to_vec()
    }

    #[test]
    fn test_replica_run_seeds_then_drains() {
        let (tx, rx) = mpsc::channel();
        tx.send(insert(1, 1)).unwrap();
        tx.send(insert(1, 9)).unwrap();
        drop(tx);

        let table = MemoryTable::new(
            TableIdentity::partial(TableId(1), TableName::new("tbl"))
                .with_capacity(10)
                .with_key_size(4)
                .with_value_size(4),
        )
        .with_entry(1u32.to_le_bytes(), 1u32.to_le_bytes())
        .with_entry(2u32.to_le_bytes(), 1u32.to_le_bytes());

        let sources = DaemonSources {
            opener: Some(Arc::new(MemoryOpener::new())),
            records: Some(Box::new(move || {
                Ok(Box::new(ChannelSource::new(rx)) as Box<dyn RecordSource>)
            })),
            handles: vec![Box::new(table)],
            ..Default::default()
        };

        let mut daemon = Daemon::new(config(true, false), ctx()).unwrap();
        let summary = daemon.run(sources, &Shutdown::new()).unwrap();

        assert_eq!(summary.snapshot.as_ref().unwrap().tables_seeded(), 1);
        assert_eq!(summary.consumer.unwrap().records, 2);
        let census = daemon.store().unwrap().read(TableId(1)).unwrap();
        // Key 1 was seen by both the snapshot and the stream.
        assert_eq!(census.cardinality, 3);
        let output = daemon.metrics().render().unwrap();
        assert!(output.contains("table_item_count{table=\"1\"} 3"));
    }

    #[test]
    fn test_fifo_record_opener_feeds_consumer() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&insert(2, 5)).unwrap();
        file.write_all(&insert(2, 6)).unwrap();
        file.flush().unwrap();

        let sources = DaemonSources {
            opener: Some(Arc::new(MemoryOpener::new())),
            records: Some(record_opener(
                RecordSourceKind::Fifo,
                file.path().to_path_buf(),
                RECORD_LEN,
            )),
            ..Default::default()
        };
        let mut daemon = Daemon::new(config(true, false), ctx()).unwrap();
        let summary = daemon.run(sources, &Shutdown::new()).unwrap();

        assert_eq!(summary.consumer.unwrap().records, 2);
        let census = daemon.store().unwrap().read(TableId(2)).unwrap();
        assert_eq!(census.cardinality, 2);
    }

    #[test]
    fn test_ringbuf_record_opener_missing_pin() {
        let open = record_opener(
            RecordSourceKind::Ringbuf,
            PathBuf::from("/nonexistent/table_census/map_events"),
            RECORD_LEN,
        );
        assert!(open().is_err());
    }

    #[test]
    fn test_poller_failure_stops_daemon() {
        let sources = DaemonSources {
            enumeration: Some(Box::new(ScriptedEnumeration::new().then_output("bad line\n"))),
            ..Default::default()
        };
        let mut daemon = Daemon::new(config(false, true), ctx()).unwrap();
        let err = daemon.run(sources, &Shutdown::new()).unwrap_err();
        assert!(matches!(err, tc_common::Error::PollBudgetExhausted { .. }));
        let output = daemon.metrics().render().unwrap();
        assert!(output.contains("tc_errors_total{type=\"poller_failed\"} 1"));
    }

    #[test]
    fn test_unopenable_record_source_is_fatal() {
        let sources = DaemonSources {
            opener: Some(Arc::new(MemoryOpener::new())),
            records: Some(Box::new(|| {
                Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no fifo"))
            })),
            ..Default::default()
        };
        let mut daemon = Daemon::new(config(true, false), ctx()).unwrap();
        let err = daemon.run(sources, &Shutdown::new()).unwrap_err();
        assert_eq!(err.code(), 22);
        let output = daemon.metrics().render().unwrap();
        assert!(output.contains("tc_errors_total{type=\"consumer_failed\"} 1"));
    }

    #[test]
    fn test_both_strategies_publish_disjoint_series() {
        let (tx, rx) = mpsc::channel();
        tx.send(insert(4, 1)).unwrap();
        let sources = DaemonSources {
            opener: Some(Arc::new(MemoryOpener::new())),
            records: Some(Box::new(move || {
                Ok(Box::new(ChannelSource::new(rx)) as Box<dyn RecordSource>)
            })),
            enumeration: Some(Box::new(
                ScriptedEnumeration::new().then_output("4 tbl 8 2\n"),
            )),
            ..Default::default()
        };

        let shutdown = Shutdown::new();
        let stopper = shutdown.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            stopper.trigger();
            drop(tx);
        });

        let mut daemon = Daemon::new(config(true, true), ctx()).unwrap();
        daemon.run(sources, &shutdown).unwrap();
        handle.join().unwrap();

        let output = daemon.metrics().render().unwrap();
        assert!(output.contains("table_item_count{table=\"4\"} 2"));
        assert!(output.contains("table_replica_item_count{table=\"4\"} 1"));
    }
}
