//! Mutation records read straight from the pinned event ring buffer.
//!
//! libbpf's ring buffer is not `Send`, so a forwarder thread owns it, polls
//! it and pushes every sample into a channel in emission order. The consumer
//! side is a [`ChannelSource`]. The forwarder stops once the source is
//! dropped.

use libbpf_rs::{MapCore, MapHandle, MapType, RingBufferBuilder};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use super::bpf::io_error;
use crate::stream::{ChannelSource, RecordSource};

/// How long one ring buffer poll may block before checking for stop.
pub const DEFAULT_POLL: Duration = Duration::from_millis(100);

/// Records drained from a pinned `BPF_MAP_TYPE_RINGBUF`.
pub struct RingBufSource {
    records: ChannelSource,
    stop: Arc<AtomicBool>,
    forwarder: Option<JoinHandle<()>>,
}

impl RingBufSource {
    /// Open the pinned ring buffer and start forwarding its samples.
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::open_with_poll(path, DEFAULT_POLL)
    }

    pub fn open_with_poll(path: &Path, poll: Duration) -> io::Result<Self> {
        let handle = MapHandle::from_pinned_path(path).map_err(io_error)?;
        if handle.map_type() != MapType::RingBuf {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a ring buffer", path.display()),
            ));
        }

        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let forwarder = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("tc-ringbuf".to_string())
                .spawn(move || forward(handle, tx, ready_tx, &stop, poll))?
        };

        // The ring buffer is built on the forwarder; surface its failure here.
        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(io::Error::other("ring buffer forwarder exited")),
        }

        Ok(RingBufSource {
            records: ChannelSource::new(rx).with_poll_interval(poll),
            stop,
            forwarder: Some(forwarder),
        })
    }
}

fn forward(
    handle: MapHandle,
    tx: mpsc::Sender<Vec<u8>>,
    ready: mpsc::Sender<io::Result<()>>,
    stop: &AtomicBool,
    poll: Duration,
) {
    let mut builder = RingBufferBuilder::new();
    let added = builder.add(&handle, move |sample: &[u8]| {
        // A negative return aborts the poll; the receiver is gone.
        match tx.send(sample.to_vec()) {
            Ok(()) => 0,
            Err(_) => -1,
        }
    });
    if let Err(e) = added {
        let _ = ready.send(Err(io_error(e)));
        return;
    }
    let ring = match builder.build() {
        Ok(ring) => ring,
        Err(e) => {
            let _ = ready.send(Err(io_error(e)));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    while !stop.load(Ordering::Acquire) {
        match ring.poll(poll) {
            Ok(()) => {}
            Err(e) if e.kind() == libbpf_rs::ErrorKind::Interrupted => {}
            Err(e) => {
                if !stop.load(Ordering::Acquire) {
                    warn!(error = %e, "ring buffer poll failed, closing record source");
                }
                break;
            }
        }
    }
    debug!("ring buffer forwarder stopped");
}

impl RecordSource for RingBufSource {
    fn next_record(&mut self) -> io::Result<Option<Vec<u8>>> {
        self.records.next_record()
    }
}

impl Drop for RingBufSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(forwarder) = self.forwarder.take() {
            let _ = forwarder.join();
        }
    }
}
