//! Record sources feeding the event consumer.

use std::io::{self, ErrorKind, Read};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use super::decode::RECORD_LEN;

/// A stream of raw mutation records in emission order.
///
/// `Ok(None)` means the source is closed and no further records will arrive.
pub trait RecordSource: Send {
    fn next_record(&mut self) -> io::Result<Option<Vec<u8>>>;
}

impl<T: RecordSource + ?Sized> RecordSource for Box<T> {
    fn next_record(&mut self) -> io::Result<Option<Vec<u8>>> {
        (**self).next_record()
    }
}

/// Back-to-back fixed-size records read from a byte stream, e.g. a FIFO
/// written by an external relay instead of reading the ring buffer directly.
pub struct ReaderSource<R> {
    reader: R,
    record_len: usize,
}

impl<R: Read + Send> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self::with_record_len(reader, RECORD_LEN)
    }

    /// Use a padded stride, e.g. when the relay keeps the ring buffer's
    /// 8-byte sample alignment.
    pub fn with_record_len(reader: R, record_len: usize) -> Self {
        ReaderSource {
            reader,
            record_len: record_len.max(1),
        }
    }
}

impl<R: Read + Send> RecordSource for ReaderSource<R> {
    fn next_record(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; self.record_len];
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        // A partial tail is handed on so the decoder reports it as truncated.
        buf.truncate(filled);
        Ok(Some(buf))
    }
}

/// Records pushed through an in-process channel.
pub struct ChannelSource {
    rx: Receiver<Vec<u8>>,
    poll: Option<Duration>,
}

impl ChannelSource {
    pub fn new(rx: Receiver<Vec<u8>>) -> Self {
        ChannelSource { rx, poll: None }
    }

    /// Wake up every `poll` while idle so the consumer can observe shutdown.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = Some(poll);
        self
    }
}

impl RecordSource for ChannelSource {
    fn next_record(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self.poll {
            None => Ok(self.rx.recv().ok()),
            Some(poll) => match self.rx.recv_timeout(poll) {
                Ok(record) => Ok(Some(record)),
                Err(RecvTimeoutError::Timeout) => {
                    Err(io::Error::new(ErrorKind::WouldBlock, "no record yet"))
                }
                Err(RecvTimeoutError::Disconnected) => Ok(None),
            },
        }
    }
}
