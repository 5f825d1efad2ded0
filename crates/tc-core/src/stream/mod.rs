//! Mutation event stream: record sources, the wire decoder and the consumer.

pub mod consumer;
pub mod decode;
pub mod source;

pub use consumer::{ConsumerStats, EventConsumer, Step};
pub use decode::{decode_record, DecodeError, MutationEvent, MutationKind, RECORD_LEN};
pub use source::{ChannelSource, ReaderSource, RecordSource};
