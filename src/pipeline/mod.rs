//! Writer and Reader Pipelines: the two secondary threads that sit between
//! the opaque producer/consumer queues and the Volume Store + FEC Codec.

mod reader;
mod writer;

pub use reader::ReaderPipeline;
pub use writer::WriterPipeline;

/// One logical block crossing a pipeline queue: exactly `K · PACKET_SIZE`
/// bytes plus how many of them are meaningful.
#[derive(Debug, Clone)]
pub struct LogicalBlock {
    pub data: Vec<u8>,
    pub bytes_used: u32,
}

/// Bounded producer/consumer queue halves, built on `crossbeam-channel`:
/// `send` blocks when full, `recv` blocks when empty and returns an error
/// once every sender is dropped — which this crate treats as end-of-stream.
pub type BlockSender = crossbeam_channel::Sender<LogicalBlock>;
pub type BlockReceiver = crossbeam_channel::Receiver<LogicalBlock>;

/// Creates a bounded queue of the given capacity for use between a producer
/// (or the Reader Pipeline) and its consumer.
pub fn bounded_queue(capacity: usize) -> (BlockSender, BlockReceiver) {
    crossbeam_channel::bounded(capacity)
}
