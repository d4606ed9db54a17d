//! Corpus chunk dispatch from the coordinator to the workers
use dense_search_backend_core::Input;
use tracing::Span;

/// Queue entry
#[derive(Debug)]
pub struct Chunk {
    /// Dispatch order, starting at 0
    pub batch_index: usize,
    /// Encoding batch size requested by the coordinator
    pub batch_size: usize,
    pub inputs: Vec<Input>,
    /// Span of the dispatching job, entered by the worker
    pub span: Span,
}

/// Producer side of the chunk queue. Dropping or closing it lets workers drain what is
/// left and then stop.
#[derive(Debug)]
pub struct ChunkQueue {
    sender: async_channel::Sender<Chunk>,
}

pub type ChunkReceiver = async_channel::Receiver<Chunk>;

impl ChunkQueue {
    pub fn bounded(capacity: usize) -> (Self, ChunkReceiver) {
        let (sender, receiver) = async_channel::bounded(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Blocks while the queue is full. Fails only if every worker is gone.
    pub fn dispatch(&self, chunk: Chunk) -> Result<(), Chunk> {
        self.sender.send_blocking(chunk).map_err(|err| err.into_inner())?;
        let gauge = metrics::gauge!("ds_queue_size");
        gauge.set(self.sender.len() as f64);
        Ok(())
    }

    pub fn close(&self) -> bool {
        self.sender.close()
    }

    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }
}

/// Next chunk for a worker, or `None` once the queue is closed and drained
pub fn next_chunk(receiver: &ChunkReceiver) -> Option<Chunk> {
    let chunk = receiver.recv_blocking().ok();
    let gauge = metrics::gauge!("ds_queue_size");
    gauge.set(receiver.len() as f64);
    chunk
}
