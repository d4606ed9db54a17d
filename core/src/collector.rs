//! Append-only store for the local top-k candidates emitted by workers
//!
//! Every participant owns a [`CollectorWriter`]. Its first write must be the sentinel
//! written by [`CollectorWriter::warmup`]; real records are rejected before that. Appends
//! are acknowledged by the background thread once committed, so a record is visible to
//! [`Collector::read_all`] as soon as `append` returns.

use ndarray::Array2;
use std::collections::HashSet;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{instrument, Span};

/// Batch index reserved for warmup records
pub const SENTINEL_BATCH_INDEX: i64 = -1;

/// Candidates of one corpus chunk. Row `j` holds the `j`-th candidate of every query:
/// `values[[j, qi]]` is a score, `indices[[j, qi]]` the row of that candidate inside the
/// chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalTopK {
    pub batch_index: i64,
    pub values: Array2<f32>,
    pub indices: Array2<usize>,
}

impl LocalTopK {
    pub fn sentinel() -> Self {
        Self {
            batch_index: SENTINEL_BATCH_INDEX,
            values: Array2::zeros((0, 0)),
            indices: Array2::zeros((0, 0)),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.batch_index == SENTINEL_BATCH_INDEX
    }

    /// Number of candidates per query
    pub fn k(&self) -> usize {
        self.values.nrows()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Collected {
    pub writer_id: usize,
    pub record: LocalTopK,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CollectorError {
    #[error("collector is closed")]
    Closed,
    #[error("writer {0} is already attached")]
    DuplicateWriter(usize),
    #[error("writer {0} appended before its warmup write")]
    NotWarmedUp(usize),
    #[error("read requested while writers {0:?} are still attached")]
    WritersActive(Vec<usize>),
}

#[derive(Debug)]
pub struct Collector {
    sender: mpsc::UnboundedSender<CollectorCommand>,
    thread: Option<JoinHandle<()>>,
}

impl Collector {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let thread = std::thread::spawn(move || collector_blocking_task(receiver));
        Self {
            sender,
            thread: Some(thread),
        }
    }

    /// Attach a writer. Ids must be unique among attached writers.
    pub fn writer(&self, writer_id: usize) -> Result<CollectorWriter, CollectorError> {
        let (ack, response) = oneshot::channel();
        self.sender
            .send(CollectorCommand::Attach { writer_id, ack })
            .map_err(|_| CollectorError::Closed)?;
        response.blocking_recv().map_err(|_| CollectorError::Closed)??;

        Ok(CollectorWriter {
            writer_id,
            sender: self.sender.clone(),
        })
    }

    /// Every record ever appended, in commit order, sentinels included.
    ///
    /// Fails with [`CollectorError::WritersActive`] while a writer is still attached; the
    /// collector stays usable and the read can be retried once those writers are dropped. A
    /// successful read closes the collector.
    #[instrument(skip_all)]
    pub fn read_all(&mut self) -> Result<Vec<Collected>, CollectorError> {
        let (response_sender, response) = oneshot::channel();
        self.sender
            .send(CollectorCommand::ReadAll {
                response_sender,
                span: Span::current(),
            })
            .map_err(|_| CollectorError::Closed)?;
        let records = response.blocking_recv().map_err(|_| CollectorError::Closed)??;

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        Ok(records)
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle used by one worker. Dropping it detaches the writer.
#[derive(Debug)]
pub struct CollectorWriter {
    writer_id: usize,
    sender: mpsc::UnboundedSender<CollectorCommand>,
}

impl CollectorWriter {
    pub fn id(&self) -> usize {
        self.writer_id
    }

    /// Write the sentinel record. Repeated calls are acknowledged without writing again.
    pub fn warmup(&self) -> Result<(), CollectorError> {
        self.send_record(LocalTopK::sentinel())
    }

    pub fn append(&self, record: LocalTopK) -> Result<(), CollectorError> {
        self.send_record(record)
    }

    fn send_record(&self, record: LocalTopK) -> Result<(), CollectorError> {
        let (ack, response) = oneshot::channel();
        self.sender
            .send(CollectorCommand::Append {
                writer_id: self.writer_id,
                record,
                ack,
            })
            .map_err(|_| CollectorError::Closed)?;
        response.blocking_recv().map_err(|_| CollectorError::Closed)?
    }
}

impl Drop for CollectorWriter {
    fn drop(&mut self) {
        let _ = self.sender.send(CollectorCommand::Detach {
            writer_id: self.writer_id,
        });
    }
}

// Background task owning the record log
fn collector_blocking_task(mut receiver: mpsc::UnboundedReceiver<CollectorCommand>) {
    let mut records: Vec<Collected> = Vec::new();
    let mut attached: HashSet<usize> = HashSet::new();
    let mut warmed_up: HashSet<usize> = HashSet::new();

    while let Some(cmd) = receiver.blocking_recv() {
        match cmd {
            CollectorCommand::Attach { writer_id, ack } => {
                let result = match attached.insert(writer_id) {
                    true => Ok(()),
                    false => Err(CollectorError::DuplicateWriter(writer_id)),
                };
                let _ = ack.send(result);
            }
            CollectorCommand::Append {
                writer_id,
                record,
                ack,
            } => {
                let result = if record.is_sentinel() {
                    if warmed_up.insert(writer_id) {
                        records.push(Collected { writer_id, record });
                    }
                    Ok(())
                } else if !warmed_up.contains(&writer_id) {
                    Err(CollectorError::NotWarmedUp(writer_id))
                } else {
                    records.push(Collected { writer_id, record });
                    let counter = metrics::counter!("ds_collector_records");
                    counter.increment(1);
                    Ok(())
                };
                let _ = ack.send(result);
            }
            CollectorCommand::Detach { writer_id } => {
                attached.remove(&writer_id);
            }
            CollectorCommand::ReadAll {
                response_sender,
                span,
            } => {
                let _span = span.entered();
                if !attached.is_empty() {
                    let mut active: Vec<usize> = attached.iter().copied().collect();
                    active.sort_unstable();
                    let _ = response_sender.send(Err(CollectorError::WritersActive(active)));
                    continue;
                }
                tracing::debug!("Collected {} records", records.len());
                let _ = response_sender.send(Ok(std::mem::take(&mut records)));
                break;
            }
        }
    }
}

#[derive(Debug)]
enum CollectorCommand {
    Attach {
        writer_id: usize,
        ack: oneshot::Sender<Result<(), CollectorError>>,
    },
    Append {
        writer_id: usize,
        record: LocalTopK,
        ack: oneshot::Sender<Result<(), CollectorError>>,
    },
    Detach {
        writer_id: usize,
    },
    ReadAll {
        response_sender: oneshot::Sender<Result<Vec<Collected>, CollectorError>>,
        span: Span,
    },
}
