//! Backpressured ingress streams
//!
//! One ingress serves one entity type and one write kind. Producers push
//! writes through a bounded channel; a worker task pulls them, runs up to
//! `concurrency` pipelines at once and publishes each result on a bounded
//! output stream as it completes.
//!
//! Backpressure chain: with a slow output consumer, finished writes wait in
//! their processing slots; once every slot is waiting the worker stops
//! pulling, the input channel fills and `submit` suspends.
//!
//! Completion order across keys is not guaranteed. Writes sharing a key
//! still run in submission order: jobs reach the Key Serializer in the
//! order they were pulled, and it queues them FIFO.

use crate::engine::{PipelineEngine, PipelineWrite};
use crate::error::{PipelineError, Result};
use futures::stream::{Stream, StreamExt};
use futures::FutureExt;
use recflow_common::config::IngressSettings;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info};

/// Ingress sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngressConfig {
    /// Capacity of the input and output channels
    pub buffer_size: usize,
    /// Pipelines in flight per ingress
    pub concurrency: usize,
}

impl Default for IngressConfig {
    fn default() -> Self {
        IngressConfig::from(&IngressSettings::default())
    }
}

impl From<&IngressSettings> for IngressConfig {
    fn from(settings: &IngressSettings) -> Self {
        Self {
            buffer_size: settings.buffer_size.max(1),
            concurrency: settings.concurrency.max(1),
        }
    }
}

/// Result of one submitted write
#[derive(Debug)]
pub struct Completed<T> {
    /// Ticket returned by `IngressHandle::submit`
    pub ticket: u64,
    pub result: Result<T>,
}

enum Job<W: PipelineWrite> {
    Submit {
        ticket: u64,
        write: W,
    },
    Call {
        write: W,
        reply: oneshot::Sender<Result<W::Output>>,
    },
}

/// A running ingress, before being split into its two ends
pub struct Ingress<W: PipelineWrite> {
    handle: IngressHandle<W>,
    output: IngressOutput<W::Output>,
}

impl<W: PipelineWrite> Ingress<W> {
    /// Start the worker for `entity_type` on the current tokio runtime
    pub fn spawn(
        engine: Arc<PipelineEngine>,
        entity_type: impl Into<String>,
        config: IngressConfig,
    ) -> Self {
        let entity_type: Arc<str> = Arc::from(entity_type.into());
        let buffer_size = config.buffer_size.max(1);
        let (job_tx, job_rx) = mpsc::channel::<Job<W>>(buffer_size);
        let (out_tx, out_rx) = mpsc::channel::<Completed<W::Output>>(buffer_size);

        info!(
            entity_type = %entity_type,
            write = std::any::type_name::<W>(),
            buffer_size,
            concurrency = config.concurrency,
            "Starting ingress"
        );

        tokio::spawn(ingress_worker(
            engine,
            entity_type,
            job_rx,
            out_tx,
            config.concurrency.max(1),
        ));

        Self {
            handle: IngressHandle {
                tx: job_tx,
                next_ticket: Arc::new(AtomicU64::new(0)),
            },
            output: IngressOutput {
                inner: ReceiverStream::new(out_rx),
            },
        }
    }

    /// Another producer handle for this ingress
    pub fn handle(&self) -> IngressHandle<W> {
        self.handle.clone()
    }

    pub fn split(self) -> (IngressHandle<W>, IngressOutput<W::Output>) {
        (self.handle, self.output)
    }
}

/// Producer side; cheap to clone
pub struct IngressHandle<W: PipelineWrite> {
    tx: mpsc::Sender<Job<W>>,
    next_ticket: Arc<AtomicU64>,
}

impl<W: PipelineWrite> Clone for IngressHandle<W> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            next_ticket: Arc::clone(&self.next_ticket),
        }
    }
}

impl<W: PipelineWrite> IngressHandle<W> {
    /// Queue a write; suspends while the input buffer is full
    ///
    /// The result arrives on the output stream under the returned ticket.
    pub async fn submit(&self, write: W) -> Result<u64> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(Job::Submit { ticket, write })
            .await
            .map_err(|_| PipelineError::IngressClosed)?;
        Ok(ticket)
    }

    /// Queue a write and wait for its result
    ///
    /// The result goes to this caller only; nothing is published on the
    /// output stream.
    pub async fn call(&self, write: W) -> Result<W::Output> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job::Call { write, reply })
            .await
            .map_err(|_| PipelineError::IngressClosed)?;
        rx.await.map_err(|_| PipelineError::IngressClosed)?
    }

    /// Free slots in the input buffer
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side: results of submitted writes, in completion order
///
/// Ends once every handle is dropped and in-flight work has drained.
pub struct IngressOutput<T> {
    inner: ReceiverStream<Completed<T>>,
}

impl<T> Stream for IngressOutput<T> {
    type Item = Completed<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

async fn ingress_worker<W: PipelineWrite>(
    engine: Arc<PipelineEngine>,
    entity_type: Arc<str>,
    jobs: mpsc::Receiver<Job<W>>,
    output: mpsc::Sender<Completed<W::Output>>,
    concurrency: usize,
) {
    let delivered = AtomicU64::new(0);
    let (engine, entity_type, output, delivered_ref) = (&*engine, &*entity_type, &output, &delivered);

    ReceiverStream::new(jobs)
        .for_each_concurrent(concurrency, |job| async move {
            match job {
                Job::Submit { ticket, write } => {
                    let result = run_guarded(write, engine, entity_type).await;
                    // Parks this slot (keys already released) until the consumer catches up
                    if output.send(Completed { ticket, result }).await.is_ok() {
                        delivered_ref.fetch_add(1, Ordering::Relaxed);
                    } else {
                        debug!(entity_type, ticket, "Ingress output dropped, discarding result");
                    }
                }
                Job::Call { write, reply } => {
                    let result = run_guarded(write, engine, entity_type).await;
                    // Caller may have given up waiting
                    let _ = reply.send(result);
                }
            }
        })
        .await;

    info!(
        entity_type,
        delivered = delivered.load(Ordering::Relaxed),
        "Ingress closed"
    );
}

/// Run one write; a panicking plugin fails only that write
async fn run_guarded<W: PipelineWrite>(
    write: W,
    engine: &PipelineEngine,
    entity_type: &str,
) -> Result<W::Output> {
    let key = write.key(entity_type);
    match AssertUnwindSafe(write.execute(engine, entity_type))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(_) => {
            error!(entity_type, key = %key, "Pipeline panicked");
            Err(PipelineError::Panicked { key })
        }
    }
}
