//! Worker → writer → reader pipeline shared by every segmented format.
//!
//! ```text
//!  ┌──────────┐  bounded queue  ┌────────────┐ fetch ×N ┌──────────────┐      ┌────────┐
//!  │  Worker  ├────────────────►│ dispatcher ├─────────►│ ordered write├─────►│ Reader │
//!  └──────────┘                 └────────────┘          └──────────────┘  ▲   └────────┘
//!                                                                   RingBuffer
//! ```
//!
//! Fetches complete in any order; writes happen strictly in the order the
//! worker produced the segments.

use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    sync::{mpsc, OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{NagareError, NagareResult},
    options::StreamOptions,
    ringbuffer::RingBuffer,
    stream::reader::Reader,
    util::ordered_stream::OrderedStream,
};

/// Produces segment descriptors, usually by (re)loading a manifest.
pub trait SegmentedWorker: Send + 'static {
    type Segment: Send + Sync + 'static;

    fn run(
        self,
        ctx: WorkerContext<Self::Segment>,
    ) -> impl Future<Output = NagareResult<()>> + Send;
}

/// Fetches segments concurrently and writes them to the ring buffer in order.
pub trait SegmentedWriter: Send + Sync + 'static {
    type Segment: Send + Sync + 'static;
    type Fetched: Send + 'static;

    /// Downloads everything `write` needs. `Ok(None)` skips the segment.
    fn fetch(
        &self,
        segment: &Self::Segment,
    ) -> impl Future<Output = NagareResult<Option<Self::Fetched>>> + Send;

    fn write(
        &self,
        segment: &Self::Segment,
        fetched: Self::Fetched,
        buffer: &RingBuffer,
    ) -> impl Future<Output = NagareResult<()>> + Send;

    /// Called after a failed fetch was skipped. An error ends the stream.
    fn on_skip(
        &self,
        _segment: &Self::Segment,
        _error: &NagareError,
    ) -> impl Future<Output = NagareResult<()>> + Send {
        async { Ok(()) }
    }
}

/// State shared by every task of one open stream.
#[derive(Clone)]
pub(crate) struct Shared {
    pub(crate) buffer: Arc<RingBuffer>,
    pub(crate) cancel: CancellationToken,
    error: Arc<Mutex<Option<Arc<NagareError>>>>,
}

impl Shared {
    pub(crate) fn new(buffer_size: usize) -> Self {
        Self {
            buffer: Arc::new(RingBuffer::new(buffer_size)),
            cancel: CancellationToken::new(),
            error: Arc::new(Mutex::new(None)),
        }
    }

    /// Records the error that ends the stream. Only the first one is kept.
    pub(crate) fn fail(&self, error: NagareError) {
        let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(Arc::new(error));
        }
    }

    pub(crate) fn error(&self) -> Option<Arc<NagareError>> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn close(&self) {
        self.buffer.close();
        self.cancel.cancel();
    }
}

/// Handle given to a worker: the output queue plus cancellation primitives.
pub struct WorkerContext<S> {
    tx: mpsc::Sender<S>,
    shared: Shared,
}

impl<S> WorkerContext<S> {
    /// Queues a segment, waiting while the writer is saturated.
    /// Returns `false` if the stream was closed.
    pub async fn put(&self, segment: S) -> bool {
        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => false,
            sent = self.tx.send(segment) => sent.is_ok(),
        }
    }

    /// Sleeps for `duration`. Returns `true` if woken early because the stream
    /// was closed.
    pub async fn wait(&self, duration: Duration) -> bool {
        self.wait_until(Instant::now() + duration).await
    }

    /// Sleeps until `deadline`. Returns `true` if the stream was closed meanwhile.
    pub async fn wait_until(&self, deadline: Instant) -> bool {
        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => true,
            _ = tokio::time::sleep_until(deadline) => self.is_closed(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Waits until the ring buffer can take more data, so that manifests are not
    /// reloaded faster than the consumer reads. Returns `false` if closed.
    pub async fn wait_free(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => false,
            free = self.shared.buffer.wait_free_async() => free,
        }
    }

    /// Races `future` against closure of the stream.
    pub async fn or_closed<T>(&self, future: impl Future<Output = T>) -> Option<T> {
        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => None,
            value = future => Some(value),
        }
    }
}

struct Completed<S, F> {
    segment: S,
    // None: cancelled before the fetch finished
    result: Option<NagareResult<Option<F>>>,
    // released once the segment is written
    _permit: OwnedSemaphorePermit,
}

/// Starts `worker` and `writer` on the current runtime and returns the reader
/// end of the pipeline.
pub fn spawn_pipeline<W, R>(worker: W, writer: R, options: &StreamOptions) -> Reader
where
    W: SegmentedWorker,
    R: SegmentedWriter<Segment = W::Segment>,
{
    let shared = Shared::new(options.ringbuffer_size);
    let threads = options.segment_threads.max(1);
    let (tx, rx) = mpsc::channel(threads * 2);

    let worker_task = {
        let queue = tx.clone();
        let ctx = WorkerContext {
            tx,
            shared: shared.clone(),
        };
        let shared = shared.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                result = worker.run(ctx) => result,
                _ = shared.cancel.cancelled() => Ok(()),
            };
            match result {
                Ok(()) => tracing::debug!("Worker finished"),
                Err(e) => {
                    tracing::error!("Worker failed: {e}");
                    shared.fail(e);
                }
            }
            // the writer must not see the end of the queue before the outcome is recorded
            drop(queue);
        })
    };

    let writer_task = tokio::spawn(run_writer(writer, rx, shared.clone(), threads));

    Reader::new(shared, vec![worker_task, writer_task], options.close_grace)
}

async fn run_writer<R: SegmentedWriter>(
    writer: R,
    rx: mpsc::Receiver<R::Segment>,
    shared: Shared,
    threads: usize,
) {
    let writer = Arc::new(writer);
    let (done_tx, done_rx) = mpsc::unbounded_channel();

    tokio::join!(
        dispatch(writer.clone(), rx, done_tx, &shared, threads),
        write_in_order(&*writer, OrderedStream::new(done_rx), &shared),
    );
}

async fn dispatch<R: SegmentedWriter>(
    writer: Arc<R>,
    mut rx: mpsc::Receiver<R::Segment>,
    done_tx: mpsc::UnboundedSender<(u64, Completed<R::Segment, R::Fetched>)>,
    shared: &Shared,
    threads: usize,
) {
    let permits = Arc::new(Semaphore::new(threads));
    let mut tasks = JoinSet::new();
    let mut sequence = 0u64;

    loop {
        let permit = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let segment = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            segment = rx.recv() => match segment {
                Some(segment) => segment,
                None => break,
            },
        };

        let writer = writer.clone();
        let done_tx = done_tx.clone();
        let cancel = shared.cancel.clone();
        tasks.spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = writer.fetch(&segment) => Some(result),
            };
            _ = done_tx.send((
                sequence,
                Completed {
                    segment,
                    result,
                    _permit: permit,
                },
            ));
        });
        sequence += 1;

        while tasks.try_join_next().is_some() {}
    }

    drop(done_tx);
    while tasks.join_next().await.is_some() {}
}

async fn write_in_order<R: SegmentedWriter>(
    writer: &R,
    mut ordered: OrderedStream<Completed<R::Segment, R::Fetched>>,
    shared: &Shared,
) {
    let mut written_any = false;

    while let Some((_, completed)) = ordered.next().await {
        if shared.cancel.is_cancelled() {
            break;
        }
        let Completed {
            segment, result, ..
        } = completed;

        match result {
            None => break,
            Some(Ok(None)) => {}
            Some(Ok(Some(fetched))) => {
                let result = tokio::select! {
                    biased;
                    _ = shared.cancel.cancelled() => break,
                    result = writer.write(&segment, fetched, &shared.buffer) => result,
                };
                match result {
                    Ok(()) => written_any = true,
                    Err(e) => {
                        tracing::error!("Failed to write segment: {e}");
                        shared.fail(e);
                        break;
                    }
                }
            }
            Some(Err(e)) if !written_any => {
                tracing::error!("Failed to fetch the first segment: {e}");
                shared.fail(e);
                break;
            }
            Some(Err(e)) => {
                tracing::warn!("Skipping segment: {e}");
                if let Err(e) = writer.on_skip(&segment, &e).await {
                    tracing::error!("{e}");
                    shared.fail(e);
                    break;
                }
            }
        }
    }

    tracing::debug!("Writer finished");
    shared.close();
}
