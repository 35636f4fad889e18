use std::{
    io,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::future::join_all;
use tokio::{runtime::Handle, task::JoinHandle};

use crate::{
    error::{NagareError, NagareResult},
    stream::segmented::Shared,
};

/// Consumer end of an open stream.
///
/// Reads block until data is available; an empty read means the stream ended,
/// either naturally or because of the error reported by [`Reader::error`].
pub struct Reader {
    shared: Shared,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closing: Mutex<Option<JoinHandle<bool>>>,
    runtime: Option<Handle>,
    grace: Duration,
    read_timeout: Option<Duration>,
}

impl Reader {
    pub(crate) fn new(shared: Shared, tasks: Vec<JoinHandle<()>>, grace: Duration) -> Self {
        Self {
            shared,
            tasks: Mutex::new(tasks),
            closing: Mutex::new(None),
            runtime: Handle::try_current().ok(),
            grace,
            read_timeout: None,
        }
    }

    /// Makes [`Reader::read`] fail with [`NagareError::ReadTimeout`] when no
    /// data arrives within `timeout`.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Blocking read of up to `n` bytes. Waits until `n` bytes are buffered or
    /// the stream ends; returns an empty vector at end of stream.
    ///
    /// Must not be called from an async context, see [`Reader::read_async`].
    pub fn read(&self, n: usize) -> NagareResult<Vec<u8>> {
        self.shared.buffer.read(n, true, self.read_timeout)
    }

    /// Waits until some data is buffered and copies it into `buf`.
    /// Returns 0 at end of stream.
    pub async fn read_async(&self, buf: &mut [u8]) -> usize {
        self.shared.buffer.read_available_async(buf).await
    }

    /// The error that terminated the stream, if it did not end naturally.
    pub fn error(&self) -> Option<Arc<NagareError>> {
        self.shared.error()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.buffer.is_closed()
    }

    /// Closes the stream. Idempotent.
    ///
    /// Buffered data is discarded so that later reads see end of stream, and
    /// every task is told to stop. Tasks still running after the grace period
    /// are aborted in the background.
    pub fn close(&self) {
        self.shared.close();
        self.shared.buffer.clear();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        if tasks.is_empty() {
            return;
        }
        match &self.runtime {
            Some(runtime) => {
                let joiner = runtime.spawn(join_with_grace(tasks, self.grace));
                *self.closing.lock().unwrap_or_else(PoisonError::into_inner) = Some(joiner);
            }
            None => tasks.iter().for_each(JoinHandle::abort),
        }
    }

    /// Closes the stream and waits for its tasks. Returns `false` if some of
    /// them had to be aborted after the grace period.
    pub async fn shutdown(&self) -> bool {
        self.close();
        let joiner = self
            .closing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match joiner {
            Some(joiner) => joiner.await.unwrap_or(false),
            None => true,
        }
    }
}

async fn join_with_grace(tasks: Vec<JoinHandle<()>>, grace: Duration) -> bool {
    let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
    match tokio::time::timeout(grace, join_all(tasks)).await {
        Ok(_) => true,
        Err(_) => {
            tracing::warn!("Stream tasks did not stop within {grace:?}, aborting");
            aborts.iter().for_each(|task| task.abort());
            false
        }
    }
}

impl io::Read for Reader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.shared.buffer.read_available(buf))
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.close();
    }
}
