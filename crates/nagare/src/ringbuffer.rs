//! Bounded byte FIFO between a segment writer and a reader.
//!
//! The buffer can be driven from both worlds: blocking calls park the calling
//! thread on a [`Condvar`], async calls wait on a [`Notify`]. Every state change
//! wakes both kinds of waiters.

use std::{
    collections::VecDeque,
    pin::pin,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use tokio::sync::Notify;

use crate::error::{NagareError, NagareResult};

#[derive(Debug)]
struct State {
    buffer: VecDeque<u8>,
    closed: bool,
}

#[derive(Debug)]
pub struct RingBuffer {
    capacity: usize,
    state: Mutex<State>,

    // blocking waiters
    readable: Condvar,
    writable: Condvar,

    // async waiters
    read_notify: Notify,
    write_notify: Notify,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(State {
                buffer: VecDeque::with_capacity(capacity.min(1024 * 1024)),
                closed: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            read_notify: Notify::new(),
            write_notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake_readers(&self) {
        self.readable.notify_all();
        self.read_notify.notify_waiters();
    }

    fn wake_writers(&self) {
        self.writable.notify_all();
        self.write_notify.notify_waiters();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free(&self) -> usize {
        self.capacity - self.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Pushes as much of `data` as fits. Returns `None` once closed.
    fn push(&self, state: &mut State, data: &[u8]) -> Option<usize> {
        if state.closed {
            return None;
        }
        let n = data.len().min(self.capacity - state.buffer.len());
        if n > 0 {
            state.buffer.extend(&data[..n]);
        }
        Some(n)
    }

    fn take(&self, state: &mut State, n: usize) -> Vec<u8> {
        let n = n.min(state.buffer.len());
        let data: Vec<u8> = state.buffer.drain(..n).collect();
        if n > 0 {
            self.wake_writers();
        }
        data
    }

    /// Blocks until all of `data` is accepted or the buffer is closed.
    /// Returns the number of bytes accepted.
    pub fn write(&self, data: &[u8]) -> usize {
        let mut written = 0;
        let mut state = self.lock();
        loop {
            match self.push(&mut state, &data[written..]) {
                None => return written,
                Some(n) => {
                    written += n;
                    if n > 0 {
                        self.wake_readers();
                    }
                }
            }
            if written == data.len() {
                return written;
            }
            state = self
                .writable
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Async counterpart of [`RingBuffer::write`].
    pub async fn write_async(&self, data: &[u8]) -> usize {
        let mut written = 0;
        loop {
            let mut notified = pin!(self.write_notify.notified());
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                match self.push(&mut state, &data[written..]) {
                    None => return written,
                    Some(n) => {
                        written += n;
                        if n > 0 {
                            self.wake_readers();
                        }
                    }
                }
                if written == data.len() {
                    return written;
                }
            }
            notified.await;
        }
    }

    /// Reads up to `n` bytes.
    ///
    /// With `block`, waits until `n` bytes are buffered (at most the capacity),
    /// the buffer is closed or `timeout` passes. Fails with
    /// [`NagareError::ReadTimeout`] if the timeout passed with nothing to read.
    /// An empty result means the buffer is closed and drained (or, without
    /// `block`, currently empty).
    pub fn read(&self, n: usize, block: bool, timeout: Option<Duration>) -> NagareResult<Vec<u8>> {
        let wanted = n.min(self.capacity);
        let mut state = self.lock();
        if block {
            let deadline = timeout.map(|t| Instant::now() + t);
            while state.buffer.len() < wanted && !state.closed {
                match deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        state = self
                            .readable
                            .wait_timeout(state, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0;
                    }
                    None => {
                        state = self
                            .readable
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                }
            }
            if state.buffer.is_empty() && !state.closed && wanted > 0 {
                return Err(NagareError::ReadTimeout);
            }
        }
        Ok(self.take(&mut state, n))
    }

    /// Blocks until at least one byte is buffered or the buffer is closed, then
    /// copies as much as fits into `buf`. Returns 0 at end of stream.
    pub fn read_available(&self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let mut state = self.lock();
        while state.buffer.is_empty() && !state.closed {
            state = self
                .readable
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        self.copy_out(&mut state, buf)
    }

    /// Async counterpart of [`RingBuffer::read_available`].
    pub async fn read_available_async(&self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        loop {
            let mut notified = pin!(self.read_notify.notified());
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if !state.buffer.is_empty() || state.closed {
                    return self.copy_out(&mut state, buf);
                }
            }
            notified.await;
        }
    }

    fn copy_out(&self, state: &mut State, buf: &mut [u8]) -> usize {
        let n = buf.len().min(state.buffer.len());
        for (dst, src) in buf.iter_mut().zip(state.buffer.drain(..n)) {
            *dst = src;
        }
        if n > 0 {
            self.wake_writers();
        }
        n
    }

    /// Idempotent. Wakes every waiter; later writes are rejected while reads
    /// drain what is left.
    pub fn close(&self) {
        let mut state = self.lock();
        if !state.closed {
            state.closed = true;
            drop(state);
            self.wake_readers();
            self.wake_writers();
        }
    }

    /// Drops everything buffered.
    pub fn clear(&self) {
        let mut state = self.lock();
        if !state.buffer.is_empty() {
            state.buffer.clear();
            drop(state);
            self.wake_writers();
        }
    }

    /// Blocks until there is room for at least one byte. Returns `false` if the
    /// buffer was closed instead.
    pub fn wait_free(&self) -> bool {
        let mut state = self.lock();
        while state.buffer.len() >= self.capacity && !state.closed {
            state = self
                .writable
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        !state.closed
    }

    /// Async counterpart of [`RingBuffer::wait_free`].
    pub async fn wait_free_async(&self) -> bool {
        loop {
            let mut notified = pin!(self.write_notify.notified());
            notified.as_mut().enable();
            {
                let state = self.lock();
                if state.closed {
                    return false;
                }
                if state.buffer.len() < self.capacity {
                    return true;
                }
            }
            notified.await;
        }
    }
}
