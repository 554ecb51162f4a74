//! In-process PCM transport between the decoder session and the rendering pipeline.
//!
//! A single-producer/single-consumer byte stream with rendezvous semantics:
//! - [`Transport::open_writer`] blocks until a reader has attached (or the transport closes)
//! - writes block while the buffer is full and fail with `BrokenPipe` once the reader is gone
//! - reads block while the buffer is empty and return `Ok(0)` once the writer is gone and
//!   everything buffered has been drained
//!
//! [`Transport::close`] never blocks and wakes every waiter on both sides, so teardown does
//! not depend on which side happens to be parked.
//!
//! The stream carries interleaved stereo signed 16-bit little-endian PCM.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// Channel count carried by the transport.
pub const CHANNELS: usize = 2;
/// Bytes per interleaved frame (2 channels × s16).
pub const BYTES_PER_FRAME: usize = CHANNELS * 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport end already opened")]
    AlreadyOpen,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum End {
    Waiting,
    Open,
    Gone,
}

struct State {
    buf: VecDeque<u8>,
    reader: End,
    writer: End,
    closed: bool,
    abort: Option<String>,
    duration_ms: Option<u64>,
}

struct Inner {
    state: Mutex<State>,
    cv: Condvar,
    capacity: usize,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, g: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.cv.wait(g).unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle to one session's transport. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    /// Create a transport buffering at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    buf: VecDeque::new(),
                    reader: End::Waiting,
                    writer: End::Waiting,
                    closed: false,
                    abort: None,
                    duration_ms: None,
                }),
                cv: Condvar::new(),
                capacity: capacity.max(BYTES_PER_FRAME),
            }),
        }
    }

    /// Attach the consumer end. Does not wait for the writer.
    pub fn open_reader(&self) -> Result<TransportReader, TransportError> {
        let mut g = self.inner.lock();
        if g.closed {
            return Err(TransportError::Closed);
        }
        if g.reader != End::Waiting {
            return Err(TransportError::AlreadyOpen);
        }
        g.reader = End::Open;
        drop(g);
        self.inner.cv.notify_all();
        Ok(TransportReader {
            inner: self.inner.clone(),
        })
    }

    /// Attach the producer end, blocking until a reader is attached.
    ///
    /// Returns [`TransportError::Closed`] if the transport is closed (or the reader left)
    /// before the rendezvous completes.
    pub fn open_writer(&self) -> Result<TransportWriter, TransportError> {
        let mut g = self.inner.lock();
        if g.writer != End::Waiting {
            return Err(TransportError::AlreadyOpen);
        }
        while g.reader == End::Waiting && !g.closed {
            g = self.inner.wait(g);
        }
        if g.closed || g.reader == End::Gone {
            return Err(TransportError::Closed);
        }
        g.writer = End::Open;
        drop(g);
        self.inner.cv.notify_all();
        Ok(TransportWriter {
            inner: self.inner.clone(),
        })
    }

    /// Close both ends and wake every waiter. Idempotent, never blocks.
    pub fn close(&self) {
        let mut g = self.inner.lock();
        g.closed = true;
        drop(g);
        self.inner.cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Stream duration announced by the writer, if any.
    pub fn duration_ms(&self) -> Option<u64> {
        self.inner.lock().duration_ms
    }

    /// Bytes currently buffered (best-effort snapshot).
    pub fn buffered(&self) -> usize {
        self.inner.lock().buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

/// Producer end. Dropping it signals end-of-stream to the reader.
pub struct TransportWriter {
    inner: Arc<Inner>,
}

impl TransportWriter {
    /// Publish the total stream duration so the reader side can answer duration queries.
    pub fn announce_duration(&self, duration_ms: Option<u64>) {
        self.inner.lock().duration_ms = duration_ms;
    }

    /// End the stream with an error; the reader sees it after draining buffered bytes.
    pub fn abort(self, reason: impl Into<String>) {
        let mut g = self.inner.lock();
        g.abort = Some(reason.into());
        drop(g);
        // Drop marks the writer gone and notifies.
    }
}

impl Write for TransportWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut g = self.inner.lock();
        loop {
            if g.closed || g.reader == End::Gone {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "transport reader disappeared",
                ));
            }
            if g.buf.len() < self.inner.capacity {
                break;
            }
            g = self.inner.wait(g);
        }
        let room = self.inner.capacity - g.buf.len();
        let n = room.min(data.len());
        g.buf.extend(&data[..n]);
        drop(g);
        self.inner.cv.notify_all();
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for TransportWriter {
    fn drop(&mut self) {
        let mut g = self.inner.lock();
        g.writer = End::Gone;
        drop(g);
        self.inner.cv.notify_all();
    }
}

/// Consumer end. Dropping it makes pending and future writes fail with `BrokenPipe`.
pub struct TransportReader {
    inner: Arc<Inner>,
}

impl TransportReader {
    /// Stream duration announced by the writer, if any.
    pub fn duration_ms(&self) -> Option<u64> {
        self.inner.lock().duration_ms
    }
}

impl Read for TransportReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut g = self.inner.lock();
        while g.buf.is_empty() && !g.closed && g.writer != End::Gone {
            g = self.inner.wait(g);
        }
        if g.closed {
            return Ok(0);
        }
        if g.buf.is_empty() {
            // Writer gone and everything drained.
            return match g.abort.take() {
                Some(reason) => Err(io::Error::other(reason)),
                None => Ok(0),
            };
        }
        let n = out.len().min(g.buf.len());
        for (dst, src) in out.iter_mut().zip(g.buf.drain(..n)) {
            *dst = src;
        }
        drop(g);
        self.inner.cv.notify_all();
        Ok(n)
    }
}

impl Drop for TransportReader {
    fn drop(&mut self) {
        let mut g = self.inner.lock();
        g.reader = End::Gone;
        g.buf.clear();
        drop(g);
        self.inner.cv.notify_all();
    }
}
