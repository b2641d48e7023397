//! The streaming cache core: an append-only byte log shared by one producer
//! and any number of concurrent readers.
//!
//! [`StreamBuffer`] accumulates bytes written by a single [`crate::fetcher::Fetcher`]
//! while any number of readers pull from it concurrently, some attaching before
//! the producer is done. Readers block on a condition variable until new bytes
//! (or a terminal state) are available, then release the lock before writing to
//! their own sink so the producer is never stalled behind slow client I/O.
//!
//! # Thread safety
//!
//! All mutable state lives behind one `Mutex`; `readers` is tracked separately
//! with an `AtomicUsize` so it can be inspected without taking the lock. The
//! mutex is never held across I/O: `append` copies into the buffer and returns;
//! `stream` releases the lock before writing to the sink and re-acquires it
//! before touching `size` again.

use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

/// Hard ceiling on a single buffer's content, in bytes (100 MiB).
pub const MAX_RESPONSE_SIZE: usize = 100 * 1024 * 1024;

/// Default starting capacity for a freshly created buffer (16 KiB).
pub const DEFAULT_INITIAL_CAPACITY: usize = 16 * 1024;

struct Inner {
    bytes: Vec<u8>,
    size: usize,
    complete: bool,
    error: bool,
}

impl Inner {
    fn has_pending_for(&self, sent: usize) -> bool {
        sent < self.size || self.complete || self.error
    }
}

/// An append-only byte log with latched completion/error state and a
/// wait/notify discipline for concurrent readers.
///
/// Construct with [`StreamBuffer::new`], append from a single producer thread
/// via [`StreamBuffer::append`], and terminate with exactly one of
/// [`StreamBuffer::complete`] or [`StreamBuffer::fail`]. Readers attach with
/// [`StreamBuffer::attach_reader`] and pull with [`StreamBuffer::stream`].
pub struct StreamBuffer {
    inner: Mutex<Inner>,
    cvar: Condvar,
    readers: AtomicUsize,
    max_response_size: usize,
}

/// RAII guard for an attached reader.
///
/// Holding a guard keeps [`StreamBuffer::reader_count`] incremented; dropping
/// it (including via an early return or panic unwind) decrements the count and
/// wakes anyone waiting on the buffer's condition variable, so readers never
/// need a manual decrement-on-every-exit-path.
pub struct ReaderGuard<'a> {
    buffer: &'a StreamBuffer,
}

impl Drop for ReaderGuard<'_> {
    fn drop(&mut self) {
        self.buffer.readers.fetch_sub(1, Ordering::AcqRel);
        // Under lock only to synchronize with waiters on the condvar; the
        // notify itself does not depend on any field this lock protects.
        let _guard = self.buffer.inner.lock().expect("StreamBuffer mutex poisoned");
        self.buffer.cvar.notify_all();
    }
}

impl StreamBuffer {
    /// Create an empty buffer with the given initial capacity and response
    /// ceiling. `initial_capacity` is clamped to `max_response_size`.
    pub fn new(initial_capacity: usize, max_response_size: usize) -> Self {
        let cap = initial_capacity.min(max_response_size);
        Self {
            inner: Mutex::new(Inner {
                bytes: Vec::with_capacity(cap),
                size: 0,
                complete: false,
                error: false,
            }),
            cvar: Condvar::new(),
            readers: AtomicUsize::new(0),
            max_response_size,
        }
    }

    /// Create a buffer using the library defaults (16 KiB initial capacity,
    /// 100 MiB ceiling).
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_INITIAL_CAPACITY, MAX_RESPONSE_SIZE)
    }

    /// Number of valid bytes currently appended.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("StreamBuffer mutex poisoned").size
    }

    /// `true` if no bytes have been appended yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current allocated capacity.
    pub fn capacity(&self) -> usize {
        self.inner.lock().expect("StreamBuffer mutex poisoned").bytes.capacity()
    }

    /// `true` once [`complete`](Self::complete) or [`fail`](Self::fail) has
    /// been called.
    pub fn is_complete(&self) -> bool {
        self.inner.lock().expect("StreamBuffer mutex poisoned").complete
    }

    /// `true` once [`fail`](Self::fail) (or an over-ceiling append) has
    /// latched the error state.
    pub fn is_error(&self) -> bool {
        self.inner.lock().expect("StreamBuffer mutex poisoned").error
    }

    /// Number of readers currently attached.
    pub fn reader_count(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    /// Producer-only. Appends `chunk`, growing capacity by doubling if
    /// needed. Returns `Ok(())` on success, or `Err(())` (having latched
    /// `error`) if the append would exceed the configured ceiling.
    pub fn append(&self, chunk: &[u8]) -> Result<(), ()> {
        let mut inner = self.inner.lock().expect("StreamBuffer mutex poisoned");
        let new_size = inner.size + chunk.len();
        if new_size > self.max_response_size {
            inner.error = true;
            inner.complete = true;
            self.cvar.notify_all();
            return Err(());
        }
        if new_size > inner.bytes.capacity() {
            let mut new_capacity = inner.bytes.capacity().max(1);
            while new_capacity < new_size {
                new_capacity *= 2;
            }
            new_capacity = new_capacity.min(self.max_response_size);
            // `reserve_exact` guarantees capacity >= len() + additional, not
            // >= capacity() + additional, so the reservation must be sized
            // relative to the current length, not the current capacity.
            let additional = new_capacity - inner.bytes.len();
            inner.bytes.reserve_exact(additional);
        }
        inner.bytes.extend_from_slice(chunk);
        inner.size = new_size;
        self.cvar.notify_all();
        Ok(())
    }

    /// Producer-only. Latches `complete`. Idempotent in practice because the
    /// `Fetcher` contract calls it at most once.
    pub fn complete(&self) {
        let mut inner = self.inner.lock().expect("StreamBuffer mutex poisoned");
        inner.complete = true;
        self.cvar.notify_all();
    }

    /// Producer-only, idempotent. Latches both `error` and `complete` so
    /// waiting readers are released.
    pub fn fail(&self) {
        let mut inner = self.inner.lock().expect("StreamBuffer mutex poisoned");
        inner.error = true;
        inner.complete = true;
        self.cvar.notify_all();
    }

    /// Attach a reader, returning an RAII guard that detaches on drop.
    pub fn attach_reader(&self) -> ReaderGuard<'_> {
        self.readers.fetch_add(1, Ordering::AcqRel);
        ReaderGuard { buffer: self }
    }

    /// Write the entire currently-valid prefix `[0, size)` to `sink` under
    /// the buffer lock. Used for the "hit, complete, no error" fast path
    /// where `size` is frozen and a single locked write is cheaper than the
    /// wait/release/reacquire dance in [`stream`](Self::stream).
    pub fn write_complete_snapshot<W: Write>(&self, sink: &mut W) -> io::Result<()> {
        let inner = self.inner.lock().expect("StreamBuffer mutex poisoned");
        sink.write_all(&inner.bytes[..inner.size])
    }

    /// Reader-side pull. Drains bytes to `sink` as they become available,
    /// blocking on the condition variable between chunks, until either the
    /// producer completes successfully, the buffer latches an error, or the
    /// sink reports a write failure.
    ///
    /// The buffer lock is held only while inspecting/advancing state; it is
    /// released for the duration of every write to `sink`.
    pub fn stream<W: Write>(&self, _reader: &ReaderGuard<'_>, sink: &mut W) -> io::Result<()> {
        let mut sent = 0usize;
        loop {
            let mut inner = self.inner.lock().expect("StreamBuffer mutex poisoned");
            while !inner.has_pending_for(sent) {
                inner = self.cvar.wait(inner).expect("StreamBuffer mutex poisoned");
            }

            if inner.error && sent >= inner.size {
                return Ok(());
            }

            while sent < inner.size {
                let end = inner.size;
                // Release the lock before touching the sink: the producer
                // must never stall behind a slow client.
                drop(inner);
                let to_write = {
                    // Re-lock only long enough to snapshot the slice range;
                    // bytes [0, size) are immutable once written, so this
                    // slice is stable even though we copy it out to avoid
                    // holding the lock across the write.
                    let guard = self.inner.lock().expect("StreamBuffer mutex poisoned");
                    guard.bytes[sent..end].to_vec()
                };
                sink.write_all(&to_write)?;
                inner = self.inner.lock().expect("StreamBuffer mutex poisoned");
                sent += to_write.len();
            }

            if inner.complete && sent >= inner.size {
                return Ok(());
            }
            drop(inner);
        }
    }
}
