//! Reusable receive buffers.
//!
//! Every exchange reads its response into a buffer large enough for the
//! biggest possible DNS message. Allocating 64 KiB per exchange is wasteful,
//! so buffers are kept in a [`BufferPool`] and handed out as [`PooledBuf`]s
//! that return themselves to the pool when dropped.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use core::ops::{Deref, DerefMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::vec::Vec;

/// The maximum size of a DNS message.
pub const MAX_MSG_SIZE: usize = 65535;

/// How many idle buffers the pool keeps around at most.
const MAX_IDLE: usize = 32;

//----------- BufferPool -----------------------------------------------------

/// A concurrent pool of equally sized byte buffers.
#[derive(Debug)]
pub struct BufferPool {
    /// The size of each buffer.
    size: usize,

    /// Buffers currently not checked out.
    idle: Mutex<Vec<Vec<u8>>>,

    /// Number of buffers currently checked out.
    outstanding: AtomicUsize,
}

impl BufferPool {
    /// Creates a pool handing out buffers of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            idle: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Checks out a buffer.
    ///
    /// The buffer is returned to the pool when the guard is dropped.
    pub fn get(&self) -> PooledBuf<'_> {
        let buf = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0; self.size]);
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledBuf {
            buf: Some(buf),
            pool: self,
        }
    }

    /// Returns the size of the buffers.
    pub fn buf_size(&self) -> usize {
        self.size
    }

    /// Returns the number of buffers currently checked out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Returns the number of idle buffers in the pool.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Puts a buffer back.
    fn put(&self, buf: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE {
            idle.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(MAX_MSG_SIZE)
    }
}

//----------- PooledBuf ------------------------------------------------------

/// A buffer checked out from a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuf<'a> {
    /// The buffer. Only `None` while being dropped.
    buf: Option<Vec<u8>>,

    /// The pool to return the buffer to.
    pool: &'a BufferPool,
}

impl Deref for PooledBuf<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

//============ Tests =========================================================
