//! Per-upstream pool of reusable byte buffers.
//!
//! Upstream bodies are accumulated into pooled buffers so steady-state
//! traffic does not allocate per request. A checked-out [`Buffer`] belongs
//! to exactly one caller and returns to the pool when dropped; when the pool
//! is empty, checkout hands out a fresh unpooled buffer instead of blocking,
//! and dropping that one simply frees it.

use serde::Deserialize;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

/// The meta codec reads header strings into a pooled scratch buffer, so
/// every buffer must be able to hold at least one maximum-length string.
pub const MIN_BUFFER_CAPACITY: usize = 255;

fn default_count() -> usize {
  100
}

fn default_min() -> usize {
  131_072 // 128KB
}

fn default_max() -> usize {
  1_048_576 // 1MB
}

/// Pool sizing, usually deserialized from the upstream's `buffers` section.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PoolConfig {
  /// Number of buffers kept in the pool.
  #[serde(default = "default_count")]
  pub count: usize,
  /// Initial capacity of each buffer.
  #[serde(default = "default_min")]
  pub min: usize,
  /// Hard cap on how much a buffer will accumulate.
  #[serde(default = "default_max")]
  pub max: usize,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      count: default_count(),
      min: default_min(),
      max: default_max(),
    }
  }
}

#[derive(Debug)]
struct PoolInner {
  free: Mutex<Vec<Vec<u8>>>,
  min: usize,
  max: usize,
}

/// A fixed-size pool of reusable byte buffers.
#[derive(Clone)]
pub struct Pool {
  inner: Arc<PoolInner>,
}

impl Pool {
  pub fn new(config: &PoolConfig) -> Pool {
    let min = config.min.max(MIN_BUFFER_CAPACITY);
    let max = config.max.max(min);
    let free = (0..config.count).map(|_| Vec::with_capacity(min)).collect();
    Pool {
      inner: Arc::new(PoolInner {
        free: Mutex::new(free),
        min,
        max,
      }),
    }
  }

  /// Checks a buffer out of the pool, or allocates a fresh unpooled one when
  /// the pool is exhausted.
  pub fn checkout(&self) -> Buffer {
    let pooled = self
      .inner
      .free
      .lock()
      .ok()
      .and_then(|mut free| free.pop());
    match pooled {
      Some(data) => Buffer {
        data,
        pos: 0,
        max: self.inner.max,
        error: None,
        pool: Some(Arc::clone(&self.inner)),
      },
      None => Buffer {
        data: Vec::with_capacity(self.inner.min),
        pos: 0,
        max: self.inner.max,
        error: None,
        pool: None,
      },
    }
  }

  /// Number of buffers currently sitting in the pool.
  pub fn available(&self) -> usize {
    self.inner.free.lock().map(|free| free.len()).unwrap_or(0)
  }
}

/// A write error recorded by a [`Buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
  /// A write would have grown the buffer past its configured max.
  CapacityExceeded,
}

/// A byte buffer checked out of a [`Pool`].
///
/// Writes append (bounded by the pool max), reads consume from a cursor, and
/// dropping the buffer releases it back to its pool.
#[derive(Debug)]
pub struct Buffer {
  data: Vec<u8>,
  pos: usize,
  max: usize,
  error: Option<BufferError>,
  pool: Option<Arc<PoolInner>>,
}

impl Buffer {
  /// Bytes written so far.
  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  /// The accumulated bytes.
  pub fn bytes(&self) -> &[u8] {
    &self.data
  }

  /// The recorded write error, if any.
  pub fn error(&self) -> Option<BufferError> {
    self.error
  }

  /// Borrows the first `n` bytes of the buffer's storage as scratch space,
  /// growing it if needed. Used by the meta codec for header strings; `n`
  /// must not exceed the pool minimum of [`MIN_BUFFER_CAPACITY`].
  pub fn take_bytes(&mut self, n: usize) -> &mut [u8] {
    if self.data.len() < n {
      self.data.resize(n, 0);
    }
    &mut self.data[..n]
  }
}

impl Write for Buffer {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    if self.data.len() + buf.len() > self.max {
      self.error = Some(BufferError::CapacityExceeded);
      return Err(io::Error::new(
        io::ErrorKind::WriteZero,
        "buffer capacity exceeded",
      ));
    }
    self.data.extend_from_slice(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

impl Read for Buffer {
  fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
    let remaining = &self.data[self.pos..];
    let n = remaining.len().min(out.len());
    out[..n].copy_from_slice(&remaining[..n]);
    self.pos += n;
    Ok(n)
  }
}

impl Drop for Buffer {
  fn drop(&mut self) {
    if let Some(pool) = self.pool.take() {
      let mut data = std::mem::take(&mut self.data);
      data.clear();
      if let Ok(mut free) = pool.free.lock() {
        free.push(data);
      }
    }
  }
}
