//! In-memory and on-disk response artifacts.
//!
//! A [`RemoteArtifact`] wraps a response just fetched from the upstream: its
//! body lives in a pooled buffer that returns to the pool when the artifact
//! is dropped. A [`LocalArtifact`] wraps a response loaded from the cache:
//! it owns the open file handle, positioned just past the header, and the
//! body is the remaining file content (or, for images, the content of the
//! sibling image file the handle has been rebound to).
//!
//! A `RemoteArtifact` cannot be shared between threads mid-read, which is
//! why single-flight followers reload a [`LocalArtifact`] from disk instead
//! of borrowing the owner's copy.

use crate::error::{Error, Result};
use crate::meta::Meta;
use crate::pool::Buffer;
use std::fs::File;
use std::io::{self, Read, Write};

/// Anything the store can write to disk.
pub trait Persist {
  fn persist(&self, w: &mut dyn Write) -> io::Result<()>;
}

impl Persist for Meta {
  fn persist(&self, w: &mut dyn Write) -> io::Result<()> {
    self.serialize(w)
  }
}

/// A response fetched from the upstream, body buffered in memory.
#[derive(Debug)]
pub struct RemoteArtifact {
  meta: Meta,
  buffer: Buffer,
}

impl RemoteArtifact {
  pub fn new(meta: Meta, buffer: Buffer) -> RemoteArtifact {
    RemoteArtifact { meta, buffer }
  }

  pub fn meta(&self) -> &Meta {
    &self.meta
  }
}

impl Persist for RemoteArtifact {
  fn persist(&self, w: &mut dyn Write) -> io::Result<()> {
    self.meta.serialize(w)?;
    w.write_all(Buffer::bytes(&self.buffer))
  }
}

impl Read for RemoteArtifact {
  fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
    self.buffer.read(out)
  }
}

/// A response loaded from the local cache, body still on disk.
#[derive(Debug)]
pub struct LocalArtifact {
  meta: Meta,
  file: File,
}

impl LocalArtifact {
  pub fn new(meta: Meta, file: File) -> LocalArtifact {
    LocalArtifact { meta, file }
  }

  pub fn meta(&self) -> &Meta {
    &self.meta
  }

  /// Points the body at a different file. Used for image artifacts, whose
  /// header sidecar and body live in separate files.
  pub(crate) fn rebind(&mut self, file: File) {
    self.file = file;
  }
}

impl Read for LocalArtifact {
  fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
    self.file.read(out)
  }
}

/// Either kind of servable artifact.
#[derive(Debug)]
pub enum Artifact {
  Remote(RemoteArtifact),
  Local(LocalArtifact),
}

impl Artifact {
  pub fn meta(&self) -> &Meta {
    match self {
      Artifact::Remote(r) => r.meta(),
      Artifact::Local(l) => l.meta(),
    }
  }

  /// Consumes the artifact, returning its header and full body. Dropping
  /// the remote buffer here is what releases it back to its pool.
  pub fn into_bytes(self) -> Result<(Meta, Vec<u8>)> {
    match self {
      Artifact::Remote(r) => {
        let body = Buffer::bytes(&r.buffer).to_vec();
        Ok((r.meta, body))
      }
      Artifact::Local(mut l) => {
        let len = l.meta.body_length as usize;
        let mut body = Vec::with_capacity(len);
        (&mut l.file)
          .take(len as u64)
          .read_to_end(&mut body)
          .map_err(|e| Error::io("artifact body read", e))?;
        Ok((l.meta, body))
      }
    }
  }
}

impl Read for Artifact {
  fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
    match self {
      Artifact::Remote(r) => r.read(out),
      Artifact::Local(l) => l.read(out),
    }
  }
}
