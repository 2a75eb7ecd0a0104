//! Artifact header codec.
//!
//! Every persisted response starts with a fixed 17-byte little-endian
//! header followed by two length-prefixed strings:
//!
//! ```text
//! offset  size  field
//! 0       2     magic (0x01 0x01)
//! 2       2     version (0x00 0x01)
//! 4       1     kind (0 = generic, 1 = image)
//! 5       4     expires (unix seconds)
//! 9       2     HTTP status
//! 11      1     len(content-type)
//! 12      1     len(cache-control)
//! 13      4     body length
//! 17      -     content-type bytes, then cache-control bytes
//! ```
//!
//! Generic artifacts append the body right after the strings; image
//! artifacts keep the body in a sibling file without the `.res` suffix so
//! the external thumbnailer can read it directly. The codec itself never
//! touches the body.

use crate::error::{Error, Result};
use crate::pool::Buffer;
use std::io::{self, Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

/// Size of the fixed artifact header.
pub const HEADER_LEN: usize = 17;

const MAGIC: [u8; 2] = [1, 1];
const VERSION: [u8; 2] = [0, 1];

/// Current unix time as the u32 the header stores.
pub(crate) fn unix_now() -> u32 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs() as u32)
    .unwrap_or(0)
}

/// What a persisted artifact contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
  /// Header and body share one file.
  Generic,
  /// Header lives in a `.res` sidecar; the body is a raw image file.
  Image,
}

impl ArtifactKind {
  fn as_byte(self) -> u8 {
    match self {
      ArtifactKind::Generic => 0,
      ArtifactKind::Image => 1,
    }
  }

  fn from_byte(b: u8) -> Option<ArtifactKind> {
    match b {
      0 => Some(ArtifactKind::Generic),
      1 => Some(ArtifactKind::Image),
      _ => None,
    }
  }
}

/// Decoded artifact header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
  pub kind: ArtifactKind,
  pub status: u16,
  pub expires: u32,
  pub content_type: String,
  pub cache_control: String,
  pub body_length: u32,
}

impl Meta {
  /// Builds a header for an upstream response, stamping `expires` as
  /// `now + ttl`. Header strings are capped at 255 bytes to fit their
  /// one-byte length prefixes.
  pub fn from_response(
    kind: ArtifactKind,
    status: u16,
    ttl: u32,
    content_type: &str,
    cache_control: &str,
    body_length: u32,
  ) -> Meta {
    Meta {
      kind,
      status,
      expires: unix_now().wrapping_add(ttl),
      content_type: cap_header_value(content_type),
      cache_control: cap_header_value(cache_control),
      body_length,
    }
  }

  pub fn is_expired(&self, now: u32) -> bool {
    self.expires < now
  }

  /// Writes the fixed header and the two header strings. Never writes the
  /// body.
  pub fn serialize<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
    let mut header = [0u8; HEADER_LEN];
    header[0..2].copy_from_slice(&MAGIC);
    header[2..4].copy_from_slice(&VERSION);
    header[4] = self.kind.as_byte();
    header[5..9].copy_from_slice(&self.expires.to_le_bytes());
    header[9..11].copy_from_slice(&self.status.to_le_bytes());
    header[11] = self.content_type.len() as u8;
    header[12] = self.cache_control.len() as u8;
    header[13..17].copy_from_slice(&self.body_length.to_le_bytes());

    w.write_all(&header)?;
    w.write_all(self.content_type.as_bytes())?;
    w.write_all(self.cache_control.as_bytes())
  }

  /// Reads a header back. `scratch` is a buffer checked out from the
  /// upstream's pool; its minimum capacity of 255 covers the longest
  /// possible header string. The reader is left positioned at the body.
  pub fn deserialize<R: Read + ?Sized>(r: &mut R, scratch: &mut Buffer) -> Result<Meta> {
    let mut header = [0u8; HEADER_LEN];
    read_header(r, &mut header)?;

    if header[0..2] != MAGIC {
      return Err(Error::InvalidType);
    }
    if header[2..4] != VERSION {
      return Err(Error::InvalidVersion);
    }
    let kind = ArtifactKind::from_byte(header[4]).ok_or(Error::InvalidType)?;

    let expires = u32::from_le_bytes(header[5..9].try_into().unwrap());
    let status = u16::from_le_bytes(header[9..11].try_into().unwrap());
    let ct_len = header[11] as usize;
    let cc_len = header[12] as usize;
    let body_length = u32::from_le_bytes(header[13..17].try_into().unwrap());

    let scrap = scratch.take_bytes(255);
    r.read_exact(&mut scrap[..ct_len])
      .map_err(|e| Error::io("artifact content-type read", e))?;
    let content_type = String::from_utf8_lossy(&scrap[..ct_len]).into_owned();
    r.read_exact(&mut scrap[..cc_len])
      .map_err(|e| Error::io("artifact cache-control read", e))?;
    let cache_control = String::from_utf8_lossy(&scrap[..cc_len]).into_owned();

    Ok(Meta {
      kind,
      status,
      expires,
      content_type,
      cache_control,
      body_length,
    })
  }
}

fn read_header<R: Read + ?Sized>(r: &mut R, header: &mut [u8; HEADER_LEN]) -> Result<()> {
  let mut filled = 0;
  while filled < HEADER_LEN {
    match r.read(&mut header[filled..]) {
      Ok(0) => return Err(Error::InvalidHeaderLength),
      Ok(n) => filled += n,
      Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
      Err(e) => return Err(Error::io("artifact header read", e)),
    }
  }
  Ok(())
}

fn cap_header_value(value: &str) -> String {
  if value.len() <= 255 {
    return value.to_string();
  }
  let mut end = 255;
  while !value.is_char_boundary(end) {
    end -= 1;
  }
  value[..end].to_string()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::pool::{Pool, PoolConfig};

  fn scratch() -> Buffer {
    Pool::new(&PoolConfig {
      count: 1,
      min: 255,
      max: 4096,
    })
    .checkout()
  }

  #[test]
  fn serialize_then_deserialize_round_trips() {
    let original = Meta {
      kind: ArtifactKind::Image,
      status: 999,
      expires: 12,
      content_type: "a/type".to_string(),
      cache_control: "forever".to_string(),
      body_length: 345,
    };

    let mut encoded = Vec::new();
    original.serialize(&mut encoded).unwrap();
    assert_eq!(
      encoded.len(),
      HEADER_LEN + original.content_type.len() + original.cache_control.len()
    );

    let decoded = Meta::deserialize(&mut encoded.as_slice(), &mut scratch()).unwrap();
    assert_eq!(decoded, original);
  }

  #[test]
  fn round_trips_empty_header_strings() {
    let original = Meta {
      kind: ArtifactKind::Generic,
      status: 404,
      expires: 0,
      content_type: String::new(),
      cache_control: String::new(),
      body_length: 0,
    };
    let mut encoded = Vec::new();
    original.serialize(&mut encoded).unwrap();
    let decoded = Meta::deserialize(&mut encoded.as_slice(), &mut scratch()).unwrap();
    assert_eq!(decoded, original);
  }

  #[test]
  fn from_response_stamps_absolute_expiry() {
    let meta = Meta::from_response(
      ArtifactKind::Generic,
      200,
      300,
      "over/9000",
      "public,max-age=9001",
      999,
    );
    assert_eq!(meta.status, 200);
    assert_eq!(meta.body_length, 999);
    assert_eq!(meta.content_type, "over/9000");
    assert_eq!(meta.cache_control, "public,max-age=9001");
    let expected = unix_now() + 300;
    assert!(meta.expires.abs_diff(expected) <= 1);
  }

  #[test]
  fn from_response_caps_long_header_values() {
    let long = "x".repeat(300);
    let meta = Meta::from_response(ArtifactKind::Generic, 200, 1, &long, &long, 0);
    assert_eq!(meta.content_type.len(), 255);
    assert_eq!(meta.cache_control.len(), 255);
  }

  #[test]
  fn short_header_is_rejected() {
    let bytes = [1u8, 1, 0, 1, 0, 0];
    let err = Meta::deserialize(&mut &bytes[..], &mut scratch()).unwrap_err();
    assert!(matches!(err, Error::InvalidHeaderLength));
  }

  #[test]
  fn wrong_magic_is_rejected() {
    let mut encoded = Vec::new();
    Meta::from_response(ArtifactKind::Generic, 200, 1, "", "", 0)
      .serialize(&mut encoded)
      .unwrap();
    encoded[0] = 9;
    let err = Meta::deserialize(&mut encoded.as_slice(), &mut scratch()).unwrap_err();
    assert!(matches!(err, Error::InvalidType));
  }

  #[test]
  fn wrong_version_is_rejected() {
    let mut encoded = Vec::new();
    Meta::from_response(ArtifactKind::Generic, 200, 1, "", "", 0)
      .serialize(&mut encoded)
      .unwrap();
    encoded[3] = 2;
    let err = Meta::deserialize(&mut encoded.as_slice(), &mut scratch()).unwrap_err();
    assert!(matches!(err, Error::InvalidVersion));
  }

  #[test]
  fn unknown_kind_is_rejected() {
    let mut encoded = Vec::new();
    Meta::from_response(ArtifactKind::Generic, 200, 1, "", "", 0)
      .serialize(&mut encoded)
      .unwrap();
    encoded[4] = 7;
    let err = Meta::deserialize(&mut encoded.as_slice(), &mut scratch()).unwrap_err();
    assert!(matches!(err, Error::InvalidType));
  }

  #[test]
  fn expiry_comparison_is_strict() {
    let meta = Meta::from_response(ArtifactKind::Generic, 200, 0, "", "", 0);
    assert!(!meta.is_expired(meta.expires));
    assert!(meta.is_expired(meta.expires + 1));
  }
}
