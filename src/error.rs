//! Error types for the proxy core.
//!
//! Errors are structured: each variant carries the context a log line needs
//! (the attempted URL, the local path, the subprocess output). Operational
//! variants map to a numeric code via [`Error::code`]; client-facing
//! response codes live in [`codes`] and are rendered by the server layer.
//!
//! The whole enum is `Clone` because the single-flight coordinator hands an
//! owner's failure to every follower blocked on the same key, so underlying
//! I/O errors are captured as strings rather than held as `std::io::Error`.

use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric codes attached to responses and log lines.
///
/// `202xxx` codes are client-facing and appear in JSON error bodies;
/// `203xxx` codes are internal and only ever logged.
pub mod codes {
  pub const RES_UNKNOWN_ROUTE: u32 = 202_001;
  pub const RES_MISSING_UP_PARAM: u32 = 202_002;
  pub const RES_UNKNOWN_UP_PARAM: u32 = 202_003;
  pub const RES_INVALID_XFORM_PARAM: u32 = 202_004;
  pub const RES_NOT_FOUND_CACHE: u32 = 202_005;

  pub const ERR_CONFIG_READ: u32 = 203_001;
  pub const ERR_CONFIG_PARSE: u32 = 203_002;
  pub const ERR_CONFIG_ZERO_UPSTREAMS: u32 = 203_003;
  pub const ERR_CONFIG_UPSTREAM_BASE: u32 = 203_004;
  pub const ERR_CONFIG_THUMBNAILER_PATH: u32 = 203_005;
  pub const ERR_CONFIG_THUMBNAILER_VERSION: u32 = 203_006;
  pub const ERR_PROXY: u32 = 203_007;
  pub const ERR_TRANSFORM: u32 = 203_008;
  pub const ERR_LOCAL_IMAGE_MISSING: u32 = 203_009;
  pub const ERR_FS_STAT: u32 = 203_010;
  pub const ERR_UNCAUGHT_HTTP: u32 = 203_011;
}

/// Top-level error type for the proxy core.
#[derive(Error, Debug, Clone)]
pub enum Error {
  /// The configuration file could not be read.
  #[error("failed to read config {path}: {detail}")]
  ConfigRead { path: String, detail: String },

  /// The configuration file could not be parsed.
  #[error("failed to parse config: {detail}")]
  ConfigParse { detail: String },

  /// The configuration declares no upstreams.
  #[error("at least one upstream must be configured")]
  NoUpstreams,

  /// An upstream is missing its base URL.
  #[error("upstream {name} must have a base_url")]
  UpstreamMissingBaseUrl { name: String },

  /// The thumbnail binary was neither configured nor found on PATH.
  #[error("thumbnail binary not configured and not found on PATH")]
  ThumbnailerNotFound,

  /// The thumbnail binary did not answer the startup version probe.
  #[error("thumbnail version probe failed: {output}")]
  ThumbnailerVersionProbe { output: String },

  /// The upstream GET failed at the transport level.
  #[error("upstream request to {url} failed: {detail}")]
  Proxy { url: String, detail: String },

  /// The external transform subprocess failed; `output` is its combined
  /// stdout and stderr.
  #[error("transform failed: {output}")]
  Transform { output: String },

  /// A just-saved or just-transformed image could not be loaded back.
  #[error("local image missing after save: {path}")]
  LocalImageMissing { path: String },

  /// A produced file could not be stat'ed.
  #[error("failed to stat {path}: {detail}")]
  FsStat { path: String, detail: String },

  /// The request named a transform the upstream does not define.
  #[error("unknown transform: {name}")]
  InvalidTransform { name: String },

  /// A persisted artifact header was shorter than the fixed header size.
  #[error("artifact header is truncated")]
  InvalidHeaderLength,

  /// A persisted artifact did not start with the expected magic bytes.
  #[error("artifact has an unknown type")]
  InvalidType,

  /// A persisted artifact carries an unsupported format version.
  #[error("artifact has an unsupported version")]
  InvalidVersion,

  /// A fetched response could not be written to the cache. Carries the
  /// response's status and computed expiry so the dispatch layer can
  /// remember unpersistable negative responses in memory.
  #[error("failed to persist artifact at {path}: {detail}")]
  PersistFailed {
    path: String,
    status: u16,
    expires: u32,
    detail: String,
  },

  /// A single-flight follower found nothing on disk after the owner
  /// completed: the owner persisted nothing.
  #[error("no artifact was persisted for {path}")]
  SingleflightLocalLoad { path: String },

  /// Any other I/O failure, with a short context tag.
  #[error("{context}: {detail}")]
  Io { context: &'static str, detail: String },
}

impl Error {
  /// Wraps an `std::io::Error` with a context tag.
  pub fn io(context: &'static str, err: std::io::Error) -> Error {
    Error::Io {
      context,
      detail: err.to_string(),
    }
  }

  /// The numeric code this error logs or responds with, if it has one.
  pub fn code(&self) -> Option<u32> {
    match self {
      Error::ConfigRead { .. } => Some(codes::ERR_CONFIG_READ),
      Error::ConfigParse { .. } => Some(codes::ERR_CONFIG_PARSE),
      Error::NoUpstreams => Some(codes::ERR_CONFIG_ZERO_UPSTREAMS),
      Error::UpstreamMissingBaseUrl { .. } => Some(codes::ERR_CONFIG_UPSTREAM_BASE),
      Error::ThumbnailerNotFound => Some(codes::ERR_CONFIG_THUMBNAILER_PATH),
      Error::ThumbnailerVersionProbe { .. } => Some(codes::ERR_CONFIG_THUMBNAILER_VERSION),
      Error::Proxy { .. } => Some(codes::ERR_PROXY),
      Error::Transform { .. } => Some(codes::ERR_TRANSFORM),
      Error::LocalImageMissing { .. } => Some(codes::ERR_LOCAL_IMAGE_MISSING),
      Error::FsStat { .. } => Some(codes::ERR_FS_STAT),
      Error::InvalidTransform { .. } => Some(codes::RES_INVALID_XFORM_PARAM),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn proxy_error_displays_url() {
    let err = Error::Proxy {
      url: "http://origin/x.css".to_string(),
      detail: "connection refused".to_string(),
    };
    let display = format!("{}", err);
    assert!(display.contains("http://origin/x.css"));
    assert!(display.contains("connection refused"));
    assert_eq!(err.code(), Some(codes::ERR_PROXY));
  }

  #[test]
  fn transform_error_carries_output() {
    let err = Error::Transform {
      output: "bad argument --size".to_string(),
    };
    assert!(format!("{}", err).contains("bad argument"));
    assert_eq!(err.code(), Some(codes::ERR_TRANSFORM));
  }

  #[test]
  fn decode_errors_have_no_code() {
    assert_eq!(Error::InvalidHeaderLength.code(), None);
    assert_eq!(Error::InvalidType.code(), None);
    assert_eq!(Error::InvalidVersion.code(), None);
  }

  #[test]
  fn errors_are_cloneable() {
    let err = Error::io(
      "body copy",
      std::io::Error::new(std::io::ErrorKind::Other, "boom"),
    );
    let cloned = err.clone();
    assert_eq!(format!("{}", err), format!("{}", cloned));
  }
}
