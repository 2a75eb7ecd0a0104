//! Configuration loading and validation.
//!
//! The config file is JSON. Everything except the upstream map and each
//! upstream's `base_url` has a default, so a minimal file looks like:
//!
//! ```json
//! {
//!   "upstreams": {
//!     "u1": { "base_url": "http://origin.example/assets/" }
//!   }
//! }
//! ```

use crate::error::{Error, Result};
use crate::pool::PoolConfig;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;

use serde::Deserialize;
use url::Url;

/// One status→TTL caching rule. Status 0 sets the upstream's default TTL;
/// a negative TTL forces that many seconds regardless of response headers.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CacheRule {
  pub status: u16,
  pub ttl: i32,
}

/// Caching rules applied when an upstream declares none.
pub const DEFAULT_CACHING: [CacheRule; 2] = [
  CacheRule { status: 0, ttl: 300 },
  CacheRule {
    status: 200,
    ttl: 3600,
  },
];

fn default_cache_root() -> String {
  "cache".to_string()
}

fn default_listen() -> String {
  "127.0.0.1:5300".to_string()
}

fn default_log_level() -> String {
  "info".to_string()
}

fn default_timeout() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
  #[serde(default = "default_listen")]
  pub listen: String,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self {
      listen: default_listen(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Default `EnvFilter` directive; `RUST_LOG` overrides it.
  #[serde(default = "default_log_level")]
  pub level: String,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
  #[serde(default)]
  pub base_url: String,
  /// HTTP timeout for origin requests, in seconds.
  #[serde(default = "default_timeout")]
  pub timeout: u64,
  #[serde(default)]
  pub buffers: PoolConfig,
  #[serde(default)]
  pub caching: Vec<CacheRule>,
  /// Transform name → extra thumbnailer arguments.
  #[serde(default)]
  pub transforms: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub instance_id: u8,
  /// Absolute path of the thumbnail binary; resolved from PATH when unset.
  #[serde(default)]
  pub thumbnail_binary_path: Option<String>,
  #[serde(default = "default_cache_root")]
  pub cache_root: String,
  #[serde(default)]
  pub http: HttpConfig,
  #[serde(default)]
  pub log: LogConfig,
  #[serde(default)]
  pub upstreams: HashMap<String, UpstreamConfig>,
}

impl Config {
  /// Reads and validates a config file.
  pub fn from_file(path: &str) -> Result<Config> {
    let data = std::fs::read(path).map_err(|err| Error::ConfigRead {
      path: path.to_string(),
      detail: err.to_string(),
    })?;
    let config: Config = serde_json::from_slice(&data).map_err(|err| Error::ConfigParse {
      detail: err.to_string(),
    })?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.upstreams.is_empty() {
      return Err(Error::NoUpstreams);
    }
    for (name, upstream) in &self.upstreams {
      if upstream.base_url.is_empty() || Url::parse(&upstream.base_url).is_err() {
        return Err(Error::UpstreamMissingBaseUrl { name: name.clone() });
      }
    }
    Ok(())
  }
}

/// Returns the configured thumbnail binary, or searches PATH for
/// `vipsthumbnail`.
pub fn resolve_thumbnailer(configured: Option<&str>) -> Result<String> {
  if let Some(path) = configured {
    if !path.is_empty() {
      return Ok(path.to_string());
    }
  }

  let path_var = std::env::var_os("PATH").ok_or(Error::ThumbnailerNotFound)?;
  for dir in std::env::split_paths(&path_var) {
    let candidate: PathBuf = dir.join("vipsthumbnail");
    if candidate.is_file() {
      return Ok(candidate.to_string_lossy().into_owned());
    }
  }
  Err(Error::ThumbnailerNotFound)
}

/// Runs `<binary> --vips-version` and returns its output, proving at
/// startup that the transform tool is runnable. The output is exposed via
/// `/info` so operators can tell which libvips produced the cached
/// variants.
pub fn probe_thumbnailer(binary: &str) -> Result<String> {
  let output = Command::new(binary)
    .arg("--vips-version")
    .output()
    .map_err(|err| Error::ThumbnailerVersionProbe {
      output: err.to_string(),
    })?;

  if !output.status.success() {
    return Err(Error::ThumbnailerVersionProbe {
      output: combined_output(&output.stdout, &output.stderr),
    });
  }

  Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub(crate) fn combined_output(stdout: &[u8], stderr: &[u8]) -> String {
  let mut combined = String::from_utf8_lossy(stdout).into_owned();
  let err = String::from_utf8_lossy(stderr);
  if !err.is_empty() {
    if !combined.is_empty() {
      combined.push('\n');
    }
    combined.push_str(&err);
  }
  combined
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  fn write_config(json: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
  }

  #[test]
  fn missing_file_is_a_read_error() {
    let err = Config::from_file("invalid.json").unwrap_err();
    assert!(matches!(err, Error::ConfigRead { .. }));
  }

  #[test]
  fn invalid_json_is_a_parse_error() {
    let file = write_config("{not json");
    let err = Config::from_file(file.path().to_str().unwrap()).unwrap_err();
    assert!(matches!(err, Error::ConfigParse { .. }));
  }

  #[test]
  fn upstreams_are_required() {
    let file = write_config("{}");
    let err = Config::from_file(file.path().to_str().unwrap()).unwrap_err();
    assert!(matches!(err, Error::NoUpstreams));
  }

  #[test]
  fn base_url_is_required() {
    let file = write_config(r#"{"upstreams": {"test": {}}}"#);
    let err = Config::from_file(file.path().to_str().unwrap()).unwrap_err();
    match err {
      Error::UpstreamMissingBaseUrl { name } => assert_eq!(name, "test"),
      other => panic!("unexpected error: {}", other),
    }
  }

  #[test]
  fn base_url_must_parse() {
    let file = write_config(r#"{"upstreams": {"test": {"base_url": "not a url"}}}"#);
    let err = Config::from_file(file.path().to_str().unwrap()).unwrap_err();
    assert!(matches!(err, Error::UpstreamMissingBaseUrl { .. }));
  }

  #[test]
  fn minimal_config_fills_defaults() {
    let file = write_config(
      r#"{"upstreams": {"test": {"base_url": "http://localhost:5400/x1"}}}"#,
    );
    let config = Config::from_file(file.path().to_str().unwrap()).unwrap();

    assert_eq!(config.cache_root, "cache");
    assert_eq!(config.http.listen, "127.0.0.1:5300");
    assert_eq!(config.log.level, "info");
    assert_eq!(config.instance_id, 0);

    let up = &config.upstreams["test"];
    assert_eq!(up.base_url, "http://localhost:5400/x1");
    assert_eq!(up.timeout, 30);
    assert_eq!(up.buffers.count, 100);
    assert_eq!(up.buffers.min, 131_072);
    assert_eq!(up.buffers.max, 1_048_576);
    assert!(up.caching.is_empty());
    assert!(up.transforms.is_empty());
  }

  #[test]
  fn full_upstream_config_parses() {
    let file = write_config(
      r#"{
        "cache_root": "/tmp/proxy-cache",
        "http": {"listen": "0.0.0.0:8080"},
        "upstreams": {
          "u1": {
            "base_url": "http://origin/assets/",
            "buffers": {"count": 2, "min": 4096, "max": 4096},
            "caching": [{"status": 200, "ttl": 60}, {"status": 404, "ttl": -30}],
            "transforms": {"thumb_100": ["--size", "100x"]}
          }
        }
      }"#,
    );
    let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
    let up = &config.upstreams["u1"];
    assert_eq!(up.caching.len(), 2);
    assert_eq!(up.caching[1].ttl, -30);
    assert_eq!(up.transforms["thumb_100"], vec!["--size", "100x"]);
  }

  #[test]
  fn configured_thumbnailer_wins_over_path_search() {
    let resolved = resolve_thumbnailer(Some("/opt/bin/vipsthumbnail")).unwrap();
    assert_eq!(resolved, "/opt/bin/vipsthumbnail");
  }
}
