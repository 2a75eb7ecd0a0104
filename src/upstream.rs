//! A configured origin: HTTP fetching, TTL policy, image transforms, and
//! per-request identity.
//!
//! All upstream fetches run under the per-upstream single-flight table so a
//! thundering herd on one path costs the origin a single GET. The owner of
//! a flight returns its live [`RemoteArtifact`]; followers re-open the copy
//! the owner just persisted.

use crate::artifact::{Artifact, RemoteArtifact};
use crate::config::{combined_output, CacheRule, UpstreamConfig, DEFAULT_CACHING};
use crate::error::{Error, Result};
use crate::meta::{unix_now, ArtifactKind, Meta};
use crate::pool::Pool;
use crate::singleflight::{Outcome, SingleFlight};
use crate::store::{create_file, path_basename, path_extension, Store};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::collections::HashMap;
use std::io;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::error;

/// Flight summary shared with single-flight followers. Owners keep their
/// artifact; followers only learn what landed on disk.
#[derive(Debug, Clone, Copy)]
enum FlightShared {
  /// A generic artifact was written to the flight's meta path.
  Persisted,
  /// An origin image was written; valid until `expires`.
  OriginImage { expires: u32 },
}

/// The owner's private result of a `save_origin_image` flight.
enum SavedOrigin {
  Image { expires: u32 },
  NonImage(RemoteArtifact),
}

pub struct Upstream {
  name: String,
  base_url: String,
  agent: ureq::Agent,
  store: Store,
  buffers: Pool,
  flights: SingleFlight<FlightShared>,
  /// status → configured TTL; negative means forced.
  ttls: HashMap<u16, i32>,
  default_ttl: u32,
  transforms: HashMap<String, Vec<String>>,
  thumbnailer: String,
  instance_id: u8,
  request_id: AtomicU32,
}

impl Upstream {
  pub fn new(
    name: &str,
    config: &UpstreamConfig,
    cache_root: &str,
    thumbnailer: &str,
    instance_id: u8,
  ) -> Result<Upstream> {
    let store = Store::new(format!("{}/{}", cache_root.trim_end_matches('/'), name));
    store.ensure_root().map_err(|e| Error::io("cache root create", e))?;

    let rules: &[CacheRule] = if config.caching.is_empty() {
      &DEFAULT_CACHING
    } else {
      &config.caching
    };
    let mut default_ttl: i32 = 300;
    let mut ttls = HashMap::new();
    for rule in rules {
      if rule.status == 0 {
        default_ttl = rule.ttl;
      } else {
        ttls.insert(rule.status, rule.ttl);
      }
    }
    // A negative default is not meaningful as "forced" (the default only
    // applies when no status rule matched), so flip it; zero gets a floor.
    if default_ttl < 0 {
      default_ttl = -default_ttl;
    } else if default_ttl == 0 {
      default_ttl = 60;
    }

    let agent: ureq::Agent = ureq::Agent::config_builder()
      .http_status_as_error(false)
      .timeout_global(Some(Duration::from_secs(config.timeout)))
      .build()
      .into();

    Ok(Upstream {
      name: name.to_string(),
      base_url: config.base_url.clone(),
      agent,
      store,
      buffers: Pool::new(&config.buffers),
      flights: SingleFlight::new(),
      ttls,
      default_ttl: default_ttl as u32,
      transforms: config.transforms.clone(),
      thumbnailer: thumbnailer.to_string(),
      instance_id,
      // Seeding from the wall clock keeps restarts from re-issuing recent
      // ids. Uniqueness stays best-effort.
      request_id: AtomicU32::new(unix_now()),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  pub fn buffers(&self) -> &Pool {
    &self.buffers
  }

  /// Extra thumbnailer arguments for a named transform.
  pub fn transform_args(&self, xform: &str) -> Option<&[String]> {
    self.transforms.get(xform).map(|args| args.as_slice())
  }

  /// A short opaque request token: base64url(counter ‖ instance id).
  pub fn next_request_id(&self) -> String {
    let next = self.request_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    let mut raw = [0u8; 5];
    raw[..4].copy_from_slice(&next.to_le_bytes());
    raw[4] = self.instance_id;
    URL_SAFE_NO_PAD.encode(raw)
  }

  /// Fetches `remote_path` from the origin and persists it as a generic
  /// artifact at `local_path`, deduplicated per path. The single-flight
  /// owner gets the in-memory artifact; followers load the persisted copy.
  pub fn get_response_and_save(&self, remote_path: &str, local_path: &str) -> Result<Artifact> {
    let outcome = self.flights.run(remote_path, || {
      let response = self.fetch(remote_path)?;
      let artifact = self.create_and_save_remote(response, local_path, ArtifactKind::Generic)?;
      Ok((FlightShared::Persisted, artifact))
    });

    match outcome {
      Outcome::Owner(Ok(artifact)) => Ok(Artifact::Remote(artifact)),
      Outcome::Owner(Err(err)) => Err(err),
      Outcome::Follower(Ok(_)) => self.load_persisted(remote_path, local_path),
      Outcome::Follower(Err(err)) => Err(err),
    }
  }

  /// Fetches an origin image, streaming the body straight into
  /// `image_path` and the header into the `meta_path` sidecar. When the
  /// origin answers with anything that is not a 200 image, the response is
  /// persisted as a generic artifact at `meta_path` instead and returned
  /// for serving as-is.
  ///
  /// Returns `(artifact, expires)`: exactly one of the two is meaningful.
  pub fn save_origin_image(
    &self,
    remote_path: &str,
    meta_path: &str,
    image_path: &str,
  ) -> Result<(Option<Artifact>, u32)> {
    let outcome = self.flights.run(remote_path, || {
      let mut response = self.fetch(remote_path)?;
      let status = response.status().as_u16();
      if status != 200 || !is_image_response(&response) {
        let artifact = self.create_and_save_remote(response, meta_path, ArtifactKind::Generic)?;
        return Ok((FlightShared::Persisted, SavedOrigin::NonImage(artifact)));
      }

      let content_type = header_value(&response, "content-type");
      let cache_control = header_value(&response, "cache-control");

      let mut file = create_file(image_path).map_err(|err| {
        error!(path = %image_path, error = %err, "origin image create failed");
        Error::io("origin image create", err)
      })?;
      let copied = io::copy(&mut response.body_mut().as_reader(), &mut file)
        .map_err(|err| {
          let _ = std::fs::remove_file(image_path);
          Error::io("origin image copy", err)
        })?;

      let ttl = self.calculate_ttl(status, &cache_control);
      let meta = Meta::from_response(
        ArtifactKind::Image,
        200,
        ttl,
        &content_type,
        &cache_control,
        copied as u32,
      );
      let expires = meta.expires;
      if let Err(err) = self.store.save(&meta, meta_path) {
        // An image file without its sidecar would read as origin-missing
        // forever; don't leave it behind.
        let _ = std::fs::remove_file(image_path);
        return Err(err);
      }

      Ok((FlightShared::OriginImage { expires }, SavedOrigin::Image { expires }))
    });

    match outcome {
      Outcome::Owner(Ok(SavedOrigin::Image { expires })) => Ok((None, expires)),
      Outcome::Owner(Ok(SavedOrigin::NonImage(artifact))) => {
        Ok((Some(Artifact::Remote(artifact)), 0))
      }
      Outcome::Owner(Err(err)) => Err(err),
      Outcome::Follower(Ok(FlightShared::OriginImage { expires })) => Ok((None, expires)),
      Outcome::Follower(Ok(FlightShared::Persisted)) => {
        self.load_persisted(remote_path, meta_path).map(|a| (Some(a), 0))
      }
      Outcome::Follower(Err(err)) => Err(err),
    }
  }

  /// Runs the external thumbnailer over a cached origin image and persists
  /// the variant's sidecar. `expires` anchors the variant's lifetime to the
  /// origin's.
  pub fn transform_image(
    &self,
    origin_image_path: &str,
    meta_path: &str,
    image_path: &str,
    xform_args: &[String],
    expires: u32,
  ) -> Result<()> {
    // The tool resolves a relative -o against the input's directory, and
    // origin and variant always share a subdirectory, so the basename is
    // enough (and absolute -o paths are treated differently by the tool).
    let output = Command::new(&self.thumbnailer)
      .arg(origin_image_path)
      .arg("-o")
      .arg(path_basename(image_path))
      .args(xform_args)
      .output()
      .map_err(|err| Error::Transform {
        output: err.to_string(),
      })?;

    if !output.status.success() {
      return Err(Error::Transform {
        output: combined_output(&output.stdout, &output.stderr),
      });
    }

    let content_type = match path_extension(image_path).as_str() {
      ".png" => "image/png",
      ".webp" => "image/webp",
      ".jpg" | ".jpeg" => "image/jpeg",
      ".gif" => "image/gif",
      other => {
        error!(up = %self.name, ext = %other, "unmapped transform extension");
        ""
      }
    };

    let size = match std::fs::metadata(image_path) {
      Ok(stat) => stat.len(),
      Err(err) => {
        // Without a size there is no valid header to write.
        let _ = std::fs::remove_file(image_path);
        return Err(Error::FsStat {
          path: image_path.to_string(),
          detail: err.to_string(),
        });
      }
    };

    let max_age = expires as i64 - unix_now() as i64;
    let meta = Meta {
      kind: ArtifactKind::Image,
      status: 200,
      expires,
      content_type: content_type.to_string(),
      cache_control: format!("public,max-age={}", max_age),
      body_length: size as u32,
    };

    if let Err(err) = self.store.save(&meta, meta_path) {
      let _ = std::fs::remove_file(image_path);
      return Err(err);
    }
    Ok(())
  }

  /// Resolves the TTL for a response:
  ///
  /// - a negative configured TTL for the status is forced (header ignored)
  /// - otherwise a positive `max-age` in the header wins
  /// - otherwise the configured TTL for the status, or the default.
  fn calculate_ttl(&self, status: u16, cache_control: &str) -> u32 {
    let configured = self.ttls.get(&status).copied();
    if let Some(ttl) = configured {
      if ttl < 0 {
        return (-ttl) as u32;
      }
    }

    let max_age = parse_max_age(cache_control);
    if max_age > 0 {
      return max_age;
    }

    match configured {
      Some(ttl) => ttl as u32,
      None => self.default_ttl,
    }
  }

  fn fetch(&self, remote_path: &str) -> Result<ureq::http::Response<ureq::Body>> {
    let url = format!("{}{}", self.base_url, remote_path);
    self.agent.get(url.as_str()).call().map_err(|err| Error::Proxy {
      url,
      detail: err.to_string(),
    })
  }

  /// Drains the response body into a pooled buffer, computes the TTL, and
  /// persists header+body as one file. A request only succeeds once a
  /// complete artifact is on disk; single-flight followers depend on that.
  fn create_and_save_remote(
    &self,
    mut response: ureq::http::Response<ureq::Body>,
    local_path: &str,
    kind: ArtifactKind,
  ) -> Result<RemoteArtifact> {
    let status = response.status().as_u16();
    let content_type = header_value(&response, "content-type");
    let cache_control = header_value(&response, "cache-control");

    let mut buffer = self.buffers.checkout();
    io::copy(&mut response.body_mut().as_reader(), &mut buffer).map_err(|err| {
      error!(up = %self.name, error = %err, "upstream body copy failed");
      Error::io("upstream body copy", err)
    })?;
    if buffer.error().is_some() {
      return Err(Error::io(
        "upstream body copy",
        io::Error::new(io::ErrorKind::WriteZero, "buffer capacity exceeded"),
      ));
    }

    let ttl = self.calculate_ttl(status, &cache_control);
    let meta = Meta::from_response(
      kind,
      status,
      ttl,
      &content_type,
      &cache_control,
      buffer.len() as u32,
    );
    let expires = meta.expires;

    let artifact = RemoteArtifact::new(meta, buffer);
    self
      .store
      .save(&artifact, local_path)
      .map_err(|err| Error::PersistFailed {
        path: local_path.to_string(),
        status,
        expires,
        detail: err.to_string(),
      })?;
    Ok(artifact)
  }

  /// Follower path: the owner persisted an artifact moments ago, load it
  /// regardless of its TTL.
  fn load_persisted(&self, remote_path: &str, local_path: &str) -> Result<Artifact> {
    match self.store.load_local_response(local_path, true, &self.buffers) {
      Some(artifact) => Ok(Artifact::Local(artifact)),
      None => {
        error!(up = %self.name, remote = %remote_path, "singleflight follower found no artifact");
        Err(Error::SingleflightLocalLoad {
          path: remote_path.to_string(),
        })
      }
    }
  }
}

fn header_value(response: &ureq::http::Response<ureq::Body>, name: &str) -> String {
  response
    .headers()
    .get(name)
    .and_then(|value| value.to_str().ok())
    .unwrap_or("")
    .to_string()
}

fn is_image_response(response: &ureq::http::Response<ureq::Body>) -> bool {
  let content_type = response
    .headers()
    .get("content-type")
    .and_then(|value| value.to_str().ok())
    .unwrap_or("")
    .to_ascii_lowercase();
  matches!(
    content_type.as_str(),
    "image/png" | "image/webp" | "image/jpeg" | "image/gif"
  )
}

/// Reads the decimal digits following `max-age=`, stopping at the first
/// non-digit. Overflow silently wraps; absent or empty values read as 0.
fn parse_max_age(cache_control: &str) -> u32 {
  let Some(idx) = cache_control.find("max-age=") else {
    return 0;
  };
  let mut value: u32 = 0;
  for b in cache_control[idx + 8..].bytes() {
    let digit = b.wrapping_sub(b'0');
    if digit > 9 {
      break;
    }
    value = value.wrapping_mul(10).wrapping_add(digit as u32);
  }
  value
}
