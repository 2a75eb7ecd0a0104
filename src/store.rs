//! Filesystem layout and artifact persistence for one upstream.
//!
//! Cache keys are the upstream-relative request path, base64url-encoded
//! without padding. The first two encoded characters become a subdirectory
//! so no single directory collects more than roughly 64² entries:
//!
//! ```text
//! <cache_root>/<upstream>/aG/aGVsbG9fd29ybGQy_thumb100.jpg.res   header sidecar
//! <cache_root>/<upstream>/aG/aGVsbG9fd29ybGQy_thumb100.jpg      raw image body
//! ```
//!
//! Generic artifacts keep header and body in the single `.res` file.
//! Path derivation is pure string work and byte-identical across processes
//! for the same inputs; tests pin the exact strings.

use crate::artifact::{LocalArtifact, Persist};
use crate::error::{Error, Result};
use crate::meta::{unix_now, ArtifactKind, Meta};
use crate::pool::Pool;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::Path;
use tracing::error;

/// What [`Store::origin_image_check`] found on disk.
pub enum OriginStatus {
  /// Nothing cached (or the cached origin expired); the caller fetches.
  Absent,
  /// The origin previously answered with a non-image (e.g. a 404) which
  /// was negative-cached; serve it as-is.
  NonImage(LocalArtifact),
  /// A valid origin image is on disk and usable until `expires`.
  Image { expires: u32 },
}

/// Artifact store rooted at `<cache_root>/<upstream_name>`.
pub struct Store {
  /// Root with a trailing slash, kept as a string so derived paths are
  /// deterministic byte-for-byte.
  root: String,
}

impl Store {
  pub fn new(root: impl Into<String>) -> Store {
    let mut root = root.into();
    if !root.ends_with('/') {
      root.push('/');
    }
    Store { root }
  }

  /// Creates the store root with mode 0700. Called once at upstream
  /// construction; failure there is fatal.
  pub fn ensure_root(&self) -> io::Result<()> {
    make_dirs(Path::new(&self.root))
  }

  /// Path of a single-file (generic) artifact for `remote_path`.
  pub fn local_res_path(&self, remote_path: &str, extension: &str) -> String {
    let encoded = URL_SAFE_NO_PAD.encode(remote_path);
    format!("{}{}/{}{}.res", self.root, &encoded[..2], encoded, extension)
  }

  /// Sidecar and body paths of an image artifact, with an optional
  /// transform infix. The image path is always the meta path minus the
  /// trailing `.res`.
  pub fn local_image_path(
    &self,
    remote_path: &str,
    extension: &str,
    xform: Option<&str>,
  ) -> (String, String) {
    let encoded = URL_SAFE_NO_PAD.encode(remote_path);
    let image_path = match xform {
      Some(xform) => format!(
        "{}{}/{}_{}{}",
        self.root,
        &encoded[..2],
        encoded,
        xform,
        extension
      ),
      None => format!("{}{}/{}{}", self.root, &encoded[..2], encoded, extension),
    };
    (format!("{}.res", image_path), image_path)
  }

  /// Opens and decodes a generic artifact. Returns `None` on a miss: the
  /// file is absent, fails to decode, or has expired (unless `force`).
  /// Single-flight followers pass `force = true` because the owner
  /// persisted moments ago and the artifact must be served regardless of
  /// how short its TTL was.
  pub fn load_local_response(
    &self,
    local_path: &str,
    force: bool,
    pool: &Pool,
  ) -> Option<LocalArtifact> {
    let mut file = match File::open(local_path) {
      Ok(file) => file,
      Err(err) => {
        if err.kind() != ErrorKind::NotFound {
          error!(path = %local_path, error = %err, "local artifact open failed");
        }
        return None;
      }
    };

    let meta = match Meta::deserialize(&mut file, &mut pool.checkout()) {
      Ok(meta) => meta,
      Err(err) => {
        error!(path = %local_path, error = %err, "local artifact decode failed");
        return None;
      }
    };

    if !force && meta.is_expired(unix_now()) {
      // Leave the stale file in place; the caller is about to refetch and
      // overwrite it.
      return None;
    }

    Some(LocalArtifact::new(meta, file))
  }

  /// Loads an image-cache entry. Image responses are split across two
  /// files, so after decoding the sidecar the body handle is rebound to
  /// the raw image file. A generic artifact at the meta path is a cached
  /// non-image response (say, an origin 404) and is returned whole.
  pub fn load_local_image(
    &self,
    meta_path: &str,
    image_path: &str,
    pool: &Pool,
  ) -> Option<LocalArtifact> {
    let mut file = match File::open(meta_path) {
      Ok(file) => file,
      Err(err) => {
        if err.kind() != ErrorKind::NotFound {
          error!(path = %meta_path, error = %err, "image meta open failed");
        }
        return None;
      }
    };

    let meta = match Meta::deserialize(&mut file, &mut pool.checkout()) {
      Ok(meta) => meta,
      Err(err) => {
        error!(path = %meta_path, error = %err, "image meta decode failed");
        return None;
      }
    };

    let mut artifact = LocalArtifact::new(meta, file);
    if artifact.meta().kind == ArtifactKind::Generic {
      return Some(artifact);
    }

    // The sidecar only held the header; the body is the raw image file.
    let image_file = match File::open(image_path) {
      Ok(file) => file,
      Err(err) => {
        error!(path = %image_path, error = %err, "image body open failed");
        return None;
      }
    };
    artifact.rebind(image_file);
    Some(artifact)
  }

  /// Peeks at whether an origin image is cached without opening its body.
  pub fn origin_image_check(&self, meta_path: &str, pool: &Pool) -> Result<OriginStatus> {
    let mut file = match File::open(meta_path) {
      Ok(file) => file,
      Err(err) if err.kind() == ErrorKind::NotFound => return Ok(OriginStatus::Absent),
      Err(err) => return Err(Error::io("origin meta open", err)),
    };

    let meta = match Meta::deserialize(&mut file, &mut pool.checkout()) {
      Ok(meta) => meta,
      Err(err) => {
        error!(path = %meta_path, error = %err, "origin meta decode failed");
        return Ok(OriginStatus::Absent);
      }
    };

    if meta.is_expired(unix_now()) {
      return Ok(OriginStatus::Absent);
    }

    if meta.kind == ArtifactKind::Generic {
      return Ok(OriginStatus::NonImage(LocalArtifact::new(meta, file)));
    }

    Ok(OriginStatus::Image {
      expires: meta.expires,
    })
  }

  /// Persists an artifact (or bare meta) at `local_path`, creating parent
  /// directories on demand. A failed write removes the partial file:
  /// readers must only ever observe complete artifacts (short of a
  /// process crash mid-write).
  pub fn save(&self, item: &dyn Persist, local_path: &str) -> Result<()> {
    let mut file = create_file(local_path).map_err(|err| {
      error!(path = %local_path, error = %err, "artifact create failed");
      Error::io("artifact create", err)
    })?;

    item.persist(&mut file).map_err(|err| {
      error!(path = %local_path, error = %err, "artifact write failed");
      let _ = std::fs::remove_file(local_path);
      Error::io("artifact write", err)
    })
  }
}

/// Opens `path` for writing with create+truncate and mode 0600. When the
/// parent directory is missing it is created (0700, recursively, tolerant
/// of concurrent creation) and the open retried once.
pub(crate) fn create_file(path: &str) -> io::Result<File> {
  let mut options = OpenOptions::new();
  options.write(true).create(true).truncate(true);
  #[cfg(unix)]
  {
    use std::os::unix::fs::OpenOptionsExt;
    options.mode(0o600);
  }

  match options.open(path) {
    Ok(file) => Ok(file),
    Err(_) => {
      if let Some(parent) = Path::new(path).parent() {
        make_dirs(parent)?;
      }
      options.open(path)
    }
  }
}

fn make_dirs(path: &Path) -> io::Result<()> {
  let mut builder = DirBuilder::new();
  builder.recursive(true);
  #[cfg(unix)]
  {
    use std::os::unix::fs::DirBuilderExt;
    builder.mode(0o700);
  }
  builder.create(path)
}

/// Extension of the final path segment, lowercased, dot included. Empty
/// when the segment has no extension.
pub(crate) fn path_extension(path: &str) -> String {
  let name = path.rsplit('/').next().unwrap_or(path);
  match name.rfind('.') {
    Some(idx) if idx > 0 => name[idx..].to_ascii_lowercase(),
    _ => String::new(),
  }
}

/// Final segment of a slash-separated path.
pub(crate) fn path_basename(path: &str) -> &str {
  Path::new(path)
    .file_name()
    .and_then(|n| n.to_str())
    .unwrap_or(path)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::artifact::RemoteArtifact;
  use crate::pool::PoolConfig;
  use std::io::Write;

  fn pool() -> Pool {
    Pool::new(&PoolConfig {
      count: 2,
      min: 4096,
      max: 4096,
    })
  }

  fn remote(
    kind: ArtifactKind,
    status: u16,
    ttl_secs: i64,
    content_type: &str,
    cache_control: &str,
    body: &[u8],
  ) -> RemoteArtifact {
    let mut buffer = pool().checkout();
    buffer.write_all(body).unwrap();
    let mut meta = Meta::from_response(
      kind,
      status,
      0,
      content_type,
      cache_control,
      body.len() as u32,
    );
    meta.expires = (unix_now() as i64 + ttl_secs) as u32;
    RemoteArtifact::new(meta, buffer)
  }

  #[test]
  fn res_paths_are_deterministic() {
    let store = Store::new("up1/cache");
    assert_eq!(
      store.local_res_path("hello_world", ".test"),
      "up1/cache/aG/aGVsbG9fd29ybGQ.test.res"
    );
    assert_eq!(
      store.local_res_path("hello_world", ""),
      "up1/cache/aG/aGVsbG9fd29ybGQ.res"
    );
  }

  #[test]
  fn image_paths_are_deterministic() {
    let store = Store::new("up1/cache/");
    let (meta_path, image_path) =
      store.local_image_path("hello_world2", ".jpg", Some("thumb100"));
    assert_eq!(meta_path, "up1/cache/aG/aGVsbG9fd29ybGQy_thumb100.jpg.res");
    assert_eq!(image_path, "up1/cache/aG/aGVsbG9fd29ybGQy_thumb100.jpg");
  }

  #[test]
  fn image_path_is_meta_path_without_res_suffix() {
    let store = Store::new("root");
    for xform in [None, Some("thumb_100")] {
      let (meta_path, image_path) = store.local_image_path("a/b/c.png", ".png", xform);
      assert_eq!(meta_path, format!("{}.res", image_path));
    }
  }

  #[test]
  fn load_local_response_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().to_str().unwrap());
    let pool = pool();

    let artifact = remote(
      ArtifactKind::Generic,
      199,
      100,
      "assets/sample1",
      "private;max-age=9",
      b"sample1 content",
    );
    let path = store.local_res_path("sample1.css", ".css");
    store.save(&artifact, &path).unwrap();

    let loaded = store.load_local_response(&path, false, &pool).unwrap();
    assert_eq!(loaded.meta().status, 199);
    assert_eq!(loaded.meta().content_type, "assets/sample1");
    assert_eq!(loaded.meta().cache_control, "private;max-age=9");

    let (_, body) = crate::Artifact::Local(loaded).into_bytes().unwrap();
    assert_eq!(body, b"sample1 content");
  }

  #[test]
  fn missing_artifact_is_a_silent_miss() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().to_str().unwrap());
    let path = store.local_res_path("does_not_exist", "");
    assert!(store.load_local_response(&path, false, &pool()).is_none());
  }

  #[test]
  fn expired_artifact_misses_unless_forced() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().to_str().unwrap());
    let pool = pool();

    let artifact = remote(ArtifactKind::Generic, 200, -2, "", "", b"hello");
    let path = store.local_res_path("expired", "");
    store.save(&artifact, &path).unwrap();

    assert!(store.load_local_response(&path, false, &pool).is_none());
    let forced = store.load_local_response(&path, true, &pool).unwrap();
    assert_eq!(forced.meta().status, 200);
  }

  #[test]
  fn corrupt_artifact_is_a_miss() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().to_str().unwrap());
    let path = store.local_res_path("corrupt", "");
    create_file(&path).unwrap().write_all(b"\x09\x09junk").unwrap();
    assert!(store.load_local_response(&path, true, &pool()).is_none());
  }

  #[test]
  fn load_local_image_returns_generic_artifacts_whole() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().to_str().unwrap());
    let pool = pool();

    let artifact = remote(ArtifactKind::Generic, 404, 100, "", "", b"not here");
    let (meta_path, image_path) = store.local_image_path("gone.png", ".png", None);
    store.save(&artifact, &meta_path).unwrap();

    let loaded = store.load_local_image(&meta_path, &image_path, &pool).unwrap();
    assert_eq!(loaded.meta().status, 404);
    let (_, body) = crate::Artifact::Local(loaded).into_bytes().unwrap();
    assert_eq!(body, b"not here");
  }

  #[test]
  fn load_local_image_rebinds_to_the_image_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().to_str().unwrap());
    let pool = pool();

    let (meta_path, image_path) = store.local_image_path("tea.png", ".png", None);
    let image_bytes = b"PNGDATA";
    let meta = Meta {
      kind: ArtifactKind::Image,
      status: 200,
      expires: unix_now() + 100,
      content_type: "image/png".to_string(),
      cache_control: String::new(),
      body_length: image_bytes.len() as u32,
    };
    store.save(&meta, &meta_path).unwrap();
    create_file(&image_path).unwrap().write_all(image_bytes).unwrap();

    let loaded = store.load_local_image(&meta_path, &image_path, &pool).unwrap();
    let (meta, body) = crate::Artifact::Local(loaded).into_bytes().unwrap();
    assert_eq!(meta.content_type, "image/png");
    assert_eq!(body, image_bytes);
  }

  #[test]
  fn image_meta_without_body_file_is_a_miss() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().to_str().unwrap());
    let (meta_path, image_path) = store.local_image_path("half.png", ".png", None);
    let meta = Meta {
      kind: ArtifactKind::Image,
      status: 200,
      expires: unix_now() + 100,
      content_type: "image/png".to_string(),
      cache_control: String::new(),
      body_length: 4,
    };
    store.save(&meta, &meta_path).unwrap();
    assert!(store.load_local_image(&meta_path, &image_path, &pool()).is_none());
  }

  #[test]
  fn origin_check_reports_absent_when_nothing_is_cached() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().to_str().unwrap());
    let path = store.local_res_path("does_not_exist", "");
    assert!(matches!(
      store.origin_image_check(&path, &pool()).unwrap(),
      OriginStatus::Absent
    ));
  }

  #[test]
  fn origin_check_returns_cached_non_images() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().to_str().unwrap());

    let artifact = remote(ArtifactKind::Generic, 404, 100, "", "", b"nope");
    let (meta_path, _) = store.local_image_path("gone.png", ".png", None);
    store.save(&artifact, &meta_path).unwrap();

    match store.origin_image_check(&meta_path, &pool()).unwrap() {
      OriginStatus::NonImage(artifact) => assert_eq!(artifact.meta().status, 404),
      _ => panic!("expected the cached non-image back"),
    }
  }

  #[test]
  fn origin_check_reports_valid_image_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().to_str().unwrap());

    let artifact = remote(ArtifactKind::Image, 200, 100, "image/png", "", b"");
    let expected = artifact.meta().expires;
    let (meta_path, _) = store.local_image_path("tea.png", ".png", None);
    store.save(&artifact, &meta_path).unwrap();

    match store.origin_image_check(&meta_path, &pool()).unwrap() {
      OriginStatus::Image { expires } => assert_eq!(expires, expected),
      _ => panic!("expected an image origin"),
    }
  }

  #[test]
  fn origin_check_treats_expired_origins_as_absent() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().to_str().unwrap());

    let artifact = remote(ArtifactKind::Image, 200, -5, "image/png", "", b"");
    let (meta_path, _) = store.local_image_path("old.png", ".png", None);
    store.save(&artifact, &meta_path).unwrap();

    assert!(matches!(
      store.origin_image_check(&meta_path, &pool()).unwrap(),
      OriginStatus::Absent
    ));
  }

  #[test]
  fn extension_is_lowercased_with_dot() {
    assert_eq!(path_extension("a/b/tea.PNG"), ".png");
    assert_eq!(path_extension("a/b/main.css"), ".css");
    assert_eq!(path_extension("a/b/archive.tar.gz"), ".gz");
    assert_eq!(path_extension("a/b/no_ext"), "");
    assert_eq!(path_extension(".hidden"), "");
  }

  #[test]
  fn basename_takes_the_final_segment() {
    assert_eq!(path_basename("a/b/c.png"), "c.png");
    assert_eq!(path_basename("c.png"), "c.png");
  }

  #[test]
  fn save_creates_missing_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(format!("{}/deep", dir.path().to_str().unwrap()));
    let artifact = remote(ArtifactKind::Generic, 200, 100, "", "", b"x");
    let path = store.local_res_path("fresh", "");
    store.save(&artifact, &path).unwrap();
    assert!(std::path::Path::new(&path).exists());
  }
}
