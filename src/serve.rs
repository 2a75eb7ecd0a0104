//! Request pipeline: routes a request path to the static-asset or image
//! flow and composes the store, fetcher, and transformer.
//!
//! The image flow keeps a two-tier cache. The origin image is cached once
//! under its own path, and every requested transform gets its own variant
//! files next to it, so `?xform=thumb_200` after `?xform=thumb_100` re-runs
//! the thumbnailer against the on-disk origin without touching the origin
//! server.

use crate::artifact::Artifact;
use crate::error::{Error, Result};
use crate::store::{path_extension, OriginStatus};
use crate::upstream::Upstream;

/// Extensions dispatched to the image flow.
const IMAGE_EXTENSIONS: [&str; 5] = [".png", ".jpg", ".jpeg", ".gif", ".webp"];

/// A servable artifact plus whether it came from the local cache.
///
/// Single-flight followers report `hit = false` even though they read from
/// disk: from the client's perspective the artifact was just fetched.
#[derive(Debug)]
pub struct Served {
  pub artifact: Artifact,
  pub hit: bool,
}

impl Served {
  fn hit(artifact: Artifact) -> Served {
    Served {
      artifact,
      hit: true,
    }
  }

  fn fetched(artifact: Artifact) -> Served {
    Served {
      artifact,
      hit: false,
    }
  }
}

/// Serves `remote_path` from the cache or the upstream.
pub fn serve(up: &Upstream, remote_path: &str, xform: Option<&str>) -> Result<Served> {
  let extension = path_extension(remote_path);
  if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
    serve_image(up, remote_path, &extension, xform)
  } else {
    serve_static(up, remote_path, &extension)
  }
}

fn serve_static(up: &Upstream, remote_path: &str, extension: &str) -> Result<Served> {
  let local_path = up.store().local_res_path(remote_path, extension);

  if let Some(artifact) = up
    .store()
    .load_local_response(&local_path, false, up.buffers())
  {
    return Ok(Served::hit(Artifact::Local(artifact)));
  }

  let artifact = up.get_response_and_save(remote_path, &local_path)?;
  Ok(Served::fetched(artifact))
}

fn serve_image(
  up: &Upstream,
  remote_path: &str,
  extension: &str,
  xform: Option<&str>,
) -> Result<Served> {
  let xform_args = match xform {
    Some(name) => Some(
      up.transform_args(name)
        .ok_or_else(|| Error::InvalidTransform {
          name: name.to_string(),
        })?,
    ),
    None => None,
  };

  let (meta_path, image_path) = up.store().local_image_path(remote_path, extension, xform);
  if let Some(artifact) = up
    .store()
    .load_local_image(&meta_path, &image_path, up.buffers())
  {
    return Ok(Served::hit(Artifact::Local(artifact)));
  }

  let Some(xform_args) = xform_args else {
    // No transform requested: the variant paths are the origin paths.
    let (artifact, _) = up.save_origin_image(remote_path, &meta_path, &image_path)?;
    if let Some(artifact) = artifact {
      // The origin turned out to be a non-image (a 404, say); it was
      // negative-cached and is served as-is.
      return Ok(Served::fetched(artifact));
    }
    let artifact = up
      .store()
      .load_local_image(&meta_path, &image_path, up.buffers())
      .ok_or_else(|| Error::LocalImageMissing {
        path: image_path.clone(),
      })?;
    return Ok(Served::fetched(Artifact::Local(artifact)));
  };

  // Transform requested: make sure the origin image itself is cached, then
  // run the thumbnailer against it.
  let (origin_meta_path, origin_image_path) =
    up.store().local_image_path(remote_path, extension, None);

  let mut expires = match up.store().origin_image_check(&origin_meta_path, up.buffers())? {
    OriginStatus::NonImage(artifact) => return Ok(Served::hit(Artifact::Local(artifact))),
    OriginStatus::Image { expires } => expires,
    OriginStatus::Absent => 0,
  };

  if expires == 0 {
    let (artifact, fetched_expires) =
      up.save_origin_image(remote_path, &origin_meta_path, &origin_image_path)?;
    if let Some(artifact) = artifact {
      return Ok(Served::fetched(artifact));
    }
    expires = fetched_expires;
  }

  up.transform_image(&origin_image_path, &meta_path, &image_path, xform_args, expires)?;

  let artifact = up
    .store()
    .load_local_image(&meta_path, &image_path, up.buffers())
    .ok_or_else(|| Error::LocalImageMissing {
      path: image_path.clone(),
    })?;
  Ok(Served::fetched(Artifact::Local(artifact)))
}
