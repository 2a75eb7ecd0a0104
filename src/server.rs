//! HTTP dispatch layer.
//!
//! A thin axum surface over the synchronous core: handlers validate the
//! query, then run the pipeline on the blocking thread pool. Client-facing
//! errors are small JSON bodies with a numeric code; internal failures log
//! their code and surface as plain 500s.

use crate::config::{probe_thumbnailer, resolve_thumbnailer, Config};
use crate::error::{codes, Error, Result};
use crate::meta::{unix_now, Meta};
use crate::notfound::NotFoundCache;
use crate::serve::serve;
use crate::upstream::Upstream;
use axum::body::Body;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

/// Commit hash embedded at build time.
pub const COMMIT: &str = env!("ASSETPROXY_COMMIT");
/// Toolchain that produced the binary.
pub const RUSTC: &str = env!("ASSETPROXY_RUSTC");

/// Total entry bound for the in-memory not-found cache.
const NOT_FOUND_CACHE_MAX: usize = 16_384;

/// Shared server state: the configured upstreams and the not-found cache.
pub struct App {
  upstreams: HashMap<String, Arc<Upstream>>,
  not_found: NotFoundCache,
  vips_version: String,
}

impl App {
  /// Builds every upstream and probes the thumbnail binary. Any failure
  /// here is fatal at startup.
  pub fn new(config: &Config) -> Result<App> {
    let thumbnailer = resolve_thumbnailer(config.thumbnail_binary_path.as_deref())?;
    let vips_version = probe_thumbnailer(&thumbnailer)?;

    let mut upstreams = HashMap::with_capacity(config.upstreams.len());
    for (name, upstream_config) in &config.upstreams {
      let upstream = Upstream::new(
        name,
        upstream_config,
        &config.cache_root,
        &thumbnailer,
        config.instance_id,
      )?;
      upstreams.insert(name.clone(), Arc::new(upstream));
    }

    Ok(App {
      upstreams,
      not_found: NotFoundCache::new(NOT_FOUND_CACHE_MAX),
      vips_version,
    })
  }

  pub fn upstream(&self, name: &str) -> Option<&Arc<Upstream>> {
    self.upstreams.get(name)
  }
}

/// Builds the service router.
pub fn router(app: Arc<App>) -> Router {
  Router::new()
    .route("/ping", get(ping))
    .route("/info", get(info_handler))
    .route("/v1/{*path}", get(serve_asset))
    .fallback(unknown_route)
    .with_state(app)
}

async fn ping() -> impl IntoResponse {
  (
    [(header::CONTENT_TYPE, "application/json")],
    r#"{"ok":true}"#,
  )
}

async fn info_handler(State(app): State<Arc<App>>) -> impl IntoResponse {
  axum::Json(serde_json::json!({
    "commit": COMMIT,
    "rustc": RUSTC,
    "vips": app.vips_version,
  }))
}

async fn unknown_route() -> Response {
  client_error(
    StatusCode::NOT_FOUND,
    codes::RES_UNKNOWN_ROUTE,
    "unknown route",
  )
}

#[derive(Debug, Deserialize)]
struct ServeParams {
  up: Option<String>,
  xform: Option<String>,
}

async fn serve_asset(
  State(app): State<Arc<App>>,
  UrlPath(path): UrlPath<String>,
  Query(params): Query<ServeParams>,
) -> Response {
  let Some(up_name) = params.up else {
    return client_error(
      StatusCode::BAD_REQUEST,
      codes::RES_MISSING_UP_PARAM,
      "up parameter is required",
    );
  };
  let Some(upstream) = app.upstream(&up_name) else {
    return client_error(
      StatusCode::BAD_REQUEST,
      codes::RES_UNKNOWN_UP_PARAM,
      "up parameter is not valid",
    );
  };

  if app.not_found.get(&path) {
    return client_error(
      StatusCode::NOT_FOUND,
      codes::RES_NOT_FOUND_CACHE,
      "not found",
    );
  }

  let rid = upstream.next_request_id();
  let upstream = Arc::clone(upstream);
  let remote_path = path.clone();
  let xform = params.xform;
  let result =
    tokio::task::spawn_blocking(move || serve(&upstream, &remote_path, xform.as_deref())).await;

  let result = match result {
    Ok(result) => result,
    Err(err) => {
      error!(rid = %rid, code = codes::ERR_UNCAUGHT_HTTP, error = %err, "serve task failed");
      return server_error();
    }
  };

  match result {
    Ok(served) => {
      let hit = served.hit;
      let (meta, body) = match served.artifact.into_bytes() {
        Ok(parts) => parts,
        Err(err) => {
          error!(rid = %rid, up = %up_name, path = %path, error = %err, "artifact read failed");
          return server_error();
        }
      };

      info!(
        rid = %rid,
        up = %up_name,
        path = %path,
        hit,
        status = meta.status,
        res = body.len(),
        "serve"
      );
      artifact_response(&meta, body)
    }
    Err(Error::InvalidTransform { .. }) => client_error(
      StatusCode::BAD_REQUEST,
      codes::RES_INVALID_XFORM_PARAM,
      "xform parameter is not valid",
    ),
    Err(err) => {
      // With the disk cache unable to absorb a known-missing path, every
      // request would cost an origin round trip; remember the 404 in
      // memory until the artifact's TTL would have lapsed.
      if let Error::PersistFailed {
        status: 404,
        expires,
        ..
      } = err
      {
        app.not_found.set(&path, expires.saturating_sub(unix_now()));
      }
      let code = err.code().unwrap_or(codes::ERR_UNCAUGHT_HTTP);
      error!(rid = %rid, up = %up_name, path = %path, code, error = %err, "serve failed");
      server_error()
    }
  }
}

fn artifact_response(meta: &Meta, body: Vec<u8>) -> Response {
  let status =
    StatusCode::from_u16(meta.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
  let mut builder = Response::builder().status(status);
  if !meta.content_type.is_empty() {
    builder = builder.header(header::CONTENT_TYPE, meta.content_type.as_str());
  }
  if !meta.cache_control.is_empty() {
    builder = builder.header(header::CACHE_CONTROL, meta.cache_control.as_str());
  }
  match builder.body(Body::from(body)) {
    Ok(response) => response,
    Err(err) => {
      error!(error = %err, "artifact response build failed");
      server_error()
    }
  }
}

fn client_error(status: StatusCode, code: u32, message: &str) -> Response {
  let body = serde_json::json!({ "code": code, "error": message }).to_string();
  (
    status,
    [(header::CONTENT_TYPE, "application/json")],
    body,
  )
    .into_response()
}

fn server_error() -> Response {
  (
    StatusCode::INTERNAL_SERVER_ERROR,
    [(header::CONTENT_TYPE, "application/json")],
    r#"{"error":"internal server error"}"#,
  )
    .into_response()
}
