//! Caching asset proxy with on-demand image transforms.
//!
//! The crate sits between clients and one or more configured upstream
//! origins. Every response fetched from an upstream is persisted to the
//! local filesystem as an artifact (a small binary header plus the body) and
//! served from disk until it expires. Images get a two-tier cache: the
//! origin bytes are stored in a standalone file an external thumbnailer can
//! read directly, and each transformed variant is persisted next to it.
//!
//! Concurrent misses on the same path are collapsed into a single upstream
//! fetch; followers re-read the just-persisted artifact from disk instead of
//! sharing the owner's in-memory response.

pub mod artifact;
pub mod config;
pub mod error;
pub mod meta;
pub mod notfound;
pub mod pool;
pub mod serve;
pub mod server;
pub mod singleflight;
pub mod store;
pub mod upstream;

pub use artifact::{Artifact, LocalArtifact, Persist, RemoteArtifact};
pub use config::Config;
pub use error::{Error, Result};
pub use meta::{ArtifactKind, Meta};
pub use pool::{Buffer, Pool, PoolConfig};
pub use serve::{serve, Served};
pub use server::App;
pub use store::Store;
pub use upstream::Upstream;
