use anyhow::Context;
use assetproxy::config::Config;
use assetproxy::server::{self, App};
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "assetproxy", version, about = "Caching asset proxy with image transforms")]
struct Args {
  /// Full path to the config file.
  #[arg(long, default_value = "config.json")]
  config: String,
}

fn init_tracing(default_level: &str) {
  tracing_subscriber::registry()
    .with(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let args = Args::parse();

  let config = Config::from_file(&args.config)
    .with_context(|| format!("loading config from {}", args.config))?;
  init_tracing(&config.log.level);

  let app = Arc::new(App::new(&config).context("building upstreams")?);

  let listener = tokio::net::TcpListener::bind(&config.http.listen)
    .await
    .with_context(|| format!("binding {}", config.http.listen))?;
  info!(address = %config.http.listen, commit = server::COMMIT, "server listening");

  axum::serve(listener, server::router(app))
    .await
    .context("http server")?;
  Ok(())
}
