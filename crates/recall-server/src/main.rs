//! recall-server binary.
//!
//! Reads `config.toml` (or the path specified with `--config`), opens the
//! SQLite store, spawns the SLA scheduler, dead-letter worker, and cleanup
//! sweeper, and serves the HTTP API.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use anyhow::Context as _;
use clap::Parser;
use recall_api::AppState;
use recall_core::{
  breaker::BreakerPolicy,
  entry::OutreachMethod,
  policy::RateLimitPolicy,
};
use recall_engine::{
  breaker::BreakerRegistry,
  channels::ChannelSet,
  deadletter::{DeadLetterConfig, DeadLetterWorker},
  outreach::Outreacher,
  providers::{HttpAiResponder, HttpChannel},
  scheduler::{ProcessorHandle, SchedulerConfig, SlaScheduler},
  sweeper::{CleanupSweeper, SweeperConfig},
};
use recall_store_sqlite::SqliteStore;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

// ─── Configuration ───────────────────────────────────────────────────────────

/// Runtime server configuration, deserialised from `config.toml` plus
/// `RECALL_*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
struct ServerConfig {
  #[serde(default = "default_host")]
  host:                 String,
  #[serde(default = "default_port")]
  port:                 u16,
  #[serde(default = "default_store_path")]
  store_path:           PathBuf,
  /// Whether the scheduler starts processing immediately; operators can
  /// toggle it at runtime via `/processor/start|stop`.
  #[serde(default = "default_true")]
  processor_autostart:  bool,
  #[serde(default = "default_poll_secs")]
  poll_interval_secs:   u64,
  #[serde(default = "default_batch_size")]
  batch_size:           usize,
  #[serde(default = "default_ttl_days")]
  idempotency_ttl_days: u32,
  #[serde(default = "default_audit_days")]
  audit_retention_days: u32,
  #[serde(default = "default_send_timeout")]
  send_timeout_secs:    u64,
  #[serde(default)]
  rate_limit:           RateLimitPolicy,
  #[serde(default)]
  breaker:              BreakerPolicy,
  #[serde(default)]
  providers:            ProviderConfig,
}

/// Where the outreach gateways live.
#[derive(Debug, Clone, Deserialize)]
struct ProviderConfig {
  #[serde(default = "default_sms_url")]
  sms_url:   String,
  #[serde(default = "default_voice_url")]
  voice_url: String,
  #[serde(default = "default_email_url")]
  email_url: String,
  #[serde(default = "default_ai_url")]
  ai_url:    String,
}

fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 8640 }
fn default_store_path() -> PathBuf { PathBuf::from("recall.db") }
fn default_true() -> bool { true }
fn default_poll_secs() -> u64 { 60 }
fn default_batch_size() -> usize { 50 }
fn default_ttl_days() -> u32 { 90 }
fn default_audit_days() -> u32 { 365 }
fn default_send_timeout() -> u64 { 30 }
fn default_sms_url() -> String { "http://127.0.0.1:9710/sms".to_string() }
fn default_voice_url() -> String { "http://127.0.0.1:9710/voice".to_string() }
fn default_email_url() -> String { "http://127.0.0.1:9710/email".to_string() }
fn default_ai_url() -> String { "http://127.0.0.1:9720/respond".to_string() }

impl Default for ProviderConfig {
  fn default() -> Self {
    Self {
      sms_url:   default_sms_url(),
      voice_url: default_voice_url(),
      email_url: default_email_url(),
      ai_url:    default_ai_url(),
    }
  }
}

// ─── CLI ─────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(author, version, about = "Recall missed-call recovery server")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "config.toml")]
  config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  // Load configuration.
  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(config::Environment::with_prefix("RECALL").separator("__"))
    .build()
    .context("failed to read config file")?;
  let cfg: ServerConfig = settings
    .try_deserialize()
    .context("failed to deserialise ServerConfig")?;

  // Open the store.
  let store_path = expand_tilde(&cfg.store_path);
  let store = Arc::new(
    SqliteStore::open(&store_path)
      .await
      .with_context(|| format!("failed to open store at {store_path:?}"))?,
  );

  // Wire the outreach stack.
  let send_timeout = Duration::from_secs(cfg.send_timeout_secs);
  let channels = ChannelSet::new()
    .with(Arc::new(HttpChannel::new(
      OutreachMethod::Sms,
      cfg.providers.sms_url.clone(),
      send_timeout,
    )))
    .with(Arc::new(HttpChannel::new(
      OutreachMethod::Call,
      cfg.providers.voice_url.clone(),
      send_timeout,
    )))
    .with(Arc::new(HttpChannel::new(
      OutreachMethod::Email,
      cfg.providers.email_url.clone(),
      send_timeout,
    )));
  let responder = Arc::new(HttpAiResponder::new(cfg.providers.ai_url.clone(), send_timeout));

  let breakers = BreakerRegistry::new(Arc::clone(&store), cfg.breaker);
  let outreach = Arc::new(Outreacher::new(
    Arc::clone(&store),
    channels.clone(),
    responder,
    breakers,
    send_timeout,
  ));

  let processor = Arc::new(ProcessorHandle::new(cfg.processor_autostart));
  let scheduler = Arc::new(SlaScheduler::new(
    Arc::clone(&store),
    outreach,
    Arc::clone(&processor),
    SchedulerConfig {
      poll_interval: Duration::from_secs(cfg.poll_interval_secs),
      batch_size:    cfg.batch_size,
    },
  ));

  // Background loops: scheduler, dead-letter worker, cleanup sweeper.
  {
    let scheduler = Arc::clone(&scheduler);
    tokio::spawn(async move { scheduler.run().await });
  }
  tokio::spawn(
    DeadLetterWorker::new(
      Arc::clone(&store),
      channels,
      DeadLetterConfig {
        poll_interval: Duration::from_secs(cfg.poll_interval_secs),
        ..DeadLetterConfig::default()
      },
    )
    .run(),
  );
  tokio::spawn(
    CleanupSweeper::new(
      Arc::clone(&store),
      SweeperConfig {
        audit_retention_days: cfg.audit_retention_days,
        ..SweeperConfig::default()
      },
    )
    .run(),
  );

  // Serve the API.
  let state = AppState {
    store,
    scheduler,
    processor,
    rate_limit: cfg.rate_limit,
    idempotency_ttl_days: cfg.idempotency_ttl_days,
  };
  let app = recall_api::router(state).layer(TraceLayer::new_for_http());

  let address = format!("{}:{}", cfg.host, cfg.port);
  tracing::info!("listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app)
    .with_graceful_shutdown(async {
      let _ = tokio::signal::ctrl_c().await;
      tracing::info!("shutting down");
    })
    .await
    .context("server error")?;

  Ok(())
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
