//! # Hearth Client
//!
//! Offline-first replication, caching and offline login for the Hearth
//! home-automation client, built on the pure rules in `hearth-engine`.
//!
//! ## Components
//!
//! - [`store`]: the durable local store (SQLite or in-memory) behind
//!   [`store::DurableStore`]
//! - [`remote`]: the remote authoritative store (HTTP or in-memory) behind
//!   [`remote::RemoteStore`], plus the remote identity
//! - [`cache::FreshnessCache`]: a TTL-bounded cache in front of the store,
//!   with write-through and per-key subscriptions
//! - [`sync::SyncCoordinator`]: push-then-pull replication passes on one
//!   background worker
//! - [`auth::CredentialManager`]: PIN-based offline login with bounded
//!   sessions
//! - [`AppContext`]: owns one of each and the tasks wiring them together
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hearth_client::{AppContext, Config};
//!
//! # async fn run() -> hearth_client::Result<()> {
//! let ctx = AppContext::open(Config::from_env()?).await?;
//! let report = ctx.request_sync().await?;
//! println!("sync finished: {:?}", report.status);
//! ctx.shutdown().await
//! # }
//! ```

pub mod auth;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod remote;
pub mod store;
pub mod sync;
pub mod telemetry;

pub use config::{Config, ConfigError};
pub use context::AppContext;
pub use error::{Error, ErrorCode, Result};
