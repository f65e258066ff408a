//! Encrypted storage and proactive background refresh of OAuth2 bearer tokens
//!
//! This library keeps the access tokens of one or many end users fresh without the code that
//! consumes them needing to care. Tokens are sealed at rest, a single background loop per
//! process exchanges refresh tokens shortly before the access tokens expire, and consumers
//! simply ask for the current token whenever they need one.
//!
//! In particular, the refresh decision is always made against a token's _effective_ expiry,
//! which honors an opt-in extended session ("remember me") layered on top of the lifetime the
//! provider issued. Refresh failures are split into those that are worth retrying (network
//! problems, server errors) and those that are not (the provider rejected the refresh token).
//! The former are retried with exponential backoff and otherwise left for the next pass; the
//! latter deactivate the token so that the user is asked to authorize again.
//!
//! # General Flow
//!
//! On application start-up, build a [`TokenService`] from configuration and start its
//! background loop. When a user completes an authorization flow, hand the tokens you obtained
//! to [`TokenService::save_token`]. From then on, [`TokenService::get_token`] returns a
//! current token, or [`ServiceError::NotAuthenticated`] if the user must sign in again.
//!
//! ```no_run
//! use tokenward::{
//!     AccessToken, ClientId, ClientSecret, Config, RefreshToken, SubjectId, TokenFields,
//!     TokenService,
//! };
//! use tokenward_clock::DurationSecs;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::new(
//!     "https://auth.example.com/oauth/token",
//!     ClientId::from_static("my-client"),
//!     ClientSecret::from_static("my-secret"),
//! )
//! .with_encryption_key(std::env::var("TOKENWARD_ENCRYPTION_KEY")?)
//! .with_store_path("tokens.json");
//!
//! let service = TokenService::from_config(&config)?;
//! service.start();
//!
//! let alice = SubjectId::from_static("alice");
//! service
//!     .save_token(
//!         &alice,
//!         TokenFields::new(AccessToken::from_static("an-access-token"))
//!             .with_refresh_token(RefreshToken::from_static("a-refresh-token"))
//!             .with_expires_in(DurationSecs(3_600)),
//!     )
//!     .await?;
//!
//! let token = service.get_token(&alice).await?;
//! tracing::info!(
//!     token = format_args!("{:#?}", token.access_token),
//!     "current access token"
//! );
//!
//! service.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! The background loop is guarded so that only one runs per process, no matter how many
//! services are constructed or how many times [`TokenService::start`] is called. Its sleep
//! can be shortened by a [JitterSource][jitter::JitterSource] to keep several processes from
//! polling the provider in lockstep.
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are enabled by default:
//!
//! * `oauth2`: Provides the [`reqwest`]-backed refresh executor and configuration-driven
//!   construction of a [`TokenService`].
//! * `file`: Provides a persistence backend storing sealed records in a local JSON file.
//! * `rand`: Provides for an implementation of [JitterSource][jitter::JitterSource] based on the
//!   random number generator provided by the [rand] crate.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod backends;
pub mod backoff;
mod braids;
#[cfg(feature = "oauth2")]
#[cfg_attr(docsrs, doc(cfg(feature = "oauth2")))]
pub mod config;
pub mod crypto;
pub mod events;
pub mod guard;
pub mod jitter;
pub mod record;
pub mod refresh;
pub mod scheduler;
mod service;
pub mod session;
pub mod stats;
pub mod store;

pub use braids::*;
#[cfg(feature = "oauth2")]
pub use config::{Config, ConfigError};
pub use events::{Event, EventBus, EventKind};
pub use record::{RecordKey, TokenFields, TokenRecord};
pub use refresh::{RefreshError, TokenRefresher};
pub use scheduler::{RefreshScheduler, ScheduleMode, SchedulerSettings};
pub use service::{ServiceError, TokenService};
pub use stats::StatsSnapshot;
pub use store::{StoreError, TokenStore};
