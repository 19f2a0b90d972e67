//! Scoped access token management for machine-to-machine clients
//!
//! This library hands out bearer tokens for outbound API calls, partitioned by
//! _scope_: one reserved platform-wide scope plus one scope per tenant
//! application. Token state for one scope never affects another.
//!
//! Tokens are obtained by trying an ordered list of authentication strategies,
//! such as exchanging a signed-in user's delegated credential, a client ID and
//! secret, or a legacy application key pair. The first strategy to produce a
//! token wins, and every failure along the way is recorded so operators can
//! tell an unreachable authority apart from bad credentials.
//!
//! Cached tokens are handed out only while they remain valid for longer than a
//! configurable _safety margin_. When a token is missing or too close to
//! expiry, concurrent callers for the same scope are coalesced onto a single
//! exchange and all receive the same result.
//!
//! # General Flow
//!
//! On application start-up, assemble a [`TokenProvider`], either from a
//! deserialized [`ProviderConfig`] or through a [`TokenProviderBuilder`], and
//! share it with every outbound call site.
//!
//! ```
//! use tokenward::{
//!     ClientId, ClientSecret, ClientSecretStrategy, Scope, TokenExchangeClient,
//!     TokenProviderBuilder,
//! };
//! use tokenward_clock::DurationSecs;
//!
//! # struct Opts {
//! #     client_id: ClientId,
//! #     client_secret: ClientSecret,
//! #     token_url: reqwest::Url,
//! #     credentials_file: std::path::PathBuf,
//! # }
//! #
//! # let opts = Opts {
//! #     client_id: ClientId::from_static("test"),
//! #     client_secret: ClientSecret::from_static("test"),
//! #     token_url: reqwest::Url::parse("https://example.com/oauth/token").unwrap(),
//! #     credentials_file: std::env::temp_dir().join("tokenward-doc.json"),
//! # };
//! #
//! let exchange = TokenExchangeClient::new(reqwest::Client::new(), opts.token_url);
//!
//! let provider = TokenProviderBuilder::new()
//!     .safety_margin(DurationSecs::from_mins(5))
//!     .file_store(opts.credentials_file)
//!     .strategy(ClientSecretStrategy::new(exchange, opts.client_id, opts.client_secret))
//!     .build()?;
//!
//! # /* Commented out due to this trying to interact with the world.
//! let token = provider.get_valid_token(&Scope::from_static("tenant-42")).await?;
//! # */
//! # Ok::<(), tokenward::ConfigError>(())
//! ```
//!
//! When a downstream service rejects a token that looked valid, use
//! [`TokenProvider::call_with_token`] (or the `tokenward_reqwest` middleware)
//! to invalidate it and retry exactly once.
//!
//! # Features
//!
//! * `rustls-tls`: Enables TLS for token exchanges through `rustls`.
//! * `default-tls`: Enables TLS for token exchanges through the platform's
//!   native TLS implementation.

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

mod braids;
mod chain;
mod config;
mod coordinator;
pub mod exchange;
mod provider;
mod record;
pub mod store;
pub mod strategies;

pub use braids::*;
pub use chain::{AcquireError, AsyncTokenSource, FallbackChain, StrategyFailure};
pub use config::{
    ConfigError, ProviderConfig, StoreConfig, StrategyConfig, TokenProviderBuilder,
    DEFAULT_REQUEST_TIMEOUT, DEFAULT_SAFETY_MARGIN,
};
pub use coordinator::{RefreshCoordinator, RefreshError};
pub use exchange::{ExchangeError, FailureKind, TokenExchangeClient};
pub use provider::{AuthRejection, CallError, TokenError, TokenProvider};
pub use record::{TokenRecord, TokenStatus};
pub use store::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use strategies::{
    AuthStrategy, ClientSecretStrategy, DelegatedCredential, DelegatedCredentialStrategy,
    LegacyKeyStrategy, StaticTokenStrategy,
};
