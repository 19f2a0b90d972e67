//! Assembly of a [`TokenProvider`] from configuration
//!
//! [`ProviderConfig`] can be deserialized from any serde format. For
//! programmatic assembly, use [`TokenProviderBuilder`] directly.
//!
//! ```
//! use tokenward::{DelegatedCredential, ProviderConfig};
//!
//! let config: ProviderConfig = serde_json::from_str(r#"{
//!     "safety_margin_secs": 120,
//!     "store": { "kind": "file", "path": "/tmp/tokenward.json" },
//!     "strategies": [
//!         { "kind": "delegated", "token_url": "https://auth.example.com/exchange" },
//!         {
//!             "kind": "client_secret",
//!             "token_url": "https://auth.example.com/oauth/token",
//!             "client_id": "my-app",
//!             "client_secret": "shh"
//!         }
//!     ]
//! }"#).unwrap();
//!
//! let provider = config.build(&DelegatedCredential::empty()).unwrap();
//! # drop(provider);
//! ```

use std::{path::PathBuf, sync::Arc, time::Duration};

use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tokenward_clock::DurationSecs;

use crate::{
    exchange::TokenExchangeClient,
    store::{CredentialStore, FileCredentialStore, MemoryCredentialStore},
    strategies::{
        AuthStrategy, ClientSecretStrategy, DelegatedCredential, DelegatedCredentialStrategy,
        LegacyKeyStrategy, StaticTokenStrategy,
    },
    AccessToken, AppKey, AppSecret, ClientId, ClientSecret, FallbackChain, TokenProvider,
};

/// The safety margin used unless configured otherwise
pub const DEFAULT_SAFETY_MARGIN: DurationSecs = DurationSecs::from_mins(5);

/// The request timeout used unless configured otherwise
pub const DEFAULT_REQUEST_TIMEOUT: DurationSecs = DurationSecs(10);

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// An error assembling a [`TokenProvider`]
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No strategies were configured
    #[error("at least one authentication strategy must be configured")]
    NoStrategies,
    /// The safety margin was zero
    #[error("the safety margin must be positive")]
    ZeroSafetyMargin,
    /// A strategy's token URL could not be parsed
    #[error("invalid token URL for strategy `{strategy}`")]
    InvalidUrl {
        /// The name of the strategy
        strategy: String,
        /// The parse failure
        #[source]
        source: url::ParseError,
    },
    /// The HTTP client could not be constructed
    #[error("unable to construct HTTP client")]
    HttpClient(#[source] reqwest::Error),
}

/// Where token records are kept
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Kept in memory for the life of the process
    #[default]
    Memory,
    /// Persisted to a JSON file
    File {
        /// The path of the backing file
        path: PathBuf,
    },
}

/// One authentication strategy, in priority order
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// Exchange the signed-in user's delegated credential
    Delegated {
        /// The token exchange endpoint
        token_url: String,
        /// Overrides the strategy name
        name: Option<String>,
    },
    /// Exchange an application client ID and secret
    ClientSecret {
        /// The token endpoint
        token_url: String,
        /// The client ID
        client_id: ClientId,
        /// The client secret
        client_secret: ClientSecret,
        /// Overrides the strategy name
        name: Option<String>,
    },
    /// Exchange a legacy application key pair as form data
    Legacy {
        /// The legacy token endpoint
        token_url: String,
        /// The application key
        app_key: AppKey,
        /// The application secret
        app_secret: AppSecret,
        /// Overrides the strategy name
        name: Option<String>,
    },
    /// Hand out a pre-provisioned token
    Static {
        /// The token
        token: AccessToken,
        /// How long the token is considered valid after it is handed out
        lifetime_secs: DurationSecs,
        /// Overrides the strategy name
        name: Option<String>,
    },
}

impl StrategyConfig {
    fn kind(&self) -> &'static str {
        match self {
            Self::Delegated { .. } => "delegated",
            Self::ClientSecret { .. } => "client_secret",
            Self::Legacy { .. } => "legacy",
            Self::Static { .. } => "static",
        }
    }

    fn exchange_client(
        &self,
        http: &reqwest::Client,
        token_url: &str,
    ) -> Result<TokenExchangeClient, ConfigError> {
        let token_url = Url::parse(token_url).map_err(|source| ConfigError::InvalidUrl {
            strategy: self.kind().to_owned(),
            source,
        })?;
        Ok(TokenExchangeClient::new(http.clone(), token_url))
    }

    fn build(
        &self,
        http: &reqwest::Client,
        delegated: &DelegatedCredential,
    ) -> Result<Box<dyn AuthStrategy>, ConfigError> {
        let strategy: Box<dyn AuthStrategy> = match self {
            Self::Delegated { token_url, name } => {
                let client = self.exchange_client(http, token_url)?;
                let strategy = DelegatedCredentialStrategy::new(client, delegated.clone());
                match name {
                    Some(name) => Box::new(strategy.named(name)),
                    None => Box::new(strategy),
                }
            }
            Self::ClientSecret {
                token_url,
                client_id,
                client_secret,
                name,
            } => {
                let client = self.exchange_client(http, token_url)?;
                let strategy =
                    ClientSecretStrategy::new(client, client_id.clone(), client_secret.clone());
                match name {
                    Some(name) => Box::new(strategy.named(name)),
                    None => Box::new(strategy),
                }
            }
            Self::Legacy {
                token_url,
                app_key,
                app_secret,
                name,
            } => {
                let client = self.exchange_client(http, token_url)?;
                let strategy = LegacyKeyStrategy::new(client, app_key.clone(), app_secret.clone());
                match name {
                    Some(name) => Box::new(strategy.named(name)),
                    None => Box::new(strategy),
                }
            }
            Self::Static {
                token,
                lifetime_secs,
                name,
            } => {
                let strategy = StaticTokenStrategy::new(token.clone(), *lifetime_secs);
                match name {
                    Some(name) => Box::new(strategy.named(name)),
                    None => Box::new(strategy),
                }
            }
        };

        Ok(strategy)
    }
}

/// Configuration for a [`TokenProvider`]
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// How long before expiry a cached token stops being handed out
    pub safety_margin_secs: DurationSecs,
    /// The timeout applied to each token exchange
    pub request_timeout_secs: DurationSecs,
    /// Where token records are kept
    pub store: StoreConfig,
    /// The strategies to try, in priority order
    pub strategies: Vec<StrategyConfig>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            safety_margin_secs: DEFAULT_SAFETY_MARGIN,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT,
            store: StoreConfig::default(),
            strategies: Vec::new(),
        }
    }
}

impl ProviderConfig {
    /// Assembles a provider
    ///
    /// Any `delegated` strategies read from `delegated`, which the
    /// application updates as users sign in and out.
    pub fn build(&self, delegated: &DelegatedCredential) -> Result<TokenProvider, ConfigError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from(self.request_timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(ConfigError::HttpClient)?;

        let mut builder = TokenProviderBuilder::new().safety_margin(self.safety_margin_secs);
        builder = match &self.store {
            StoreConfig::Memory => builder.memory_store(),
            StoreConfig::File { path } => builder.file_store(path.clone()),
        };

        for strategy in &self.strategies {
            builder = builder.boxed_strategy(strategy.build(&http, delegated)?);
        }

        builder.build()
    }
}

#[derive(Debug)]
enum StoreChoice {
    Memory,
    File(PathBuf),
    Shared(Arc<dyn CredentialStore>),
}

/// A builder for a [`TokenProvider`]
///
/// The chain is given a minimum validity equal to the safety margin, so a
/// freshly exchanged token that would already be within the margin is
/// treated as a failed attempt.
#[derive(Debug)]
pub struct TokenProviderBuilder {
    safety_margin: DurationSecs,
    store: StoreChoice,
    chain: FallbackChain,
}

impl Default for TokenProviderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenProviderBuilder {
    /// A builder with the default safety margin and an in-memory store
    pub fn new() -> Self {
        Self {
            safety_margin: DEFAULT_SAFETY_MARGIN,
            store: StoreChoice::Memory,
            chain: FallbackChain::new(),
        }
    }

    /// Sets the safety margin
    pub fn safety_margin(mut self, safety_margin: DurationSecs) -> Self {
        self.safety_margin = safety_margin;
        self
    }

    /// Keeps records in memory
    pub fn memory_store(mut self) -> Self {
        self.store = StoreChoice::Memory;
        self
    }

    /// Persists records to the JSON file at `path`
    pub fn file_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.store = StoreChoice::File(path.into());
        self
    }

    /// Uses an existing store
    ///
    /// The store applies its own safety margin.
    pub fn store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = StoreChoice::Shared(store);
        self
    }

    /// Appends a strategy
    pub fn strategy(mut self, strategy: impl AuthStrategy + 'static) -> Self {
        self.chain = self.chain.with_strategy(strategy);
        self
    }

    /// Appends an already boxed strategy
    pub fn boxed_strategy(mut self, strategy: Box<dyn AuthStrategy>) -> Self {
        self.chain = self.chain.with_boxed_strategy(strategy);
        self
    }

    /// Assembles the provider
    pub fn build(self) -> Result<TokenProvider, ConfigError> {
        if self.chain.is_empty() {
            return Err(ConfigError::NoStrategies);
        }
        if self.safety_margin == DurationSecs::ZERO {
            return Err(ConfigError::ZeroSafetyMargin);
        }

        let store: Arc<dyn CredentialStore> = match self.store {
            StoreChoice::Memory => Arc::new(MemoryCredentialStore::new(self.safety_margin)),
            StoreChoice::File(path) => Arc::new(FileCredentialStore::open(path, self.safety_margin)),
            StoreChoice::Shared(store) => store,
        };

        let chain = self.chain.with_minimum_validity(self.safety_margin);
        tracing::debug!(
            strategies = ?chain.strategy_names(),
            safety_margin = self.safety_margin.0,
            "assembled token provider"
        );

        Ok(TokenProvider::from_shared(store, Arc::new(chain)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Scope;

    fn parse(json: &str) -> ProviderConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn defaults_apply_to_omitted_fields() {
        let config = parse("{}");

        assert_eq!(config.safety_margin_secs, DurationSecs(300));
        assert_eq!(config.request_timeout_secs, DurationSecs(10));
        assert!(matches!(config.store, StoreConfig::Memory));
        assert!(config.strategies.is_empty());
    }

    #[test]
    fn every_strategy_kind_parses_in_order() {
        let config = parse(
            r#"{
                "strategies": [
                    { "kind": "delegated", "token_url": "https://auth.example.com/exchange" },
                    {
                        "kind": "client_secret",
                        "token_url": "https://auth.example.com/token",
                        "client_id": "app",
                        "client_secret": "shh"
                    },
                    {
                        "kind": "legacy",
                        "token_url": "https://legacy.example.com/token",
                        "app_key": "key",
                        "app_secret": "pw",
                        "name": "legacy_v1"
                    },
                    { "kind": "static", "token": "fixed", "lifetime_secs": 3600 }
                ]
            }"#,
        );

        let kinds: Vec<_> = config.strategies.iter().map(StrategyConfig::kind).collect();
        assert_eq!(kinds, ["delegated", "client_secret", "legacy", "static"]);
    }

    #[test]
    fn unknown_strategy_kind_is_refused() {
        let result = serde_json::from_str::<ProviderConfig>(
            r#"{ "strategies": [ { "kind": "carrier_pigeon" } ] }"#,
        );

        assert!(result.is_err());
    }

    #[test]
    fn secrets_are_not_revealed_by_debug_output() {
        let config = parse(
            r#"{
                "strategies": [{
                    "kind": "client_secret",
                    "token_url": "https://auth.example.com/token",
                    "client_id": "app",
                    "client_secret": "super-secret-value"
                }]
            }"#,
        );

        assert!(!format!("{:?}", config).contains("super-secret-value"));
    }

    mod when_building {
        use super::*;

        #[test]
        fn an_empty_chain_is_refused() {
            let err = ProviderConfig::default()
                .build(&DelegatedCredential::empty())
                .unwrap_err();

            assert!(matches!(err, ConfigError::NoStrategies));
        }

        #[test]
        fn a_zero_margin_is_refused() {
            let err = TokenProviderBuilder::new()
                .safety_margin(DurationSecs::ZERO)
                .strategy(StaticTokenStrategy::new("fixed", DurationSecs(3_600)))
                .build()
                .unwrap_err();

            assert!(matches!(err, ConfigError::ZeroSafetyMargin));
        }

        #[test]
        fn an_invalid_url_names_the_strategy() {
            let config = parse(
                r#"{ "strategies": [ { "kind": "delegated", "token_url": "not a url" } ] }"#,
            );

            let err = config.build(&DelegatedCredential::empty()).unwrap_err();

            match err {
                ConfigError::InvalidUrl { strategy, .. } => assert_eq!(strategy, "delegated"),
                other => panic!("unexpected error: {:?}", other),
            }
        }

        #[tokio::test]
        async fn a_static_provider_hands_out_its_token() {
            let config = parse(
                r#"{ "strategies": [ { "kind": "static", "token": "fixed", "lifetime_secs": 3600 } ] }"#,
            );

            let provider = config.build(&DelegatedCredential::empty()).unwrap();
            let token = provider
                .get_valid_token(&Scope::from_static("tenant-42"))
                .await
                .unwrap();

            assert_eq!(token.as_str(), "fixed");
        }

        #[tokio::test]
        async fn a_static_token_shorter_than_the_margin_is_refused() {
            let provider = TokenProviderBuilder::new()
                .safety_margin(DurationSecs(300))
                .strategy(StaticTokenStrategy::new("fixed", DurationSecs(60)))
                .build()
                .unwrap();

            let err = provider
                .get_valid_token(&Scope::from_static("tenant-42"))
                .await
                .unwrap_err();

            assert!(err.needs_reauthentication());
        }

        #[tokio::test]
        async fn a_file_store_persists_across_providers() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("tokens.json");
            let scope = Scope::from_static("tenant-42");

            let first = TokenProviderBuilder::new()
                .file_store(&path)
                .strategy(StaticTokenStrategy::new("persisted", DurationSecs(3_600)))
                .build()
                .unwrap();
            first.get_valid_token(&scope).await.unwrap();

            let second = TokenProviderBuilder::new()
                .file_store(&path)
                .strategy(StaticTokenStrategy::new("replacement", DurationSecs(3_600)))
                .build()
                .unwrap();
            let token = second.get_valid_token(&scope).await.unwrap();

            assert_eq!(token.as_str(), "persisted");
        }
    }
}
