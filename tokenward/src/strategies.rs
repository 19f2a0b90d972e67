//! Authentication strategies
//!
//! Each strategy binds one kind of credential material to a
//! [`TokenExchangeClient`] and turns a scope into a token with a single
//! round trip. Strategies are combined, in priority order, by a
//! [`FallbackChain`][crate::FallbackChain].

use std::{fmt, sync::Arc};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tokenward_clock::{Clock, DurationSecs, System};

use crate::{
    exchange::{
        dto::{ClientCredentialsRequest, DelegatedExchangeRequest, LegacyKeyRequest},
        ExchangeError, FormBody, JsonBody, RequestType, TokenExchangeClient,
    },
    AccessToken, AppKey, AppSecret, ClientId, ClientSecret, DelegatedToken, ScopeRef,
    TokenRecord,
};

/// A method of exchanging one credential material for a token
#[async_trait]
pub trait AuthStrategy: Send + Sync + fmt::Debug {
    /// A stable name used in logs and aggregate errors
    fn name(&self) -> &str;

    /// Attempts to obtain a token for `scope`
    async fn attempt(&self, scope: &ScopeRef) -> Result<TokenRecord, ExchangeError>;
}

#[async_trait]
impl<S: AuthStrategy + ?Sized> AuthStrategy for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn attempt(&self, scope: &ScopeRef) -> Result<TokenRecord, ExchangeError> {
        (**self).attempt(scope).await
    }
}

#[async_trait]
impl<S: AuthStrategy + ?Sized> AuthStrategy for Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn attempt(&self, scope: &ScopeRef) -> Result<TokenRecord, ExchangeError> {
        (**self).attempt(scope).await
    }
}

/// A slot holding the delegated bearer value of the signed-in user, if any
///
/// Clones share the slot, so the application can update it on sign-in and
/// sign-out while strategies built from it observe the change.
#[derive(Clone, Debug)]
pub struct DelegatedCredential {
    current: Arc<ArcSwapOption<DelegatedToken>>,
}

impl Default for DelegatedCredential {
    fn default() -> Self {
        Self::empty()
    }
}

impl DelegatedCredential {
    /// An empty slot
    pub fn empty() -> Self {
        Self {
            current: Arc::new(ArcSwapOption::empty()),
        }
    }

    /// A slot already holding `token`
    pub fn with_token(token: DelegatedToken) -> Self {
        let slot = Self::empty();
        slot.set(token);
        slot
    }

    /// Replaces the delegated value
    pub fn set(&self, token: DelegatedToken) {
        self.current.store(Some(Arc::new(token)));
    }

    /// Removes the delegated value
    pub fn clear(&self) {
        self.current.store(None);
    }

    /// The current delegated value
    pub fn current(&self) -> Option<Arc<DelegatedToken>> {
        self.current.load_full()
    }

    /// Whether a delegated value is present
    pub fn is_present(&self) -> bool {
        self.current.load().is_some()
    }
}

/// Exchanges the signed-in user's delegated credential for a scoped token
#[derive(Debug)]
pub struct DelegatedCredentialStrategy<C = System, T = JsonBody> {
    name: String,
    client: TokenExchangeClient<C, T>,
    credential: DelegatedCredential,
}

impl<C, T> DelegatedCredentialStrategy<C, T> {
    /// Constructs a new strategy reading from `credential`
    pub fn new(client: TokenExchangeClient<C, T>, credential: DelegatedCredential) -> Self {
        Self {
            name: "delegated".to_owned(),
            client,
            credential,
        }
    }

    /// Overrides the strategy name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl<C, T> AuthStrategy for DelegatedCredentialStrategy<C, T>
where
    C: Clock + Send + Sync + fmt::Debug,
    T: RequestType + Send + Sync + fmt::Debug,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt(&self, scope: &ScopeRef) -> Result<TokenRecord, ExchangeError> {
        let token = self
            .credential
            .current()
            .ok_or(ExchangeError::Unavailable("no delegated credential present"))?;

        self.client
            .exchange(&self.name, scope, &DelegatedExchangeRequest::new(&token, scope))
            .await
    }
}

/// Exchanges an application client ID and secret for a scoped token
#[derive(Debug)]
pub struct ClientSecretStrategy<C = System, T = JsonBody> {
    name: String,
    client: TokenExchangeClient<C, T>,
    client_id: ClientId,
    client_secret: ClientSecret,
}

impl<C, T> ClientSecretStrategy<C, T> {
    /// Constructs a new client-secret strategy
    pub fn new(
        client: TokenExchangeClient<C, T>,
        client_id: ClientId,
        client_secret: ClientSecret,
    ) -> Self {
        Self {
            name: "client_secret".to_owned(),
            client,
            client_id,
            client_secret,
        }
    }

    /// Overrides the strategy name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl<C, T> AuthStrategy for ClientSecretStrategy<C, T>
where
    C: Clock + Send + Sync + fmt::Debug,
    T: RequestType + Send + Sync + fmt::Debug,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt(&self, scope: &ScopeRef) -> Result<TokenRecord, ExchangeError> {
        let request = ClientCredentialsRequest::new(&self.client_id, &self.client_secret, scope);
        self.client.exchange(&self.name, scope, &request).await
    }
}

/// Exchanges a legacy application key pair, sent as form data
#[derive(Debug)]
pub struct LegacyKeyStrategy<C = System> {
    name: String,
    client: TokenExchangeClient<C, FormBody>,
    app_key: AppKey,
    app_secret: AppSecret,
}

impl<C> LegacyKeyStrategy<C> {
    /// Constructs a new legacy strategy
    pub fn new<T>(client: TokenExchangeClient<C, T>, app_key: AppKey, app_secret: AppSecret) -> Self {
        Self {
            name: "legacy".to_owned(),
            client: client.using_form_data(),
            app_key,
            app_secret,
        }
    }

    /// Overrides the strategy name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl<C> AuthStrategy for LegacyKeyStrategy<C>
where
    C: Clock + Send + Sync + fmt::Debug,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt(&self, scope: &ScopeRef) -> Result<TokenRecord, ExchangeError> {
        let request = LegacyKeyRequest::new(&self.app_key, &self.app_secret, scope);
        self.client.exchange(&self.name, scope, &request).await
    }
}

/// Hands out a fixed token, valid for a fixed lifetime from the moment it is requested
///
/// Intended for pre-provisioned tokens and local development.
#[derive(Debug)]
pub struct StaticTokenStrategy<C = System> {
    name: String,
    token: AccessToken,
    lifetime: DurationSecs,
    clock: C,
}

impl StaticTokenStrategy<System> {
    /// Constructs a new static strategy
    pub fn new(token: impl Into<AccessToken>, lifetime: DurationSecs) -> Self {
        Self {
            name: "static".to_owned(),
            token: token.into(),
            lifetime,
            clock: System,
        }
    }
}

impl<C> StaticTokenStrategy<C> {
    /// Overrides the strategy name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets a custom clock to be used
    pub fn with_clock<D>(self, clock: D) -> StaticTokenStrategy<D> {
        StaticTokenStrategy {
            name: self.name,
            token: self.token,
            lifetime: self.lifetime,
            clock,
        }
    }
}

#[async_trait]
impl<C> AuthStrategy for StaticTokenStrategy<C>
where
    C: Clock + Send + Sync + fmt::Debug,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt(&self, scope: &ScopeRef) -> Result<TokenRecord, ExchangeError> {
        Ok(TokenRecord::issued_now(
            &self.clock,
            scope,
            &self.token,
            self.lifetime,
        ))
    }
}
