//! The token provider facade
//!
//! [`TokenProvider`] is what outbound call sites hold on to. A cached token
//! is returned without suspending; otherwise the refresh is delegated to the
//! [`RefreshCoordinator`], which coalesces concurrent callers per scope.

use std::{future::Future, sync::Arc};

use bytes::{BufMut, BytesMut};
use reqwest::{header::HeaderValue, StatusCode};
use thiserror::Error;
use tokenward_clock::UnixTime;

use crate::{
    chain::AcquireError,
    coordinator::{RefreshCoordinator, RefreshError},
    store::CredentialStore,
    AccessToken, AccessTokenRef, AsyncTokenSource, Scope, ScopeRef, TokenRecord,
};

/// A failure to provide a token
#[derive(Clone, Debug, Error)]
pub enum TokenError {
    /// Every strategy failed to produce a token
    #[error(transparent)]
    Exhausted(AcquireError),
    /// The refresh ended without producing a result
    #[error("token refresh for scope `{scope}` was aborted")]
    Aborted {
        /// The scope being refreshed
        scope: Scope,
    },
    /// The only token obtained expires within the safety margin
    #[error("token obtained for scope `{scope}` expires within the safety margin")]
    WithinMargin {
        /// The scope of the token
        scope: Scope,
        /// When the withheld token expires
        expires_at: UnixTime,
    },
    /// The token contains bytes that cannot be sent in a header
    #[error("token for scope `{scope}` cannot be used as a header value")]
    InvalidHeader {
        /// The scope of the token
        scope: Scope,
    },
}

impl TokenError {
    /// Whether the same request may succeed if tried again later
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Exhausted(err) => err.is_retryable(),
            Self::Aborted { .. } => true,
            Self::WithinMargin { .. } | Self::InvalidHeader { .. } => false,
        }
    }

    /// Whether the application should treat the scope as not authenticated
    ///
    /// This is the case when every strategy was turned away for reasons other
    /// than a transient failure, such as missing or rejected credentials.
    pub fn needs_reauthentication(&self) -> bool {
        match self {
            Self::Exhausted(err) => !err.is_retryable(),
            Self::Aborted { .. } | Self::WithinMargin { .. } | Self::InvalidHeader { .. } => {
                false
            }
        }
    }
}

impl From<RefreshError> for TokenError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::Exhausted(err) => Self::Exhausted(err),
            RefreshError::Aborted { scope } => Self::Aborted { scope },
            RefreshError::WithinMargin { scope, expires_at } => {
                Self::WithinMargin { scope, expires_at }
            }
        }
    }
}

/// Errors that report whether a downstream service rejected the token used
pub trait AuthRejection {
    /// Whether this error means the token was not accepted
    fn is_auth_rejection(&self) -> bool;
}

impl AuthRejection for StatusCode {
    fn is_auth_rejection(&self) -> bool {
        *self == StatusCode::UNAUTHORIZED
    }
}

impl AuthRejection for reqwest::Error {
    fn is_auth_rejection(&self) -> bool {
        self.status() == Some(StatusCode::UNAUTHORIZED)
    }
}

/// A failure of an operation run by [`TokenProvider::call_with_token`]
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// No token could be provided
    #[error("unable to provide a token for the operation")]
    Token(#[from] TokenError),
    /// The operation failed for a reason other than authentication
    #[error("operation failed")]
    Operation(#[source] E),
    /// The operation was rejected again after the token was replaced
    #[error("downstream service rejected a freshly obtained token for scope `{scope}`")]
    Rejected {
        /// The scope of the rejected token
        scope: Scope,
        /// The second rejection
        #[source]
        source: E,
    },
}

impl<E> CallError<E> {
    /// Whether the application should treat the scope as not authenticated
    pub fn needs_reauthentication(&self) -> bool {
        match self {
            Self::Token(err) => err.needs_reauthentication(),
            Self::Operation(_) => false,
            Self::Rejected { .. } => true,
        }
    }
}

/// Provides valid tokens per scope
///
/// Cheap to clone; clones share the store and the in-flight refreshes.
#[derive(Clone, Debug)]
pub struct TokenProvider {
    store: Arc<dyn CredentialStore>,
    coordinator: RefreshCoordinator,
}

impl TokenProvider {
    /// Constructs a provider caching in `store` and refreshing from `source`
    ///
    /// A token from `source` that expires within the store's safety margin is
    /// never handed out; it is reported as [`TokenError::WithinMargin`]. To
    /// have a chain fall back past such tokens instead, see
    /// [`FallbackChain::with_minimum_validity`][crate::FallbackChain::with_minimum_validity].
    pub fn new<S, T>(store: S, source: T) -> Self
    where
        S: CredentialStore + 'static,
        T: AsyncTokenSource + 'static,
    {
        Self::from_shared(Arc::new(store), Arc::new(source))
    }

    /// Constructs a provider from already shared parts
    pub fn from_shared(store: Arc<dyn CredentialStore>, source: Arc<dyn AsyncTokenSource>) -> Self {
        Self {
            coordinator: RefreshCoordinator::new(source, Arc::clone(&store)),
            store,
        }
    }

    /// Gets a token record for `scope` that is usable under the safety margin
    ///
    /// Does not suspend when a usable record is cached.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_valid_record(&self, scope: &ScopeRef) -> Result<TokenRecord, TokenError> {
        if let Some(record) = self.store.get(scope) {
            tracing::trace!("using cached token");
            return Ok(record);
        }

        tracing::debug!("no usable cached token");
        Ok(self.coordinator.get_or_fetch(scope).await?)
    }

    /// Gets a bearer value for `scope` that is usable under the safety margin
    pub async fn get_valid_token(&self, scope: &ScopeRef) -> Result<AccessToken, TokenError> {
        self.get_valid_record(scope)
            .await
            .map(TokenRecord::into_value)
    }

    /// Gets an `Authorization` header value for `scope`
    ///
    /// The value is marked as sensitive.
    pub async fn bearer_header(&self, scope: &ScopeRef) -> Result<HeaderValue, TokenError> {
        let token = self.get_valid_token(scope).await?;
        token
            .to_bearer_header()
            .ok_or_else(|| TokenError::InvalidHeader {
                scope: scope.to_owned(),
            })
    }

    /// Discards the cached token and any in-flight refresh for `scope`
    ///
    /// The next request for `scope` always performs a new exchange.
    pub fn force_invalidate(&self, scope: &ScopeRef) {
        tracing::debug!(%scope, "forcing invalidation");
        self.coordinator.invalidate(scope);
    }

    /// Discards the cached token for `scope` if it is still `rejected`
    ///
    /// Use this when a downstream service turns `rejected` away. Unlike
    /// [`force_invalidate`](Self::force_invalidate), a replacement that has
    /// already been obtained or is in flight is kept, so many callers
    /// rejected with the same token share a single exchange.
    ///
    /// Returns whether the cached token was discarded.
    pub fn invalidate_rejected(&self, scope: &ScopeRef, rejected: &AccessTokenRef) -> bool {
        self.coordinator.invalidate_if(scope, rejected)
    }

    /// Discards every cached token and in-flight refresh
    pub fn clear_all(&self) {
        tracing::info!("clearing all cached tokens");
        self.coordinator.invalidate_all();
    }

    /// Runs `op` with a token for `scope`, replacing the token once if rejected
    ///
    /// If `op` fails with an authentication rejection, the rejected token is
    /// invalidated and `op` is run once more with a freshly obtained token.
    /// A second rejection is returned as [`CallError::Rejected`].
    pub async fn call_with_token<F, Fut, T, E>(
        &self,
        scope: &ScopeRef,
        mut op: F,
    ) -> Result<T, CallError<E>>
    where
        F: FnMut(AccessToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: AuthRejection,
    {
        let token = self.get_valid_token(scope).await?;
        match op(token.clone()).await {
            Err(err) if err.is_auth_rejection() => {
                tracing::warn!(%scope, "token rejected downstream, replacing it and retrying once");
                self.invalidate_rejected(scope, &token);
            }
            other => return other.map_err(CallError::Operation),
        }

        let token = self.get_valid_token(scope).await?;
        match op(token).await {
            Err(err) if err.is_auth_rejection() => {
                tracing::error!(%scope, "freshly obtained token rejected downstream");
                Err(CallError::Rejected {
                    scope: scope.to_owned(),
                    source: err,
                })
            }
            other => other.map_err(CallError::Operation),
        }
    }
}

impl AccessTokenRef {
    /// Formats the token as a sensitive `Authorization` header value
    ///
    /// Returns `None` if the token contains bytes not allowed in a header.
    pub fn to_bearer_header(&self) -> Option<HeaderValue> {
        let mut header_value = BytesMut::with_capacity(self.as_str().len() + 7);
        header_value.put_slice(b"Bearer ");
        header_value.put_slice(self.as_str().as_bytes());
        let mut value = HeaderValue::from_maybe_shared(header_value.freeze()).ok()?;
        value.set_sensitive(true);
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokenward_clock::{DurationSecs, TestClock, UnixTime};

    use super::*;
    use crate::{
        chain::testing::{Outcome, ScriptedStrategy},
        FallbackChain, MemoryCredentialStore, StaticTokenStrategy,
    };

    const MARGIN: DurationSecs = DurationSecs(300);

    struct Harness {
        provider: TokenProvider,
        store: Arc<MemoryCredentialStore<TestClock>>,
        clock: TestClock,
    }

    fn harness<I>(strategies: I) -> Harness
    where
        I: IntoIterator<Item = Arc<ScriptedStrategy>>,
    {
        let clock = TestClock::new(UnixTime(1_000));
        let store = Arc::new(MemoryCredentialStore::new(MARGIN).with_clock(clock.clone()));
        let chain = strategies
            .into_iter()
            .fold(FallbackChain::new(), |chain, s| chain.with_strategy(s))
            .with_minimum_validity(MARGIN)
            .with_clock(clock.clone());

        Harness {
            provider: TokenProvider::from_shared(store.clone(), Arc::new(chain)),
            store,
            clock,
        }
    }

    fn tenant(name: &'static str) -> Scope {
        Scope::from_static(name)
    }

    mod when_no_token_is_cached {
        use super::*;

        #[tokio::test]
        async fn first_strategy_token_is_returned_and_cached() {
            let client_secret =
                ScriptedStrategy::always("client_secret", Outcome::Token("abc", 3_600));
            let legacy = ScriptedStrategy::always("legacy", Outcome::Token("xyz", 1_800));
            let h = harness([client_secret.clone(), legacy.clone()]);

            let token = h.provider.get_valid_token(&tenant("tenant-42")).await.unwrap();

            assert_eq!(token.as_str(), "abc");
            assert_eq!(client_secret.calls(), 1);
            assert_eq!(legacy.calls(), 0);
            assert!(h.store.get(&tenant("tenant-42")).is_some());
        }

        #[tokio::test]
        async fn rejected_strategy_falls_back_to_the_next() {
            let client_secret = ScriptedStrategy::always("client_secret", Outcome::Rejected);
            let legacy = ScriptedStrategy::always("legacy", Outcome::Token("xyz", 1_800));
            let h = harness([client_secret.clone(), legacy.clone()]);

            let token = h.provider.get_valid_token(&tenant("tenant-42")).await.unwrap();

            assert_eq!(token.as_str(), "xyz");
            assert_eq!(client_secret.calls(), 1);
            assert_eq!(legacy.calls(), 1);
        }

        #[tokio::test]
        async fn exhaustion_reports_whether_reauthentication_is_needed() {
            let h = harness([
                ScriptedStrategy::always("delegated", Outcome::Unavailable),
                ScriptedStrategy::always("client_secret", Outcome::Rejected),
            ]);

            let err = h
                .provider
                .get_valid_token(&tenant("tenant-42"))
                .await
                .unwrap_err();

            assert!(!err.is_retryable());
            assert!(err.needs_reauthentication());
            assert!(h.store.is_empty());
        }

        #[tokio::test]
        async fn transient_exhaustion_is_retryable() {
            let h = harness([ScriptedStrategy::always("client_secret", Outcome::Transient)]);

            let err = h
                .provider
                .get_valid_token(&tenant("tenant-42"))
                .await
                .unwrap_err();

            assert!(err.is_retryable());
            assert!(!err.needs_reauthentication());
        }

        #[tokio::test]
        async fn a_source_token_inside_the_margin_is_withheld() {
            let provider = TokenProvider::new(
                MemoryCredentialStore::new(MARGIN),
                FallbackChain::new().with_strategy(StaticTokenStrategy::new("short", DurationSecs(60))),
            );

            let err = provider
                .get_valid_record(&tenant("tenant-7"))
                .await
                .unwrap_err();

            assert!(matches!(err, TokenError::WithinMargin { .. }));
            assert!(!err.is_retryable());
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn concurrent_callers_cause_a_single_exchange() {
            let strategy = ScriptedStrategy::slow(
                "client_secret",
                Outcome::Token("abc", 3_600),
                std::time::Duration::from_millis(50),
            );
            let h = harness([strategy.clone()]);

            let tasks: Vec<_> = (0..32)
                .map(|_| {
                    let provider = h.provider.clone();
                    tokio::spawn(async move {
                        provider.get_valid_token(&tenant("tenant-42")).await
                    })
                })
                .collect();

            for task in futures::future::join_all(tasks).await {
                assert_eq!(task.unwrap().unwrap().as_str(), "abc");
            }
            assert_eq!(strategy.calls(), 1);
        }
    }

    mod when_a_token_is_cached {
        use super::*;

        #[tokio::test]
        async fn repeated_calls_do_not_exchange_again() {
            let strategy = ScriptedStrategy::always("client_secret", Outcome::Token("abc", 3_600));
            let h = harness([strategy.clone()]);

            let first = h.provider.get_valid_token(&tenant("tenant-42")).await.unwrap();
            let second = h.provider.get_valid_token(&tenant("tenant-42")).await.unwrap();

            assert_eq!(first, second);
            assert_eq!(strategy.calls(), 1);
        }

        #[tokio::test]
        async fn a_token_within_the_safety_margin_is_replaced() {
            let strategy = ScriptedStrategy::always("client_secret", Outcome::Token("fresh", 3_600));
            let h = harness([strategy.clone()]);
            h.store.set(TokenRecord::new(
                tenant("tenant-7"),
                AccessToken::from_static("stale"),
                UnixTime(0),
                UnixTime(1_030),
            ));

            let token = h.provider.get_valid_token(&tenant("tenant-7")).await.unwrap();

            assert_eq!(token.as_str(), "fresh");
            assert_eq!(strategy.calls(), 1);
        }

        #[tokio::test]
        async fn an_expired_token_is_never_returned() {
            let strategy = ScriptedStrategy::always("client_secret", Outcome::Token("fresh", 3_600));
            let h = harness([strategy.clone()]);
            h.store.set(TokenRecord::new(
                tenant("tenant-42"),
                AccessToken::from_static("expired"),
                UnixTime(0),
                UnixTime(999),
            ));

            let token = h.provider.get_valid_token(&tenant("tenant-42")).await.unwrap();

            assert_eq!(token.as_str(), "fresh");
        }

        #[tokio::test]
        async fn the_cached_token_ages_into_the_margin() {
            let strategy = ScriptedStrategy::scripted(
                "client_secret",
                vec![Outcome::Token("first", 3_600)],
                Outcome::Token("second", 7_200),
            );
            let h = harness([strategy.clone()]);

            let first = h.provider.get_valid_token(&tenant("tenant-42")).await.unwrap();
            h.clock.advance(DurationSecs(3_300));
            let second = h.provider.get_valid_token(&tenant("tenant-42")).await.unwrap();

            assert_eq!(first.as_str(), "first");
            assert_eq!(second.as_str(), "second");
            assert_eq!(strategy.calls(), 2);
        }

        #[tokio::test]
        async fn forced_invalidation_always_exchanges_again() {
            let strategy = ScriptedStrategy::scripted(
                "client_secret",
                vec![Outcome::Token("before", 3_600)],
                Outcome::Token("after", 3_600),
            );
            let h = harness([strategy.clone()]);
            let scope = tenant("tenant-42");

            let before = h.provider.get_valid_token(&scope).await.unwrap();
            h.provider.force_invalidate(&scope);
            h.provider.force_invalidate(&scope);
            let after = h.provider.get_valid_token(&scope).await.unwrap();

            assert_eq!(before.as_str(), "before");
            assert_eq!(after.as_str(), "after");
            assert_eq!(strategy.calls(), 2);
        }

        #[tokio::test]
        async fn scopes_are_independent() {
            let strategy = ScriptedStrategy::always("client_secret", Outcome::Token("abc", 3_600));
            let h = harness([strategy.clone()]);

            h.provider.get_valid_token(&tenant("tenant-1")).await.unwrap();
            h.provider.get_valid_token(&Scope::platform()).await.unwrap();
            h.provider.force_invalidate(&tenant("tenant-1"));

            assert!(h.store.get(&Scope::platform()).is_some());
            assert!(h.store.get(&tenant("tenant-1")).is_none());
        }

        #[tokio::test]
        async fn clear_all_discards_every_scope() {
            let strategy = ScriptedStrategy::always("client_secret", Outcome::Token("abc", 3_600));
            let h = harness([strategy.clone()]);

            h.provider.get_valid_token(&tenant("tenant-1")).await.unwrap();
            h.provider.get_valid_token(&tenant("tenant-2")).await.unwrap();
            h.provider.clear_all();

            assert!(h.store.is_empty());
            h.provider.get_valid_token(&tenant("tenant-1")).await.unwrap();
            assert_eq!(strategy.calls(), 3);
        }

        #[tokio::test]
        async fn bearer_header_is_sensitive() {
            let h = harness([ScriptedStrategy::always(
                "client_secret",
                Outcome::Token("abc", 3_600),
            )]);

            let header = h.provider.bearer_header(&tenant("tenant-42")).await.unwrap();

            assert_eq!(header.to_str().unwrap(), "Bearer abc");
            assert!(header.is_sensitive());
        }
    }

    mod when_calling_with_a_token {
        use super::*;

        #[tokio::test]
        async fn a_single_rejection_is_retried_with_a_new_token() {
            let strategy = ScriptedStrategy::scripted(
                "client_secret",
                vec![Outcome::Token("revoked", 3_600)],
                Outcome::Token("good", 3_600),
            );
            let h = harness([strategy.clone()]);

            let result = h
                .provider
                .call_with_token(&tenant("tenant-42"), |token| async move {
                    if token.as_str() == "good" {
                        Ok("done")
                    } else {
                        Err(StatusCode::UNAUTHORIZED)
                    }
                })
                .await
                .unwrap();

            assert_eq!(result, "done");
            assert_eq!(strategy.calls(), 2);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn callers_rejected_together_share_one_replacement() {
            let strategy = ScriptedStrategy::scripted_slow(
                "client_secret",
                vec![Outcome::Token("revoked", 3_600), Outcome::Token("good", 3_600)],
                std::time::Duration::from_millis(50),
            );
            let h = harness([strategy.clone()]);
            h.provider.get_valid_token(&tenant("tenant-42")).await.unwrap();

            let tasks: Vec<_> = (0..16)
                .map(|_| {
                    let provider = h.provider.clone();
                    tokio::spawn(async move {
                        provider
                            .call_with_token(&tenant("tenant-42"), |token| async move {
                                if token.as_str() == "good" {
                                    Ok(())
                                } else {
                                    Err(StatusCode::UNAUTHORIZED)
                                }
                            })
                            .await
                    })
                })
                .collect();

            for task in futures::future::join_all(tasks).await {
                task.unwrap().unwrap();
            }
            assert_eq!(strategy.calls(), 2);
        }

        #[tokio::test]
        async fn a_second_rejection_is_fatal() {
            let strategy = ScriptedStrategy::always("client_secret", Outcome::Token("abc", 3_600));
            let h = harness([strategy.clone()]);
            let attempts = AtomicUsize::new(0);

            let err = h
                .provider
                .call_with_token(&tenant("tenant-42"), |_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(StatusCode::UNAUTHORIZED) }
                })
                .await
                .unwrap_err();

            assert!(matches!(err, CallError::Rejected { .. }));
            assert!(err.needs_reauthentication());
            assert_eq!(attempts.load(Ordering::SeqCst), 2);
            assert_eq!(strategy.calls(), 2);
        }

        #[tokio::test]
        async fn other_failures_are_not_retried() {
            let strategy = ScriptedStrategy::always("client_secret", Outcome::Token("abc", 3_600));
            let h = harness([strategy.clone()]);
            let attempts = AtomicUsize::new(0);

            let err = h
                .provider
                .call_with_token(&tenant("tenant-42"), |_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(StatusCode::FORBIDDEN) }
                })
                .await
                .unwrap_err();

            assert!(matches!(err, CallError::Operation(status) if status == StatusCode::FORBIDDEN));
            assert_eq!(attempts.load(Ordering::SeqCst), 1);
            assert_eq!(strategy.calls(), 1);
        }

        #[tokio::test]
        async fn token_failures_skip_the_operation() {
            let h = harness([ScriptedStrategy::always("client_secret", Outcome::Rejected)]);
            let attempts = AtomicUsize::new(0);

            let err = h
                .provider
                .call_with_token(&tenant("tenant-42"), |_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, StatusCode>(()) }
                })
                .await
                .unwrap_err();

            assert!(matches!(err, CallError::Token(TokenError::Exhausted(_))));
            assert_eq!(attempts.load(Ordering::SeqCst), 0);
        }
    }
}
