//! Ordered fallback across authentication strategies

use std::{error, fmt, sync::Arc};

use async_trait::async_trait;
use tokenward_clock::{Clock, DurationSecs, System};

use crate::{
    exchange::{ExchangeError, FailureKind},
    strategies::AuthStrategy,
    Scope, ScopeRef, TokenRecord,
};

/// An asynchronous source of tokens for any scope
#[async_trait]
pub trait AsyncTokenSource: Send + Sync + fmt::Debug {
    /// Requests a fresh token for `scope`
    async fn request_token(&self, scope: &ScopeRef) -> Result<TokenRecord, AcquireError>;
}

/// A record of one strategy failing during an acquisition
#[derive(Clone, Debug)]
pub struct StrategyFailure {
    strategy: String,
    error: Arc<ExchangeError>,
}

impl StrategyFailure {
    fn new(strategy: &str, error: ExchangeError) -> Self {
        Self {
            strategy: strategy.to_owned(),
            error: Arc::new(error),
        }
    }

    /// The name of the strategy that failed
    pub fn strategy(&self) -> &str {
        &self.strategy
    }

    /// How the strategy failed
    pub fn kind(&self) -> FailureKind {
        self.error.kind()
    }

    /// The underlying exchange error
    pub fn error(&self) -> &ExchangeError {
        &self.error
    }
}

impl fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` ({}): {}", self.strategy, self.kind(), self.error)?;
        if let Some(source) = error::Error::source(&*self.error) {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

/// Every configured strategy failed to produce a token
#[derive(Clone, Debug)]
pub struct AcquireError {
    scope: Scope,
    attempts: Vec<StrategyFailure>,
}

impl AcquireError {
    /// The scope a token was requested for
    pub fn scope(&self) -> &ScopeRef {
        &self.scope
    }

    /// Each strategy's failure, in the order attempted
    pub fn attempts(&self) -> &[StrategyFailure] {
        &self.attempts
    }

    /// Whether trying again later may succeed
    ///
    /// True only when the final strategy failed transiently. A rejected or
    /// unavailable final strategy points at configuration, not at the network.
    pub fn is_retryable(&self) -> bool {
        self.attempts
            .last()
            .map_or(false, |f| f.kind() == FailureKind::Transient)
    }
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attempts.is_empty() {
            return write!(
                f,
                "no authentication strategies configured for scope `{}`",
                self.scope
            );
        }

        write!(f, "unable to obtain token for scope `{}`: ", self.scope)?;
        for (idx, attempt) in self.attempts.iter().enumerate() {
            if idx > 0 {
                f.write_str("; ")?;
            }
            fmt::Display::fmt(attempt, f)?;
        }
        Ok(())
    }
}

impl error::Error for AcquireError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.attempts
            .last()
            .map(|f| &*f.error as &(dyn error::Error + 'static))
    }
}

/// An ordered list of strategies, tried until one succeeds
///
/// The order is fixed at construction. Every failure, whether transient or a
/// rejection, moves on to the next strategy; no strategy is retried within a
/// single acquisition.
pub struct FallbackChain<C = System> {
    strategies: Vec<Box<dyn AuthStrategy>>,
    minimum_validity: DurationSecs,
    clock: C,
}

impl FallbackChain<System> {
    /// Constructs an empty chain
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
            minimum_validity: DurationSecs::ZERO,
            clock: System,
        }
    }
}

impl Default for FallbackChain<System> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> FallbackChain<C> {
    /// Appends a strategy, to be tried after all those already added
    pub fn with_strategy(mut self, strategy: impl AuthStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    /// Appends an already boxed strategy
    pub fn with_boxed_strategy(mut self, strategy: Box<dyn AuthStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Sets the minimum validity for any token returned by this chain
    ///
    /// A strategy that produces a token expiring within `minimum_validity`
    /// is treated as having returned an unusable token.
    pub fn with_minimum_validity(mut self, minimum_validity: DurationSecs) -> Self {
        self.minimum_validity = minimum_validity;
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> FallbackChain<D> {
        FallbackChain {
            strategies: self.strategies,
            minimum_validity: self.minimum_validity,
            clock,
        }
    }

    /// The names of the configured strategies, in priority order
    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Whether any strategy has been configured
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

impl<C: Clock> FallbackChain<C> {
    /// Tries each strategy in order, returning the first token obtained
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self, scope: &ScopeRef) -> Result<TokenRecord, AcquireError> {
        let mut attempts = Vec::new();

        for strategy in &self.strategies {
            let name = strategy.name();
            let error = match strategy.attempt(scope).await {
                Ok(record) if record.is_usable_at(self.clock.now(), self.minimum_validity) => {
                    if !attempts.is_empty() {
                        tracing::info!(
                            strategy = name,
                            failed_attempts = attempts.len(),
                            "obtained token from fallback strategy"
                        );
                    }
                    return Ok(record);
                }
                Ok(_) => ExchangeError::InvalidToken("token expires within the safety margin"),
                Err(error) => error,
            };

            tracing::warn!(
                strategy = name,
                kind = %error.kind(),
                error = (&error as &dyn error::Error),
                "strategy failed, trying next"
            );
            attempts.push(StrategyFailure::new(name, error));
        }

        let error = AcquireError {
            scope: scope.to_owned(),
            attempts,
        };

        tracing::error!(
            retryable = error.is_retryable(),
            error = %error,
            "all strategies failed"
        );

        Err(error)
    }
}

#[async_trait]
impl<C> AsyncTokenSource for FallbackChain<C>
where
    C: Clock + Send + Sync + fmt::Debug,
{
    async fn request_token(&self, scope: &ScopeRef) -> Result<TokenRecord, AcquireError> {
        self.acquire(scope).await
    }
}

impl<C: fmt::Debug> fmt::Debug for FallbackChain<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FallbackChain")
            .field("strategies", &self.strategy_names())
            .field("minimum_validity", &self.minimum_validity)
            .field("clock", &self.clock)
            .finish()
    }
}
