//! Middleware to automatically attach scoped tokens to outgoing requests
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`ScopedTokenMiddleware`] in the middleware stack to attach a
//! valid token from a [`TokenProvider`] to each outbound request.
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the existing value will be left
//! in place, allowing overrides to be specified as required.
//!
//! Requests are authorized for the middleware's default scope unless a
//! [`Scope`] is attached as a request extension. If the downstream service
//! responds with `401 Unauthorized`, the rejected token is invalidated and the
//! request is sent once more with a freshly obtained token. Requests rejected
//! together with the same token share a single replacement. A second `401` is
//! returned to the caller as is. Requests whose bodies cannot be cloned are
//! never retried.
//!
//! ```
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//! use tokenward::{Scope, StaticTokenStrategy, TokenProviderBuilder};
//! use tokenward_reqwest::ScopedTokenMiddleware;
//! # use tokenward_clock::DurationSecs;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! # let provider = TokenProviderBuilder::new()
//! #     .strategy(StaticTokenStrategy::new("token", DurationSecs(3_600)))
//! #     .build()
//! #     .unwrap();
//! #
//! let client = ClientBuilder::new(Client::default())
//!     .with(ScopedTokenMiddleware::new(provider, Scope::platform()))
//!     .build();
//!
//! let req = client
//!     .get("https://example.com")
//!     .with_extension(Scope::from_static("tenant-42"));
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! # }
//! ```
//!
//! The middleware can also be configured to add a token only conditionally.
//! This can be useful in the event that you want to use a single common
//! middleware stack with multiple potential backends and want to ensure that
//! tokens are only sent to the backends that expect them.
//!
//! These predicates can be composed together to evaluate more complex
//! requirements prior to attaching a token to a request.
//!
//! ```
//! use predicates::prelude::PredicateBooleanExt;
//! use tokenward::{Scope, StaticTokenStrategy, TokenProviderBuilder};
//! use tokenward_reqwest::{ExactHostMatch, HttpsOnly, ScopedTokenMiddleware};
//! # use tokenward_clock::DurationSecs;
//! # let provider = TokenProviderBuilder::new()
//! #     .strategy(StaticTokenStrategy::new("token", DurationSecs(3_600)))
//! #     .build()
//! #     .unwrap();
//!
//! ScopedTokenMiddleware::new(provider, Scope::platform())
//!     .with_predicate(HttpsOnly.and(ExactHostMatch::new("api.example.com")));
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::fmt;

use http::Extensions;
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response, StatusCode};
use reqwest_middleware::{Error, Middleware, Next, Result};
use tokenward::{AccessToken, Scope, ScopeRef, TokenError, TokenProvider};

/// A middleware that injects a scoped token into outgoing requests
#[derive(Clone, Debug)]
pub struct ScopedTokenMiddleware<P> {
    provider: TokenProvider,
    scope: Scope,
    predicate: P,
}

impl ScopedTokenMiddleware<HttpsOnly> {
    /// Construct a new middleware attaching tokens for `scope`
    ///
    /// By default, this middleware will only send its token if the request
    /// is being sent via HTTPS. To change this behavior, provide a
    /// custom predicate with [`with_predicate()`][Self::with_predicate()].
    pub fn new(provider: TokenProvider, scope: Scope) -> Self {
        Self {
            provider,
            scope,
            predicate: HttpsOnly,
        }
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P>(self, predicate: P) -> ScopedTokenMiddleware<P> {
        ScopedTokenMiddleware {
            provider: self.provider,
            scope: self.scope,
            predicate,
        }
    }
}

impl<P> ScopedTokenMiddleware<P> {
    /// Attaches a token for `scope`, returning the token attached
    async fn authorize(&self, req: &mut Request, scope: &ScopeRef) -> Result<AccessToken> {
        let token = self
            .provider
            .get_valid_token(scope)
            .await
            .map_err(Error::middleware)?;
        let value = token.to_bearer_header().ok_or_else(|| {
            Error::middleware(TokenError::InvalidHeader {
                scope: scope.to_owned(),
            })
        })?;
        req.headers_mut().insert(header::AUTHORIZATION, value);
        Ok(token)
    }
}

#[async_trait::async_trait]
impl<P> Middleware for ScopedTokenMiddleware<P>
where
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if !self.predicate.eval(&req) || req.headers().contains_key(header::AUTHORIZATION) {
            return next.run(req, extensions).await;
        }

        let scope = extensions
            .get::<Scope>()
            .cloned()
            .unwrap_or_else(|| self.scope.clone());

        let token = self.authorize(&mut req, &scope).await?;
        let retry = req.try_clone();

        let resp = next.clone().run(req, extensions).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let Some(mut retry) = retry else {
            tracing::debug!(%scope, "token rejected, but request cannot be replayed");
            return Ok(resp);
        };

        tracing::warn!(%scope, "token rejected downstream, replacing it and retrying once");
        self.provider.invalidate_rejected(&scope, &token);
        self.authorize(&mut retry, &scope).await?;

        let resp = next.run(retry, extensions).await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            tracing::error!(%scope, "freshly obtained token rejected downstream");
        }

        Ok(resp)
    }
}

/// Only attach a token if the request is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "scheme",
                    req.url().scheme().to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only attach a token if the request is being sent to the exact host specified
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Construct a new predicate from a host string
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(&self.host)
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "host",
                    req.url().host_str().unwrap_or("<no host>").to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}
impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host == ")?;
        f.write_str(&self.host)
    }
}
