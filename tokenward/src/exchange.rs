//! A client for token exchange endpoints
//!
//! Each call to [`TokenExchangeClient::exchange`] performs exactly one round
//! trip. Failures are classified by [`FailureKind`] so that a
//! [`FallbackChain`][crate::FallbackChain] can report why each strategy failed.

use std::{fmt, marker::PhantomData};

use reqwest::{StatusCode, Url};
use serde::Serialize;
use thiserror::Error;
use tokenward_clock::{Clock, System};

use crate::{ScopeRef, TokenRecord};

pub mod dto;

/// An error while exchanging credential material for a token
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The strategy's credential material is not currently available
    #[error("credential material unavailable: {0}")]
    Unavailable(&'static str),
    /// Unable to send a request to or read a response from the authority
    #[error("error communicating with token authority")]
    Transport(#[source] reqwest::Error),
    /// The authority failed in a way that may succeed on a later attempt
    #[error("token authority unavailable ({status}): {body}")]
    Server {
        /// The response status
        status: StatusCode,
        /// The body of the error
        body: String,
    },
    /// The authority rejected the credential material
    #[error("token authority rejected credentials ({status}): {body}")]
    Rejected {
        /// The response status
        status: StatusCode,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the token body
    #[error("error deserializing token body from authority")]
    Malformed(#[from] serde_json::Error),
    /// The token body was well-formed but unusable
    #[error("unusable token from authority: {0}")]
    InvalidToken(&'static str),
}

/// How a failed exchange should be interpreted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// A network or server-side failure; the same material may work later
    Transient,
    /// The material was rejected, or the response was unusable
    Rejected,
    /// The material was not present, so no request was made
    Unavailable,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transient => "transient",
            Self::Rejected => "rejected",
            Self::Unavailable => "unavailable",
        })
    }
}

impl ExchangeError {
    /// Classifies the failure
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Unavailable(_) => FailureKind::Unavailable,
            Self::Transport(_) | Self::Server { .. } => FailureKind::Transient,
            Self::Rejected { .. } | Self::Malformed(_) | Self::InvalidToken(_) => {
                FailureKind::Rejected
            }
        }
    }

    fn from_status(status: StatusCode, body: String) -> Self {
        if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            Self::Server { status, body }
        } else {
            Self::Rejected { status, body }
        }
    }
}

/// A manner of attaching a serializable payload to a request
pub trait RequestType {
    /// Attaches the serializable payload to the request body
    fn attach_payload<S: Serialize + ?Sized>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder;
}

/// Attaches credentials to the request body as JSON
#[derive(Debug)]
pub struct JsonBody;

/// Attaches credentials to the request body as URL-encoded form data
#[derive(Debug)]
pub struct FormBody;

impl RequestType for JsonBody {
    fn attach_payload<S: Serialize + ?Sized>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder {
        request.json(payload)
    }
}

impl RequestType for FormBody {
    fn attach_payload<S: Serialize + ?Sized>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder {
        request.form(payload)
    }
}

/// A client bound to a single token endpoint
#[derive(Debug)]
pub struct TokenExchangeClient<C = System, T = JsonBody> {
    client: reqwest::Client,
    token_url: Url,
    clock: C,
    content_type: PhantomData<fn() -> T>,
}

impl<C: Clone, T> Clone for TokenExchangeClient<C, T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            token_url: self.token_url.clone(),
            clock: self.clock.clone(),
            content_type: PhantomData,
        }
    }
}

impl TokenExchangeClient<System, JsonBody> {
    /// Constructs a new client that sends JSON payloads to `token_url`
    pub fn new(client: reqwest::Client, token_url: Url) -> Self {
        Self {
            client,
            token_url,
            clock: System,
            content_type: PhantomData,
        }
    }
}

impl<C, T> TokenExchangeClient<C, T> {
    /// Configures the client to send credentials to the authority as form data
    pub fn using_form_data(self) -> TokenExchangeClient<C, FormBody> {
        TokenExchangeClient {
            client: self.client,
            token_url: self.token_url,
            clock: self.clock,
            content_type: PhantomData,
        }
    }

    /// Sets a custom clock to be used when stamping issued tokens
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> TokenExchangeClient<D, T> {
        TokenExchangeClient {
            client: self.client,
            token_url: self.token_url,
            clock,
            content_type: PhantomData,
        }
    }

    /// The endpoint this client exchanges credentials with
    pub fn token_url(&self) -> &Url {
        &self.token_url
    }
}

impl<C: Clock, T: RequestType> TokenExchangeClient<C, T> {
    /// Exchanges `payload` for a token scoped to `scope`
    #[tracing::instrument(
        skip(self, payload),
        fields(token_url = %self.token_url),
    )]
    pub async fn exchange<P>(
        &self,
        strategy: &str,
        scope: &ScopeRef,
        payload: &P,
    ) -> Result<TokenRecord, ExchangeError>
    where
        P: Serialize + ?Sized,
    {
        tracing::trace!("requesting token from authority");

        let req = T::attach_payload(self.client.post(self.token_url.clone()), payload);
        let resp = req.send().await.map_err(ExchangeError::Transport)?;
        let status = resp.status();

        tracing::debug!(
            response.status = status.as_u16(),
            "received token response from issuing authority"
        );

        if !status.is_success() {
            let body = match resp.text().await {
                Ok(body) => body,
                Err(error) => {
                    tracing::debug!(
                        error = (&error as &dyn std::error::Error),
                        "unable to read error body"
                    );
                    String::new()
                }
            };
            return Err(ExchangeError::from_status(status, body));
        }

        let body = resp.bytes().await.map_err(ExchangeError::Transport)?;
        let resp: dto::TokenResponse = serde_json::from_slice(&body)?;
        let record = resp.into_record(&self.clock, scope)?;

        tracing::info!(
            lifetime = record.lifetime().0,
            expires_at = record.expires_at().0,
            "received new token"
        );

        Ok(record)
    }
}
