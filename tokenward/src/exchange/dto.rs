//! DTOs for interacting with token exchange endpoints

use serde::{Deserialize, Serialize};
use tokenward_clock::{Clock, DurationSecs, UnixTime};

use super::ExchangeError;
use crate::{
    AccessToken, AppKeyRef, AppSecretRef, ClientIdRef, ClientSecretRef, DelegatedTokenRef,
    ScopeRef, TokenRecord,
};

/// The grant type used to exchange a delegated bearer value
pub const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

/// Absolute expiries past this point are taken to be in milliseconds
///
/// This is in the year 5138 as seconds, but early 1973 as milliseconds.
const LATEST_PLAUSIBLE_EXPIRY: UnixTime = UnixTime(100_000_000_000);

/// An application client-secret exchange
#[derive(Debug, Serialize)]
pub struct ClientCredentialsRequest<'a> {
    grant_type: &'static str,
    client_id: &'a ClientIdRef,
    client_secret: &'a ClientSecretRef,
    scope: &'a ScopeRef,
}

impl<'a> ClientCredentialsRequest<'a> {
    /// Constructs a request for `scope`
    pub fn new(
        client_id: &'a ClientIdRef,
        client_secret: &'a ClientSecretRef,
        scope: &'a ScopeRef,
    ) -> Self {
        Self {
            grant_type: "client_credentials",
            client_id,
            client_secret,
            scope,
        }
    }
}

/// An exchange of a user's delegated bearer value for a scoped token
#[derive(Debug, Serialize)]
pub struct DelegatedExchangeRequest<'a> {
    grant_type: &'static str,
    subject_token: &'a DelegatedTokenRef,
    subject_token_type: &'static str,
    scope: &'a ScopeRef,
}

impl<'a> DelegatedExchangeRequest<'a> {
    /// Constructs a request for `scope`
    pub fn new(subject_token: &'a DelegatedTokenRef, scope: &'a ScopeRef) -> Self {
        Self {
            grant_type: TOKEN_EXCHANGE_GRANT,
            subject_token,
            subject_token_type: ACCESS_TOKEN_TYPE,
            scope,
        }
    }
}

/// A legacy application key exchange
#[derive(Debug, Serialize)]
pub struct LegacyKeyRequest<'a> {
    app_key: &'a AppKeyRef,
    app_secret: &'a AppSecretRef,
    scope: &'a ScopeRef,
}

impl<'a> LegacyKeyRequest<'a> {
    /// Constructs a request for `scope`
    pub fn new(app_key: &'a AppKeyRef, app_secret: &'a AppSecretRef, scope: &'a ScopeRef) -> Self {
        Self {
            app_key,
            app_secret,
            scope,
        }
    }
}

/// A successful token response
///
/// Authorities differ in how they name the token and report its lifetime,
/// so both `access_token`/`token` and `expires_in`/`expires_at` are accepted.
/// `expires_in` is in seconds from now and `expires_at` in seconds since the
/// Unix epoch; an `expires_at` that can only be milliseconds is refused.
#[derive(Debug, Deserialize)]
pub(super) struct TokenResponse {
    #[serde(alias = "token")]
    pub access_token: AccessToken,
    #[serde(default)]
    pub expires_in: Option<DurationSecs>,
    #[serde(default, alias = "expiresAt")]
    pub expires_at: Option<UnixTime>,
}

impl TokenResponse {
    pub(super) fn into_record<C: Clock>(
        self,
        clock: &C,
        scope: &ScopeRef,
    ) -> Result<TokenRecord, ExchangeError> {
        if self.access_token.as_str().is_empty() {
            return Err(ExchangeError::InvalidToken("empty token value"));
        }

        let issued_at = clock.now();
        let expires_at = self
            .expires_at
            .or_else(|| self.expires_in.map(|lifetime| issued_at + lifetime))
            .ok_or(ExchangeError::InvalidToken("no expiry reported"))?;

        if expires_at > LATEST_PLAUSIBLE_EXPIRY {
            return Err(ExchangeError::InvalidToken("expiry is not in Unix seconds"));
        }

        if expires_at <= issued_at {
            return Err(ExchangeError::InvalidToken("token expires before it was issued"));
        }

        Ok(TokenRecord::new(
            scope.to_owned(),
            self.access_token,
            issued_at,
            expires_at,
        ))
    }
}
