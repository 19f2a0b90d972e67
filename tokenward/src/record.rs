//! Cached token records and their validity rule
//!
//! A record is usable only while `now + margin < expires_at`.

use serde::{Deserialize, Serialize};
use tokenward_clock::{Clock, DurationSecs, UnixTime};

use crate::{AccessToken, AccessTokenRef, Scope, ScopeRef};

/// A bearer token cached for a single scope
///
/// The record is only usable while `now < expires_at - safety_margin`. A
/// persisted record that lacks an expiry, or whose expiry cannot be parsed,
/// fails to deserialize and is therefore never observed as usable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    scope: Scope,
    value: AccessToken,
    issued_at: UnixTime,
    expires_at: UnixTime,
}

/// A record's lifecycle status relative to a safety margin
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The record can be handed out
    Usable,
    /// The record is still valid, but too close to expiry to be handed out
    WithinMargin,
    /// The record is no longer valid
    Expired,
}

impl TokenRecord {
    /// Constructs a record from its parts
    pub fn new(
        scope: Scope,
        value: AccessToken,
        issued_at: UnixTime,
        expires_at: UnixTime,
    ) -> Self {
        Self {
            scope,
            value,
            issued_at,
            expires_at,
        }
    }

    /// Constructs a record issued now according to `clock`, valid for `lifetime`
    pub fn issued_now<C: Clock>(
        clock: &C,
        scope: &ScopeRef,
        value: &AccessTokenRef,
        lifetime: DurationSecs,
    ) -> Self {
        let issued_at = clock.now();
        Self::new(
            scope.to_owned(),
            value.to_owned(),
            issued_at,
            issued_at + lifetime,
        )
    }

    /// The scope this record was issued for
    #[inline]
    pub fn scope(&self) -> &ScopeRef {
        &self.scope
    }

    /// The bearer value
    #[inline]
    pub fn value(&self) -> &AccessTokenRef {
        &self.value
    }

    /// Consumes the record, returning the bearer value
    #[inline]
    pub fn into_value(self) -> AccessToken {
        self.value
    }

    /// The time the record was issued
    #[inline]
    pub fn issued_at(&self) -> UnixTime {
        self.issued_at
    }

    /// The time the record expires
    #[inline]
    pub fn expires_at(&self) -> UnixTime {
        self.expires_at
    }

    /// The full validity period of the record
    #[inline]
    pub fn lifetime(&self) -> DurationSecs {
        self.expires_at - self.issued_at
    }

    /// How much longer the record is valid as of `time`, ignoring any margin
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> DurationSecs {
        self.expires_at - time
    }

    /// The record's status as of `time` given `margin`
    #[inline]
    pub fn status_at(&self, time: UnixTime, margin: DurationSecs) -> TokenStatus {
        if time >= self.expires_at {
            TokenStatus::Expired
        } else if time + margin >= self.expires_at {
            TokenStatus::WithinMargin
        } else {
            TokenStatus::Usable
        }
    }

    /// The record's status according to `clock`
    #[inline]
    pub fn status_with_clock<C: Clock>(&self, clock: &C, margin: DurationSecs) -> TokenStatus {
        self.status_at(clock.now(), margin)
    }

    /// Whether the record may be handed out at `time`
    #[inline]
    pub fn is_usable_at(&self, time: UnixTime, margin: DurationSecs) -> bool {
        matches!(self.status_at(time, margin), TokenStatus::Usable)
    }
}
