//! Persistent storage of token records, keyed by scope
//!
//! Stores are synchronous so that the cache-hit path of
//! [`TokenProvider`][crate::TokenProvider] never suspends. Every store honors
//! a safety margin: [`CredentialStore::get`] never returns a record that is
//! within the margin of its expiry.
//!
//! Changes are visible to readers as soon as they are made, but only reach a
//! backing medium on [`CredentialStore::flush`]. Flushing may block on I/O and
//! is never done while a caller holds a lock shared with other scopes.

use std::{fmt, io};

use thiserror::Error;
use tokenward_clock::{DurationSecs, UnixTime};

use crate::{ScopeRef, TokenRecord};

mod file;
mod memory;

pub use file::FileCredentialStore;
pub use memory::MemoryCredentialStore;

/// A store of token records, one per scope
pub trait CredentialStore: Send + Sync + fmt::Debug {
    /// Gets the usable record for `scope`
    ///
    /// Missing, unparsable or stale records are all reported as absent.
    fn get(&self, scope: &ScopeRef) -> Option<TokenRecord>;

    /// Replaces the record for the record's own scope
    fn set(&self, record: TokenRecord);

    /// Removes the record for `scope`, if any
    fn clear(&self, scope: &ScopeRef);

    /// Removes every record
    fn clear_all(&self);

    /// Writes changes made since the last flush to the backing medium
    ///
    /// Failures are logged, and the records remain available in memory.
    /// Stores without a backing medium have nothing to do.
    fn flush(&self) {}

    /// The margin before expiry within which records are withheld
    fn safety_margin(&self) -> DurationSecs;

    /// The current time according to the store's clock
    fn now(&self) -> UnixTime;

    /// Whether `record` would be handed out by this store right now
    fn admits(&self, record: &TokenRecord) -> bool {
        record.is_usable_at(self.now(), self.safety_margin())
    }
}

/// An error persisting records to a backing medium
///
/// These are logged by the stores rather than returned to callers; reads
/// degrade to "absent" instead of failing.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing file could not be read or written
    #[error("credential store I/O failed")]
    Io(#[from] io::Error),
    /// The backing document could not be encoded or decoded
    #[error("credential store document is malformed")]
    Format(#[from] serde_json::Error),
}
