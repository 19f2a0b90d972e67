//! An in-memory credential store

use std::collections::HashMap;

use parking_lot::RwLock;
use tokenward_clock::{Clock, DurationSecs, System, UnixTime};

use super::CredentialStore;
use crate::{Scope, ScopeRef, TokenRecord};

/// An in-memory credential store
///
/// Records do not survive the process.
#[derive(Debug)]
pub struct MemoryCredentialStore<C = System> {
    records: RwLock<HashMap<Scope, TokenRecord>>,
    safety_margin: DurationSecs,
    clock: C,
}

impl MemoryCredentialStore<System> {
    /// Constructs an empty store that withholds records within
    /// `safety_margin` of expiry
    pub fn new(safety_margin: DurationSecs) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            safety_margin,
            clock: System,
        }
    }
}

impl<C> MemoryCredentialStore<C> {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> MemoryCredentialStore<D> {
        MemoryCredentialStore {
            records: self.records,
            safety_margin: self.safety_margin,
            clock,
        }
    }

    /// The number of records held, including stale ones
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the store holds no records at all
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl<C> CredentialStore for MemoryCredentialStore<C>
where
    C: Clock + Send + Sync + std::fmt::Debug,
{
    fn get(&self, scope: &ScopeRef) -> Option<TokenRecord> {
        let records = self.records.read();
        let record = records.get(scope)?;
        let now = self.clock.now();

        if record.is_usable_at(now, self.safety_margin) {
            Some(record.clone())
        } else {
            tracing::trace!(
                %scope,
                expires_at = record.expires_at().0,
                now = now.0,
                "cached token is within safety margin"
            );
            None
        }
    }

    fn set(&self, record: TokenRecord) {
        let scope = record.scope().to_owned();
        self.records.write().insert(scope, record);
    }

    fn clear(&self, scope: &ScopeRef) {
        self.records.write().remove(scope);
    }

    fn clear_all(&self) {
        self.records.write().clear();
    }

    fn safety_margin(&self) -> DurationSecs {
        self.safety_margin
    }

    fn now(&self) -> UnixTime {
        self.clock.now()
    }
}
