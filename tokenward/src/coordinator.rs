//! Coalescing of concurrent refreshes
//!
//! At most one refresh is in flight per scope. Callers that find a refresh
//! already pending await the same shared result instead of starting another
//! exchange. The refresh itself runs on a spawned task, so a caller that gives
//! up waiting never cancels it for the others.
//!
//! The pending map is locked only to update the store's in-memory state.
//! Writes to the store's backing medium happen after the lock is released,
//! on tokio's blocking pool.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use thiserror::Error;
use tokenward_clock::UnixTime;
use tracing::Instrument;

use crate::{
    chain::AcquireError, store::CredentialStore, AccessTokenRef, AsyncTokenSource, Scope,
    ScopeRef, TokenRecord,
};

/// A refresh failed to produce a token
#[derive(Clone, Debug, Error)]
pub enum RefreshError {
    /// Every strategy failed
    #[error(transparent)]
    Exhausted(#[from] AcquireError),
    /// The refresh task ended without producing a result
    #[error("token refresh for scope `{scope}` was aborted")]
    Aborted {
        /// The scope being refreshed
        scope: Scope,
    },
    /// The source produced a token that the store would withhold
    #[error("token obtained for scope `{scope}` expires within the safety margin")]
    WithinMargin {
        /// The scope being refreshed
        scope: Scope,
        /// When the withheld token expires
        expires_at: UnixTime,
    },
}

type SharedRefresh = Shared<BoxFuture<'static, Result<TokenRecord, RefreshError>>>;

struct Pending {
    generation: u64,
    refresh: SharedRefresh,
}

struct Inner {
    source: Arc<dyn AsyncTokenSource>,
    store: Arc<dyn CredentialStore>,
    pending: Mutex<HashMap<Scope, Pending>>,
    next_generation: AtomicU64,
}

/// Deregisters a pending refresh when its task ends, however it ends
struct Registration {
    inner: Arc<Inner>,
    scope: Scope,
    generation: u64,
}

impl Registration {
    /// Caches a successful result and deregisters in one critical section
    ///
    /// Returns whether the store was changed.
    fn settle(&self, result: &Result<TokenRecord, RefreshError>) -> bool {
        let removed = {
            let mut pending = self.inner.pending.lock();
            if !self.is_current(&pending) {
                tracing::debug!("refresh was superseded by an invalidation; result not cached");
                return false;
            }

            if let Ok(record) = result {
                self.inner.store.set(record.clone());
            }
            pending.remove(&self.scope)
        };

        tracing::trace!(success = result.is_ok(), "refresh settled");
        drop(removed);
        result.is_ok()
    }

    fn is_current(&self, pending: &HashMap<Scope, Pending>) -> bool {
        pending
            .get(&self.scope)
            .map_or(false, |p| p.generation == self.generation)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let removed = {
            let mut pending = self.inner.pending.lock();
            if self.is_current(&pending) {
                pending.remove(&self.scope)
            } else {
                None
            }
        };

        if removed.is_some() {
            tracing::warn!(scope = %self.scope, "refresh ended without settling; deregistered");
        }
    }
}

/// Ensures at most one refresh per scope is in flight
///
/// Successful refreshes are written to the [`CredentialStore`] before the
/// pending refresh is deregistered, so a caller never observes the gap
/// between the two.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    /// Constructs a coordinator refreshing from `source` into `store`
    pub fn new(source: Arc<dyn AsyncTokenSource>, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                store,
                pending: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Gets a fresh token for `scope`, joining any refresh already in flight
    ///
    /// Must be called from within a tokio runtime.
    pub async fn get_or_fetch(&self, scope: &ScopeRef) -> Result<TokenRecord, RefreshError> {
        let refresh = {
            let mut pending = self.inner.pending.lock();
            if let Some(existing) = pending.get(scope) {
                tracing::trace!(%scope, generation = existing.generation, "joining in-flight refresh");
                existing.refresh.clone()
            } else if let Some(record) = self.inner.store.get(scope) {
                tracing::trace!(%scope, "refresh settled before this caller registered");
                return Ok(record);
            } else {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%scope, generation, "starting refresh");
                let refresh = self.spawn_refresh(scope.to_owned(), generation);
                pending.insert(
                    scope.to_owned(),
                    Pending {
                        generation,
                        refresh: refresh.clone(),
                    },
                );
                refresh
            }
        };

        refresh.await
    }

    /// Spawns the refresh task
    ///
    /// Called with the pending map locked; the task cannot settle before the
    /// caller has registered it.
    fn spawn_refresh(&self, scope: Scope, generation: u64) -> SharedRefresh {
        let span = tracing::debug_span!("refresh", %scope, generation);
        let registration = Registration {
            inner: Arc::clone(&self.inner),
            scope: scope.clone(),
            generation,
        };

        let task = tokio::spawn(
            async move {
                let inner = &registration.inner;
                let result = match inner.source.request_token(&registration.scope).await {
                    Ok(record) if !inner.store.admits(&record) => {
                        tracing::error!(
                            expires_at = record.expires_at().0,
                            safety_margin = inner.store.safety_margin().0,
                            "source produced a token that expires within the safety margin"
                        );
                        Err(RefreshError::WithinMargin {
                            scope: registration.scope.clone(),
                            expires_at: record.expires_at(),
                        })
                    }
                    Ok(record) => Ok(record),
                    Err(error) => Err(RefreshError::from(error)),
                };

                if registration.settle(&result) {
                    flush(&inner.store).await;
                }
                result
            }
            .instrument(span),
        );

        async move {
            match task.await {
                Ok(result) => result,
                Err(error) => {
                    tracing::error!(
                        %scope,
                        error = (&error as &dyn std::error::Error),
                        "token refresh task failed"
                    );
                    Err(RefreshError::Aborted { scope })
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Clears the cached record and abandons any pending refresh for `scope`
    ///
    /// Callers already awaiting an abandoned refresh still receive its result,
    /// but that result is not cached. The next caller starts a new refresh.
    pub fn invalidate(&self, scope: &ScopeRef) {
        let abandoned = {
            let mut pending = self.inner.pending.lock();
            self.inner.store.clear(scope);
            pending.remove(scope)
        };

        flush_detached(&self.inner.store);
        if let Some(abandoned) = abandoned {
            tracing::debug!(%scope, generation = abandoned.generation, "abandoned in-flight refresh");
        }
    }

    /// Clears the cached record for `scope` only if it still holds `rejected`
    ///
    /// Nothing is cleared if the record has already been replaced or a refresh
    /// is already in flight; such a refresh started after `rejected` was
    /// handed out. Callers that were all turned away with the same token
    /// therefore cause a single replacement exchange between them.
    ///
    /// Returns whether a record was cleared.
    pub fn invalidate_if(&self, scope: &ScopeRef, rejected: &AccessTokenRef) -> bool {
        let cleared = {
            let pending = self.inner.pending.lock();
            if let Some(existing) = pending.get(scope) {
                tracing::trace!(%scope, generation = existing.generation, "replacement already in flight");
                false
            } else if self
                .inner
                .store
                .get(scope)
                .map_or(false, |record| record.value().as_str() == rejected.as_str())
            {
                self.inner.store.clear(scope);
                true
            } else {
                tracing::trace!(%scope, "rejected token already replaced");
                false
            }
        };

        if cleared {
            flush_detached(&self.inner.store);
            tracing::debug!(%scope, "cleared rejected token");
        }
        cleared
    }

    /// Clears every cached record and abandons every pending refresh
    pub fn invalidate_all(&self) {
        let abandoned: Vec<_> = {
            let mut pending = self.inner.pending.lock();
            self.inner.store.clear_all();
            pending.drain().collect()
        };

        flush_detached(&self.inner.store);

        tracing::debug!(abandoned = abandoned.len(), "abandoned all in-flight refreshes");
    }

    /// Whether a refresh is currently in flight for `scope`
    pub fn is_pending(&self, scope: &ScopeRef) -> bool {
        self.inner.pending.lock().contains_key(scope)
    }

    /// The store refreshed tokens are written to
    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.inner.store
    }
}

/// Writes the store's changes to its backing medium off the async workers
async fn flush(store: &Arc<dyn CredentialStore>) {
    let store = Arc::clone(store);
    if let Err(error) = tokio::task::spawn_blocking(move || store.flush()).await {
        tracing::warn!(
            error = (&error as &dyn std::error::Error),
            "credential store flush did not complete"
        );
    }
}

/// Like [`flush`], for callers that cannot wait
///
/// Outside of a tokio runtime the flush happens inline.
fn flush_detached(store: &Arc<dyn CredentialStore>) {
    let store = Arc::clone(store);
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => drop(handle.spawn_blocking(move || store.flush())),
        Err(_) => store.flush(),
    }
}

impl fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let pending: Vec<Scope> = self.inner.pending.lock().keys().cloned().collect();
        f.debug_struct("RefreshCoordinator")
            .field("source", &self.inner.source)
            .field("store", &self.inner.store)
            .field("pending", &pending)
            .finish()
    }
}
