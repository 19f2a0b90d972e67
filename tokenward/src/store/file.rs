//! A credential store persisted to a local JSON file

use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use parking_lot::{Mutex, RwLock};
use tokenward_clock::{Clock, DurationSecs, System, UnixTime};

use super::{CredentialStore, StoreError};
use crate::{Scope, ScopeRef, TokenRecord};

/// The in-memory mirror, stamped with a version on every change
#[derive(Debug, Default)]
struct Mirror {
    records: HashMap<Scope, TokenRecord>,
    version: u64,
}

/// A credential store that survives process restarts
///
/// Records are mirrored in memory, and reads never touch the disk. Changes
/// only update the mirror; [`flush`](CredentialStore::flush) rewrites the
/// whole document. A missing, unreadable or corrupt file yields an empty
/// store rather than an error, and individual entries that fail to parse or
/// have already expired are discarded on open.
#[derive(Debug)]
pub struct FileCredentialStore<C = System> {
    path: PathBuf,
    mirror: RwLock<Mirror>,
    /// The version last written to disk; held for the duration of a write
    written: Mutex<u64>,
    safety_margin: DurationSecs,
    clock: C,
}

impl FileCredentialStore<System> {
    /// Opens the store at `path`, loading any records already persisted there
    pub fn open(path: impl Into<PathBuf>, safety_margin: DurationSecs) -> Self {
        Self::open_with_clock(path, safety_margin, System)
    }
}

impl<C: Clock> FileCredentialStore<C> {
    /// Opens the store at `path` using a custom clock
    pub fn open_with_clock(path: impl Into<PathBuf>, safety_margin: DurationSecs, clock: C) -> Self {
        let path = path.into();
        let records = match load_records(&path, &clock) {
            Ok(records) => {
                tracing::debug!(path = %path.display(), records = records.len(), "loaded persisted tokens");
                records
            }
            Err(StoreError::Io(error)) if error.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no persisted tokens found");
                HashMap::new()
            }
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = (&error as &dyn std::error::Error),
                    "unable to load persisted tokens, starting empty"
                );
                HashMap::new()
            }
        };

        Self {
            path,
            mirror: RwLock::new(Mirror {
                records,
                version: 0,
            }),
            written: Mutex::new(0),
            safety_margin,
            clock,
        }
    }
}

impl<C> FileCredentialStore<C> {
    /// The path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether changes have been made that are not yet on disk
    pub fn is_dirty(&self) -> bool {
        let version = self.mirror.read().version;
        *self.written.lock() < version
    }

    fn update(&self, change: impl FnOnce(&mut HashMap<Scope, TokenRecord>) -> bool) {
        let mut mirror = self.mirror.write();
        if change(&mut mirror.records) {
            mirror.version += 1;
        }
    }
}

fn load_records<C: Clock>(
    path: &Path,
    clock: &C,
) -> Result<HashMap<Scope, TokenRecord>, StoreError> {
    let data = fs::read(path)?;
    let document: HashMap<String, serde_json::Value> = serde_json::from_slice(&data)?;
    let now = clock.now();

    let records = document
        .into_iter()
        .filter_map(|(key, value)| match serde_json::from_value::<TokenRecord>(value) {
            Ok(record) if record.scope().as_str() != key => {
                tracing::warn!(scope = %key, "discarding persisted token filed under another scope");
                None
            }
            Ok(record) if record.expires_at() <= now => {
                tracing::debug!(scope = %key, "discarding expired persisted token");
                None
            }
            Ok(record) => Some((Scope::new(key), record)),
            Err(error) => {
                tracing::warn!(
                    scope = %key,
                    error = (&error as &dyn std::error::Error),
                    "discarding corrupt persisted token"
                );
                None
            }
        })
        .collect();

    Ok(records)
}

fn write_document(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);

    let mut file_opts = OpenOptions::new();
    file_opts.create(true).truncate(true).write(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        file_opts.mode(0o600);
    }

    let mut file = file_opts.open(&staging)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&staging, path)?;
    Ok(())
}

impl<C> CredentialStore for FileCredentialStore<C>
where
    C: Clock + Send + Sync + std::fmt::Debug,
{
    fn get(&self, scope: &ScopeRef) -> Option<TokenRecord> {
        let mirror = self.mirror.read();
        mirror
            .records
            .get(scope)
            .filter(|r| r.is_usable_at(self.clock.now(), self.safety_margin))
            .cloned()
    }

    fn set(&self, record: TokenRecord) {
        self.update(|records| {
            records.insert(record.scope().to_owned(), record);
            true
        });
    }

    fn clear(&self, scope: &ScopeRef) {
        self.update(|records| records.remove(scope).is_some());
    }

    fn clear_all(&self) {
        self.update(|records| {
            let changed = !records.is_empty();
            records.clear();
            changed
        });
    }

    fn flush(&self) {
        let mut written = self.written.lock();

        let (version, data) = {
            let mirror = self.mirror.read();
            if mirror.version <= *written {
                return;
            }

            let document: BTreeMap<&str, &TokenRecord> = mirror
                .records
                .iter()
                .map(|(k, v)| (k.as_str(), v))
                .collect();
            (mirror.version, serde_json::to_vec_pretty(&document))
        };

        let result = data
            .map_err(StoreError::from)
            .and_then(|data| write_document(&self.path, &data));

        match result {
            Ok(()) => {
                tracing::trace!(path = %self.path.display(), version, "persisted tokens");
                *written = version;
            }
            Err(error) => tracing::warn!(
                path = %self.path.display(),
                error = (&error as &dyn std::error::Error),
                "unable to persist tokens; keeping them in memory only"
            ),
        }
    }

    fn safety_margin(&self) -> DurationSecs {
        self.safety_margin
    }

    fn now(&self) -> UnixTime {
        self.clock.now()
    }
}
