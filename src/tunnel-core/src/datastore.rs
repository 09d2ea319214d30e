//! Persistent candidate and session-resumption store.
//!
//! The engine coordinator opens one store per engine lifetime and closes it
//! only after every task that touches it has finished. [`FileDataStore`]
//! keeps everything in one JSON document, rewritten atomically on change.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::candidate::Candidate;
use crate::config::Config;

const DATASTORE_FILE: &str = "datastore.json";

pub trait CandidateStore: Send + Sync {
    fn candidate_count(&self) -> Result<usize>;

    fn candidate(&self, id: &str) -> Result<Option<Candidate>>;

    /// Candidates in dial priority order.
    fn candidates(&self) -> Result<Vec<Candidate>>;

    /// Insert or replace by id. Replacing keeps the entry's position.
    fn store_candidate(&self, candidate: Candidate) -> Result<()>;

    /// [`CandidateStore::store_candidate`] for each entry, in order.
    /// Stores that persist on change should override this to write once.
    fn store_candidates(&self, candidates: Vec<Candidate>) -> Result<()> {
        candidates
            .into_iter()
            .try_for_each(|candidate| self.store_candidate(candidate))
    }

    /// Move a candidate to the front. Returns false if it is not stored.
    fn promote_candidate(&self, id: &str) -> Result<bool>;

    fn put_session(&self, scope: &str, record: Vec<u8>, expires_at: DateTime<Utc>) -> Result<()>;

    /// Stored record for `scope`; expired records read as absent.
    fn get_session(&self, scope: &str) -> Result<Option<Vec<u8>>>;

    fn delete_session(&self, scope: &str) -> Result<()>;

    /// Release the store. Every later call fails.
    fn close(&self) -> Result<()>;
}

/// Opens the store for a committed config.
pub trait DataStoreOpener: Send + Sync {
    fn open(&self, config: &Config) -> Result<Arc<dyn CandidateStore>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionEntry {
    #[serde(with = "b64")]
    record: Vec<u8>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    candidates: Vec<Candidate>,
    sessions: BTreeMap<String, SessionEntry>,
}

pub struct FileDataStore {
    path: PathBuf,
    /// `None` once closed
    data: Mutex<Option<StoreData>>,
}

impl FileDataStore {
    /// Open or create the store in `directory`.
    pub fn open(directory: &Path) -> Result<Self> {
        std::fs::create_dir_all(directory)
            .with_context(|| format!("creating datastore directory {}", directory.display()))?;
        let path = directory.join(DATASTORE_FILE);

        let data = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing datastore {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading datastore {}", path.display()))
            }
        };

        info!(
            path = %path.display(),
            candidates = data.candidates.len(),
            "datastore opened"
        );
        Ok(Self {
            path,
            data: Mutex::new(Some(data)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_data<T>(&self, f: impl FnOnce(&mut StoreData) -> T) -> Result<T> {
        let mut guard = self.data.lock();
        let data = guard.as_mut().ok_or_else(|| anyhow!("datastore is closed"))?;
        Ok(f(data))
    }

    /// Apply `f` to a copy and keep it only once it is on disk.
    fn with_data_persisted<T>(&self, f: impl FnOnce(&mut StoreData) -> T) -> Result<T> {
        let mut guard = self.data.lock();
        let data = guard.as_mut().ok_or_else(|| anyhow!("datastore is closed"))?;
        let mut updated = data.clone();
        let out = f(&mut updated);
        self.persist(&updated)?;
        *data = updated;
        Ok(out)
    }

    fn persist(&self, data: &StoreData) -> Result<()> {
        let json = serde_json::to_vec(data).context("serializing datastore")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

impl CandidateStore for FileDataStore {
    fn candidate_count(&self) -> Result<usize> {
        self.with_data(|d| d.candidates.len())
    }

    fn candidate(&self, id: &str) -> Result<Option<Candidate>> {
        self.with_data(|d| d.candidates.iter().find(|c| c.id == id).cloned())
    }

    fn candidates(&self) -> Result<Vec<Candidate>> {
        self.with_data(|d| d.candidates.clone())
    }

    fn store_candidate(&self, candidate: Candidate) -> Result<()> {
        self.with_data_persisted(|d| {
            match d.candidates.iter_mut().find(|c| c.id == candidate.id) {
                Some(existing) => *existing = candidate,
                None => d.candidates.push(candidate),
            }
        })
    }

    fn store_candidates(&self, candidates: Vec<Candidate>) -> Result<()> {
        if candidates.is_empty() {
            return Ok(());
        }
        let count = candidates.len();
        self.with_data_persisted(|d| {
            let mut index: HashMap<String, usize> = d
                .candidates
                .iter()
                .enumerate()
                .map(|(i, c)| (c.id.clone(), i))
                .collect();
            for candidate in candidates {
                match index.get(&candidate.id) {
                    Some(&i) => d.candidates[i] = candidate,
                    None => {
                        index.insert(candidate.id.clone(), d.candidates.len());
                        d.candidates.push(candidate);
                    }
                }
            }
        })?;
        debug!(count, "candidates stored");
        Ok(())
    }

    fn promote_candidate(&self, id: &str) -> Result<bool> {
        self.with_data_persisted(|d| match d.candidates.iter().position(|c| c.id == id) {
            Some(i) => {
                let candidate = d.candidates.remove(i);
                d.candidates.insert(0, candidate);
                true
            }
            None => false,
        })
    }

    fn put_session(&self, scope: &str, record: Vec<u8>, expires_at: DateTime<Utc>) -> Result<()> {
        self.with_data_persisted(|d| {
            d.sessions
                .insert(scope.to_string(), SessionEntry { record, expires_at });
        })
    }

    fn get_session(&self, scope: &str) -> Result<Option<Vec<u8>>> {
        let now = Utc::now();
        let (record, expired) = self.with_data(|d| match d.sessions.get(scope) {
            Some(entry) if entry.expires_at > now => (Some(entry.record.clone()), false),
            Some(_) => (None, true),
            None => (None, false),
        })?;
        if expired {
            debug!(scope, "session record expired");
            self.delete_session(scope)?;
        }
        Ok(record)
    }

    fn delete_session(&self, scope: &str) -> Result<()> {
        self.with_data_persisted(|d| {
            d.sessions.remove(scope);
        })
    }

    fn close(&self) -> Result<()> {
        let data = self
            .data
            .lock()
            .take()
            .ok_or_else(|| anyhow!("datastore is already closed"))?;
        self.persist(&data)?;
        info!(path = %self.path.display(), "datastore closed");
        Ok(())
    }
}

/// Opens a [`FileDataStore`] under the config's data root.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileDataStoreOpener;

impl DataStoreOpener for FileDataStoreOpener {
    fn open(&self, config: &Config) -> Result<Arc<dyn CandidateStore>> {
        Ok(Arc::new(FileDataStore::open(&config.datastore_directory())?))
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
