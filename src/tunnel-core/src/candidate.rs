//! Bootstrap connection candidates.
//!
//! Bundles ship with the application as one candidate per line, each line the
//! hex encoding of the candidate's JSON. Importing a bundle fills the
//! datastore so the engine has something to dial on first launch.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::datastore::CandidateStore;
use crate::notice::NoticeSink;

/// Current version of [`ExchangePayload`].
pub const EXCHANGE_PAYLOAD_VERSION: u32 = 1;

/// One reachable server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub ip_address: IpAddr,
    #[serde(default)]
    pub region: String,
    /// Transport protocols the server offers
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Higher versions supersede stored copies
    #[serde(default)]
    pub configuration_version: u32,
    /// Where this entry came from ("EMBEDDED", "EXCHANGED", ...)
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub local_timestamp: Option<DateTime<Utc>>,
}

impl Candidate {
    /// Bundle line encoding.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self).context("serializing candidate")?;
        Ok(hex::encode(json))
    }

    pub fn decode(line: &str) -> Result<Self> {
        let json = hex::decode(line.trim()).context("candidate line is not hex")?;
        serde_json::from_slice(&json).context("candidate line is not a valid candidate")
    }
}

/// Candidates bundled with the application.
#[derive(Debug, Clone, Default)]
pub struct CandidateBundle {
    pub contents: String,
    /// Read at import time; takes precedence over `contents`
    pub filename: Option<PathBuf>,
}

impl CandidateBundle {
    pub fn inline(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            filename: None,
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            contents: String::new(),
            filename: Some(path.into()),
        }
    }

    /// Encode candidates into bundle form.
    pub fn from_candidates(candidates: &[Candidate]) -> Result<Self> {
        let lines = candidates
            .iter()
            .map(Candidate::encode)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::inline(lines.join("\n")))
    }

    fn read(&self) -> Result<String> {
        match &self.filename {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("reading candidate bundle {}", path.display())),
            None => Ok(self.contents.clone()),
        }
    }

    /// Decode every line. A single bad line fails the whole bundle.
    pub fn decode(&self) -> Result<Vec<Candidate>> {
        self.read()?
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                Candidate::decode(line).with_context(|| format!("bundle line {}", n + 1))
            })
            .collect()
    }
}

/// Result of one import run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOutcome {
    pub stored: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

/// Candidates written per datastore transaction during an import.
pub const IMPORT_BATCH_SIZE: usize = 256;

/// Load a bundle into the store.
///
/// Existing entries are kept unless the bundled copy has a newer
/// `configuration_version`. Entries are written in batches of
/// [`IMPORT_BATCH_SIZE`]; cancellation is checked between batches and ends
/// the import early without error. Blocking; run it off the async workers.
pub fn import_embedded_candidates(
    cancel: &CancellationToken,
    store: &dyn CandidateStore,
    bundle: &CandidateBundle,
    notices: &NoticeSink,
) -> Result<ImportOutcome> {
    let mut pending = bundle.decode()?;
    let mut versions: HashMap<String, u32> = store
        .candidates()?
        .into_iter()
        .map(|c| (c.id, c.configuration_version))
        .collect();
    let mut outcome = ImportOutcome::default();

    while !pending.is_empty() {
        if cancel.is_cancelled() {
            outcome.cancelled = true;
            break;
        }

        let take = pending.len().min(IMPORT_BATCH_SIZE);
        let now = Utc::now();
        let mut batch = Vec::with_capacity(take);
        for mut candidate in pending.drain(..take) {
            let replace = versions
                .get(&candidate.id)
                .map_or(true, |&stored| candidate.configuration_version > stored);
            if !replace {
                outcome.skipped += 1;
                continue;
            }
            versions.insert(candidate.id.clone(), candidate.configuration_version);
            if candidate.source.is_empty() {
                candidate.source = "EMBEDDED".to_string();
            }
            candidate.local_timestamp = Some(now);
            batch.push(candidate);
        }

        if batch.is_empty() {
            continue;
        }
        let count = batch.len();
        store
            .store_candidates(batch)
            .context("storing imported candidates")?;
        outcome.stored += count;
    }

    if outcome.cancelled {
        debug!(stored = outcome.stored, "candidate import interrupted");
    } else {
        info!(
            stored = outcome.stored,
            skipped = outcome.skipped,
            "candidate import complete"
        );
    }
    notices.candidate_import(outcome.stored, outcome.skipped, outcome.cancelled);
    Ok(outcome)
}

/// A candidate handed from one client to another, plus the metadata the
/// receiver needs to decide whether to trust it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangePayload {
    pub version: u32,
    pub candidate: Candidate,
    /// Network the exporting client saw the candidate work on
    pub network_id: String,
    pub exported_at: DateTime<Utc>,
}

impl ExchangePayload {
    pub fn new(candidate: Candidate, network_id: impl Into<String>) -> Self {
        Self {
            version: EXCHANGE_PAYLOAD_VERSION,
            candidate,
            network_id: network_id.into(),
            exported_at: Utc::now(),
        }
    }

    /// Opaque text form (base64 of the JSON document).
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self).context("serializing exchange payload")?;
        Ok(STANDARD.encode(json))
    }

    pub fn decode(payload: &str) -> Result<Self> {
        let json = STANDARD
            .decode(payload.trim())
            .context("exchange payload is not base64")?;
        let decoded: Self =
            serde_json::from_slice(&json).context("exchange payload is malformed")?;
        if decoded.version != EXCHANGE_PAYLOAD_VERSION {
            bail!("unsupported exchange payload version {}", decoded.version);
        }
        Ok(decoded)
    }
}

/// Export the best stored candidate, or `None` when the store is empty.
pub fn export_exchange_payload(
    store: &dyn CandidateStore,
    network_id: &str,
) -> Result<Option<String>> {
    match store.candidates()?.into_iter().next() {
        Some(candidate) => Ok(Some(ExchangePayload::new(candidate, network_id).encode()?)),
        None => Ok(None),
    }
}

/// Store an exchanged candidate, moving it to the front when `prioritize`.
pub fn import_exchange_payload(
    store: &dyn CandidateStore,
    payload: &str,
    prioritize: bool,
) -> Result<Candidate> {
    let mut candidate = ExchangePayload::decode(payload)?.candidate;
    candidate.source = "EXCHANGED".to_string();
    candidate.local_timestamp = Some(Utc::now());
    store.store_candidate(candidate.clone())?;
    if prioritize {
        store.promote_candidate(&candidate.id)?;
    }
    Ok(candidate)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::datastore::FileDataStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn candidate(id: &str, version: u32) -> Candidate {
        Candidate {
            id: id.to_string(),
            ip_address: "192.0.2.10".parse().unwrap(),
            region: "NL".into(),
            capabilities: vec!["QUIC".into(), "SSH".into()],
            configuration_version: version,
            source: String::new(),
            local_timestamp: None,
        }
    }

    #[test]
    fn bundle_line_format() {
        let c = candidate("a", 1);
        let line = c.encode().unwrap();
        assert!(line.chars().all(|ch| ch.is_ascii_hexdigit()));
        let json = String::from_utf8(hex::decode(&line).unwrap()).unwrap();
        assert!(json.contains("\"ip_address\":\"192.0.2.10\""));
        assert_eq!(Candidate::decode(&line).unwrap(), c);
    }

    #[test]
    fn bundle_skips_blank_lines_and_rejects_bad_ones() {
        let good = candidate("a", 1).encode().unwrap();
        let bundle = CandidateBundle::inline(format!("\n{good}\n   \n{good}\n"));
        assert_eq!(bundle.decode().unwrap().len(), 2);

        let bundle = CandidateBundle::inline(format!("{good}\nzz-not-hex\n"));
        let err = bundle.decode().unwrap_err();
        assert!(format!("{err:#}").contains("bundle line 2"));
    }

    #[test]
    fn bad_ip_address_rejected() {
        let line = hex::encode(r#"{"id":"x","ip_address":"not-an-ip"}"#);
        assert!(Candidate::decode(&line).is_err());
    }

    #[test]
    fn bundle_file_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.txt");
        let encoded = CandidateBundle::from_candidates(&[candidate("f", 1)]).unwrap();
        std::fs::write(&path, &encoded.contents).unwrap();

        let bundle = CandidateBundle {
            contents: "garbage".into(),
            filename: Some(path),
        };
        let decoded = bundle.decode().unwrap();
        assert_eq!(decoded[0].id, "f");

        assert!(CandidateBundle::file(dir.path().join("missing")).decode().is_err());
    }

    #[test]
    fn import_respects_configuration_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDataStore::open(dir.path()).unwrap();
        store.store_candidate(candidate("a", 5)).unwrap();
        store.store_candidate(candidate("b", 1)).unwrap();

        let bundle =
            CandidateBundle::from_candidates(&[candidate("a", 5), candidate("b", 2), candidate("c", 1)])
                .unwrap();
        let outcome = import_embedded_candidates(
            &CancellationToken::new(),
            &store,
            &bundle,
            &NoticeSink::new(),
        )
        .unwrap();

        assert_eq!(outcome, ImportOutcome { stored: 2, skipped: 1, cancelled: false });
        assert_eq!(store.candidate("b").unwrap().unwrap().configuration_version, 2);
        assert_eq!(store.candidate("c").unwrap().unwrap().source, "EMBEDDED");
        assert_eq!(store.candidate_count().unwrap(), 3);
    }

    /// Counts store writes; optionally cancels the import after the first batch.
    struct CountingStore {
        inner: FileDataStore,
        single_writes: AtomicUsize,
        batch_writes: AtomicUsize,
        cancel_after_batch: Option<CancellationToken>,
    }

    impl CountingStore {
        fn open(dir: &std::path::Path, cancel_after_batch: Option<CancellationToken>) -> Self {
            Self {
                inner: FileDataStore::open(dir).unwrap(),
                single_writes: AtomicUsize::new(0),
                batch_writes: AtomicUsize::new(0),
                cancel_after_batch,
            }
        }
    }

    impl CandidateStore for CountingStore {
        fn candidate_count(&self) -> Result<usize> {
            self.inner.candidate_count()
        }
        fn candidate(&self, id: &str) -> Result<Option<Candidate>> {
            self.inner.candidate(id)
        }
        fn candidates(&self) -> Result<Vec<Candidate>> {
            self.inner.candidates()
        }
        fn store_candidate(&self, candidate: Candidate) -> Result<()> {
            self.single_writes.fetch_add(1, Ordering::SeqCst);
            self.inner.store_candidate(candidate)
        }
        fn store_candidates(&self, candidates: Vec<Candidate>) -> Result<()> {
            self.batch_writes.fetch_add(1, Ordering::SeqCst);
            self.inner.store_candidates(candidates)?;
            if let Some(cancel) = &self.cancel_after_batch {
                cancel.cancel();
            }
            Ok(())
        }
        fn promote_candidate(&self, id: &str) -> Result<bool> {
            self.inner.promote_candidate(id)
        }
        fn put_session(&self, scope: &str, record: Vec<u8>, expires_at: DateTime<Utc>) -> Result<()> {
            self.inner.put_session(scope, record, expires_at)
        }
        fn get_session(&self, scope: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get_session(scope)
        }
        fn delete_session(&self, scope: &str) -> Result<()> {
            self.inner.delete_session(scope)
        }
        fn close(&self) -> Result<()> {
            self.inner.close()
        }
    }

    fn numbered_bundle(n: usize) -> CandidateBundle {
        let candidates: Vec<_> = (0..n).map(|i| candidate(&format!("c{i}"), 1)).collect();
        CandidateBundle::from_candidates(&candidates).unwrap()
    }

    #[test]
    fn import_writes_once_per_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = CountingStore::open(dir.path(), None);
        let total = 2 * IMPORT_BATCH_SIZE + 1;

        let outcome = import_embedded_candidates(
            &CancellationToken::new(),
            &store,
            &numbered_bundle(total),
            &NoticeSink::new(),
        )
        .unwrap();

        assert_eq!(outcome.stored, total);
        assert_eq!(store.batch_writes.load(Ordering::SeqCst), 3);
        assert_eq!(store.single_writes.load(Ordering::SeqCst), 0);
        assert_eq!(store.candidate_count().unwrap(), total);

        // a second pass skips everything and writes nothing
        let again = import_embedded_candidates(
            &CancellationToken::new(),
            &store,
            &numbered_bundle(total),
            &NoticeSink::new(),
        )
        .unwrap();
        assert_eq!(again, ImportOutcome { stored: 0, skipped: total, cancelled: false });
        assert_eq!(store.batch_writes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn import_stops_between_batches_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let store = CountingStore::open(dir.path(), Some(cancel.clone()));

        let outcome = import_embedded_candidates(
            &cancel,
            &store,
            &numbered_bundle(3 * IMPORT_BATCH_SIZE),
            &NoticeSink::new(),
        )
        .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.stored, IMPORT_BATCH_SIZE);
        assert_eq!(store.candidate_count().unwrap(), IMPORT_BATCH_SIZE);
    }

    #[test]
    fn duplicate_ids_in_bundle_keep_the_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDataStore::open(dir.path()).unwrap();
        let bundle =
            CandidateBundle::from_candidates(&[candidate("d", 2), candidate("d", 1), candidate("d", 3)])
                .unwrap();
        let outcome =
            import_embedded_candidates(&CancellationToken::new(), &store, &bundle, &NoticeSink::new())
                .unwrap();
        assert_eq!(outcome, ImportOutcome { stored: 2, skipped: 1, cancelled: false });
        assert_eq!(store.candidate_count().unwrap(), 1);
        assert_eq!(store.candidate("d").unwrap().unwrap().configuration_version, 3);
    }

    #[test]
    fn cancelled_import_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDataStore::open(dir.path()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let bundle = CandidateBundle::from_candidates(&[candidate("a", 1)]).unwrap();
        let outcome =
            import_embedded_candidates(&cancel, &store, &bundle, &NoticeSink::new()).unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.stored, 0);
        assert_eq!(store.candidate_count().unwrap(), 0);
    }

    #[test]
    fn exchange_payload_import_prioritizes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDataStore::open(dir.path()).unwrap();
        store.store_candidate(candidate("old", 1)).unwrap();

        let payload = ExchangePayload::new(candidate("new", 1), "WIFI-1").encode().unwrap();
        let imported = import_exchange_payload(&store, &payload, true).unwrap();
        assert_eq!(imported.source, "EXCHANGED");
        assert_eq!(store.candidates().unwrap()[0].id, "new");

        let exported = export_exchange_payload(&store, "WIFI-1").unwrap().unwrap();
        let decoded = ExchangePayload::decode(&exported).unwrap();
        assert_eq!(decoded.candidate.id, "new");
        assert_eq!(decoded.network_id, "WIFI-1");
    }

    #[test]
    fn exchange_payload_rejects_garbage_and_other_versions() {
        assert!(ExchangePayload::decode("%%%").is_err());

        let mut payload = ExchangePayload::new(candidate("x", 1), "n");
        payload.version = 99;
        let json = serde_json::to_vec(&payload).unwrap();
        assert!(ExchangePayload::decode(&STANDARD.encode(json)).is_err());
    }
}
