//! Instrumented collaborators shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use tunnel_core::candidate::{self, Candidate};
use tunnel_core::{
    CandidateBundle, CandidateStore, Config, DataStoreOpener, EngineContext, EngineFactory,
    FileDataStore, NetworkQuery, NoticeHandler, Provider, TunnelEngine,
};

/// Ordered log of interesting events across tasks.
#[derive(Default)]
pub struct Events(Mutex<Vec<String>>);

impl Events {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.lock().iter().filter(|e| *e == event).count()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == event)
    }

    pub fn last_position(&self, event: &str) -> Option<usize> {
        self.0.lock().iter().rposition(|e| e == event)
    }
}

pub fn candidate(id: &str) -> Candidate {
    Candidate {
        id: id.to_string(),
        ip_address: "198.51.100.7".parse().unwrap(),
        region: "CA".into(),
        capabilities: vec!["QUIC".into()],
        configuration_version: 1,
        source: String::new(),
        local_timestamp: None,
    }
}

pub fn bundle(n: usize) -> CandidateBundle {
    let candidates: Vec<_> = (0..n).map(|i| candidate(&format!("bundled-{i}"))).collect();
    CandidateBundle::from_candidates(&candidates).unwrap()
}

pub fn config_json(root: &std::path::Path, diagnostics: bool) -> String {
    serde_json::json!({
        "propagation_channel_id": "chan",
        "sponsor_id": "sponsor",
        "data_root_directory": root,
        "emit_diagnostic_notices": diagnostics,
    })
    .to_string()
}

#[derive(Default)]
pub struct MockProvider {
    pub notices: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn saw(&self, needle: &str) -> bool {
        self.notices.lock().iter().any(|n| n.contains(needle))
    }
}

impl NoticeHandler for MockProvider {
    fn notice(&self, notice_json: &str) {
        self.notices.lock().push(notice_json.to_string());
    }
}

impl NetworkQuery for MockProvider {
    fn has_network_connectivity(&self) -> bool {
        true
    }
    fn network_id(&self) -> String {
        "WIFI-mock".into()
    }
    fn ipv6_synthesize(&self, ipv4_addr: &str) -> String {
        ipv4_addr.into()
    }
    fn has_ipv6_route(&self) -> bool {
        false
    }
}

impl Provider for MockProvider {
    fn bind_to_device(&self, _fd: i32) -> Result<String, String> {
        Ok("eth0".into())
    }
    fn dns_servers_as_string(&self) -> String {
        "10.0.0.1,10.0.0.2".into()
    }
}

/// File-backed store that slows down writes and logs them. A batch write
/// sleeps once and logs one `import-store`.
pub struct SlowStore {
    inner: FileDataStore,
    delay: Duration,
    events: Arc<Events>,
}

impl CandidateStore for SlowStore {
    fn candidate_count(&self) -> anyhow::Result<usize> {
        self.inner.candidate_count()
    }
    fn candidate(&self, id: &str) -> anyhow::Result<Option<Candidate>> {
        self.inner.candidate(id)
    }
    fn candidates(&self) -> anyhow::Result<Vec<Candidate>> {
        self.inner.candidates()
    }
    fn store_candidate(&self, candidate: Candidate) -> anyhow::Result<()> {
        std::thread::sleep(self.delay);
        self.inner.store_candidate(candidate)?;
        self.events.push("import-store");
        Ok(())
    }
    fn store_candidates(&self, candidates: Vec<Candidate>) -> anyhow::Result<()> {
        std::thread::sleep(self.delay);
        self.inner.store_candidates(candidates)?;
        self.events.push("import-store");
        Ok(())
    }
    fn promote_candidate(&self, id: &str) -> anyhow::Result<bool> {
        self.inner.promote_candidate(id)
    }
    fn put_session(&self, scope: &str, record: Vec<u8>, expires_at: DateTime<Utc>) -> anyhow::Result<()> {
        self.inner.put_session(scope, record, expires_at)
    }
    fn get_session(&self, scope: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.inner.get_session(scope)
    }
    fn delete_session(&self, scope: &str) -> anyhow::Result<()> {
        self.inner.delete_session(scope)
    }
    fn close(&self) -> anyhow::Result<()> {
        self.events.push("close");
        self.inner.close()
    }
}

pub struct SlowOpener {
    pub delay: Duration,
    pub events: Arc<Events>,
    pub fail: AtomicBool,
    pub opened: Mutex<Option<Arc<SlowStore>>>,
}

impl SlowOpener {
    pub fn new(delay: Duration, events: Arc<Events>) -> Self {
        Self {
            delay,
            events,
            fail: AtomicBool::new(false),
            opened: Mutex::new(None),
        }
    }

    pub fn store(&self) -> Arc<SlowStore> {
        self.opened.lock().clone().expect("store was opened")
    }
}

impl DataStoreOpener for SlowOpener {
    fn open(&self, config: &Config) -> anyhow::Result<Arc<dyn CandidateStore>> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        let store = Arc::new(SlowStore {
            inner: FileDataStore::open(&config.datastore_directory())?,
            delay: self.delay,
            events: self.events.clone(),
        });
        *self.opened.lock() = Some(store.clone());
        Ok(store)
    }
}

pub struct MockEngine {
    pub context: EngineContext,
    pub events: Arc<Events>,
    pub reconnects: AtomicUsize,
    pub network_changes: AtomicUsize,
    pub dynamic_configs: Mutex<Vec<(String, Vec<String>)>>,
}

#[async_trait]
impl TunnelEngine for MockEngine {
    async fn run(&self, cancel: CancellationToken) {
        self.events.push("run-start");
        cancel.cancelled().await;
        // give a late import write the chance to interleave if ordering were wrong
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.events.push("run-exit");
    }

    fn reconnect_tunnel(&self) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn network_changed(&self) {
        self.network_changes.fetch_add(1, Ordering::SeqCst);
    }

    fn set_dynamic_config(&self, sponsor_id: &str, authorizations: Vec<String>) {
        self.dynamic_configs
            .lock()
            .push((sponsor_id.to_string(), authorizations));
    }

    fn export_exchange_payload(&self) -> String {
        let network_id = self.context.config.network_id();
        candidate::export_exchange_payload(self.context.store.as_ref(), &network_id)
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    fn import_exchange_payload(&self, payload: &str) -> bool {
        candidate::import_exchange_payload(self.context.store.as_ref(), payload, true).is_ok()
    }
}

pub struct MockFactory {
    pub events: Arc<Events>,
    pub fail: AtomicBool,
    pub builds: AtomicUsize,
    /// Candidate count observed when the engine was built
    pub count_at_build: Mutex<Option<usize>>,
    pub engine: Mutex<Option<Arc<MockEngine>>>,
}

impl MockFactory {
    pub fn new(events: Arc<Events>) -> Self {
        Self {
            events,
            fail: AtomicBool::new(false),
            builds: AtomicUsize::new(0),
            count_at_build: Mutex::new(None),
            engine: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> Arc<MockEngine> {
        self.engine.lock().clone().expect("engine was built")
    }
}

impl EngineFactory for MockFactory {
    fn build(&self, context: EngineContext) -> anyhow::Result<Arc<dyn TunnelEngine>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.events.push("build");
        *self.count_at_build.lock() = Some(context.store.candidate_count()?);
        if self.fail.load(Ordering::SeqCst) {
            bail!("no usable transports");
        }
        let engine = Arc::new(MockEngine {
            context,
            events: self.events.clone(),
            reconnects: AtomicUsize::new(0),
            network_changes: AtomicUsize::new(0),
            dynamic_configs: Mutex::new(Vec::new()),
        });
        *self.engine.lock() = Some(engine.clone());
        Ok(engine)
    }
}
