//! Engine lifecycle coordinator.
//!
//! At most one engine runs at a time. `start` and `stop` serialise on a
//! single slot lock; the lock guards the transition only, the run loop and
//! the candidate import run as separate tasks under one cancellation token.
//!
//! Shutdown order is fixed: run loop, then import, then datastore close.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::candidate::{import_embedded_candidates, CandidateBundle};
use crate::config::Config;
use crate::datastore::{CandidateStore, DataStoreOpener};
use crate::engine::{EngineContext, EngineFactory, TunnelEngine};
use crate::error::{CoreError, Result};
use crate::memory;
use crate::notice::NoticeSink;
use crate::provider::{CallbackFlags, CallbackProxy, Provider};

/// Background candidate import; its handle is the completion signal.
struct ImportTask {
    handle: Option<JoinHandle<()>>,
}

impl ImportTask {
    fn spawn(
        cancel: CancellationToken,
        store: Arc<dyn CandidateStore>,
        bundle: CandidateBundle,
        notices: Arc<NoticeSink>,
    ) -> Self {
        let handle = tokio::task::spawn_blocking(move || {
            if let Err(e) = import_embedded_candidates(&cancel, store.as_ref(), &bundle, &notices) {
                let err = CoreError::ImportFailed(CoreError::chain(&e));
                warn!(%err, "candidate import failed");
                notices.error(&err.to_string());
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Wait for the import to finish. Later calls return immediately.
    async fn wait(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(%e, "candidate import task aborted");
            }
        }
    }
}

struct RunningEngine {
    engine: Arc<dyn TunnelEngine>,
    store: Arc<dyn CandidateStore>,
    cancel: CancellationToken,
    run_loop: JoinHandle<()>,
    import: ImportTask,
    /// Held for the engine's lifetime; bindings and the notice sink point here
    _proxy: Arc<CallbackProxy>,
}

pub struct EngineCoordinator {
    opener: Arc<dyn DataStoreOpener>,
    factory: Arc<dyn EngineFactory>,
    notices: Arc<NoticeSink>,
    slot: Mutex<Option<RunningEngine>>,
}

impl EngineCoordinator {
    /// Coordinator reporting through the process-wide notice sink.
    pub fn new(opener: Arc<dyn DataStoreOpener>, factory: Arc<dyn EngineFactory>) -> Self {
        Self::with_notices(opener, factory, NoticeSink::global())
    }

    pub fn with_notices(
        opener: Arc<dyn DataStoreOpener>,
        factory: Arc<dyn EngineFactory>,
        notices: Arc<NoticeSink>,
    ) -> Self {
        Self {
            opener,
            factory,
            notices,
            slot: Mutex::new(None),
        }
    }

    pub fn notices(&self) -> &Arc<NoticeSink> {
        &self.notices
    }

    pub async fn is_running(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Start the engine.
    ///
    /// Returns once the run loop is spawned. When the datastore holds no
    /// candidates this first waits for the bundle import, so the engine never
    /// starts with nothing to dial. Any failure leaves nothing running.
    pub async fn start(
        &self,
        config_json: &[u8],
        bundle: CandidateBundle,
        provider: Arc<dyn Provider>,
        flags: CallbackFlags,
    ) -> Result<()> {
        let mut slot = self.slot.lock().await;
        if slot.is_some() {
            return Err(CoreError::AlreadyRunning);
        }

        memory::reclaim();

        let proxy = Arc::new(CallbackProxy::new(provider));
        let config = Arc::new(
            engine_config(config_json, &proxy, flags)
                .map_err(|e| CoreError::ConfigInvalid(CoreError::chain(&e)))?,
        );

        self.notices.install(proxy.clone());
        self.notices
            .set_emit_diagnostics(config.emit_diagnostic_notices);
        self.notices.build_info();

        let store = match self.opener.open(&config) {
            Ok(store) => store,
            Err(e) => {
                self.notices.reset();
                return Err(CoreError::StoreOpenFailed(CoreError::chain(&e)));
            }
        };

        let cancel = CancellationToken::new();
        let mut import = ImportTask::spawn(
            cancel.clone(),
            store.clone(),
            bundle,
            self.notices.clone(),
        );

        let has_candidates = match store.candidate_count() {
            Ok(count) => count > 0,
            Err(e) => {
                warn!(error = %CoreError::chain(&e), "candidate count unavailable");
                false
            }
        };
        if !has_candidates {
            debug!("no stored candidates; waiting for bundle import");
            import.wait().await;
        }

        let context = EngineContext {
            config: config.clone(),
            store: store.clone(),
            notices: self.notices.clone(),
        };
        let engine = match self.factory.build(context) {
            Ok(engine) => engine,
            Err(e) => {
                cancel.cancel();
                import.wait().await;
                if let Err(close_err) = store.close() {
                    warn!(error = %CoreError::chain(&close_err), "datastore close failed");
                }
                self.notices.reset();
                return Err(CoreError::EngineConstructFailed(CoreError::chain(&e)));
            }
        };

        let run_loop = tokio::spawn({
            let engine = engine.clone();
            let cancel = cancel.clone();
            async move { engine.run(cancel).await }
        });

        info!(
            network_id = %config.network_id(),
            waited_for_import = !has_candidates,
            "tunnel engine started"
        );
        *slot = Some(RunningEngine {
            engine,
            store,
            cancel,
            run_loop,
            import,
            _proxy: proxy,
        });
        Ok(())
    }

    /// Stop the engine and wait for every task to drain. No-op when stopped.
    pub async fn stop(&self) {
        let mut slot = self.slot.lock().await;
        let Some(mut running) = slot.take() else {
            return;
        };

        running.cancel.cancel();
        if let Err(e) = (&mut running.run_loop).await {
            warn!(%e, "engine run loop ended abnormally");
        }
        running.import.wait().await;
        if let Err(e) = running.store.close() {
            warn!(error = %CoreError::chain(&e), "datastore close failed");
        }
        drop(running);

        self.notices.reset();
        info!("tunnel engine stopped");
    }

    pub async fn reconnect_tunnel(&self) {
        if let Some(running) = self.slot.lock().await.as_ref() {
            running.engine.reconnect_tunnel();
        }
    }

    pub async fn network_changed(&self) {
        if let Some(running) = self.slot.lock().await.as_ref() {
            running.engine.network_changed();
        }
    }

    /// `authorizations` is space-delimited; empty means none.
    pub async fn set_dynamic_config(&self, sponsor_id: &str, authorizations: &str) {
        if let Some(running) = self.slot.lock().await.as_ref() {
            running
                .engine
                .set_dynamic_config(sponsor_id, split_authorizations(authorizations));
        }
    }

    /// Empty when stopped or when the engine has nothing to export.
    pub async fn export_exchange_payload(&self) -> String {
        match self.slot.lock().await.as_ref() {
            Some(running) => running.engine.export_exchange_payload(),
            None => String::new(),
        }
    }

    pub async fn import_exchange_payload(&self, payload: &str) -> bool {
        let slot = self.slot.lock().await;
        let Some(running) = slot.as_ref() else {
            return false;
        };
        let imported = running.engine.import_exchange_payload(payload);
        if !imported {
            self.notices.warning("failed to import exchange payload");
        }
        imported
    }
}

/// Parse, bind the proxy and commit.
fn engine_config(
    json: &[u8],
    proxy: &Arc<CallbackProxy>,
    flags: CallbackFlags,
) -> anyhow::Result<Config> {
    let mut config = Config::load(json)?;
    let bindings = config.bindings_mut()?;
    bindings.network_connectivity_checker = Some(proxy.clone());
    bindings.network_id_getter = Some(proxy.clone());
    bindings.dns_server_getter = Some(proxy.clone());
    if flags.use_device_binder {
        bindings.device_binder = Some(proxy.clone());
    }
    if flags.use_ipv6_synthesizer {
        bindings.ipv6_synthesizer = Some(proxy.clone());
    }
    if flags.use_has_ipv6_route_getter {
        bindings.has_ipv6_route_getter = Some(proxy.clone());
    }
    config.commit(true)?;
    Ok(config)
}

/// Split on single spaces, so `"a  b"` keeps its empty middle token.
pub fn split_authorizations(authorizations: &str) -> Vec<String> {
    if authorizations.is_empty() {
        return Vec::new();
    }
    authorizations.split(' ').map(str::to_string).collect()
}
