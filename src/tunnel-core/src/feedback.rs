//! Feedback upload coordinator.
//!
//! Uploads a diagnostics bundle in the background. Jobs are single-flight:
//! starting a job first cancels the previous one and waits for it to finish,
//! so two uploads never overlap.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunnel_crypto::SealFormat;

use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::notice::NoticeSink;
use crate::provider::{CallbackFlags, NetworkBinding, NetworkQuery, NoticeHandler};

/// Sends one diagnostics bundle.
#[async_trait]
pub trait FeedbackUploader: Send + Sync {
    async fn send_feedback(
        &self,
        cancel: CancellationToken,
        config: Arc<Config>,
        diagnostics: String,
        upload_path: String,
    ) -> Result<()>;
}

/// Told how a job ended: `None` on success.
///
/// Called on the job's own task. Calling `start_send_feedback` or
/// `stop_send_feedback` from here waits on that same task and deadlocks;
/// hand the work to another task instead.
pub trait FeedbackCompletionHandler: Send + Sync {
    fn on_feedback_complete(&self, error: Option<CoreError>);
}

/// Everything a feedback job needs from the host.
pub struct FeedbackRequest {
    pub config_json: Vec<u8>,
    /// JSON diagnostics document
    pub diagnostics: String,
    /// Appended to each upload URL
    pub upload_path: String,
    pub completion: Arc<dyn FeedbackCompletionHandler>,
    pub network: Arc<dyn NetworkQuery>,
    pub notice_handler: Arc<dyn NoticeHandler>,
    pub flags: CallbackFlags,
}

struct FeedbackJob {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl FeedbackJob {
    async fn cancel_and_wait(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(%e, "feedback task ended abnormally");
        }
    }
}

pub struct FeedbackCoordinator {
    uploader: Arc<dyn FeedbackUploader>,
    notices: Arc<NoticeSink>,
    slot: Mutex<Option<FeedbackJob>>,
}

impl FeedbackCoordinator {
    pub fn new(uploader: Arc<dyn FeedbackUploader>) -> Self {
        Self::with_notices(uploader, NoticeSink::global())
    }

    pub fn with_notices(uploader: Arc<dyn FeedbackUploader>, notices: Arc<NoticeSink>) -> Self {
        Self {
            uploader,
            notices,
            slot: Mutex::new(None),
        }
    }

    pub async fn is_active(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Start an upload, superseding any job in flight.
    ///
    /// Returns after the job is spawned; only setup failures are returned
    /// here, upload failures go to the completion handler.
    pub async fn start_send_feedback(&self, request: FeedbackRequest) -> Result<()> {
        self.stop_send_feedback().await;

        let mut slot = self.slot.lock().await;
        // another caller may have started a job between stop and lock
        if let Some(job) = slot.take() {
            job.cancel_and_wait().await;
        }

        let cancel = CancellationToken::new();
        self.notices.install(request.notice_handler.clone());

        let config = match feedback_config(&request.config_json, request.network.clone(), request.flags) {
            Ok(config) => Arc::new(config),
            Err(e) => {
                self.notices.reset();
                return Err(CoreError::ConfigInvalid(CoreError::chain(&e)));
            }
        };
        self.notices
            .set_emit_diagnostics(config.emit_diagnostic_notices);

        let uploader = self.uploader.clone();
        let completion = request.completion;
        let diagnostics = request.diagnostics;
        let upload_path = request.upload_path;
        let job_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            // the upload runs on its own task so a panic still reaches `completion`
            let upload = tokio::spawn(async move {
                uploader
                    .send_feedback(job_cancel, config, diagnostics, upload_path)
                    .await
            });
            let result = match upload.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(CoreError::FeedbackFailed(format!(
                    "upload task panicked: {e}"
                ))),
                Err(_) => Err(CoreError::Cancelled),
            };
            match &result {
                Ok(()) => info!("feedback upload complete"),
                Err(e) => warn!(%e, "feedback upload did not complete"),
            }
            completion.on_feedback_complete(result.err());
        });

        *slot = Some(FeedbackJob { cancel, handle });
        Ok(())
    }

    /// Cancel the job in flight and wait for it. No-op when idle.
    pub async fn stop_send_feedback(&self) {
        let mut slot = self.slot.lock().await;
        let Some(job) = slot.take() else {
            return;
        };
        job.cancel_and_wait().await;
        self.notices.reset();
        debug!("feedback job stopped");
    }
}

/// Parse, bind network callbacks, clear the resolver override and commit.
fn feedback_config(
    json: &[u8],
    network: Arc<dyn NetworkQuery>,
    flags: CallbackFlags,
) -> anyhow::Result<Config> {
    let mut config = Config::load(json)?;
    let binding = Arc::new(NetworkBinding::new(network));
    let bindings = config.bindings_mut()?;
    bindings.network_connectivity_checker = Some(binding.clone());
    bindings.network_id_getter = Some(binding.clone());
    if flags.use_ipv6_synthesizer {
        bindings.ipv6_synthesizer = Some(binding.clone());
    }
    if flags.use_has_ipv6_route_getter {
        bindings.has_ipv6_route_getter = Some(binding);
    }
    // uploads go through the system resolver
    config.clear_alternate_dns_resolvers();
    config.commit(true)?;
    Ok(config)
}

/// Seals the bundle to the configured age recipient and PUTs it to each
/// upload URL in turn, retrying with linear backoff.
pub struct HttpFeedbackUploader {
    client: reqwest::Client,
}

impl HttpFeedbackUploader {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tunnel-core/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;
        Ok(Self { client })
    }

    async fn put(&self, url: &str, body: Vec<u8>, timeout: Duration) -> anyhow::Result<()> {
        let response = self
            .client
            .put(url)
            .timeout(timeout)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .with_context(|| format!("uploading feedback to {url}"))?;
        if !response.status().is_success() {
            bail!("feedback upload to {url} returned {}", response.status());
        }
        Ok(())
    }
}

/// Linear backoff before retry `attempt + 1`, saturating.
fn retry_delay(backoff: Duration, attempt: u32) -> Duration {
    backoff.saturating_mul(attempt.saturating_add(1))
}

fn upload_url(base: &str, upload_path: &str) -> String {
    let path = upload_path.trim_start_matches('/');
    if path.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), path)
}

#[async_trait]
impl FeedbackUploader for HttpFeedbackUploader {
    async fn send_feedback(
        &self,
        cancel: CancellationToken,
        config: Arc<Config>,
        diagnostics: String,
        upload_path: String,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        serde_json::from_str::<serde_json::Value>(&diagnostics)
            .map_err(|e| CoreError::FeedbackFailed(format!("diagnostics are not JSON: {e}")))?;
        if config.feedback_upload_urls.is_empty() {
            return Err(CoreError::FeedbackFailed("no upload URLs configured".into()));
        }
        let recipient = config
            .feedback_recipient()
            .map_err(|e| CoreError::FeedbackFailed(CoreError::chain(&e)))?;
        let sealed = recipient.seal(diagnostics.as_bytes(), SealFormat::Binary)?;

        let timeout = config.feedback_upload_timeout();
        let backoff = config.feedback_retry_backoff();
        let attempts = config.feedback_upload_max_retries.saturating_add(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            for base in &config.feedback_upload_urls {
                let url = upload_url(base, &upload_path);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                    result = self.put(&url, sealed.clone(), timeout) => match result {
                        Ok(()) => {
                            info!(%url, attempt, bytes = sealed.len(), "feedback uploaded");
                            return Ok(());
                        }
                        Err(e) => {
                            warn!(error = %CoreError::chain(&e), attempt, "feedback upload attempt failed");
                            last_error = Some(e);
                        }
                    }
                }
            }
            if attempt + 1 < attempts {
                let delay = retry_delay(backoff, attempt);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Err(CoreError::FeedbackFailed(
            last_error
                .map(|e| CoreError::chain(&e))
                .unwrap_or_else(|| "no upload attempted".into()),
        ))
    }
}
