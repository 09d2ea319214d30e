//! Feedback coordinator single-flight behaviour.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{Events, MockProvider};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tunnel_core::{
    CallbackFlags, Config, CoreError, FeedbackCompletionHandler, FeedbackCoordinator,
    FeedbackRequest, FeedbackUploader, NoticeSink,
};

/// Paths starting with `block` wait for cancellation, `panic` panics, others
/// succeed.
#[derive(Default)]
struct ScriptedUploader {
    events: Events,
    configs: Mutex<Vec<Arc<Config>>>,
}

#[async_trait]
impl FeedbackUploader for ScriptedUploader {
    async fn send_feedback(
        &self,
        cancel: CancellationToken,
        config: Arc<Config>,
        _diagnostics: String,
        upload_path: String,
    ) -> tunnel_core::Result<()> {
        self.configs.lock().push(config);
        self.events.push(format!("start:{upload_path}"));
        if upload_path == "panic" {
            panic!("uploader bug");
        }
        if upload_path.starts_with("block") {
            cancel.cancelled().await;
            self.events.push(format!("cancelled:{upload_path}"));
            return Err(CoreError::Cancelled);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.events.push(format!("done:{upload_path}"));
        Ok(())
    }
}

struct Completion {
    label: &'static str,
    tx: mpsc::UnboundedSender<(&'static str, Option<String>)>,
}

impl FeedbackCompletionHandler for Completion {
    fn on_feedback_complete(&self, error: Option<CoreError>) {
        let _ = self.tx.send((self.label, error.map(|e| e.to_string())));
    }
}

struct Harness {
    root: tempfile::TempDir,
    uploader: Arc<ScriptedUploader>,
    notices: Arc<NoticeSink>,
    coordinator: Arc<FeedbackCoordinator>,
    provider: Arc<MockProvider>,
    tx: mpsc::UnboundedSender<(&'static str, Option<String>)>,
    rx: mpsc::UnboundedReceiver<(&'static str, Option<String>)>,
}

impl Harness {
    fn new() -> Self {
        let uploader = Arc::new(ScriptedUploader::default());
        let notices = Arc::new(NoticeSink::new());
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            root: tempfile::tempdir().unwrap(),
            coordinator: Arc::new(FeedbackCoordinator::with_notices(
                uploader.clone(),
                notices.clone(),
            )),
            uploader,
            notices,
            provider: Arc::new(MockProvider::default()),
            tx,
            rx,
        }
    }

    fn request(&self, label: &'static str, config_json: String) -> FeedbackRequest {
        FeedbackRequest {
            config_json: config_json.into_bytes(),
            diagnostics: r#"{"log":[]}"#.to_string(),
            upload_path: label.to_string(),
            completion: Arc::new(Completion {
                label,
                tx: self.tx.clone(),
            }),
            network: self.provider.clone(),
            notice_handler: self.provider.clone(),
            flags: CallbackFlags::default(),
        }
    }

    fn config(&self) -> String {
        common::config_json(self.root.path(), false)
    }

    async fn next_completion(&mut self) -> (&'static str, Option<String>) {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("completion within 5s")
            .expect("channel open")
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn new_job_cancels_the_previous_one_first() {
    let mut h = Harness::new();
    h.coordinator
        .start_send_feedback(h.request("block-1", h.config()))
        .await
        .unwrap();
    h.coordinator
        .start_send_feedback(h.request("second", h.config()))
        .await
        .unwrap();

    assert_eq!(
        h.next_completion().await,
        ("block-1", Some(CoreError::Cancelled.to_string()))
    );
    assert_eq!(h.next_completion().await, ("second", None));
    assert_eq!(
        h.uploader.events.snapshot(),
        vec!["start:block-1", "cancelled:block-1", "start:second", "done:second"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_when_idle_does_nothing() {
    let h = Harness::new();
    h.coordinator.stop_send_feedback().await;
    h.coordinator.stop_send_feedback().await;
    assert!(!h.coordinator.is_active().await);
    assert!(h.notices.is_default());
    assert!(h.uploader.events.snapshot().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_cancels_and_restores_notices() {
    let mut h = Harness::new();
    h.coordinator
        .start_send_feedback(h.request("block-stop", h.config()))
        .await
        .unwrap();
    assert!(h.coordinator.is_active().await);
    assert!(!h.notices.is_default());

    h.coordinator.stop_send_feedback().await;

    // the completion ran before stop returned
    let (label, error) = h.rx.try_recv().expect("completion delivered");
    assert_eq!(label, "block-stop");
    assert_eq!(error, Some(CoreError::Cancelled.to_string()));
    assert!(!h.coordinator.is_active().await);
    assert!(h.notices.is_default());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upload_config_uses_the_host_network_and_system_resolver() {
    let mut h = Harness::new();
    let config = serde_json::json!({
        "propagation_channel_id": "chan",
        "sponsor_id": "sponsor",
        "data_root_directory": h.root.path(),
        "network_id": "STATIC",
        "dns_resolver_alternate_servers": ["not-an-address"],
    })
    .to_string();

    h.coordinator
        .start_send_feedback(h.request("ok", config))
        .await
        .unwrap();
    assert_eq!(h.next_completion().await, ("ok", None));

    let configs = h.uploader.configs.lock();
    let seen = configs.first().expect("uploader was called");
    assert!(seen.is_committed());
    assert!(seen.dns_resolver_alternate_servers.is_empty());
    assert_eq!(seen.network_id(), "WIFI-mock");
    assert!(seen.dns_servers().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalid_config_fails_fast_without_completion() {
    let mut h = Harness::new();
    let err = h
        .coordinator
        .start_send_feedback(h.request("never", "{}".to_string()))
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::ConfigInvalid(_)));
    assert!(!h.coordinator.is_active().await);
    assert!(h.notices.is_default());
    assert!(h.rx.try_recv().is_err());
    assert!(h.uploader.events.snapshot().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_never_overlap() {
    let mut h = Harness::new();
    let mut joins = Vec::new();
    for label in ["block-a", "block-b", "block-c"] {
        let coordinator = h.coordinator.clone();
        let request = h.request(label, h.config());
        joins.push(tokio::spawn(async move {
            coordinator.start_send_feedback(request).await
        }));
    }
    for join in joins {
        join.await.unwrap().unwrap();
    }
    h.coordinator.stop_send_feedback().await;

    for _ in 0..3 {
        let (_, error) = h.next_completion().await;
        assert_eq!(error, Some(CoreError::Cancelled.to_string()));
    }

    // every job finished before the next one started
    let events = h.uploader.events.snapshot();
    assert_eq!(events.len(), 6);
    for pair in events.chunks(2) {
        let label = pair[0].strip_prefix("start:").unwrap();
        assert_eq!(pair[1], format!("cancelled:{label}"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_upload_still_completes() {
    let mut h = Harness::new();
    h.coordinator
        .start_send_feedback(h.request("panic", h.config()))
        .await
        .unwrap();

    let (label, error) = h.next_completion().await;
    assert_eq!(label, "panic");
    let error = error.expect("failure reported");
    assert!(error.starts_with("feedback upload failed"), "{error}");
    assert!(error.contains("panicked"), "{error}");

    h.coordinator.stop_send_feedback().await;
    assert!(!h.coordinator.is_active().await);
    assert!(h.notices.is_default());
}
