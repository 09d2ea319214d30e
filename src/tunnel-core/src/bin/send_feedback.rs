//! Upload a diagnostics bundle using a client config, outside any engine.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tunnel_core::error::CoreError;
use tunnel_core::feedback::{
    FeedbackCompletionHandler, FeedbackCoordinator, FeedbackRequest, HttpFeedbackUploader,
};
use tunnel_core::provider::{CallbackFlags, NetworkQuery, NoticeHandler};
use tunnel_core::NoticeSink;

#[derive(Parser, Debug)]
#[command(name = "send_feedback", about = "Seal and upload a diagnostics bundle")]
struct Args {
    /// Client config (JSON)
    #[arg(long)]
    config: PathBuf,

    /// Diagnostics bundle (JSON)
    #[arg(long)]
    diagnostics: PathBuf,

    /// Path appended to each upload URL
    #[arg(long, default_value = "")]
    upload_path: String,

    /// Network ID to report
    #[arg(long, default_value = "CLI")]
    network_id: String,

    /// Print notices to stdout
    #[arg(long)]
    show_notices: bool,
}

struct CliNetwork {
    network_id: String,
}

impl NetworkQuery for CliNetwork {
    fn has_network_connectivity(&self) -> bool {
        true
    }

    fn network_id(&self) -> String {
        self.network_id.clone()
    }

    fn ipv6_synthesize(&self, ipv4_addr: &str) -> String {
        ipv4_addr.to_string()
    }

    fn has_ipv6_route(&self) -> bool {
        false
    }
}

struct CliNotices {
    print: bool,
}

impl NoticeHandler for CliNotices {
    fn notice(&self, notice_json: &str) {
        if self.print {
            println!("{notice_json}");
        }
    }
}

/// Hands the job result back to `main`.
struct Completion {
    tx: parking_lot::Mutex<Option<oneshot::Sender<Option<CoreError>>>>,
}

impl FeedbackCompletionHandler for Completion {
    fn on_feedback_complete(&self, error: Option<CoreError>) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(error);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config_json = std::fs::read(&args.config)
        .with_context(|| format!("reading config {}", args.config.display()))?;
    let diagnostics = std::fs::read_to_string(&args.diagnostics)
        .with_context(|| format!("reading diagnostics {}", args.diagnostics.display()))?;

    let coordinator =
        FeedbackCoordinator::with_notices(Arc::new(HttpFeedbackUploader::new()?), NoticeSink::global());

    let (tx, rx) = oneshot::channel();
    coordinator
        .start_send_feedback(FeedbackRequest {
            config_json,
            diagnostics,
            upload_path: args.upload_path,
            completion: Arc::new(Completion {
                tx: parking_lot::Mutex::new(Some(tx)),
            }),
            network: Arc::new(CliNetwork {
                network_id: args.network_id,
            }),
            notice_handler: Arc::new(CliNotices {
                print: args.show_notices,
            }),
            flags: CallbackFlags::default(),
        })
        .await?;

    let outcome = tokio::select! {
        result = rx => result.context("feedback job dropped its completion handler")?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; cancelling upload");
            coordinator.stop_send_feedback().await;
            return Err(anyhow!("upload cancelled"));
        }
    };
    coordinator.stop_send_feedback().await;

    match outcome {
        None => {
            info!("feedback sent");
            Ok(())
        }
        Some(e) => Err(anyhow!(e).context("sending feedback")),
    }
}
