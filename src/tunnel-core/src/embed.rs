//! Process-wide embedding facade.
//!
//! Hosts that cannot hold Rust objects (mobile bindings, C shims) call these
//! blocking functions instead. [`install`] runs once per process and sets up
//! a multi-thread runtime plus one engine and one feedback coordinator, both
//! reporting through [`NoticeSink::global`].
//!
//! None of these functions may be called from inside an async runtime.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{bail, Context};
use tracing::{info, warn};

use crate::candidate::CandidateBundle;
use crate::config;
use crate::controller::EngineCoordinator;
use crate::datastore::DataStoreOpener;
use crate::engine::EngineFactory;
use crate::error::{CoreError, Result};
use crate::feedback::{FeedbackCoordinator, FeedbackRequest, FeedbackUploader};
use crate::notice::{BuildInfo, NoticeSink};
use crate::provider::{CallbackFlags, Provider};

/// MTU the host should give the packet tunnel interface.
pub const PACKET_TUNNEL_MTU: u32 = 1500;

struct Installation {
    runtime: tokio::runtime::Runtime,
    engine: EngineCoordinator,
    feedback: FeedbackCoordinator,
}

static INSTALLATION: OnceLock<Installation> = OnceLock::new();

/// Set up the facade. Fails if it is already installed.
pub fn install(
    opener: Arc<dyn DataStoreOpener>,
    factory: Arc<dyn EngineFactory>,
    uploader: Arc<dyn FeedbackUploader>,
) -> anyhow::Result<()> {
    if INSTALLATION.get().is_some() {
        bail!("tunnel core is already installed");
    }
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("tunnel-core")
        .build()
        .context("building tokio runtime")?;
    let installation = Installation {
        runtime,
        engine: EngineCoordinator::new(opener, factory),
        feedback: FeedbackCoordinator::new(uploader),
    };
    if INSTALLATION.set(installation).is_err() {
        bail!("tunnel core is already installed");
    }
    info!(version = env!("CARGO_PKG_VERSION"), "tunnel core installed");
    Ok(())
}

pub fn is_installed() -> bool {
    INSTALLATION.get().is_some()
}

fn installed() -> Result<&'static Installation> {
    INSTALLATION.get().ok_or(CoreError::NotInstalled)
}

pub fn start(
    config_json: &str,
    bundle: CandidateBundle,
    provider: Arc<dyn Provider>,
    flags: CallbackFlags,
) -> Result<()> {
    let inst = installed()?;
    inst.runtime
        .block_on(inst.engine.start(config_json.as_bytes(), bundle, provider, flags))
}

pub fn stop() {
    if let Ok(inst) = installed() {
        inst.runtime.block_on(inst.engine.stop());
    }
}

pub fn is_running() -> bool {
    installed()
        .map(|inst| inst.runtime.block_on(inst.engine.is_running()))
        .unwrap_or(false)
}

pub fn reconnect_tunnel() {
    if let Ok(inst) = installed() {
        inst.runtime.block_on(inst.engine.reconnect_tunnel());
    }
}

pub fn network_changed() {
    if let Ok(inst) = installed() {
        inst.runtime.block_on(inst.engine.network_changed());
    }
}

pub fn set_dynamic_config(sponsor_id: &str, authorizations: &str) {
    if let Ok(inst) = installed() {
        inst.runtime
            .block_on(inst.engine.set_dynamic_config(sponsor_id, authorizations));
    }
}

pub fn export_exchange_payload() -> String {
    match installed() {
        Ok(inst) => inst.runtime.block_on(inst.engine.export_exchange_payload()),
        Err(_) => String::new(),
    }
}

pub fn import_exchange_payload(payload: &str) -> bool {
    match installed() {
        Ok(inst) => inst
            .runtime
            .block_on(inst.engine.import_exchange_payload(payload)),
        Err(_) => false,
    }
}

pub fn start_send_feedback(request: FeedbackRequest) -> Result<()> {
    let inst = installed()?;
    inst.runtime
        .block_on(inst.feedback.start_send_feedback(request))
}

pub fn stop_send_feedback() {
    if let Ok(inst) = installed() {
        inst.runtime.block_on(inst.feedback.stop_send_feedback());
    }
}

/// Emit a user-visible log line.
pub fn notice_user_log(message: &str) {
    NoticeSink::global().user_log(message);
}

/// Build identification as JSON.
pub fn build_info() -> String {
    serde_json::to_string(&BuildInfo::current()).unwrap_or_else(|e| {
        warn!(%e, "failed to encode build info");
        String::new()
    })
}

pub fn packet_tunnel_mtu() -> u32 {
    PACKET_TUNNEL_MTU
}

pub fn homepage_file_path(root: &Path) -> PathBuf {
    config::homepage_file_path(root)
}

pub fn notices_file_path(root: &Path) -> PathBuf {
    config::notices_file_path(root)
}

pub fn old_notices_file_path(root: &Path) -> PathBuf {
    config::old_notices_file_path(root)
}

pub fn upgrade_download_file_path(root: &Path) -> PathBuf {
    config::upgrade_download_file_path(root)
}
