//! Tunnel engine seam.
//!
//! The engine (dialers, server selection, packet forwarding) lives outside
//! this crate. The coordinator builds one through an [`EngineFactory`],
//! drives its run loop, and forwards runtime controls to it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::datastore::CandidateStore;
use crate::notice::NoticeSink;

#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// Run until `cancel` fires.
    async fn run(&self, cancel: CancellationToken);

    fn reconnect_tunnel(&self);

    fn network_changed(&self);

    fn set_dynamic_config(&self, sponsor_id: &str, authorizations: Vec<String>);

    /// Empty when there is nothing to export.
    fn export_exchange_payload(&self) -> String;

    /// Store an exchanged candidate; while establishing, dial it first.
    fn import_exchange_payload(&self, payload: &str) -> bool;
}

/// What an engine is built from.
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn CandidateStore>,
    pub notices: Arc<NoticeSink>,
}

pub trait EngineFactory: Send + Sync {
    fn build(&self, context: EngineContext) -> anyhow::Result<Arc<dyn TunnelEngine>>;
}
