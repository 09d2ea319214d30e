//! Session-resumption cache on top of the datastore.
//!
//! Transports persist an established [`SessionState`] under a scope naming
//! the server and the network it was reached on, and restore it on the next
//! dial to skip a full handshake.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, warn};
use tunnel_crypto::SessionState;

use crate::config::Config;
use crate::datastore::CandidateStore;

/// Cache key for a server as seen from one network.
pub fn session_scope(server_id: &str, network_id: &str) -> String {
    format!("{server_id}|{network_id}")
}

pub struct SessionCache {
    store: Arc<dyn CandidateStore>,
    ttl: Duration,
}

impl SessionCache {
    pub fn new(store: Arc<dyn CandidateStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn from_config(store: Arc<dyn CandidateStore>, config: &Config) -> Self {
        Self::new(store, config.session_cache_ttl())
    }

    pub fn put(&self, scope: &str, state: &SessionState) -> Result<()> {
        let record = state.marshal_binary().context("encoding session state")?;
        let expires_at = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .with_context(|| format!("session TTL {:?} out of range", self.ttl))?;
        self.store.put_session(scope, record, expires_at)?;
        debug!(scope, epoch = state.local_epoch(), "session cached");
        Ok(())
    }

    /// Restore a cached session with its cipher suite initialized.
    ///
    /// A record that no longer decodes is dropped and reads as a miss.
    pub fn get(&self, scope: &str) -> Result<Option<SessionState>> {
        let Some(record) = self.store.get_session(scope)? else {
            return Ok(None);
        };
        match SessionState::unmarshal_binary(&record) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(scope, %e, "discarding unreadable session record");
                self.store.delete_session(scope)?;
                Ok(None)
            }
        }
    }

    pub fn remove(&self, scope: &str) -> Result<()> {
        self.store.delete_session(scope)
    }
}
