//! Client configuration.
//!
//! A [`Config`] is parsed from JSON, has its host callbacks bound, and is then
//! committed. Committing validates the document and freezes the bindings;
//! everything downstream takes a committed config.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use tunnel_crypto::SealRecipient;

use crate::provider::{
    DeviceBinder, DnsServerGetter, HasIpv6RouteGetter, Ipv6Synthesizer,
    NetworkConnectivityChecker, NetworkIdGetter,
};

/// Reported when neither the host nor the config knows the network.
pub const UNKNOWN_NETWORK_ID: &str = "UNKNOWN";

/// Subdirectory of the data root owned by this crate.
const DATA_DIRECTORY_NAME: &str = "tunnel-core";

/// Upper bound for `session_cache_ttl_seconds` (ten years).
pub const MAX_SESSION_CACHE_TTL_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

/// Host callbacks the engine may consult.
#[derive(Clone, Default)]
pub struct Bindings {
    pub network_connectivity_checker: Option<Arc<dyn NetworkConnectivityChecker>>,
    pub network_id_getter: Option<Arc<dyn NetworkIdGetter>>,
    pub dns_server_getter: Option<Arc<dyn DnsServerGetter>>,
    pub device_binder: Option<Arc<dyn DeviceBinder>>,
    pub ipv6_synthesizer: Option<Arc<dyn Ipv6Synthesizer>>,
    pub has_ipv6_route_getter: Option<Arc<dyn HasIpv6RouteGetter>>,
}

impl std::fmt::Debug for Bindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bindings")
            .field("network_connectivity_checker", &self.network_connectivity_checker.is_some())
            .field("network_id_getter", &self.network_id_getter.is_some())
            .field("dns_server_getter", &self.dns_server_getter.is_some())
            .field("device_binder", &self.device_binder.is_some())
            .field("ipv6_synthesizer", &self.ipv6_synthesizer.is_some())
            .field("has_ipv6_route_getter", &self.has_ipv6_route_getter.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for the datastore and other data files
    pub data_root_directory: PathBuf,
    pub propagation_channel_id: String,
    pub sponsor_id: String,
    /// Opaque authorization tokens presented to servers
    pub authorizations: Vec<String>,
    pub client_platform: String,
    /// Static network ID used when the host supplies none
    pub network_id: String,
    /// Resolvers used instead of the system ones
    pub dns_resolver_alternate_servers: Vec<String>,
    pub emit_diagnostic_notices: bool,

    pub feedback_upload_urls: Vec<String>,
    /// age recipient (`age1...`) feedback bundles are sealed to
    pub feedback_encryption_public_key: String,
    pub feedback_upload_timeout_seconds: u64,
    pub feedback_upload_max_retries: u32,
    pub feedback_upload_retry_backoff_ms: u64,

    pub session_cache_ttl_seconds: u64,

    #[serde(skip)]
    bindings: Bindings,
    #[serde(skip)]
    committed: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root_directory: PathBuf::new(),
            propagation_channel_id: String::new(),
            sponsor_id: String::new(),
            authorizations: Vec::new(),
            client_platform: String::new(),
            network_id: String::new(),
            dns_resolver_alternate_servers: Vec::new(),
            emit_diagnostic_notices: false,
            feedback_upload_urls: Vec::new(),
            feedback_encryption_public_key: String::new(),
            feedback_upload_timeout_seconds: 30,
            feedback_upload_max_retries: 3,
            feedback_upload_retry_backoff_ms: 1000,
            session_cache_ttl_seconds: 24 * 60 * 60,
            bindings: Bindings::default(),
            committed: false,
        }
    }
}

impl Config {
    /// Parse an uncommitted config from JSON.
    pub fn load(json: &[u8]) -> Result<Self> {
        serde_json::from_slice(json).context("parsing config JSON")
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    /// Callback bindings; only available before commit.
    pub fn bindings_mut(&mut self) -> Result<&mut Bindings> {
        ensure!(!self.committed, "config bindings are frozen after commit");
        Ok(&mut self.bindings)
    }

    /// Drop any resolver override so the system resolver is used.
    pub fn clear_alternate_dns_resolvers(&mut self) {
        self.dns_resolver_alternate_servers.clear();
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Validate and freeze the config.
    ///
    /// `strict` also checks the values that are only parsed when used:
    /// resolver addresses, feedback URLs and the feedback key.
    pub fn commit(&mut self, strict: bool) -> Result<()> {
        ensure!(!self.committed, "config is already committed");
        ensure!(
            !self.propagation_channel_id.is_empty(),
            "propagation_channel_id is required"
        );
        ensure!(!self.sponsor_id.is_empty(), "sponsor_id is required");
        ensure!(
            self.session_cache_ttl_seconds <= MAX_SESSION_CACHE_TTL_SECONDS,
            "session_cache_ttl_seconds {} exceeds {MAX_SESSION_CACHE_TTL_SECONDS}",
            self.session_cache_ttl_seconds
        );

        if self.data_root_directory.as_os_str().is_empty() {
            self.data_root_directory =
                std::env::current_dir().context("resolving default data root")?;
        }

        if strict {
            for server in &self.dns_resolver_alternate_servers {
                if server.parse::<IpAddr>().is_err() && server.parse::<SocketAddr>().is_err() {
                    bail!("invalid alternate DNS server: {server:?}");
                }
            }
            for url in &self.feedback_upload_urls {
                validate_upload_url(url)?;
            }
            if !self.feedback_encryption_public_key.is_empty() {
                self.feedback_recipient()?;
            } else if !self.feedback_upload_urls.is_empty() {
                bail!("feedback_upload_urls set without feedback_encryption_public_key");
            }
        }

        self.committed = true;
        Ok(())
    }

    /// Network ID from the host, else the static value, else `UNKNOWN`.
    pub fn network_id(&self) -> String {
        if let Some(getter) = &self.bindings.network_id_getter {
            let id = getter.network_id();
            if !id.is_empty() {
                return id;
            }
        }
        if !self.network_id.is_empty() {
            return self.network_id.clone();
        }
        UNKNOWN_NETWORK_ID.to_string()
    }

    /// DNS servers reported by the host, if it reports any.
    pub fn dns_servers(&self) -> Vec<String> {
        self.bindings
            .dns_server_getter
            .as_ref()
            .map(|g| g.dns_servers())
            .unwrap_or_default()
    }

    /// Assumes connectivity when the host does not say otherwise.
    pub fn has_network_connectivity(&self) -> bool {
        self.bindings
            .network_connectivity_checker
            .as_ref()
            .map(|c| c.has_network_connectivity())
            .unwrap_or(true)
    }

    pub fn feedback_recipient(&self) -> Result<SealRecipient> {
        self.feedback_encryption_public_key
            .parse()
            .context("parsing feedback_encryption_public_key")
    }

    pub fn feedback_upload_timeout(&self) -> Duration {
        Duration::from_secs(self.feedback_upload_timeout_seconds)
    }

    pub fn feedback_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.feedback_upload_retry_backoff_ms)
    }

    pub fn session_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.session_cache_ttl_seconds)
    }

    pub fn data_directory(&self) -> PathBuf {
        data_directory(&self.data_root_directory)
    }

    pub fn datastore_directory(&self) -> PathBuf {
        self.data_directory().join("datastore")
    }
}

fn validate_upload_url(url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url).with_context(|| format!("parsing upload URL {url:?}"))?;
    ensure!(
        matches!(parsed.scheme(), "http" | "https"),
        "upload URL {url:?} must be http or https"
    );
    ensure!(parsed.host().is_some(), "upload URL {url:?} has no host");
    Ok(())
}

/// Directory this crate keeps its files in under `root`.
pub fn data_directory(root: &Path) -> PathBuf {
    root.join(DATA_DIRECTORY_NAME)
}

pub fn homepage_file_path(root: &Path) -> PathBuf {
    data_directory(root).join("homepage")
}

pub fn notices_file_path(root: &Path) -> PathBuf {
    data_directory(root).join("notices")
}

pub fn old_notices_file_path(root: &Path) -> PathBuf {
    data_directory(root).join("notices.1")
}

pub fn upgrade_download_file_path(root: &Path) -> PathBuf {
    data_directory(root).join("upgrade")
}
