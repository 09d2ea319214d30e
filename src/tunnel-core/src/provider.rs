//! Host capability interfaces and the callback proxy.
//!
//! The host application implements [`Provider`] (or, for feedback, the
//! narrower [`NoticeHandler`] and [`NetworkQuery`]). Inside the crate the
//! configuration only ever sees the typed capability traits below; the
//! comma-delimited DNS encoding is decoded here, at the boundary.

use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;
use tracing::trace;

/// Receives JSON-encoded notices.
pub trait NoticeHandler: Send + Sync {
    fn notice(&self, notice_json: &str);
}

/// Network state queries answered by the host.
pub trait NetworkQuery: Send + Sync {
    fn has_network_connectivity(&self) -> bool;
    fn network_id(&self) -> String;
    fn ipv6_synthesize(&self, ipv4_addr: &str) -> String;
    fn has_ipv6_route(&self) -> bool;
}

/// Full callback surface supplied to `start`.
pub trait Provider: NoticeHandler + NetworkQuery {
    /// Bind a socket to the physical interface, returning the interface name.
    fn bind_to_device(&self, fd: i32) -> Result<String, String>;

    /// DNS servers as one comma-delimited string.
    fn dns_servers_as_string(&self) -> String;
}

pub trait NetworkConnectivityChecker: Send + Sync {
    fn has_network_connectivity(&self) -> bool;
}

pub trait NetworkIdGetter: Send + Sync {
    fn network_id(&self) -> String;
}

pub trait DnsServerGetter: Send + Sync {
    fn dns_servers(&self) -> Vec<String>;
}

pub trait DeviceBinder: Send + Sync {
    fn bind_to_device(&self, fd: i32) -> anyhow::Result<String>;
}

pub trait Ipv6Synthesizer: Send + Sync {
    fn ipv6_synthesize(&self, ipv4_addr: &str) -> String;
}

pub trait HasIpv6RouteGetter: Send + Sync {
    fn has_ipv6_route(&self) -> bool;
}

/// Optional callbacks, each bound only when its flag is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallbackFlags {
    pub use_device_binder: bool,
    pub use_ipv6_synthesizer: bool,
    pub use_has_ipv6_route_getter: bool,
}

/// Serialises every call into the host provider.
///
/// Hosts with managed runtimes may spawn a thread per inbound call, so the
/// proxy allows at most one call across the boundary at a time.
pub struct CallbackProxy {
    provider: Arc<dyn Provider>,
    gate: Mutex<()>,
}

impl CallbackProxy {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            gate: Mutex::new(()),
        }
    }

    fn call<T>(&self, f: impl FnOnce(&dyn Provider) -> T) -> T {
        let _gate = self.gate.lock();
        f(self.provider.as_ref())
    }
}

impl NoticeHandler for CallbackProxy {
    fn notice(&self, notice_json: &str) {
        self.call(|p| p.notice(notice_json))
    }
}

impl NetworkConnectivityChecker for CallbackProxy {
    fn has_network_connectivity(&self) -> bool {
        self.call(|p| p.has_network_connectivity())
    }
}

impl NetworkIdGetter for CallbackProxy {
    fn network_id(&self) -> String {
        self.call(|p| p.network_id())
    }
}

impl DnsServerGetter for CallbackProxy {
    fn dns_servers(&self) -> Vec<String> {
        let raw = self.call(|p| p.dns_servers_as_string());
        let servers = split_dns_servers(&raw);
        trace!(count = servers.len(), "dns servers from provider");
        servers
    }
}

impl DeviceBinder for CallbackProxy {
    fn bind_to_device(&self, fd: i32) -> anyhow::Result<String> {
        self.call(|p| p.bind_to_device(fd))
            .map_err(|e| anyhow!("binding fd {fd} to device: {e}"))
    }
}

impl Ipv6Synthesizer for CallbackProxy {
    fn ipv6_synthesize(&self, ipv4_addr: &str) -> String {
        self.call(|p| p.ipv6_synthesize(ipv4_addr))
    }
}

impl HasIpv6RouteGetter for CallbackProxy {
    fn has_ipv6_route(&self) -> bool {
        self.call(|p| p.has_ipv6_route())
    }
}

/// Decode the boundary's comma-delimited server list. Empty means none.
pub fn split_dns_servers(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split(',').map(str::to_string).collect()
}

/// Adapts a bare [`NetworkQuery`] for the feedback path. Not gated.
pub struct NetworkBinding {
    query: Arc<dyn NetworkQuery>,
}

impl NetworkBinding {
    pub fn new(query: Arc<dyn NetworkQuery>) -> Self {
        Self { query }
    }
}

impl NetworkConnectivityChecker for NetworkBinding {
    fn has_network_connectivity(&self) -> bool {
        self.query.has_network_connectivity()
    }
}

impl NetworkIdGetter for NetworkBinding {
    fn network_id(&self) -> String {
        self.query.network_id()
    }
}

impl Ipv6Synthesizer for NetworkBinding {
    fn ipv6_synthesize(&self, ipv4_addr: &str) -> String {
        self.query.ipv6_synthesize(ipv4_addr)
    }
}

impl HasIpv6RouteGetter for NetworkBinding {
    fn has_ipv6_route(&self) -> bool {
        self.query.has_ipv6_route()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Provider that detects overlapping calls.
    #[derive(Default)]
    struct ReentrancyRecorder {
        in_call: AtomicBool,
        overlaps: AtomicUsize,
        calls: AtomicUsize,
    }

    impl ReentrancyRecorder {
        fn enter(&self) {
            if self.in_call.swap(true, Ordering::SeqCst) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(2));
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.in_call.store(false, Ordering::SeqCst);
        }
    }

    impl NoticeHandler for ReentrancyRecorder {
        fn notice(&self, _: &str) {
            self.enter()
        }
    }

    impl NetworkQuery for ReentrancyRecorder {
        fn has_network_connectivity(&self) -> bool {
            self.enter();
            true
        }
        fn network_id(&self) -> String {
            self.enter();
            "WIFI-test".into()
        }
        fn ipv6_synthesize(&self, ipv4_addr: &str) -> String {
            self.enter();
            format!("64:ff9b::{ipv4_addr}")
        }
        fn has_ipv6_route(&self) -> bool {
            self.enter();
            false
        }
    }

    impl Provider for ReentrancyRecorder {
        fn bind_to_device(&self, fd: i32) -> Result<String, String> {
            self.enter();
            if fd < 0 {
                Err("bad fd".into())
            } else {
                Ok("wlan0".into())
            }
        }
        fn dns_servers_as_string(&self) -> String {
            self.enter();
            "1.1.1.1,8.8.8.8".into()
        }
    }

    #[test]
    fn concurrent_calls_never_overlap() {
        let recorder = Arc::new(ReentrancyRecorder::default());
        let proxy = Arc::new(CallbackProxy::new(recorder.clone()));

        let threads: Vec<_> = (0..16)
            .map(|i| {
                let proxy = proxy.clone();
                std::thread::spawn(move || match i % 4 {
                    0 => proxy.notice("{}"),
                    1 => {
                        proxy.has_network_connectivity();
                    }
                    2 => {
                        proxy.dns_servers();
                    }
                    _ => {
                        proxy.network_id();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(recorder.calls.load(Ordering::SeqCst), 16);
        assert_eq!(recorder.overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dns_list_decoding() {
        assert!(split_dns_servers("").is_empty());
        assert_eq!(split_dns_servers("9.9.9.9"), vec!["9.9.9.9"]);
        assert_eq!(
            split_dns_servers("1.1.1.1,2606:4700::1111"),
            vec!["1.1.1.1", "2606:4700::1111"]
        );
    }

    #[test]
    fn proxy_maps_bind_failure() {
        let proxy = CallbackProxy::new(Arc::new(ReentrancyRecorder::default()));
        assert_eq!(proxy.bind_to_device(3).unwrap(), "wlan0");
        let err = proxy.bind_to_device(-1).unwrap_err();
        assert!(err.to_string().contains("bad fd"));
        assert_eq!(proxy.dns_servers(), vec!["1.1.1.1", "8.8.8.8"]);
        assert_eq!(proxy.ipv6_synthesize("1.2.3.4"), "64:ff9b::1.2.3.4");
    }

    #[test]
    fn network_binding_forwards() {
        let binding = NetworkBinding::new(Arc::new(ReentrancyRecorder::default()));
        assert!(binding.has_network_connectivity());
        assert_eq!(binding.network_id(), "WIFI-test");
        assert!(!binding.has_ipv6_route());
    }
}
