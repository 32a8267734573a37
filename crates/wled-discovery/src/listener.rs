//! Passive discovery through mDNS service advertisements
//!
//! Each newly advertised service is connected to, resolved to a concrete
//! address, verified as a WLED device and handed to the reconciler. Services
//! that fail verification are logged and dropped. A failed browse session
//! ends the listener; restarting it is up to the caller.

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use wled_client::DeviceApi;
use wled_core::strip_zone;

use crate::probe::DEFAULT_CONNECT_TIMEOUT_MS;
use crate::reconcile::Reconciler;

/// Service type WLED advertises its web server under
pub const DEFAULT_SERVICE_TYPE: &str = "_http._tcp.local.";

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("mDNS error: {0}")]
    Mdns(String),
    #[error("Discovery listener already running")]
    AlreadyRunning,
}

/// Change to the set of advertised services
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseEvent {
    Resolved {
        name: String,
        addresses: Vec<IpAddr>,
        port: u16,
    },
    Removed {
        name: String,
    },
    /// The browse session broke and will deliver nothing more
    Failed(String),
}

/// Source of service advertisements
#[async_trait]
pub trait ServiceBrowser: Send + Sync {
    async fn browse(
        &self,
        service_type: &str,
    ) -> Result<mpsc::UnboundedReceiver<BrowseEvent>, ListenerError>;

    fn stop(&self, service_type: &str);
}

/// Service browser backed by the `mdns-sd` daemon
pub struct MdnsBrowser {
    daemon: ServiceDaemon,
}

impl MdnsBrowser {
    pub fn new() -> Result<Self, ListenerError> {
        let daemon = ServiceDaemon::new().map_err(|e| ListenerError::Mdns(e.to_string()))?;
        Ok(Self { daemon })
    }

    pub fn shutdown(&self) {
        if let Err(e) = self.daemon.shutdown() {
            debug!(error = %e, "mDNS daemon shutdown failed");
        }
    }
}

#[async_trait]
impl ServiceBrowser for MdnsBrowser {
    async fn browse(
        &self,
        service_type: &str,
    ) -> Result<mpsc::UnboundedReceiver<BrowseEvent>, ListenerError> {
        let receiver = self
            .daemon
            .browse(service_type)
            .map_err(|e| ListenerError::Mdns(e.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let suffix = format!(".{}", service_type);

        tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                let forwarded = match event {
                    ServiceEvent::ServiceResolved(info) => BrowseEvent::Resolved {
                        name: instance_name(info.get_fullname(), &suffix),
                        addresses: info.get_addresses().iter().copied().collect(),
                        port: info.get_port(),
                    },
                    ServiceEvent::ServiceRemoved(_, fullname) => BrowseEvent::Removed {
                        name: instance_name(&fullname, &suffix),
                    },
                    ServiceEvent::SearchStopped(_) => break,
                    _ => continue,
                };
                if tx.send(forwarded).is_err() {
                    break;
                }
            }
            trace!("mDNS browse stream ended");
        });

        Ok(rx)
    }

    fn stop(&self, service_type: &str) {
        if let Err(e) = self.daemon.stop_browse(service_type) {
            debug!(error = %e, "Failed to stop mDNS browse");
        }
    }
}

/// `Porch._http._tcp.local.` -> `Porch`
fn instance_name(fullname: &str, suffix: &str) -> String {
    fullname
        .strip_suffix(suffix)
        .unwrap_or(fullname)
        .replace("\\032", " ")
}

pub struct DiscoveryListener {
    browser: Arc<dyn ServiceBrowser>,
    api: Arc<dyn DeviceApi>,
    reconciler: Arc<Reconciler>,
    service_type: String,
    connect_timeout: Duration,
    session: Mutex<Option<CancellationToken>>,
}

impl DiscoveryListener {
    pub fn new(
        browser: Arc<dyn ServiceBrowser>,
        api: Arc<dyn DeviceApi>,
        reconciler: Arc<Reconciler>,
        service_type: &str,
    ) -> Self {
        Self {
            browser,
            api,
            reconciler,
            service_type: service_type.to_string(),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            session: Mutex::new(None),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub async fn is_running(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Start browsing; runs until `stop` or a browse failure
    pub async fn start(self: &Arc<Self>) -> Result<(), ListenerError> {
        let mut session = self.session.lock().await;
        if session.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return Err(ListenerError::AlreadyRunning);
        }

        let events = self.browser.browse(&self.service_type).await?;
        let token = CancellationToken::new();
        info!(service_type = %self.service_type, "Discovery listener started");

        let listener = Arc::clone(self);
        let cancel = token.clone();
        tokio::spawn(async move { listener.run(events, cancel).await });

        *session = Some(token);
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(token) = self.session.lock().await.take() {
            token.cancel();
        }
    }

    async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<BrowseEvent>,
        cancel: CancellationToken,
    ) {
        let mut seen = HashSet::new();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Some(BrowseEvent::Resolved {
                    name,
                    addresses,
                    port,
                }) => {
                    if !seen.insert(name.clone()) {
                        trace!(service = %name, "Service already seen");
                        continue;
                    }
                    debug!(service = %name, port, "Service advertised");
                    let listener = Arc::clone(&self);
                    tokio::spawn(async move { listener.handle_service(name, addresses, port).await });
                }
                Some(BrowseEvent::Removed { name }) => {
                    debug!(service = %name, "Service withdrawn");
                }
                Some(BrowseEvent::Failed(reason)) => {
                    warn!(reason = %reason, "mDNS browse failed, stopping listener");
                    break;
                }
                None => {
                    warn!("mDNS browse session ended");
                    break;
                }
            }
        }

        self.browser.stop(&self.service_type);
        cancel.cancel();
        info!(service_type = %self.service_type, "Discovery listener stopped");
    }

    async fn handle_service(&self, name: String, mut addresses: Vec<IpAddr>, port: u16) {
        // IPv4 first: link-local IPv6 is often unroutable from here
        addresses.sort_by_key(|ip| ip.is_ipv6());

        let Some(address) = self.connect_any(&addresses, port).await else {
            debug!(service = %name, "Advertised service unreachable");
            return;
        };

        match self.api.verify(&address).await {
            Ok(identity) => {
                debug!(service = %name, address = %address, version = ?identity.version, "Verified advertised device");
                if let Err(e) = self
                    .reconciler
                    .reconcile(&address, &name, Some(&identity.info))
                    .await
                {
                    warn!(service = %name, address = %address, error = %e, "Failed to reconcile advertised device");
                }
            }
            Err(e) => {
                debug!(service = %name, address = %address, error = %e, "Advertised service is not a WLED device");
            }
        }
    }

    /// Connect to the first reachable endpoint and return the peer address
    async fn connect_any(&self, addresses: &[IpAddr], port: u16) -> Option<String> {
        for ip in addresses {
            let target = SocketAddr::new(*ip, port);
            match timeout(self.connect_timeout, TcpStream::connect(target)).await {
                Ok(Ok(stream)) => {
                    let peer = stream.peer_addr().map(|p| p.ip()).unwrap_or(*ip);
                    return Some(strip_zone(&peer.to_string()).to_string());
                }
                Ok(Err(e)) => trace!(target = %target, error = %e, "Connect failed"),
                Err(_) => trace!(target = %target, "Connect timed out"),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{empty_store, reconciler, FakeApi};
    use crate::request::SharedStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    struct FakeBrowser {
        events: StdMutex<Option<mpsc::UnboundedReceiver<BrowseEvent>>>,
        stopped: AtomicBool,
    }

    impl FakeBrowser {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<BrowseEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let browser = Arc::new(Self {
                events: StdMutex::new(Some(rx)),
                stopped: AtomicBool::new(false),
            });
            (browser, tx)
        }
    }

    #[async_trait]
    impl ServiceBrowser for FakeBrowser {
        async fn browse(
            &self,
            _service_type: &str,
        ) -> Result<mpsc::UnboundedReceiver<BrowseEvent>, ListenerError> {
            self.events
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| ListenerError::Mdns("browse already started".to_string()))
        }

        fn stop(&self, _service_type: &str) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    struct Harness {
        listener: Arc<DiscoveryListener>,
        browser: Arc<FakeBrowser>,
        events: mpsc::UnboundedSender<BrowseEvent>,
        api: Arc<FakeApi>,
        store: SharedStore,
    }

    fn harness(api: FakeApi) -> Harness {
        let api = Arc::new(api);
        let store = empty_store();
        let (reconciler, _) = reconciler(api.clone(), store.clone());
        let (browser, events) = FakeBrowser::new();
        let listener = Arc::new(
            DiscoveryListener::new(browser.clone(), api.clone(), reconciler, DEFAULT_SERVICE_TYPE)
                .with_connect_timeout(Duration::from_millis(500)),
        );
        Harness {
            listener,
            browser,
            events,
            api,
            store,
        }
    }

    fn localhost(name: &str, port: u16) -> BrowseEvent {
        BrowseEvent::Resolved {
            name: name.to_string(),
            addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            port,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_instance_name() {
        assert_eq!(instance_name("Porch._http._tcp.local.", "._http._tcp.local."), "Porch");
        assert_eq!(
            instance_name("Living\\032Room._http._tcp.local.", "._http._tcp.local."),
            "Living Room"
        );
    }

    #[tokio::test]
    async fn test_verified_service_is_reconciled_once() {
        let device = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = device.local_addr().unwrap().port();
        // Refreshes stay parked so the record shows what verification saw
        let h = harness(FakeApi::new().gated());

        h.listener.start().await.unwrap();
        h.events.send(localhost("wled-porch", port)).unwrap();
        h.events.send(localhost("wled-porch", port)).unwrap();

        let store = h.store.clone();
        assert!(eventually(|| store.try_lock().is_ok_and(|s| s.find("127.0.0.1").is_some())).await);

        let record = h.store.lock().await.find("127.0.0.1").unwrap();
        assert_eq!(record.name, "wled-porch");
        assert!(record.is_online);
        let info = record.info.unwrap();
        assert_eq!(info.name.as_deref(), Some("WLED 127.0.0.1"));
        assert_eq!(info.version.as_deref(), Some("0.15.0"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.api.verify_calls.load(Ordering::SeqCst), 1);

        h.listener.stop().await;
    }

    #[tokio::test]
    async fn test_unverified_service_is_discarded() {
        let device = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = device.local_addr().unwrap().port();
        let h = harness(FakeApi::new().rejecting("127.0.0.1"));

        h.listener.start().await.unwrap();
        h.events.send(localhost("printer", port)).unwrap();

        let api = h.api.clone();
        assert!(eventually(|| api.verify_calls.load(Ordering::SeqCst) == 1).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.store.lock().await.list().is_empty());
        assert!(h.listener.is_running().await);
    }

    #[tokio::test]
    async fn test_unreachable_service_is_not_verified() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);
        let h = harness(FakeApi::new());

        h.listener.start().await.unwrap();
        h.events.send(localhost("ghost", port)).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.api.verify_calls.load(Ordering::SeqCst), 0);
        assert!(h.store.lock().await.list().is_empty());
    }

    #[tokio::test]
    async fn test_browse_failure_stops_without_retry() {
        let h = harness(FakeApi::new());

        h.listener.start().await.unwrap();
        assert!(matches!(
            h.listener.start().await,
            Err(ListenerError::AlreadyRunning)
        ));
        h.events
            .send(BrowseEvent::Failed("socket closed".to_string()))
            .unwrap();

        let browser = h.browser.clone();
        assert!(eventually(|| browser.stopped.load(Ordering::SeqCst)).await);
        assert!(!h.listener.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_tears_down_browse() {
        let h = harness(FakeApi::new());

        h.listener.start().await.unwrap();
        h.listener.stop().await;

        let browser = h.browser.clone();
        assert!(eventually(|| browser.stopped.load(Ordering::SeqCst)).await);
        assert!(!h.listener.is_running().await);
    }
}
