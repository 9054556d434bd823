//! VPN Service
//!
//! The control surface the host application holds. It is constructed
//! explicitly with its collaborators (configuration store, virtual
//! interface, ownership lookup, adapter factory) and owns one routing
//! session between `start` and `stop`.
//!
//! # Usage
//!
//! ```rust,ignore
//! let service = VpnService::builder(store, interface, owners)
//!     .settings(settings)
//!     .factory(factory)
//!     .build();
//!
//! service.start().await?;
//! let ready = service.is_tunnel_ready_for_routing(&TunnelId::from("local-test_UK"))?;
//! let snapshot = service.connection_tracker_snapshot()?; // pkg.x -> local-test_UK
//! service.stop().await;
//! ```

use crate::adapter::{AdapterFactory, DefaultAdapterFactory};
use crate::backend::{TunnelStats, TunnelStatus};
use crate::classifier::{FlowClassifier, OwnershipLookup};
use crate::config::{AppId, RouterSettings, TunnelId};
use crate::dns::DnsAggregator;
use crate::error::{RouterError, RouterResult, TunnelFailure};
use crate::interface::{DirectPath, InterfaceSettings, VirtualInterface};
use crate::manager::ConnectionManager;
use crate::router::{self, IngressPath, PacketRouter, RouterMetrics, RouterStats};
use crate::routing::RoutingTable;
use crate::store::ConfigStore;
use crate::tracker::ConnectionTracker;
use arc_swap::ArcSwapOption;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Service-wide statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub router: RouterStats,
    pub tunnels: HashMap<TunnelId, TunnelStats>,
}

/// One start..stop session
struct Session {
    manager: Arc<ConnectionManager>,
    metrics: RouterMetrics,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Builder for `VpnService`
pub struct VpnServiceBuilder {
    settings: RouterSettings,
    store: Arc<dyn ConfigStore>,
    interface: Arc<dyn VirtualInterface>,
    ownership: Arc<dyn OwnershipLookup>,
    factory: Arc<dyn AdapterFactory>,
    direct: Option<Arc<dyn DirectPath>>,
}

impl VpnServiceBuilder {
    pub fn settings(mut self, settings: RouterSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn factory(mut self, factory: Arc<dyn AdapterFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Where unrouted traffic goes; without one it is dropped
    pub fn direct_path(mut self, direct: Arc<dyn DirectPath>) -> Self {
        self.direct = Some(direct);
        self
    }

    pub fn build(self) -> VpnService {
        VpnService {
            settings: self.settings,
            store: self.store,
            interface: self.interface,
            ownership: self.ownership,
            factory: self.factory,
            direct: self.direct,
            initialized: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
            session: ArcSwapOption::empty(),
        }
    }
}

/// Multi-tunnel VPN service
pub struct VpnService {
    settings: RouterSettings,
    store: Arc<dyn ConfigStore>,
    interface: Arc<dyn VirtualInterface>,
    ownership: Arc<dyn OwnershipLookup>,
    factory: Arc<dyn AdapterFactory>,
    direct: Option<Arc<dyn DirectPath>>,
    /// Set by the first successful start
    initialized: AtomicBool,
    /// Serializes start and stop
    lifecycle: tokio::sync::Mutex<()>,
    session: ArcSwapOption<Session>,
}

impl VpnService {
    pub fn builder(
        store: Arc<dyn ConfigStore>,
        interface: Arc<dyn VirtualInterface>,
        ownership: Arc<dyn OwnershipLookup>,
    ) -> VpnServiceBuilder {
        VpnServiceBuilder {
            settings: RouterSettings::default(),
            store,
            interface,
            ownership,
            factory: Arc::new(DefaultAdapterFactory::new()),
            direct: None,
        }
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    /// Open the interface and start routing. Starting a running service
    /// is a no-op.
    ///
    /// Only a failure to open the interface (or invalid settings) is
    /// fatal; tunnels that fail to connect are reported per tunnel.
    pub async fn start(&self) -> RouterResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.session.load().is_some() {
            return Ok(());
        }

        self.settings.validate()?;
        let address = self.settings.interface_cidr()?;

        let dns = Arc::new(DnsAggregator::new(self.settings.fallback_dns.clone()));
        let io = self
            .interface
            .open(
                InterfaceSettings::new(address, dns.current(), self.settings.interface_mtu)
                    .with_queue_capacity(self.settings.interface_queue_capacity),
            )
            .await?;

        let rules = self.store.observe_app_rules();
        let definitions = self.store.observe_tunnel_definitions();
        let routing = Arc::new(RoutingTable::from_rules(&rules.borrow()));

        let tracker = Arc::new(ConnectionTracker::new(self.settings.flow_idle_timeout()));
        let metrics = RouterMetrics::new();
        let ingress = Arc::new(IngressPath::new(tracker.clone(), io.writer, metrics.clone()));

        let manager = ConnectionManager::new(
            self.settings.clone(),
            self.factory.clone(),
            routing.clone(),
            tracker.clone(),
            dns.clone(),
            ingress,
        );
        manager.connect_all(&self.store.list_tunnel_definitions());

        let router = Arc::new(PacketRouter::new(
            &self.settings,
            FlowClassifier::new(self.ownership.clone()),
            routing.clone(),
            manager.clone(),
            self.direct.clone(),
            metrics.clone(),
        ));

        let tasks = vec![
            tokio::spawn(router.run(io.reader)),
            tokio::spawn(router::follow_config(routing, manager.clone(), rules, definitions)),
            tokio::spawn(router::propagate_dns(dns, self.interface.clone())),
            tokio::spawn(router::evict_idle_flows(tracker)),
        ];

        self.session.store(Some(Arc::new(Session {
            manager,
            metrics,
            tasks: Mutex::new(tasks),
        })));
        self.initialized.store(true, Ordering::Release);

        info!("VPN service started ({}/{})", address.0, address.1);
        Ok(())
    }

    /// Stop routing, close every tunnel and the interface. Stopping a
    /// stopped service is a no-op. Once this returns `is_running()` is
    /// false and the tracker snapshot is empty.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(session) = self.session.swap(None) else {
            return;
        };

        info!("Stopping VPN service");
        if let Ok(mut tasks) = session.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        session.manager.close_all().await;
        self.interface.close().await;
        info!("VPN service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.session.load().is_some()
    }

    fn manager(&self) -> RouterResult<Option<Arc<ConnectionManager>>> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(RouterError::NotInitialized);
        }
        Ok(self.session.load().as_ref().map(|s| s.manager.clone()))
    }

    /// Application -> tunnel view of the connection tracker
    pub fn connection_tracker_snapshot(&self) -> RouterResult<HashMap<AppId, TunnelId>> {
        Ok(self
            .manager()?
            .map(|m| m.tracker().snapshot())
            .unwrap_or_default())
    }

    pub fn is_tunnel_connected(&self, id: &TunnelId) -> RouterResult<bool> {
        Ok(self.manager()?.is_some_and(|m| m.is_connected(id)))
    }

    pub fn is_tunnel_ready_for_routing(&self, id: &TunnelId) -> RouterResult<bool> {
        Ok(self.manager()?.is_some_and(|m| m.is_ready_for_routing(id)))
    }

    pub fn tunnel_status(&self, id: &TunnelId) -> RouterResult<Option<TunnelStatus>> {
        Ok(self.manager()?.and_then(|m| m.status(id)))
    }

    pub fn tunnel_last_error(&self, id: &TunnelId) -> RouterResult<Option<TunnelFailure>> {
        Ok(self.manager()?.and_then(|m| m.last_error(id)))
    }

    /// Close one tunnel; the others keep running
    pub async fn close_tunnel(&self, id: &TunnelId) -> RouterResult<bool> {
        match self.manager()? {
            Some(manager) => Ok(manager.close_tunnel(id).await),
            None => Ok(false),
        }
    }

    /// Network connectivity changed: reconnect every live tunnel
    pub fn network_changed(&self) -> RouterResult<()> {
        match self.manager()? {
            Some(manager) => manager.reconnect_all(),
            None => warn!("Network change ignored, service not running"),
        }
        Ok(())
    }

    pub fn stats(&self) -> RouterResult<ServiceStats> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(RouterError::NotInitialized);
        }
        Ok(self
            .session
            .load()
            .as_ref()
            .map(|s| ServiceStats {
                router: s.metrics.snapshot(),
                tunnels: s.manager.stats(),
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{SocketKey, SocketOwnerTable};
    use crate::config::{AppRule, TunnelDefinition};
    use crate::interface::{HostEnd, MemoryInterface};
    use crate::packet::{IPPROTO_TCP, Transport};
    use crate::store::MemoryStore;
    use crate::testing::{MockFactory, MockScript, ipv4_packet, reply_to, wait_until, wg_definition};
    use bytes::Bytes;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    const APP_IP: [u8; 4] = [10, 111, 0, 1];

    struct Harness {
        service: VpnService,
        store: Arc<MemoryStore>,
        interface: Arc<MemoryInterface>,
        factory: Arc<MockFactory>,
    }

    fn harness(regions: &[&str], rules: Vec<AppRule>) -> Harness {
        let definitions: Vec<TunnelDefinition> =
            regions.iter().map(|r| wg_definition("local-test", r)).collect();
        let store = Arc::new(MemoryStore::new(definitions, rules));
        let interface = Arc::new(MemoryInterface::new());
        let factory = MockFactory::echoing();

        let owners = Arc::new(SocketOwnerTable::new());
        for (port, app) in [(40001, "pkg.x"), (40002, "pkg.y"), (40003, "pkg.z")] {
            owners.register(
                SocketKey::new(Transport::Tcp, IpAddr::V4(Ipv4Addr::from(APP_IP)), port),
                AppId::from(app),
            );
        }

        let service = VpnService::builder(store.clone(), interface.clone(), owners)
            .factory(factory.clone())
            .build();
        Harness {
            service,
            store,
            interface,
            factory,
        }
    }

    fn id(s: &str) -> TunnelId {
        TunnelId::from(s)
    }

    /// Same remote address for every app: both tunnels use one subnet
    fn packet_from(port: u16) -> Vec<u8> {
        ipv4_packet(IPPROTO_TCP, APP_IP, port, [10, 8, 0, 1], 443, &[0; 20])
    }

    async fn recv(host: &mut HostEnd) -> Bytes {
        tokio::time::timeout(Duration::from_secs(5), host.recv())
            .await
            .expect("no packet from the router")
            .expect("interface closed")
    }

    #[tokio::test]
    async fn test_queries_before_start_fail_loudly() {
        let h = harness(&["UK"], Vec::new());

        assert!(matches!(
            h.service.is_tunnel_connected(&id("local-test_UK")),
            Err(RouterError::NotInitialized)
        ));
        assert!(matches!(
            h.service.connection_tracker_snapshot(),
            Err(RouterError::NotInitialized)
        ));
        assert!(matches!(h.service.stats(), Err(RouterError::NotInitialized)));
        assert!(!h.service.is_running());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let h = harness(&["UK"], vec![AppRule::route("pkg.x", "local-test_UK")]);

        h.service.start().await.unwrap();
        h.service.start().await.unwrap();
        assert!(h.service.is_running());
        assert_eq!(h.interface.open_count(), 1);
        assert_eq!(
            h.interface.settings().unwrap().queue_capacity,
            RouterSettings::default().interface_queue_capacity
        );

        wait_until(|| h.service.is_tunnel_ready_for_routing(&id("local-test_UK")).unwrap()).await;
        assert_eq!(h.factory.created("local-test_UK"), 1);
        h.service.stop().await;
    }

    #[tokio::test]
    async fn test_interface_failure_is_fatal() {
        let h = harness(&["UK"], vec![AppRule::route("pkg.x", "local-test_UK")]);
        h.interface.set_fail_open(true);

        assert!(matches!(
            h.service.start().await,
            Err(RouterError::InterfaceOpen(_))
        ));
        assert!(!h.service.is_running());
        assert_eq!(h.factory.created("local-test_UK"), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_clears_state() {
        let h = harness(&["UK"], vec![AppRule::route("pkg.x", "local-test_UK")]);
        h.service.start().await.unwrap();
        let mut host = h.interface.take_host().unwrap();
        wait_until(|| h.service.is_tunnel_ready_for_routing(&id("local-test_UK")).unwrap()).await;

        assert!(host.send(Bytes::from(packet_from(40001))).await);
        recv(&mut host).await;
        assert_eq!(h.service.connection_tracker_snapshot().unwrap().len(), 1);

        h.service.stop().await;
        assert!(!h.service.is_running());
        assert!(h.service.connection_tracker_snapshot().unwrap().is_empty());
        assert!(!h.service.is_tunnel_connected(&id("local-test_UK")).unwrap());
        assert!(!h.interface.is_open());
        assert!(h.factory.adapter("local-test_UK").unwrap().disconnects() >= 1);

        h.service.stop().await;
        assert!(!h.service.is_running());
        assert!(h.service.connection_tracker_snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let h = harness(&["UK"], vec![AppRule::route("pkg.x", "local-test_UK")]);
        h.service.start().await.unwrap();
        h.service.stop().await;

        h.service.start().await.unwrap();
        assert!(h.service.is_running());
        wait_until(|| h.service.is_tunnel_ready_for_routing(&id("local-test_UK")).unwrap()).await;
        assert_eq!(h.interface.open_count(), 2);
        h.service.stop().await;
    }

    #[tokio::test]
    async fn test_remap_scenario() {
        let h = harness(&["UK", "FR"], vec![AppRule::route("pkg.x", "local-test_UK")]);
        h.service.start().await.unwrap();
        let mut host = h.interface.take_host().unwrap();

        let uk = id("local-test_UK");
        let fr = id("local-test_FR");
        wait_until(|| h.service.is_tunnel_ready_for_routing(&uk).unwrap()).await;
        assert!(!h.service.is_tunnel_connected(&fr).unwrap());

        assert!(host.send(Bytes::from(packet_from(40001))).await);
        recv(&mut host).await;
        assert_eq!(
            h.service.connection_tracker_snapshot().unwrap().get(&AppId::from("pkg.x")),
            Some(&uk)
        );

        h.store.upsert_rule(AppRule::route("pkg.x", "local-test_FR"));

        let remapped = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if h.service.is_tunnel_ready_for_routing(&fr).unwrap() {
                    host.send(Bytes::from(packet_from(40001))).await;
                    let snapshot = h.service.connection_tracker_snapshot().unwrap();
                    if snapshot.get(&AppId::from("pkg.x")) == Some(&fr) {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(remapped.is_ok(), "pkg.x was not remapped to FR");

        // UK is no longer referenced by any rule
        wait_until(|| !h.service.is_tunnel_connected(&uk).unwrap()).await;
        h.service.stop().await;
    }

    #[tokio::test]
    async fn test_identical_subnets_stay_isolated() {
        let h = harness(
            &["UK", "FR"],
            vec![
                AppRule::route("pkg.x", "local-test_UK"),
                AppRule::route("pkg.y", "local-test_FR"),
            ],
        );
        h.service.start().await.unwrap();
        let mut host = h.interface.take_host().unwrap();
        wait_until(|| {
            h.service.is_tunnel_ready_for_routing(&id("local-test_UK")).unwrap()
                && h.service.is_tunnel_ready_for_routing(&id("local-test_FR")).unwrap()
        })
        .await;

        let from_x = packet_from(40001);
        let from_y = packet_from(40002);
        assert!(host.send(Bytes::from(from_x.clone())).await);
        assert!(host.send(Bytes::from(from_y.clone())).await);

        let mut replies = vec![recv(&mut host).await, recv(&mut host).await];
        replies.sort();
        let mut expected = vec![Bytes::from(reply_to(&from_x)), Bytes::from(reply_to(&from_y))];
        expected.sort();
        assert_eq!(replies, expected);

        let uk_adapter = h.factory.adapter("local-test_UK").unwrap();
        let fr_adapter = h.factory.adapter("local-test_FR").unwrap();
        assert_eq!(uk_adapter.sent(), vec![Bytes::from(from_x.clone())]);
        assert_eq!(fr_adapter.sent(), vec![Bytes::from(from_y)]);

        // A reply to pkg.x's flow arriving through FR is never delivered
        fr_adapter.inject(Bytes::from(reply_to(&from_x)));
        wait_until(|| h.service.stats().unwrap().router.dropped_cross_delivery == 1).await;
        assert!(host.try_recv().is_none());
        h.service.stop().await;
    }

    #[tokio::test]
    async fn test_closing_one_tunnel_keeps_others() {
        let h = harness(
            &["UK", "FR", "DE"],
            vec![
                AppRule::route("pkg.x", "local-test_UK"),
                AppRule::route("pkg.y", "local-test_FR"),
                AppRule::route("pkg.z", "local-test_DE"),
            ],
        );
        h.service.start().await.unwrap();
        let all = [id("local-test_UK"), id("local-test_FR"), id("local-test_DE")];
        wait_until(|| all.iter().all(|t| h.service.is_tunnel_connected(t).unwrap())).await;

        assert!(h.service.close_tunnel(&all[0]).await.unwrap());
        assert!(!h.service.is_tunnel_connected(&all[0]).unwrap());
        assert!(h.service.is_tunnel_connected(&all[1]).unwrap());
        assert!(h.service.is_tunnel_connected(&all[2]).unwrap());
        h.service.stop().await;
    }

    #[tokio::test]
    async fn test_readiness_waits_for_dns() {
        let h = harness(&["UK"], vec![AppRule::route("pkg.x", "local-test_UK")]);
        h.factory.script("local-test_UK", MockScript::NoDns);
        h.service.start().await.unwrap();

        let uk = id("local-test_UK");
        wait_until(|| h.service.is_tunnel_connected(&uk).unwrap()).await;
        let status = h.service.tunnel_status(&uk).unwrap().unwrap();
        assert!(status.address.is_some());
        assert!(!h.service.is_tunnel_ready_for_routing(&uk).unwrap());
        h.service.stop().await;
    }

    #[tokio::test]
    async fn test_tunnel_dns_reaches_interface() {
        let h = harness(&["UK"], vec![AppRule::route("pkg.x", "local-test_UK")]);
        h.service.start().await.unwrap();

        let tunnel_dns = vec![IpAddr::V4(Ipv4Addr::new(10, 8, 0, 1))];
        wait_until(|| h.interface.settings().is_some_and(|s| s.dns_servers == tunnel_dns)).await;
        assert_eq!(h.interface.dns_history()[0], RouterSettings::default().fallback_dns);
        h.service.stop().await;
    }

    #[tokio::test]
    async fn test_network_change_reconnects() {
        let h = harness(&["UK"], vec![AppRule::route("pkg.x", "local-test_UK")]);
        assert!(matches!(h.service.network_changed(), Err(RouterError::NotInitialized)));

        h.service.start().await.unwrap();
        let uk = id("local-test_UK");
        wait_until(|| h.service.is_tunnel_ready_for_routing(&uk).unwrap()).await;

        h.service.network_changed().unwrap();
        h.service.network_changed().unwrap();
        let adapter = h.factory.adapter("local-test_UK").unwrap();
        wait_until(|| adapter.connects() == 2 && h.service.is_tunnel_ready_for_routing(&uk).unwrap()).await;
        assert_eq!(h.factory.created("local-test_UK"), 1);
        h.service.stop().await;
    }
}
