//! Connection Tracker Table
//!
//! Remembers, per outgoing flow, which application sent it and which
//! tunnel carried it. Two tunnels may share a subnet, so the destination
//! address of a reply alone cannot say where it belongs; the tracker can.

use crate::config::{AppId, TunnelId};
use crate::packet::FlowTuple;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A tracked flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedFlow {
    pub app: AppId,
    pub tunnel: TunnelId,
    pub last_seen: Instant,
}

/// FlowKey -> tunnel table shared by the egress and ingress workers
pub struct ConnectionTracker {
    flows: DashMap<FlowTuple, TrackedFlow>,
    idle_timeout: Duration,
}

impl ConnectionTracker {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            flows: DashMap::new(),
            idle_timeout,
        }
    }

    /// Insert or refresh a flow. Returns the previous tunnel when the
    /// flow moved to a different one.
    pub fn record(&self, flow: FlowTuple, app: &AppId, tunnel: &TunnelId) -> Option<TunnelId> {
        self.record_at(flow, app, tunnel, Instant::now())
    }

    pub(crate) fn record_at(
        &self,
        flow: FlowTuple,
        app: &AppId,
        tunnel: &TunnelId,
        now: Instant,
    ) -> Option<TunnelId> {
        let mut previous = None;

        self.flows
            .entry(flow)
            .and_modify(|entry| {
                if &entry.tunnel != tunnel {
                    previous = Some(std::mem::replace(&mut entry.tunnel, tunnel.clone()));
                }
                if &entry.app != app {
                    entry.app = app.clone();
                }
                entry.last_seen = now;
            })
            .or_insert_with(|| TrackedFlow {
                app: app.clone(),
                tunnel: tunnel.clone(),
                last_seen: now,
            });

        previous
    }

    pub fn get(&self, flow: &FlowTuple) -> Option<TrackedFlow> {
        self.flows.get(flow).map(|e| e.value().clone())
    }

    /// Tunnel that carried the flow an inbound packet replies to
    pub fn tunnel_for_reply(&self, inbound: &FlowTuple) -> Option<TunnelId> {
        self.flows
            .get(&inbound.reversed())
            .map(|e| e.value().tunnel.clone())
    }

    /// Aggregate application -> current tunnel view.
    ///
    /// An application with flows on several tunnels reports the one it
    /// used most recently.
    pub fn snapshot(&self) -> HashMap<AppId, TunnelId> {
        let mut latest: HashMap<AppId, (Instant, TunnelId)> = HashMap::new();

        for entry in self.flows.iter() {
            let flow = entry.value();
            match latest.get(&flow.app) {
                Some((seen, _)) if *seen >= flow.last_seen => {}
                _ => {
                    latest.insert(flow.app.clone(), (flow.last_seen, flow.tunnel.clone()));
                }
            }
        }

        latest.into_iter().map(|(app, (_, tunnel))| (app, tunnel)).collect()
    }

    /// Forget a flow, but only while it still points at `tunnel`
    pub fn remove_if_tunnel(&self, flow: &FlowTuple, tunnel: &TunnelId) -> bool {
        self.flows.remove_if(flow, |_, tracked| &tracked.tunnel == tunnel).is_some()
    }

    /// Drop every flow carried by `tunnel`
    pub fn purge_tunnel(&self, tunnel: &TunnelId) -> usize {
        let before = self.flows.len();
        self.flows.retain(|_, flow| &flow.tunnel != tunnel);
        before.saturating_sub(self.flows.len())
    }

    /// Drop every flow belonging to one of `apps`
    pub fn purge_apps(&self, apps: &[AppId]) -> usize {
        if apps.is_empty() {
            return 0;
        }
        let before = self.flows.len();
        self.flows.retain(|_, flow| !apps.contains(&flow.app));
        before.saturating_sub(self.flows.len())
    }

    /// Evict flows idle for longer than the configured timeout
    pub fn evict_idle(&self, now: Instant) -> usize {
        let before = self.flows.len();
        let timeout = self.idle_timeout;
        self.flows
            .retain(|_, flow| now.saturating_duration_since(flow.last_seen) <= timeout);
        before.saturating_sub(self.flows.len())
    }

    pub fn clear(&self) {
        self.flows.clear();
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}
