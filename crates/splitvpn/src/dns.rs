//! DNS Aggregation
//!
//! Tunnels report DNS servers as they come up. The shared interface only
//! carries one resolver list, so the servers of every Ready tunnel are
//! merged (ordered by tunnel id, duplicates removed) and published on a
//! watch channel. The fallback list applies while no tunnel has reported.

use crate::config::TunnelId;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::debug;

pub struct DnsAggregator {
    fallback: Vec<IpAddr>,
    per_tunnel: Mutex<BTreeMap<TunnelId, Vec<IpAddr>>>,
    tx: watch::Sender<Vec<IpAddr>>,
}

impl DnsAggregator {
    pub fn new(fallback: Vec<IpAddr>) -> Self {
        let (tx, _) = watch::channel(fallback.clone());
        Self {
            fallback,
            per_tunnel: Mutex::new(BTreeMap::new()),
            tx,
        }
    }

    /// Record the servers a tunnel reported. Returns true if the
    /// effective list changed.
    pub fn update(&self, tunnel: &TunnelId, servers: Vec<IpAddr>) -> bool {
        if servers.is_empty() {
            return self.remove(tunnel);
        }
        let Ok(mut map) = self.per_tunnel.lock() else {
            return false;
        };
        map.insert(tunnel.clone(), servers);
        self.publish(&map)
    }

    /// Forget a tunnel's servers
    pub fn remove(&self, tunnel: &TunnelId) -> bool {
        let Ok(mut map) = self.per_tunnel.lock() else {
            return false;
        };
        if map.remove(tunnel).is_none() {
            return false;
        }
        self.publish(&map)
    }

    pub fn clear(&self) {
        if let Ok(mut map) = self.per_tunnel.lock() {
            map.clear();
            self.publish(&map);
        }
    }

    /// Effective resolver list
    pub fn current(&self) -> Vec<IpAddr> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<IpAddr>> {
        self.tx.subscribe()
    }

    fn publish(&self, map: &BTreeMap<TunnelId, Vec<IpAddr>>) -> bool {
        let mut merged: Vec<IpAddr> = Vec::new();
        for server in map.values().flatten() {
            if !merged.contains(server) {
                merged.push(*server);
            }
        }
        if merged.is_empty() {
            merged = self.fallback.clone();
        }

        self.tx.send_if_modified(|current| {
            if *current == merged {
                return false;
            }
            debug!("DNS servers now {:?}", merged);
            *current = merged;
            true
        })
    }
}
