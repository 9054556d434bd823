//! Configuration Store
//!
//! Source of tunnel definitions and application rules. The router only
//! reads: it lists definitions at start and then follows both collections
//! through watch receivers, each of which always holds the full current
//! list.

use crate::config::{AppId, AppRule, ProfileFile, TunnelDefinition, TunnelId};
use tokio::sync::watch;

pub trait ConfigStore: Send + Sync {
    fn list_tunnel_definitions(&self) -> Vec<TunnelDefinition>;

    fn observe_app_rules(&self) -> watch::Receiver<Vec<AppRule>>;

    fn observe_tunnel_definitions(&self) -> watch::Receiver<Vec<TunnelDefinition>>;
}

/// Store held in memory; the host application edits it directly
pub struct MemoryStore {
    rules: watch::Sender<Vec<AppRule>>,
    tunnels: watch::Sender<Vec<TunnelDefinition>>,
}

impl MemoryStore {
    pub fn new(tunnels: Vec<TunnelDefinition>, rules: Vec<AppRule>) -> Self {
        Self {
            rules: watch::channel(rules).0,
            tunnels: watch::channel(tunnels).0,
        }
    }

    pub fn from_profile(profile: &ProfileFile) -> Self {
        Self::new(profile.tunnels.clone(), profile.rules.clone())
    }

    pub fn rules(&self) -> Vec<AppRule> {
        self.rules.borrow().clone()
    }

    pub fn set_rules(&self, rules: Vec<AppRule>) {
        self.rules.send_replace(rules);
    }

    /// Insert or replace the rule for `rule.app`
    pub fn upsert_rule(&self, rule: AppRule) {
        self.rules.send_modify(|rules| match rules.iter_mut().find(|r| r.app == rule.app) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        });
    }

    pub fn remove_rule(&self, app: &AppId) {
        self.rules.send_if_modified(|rules| {
            let before = rules.len();
            rules.retain(|r| r.app != *app);
            rules.len() != before
        });
    }

    pub fn set_tunnels(&self, tunnels: Vec<TunnelDefinition>) {
        self.tunnels.send_replace(tunnels);
    }

    /// Insert a definition or replace the one with the same id
    pub fn upsert_tunnel(&self, definition: TunnelDefinition) {
        let id = definition.id();
        self.tunnels.send_modify(|tunnels| match tunnels.iter_mut().find(|t| t.id() == id) {
            Some(existing) => *existing = definition,
            None => tunnels.push(definition),
        });
    }

    pub fn remove_tunnel(&self, id: &TunnelId) {
        self.tunnels.send_if_modified(|tunnels| {
            let before = tunnels.len();
            tunnels.retain(|t| t.id() != *id);
            tunnels.len() != before
        });
    }
}

impl ConfigStore for MemoryStore {
    fn list_tunnel_definitions(&self) -> Vec<TunnelDefinition> {
        self.tunnels.borrow().clone()
    }

    fn observe_app_rules(&self) -> watch::Receiver<Vec<AppRule>> {
        self.rules.subscribe()
    }

    fn observe_tunnel_definitions(&self) -> watch::Receiver<Vec<TunnelDefinition>> {
        self.tunnels.subscribe()
    }
}
