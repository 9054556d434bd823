//! Routing Table (application -> tunnel)
//!
//! Read on every egress packet, written only when the user edits rules.
//! Readers load an immutable snapshot; writers build a new one and swap.

use crate::config::{AppId, AppRule, TunnelId};
use arc_swap::ArcSwap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Where an application's traffic goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub tunnel: TunnelId,
    pub fallback_to_direct: bool,
}

/// One immutable generation of the rule set
#[derive(Debug, Default)]
pub struct RoutingSnapshot {
    routes: HashMap<AppId, RouteEntry>,
    version: u64,
}

impl RoutingSnapshot {
    fn build(rules: &[AppRule], version: u64) -> Self {
        let routes = rules
            .iter()
            .filter_map(|rule| {
                rule.tunnel.as_ref().map(|tunnel| {
                    (
                        rule.app.clone(),
                        RouteEntry {
                            tunnel: tunnel.clone(),
                            fallback_to_direct: rule.fallback_to_direct,
                        },
                    )
                })
            })
            .collect();

        Self { routes, version }
    }

    pub fn get(&self, app: &AppId) -> Option<&RouteEntry> {
        self.routes.get(app)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Every tunnel at least one rule points at
    pub fn referenced_tunnels(&self) -> BTreeSet<TunnelId> {
        self.routes.values().map(|r| r.tunnel.clone()).collect()
    }
}

/// Result of applying a new rule set
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RuleChange {
    /// Apps whose target tunnel changed or disappeared
    pub remapped: Vec<AppId>,
    /// Tunnels no rule references any more
    pub unreferenced: BTreeSet<TunnelId>,
}

/// Live application -> tunnel mapping
pub struct RoutingTable {
    current: ArcSwap<RoutingSnapshot>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RoutingSnapshot::default()),
        }
    }

    pub fn from_rules(rules: &[AppRule]) -> Self {
        let table = Self::new();
        table.replace(rules);
        table
    }

    /// Target tunnel for `app`, or `None` if it is not routed
    pub fn resolve(&self, app: &AppId) -> Option<TunnelId> {
        self.current.load().get(app).map(|r| r.tunnel.clone())
    }

    pub fn route(&self, app: &AppId) -> Option<RouteEntry> {
        self.current.load().get(app).cloned()
    }

    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.current.load_full()
    }

    pub fn referenced_tunnels(&self) -> BTreeSet<TunnelId> {
        self.current.load().referenced_tunnels()
    }

    /// Swap in a new rule set and report what moved
    pub fn replace(&self, rules: &[AppRule]) -> RuleChange {
        let old = self.current.load_full();
        let next = RoutingSnapshot::build(rules, old.version + 1);

        let remapped: Vec<AppId> = old
            .routes
            .iter()
            .filter(|(app, entry)| next.get(app).map(|n| &n.tunnel) != Some(&entry.tunnel))
            .map(|(app, _)| app.clone())
            .collect();

        let still_used = next.referenced_tunnels();
        let unreferenced = old
            .referenced_tunnels()
            .into_iter()
            .filter(|t| !still_used.contains(t))
            .collect();

        debug!(
            "Routing table v{}: {} routed apps, {} remapped",
            next.version,
            next.len(),
            remapped.len()
        );
        self.current.store(Arc::new(next));

        RuleChange {
            remapped,
            unreferenced,
        }
    }

    pub fn clear(&self) -> RuleChange {
        self.replace(&[])
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        let table = RoutingTable::from_rules(&[
            AppRule::route("pkg.x", "p_UK"),
            AppRule::direct("pkg.y"),
        ]);

        assert_eq!(table.resolve(&AppId::from("pkg.x")), Some(TunnelId::from("p_UK")));
        assert_eq!(table.resolve(&AppId::from("pkg.y")), None);
        assert_eq!(table.resolve(&AppId::from("pkg.z")), None);
        assert_eq!(table.snapshot().len(), 1);
    }

    #[test]
    fn test_replace_reports_remap_and_unreferenced() {
        let table = RoutingTable::from_rules(&[
            AppRule::route("pkg.x", "p_UK"),
            AppRule::route("pkg.y", "p_DE"),
        ]);

        let change = table.replace(&[
            AppRule::route("pkg.x", "p_FR"),
            AppRule::route("pkg.y", "p_DE"),
        ]);

        assert_eq!(change.remapped, vec![AppId::from("pkg.x")]);
        assert_eq!(change.unreferenced, BTreeSet::from([TunnelId::from("p_UK")]));
        assert_eq!(table.resolve(&AppId::from("pkg.x")), Some(TunnelId::from("p_FR")));
        assert_eq!(table.snapshot().version(), 2);
    }

    #[test]
    fn test_rule_removed_counts_as_remap() {
        let table = RoutingTable::from_rules(&[AppRule::route("pkg.x", "p_UK")]);
        let change = table.clear();

        assert_eq!(change.remapped, vec![AppId::from("pkg.x")]);
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn test_fallback_flag_carried() {
        let table = RoutingTable::from_rules(&[AppRule::route("pkg.x", "p_UK").with_fallback()]);
        let route = table.route(&AppId::from("pkg.x")).unwrap();
        assert!(route.fallback_to_direct);
    }

    #[test]
    fn test_shared_tunnel_stays_referenced() {
        let table = RoutingTable::from_rules(&[
            AppRule::route("pkg.a", "p_UK"),
            AppRule::route("pkg.b", "p_UK"),
        ]);
        let change = table.replace(&[AppRule::route("pkg.a", "p_UK")]);
        assert!(change.unreferenced.is_empty());
        assert_eq!(table.referenced_tunnels(), BTreeSet::from([TunnelId::from("p_UK")]));
    }
}
