//! Learned destination cache for mesh routing.
//!
//! Maps a [`NodeId`] to the [`ConnectId`] that most recently delivered a
//! message claiming to originate from that node. Entries are advisory: a
//! missing entry means "flood", a stale entry is evicted the first time a
//! send through it fails.
//!
//! # Architecture
//!
//! ```text
//! Inbound message (source S, arrival C)
//!        │
//!        ▼
//! ┌─────────────────────┐
//! │ learn(S -> C)       │
//! └──────────┬──────────┘
//!            │
//! Outbound message (destination D)
//!            │
//!            ▼
//! ┌─────────────────────┐  hit, C live   ┌──────────────────┐
//! │ route(D)            │───────────────▶│ targeted send     │
//! │ (DashMap)           │                └──────────────────┘
//! └──────────┬──────────┘
//!            │ miss, or C gone → evict(D)
//!            ▼
//! ┌─────────────────────┐
//! │ flood (one attempt) │
//! └─────────────────────┘
//! ```

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::id::{ConnectId, NodeId};

/// Destination cache: NodeId → last-known-good ConnectId
pub struct DestinationCache {
    /// Learned routes
    routes: DashMap<NodeId, ConnectId>,

    /// Statistics: total lookups performed
    total_lookups: AtomicU64,

    /// Statistics: lookups that found a route
    hits: AtomicU64,

    /// Statistics: entries evicted as stale
    evictions: AtomicU64,
}

impl DestinationCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
            total_lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Record that `node` is reachable through `via`.
    ///
    /// Overwrites any previous entry. Broadcast sources and the "none"
    /// connection are never recorded.
    pub fn learn(&self, node: NodeId, via: ConnectId) {
        if node.is_broadcast() || via.is_none() {
            return;
        }
        let previous = self.routes.insert(node, via);
        if previous != Some(via) {
            tracing::debug!("Learned route: {} via {}", node, via);
        }
    }

    /// Look up the cached connection for `node`.
    pub fn route(&self, node: NodeId) -> Option<ConnectId> {
        self.total_lookups.fetch_add(1, Ordering::Relaxed);
        let found = self.routes.get(&node).map(|entry| *entry.value());
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Evict the entry for `node`, but only if it still points at `via`.
    ///
    /// A concurrent `learn` that replaced the entry with a fresh route is
    /// left untouched.
    pub fn evict(&self, node: NodeId, via: ConnectId) -> bool {
        let removed = self.routes.remove_if(&node, |_, current| *current == via);
        if removed.is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Evicted stale route: {} via {}", node, via);
        }
        removed.is_some()
    }

    /// Evict every entry pointing at `via`, returning the affected nodes.
    pub fn evict_connection(&self, via: ConnectId) -> Vec<NodeId> {
        let nodes: Vec<NodeId> = self
            .routes
            .iter()
            .filter(|entry| *entry.value() == via)
            .map(|entry| *entry.key())
            .collect();
        nodes
            .into_iter()
            .filter(|node| self.evict(*node, via))
            .collect()
    }

    /// Number of cached routes
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Get routing statistics
    pub fn stats(&self) -> RoutingStats {
        RoutingStats {
            active_routes: self.routes.len(),
            total_lookups: self.total_lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Clear all routes. Used during shutdown.
    pub fn clear(&self) {
        tracing::debug!("Clearing all routes");
        self.routes.clear();
    }
}

impl Default for DestinationCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Destination cache statistics
#[derive(Debug, Clone, Copy)]
pub struct RoutingStats {
    /// Number of cached routes
    pub active_routes: usize,

    /// Total lookup operations
    pub total_lookups: u64,

    /// Lookups that found a route
    pub hits: u64,

    /// Stale entries evicted
    pub evictions: u64,
}

impl RoutingStats {
    /// Percentage of lookups that found a route
    pub fn hit_rate(&self) -> f64 {
        if self.total_lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.total_lookups as f64 * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_learn_and_route() {
        let cache = DestinationCache::new();
        let node = NodeId::random();
        let conn = ConnectId::random();

        assert!(cache.route(node).is_none());
        cache.learn(node, conn);
        assert_eq!(cache.route(node), Some(conn));
        assert_eq!(cache.route_count(), 1);
    }

    #[test]
    fn test_learn_overwrites() {
        let cache = DestinationCache::new();
        let node = NodeId::random();
        let first = ConnectId::random();
        let second = ConnectId::random();

        cache.learn(node, first);
        cache.learn(node, second);
        assert_eq!(cache.route(node), Some(second));
    }

    #[test]
    fn test_sentinels_not_learned() {
        let cache = DestinationCache::new();
        cache.learn(NodeId::BROADCAST, ConnectId::random());
        cache.learn(NodeId::random(), ConnectId::NONE);
        assert_eq!(cache.route_count(), 0);
    }

    #[test]
    fn test_evict_only_matching() {
        let cache = DestinationCache::new();
        let node = NodeId::random();
        let stale = ConnectId::random();
        let fresh = ConnectId::random();

        cache.learn(node, fresh);
        assert!(!cache.evict(node, stale));
        assert_eq!(cache.route(node), Some(fresh));

        assert!(cache.evict(node, fresh));
        assert!(cache.route(node).is_none());
    }

    #[test]
    fn test_evict_connection() {
        let cache = DestinationCache::new();
        let lost = ConnectId::random();
        let kept = ConnectId::random();
        let a = NodeId::random();
        let b = NodeId::random();
        let c = NodeId::random();

        cache.learn(a, lost);
        cache.learn(b, lost);
        cache.learn(c, kept);

        let mut evicted = cache.evict_connection(lost);
        evicted.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(evicted, expected);
        assert_eq!(cache.route(c), Some(kept));
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn test_hit_rate() {
        let cache = DestinationCache::new();
        let node = NodeId::random();
        cache.learn(node, ConnectId::random());

        cache.route(node);
        cache.route(NodeId::random());

        let stats = cache.stats();
        assert_eq!(stats.total_lookups, 2);
        assert_eq!(stats.hits, 1);
        assert!((stats.hit_rate() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_concurrent_learning() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(DestinationCache::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                for _ in 0..10 {
                    cache.learn(NodeId::random(), ConnectId::random());
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.route_count(), 100);
    }
}
