// Deadlock detection over the cluster waits-for graph.
//
// Each site derives waits-for edges from its lock tables; the graph here is
// their union across all up sites. A cycle means deadlock, resolved by
// aborting the youngest participant (largest start tick, ties broken by tid
// sort order so runs are deterministic).

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use crate::common::TransactionId;
use crate::site::DataManager;

use super::types::Transaction;

/// A directed waits-for graph over transaction ids, built fresh each tick.
#[derive(Debug, Default)]
pub struct WaitsForGraph {
    /// waiter -> set of transactions it waits on.
    edges: HashMap<TransactionId, HashSet<TransactionId>>,
}

impl WaitsForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unions the subgraphs of every up site. Down sites contribute nothing
    /// (their lock tables are empty).
    pub fn from_sites(sites: &[DataManager]) -> Self {
        let mut graph = Self::new();
        for site in sites.iter().filter(|s| s.is_up()) {
            for (waiter, holder) in site.local_waits_for() {
                graph.add_edge(waiter, holder);
            }
        }
        graph
    }

    /// Adds waiter → holder. Self-edges are ignored.
    pub fn add_edge(&mut self, waiter: TransactionId, holder: TransactionId) {
        if waiter == holder {
            return;
        }
        self.edges.entry(waiter).or_default().insert(holder);
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Total number of edges.
    pub fn edge_count(&self) -> usize {
        self.edges.values().map(HashSet::len).sum()
    }

    /// DFS from `tid` looking for a path back to `tid`.
    pub fn in_cycle(&self, tid: &str) -> bool {
        let mut visited = HashSet::new();
        self.reaches(tid, tid, &mut visited)
    }

    fn reaches(&self, from: &str, target: &str, visited: &mut HashSet<TransactionId>) -> bool {
        let Some(next) = self.edges.get(from) else {
            return false;
        };
        for node in next {
            if node == target {
                return true;
            }
            if visited.insert(node.clone()) && self.reaches(node, target, visited) {
                return true;
            }
        }
        false
    }

    /// Picks the deadlock victim: among all transactions on a cycle, the one
    /// with the largest start tick. Candidates are scanned in tid order and
    /// only a strictly larger start replaces the current choice, so ties
    /// resolve to the first tid in sort order.
    pub fn pick_victim(
        &self,
        transactions: &BTreeMap<TransactionId, Transaction>,
    ) -> Option<TransactionId> {
        let mut waiters: Vec<&TransactionId> = self.edges.keys().collect();
        waiters.sort();

        let mut victim: Option<&Transaction> = None;
        for tid in waiters {
            let Some(txn) = transactions.get(tid) else {
                continue;
            };
            if !self.in_cycle(tid) {
                continue;
            }
            debug!(tid = %txn.id, start = txn.start, "transaction participates in deadlock cycle");
            if victim.map_or(true, |v| txn.start > v.start) {
                victim = Some(txn);
            }
        }
        victim.map(|txn| txn.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txns(entries: &[(&str, u64)]) -> BTreeMap<TransactionId, Transaction> {
        entries
            .iter()
            .map(|(id, start)| (id.to_string(), Transaction::new(id.to_string(), *start)))
            .collect()
    }

    fn graph(edges: &[(&str, &str)]) -> WaitsForGraph {
        let mut g = WaitsForGraph::new();
        for (a, b) in edges {
            g.add_edge(a.to_string(), b.to_string());
        }
        g
    }

    #[test]
    fn test_no_cycle() {
        let g = graph(&[("T1", "T2"), ("T2", "T3")]);
        assert!(!g.in_cycle("T1"));
        assert!(g.pick_victim(&txns(&[("T1", 0), ("T2", 1), ("T3", 2)])).is_none());
    }

    #[test]
    fn test_two_cycle_youngest_aborted() {
        let g = graph(&[("T1", "T2"), ("T2", "T1")]);
        assert!(g.in_cycle("T1"));
        assert!(g.in_cycle("T2"));
        let victim = g.pick_victim(&txns(&[("T1", 0), ("T2", 1)]));
        assert_eq!(victim.as_deref(), Some("T2"));
    }

    #[test]
    fn test_long_cycle() {
        let g = graph(&[("T1", "T2"), ("T2", "T3"), ("T3", "T1"), ("T4", "T1")]);
        let victim = g.pick_victim(&txns(&[("T1", 2), ("T2", 0), ("T3", 1), ("T4", 9)]));
        // T4 waits on the cycle but is not part of it
        assert_eq!(victim.as_deref(), Some("T1"));
    }

    #[test]
    fn test_tie_breaks_by_tid_order() {
        let g = graph(&[("T5", "T3"), ("T3", "T5")]);
        let victim = g.pick_victim(&txns(&[("T3", 4), ("T5", 4)]));
        assert_eq!(victim.as_deref(), Some("T3"));
    }

    #[test]
    fn test_self_edge_ignored() {
        let mut g = WaitsForGraph::new();
        g.add_edge("T1".to_string(), "T1".to_string());
        assert!(g.is_empty());
    }

    #[test]
    fn test_edge_count_unions_duplicates() {
        let g = graph(&[("T1", "T2"), ("T1", "T2"), ("T2", "T3")]);
        assert_eq!(g.edge_count(), 2);
    }
}
