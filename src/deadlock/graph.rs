//! Wait-for graph over active transactions
//!
//! Vertices are transactions; an edge `a -> b` labeled with a
//! resource means "a is blocked on a resource held by b". A reverse
//! index keeps incident-edge removal on completion O(deg).

use std::collections::{BTreeSet, HashMap, HashSet};

/// A directed cycle found in the graph
#[derive(Debug, Clone)]
pub struct Cycle {
    /// Transactions on the cycle, in edge order.
    pub participants: Vec<String>,
    /// Union of the resources labeling the cycle's edges.
    pub resources: BTreeSet<String>,
}

#[derive(Default)]
pub struct WaitForGraph {
    /// waiter -> holder -> resources the waiter is blocked on
    edges: HashMap<String, HashMap<String, BTreeSet<String>>>,
    /// holder -> waiters pointing at it
    reverse: HashMap<String, HashSet<String>>,
    /// resource -> holders
    holders: HashMap<String, BTreeSet<String>>,
    /// tx -> resources held
    holdings: HashMap<String, BTreeSet<String>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `tx` is blocked on `resource`: one edge per
    /// distinct current holder.
    pub fn add_request(&mut self, tx: &str, resource: &str) {
        let holders = match self.holders.get(resource) {
            Some(set) => set.clone(),
            None => return,
        };
        for holder in holders {
            if holder == tx {
                continue;
            }
            self.edges
                .entry(tx.to_string())
                .or_default()
                .entry(holder.clone())
                .or_default()
                .insert(resource.to_string());
            self.reverse
                .entry(holder)
                .or_default()
                .insert(tx.to_string());
        }
    }

    /// Record that `tx` now holds `resource`. Its own waiter edges
    /// for that resource are satisfied and disappear.
    pub fn add_acquired(&mut self, tx: &str, resource: &str) {
        self.holders
            .entry(resource.to_string())
            .or_default()
            .insert(tx.to_string());
        self.holdings
            .entry(tx.to_string())
            .or_default()
            .insert(resource.to_string());

        if let Some(out) = self.edges.get_mut(tx) {
            let mut emptied = Vec::new();
            for (holder, resources) in out.iter_mut() {
                resources.remove(resource);
                if resources.is_empty() {
                    emptied.push(holder.clone());
                }
            }
            for holder in emptied {
                out.remove(&holder);
                if let Some(waiters) = self.reverse.get_mut(&holder) {
                    waiters.remove(tx);
                }
            }
            if out.is_empty() {
                self.edges.remove(tx);
            }
        }
    }

    /// Drop a completed transaction and every incident edge.
    pub fn remove_tx(&mut self, tx: &str) {
        if let Some(resources) = self.holdings.remove(tx) {
            for res in resources {
                if let Some(holders) = self.holders.get_mut(&res) {
                    holders.remove(tx);
                    if holders.is_empty() {
                        self.holders.remove(&res);
                    }
                }
            }
        }

        if let Some(out) = self.edges.remove(tx) {
            for holder in out.keys() {
                if let Some(waiters) = self.reverse.get_mut(holder) {
                    waiters.remove(tx);
                }
            }
        }

        if let Some(waiters) = self.reverse.remove(tx) {
            for waiter in waiters {
                if let Some(out) = self.edges.get_mut(&waiter) {
                    out.remove(tx);
                    if out.is_empty() {
                        self.edges.remove(&waiter);
                    }
                }
            }
        }
    }

    /// Remove the edges along a detected cycle so the same deadlock
    /// is reported once.
    pub fn drop_cycle_edges(&mut self, cycle: &Cycle) {
        let n = cycle.participants.len();
        for i in 0..n {
            let from = &cycle.participants[i];
            let to = &cycle.participants[(i + 1) % n];
            if let Some(out) = self.edges.get_mut(from) {
                out.remove(to);
                if out.is_empty() {
                    self.edges.remove(from);
                }
            }
            if let Some(waiters) = self.reverse.get_mut(to) {
                waiters.remove(from);
            }
        }
    }

    /// Find any directed cycle with an iterative colored depth-first
    /// search. Returns the first cycle encountered.
    pub fn find_cycle(&self) -> Option<Cycle> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;

        let mut color: HashMap<&str, u8> =
            self.edges.keys().map(|k| (k.as_str(), WHITE)).collect();
        let mut roots: Vec<&str> = self.edges.keys().map(String::as_str).collect();
        roots.sort_unstable();

        for root in roots {
            if color.get(root).copied().unwrap_or(BLACK) != WHITE {
                continue;
            }

            // Stack frames: vertex plus its not-yet-visited successors.
            let mut stack: Vec<(&str, Vec<&str>)> = Vec::new();
            let mut path: Vec<&str> = Vec::new();

            color.insert(root, GRAY);
            stack.push((root, self.successors(root)));
            path.push(root);

            while let Some((_, successors)) = stack.last_mut() {
                match successors.pop() {
                    Some(next) => match color.get(next).copied().unwrap_or(BLACK) {
                        GRAY => {
                            let start = path.iter().position(|v| *v == next)?;
                            return Some(self.build_cycle(&path[start..]));
                        }
                        WHITE => {
                            color.insert(next, GRAY);
                            stack.push((next, self.successors(next)));
                            path.push(next);
                        }
                        _ => {}
                    },
                    None => {
                        let (done, _) = stack.pop().expect("frame exists");
                        color.insert(done, BLACK);
                        path.pop();
                    }
                }
            }
        }

        None
    }

    pub fn vertex_count(&self) -> usize {
        let mut vertices: HashSet<&str> = self.holdings.keys().map(String::as_str).collect();
        vertices.extend(self.edges.keys().map(String::as_str));
        vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty() && self.holdings.is_empty() && self.holders.is_empty()
    }

    fn successors(&self, tx: &str) -> Vec<&str> {
        let mut next: Vec<&str> = self
            .edges
            .get(tx)
            .map(|out| out.keys().map(String::as_str).collect())
            .unwrap_or_default();
        // Deterministic visit order keeps the reported cycle stable.
        next.sort_unstable();
        next.reverse();
        next
    }

    fn build_cycle(&self, path: &[&str]) -> Cycle {
        let mut resources = BTreeSet::new();
        let n = path.len();
        for i in 0..n {
            let from = path[i];
            let to = path[(i + 1) % n];
            if let Some(labels) = self.edges.get(from).and_then(|out| out.get(to)) {
                resources.extend(labels.iter().cloned());
            }
        }
        Cycle {
            participants: path.iter().map(|s| s.to_string()).collect(),
            resources,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_against_holder_creates_edge() {
        let mut graph = WaitForGraph::new();
        graph.add_acquired("tx-a", "r1");
        graph.add_request("tx-b", "r1");

        assert!(graph.find_cycle().is_none());
        assert_eq!(graph.vertex_count(), 2);
    }

    #[test]
    fn test_request_on_free_resource_is_noop() {
        let mut graph = WaitForGraph::new();
        graph.add_request("tx-a", "r1");
        assert!(graph.is_empty());
    }

    #[test]
    fn test_two_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_acquired("tx-a", "r1");
        graph.add_acquired("tx-b", "r2");
        graph.add_request("tx-a", "r2");
        graph.add_request("tx-b", "r1");

        let cycle = graph.find_cycle().expect("two-cycle detected");
        let mut participants = cycle.participants.clone();
        participants.sort();
        assert_eq!(participants, vec!["tx-a", "tx-b"]);
        assert!(cycle.resources.contains("r1"));
        assert!(cycle.resources.contains("r2"));
    }

    #[test]
    fn test_three_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_acquired("tx-a", "r1");
        graph.add_acquired("tx-b", "r2");
        graph.add_acquired("tx-c", "r3");
        graph.add_request("tx-a", "r2");
        graph.add_request("tx-b", "r3");
        graph.add_request("tx-c", "r1");

        let cycle = graph.find_cycle().expect("three-cycle detected");
        assert_eq!(cycle.participants.len(), 3);
        assert_eq!(
            cycle.resources,
            ["r1", "r2", "r3"].iter().map(|s| s.to_string()).collect()
        );
    }

    #[test]
    fn test_completion_clears_waiter_edges() {
        let mut graph = WaitForGraph::new();
        graph.add_acquired("tx-a", "r1");
        graph.add_request("tx-b", "r1");

        graph.remove_tx("tx-a");
        assert!(graph.find_cycle().is_none());
        // tx-b's dangling edge went away with the holder.
        assert_eq!(graph.vertex_count(), 0);
    }

    #[test]
    fn test_acquire_satisfies_own_wait() {
        let mut graph = WaitForGraph::new();
        graph.add_acquired("tx-a", "r1");
        graph.add_request("tx-b", "r1");
        // Holder released and tx-b got the lock.
        graph.remove_tx("tx-a");
        graph.add_acquired("tx-b", "r1");

        assert!(graph.find_cycle().is_none());
        assert_eq!(graph.vertex_count(), 1);
    }

    #[test]
    fn test_dropped_cycle_edges_not_rereported() {
        let mut graph = WaitForGraph::new();
        graph.add_acquired("tx-a", "r1");
        graph.add_acquired("tx-b", "r2");
        graph.add_request("tx-a", "r2");
        graph.add_request("tx-b", "r1");

        let cycle = graph.find_cycle().expect("cycle");
        graph.drop_cycle_edges(&cycle);
        assert!(graph.find_cycle().is_none());
    }

    #[test]
    fn test_shared_holders_create_edge_per_holder() {
        let mut graph = WaitForGraph::new();
        graph.add_acquired("tx-a", "r1");
        graph.add_acquired("tx-b", "r1");
        graph.add_request("tx-c", "r1");

        // No cycle, but tx-c waits on both holders.
        assert!(graph.find_cycle().is_none());
        assert_eq!(graph.vertex_count(), 3);
    }
}
