use std::sync::Arc;

use tracing::debug;

use super::trie::Trie;
use super::{Aggregate, Error, NodeId, Result};

/// Reference aggregator: one scalar sweep per distribution.
pub struct Sequential {
    trie: Arc<Trie>,
    order: Vec<(NodeId, Option<NodeId>)>, // (node, parent), deepest first
}

impl Sequential {
    pub fn new(trie: Arc<Trie>) -> Self {
        let order: Vec<_> = trie
            .levels()
            .into_iter()
            .rev()
            .flatten()
            .map(|n| (n, trie.parent(n)))
            .collect();

        debug!(nodes = order.len(), "prepared sequential sweep");

        Self { trie, order }
    }

    fn own(&self, dist: &[f64]) -> Result<Vec<f64>> {
        let want = self.trie.vocab_size();

        if dist.len() != want {
            return Err(Error::Dimension { want, got: dist.len() });
        }

        let mut own = vec![0.; self.trie.node_count()];

        for (node, &p) in self.trie.leaf_nodes().zip(dist) {
            own[node] = p;
        }

        Ok(own)
    }

    /// Mass under every node: `mass[n] = own[n] + Σ mass[c]` over the
    /// children `c` of `n`, where `own[n]` is the probability of the token
    /// ending exactly at `n`.
    ///
    /// Nodes are visited deepest first, so a node's mass is final by the
    /// time it is folded into its parent.
    pub fn mass_sum(&self, dist: &[f64]) -> Result<Vec<f64>> {
        let mut mass = self.own(dist)?;

        for &(n, parent) in self.order.iter() {
            if let Some(p) = parent {
                mass[p] += mass[n];
            }
        }

        Ok(mass)
    }

    /// Largest single token probability under every node.
    pub fn mass_max(&self, dist: &[f64]) -> Result<Vec<f64>> {
        let mut best = self.own(dist)?;

        for &(n, parent) in self.order.iter() {
            if let Some(p) = parent {
                best[p] = best[p].max(best[n]);
            }
        }

        Ok(best)
    }

    pub fn batch_mass_sum(&self, batch: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        batch.iter().map(|d| self.mass_sum(d)).collect()
    }
}

impl Aggregate for Sequential {
    fn trie(&self) -> &Trie {
        &self.trie
    }

    fn batch_mass_sum(&self, batch: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        Sequential::batch_mass_sum(self, batch)
    }

    fn mass_sum(&self, dist: &[f64]) -> Result<Vec<f64>> {
        Sequential::mass_sum(self, dist)
    }
}

#[cfg(test)]
fn example() -> Sequential {
    Sequential::new(Arc::new(Trie::build(["a", "b", "ab", "<eos>"]).unwrap()))
}

#[test]
fn test_mass_sum_example() {
    let agg = example();
    let trie = agg.trie.clone();
    let mass = agg.mass_sum(&[0.1, 0.2, 0.2, 0.5]).unwrap();

    let want = [
        ("", 1.0),
        ("a", 0.3),
        ("b", 0.2),
        ("ab", 0.2),
        ("<", 0.5),
        ("<e", 0.5),
        ("<eo", 0.5),
        ("<eos", 0.5),
        ("<eos>", 0.5),
    ];

    for (prefix, want) in want {
        let n = trie.lookup(prefix.as_bytes()).unwrap();
        assert!((mass[n] - want).abs() < 1e-12, "{prefix:?}: {} != {want}", mass[n]);
    }
}

#[test]
fn test_mass_max() {
    let agg = example();
    let trie = agg.trie.clone();
    let best = agg.mass_max(&[0.1, 0.2, 0.25, 0.45]).unwrap();

    assert_eq!(best[trie.root()], 0.45);
    assert_eq!(best[trie.lookup(b"a").unwrap()], 0.25);
    assert_eq!(best[trie.lookup(b"b").unwrap()], 0.2);
}

#[test]
fn test_dimension_mismatch() {
    let agg = example();

    assert!(matches!(
        agg.mass_sum(&[0.5, 0.5]),
        Err(Error::Dimension { want: 4, got: 2 })
    ));

    // still usable
    assert!(agg.mass_sum(&[0.25; 4]).is_ok());
}

#[test]
fn test_batch_empty() {
    assert!(example().batch_mass_sum(&[]).unwrap().is_empty());
}
