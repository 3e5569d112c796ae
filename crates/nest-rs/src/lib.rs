//! # NEST-RS: spiking network kernel for the Brunel model
//!
//! A time-driven simulation kernel that follows the NEST simulator's
//! conventions (https://www.nest-simulator.org/): node ids start at 1,
//! models are named as in NEST, and spike times are stamped at the end of
//! the step in which the threshold was crossed.
//!
//! Key features:
//! - `iaf_psc_alpha` neurons with exact integration
//! - `poisson_generator` drive with independent realizations per target
//! - NEST connection rules (fixed indegree, pairwise Bernoulli, ...)
//! - Delayed spike delivery through per-neuron ring buffers
//! - `spike_recorder` devices
//! - Parallel neuron updates (rayon), reproducible for any thread count
//! - The Brunel (2000) balanced E/I network, built and run in one call
//!
//! ```rust
//! use brunel_nest::brunel::{run_brunel_network, BrunelParams};
//!
//! let params = BrunelParams {
//!     order: 20,
//!     simtime: 50.0,
//!     ..Default::default()
//! };
//! let result = run_brunel_network(&params).unwrap();
//! assert_eq!(result.n_neurons, 100);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod analysis;
pub mod brunel;
pub mod connection;
pub mod kernel;
pub mod models;
pub mod recording;

pub use analysis::{cv_isi, mean_firing_rate, population_rate, spike_correlation, synchrony};
pub use connection::{ConnectionSpec, ConnectivityRule, DelayDistribution, SynapseModel, WeightDistribution};
pub use kernel::{Kernel, KernelParams};
pub use models::{IafPscAlphaParams, NodeModel, PoissonGeneratorParams};
pub use recording::SpikeData;

#[derive(Error, Debug)]
pub enum NestError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Connection error: {0}")]
    ConnectionError(String),
    #[error("Simulation error: {0}")]
    SimulationError(String),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error(transparent)]
    Core(#[from] brunel_core::CoreError),
}

impl From<std::io::Error> for NestError {
    fn from(err: std::io::Error) -> Self {
        NestError::Core(brunel_core::CoreError::IoError(err))
    }
}

pub type Result<T> = std::result::Result<T, NestError>;

// ============================================================================
// NODE IDS (NEST's fundamental concept)
// ============================================================================

/// Global node identifier
pub type NodeId = usize;

/// Collection of node IDs (like NEST's NodeCollection)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCollection {
    pub ids: Vec<NodeId>,
}

impl NodeCollection {
    pub fn new(ids: Vec<NodeId>) -> Self {
        Self { ids }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn first(&self) -> Option<NodeId> {
        self.ids.first().copied()
    }

    pub fn last(&self) -> Option<NodeId> {
        self.ids.last().copied()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.ids.contains(&id)
    }

    /// Slice of nodes; bounds are clamped to the collection
    pub fn slice(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.ids.len());
        let start = start.min(end);
        Self::new(self.ids[start..end].to_vec())
    }

    /// The first `n` nodes (all of them if `n` exceeds the length)
    pub fn head(&self, n: usize) -> Self {
        self.slice(0, n)
    }

    /// Concatenation, like `nodes_ex + nodes_in` in PyNEST
    pub fn join(&self, other: &NodeCollection) -> Self {
        let mut ids = self.ids.clone();
        ids.extend_from_slice(&other.ids);
        Self::new(ids)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NodeId> {
        self.ids.iter()
    }
}

impl IntoIterator for NodeCollection {
    type Item = NodeId;
    type IntoIter = std::vec::IntoIter<NodeId>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.into_iter()
    }
}

impl<'a> IntoIterator for &'a NodeCollection {
    type Item = &'a NodeId;
    type IntoIter = std::slice::Iter<'a, NodeId>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.iter()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_collection() {
        let nodes = NodeCollection::new(vec![1, 2, 3, 4, 5]);
        assert_eq!(nodes.len(), 5);
        assert_eq!(nodes.first(), Some(1));
        assert_eq!(nodes.last(), Some(5));

        let slice = nodes.slice(1, 3);
        assert_eq!(slice.ids, vec![2, 3]);
    }

    #[test]
    fn test_head_clamps() {
        let nodes = NodeCollection::new(vec![7, 8, 9]);
        assert_eq!(nodes.head(2).ids, vec![7, 8]);
        assert_eq!(nodes.head(10).ids, vec![7, 8, 9]);
        assert!(nodes.slice(5, 6).is_empty());
    }

    #[test]
    fn test_join() {
        let ex = NodeCollection::new(vec![1, 2]);
        let inh = NodeCollection::new(vec![3]);
        let all = ex.join(&inh);
        assert_eq!(all.ids, vec![1, 2, 3]);
        assert!(all.contains(3));
        assert_eq!((&all).into_iter().count(), 3);
    }
}
