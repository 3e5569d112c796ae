//! Connection specifications and the NEST connection rules.
//!
//! A rule turns a source and a target collection into (source, target)
//! pairs; the kernel then samples a weight and delay per pair and decides
//! what the pair means from the node kinds (synapse, generator drive or
//! recorder registration).

use crate::{NestError, NodeCollection, NodeId, Result};
use rand::seq::index;
use rand::Rng;
use rand_distr::{Distribution, LogNormal, Normal, Uniform};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

// ============================================================================
// SYNAPSE MODELS
// ============================================================================

/// Synapse model types
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum SynapseModel {
    /// Static synapse (fixed weight)
    #[default]
    Static,
}

/// One stored synapse, owned by its source neuron
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Synapse {
    /// Index of the target neuron in the kernel's neuron table
    pub target: u32,
    /// Delay in steps, at least 1
    pub delay_steps: u32,
    /// PSC amplitude (pA); negative weights are inhibitory
    pub weight: f64,
}

// ============================================================================
// CONNECTION SPECIFICATION
// ============================================================================

/// Connection rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConnectivityRule {
    /// All-to-all connection
    AllToAll,

    /// One-to-one mapping (same indices)
    OneToOne,

    /// Random connections with fixed indegree
    FixedIndegree { indegree: usize },

    /// Random connections with fixed outdegree
    FixedOutdegree { outdegree: usize },

    /// Random connections with fixed total number
    FixedTotalNumber { n: usize },

    /// Bernoulli (fixed probability)
    PairwiseBernoulli { p: f64 },
}

/// Weight distribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WeightDistribution {
    Constant(f64),
    Uniform { min: f64, max: f64 },
    Normal { mean: f64, std: f64 },
    Lognormal { mu: f64, sigma: f64 },
}

/// Delay distribution (ms)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DelayDistribution {
    Constant(f64),
    Uniform { min: f64, max: f64 },
    Normal { mean: f64, std: f64 },
}

/// Connection specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub rule: ConnectivityRule,
    pub weight: WeightDistribution,
    pub delay: DelayDistribution,
    pub synapse_model: SynapseModel,
    pub allow_autapses: bool,
    pub allow_multapses: bool,
}

impl Default for ConnectionSpec {
    fn default() -> Self {
        Self {
            rule: ConnectivityRule::AllToAll,
            weight: WeightDistribution::Constant(1.0),
            delay: DelayDistribution::Constant(1.0),
            synapse_model: SynapseModel::Static,
            allow_autapses: true,
            allow_multapses: true,
        }
    }
}

impl ConnectionSpec {
    /// Static synapse with fixed weight and delay, like
    /// `CopyModel("static_synapse", name, {"weight": w, "delay": d})`
    pub fn static_synapse(rule: ConnectivityRule, weight: f64, delay: f64) -> Self {
        Self {
            rule,
            weight: WeightDistribution::Constant(weight),
            delay: DelayDistribution::Constant(delay),
            ..Default::default()
        }
    }
}

// ============================================================================
// SAMPLING
// ============================================================================

/// Weight/delay sampler built once per `connect` call
#[derive(Debug, Clone)]
pub(crate) enum ValueSampler {
    Constant(f64),
    Uniform(Uniform<f64>),
    Normal(Normal<f64>),
    Lognormal(LogNormal<f64>),
}

impl ValueSampler {
    pub(crate) fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self {
            ValueSampler::Constant(v) => *v,
            ValueSampler::Uniform(d) => d.sample(rng),
            ValueSampler::Normal(d) => d.sample(rng),
            ValueSampler::Lognormal(d) => d.sample(rng),
        }
    }
}

fn uniform(min: f64, max: f64) -> Result<ValueSampler> {
    if !min.is_finite() || !max.is_finite() || min > max {
        return Err(NestError::InvalidParameter(format!(
            "uniform distribution needs min <= max, got [{}, {}]",
            min, max
        )));
    }
    if min == max {
        return Ok(ValueSampler::Constant(min));
    }
    Ok(ValueSampler::Uniform(Uniform::new(min, max)))
}

fn normal(mean: f64, std: f64) -> Result<ValueSampler> {
    Normal::new(mean, std)
        .map(ValueSampler::Normal)
        .map_err(|e| NestError::InvalidParameter(format!("normal({}, {}): {}", mean, std, e)))
}

impl WeightDistribution {
    pub(crate) fn sampler(&self) -> Result<ValueSampler> {
        match *self {
            WeightDistribution::Constant(w) if w.is_finite() => Ok(ValueSampler::Constant(w)),
            WeightDistribution::Constant(w) => Err(NestError::InvalidParameter(format!(
                "weight must be finite, got {}",
                w
            ))),
            WeightDistribution::Uniform { min, max } => uniform(min, max),
            WeightDistribution::Normal { mean, std } => normal(mean, std),
            WeightDistribution::Lognormal { mu, sigma } => LogNormal::new(mu, sigma)
                .map(ValueSampler::Lognormal)
                .map_err(|e| {
                    NestError::InvalidParameter(format!("lognormal({}, {}): {}", mu, sigma, e))
                }),
        }
    }
}

impl DelayDistribution {
    pub(crate) fn sampler(&self) -> Result<ValueSampler> {
        match *self {
            DelayDistribution::Constant(d) => Ok(ValueSampler::Constant(d)),
            DelayDistribution::Uniform { min, max } => uniform(min, max),
            DelayDistribution::Normal { mean, std } => normal(mean, std),
        }
    }

    /// Normal delays can fall below one step; they are clamped instead of
    /// rejected.
    pub(crate) fn clamps_to_resolution(&self) -> bool {
        matches!(self, DelayDistribution::Normal { .. })
    }
}

// ============================================================================
// CONNECTION RULES
// ============================================================================

/// Emit (source, target) pairs for `spec.rule`.
///
/// Pairs are produced through `emit` so that dense rules never materialize
/// the full pair list.
pub(crate) fn for_each_pair<R, F>(
    spec: &ConnectionSpec,
    sources: &NodeCollection,
    targets: &NodeCollection,
    rng: &mut R,
    mut emit: F,
) -> Result<()>
where
    R: Rng + ?Sized,
    F: FnMut(NodeId, NodeId, &mut R) -> Result<()>,
{
    let autapses = spec.allow_autapses;
    let multapses = spec.allow_multapses;

    match spec.rule {
        ConnectivityRule::AllToAll => {
            for &tgt in targets {
                for &src in sources {
                    if !autapses && src == tgt {
                        continue;
                    }
                    emit(src, tgt, rng)?;
                }
            }
        }

        ConnectivityRule::OneToOne => {
            if sources.len() != targets.len() {
                return Err(NestError::ConnectionError(format!(
                    "OneToOne requires equal population sizes, got {} and {}",
                    sources.len(),
                    targets.len()
                )));
            }
            for (&src, &tgt) in sources.iter().zip(targets.iter()) {
                if !autapses && src == tgt {
                    continue;
                }
                emit(src, tgt, rng)?;
            }
        }

        ConnectivityRule::FixedIndegree { indegree } => {
            let positions = position_map(sources);
            for &tgt in targets {
                let own = if autapses { None } else { positions.get(&tgt).copied() };
                for idx in draw_partners(sources.len(), indegree, own, multapses, rng, "indegree")? {
                    emit(sources.ids[idx], tgt, rng)?;
                }
            }
        }

        ConnectivityRule::FixedOutdegree { outdegree } => {
            let positions = position_map(targets);
            for &src in sources {
                let own = if autapses { None } else { positions.get(&src).copied() };
                for idx in draw_partners(targets.len(), outdegree, own, multapses, rng, "outdegree")? {
                    emit(src, targets.ids[idx], rng)?;
                }
            }
        }

        ConnectivityRule::FixedTotalNumber { n } => {
            fixed_total_number(spec, sources, targets, n, rng, &mut emit)?;
        }

        ConnectivityRule::PairwiseBernoulli { p } => {
            if !(0.0..=1.0).contains(&p) {
                return Err(NestError::InvalidParameter(format!(
                    "connection probability must lie in [0, 1], got {}",
                    p
                )));
            }
            for &tgt in targets {
                for &src in sources {
                    if !autapses && src == tgt {
                        continue;
                    }
                    if rng.gen::<f64>() < p {
                        emit(src, tgt, rng)?;
                    }
                }
            }
        }
    }

    Ok(())
}

fn position_map(nodes: &NodeCollection) -> HashMap<NodeId, usize> {
    nodes.iter().enumerate().map(|(pos, &id)| (id, pos)).collect()
}

/// Draw `k` partner positions out of `n`, never returning `exclude`.
fn draw_partners<R: Rng + ?Sized>(
    n: usize,
    k: usize,
    exclude: Option<usize>,
    multapses: bool,
    rng: &mut R,
    what: &str,
) -> Result<Vec<usize>> {
    let eligible = n - usize::from(exclude.is_some());
    if k == 0 {
        return Ok(Vec::new());
    }
    if eligible == 0 {
        return Err(NestError::ConnectionError(format!(
            "{} {} requested but no eligible partners exist",
            what, k
        )));
    }

    // Positions are drawn from 0..eligible and shifted past the excluded one.
    let shift = |pos: usize| match exclude {
        Some(skip) if pos >= skip => pos + 1,
        _ => pos,
    };

    if multapses {
        return Ok((0..k).map(|_| shift(rng.gen_range(0..eligible))).collect());
    }

    if k > eligible {
        return Err(NestError::ConnectionError(format!(
            "{} {} exceeds the {} eligible partners without multapses",
            what, k, eligible
        )));
    }
    Ok(index::sample(rng, eligible, k).into_iter().map(shift).collect())
}

fn fixed_total_number<R, F>(
    spec: &ConnectionSpec,
    sources: &NodeCollection,
    targets: &NodeCollection,
    n: usize,
    rng: &mut R,
    emit: &mut F,
) -> Result<()>
where
    R: Rng + ?Sized,
    F: FnMut(NodeId, NodeId, &mut R) -> Result<()>,
{
    if n == 0 {
        return Ok(());
    }
    if sources.is_empty() || targets.is_empty() {
        return Err(NestError::ConnectionError(
            "FixedTotalNumber needs non-empty sources and targets".into(),
        ));
    }

    let shared = sources.iter().filter(|id| targets.contains(**id)).count();
    let possible = sources.len() * targets.len() - if spec.allow_autapses { 0 } else { shared };
    if possible == 0 || (!spec.allow_multapses && n > possible) {
        return Err(NestError::ConnectionError(format!(
            "cannot place {} connections among {} possible pairs",
            n, possible
        )));
    }

    let mut seen = HashSet::new();
    let mut placed = 0;
    while placed < n {
        let src = sources.ids[rng.gen_range(0..sources.len())];
        let tgt = targets.ids[rng.gen_range(0..targets.len())];
        if !spec.allow_autapses && src == tgt {
            continue;
        }
        if !spec.allow_multapses && !seen.insert((src, tgt)) {
            continue;
        }
        emit(src, tgt, rng)?;
        placed += 1;
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn collect(spec: &ConnectionSpec, s: &NodeCollection, t: &NodeCollection) -> Result<Vec<(NodeId, NodeId)>> {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut pairs = Vec::new();
        for_each_pair(spec, s, t, &mut rng, |src, tgt, _| {
            pairs.push((src, tgt));
            Ok(())
        })?;
        Ok(pairs)
    }

    fn nodes(range: std::ops::Range<usize>) -> NodeCollection {
        NodeCollection::new(range.collect())
    }

    #[test]
    fn test_connection_spec() {
        let spec = ConnectionSpec::default();
        assert!(spec.allow_autapses);
        assert!(spec.allow_multapses);
        assert_eq!(spec.synapse_model, SynapseModel::Static);
    }

    #[test]
    fn test_all_to_all_without_autapses() {
        let spec = ConnectionSpec { allow_autapses: false, ..Default::default() };
        let pairs = collect(&spec, &nodes(1..4), &nodes(1..4)).unwrap();
        assert_eq!(pairs.len(), 6);
        assert!(pairs.iter().all(|(s, t)| s != t));
    }

    #[test]
    fn test_one_to_one_size_mismatch() {
        let spec = ConnectionSpec { rule: ConnectivityRule::OneToOne, ..Default::default() };
        assert!(collect(&spec, &nodes(1..4), &nodes(1..3)).is_err());
        assert_eq!(collect(&spec, &nodes(1..4), &nodes(4..7)).unwrap(), vec![(1, 4), (2, 5), (3, 6)]);
    }

    #[test]
    fn test_fixed_indegree_counts() {
        let spec = ConnectionSpec {
            rule: ConnectivityRule::FixedIndegree { indegree: 5 },
            allow_autapses: false,
            ..Default::default()
        };
        let all = nodes(1..21);
        let pairs = collect(&spec, &all, &all).unwrap();
        assert_eq!(pairs.len(), 20 * 5);
        for tgt in 1..21 {
            assert_eq!(pairs.iter().filter(|(_, t)| *t == tgt).count(), 5);
        }
        assert!(pairs.iter().all(|(s, t)| s != t));
    }

    #[test]
    fn test_fixed_indegree_without_multapses() {
        let spec = ConnectionSpec {
            rule: ConnectivityRule::FixedIndegree { indegree: 9 },
            allow_autapses: false,
            allow_multapses: false,
            ..Default::default()
        };
        let all = nodes(1..11);
        let pairs = collect(&spec, &all, &all).unwrap();
        for tgt in 1..11 {
            let mut srcs: Vec<_> = pairs.iter().filter(|(_, t)| *t == tgt).map(|(s, _)| *s).collect();
            srcs.sort();
            srcs.dedup();
            assert_eq!(srcs.len(), 9);
            assert!(!srcs.contains(&tgt));
        }

        let too_many = ConnectionSpec {
            rule: ConnectivityRule::FixedIndegree { indegree: 10 },
            ..spec
        };
        assert!(collect(&too_many, &all, &all).is_err());
    }

    #[test]
    fn test_fixed_outdegree_counts() {
        let spec = ConnectionSpec {
            rule: ConnectivityRule::FixedOutdegree { outdegree: 3 },
            ..Default::default()
        };
        let pairs = collect(&spec, &nodes(1..5), &nodes(10..20)).unwrap();
        assert_eq!(pairs.len(), 12);
        for src in 1..5 {
            assert_eq!(pairs.iter().filter(|(s, _)| *s == src).count(), 3);
        }
    }

    #[test]
    fn test_fixed_total_number() {
        let spec = ConnectionSpec {
            rule: ConnectivityRule::FixedTotalNumber { n: 30 },
            allow_multapses: false,
            ..Default::default()
        };
        let pairs = collect(&spec, &nodes(1..6), &nodes(6..12)).unwrap();
        assert_eq!(pairs.len(), 30);
        let unique: HashSet<_> = pairs.iter().collect();
        assert_eq!(unique.len(), 30);

        let impossible = ConnectionSpec {
            rule: ConnectivityRule::FixedTotalNumber { n: 31 },
            ..spec
        };
        assert!(collect(&impossible, &nodes(1..6), &nodes(6..12)).is_err());
    }

    #[test]
    fn test_pairwise_bernoulli() {
        let spec = ConnectionSpec {
            rule: ConnectivityRule::PairwiseBernoulli { p: 0.1 },
            ..Default::default()
        };
        let pairs = collect(&spec, &nodes(1..101), &nodes(1..101)).unwrap();
        // 10000 trials at p = 0.1
        assert!(pairs.len() > 850 && pairs.len() < 1150);

        let bad = ConnectionSpec {
            rule: ConnectivityRule::PairwiseBernoulli { p: 1.5 },
            ..Default::default()
        };
        assert!(collect(&bad, &nodes(1..3), &nodes(1..3)).is_err());
    }

    #[test]
    fn test_weight_samplers() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let u = WeightDistribution::Uniform { min: 1.0, max: 2.0 }.sampler().unwrap();
        for _ in 0..100 {
            let w = u.sample(&mut rng);
            assert!((1.0..2.0).contains(&w));
        }
        assert!(WeightDistribution::Uniform { min: 2.0, max: 1.0 }.sampler().is_err());
        assert!(WeightDistribution::Normal { mean: 0.0, std: -1.0 }.sampler().is_err());
        assert!(WeightDistribution::Constant(f64::NAN).sampler().is_err());
        assert!(matches!(
            WeightDistribution::Constant(3.0).sampler().unwrap(),
            ValueSampler::Constant(w) if w == 3.0
        ));
    }
}
