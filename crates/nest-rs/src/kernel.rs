//! The simulation kernel: node table, connectivity and the time-driven
//! update loop.
//!
//! Each step runs in three phases:
//!
//! 1. every neuron (in parallel) samples its Poisson drive into its own
//!    delay buffer, reads and clears the slot for this step, and integrates;
//! 2. spikes are stamped at the end of the step and handed to recorders;
//! 3. spikes are written into the delay buffers of their targets,
//!    `delay_steps` ahead.
//!
//! Poisson drive is sampled from a per-neuron ChaCha8 stream, so a run is a
//! function of the seed alone and does not depend on the thread count.

use crate::connection::{self, ConnectionSpec, Synapse, ValueSampler};
use crate::models::{IafPscAlpha, NodeModel, PoissonGeneratorParams, PoissonSampler};
use crate::recording::{SpikeData, SpikeRecorder};
use crate::{NestError, NodeCollection, NodeId, Result};
use brunel_core::ms_to_steps;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// KERNEL PARAMETERS
// ============================================================================

/// Simulation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelParams {
    pub resolution: f64,    // Time step (ms)
    pub rng_seed: u64,      // Random number generator seed
    pub num_threads: usize, // Number of threads, 0 = rayon default
    pub print_time: bool,   // Log simulation progress
}

impl Default for KernelParams {
    fn default() -> Self {
        Self {
            resolution: 0.1,
            rng_seed: 12345,
            num_threads: 0,
            print_time: false,
        }
    }
}

// ============================================================================
// NODE STORAGE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Neuron(usize),
    Generator(usize),
    Recorder(usize),
}

/// Ring buffer of pending synaptic input, one slot per step.
///
/// Excitatory and inhibitory input are kept apart because they feed
/// different synaptic currents.
#[derive(Debug, Clone)]
pub(crate) struct DelayBuffer {
    ex: Vec<f64>,
    inh: Vec<f64>,
}

impl DelayBuffer {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            ex: vec![0.0; len],
            inh: vec![0.0; len],
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.ex.len()
    }

    #[inline]
    pub(crate) fn add(&mut self, step: u64, weight: f64) {
        let slot = (step % self.ex.len() as u64) as usize;
        if weight >= 0.0 {
            self.ex[slot] += weight;
        } else {
            self.inh[slot] += weight;
        }
    }

    /// Read and clear the input for `step`
    #[inline]
    pub(crate) fn take(&mut self, step: u64) -> (f64, f64) {
        let slot = (step % self.ex.len() as u64) as usize;
        let ex = std::mem::take(&mut self.ex[slot]);
        let inh = std::mem::take(&mut self.inh[slot]);
        (ex, inh)
    }

    /// Grow to `len` slots, keeping input pending for `current` and later.
    pub(crate) fn resize(&mut self, len: usize, current: u64) {
        let old_len = self.len();
        if len <= old_len {
            return;
        }
        let mut grown = DelayBuffer::new(len);
        for k in 0..old_len as u64 {
            let step = current + k;
            let from = (step % old_len as u64) as usize;
            let to = (step % len as u64) as usize;
            grown.ex[to] = self.ex[from];
            grown.inh[to] = self.inh[from];
        }
        *self = grown;
    }
}

#[derive(Debug, Clone, Copy)]
struct PoissonDrive {
    generator: usize,
    weight: f64,
    delay_steps: u32,
}

#[derive(Debug, Clone)]
struct NeuronSlot {
    id: NodeId,
    neuron: IafPscAlpha,
    buffer: DelayBuffer,
    rng: ChaCha8Rng,
    drives: Vec<PoissonDrive>,
    last_spike: Option<f64>,
}

impl NeuronSlot {
    fn update(&mut self, step: u64, samplers: &[PoissonSampler]) -> bool {
        for drive in &self.drives {
            let n = samplers[drive.generator].sample(&mut self.rng);
            if n > 0 {
                self.buffer.add(step + drive.delay_steps as u64, n as f64 * drive.weight);
            }
        }
        let (ex, inh) = self.buffer.take(step);
        self.neuron.update(ex, inh)
    }
}

#[derive(Debug, Clone)]
struct GeneratorSlot {
    params: PoissonGeneratorParams,
}

// ============================================================================
// KERNEL
// ============================================================================

/// Simulation kernel
#[derive(Debug)]
pub struct Kernel {
    pub params: KernelParams,
    step: u64,
    nodes: Vec<NodeKind>, // index = id - 1
    neurons: Vec<NeuronSlot>,
    synapses: Vec<Vec<Synapse>>,   // outgoing, per neuron
    recorded_by: Vec<Vec<usize>>,  // recorder indices, per neuron
    generators: Vec<GeneratorSlot>,
    recorders: Vec<SpikeRecorder>,
    n_connections: usize,
    ring_len: usize,
    delay_range: Option<(u32, u32)>,
    rng: ChaCha8Rng,
    pool: Option<Arc<ThreadPool>>,
}

impl Kernel {
    pub fn new(params: KernelParams) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(params.rng_seed);
        Self {
            params,
            step: 0,
            nodes: Vec::new(),
            neurons: Vec::new(),
            synapses: Vec::new(),
            recorded_by: Vec::new(),
            generators: Vec::new(),
            recorders: Vec::new(),
            n_connections: 0,
            ring_len: 2,
            delay_range: None,
            rng,
            pool: None,
        }
    }

    /// Reset the kernel: drop all nodes and connections, rewind time
    pub fn reset(&mut self) {
        *self = Kernel::new(self.params.clone());
    }

    /// Set kernel parameters
    pub fn set_params(&mut self, params: KernelParams) -> Result<()> {
        if !self.nodes.is_empty() && params.resolution != self.params.resolution {
            return Err(NestError::InvalidParameter(
                "resolution cannot change after nodes have been created".into(),
            ));
        }
        if params.num_threads != self.params.num_threads {
            self.pool = None;
        }
        if params.rng_seed != self.params.rng_seed {
            self.rng = ChaCha8Rng::seed_from_u64(params.rng_seed);
        }
        self.params = params;
        Ok(())
    }

    /// Get current simulation time (ms)
    pub fn time(&self) -> f64 {
        self.step as f64 * self.params.resolution
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_connections(&self) -> usize {
        self.n_connections
    }

    /// Smallest synaptic delay in use (ms)
    pub fn min_delay(&self) -> Option<f64> {
        self.delay_range.map(|(lo, _)| lo as f64 * self.params.resolution)
    }

    /// Largest synaptic delay in use (ms)
    pub fn max_delay(&self) -> Option<f64> {
        self.delay_range.map(|(_, hi)| hi as f64 * self.params.resolution)
    }

    fn kind(&self, id: NodeId) -> Result<NodeKind> {
        id.checked_sub(1)
            .and_then(|idx| self.nodes.get(idx))
            .copied()
            .ok_or(NestError::NodeNotFound(id))
    }

    // ------------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------------

    /// Create `n` nodes of `model`
    pub fn create(&mut self, model: NodeModel, n: usize) -> Result<NodeCollection> {
        let h = self.params.resolution;
        let mut ids = Vec::with_capacity(n);

        match &model {
            NodeModel::IafPscAlpha(p) => {
                // Validates parameters before any node is added
                let prototype = IafPscAlpha::new(p.clone(), h)?;
                self.neurons.reserve(n);
                for _ in 0..n {
                    let id = self.nodes.len() + 1;
                    let mut rng = ChaCha8Rng::seed_from_u64(self.params.rng_seed);
                    rng.set_stream(id as u64);
                    self.nodes.push(NodeKind::Neuron(self.neurons.len()));
                    self.neurons.push(NeuronSlot {
                        id,
                        neuron: prototype.clone(),
                        buffer: DelayBuffer::new(self.ring_len),
                        rng,
                        drives: Vec::new(),
                        last_spike: None,
                    });
                    self.synapses.push(Vec::new());
                    self.recorded_by.push(Vec::new());
                    ids.push(id);
                }
            }
            NodeModel::PoissonGenerator(p) => {
                p.validate()?;
                for _ in 0..n {
                    let id = self.nodes.len() + 1;
                    self.nodes.push(NodeKind::Generator(self.generators.len()));
                    self.generators.push(GeneratorSlot { params: p.clone() });
                    ids.push(id);
                }
            }
            NodeModel::SpikeRecorder => {
                for _ in 0..n {
                    let id = self.nodes.len() + 1;
                    self.nodes.push(NodeKind::Recorder(self.recorders.len()));
                    self.recorders.push(SpikeRecorder::default());
                    ids.push(id);
                }
            }
        }

        log::debug!("Created {} {} node(s)", n, model.name());
        Ok(NodeCollection::new(ids))
    }

    // ------------------------------------------------------------------------
    // Connect
    // ------------------------------------------------------------------------

    /// Connect neurons, generators and recorders.
    ///
    /// Neuron to neuron pairs become synapses, generator to neuron pairs
    /// become Poisson drive, and neuron to recorder pairs register the neuron
    /// with the recorder. When every target is a recorder the rule is not
    /// applied: each source is registered with each recorder.
    pub fn connect(
        &mut self,
        sources: &NodeCollection,
        targets: &NodeCollection,
        spec: &ConnectionSpec,
    ) -> Result<()> {
        for &id in sources.iter().chain(targets.iter()) {
            self.kind(id)?;
        }

        let targets_are_recorders = !targets.is_empty()
            && targets
                .iter()
                .all(|&id| matches!(self.kind(id), Ok(NodeKind::Recorder(_))));
        if targets_are_recorders {
            for &src in sources {
                for &tgt in targets {
                    self.register_with_recorder(src, tgt)?;
                }
            }
            return Ok(());
        }

        let weight = spec.weight.sampler()?;
        let delay = spec.delay.sampler()?;
        let clamp = spec.delay.clamps_to_resolution();
        if let ValueSampler::Constant(d) = &delay {
            self.delay_to_steps(*d, clamp)?;
        }

        let before = self.n_connections;
        let mut rng = self.rng.clone();
        let result = connection::for_each_pair(spec, sources, targets, &mut rng, |src, tgt, rng| {
            let w = weight.sample(rng);
            let d = delay.sample(rng);
            self.add_connection(src, tgt, w, d, clamp)
        });
        self.rng = rng;
        result?;

        log::debug!(
            "Connected {} -> {} node(s) with {:?}: {} new connection(s)",
            sources.len(),
            targets.len(),
            spec.rule,
            self.n_connections - before
        );
        Ok(())
    }

    fn delay_to_steps(&self, delay: f64, clamp: bool) -> Result<u32> {
        let h = self.params.resolution;
        if !delay.is_finite() {
            return Err(NestError::InvalidParameter(format!("delay must be finite, got {}", delay)));
        }
        let steps = if delay > 0.0 { ms_to_steps(delay, h)? } else { 0 };
        if steps >= 1 {
            return u32::try_from(steps).map_err(|_| {
                NestError::InvalidParameter(format!("delay {} ms is too long", delay))
            });
        }
        if clamp {
            return Ok(1);
        }
        Err(NestError::InvalidParameter(format!(
            "delay {} ms is shorter than the resolution {} ms",
            delay, h
        )))
    }

    fn ensure_ring(&mut self, delay_steps: u32) {
        self.delay_range = Some(match self.delay_range {
            Some((lo, hi)) => (lo.min(delay_steps), hi.max(delay_steps)),
            None => (delay_steps, delay_steps),
        });

        let needed = delay_steps as usize + 1;
        if needed > self.ring_len {
            self.ring_len = needed;
            let current = self.step;
            for slot in &mut self.neurons {
                slot.buffer.resize(needed, current);
            }
        }
    }

    fn add_connection(&mut self, src: NodeId, tgt: NodeId, weight: f64, delay: f64, clamp: bool) -> Result<()> {
        match (self.kind(src)?, self.kind(tgt)?) {
            (NodeKind::Neuron(s), NodeKind::Neuron(t)) => {
                let delay_steps = self.delay_to_steps(delay, clamp)?;
                self.ensure_ring(delay_steps);
                self.synapses[s].push(Synapse {
                    target: t as u32,
                    delay_steps,
                    weight,
                });
            }
            (NodeKind::Generator(g), NodeKind::Neuron(t)) => {
                let delay_steps = self.delay_to_steps(delay, clamp)?;
                self.ensure_ring(delay_steps);
                self.neurons[t].drives.push(PoissonDrive {
                    generator: g,
                    weight,
                    delay_steps,
                });
            }
            (NodeKind::Neuron(_), NodeKind::Recorder(_)) => {
                return self.register_with_recorder(src, tgt);
            }
            (NodeKind::Recorder(_), _) => {
                return Err(NestError::ConnectionError(format!(
                    "spike_recorder {} cannot be a connection source",
                    src
                )));
            }
            (_, NodeKind::Generator(_)) => {
                return Err(NestError::ConnectionError(format!(
                    "poisson_generator {} does not accept incoming connections",
                    tgt
                )));
            }
            (NodeKind::Generator(_), NodeKind::Recorder(_)) => {
                return Err(NestError::ConnectionError(format!(
                    "poisson_generator {} cannot be recorded by spike_recorder {}",
                    src, tgt
                )));
            }
        }
        self.n_connections += 1;
        Ok(())
    }

    fn register_with_recorder(&mut self, src: NodeId, tgt: NodeId) -> Result<()> {
        let NodeKind::Recorder(r) = self.kind(tgt)? else {
            return Err(NestError::ConnectionError(format!("node {} is not a spike_recorder", tgt)));
        };
        match self.kind(src)? {
            NodeKind::Neuron(s) => {
                if !self.recorded_by[s].contains(&r) {
                    self.recorded_by[s].push(r);
                    self.n_connections += 1;
                }
                Ok(())
            }
            _ => Err(NestError::ConnectionError(format!(
                "only neurons can be recorded, node {} is not a neuron",
                src
            ))),
        }
    }

    // ------------------------------------------------------------------------
    // Simulate
    // ------------------------------------------------------------------------

    fn thread_pool(&mut self) -> Result<Option<Arc<ThreadPool>>> {
        if self.params.num_threads == 0 {
            return Ok(None);
        }
        if self.pool.is_none() {
            let pool = ThreadPoolBuilder::new()
                .num_threads(self.params.num_threads)
                .build()
                .map_err(|e| NestError::SimulationError(format!("thread pool: {}", e)))?;
            self.pool = Some(Arc::new(pool));
        }
        Ok(self.pool.clone())
    }

    /// Advance the network by `time` ms; repeated calls continue the run
    pub fn simulate(&mut self, time: f64) -> Result<()> {
        if !(time > 0.0) || !time.is_finite() {
            return Err(NestError::SimulationError(format!(
                "simulation time must be positive and finite, got {}",
                time
            )));
        }
        let h = self.params.resolution;
        let n_steps = ms_to_steps(time, h)?;
        if n_steps == 0 {
            return Err(NestError::SimulationError(format!(
                "simulation time {} ms is shorter than the resolution {} ms",
                time, h
            )));
        }

        let samplers = self
            .generators
            .iter()
            .map(|g| PoissonSampler::new(&g.params, h))
            .collect::<Result<Vec<_>>>()?;

        let t_start = self.time();
        let t_stop = t_start + n_steps as f64 * h;
        log::debug!(
            "Simulating {:.1} ms ({} steps) from t = {:.1} ms, {} neurons, {} connections",
            time,
            n_steps,
            t_start,
            self.neurons.len(),
            self.n_connections
        );

        match self.thread_pool()? {
            Some(pool) => pool.install(|| self.run_steps(n_steps, &samplers)),
            None => self.run_steps(n_steps, &samplers),
        }

        log::debug!("Simulation reached t = {:.1} ms", t_stop);
        Ok(())
    }

    fn run_steps(&mut self, n_steps: u64, samplers: &[PoissonSampler]) {
        let log_every = (n_steps / 10).max(1);
        for k in 0..n_steps {
            self.advance(samplers);
            if self.params.print_time && (k + 1) % log_every == 0 {
                log::debug!("t = {:.1} ms ({:.0}%)", self.time(), 100.0 * (k + 1) as f64 / n_steps as f64);
            }
        }
    }

    fn advance(&mut self, samplers: &[PoissonSampler]) {
        let step = self.step;
        let spiked: Vec<usize> = self
            .neurons
            .par_iter_mut()
            .enumerate()
            .filter_map(|(idx, slot)| slot.update(step, samplers).then_some(idx))
            .collect();

        let stamp = (step + 1) as f64 * self.params.resolution;
        for &idx in &spiked {
            let sender = self.neurons[idx].id;
            self.neurons[idx].last_spike = Some(stamp);
            for &r in &self.recorded_by[idx] {
                self.recorders[r].data.record(stamp, sender);
            }
            for syn in &self.synapses[idx] {
                self.neurons[syn.target as usize]
                    .buffer
                    .add(step + syn.delay_steps as u64, syn.weight);
            }
        }

        self.step += 1;
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    /// Spikes collected by a spike recorder
    pub fn spike_data(&self, recorder: NodeId) -> Result<&SpikeData> {
        match self.kind(recorder)? {
            NodeKind::Recorder(r) => Ok(&self.recorders[r].data),
            _ => Err(NestError::InvalidParameter(format!(
                "node {} is not a spike_recorder",
                recorder
            ))),
        }
    }

    /// Get node status (state and parameters)
    pub fn get_status(&self, nodes: &NodeCollection) -> Result<Vec<HashMap<String, f64>>> {
        let mut results = Vec::with_capacity(nodes.len());

        for &id in nodes {
            let mut status = HashMap::new();
            status.insert("global_id".into(), id as f64);
            match self.kind(id)? {
                NodeKind::Neuron(n) => {
                    let slot = &self.neurons[n];
                    let p = slot.neuron.params();
                    let s = &slot.neuron.state;
                    status.insert("V_m".into(), slot.neuron.v_m());
                    status.insert("I_syn_ex".into(), s.i_ex);
                    status.insert("I_syn_in".into(), s.i_in);
                    status.insert("dI_syn_ex".into(), s.di_ex);
                    status.insert("dI_syn_in".into(), s.di_in);
                    status.insert("refractory_steps".into(), s.refractory as f64);
                    status.insert("t_spike".into(), slot.last_spike.unwrap_or(f64::NEG_INFINITY));
                    status.insert("C_m".into(), p.c_m);
                    status.insert("tau_m".into(), p.tau_m);
                    status.insert("tau_syn_ex".into(), p.tau_syn_ex);
                    status.insert("tau_syn_in".into(), p.tau_syn_in);
                    status.insert("t_ref".into(), p.t_ref);
                    status.insert("E_L".into(), p.e_l);
                    status.insert("V_reset".into(), p.v_reset);
                    status.insert("V_th".into(), p.v_th);
                    status.insert("I_e".into(), p.i_e);
                }
                NodeKind::Generator(g) => {
                    status.insert("rate".into(), self.generators[g].params.rate);
                }
                NodeKind::Recorder(r) => {
                    status.insert("n_events".into(), self.recorders[r].data.n_events() as f64);
                }
            }
            results.push(status);
        }

        Ok(results)
    }

    /// Set node status; unknown keys are rejected
    pub fn set_status(&mut self, nodes: &NodeCollection, params: &HashMap<String, f64>) -> Result<()> {
        for &id in nodes {
            match self.kind(id)? {
                NodeKind::Neuron(n) => {
                    let neuron = &mut self.neurons[n].neuron;
                    for (key, &value) in params {
                        match key.as_str() {
                            "V_m" => neuron.set_v_m(value),
                            "I_e" => neuron.set_i_e(value),
                            "refractory_steps" => {
                                if !(value >= 0.0) || !value.is_finite() || value.fract() != 0.0 {
                                    return Err(NestError::InvalidParameter(format!(
                                        "refractory_steps must be a non-negative whole number, got {}",
                                        value
                                    )));
                                }
                                neuron.set_refractory(value as u64);
                            }
                            _ => return Err(unsupported(key, "iaf_psc_alpha")),
                        }
                    }
                }
                NodeKind::Generator(g) => {
                    for (key, &value) in params {
                        match key.as_str() {
                            "rate" => {
                                let params = PoissonGeneratorParams { rate: value };
                                params.validate()?;
                                self.generators[g].params = params;
                            }
                            _ => return Err(unsupported(key, "poisson_generator")),
                        }
                    }
                }
                NodeKind::Recorder(_) => {
                    if let Some(key) = params.keys().next() {
                        return Err(unsupported(key, "spike_recorder"));
                    }
                }
            }
        }
        Ok(())
    }
}

fn unsupported(key: &str, model: &str) -> NestError {
    NestError::InvalidParameter(format!("{} has no settable parameter '{}'", model, key))
}

// ============================================================================
// TESTS
// ============================================================================
