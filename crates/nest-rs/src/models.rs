//! Node models: `iaf_psc_alpha`, `poisson_generator` and `spike_recorder`.
//!
//! The integrate-and-fire neuron uses exact integration of the linear
//! subthreshold dynamics (Rotter & Diesmann 1999), as NEST does:
//!
//! ```text
//! dI'/dt = -I'/tau_syn                  (alpha kernel, derivative)
//! dI/dt  =  I' - I/tau_syn              (alpha kernel, current)
//! dV/dt  = -V/tau_m + (I + I_e)/C_m     (membrane, V relative to E_L)
//! ```
//!
//! Over one step `h` the state maps linearly onto the next through the
//! propagator matrix `P`, so the result does not depend on the step size
//! except through spike-time quantization.

use crate::{NestError, Result};
use rand::Rng;
use rand_distr::{Distribution, Poisson};
use serde::{Deserialize, Serialize};
use std::f64::consts::E;

/// Below this `|h * (1/tau_syn - 1/tau_m)|` the 31 propagator is evaluated
/// from its Taylor series to avoid cancellation.
const SERIES_THRESHOLD: f64 = 1e-2;

// ============================================================================
// MODEL SELECTION
// ============================================================================

/// Models a node can be created from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeModel {
    /// Integrate-and-fire with alpha-function PSCs
    IafPscAlpha(IafPscAlphaParams),

    /// Poisson generator
    PoissonGenerator(PoissonGeneratorParams),

    /// Spike recorder
    SpikeRecorder,
}

impl NodeModel {
    /// NEST model name
    pub fn name(&self) -> &'static str {
        match self {
            NodeModel::IafPscAlpha(_) => "iaf_psc_alpha",
            NodeModel::PoissonGenerator(_) => "poisson_generator",
            NodeModel::SpikeRecorder => "spike_recorder",
        }
    }
}

// ============================================================================
// IAF_PSC_ALPHA
// ============================================================================

/// Parameters for iaf_psc_alpha
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IafPscAlphaParams {
    pub c_m: f64,        // Membrane capacitance (pF)
    pub tau_m: f64,      // Membrane time constant (ms)
    pub tau_syn_ex: f64, // Excitatory synaptic time constant (ms)
    pub tau_syn_in: f64, // Inhibitory synaptic time constant (ms)
    pub t_ref: f64,      // Refractory period (ms)
    pub e_l: f64,        // Resting potential (mV)
    pub v_reset: f64,    // Reset potential (mV)
    pub v_th: f64,       // Spike threshold (mV)
    pub i_e: f64,        // External DC current (pA)
    /// Absolute lower bound of the membrane potential (mV)
    pub v_min: Option<f64>,
    /// Initial membrane potential (mV), defaults to `e_l`
    pub v_init: Option<f64>,
}

impl Default for IafPscAlphaParams {
    fn default() -> Self {
        Self {
            c_m: 250.0,
            tau_m: 10.0,
            tau_syn_ex: 2.0,
            tau_syn_in: 2.0,
            t_ref: 2.0,
            e_l: -70.0,
            v_reset: -70.0,
            v_th: -55.0,
            i_e: 0.0,
            v_min: None,
            v_init: None,
        }
    }
}

impl IafPscAlphaParams {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("C_m", self.c_m),
            ("tau_m", self.tau_m),
            ("tau_syn_ex", self.tau_syn_ex),
            ("tau_syn_in", self.tau_syn_in),
        ];
        for (name, value) in positive {
            if !(value > 0.0) || !value.is_finite() {
                return Err(NestError::InvalidParameter(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        if !(self.t_ref >= 0.0) {
            return Err(NestError::InvalidParameter(format!(
                "t_ref must be non-negative, got {}",
                self.t_ref
            )));
        }
        if self.v_reset >= self.v_th {
            return Err(NestError::InvalidParameter(format!(
                "V_reset ({}) must be below V_th ({})",
                self.v_reset, self.v_th
            )));
        }
        if let Some(v_min) = self.v_min {
            if v_min > self.v_reset {
                return Err(NestError::InvalidParameter(format!(
                    "V_min ({}) must not exceed V_reset ({})",
                    v_min, self.v_reset
                )));
            }
        }
        Ok(())
    }
}

/// Dynamic state of one iaf_psc_alpha neuron
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IafPscAlphaState {
    pub di_ex: f64, // Derivative of excitatory current (pA/ms)
    pub i_ex: f64,  // Excitatory current (pA)
    pub di_in: f64,
    pub i_in: f64,
    /// Membrane potential relative to E_L (mV)
    pub v_rel: f64,
    /// Remaining refractory steps
    pub refractory: u64,
}

/// Precomputed per-step propagators for one synapse type
#[derive(Debug, Clone, Copy, PartialEq)]
struct SynapsePropagator {
    p11: f64,
    p21: f64,
    p22: f64,
    p31: f64,
    p32: f64,
    /// Jump of I' per pA of weight, so that a weight equals the PSC peak
    psc_initial: f64,
}

impl SynapsePropagator {
    fn new(tau_syn: f64, tau_m: f64, c_m: f64, h: f64) -> Self {
        let p11 = (-h / tau_syn).exp();
        Self {
            p11,
            p21: h * p11,
            p22: p11,
            p31: propagator_31(tau_syn, tau_m, c_m, h),
            p32: propagator_32(tau_syn, tau_m, c_m, h),
            psc_initial: E / tau_syn,
        }
    }
}

/// Contribution of I'(0) = 1 to V(h)
pub fn propagator_31(tau_syn: f64, tau_m: f64, c_m: f64, h: f64) -> f64 {
    let a = 1.0 / tau_syn - 1.0 / tau_m;
    let decay_m = (-h / tau_m).exp();
    let x = a * h;
    if x.abs() < SERIES_THRESHOLD {
        // 1 - e^{-x}(1 + x) = x^2/2 - x^3/3 + x^4/8 - x^5/30 + ...
        let series = 0.5 - x / 3.0 + x * x / 8.0 - x * x * x / 30.0;
        return decay_m * h * h * series / c_m;
    }
    decay_m * (1.0 - (-x).exp() * (1.0 + x)) / (a * a * c_m)
}

/// Contribution of I(0) = 1 to V(h)
pub fn propagator_32(tau_syn: f64, tau_m: f64, c_m: f64, h: f64) -> f64 {
    let a = 1.0 / tau_syn - 1.0 / tau_m;
    let decay_m = (-h / tau_m).exp();
    if a == 0.0 {
        return h * decay_m / c_m;
    }
    decay_m * -(-a * h).exp_m1() / (a * c_m)
}

/// Integrate-and-fire neuron with alpha-shaped postsynaptic currents
#[derive(Debug, Clone)]
pub struct IafPscAlpha {
    params: IafPscAlphaParams,
    pub state: IafPscAlphaState,
    ex: SynapsePropagator,
    inh: SynapsePropagator,
    p30: f64,
    p33: f64,
    theta: f64,
    v_reset_rel: f64,
    lower_bound: f64,
    refractory_steps: u64,
}

impl IafPscAlpha {
    /// Build a neuron for step size `h` (ms)
    pub fn new(params: IafPscAlphaParams, h: f64) -> Result<Self> {
        params.validate()?;
        if !(h > 0.0) || !h.is_finite() {
            return Err(NestError::InvalidParameter(format!(
                "resolution must be positive, got {}",
                h
            )));
        }

        let p33 = (-h / params.tau_m).exp();
        let state = IafPscAlphaState {
            v_rel: params.v_init.unwrap_or(params.e_l) - params.e_l,
            ..Default::default()
        };

        Ok(Self {
            ex: SynapsePropagator::new(params.tau_syn_ex, params.tau_m, params.c_m, h),
            inh: SynapsePropagator::new(params.tau_syn_in, params.tau_m, params.c_m, h),
            p30: params.tau_m / params.c_m * (1.0 - p33),
            p33,
            theta: params.v_th - params.e_l,
            v_reset_rel: params.v_reset - params.e_l,
            lower_bound: params.v_min.map_or(f64::NEG_INFINITY, |v| v - params.e_l),
            refractory_steps: (params.t_ref / h).round() as u64,
            state,
            params,
        })
    }

    pub fn params(&self) -> &IafPscAlphaParams {
        &self.params
    }

    /// Absolute membrane potential (mV)
    pub fn v_m(&self) -> f64 {
        self.state.v_rel + self.params.e_l
    }

    pub fn set_v_m(&mut self, v_m: f64) {
        self.state.v_rel = v_m - self.params.e_l;
    }

    pub fn set_i_e(&mut self, i_e: f64) {
        self.params.i_e = i_e;
    }

    pub fn is_refractory(&self) -> bool {
        self.state.refractory > 0
    }

    /// Hold the neuron refractory for the next `steps` steps
    pub fn set_refractory(&mut self, steps: u64) {
        self.state.refractory = steps;
    }

    /// Advance one step.
    ///
    /// `ex_input` and `in_input` are the summed weights (pA) of spikes that
    /// arrive in this step; `in_input` is negative. Returns true if the
    /// neuron fired at the end of the step.
    pub fn update(&mut self, ex_input: f64, in_input: f64) -> bool {
        let s = &mut self.state;

        if s.refractory == 0 {
            let v = self.p30 * self.params.i_e
                + self.ex.p31 * s.di_ex
                + self.ex.p32 * s.i_ex
                + self.inh.p31 * s.di_in
                + self.inh.p32 * s.i_in
                + self.p33 * s.v_rel;
            s.v_rel = v.max(self.lower_bound);
        } else {
            s.refractory -= 1;
        }

        s.i_ex = self.ex.p21 * s.di_ex + self.ex.p22 * s.i_ex;
        s.di_ex = self.ex.p11 * s.di_ex + self.ex.psc_initial * ex_input;

        s.i_in = self.inh.p21 * s.di_in + self.inh.p22 * s.i_in;
        s.di_in = self.inh.p11 * s.di_in + self.inh.psc_initial * in_input;

        if s.v_rel >= self.theta {
            s.refractory = self.refractory_steps;
            s.v_rel = self.v_reset_rel;
            return true;
        }
        false
    }
}

// ============================================================================
// DEVICES
// ============================================================================

/// Poisson generator parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoissonGeneratorParams {
    pub rate: f64, // Firing rate (Hz)
}

impl PoissonGeneratorParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.rate >= 0.0) || !self.rate.is_finite() {
            return Err(NestError::InvalidParameter(format!(
                "poisson_generator rate must be non-negative, got {}",
                self.rate
            )));
        }
        Ok(())
    }
}

/// Per-step spike-count sampler of a Poisson generator.
///
/// Every target draws its own counts, so targets receive independent
/// realizations of the process.
#[derive(Debug, Clone)]
pub struct PoissonSampler {
    dist: Option<Poisson<f64>>,
}

impl PoissonSampler {
    pub fn new(params: &PoissonGeneratorParams, h: f64) -> Result<Self> {
        params.validate()?;
        let lambda = params.rate * h / 1000.0;
        if lambda == 0.0 {
            return Ok(Self { dist: None });
        }
        let dist = Poisson::new(lambda).map_err(|e| {
            NestError::InvalidParameter(format!("poisson_generator rate {}: {}", params.rate, e))
        })?;
        Ok(Self { dist: Some(dist) })
    }

    /// Number of spikes in one step
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        match &self.dist {
            Some(dist) => dist.sample(rng) as u64,
            None => 0,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn brunel_neuron() -> IafPscAlphaParams {
        IafPscAlphaParams {
            c_m: 250.0,
            tau_m: 20.0,
            tau_syn_ex: 0.5,
            tau_syn_in: 0.5,
            t_ref: 2.0,
            e_l: 0.0,
            v_reset: 0.0,
            v_th: 20.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_iaf_params() {
        let params = IafPscAlphaParams::default();
        assert_eq!(params.tau_m, 10.0);
        assert_eq!(params.e_l, -70.0);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_invalid_params_rejected() {
        let bad_c = IafPscAlphaParams { c_m: 0.0, ..Default::default() };
        assert!(IafPscAlpha::new(bad_c, 0.1).is_err());

        let bad_reset = IafPscAlphaParams { v_reset: -50.0, ..Default::default() };
        assert!(bad_reset.validate().is_err());

        let bad_ref = IafPscAlphaParams { t_ref: -1.0, ..Default::default() };
        assert!(bad_ref.validate().is_err());

        assert!(IafPscAlpha::new(IafPscAlphaParams::default(), 0.0).is_err());
    }

    #[test]
    fn test_rest_without_input() {
        let mut neuron = IafPscAlpha::new(IafPscAlphaParams::default(), 0.1).unwrap();
        for _ in 0..1000 {
            assert!(!neuron.update(0.0, 0.0));
        }
        assert!((neuron.v_m() - (-70.0)).abs() < 1e-12);
    }

    #[test]
    fn test_dc_current_steady_state() {
        // 100 pA into 250 pF / 10 ms settles at 4 mV above rest
        let params = IafPscAlphaParams { i_e: 100.0, ..Default::default() };
        let mut neuron = IafPscAlpha::new(params, 0.1).unwrap();
        for _ in 0..3000 {
            neuron.update(0.0, 0.0);
        }
        assert!((neuron.v_m() - (-66.0)).abs() < 1e-6);
    }

    #[test]
    fn test_suprathreshold_dc_fires_periodically() {
        let params = IafPscAlphaParams { i_e: 500.0, ..Default::default() };
        let mut neuron = IafPscAlpha::new(params, 0.1).unwrap();
        let spikes: Vec<usize> = (0..2000).filter(|_| neuron.update(0.0, 0.0)).collect();
        assert!(spikes.len() > 5);

        let isis: Vec<usize> = spikes.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(isis.iter().all(|&isi| isi == isis[0]));
    }

    #[test]
    fn test_refractory_period_clamps_voltage() {
        let params = IafPscAlphaParams { i_e: 1000.0, ..Default::default() };
        let mut neuron = IafPscAlpha::new(params, 0.1).unwrap();
        while !neuron.update(0.0, 0.0) {}

        assert_eq!(neuron.state.refractory, 20);
        for _ in 0..20 {
            assert!(!neuron.update(0.0, 0.0));
            assert_eq!(neuron.v_m(), -70.0);
        }
        assert!(!neuron.is_refractory());
        neuron.update(0.0, 0.0);
        assert!(neuron.v_m() > -70.0);
    }

    #[test]
    fn test_alpha_psc_peak_equals_weight() {
        let mut neuron = IafPscAlpha::new(brunel_neuron(), 0.01).unwrap();
        neuron.update(50.0, 0.0);
        let mut peak: f64 = 0.0;
        for _ in 0..500 {
            neuron.update(0.0, 0.0);
            peak = peak.max(neuron.state.i_ex);
        }
        // I(t) = w * t/tau * exp(1 - t/tau) peaks at w
        assert!((peak - 50.0).abs() < 0.05);
    }

    #[test]
    fn test_inhibitory_input_hyperpolarizes() {
        let mut neuron = IafPscAlpha::new(brunel_neuron(), 0.1).unwrap();
        neuron.update(0.0, -100.0);
        for _ in 0..20 {
            neuron.update(0.0, 0.0);
        }
        assert!(neuron.v_m() < 0.0);
        assert!(neuron.state.i_ex.abs() < 1e-12);
    }

    #[test]
    fn test_lower_bound() {
        let params = IafPscAlphaParams { v_min: Some(-72.0), ..Default::default() };
        let mut neuron = IafPscAlpha::new(params, 0.1).unwrap();
        neuron.update(0.0, -1e5);
        for _ in 0..50 {
            neuron.update(0.0, 0.0);
            assert!(neuron.v_m() >= -72.0 - 1e-12);
        }
    }

    #[test]
    fn test_singular_propagators_are_continuous() {
        let h = 0.1;
        let near = propagator_32(10.0 + 1e-6, 10.0, 250.0, h);
        let exact = propagator_32(10.0, 10.0, 250.0, h);
        assert!((near - exact).abs() < 1e-8);

        let near = propagator_31(10.0 + 1e-6, 10.0, 250.0, h);
        let exact = propagator_31(10.0, 10.0, 250.0, h);
        assert!((near - exact).abs() < 1e-8);
    }

    #[test]
    fn test_poisson_sampler_mean() {
        let sampler = PoissonSampler::new(&PoissonGeneratorParams { rate: 10_000.0 }, 0.1).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let n = 20_000;
        let total: u64 = (0..n).map(|_| sampler.sample(&mut rng)).sum();
        let mean = total as f64 / n as f64;
        assert!((mean - 1.0).abs() < 0.05);
    }

    #[test]
    fn test_poisson_zero_rate_is_silent() {
        let sampler = PoissonSampler::new(&PoissonGeneratorParams { rate: 0.0 }, 0.1).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!((0..100).all(|_| sampler.sample(&mut rng) == 0));
        assert!(PoissonSampler::new(&PoissonGeneratorParams { rate: -1.0 }, 0.1).is_err());
    }
}
