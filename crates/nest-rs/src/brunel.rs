//! The Brunel (2000) sparsely connected balanced network.
//!
//! `4 * order` excitatory and `order` inhibitory `iaf_psc_alpha` neurons,
//! each receiving `epsilon * N_E` excitatory and `epsilon * N_I` inhibitory
//! inputs (fixed indegree) plus independent Poisson drive at `eta` times
//! the rate needed to reach threshold on average. Inhibitory synapses are
//! `g` times stronger than excitatory ones.
//!
//! Parameter values and derived quantities follow NEST's
//! `brunel_alpha_nest.py` example.
//!
//! Reference: Brunel N (2000) Dynamics of sparsely connected networks of
//! excitatory and inhibitory spiking neurons. J Comput Neurosci 8:183-208.

use crate::analysis::{summarize, ActivitySummary};
use crate::connection::{ConnectionSpec, ConnectivityRule};
use crate::kernel::{Kernel, KernelParams};
use crate::models::{IafPscAlphaParams, NodeModel, PoissonGeneratorParams};
use crate::{NestError, NodeCollection, NodeId, Result, SpikeData};
use brunel_core::{ms_to_steps, write_spikes, SpikeEvent};
use lambert_w::lambert_wm1;
use serde::{Deserialize, Serialize};
use std::f64::consts::E;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;

// ============================================================================
// PARAMETERS
// ============================================================================

/// Brunel network parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrunelParams {
    pub g: f64,        // Relative strength of inhibition
    pub eta: f64,      // External rate relative to threshold rate
    pub simtime: f64,  // Simulation time (ms)
    pub dt: f64,       // Resolution (ms)
    pub order: usize,  // N_E = 4 * order, N_I = order
    /// Neurons recorded per population; `None` records every excitatory
    /// neuron (and with it every inhibitory one)
    #[serde(alias = "N_rec")]
    pub n_rec: Option<usize>,
    /// Run label, used as the output file prefix
    pub simulator_name: String,
    /// NeuroML simulator to export to; accepted for compatibility, unused
    pub jnml_simulator: Option<String>,

    pub delay: f64,   // Synaptic delay (ms)
    pub epsilon: f64, // Connection probability
    pub j: f64,       // PSP amplitude (mV)
    pub tau_syn: f64, // Synaptic time constant (ms)
    pub c_m: f64,     // Membrane capacitance (pF)
    pub tau_m: f64,   // Membrane time constant (ms)
    pub theta: f64,   // Threshold above rest (mV)
    pub t_ref: f64,   // Refractory period (ms)

    pub rng_seed: u64,
    pub num_threads: usize,
}

impl Default for BrunelParams {
    fn default() -> Self {
        Self {
            g: 5.0,
            eta: 2.0,
            simtime: 1000.0,
            dt: 0.1,
            order: 2500,
            n_rec: None,
            simulator_name: "NEST".into(),
            jnml_simulator: None,
            delay: 1.5,
            epsilon: 0.1,
            j: 0.1,
            tau_syn: 0.5,
            c_m: 250.0,
            tau_m: 20.0,
            theta: 20.0,
            t_ref: 2.0,
            rng_seed: 12345,
            num_threads: 0,
        }
    }
}

/// Quantities derived from [`BrunelParams`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedParams {
    pub n_e: usize,
    pub n_i: usize,
    pub c_e: usize,    // Excitatory indegree
    pub c_i: usize,    // Inhibitory indegree
    pub j_unit: f64,   // PSP peak (mV) of a 1 pA PSC
    pub j_ex: f64,     // Excitatory PSC amplitude (pA)
    pub j_in: f64,     // Inhibitory PSC amplitude (pA)
    pub nu_th: f64,    // Threshold rate (1/ms)
    pub nu_ex: f64,    // External rate per input (1/ms)
    pub p_rate: f64,   // Total Poisson rate per neuron (Hz)
    pub n_rec_e: usize,
    pub n_rec_i: usize,
}

impl BrunelParams {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(NestError::InvalidParameter(msg));

        if self.order == 0 {
            return invalid("order must be at least 1".into());
        }
        if !(self.dt > 0.0) || !self.dt.is_finite() {
            return invalid(format!("dt must be positive, got {}", self.dt));
        }
        if !(self.simtime > 0.0) || !self.simtime.is_finite() {
            return invalid(format!("simtime must be positive, got {}", self.simtime));
        }
        if ms_to_steps(self.simtime, self.dt)? == 0 {
            return invalid(format!(
                "simtime ({} ms) is shorter than one step of dt ({} ms)",
                self.simtime, self.dt
            ));
        }
        if !(self.delay >= self.dt) {
            return invalid(format!(
                "delay ({} ms) must be at least dt ({} ms)",
                self.delay, self.dt
            ));
        }
        if !(self.epsilon > 0.0 && self.epsilon <= 1.0) {
            return invalid(format!("epsilon must lie in (0, 1], got {}", self.epsilon));
        }
        if !(self.g >= 0.0) {
            return invalid(format!("g must be non-negative, got {}", self.g));
        }
        if !(self.eta >= 0.0) {
            return invalid(format!("eta must be non-negative, got {}", self.eta));
        }
        self.neuron_params().validate()
    }

    /// The iaf_psc_alpha parameter set shared by both populations
    pub fn neuron_params(&self) -> IafPscAlphaParams {
        IafPscAlphaParams {
            c_m: self.c_m,
            tau_m: self.tau_m,
            tau_syn_ex: self.tau_syn,
            tau_syn_in: self.tau_syn,
            t_ref: self.t_ref,
            e_l: 0.0,
            v_reset: 0.0,
            v_th: self.theta,
            i_e: 0.0,
            v_min: None,
            v_init: Some(0.0),
        }
    }

    pub fn derived(&self) -> Result<DerivedParams> {
        self.validate()?;

        let n_e = 4 * self.order;
        let n_i = self.order;
        let c_e = (self.epsilon * n_e as f64) as usize;
        let c_i = (self.epsilon * n_i as f64) as usize;
        if c_e == 0 {
            return Err(NestError::InvalidParameter(format!(
                "epsilon {} gives no excitatory inputs for order {}",
                self.epsilon, self.order
            )));
        }

        let j_unit = compute_psp_norm(self.tau_m, self.c_m, self.tau_syn)?;
        let j_ex = self.j / j_unit;
        let j_in = -self.g * j_ex;

        let nu_th = (self.theta * self.c_m) / (j_ex * c_e as f64 * E * self.tau_m * self.tau_syn);
        let nu_ex = self.eta * nu_th;
        let p_rate = 1000.0 * nu_ex * c_e as f64;

        let n_rec = self.n_rec.unwrap_or(n_e);

        Ok(DerivedParams {
            n_e,
            n_i,
            c_e,
            c_i,
            j_unit,
            j_ex,
            j_in,
            nu_th,
            nu_ex,
            p_rate,
            n_rec_e: n_rec.min(n_e),
            n_rec_i: n_rec.min(n_i),
        })
    }

    /// Load parameters from a JSON file; missing fields keep their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let params: Self = serde_json::from_reader(file)?;
        Ok(params)
    }
}

/// Peak PSP (mV) evoked by an alpha PSC of unit amplitude (1 pA).
///
/// The PSP maximum lies at `t_max = (-W_{-1}(-exp(-1/a)/a) - 1/a) / b` with
/// `a = tau_m/tau_syn` and `b = 1/tau_syn - 1/tau_m`.
pub fn compute_psp_norm(tau_m: f64, c_m: f64, tau_syn: f64) -> Result<f64> {
    let a = tau_m / tau_syn;
    let b = 1.0 / tau_syn - 1.0 / tau_m;
    if b.abs() < 1e-12 {
        return Err(NestError::InvalidParameter(format!(
            "PSP normalization is singular for tau_m == tau_syn ({})",
            tau_m
        )));
    }

    let w = lambert_wm1(-(-1.0 / a).exp() / a);
    let t_max = 1.0 / b * (-w - 1.0 / a);
    let norm = E / (tau_syn * c_m * b)
        * (((-t_max / tau_m).exp() - (-t_max / tau_syn).exp()) / b - t_max * (-t_max / tau_syn).exp());

    if !norm.is_finite() || norm <= 0.0 || !(t_max > 0.0) {
        return Err(NestError::Core(brunel_core::CoreError::NumericalError(format!(
            "PSP normalization failed for tau_m = {}, tau_syn = {}",
            tau_m, tau_syn
        ))));
    }
    Ok(norm)
}

// ============================================================================
// NETWORK
// ============================================================================

/// A built, ready-to-simulate Brunel network
#[derive(Debug)]
pub struct BrunelNetwork {
    pub kernel: Kernel,
    pub params: BrunelParams,
    pub derived: DerivedParams,
    pub nodes_ex: NodeCollection,
    pub nodes_in: NodeCollection,
    pub noise: NodeId,
    pub espikes: NodeId,
    pub ispikes: NodeId,
    /// Wall-clock build time (s)
    pub build_time: f64,
}

impl BrunelNetwork {
    pub fn build(params: &BrunelParams) -> Result<Self> {
        let derived = params.derived()?;
        let started = Instant::now();

        let mut kernel = Kernel::new(KernelParams {
            resolution: params.dt,
            rng_seed: params.rng_seed,
            num_threads: params.num_threads,
            print_time: false,
        });

        log::info!(
            "Building network: {} excitatory, {} inhibitory neurons",
            derived.n_e,
            derived.n_i
        );
        let model = NodeModel::IafPscAlpha(params.neuron_params());
        let nodes_ex = kernel.create(model.clone(), derived.n_e)?;
        let nodes_in = kernel.create(model, derived.n_i)?;
        let noise = kernel.create(
            NodeModel::PoissonGenerator(PoissonGeneratorParams { rate: derived.p_rate }),
            1,
        )?;
        let espikes = kernel.create(NodeModel::SpikeRecorder, 1)?;
        let ispikes = kernel.create(NodeModel::SpikeRecorder, 1)?;

        let all = nodes_ex.join(&nodes_in);
        let excitatory = |rule| ConnectionSpec::static_synapse(rule, derived.j_ex, params.delay);
        let inhibitory = |rule| ConnectionSpec::static_synapse(rule, derived.j_in, params.delay);

        log::info!("Connecting devices (p_rate = {:.1} Hz)", derived.p_rate);
        kernel.connect(&noise, &all, &excitatory(ConnectivityRule::AllToAll))?;
        kernel.connect(&nodes_ex.head(derived.n_rec_e), &espikes, &ConnectionSpec::default())?;
        kernel.connect(&nodes_in.head(derived.n_rec_i), &ispikes, &ConnectionSpec::default())?;

        log::info!(
            "Connecting network: C_E = {}, C_I = {}, J_ex = {:.3} pA, J_in = {:.3} pA",
            derived.c_e,
            derived.c_i,
            derived.j_ex,
            derived.j_in
        );
        kernel.connect(
            &nodes_ex,
            &all,
            &excitatory(ConnectivityRule::FixedIndegree { indegree: derived.c_e }),
        )?;
        if derived.c_i > 0 {
            kernel.connect(
                &nodes_in,
                &all,
                &inhibitory(ConnectivityRule::FixedIndegree { indegree: derived.c_i }),
            )?;
        }

        let build_time = started.elapsed().as_secs_f64();
        log::info!(
            "Network built in {:.2} s: {} connections",
            build_time,
            kernel.num_connections()
        );

        Ok(Self {
            kernel,
            params: params.clone(),
            derived,
            nodes_ex,
            nodes_in,
            noise: noise.ids[0],
            espikes: espikes.ids[0],
            ispikes: ispikes.ids[0],
            build_time,
        })
    }

    pub fn simulate(&mut self, time: f64) -> Result<()> {
        self.kernel.simulate(time)
    }

    /// Collect the recorded activity; `sim_time` is the wall-clock time (s)
    /// spent simulating
    pub fn result(&self, sim_time: f64) -> Result<BrunelResult> {
        let exc = self.kernel.spike_data(self.espikes)?.clone();
        let inh = self.kernel.spike_data(self.ispikes)?.clone();
        let simulated = self.kernel.time();

        let rate = |data: &SpikeData, n_rec: usize| {
            if n_rec == 0 || simulated <= 0.0 {
                0.0
            } else {
                data.n_events() as f64 / simulated * 1000.0 / n_rec as f64
            }
        };

        Ok(BrunelResult {
            label: self.params.simulator_name.clone(),
            params: self.params.clone(),
            derived: self.derived.clone(),
            n_neurons: self.derived.n_e + self.derived.n_i,
            n_synapses: self.kernel.num_connections(),
            simulated_time: simulated,
            rate_ex: rate(&exc, self.derived.n_rec_e),
            rate_in: rate(&inh, self.derived.n_rec_i),
            summary_ex: summarize(&exc, self.derived.n_rec_e, simulated, None),
            summary_in: summarize(&inh, self.derived.n_rec_i, simulated, None),
            build_time: self.build_time,
            sim_time,
            exc,
            inh,
        })
    }
}

// ============================================================================
// RESULTS
// ============================================================================

/// Outcome of one Brunel network run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrunelResult {
    pub label: String,
    pub params: BrunelParams,
    pub derived: DerivedParams,
    pub n_neurons: usize,
    pub n_synapses: usize,
    /// Biological time covered (ms)
    pub simulated_time: f64,
    pub rate_ex: f64, // Hz
    pub rate_in: f64, // Hz
    pub summary_ex: ActivitySummary,
    pub summary_in: ActivitySummary,
    pub build_time: f64, // s
    pub sim_time: f64,   // s
    #[serde(skip)]
    pub exc: SpikeData,
    #[serde(skip)]
    pub inh: SpikeData,
}

impl BrunelResult {
    /// Every recorded spike of both populations, sorted by time
    pub fn all_spikes(&self) -> Vec<SpikeEvent> {
        let mut events = self.exc.events();
        events.extend(self.inh.events());
        events.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        events
    }

    /// Write `<label>.exc.spikes`, `<label>.inh.spikes` and
    /// `<label>.summary.json` into `dir`
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let exc_path = dir.join(format!("{}.exc.spikes", self.label));
        let inh_path = dir.join(format!("{}.inh.spikes", self.label));
        let summary_path = dir.join(format!("{}.summary.json", self.label));

        write_spikes(&exc_path, &self.exc.events())?;
        write_spikes(&inh_path, &self.inh.events())?;
        let out = BufWriter::new(File::create(&summary_path)?);
        serde_json::to_writer_pretty(out, self)?;

        log::info!("Saved spikes and summary to {}", dir.display());
        Ok(vec![exc_path, inh_path, summary_path])
    }
}

/// Build the network, simulate `params.simtime` and return the recorded spikes
pub fn run_brunel_network(params: &BrunelParams) -> Result<BrunelResult> {
    let mut network = BrunelNetwork::build(params)?;

    log::info!("Simulating {} ms", params.simtime);
    let started = Instant::now();
    network.simulate(params.simtime)?;
    let sim_time = started.elapsed().as_secs_f64();

    let result = network.result(sim_time)?;
    log::info!(
        "Excitatory rate: {:.2} Hz, inhibitory rate: {:.2} Hz",
        result.rate_ex,
        result.rate_in
    );
    Ok(result)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use brunel_core::read_spikes;
    use std::io::Write;

    fn small(order: usize, simtime: f64) -> BrunelParams {
        BrunelParams {
            order,
            simtime,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_parameters_match_driver() {
        let p = BrunelParams::default();
        assert_eq!(p.g, 5.0);
        assert_eq!(p.eta, 2.0);
        assert_eq!(p.simtime, 1000.0);
        assert_eq!(p.dt, 0.1);
        assert_eq!(p.order, 2500);
        assert_eq!(p.simulator_name, "NEST");
        assert!(p.jnml_simulator.is_none());
    }

    #[test]
    fn test_derived_quantities() {
        let d = BrunelParams::default().derived().unwrap();
        assert_eq!((d.n_e, d.n_i), (10_000, 2_500));
        assert_eq!((d.c_e, d.c_i), (1_000, 250));
        assert!((d.j_ex - 20.680).abs() < 1e-3);
        assert!((d.j_in + 5.0 * d.j_ex).abs() < 1e-12);
        assert!((d.p_rate - 17_789.0).abs() < 0.1);
        // N_rec = NE records everybody
        assert_eq!((d.n_rec_e, d.n_rec_i), (10_000, 2_500));
    }

    #[test]
    fn test_psp_norm_gives_requested_amplitude() {
        let p = BrunelParams::default();
        let d = p.derived().unwrap();

        let mut kernel = Kernel::new(KernelParams { resolution: 0.01, ..Default::default() });
        let src = kernel
            .create(
                NodeModel::IafPscAlpha(IafPscAlphaParams { i_e: 1e7, ..p.neuron_params() }),
                1,
            )
            .unwrap();
        let tgt = kernel.create(NodeModel::IafPscAlpha(p.neuron_params()), 1).unwrap();
        kernel
            .connect(&src, &tgt, &ConnectionSpec::static_synapse(ConnectivityRule::AllToAll, d.j_ex, 0.01))
            .unwrap();

        // Source fires once in the first step, then goes quiet
        kernel.simulate(0.01).unwrap();
        let mut off = std::collections::HashMap::new();
        off.insert("I_e".to_string(), 0.0);
        kernel.set_status(&src, &off).unwrap();

        let mut peak: f64 = 0.0;
        for _ in 0..600 {
            kernel.simulate(0.01).unwrap();
            let v = kernel.get_status(&tgt).unwrap()[0]["V_m"];
            peak = peak.max(v);
        }
        assert!((peak - p.j).abs() / p.j < 0.01, "peak PSP {} mV", peak);
    }

    #[test]
    fn test_psp_norm_rejects_equal_time_constants() {
        assert!(compute_psp_norm(10.0, 250.0, 10.0).is_err());
    }

    #[test]
    fn test_validation() {
        assert!(BrunelParams { order: 0, ..Default::default() }.validate().is_err());
        assert!(BrunelParams { dt: 0.0, ..Default::default() }.validate().is_err());
        assert!(BrunelParams { simtime: -1.0, ..Default::default() }.validate().is_err());
        // Rounds to zero steps: rejected up front instead of at simulate time
        let too_short = small(10, 0.04);
        assert!(matches!(too_short.validate(), Err(NestError::InvalidParameter(_))));
        assert!(run_brunel_network(&too_short).is_err());
        assert!(BrunelParams { simtime: 0.06, ..Default::default() }.validate().is_ok());
        assert!(BrunelParams { delay: 0.05, ..Default::default() }.validate().is_err());
        assert!(BrunelParams { epsilon: 0.0, ..Default::default() }.validate().is_err());
        assert!(BrunelParams { g: -1.0, ..Default::default() }.validate().is_err());
        assert!(BrunelParams { eta: f64::NAN, ..Default::default() }.validate().is_err());
        assert!(BrunelParams::default().validate().is_ok());
    }

    #[test]
    fn test_build_counts() {
        let params = BrunelParams { n_rec: Some(10), ..small(20, 10.0) };
        let net = BrunelNetwork::build(&params).unwrap();
        let d = &net.derived;
        assert_eq!(net.nodes_ex.len(), 80);
        assert_eq!(net.nodes_in.len(), 20);
        assert_eq!(net.kernel.num_nodes(), 103);
        // generator drive + recorder registrations + recurrent synapses
        let expected = 100 + 10 + 10 + 100 * (d.c_e + d.c_i);
        assert_eq!(net.kernel.num_connections(), expected);
    }

    #[test]
    fn test_run_records_activity() {
        let result = run_brunel_network(&small(20, 200.0)).unwrap();

        assert_eq!(result.n_neurons, 100);
        assert!(result.exc.n_events() > 0);
        assert!(result.inh.n_events() > 0);
        assert!((result.simulated_time - 200.0).abs() < 1e-9);

        let expected = result.exc.n_events() as f64 / 200.0 * 1000.0 / 80.0;
        assert!((result.rate_ex - expected).abs() < 1e-9);

        // Only recorded neurons appear, all spike times inside the run
        assert!(result.exc.senders.iter().all(|&s| (1..=80).contains(&s)));
        assert!(result.inh.senders.iter().all(|&s| (81..=100).contains(&s)));
        assert!(result.all_spikes().iter().all(|&(_, t)| t > 0.0 && t <= 200.0 + 1e-9));
        assert_eq!(result.all_spikes().len(), result.exc.n_events() + result.inh.n_events());
    }

    #[test]
    fn test_run_is_reproducible() {
        let a = run_brunel_network(&small(10, 100.0)).unwrap();
        let b = run_brunel_network(&BrunelParams { num_threads: 2, ..small(10, 100.0) }).unwrap();
        assert_eq!(a.exc, b.exc);
        assert_eq!(a.inh, b.inh);

        let c = run_brunel_network(&BrunelParams { rng_seed: 1, ..small(10, 100.0) }).unwrap();
        assert_ne!(a.exc, c.exc);
    }

    #[test]
    fn test_no_drive_stays_silent() {
        let result = run_brunel_network(&BrunelParams { eta: 0.0, ..small(10, 50.0) }).unwrap();
        assert_eq!(result.exc.n_events(), 0);
        assert_eq!(result.rate_ex, 0.0);
    }

    #[test]
    fn test_save_writes_spike_files() {
        let dir = tempfile::tempdir().unwrap();
        let params = BrunelParams { simulator_name: "test".into(), ..small(10, 50.0) };
        let result = run_brunel_network(&params).unwrap();
        let paths = result.save(dir.path()).unwrap();

        assert_eq!(paths.len(), 3);
        assert!(paths[0].ends_with("test.exc.spikes"));
        let events = read_spikes(&paths[0]).unwrap();
        assert_eq!(events.len(), result.exc.n_events());

        let summary: serde_json::Value =
            serde_json::from_reader(File::open(&paths[2]).unwrap()).unwrap();
        assert_eq!(summary["label"], "test");
        assert_eq!(summary["n_neurons"], 50);
    }

    #[test]
    fn test_params_from_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{ "g": 4.5, "order": 100, "n_rec": 50 }}"#).unwrap();

        let params = BrunelParams::from_json_file(file.path()).unwrap();
        assert_eq!(params.g, 4.5);
        assert_eq!(params.order, 100);
        assert_eq!(params.n_rec, Some(50));
        assert_eq!(params.eta, 2.0);
        assert_eq!(params.delay, 1.5);
    }

    #[test]
    fn test_params_accept_driver_key_names() {
        let params: BrunelParams = serde_json::from_str(r#"{ "N_rec": 100, "order": 50 }"#).unwrap();
        assert_eq!(params.n_rec, Some(100));
        assert_eq!(params.derived().unwrap().n_rec_i, 50);
    }
}
