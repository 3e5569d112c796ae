//! # Brunel CLI
//!
//! Build and run the Brunel (2000) balanced network, inspect its derived
//! parameters, and analyze saved spike files.

use anyhow::{bail, Context};
use brunel_core::{ms_to_steps, read_spikes};
use brunel_nest::analysis::{population_rate, summarize};
use brunel_nest::brunel::{BrunelNetwork, BrunelParams, BrunelResult};
use brunel_nest::SpikeData;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "brunel")]
#[command(author = "Yatrogenesis")]
#[command(version = "0.1.0")]
#[command(about = "Brunel (2000) sparsely connected E/I network", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and simulate the network
    Run {
        #[command(flatten)]
        params: ParamArgs,

        /// Directory for spike files and the JSON summary
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the derived network quantities
    Params {
        #[command(flatten)]
        params: ParamArgs,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Spike statistics for a saved spike file
    Analyze {
        /// Spike file (sender<TAB>time per line)
        spikes: PathBuf,
        /// Number of recorded neurons
        #[arg(long)]
        n_neurons: usize,
        /// Recording duration (ms)
        #[arg(long)]
        duration: f64,
        /// Bin size for rate and synchrony (ms)
        #[arg(long, default_value_t = 5.0)]
        bin: f64,
    },
}

/// Network parameters; flags override the config file, which overrides
/// the defaults
#[derive(Args)]
struct ParamArgs {
    /// JSON parameter file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Relative inhibitory strength
    #[arg(long)]
    g: Option<f64>,
    /// External rate relative to threshold rate
    #[arg(long)]
    eta: Option<f64>,
    /// Simulation time (ms)
    #[arg(long)]
    simtime: Option<f64>,
    /// Resolution (ms)
    #[arg(long)]
    dt: Option<f64>,
    /// Network scale: 4*order excitatory, order inhibitory neurons
    #[arg(long)]
    order: Option<usize>,
    /// Neurons recorded per population
    #[arg(long)]
    n_rec: Option<usize>,
    /// Run label and output file prefix
    #[arg(long)]
    simulator_name: Option<String>,
    /// NeuroML simulator (accepted, unused)
    #[arg(long)]
    jnml_simulator: Option<String>,
    /// RNG seed
    #[arg(long)]
    seed: Option<u64>,
    /// Worker threads (0 = all cores)
    #[arg(long)]
    threads: Option<usize>,
}

impl ParamArgs {
    fn resolve(self) -> anyhow::Result<BrunelParams> {
        let mut params = match &self.config {
            Some(path) => BrunelParams::from_json_file(path)
                .with_context(|| format!("reading config {}", path.display()))?,
            None => BrunelParams::default(),
        };

        if let Some(g) = self.g {
            params.g = g;
        }
        if let Some(eta) = self.eta {
            params.eta = eta;
        }
        if let Some(simtime) = self.simtime {
            params.simtime = simtime;
        }
        if let Some(dt) = self.dt {
            params.dt = dt;
        }
        if let Some(order) = self.order {
            params.order = order;
        }
        if self.n_rec.is_some() {
            params.n_rec = self.n_rec;
        }
        if let Some(name) = self.simulator_name {
            params.simulator_name = name;
        }
        if self.jnml_simulator.is_some() {
            params.jnml_simulator = self.jnml_simulator;
        }
        if let Some(seed) = self.seed {
            params.rng_seed = seed;
        }
        if let Some(threads) = self.threads {
            params.num_threads = threads;
        }

        params.validate().context("invalid network parameters")?;
        Ok(params)
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { params, output } => {
            let params = params.resolve()?;
            let result = run(&params)?;
            print_summary(&result);

            if let Some(dir) = output {
                let paths = result
                    .save(&dir)
                    .with_context(|| format!("writing results to {}", dir.display()))?;
                for path in paths {
                    println!("  {} {}", "wrote".green(), path.display());
                }
            }
        }

        Commands::Params { params, json } => {
            let params = params.resolve()?;
            let derived = params.derived().context("deriving network quantities")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&derived)?);
            } else {
                println!("{}", "Brunel network parameters".green().bold());
                println!("  g = {}, eta = {}, order = {}", params.g, params.eta, params.order);
                println!("  NE = {}, NI = {}", derived.n_e, derived.n_i);
                println!("  CE = {}, CI = {}", derived.c_e, derived.c_i);
                println!("  J_ex  = {:.4} pA", derived.j_ex);
                println!("  J_in  = {:.4} pA", derived.j_in);
                println!("  nu_th = {:.6} 1/ms", derived.nu_th);
                println!("  nu_ex = {:.6} 1/ms", derived.nu_ex);
                println!("  p_rate = {:.2} Hz", derived.p_rate);
            }
        }

        Commands::Analyze { spikes, n_neurons, duration, bin } => {
            if n_neurons == 0 || !(duration > 0.0) || !(bin > 0.0) {
                bail!("n_neurons, duration and bin must be positive");
            }
            let events = read_spikes(&spikes).with_context(|| format!("reading {}", spikes.display()))?;
            let data = SpikeData::from_events(&events);
            let summary = summarize(&data, n_neurons, duration, Some(bin));
            let rate = population_rate(&data, n_neurons, bin, duration);
            let peak = rate.values.iter().copied().fold(0.0, f64::max);

            println!("{} {}", "Spike file:".green().bold(), spikes.display());
            println!("  Events          : {}", summary.n_events);
            println!("  Senders         : {}", data.spike_trains().len());
            if let Some(t) = data.t_last() {
                println!("  Last spike      : {:.3} ms", t);
            }
            println!("  Mean rate       : {:.2} Hz", summary.rate);
            println!("  Peak bin rate   : {:.2} Hz", peak);
            println!("  Mean CV(ISI)    : {:.3}", summary.cv_isi);
            println!("  Fano factor     : {:.3}", summary.synchrony);
        }
    }

    Ok(())
}

/// Build the network and simulate it in chunks behind a progress bar
fn run(params: &BrunelParams) -> anyhow::Result<BrunelResult> {
    if let Some(sim) = &params.jnml_simulator {
        log::warn!("NeuroML export is not supported, ignoring jnml_simulator = {}", sim);
    }

    println!("{}", "Building network".green().bold());
    let mut network = BrunelNetwork::build(params).context("building network")?;

    let total_steps = ms_to_steps(params.simtime, params.dt)?;
    let chunk = (total_steps / 100).max(1);
    let bar = ProgressBar::new(total_steps);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] [{bar:40}] {pos}/{len} steps")?
            .progress_chars("#>-"),
    );

    let started = Instant::now();
    let mut done = 0;
    while done < total_steps {
        let steps = chunk.min(total_steps - done);
        network
            .simulate(steps as f64 * params.dt)
            .with_context(|| format!("simulating at t = {:.1} ms", network.kernel.time()))?;
        done += steps;
        bar.set_position(done);
    }
    bar.finish_and_clear();
    let sim_time = started.elapsed().as_secs_f64();

    Ok(network.result(sim_time)?)
}

fn print_summary(result: &BrunelResult) {
    println!("{}", "Brunel network simulation".green().bold());
    println!("  Label             : {}", result.label.cyan());
    println!("  Number of neurons : {}", result.n_neurons);
    println!("  Number of synapses: {}", result.n_synapses);
    println!("  Excitatory rate   : {:.2} Hz", result.rate_ex);
    println!("  Inhibitory rate   : {:.2} Hz", result.rate_in);
    println!("  CV(ISI) exc/inh   : {:.3} / {:.3}", result.summary_ex.cv_isi, result.summary_in.cv_isi);
    println!("  Building time     : {:.2} s", result.build_time);
    println!("  Simulation time   : {:.2} s", result.sim_time);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn resolve(args: &[&str]) -> anyhow::Result<BrunelParams> {
        let cli = Cli::try_parse_from(args)?;
        match cli.command {
            Commands::Run { params, .. } | Commands::Params { params, .. } => params.resolve(),
            Commands::Analyze { .. } => bail!("analyze takes no network parameters"),
        }
    }

    #[test]
    fn test_flags_override_config_over_defaults() {
        let mut config = tempfile::NamedTempFile::new().unwrap();
        writeln!(config, r#"{{ "g": 5.5, "eta": 3.0, "order": 40 }}"#).unwrap();
        let path = config.path().to_str().unwrap();

        let params = resolve(&["brunel", "params", "--config", path, "--g", "4"]).unwrap();
        assert_eq!(params.g, 4.0);
        assert_eq!(params.eta, 3.0);
        assert_eq!(params.order, 40);
        assert_eq!(params.simtime, 1000.0);
        assert_eq!(params.simulator_name, "NEST");
    }

    #[test]
    fn test_defaults_without_config() {
        let params = resolve(&["brunel", "run", "--order", "10", "--n-rec", "5", "--seed", "7"]).unwrap();
        assert_eq!(params.order, 10);
        assert_eq!(params.n_rec, Some(5));
        assert_eq!(params.rng_seed, 7);
        assert_eq!(params.g, BrunelParams::default().g);
    }

    #[test]
    fn test_rejects_invalid_parameters() {
        assert!(resolve(&["brunel", "run", "--order", "10", "--simtime", "0.04"]).is_err());
        assert!(resolve(&["brunel", "run", "--order", "0"]).is_err());
        assert!(resolve(&["brunel", "params", "--config", "/nonexistent/brunel.json"]).is_err());
    }
}
