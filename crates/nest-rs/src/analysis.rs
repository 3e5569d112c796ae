//! Spike-train statistics used to classify Brunel network states.
//!
//! Asynchronous irregular activity shows up as a low population rate, CV
//! of the inter-spike intervals near 1, and a population Fano factor near
//! 1; synchronous regimes push the Fano factor well above 1.

use crate::SpikeData;
use brunel_core::TimeSeries;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Calculate mean firing rate (Hz) from spike data
pub fn mean_firing_rate(data: &SpikeData, n_neurons: usize, duration: f64) -> f64 {
    if n_neurons == 0 || duration <= 0.0 {
        return 0.0;
    }
    (data.n_events() as f64) / (n_neurons as f64) / (duration / 1000.0)
}

/// Calculate coefficient of variation of ISI
pub fn cv_isi(spike_train: &[f64]) -> f64 {
    // Needs at least two intervals
    if spike_train.len() < 3 {
        return 0.0;
    }

    let isis: Vec<f64> = spike_train.windows(2).map(|w| w[1] - w[0]).collect();

    let mean = isis.iter().sum::<f64>() / isis.len() as f64;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance = isis.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / isis.len() as f64;

    variance.sqrt() / mean
}

/// Mean ISI CV over all senders with at least two intervals
pub fn mean_cv(data: &SpikeData) -> f64 {
    let cvs: Vec<f64> = data
        .spike_trains()
        .values()
        .filter(|train| train.len() >= 3)
        .map(|train| cv_isi(train))
        .collect();
    if cvs.is_empty() {
        return 0.0;
    }
    cvs.iter().sum::<f64>() / cvs.len() as f64
}

/// Spike counts in bins of `bin_size` over `(0, max_time]`
pub fn spike_histogram(times: &[f64], bin_size: f64, max_time: f64) -> Array1<f64> {
    if bin_size <= 0.0 || max_time <= 0.0 {
        return Array1::zeros(0);
    }
    let n_bins = (max_time / bin_size).ceil() as usize;
    let mut hist: Array1<f64> = Array1::zeros(n_bins);

    for &t in times {
        if t < 0.0 || t > max_time {
            continue;
        }
        // A spike stamped exactly at max_time belongs to the last bin
        let bin = ((t / bin_size).floor() as usize).min(n_bins - 1);
        hist[bin] += 1.0;
    }
    hist
}

/// Population rate (Hz per neuron), one value per bin, stamped at bin start
pub fn population_rate(data: &SpikeData, n_neurons: usize, bin_size: f64, t_stop: f64) -> TimeSeries {
    let mut series = TimeSeries::new("population_rate").with_units("Hz");
    if n_neurons == 0 {
        return series;
    }
    let hist = spike_histogram(&data.times, bin_size, t_stop);
    let scale = 1000.0 / (bin_size * n_neurons as f64);
    for (k, &count) in hist.iter().enumerate() {
        series.push(k as f64 * bin_size, count * scale);
    }
    series
}

/// Population synchrony: Fano factor of the binned population spike count
pub fn synchrony(data: &SpikeData, bin_size: f64, t_stop: f64) -> f64 {
    let hist = spike_histogram(&data.times, bin_size, t_stop);
    if hist.len() < 2 {
        return 0.0;
    }
    let mean = hist.mean().unwrap_or(0.0);
    if mean <= 0.0 {
        return 0.0;
    }
    hist.var(0.0) / mean
}

/// Calculate correlation coefficient between spike trains
pub fn spike_correlation(train1: &[f64], train2: &[f64], bin_size: f64, max_time: f64) -> Array1<f64> {
    let hist1 = spike_histogram(train1, bin_size, max_time);
    let hist2 = spike_histogram(train2, bin_size, max_time);

    // Cross-correlation at zero lag, per bin
    hist1 * hist2
}

/// Summary statistics of one recorded population
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub n_events: usize,
    pub n_neurons: usize,
    pub rate: f64,
    pub cv_isi: f64,
    pub synchrony: f64,
}

/// Rate, mean CV and synchrony (5 ms bins unless `bin_size` is given)
pub fn summarize(data: &SpikeData, n_neurons: usize, duration: f64, bin_size: Option<f64>) -> ActivitySummary {
    ActivitySummary {
        n_events: data.n_events(),
        n_neurons,
        rate: mean_firing_rate(data, n_neurons, duration),
        cv_isi: mean_cv(data),
        synchrony: synchrony(data, bin_size.unwrap_or(5.0), duration),
    }
}
