//! Spike recording.

use crate::{NodeCollection, NodeId};
use brunel_core::SpikeEvent;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Recorded spike events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpikeData {
    pub times: Vec<f64>,
    pub senders: Vec<NodeId>,
}

impl SpikeData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, time: f64, sender: NodeId) {
        self.times.push(time);
        self.senders.push(sender);
    }

    pub fn n_events(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Get spike trains organized by sender, each in time order
    pub fn spike_trains(&self) -> BTreeMap<NodeId, Vec<f64>> {
        let mut trains: BTreeMap<NodeId, Vec<f64>> = BTreeMap::new();
        for (&time, &sender) in self.times.iter().zip(self.senders.iter()) {
            trains.entry(sender).or_default().push(time);
        }
        for train in trains.values_mut() {
            train.sort_by(f64::total_cmp);
        }
        trains
    }

    /// Events as (sender, time), sorted by time then sender
    pub fn events(&self) -> Vec<SpikeEvent> {
        let mut events: Vec<SpikeEvent> = self
            .senders
            .iter()
            .copied()
            .zip(self.times.iter().copied())
            .collect();
        events.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        events
    }

    /// Only the events sent by members of `nodes`
    pub fn senders_in(&self, nodes: &NodeCollection) -> SpikeData {
        let keep: HashSet<NodeId> = nodes.iter().copied().collect();
        let mut out = SpikeData::new();
        for (&time, &sender) in self.times.iter().zip(self.senders.iter()) {
            if keep.contains(&sender) {
                out.record(time, sender);
            }
        }
        out
    }

    /// Build from (sender, time) events, e.g. a spike file
    pub fn from_events(events: &[SpikeEvent]) -> Self {
        let mut data = SpikeData::new();
        for &(sender, time) in events {
            data.record(time, sender);
        }
        data
    }

    /// Latest spike time, if any
    pub fn t_last(&self) -> Option<f64> {
        self.times.iter().copied().reduce(f64::max)
    }
}

/// `spike_recorder` device: collects spikes of the neurons connected to it
#[derive(Debug, Clone, Default)]
pub struct SpikeRecorder {
    pub data: SpikeData,
}
