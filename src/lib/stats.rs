//! Per-node statistics and periodic sampling.
//!
//! Every pipeline node reports a small map of named numeric counters via
//! `sample_stats()`. The [`StatsSampler`] polls the whole pipeline at a fixed
//! interval and logs throughput at debug level; the final sample is what the
//! command prints in its summary.

use crossbeam_channel::{bounded, Sender};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::node::PipelineNode;

/// A flat mapping of counter names to values, sampled from one node.
///
/// `BTreeMap` keeps summary output deterministically ordered.
pub type NamedStats = BTreeMap<String, f64>;

/// Merge `stats` into `into`, prefixing every key with the node name.
pub fn merge_prefixed(into: &mut NamedStats, node_name: &str, stats: &NamedStats) {
    for (key, value) in stats {
        into.insert(format!("{node_name}.{key}"), *value);
    }
}

/// Background thread that samples pipeline statistics at a fixed period.
pub struct StatsSampler {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<NamedStats>>,
}

impl StatsSampler {
    /// Spawn a sampler over `nodes`, polling every `period`.
    #[must_use]
    pub fn start(nodes: Vec<Arc<dyn PipelineNode>>, period: Duration) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("stats_sampler".into())
            .spawn(move || {
                loop {
                    let stopped = stop_rx.recv_timeout(period).is_ok();
                    let mut sample = NamedStats::new();
                    for node in &nodes {
                        merge_prefixed(&mut sample, node.name(), &node.sample_stats());
                    }
                    if stopped {
                        return sample;
                    }
                    for (key, value) in &sample {
                        log::debug!("stats: {key} = {value}");
                    }
                }
            })
            .expect("failed to spawn stats sampler thread");
        Self { stop_tx, handle: Some(handle) }
    }

    /// Stop sampling and return the final snapshot.
    pub fn stop(mut self) -> NamedStats {
        let _ = self.stop_tx.send(());
        self.handle.take().map(|h| h.join().unwrap_or_default()).unwrap_or_default()
    }
}

impl Drop for StatsSampler {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
