//! The node and pipeline framework.
//!
//! A pipeline is a static DAG of nodes. Each node owns a bounded inbound
//! [`WorkQueue`](crate::work_queue::WorkQueue) of [`Message`]s and a worker
//! pool that drains it; results are pushed to the node's sink (the next node
//! downstream). Nodes are built leaves-first so every constructor can hold an
//! [`Arc`] of its sink.
//!
//! Lifecycle: `terminate` closes the inbound queue and joins the workers;
//! in-flight messages always complete. `restart` re-opens the queue and
//! respawns workers; it is only legal after a full terminate. The
//! [`Pipeline`] terminates nodes source-first so upstream nodes can still
//! drain into downstream queues, leaving the leaves for last.

use std::sync::Arc;

use crate::errors::Result;
use crate::messages::Message;
use crate::stats::{merge_prefixed, NamedStats};

/// Options carried through a pipeline shutdown.
#[derive(Debug, Clone, Copy)]
pub struct FlushOptions {
    /// When true, `terminate` returns only after every downstream sink has
    /// drained and flushed.
    pub wait_for_idle: bool,
}

impl Default for FlushOptions {
    fn default() -> Self {
        Self { wait_for_idle: true }
    }
}

/// A handle to a node usable as another node's sink.
pub type NodeHandle = Arc<dyn PipelineNode>;

/// Behaviour common to every pipeline stage.
pub trait PipelineNode: Send + Sync {
    /// Stable display name used for stats prefixes and logs.
    fn name(&self) -> &'static str;

    /// Enqueue a message on the node's inbound queue, blocking when full.
    ///
    /// # Errors
    ///
    /// Returns [`SquallError::QueueTerminated`](crate::errors::SquallError)
    /// when the node has been terminated.
    fn push_message(&self, msg: Message) -> Result<()>;

    /// Snapshot this node's counters.
    fn sample_stats(&self) -> NamedStats;

    /// Terminate the inbound queue and join the worker pool. Idempotent.
    fn terminate(&self, flush: &FlushOptions);

    /// Re-open the inbound queue and respawn workers after a terminate.
    fn restart(&self);
}

/// Forward a message to a sink, swallowing the terminated-queue error.
///
/// During shutdown a downstream queue may already be closed; the message is
/// dropped silently, matching the drain-then-stop contract.
pub fn send_to_sink(sink: &NodeHandle, msg: Message) {
    let _ = sink.push_message(msg);
}

/// Builder collecting nodes in leaves-first order.
#[derive(Default)]
pub struct PipelineDescriptor {
    nodes: Vec<NodeHandle>,
}

impl PipelineDescriptor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Nodes must be added leaves-first so that the order
    /// doubles as a (reverse) topological order; the last node added is the
    /// pipeline source.
    pub fn add_node(&mut self, node: NodeHandle) -> NodeHandle {
        self.nodes.push(Arc::clone(&node));
        node
    }

    /// Number of registered nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether any node has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// A fully constructed pipeline.
pub struct Pipeline {
    /// Nodes in leaves-first order; the last entry is the source.
    nodes: Vec<NodeHandle>,
}

impl Pipeline {
    /// Finalize a descriptor into a runnable pipeline.
    ///
    /// # Panics
    ///
    /// Panics if the descriptor holds no nodes.
    #[must_use]
    pub fn create(desc: PipelineDescriptor) -> Self {
        assert!(!desc.is_empty(), "a pipeline needs at least one node");
        Self { nodes: desc.nodes }
    }

    /// Push a message into the pipeline source.
    pub fn push_message(&self, msg: Message) -> Result<()> {
        self.nodes.last().expect("pipeline has nodes").push_message(msg)
    }

    /// Terminate all nodes, source-first, joining each worker pool in turn.
    ///
    /// By the time a node is terminated every upstream producer has already
    /// drained, so no message is lost.
    pub fn terminate(&self, flush: &FlushOptions) {
        for node in self.nodes.iter().rev() {
            node.terminate(flush);
        }
    }

    /// Restart all nodes, leaves-first, so every sink is accepting messages
    /// before its producers come back.
    pub fn restart(&self) {
        for node in &self.nodes {
            node.restart();
        }
    }

    /// Sample statistics from every node, keys prefixed with node names.
    #[must_use]
    pub fn sample_stats(&self) -> NamedStats {
        let mut all = NamedStats::new();
        for node in &self.nodes {
            merge_prefixed(&mut all, node.name(), &node.sample_stats());
        }
        all
    }

    /// Handles to the registered nodes, leaves-first.
    #[must_use]
    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }
}
