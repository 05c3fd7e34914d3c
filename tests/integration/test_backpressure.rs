//! Back-pressure: a slow terminal sink throttles the whole pipeline and
//! in-flight messages stay bounded by the queue capacities.

use std::sync::Arc;
use std::time::Duration;

use crate::helpers::{cpu_runner, raw_read, CaptureSink};
use squall_lib::basecaller::BasecallerNode;
use squall_lib::node::{FlushOptions, Pipeline, PipelineDescriptor, PipelineNode};
use squall_lib::scaler::ScalerNode;

#[test]
fn test_slow_sink_throttles_without_loss() {
    const SINK_CAPACITY: usize = 8;
    const NODE_CAPACITY: usize = 8;
    const TOTAL_READS: usize = 300;

    let sink = CaptureSink::slow(SINK_CAPACITY, Duration::from_millis(1));
    let mut desc = PipelineDescriptor::new();
    desc.add_node(sink.clone());
    let basecaller = desc.add_node(Arc::new(
        BasecallerNode::new(
            sink.clone(),
            vec![cpu_runner(5, 500, 8)],
            100,
            Duration::from_millis(10),
            NODE_CAPACITY,
        )
        .unwrap(),
    ));
    let scaler: Arc<ScalerNode> = Arc::new(ScalerNode::new(basecaller, 2, 0, NODE_CAPACITY));
    desc.add_node(scaler.clone());
    let pipeline = Pipeline::create(desc);

    // Sample queue depths from a side thread while the producer pushes.
    let sampler_sink = Arc::clone(&sink);
    let sampler_scaler = Arc::clone(&scaler);
    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
    let sampler = std::thread::spawn(move || {
        let mut max_depth = 0usize;
        while stop_rx.try_recv().is_err() {
            let scaler_depth =
                sampler_scaler.sample_stats().get("work_queue_depth").copied().unwrap_or(0.0)
                    as usize;
            max_depth = max_depth.max(scaler_depth + sampler_sink.queue_len());
            std::thread::sleep(Duration::from_millis(1));
        }
        max_depth
    });

    for i in 0..TOTAL_READS {
        pipeline.push_message(raw_read(&format!("r{i}"), 500)).unwrap();
    }
    pipeline.terminate(&FlushOptions::default());
    let _ = stop_tx.send(());
    let max_depth = sampler.join().unwrap();

    // No read was dropped under sustained back-pressure.
    assert_eq!(sink.messages.lock().len(), TOTAL_READS);
    // Observed in-flight messages never exceeded the queue bounds.
    assert!(
        max_depth <= SINK_CAPACITY + NODE_CAPACITY,
        "observed {max_depth} queued messages across bounded queues"
    );

    let stats = pipeline.sample_stats();
    assert_eq!(stats["basecaller.num_reads_out"], TOTAL_READS as f64);
}
