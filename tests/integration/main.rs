//! Integration tests for the squall pipeline.
//!
//! These tests drive real pipelines end-to-end: reads enter through the
//! scaler, flow through inference and downstream nodes, and land in a
//! capture sink or an in-memory writer.

mod helpers;
mod test_aligner_pipeline;
mod test_backpressure;
mod test_barcode_pipeline;
mod test_basecall_pipeline;
mod test_filter_and_writer;
mod test_modbase_pipeline;
mod test_restart;
