//! Chaos suite entry point.
//!
//! Runs simulated meshes through partitions, frame loss, latency and
//! skewed clocks and checks that they recover.

mod common;

mod chaos;
