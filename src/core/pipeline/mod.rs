//! Transfer pipeline building blocks: chunk math and reassembly,
//! throughput estimation, progress tracking.

pub mod chunk;
pub mod progress;
pub mod throughput;
