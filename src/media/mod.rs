//! Receive-side media handling

pub mod jitter;
pub mod reassembly;

pub use jitter::{create_shared_jitter, AudioBlock, JitterBuffer, SharedJitterBuffer};
pub use reassembly::{FrameReassembler, ReassembledFrame};
