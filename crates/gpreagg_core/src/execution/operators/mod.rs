//! Implementations of device accelerated operators.

pub mod gpu_preagg;
