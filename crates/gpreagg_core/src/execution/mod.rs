//! Execution of pre-aggregation on a device.
pub mod operators;
