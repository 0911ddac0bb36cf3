pub mod arrays;
pub mod config;
pub mod device;
pub mod execution;
