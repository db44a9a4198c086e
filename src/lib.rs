//! Rkstream - GPU resource streaming cache

pub mod core;
pub mod streaming;
