//! Top-level coordinator owning every registration and watch.

mod registry;

pub use registry::*;
