//! Umbrella crate re-exporting the proxy engine, its config schema, and the
//! CLI entry point under a single name for downstream embedders that want
//! the whole stack without depending on each workspace member directly.

pub use sniproxy_config as config;
pub use sniproxy_core as core;

pub use sniproxy_bin::{resolve_metrics_addr, run};
