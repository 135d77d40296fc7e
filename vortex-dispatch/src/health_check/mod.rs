//! Active origin health checking.

pub mod prober;

pub use prober::{probe_origins, spawn_health_checker};
