//! Declarative models handed over by the configuration loader.

pub mod backend;
pub mod origin;
pub mod rewrite;
