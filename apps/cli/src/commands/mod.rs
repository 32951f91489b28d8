//! Command implementations for the Ensemble CLI.

pub mod agents;
pub mod kinds;
pub mod plan;
pub mod render;
pub mod send;
