//! Runs control-plane simulations built on `netplane-core` from the command
//! line.

pub mod cli;

mod simulation;
pub use simulation::{DeviceSummary, Simulation};

pub mod simulations;
