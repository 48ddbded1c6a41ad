//! Core library for the SMD pick-and-place machine.
//!
//! This library contains the hardware orchestration and plan-execution engine:
//! the device channels, the GRBL motion and test-station adapters, the
//! action translator, vision verification, the plan executor, and the shared
//! state store read by the monitoring interface.
//!
//! Components are built leaf-first and injected into the executor; see
//! [`machine::Machine`] for the composition root.

pub mod actions;
pub mod adapters;
pub mod config;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod machine;
pub mod observable;
pub mod plan;
pub mod state;
pub mod vision;

pub use error::{AppResult, PnpError};
