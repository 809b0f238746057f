#![forbid(unsafe_code)]

//! Core domain model and calculation engine for the bolus advisor.
//!
//! This crate provides:
//! - Domain types (clinical parameters, requests, snapshots, results)
//! - Insulin action and carbohydrate absorption models
//! - Dose calculator with safety gating and audit trail
//! - Glucose forecast simulation engine
//! - Dual-bolus plan tracking and treatment logging

pub mod types;
pub mod error;
pub mod presets;
pub mod config;
pub mod logging;
pub mod insulin;
pub mod carbs;
pub mod gate;
pub mod engine;
pub mod simulate;
pub mod snapshot;
pub mod treatments;
pub mod dualwave;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use engine::calculate;
pub use simulate::simulate;
pub use snapshot::{load_bg_reading, load_snapshot, BgReading};
pub use treatments::{JsonlTreatmentSink, TreatmentSink};
pub use dualwave::{administer, cancel, plan_from_result, recalc, PlanStore};
