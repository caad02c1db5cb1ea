//! Coven application library
//!
//! The reconciliation engine, derived views, and configuration.

pub mod config;
pub mod engine;
pub mod views;

pub use config::{Config, ConfigError};
pub use engine::{Engine, Lifecycle, PhaseTransition, SessionSink};
pub use views::{Derived, Factions, Views};
