//! Steward Common - Shared configuration, logging and the event bus.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Configuration validation
//! - Logging setup
//! - The typed notification bus used for cross-engine triggering

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod bus;
pub mod config;
pub mod logging;
pub mod validation;

pub use bus::{publish_best_effort, spawn_handler, BusError, Event, EventBus, InMemoryBus, Topic};
pub use config::{
    Config, ControllerConfig, DecisionConfig, ObservabilityConfig, SchedulerConfig,
    WorkflowConfig,
};
pub use validation::{Validate, ValidationError, ValidationResult};
