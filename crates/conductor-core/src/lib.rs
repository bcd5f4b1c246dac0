//! Core types and error definitions for the Conductor workspace.
//!
//! This crate provides the foundational pieces shared by every Conductor
//! crate: the unified error type, the static agent roster and the clock
//! abstraction used for leases, schedules and check intervals.
//!
//! # Main types
//!
//! - [`ConductorError`]: unified error enum for all Conductor subsystems.
//! - [`ConductorResult`]: convenience alias for `Result<T, ConductorError>`.
//! - [`AgentType`]: the fixed roster of worker agents.
//! - [`Clock`]: time source, with [`SystemClock`] and [`ManualClock`].

/// Static agent roster.
pub mod agent;
/// Time abstraction.
pub mod clock;
/// Error types.
pub mod error;

pub use agent::AgentType;
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use error::{ConductorError, ConductorResult};
