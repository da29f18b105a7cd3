//! Session, scheduling, and admission-control engine for tabops.
//!
//! The engine accepts operation requests for live browser tabs, serializes
//! them per target, multiplexes a global per-session concurrency budget
//! across targets, adapts that budget to resource pressure, and manages
//! session lease lifecycle (ownership, reclaim, expiry). Tab/DOM work is
//! delegated to the collaborator contracts in [`drivers`].

pub mod commands;
pub mod config;
pub mod dispatch;
pub mod drivers;
pub mod engine;
pub mod error;
pub mod governor;
pub mod registry;
pub mod scheduler;
pub mod testing;

mod framing;
mod handlers;

pub use config::{EngineConfig, Limits, OperatingMode, UrlPolicy};
pub use drivers::{
	DebugRouter, DomDriver, Drivers, EventSink, Sanitizer, SnapshotBuilder, TabDriver,
};
pub use engine::{AdmittedRequest, Engine, RequestOutput, Teardown};
pub use error::{OpsError, Result};
pub use governor::{GovernorPolicy, Pressure, ResourceSampler, SystemSampler};
pub use scheduler::BackpressureInfo;
