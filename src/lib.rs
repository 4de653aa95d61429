//! Test-network bootstrap for Aura consensus integration suites.
//!
//! The crate boots a local node against a cached genesis specification and
//! keeps track of every process it starts so that nothing outlives the run.
//! [`orchestrator::Orchestrator`] drives the sequence; the supporting modules
//! are the artifact [`cache`], the master of ceremony [`identity`], the
//! orphan [`reaper`], the node [`launcher`], the [`readiness`] gate and
//! [`teardown`]. Contract compilation and RPC are external collaborators
//! reached through [`builder::GenesisBuilder`] and
//! [`readiness::LivenessProbe`].

pub mod builder;
pub mod cache;
pub mod config;
pub mod errors;
pub mod genesis;
pub mod identity;
pub mod launcher;
pub mod orchestrator;
pub mod readiness;
pub mod reaper;
pub mod teardown;

pub use errors::{HarnessError, HarnessResult};
pub use orchestrator::{BootstrapOutcome, Orchestrator, SpecSource};
