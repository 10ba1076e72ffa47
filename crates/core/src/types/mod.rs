//! Core type definitions for Sandflow.
//!
//! Data-only leaf of the system: every other crate speaks in these types.

pub mod agent;
pub mod cost;
pub mod permission;
pub mod resource;
pub mod sandbox;
pub mod workflow;

pub use agent::*;
pub use cost::*;
pub use permission::*;
pub use resource::*;
pub use sandbox::*;
pub use workflow::*;
