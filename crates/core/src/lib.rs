//! Core types, traits, and error definitions for Sandflow.
//!
//! This crate provides the data model shared by every layer of the sandboxed
//! workflow engine: resource limits, sandbox and permission records, workflow
//! definitions and runs, cost records, the event envelope, and the traits that
//! form the seams between the sandbox, governance, and controller crates.

pub mod config;
pub mod error;
pub mod events;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use events::*;
pub use traits::*;
pub use types::*;
