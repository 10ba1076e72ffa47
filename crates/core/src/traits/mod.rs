//! Core traits for Sandflow.
//!
//! Traits are organized by the seam they define:
//! - `events`: event emission towards external observers (UI, audit)
//! - `governance`: the permission gate consulted by the sandbox manager
//! - `agent`: the external agent layer invoked per stage
//! - `store`: persistence of run history

pub mod agent;
pub mod events;
pub mod governance;
pub mod store;

pub use agent::*;
pub use events::*;
pub use governance::*;
pub use store::*;
