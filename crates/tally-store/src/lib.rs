//! Tally Store Layer
//!
//! In-process implementations of the collaborator traits defined in
//! `tally-core`:
//!
//! - [`MemoryStore`]: accounts, shared groups, rating profiles, rating plans
//!   and destinations behind concurrent maps
//! - [`Fixtures`]: JSON documents loaded into a [`MemoryStore`]

pub mod fixtures;
pub mod memory;

pub use fixtures::Fixtures;
pub use memory::MemoryStore;

// Re-export commonly used types
pub use tally_core::{AppError, AppResult};
