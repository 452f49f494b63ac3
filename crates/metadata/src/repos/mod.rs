//! Repository traits for metadata operations.

pub mod groups;
pub mod passes;

pub use groups::GroupRepo;
pub use passes::{PassRepo, PassState, PassStats};
