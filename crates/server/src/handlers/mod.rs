//! HTTP request handlers.

pub mod health;
pub mod passes;

pub use health::*;
pub use passes::*;
