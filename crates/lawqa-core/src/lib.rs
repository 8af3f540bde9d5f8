//! lawqa-core - Core types and traits for legal passage retrieval
//!
//! This crate provides the passage data model, the capability traits for the
//! store and model collaborators, configuration, and error handling used
//! throughout the lawqa workspace.

pub mod config;
pub mod error;
pub mod text;
pub mod traits;
pub mod types;

pub use config::*;
pub use error::{QaError, Result};
pub use traits::*;
pub use types::*;
