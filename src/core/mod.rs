//! Core types shared by every layer: protocol constants and errors.

mod constants;
mod error;

pub use constants::*;
pub use error::{EngineError, Error, SecurityError};
