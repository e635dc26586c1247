//! Common types for the key balancer workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::{Secret, mask};
