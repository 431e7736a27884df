// Library exports for airwave
// The binary and the integration tests both build on this API

pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod radio;
pub mod services;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::{AppError, Result};
pub use radio::{Collaborators, Station, SubmitOutcome};
