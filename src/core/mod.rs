/*!
 * Core Module
 * Fundamental server types, configuration, and error handling
 */

pub mod bincode;
pub mod config;
pub mod errors;
pub mod flags;
pub mod limits;
pub mod types;

// Re-export for convenience
pub use config::ServerConfig;
pub use errors::*;
pub use flags::*;
pub use types::*;
