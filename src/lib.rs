pub mod billing;
pub mod config;
pub mod error;
pub mod telemetry;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
