pub mod chain;
pub mod codec;
pub mod config;
pub mod display;
pub mod engine;
pub mod recovery;
pub mod service;
pub mod session;
pub mod supervisor;

// Re-export commonly used types
pub use config::Config;
pub use supervisor::{ShutdownReport, Supervisor, SupervisorEvent};

// Common error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraGridError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Media engine error: {0}")]
    EngineError(#[from] engine::EngineError),

    #[error("Failed to start session for stream {stream}: {error}")]
    SpawnError { stream: String, error: std::io::Error },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Shutdown task failed: {0}")]
    ShutdownError(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, CameraGridError>;
