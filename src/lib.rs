// Core modules
pub mod config;
pub mod execution;
pub mod gateway;
pub mod indicators;
pub mod journal;
pub mod models;
pub mod risk;
pub mod strategy;
pub mod telemetry;

// Re-export commonly used types
pub use config::BotConfig;
pub use models::*;
