//! ClipStake Backend Library
//!
//! Round lifecycle and settlement engine for the per-category clip prediction
//! pools. Exposes the engine for use by the service binary, the inspector CLI
//! and integration tests.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod store;

pub use config::EngineConfig;
pub use engine::PredictionMarket;
pub use error::{EngineError, ErrorKind, StakeRejection};
