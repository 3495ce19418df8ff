//! Crate-wide error kinds.
//!
//! One variant per failure category in the engine's error-handling design:
//! configuration, external-process, extraction, LLM transport/response,
//! storage, and budget exhaustion. Most subsystems degrade on error rather
//! than propagating it (see each module's doc comment); `EngineError` is
//! reserved for failures that are genuinely fatal to the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("external process error: {0}")]
    ExternalProcess(String),

    #[error("content extraction error: {0}")]
    Extraction(String),

    #[error("llm transport error: {0}")]
    LlmTransport(String),

    #[error("llm response error: {0}")]
    LlmResponse(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("budget exceeded: {0}")]
    Budget(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for EngineError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for EngineError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}
