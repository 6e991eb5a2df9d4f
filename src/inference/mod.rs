//! LLM inference
//!
//! This module handles model loading and the streaming generation core.

pub mod engine;
pub mod model;
pub mod prompt;
pub mod session;
pub mod streaming;

// Re-export main types for convenience
pub use engine::{EngineError, GenerationParams, InferenceEngine, LoadedModelInfo};
pub use model::{locate_model_file, validate_gguf, GgufMetadata, ModelError, GGUF_MAGIC};
pub use session::{
    DecodeStream, GenerationSession, SessionConfig, SessionEnd, SessionOutcome, TokenGenerator,
    TokenId,
};
pub use streaming::{FinishReason, GenerationError, StreamEvent};
