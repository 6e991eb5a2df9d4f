//! Streaming output support
//!
//! Events emitted over the fragment channel while a generation session runs.

use thiserror::Error;

/// Errors surfaced on the generation boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// Generation was requested before the model and tokenizer were ready.
    #[error("Model is not ready")]
    NotReady,

    /// The tokenizer rejected the formatted prompt.
    #[error("Failed to encode prompt: {0}")]
    EncodingFailed(String),

    /// A single generation step (scoring, token selection, or decoding)
    /// failed. Fragments already emitted remain valid.
    #[error("Generation step failed: {0}")]
    StepFailure(String),
}

/// Why a session stopped producing fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The generator reported completion on its own.
    Completed,
    /// A conversational stop marker appeared in the decoded output.
    StopMarker,
    /// The consumer stopped the session or went away.
    Cancelled,
}

/// An event emitted during streaming generation.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A decoded text fragment, one per generated token. May be empty while
    /// the decoder is holding back an incomplete UTF-8 sequence.
    Fragment(String),
    /// Generation finished; no further events follow.
    Done(FinishReason),
    /// Generation failed; no further events follow. Fragments already
    /// delivered are not retracted.
    Error(GenerationError),
}

impl StreamEvent {
    /// Returns true if this is a fragment variant
    pub fn is_fragment(&self) -> bool {
        matches!(self, StreamEvent::Fragment(_))
    }

    /// Returns true if generation finished cleanly
    pub fn is_done(&self) -> bool {
        matches!(self, StreamEvent::Done(_))
    }

    /// Returns true if generation failed
    pub fn is_error(&self) -> bool {
        matches!(self, StreamEvent::Error(_))
    }

    /// Extracts the fragment text if this is a Fragment variant
    pub fn as_fragment(&self) -> Option<&str> {
        match self {
            StreamEvent::Fragment(s) => Some(s),
            _ => None,
        }
    }

    /// Extracts the error if this is an Error variant
    pub fn as_error(&self) -> Option<&GenerationError> {
        match self {
            StreamEvent::Error(e) => Some(e),
            _ => None,
        }
    }
}
