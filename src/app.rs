//! Application state
//!
//! Ties the inference engine to its readiness state: generation requests are
//! refused until a model has been loaded.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::Settings;
use crate::inference::engine::{EngineError, InferenceEngine, LoadedModelInfo};
use crate::inference::streaming::{GenerationError, StreamEvent};

/// Represents the current state of the model
#[derive(Clone, PartialEq, Debug)]
pub enum ModelState {
    NotLoaded,
    Loading,
    Loaded(String),
    Error(String),
}

/// Application state: the engine plus everything needed to drive it
pub struct ChatApp {
    engine: InferenceEngine,
    settings: Settings,
    model_state: ModelState,
}

impl ChatApp {
    pub fn new(mut settings: Settings) -> Self {
        settings.validate();
        tracing::info!("ChatApp initialized");
        Self {
            engine: InferenceEngine::new(),
            settings,
            model_state: ModelState::NotLoaded,
        }
    }

    /// Initializes the backend and loads the configured model package.
    ///
    /// Blocking; expected to be slow. On success the app transitions to
    /// `Loaded` and generation requests are accepted.
    pub fn load_model(&mut self) -> Result<LoadedModelInfo, EngineError> {
        self.model_state = ModelState::Loading;
        self.engine.init()?;

        match self
            .engine
            .load_model(&self.settings.model_dir, self.settings.gpu_layers)
        {
            Ok(info) => {
                self.model_state = ModelState::Loaded(info.path.clone());
                Ok(info)
            }
            Err(e) => {
                self.model_state = ModelState::Error(e.to_string());
                Err(e)
            }
        }
    }

    /// Starts a streaming answer for a raw user prompt.
    ///
    /// Refuses with [`GenerationError::NotReady`] unless a model is loaded.
    pub fn ask(
        &self,
        prompt: &str,
    ) -> Result<(UnboundedReceiver<StreamEvent>, Arc<AtomicBool>), GenerationError> {
        if !matches!(self.model_state, ModelState::Loaded(_)) {
            return Err(GenerationError::NotReady);
        }
        self.engine.generate_stream(prompt, self.settings.to_params())
    }

    pub fn model_state(&self) -> &ModelState {
        &self.model_state
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_starts_not_loaded() {
        let app = ChatApp::new(Settings::default());
        assert_eq!(*app.model_state(), ModelState::NotLoaded);
    }

    #[test]
    fn test_ask_before_load_is_not_ready() {
        let app = ChatApp::new(Settings::default());
        let result = app.ask("hello");
        assert!(matches!(result, Err(GenerationError::NotReady)));
    }

    #[test]
    fn test_settings_are_validated_on_construction() {
        let mut settings = Settings::default();
        settings.temperature = 99.0;
        let app = ChatApp::new(settings);
        assert_eq!(app.settings().temperature, 2.0);
    }
}
