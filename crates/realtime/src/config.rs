//! Session and client configuration.
//!
//! `SessionConfig` holds the parameters that shape one realtime session and
//! can be updated live through the client facade; `ClientConfig` adds the
//! credential and is loaded from the environment at startup.

use secrecy::SecretString;

/// Model used when neither the environment nor the caller overrides it.
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview";

/// Default assistant voice.
pub const DEFAULT_VOICE: &str = "alloy";

/// Default server-VAD sensitivity threshold.
pub const DEFAULT_VAD_THRESHOLD: f32 = 0.95;

/// Default server-VAD silence window before a turn is considered complete.
pub const DEFAULT_VAD_SILENCE_MS: u32 = 1600;

/// Model used for input audio transcription.
pub const TRANSCRIPTION_MODEL: &str = "gpt-4o-mini-transcribe";

const MIN_VAD_SILENCE_MS: u32 = 100;

const DEFAULT_INSTRUCTIONS: &str = "You are a fast, helpful voice assistant. \
     Answer in the language the user speaks. Keep answers concise unless \
     explicitly asked for details.";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Parameters of one realtime session.
///
/// The VAD fields are private so that every write path goes through the
/// clamping setters: threshold is kept in `[0, 1]` and the silence window at
/// or above 100 ms.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub model: String,
    pub instructions: String,
    pub voice: String,
    vad_threshold: f32,
    vad_silence_ms: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            vad_threshold: DEFAULT_VAD_THRESHOLD,
            vad_silence_ms: DEFAULT_VAD_SILENCE_MS,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn vad_threshold(&self) -> f32 {
        self.vad_threshold
    }

    #[must_use]
    pub fn vad_silence_ms(&self) -> u32 {
        self.vad_silence_ms
    }

    /// Sets the VAD sensitivity threshold, clamped to `[0, 1]`.
    pub fn set_vad_threshold(&mut self, threshold: f32) {
        self.vad_threshold = threshold.clamp(0.0, 1.0);
    }

    /// Sets the VAD silence window, clamped to at least 100 ms.
    pub fn set_vad_silence_ms(&mut self, silence_ms: u32) {
        self.vad_silence_ms = silence_ms.max(MIN_VAD_SILENCE_MS);
    }
}

/// Full client configuration: session parameters plus the API credential.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub api_key: SecretString,
    pub session: SessionConfig,
}

impl ClientConfig {
    /// Creates a configuration with default session parameters.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: SecretString::from(api_key.into()),
            session: SessionConfig::default(),
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// `OPENAI_API_KEY` is required. `OPENAI_REALTIME_MODEL`,
    /// `REALTIME_VOICE`, `VAD_THRESHOLD` and `VAD_SILENCE_MS` override the
    /// session defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;

        let mut session = SessionConfig::default();

        if let Ok(model) = std::env::var("OPENAI_REALTIME_MODEL") {
            if !model.is_empty() {
                session.model = model;
            }
        }
        if let Ok(voice) = std::env::var("REALTIME_VOICE") {
            if !voice.is_empty() {
                session.voice = voice;
            }
        }
        if let Ok(raw) = std::env::var("VAD_THRESHOLD") {
            let threshold = raw.parse::<f32>().map_err(|e| {
                ConfigError::InvalidValue("VAD_THRESHOLD".to_string(), e.to_string())
            })?;
            session.set_vad_threshold(threshold);
        }
        if let Ok(raw) = std::env::var("VAD_SILENCE_MS") {
            let silence = raw.parse::<u32>().map_err(|e| {
                ConfigError::InvalidValue("VAD_SILENCE_MS".to_string(), e.to_string())
            })?;
            session.set_vad_silence_ms(silence);
        }

        Ok(Self {
            api_key: SecretString::from(api_key),
            session,
        })
    }
}
