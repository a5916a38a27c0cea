use embody_core::generic_types::Modality;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// When user turns are forwarded to the model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeMode {
    /// Every turn is forwarded.
    Always,
    /// Only turns containing the wake phrase are forwarded.
    Phrase,
    /// The first turn containing the wake phrase opens the gate for good.
    PhraseOnce,
}

impl FromStr for WakeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "phrase" => Ok(Self::Phrase),
            "phrase_once" | "phrase-once" => Ok(Self::PhraseOnce),
            other => Err(format!("'{other}' is not one of always, phrase, phrase_once")),
        }
    }
}

/// When a camera frame is attached to a user turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VisionMode {
    Off,
    Always,
    Phrase,
}

impl FromStr for VisionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "always" => Ok(Self::Always),
            "phrase" => Ok(Self::Phrase),
            other => Err(format!("'{other}' is not one of off, always, phrase")),
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub gemini_api_key: String,
    pub live_endpoint: String,
    pub live_model: String,
    pub response_modality: Modality,
    pub voice_name: Option<String>,
    pub system_prompt_path: Option<PathBuf>,
    pub wake_mode: WakeMode,
    pub wake_phrase: String,
    pub vision_mode: VisionMode,
    pub vision_phrase: String,
    pub input_gain: f32,
    pub vad_threshold: f32,
    pub interrupt_debounce: Duration,
    pub connect_timeout: Duration,
    pub greeting: Option<String>,
    pub log_level: Level,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = var_or(name, default);
    raw.parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let gemini_api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .and_then(non_empty)
            .ok_or_else(|| ConfigError::MissingVar("GEMINI_API_KEY".to_string()))?;

        let live_endpoint = var_or("LIVE_ENDPOINT", gemini_realtime::DEFAULT_ENDPOINT);
        let live_model = var_or("LIVE_MODEL", "models/gemini-2.0-flash-live-001");

        let modality_str = var_or("RESPONSE_MODALITY", "audio");
        let response_modality = match modality_str.to_lowercase().as_str() {
            "audio" => Modality::Audio,
            "text" => Modality::Text,
            _ => {
                return Err(ConfigError::InvalidValue(
                    "RESPONSE_MODALITY".to_string(),
                    format!("'{}' is not one of audio, text", modality_str),
                ));
            }
        };

        let voice_name = non_empty(var_or("VOICE_NAME", "Puck"));
        let system_prompt_path = std::env::var("SYSTEM_PROMPT_PATH")
            .ok()
            .and_then(non_empty)
            .map(PathBuf::from);

        let wake_mode = parse_var::<WakeMode>("WAKE_MODE", "always")?;
        let wake_phrase = var_or("WAKE_PHRASE", "hey avatar");
        let vision_mode = parse_var::<VisionMode>("VISION_MODE", "off")?;
        let vision_phrase = var_or("VISION_PHRASE", "look");

        let input_gain = parse_var::<f32>("INPUT_GAIN", "1.0")?;
        if !(input_gain.is_finite() && input_gain > 0.0) {
            return Err(ConfigError::InvalidValue(
                "INPUT_GAIN".to_string(),
                "must be a positive number".to_string(),
            ));
        }
        let vad_threshold = parse_var::<f32>("VAD_THRESHOLD", "0.02")?;

        let interrupt_debounce =
            Duration::from_millis(parse_var::<u64>("INTERRUPT_DEBOUNCE_MS", "500")?);
        let connect_timeout =
            Duration::from_millis(parse_var::<u64>("CONNECT_TIMEOUT_MS", "10000")?);

        let greeting = non_empty(var_or("GREETING", "Say hello to the user."));

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            gemini_api_key,
            live_endpoint,
            live_model,
            response_modality,
            voice_name,
            system_prompt_path,
            wake_mode,
            wake_phrase,
            vision_mode,
            vision_phrase,
            input_gain,
            vad_threshold,
            interrupt_debounce,
            connect_timeout,
            greeting,
            log_level,
        })
    }
}
