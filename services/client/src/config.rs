use std::time::Duration;
use tracing::Level;
use voxroom_core::{controller::ControllerConfig, level::DEFAULT_LEVEL_INTERVAL};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub api_url: String,
    pub room_name: String,
    pub participant_name: String,
    pub metadata: Option<String>,
    pub connect_timeout: Duration,
    pub initial_volume: f32,
    pub speak_on_connect: bool,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let api_url = http_url(
            "VOXROOM_API_URL",
            non_blank("VOXROOM_API_URL")?.unwrap_or_else(|| "http://localhost:8000".to_string()),
        )?;

        let room_name = non_blank("VOXROOM_ROOM")?.unwrap_or_else(|| "voice-room".to_string());
        let participant_name = non_blank("VOXROOM_PARTICIPANT")?
            .unwrap_or_else(|| format!("user-{:08x}", rand::random::<u32>()));
        let metadata = std::env::var("VOXROOM_METADATA")
            .ok()
            .filter(|m| !m.trim().is_empty());

        let timeout_str =
            std::env::var("VOXROOM_CONNECT_TIMEOUT_SECS").unwrap_or_else(|_| "15".to_string());
        let connect_timeout = match timeout_str.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => Duration::from_secs(secs),
            _ => {
                return Err(ConfigError::InvalidValue(
                    "VOXROOM_CONNECT_TIMEOUT_SECS".to_string(),
                    format!("'{}' is not a positive number of seconds", timeout_str),
                ));
            }
        };

        let volume_str = std::env::var("VOXROOM_VOLUME").unwrap_or_else(|_| "80".to_string());
        let initial_volume = match volume_str.trim().parse::<f32>() {
            Ok(v) if (0.0..=100.0).contains(&v) => v,
            _ => {
                return Err(ConfigError::InvalidValue(
                    "VOXROOM_VOLUME".to_string(),
                    format!("'{}' is not a volume between 0 and 100", volume_str),
                ));
            }
        };

        let speak_str =
            std::env::var("VOXROOM_SPEAK_ON_CONNECT").unwrap_or_else(|_| "false".to_string());
        let speak_on_connect = match speak_str.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            _ => {
                return Err(ConfigError::InvalidValue(
                    "VOXROOM_SPEAK_ON_CONNECT".to_string(),
                    format!("'{}' is not a boolean", speak_str),
                ));
            }
        };

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            api_url,
            room_name,
            participant_name,
            metadata,
            connect_timeout,
            initial_volume,
            speak_on_connect,
            log_level,
        })
    }

    /// Applies command-line overrides on top of the environment, with the
    /// same checks the environment gets.
    pub fn with_overrides(
        mut self,
        room_name: Option<String>,
        participant_name: Option<String>,
        api_url: Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(room_name) = room_name {
            self.room_name = non_empty("--room", room_name)?;
        }
        if let Some(participant_name) = participant_name {
            self.participant_name = non_empty("--participant", participant_name)?;
        }
        if let Some(api_url) = api_url {
            self.api_url = http_url("--api-url", non_empty("--api-url", api_url)?)?;
        }
        Ok(self)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            connect_timeout: self.connect_timeout,
            close_timeout: CLOSE_TIMEOUT,
            level_interval: DEFAULT_LEVEL_INTERVAL,
            initial_volume: self.initial_volume,
            speak_on_connect: self.speak_on_connect,
        }
    }
}

/// Reads an optional variable. Set-but-blank counts as missing.
fn non_blank(name: &str) -> Result<Option<String>, ConfigError> {
    std::env::var(name)
        .ok()
        .map(|value| non_empty(name, value))
        .transpose()
}

fn non_empty(name: &str, value: String) -> Result<String, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConfigError::MissingVar(format!("{} is set but empty", name)));
    }
    Ok(value.to_string())
}

fn http_url(name: &str, url: String) -> Result<String, ConfigError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(url)
    } else {
        Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("'{}' is not an http(s) URL", url),
        ))
    }
}
