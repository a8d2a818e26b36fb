use clap::Args;
use std::time::Duration;
use thiserror::Error;

use crate::handler::{DEFAULT_IMAGE_WIDTH, RenderSettings};
use crate::protocol::Framing;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid endpoint '{0}': expected an http:// or https:// URL")]
    InvalidEndpoint(String),

    #[error("image width must be greater than zero")]
    InvalidImageWidth,

    #[error("request timeout must be greater than zero")]
    InvalidTimeout,

    #[error("stream idle limit must be greater than zero")]
    InvalidStreamIdle,
}

/// Settings for `relay serve`.
#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Base URL of the Azure OpenAI resource.
    #[arg(long, env = "AOAI_ENDPOINT")]
    pub endpoint: String,

    #[arg(long, env = "AOAI_KEY", hide_env_values = true)]
    pub api_key: String,

    #[arg(long, env = "AZURE_OPENAI_API_VERSION", default_value = "2024-05-01-preview")]
    pub api_version: String,

    /// Assistant that every run is executed with.
    #[arg(long, env = "AOAI_ASSISTANT_ID")]
    pub assistant_id: String,

    #[arg(long, env = "RELAY_LISTEN", default_value = "127.0.0.1:8000")]
    pub listen: String,

    /// Display width, in pixels, of images inlined into the stream.
    #[arg(long, env = "RELAY_IMAGE_WIDTH", default_value_t = DEFAULT_IMAGE_WIDTH)]
    pub image_width: u32,

    #[arg(long, env = "RELAY_FRAMING", value_enum, default_value_t = Framing::Sse)]
    pub framing: Framing,

    /// Timeout for non-streaming calls to the assistant service.
    #[arg(long, env = "RELAY_REQUEST_TIMEOUT_SECS", default_value_t = 120)]
    pub request_timeout_secs: u64,

    /// Longest silence tolerated on a run's event stream before the run is
    /// reported as interrupted.
    #[arg(long, env = "RELAY_STREAM_IDLE_SECS", default_value_t = 120)]
    pub stream_idle_secs: u64,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(ConfigError::InvalidEndpoint(self.endpoint.clone()));
        }
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::Missing("AOAI_KEY"));
        }
        if self.assistant_id.trim().is_empty() {
            return Err(ConfigError::Missing("AOAI_ASSISTANT_ID"));
        }
        if self.image_width == 0 {
            return Err(ConfigError::InvalidImageWidth);
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        if self.stream_idle_secs == 0 {
            return Err(ConfigError::InvalidStreamIdle);
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_idle(&self) -> Duration {
        Duration::from_secs(self.stream_idle_secs)
    }

    pub fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            image_width: self.image_width,
        }
    }
}
