use koma_core::{PipelineConfig, SessionSettings};
use serde::Deserialize;
use std::time::Duration;

/// High-level app configuration; deserializable from TOML.
#[derive(Debug, Clone, Deserialize, serde::Serialize, PartialEq)]
pub struct AppConfig {
    #[serde(default = "crate::config::defaults::default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "crate::config::defaults::default_prefetch_delay_ms")]
    pub prefetch_delay_ms: u64,
    #[serde(default = "crate::config::defaults::default_row_tolerance")]
    pub row_tolerance: u16,
    #[serde(default = "crate::config::defaults::default_analysis_enabled")]
    pub analysis_enabled: bool,
    #[serde(default = "crate::config::defaults::default_speech_enabled")]
    pub speech_enabled: bool,
    #[serde(default = "crate::config::defaults::default_analysis_endpoint")]
    pub analysis_endpoint: String,
    #[serde(default = "crate::config::defaults::default_analysis_model")]
    pub analysis_model: String,
    #[serde(default = "crate::config::defaults::default_analysis_api_key_env")]
    pub analysis_api_key_env: String,
    #[serde(default = "crate::config::defaults::default_analysis_timeout_secs")]
    pub analysis_timeout_secs: u64,
    #[serde(default = "crate::config::defaults::default_max_image_dimension")]
    pub max_image_dimension: u32,
    #[serde(default = "crate::config::defaults::default_speech_command")]
    pub speech_command: String,
    #[serde(default = "crate::config::defaults::default_speech_args")]
    pub speech_args: Vec<String>,
    #[serde(default = "crate::config::defaults::default_log_level")]
    pub log_level: LogLevel,
    #[serde(default = "crate::config::defaults::default_key_next_page")]
    pub key_next_page: String,
    #[serde(default = "crate::config::defaults::default_key_prev_page")]
    pub key_prev_page: String,
    #[serde(default = "crate::config::defaults::default_key_goto_page")]
    pub key_goto_page: String,
    #[serde(default = "crate::config::defaults::default_key_toggle_analysis")]
    pub key_toggle_analysis: String,
    #[serde(default = "crate::config::defaults::default_key_toggle_speech")]
    pub key_toggle_speech: String,
    #[serde(default = "crate::config::defaults::default_key_retry_page")]
    pub key_retry_page: String,
    #[serde(default = "crate::config::defaults::default_key_show_page")]
    pub key_show_page: String,
    #[serde(default = "crate::config::defaults::default_key_quit")]
    pub key_quit: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            batch_size: crate::config::defaults::default_batch_size(),
            prefetch_delay_ms: crate::config::defaults::default_prefetch_delay_ms(),
            row_tolerance: crate::config::defaults::default_row_tolerance(),
            analysis_enabled: crate::config::defaults::default_analysis_enabled(),
            speech_enabled: crate::config::defaults::default_speech_enabled(),
            analysis_endpoint: crate::config::defaults::default_analysis_endpoint(),
            analysis_model: crate::config::defaults::default_analysis_model(),
            analysis_api_key_env: crate::config::defaults::default_analysis_api_key_env(),
            analysis_timeout_secs: crate::config::defaults::default_analysis_timeout_secs(),
            max_image_dimension: crate::config::defaults::default_max_image_dimension(),
            speech_command: crate::config::defaults::default_speech_command(),
            speech_args: crate::config::defaults::default_speech_args(),
            log_level: crate::config::defaults::default_log_level(),
            key_next_page: crate::config::defaults::default_key_next_page(),
            key_prev_page: crate::config::defaults::default_key_prev_page(),
            key_goto_page: crate::config::defaults::default_key_goto_page(),
            key_toggle_analysis: crate::config::defaults::default_key_toggle_analysis(),
            key_toggle_speech: crate::config::defaults::default_key_toggle_speech(),
            key_retry_page: crate::config::defaults::default_key_retry_page(),
            key_show_page: crate::config::defaults::default_key_show_page(),
            key_quit: crate::config::defaults::default_key_quit(),
        }
    }
}

impl AppConfig {
    /// Fold cached per-source overrides into this base config. Log level and
    /// command keys always come from the base config.
    pub fn with_overrides(&self, mut overrides: AppConfig) -> AppConfig {
        overrides.log_level = self.log_level;
        overrides.key_next_page = self.key_next_page.clone();
        overrides.key_prev_page = self.key_prev_page.clone();
        overrides.key_goto_page = self.key_goto_page.clone();
        overrides.key_toggle_analysis = self.key_toggle_analysis.clone();
        overrides.key_toggle_speech = self.key_toggle_speech.clone();
        overrides.key_retry_page = self.key_retry_page.clone();
        overrides.key_show_page = self.key_show_page.clone();
        overrides.key_quit = self.key_quit.clone();
        overrides
    }

    /// This config with the feature toggles the session ended with, as saved
    /// into the per-source overrides.
    pub fn with_session_state(&self, analysis_enabled: bool, speech_enabled: bool) -> AppConfig {
        AppConfig {
            analysis_enabled,
            speech_enabled,
            ..self.clone()
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            batch_size: self.batch_size.max(1),
            prefetch_delay: Duration::from_millis(self.prefetch_delay_ms),
            row_tolerance: self.row_tolerance,
        }
    }

    pub fn session_settings(&self, start_page: usize) -> SessionSettings {
        SessionSettings {
            pipeline: self.pipeline(),
            analysis_enabled: self.analysis_enabled,
            speech_enabled: self.speech_enabled,
            start_page,
        }
    }
}

/// Supported logging verbosity levels.
#[derive(Debug, Clone, Copy, Deserialize, serde::Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    #[default]
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_filter_str())
    }
}

impl LogLevel {
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}
