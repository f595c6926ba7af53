//! Relay configuration
//!
//! [`RelayConfig`] carries pacing cadence, tool-round timing, the thinking
//! strategy and the normalization strings. It deserializes with defaults so
//! partial JSON/YAML snippets work, and it has a builder for code.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// How parsed fragments are assembled into the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingStrategy {
    /// Append fragment text verbatim.
    #[default]
    Plain,
    /// Quote reasoning fragments and separate them from the answer.
    ThinkingAware,
}

/// Localized strings supplied by the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocaleStrings {
    /// Appended to the diagnostic transcript of a 401 response.
    pub unauthorized: String,
}

impl Default for LocaleStrings {
    fn default() -> Self {
        Self {
            unauthorized: "Unauthorized access, please enter access code in [auth](/#/auth) page, or enter your OpenAI API Key.".to_string(),
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Pacing emitter cadence in milliseconds.
    pub tick_interval_ms: u64,
    /// Each tick reveals `max(1, round(unrevealed / reveal_divisor))` characters.
    pub reveal_divisor: usize,
    /// Pause between a finished tool round and the next request.
    pub tool_restart_delay_ms: u64,
    /// Time allowed for the transport to open.
    pub request_timeout_ms: u64,
    /// Upper bound on tool rounds per session.
    pub max_tool_rounds: usize,
    pub thinking: ThinkingStrategy,
    /// Substring that marks a backend overload/capacity failure.
    pub overload_marker: String,
    /// Replacement text for any content containing `overload_marker`.
    pub overload_sentinel: String,
    /// Event payload that terminates a stream.
    pub done_marker: String,
    pub locale: LocaleStrings,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 16,
            reveal_divisor: 60,
            tool_restart_delay_ms: 60,
            request_timeout_ms: 60_000,
            max_tool_rounds: 8,
            thinking: ThinkingStrategy::Plain,
            overload_marker: "insufficient".to_string(),
            overload_sentinel: "ERROR: ServerUnreachable".to_string(),
            done_marker: "[DONE]".to_string(),
            locale: LocaleStrings::default(),
        }
    }
}

impl RelayConfig {
    /// Create a new builder for RelayConfig
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::default()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn tool_restart_delay(&self) -> Duration {
        Duration::from_millis(self.tool_restart_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Replace `text` with the overload sentinel when it carries the marker.
    pub fn normalize_overload(&self, text: String) -> String {
        if self.is_overloaded(&text) {
            self.overload_sentinel.clone()
        } else {
            text
        }
    }

    pub fn is_overloaded(&self, text: &str) -> bool {
        !self.overload_marker.is_empty() && text.contains(&self.overload_marker)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(RelayError::ConfigurationError(
                "tick_interval_ms must be greater than zero".into(),
            ));
        }
        if self.reveal_divisor == 0 {
            return Err(RelayError::ConfigurationError(
                "reveal_divisor must be greater than zero".into(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(RelayError::ConfigurationError(
                "request_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.done_marker.trim().is_empty() {
            return Err(RelayError::ConfigurationError(
                "done_marker must not be blank".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for RelayConfig
#[derive(Debug, Default)]
pub struct RelayConfigBuilder {
    config: RelayConfig,
}

impl RelayConfigBuilder {
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn reveal_divisor(mut self, divisor: usize) -> Self {
        self.config.reveal_divisor = divisor;
        self
    }

    pub fn tool_restart_delay(mut self, delay: Duration) -> Self {
        self.config.tool_restart_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn max_tool_rounds(mut self, rounds: usize) -> Self {
        self.config.max_tool_rounds = rounds;
        self
    }

    pub fn thinking(mut self, strategy: ThinkingStrategy) -> Self {
        self.config.thinking = strategy;
        self
    }

    pub fn overload_marker(mut self, marker: impl Into<String>) -> Self {
        self.config.overload_marker = marker.into();
        self
    }

    pub fn overload_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.config.overload_sentinel = sentinel.into();
        self
    }

    pub fn done_marker(mut self, marker: impl Into<String>) -> Self {
        self.config.done_marker = marker.into();
        self
    }

    pub fn unauthorized_notice(mut self, notice: impl Into<String>) -> Self {
        self.config.locale.unauthorized = notice.into();
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<RelayConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_display_refresh_pacing() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.tick_interval(), Duration::from_millis(16));
        assert_eq!(cfg.reveal_divisor, 60);
        assert_eq!(cfg.tool_restart_delay(), Duration::from_millis(60));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let cfg: RelayConfig =
            serde_json::from_str(r#"{"thinking":"thinking_aware","reveal_divisor":30}"#).unwrap();
        assert_eq!(cfg.thinking, ThinkingStrategy::ThinkingAware);
        assert_eq!(cfg.reveal_divisor, 30);
        assert_eq!(cfg.done_marker, "[DONE]");
    }

    #[test]
    fn builder_rejects_zero_divisor() {
        let err = RelayConfig::builder().reveal_divisor(0).build().unwrap_err();
        assert!(matches!(err, RelayError::ConfigurationError(_)));
    }

    #[test]
    fn builder_rejects_zero_request_timeout() {
        let err = RelayConfig::builder()
            .request_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, RelayError::ConfigurationError(_)));
    }

    #[test]
    fn overload_normalization_is_substring_based() {
        let cfg = RelayConfig::default();
        assert_eq!(
            cfg.normalize_overload("quota insufficient for model".into()),
            "ERROR: ServerUnreachable"
        );
        assert_eq!(cfg.normalize_overload("fine".into()), "fine");
    }
}
