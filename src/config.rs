//! Simulation configuration.
//!
//! One `SimConfig` is handed to the connection registry at construction and
//! shared by every connection it creates. Defaults match the original
//! teaching tool: 5 s retransmission timeout, 3 retries, 64 KiB advertised
//! window, ephemeral ports from 1024.

use std::time::Duration;

use thiserror::Error;

/// Configuration validation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How connection timers behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerMode {
    /// Timers fire when the virtual clock passes their deadline.
    #[default]
    Active,
    /// Timers arm but never fire. The teaching tool uses this to keep slow
    /// animation playback from triggering spurious retransmissions.
    Inert,
}

/// Tunable parameters for the TCP simulation.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Retransmission timeout (virtual time).
    pub retransmission_timeout: Duration,
    /// Resend attempts before the connection gives up and resets.
    pub max_retransmissions: u32,
    /// Whether timers actually fire.
    pub timer_mode: TimerMode,
    /// Advertised receive window, informational only.
    pub window_size: u16,
    /// First port tried by the ephemeral allocator; also the wrap target.
    pub ephemeral_port_start: u16,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            retransmission_timeout: Duration::from_secs(5),
            max_retransmissions: 3,
            timer_mode: TimerMode::Active,
            window_size: 65535,
            ephemeral_port_start: 1024,
        }
    }
}

impl SimConfig {
    pub fn with_retransmission_timeout(mut self, timeout: Duration) -> Self {
        self.retransmission_timeout = timeout;
        self
    }

    pub fn with_max_retransmissions(mut self, max: u32) -> Self {
        self.max_retransmissions = max;
        self
    }

    pub fn with_timer_mode(mut self, mode: TimerMode) -> Self {
        self.timer_mode = mode;
        self
    }

    pub fn with_ephemeral_port_start(mut self, port: u16) -> Self {
        self.ephemeral_port_start = port;
        self
    }

    /// TIME-WAIT linger before a connection finally closes.
    pub fn time_wait_timeout(&self) -> Duration {
        self.retransmission_timeout * 2
    }

    /// Check the configuration for nonsense values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retransmission_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "retransmission timeout must be non-zero".to_string(),
            ));
        }
        if self.ephemeral_port_start < 1024 {
            return Err(ConfigError::Invalid(
                "ephemeral ports must start at 1024 or above".to_string(),
            ));
        }
        Ok(())
    }
}
