//! Tunnel engine configuration

use crate::ids::Route;
use std::time::Duration;
use thiserror::Error;

/// Configuration validation failure
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A size or count that must be positive is zero
    #[error("{0} must be non-zero")]
    Zero(&'static str),

    /// Two related values are inconsistent
    #[error("inconsistent configuration: {0}")]
    Inconsistent(&'static str),
}

/// Per-tunnel tunables
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Send/receive window ring capacity (slots)
    pub window_capacity: usize,

    /// Congestion window floor (slots)
    pub min_window: usize,

    /// Initial congestion window (slots)
    pub initial_window: usize,

    /// Loss rate above which the window shrinks
    pub loss_threshold: f64,

    /// Initial retransmission timeout
    pub initial_rto: Duration,

    /// Lower RTO clamp
    pub min_rto: Duration,

    /// Upper RTO clamp
    pub max_rto: Duration,

    /// Fewer connected links than this triggers access-point requests
    pub min_links: usize,

    /// More connected links than this drops the slowest one
    pub max_links: usize,

    /// Backup routes remembered per kind (direct / bounced)
    pub backup_routes: usize,

    /// Heartbeat cadence for links that never connected
    pub heartbeat_interval: Duration,

    /// Heartbeat cadence for links that were connected and lost it
    pub reconnect_interval: Duration,

    /// Keepalive cadence for connected links
    pub keepalive_interval: Duration,

    /// Link disconnects after this long without inbound traffic
    pub link_timeout: Duration,

    /// Silent link is removed and kept as a backup route after this long
    pub link_expiry: Duration,

    /// Delay between backup route attempts when no link is left
    pub backup_retry_interval: Duration,

    /// Delay between access-point requests while under `min_links`
    pub access_point_interval: Duration,

    /// Message slice size in bytes
    pub message_slice_size: usize,

    /// File slice size in bytes
    pub file_slice_size: usize,

    /// File slices per block (at most 64)
    pub file_slices_per_block: usize,

    /// Control block flush cadence for incoming files
    pub control_flush_interval: Duration,

    /// Unanswered block request is re-sent after this long
    pub file_request_timeout: Duration,

    /// Maximum acknowledgment bits carried in one batch-ack
    pub max_ack_bits: usize,

    /// Completed task ids remembered for duplicate suppression
    pub recent_ids: usize,

    /// Loss/latency samples kept for quality queries
    pub history_size: usize,

    /// Idle teardown; `None` disables it
    pub idle_timeout: Option<Duration>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            window_capacity: 10_240,
            min_window: 64,
            initial_window: 64,
            loss_threshold: 0.05,
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_millis(100),
            max_rto: Duration::from_secs(10),
            min_links: 4,
            max_links: 8,
            backup_routes: 4,
            heartbeat_interval: Duration::from_secs(1),
            reconnect_interval: Duration::from_secs(5),
            keepalive_interval: Duration::from_millis(2_500),
            link_timeout: Duration::from_secs(10),
            link_expiry: Duration::from_secs(30),
            backup_retry_interval: Duration::from_secs(5),
            access_point_interval: Duration::from_secs(30),
            message_slice_size: 1_280,
            file_slice_size: 1_024,
            file_slices_per_block: 64,
            control_flush_interval: Duration::from_secs(1),
            file_request_timeout: Duration::from_secs(2),
            max_ack_bits: 1_024,
            recent_ids: 256,
            history_size: 1_024,
            idle_timeout: None,
        }
    }
}

impl TunnelConfig {
    /// Check the configuration for nonsensical values
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_capacity == 0 {
            return Err(ConfigError::Zero("window_capacity"));
        }
        if self.min_window == 0 {
            return Err(ConfigError::Zero("min_window"));
        }
        if self.message_slice_size == 0 {
            return Err(ConfigError::Zero("message_slice_size"));
        }
        if self.file_slice_size == 0 {
            return Err(ConfigError::Zero("file_slice_size"));
        }
        if self.file_slices_per_block == 0 {
            return Err(ConfigError::Zero("file_slices_per_block"));
        }
        if self.max_ack_bits == 0 {
            return Err(ConfigError::Zero("max_ack_bits"));
        }
        if self.file_slices_per_block > 64 {
            return Err(ConfigError::Inconsistent(
                "file_slices_per_block exceeds the 64-bit slice mask",
            ));
        }
        if self.min_window > self.window_capacity {
            return Err(ConfigError::Inconsistent(
                "min_window larger than window_capacity",
            ));
        }
        if self.initial_window < self.min_window || self.initial_window > self.window_capacity {
            return Err(ConfigError::Inconsistent(
                "initial_window outside [min_window, window_capacity]",
            ));
        }
        if self.min_links > self.max_links {
            return Err(ConfigError::Inconsistent("min_links larger than max_links"));
        }
        if self.link_expiry < self.link_timeout {
            return Err(ConfigError::Inconsistent("link_expiry shorter than link_timeout"));
        }
        if self.min_rto > self.max_rto {
            return Err(ConfigError::Inconsistent("min_rto larger than max_rto"));
        }
        if !(0.0..1.0).contains(&self.loss_threshold) {
            return Err(ConfigError::Inconsistent("loss_threshold outside [0, 1)"));
        }
        Ok(())
    }

    /// File block size in bytes
    #[must_use]
    pub fn file_block_size(&self) -> u64 {
        (self.file_slice_size * self.file_slices_per_block) as u64
    }
}

/// Registry-wide configuration
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    /// Per-tunnel tunables applied to every tunnel
    pub tunnel: TunnelConfig,

    /// Application id carried in bootstrap payloads
    pub app_id: u32,

    /// Routes offered to peers that ask for access points
    pub advertised_routes: Vec<Route>,
}

impl RegistryConfig {
    /// Validate the nested tunnel configuration
    ///
    /// # Errors
    ///
    /// See [`TunnelConfig::validate`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tunnel.validate()
    }
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TunnelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.file_block_size(), 64 * 1024);
    }

    #[test]
    fn test_zero_slice_size_rejected() {
        let config = TunnelConfig {
            message_slice_size: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero("message_slice_size"))
        );
    }

    #[test]
    fn test_min_window_above_capacity_rejected() {
        let config = TunnelConfig {
            window_capacity: 32,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_link_bounds_rejected() {
        let config = TunnelConfig {
            min_links: 9,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_block_rejected() {
        let config = TunnelConfig {
            file_slices_per_block: 65,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
