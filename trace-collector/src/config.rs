use std::time::Duration;

use thiserror::Error;

use super::scope::ScopeFilter;

#[derive(Debug, Error)]
#[error("invalid {name}: {value}")]
pub struct ConfigError {
    pub name: &'static str,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Every type descends from it, it joins every hierarchy.
    pub root_type: String,
    pub scope: ScopeFilter,
    /// Idle wait of the receiver grows from `min_backoff` up to `max_backoff`.
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Larger metapackets are treated as a malformed stream.
    pub max_packet_size: usize,
    pub read_buffer: usize,
    /// Mode changes a session may hold back while its reverse stream does
    /// not drain. Beyond it the session stops receiving mode changes.
    pub max_outgoing: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            root_type: "java.lang.Object".to_owned(),
            scope: ScopeFilter::default(),
            min_backoff: Duration::from_micros(50),
            max_backoff: Duration::from_millis(20),
            max_packet_size: 64 << 20,
            read_buffer: 0x10000,
            max_outgoing: 1 << 20,
        }
    }
}

impl CollectorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root_type.is_empty() {
            return Err(ConfigError {
                name: "root_type",
                value: String::new(),
            });
        }
        if self.min_backoff.is_zero() || self.min_backoff > self.max_backoff {
            return Err(ConfigError {
                name: "min_backoff",
                value: format!("{:?} > {:?}", self.min_backoff, self.max_backoff),
            });
        }
        if self.max_packet_size == 0 || self.max_packet_size > i32::MAX as usize {
            return Err(ConfigError {
                name: "max_packet_size",
                value: self.max_packet_size.to_string(),
            });
        }
        if self.read_buffer == 0 {
            return Err(ConfigError {
                name: "read_buffer",
                value: self.read_buffer.to_string(),
            });
        }
        if self.max_outgoing == 0 {
            return Err(ConfigError {
                name: "max_outgoing",
                value: self.max_outgoing.to_string(),
            });
        }
        Ok(())
    }
}
