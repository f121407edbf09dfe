use std::{env, str::FromStr, time::Duration};

use super::AgentError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Capacity of a packet under construction.
    pub packet_size: usize,
    /// The packet is flushed once less than this is left.
    pub max_message_size: usize,
    /// Largest payload of a single metapacket.
    pub chunk_size: usize,
    /// How many spare packet buffers are kept for reuse.
    pub free_list_size: usize,
    pub clock_tick: Duration,
    /// Events allowed on the same coarse tick before the clock is read precisely.
    pub max_same_tick: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            packet_size: 4096,
            max_message_size: 256,
            chunk_size: 0x10000,
            free_list_size: 8,
            clock_tick: Duration::from_millis(1),
            max_same_tick: 64,
        }
    }
}

fn var<T>(name: &'static str) -> Result<Option<T>, AgentError>
where
    T: FromStr,
{
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| AgentError::InvalidConfig { name, value }),
        Err(_) => Ok(None),
    }
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, AgentError> {
        let mut config = AgentConfig::default();
        if let Some(v) = var("TRACE_PACKET_SIZE")? {
            config.packet_size = v;
        }
        if let Some(v) = var("TRACE_CHUNK_SIZE")? {
            config.chunk_size = v;
        }
        if let Some(v) = var("TRACE_CLOCK_TICK_US")? {
            config.clock_tick = Duration::from_micros(v);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.packet_size <= self.max_message_size {
            return Err(AgentError::InvalidConfig {
                name: "packet_size",
                value: self.packet_size.to_string(),
            });
        }
        if self.chunk_size == 0 || self.chunk_size > i32::MAX as usize {
            return Err(AgentError::InvalidConfig {
                name: "chunk_size",
                value: self.chunk_size.to_string(),
            });
        }
        if self.clock_tick.is_zero() {
            return Err(AgentError::InvalidConfig {
                name: "clock_tick",
                value: format!("{:?}", self.clock_tick),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::AgentConfig;

    #[test]
    fn default_is_valid() {
        AgentConfig::default().validate().unwrap();
    }

    #[test]
    fn packet_must_fit_a_message() {
        let config = AgentConfig {
            packet_size: 128,
            ..AgentConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
