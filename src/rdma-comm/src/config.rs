use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::slot::WorkRequestType;

/// Sizing and composition of a communicator.
///
/// Every peer of a connection is expected to use the same `max_work_requests`,
/// `max_buffer_size`, and `work_request_types`. One-sided operations address the peer's
/// segments at the offsets of the local layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommunicatorConfig {
    /// Slots per work request type.
    pub max_work_requests: u32,
    /// Segment size in bytes.
    pub max_buffer_size: usize,
    pub work_request_types: Vec<WorkRequestType>,
    /// Capacity of the registered region. Defaults to the exact size of the layout.
    pub region_size: Option<usize>,
    pub cq_poll_batch: usize,
    /// How long close waits for outbound operations in flight.
    pub drain_timeout_ms: u64,
    pub log_level: String,
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        CommunicatorConfig {
            max_work_requests: 128,
            max_buffer_size: 200,
            work_request_types: vec![WorkRequestType::Send, WorkRequestType::Receive],
            region_size: None,
            cq_poll_batch: 32,
            drain_timeout_ms: 1000,
            log_level: String::from("info"),
        }
    }
}

impl CommunicatorConfig {
    pub fn new(config: Option<&str>) -> anyhow::Result<Self> {
        let config: CommunicatorConfig = toml::from_str(config.unwrap_or(""))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::new(Some(&content))
    }

    pub fn with_types(mut self, types: &[WorkRequestType]) -> Self {
        self.work_request_types = types.to_vec();
        self
    }

    #[inline]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    #[inline]
    pub fn has_type(&self, ty: WorkRequestType) -> bool {
        self.work_request_types.contains(&ty)
    }

    /// Bytes covered by all segments.
    pub fn layout_size(&self) -> Result<usize, ConfigError> {
        self.work_request_types
            .len()
            .checked_mul(self.max_work_requests as usize)
            .and_then(|n| n.checked_mul(self.max_buffer_size))
            .ok_or(ConfigError::LayoutOverflow)
    }

    /// Capacity of the region to register.
    pub fn region_capacity(&self) -> Result<usize, ConfigError> {
        let required = self.layout_size()?;
        match self.region_size {
            Some(capacity) if capacity < required => {
                Err(ConfigError::RegionTooSmall { required, capacity })
            }
            Some(capacity) => Ok(capacity),
            None => Ok(required),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        use WorkRequestType::*;

        if self.max_work_requests == 0 {
            return Err(ConfigError::ZeroWorkRequests);
        }
        if self.max_buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        if self.max_buffer_size > u32::MAX as usize {
            return Err(ConfigError::BufferSizeTooLarge(self.max_buffer_size));
        }
        if self.cq_poll_batch == 0 {
            return Err(ConfigError::ZeroPollBatch);
        }
        if self.work_request_types.is_empty() {
            return Err(ConfigError::NoWorkRequestTypes);
        }
        for (i, ty) in self.work_request_types.iter().enumerate() {
            if self.work_request_types[..i].contains(ty) {
                return Err(ConfigError::DuplicateType(*ty));
            }
        }
        if self.has_type(Send) && !self.has_type(Receive) {
            return Err(ConfigError::MissingCounterpart(Send, Receive));
        }
        if self.has_type(Receive) && !self.has_type(Send) {
            return Err(ConfigError::MissingCounterpart(Receive, Send));
        }
        self.region_capacity()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_default() {
        let config = CommunicatorConfig::new(None).unwrap();
        assert_eq!(config, CommunicatorConfig::default());
        assert_eq!(config.layout_size().unwrap(), 2 * 128 * 200);
    }

    #[test]
    fn parse_toml() {
        let config = CommunicatorConfig::new(Some(
            r#"
            max_work_requests = 4
            max_buffer_size = 64
            work_request_types = ["send", "receive", "write", "read"]
            region_size = 8192
            "#,
        ))
        .unwrap();
        assert_eq!(config.max_work_requests, 4);
        assert_eq!(config.work_request_types.len(), 4);
        assert_eq!(config.region_capacity().unwrap(), 8192);
        assert_eq!(config.drain_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(CommunicatorConfig::new(Some("max_wr = 4")).is_err());
    }

    #[test]
    fn invalid_sizing() {
        let config = CommunicatorConfig {
            max_work_requests: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroWorkRequests)));

        let config = CommunicatorConfig {
            max_buffer_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroBufferSize)));

        let config = CommunicatorConfig {
            region_size: Some(1024),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RegionTooSmall {
                required: 51200,
                capacity: 1024
            })
        ));
    }

    #[test]
    fn invalid_composition() {
        use WorkRequestType::*;
        let config = CommunicatorConfig::default();
        assert!(matches!(
            config.clone().with_types(&[]).validate(),
            Err(ConfigError::NoWorkRequestTypes)
        ));
        assert!(matches!(
            config.clone().with_types(&[Send]).validate(),
            Err(ConfigError::MissingCounterpart(Send, Receive))
        ));
        assert!(matches!(
            config.clone().with_types(&[Write, Write]).validate(),
            Err(ConfigError::DuplicateType(Write))
        ));
        assert!(config.with_types(&[Read, Write]).validate().is_ok());
    }
}
