// Typed configuration parsed from a flat key/value table. Loading that
// table from a file or the environment is out of scope; this module only
// owns the parse-and-validate layer: validated, typed settings structs with
// `Default` impls rather than raw maps threaded everywhere.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::EndpointId;

/// Application identity and version gate used by the acceptor's
/// compatibility check.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApplicationVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Default for ApplicationVersion {
    fn default() -> Self {
        Self {
            major: 0,
            minor: 0,
            patch: 0,
        }
    }
}

impl ApplicationVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl std::str::FromStr for ApplicationVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        let bad = || ConfigError::Invalid {
            key: "endpoint.application.version",
            reason: format!("expected 'major.minor.patch', got '{s}'"),
        };
        if parts.len() != 3 {
            return Err(bad());
        }
        let major = parts[0].parse().map_err(|_| bad())?;
        let minor = parts[1].parse().map_err(|_| bad())?;
        let patch = parts[2].parse().map_err(|_| bad())?;
        Ok(Self { major, minor, patch })
    }
}

/// Batch/timeout/retry tuning for the replication pipeline, one shared
/// instance per endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    pub write_batch_size: usize,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
    pub remote_read_timeout: Duration,
    pub remote_scan_limit: usize,
    pub retry_delay: Duration,
    pub failure_detection_limit: Duration,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            write_batch_size: 64,
            write_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            remote_read_timeout: Duration::from_secs(10),
            remote_scan_limit: 1_000,
            retry_delay: Duration::from_secs(5),
            failure_detection_limit: Duration::from_secs(60),
        }
    }
}

impl ReplicationSettings {
    /// Enforces "failure_detection_limit >= remote_read_timeout +
    /// retry_delay" so a single request cycle can never trip the detector.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let min = self.remote_read_timeout + self.retry_delay;
        if self.failure_detection_limit < min {
            return Err(ConfigError::FailureDetectionLimitTooLow {
                limit_ms: self.failure_detection_limit.as_millis() as u64,
                min_ms: min.as_millis() as u64,
            });
        }
        Ok(())
    }
}

/// Top-level endpoint configuration: identity plus replication settings.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub endpoint_id: EndpointId,
    /// Raw `"host:port"` entries from `endpoint.connections` (§6). Carries
    /// no peer system name, so `EndpointBuilder` cannot dial these itself;
    /// see its doc comment for how a builder surfaces that gap instead of
    /// silently building an endpoint with no usable connections.
    pub connections: Vec<String>,
    pub application_name: String,
    pub application_version: ApplicationVersion,
    pub settings: ReplicationSettings,
}

impl EndpointConfig {
    /// Parses a flat key/value table. Recognised keys not present fall back
    /// to the documented defaults; `endpoint.id` is the only required key.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let endpoint_id_raw = map
            .get("endpoint.id")
            .ok_or(ConfigError::Missing("endpoint.id"))?;
        let endpoint_id = EndpointId::new(endpoint_id_raw.clone()).map_err(|e| ConfigError::Invalid {
            key: "endpoint.id",
            reason: e.to_string(),
        })?;

        let connections = map
            .get("endpoint.connections")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        let application_name = map
            .get("endpoint.application.name")
            .cloned()
            .unwrap_or_else(|| "default".to_string());

        let application_version = match map.get("endpoint.application.version") {
            Some(v) => v.parse()?,
            None => ApplicationVersion::default(),
        };

        let mut settings = ReplicationSettings::default();
        if let Some(v) = map.get("log.write-batch-size") {
            settings.write_batch_size = parse_usize(v, "log.write-batch-size")?;
        }
        if let Some(v) = map.get("log.write-timeout") {
            settings.write_timeout = parse_duration_ms(v, "log.write-timeout")?;
        }
        if let Some(v) = map.get("log.read-timeout") {
            settings.read_timeout = parse_duration_ms(v, "log.read-timeout")?;
        }
        if let Some(v) = map.get("log.replication.remote-read-timeout") {
            settings.remote_read_timeout = parse_duration_ms(v, "log.replication.remote-read-timeout")?;
        }
        if let Some(v) = map.get("log.replication.remote-scan-limit") {
            settings.remote_scan_limit = parse_usize(v, "log.replication.remote-scan-limit")?;
        }
        if let Some(v) = map.get("log.replication.retry-delay") {
            settings.retry_delay = parse_duration_ms(v, "log.replication.retry-delay")?;
        }
        if let Some(v) = map.get("log.replication.failure-detection-limit") {
            settings.failure_detection_limit =
                parse_duration_ms(v, "log.replication.failure-detection-limit")?;
        }
        settings.validate()?;

        Ok(Self {
            endpoint_id,
            connections,
            application_name,
            application_version,
            settings,
        })
    }
}

fn parse_usize(v: &str, key: &'static str) -> Result<usize, ConfigError> {
    v.parse().map_err(|_| ConfigError::Invalid {
        key,
        reason: format!("expected an integer, got '{v}'"),
    })
}

fn parse_duration_ms(v: &str, key: &'static str) -> Result<Duration, ConfigError> {
    let ms: u64 = v.parse().map_err(|_| ConfigError::Invalid {
        key,
        reason: format!("expected milliseconds as an integer, got '{v}'"),
    })?;
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_endpoint_id() {
        let map = HashMap::new();
        assert!(matches!(
            EndpointConfig::from_map(&map),
            Err(ConfigError::Missing("endpoint.id"))
        ));
    }

    #[test]
    fn rejects_failure_detection_limit_too_low() {
        let mut map = HashMap::new();
        map.insert("endpoint.id".to_string(), "a".to_string());
        map.insert("log.replication.remote-read-timeout".to_string(), "10000".to_string());
        map.insert("log.replication.retry-delay".to_string(), "5000".to_string());
        map.insert("log.replication.failure-detection-limit".to_string(), "1000".to_string());
        assert!(matches!(
            EndpointConfig::from_map(&map),
            Err(ConfigError::FailureDetectionLimitTooLow { .. })
        ));
    }

    #[test]
    fn parses_full_config() {
        let mut map = HashMap::new();
        map.insert("endpoint.id".to_string(), "a".to_string());
        map.insert("endpoint.connections".to_string(), "h1:2552, h2:2552".to_string());
        map.insert("endpoint.application.version".to_string(), "1.2.3".to_string());
        let cfg = EndpointConfig::from_map(&map).unwrap();
        assert_eq!(cfg.connections, vec!["h1:2552", "h2:2552"]);
        assert_eq!(cfg.application_version, ApplicationVersion::new(1, 2, 3));
    }
}
