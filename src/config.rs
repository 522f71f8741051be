//! Router configuration file

use anyhow::{Context, Result};
use routeway_router::LoadBalance;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub listen_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    #[serde(with = "humane_duration")]
    pub prune_stale_droplets_interval: Duration,
    #[serde(with = "humane_duration")]
    pub droplet_stale_threshold: Duration,
    /// Zero disables the per-attempt deadline
    #[serde(with = "humane_duration")]
    pub endpoint_timeout: Duration,
    #[serde(with = "humane_duration")]
    pub dial_timeout: Duration,
    #[serde(with = "humane_duration")]
    pub retry_after_failure: Duration,
    #[serde(with = "humane_duration")]
    pub drain_wait: Duration,
    pub trace_key: String,
    pub router_ip: String,
    pub secure_cookies: bool,
    pub load_balance: LoadBalance,
    pub health_check_user_agent: String,
    pub log_level: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            admin_addr: SocketAddr::from(([127, 0, 0, 1], 8082)),
            prune_stale_droplets_interval: Duration::from_secs(30),
            droplet_stale_threshold: Duration::from_secs(120),
            endpoint_timeout: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(5),
            retry_after_failure: Duration::from_secs(10),
            drain_wait: Duration::ZERO,
            trace_key: String::new(),
            router_ip: String::new(),
            secure_cookies: false,
            load_balance: LoadBalance::RoundRobin,
            health_check_user_agent: "HTTP-Monitor/1.1".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl RouterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: RouterConfig = serde_yaml::from_str(contents)?;
        if config.prune_stale_droplets_interval.is_zero() {
            anyhow::bail!("prune_stale_droplets_interval must be positive");
        }
        Ok(config)
    }
}

/// Parse `500ms`, `30s`, `2m` or `1h`; a bare number is seconds
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {:?}", value))?;

    let seconds_per_unit = match unit.trim() {
        "ms" => return Ok(Duration::from_millis(number)),
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        other => return Err(format!("unknown duration unit {:?} in {:?}", other, value)),
    };
    number
        .checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration out of range: {:?}", value))
}

mod humane_duration {
    use serde::de::{self, Deserializer};
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text).map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_when_empty() {
        let config = RouterConfig::from_yaml("{}").unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8081".parse().unwrap());
        assert_eq!(config.prune_stale_droplets_interval, Duration::from_secs(30));
        assert_eq!(config.droplet_stale_threshold, Duration::from_secs(120));
        assert_eq!(config.load_balance, LoadBalance::RoundRobin);
        assert_eq!(config.health_check_user_agent, "HTTP-Monitor/1.1");
    }

    #[test]
    fn test_humane_durations() {
        let config = RouterConfig::from_yaml(
            "droplet_stale_threshold: 2m\nendpoint_timeout: 0\ndial_timeout: 1500ms\ndrain_wait: \"1h\"\n",
        )
        .unwrap();
        assert_eq!(config.droplet_stale_threshold, Duration::from_secs(120));
        assert_eq!(config.endpoint_timeout, Duration::ZERO);
        assert_eq!(config.dial_timeout, Duration::from_millis(1500));
        assert_eq!(config.drain_wait, Duration::from_secs(3600));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(RouterConfig::from_yaml("dial_timeout: 5 fortnights").is_err());
        assert!(RouterConfig::from_yaml("prune_stale_droplets_interval: 0").is_err());
        assert!(RouterConfig::from_yaml("load_balance: random").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listen_addr: 127.0.0.1:9000").unwrap();
        writeln!(file, "load_balance: least-connection").unwrap();
        writeln!(file, "trace_key: abc").unwrap();

        let config = RouterConfig::load(file.path()).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.load_balance, LoadBalance::LeastConnection);
        assert_eq!(config.trace_key, "abc");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("45"), Ok(Duration::from_secs(45)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("3d").is_err());
    }

    #[test]
    fn test_parse_duration_overflow() {
        assert!(parse_duration("18446744073709551615h").is_err());
        assert!(parse_duration("307445734561825861m").is_err());
        assert_eq!(
            parse_duration("18446744073709551615s"),
            Ok(Duration::from_secs(u64::MAX))
        );
        assert!(RouterConfig::from_yaml("drain_wait: 18446744073709551615h").is_err());
    }
}
