use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Service settings, read from `BOOKD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub in_memory: bool,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub request_timeout: Duration,
    /// Auto-completion sweep period; `None` leaves completion to the parties.
    pub auto_complete_every: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7433,
            data_dir: PathBuf::from("./data"),
            in_memory: false,
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            request_timeout: Duration::from_millis(5000),
            auto_complete_every: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid value for {}: {:?}", self.key, self.value)
    }
}

impl std::error::Error for ConfigError {}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    match raw.trim().parse::<T>() {
        Ok(v) => Ok(Some(v)),
        Err(_) => Err(ConfigError { key, value: raw }),
    }
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<bool>, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let lowered = raw.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError { key, value: raw }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults,
    /// malformed ones are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Config::default();
        let auto_secs: u64 = parse(&lookup, "BOOKD_AUTO_COMPLETE_SECS")?.unwrap_or(0);
        Ok(Config {
            bind: lookup("BOOKD_BIND").unwrap_or(d.bind),
            port: parse(&lookup, "BOOKD_PORT")?.unwrap_or(d.port),
            data_dir: lookup("BOOKD_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            in_memory: parse_bool(&lookup, "BOOKD_IN_MEMORY")?.unwrap_or(d.in_memory),
            max_connections: parse(&lookup, "BOOKD_MAX_CONNECTIONS")?.unwrap_or(d.max_connections),
            compact_threshold: parse(&lookup, "BOOKD_COMPACT_THRESHOLD")?
                .unwrap_or(d.compact_threshold),
            metrics_port: parse(&lookup, "BOOKD_METRICS_PORT")?,
            request_timeout: parse(&lookup, "BOOKD_REQUEST_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.request_timeout),
            auto_complete_every: (auto_secs > 0).then(|| Duration::from_secs(auto_secs)),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let c = from(&[]).unwrap();
        assert_eq!(c, Config::default());
        assert_eq!(c.addr(), "0.0.0.0:7433");
        assert_eq!(c.wal_path(), PathBuf::from("./data/bookings.wal"));
        assert!(c.auto_complete_every.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let c = from(&[
            ("BOOKD_PORT", "9000"),
            ("BOOKD_BIND", "127.0.0.1"),
            ("BOOKD_DATA_DIR", "/var/lib/bookd"),
            ("BOOKD_IN_MEMORY", "yes"),
            ("BOOKD_METRICS_PORT", "9100"),
            ("BOOKD_REQUEST_TIMEOUT_MS", "250"),
            ("BOOKD_AUTO_COMPLETE_SECS", "30"),
        ])
        .unwrap();
        assert_eq!(c.addr(), "127.0.0.1:9000");
        assert_eq!(c.wal_path(), PathBuf::from("/var/lib/bookd/bookings.wal"));
        assert!(c.in_memory);
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.request_timeout, Duration::from_millis(250));
        assert_eq!(c.auto_complete_every, Some(Duration::from_secs(30)));
    }

    #[test]
    fn malformed_values_are_errors() {
        let e = from(&[("BOOKD_PORT", "seventy")]).unwrap_err();
        assert_eq!(e.key, "BOOKD_PORT");
        assert!(from(&[("BOOKD_IN_MEMORY", "maybe")]).is_err());
        assert!(from(&[("BOOKD_MAX_CONNECTIONS", "-1")]).is_err());
    }
}
