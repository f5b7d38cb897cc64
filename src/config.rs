use std::{fmt, fs, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::GpioError;

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_sysfs_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => f.write_str("input"),
            Direction::Out => f.write_str("output"),
        }
    }
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn as_sysfs_str(&self) -> &'static str {
        match self {
            Level::Low => "0",
            Level::High => "1",
        }
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high { Level::High } else { Level::Low }
    }
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Edge {
    None,
    Rising,
    Falling,
    Both,
}

impl Default for Edge {
    fn default() -> Self {
        Edge::None
    }
}

impl Edge {
    pub fn as_sysfs_str(&self) -> &'static str {
        match self {
            Edge::None => "none",
            Edge::Rising => "rising",
            Edge::Falling => "falling",
            Edge::Both => "both",
        }
    }

    pub fn from_sysfs_str(s: &str) -> Option<Self> {
        match s.trim() {
            "none" => Some(Edge::None),
            "rising" => Some(Edge::Rising),
            "falling" => Some(Edge::Falling),
            "both" => Some(Edge::Both),
            _ => None,
        }
    }

    /// Whether a `from -> to` level transition fires this trigger.
    pub fn matches(&self, from: Level, to: Level) -> bool {
        match (self, from, to) {
            (Edge::Rising, Level::Low, Level::High) => true,
            (Edge::Falling, Level::High, Level::Low) => true,
            (Edge::Both, a, b) => a != b,
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Polarity {
    #[default]
    Normal,
    Inversed,
}

impl Polarity {
    pub fn as_sysfs_str(&self) -> &'static str {
        match self {
            Polarity::Normal => "normal",
            Polarity::Inversed => "inversed",
        }
    }

    pub fn flipped(&self) -> Self {
        match self {
            Polarity::Normal => Polarity::Inversed,
            Polarity::Inversed => Polarity::Normal,
        }
    }
}

impl From<bool> for Polarity {
    fn from(inverted: bool) -> Self {
        if inverted {
            Polarity::Inversed
        } else {
            Polarity::Normal
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Config {
    /// Root of the sysfs class hierarchy, `gpio/` and `pwm/` live below it.
    pub sysfs_root: PathBuf,
    pub permission_timeout_ms: u64,
    pub permission_poll_ms: u64,
    /// Upper bound on how long the reactor sleeps before rechecking shutdown.
    pub watch_interval_ms: u64,
    pub callback_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys/class"),
            permission_timeout_ms: 1000,
            permission_poll_ms: 100,
            watch_interval_ms: 100,
            callback_workers: 4,
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Config(format!("Failed to read config: {e}")))?;
        let config: Config = serde_json::from_str(&contents)
            .map_err(|e| GpioError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GpioError> {
        if self.callback_workers == 0 {
            return Err(GpioError::Config(
                "callback_workers must be at least 1".into(),
            ));
        }
        if self.watch_interval_ms == 0 || self.watch_interval_ms > u16::MAX as u64 {
            return Err(GpioError::Config(format!(
                "watch_interval_ms must be within 1..={}",
                u16::MAX
            )));
        }
        if self.permission_poll_ms == 0 {
            return Err(GpioError::Config(
                "permission_poll_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn permission_timeout(&self) -> Duration {
        Duration::from_millis(self.permission_timeout_ms)
    }

    pub fn permission_poll(&self) -> Duration {
        Duration::from_millis(self.permission_poll_ms)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: Config =
            serde_json::from_str(r#"{ "sysfs_root": "/tmp/fake-sys", "callback_workers": 2 }"#)
                .expect("valid config");
        assert_eq!(config.sysfs_root, PathBuf::from("/tmp/fake-sys"));
        assert_eq!(config.callback_workers, 2);
        assert_eq!(config.permission_timeout(), Duration::from_secs(1));
        assert_eq!(config.watch_interval(), Duration::from_millis(100));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = Config {
            callback_workers: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(GpioError::Config(_))));
    }

    #[test]
    fn edge_transitions() {
        assert!(Edge::Rising.matches(Level::Low, Level::High));
        assert!(!Edge::Rising.matches(Level::High, Level::Low));
        assert!(Edge::Falling.matches(Level::High, Level::Low));
        assert!(Edge::Both.matches(Level::High, Level::Low));
        assert!(!Edge::Both.matches(Level::High, Level::High));
        assert!(!Edge::None.matches(Level::Low, Level::High));
    }

    #[test]
    fn edge_parses_sysfs_text() {
        assert_eq!(Edge::from_sysfs_str("falling\n"), Some(Edge::Falling));
        assert_eq!(Edge::from_sysfs_str("sideways"), None);
    }
}
