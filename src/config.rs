/*! Configuration.

A small JSON file; every field has a default, so an absent file is the
same as `{}`. The production deployment wraps this in its own
provisioning, which is out of scope here.
 */
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::schema::{EL_POWER_LEVELS, HEATING_MODES};
use crate::settings::Defaults;
use crate::slave::NAD_DEFAULT;
use crate::updater::Timing;
use crate::{Error, Result};

/// Emulator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Serial device the LIN transceiver is on.
    pub device: PathBuf,

    /// Node address to start with, before any assignment by the master.
    pub nad: u8,

    /// Debounce window for set-requests, in seconds.
    pub updates_buffer_time: f64,

    /// Seconds to wait for the master's pull before re-warning.
    pub pull_timeout: f64,

    /// Seconds since the last broadcast before the master counts as gone.
    pub online_window: f64,

    /// Heating mode filled in when a temperature arrives alone.
    pub default_heating_mode: String,

    /// Watts filled in when an energy mix arrives alone.
    pub default_el_power_level: u16,

    /// Fixed UTC offset in minutes for `clock=now`. OS local time when
    /// unset.
    pub utc_offset_minutes: Option<i32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".into(),
            nad: NAD_DEFAULT,
            updates_buffer_time: 1.0,
            pull_timeout: 10.0,
            online_window: 30.0,
            default_heating_mode: "eco".to_string(),
            default_el_power_level: 900,
            utc_offset_minutes: None,
        }
    }
}

impl Config {
    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| Error::file_io(e, path))?;
        let config: Config = serde_json::from_str(&data)
            .map_err(|e| Error::Config(path.into(), e.to_string()))?;
        config.validate(path)?;
        debug!("loaded config from {}: {config:?}", path.display());
        Ok(config)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let bad = |msg: String| Err(Error::Config(path.into(), msg));
        if !HEATING_MODES.contains(&self.default_heating_mode.as_str())
            || self.default_heating_mode == "off"
        {
            return bad(format!(
                "default_heating_mode {:?} is not eco or high",
                self.default_heating_mode
            ));
        }
        if !EL_POWER_LEVELS.contains(&self.default_el_power_level)
            || self.default_el_power_level == 0
        {
            return bad(format!(
                "default_el_power_level {} is not 900 or 1800",
                self.default_el_power_level
            ));
        }
        for (name, v) in [
            ("updates_buffer_time", self.updates_buffer_time),
            ("pull_timeout", self.pull_timeout),
            ("online_window", self.online_window),
        ] {
            if !v.is_finite() || v <= 0.0 {
                return bad(format!("{name} must be a positive number of seconds"));
            }
        }
        Ok(())
    }

    /// The cross-validation defaults this config selects.
    #[must_use]
    pub fn defaults(&self) -> Defaults {
        Defaults {
            // validate() pinned the string to a table entry.
            heating_mode: HEATING_MODES
                .iter()
                .find(|&&m| m == self.default_heating_mode)
                .copied()
                .unwrap_or("eco"),
            el_power_level: self.default_el_power_level,
            utc_offset_minutes: self.utc_offset_minutes,
        }
    }

    /// The coordinator timing this config selects.
    #[must_use]
    pub fn timing(&self) -> Timing {
        Timing {
            buffer_time: Duration::from_secs_f64(self.updates_buffer_time),
            pull_timeout: Duration::from_secs_f64(self.pull_timeout),
            online_window: Duration::from_secs_f64(self.online_window),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_when_empty() {
        let c: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(c.nad, 0x03);
        assert_eq!(c.timing().buffer_time, Duration::from_secs(1));
        assert_eq!(c.defaults().heating_mode, "eco");
    }

    #[test]
    fn load_file() {
        let tmpd = tempfile::tempdir().unwrap();
        let path = tmpd.path().join("inetbox.json");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"{{"device": "/dev/ttyAMA0", "updates_buffer_time": 0.5, "default_heating_mode": "high"}}"#
        )
        .unwrap();
        let c = Config::load(&path).unwrap();
        assert_eq!(c.device, PathBuf::from("/dev/ttyAMA0"));
        assert_eq!(c.timing().buffer_time, Duration::from_millis(500));
        assert_eq!(c.defaults().heating_mode, "high");
    }

    #[test]
    fn rejects_nonsense() {
        let tmpd = tempfile::tempdir().unwrap();
        let path = tmpd.path().join("inetbox.json");
        for bad in [
            r#"{"default_heating_mode": "off"}"#,
            r#"{"default_el_power_level": 500}"#,
            r#"{"updates_buffer_time": -1}"#,
            r#"{"no_such_key": 1}"#,
        ] {
            std::fs::write(&path, bad).unwrap();
            assert!(Config::load(&path).is_err(), "{bad}");
        }
    }
}
