/*! User settings: names, domains, and cross-validation.

Set-requests arrive as `(name, string value)` pairs from MQTT in
production or from a terminal in testing. Each value is parsed against
the domain of its setting; some names are synthetic and expand into
several real fields. A whole pending batch is then cross-validated,
because some settings only make sense together.
 */
use chrono::Timelike;
use log::debug;

use crate::schema::{EL_POWER_LEVELS, ENERGY_MIXES, HEATING_MODES, StatusMap, Value};
use crate::{Error, Result};

/// Defaults used when cross-validation has to fill in the other half of
/// an interdependent pair, plus the timezone for `clock=now`.
#[derive(Debug, Clone)]
pub struct Defaults {
    /// Mode to use when a room temperature arrives without one.
    pub heating_mode: &'static str,
    /// Watts to use when an energy mix arrives without a power level.
    pub el_power_level: u16,
    /// Fixed UTC offset in minutes; the OS local time when unset.
    pub utc_offset_minutes: Option<i32>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            heating_mode: "eco",
            el_power_level: 900,
            utc_offset_minutes: None,
        }
    }
}

fn to_static(table: &'static [&'static str], v: &str) -> Option<&'static str> {
    table.iter().find(|&&n| n == v).copied()
}

fn int(key: &str, value: &str) -> Result<i64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::invalid_setting(key, format!("{value:?} is not an integer")))
}

fn hms(key: &str, name: &str, value: i64, max: i64) -> Result<(&'static str, Value)> {
    if !(0..=max).contains(&value) {
        return Err(Error::invalid_setting(
            key,
            format!("{name} {value} out of range 0..={max}"),
        ));
    }
    // The three wall_time field names are statics in the clock schema.
    let name = match name {
        "hours" => "wall_time_hours",
        "minutes" => "wall_time_minutes",
        _ => "wall_time_seconds",
    };
    Ok((name, Value::Uint(value as u32)))
}

fn local_hms(defaults: &Defaults) -> Result<(i64, i64, i64)> {
    let (h, m, s) = match defaults.utc_offset_minutes {
        Some(minutes) => {
            let offset = chrono::FixedOffset::east_opt(minutes * 60).ok_or_else(|| {
                Error::invalid_setting("clock", format!("bad UTC offset {minutes} minutes"))
            })?;
            let t = chrono::Utc::now().with_timezone(&offset);
            (t.hour(), t.minute(), t.second())
        }
        None => {
            let t = chrono::Local::now();
            (t.hour(), t.minute(), t.second())
        }
    };
    Ok((i64::from(h), i64::from(m), i64::from(s)))
}

/// Parse one set-request into typed fields.
///
/// Most names map to exactly one field. The synthetic `mode` and
/// `clock` names expand into several.
pub fn parse_request(key: &str, value: &str, defaults: &Defaults) -> Result<Vec<(&'static str, Value)>> {
    let value = value.trim();
    Ok(match key {
        "target_temp_room" => {
            let v = int(key, value)?;
            if v != 0 && !(5..=30).contains(&v) {
                return Err(Error::invalid_setting(key, format!("{v} not 0 or 5..=30 °C")));
            }
            vec![("target_temp_room", Value::Temp(v as f32))]
        }
        "target_temp_water" => {
            let v = int(key, value)?;
            if ![0, 40, 60, 200].contains(&v) {
                return Err(Error::invalid_setting(key, format!("{v} not one of 0, 40, 60, 200 °C")));
            }
            vec![("target_temp_water", Value::Temp(v as f32))]
        }
        "heating_mode" => {
            // "boost" is the label on the CP Plus display for "high".
            let v = if value == "boost" { "high" } else { value };
            let Some(v) = to_static(HEATING_MODES, v) else {
                return Err(Error::invalid_setting(key, format!("unknown mode {value:?}")));
            };
            vec![("heating_mode", Value::Name(v))]
        }
        "energy_mix" => {
            let Some(v) = to_static(ENERGY_MIXES, value) else {
                return Err(Error::invalid_setting(key, format!("unknown energy mix {value:?}")));
            };
            vec![("energy_mix", Value::Name(v))]
        }
        "el_power_level" => {
            let v = int(key, value)?;
            if !EL_POWER_LEVELS.iter().any(|&w| i64::from(w) == v) {
                return Err(Error::invalid_setting(key, format!("{v} not one of 0, 900, 1800 W")));
            }
            vec![("el_power_level", Value::Uint(v as u32))]
        }
        "wall_time_hours" => vec![hms(key, "hours", int(key, value)?, 23)?],
        "wall_time_minutes" => vec![hms(key, "minutes", int(key, value)?, 59)?],
        "wall_time_seconds" => vec![hms(key, "seconds", int(key, value)?, 59)?],
        "mode" => match value {
            "off" => vec![
                ("heating_mode", Value::Name("off")),
                ("target_temp_room", Value::Temp(0.0)),
            ],
            "heat" => vec![("heating_mode", Value::Name(defaults.heating_mode))],
            _ => {
                return Err(Error::invalid_setting(key, format!("{value:?} is not off or heat")));
            }
        },
        "clock" => {
            let (h, m, s) = if value == "now" {
                local_hms(defaults)?
            } else {
                let parts: Vec<_> = value.split(':').collect();
                if parts.len() != 3 {
                    return Err(Error::invalid_setting(key, "want HH:MM:SS or now"));
                }
                (int(key, parts[0])?, int(key, parts[1])?, int(key, parts[2])?)
            };
            vec![
                hms(key, "hours", h, 23)?,
                hms(key, "minutes", m, 59)?,
                hms(key, "seconds", s, 59)?,
            ]
        }
        _ => return Err(Error::invalid_setting(key, "unknown setting")),
    })
}

fn temp_of(map: &StatusMap, key: &str) -> Option<f32> {
    match map.get(key) {
        Some(Value::Temp(v)) => Some(*v),
        _ => None,
    }
}

/// Check the interdependencies of a pending batch, filling in defaults
/// where only one side of a pair was supplied.
///
/// * `energy_mix` other than `none` needs `el_power_level` 900 or 1800.
/// * An `el_power_level` above zero alone selects `electricity`.
/// * `target_temp_room` above zero needs a `heating_mode`; zero turns
///   the heating off.
pub fn cross_validate(pending: &mut StatusMap, defaults: &Defaults) -> Result<()> {
    let mix = match pending.get("energy_mix") {
        Some(Value::Name(n)) => Some(*n),
        _ => None,
    };
    let power = match pending.get("el_power_level") {
        Some(Value::Uint(w)) => Some(*w),
        _ => None,
    };
    match (mix, power) {
        (Some("none"), Some(w)) if w > 0 => {
            return Err(Error::invalid_setting(
                "el_power_level",
                "energy_mix none leaves no electric power to set",
            ));
        }
        (Some(m), Some(0)) if m != "none" => {
            return Err(Error::invalid_setting(
                "energy_mix",
                "requires el_power_level 900 or 1800",
            ));
        }
        (Some(m), None) if m != "none" => {
            debug!("energy_mix without el_power_level, defaulting to {} W", defaults.el_power_level);
            pending.insert("el_power_level", Value::Uint(u32::from(defaults.el_power_level)));
        }
        (None, Some(w)) if w > 0 => {
            debug!("el_power_level without energy_mix, defaulting to electricity");
            pending.insert("energy_mix", Value::Name("electricity"));
        }
        _ => {}
    }

    if let Some(room) = temp_of(pending, "target_temp_room") {
        let mode = match pending.get("heating_mode") {
            Some(Value::Name(n)) => Some(*n),
            _ => None,
        };
        match mode {
            Some("off") if room > 0.0 => {
                return Err(Error::invalid_setting(
                    "target_temp_room",
                    "a room target needs heating_mode other than off",
                ));
            }
            None if room > 0.0 => {
                debug!("room target without heating_mode, defaulting to {}", defaults.heating_mode);
                pending.insert("heating_mode", Value::Name(defaults.heating_mode));
            }
            None => {
                pending.insert("heating_mode", Value::Name("off"));
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Defaults {
        Defaults::default()
    }

    #[test]
    fn parse_room_temp() {
        let d = defaults();
        assert_eq!(
            parse_request("target_temp_room", "20", &d).unwrap(),
            vec![("target_temp_room", Value::Temp(20.0))]
        );
        assert_eq!(
            parse_request("target_temp_room", "0", &d).unwrap(),
            vec![("target_temp_room", Value::Temp(0.0))]
        );
        assert!(parse_request("target_temp_room", "4", &d).is_err());
        assert!(parse_request("target_temp_room", "31", &d).is_err());
        assert!(parse_request("target_temp_room", "warm", &d).is_err());
    }

    #[test]
    fn parse_water_temp() {
        let d = defaults();
        for v in ["0", "40", "60", "200"] {
            assert!(parse_request("target_temp_water", v, &d).is_ok(), "{v}");
        }
        assert!(parse_request("target_temp_water", "50", &d).is_err());
    }

    #[test]
    fn parse_modes() {
        let d = defaults();
        assert_eq!(
            parse_request("heating_mode", "boost", &d).unwrap(),
            vec![("heating_mode", Value::Name("high"))]
        );
        assert!(parse_request("heating_mode", "hot", &d).is_err());
        assert!(parse_request("energy_mix", "diesel", &d).is_err());
        assert!(parse_request("el_power_level", "1000", &d).is_err());
        assert!(parse_request("frobnicate", "1", &d).is_err());
    }

    #[test]
    fn mode_expands() {
        let d = defaults();
        assert_eq!(
            parse_request("mode", "off", &d).unwrap(),
            vec![
                ("heating_mode", Value::Name("off")),
                ("target_temp_room", Value::Temp(0.0)),
            ]
        );
        assert_eq!(
            parse_request("mode", "heat", &d).unwrap(),
            vec![("heating_mode", Value::Name("eco"))]
        );
    }

    #[test]
    fn clock_literal() {
        let d = defaults();
        assert_eq!(
            parse_request("clock", "13:37:09", &d).unwrap(),
            vec![
                ("wall_time_hours", Value::Uint(13)),
                ("wall_time_minutes", Value::Uint(37)),
                ("wall_time_seconds", Value::Uint(9)),
            ]
        );
        assert!(parse_request("clock", "25:00:00", &d).is_err());
        assert!(parse_request("clock", "13:37", &d).is_err());
    }

    #[test]
    fn clock_now_is_in_range() {
        let d = defaults();
        let got = parse_request("clock", "now", &d).unwrap();
        assert_eq!(got.len(), 3);
    }

    #[test]
    fn cross_validate_defaults_power() {
        let d = defaults();
        let mut m = StatusMap::new();
        m.extend(parse_request("energy_mix", "electricity", &d).unwrap());
        cross_validate(&mut m, &d).unwrap();
        assert_eq!(m["el_power_level"], Value::Uint(900));
    }

    #[test]
    fn cross_validate_defaults_mix() {
        let d = defaults();
        let mut m = StatusMap::new();
        m.extend(parse_request("el_power_level", "1800", &d).unwrap());
        cross_validate(&mut m, &d).unwrap();
        assert_eq!(m["energy_mix"], Value::Name("electricity"));
    }

    #[test]
    fn cross_validate_rejects_contradictions() {
        let d = defaults();
        let mut m = StatusMap::new();
        m.extend(parse_request("energy_mix", "gas", &d).unwrap());
        m.extend(parse_request("el_power_level", "0", &d).unwrap());
        assert!(cross_validate(&mut m, &d).is_err());

        let mut m = StatusMap::new();
        m.extend(parse_request("target_temp_room", "20", &d).unwrap());
        m.extend(parse_request("heating_mode", "off", &d).unwrap());
        assert!(cross_validate(&mut m, &d).is_err());
    }

    #[test]
    fn cross_validate_defaults_heating_mode() {
        let d = defaults();
        let mut m = StatusMap::new();
        m.extend(parse_request("target_temp_room", "21", &d).unwrap());
        cross_validate(&mut m, &d).unwrap();
        assert_eq!(m["heating_mode"], Value::Name("eco"));

        let mut m = StatusMap::new();
        m.extend(parse_request("target_temp_room", "0", &d).unwrap());
        cross_validate(&mut m, &d).unwrap();
        assert_eq!(m["heating_mode"], Value::Name("off"));
    }
}
