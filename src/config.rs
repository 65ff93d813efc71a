//! Process settings, read once from `CLINIC_*` environment variables.

use std::fmt;
use std::path::PathBuf;

use crate::limits::{DEFAULT_APPOINTMENT_MINUTES, MAX_APPOINTMENT_MINUTES, MINUTE_MS};
use crate::model::Ms;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    /// PostgreSQL-protocol console port.
    pub port: u16,
    /// `None` when the HTTP API is switched off.
    pub http_port: Option<u16>,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// Certificate and key paths.
    pub tls: Option<(PathBuf, PathBuf)>,
    pub appointment_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String, reason: String },
    TlsPair,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { var, value, reason } => {
                write!(f, "{var}={value:?} is invalid: {reason}")
            }
            ConfigError::TlsPair => {
                write!(f, "both CLINIC_TLS_CERT and CLINIC_TLS_KEY must be set, or neither")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset and empty variables take their
    /// defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let http_port = match get("CLINIC_HTTP_PORT") {
            Some(v) if v.eq_ignore_ascii_case("off") => None,
            Some(v) => Some(parse("CLINIC_HTTP_PORT", &v)?),
            None => Some(8080),
        };

        let tls = match (get("CLINIC_TLS_CERT"), get("CLINIC_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some((PathBuf::from(cert), PathBuf::from(key))),
            _ => return Err(ConfigError::TlsPair),
        };

        let appointment_minutes = match get("CLINIC_APPOINTMENT_MINUTES") {
            Some(v) => {
                let minutes: u32 = parse("CLINIC_APPOINTMENT_MINUTES", &v)?;
                if !(1..=MAX_APPOINTMENT_MINUTES).contains(&minutes) {
                    return Err(ConfigError::Invalid {
                        var: "CLINIC_APPOINTMENT_MINUTES",
                        value: v,
                        reason: format!("must be between 1 and {MAX_APPOINTMENT_MINUTES}"),
                    });
                }
                minutes
            }
            None => DEFAULT_APPOINTMENT_MINUTES,
        };

        let max_connections = match get("CLINIC_MAX_CONNECTIONS") {
            Some(v) => match parse::<usize>("CLINIC_MAX_CONNECTIONS", &v)? {
                0 => {
                    return Err(ConfigError::Invalid {
                        var: "CLINIC_MAX_CONNECTIONS",
                        value: v,
                        reason: "must be at least 1".into(),
                    });
                }
                n => n,
            },
            None => 256,
        };

        Ok(Config {
            bind: get("CLINIC_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: get("CLINIC_PORT").map_or(Ok(5433), |v| parse("CLINIC_PORT", &v))?,
            http_port,
            data_dir: PathBuf::from(get("CLINIC_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("CLINIC_PASSWORD").unwrap_or_else(|| "clinic".into()),
            max_connections,
            compact_threshold: get("CLINIC_COMPACT_THRESHOLD")
                .map_or(Ok(1000), |v| parse("CLINIC_COMPACT_THRESHOLD", &v))?,
            metrics_port: get("CLINIC_METRICS_PORT")
                .map(|v| parse("CLINIC_METRICS_PORT", &v))
                .transpose()?,
            tls,
            appointment_minutes,
        })
    }

    /// Length given to every new appointment.
    pub fn appointment_ms(&self) -> Ms {
        Ms::from(self.appointment_minutes) * MINUTE_MS
    }
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.port, 5433);
        assert_eq!(config.http_port, Some(8080));
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.password, "clinic");
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.tls, None);
        assert_eq!(config.appointment_ms(), 30 * 60_000);
    }

    #[test]
    fn overrides() {
        let config = load(&[
            ("CLINIC_PORT", "6543"),
            ("CLINIC_HTTP_PORT", "off"),
            ("CLINIC_METRICS_PORT", "9000"),
            ("CLINIC_APPOINTMENT_MINUTES", "45"),
            ("CLINIC_TLS_CERT", "/etc/clinic/cert.pem"),
            ("CLINIC_TLS_KEY", "/etc/clinic/key.pem"),
            ("CLINIC_PASSWORD", ""),
        ])
        .unwrap();
        assert_eq!(config.port, 6543);
        assert_eq!(config.http_port, None);
        assert_eq!(config.metrics_port, Some(9000));
        assert_eq!(config.appointment_ms(), 45 * 60_000);
        assert!(config.tls.is_some());
        // Empty means unset.
        assert_eq!(config.password, "clinic");
    }

    #[test]
    fn tls_needs_both_files() {
        assert_eq!(
            load(&[("CLINIC_TLS_CERT", "cert.pem")]),
            Err(ConfigError::TlsPair)
        );
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = load(&[("CLINIC_PORT", "fifty")]).unwrap_err();
        assert!(err.to_string().starts_with("CLINIC_PORT=\"fifty\""), "{err}");

        let err = load(&[("CLINIC_APPOINTMENT_MINUTES", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "CLINIC_APPOINTMENT_MINUTES", .. }));

        let err = load(&[("CLINIC_APPOINTMENT_MINUTES", "1441")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "CLINIC_APPOINTMENT_MINUTES", .. }));

        assert!(load(&[("CLINIC_MAX_CONNECTIONS", "0")]).is_err());
    }
}
