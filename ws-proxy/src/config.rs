//! Command-line and environment configuration
//!
//! Every setting has a `--flag value` form and a `WS_PROXY_*` environment
//! variable. A flag given on the command line wins over the variable.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::keepalive::{KeepaliveConfig, DEFAULT_PING_INTERVAL, DEFAULT_PING_TIMEOUT};
use crate::server::{ProxySettings, DEFAULT_PATH_PREFIX};

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_CA_CERT: &str = "lib/micronets-ws-root.cert.pem";
pub const DEFAULT_CERT: &str = "lib/micronets-ws-proxy.pkeycert.pem";
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5050;

pub const USAGE: &str = "\
Usage: ws-proxy [options]

  --ca-cert <file>          CA bundle for client certificates     [WS_PROXY_CA_CERT]
  --ca-dir <dir>            directory of CA certificates          [WS_PROXY_CA_DIR]
  --cert <file>             proxy certificate chain (+ key)       [WS_PROXY_CERT]
  --key <file>              proxy private key, if not in --cert   [WS_PROXY_KEY]
  --bind-address <addr>     listen address (default 0.0.0.0)      [WS_PROXY_BIND_ADDRESS]
  --port <port>             listen port (default 5050)            [WS_PROXY_PORT]
  --path-prefix <path>      URL prefix before the meetup ID       [WS_PROXY_PATH_PREFIX]
  --report-interval <secs>  log a registry report; 0 disables     [WS_PROXY_REPORT_INTERVAL]
  --ping-interval <secs>    keepalive ping period; 0 disables     [WS_PROXY_PING_INTERVAL]
  --ping-timeout <secs>     time allowed for a pong               [WS_PROXY_PING_TIMEOUT]
";

// ============================================================================
// Types
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    /// A value did not parse (or is out of range) for its flag
    InvalidValue { flag: &'static str, value: String },
    /// Neither a CA file nor a CA directory was configured
    MissingCa,
    /// The path prefix does not start with '/'
    BadPrefix(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue { flag, value } => {
                write!(f, "invalid value for {}: '{}'", flag, value)
            }
            ConfigError::MissingCa => write!(f, "one of --ca-cert or --ca-dir is required"),
            ConfigError::BadPrefix(prefix) => {
                write!(f, "path prefix must start with '/': '{}'", prefix)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Resolved proxy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub ca_cert: Option<PathBuf>,
    pub ca_dir: Option<PathBuf>,
    pub cert: PathBuf,
    /// `None` when the key is in the `cert` file
    pub key: Option<PathBuf>,
    pub bind_address: String,
    pub port: u16,
    pub path_prefix: String,
    /// Zero disables periodic reports
    pub report_interval: Duration,
    pub keepalive: KeepaliveConfig,
}

// ============================================================================
// Parsing
// ============================================================================

/// Value following `flag` in the argument list
fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn parse_number<T: FromStr>(flag: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { flag, value })
}

/// Fractional seconds, e.g. `10` or `2.5`
fn parse_seconds(flag: &'static str, value: String) -> Result<Duration, ConfigError> {
    let secs: f64 = parse_number(flag, value.clone())?;
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidValue { flag, value })
}

impl Config {
    /// Build the configuration from `args` (program name included) and an
    /// environment lookup.
    pub fn from_args<E>(args: &[String], env: E) -> Result<Config, ConfigError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let setting = |flag: &str, var: &str| parse_arg(args, flag).or_else(|| env(var));

        let ca_cert = match setting("--ca-cert", "WS_PROXY_CA_CERT") {
            Some(path) if path.is_empty() => None,
            Some(path) => Some(PathBuf::from(path)),
            None => Some(PathBuf::from(DEFAULT_CA_CERT)),
        };
        let ca_dir = setting("--ca-dir", "WS_PROXY_CA_DIR")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from);
        if ca_cert.is_none() && ca_dir.is_none() {
            return Err(ConfigError::MissingCa);
        }

        let cert = setting("--cert", "WS_PROXY_CERT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CERT));
        let key = setting("--key", "WS_PROXY_KEY")
            .filter(|key| !key.is_empty())
            .map(PathBuf::from);

        let bind_address = setting("--bind-address", "WS_PROXY_BIND_ADDRESS")
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let port = match setting("--port", "WS_PROXY_PORT") {
            Some(value) => parse_number("--port", value)?,
            None => DEFAULT_PORT,
        };

        let path_prefix = setting("--path-prefix", "WS_PROXY_PATH_PREFIX")
            .unwrap_or_else(|| DEFAULT_PATH_PREFIX.to_string());
        if !path_prefix.starts_with('/') {
            return Err(ConfigError::BadPrefix(path_prefix));
        }

        let report_interval = match setting("--report-interval", "WS_PROXY_REPORT_INTERVAL") {
            Some(value) => parse_seconds("--report-interval", value)?,
            None => Duration::ZERO,
        };
        let interval = match setting("--ping-interval", "WS_PROXY_PING_INTERVAL") {
            Some(value) => parse_seconds("--ping-interval", value)?,
            None => DEFAULT_PING_INTERVAL,
        };
        let timeout = match setting("--ping-timeout", "WS_PROXY_PING_TIMEOUT") {
            Some(value) => {
                let timeout = parse_seconds("--ping-timeout", value.clone())?;
                if timeout.is_zero() {
                    return Err(ConfigError::InvalidValue {
                        flag: "--ping-timeout",
                        value,
                    });
                }
                timeout
            }
            None => DEFAULT_PING_TIMEOUT,
        };

        Ok(Config {
            ca_cert,
            ca_dir,
            cert,
            key,
            bind_address,
            port,
            path_prefix,
            report_interval,
            keepalive: KeepaliveConfig { interval, timeout },
        })
    }

    /// Settings handed to the listener
    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            path_prefix: self.path_prefix.clone(),
            keepalive: self.keepalive.clone(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("ws-proxy")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_args(&args(&[]), no_env).unwrap();

        assert_eq!(config.ca_cert, Some(PathBuf::from("lib/micronets-ws-root.cert.pem")));
        assert_eq!(config.ca_dir, None);
        assert_eq!(config.cert, PathBuf::from("lib/micronets-ws-proxy.pkeycert.pem"));
        assert_eq!(config.key, None);
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.port, 5050);
        assert_eq!(config.path_prefix, "/micronets/v1/ws-proxy/");
        assert_eq!(config.report_interval, Duration::ZERO);
        assert_eq!(config.keepalive, KeepaliveConfig::default());
    }

    #[test]
    fn test_flags() {
        let config = Config::from_args(
            &args(&[
                "--port",
                "6000",
                "--bind-address",
                "127.0.0.1",
                "--ping-interval",
                "2.5",
                "--ping-timeout",
                "4",
                "--report-interval",
                "30",
                "--key",
                "proxy.key.pem",
                "--ca-dir",
                "/etc/ws-proxy/ca",
            ]),
            no_env,
        )
        .unwrap();

        assert_eq!(config.port, 6000);
        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.keepalive.interval, Duration::from_millis(2500));
        assert_eq!(config.keepalive.timeout, Duration::from_secs(4));
        assert_eq!(config.report_interval, Duration::from_secs(30));
        assert_eq!(config.key, Some(PathBuf::from("proxy.key.pem")));
        assert_eq!(config.ca_dir, Some(PathBuf::from("/etc/ws-proxy/ca")));
    }

    #[test]
    fn test_env_fallback() {
        let env = env_from(&[
            ("WS_PROXY_PORT", "7070"),
            ("WS_PROXY_PATH_PREFIX", "/relay/"),
            ("WS_PROXY_PING_INTERVAL", "0"),
        ]);
        let config = Config::from_args(&args(&[]), env).unwrap();

        assert_eq!(config.port, 7070);
        assert_eq!(config.path_prefix, "/relay/");
        assert!(!config.keepalive.is_enabled());
    }

    #[test]
    fn test_flag_wins_over_env() {
        let env = env_from(&[("WS_PROXY_PORT", "7070"), ("WS_PROXY_CERT", "env.pem")]);
        let config = Config::from_args(&args(&["--port", "8080"]), env).unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.cert, PathBuf::from("env.pem"));
    }

    #[test]
    fn test_invalid_port() {
        let err = Config::from_args(&args(&["--port", "http"]), no_env).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { flag: "--port", ref value } if value == "http"
        ));

        let err = Config::from_args(&args(&["--port", "70000"]), no_env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { flag: "--port", .. }));
    }

    #[test]
    fn test_invalid_durations() {
        let err = Config::from_args(&args(&["--ping-interval", "-1"]), no_env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { flag: "--ping-interval", .. }));

        let err = Config::from_args(&args(&["--ping-timeout", "0"]), no_env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { flag: "--ping-timeout", .. }));

        let err = Config::from_args(&args(&["--report-interval", "soon"]), no_env).unwrap_err();
        assert_eq!(err.to_string(), "invalid value for --report-interval: 'soon'");
    }

    #[test]
    fn test_prefix_must_be_absolute() {
        let err = Config::from_args(&args(&["--path-prefix", "relay/"]), no_env).unwrap_err();
        assert!(matches!(err, ConfigError::BadPrefix(_)));
    }

    #[test]
    fn test_missing_ca() {
        let err = Config::from_args(&args(&["--ca-cert", ""]), no_env).unwrap_err();
        assert!(matches!(err, ConfigError::MissingCa));

        let config = Config::from_args(&args(&["--ca-cert", "", "--ca-dir", "ca"]), no_env).unwrap();
        assert_eq!(config.ca_cert, None);
    }

    #[test]
    fn test_proxy_settings() {
        let config = Config::from_args(&args(&["--path-prefix", "/relay/"]), no_env).unwrap();
        let settings = config.proxy_settings();
        assert_eq!(settings.path_prefix, "/relay/");
        assert_eq!(settings.keepalive, config.keepalive);
    }
}
