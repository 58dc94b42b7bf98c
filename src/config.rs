use crate::error::{Result, RotaError};
use crate::models::{ProxyConfig, ProxyInput};
use crate::pool::Limits;
use crate::tls::{ClientCert, TlsOptions, Verify};
use crate::transport::{Proxies, TransportConfig};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Client configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream proxies and rotation behavior
    pub proxy: ProxyListConfig,
    /// TLS to destinations and https proxies
    pub tls: TlsOptions,
    /// HTTP versions and pool limits
    pub http: HttpConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyListConfig {
    /// Proxy URLs (comma-separated in `ROTA_PROXIES`)
    pub urls: Vec<String>,
    /// JSON file with an array of proxy entries
    pub file: Option<PathBuf>,
    /// Select a new proxy before every request
    pub always_update: bool,
    /// Retries through a new proxy after a connect failure
    pub retries: u32,
    /// Connect timeout; `None` waits indefinitely
    pub connect_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub http1: bool,
    pub http2: bool,
    pub limits: Limits,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            proxy: ProxyListConfig {
                urls: get_env_or("ROTA_PROXIES", "")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                file: env::var("ROTA_PROXY_FILE")
                    .ok()
                    .filter(|s| !s.trim().is_empty())
                    .map(PathBuf::from),
                always_update: parse_env("ROTA_ALWAYS_UPDATE", "false")?,
                retries: parse_env("ROTA_RETRIES", "0")?,
                connect_timeout: parse_seconds("ROTA_CONNECT_TIMEOUT", "10")?,
            },
            tls: TlsOptions {
                verify: parse_verify()?,
                cert: parse_client_cert()?,
                trust_env: parse_env("ROTA_TRUST_ENV", "true")?,
            },
            http: HttpConfig {
                http1: parse_env("ROTA_HTTP1", "true")?,
                http2: parse_env("ROTA_HTTP2", "false")?,
                limits: Limits {
                    max_connections: parse_optional("ROTA_MAX_CONNECTIONS", "100")?,
                    max_keepalive_connections: parse_optional("ROTA_MAX_KEEPALIVE", "20")?,
                    keepalive_expiry: parse_seconds("ROTA_KEEPALIVE_EXPIRY", "5")?,
                },
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Proxies from `ROTA_PROXIES` followed by the entries of `ROTA_PROXY_FILE`
    pub fn proxies(&self) -> Result<Proxies> {
        let mut inputs: Vec<ProxyInput> = self.proxy.urls.iter().map(|u| u.as_str().into()).collect();

        if let Some(path) = &self.proxy.file {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                RotaError::InvalidConfig(format!("Failed to read {}: {}", path.display(), e))
            })?;
            let entries: Vec<ProxyConfig> = serde_json::from_str(&raw).map_err(|e| {
                RotaError::InvalidConfig(format!("Invalid proxy file {}: {}", path.display(), e))
            })?;
            inputs.extend(entries.into_iter().map(ProxyInput::from));
        }

        Ok(Proxies::List(inputs))
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            always_update: self.proxy.always_update,
            tls: self.tls.clone(),
            http1: self.http.http1,
            http2: self.http.http2,
            limits: self.http.limits,
            retries: self.proxy.retries,
            connect_timeout: self.proxy.connect_timeout,
        }
    }
}

fn parse_verify() -> Result<Verify> {
    let raw = get_env_or("ROTA_VERIFY", "true");
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(Verify::Enabled),
        "false" | "0" | "no" => Ok(Verify::Disabled),
        "" => Err(RotaError::InvalidConfig(
            "ROTA_VERIFY must be true, false or a CA bundle path".into(),
        )),
        _ => Ok(Verify::CaBundle(PathBuf::from(raw.trim()))),
    }
}

fn parse_client_cert() -> Result<Option<ClientCert>> {
    let cert = env::var("ROTA_CLIENT_CERT").ok().filter(|s| !s.is_empty());
    let key = env::var("ROTA_CLIENT_KEY").ok().filter(|s| !s.is_empty());

    match (cert, key) {
        (Some(cert), Some(key)) => Ok(Some(ClientCert {
            cert: PathBuf::from(cert),
            key: PathBuf::from(key),
        })),
        (None, None) => Ok(None),
        _ => Err(RotaError::InvalidConfig(
            "ROTA_CLIENT_CERT and ROTA_CLIENT_KEY must be set together".into(),
        )),
    }
}

/// Parse a variable, failing on malformed values
fn parse_env<T: FromStr>(key: &str, default: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| RotaError::InvalidConfig(format!("{} has an invalid value", key)))
}

/// Like `parse_env`, with `none` meaning unset
fn parse_optional<T: FromStr>(key: &str, default: &str) -> Result<Option<T>> {
    let raw = get_env_or(key, default);
    if raw.trim().eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| RotaError::InvalidConfig(format!("{} must be a number or 'none'", key)))
}

fn parse_seconds(key: &str, default: &str) -> Result<Option<Duration>> {
    let secs: Option<f64> = parse_optional(key, default)?;
    secs.map(|secs| {
        Duration::try_from_secs_f64(secs).map_err(|_| {
            RotaError::InvalidConfig(format!(
                "{} must be a non-negative number of seconds",
                key
            ))
        })
    })
    .transpose()
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
