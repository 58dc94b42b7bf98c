use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hyper::header::{HeaderName, HeaderValue, PROXY_AUTHORIZATION};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, RotaError};

/// Upstream proxy scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    Http,
    Https,
    Socks4,
    Socks4a,
    Socks5,
}

impl ProxyScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
            ProxyScheme::Socks4 => "socks4",
            ProxyScheme::Socks4a => "socks4a",
            ProxyScheme::Socks5 => "socks5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(ProxyScheme::Http),
            "https" => Some(ProxyScheme::Https),
            "socks4" => Some(ProxyScheme::Socks4),
            "socks4a" => Some(ProxyScheme::Socks4a),
            "socks5" | "socks5h" => Some(ProxyScheme::Socks5),
            _ => None,
        }
    }

    /// Schemes a rotating connection knows how to build a connection for
    pub fn is_supported(&self) -> bool {
        matches!(
            self,
            ProxyScheme::Http | ProxyScheme::Https | ProxyScheme::Socks5
        )
    }

    pub fn is_socks(&self) -> bool {
        matches!(
            self,
            ProxyScheme::Socks4 | ProxyScheme::Socks4a | ProxyScheme::Socks5
        )
    }

    pub fn default_port(&self) -> u16 {
        match self {
            ProxyScheme::Http => 80,
            ProxyScheme::Https => 443,
            ProxyScheme::Socks4 | ProxyScheme::Socks4a | ProxyScheme::Socks5 => 1080,
        }
    }
}

impl fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Username/password pair for an upstream proxy
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username_bytes(&self) -> &[u8] {
        self.username.as_bytes()
    }

    pub fn password_bytes(&self) -> &[u8] {
        self.password.as_bytes()
    }

    /// `Basic <base64(username:password)>`
    pub fn basic_auth_header(&self) -> String {
        let credentials = format!("{}:{}", self.username, self.password);
        format!("Basic {}", BASE64.encode(credentials.as_bytes()))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Structured proxy configuration, the non-URL input form.
///
/// Deserializable so proxy lists can be loaded from a JSON file; the TLS
/// override can only be set programmatically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(skip)]
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl ProxyConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// TLS client config used for the connection to the proxy itself
    pub fn with_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// Any of the accepted forms of a proxy
#[derive(Debug, Clone)]
pub enum ProxyInput {
    Url(String),
    Config(ProxyConfig),
    Descriptor(ProxyDescriptor),
}

impl From<&str> for ProxyInput {
    fn from(url: &str) -> Self {
        ProxyInput::Url(url.to_string())
    }
}

impl From<String> for ProxyInput {
    fn from(url: String) -> Self {
        ProxyInput::Url(url)
    }
}

impl From<Url> for ProxyInput {
    fn from(url: Url) -> Self {
        ProxyInput::Url(url.to_string())
    }
}

impl From<ProxyConfig> for ProxyInput {
    fn from(config: ProxyConfig) -> Self {
        ProxyInput::Config(config)
    }
}

impl From<ProxyDescriptor> for ProxyInput {
    fn from(descriptor: ProxyDescriptor) -> Self {
        ProxyInput::Descriptor(descriptor)
    }
}

/// Normalized, validated upstream proxy
#[derive(Clone)]
pub struct ProxyDescriptor {
    scheme: ProxyScheme,
    host: String,
    port: u16,
    target: String,
    credentials: Option<Credentials>,
    headers: Vec<(HeaderName, HeaderValue)>,
    proxy_tls: Option<Arc<rustls::ClientConfig>>,
}

impl ProxyDescriptor {
    /// Normalize any accepted proxy form into a descriptor
    pub fn cast(input: impl Into<ProxyInput>) -> Result<Self> {
        match input.into() {
            ProxyInput::Descriptor(descriptor) => Ok(descriptor),
            ProxyInput::Url(url) => Self::from_config(ProxyConfig::new(url)),
            ProxyInput::Config(config) => Self::from_config(config),
        }
    }

    fn from_config(config: ProxyConfig) -> Result<Self> {
        let url = Url::parse(config.url.trim()).map_err(|e| {
            RotaError::InvalidProxyAddress(format!("Invalid proxy URL '{}': {}", config.url, e))
        })?;

        let scheme = ProxyScheme::from_str(url.scheme())
            .ok_or_else(|| RotaError::UnsupportedProtocol(url.scheme().to_string()))?;

        let host = url.host_str().ok_or_else(|| {
            RotaError::InvalidProxyAddress(format!("Proxy URL '{}' must include a host", config.url))
        })?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        let port = url.port().unwrap_or_else(|| scheme.default_port());

        let target = if url.path().is_empty() {
            "/".to_string()
        } else {
            url.path().to_string()
        };

        // Explicit auth wins over URL userinfo.
        let credentials = match (config.username, config.password) {
            (Some(username), password) => Some(Credentials::new(username, password.unwrap_or_default())),
            (None, Some(_)) => {
                return Err(RotaError::InvalidConfig(format!(
                    "Proxy '{}' has a password but no username",
                    url.host_str().unwrap_or_default()
                )))
            }
            (None, None) if !url.username().is_empty() => Some(Credentials::new(
                decode_userinfo(url.username())?,
                decode_userinfo(url.password().unwrap_or(""))?,
            )),
            _ => None,
        };

        let headers = config
            .headers
            .iter()
            .map(|(name, value)| {
                let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                    RotaError::InvalidConfig(format!("Invalid proxy header name '{}': {}", name, e))
                })?;
                let value = HeaderValue::from_str(value).map_err(|e| {
                    RotaError::InvalidConfig(format!("Invalid proxy header value: {}", e))
                })?;
                Ok((name, value))
            })
            .collect::<Result<Vec<_>>>()?;

        Self::new(
            scheme,
            host.to_string(),
            port,
            target,
            credentials,
            headers,
            config.tls,
        )
    }

    /// Build a descriptor from already-parsed parts.
    ///
    /// When credentials are present the `Proxy-Authorization` header is
    /// derived from them and placed first.
    pub fn new(
        scheme: ProxyScheme,
        host: String,
        port: u16,
        target: String,
        credentials: Option<Credentials>,
        mut headers: Vec<(HeaderName, HeaderValue)>,
        proxy_tls: Option<Arc<rustls::ClientConfig>>,
    ) -> Result<Self> {
        if scheme == ProxyScheme::Http && proxy_tls.is_some() {
            return Err(RotaError::InvalidConfig(
                "a proxy TLS config is not allowed for the http scheme".into(),
            ));
        }

        if host.is_empty() {
            return Err(RotaError::InvalidProxyAddress("proxy host is empty".into()));
        }

        if let Some(credentials) = &credentials {
            let value = HeaderValue::from_str(&credentials.basic_auth_header()).map_err(|e| {
                RotaError::InvalidConfig(format!("Invalid proxy credentials: {}", e))
            })?;
            headers.insert(0, (PROXY_AUTHORIZATION, value));
        }

        Ok(Self {
            scheme,
            host,
            port,
            target,
            credentials,
            headers,
            proxy_tls,
        })
    }

    pub fn scheme(&self) -> ProxyScheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Raw username/password bytes, for protocols with structured auth
    pub fn auth(&self) -> Option<(&[u8], &[u8])> {
        self.credentials
            .as_ref()
            .map(|c| (c.username_bytes(), c.password_bytes()))
    }

    /// Headers sent to the proxy, auth header first
    pub fn headers(&self) -> &[(HeaderName, HeaderValue)] {
        &self.headers
    }

    pub fn proxy_tls(&self) -> Option<&Arc<rustls::ClientConfig>> {
        self.proxy_tls.as_ref()
    }

    /// `host:port`, with IPv6 hosts bracketed
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Proxy URL without credentials, safe for logs
    pub fn url(&self) -> String {
        format!("{}://{}", self.scheme, self.authority())
    }
}

impl fmt::Debug for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyDescriptor")
            .field("url", &self.url())
            .field("target", &self.target)
            .field("credentials", &self.credentials)
            .field("headers", &self.headers.len())
            .field("proxy_tls", &self.proxy_tls.is_some())
            .finish()
    }
}

impl fmt::Display for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

fn decode_userinfo(raw: &str) -> Result<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| RotaError::InvalidProxyAddress(format!("Invalid proxy credentials: {}", e)))
}
