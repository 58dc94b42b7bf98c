use std::fmt;

use hyper::Uri;

use crate::error::{Result, RotaError};

/// Destination scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OriginScheme {
    Http,
    Https,
}

impl OriginScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            OriginScheme::Http => "http",
            OriginScheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            OriginScheme::Http => 80,
            OriginScheme::Https => 443,
        }
    }
}

/// The `(scheme, host, port)` a request is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    pub scheme: OriginScheme,
    pub host: String,
    pub port: u16,
}

impl Origin {
    pub fn new(scheme: OriginScheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// Extract the origin of an absolute request URI
    pub fn from_uri(uri: &Uri) -> Result<Self> {
        let scheme = match uri.scheme_str() {
            Some(s) if s.eq_ignore_ascii_case("https") => OriginScheme::Https,
            Some(s) if s.eq_ignore_ascii_case("http") => OriginScheme::Http,
            Some(other) => {
                return Err(RotaError::InvalidRequest(format!(
                    "Unsupported URL scheme: {}",
                    other
                )))
            }
            None => {
                return Err(RotaError::InvalidRequest(format!(
                    "Request URI must be absolute: {}",
                    uri
                )))
            }
        };

        let host = uri
            .host()
            .ok_or_else(|| RotaError::InvalidRequest("Missing host in URI".to_string()))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());

        Ok(Self::new(scheme, host.to_ascii_lowercase(), port))
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == OriginScheme::Https
    }

    /// `host:port`, with IPv6 hosts bracketed
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Value for the `Host` header, omitting the default port
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            if self.host.contains(':') {
                format!("[{}]", self.host)
            } else {
                self.host.clone()
            }
        } else {
            self.authority()
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.authority())
    }
}
