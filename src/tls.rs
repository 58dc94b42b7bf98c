//! TLS client configuration for destinations and proxies
//!
//! Builds the shared rustls config from verify/cert/trust-env options.

use std::env;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, warn};

use crate::error::{Result, RotaError};

/// Server certificate verification mode
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Verify {
    /// Verify against the platform trust store
    #[default]
    Enabled,
    /// Accept any certificate
    Disabled,
    /// Verify against the CA certificates in a PEM file
    CaBundle(PathBuf),
}

/// Client certificate for mutual TLS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCert {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOptions {
    pub verify: Verify,
    pub cert: Option<ClientCert>,
    /// Honor `SSL_CERT_FILE` / `SSL_CERT_DIR`
    pub trust_env: bool,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            verify: Verify::Enabled,
            cert: None,
            trust_env: true,
        }
    }
}

impl TlsOptions {
    /// Build the rustls client config described by these options
    pub fn build_client_config(&self) -> Result<ClientConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?;

        let builder = match &self.verify {
            Verify::Disabled => {
                warn!("TLS certificate verification disabled");
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier))
            }
            Verify::Enabled => builder.with_root_certificates(self.root_store(None)?),
            Verify::CaBundle(path) => builder.with_root_certificates(self.root_store(Some(path))?),
        };

        let config = match &self.cert {
            Some(client_cert) => {
                let certs = load_certs(&client_cert.cert)?;
                let key = load_private_key(&client_cert.key)?;
                builder.with_client_auth_cert(certs, key)?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(config)
    }

    fn root_store(&self, bundle: Option<&Path>) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();

        if let Some(path) = bundle {
            for cert in load_certs(path)? {
                roots.add(cert)?;
            }
            return Ok(roots);
        }

        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            debug!("Skipping native certificate: {}", err);
        }
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        debug!(added, ignored, "Loaded native root certificates");

        if self.trust_env {
            if let Ok(path) = env::var("SSL_CERT_FILE") {
                for cert in load_certs(Path::new(&path))? {
                    roots.add(cert)?;
                }
            }
            if let Some(dirs) = env::var_os("SSL_CERT_DIR") {
                for dir in env::split_paths(&dirs) {
                    let certs = load_cert_dir(&dir)?;
                    let (added, ignored) = roots.add_parsable_certificates(certs);
                    debug!(
                        dir = %dir.display(),
                        added,
                        ignored,
                        "Loaded SSL_CERT_DIR certificates"
                    );
                }
            }
        }

        Ok(roots)
    }
}

/// Derive a config advertising the enabled HTTP versions over ALPN
pub fn with_alpn(config: &ClientConfig, http1: bool, http2: bool) -> Arc<ClientConfig> {
    let mut config = config.clone();
    config.alpn_protocols.clear();
    if http2 {
        config.alpn_protocols.push(b"h2".to_vec());
    }
    if http1 {
        config.alpn_protocols.push(b"http/1.1".to_vec());
    }
    Arc::new(config)
}

/// Parse a DNS name or IP address for SNI and verification
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| RotaError::InvalidRequest(format!("Invalid TLS server name '{}': {}", host, e)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        RotaError::Tls(format!("Failed to open certificate file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| RotaError::Tls(format!("Invalid PEM in {}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(RotaError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Certificates from every PEM file in a directory; unreadable files are skipped
fn load_cert_dir(dir: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        RotaError::Tls(format!(
            "Failed to read certificate directory {}: {}",
            dir.display(),
            e
        ))
    })?;

    let mut certs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match load_certs(&path) {
            Ok(found) => certs.extend(found),
            Err(e) => debug!("Skipping {}: {}", path.display(), e),
        }
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        RotaError::Tls(format!("Failed to open key file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| RotaError::Tls(format!("Invalid PEM in {}: {}", path.display(), e)))?
        .ok_or_else(|| RotaError::Tls(format!("No private key found in {}", path.display())))
}

/// Accepts any server certificate (`Verify::Disabled`)
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insecure() -> TlsOptions {
        TlsOptions {
            verify: Verify::Disabled,
            cert: None,
            trust_env: false,
        }
    }

    #[test]
    fn test_disabled_verification_builds() {
        let config = insecure().build_client_config().unwrap();
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn test_with_alpn_orders_h2_first() {
        let config = insecure().build_client_config().unwrap();

        let both = with_alpn(&config, true, true);
        assert_eq!(both.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);

        let h1 = with_alpn(&config, true, false);
        assert_eq!(h1.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_cert_dir_skips_non_pem_files() {
        let dir = env::temp_dir().join(format!("rota-cert-dir-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        std::fs::write(dir.join("local.pem"), generated.cert.pem()).unwrap();
        std::fs::write(dir.join("README"), "not a certificate").unwrap();
        std::fs::create_dir_all(dir.join("nested")).unwrap();

        let certs = load_cert_dir(&dir).unwrap();
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].as_ref(), generated.cert.der().as_ref());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_cert_dir_is_tls_error() {
        let err = load_cert_dir(Path::new("/nonexistent/certs")).unwrap_err();
        assert!(matches!(err, RotaError::Tls(_)));
    }

    #[test]
    fn test_missing_ca_bundle_is_tls_error() {
        let options = TlsOptions {
            verify: Verify::CaBundle(PathBuf::from("/nonexistent/ca.pem")),
            ..insecure()
        };
        let err = options.build_client_config().unwrap_err();
        assert!(matches!(err, RotaError::Tls(_)));
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_server_name_accepts_dns_and_ip() {
        assert!(server_name("example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("::1").is_ok());
        assert!(server_name("bad name").is_err());
    }
}
