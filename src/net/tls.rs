//! TLS configuration and certificate loading.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;

use crate::config::ConfigError;

/// Load TLS configuration from certificate and key files.
///
/// Synchronous so it can run before daemonizing and before the runtime
/// exists; every failure is a configuration error.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig, ConfigError> {
    let certs = {
        let file = File::open(cert_path).map_err(|e| {
            ConfigError::Tls(format!("certificate {}: {}", cert_path.display(), e))
        })?;
        rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ConfigError::Tls(format!("certificate {}: {}", cert_path.display(), e)))?
    };
    if certs.is_empty() {
        return Err(ConfigError::Tls(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key = {
        let file = File::open(key_path)
            .map_err(|e| ConfigError::Tls(format!("private key {}: {}", key_path.display(), e)))?;
        rustls_pemfile::private_key(&mut BufReader::new(file))
            .map_err(|e| ConfigError::Tls(format!("private key {}: {}", key_path.display(), e)))?
            .ok_or_else(|| {
                ConfigError::Tls(format!("no private key found in {}", key_path.display()))
            })?
    };

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut server_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::Tls(e.to_string()))?;
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(RustlsConfig::from_config(Arc::new(server_config)))
}

/// Write a self-signed `localhost` certificate and key into `dir`.
#[cfg(test)]
pub(crate) fn write_test_material(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let rcgen::CertifiedKey { cert, signing_key } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, signing_key.serialize_pem()).unwrap();
    (cert_path, key_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn self_signed_material_loads() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_test_material(dir.path());
        assert!(load_tls_config(&cert, &key).is_ok());
    }

    #[test]
    fn key_without_certificate_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_, key) = write_test_material(dir.path());
        let err = load_tls_config(&key, &key).unwrap_err();
        assert!(matches!(err, ConfigError::Tls(ref m) if m.contains("no certificates")));
    }

    #[test]
    fn missing_certificate_is_config_error() {
        let err = load_tls_config(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Tls(ref m) if m.contains("/nonexistent/cert.pem")));
    }

    #[test]
    fn non_pem_certificate_is_config_error() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        writeln!(cert, "this is not a certificate").unwrap();
        let key = tempfile::NamedTempFile::new().unwrap();

        let err = load_tls_config(cert.path(), key.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Tls(ref m) if m.contains("no certificates")));
    }
}
