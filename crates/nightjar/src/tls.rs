//! TLS context construction.

use rustls_pemfile::{certs, pkcs8_private_keys};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::info;

use crate::error::{Error, Result};

/// Load the certificate chain and private key into a server-side TLS
/// configuration.
///
/// Certificate or key problems are startup-fatal; there is no point
/// accepting on a TLS port that can never finish a handshake. The key must
/// be unencrypted PKCS#8; encrypted keys are not supported.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let cert_file = std::fs::File::open(cert_path).map_err(|e| {
        Error::Tls(format!("couldn't open cert file {}: {}", cert_path.display(), e))
    })?;
    let certs: Vec<CertificateDer> = certs(&mut BufReader::new(cert_file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("couldn't parse {}: {}", cert_path.display(), e)))?;

    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key_file = std::fs::File::open(key_path).map_err(|e| {
        Error::Tls(format!("couldn't open key file {}: {}", key_path.display(), e))
    })?;
    let mut keys: Vec<PrivateKeyDer> = pkcs8_private_keys(&mut BufReader::new(key_file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("couldn't parse {}: {}", key_path.display(), e)))?
        .into_iter()
        .map(PrivateKeyDer::from)
        .collect();

    if keys.is_empty() {
        return Err(Error::Tls(format!(
            "no PKCS#8 private keys found in {}",
            key_path.display()
        )));
    }

    let key = keys.remove(0);

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(format!("invalid cert/key pair: {}", e)))?;

    info!(
        "TLS context loaded from {} / {}",
        cert_path.display(),
        key_path.display()
    );
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cert_file_is_fatal() {
        let err = load_server_config(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
    }

    #[test]
    fn garbage_pem_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "this is not a certificate").unwrap();
        std::fs::write(&key, "this is not a key").unwrap();

        // no parseable certificates in the file
        let err = load_server_config(&cert, &key).unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
    }
}
