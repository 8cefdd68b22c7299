use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

/// `Ok(None)` when neither path is configured.
pub fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both SLOTKEEPER_TLS_CERT and SLOTKEEPER_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

    config.alpn_protocols = vec![b"postgresql".to_vec()];
    tracing::info!(cert = cert_path, "TLS enabled");

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_paths_means_plaintext() {
        assert!(load_tls_acceptor(None, None).unwrap().is_none());
    }

    #[test]
    fn half_configured_tls_is_rejected() {
        let err = load_tls_acceptor(Some("cert.pem"), None).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.to_string().contains("SLOTKEEPER_TLS_KEY"));
    }

    #[test]
    fn missing_cert_file_is_io_error() {
        let dir = std::env::temp_dir().join("slotkeeper_test_tls");
        let cert = dir.join("absent_cert.pem");
        let key = dir.join("absent_key.pem");
        let err = load_tls_acceptor(cert.to_str(), key.to_str()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
