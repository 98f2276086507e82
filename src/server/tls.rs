//! TLS material loading for secure listeners.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::error::SendError;

/// Builds an acceptor for one listener, with ALPN offering HTTP/2 and
/// falling back to HTTP/1.1.
pub(crate) fn build_acceptor(key: &Path, cert: &Path) -> Result<TlsAcceptor, SendError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(
        File::open(cert).map_err(|err| SendError::internal(format!("cert {:?}: {}", cert, err)))?,
    ))
    .collect::<Result<_, _>>()
    .map_err(|err| SendError::internal(format!("cert {:?}: {}", cert, err)))?;

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(key).map_err(|err| SendError::internal(format!("key {:?}: {}", key, err)))?,
    ))
    .map_err(|err| SendError::internal(format!("key: {}", err)))?
    .ok_or_else(|| SendError::internal("no private key found in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| SendError::internal(format!("tls config: {}", err)))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}
