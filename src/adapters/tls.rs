//! TLS termination for the inbound listener.
//!
//! Certificates and keys are read from PEM files once at startup. Accepted
//! connections are handshaken by `tls-listener` and handed to axum through
//! [`TlsListenerAdapter`], which implements axum's `Listener` trait so the
//! regular `serve(...).with_graceful_shutdown(...)` path works unchanged.
use std::{fs::File, io::BufReader, net::SocketAddr, path::Path, sync::Arc};

use axum::serve::Listener;
use futures_util::{Stream, StreamExt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tls_listener::TlsListener;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in '{0}'")]
    NoCertificates(String),

    #[error("no private key found in '{0}'")]
    NoPrivateKey(String),

    #[error("invalid certificate or key: {0}")]
    Rustls(#[from] rustls::Error),
}

fn open(path: &str) -> Result<BufReader<File>, TlsError> {
    File::open(Path::new(path))
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.to_string(),
            source,
        })
}

/// Read every certificate in a PEM chain file.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_string()));
    }
    Ok(certs)
}

/// Read the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM file.
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Io {
            path: path.to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_string()))
}

/// Build the rustls server config (HTTP/2 and HTTP/1.1 via ALPN).
pub fn server_config(config: &TlsConfig) -> Result<rustls::ServerConfig, TlsError> {
    let certs = load_certs(&config.cert_path)?;
    let key = load_private_key(&config.key_path)?;

    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(server_config)
}

/// Adapts a stream of accepted connections to axum's [`Listener`].
pub struct TlsListenerAdapter<S> {
    stream: S,
    local_addr: SocketAddr,
}

impl TlsListenerAdapter<TlsListener<TcpListener, TlsAcceptor>> {
    /// Wrap a bound TCP listener so every connection is TLS terminated.
    pub fn bind(listener: TcpListener, config: &TlsConfig) -> Result<Self, TlsError> {
        let local_addr = listener.local_addr().map_err(|source| TlsError::Io {
            path: "listener".to_string(),
            source,
        })?;
        let acceptor = TlsAcceptor::from(Arc::new(server_config(config)?));
        tracing::info!(%local_addr, cert = %config.cert_path, "TLS termination enabled");

        Ok(Self {
            stream: TlsListener::new(acceptor, listener),
            local_addr,
        })
    }
}

impl<S, I, E> Listener for TlsListenerAdapter<S>
where
    S: Stream<Item = Result<(I, SocketAddr), E>> + Unpin + Send + 'static,
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    type Io = I;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.stream.next().await {
                Some(Ok((io, addr))) => return (io, addr),
                // Handshake failures only affect that one connection
                Some(Err(e)) => tracing::debug!(error = %e, "TLS accept error"),
                None => std::future::pending().await,
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn pem_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_certificate_file_is_io_error() {
        let err = load_certs("/nonexistent/rampart/cert.pem").unwrap_err();
        assert!(matches!(err, TlsError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/rampart/cert.pem"));
    }

    #[test]
    fn file_without_certificates_is_rejected() {
        let file = pem_file("not a pem file\n");
        let path = file.path().to_str().unwrap();
        assert!(matches!(
            load_certs(path),
            Err(TlsError::NoCertificates(p)) if p == path
        ));
    }

    #[test]
    fn file_without_key_is_rejected() {
        let file = pem_file("# empty key file\n");
        let path = file.path().to_str().unwrap();
        assert!(matches!(
            load_private_key(path),
            Err(TlsError::NoPrivateKey(_))
        ));
    }

    #[test]
    fn server_config_reports_first_failure() {
        let config = TlsConfig {
            cert_path: "/nonexistent/cert.pem".to_string(),
            key_path: "/nonexistent/key.pem".to_string(),
        };
        let err = server_config(&config).unwrap_err();
        assert!(err.to_string().contains("cert.pem"));
    }
}
