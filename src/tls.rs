//! HTTPS support: PEM loading and the TLS accept loop.
//!
//! `axum::serve` has no TLS path, so the server runs its own accept loop:
//! accept TCP, complete the TLS handshake, then hand the stream to hyper
//! with WebSocket upgrades enabled.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read TLS certificate file: {0}")]
    CertRead(#[source] std::io::Error),

    #[error("failed to read TLS key file: {0}")]
    KeyRead(#[source] std::io::Error),

    #[error("no certificates found in PEM file")]
    NoCerts,

    #[error("no private key found in PEM file")]
    NoKey,

    #[error("failed to build TLS config: {0}")]
    Config(#[from] tokio_rustls::rustls::Error),
}

/// Load a PEM certificate chain and private key into a ready
/// [`TlsAcceptor`]. PKCS#8, RSA and EC key formats are accepted.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TlsError> {
    let cert_data = std::fs::read(cert_path).map_err(TlsError::CertRead)?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_data[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsError::CertRead)?;
    if certs.is_empty() {
        return Err(TlsError::NoCerts);
    }

    let key_data = std::fs::read(key_path).map_err(TlsError::KeyRead)?;
    let key = rustls_pemfile::private_key(&mut &key_data[..])
        .map_err(TlsError::KeyRead)?
        .ok_or(TlsError::NoKey)?;

    // Idempotent if a provider is already installed.
    let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Serve the router over TLS until the shutdown token fires.
pub async fn serve(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: axum::Router,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                debug!(?e, "accept failed");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(?e, %peer, "TLS handshake failed");
                    return;
                }
            };
            let service = hyper_util::service::TowerToHyperService::new(app);
            let builder =
                hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new());
            if let Err(e) = builder
                .serve_connection_with_upgrades(hyper_util::rt::TokioIo::new(tls_stream), service)
                .await
            {
                debug!(?e, %peer, "connection ended with error");
            }
        });
    }
}
