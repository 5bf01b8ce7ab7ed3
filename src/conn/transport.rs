// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Dialing a `Target` into a boxed, type-erased transport stream.
//!
//! `pipe://` maps to a Unix domain socket — the closest cross-platform
//! analogue `tokio` ships. There is no Windows named-pipe implementation
//! behind it.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;
use tokio_rustls::{rustls, TlsConnector};

use crate::error::MuxError;
use crate::wire::target::{Scheme, Target};

pub const DEFAULT_TCP_PORT: u16 = 4023;
pub const DEFAULT_TLS_PORT: u16 = 4024;

fn with_default_port(addr: &str, default_port: u16) -> String {
    if addr.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
        addr.to_string()
    } else {
        format!("{addr}:{default_port}")
    }
}

/// Type-erased bidirectional transport stream.
pub enum Transport {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    Unix(UnixStream),
}

impl AsyncRead for Transport {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Transport::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Transport::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Transport::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Transport::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Build a `rustls::ClientConfig` trusting the platform's native root store,
/// or skipping verification entirely when `insecure_skip_tls_verify` is set.
pub fn build_tls_config(insecure_skip_tls_verify: bool) -> Result<Arc<rustls::ClientConfig>, MuxError> {
    if insecure_skip_tls_verify {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerifier))
            .with_no_client_auth();
        return Ok(Arc::new(config));
    }

    let mut roots = rustls::RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs()
        .map_err(|e| MuxError::config(format!("loading native TLS root certificates: {e}")))?;
    for cert in native_certs {
        let _ = roots.add(cert);
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    #[derive(Debug)]
    pub struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ED25519,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::ECDSA_NISTP384_SHA384,
            ]
        }
    }
}

/// Dial `target`, applying `dial_timeout`. `insecure_skip_tls_verify` only
/// affects `tls://` targets.
pub async fn dial(
    target: &Target,
    dial_timeout: std::time::Duration,
    insecure_skip_tls_verify: bool,
) -> Result<Transport, MuxError> {
    match target.scheme {
        Scheme::Tcp => {
            let addr = with_default_port(&target.addr, DEFAULT_TCP_PORT);
            let stream = timeout(dial_timeout, TcpStream::connect(&addr))
                .await
                .map_err(|_| MuxError::transport(format!("dial timeout connecting to {addr}")))?
                .map_err(|e| MuxError::transport(format!("connecting to {addr}: {e}")))?;
            stream
                .set_nodelay(true)
                .map_err(|e| MuxError::transport(format!("setting TCP_NODELAY: {e}")))?;
            Ok(Transport::Tcp(stream))
        }
        Scheme::Tls => {
            let addr = with_default_port(&target.addr, DEFAULT_TLS_PORT);
            let tcp = timeout(dial_timeout, TcpStream::connect(&addr))
                .await
                .map_err(|_| MuxError::transport(format!("dial timeout connecting to {addr}")))?
                .map_err(|e| MuxError::transport(format!("connecting to {addr}: {e}")))?;
            tcp.set_nodelay(true)
                .map_err(|e| MuxError::transport(format!("setting TCP_NODELAY: {e}")))?;

            let host = addr
                .rsplit_once(':')
                .map(|(h, _)| h)
                .unwrap_or(&addr)
                .to_string();
            let config = build_tls_config(insecure_skip_tls_verify)?;
            let connector = TlsConnector::from(config);
            let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|e| MuxError::config(format!("invalid TLS server name {host:?}: {e}")))?
                .to_owned();
            let tls = timeout(dial_timeout, connector.connect(server_name, tcp))
                .await
                .map_err(|_| MuxError::transport("TLS handshake timed out"))?
                .map_err(|e| MuxError::transport(format!("TLS handshake with {addr}: {e}")))?;
            Ok(Transport::Tls(Box::new(tls)))
        }
        Scheme::Pipe => {
            let stream = timeout(dial_timeout, UnixStream::connect(&target.addr))
                .await
                .map_err(|_| MuxError::transport(format!("dial timeout connecting to {}", target.addr)))?
                .map_err(|e| MuxError::transport(format!("connecting to {}: {e}", target.addr)))?;
            Ok(Transport::Unix(stream))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_default_port_leaves_explicit_port_alone() {
        assert_eq!(with_default_port("host:9999", DEFAULT_TCP_PORT), "host:9999");
    }

    #[test]
    fn with_default_port_fills_missing_port() {
        assert_eq!(with_default_port("host", DEFAULT_TCP_PORT), "host:4023");
    }
}
