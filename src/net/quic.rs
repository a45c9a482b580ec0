use super::{StreamEnd, UniRecv, UniSend};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{ConnectionError, Endpoint, ReadError, VarInt, WriteError};
use rustls::DigitallySignedStruct;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::fs::File;
use std::io::BufReader;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// ALPN identifier both peers must agree on during the handshake.
pub const ALPN: &[u8] = b"quic-perf-test";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("opening certificate file {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing certificate file {}", path.display()))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates found in {}", path.display()));
    }
    Ok(certs)
}

pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file =
        File::open(path).with_context(|| format!("opening private key file {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("parsing private key file {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let mut tls = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("certificate and private key do not form a usable pair")?;
    tls.alpn_protocols = vec![ALPN.to_vec()];
    let crypto = QuicServerConfig::try_from(tls)?;
    Ok(quinn::ServerConfig::with_crypto(Arc::new(crypto)))
}

pub fn client_config(insecure: bool) -> Result<quinn::ClientConfig> {
    client_config_with_alpn(insecure, &[ALPN])
}

/// Client configuration offering the given ALPN identifiers.
pub fn client_config_with_alpn(insecure: bool, protocols: &[&[u8]]) -> Result<quinn::ClientConfig> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?;
    let mut tls = if insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider())))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(native_roots())
            .with_no_client_auth()
    };
    tls.alpn_protocols = protocols.iter().map(|p| p.to_vec()).collect();
    let crypto = QuicClientConfig::try_from(tls)?;
    Ok(quinn::ClientConfig::new(Arc::new(crypto)))
}

fn native_roots() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    let found = rustls_native_certs::load_native_certs();
    for e in &found.errors {
        warn!("Error loading platform certificate: {}", e);
    }
    let (added, ignored) = roots.add_parsable_certificates(found.certs);
    debug!(added, ignored, "Loaded platform trust roots");
    roots
}

pub fn server_endpoint(listen: SocketAddr, cert: &Path, key: &Path) -> Result<Endpoint> {
    let config = server_config(load_certs(cert)?, load_key(key)?)?;
    Endpoint::server(config, listen).with_context(|| format!("listening on {}", listen))
}

pub fn client_endpoint(remote: SocketAddr, config: quinn::ClientConfig) -> Result<Endpoint> {
    let local: SocketAddr = if remote.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let mut endpoint =
        Endpoint::client(local).with_context(|| format!("binding client socket on {}", local))?;
    endpoint.set_default_client_config(config);
    Ok(endpoint)
}

/// Splits `host:port` and resolves it. Returns the host, used as TLS server
/// name, and the first resolved address.
pub async fn resolve_remote(remote: &str) -> Result<(String, SocketAddr)> {
    let (host, port) = remote
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("remote address {:?} is missing a port", remote))?;
    port.parse::<u16>()
        .with_context(|| format!("invalid port in remote address {:?}", remote))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let addr = tokio::net::lookup_host(remote)
        .await
        .with_context(|| format!("resolving {}", remote))?
        .next()
        .ok_or_else(|| anyhow!("{} did not resolve to any address", remote))?;
    Ok((host.to_string(), addr))
}

/// Accepts any server certificate. Handshake signatures are still checked.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn connection_end(e: ConnectionError) -> StreamEnd {
    match e {
        ConnectionError::ApplicationClosed(close) => StreamEnd::Aborted(close.error_code.into_inner()),
        e => StreamEnd::Failed(e.into()),
    }
}

#[async_trait]
impl UniSend for quinn::SendStream {
    async fn send(&mut self, data: &[u8]) -> Result<usize, StreamEnd> {
        self.write(data).await.map_err(|e| match e {
            WriteError::Stopped(code) => StreamEnd::Aborted(code.into_inner()),
            WriteError::ConnectionLost(e) => connection_end(e),
            e => StreamEnd::Failed(e.into()),
        })
    }

    async fn close(&mut self) {
        if let Err(e) = self.finish() {
            debug!("Finishing stream: {}", e);
            return;
        }
        match self.stopped().await {
            Ok(None) => {}
            Ok(Some(code)) => debug!(%code, "Peer stopped the stream while finishing"),
            Err(e) => debug!("Waiting for stream delivery: {}", e),
        }
    }
}

#[async_trait]
impl UniRecv for quinn::RecvStream {
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, StreamEnd> {
        match self.read(buf).await {
            Ok(Some(n)) => Ok(n),
            Ok(None) => Err(StreamEnd::Finished),
            Err(ReadError::Reset(code)) => Err(StreamEnd::Aborted(code.into_inner())),
            Err(ReadError::ConnectionLost(e)) => Err(connection_end(e)),
            Err(e) => Err(StreamEnd::Failed(e.into())),
        }
    }

    fn abort(&mut self, code: u64) {
        let code = VarInt::from_u64(code).unwrap_or(VarInt::MAX);
        if let Err(e) = self.stop(code) {
            debug!("Stopping stream: {}", e);
        }
    }
}
