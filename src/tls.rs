//! TLS support for the in-band protocol upgrade.

use crate::error::{Error, Result};
use std::fs;
use std::io::BufReader;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// How the connection negotiates encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Never use TLS.
    #[default]
    Disable,
    /// Require TLS but accept any server certificate.
    Trust,
    /// Require TLS and verify the certificate chain against a CA.
    VerifyCa,
    /// Require TLS, verify the chain and the server hostname.
    VerifyFull,
}

impl SslMode {
    /// Whether this mode demands an encrypted channel.
    pub fn requires_tls(&self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    pub(crate) fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "disable" | "disabled" => Ok(SslMode::Disable),
            "trust" => Ok(SslMode::Trust),
            "verify_ca" | "verify-ca" => Ok(SslMode::VerifyCa),
            "verify_full" | "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(Error::InvalidParameter(format!(
                "unknown sslMode '{other}'"
            ))),
        }
    }
}

/// TLS material and mode for one data source.
#[derive(Debug, Clone, Default)]
pub struct SslOptions {
    /// Negotiation mode
    pub mode: SslMode,
    /// PEM file with the CA certificates used by the verify modes
    pub ca_file: Option<PathBuf>,
    /// PEM file with the client certificate (mutual TLS)
    pub cert_file: Option<PathBuf>,
    /// PEM file with the client private key (mutual TLS)
    pub key_file: Option<PathBuf>,
}

/// Build the rustls client configuration for the configured mode.
pub(crate) fn build_client_config(opts: &SslOptions) -> Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder();

    let config = match opts.mode {
        SslMode::Disable => {
            return Err(Error::InvalidParameter(
                "TLS config requested with sslMode=disable".to_string(),
            ))
        }
        SslMode::Trust => {
            let builder = builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertificateVerification));
            with_client_auth(builder, opts)?
        }
        SslMode::VerifyCa | SslMode::VerifyFull => {
            let ca = opts.ca_file.as_ref().ok_or_else(|| {
                Error::InvalidParameter(
                    "sslMode=verify_ca/verify_full requires a CA file".to_string(),
                )
            })?;
            let pem = fs::read(ca)?;
            let mut reader = BufReader::new(&pem[..]);
            let mut store = rustls::RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.map_err(|e| {
                    Error::InvalidParameter(format!("bad certificate in {}: {e}", ca.display()))
                })?;
                store.add(cert).map_err(|e| {
                    Error::InvalidParameter(format!("rejected CA certificate: {e}"))
                })?;
            }
            let builder = builder.with_root_certificates(store);
            match (&opts.cert_file, &opts.key_file) {
                (Some(cert), Some(key)) => {
                    let (certs, key) = load_client_identity(cert, key)?;
                    builder.with_client_auth_cert(certs, key).map_err(|e| {
                        Error::InvalidParameter(format!("invalid client cert/key: {e}"))
                    })?
                }
                _ => builder.with_no_client_auth(),
            }
        }
    };
    Ok(config)
}

type DangerousBuilder =
    rustls::ConfigBuilder<rustls::ClientConfig, rustls::client::WantsClientCert>;

fn with_client_auth(builder: DangerousBuilder, opts: &SslOptions) -> Result<rustls::ClientConfig> {
    match (&opts.cert_file, &opts.key_file) {
        (Some(cert), Some(key)) => {
            let (certs, key) = load_client_identity(cert, key)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::InvalidParameter(format!("invalid client cert/key: {e}")))
        }
        _ => Ok(builder.with_no_client_auth()),
    }
}

fn load_client_identity(
    cert: &PathBuf,
    key: &PathBuf,
) -> Result<(
    Vec<rustls::pki_types::CertificateDer<'static>>,
    rustls::pki_types::PrivateKeyDer<'static>,
)> {
    let cert_pem = fs::read(cert)?;
    let mut reader = BufReader::new(&cert_pem[..]);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::InvalidParameter(format!("bad client certificate: {e}")))?;
    let key_pem = fs::read(key)?;
    let mut reader = BufReader::new(&key_pem[..]);
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::InvalidParameter(format!("bad client key: {e}")))?
        .ok_or_else(|| Error::InvalidParameter("no private key in key file".to_string()))?;
    Ok((certs, key))
}

/// Wrap an established stream in TLS, continuing the protocol in-band.
pub(crate) async fn wrap<S>(
    stream: S,
    host: &str,
    config: Arc<rustls::ClientConfig>,
) -> Result<tokio_rustls::client::TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| Error::InvalidParameter(format!("invalid TLS server name '{host}': {e}")))?;
    let connector = TlsConnector::from(config);
    Ok(connector.connect(server_name, stream).await?)
}

/// Certificate verifier behind [`SslMode::Trust`]: accepts any certificate.
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Wrapper for either plaintext or TLS streams.
///
/// Note: the TLS variant is significantly larger, but boxing would add
/// indirection on every I/O operation.
#[allow(clippy::large_enum_variant)]
pub(crate) enum MaybeTlsStream<S> {
    Plain(S),
    Tls(tokio_rustls::client::TlsStream<S>),
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for MaybeTlsStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MaybeTlsStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_names() {
        assert_eq!(SslMode::from_name("trust").unwrap(), SslMode::Trust);
        assert_eq!(SslMode::from_name("VERIFY_FULL").unwrap(), SslMode::VerifyFull);
        assert!(SslMode::from_name("bogus").is_err());
        assert!(!SslMode::Disable.requires_tls());
        assert!(SslMode::Trust.requires_tls());
    }

    #[test]
    fn verify_mode_needs_ca() {
        let opts = SslOptions {
            mode: SslMode::VerifyFull,
            ..Default::default()
        };
        assert!(build_client_config(&opts).is_err());
    }
}
