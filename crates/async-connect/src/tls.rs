//! TLS trust configuration and certificate pinning.
//!
//! Every connection made by [`ApiClient`](crate::http::ApiClient) goes through a
//! [`CertificatePinningValidator`]. With pinning disabled it simply performs
//! default trust evaluation. With pinning enabled the handshake is accepted
//! only when default trust evaluation succeeds *and* the leaf certificate is
//! byte-identical to one of the pinned certificates.
//!
//! # Pinning
//!
//! ```ignore
//! use async_connect::tls::{PinnedCertificates, PinningMode};
//!
//! // DER (`.cer`) or PEM, fails if the file cannot be read
//! let pins = PinnedCertificates::from_file("certificate.cer")?;
//!
//! let client = ApiClient::builder("https://api.example.com")
//!     .pinning(PinningMode::Enabled(pins))
//!     .build()?;
//! ```
//!
//! # Custom CA Certificates
//!
//! ```ignore
//! let ca_cert = Certificate::from_pem_file("/path/to/ca.crt")?;
//!
//! let client = ApiClient::builder("https://internal.example.com")
//!     .add_root_certificate(ca_cert)
//!     .build()?;
//! ```

use std::io::{BufReader, Cursor};
use std::path::Path;
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::error::{NetworkError, Result};

const PEM_MARKER: &[u8] = b"-----BEGIN";

/// One or more X.509 certificates in DER form.
#[derive(Clone)]
pub struct Certificate {
    der_certs: Vec<CertificateDer<'static>>,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("cert_count", &self.der_certs.len())
            .finish()
    }
}

impl Certificate {
    /// Load certificates from PEM-encoded bytes.
    ///
    /// This can contain multiple certificates (a certificate chain or bundle).
    pub fn from_pem(pem_data: impl AsRef<[u8]>) -> Result<Self> {
        let mut reader = BufReader::new(Cursor::new(pem_data.as_ref()));
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| NetworkError::tls(format!("Failed to parse PEM certificate: {}", e)))?;

        if certs.is_empty() {
            return Err(NetworkError::tls("No certificates found in PEM data"));
        }

        Ok(Self { der_certs: certs })
    }

    /// Load a certificate from DER-encoded bytes.
    pub fn from_der(der_data: impl Into<Vec<u8>>) -> Self {
        Self {
            der_certs: vec![CertificateDer::from(der_data.into())],
        }
    }

    /// Load certificates from bytes, accepting either PEM or raw DER.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Result<Self> {
        let data = data.into();
        if data.is_empty() {
            return Err(NetworkError::tls("Certificate data is empty"));
        }
        if data.windows(PEM_MARKER.len()).any(|w| w == PEM_MARKER) {
            Self::from_pem(data)
        } else {
            Ok(Self::from_der(data))
        }
    }

    /// Load a certificate from a PEM-encoded file.
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_pem(read_certificate_file(path.as_ref())?)
    }

    /// Load a certificate from a DER-encoded file (e.g. a `.cer` file).
    pub fn from_der_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_der(read_certificate_file(path.as_ref())?))
    }

    /// Load a certificate file in either PEM or DER encoding.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(read_certificate_file(path.as_ref())?)
    }

    /// Get the DER-encoded certificates.
    pub fn der_certs(&self) -> &[CertificateDer<'static>] {
        &self.der_certs
    }
}

fn read_certificate_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        NetworkError::tls(format!(
            "Failed to read certificate file '{}': {}",
            path.display(),
            e
        ))
    })
}

/// The set of leaf certificates a pinned connection may present.
///
/// Loaded once and immutable afterwards. Holding more than one certificate
/// allows a server certificate to be rotated without breaking deployed clients.
#[derive(Clone, Debug)]
pub struct PinnedCertificates {
    pins: Vec<CertificateDer<'static>>,
}

impl PinnedCertificates {
    /// Pin every certificate contained in `cert`.
    pub fn new(cert: Certificate) -> Self {
        Self {
            pins: cert.der_certs,
        }
    }

    /// Pin a single DER-encoded certificate.
    pub fn from_der(der_data: impl Into<Vec<u8>>) -> Self {
        Self::new(Certificate::from_der(der_data))
    }

    /// Load the pinned certificate(s) from a PEM or DER file.
    ///
    /// Fails if the file is missing or contains no certificate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Certificate::from_file(path)?))
    }

    /// Add another accepted certificate.
    pub fn with(mut self, cert: Certificate) -> Self {
        self.pins.extend(cert.der_certs);
        self
    }

    /// Number of pinned certificates.
    pub fn len(&self) -> usize {
        self.pins.len()
    }

    /// Check if no certificate is pinned.
    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    /// Byte-for-byte comparison against every pin.
    pub fn matches(&self, leaf: &[u8]) -> bool {
        self.pins.iter().any(|pin| pin.as_ref() == leaf)
    }
}

/// Whether handshakes are checked against pinned certificates.
#[derive(Clone, Debug, Default)]
pub enum PinningMode {
    /// Default trust evaluation only.
    #[default]
    Disabled,
    /// Default trust evaluation plus leaf certificate pinning.
    Enabled(PinnedCertificates),
}

/// An authentication challenge raised during a TLS handshake.
#[derive(Debug)]
pub enum Challenge<'a> {
    /// The server presented its certificate chain for trust evaluation.
    ServerTrust(ServerTrust<'a>),
    /// The server asked the client for a certificate.
    ClientCertificate,
}

/// A server-trust challenge with its default trust evaluation already performed.
#[derive(Debug)]
pub struct ServerTrust<'a> {
    /// Presented chain, leaf first.
    pub chain: &'a [CertificateDer<'a>],
    /// Outcome of default trust evaluation.
    pub evaluation: std::result::Result<(), rustls::Error>,
}

/// Outcome of evaluating a [`Challenge`].
#[derive(Clone, Debug, PartialEq)]
pub enum TrustDecision {
    /// Pinning is disabled; the default evaluation decides.
    PerformDefaultHandling,
    /// The leaf matched a pin; accept using the evaluated trust.
    UseEvaluatedTrust,
    /// Reject the handshake.
    Cancel(PinRejection),
}

/// Why a pinned handshake was cancelled.
#[derive(Clone, Debug, PartialEq)]
pub enum PinRejection {
    /// The challenge was not a server-trust challenge.
    NotServerTrust,
    /// Default trust evaluation failed.
    UntrustedChain(rustls::Error),
    /// The chain contained no leaf certificate.
    MissingLeafCertificate,
    /// The leaf certificate matched no pin.
    Mismatch,
}

impl PinRejection {
    fn into_rustls_error(self) -> rustls::Error {
        match self {
            Self::UntrustedChain(err) => err,
            Self::Mismatch => rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ),
            Self::NotServerTrust => rustls::Error::General("not a server trust challenge".into()),
            Self::MissingLeafCertificate => {
                rustls::Error::General("no leaf certificate presented".into())
            }
        }
    }
}

/// TLS trust decision for every handshake made by the client.
///
/// Implements rustls' [`ServerCertVerifier`], delegating default trust
/// evaluation and handshake signature checks to an inner verifier.
#[derive(Debug)]
pub struct CertificatePinningValidator {
    mode: PinningMode,
    default_trust: Arc<dyn ServerCertVerifier>,
}

impl CertificatePinningValidator {
    /// Create a validator that evaluates default trust against `roots`.
    pub fn new(mode: PinningMode, roots: RootCertStore) -> Result<Self> {
        let default_trust =
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), crypto_provider())
                .build()
                .map_err(|e| NetworkError::tls(format!("Failed to build trust verifier: {}", e)))?;
        Self::with_default_trust(mode, default_trust)
    }

    /// Create a validator on top of a custom default trust verifier.
    ///
    /// Fails when pinning is enabled with an empty pin set.
    pub fn with_default_trust(
        mode: PinningMode,
        default_trust: Arc<dyn ServerCertVerifier>,
    ) -> Result<Self> {
        if let PinningMode::Enabled(pins) = &mode
            && pins.is_empty()
        {
            return Err(NetworkError::tls(
                "Certificate pinning is enabled but no certificate is pinned",
            ));
        }
        Ok(Self {
            mode,
            default_trust,
        })
    }

    /// Check if pinning is enabled.
    pub fn is_pinning_enabled(&self) -> bool {
        matches!(self.mode, PinningMode::Enabled(_))
    }

    /// Decide the outcome of a handshake challenge.
    pub fn evaluate(&self, challenge: Challenge<'_>) -> TrustDecision {
        let PinningMode::Enabled(pins) = &self.mode else {
            return TrustDecision::PerformDefaultHandling;
        };

        let Challenge::ServerTrust(trust) = challenge else {
            return TrustDecision::Cancel(PinRejection::NotServerTrust);
        };

        if let Err(err) = trust.evaluation {
            return TrustDecision::Cancel(PinRejection::UntrustedChain(err));
        }

        let Some(leaf) = trust.chain.first() else {
            return TrustDecision::Cancel(PinRejection::MissingLeafCertificate);
        };

        if pins.matches(leaf.as_ref()) {
            TrustDecision::UseEvaluatedTrust
        } else {
            TrustDecision::Cancel(PinRejection::Mismatch)
        }
    }
}

impl ServerCertVerifier for CertificatePinningValidator {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let evaluation = self
            .default_trust
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            .map(|_| ());

        let chain: Vec<CertificateDer<'_>> = std::iter::once(end_entity.clone())
            .chain(intermediates.iter().cloned())
            .collect();

        let decision = self.evaluate(Challenge::ServerTrust(ServerTrust {
            chain: &chain,
            evaluation: evaluation.clone(),
        }));

        match decision {
            TrustDecision::PerformDefaultHandling => {
                evaluation.map(|()| ServerCertVerified::assertion())
            }
            TrustDecision::UseEvaluatedTrust => Ok(ServerCertVerified::assertion()),
            TrustDecision::Cancel(reason) => {
                tracing::warn!(
                    target: "async_connect::tls",
                    server = ?server_name,
                    ?reason,
                    "Rejected TLS handshake"
                );
                Err(reason.into_rustls_error())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.default_trust.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.default_trust.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.default_trust.supported_verify_schemes()
    }
}

/// TLS settings for the client.
#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
    /// Additional root certificates to trust.
    pub root_certificates: Vec<Certificate>,
    /// Whether to use only the provided root certificates (no bundled roots).
    pub use_only_custom_roots: bool,
    /// Certificate pinning.
    pub pinning: PinningMode,
}

impl TlsConfig {
    /// Create a new TLS configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a root certificate to trust.
    pub fn add_root_certificate(mut self, cert: Certificate) -> Self {
        self.root_certificates.push(cert);
        self
    }

    /// Use only custom root certificates.
    pub fn use_only_custom_roots(mut self) -> Self {
        self.use_only_custom_roots = true;
        self
    }

    /// Set the pinning mode.
    pub fn pinning(mut self, mode: PinningMode) -> Self {
        self.pinning = mode;
        self
    }

    /// Build the pinning validator for this configuration.
    pub fn build_validator(&self) -> Result<CertificatePinningValidator> {
        CertificatePinningValidator::new(self.pinning.clone(), self.build_root_store()?)
    }

    /// Build a rustls `ClientConfig` that routes trust decisions through the validator.
    pub fn build_rustls_config(&self) -> Result<ClientConfig> {
        let validator = self.build_validator()?;

        let config = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| NetworkError::tls(format!("Unsupported protocol versions: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(validator))
            .with_no_client_auth();

        Ok(config)
    }

    /// Build a root certificate store.
    fn build_root_store(&self) -> Result<RootCertStore> {
        let mut root_store = RootCertStore::empty();

        if !self.use_only_custom_roots {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }

        for cert in &self.root_certificates {
            for der_cert in cert.der_certs() {
                root_store.add(der_cert.clone()).map_err(|e| {
                    NetworkError::tls(format!("Failed to add root certificate: {}", e))
                })?;
            }
        }

        if root_store.is_empty() {
            return Err(NetworkError::tls(
                "No root certificates available. Either add custom certificates or \
                 don't use use_only_custom_roots()",
            ));
        }

        Ok(root_store)
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PEM: &str = r#"-----BEGIN CERTIFICATE-----
MIIBkTCB+wIJAKHBfpegE3jEMA0GCSqGSIb3DQEBCwUAMBExDzANBgNVBAMMBnRl
c3RjYTAeFw0yMzAxMDEwMDAwMDBaFw0yNDAxMDEwMDAwMDBaMBExDzANBgNVBAMM
BnRlc3RjYTBcMA0GCSqGSIb3DQEBAQUAA0sAMEgCQQC7o96HtiK7onnPevKSE2LL
oSXwnmfYwZPV2bvfGS18lK8F+DL+42IjT3ucMXnLBhzNCLNKE8yCVK6LPlsvpNlX
AgMBAAGjUzBRMB0GA1UdDgQWBBQgHGHqPcVi1N4CG7IxDJaFMvP6XTAfBgNVHSME
GDAWgBQgHGHqPcVi1N4CG7IxDJaFMvP6XTAPBgNVHRMBAf8EBTADAQH/MA0GCSqG
SIb3DQEBCwUAA0EAGLJHfg9dS/T39L6VQLJeZcpH7mY8vKaM9dM/Zn3HMhfc0Yjv
3hxMPmPGjjpQ9JKaLI0Rq7n5oEUP+xluoAAfrQ==
-----END CERTIFICATE-----"#;

    /// Default trust that accepts or rejects everything.
    #[derive(Debug)]
    struct StubTrust {
        accept: bool,
    }

    impl ServerCertVerifier for StubTrust {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            if self.accept {
                Ok(ServerCertVerified::assertion())
            } else {
                Err(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::UnknownIssuer,
                ))
            }
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
            vec![SignatureScheme::ECDSA_NISTP256_SHA256, SignatureScheme::ED25519]
        }
    }

    fn leaf() -> CertificateDer<'static> {
        Certificate::from_pem(TEST_PEM).unwrap().der_certs()[0].clone()
    }

    fn validator(mode: PinningMode, accept: bool) -> CertificatePinningValidator {
        CertificatePinningValidator::with_default_trust(mode, Arc::new(StubTrust { accept }))
            .unwrap()
    }

    fn verify(
        validator: &CertificatePinningValidator,
        cert: &CertificateDer<'_>,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let name = ServerName::try_from("api.example.com").unwrap();
        validator.verify_server_cert(cert, &[], &name, &[], UnixTime::now())
    }

    #[test]
    fn test_certificate_from_pem() {
        let cert = Certificate::from_pem(TEST_PEM).unwrap();
        assert_eq!(cert.der_certs().len(), 1);
    }

    #[test]
    fn test_certificate_from_bytes_detects_encoding() {
        let pem = Certificate::from_bytes(TEST_PEM.as_bytes().to_vec()).unwrap();
        let der = Certificate::from_bytes(leaf().as_ref().to_vec()).unwrap();
        assert_eq!(pem.der_certs()[0], der.der_certs()[0]);
        assert!(Certificate::from_bytes(Vec::new()).is_err());
    }

    #[test]
    fn test_pinned_file_missing_fails() {
        let err = PinnedCertificates::from_file("/nonexistent/certificate.cer").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Tls);
    }

    #[test]
    fn test_enabled_without_pins_fails() {
        let pins = PinnedCertificates { pins: Vec::new() };
        let result = CertificatePinningValidator::with_default_trust(
            PinningMode::Enabled(pins),
            Arc::new(StubTrust { accept: true }),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_identical_leaf_is_accepted() {
        let pins = PinnedCertificates::from_der(leaf().as_ref().to_vec());
        let validator = validator(PinningMode::Enabled(pins), true);
        assert!(validator.is_pinning_enabled());
        assert!(verify(&validator, &leaf()).is_ok());
    }

    #[test]
    fn test_single_differing_byte_is_rejected() {
        let pins = PinnedCertificates::from_der(leaf().as_ref().to_vec());
        let validator = validator(PinningMode::Enabled(pins), true);

        let mut tampered = leaf().as_ref().to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;

        let result = verify(&validator, &CertificateDer::from(tampered));
        assert_eq!(
            result.unwrap_err(),
            rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure
            )
        );
    }

    #[test]
    fn test_failed_default_trust_is_rejected_even_when_pinned() {
        let pins = PinnedCertificates::from_der(leaf().as_ref().to_vec());
        let validator = validator(PinningMode::Enabled(pins), false);
        assert!(verify(&validator, &leaf()).is_err());
    }

    #[test]
    fn test_disabled_uses_default_trust() {
        let accepting = validator(PinningMode::Disabled, true);
        assert!(verify(&accepting, &CertificateDer::from(vec![0x30, 0x00])).is_ok());

        let rejecting = validator(PinningMode::Disabled, false);
        assert!(verify(&rejecting, &leaf()).is_err());
    }

    #[test]
    fn test_rotation_accepts_any_pin() {
        let pins = PinnedCertificates::from_der(vec![0x30, 0x03, 0x02, 0x01, 0x00])
            .with(Certificate::from_pem(TEST_PEM).unwrap());
        assert_eq!(pins.len(), 2);
        let validator = validator(PinningMode::Enabled(pins), true);
        assert!(verify(&validator, &leaf()).is_ok());
    }

    #[test]
    fn test_evaluate_decisions() {
        let pins = PinnedCertificates::from_der(leaf().as_ref().to_vec());
        let validator = validator(PinningMode::Enabled(pins), true);

        assert_eq!(
            validator.evaluate(Challenge::ClientCertificate),
            TrustDecision::Cancel(PinRejection::NotServerTrust)
        );
        assert_eq!(
            validator.evaluate(Challenge::ServerTrust(ServerTrust {
                chain: &[],
                evaluation: Ok(()),
            })),
            TrustDecision::Cancel(PinRejection::MissingLeafCertificate)
        );

        let chain = [leaf()];
        assert_eq!(
            validator.evaluate(Challenge::ServerTrust(ServerTrust {
                chain: &chain,
                evaluation: Ok(()),
            })),
            TrustDecision::UseEvaluatedTrust
        );

        let disabled = self::validator(PinningMode::Disabled, true);
        assert_eq!(
            disabled.evaluate(Challenge::ClientCertificate),
            TrustDecision::PerformDefaultHandling
        );
    }

    #[test]
    fn test_build_rustls_config_with_bundled_roots() {
        let config = TlsConfig::new();
        assert!(config.build_rustls_config().is_ok());
    }

    #[test]
    fn test_only_custom_roots_without_certs_fails() {
        let config = TlsConfig::new().use_only_custom_roots();
        assert!(config.build_rustls_config().is_err());
    }
}
