// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client-side TLS material shared by all writers.
//!
//! One verifying configuration (platform trust store plus user-supplied
//! anchors, TLS 1.2 minimum) and, when at least one host opts out of
//! verification, a second configuration that accepts any certificate. Each
//! writer picks its connector by the host's `insecure_tls` flag.
//!
//! Cipher restriction works on rustls suite names (for example
//! `TLS13_AES_128_GCM_SHA256`), separated by `:` or `,`. OpenSSL's cipher
//! mini-language has no rustls equivalent.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::warn;

use crate::options::{Host, Options};

#[derive(Debug, thiserror::Error)]
pub enum TlsSetupError {
    #[error("failed to read trust material from {path}: {source}")]
    TrustFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no cipher suite matched \"{0}\"")]
    NoMatchingCiphers(String),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// TLS client configurations shared across all hosts of a run.
#[derive(Clone, Debug)]
pub struct TlsSettings {
    verifying: Arc<ClientConfig>,
    insecure: Option<Arc<ClientConfig>>,
}

impl TlsSettings {
    pub fn build(options: &Options) -> Result<Self, TlsSetupError> {
        let provider = Arc::new(restrict_provider(
            options.cipher_list.as_deref(),
            options.ciphersuites.as_deref(),
        )?);

        let mut roots = RootCertStore::empty();
        load_platform_roots(&mut roots);
        if let Some(path) = &options.ca_file {
            let certs = read_pem_certs(path).map_err(|source| TlsSetupError::TrustFile {
                path: path.clone(),
                source,
            })?;
            for cert in certs {
                roots.add(cert)?;
            }
        }
        if let Some(dir) = &options.ca_path {
            load_trust_directory(&mut roots, dir)?;
        }

        let verifying = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])?
            .with_root_certificates(roots)
            .with_no_client_auth();

        let insecure = if options.hosts.iter().any(|host| host.insecure_tls) {
            let verifier = Arc::new(AcceptAnyServerCert::new(&provider));
            let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
                .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])?
                .dangerous()
                .with_custom_certificate_verifier(verifier)
                .with_no_client_auth();
            Some(Arc::new(config))
        } else {
            None
        };

        Ok(TlsSettings {
            verifying: Arc::new(verifying),
            insecure,
        })
    }

    /// The connector to use for one host, honoring its `insecure_tls` flag.
    pub fn connector_for(&self, host: &Host) -> TlsConnector {
        let config = if host.insecure_tls {
            self.insecure.as_ref().unwrap_or(&self.verifying)
        } else {
            &self.verifying
        };
        TlsConnector::from(Arc::clone(config))
    }
}

fn load_platform_roots(roots: &mut RootCertStore) {
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        warn!(error = %err, "failed to load part of the platform trust store");
    }
    let (added, skipped) = roots.add_parsable_certificates(native.certs);
    if skipped > 0 {
        warn!(added, skipped, "some platform trust anchors were not usable");
    }
}

fn load_trust_directory(roots: &mut RootCertStore, dir: &Path) -> Result<(), TlsSetupError> {
    let entries = std::fs::read_dir(dir).map_err(|source| TlsSetupError::TrustFile {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match read_pem_certs(&path) {
            Ok(certs) => {
                roots.add_parsable_certificates(certs);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable trust file");
            }
        }
    }
    Ok(())
}

fn read_pem_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::certs(&mut reader).collect()
}

/// Restrict the provider's cipher suites to those named in the TLSv1.2 and
/// TLSv1.3 lists. An absent list keeps that protocol's defaults.
fn restrict_provider(
    cipher_list: Option<&str>,
    ciphersuites: Option<&str>,
) -> Result<CryptoProvider, TlsSetupError> {
    let base = rustls::crypto::ring::default_provider();
    if cipher_list.is_none() && ciphersuites.is_none() {
        return Ok(base);
    }

    let keep = |filter: Option<&str>, name: &str| -> bool {
        match filter {
            None => true,
            Some(list) => list
                .split([':', ','])
                .any(|wanted| wanted.trim().eq_ignore_ascii_case(name)),
        }
    };

    let mut tls12_matched = cipher_list.is_none();
    let mut tls13_matched = ciphersuites.is_none();
    let cipher_suites: Vec<_> = base
        .cipher_suites
        .iter()
        .copied()
        .filter(|suite| {
            let name = format!("{:?}", suite.suite());
            match suite {
                rustls::SupportedCipherSuite::Tls12(_) => {
                    let kept = keep(cipher_list, &name);
                    tls12_matched |= kept;
                    kept
                }
                rustls::SupportedCipherSuite::Tls13(_) => {
                    let kept = keep(ciphersuites, &name);
                    tls13_matched |= kept;
                    kept
                }
            }
        })
        .collect();

    if !tls12_matched {
        return Err(TlsSetupError::NoMatchingCiphers(
            cipher_list.unwrap_or_default().to_owned(),
        ));
    }
    if !tls13_matched {
        return Err(TlsSetupError::NoMatchingCiphers(
            ciphersuites.unwrap_or_default().to_owned(),
        ));
    }

    Ok(CryptoProvider {
        cipher_suites,
        ..base
    })
}

/// Certificate verifier for hosts with `insecure_tls`: accepts any chain and
/// any hostname.
#[derive(Debug)]
struct AcceptAnyServerCert {
    schemes: Vec<SignatureScheme>,
}

impl AcceptAnyServerCert {
    fn new(provider: &CryptoProvider) -> Self {
        AcceptAnyServerCert {
            schemes: provider.signature_verification_algorithms.supported_schemes(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        self.schemes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;

    fn insecure_host() -> Host {
        Host {
            insecure_tls: true,
            ..Host::default()
        }
    }

    #[test]
    fn test_build_with_defaults() {
        let settings = TlsSettings::build(&Options::default()).expect("build");
        assert!(settings.insecure.is_none());
        let _ = settings.connector_for(&Host::default());
    }

    #[test]
    fn test_insecure_config_is_built_on_demand() {
        let options = Options {
            hosts: vec![Host::default(), insecure_host()],
            ..Options::default()
        };
        let settings = TlsSettings::build(&options).expect("build");
        assert!(settings.insecure.is_some());
        let _ = settings.connector_for(&insecure_host());
    }

    #[test]
    fn test_ca_file_is_loaded() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/certs/cert.pem");
        let options = Options {
            ca_file: Some(PathBuf::from(path)),
            ..Options::default()
        };
        TlsSettings::build(&options).expect("build with extra trust anchor");
    }

    #[test]
    fn test_missing_ca_file_is_fatal() {
        let options = Options {
            ca_file: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Options::default()
        };
        let err = TlsSettings::build(&options).expect_err("missing trust file");
        assert!(matches!(err, TlsSetupError::TrustFile { .. }));
    }

    #[test]
    fn test_ciphersuite_restriction() {
        let options = Options {
            ciphersuites: Some("TLS13_AES_128_GCM_SHA256".to_owned()),
            ..Options::default()
        };
        TlsSettings::build(&options).expect("restricted build");
    }

    #[test]
    fn test_unknown_ciphersuite_is_rejected() {
        let options = Options {
            ciphersuites: Some("TLS13_ROT13_TRIPLE_XOR".to_owned()),
            ..Options::default()
        };
        let err = TlsSettings::build(&options).expect_err("unknown suite");
        assert!(matches!(err, TlsSetupError::NoMatchingCiphers(_)));
    }

    #[test]
    fn test_unknown_tls12_cipher_is_rejected() {
        let options = Options {
            cipher_list: Some("HIGH:!eNULL:!aNULL".to_owned()),
            ..Options::default()
        };
        // OpenSSL mini-language selectors are not rustls suite names.
        let err = TlsSettings::build(&options).expect_err("openssl selectors");
        assert!(matches!(err, TlsSetupError::NoMatchingCiphers(_)));
    }
}
