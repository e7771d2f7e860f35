//! TLS ClientHello profiles derived from fingerprint identifiers.
//!
//! An identifier is a JA3 string:
//! `version,ciphers,extensions,curves,point_formats`, each list dash-separated.
//! The profile keeps what rustls can express: cipher suite order, key
//! exchange group order, offered protocol versions, SNI and ALPN presence.
//! Anything rustls does not implement is dropped from the profile.

use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use rustls::crypto::{ring, CryptoProvider, SupportedKxGroup};
use rustls::{ClientConfig, RootCertStore, SupportedCipherSuite, SupportedProtocolVersion};
use thiserror::Error;

const TLS13_VERSION: u16 = 772;
const EXT_SERVER_NAME: u16 = 0;
const EXT_ALPN: u16 = 16;
const EXT_SUPPORTED_VERSIONS: u16 = 43;

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("expected 5 comma separated fields, got {0}")]
    FieldCount(usize),
    #[error("invalid {field} value '{value}'")]
    Number { field: &'static str, value: String },
    #[error("none of the listed cipher suites is supported")]
    NoCipherSuites,
    #[error("none of the listed key exchange groups is supported")]
    NoKxGroups,
    #[error(transparent)]
    Tls(#[from] rustls::Error),
}

/// A parsed JA3 fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TlsFingerprint {
    pub version: u16,
    pub ciphers: Vec<u16>,
    pub extensions: Vec<u16>,
    pub curves: Vec<u16>,
    pub point_formats: Vec<u8>,
}

impl TlsFingerprint {
    fn has_extension(&self, id: u16) -> bool {
        self.extensions.contains(&id)
    }

    fn offers_tls13(&self) -> bool {
        self.version >= TLS13_VERSION || self.has_extension(EXT_SUPPORTED_VERSIONS)
    }
}

impl FromStr for TlsFingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.trim().split(',').collect();
        let [version, ciphers, extensions, curves, point_formats] = fields.as_slice() else {
            return Err(FingerprintError::FieldCount(fields.len()));
        };

        Ok(Self {
            version: number("version", version)?,
            ciphers: list("cipher", ciphers)?,
            extensions: list("extension", extensions)?,
            curves: list("curve", curves)?,
            point_formats: list("point format", point_formats)?,
        })
    }
}

fn number<T: FromStr>(field: &'static str, value: &str) -> Result<T, FingerprintError> {
    value.trim().parse().map_err(|_| FingerprintError::Number {
        field,
        value: value.to_string(),
    })
}

fn list<T: FromStr>(field: &'static str, value: &str) -> Result<Vec<T>, FingerprintError> {
    value
        .split('-')
        .filter(|item| !item.trim().is_empty())
        .map(|item| number(field, item))
        .collect()
}

/// Parse a fingerprint identifier.
///
/// `None` selects the default profile: the identifier was empty, or it could
/// not be parsed (logged as a warning).
pub fn parse_identifier(identifier: &str) -> Option<TlsFingerprint> {
    if identifier.trim().is_empty() {
        return None;
    }
    match identifier.parse() {
        Ok(fingerprint) => Some(fingerprint),
        Err(e) => {
            tracing::warn!(fingerprint = %identifier, error = %e, "Unusable TLS fingerprint, using default profile");
            None
        }
    }
}

/// Build a rustls client configuration matching `fingerprint` as closely as rustls allows.
pub fn build_config(fingerprint: &TlsFingerprint, roots: Arc<RootCertStore>) -> Result<ClientConfig, FingerprintError> {
    let base = ring::default_provider();

    let offer_tls13 = fingerprint.offers_tls13();
    let cipher_suites: Vec<SupportedCipherSuite> = fingerprint
        .ciphers
        .iter()
        .filter_map(|id| base.cipher_suites.iter().find(|s| u16::from(s.suite()) == *id).copied())
        .filter(|suite| offer_tls13 || suite.tls13().is_none())
        .collect();
    if cipher_suites.is_empty() {
        return Err(FingerprintError::NoCipherSuites);
    }

    let kx_groups: Vec<&'static dyn SupportedKxGroup> = if fingerprint.curves.is_empty() {
        base.kx_groups.clone()
    } else {
        fingerprint
            .curves
            .iter()
            .filter_map(|id| base.kx_groups.iter().find(|g| u16::from(g.name()) == *id).copied())
            .collect()
    };
    if kx_groups.is_empty() {
        return Err(FingerprintError::NoKxGroups);
    }

    let mut versions: Vec<&'static SupportedProtocolVersion> = Vec::with_capacity(2);
    if cipher_suites.iter().any(|s| s.tls13().is_some()) {
        versions.push(&rustls::version::TLS13);
    }
    if cipher_suites.iter().any(|s| s.tls13().is_none()) {
        versions.push(&rustls::version::TLS12);
    }

    let provider = CryptoProvider {
        cipher_suites,
        kx_groups,
        ..base
    };
    let mut config = ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&versions)?
        .with_root_certificates(roots)
        .with_no_client_auth();

    config.enable_sni = fingerprint.has_extension(EXT_SERVER_NAME);
    if fingerprint.has_extension(EXT_ALPN) {
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
    }
    Ok(config)
}

/// The profile used when no usable fingerprint is requested.
pub fn default_config(roots: Arc<RootCertStore>) -> Result<ClientConfig, FingerprintError> {
    let mut config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// The bundled Mozilla root program.
pub fn webpki_roots() -> Arc<RootCertStore> {
    static ROOTS: OnceLock<Arc<RootCertStore>> = OnceLock::new();
    ROOTS
        .get_or_init(|| {
            Arc::new(RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            })
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Firefox 87 style hello.
    const FIREFOX: &str = "771,4865-4867-4866-49195-49199-52393-52392-49196-49200-49162-49161-49171-49172-156-157-47-53,0-23-65281-10-11-35-16-5-34-51-43-13-45-28-21,29-23-24-25-256-257,0";

    fn suite_ids(config: &ClientConfig) -> Vec<u16> {
        config
            .crypto_provider()
            .cipher_suites
            .iter()
            .map(|s| u16::from(s.suite()))
            .collect()
    }

    fn group_ids(config: &ClientConfig) -> Vec<u16> {
        config
            .crypto_provider()
            .kx_groups
            .iter()
            .map(|g| u16::from(g.name()))
            .collect()
    }

    #[test]
    fn parses_ja3_fields() {
        let fp: TlsFingerprint = "771,4865-49195,0-16,29-23,0".parse().unwrap();
        assert_eq!(fp.version, 771);
        assert_eq!(fp.ciphers, vec![4865, 49195]);
        assert_eq!(fp.extensions, vec![0, 16]);
        assert_eq!(fp.curves, vec![29, 23]);
        assert_eq!(fp.point_formats, vec![0]);
    }

    #[test]
    fn empty_lists_are_allowed() {
        let fp: TlsFingerprint = "771,4865,,,".parse().unwrap();
        assert!(fp.extensions.is_empty());
        assert!(fp.curves.is_empty());
    }

    #[test]
    fn rejects_malformed_strings() {
        assert!(matches!("abcd1234".parse::<TlsFingerprint>(), Err(FingerprintError::FieldCount(1))));
        assert!(matches!(
            "771,48x5,0,29,0".parse::<TlsFingerprint>(),
            Err(FingerprintError::Number { field: "cipher", .. })
        ));
    }

    #[test]
    fn keeps_supported_suites_in_fingerprint_order() {
        let config = build_config(&FIREFOX.parse().unwrap(), webpki_roots()).unwrap();

        // TLS_AES_128_GCM_SHA256, TLS_CHACHA20_POLY1305_SHA256, TLS_AES_256_GCM_SHA384 first,
        // then the ECDHE suites rustls implements; CBC and RSA key exchange suites are dropped.
        assert_eq!(
            suite_ids(&config),
            vec![4865, 4867, 4866, 49195, 49199, 52393, 52392, 49196, 49200]
        );
        // X25519, secp256r1, secp384r1; secp521r1 and ffdhe groups are dropped.
        assert_eq!(group_ids(&config), vec![29, 23, 24]);
        assert!(config.enable_sni);
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn tls12_only_fingerprint_drops_tls13_suites() {
        let config = build_config(&"771,4865-49199-49195,0,23,0".parse().unwrap(), webpki_roots()).unwrap();
        assert_eq!(suite_ids(&config), vec![49199, 49195]);
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn sni_follows_server_name_extension() {
        let config = build_config(&"771,4865,43-16,29,0".parse().unwrap(), webpki_roots()).unwrap();
        assert!(!config.enable_sni);
    }

    #[test]
    fn unsatisfiable_fingerprints_are_errors() {
        assert!(matches!(
            build_config(&"771,47-53,0,29,0".parse().unwrap(), webpki_roots()),
            Err(FingerprintError::NoCipherSuites)
        ));
        assert!(matches!(
            build_config(&"771,49195,0,25,0".parse().unwrap(), webpki_roots()),
            Err(FingerprintError::NoKxGroups)
        ));
    }

    #[test]
    fn identifiers_that_select_the_default_profile() {
        assert_eq!(parse_identifier(""), None);
        assert_eq!(parse_identifier("   "), None);
        assert_eq!(parse_identifier("abcd1234"), None);
        assert_eq!(parse_identifier(&format!(" {FIREFOX} ")), Some(FIREFOX.parse().unwrap()));
    }

    #[test]
    fn default_profile_offers_http11() {
        let config = default_config(webpki_roots()).unwrap();
        assert!(config.enable_sni);
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
