use crate::config::CaSource;
use crate::error::ProxyError;
use crate::Result;
use hudsucker::{certificate_authority::RcgenAuthority, rustls};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    PKCS_ECDSA_P256_SHA256,
};
use std::fs;
use std::path::Path;
use time::{Duration, OffsetDateTime};

/// Number of generated leaf certificates the engine keeps cached.
const LEAF_CACHE_SIZE: u64 = 1_000;

/// Certificate Authority used for TLS interception in direct mode.
///
/// Clients must trust the root certificate; leaf certificates for each
/// intercepted host are minted by the engine and signed with this key.
pub struct CertificateAuthority {
    ca_cert: Certificate,
}

impl CertificateAuthority {
    /// Build the CA described by `source`.
    pub fn from_source(source: &CaSource) -> Result<Self> {
        match source {
            CaSource::Files { cert, key } => Self::load(cert, key),
            CaSource::Directory { path } => Self::load_or_generate(path),
            CaSource::Ephemeral => Self::generate(),
        }
    }

    /// Load `ca.pem`/`ca.key` from `ca_dir`, generating and saving a new pair if absent.
    pub fn load_or_generate(ca_dir: &Path) -> Result<Self> {
        let ca_cert_path = ca_dir.join("ca.pem");
        let ca_key_path = ca_dir.join("ca.key");

        if ca_cert_path.exists() && ca_key_path.exists() {
            Self::load(&ca_cert_path, &ca_key_path)
        } else {
            if !ca_dir.exists() {
                fs::create_dir_all(ca_dir)?;
            }
            let ca = Self::generate()?;
            ca.save(&ca_cert_path, &ca_key_path)?;
            Ok(ca)
        }
    }

    /// Load an existing CA certificate and private key from PEM files.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = fs::read_to_string(cert_path)?;
        let key_pem = fs::read_to_string(key_path)?;

        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Create a CertificateAuthority from PEM strings (cert and key).
    ///
    /// The subject of the given certificate is kept so leaf certificates chain
    /// to the root the clients already trust.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| ProxyError::Certificate(format!("Failed to parse CA key: {}", e)))?;

        let params = CertificateParams::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| ProxyError::Certificate(format!("Failed to parse CA cert: {}", e)))?;

        let cert = Certificate::from_params(params)
            .map_err(|e| ProxyError::Certificate(format!("Failed to rebuild CA cert: {}", e)))?;

        Ok(Self { ca_cert: cert })
    }

    /// Generate a new root CA in memory.
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Tamper CA");
        dn.push(DnType::OrganizationName, "Tamper Interception Proxy");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
        ];

        // Valid for 10 years
        let not_before = OffsetDateTime::now_utc();
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(365 * 10);

        let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| ProxyError::Certificate(format!("Failed to generate CA key: {}", e)))?;
        params.key_pair = Some(key_pair);

        let cert = Certificate::from_params(params)
            .map_err(|e| ProxyError::Certificate(format!("Failed to generate CA cert: {}", e)))?;

        Ok(Self { ca_cert: cert })
    }

    fn save(&self, cert_path: &Path, key_path: &Path) -> Result<()> {
        let cert_pem = self.ca_cert_pem()?;
        fs::write(cert_path, &cert_pem)?;
        fs::write(key_path, self.ca_key_pem())?;

        // Same certificate with the extension most trust stores expect
        fs::write(cert_path.with_extension("crt"), &cert_pem)?;
        Ok(())
    }

    /// Root CA certificate in PEM format, for installing into client trust stores.
    pub fn ca_cert_pem(&self) -> Result<String> {
        self.ca_cert
            .serialize_pem()
            .map_err(|e| ProxyError::Certificate(format!("Failed to serialize CA cert: {}", e)))
    }

    pub fn ca_key_pem(&self) -> String {
        let mut key_pem = self.ca_cert.serialize_private_key_pem();
        if !key_pem.ends_with('\n') {
            key_pem.push('\n');
        }
        key_pem
    }

    /// Convert into the authority the interception engine signs leaf certificates with.
    pub fn into_authority(self) -> Result<RcgenAuthority> {
        // Hudsucker/Rustls expects DER, not PEM.
        let ca_cert_der = self
            .ca_cert
            .serialize_der()
            .map_err(|e| ProxyError::Certificate(format!("Failed to serialize CA cert DER: {}", e)))?;
        let ca_key_der = self.ca_cert.serialize_private_key_der();

        RcgenAuthority::new(
            rustls::PrivateKey(ca_key_der),
            rustls::Certificate(ca_cert_der),
            LEAF_CACHE_SIZE,
        )
        .map_err(|e| ProxyError::Certificate(format!("Failed to create CA authority: {}", e)))
    }
}
