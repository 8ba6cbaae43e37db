//! PKI operations for the secured front-end
//!
//! The front-end owns a self-signed CA. Its PEM certificate is the server's
//! root of trust: it is served at `/cacerts`, embedded in the local
//! kubeconfig, and hashed into every join token.
//!
//! The CA is persisted under `<data-dir>/tls/` so restarts keep the same root
//! of trust (and therefore the same bound tokens).

use std::path::Path;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use tracing::info;

use crate::bootstrap::token::write_private;
use crate::{Error, Result};

/// Default validity period for CA certificates (10 years)
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Default validity period for serving certificates (1 year)
pub const CERT_VALIDITY_YEARS: i64 = 1;

/// CA certificate file name inside the TLS directory
pub const CA_CERT_FILE: &str = "server-ca.crt";

/// CA key file name inside the TLS directory
pub const CA_KEY_FILE: &str = "server-ca.key";

const ORGANIZATION: &str = "Lattice";

fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(years * 365);
    (now, not_after)
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}

/// Certificate Authority for the HTTPS front-end
#[derive(Clone)]
pub struct CertificateAuthority {
    /// CA key pair serialized as PEM (KeyPair isn't Clone)
    ca_key_pem: String,
    /// PEM-encoded CA certificate for distribution
    ca_cert_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("ca_key_pem", &"<redacted>")
            .finish()
    }
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate()
            .map_err(|e| Error::pki(format!("failed to generate CA key: {}", e)))?;
        let ca_key_pem = key_pair.serialize_pem();

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::pki(format!("failed to create CA cert: {}", e)))?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load a CA from PEM strings
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| Error::pki(format!("failed to parse CA key: {}", e)))?;
        if !cert_pem.contains("BEGIN CERTIFICATE") {
            return Err(Error::pki("CA certificate is not PEM encoded"));
        }

        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// Load the CA stored in `dir`, or create and store a new one
    pub fn load_or_create(dir: &Path, common_name: &str) -> Result<Self> {
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let cert = std::fs::read_to_string(&cert_path).map_err(|e| Error::io(&cert_path, e))?;
            let key = std::fs::read_to_string(&key_path).map_err(|e| Error::io(&key_path, e))?;
            let ca = Self::from_pem(&cert, &key)?;
            info!(path = %cert_path.display(), "Loaded existing CA");
            return Ok(ca);
        }

        crate::bootstrap::datadir::create_private_dir(dir).map_err(|e| Error::io(dir, e))?;

        let ca = Self::new(common_name)?;
        write_private(&key_path, ca.ca_key_pem.as_bytes())?;
        write_private(&cert_path, ca.ca_cert_pem.as_bytes())?;
        info!(path = %cert_path.display(), "Generated new CA");
        Ok(ca)
    }

    /// Get the CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| Error::pki(format!("failed to load CA key: {}", e)))
    }

    /// Generate a TLS serving certificate for the given SANs
    ///
    /// Returns `(cert_pem, key_pem)`.
    pub fn generate_server_cert(&self, sans: &[&str]) -> Result<(String, String)> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name("Lattice Server");

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        params.subject_alt_names = sans
            .iter()
            .map(|san| {
                if let Ok(ip) = san.parse::<std::net::IpAddr>() {
                    Ok(SanType::IpAddress(ip))
                } else {
                    Ia5String::try_from(san.to_string())
                        .map(SanType::DnsName)
                        .map_err(|e| Error::pki(format!("invalid DNS name '{}': {}", san, e)))
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let server_key = KeyPair::generate()
            .map_err(|e| Error::pki(format!("failed to generate server key: {}", e)))?;
        let server_key_pem = server_key.serialize_pem();

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| Error::pki(format!("failed to create issuer: {}", e)))?;

        let server_cert = params
            .signed_by(&server_key, &issuer)
            .map_err(|e| Error::pki(format!("failed to sign server cert: {}", e)))?;

        Ok((server_cert.pem(), server_key_pem))
    }
}
