//! Certificate Authority management.
//!
//! Owns the on-disk trust root: the CA certificate, the CA private key and
//! the single leaf key-pair shared by every minted host certificate. Missing
//! pieces are generated on first use.

use std::fs;
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyIdMethod, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::CertificateDer;
use time::{Duration, OffsetDateTime};

pub use crate::error::CaManagerError;

/// CA certificate and key file names.
const CA_CERT_FILENAME: &str = "sluice-ca.crt";
const CA_KEY_FILENAME: &str = "sluice-ca.key";
const LEAF_KEY_FILENAME: &str = "sluice-leaf.key";

const CA_COMMON_NAME: &str = "Sluice Root CA";
const CA_VALIDITY_DAYS: i64 = 3650;

/// PEM material for the certificate authority.
#[derive(Clone)]
pub struct CaBundle {
    pub ca_cert_pem: String,
    pub ca_key_pem: String,
    pub leaf_key_pem: String,
}

impl std::fmt::Debug for CaBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaBundle")
            .field("ca_cert_pem", &format!("{} bytes", self.ca_cert_pem.len()))
            .field("ca_key_pem", &"<redacted>")
            .field("leaf_key_pem", &"<redacted>")
            .finish()
    }
}

/// Manages the root CA files for the proxy.
#[derive(Debug, Clone)]
pub struct CaManager {
    ca_dir: PathBuf,
}

impl CaManager {
    /// Creates a new CA manager with the given directory.
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        Self {
            ca_dir: ca_dir.as_ref().to_path_buf(),
        }
    }

    /// Creates a CA manager using the default Sluice data directory.
    pub fn with_default_dir() -> Result<Self, CaManagerError> {
        let project_dirs = sluice_core::config::project_dirs()
            .ok_or_else(|| CaManagerError::Generation("Failed to get project dirs".into()))?;

        Ok(Self::new(project_dirs.data_dir().join("ca")))
    }

    /// Returns the CA directory.
    pub fn ca_dir(&self) -> &Path {
        &self.ca_dir
    }

    /// Returns the path to the CA certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    /// Returns the path to the CA private key file.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    /// Returns the path to the shared leaf private key file.
    pub fn leaf_key_path(&self) -> PathBuf {
        self.ca_dir.join(LEAF_KEY_FILENAME)
    }

    /// Checks if the CA certificate and key exist.
    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Loads the trust root, generating whatever is missing.
    pub fn ensure_ca(&self) -> Result<CaBundle, CaManagerError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        if !self.leaf_key_path().exists() {
            self.generate_leaf_key()?;
        }
        self.load()
    }

    /// Generates a new root CA certificate and key.
    pub fn generate_ca(&self) -> Result<(), CaManagerError> {
        fs::create_dir_all(&self.ca_dir)?;

        let key_pair =
            KeyPair::generate().map_err(|e| CaManagerError::Generation(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, "Sluice");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.key_identifier_method = KeyIdMethod::Sha256;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        write_file(&self.cert_path(), &cert.pem(), false)?;
        write_file(&self.key_path(), &key_pair.serialize_pem(), true)?;

        tracing::info!("Generated new CA certificate at {:?}", self.cert_path());

        Ok(())
    }

    /// Generates the shared leaf key-pair. RSA when the crypto backend can
    /// produce it, ECDSA P-256 otherwise.
    pub fn generate_leaf_key(&self) -> Result<(), CaManagerError> {
        fs::create_dir_all(&self.ca_dir)?;

        let key_pair = KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)
            .or_else(|_| KeyPair::generate())
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        write_file(&self.leaf_key_path(), &key_pair.serialize_pem(), true)?;

        tracing::info!("Generated leaf key at {:?}", self.leaf_key_path());

        Ok(())
    }

    /// Reads all three PEM files.
    pub fn load(&self) -> Result<CaBundle, CaManagerError> {
        Ok(CaBundle {
            ca_cert_pem: fs::read_to_string(self.cert_path())?,
            ca_key_pem: fs::read_to_string(self.key_path())?,
            leaf_key_pem: fs::read_to_string(self.leaf_key_path())?,
        })
    }

    /// Reads the CA certificate as DER bytes (for installation).
    pub fn read_cert_der(&self) -> Result<Vec<u8>, CaManagerError> {
        let pem = fs::read(self.cert_path())?;
        let cert = first_cert_der(&pem)?;
        Ok(cert.as_ref().to_vec())
    }

    /// Copies the CA certificate to `dest`, as PEM or as DER when the
    /// destination ends in `.der` or `.cer`.
    pub fn export_cert(&self, dest: &Path) -> Result<(), CaManagerError> {
        let der = matches!(
            dest.extension().and_then(|e| e.to_str()),
            Some("der") | Some("cer")
        );
        if der {
            let bytes = self.read_cert_der()?;
            fs::write(dest, bytes).map_err(|e| CaManagerError::Write(e.to_string()))?;
        } else {
            fs::copy(self.cert_path(), dest).map_err(|e| CaManagerError::Write(e.to_string()))?;
        }
        tracing::info!("Exported CA certificate to {:?}", dest);
        Ok(())
    }
}

/// Parses the first certificate out of PEM data.
pub(crate) fn first_cert_der(pem: &[u8]) -> Result<CertificateDer<'static>, CaManagerError> {
    let mut reader = pem;
    let cert = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| CaManagerError::Parse("no certificate in PEM".into()))?
        .map_err(|e| CaManagerError::Parse(e.to_string()));
    cert
}

fn write_file(path: &Path, contents: &str, private: bool) -> Result<(), CaManagerError> {
    fs::write(path, contents).map_err(|e| CaManagerError::Write(e.to_string()))?;

    #[cfg(unix)]
    if private {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(|e| CaManagerError::Write(e.to_string()))?;
    }
    #[cfg(not(unix))]
    let _ = private;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ca_manager_paths() {
        let manager = CaManager::new("/tmp/test-ca");
        assert_eq!(manager.cert_path(), PathBuf::from("/tmp/test-ca/sluice-ca.crt"));
        assert_eq!(manager.key_path(), PathBuf::from("/tmp/test-ca/sluice-ca.key"));
        assert_eq!(
            manager.leaf_key_path(),
            PathBuf::from("/tmp/test-ca/sluice-leaf.key")
        );
    }

    #[test]
    fn ca_manager_not_exists_initially() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));
        assert!(!manager.ca_exists());
    }

    #[test]
    fn ensure_ca_generates_everything() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));

        let bundle = manager.ensure_ca().unwrap();
        assert!(manager.ca_exists());
        assert!(manager.leaf_key_path().exists());
        assert!(bundle.ca_cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(bundle.leaf_key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn ensure_ca_is_stable() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));

        let first = manager.ensure_ca().unwrap();
        let second = manager.ensure_ca().unwrap();
        assert_eq!(first.ca_cert_pem, second.ca_cert_pem);
        assert_eq!(first.leaf_key_pem, second.leaf_key_pem);
    }

    #[test]
    fn missing_leaf_key_is_regenerated_alone() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));

        let first = manager.ensure_ca().unwrap();
        fs::remove_file(manager.leaf_key_path()).unwrap();
        let second = manager.ensure_ca().unwrap();

        assert_eq!(first.ca_cert_pem, second.ca_cert_pem);
        assert_ne!(first.leaf_key_pem, second.leaf_key_pem);
    }

    #[test]
    fn read_cert_der_and_export() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));
        manager.ensure_ca().unwrap();

        let der = manager.read_cert_der().unwrap();
        assert_eq!(der[0], 0x30);

        let pem_out = temp_dir.path().join("root.pem");
        manager.export_cert(&pem_out).unwrap();
        assert_eq!(
            fs::read_to_string(&pem_out).unwrap(),
            fs::read_to_string(manager.cert_path()).unwrap()
        );

        let der_out = temp_dir.path().join("root.der");
        manager.export_cert(&der_out).unwrap();
        assert_eq!(fs::read(&der_out).unwrap(), der);
    }

    #[cfg(unix)]
    #[test]
    fn private_keys_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));
        manager.ensure_ca().unwrap();

        let mode = fs::metadata(manager.key_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
