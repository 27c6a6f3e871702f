//! Leaf certificate minting and caching.
//!
//! Every intercepted host gets a certificate signed by the task's CA and
//! carrying the one shared leaf public key. Certificates are cached per host
//! for the life of the task.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer,
    KeyIdMethod, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};

use crate::ca::{first_cert_der, CaBundle, CaManagerError};
use crate::error::Result;

/// Minted certificates are valid for one year.
const LEAF_VALIDITY_DAYS: i64 = 365;

/// ALPN identifier for HTTP/2.
pub const ALPN_H2: &[u8] = b"h2";

/// ALPN identifier for HTTP/1.1.
pub const ALPN_HTTP1: &[u8] = b"http/1.1";

static PROVIDER: Lazy<Arc<CryptoProvider>> =
    Lazy::new(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

/// The process-wide rustls crypto provider.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    PROVIDER.clone()
}

/// A minted host certificate.
#[derive(Debug)]
pub struct LeafCert {
    host: String,
    der: CertificateDer<'static>,
}

impl LeafCert {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }
}

/// Signs leaf certificates and memoizes them per host.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    ca_der: CertificateDer<'static>,
    leaf_key: KeyPair,
    leaf_key_der: PrivatePkcs8KeyDer<'static>,
    cache: RwLock<HashMap<String, Arc<LeafCert>>>,
    minted: AtomicU64,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cached", &self.cache.read().len())
            .field("minted", &self.minted.load(Ordering::Relaxed))
            .finish()
    }
}

impl CertificateAuthority {
    /// Builds an authority from PEM material.
    pub fn from_bundle(bundle: &CaBundle) -> std::result::Result<Self, CaManagerError> {
        let ca_key = KeyPair::from_pem(&bundle.ca_key_pem)
            .map_err(|e| CaManagerError::Parse(format!("CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(&bundle.ca_cert_pem, ca_key)
            .map_err(|e| CaManagerError::Parse(format!("CA certificate: {e}")))?;
        let ca_der = first_cert_der(bundle.ca_cert_pem.as_bytes())?;

        let leaf_key = KeyPair::from_pem(&bundle.leaf_key_pem)
            .map_err(|e| CaManagerError::Parse(format!("leaf key: {e}")))?;
        let leaf_key_der = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());

        Ok(Self {
            issuer,
            ca_der,
            leaf_key,
            leaf_key_der,
            cache: RwLock::new(HashMap::new()),
            minted: AtomicU64::new(0),
        })
    }

    /// The CA certificate in DER form.
    pub fn ca_der(&self) -> &CertificateDer<'static> {
        &self.ca_der
    }

    /// Returns the cached certificate for `host`, minting it on first use.
    ///
    /// Concurrent first requests for the same host store exactly one
    /// certificate; losers of the race get the winner's.
    pub fn leaf_for(&self, host: &str) -> Result<Arc<LeafCert>> {
        let host = host.to_ascii_lowercase();

        if let Some(cert) = self.cache.read().get(&host) {
            return Ok(cert.clone());
        }

        let mut cache = self.cache.write();
        if let Some(cert) = cache.get(&host) {
            return Ok(cert.clone());
        }

        let der = mint_leaf(&host, &self.issuer, &self.leaf_key)?;
        self.minted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(host = %host, "minted leaf certificate");

        let cert = Arc::new(LeafCert { host: host.clone(), der });
        cache.insert(host, cert.clone());
        Ok(cert)
    }

    /// Builds a TLS server context presenting `leaf` with the shared key.
    pub fn server_config(&self, leaf: &LeafCert, alpn: &[&[u8]]) -> Result<Arc<ServerConfig>> {
        let mut config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(
                vec![leaf.der.clone(), self.ca_der.clone()],
                PrivateKeyDer::Pkcs8(self.leaf_key_der.clone_key()),
            )?;
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        Ok(Arc::new(config))
    }

    /// Number of hosts in the cache.
    pub fn cached(&self) -> usize {
        self.cache.read().len()
    }

    /// Number of certificates signed so far.
    pub fn minted(&self) -> u64 {
        self.minted.load(Ordering::Relaxed)
    }
}

/// Signs a certificate for `host` with `issuer`, carrying `leaf_key`'s
/// public key.
pub fn mint_leaf(
    host: &str,
    issuer: &Issuer<'_, KeyPair>,
    leaf_key: &KeyPair,
) -> Result<CertificateDer<'static>> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    params.serial_number = Some(SerialNumber::from(
        (rand::random::<u64>() >> 1).to_be_bytes().to_vec(),
    ));

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::OcspSigning,
    ];
    params.key_identifier_method = KeyIdMethod::Sha256;
    params.use_authority_key_identifier_extension = true;

    let san = match host.parse::<IpAddr>() {
        Ok(ip) => SanType::IpAddress(ip),
        Err(_) => SanType::DnsName(host.to_string().try_into()?),
    };
    params.subject_alt_names = vec![san];

    let cert = params.signed_by(leaf_key, issuer)?;
    Ok(cert.der().clone())
}
