//! Certificate authority for TLS interception
//! Owns the root credential and issues per-host leaf certificates on demand

use crate::error::{ProxyError, Result};
use crate::wire::strip_port;
use parking_lot::RwLock;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, PKCS_RSA_SHA256,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

/// File name of the persisted root certificate
pub const ROOT_CERT_FILE: &str = "ca.crt";
/// File name of the persisted root private key
pub const ROOT_KEY_FILE: &str = "ca.key";

const RSA_KEY_BITS: usize = 2048;
const ORGANIZATION: &str = "MockProxy CA";
const ORGANIZATIONAL_UNIT: &str = "MITM Development";
const ROOT_COMMON_NAME: &str = "MockProxy Root CA";

/// Root certificate and key used only to sign leaf certificates
pub struct RootCredential {
    cert_pem: String,
    key_pem: String,
    cert_der: CertificateDer<'static>,
    signer: Certificate,
}

impl RootCredential {
    /// Generate a fresh self-signed RSA-2048 root valid for ten years
    pub fn generate() -> Result<Self> {
        let key_pair = generate_rsa_key_pair()?;
        let key_pem = key_pair.serialize_pem();

        let mut params = CertificateParams::default();
        params.alg = &PKCS_RSA_SHA256;
        params.distinguished_name = distinguished_name(ROOT_COMMON_NAME);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(10 * 365);
        params.key_pair = Some(key_pair);

        let signer = Certificate::from_params(params)?;
        let cert_pem = signer.serialize_pem()?;
        let cert_der = CertificateDer::from(signer.serialize_der()?);

        info!("Generated new root CA certificate");

        Ok(Self {
            cert_pem,
            key_pem,
            cert_der,
            signer,
        })
    }

    /// Rebuild a root credential from its PEM encoded certificate and key
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem, key_pair)?;
        let signer = Certificate::from_params(params)?;

        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| ProxyError::Pem("no certificate found".to_string()))?
            .map_err(|e| ProxyError::Pem(e.to_string()))?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            cert_der,
            signer,
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Issue a leaf certificate for `host`, valid from one hour ago for one year
    fn issue_leaf(&self, host: &str) -> Result<LeafCertificate> {
        let key_pair = generate_rsa_key_pair()?;
        let key_der = PrivatePkcs8KeyDer::from(key_pair.serialize_der());

        let mut params = CertificateParams::default();
        params.alg = &PKCS_RSA_SHA256;
        params.distinguished_name = distinguished_name(host);
        params.subject_alt_names = match host.parse::<IpAddr>() {
            Ok(ip) => vec![SanType::IpAddress(ip)],
            Err(_) => vec![SanType::DnsName(host.to_string())],
        };
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(1);
        params.not_after = now + Duration::days(365);
        params.key_pair = Some(key_pair);

        let cert = Certificate::from_params(params)?;
        let cert_der = CertificateDer::from(cert.serialize_der_with_signer(&self.signer)?);

        Ok(LeafCertificate {
            host: host.to_string(),
            cert_der,
            key_der,
        })
    }
}

/// Host-bound certificate signed by the root, shared read-only with tunnels
pub struct LeafCertificate {
    host: String,
    cert_der: CertificateDer<'static>,
    key_der: PrivatePkcs8KeyDer<'static>,
}

impl LeafCertificate {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Build a rustls server configuration presenting this certificate
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![self.cert_der.clone()],
                PrivateKeyDer::Pkcs8(self.key_der.clone_key()),
            )?;

        Ok(Arc::new(config))
    }
}

/// On-disk location of the root credential
pub struct CaStorage {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl CaStorage {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        Ok(Self {
            cert_path: dir.join(ROOT_CERT_FILE),
            key_path: dir.join(ROOT_KEY_FILE),
        })
    }

    /// Load the root credential, `Ok(None)` when nothing has been saved yet
    pub fn load_root(&self) -> Result<Option<RootCredential>> {
        if !self.cert_path.exists() || !self.key_path.exists() {
            return Ok(None);
        }

        let cert_pem = fs::read_to_string(&self.cert_path)?;
        let key_pem = fs::read_to_string(&self.key_path)?;

        RootCredential::from_pem(&cert_pem, &key_pem).map(Some)
    }

    pub fn save_root(&self, root: &RootCredential) -> Result<()> {
        fs::write(&self.cert_path, root.cert_pem())?;
        write_private(&self.key_path, root.key_pem.as_bytes())?;

        info!(
            cert = %self.cert_path.display(),
            key = %self.key_path.display(),
            "Saved root CA certificate and key"
        );

        Ok(())
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }
}

struct CaState {
    root: RootCredential,
    leaves: HashMap<String, Arc<LeafCertificate>>,
}

/// Certificate authority issuing and caching leaf certificates per hostname
pub struct CertificateAuthority {
    storage: CaStorage,
    state: RwLock<CaState>,
}

impl CertificateAuthority {
    /// Load the root from `certs_dir`, generating and saving a new one when
    /// it is missing or unreadable
    pub fn initialize<P: AsRef<Path>>(certs_dir: P) -> Result<Self> {
        let storage = CaStorage::new(certs_dir)?;

        let root = match storage.load_root() {
            Ok(Some(root)) => {
                info!(path = %storage.cert_path().display(), "Loaded root CA certificate");
                root
            }
            Ok(None) => {
                info!("No root CA found, generating one");
                Self::create_root(&storage)?
            }
            Err(e) => {
                warn!("Stored root CA is unusable ({}), generating a new one", e);
                Self::create_root(&storage)?
            }
        };

        Ok(Self {
            storage,
            state: RwLock::new(CaState {
                root,
                leaves: HashMap::new(),
            }),
        })
    }

    fn create_root(storage: &CaStorage) -> Result<RootCredential> {
        let root = RootCredential::generate()?;
        storage.save_root(&root)?;
        Ok(root)
    }

    /// Return the leaf certificate for `host_port`, issuing it on first use
    pub fn issue_for(&self, host_port: &str) -> Result<Arc<LeafCertificate>> {
        let host = strip_port(host_port);

        {
            let state = self.state.read();
            if let Some(leaf) = state.leaves.get(host) {
                return Ok(leaf.clone());
            }
        }

        let mut state = self.state.write();
        if let Some(leaf) = state.leaves.get(host) {
            return Ok(leaf.clone());
        }

        let leaf = Arc::new(state.root.issue_leaf(host)?);
        state.leaves.insert(host.to_string(), leaf.clone());

        debug!(host = %host, "Issued leaf certificate");

        Ok(leaf)
    }

    /// Discard every cached leaf and replace the root with a new one
    pub fn regenerate(&self) -> Result<()> {
        let mut state = self.state.write();
        state.leaves.clear();

        let root = Self::create_root(&self.storage)?;
        state.root = root;

        info!("Root CA regenerated, clients must trust the new certificate");

        Ok(())
    }

    pub fn root_pem(&self) -> String {
        self.state.read().root.cert_pem().to_string()
    }

    pub fn root_der(&self) -> CertificateDer<'static> {
        self.state.read().root.cert_der().clone()
    }

    /// Number of leaf certificates currently cached
    pub fn cached_leaves(&self) -> usize {
        self.state.read().leaves.len()
    }
}

fn generate_rsa_key_pair() -> Result<KeyPair> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)?;
    let pkcs8 = private_key.to_pkcs8_der()?;

    Ok(KeyPair::from_der(pkcs8.as_bytes())?)
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn.push(
        DnType::OrganizationalUnitName,
        DnValue::Utf8String(ORGANIZATIONAL_UNIT.to_string()),
    );
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    Ok(())
}
