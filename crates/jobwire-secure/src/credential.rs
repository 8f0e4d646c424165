//! Process identity used to authenticate to collectors.
//!
//! A credential file is TOML:
//!
//! ```toml
//! principal   = "/DC=org/DC=example/CN=ce01.example.org"
//! private_key = "<64 hex chars>"
//! public_key  = "<64 hex chars>"
//! not_after   = 1924992000          # unix seconds
//!
//! [[trusted]]
//! principal  = "/DC=org/DC=example/CN=collector.example.org"
//! public_key = "<64 hex chars>"
//! ```

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{error::CredentialError, handshake::Role, mechanism::noise};

/// Environment variable consulted when no explicit credential path is configured.
pub const CREDENTIAL_ENV: &str = "JOBWIRE_CREDENTIAL";

const KEY_LEN: usize = 32;

/// Which side(s) of a handshake a credential may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialUsage {
    Initiate,
    Accept,
    Both,
}

impl CredentialUsage {
    pub fn permits(&self, role: Role) -> bool {
        matches!(
            (self, role),
            (CredentialUsage::Both, _)
                | (CredentialUsage::Initiate, Role::Initiator)
                | (CredentialUsage::Accept, Role::Acceptor)
        )
    }
}

/// Peer principal bound to a static public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedPeer {
    pub principal: String,
    pub public_key: Vec<u8>,
}

/// Static keys this process accepts, each bound to exactly one principal.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    peers: Vec<TrustedPeer>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, principal: impl Into<String>, public_key: impl Into<Vec<u8>>) {
        let public_key = public_key.into();
        self.peers.retain(|p| p.public_key != public_key);
        self.peers.push(TrustedPeer {
            principal: principal.into(),
            public_key,
        });
    }

    /// Principal the key is trusted as.
    pub fn principal_for(&self, public_key: &[u8]) -> Option<&str> {
        self.peers
            .iter()
            .find(|p| p.public_key == public_key)
            .map(|p| p.principal.as_str())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Identity proof of this process. Immutable once acquired.
#[derive(Clone)]
pub struct Credential {
    principal: String,
    usage: CredentialUsage,
    private_key: Vec<u8>,
    public_key: Vec<u8>,
    not_after: SystemTime,
    trust: TrustStore,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("principal", &self.principal)
            .field("usage", &self.usage)
            .field("public_key", &hex::encode(&self.public_key))
            .field("not_after", &self.not_after)
            .field("trusted", &self.trust.len())
            .finish_non_exhaustive()
    }
}

impl Credential {
    /// Fresh credential with a newly generated static key and an empty trust store.
    pub fn generate(
        principal: impl Into<String>,
        usage: CredentialUsage,
        lifetime: Duration,
    ) -> Result<Self, CredentialError> {
        let (private_key, public_key) = noise::generate_keypair()
            .map_err(|e| CredentialError::Malformed(format!("key generation: {e}")))?;
        Ok(Self {
            principal: principal.into(),
            usage,
            private_key,
            public_key,
            not_after: SystemTime::now() + lifetime,
            trust: TrustStore::new(),
        })
    }

    /// Trust `principal` under `public_key`.
    pub fn with_trusted(mut self, principal: impl Into<String>, public_key: &[u8]) -> Self {
        self.trust.add(principal, public_key.to_vec());
        self
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn usage(&self) -> CredentialUsage {
        self.usage
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub(crate) fn private_key(&self) -> &[u8] {
        &self.private_key
    }

    pub fn not_after(&self) -> SystemTime {
        self.not_after
    }

    pub fn trust(&self) -> &TrustStore {
        &self.trust
    }

    pub fn is_expired(&self) -> bool {
        SystemTime::now() >= self.not_after
    }

    /// Fail unless the credential is unexpired and valid for `role`.
    pub fn check_usable(&self, role: Role) -> Result<(), CredentialError> {
        if self.is_expired() {
            return Err(CredentialError::Expired {
                principal: self.principal.clone(),
            });
        }
        if !self.usage.permits(role) {
            return Err(CredentialError::WrongUsage {
                principal: self.principal.clone(),
                usage: role.as_str(),
            });
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct CredentialFile {
    principal: String,
    private_key: String,
    public_key: String,
    not_after: u64,
    #[serde(default)]
    trusted: Vec<TrustedFileEntry>,
}

#[derive(Serialize, Deserialize)]
struct TrustedFileEntry {
    principal: String,
    public_key: String,
}

impl Credential {
    /// Write the credential in the format [`acquire_credential`] reads.
    pub fn store(&self, path: &Path) -> Result<(), CredentialError> {
        let not_after = self
            .not_after
            .duration_since(UNIX_EPOCH)
            .map_err(|_| CredentialError::Query("expiry predates the unix epoch".into()))?
            .as_secs();
        let file = CredentialFile {
            principal: self.principal.clone(),
            private_key: hex::encode(&self.private_key),
            public_key: hex::encode(&self.public_key),
            not_after,
            trusted: self
                .trust
                .peers
                .iter()
                .map(|p| TrustedFileEntry {
                    principal: p.principal.clone(),
                    public_key: hex::encode(&p.public_key),
                })
                .collect(),
        };
        let body = toml::to_string(&file).map_err(|e| CredentialError::Malformed(e.to_string()))?;
        fs::write(path, body).map_err(|source| CredentialError::Unwritable {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Load this process's credential.
///
/// `path` wins over the [`CREDENTIAL_ENV`] environment variable.
pub fn acquire_credential(
    usage: CredentialUsage,
    path: Option<&Path>,
) -> Result<Credential, CredentialError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => std::env::var_os(CREDENTIAL_ENV)
            .map(PathBuf::from)
            .ok_or(CredentialError::Missing)?,
    };

    let raw = fs::read_to_string(&path).map_err(|source| CredentialError::Unreadable {
        path: path.clone(),
        source,
    })?;
    let cred = parse_credential(&raw, usage)?;
    if cred.is_expired() {
        return Err(CredentialError::Expired {
            principal: cred.principal,
        });
    }

    debug!(
        principal = %cred.principal,
        path = %path.display(),
        trusted = cred.trust.len(),
        "credential acquired"
    );
    Ok(cred)
}

fn parse_credential(raw: &str, usage: CredentialUsage) -> Result<Credential, CredentialError> {
    let file: CredentialFile =
        toml::from_str(raw).map_err(|e| CredentialError::Malformed(e.to_string()))?;
    if file.principal.trim().is_empty() {
        return Err(CredentialError::Malformed("empty principal".into()));
    }

    let mut trust = TrustStore::new();
    for entry in file.trusted {
        trust.add(entry.principal, decode_key("trusted public_key", &entry.public_key)?);
    }

    Ok(Credential {
        principal: file.principal,
        usage,
        private_key: decode_key("private_key", &file.private_key)?,
        public_key: decode_key("public_key", &file.public_key)?,
        not_after: UNIX_EPOCH + Duration::from_secs(file.not_after),
        trust,
    })
}

fn decode_key(field: &str, value: &str) -> Result<Vec<u8>, CredentialError> {
    let key = hex::decode(value.trim())
        .map_err(|e| CredentialError::Malformed(format!("{field}: {e}")))?;
    if key.len() != KEY_LEN {
        return Err(CredentialError::Malformed(format!(
            "{field}: expected {KEY_LEN} bytes, got {}",
            key.len()
        )));
    }
    Ok(key)
}

/// Time left before `credential` expires; zero once expired.
pub fn credential_lifetime(credential: &Credential) -> Result<Duration, CredentialError> {
    credential
        .not_after
        .duration_since(UNIX_EPOCH)
        .map_err(|_| CredentialError::Query("expiry predates the unix epoch".into()))?;
    Ok(credential
        .not_after
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::ZERO))
}
