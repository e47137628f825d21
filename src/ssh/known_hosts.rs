//! Known hosts management for SSH host key verification
//!
//! Holds an OpenSSH-format `known_hosts` file in memory and applies the
//! configured [`HostKeyPolicy`] when a server presents its key.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::config::HostKeyPolicy;
use super::error::SshError;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches known_hosts entry
    Verified,
    /// Host not in known_hosts (first connection)
    Unknown { fingerprint: String },
    /// Key changed from known_hosts entry (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// Decides whether a server host key is trusted.
///
/// Called once per connection from the SSH handshake. Returning an error
/// aborts the connection attempt.
#[async_trait]
pub trait HostKeyVerifier: Send + Sync {
    async fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError>;
}

/// Entry in known_hosts: (key_type, base64_key)
#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// In-memory view of a known_hosts file
pub struct KnownHostsStore {
    /// Cache of host -> list of keys (supports multiple key types per host)
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    /// Path to known_hosts file
    path: PathBuf,
}

impl KnownHostsStore {
    /// Default location: `~/.ssh/known_hosts`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from("known_hosts"))
    }

    /// Open the store at `path`. A missing file is treated as empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SshError> {
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path: path.into(),
        };
        store.load()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load known_hosts file
    fn load(&self) -> Result<(), SshError> {
        if !self.path.exists() {
            debug!("known_hosts not found at {}", self.path.display());
            return Ok(());
        }

        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut hosts = self.hosts.write();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                // Hashed hostnames (|1|...) cannot be matched by name
                if hostname.starts_with('|') {
                    continue;
                }
                hosts
                    .entry(hostname.to_lowercase())
                    .or_default()
                    .push(entry.clone());
                entry_count += 1;
            }
        }

        info!(
            "Loaded {} known host entries ({} unique hosts) from {}",
            entry_count,
            hosts.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Create lookup key for host:port
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// Compute SHA256 fingerprint of public key
    pub fn fingerprint(key: &PublicKey) -> String {
        Self::fingerprint_bytes(&key.public_key_bytes())
    }

    fn fingerprint_bytes(bytes: &[u8]) -> String {
        let hash = Sha256::digest(bytes);
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    /// Verify a host's public key against the stored entries
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_key_b64 = BASE64.encode(key.public_key_bytes());
        let actual_key_type = key.algorithm().as_str().to_string();
        let fingerprint = Self::fingerprint(key);

        let hosts = self.hosts.read();
        let Some(entries) = hosts.get(&lookup_key) else {
            debug!("Unknown host: {}", lookup_key);
            return HostKeyVerification::Unknown { fingerprint };
        };

        let mut same_type = entries.iter().filter(|e| e.key_type == actual_key_type);
        if same_type.clone().any(|e| e.key_data == actual_key_b64) {
            debug!(
                "Host key verified for {} (type: {})",
                lookup_key, actual_key_type
            );
            return HostKeyVerification::Verified;
        }
        if let Some(entry) = same_type.next() {
            let expected_fingerprint = BASE64
                .decode(&entry.key_data)
                .map(|bytes| Self::fingerprint_bytes(&bytes))
                .unwrap_or_else(|_| "unknown".to_string());
            return HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint: fingerprint,
            };
        }

        // Host known, but not for this key type
        debug!(
            "Host {} known but no {} key stored, treating as new",
            lookup_key, actual_key_type
        );
        HostKeyVerification::Unknown { fingerprint }
    }

    /// Add a new host key, in memory and on disk.
    ///
    /// Returns `false` when the key is already stored. Blocking file I/O.
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<bool, SshError> {
        self.record(host, port, key, false)
    }

    /// Record a first-seen key. Fails if a different key of the same type
    /// was recorded for the host in the meantime.
    fn trust_first_use(&self, host: &str, port: u16, key: &PublicKey) -> Result<bool, SshError> {
        self.record(host, port, key, true)
    }

    /// The check and the in-memory insert happen under one write lock, so
    /// only the inserting caller appends to the file.
    fn record(
        &self,
        host: &str,
        port: u16,
        key: &PublicKey,
        reject_other_keys: bool,
    ) -> Result<bool, SshError> {
        let lookup_key = Self::make_key(host, port);
        let key_b64 = BASE64.encode(key.public_key_bytes());
        let key_type = key.algorithm().as_str().to_string();

        {
            let mut hosts = self.hosts.write();
            let entries = hosts.entry(lookup_key.clone()).or_default();
            let mut same_type = entries.iter().filter(|e| e.key_type == key_type);
            if same_type.clone().any(|e| e.key_data == key_b64) {
                debug!("Host key for {} already stored", lookup_key);
                return Ok(false);
            }
            if reject_other_keys {
                if let Some(entry) = same_type.next() {
                    let expected = BASE64
                        .decode(&entry.key_data)
                        .map(|bytes| Self::fingerprint_bytes(&bytes))
                        .unwrap_or_else(|_| "unknown".to_string());
                    return Err(SshError::HostKeyRejected(format!(
                        "key for {}:{} has changed (expected {}, got {})",
                        host,
                        port,
                        expected,
                        Self::fingerprint(key)
                    )));
                }
            }
            entries.push(HostKeyEntry {
                key_type: key_type.clone(),
                key_data: key_b64.clone(),
            });
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {} {}", lookup_key, key_type, key_b64)?;

        info!(
            "Added host key for {} (type: {}) to {}",
            lookup_key,
            key_type,
            self.path.display()
        );
        Ok(true)
    }
}

/// [`HostKeyVerifier`] driven by a [`HostKeyPolicy`]
pub struct HostKeyTrust {
    policy: HostKeyPolicy,
    /// Absent for [`HostKeyPolicy::AutoAccept`]
    store: Option<Arc<KnownHostsStore>>,
}

impl HostKeyTrust {
    /// Accept every key. No known_hosts file is read or written.
    pub fn auto_accept() -> Self {
        Self {
            policy: HostKeyPolicy::AutoAccept,
            store: None,
        }
    }

    /// Build the verifier for `policy`, opening `known_hosts` when the policy needs it
    pub fn new(policy: HostKeyPolicy, known_hosts: Option<PathBuf>) -> Result<Self, SshError> {
        if policy == HostKeyPolicy::AutoAccept {
            return Ok(Self::auto_accept());
        }
        let path = known_hosts.unwrap_or_else(KnownHostsStore::default_path);
        Ok(Self {
            policy,
            store: Some(Arc::new(KnownHostsStore::open(path)?)),
        })
    }
}

#[async_trait]
impl HostKeyVerifier for HostKeyTrust {
    async fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        let Some(store) = &self.store else {
            debug!(
                "Accepting host key for {}:{} without verification ({})",
                host,
                port,
                KnownHostsStore::fingerprint(key)
            );
            return Ok(());
        };

        match store.verify(host, port, key) {
            HostKeyVerification::Verified => {
                info!("Host key verified for {}:{}", host, port);
                Ok(())
            }
            HostKeyVerification::Unknown { fingerprint } => match self.policy {
                HostKeyPolicy::TrustOnFirstUse => {
                    info!(
                        "TOFU: trusting new host {}:{} (fingerprint: {})",
                        host, port, fingerprint
                    );
                    let store = store.clone();
                    let (host, key) = (host.to_string(), key.clone());
                    let recorded = tokio::task::spawn_blocking(move || {
                        store.trust_first_use(&host, port, &key)
                    })
                    .await
                    .map_err(|e| SshError::HostKeyRejected(format!("key check failed: {}", e)))?;
                    match recorded {
                        Ok(_) => Ok(()),
                        Err(e @ SshError::HostKeyRejected(_)) => Err(e),
                        Err(e) => {
                            warn!("Failed to save host key: {}", e);
                            Ok(())
                        }
                    }
                }
                _ => {
                    warn!(
                        "Unknown host key for {}:{} (fingerprint: {}), rejecting",
                        host, port, fingerprint
                    );
                    Err(SshError::HostKeyRejected(format!(
                        "unknown host {}:{} (fingerprint {})",
                        host, port, fingerprint
                    )))
                }
            },
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}",
                    host, port, expected_fingerprint, actual_fingerprint
                );
                Err(SshError::HostKeyRejected(format!(
                    "key for {}:{} has changed (expected {}, got {})",
                    host, port, expected_fingerprint, actual_fingerprint
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::Algorithm;
    use russh::keys::PrivateKey;
    use tempfile::tempdir;

    fn random_key() -> PublicKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone()
    }

    #[test]
    fn test_make_key() {
        assert_eq!(KnownHostsStore::make_key("GitHub.com", 22), "github.com");
        assert_eq!(
            KnownHostsStore::make_key("server.com", 2222),
            "[server.com]:2222"
        );
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = KnownHostsStore::open(dir.path().join("known_hosts")).unwrap();
        let key = random_key();
        assert!(matches!(
            store.verify("example.com", 22, &key),
            HostKeyVerification::Unknown { .. }
        ));
    }

    #[test]
    fn test_add_then_verify_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ssh").join("known_hosts");
        let key = random_key();

        let store = KnownHostsStore::open(&path).unwrap();
        assert!(store.add_host("10.0.0.5", 2222, &key).unwrap());
        assert_eq!(
            store.verify("10.0.0.5", 2222, &key),
            HostKeyVerification::Verified
        );
        // Port is part of the identity
        assert!(matches!(
            store.verify("10.0.0.5", 22, &key),
            HostKeyVerification::Unknown { .. }
        ));

        let reloaded = KnownHostsStore::open(&path).unwrap();
        assert_eq!(
            reloaded.verify("10.0.0.5", 2222, &key),
            HostKeyVerification::Verified
        );
    }

    #[test]
    fn test_changed_key_detected() {
        let dir = tempdir().unwrap();
        let store = KnownHostsStore::open(dir.path().join("known_hosts")).unwrap();
        let original = random_key();
        store.add_host("example.com", 22, &original).unwrap();

        let imposter = random_key();
        match store.verify("example.com", 22, &imposter) {
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                assert_eq!(expected_fingerprint, KnownHostsStore::fingerprint(&original));
                assert_eq!(actual_fingerprint, KnownHostsStore::fingerprint(&imposter));
            }
            other => panic!("expected Changed, got {:?}", other),
        }
    }

    #[test]
    fn test_any_matching_entry_verifies() {
        let dir = tempdir().unwrap();
        let store = KnownHostsStore::open(dir.path().join("known_hosts")).unwrap();
        let old = random_key();
        let current = random_key();
        store.add_host("rotated.example", 22, &old).unwrap();
        store.add_host("rotated.example", 22, &current).unwrap();

        assert_eq!(
            store.verify("rotated.example", 22, &current),
            HostKeyVerification::Verified
        );
    }

    #[tokio::test]
    async fn test_tofu_records_then_rejects_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let trust = HostKeyTrust::new(HostKeyPolicy::TrustOnFirstUse, Some(path.clone())).unwrap();

        let key = random_key();
        trust.verify("example.com", 22, &key).await.unwrap();
        assert!(fs::read_to_string(&path).unwrap().contains("example.com ssh-ed25519 "));

        trust.verify("example.com", 22, &key).await.unwrap();
        let err = trust
            .verify("example.com", 22, &random_key())
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::HostKeyRejected(_)));
    }

    #[test]
    fn test_adding_known_key_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let store = KnownHostsStore::open(&path).unwrap();
        let key = random_key();

        assert!(store.add_host("example.com", 22, &key).unwrap());
        assert!(!store.add_host("example.com", 22, &key).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_first_use_refuses_key_recorded_meanwhile() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let store = KnownHostsStore::open(&path).unwrap();
        let first = random_key();
        assert!(store.trust_first_use("example.com", 22, &first).unwrap());

        let err = store
            .trust_first_use("example.com", 22, &random_key())
            .unwrap_err();
        assert!(matches!(err, SshError::HostKeyRejected(_)));
        assert!(!store.trust_first_use("example.com", 22, &first).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_use_writes_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let trust = Arc::new(
            HostKeyTrust::new(HostKeyPolicy::TrustOnFirstUse, Some(path.clone())).unwrap(),
        );
        let key = random_key();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let trust = trust.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                trust.verify("race.example", 22, &key).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[tokio::test]
    async fn test_pinned_rejects_unknown() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let key = random_key();
        KnownHostsStore::open(&path)
            .unwrap()
            .add_host("pinned.example", 22, &key)
            .unwrap();

        let trust = HostKeyTrust::new(HostKeyPolicy::PinnedKnownHosts, Some(path.clone())).unwrap();
        trust.verify("pinned.example", 22, &key).await.unwrap();
        assert!(trust.verify("other.example", 22, &key).await.is_err());
        // Pinned mode never writes
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[tokio::test]
    async fn test_auto_accept_accepts_anything() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let trust = HostKeyTrust::new(HostKeyPolicy::AutoAccept, Some(path.clone())).unwrap();
        trust.verify("anything", 22, &random_key()).await.unwrap();
        assert!(!path.exists());
    }
}
