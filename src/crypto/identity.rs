//! Long-term node identity.
//!
//! An identity is a single X25519 key pair created at first run and persisted
//! forever; the public key doubles as the node's routing address. Only an
//! entropy-source failure during generation is fatal.

use std::path::Path;

use log::info;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

use crate::error::{MeshError, Result};
use crate::protocol::PeerId;

/// A node's long-term key pair
#[derive(Clone)]
pub struct Identity {
    secret: StaticSecret,
    public: PublicKey,
}

/// On-disk form, hex encoded
#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    private_key: String,
    public_key: String,
}

impl Identity {
    /// Generate a fresh identity. Fails only if the OS entropy source does.
    pub fn generate() -> Result<Self> {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| MeshError::Entropy(e.to_string()))?;
        Ok(Self::from_secret_bytes(seed))
    }

    /// Reconstruct an identity from raw secret bytes.
    pub fn from_secret_bytes(seed: [u8; 32]) -> Self {
        let secret = StaticSecret::from(seed);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The routing address derived from this identity.
    pub fn peer_id(&self) -> PeerId {
        PeerId(*self.public.as_bytes())
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Diffie-Hellman with a remote public key.
    pub(crate) fn diffie_hellman(&self, their_public: &PublicKey) -> SharedSecret {
        self.secret.diffie_hellman(their_public)
    }

    /// Load the identity from `path`, or generate and persist a new one.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let identity = Self::load(path)?;
            info!("Loaded identity {}", identity.peer_id().short());
            return Ok(identity);
        }

        let identity = Self::generate()?;
        identity.save(path)?;
        info!("Generated new identity {}", identity.peer_id().short());
        Ok(identity)
    }

    /// Load from the hex-encoded JSON key file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let stored: StoredIdentity = serde_json::from_str(&data)?;

        let secret_bytes = hex::decode(&stored.private_key)
            .map_err(|e| MeshError::MalformedFrame(format!("bad key file: {e}")))?;
        let seed: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| MeshError::MalformedFrame("private key must be 32 bytes".into()))?;

        let identity = Self::from_secret_bytes(seed);

        // A mismatched public key means the file was hand-edited or corrupted.
        if hex::encode(identity.public.as_bytes()) != stored.public_key {
            return Err(MeshError::MalformedFrame(
                "stored public key does not match private key".into(),
            ));
        }

        Ok(identity)
    }

    /// Persist as hex-encoded JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let stored = StoredIdentity {
            private_key: hex::encode(self.secret.to_bytes()),
            public_key: hex::encode(self.public.as_bytes()),
        };
        std::fs::write(path, serde_json::to_string_pretty(&stored)?)?;
        Ok(())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id().short())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut unique = [0u8; 8];
        OsRng.fill_bytes(&mut unique);
        std::env::temp_dir().join(format!("meshphone-{}-{}", name, hex::encode(unique)))
    }

    #[test]
    fn generated_identities_differ() {
        let a = Identity::generate().unwrap();
        let b = Identity::generate().unwrap();
        assert_ne!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn persists_and_reloads() {
        let path = temp_path("identity").join("keys.json");
        let original = Identity::load_or_generate(&path).unwrap();
        let reloaded = Identity::load_or_generate(&path).unwrap();
        assert_eq!(original.peer_id(), reloaded.peer_id());
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn rejects_tampered_key_file() {
        let path = temp_path("tampered").join("keys.json");
        let identity = Identity::load_or_generate(&path).unwrap();
        let mut stored: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        stored["public_key"] = serde_json::Value::String(hex::encode([0u8; 32]));
        std::fs::write(&path, stored.to_string()).unwrap();
        assert!(Identity::load(&path).is_err());
        drop(identity);
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn dh_is_symmetric() {
        let a = Identity::generate().unwrap();
        let b = Identity::generate().unwrap();
        let ab = a.diffie_hellman(b.public_key());
        let ba = b.diffie_hellman(a.public_key());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }
}
