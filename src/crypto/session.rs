//! Per-peer session key material and authenticated encryption.
//!
//! Sessions follow the ephemeral-static pattern: a sender mints a fresh
//! session ephemeral ("epoch") and derives its send key from
//! `DH(epoch, peer_static)` and `DH(static, peer_static)`. The epoch public
//! key travels inside every data frame, so the receiver can derive the same
//! key with no prior interaction — which is what lets us encrypt to a peer
//! that is currently unreachable and park the result in the forward queue.
//!
//! The interactive handshake on top of this negotiates the protocol version
//! and proves possession of the claimed identity key via a confirmation tag
//! keyed from the static-static shared secret.
//!
//! Send counters start at 1 and increment on every encryption; a fresh epoch
//! per process lifetime means nonces never repeat even without persisting the
//! send side. Receive counters must be strictly increasing per epoch and are
//! persisted through [`ReplayLog`].

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::debug;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{MeshError, Result};
use crate::protocol::{HandshakePayload, PeerId, PROTOCOL_VERSION, TAG_LEN};

use super::identity::Identity;
use super::replay::{EpochId, ReplayLog};

const SESSION_KDF_LABEL: &[u8] = b"meshphone/v1/session";
const HANDSHAKE_KDF_LABEL: &[u8] = b"meshphone/v1/handshake";
const TRANSCRIPT_LABEL: &[u8] = b"meshphone/v1/hs-transcript";

/// Output of [`SessionManager::encrypt`]: everything a data payload needs.
#[derive(Debug, Clone)]
pub struct SealedMessage {
    pub epoch_pub: [u8; 32],
    pub counter: u64,
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

/// Outbound key material toward one peer
struct SendSession {
    epoch_pub: [u8; 32],
    key: [u8; 32],
    counter: u64,
    last_used: DateTime<Utc>,
}

/// Inbound key material for one (peer, epoch) pair
struct RecvEpoch {
    key: [u8; 32],
    last_used: DateTime<Utc>,
}

/// Owns every session with every peer. Counters are mutated monotonically;
/// there is no global state beyond these tables and the replay log.
pub struct SessionManager {
    identity: Identity,
    send_sessions: DashMap<PeerId, SendSession>,
    recv_epochs: DashMap<(PeerId, EpochId), RecvEpoch>,
    verified: DashMap<PeerId, DateTime<Utc>>,
    replay: ReplayLog,
}

/// Truncated hash identifying a session epoch in the replay log.
pub fn epoch_id(epoch_pub: &[u8; 32]) -> EpochId {
    let digest = Sha256::digest(epoch_pub);
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest[..8]);
    id
}

fn derive_key(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn counter_nonce(counter: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    *Nonce::from_slice(&nonce)
}

impl SessionManager {
    pub fn new(identity: Identity, replay: ReplayLog) -> Self {
        Self {
            identity,
            send_sessions: DashMap::new(),
            recv_epochs: DashMap::new(),
            verified: DashMap::new(),
            replay,
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// Create a fresh outbound session toward `peer` with a new epoch.
    fn new_send_session(&self, peer: &PeerId) -> Result<SendSession> {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| MeshError::Entropy(e.to_string()))?;
        let epoch_secret = StaticSecret::from(seed);
        let epoch_pub = *PublicKey::from(&epoch_secret).as_bytes();

        let peer_public = PublicKey::from(*peer.as_bytes());
        let ephemeral_shared = epoch_secret.diffie_hellman(&peer_public);
        let static_shared = self.identity.diffie_hellman(&peer_public);

        let key = derive_key(&[
            SESSION_KDF_LABEL,
            ephemeral_shared.as_bytes(),
            static_shared.as_bytes(),
            &epoch_pub,
        ]);

        debug!(
            "New session epoch {} toward {}",
            hex::encode(&epoch_pub[..4]),
            peer.short()
        );

        Ok(SendSession {
            epoch_pub,
            key,
            counter: 0,
            last_used: Utc::now(),
        })
    }

    /// Derive (and cache) the receive key for a peer's epoch.
    fn recv_key(&self, sender: &PeerId, epoch_pub: &[u8; 32]) -> [u8; 32] {
        let id = epoch_id(epoch_pub);
        if let Some(epoch) = self.recv_epochs.get(&(*sender, id)) {
            return epoch.key;
        }

        let epoch_public = PublicKey::from(*epoch_pub);
        let sender_public = PublicKey::from(*sender.as_bytes());
        let ephemeral_shared = self.identity.diffie_hellman(&epoch_public);
        let static_shared = self.identity.diffie_hellman(&sender_public);

        let key = derive_key(&[
            SESSION_KDF_LABEL,
            ephemeral_shared.as_bytes(),
            static_shared.as_bytes(),
            epoch_pub,
        ]);

        self.recv_epochs.insert(
            (*sender, id),
            RecvEpoch {
                key,
                last_used: Utc::now(),
            },
        );
        key
    }

    /// Encrypt `plaintext` for `peer`, advancing the session send counter.
    ///
    /// The counter is never reused: it is bumped before the AEAD call and the
    /// nonce is derived from it directly.
    pub fn encrypt(&self, peer: &PeerId, plaintext: &[u8]) -> Result<SealedMessage> {
        if !self.send_sessions.contains_key(peer) {
            let session = self.new_send_session(peer)?;
            self.send_sessions.insert(*peer, session);
        }

        let mut session = self
            .send_sessions
            .get_mut(peer)
            .ok_or_else(|| MeshError::NoSession(peer.short()))?;

        session.counter += 1;
        session.last_used = Utc::now();
        let counter = session.counter;

        let aad = Self::data_aad(&self.local_id(), peer, counter);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&session.key));
        let mut sealed = cipher
            .encrypt(
                &counter_nonce(counter),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| MeshError::AuthenticationFailure)?;

        let tag_start = sealed.len() - TAG_LEN;
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&sealed[tag_start..]);
        sealed.truncate(tag_start);

        Ok(SealedMessage {
            epoch_pub: session.epoch_pub,
            counter,
            ciphertext: sealed,
            tag,
        })
    }

    /// Decrypt and authenticate a data payload from `sender`.
    ///
    /// Rejects with [`MeshError::ReplayDetected`] unless the counter is
    /// strictly greater than the last accepted counter for this epoch, and
    /// with [`MeshError::AuthenticationFailure`] on tag mismatch. Accepted
    /// counters are recorded in the replay log before returning.
    pub fn decrypt(
        &self,
        sender: &PeerId,
        epoch_pub: &[u8; 32],
        counter: u64,
        ciphertext: &[u8],
        tag: &[u8; TAG_LEN],
    ) -> Result<Vec<u8>> {
        let epoch = epoch_id(epoch_pub);
        let floor = self.replay.floor(sender, &epoch);
        if counter <= floor {
            return Err(MeshError::ReplayDetected {
                received: counter,
                last_accepted: floor,
            });
        }

        let key = self.recv_key(sender, epoch_pub);
        let aad = Self::data_aad(sender, &self.local_id(), counter);

        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let plaintext = cipher
            .decrypt(
                &counter_nonce(counter),
                Payload {
                    msg: &sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| MeshError::AuthenticationFailure)?;

        self.replay.record(sender, &epoch, counter)?;
        if let Some(mut recv) = self.recv_epochs.get_mut(&(*sender, epoch)) {
            recv.last_used = Utc::now();
        }

        Ok(plaintext)
    }

    fn data_aad(sender: &PeerId, destination: &PeerId, counter: u64) -> Vec<u8> {
        let mut aad = Vec::with_capacity(32 + 32 + 8);
        aad.extend_from_slice(sender.as_bytes());
        aad.extend_from_slice(destination.as_bytes());
        aad.extend_from_slice(&counter.to_be_bytes());
        aad
    }

    /// Build the opening handshake message toward `peer`.
    pub fn handshake_init(&self, peer: &PeerId) -> Result<HandshakePayload> {
        self.build_handshake(peer, 0)
    }

    /// Process an incoming handshake from `sender`.
    ///
    /// Returns the response payload when the incoming message was an init.
    /// Fails with [`MeshError::ProtocolMismatch`] on version disagreement and
    /// [`MeshError::AuthenticationFailure`] when the confirmation tag does not
    /// prove possession of the sender's claimed identity key.
    pub fn handshake_receive(
        &self,
        sender: &PeerId,
        payload: &HandshakePayload,
    ) -> Result<Option<HandshakePayload>> {
        if payload.version != PROTOCOL_VERSION {
            return Err(MeshError::ProtocolMismatch {
                local: PROTOCOL_VERSION,
                remote: payload.version,
            });
        }

        self.verify_confirmation(sender, payload)?;

        // Warm the receive key for the peer's announced epoch.
        self.recv_key(sender, &payload.epoch_pub);
        self.verified.insert(*sender, Utc::now());
        debug!("Handshake verified with {}", sender.short());

        if payload.is_response() {
            Ok(None)
        } else {
            Ok(Some(self.build_handshake(sender, HandshakePayload::FLAG_RESPONSE)?))
        }
    }

    fn build_handshake(&self, peer: &PeerId, flags: u8) -> Result<HandshakePayload> {
        if !self.send_sessions.contains_key(peer) {
            let session = self.new_send_session(peer)?;
            self.send_sessions.insert(*peer, session);
        }
        let epoch_pub = self
            .send_sessions
            .get(peer)
            .map(|s| s.epoch_pub)
            .ok_or_else(|| MeshError::NoSession(peer.short()))?;

        let transcript = Self::transcript(&self.local_id(), peer, &epoch_pub, flags);
        let key = self.handshake_key(peer);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let nonce_bytes: [u8; 32] = Sha256::digest(&transcript).into();
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes[..12]),
                Payload {
                    msg: &[],
                    aad: &transcript,
                },
            )
            .map_err(|_| MeshError::AuthenticationFailure)?;

        let mut confirmation = [0u8; TAG_LEN];
        confirmation.copy_from_slice(&sealed);

        Ok(HandshakePayload {
            version: PROTOCOL_VERSION,
            flags,
            epoch_pub,
            confirmation,
        })
    }

    fn verify_confirmation(&self, sender: &PeerId, payload: &HandshakePayload) -> Result<()> {
        let transcript = Self::transcript(sender, &self.local_id(), &payload.epoch_pub, payload.flags);
        let key = self.handshake_key(sender);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let nonce_bytes: [u8; 32] = Sha256::digest(&transcript).into();
        cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes[..12]),
                Payload {
                    msg: &payload.confirmation,
                    aad: &transcript,
                },
            )
            .map_err(|_| MeshError::AuthenticationFailure)?;
        Ok(())
    }

    /// Handshake MAC key from the static-static shared secret. Only the two
    /// identity holders can compute it.
    fn handshake_key(&self, peer: &PeerId) -> [u8; 32] {
        let peer_public = PublicKey::from(*peer.as_bytes());
        let shared = self.identity.diffie_hellman(&peer_public);
        derive_key(&[HANDSHAKE_KDF_LABEL, shared.as_bytes()])
    }

    fn transcript(sender: &PeerId, receiver: &PeerId, epoch_pub: &[u8; 32], flags: u8) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(TRANSCRIPT_LABEL);
        hasher.update([PROTOCOL_VERSION, flags]);
        hasher.update(sender.as_bytes());
        hasher.update(receiver.as_bytes());
        hasher.update(epoch_pub);
        hasher.finalize().to_vec()
    }

    /// Whether a handshake with this peer has verified its identity.
    pub fn is_verified(&self, peer: &PeerId) -> bool {
        self.verified.contains_key(peer)
    }

    /// Tear down all session state for a peer (link drop, cancellation).
    /// Replay floors survive in the log; the next send mints a fresh epoch.
    pub fn teardown(&self, peer: &PeerId) {
        self.send_sessions.remove(peer);
        self.verified.remove(peer);
        self.recv_epochs.retain(|(p, _), _| p != peer);
    }

    /// Drop sessions idle past `timeout`. Returns how many were removed.
    pub fn sweep_idle(&self, now: DateTime<Utc>, timeout: Duration) -> usize {
        let mut removed = 0;

        let idle_peers: Vec<PeerId> = self
            .send_sessions
            .iter()
            .filter(|entry| now - entry.value().last_used > timeout)
            .map(|entry| *entry.key())
            .collect();
        for peer in idle_peers {
            self.send_sessions.remove(&peer);
            removed += 1;
        }

        let idle_epochs: Vec<(PeerId, EpochId)> = self
            .recv_epochs
            .iter()
            .filter(|entry| now - entry.value().last_used > timeout)
            .map(|entry| *entry.key())
            .collect();
        for key in idle_epochs {
            self.recv_epochs.remove(&key);
            removed += 1;
        }

        if removed > 0 {
            debug!("Swept {removed} idle session entries");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SessionManager, SessionManager) {
        let a = SessionManager::new(Identity::generate().unwrap(), ReplayLog::in_memory());
        let b = SessionManager::new(Identity::generate().unwrap(), ReplayLog::in_memory());
        (a, b)
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let (a, b) = pair();
        let sealed = a.encrypt(&b.local_id(), b"hello mesh").unwrap();
        let plaintext = b
            .decrypt(
                &a.local_id(),
                &sealed.epoch_pub,
                sealed.counter,
                &sealed.ciphertext,
                &sealed.tag,
            )
            .unwrap();
        assert_eq!(plaintext, b"hello mesh");
    }

    #[test]
    fn send_counters_strictly_increase() {
        let (a, b) = pair();
        let first = a.encrypt(&b.local_id(), b"one").unwrap();
        let second = a.encrypt(&b.local_id(), b"two").unwrap();
        assert_eq!(first.counter, 1);
        assert_eq!(second.counter, 2);
        assert_eq!(first.epoch_pub, second.epoch_pub);
    }

    #[test]
    fn replayed_counter_is_rejected() {
        let (a, b) = pair();
        let sealed = a.encrypt(&b.local_id(), b"once only").unwrap();

        b.decrypt(
            &a.local_id(),
            &sealed.epoch_pub,
            sealed.counter,
            &sealed.ciphertext,
            &sealed.tag,
        )
        .unwrap();

        match b.decrypt(
            &a.local_id(),
            &sealed.epoch_pub,
            sealed.counter,
            &sealed.ciphertext,
            &sealed.tag,
        ) {
            Err(MeshError::ReplayDetected { received: 1, last_accepted: 1 }) => {}
            other => panic!("expected replay rejection, got {other:?}"),
        }
    }

    #[test]
    fn stale_counter_is_rejected_even_out_of_order() {
        let (a, b) = pair();
        let first = a.encrypt(&b.local_id(), b"one").unwrap();
        let second = a.encrypt(&b.local_id(), b"two").unwrap();

        // Accept the newer message first; the older one must then be refused.
        b.decrypt(&a.local_id(), &second.epoch_pub, second.counter, &second.ciphertext, &second.tag)
            .unwrap();
        assert!(matches!(
            b.decrypt(&a.local_id(), &first.epoch_pub, first.counter, &first.ciphertext, &first.tag),
            Err(MeshError::ReplayDetected { .. })
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let (a, b) = pair();
        let mut sealed = a.encrypt(&b.local_id(), b"integrity matters").unwrap();
        sealed.ciphertext[0] ^= 0x01;
        assert!(matches!(
            b.decrypt(&a.local_id(), &sealed.epoch_pub, sealed.counter, &sealed.ciphertext, &sealed.tag),
            Err(MeshError::AuthenticationFailure)
        ));
    }

    #[test]
    fn wrong_recipient_cannot_decrypt() {
        let (a, b) = pair();
        let c = SessionManager::new(Identity::generate().unwrap(), ReplayLog::in_memory());
        let sealed = a.encrypt(&b.local_id(), b"for b only").unwrap();
        assert!(c
            .decrypt(&a.local_id(), &sealed.epoch_pub, sealed.counter, &sealed.ciphertext, &sealed.tag)
            .is_err());
    }

    #[test]
    fn handshake_verifies_both_sides() {
        let (a, b) = pair();
        let init = a.handshake_init(&b.local_id()).unwrap();
        assert!(!init.is_response());

        let response = b.handshake_receive(&a.local_id(), &init).unwrap().unwrap();
        assert!(response.is_response());
        assert!(b.is_verified(&a.local_id()));

        let done = a.handshake_receive(&b.local_id(), &response).unwrap();
        assert!(done.is_none());
        assert!(a.is_verified(&b.local_id()));
    }

    #[test]
    fn handshake_rejects_version_mismatch() {
        let (a, b) = pair();
        let mut init = a.handshake_init(&b.local_id()).unwrap();
        init.version = 99;
        assert!(matches!(
            b.handshake_receive(&a.local_id(), &init),
            Err(MeshError::ProtocolMismatch { remote: 99, .. })
        ));
    }

    #[test]
    fn handshake_rejects_forged_identity() {
        let (a, b) = pair();
        let mallory = SessionManager::new(Identity::generate().unwrap(), ReplayLog::in_memory());

        // Mallory builds a handshake but claims to be `a`.
        let forged = mallory.handshake_init(&b.local_id()).unwrap();
        assert!(matches!(
            b.handshake_receive(&a.local_id(), &forged),
            Err(MeshError::AuthenticationFailure)
        ));
        assert!(!b.is_verified(&a.local_id()));
    }

    #[test]
    fn teardown_mints_a_fresh_epoch() {
        let (a, b) = pair();
        let before = a.encrypt(&b.local_id(), b"x").unwrap();
        a.teardown(&b.local_id());
        let after = a.encrypt(&b.local_id(), b"y").unwrap();
        assert_ne!(before.epoch_pub, after.epoch_pub);
        assert_eq!(after.counter, 1);
    }

    #[test]
    fn replay_floor_survives_session_teardown() {
        let (a, b) = pair();
        let sealed = a.encrypt(&b.local_id(), b"persisted").unwrap();
        b.decrypt(&a.local_id(), &sealed.epoch_pub, sealed.counter, &sealed.ciphertext, &sealed.tag)
            .unwrap();

        b.teardown(&a.local_id());
        assert!(matches!(
            b.decrypt(&a.local_id(), &sealed.epoch_pub, sealed.counter, &sealed.ciphertext, &sealed.tag),
            Err(MeshError::ReplayDetected { .. })
        ));
    }

    #[test]
    fn idle_sessions_are_swept() {
        let (a, b) = pair();
        a.encrypt(&b.local_id(), b"x").unwrap();
        let removed = a.sweep_idle(Utc::now() + Duration::seconds(3600), Duration::seconds(600));
        assert!(removed >= 1);
    }
}
