//! Identity and session cryptography.
//!
//! Long-term X25519 identities, ephemeral-static session derivation with
//! ChaCha20-Poly1305 authenticated encryption, strict-increase replay
//! protection, and the handshake that proves identity-key possession.

mod identity;
mod replay;
mod session;

pub use identity::Identity;
pub use replay::{EpochId, ReplayLog};
pub use session::{epoch_id, SealedMessage, SessionManager};
