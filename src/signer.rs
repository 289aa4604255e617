//! Signing capability consumed by the publish path.

use secp256k1::{Keypair, Message, Secp256k1, SecretKey};

use crate::event::{Event, UnsignedEvent};

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("invalid secret key: {0}")]
    InvalidKey(String),
    #[error("event author {claimed} does not match signing key {actual}")]
    KeyMismatch { claimed: String, actual: String },
    #[error("encoding event for hashing: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Anything able to turn an unsigned event into a signed one.
///
/// How the key was obtained (password, seed phrase, hardware) is not this
/// crate's concern.
pub trait Signer: Send + Sync {
    /// Hex x-only public key events will be attributed to.
    fn public_key(&self) -> String;

    /// Compute the id and signature for `unsigned`.
    fn sign(&self, unsigned: UnsignedEvent) -> Result<Event, SignError>;
}

/// Signer backed by an in-memory secp256k1 keypair.
pub struct KeypairSigner {
    secp: Secp256k1<secp256k1::All>,
    keypair: Keypair,
}

impl KeypairSigner {
    /// Parse a 32-byte hex secret key.
    pub fn from_hex(secret: &str) -> Result<Self, SignError> {
        let bytes = hex::decode(secret.trim()).map_err(|e| SignError::InvalidKey(e.to_string()))?;
        let sk = SecretKey::from_slice(&bytes).map_err(|e| SignError::InvalidKey(e.to_string()))?;
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &sk);
        Ok(Self { secp, keypair })
    }
}

impl Signer for KeypairSigner {
    fn public_key(&self) -> String {
        hex::encode(self.keypair.x_only_public_key().0.serialize())
    }

    fn sign(&self, unsigned: UnsignedEvent) -> Result<Event, SignError> {
        let actual = self.public_key();
        if unsigned.pubkey != actual {
            return Err(SignError::KeyMismatch {
                claimed: unsigned.pubkey,
                actual,
            });
        }
        let hash = unsigned.hash()?;
        let msg = Message::from_digest_slice(&hash).map_err(|e| SignError::InvalidKey(e.to_string()))?;
        let aux: [u8; 32] = rand::random();
        let sig = self
            .secp
            .sign_schnorr_with_aux_rand(&msg, &self.keypair, &aux);
        Ok(Event {
            id: hex::encode(hash),
            pubkey: unsigned.pubkey,
            kind: unsigned.kind,
            created_at: unsigned.created_at,
            tags: unsigned.tags,
            content: unsigned.content,
            sig: hex::encode(sig.as_ref()),
        })
    }
}
