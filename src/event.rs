//! Nostr event model, canonical hashing and signature verification.

use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Profile metadata (`name`, `about`).
pub const KIND_METADATA: u32 = 0;
/// Text note; carries both posts and votes.
pub const KIND_TEXT_NOTE: u32 = 1;
/// Deletion request referencing targets through `e` tags.
pub const KIND_DELETION: u32 = 5;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// The first element names the tag and the rest carry data. Deletions use
/// `["e", <event id>]` to point at the posts they retract. Tags are kept
/// verbatim so the canonical hash can be recomputed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build an `e` tag referencing another event.
    pub fn event(id: impl Into<String>) -> Self {
        Tag(vec!["e".into(), id.into()])
    }

    /// Tag name and first value, when both are present.
    pub fn pair(&self) -> Option<(&str, &str)> {
        match self.0.as_slice() {
            [name, value, ..] => Some((name.as_str(), value.as_str())),
            _ => None,
        }
    }
}

/// Signed event as exchanged with relays.
///
/// ```json
/// {
///   "id": "aa11...",
///   "pubkey": "79be...",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [["e", "bb22..."]],
///   "content": "{\"title\":\"hello\",\"body\":\"world\"}",
///   "sig": "deadbeef..."
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Kind number, see the `KIND_*` constants.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Ordered tags.
    pub tags: Vec<Tag>,
    /// Opaque content; JSON-encoded entities for this application.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

/// Event fields covered by the hash, before an id and signature exist.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub kind: u32,
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub content: String,
}

/// Reasons an event fails verification.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("id does not match content hash")]
    IdMismatch,
    #[error("malformed key or signature: {0}")]
    Malformed(String),
    #[error("signature does not verify against pubkey")]
    BadSignature,
    #[error("encoding event for hashing: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Compute the canonical hash over `[0, pubkey, created_at, kind, tags, content]`.
pub fn canonical_hash(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Tag],
    content: &str,
) -> Result<[u8; 32], serde_json::Error> {
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr)?;
    Ok(Sha256::digest(&data).into())
}

impl UnsignedEvent {
    /// Canonical hash of the fields this event will be signed over.
    pub fn hash(&self) -> Result<[u8; 32], serde_json::Error> {
        canonical_hash(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }
}

impl Event {
    /// Recompute the hash from the event's own fields.
    pub fn hash(&self) -> Result<[u8; 32], serde_json::Error> {
        canonical_hash(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Verify the id against the content hash and the signature against `pubkey`.
    pub fn verify(&self) -> Result<(), VerifyError> {
        let hash = self.hash()?;
        if hex::encode(hash) != self.id {
            return Err(VerifyError::IdMismatch);
        }
        let sig_bytes = hex::decode(&self.sig).map_err(|e| VerifyError::Malformed(e.to_string()))?;
        let sig =
            Signature::from_slice(&sig_bytes).map_err(|e| VerifyError::Malformed(e.to_string()))?;
        let pk_bytes =
            hex::decode(&self.pubkey).map_err(|e| VerifyError::Malformed(e.to_string()))?;
        let pk = XOnlyPublicKey::from_slice(&pk_bytes)
            .map_err(|e| VerifyError::Malformed(e.to_string()))?;
        let msg =
            Message::from_digest_slice(&hash).map_err(|e| VerifyError::Malformed(e.to_string()))?;
        Secp256k1::verification_only()
            .verify_schnorr(&sig, &msg, &pk)
            .map_err(|_| VerifyError::BadSignature)
    }

    /// Ids referenced by `e` tags, in tag order, skipping empty values.
    pub fn referenced_ids(&self) -> Vec<String> {
        self.tags
            .iter()
            .filter_map(Tag::pair)
            .filter(|(name, value)| *name == "e" && !value.is_empty())
            .map(|(_, value)| value.to_string())
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use secp256k1::Keypair;

    /// Build a correctly signed event from a fixed secret byte.
    pub(crate) fn signed(secret: u8, kind: u32, created_at: u64, tags: Vec<Tag>, content: &str) -> Event {
        let secp = Secp256k1::new();
        let kp = Keypair::from_seckey_slice(&secp, &[secret; 32]).unwrap();
        let pubkey = hex::encode(kp.x_only_public_key().0.serialize());
        let hash = canonical_hash(&pubkey, created_at, kind, &tags, content).unwrap();
        let msg = Message::from_digest_slice(&hash).unwrap();
        let sig = secp.sign_schnorr_no_aux_rand(&msg, &kp);
        Event {
            id: hex::encode(hash),
            pubkey,
            kind,
            created_at,
            tags,
            content: content.into(),
            sig: hex::encode(sig.as_ref()),
        }
    }

    #[test]
    fn valid_event_verifies() {
        let ev = signed(1, KIND_TEXT_NOTE, 1_700_000_000, vec![], "{}");
        ev.verify().unwrap();
    }

    #[test]
    fn tampered_content_is_id_mismatch() {
        let mut ev = signed(1, KIND_TEXT_NOTE, 1, vec![], "{\"title\":\"a\"}");
        ev.content = "{\"title\":\"b\"}".into();
        assert!(matches!(ev.verify(), Err(VerifyError::IdMismatch)));
    }

    #[test]
    fn foreign_signature_fails() {
        let ev = signed(1, KIND_TEXT_NOTE, 1, vec![], "x");
        let other = signed(2, KIND_TEXT_NOTE, 1, vec![], "x");
        let mut forged = other.clone();
        forged.sig = ev.sig.clone();
        assert!(matches!(forged.verify(), Err(VerifyError::BadSignature)));
    }

    #[test]
    fn garbage_signature_is_malformed() {
        let mut ev = signed(1, KIND_TEXT_NOTE, 1, vec![], "x");
        ev.sig = "zz".into();
        assert!(matches!(ev.verify(), Err(VerifyError::Malformed(_))));
    }

    #[test]
    fn hash_matches_reference_encoding() {
        let pubkey = "00".repeat(32);
        let expected = {
            let obj = serde_json::json!([0, pubkey, 1, 1, Vec::<Vec<String>>::new(), ""]);
            let bytes = Sha256::digest(serde_json::to_vec(&obj).unwrap());
            let mut arr = [0u8; 32];
            arr.copy_from_slice(&bytes);
            arr
        };
        assert_eq!(canonical_hash(&pubkey, 1, 1, &[], "").unwrap(), expected);
    }

    #[test]
    fn referenced_ids_skip_other_and_empty_tags() {
        let ev = Event {
            id: String::new(),
            pubkey: String::new(),
            kind: KIND_DELETION,
            created_at: 1,
            tags: vec![
                Tag::event("aa"),
                Tag(vec!["p".into(), "bb".into()]),
                Tag(vec!["e".into(), String::new()]),
                Tag(vec!["e".into()]),
                Tag::event("cc"),
            ],
            content: String::new(),
            sig: String::new(),
        };
        assert_eq!(ev.referenced_ids(), vec!["aa".to_string(), "cc".to_string()]);
    }
}
