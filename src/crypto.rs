//! # Cryptographic Collaborator
//!
//! The DHT never verifies signatures directly. It consumes three capabilities:
//!
//! | Operation | Meaning |
//! |-----------|---------|
//! | [`generate_hash`] | BLAKE3 digest of arbitrary bytes |
//! | [`sign`] | Recoverable secp256k1 ECDSA signature over a 32-byte hash |
//! | [`recover_id`] | Recover the signer's [`KademliaID`] from hash + signature |
//!
//! A keypair's identity is `BLAKE3(uncompressed SEC1 public key)`, so a
//! record's owner can be established from the signature alone.
//!
//! Signatures travel as hex strings of 65 bytes: `r (32) || s (32) || v (1)`.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::DhtError;
use crate::identity::KademliaID;

/// Length of a digest produced by [`generate_hash`].
pub const HASH_LENGTH: usize = 32;

/// Length of an encoded recoverable signature.
pub const SIGNATURE_LENGTH: usize = 65;

pub fn generate_hash(data: &[u8]) -> [u8; HASH_LENGTH] {
    *blake3::hash(data).as_bytes()
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let signing_key = SigningKey::from_slice(bytes)
            .map_err(|e| DhtError::Crypto(format!("invalid private key: {}", e)))?;
        Ok(Self { signing_key })
    }

    pub fn from_secret_hex(s: &str) -> Result<Self, DhtError> {
        let bytes = hex::decode(s)
            .map_err(|e| DhtError::Crypto(format!("invalid private key hex: {}", e)))?;
        Self::from_secret_key_bytes(&bytes)
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes().into()
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        *self.signing_key.verifying_key()
    }

    pub fn id(&self) -> KademliaID {
        id_from_verifying_key(&self.verifying_key())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("id", &self.id().short())
            .finish_non_exhaustive()
    }
}

fn id_from_verifying_key(key: &VerifyingKey) -> KademliaID {
    let encoded = key.to_encoded_point(false);
    KademliaID::from_data(encoded.as_bytes())
}

/// Sign a 32-byte hash, returning the hex-encoded recoverable signature.
pub fn sign(hash: &[u8; HASH_LENGTH], keypair: &Keypair) -> Result<String, DhtError> {
    let (signature, recovery_id) = keypair
        .signing_key
        .sign_prehash_recoverable(hash)
        .map_err(|e| DhtError::Crypto(format!("signing failed: {}", e)))?;

    let mut out = Vec::with_capacity(SIGNATURE_LENGTH);
    out.extend_from_slice(&signature.to_bytes());
    out.push(recovery_id.to_byte());
    Ok(hex::encode(out))
}

/// Recover the identity that produced `signature` over `hash`.
pub fn recover_id(hash: &[u8; HASH_LENGTH], signature: &str) -> Result<KademliaID, DhtError> {
    let bytes = hex::decode(signature)
        .map_err(|e| DhtError::Crypto(format!("invalid signature hex: {}", e)))?;
    if bytes.len() != SIGNATURE_LENGTH {
        return Err(DhtError::Crypto(format!(
            "signature must be {} bytes, got {}",
            SIGNATURE_LENGTH,
            bytes.len()
        )));
    }

    let sig = Signature::from_slice(&bytes[..64])
        .map_err(|e| DhtError::Crypto(format!("malformed signature: {}", e)))?;
    let recovery_id = RecoveryId::from_byte(bytes[64])
        .ok_or_else(|| DhtError::Crypto("invalid recovery id".to_string()))?;

    let key = VerifyingKey::recover_from_prehash(hash, &sig, recovery_id)
        .map_err(|e| DhtError::Crypto(format!("public key recovery failed: {}", e)))?;
    Ok(id_from_verifying_key(&key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_recover_yields_signer_id() {
        let kp = Keypair::generate();
        let hash = generate_hash(b"grid metadata");
        let sig = sign(&hash, &kp).expect("sign");
        assert_eq!(hex::decode(&sig).expect("hex").len(), SIGNATURE_LENGTH);

        let recovered = recover_id(&hash, &sig).expect("recover");
        assert_eq!(recovered, kp.id());
    }

    #[test]
    fn recovery_over_other_hash_gives_other_id() {
        let kp = Keypair::generate();
        let sig = sign(&generate_hash(b"a"), &kp).expect("sign");
        if let Ok(id) = recover_id(&generate_hash(b"b"), &sig) {
            assert_ne!(id, kp.id());
        }
    }

    #[test]
    fn malformed_signatures_are_rejected() {
        let hash = generate_hash(b"x");
        assert!(recover_id(&hash, "not hex").is_err());
        assert!(recover_id(&hash, &"00".repeat(64)).is_err());
        assert!(recover_id(&hash, &"00".repeat(65)).is_err());
    }

    #[test]
    fn keypair_secret_roundtrip_preserves_identity() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_hex(&kp.secret_hex()).expect("restore");
        assert_eq!(kp.id(), restored.id());
        assert!(Keypair::from_secret_hex("1234").is_err());
    }

    #[test]
    fn distinct_keypairs_have_distinct_ids() {
        assert_ne!(Keypair::generate().id(), Keypair::generate().id());
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(generate_hash(b"abc"), generate_hash(b"abc"));
        assert_ne!(generate_hash(b"abc"), generate_hash(b"abd"));
    }
}
