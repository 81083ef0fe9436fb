//! Cryptographic primitives for syncr.
//!
//! Provides:
//!   1. SHA-256 hashing — content hashes, chunk hashes, node ID derivation
//!   2. RSA-4096 keypair lifecycle with PEM serialization
//!   3. Detached RSA-PSS signatures over canonicalized maps
//!   4. The tagged peer-list encoding shared by the DHT storage layer
//!
//! Every hash and signature is computed over the canonical codec form, so
//! two nodes always agree on what was signed. Node-ID equality used in
//! authentication paths goes through a constant-time comparison.

use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Pss, RsaPrivateKey, RsaPublicKey};

pub use rsa::{RsaPrivateKey as PrivateKey, RsaPublicKey as PublicKey};
use sha2::{Digest as _, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::codec::Value;
use crate::types::{Digest, NodeId, Peer};

/// RSA modulus size in bits.
pub const KEY_SIZE: usize = 4096;

// ── Hashing ──────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning the 32-byte SHA-256 digest.
pub fn hash(data: &[u8]) -> Digest {
    Sha256::digest(data).into()
}

/// Hash a canonical value: `hash(encode(v))`.
///
/// The `files` map of a drop record and every signed header go through this.
pub fn hash_value(v: &Value) -> Digest {
    hash(&v.encode())
}

/// Incremental SHA-256 hasher for data that arrives in pieces.
pub struct Hasher(Sha256);

impl Hasher {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> Digest {
        self.0.finalize().into()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Randomness ───────────────────────────────────────────────────────────────

/// 32 cryptographically random bytes — the nonce half of a drop ID.
pub fn random_bytes() -> [u8; 32] {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// A random 64-bit version nonce.
pub fn random_nonce() -> u64 {
    rand::thread_rng().next_u64()
}

// ── Keypair ──────────────────────────────────────────────────────────────────

/// A node's long-lived RSA keypair.
///
/// Generated once at node init and stored as PKCS#8 PEM. The node ID is
/// derived from the public half; the private half never leaves this struct
/// except through [`Keypair::private_pem`] for storage.
pub struct Keypair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl Keypair {
    /// Generate a fresh keypair at the default [`KEY_SIZE`].
    ///
    /// RSA keygen is CPU-bound and slow — callers on the async runtime must
    /// wrap this in `spawn_blocking`.
    pub fn generate() -> Result<Self, CryptoError> {
        Self::generate_with_size(KEY_SIZE)
    }

    pub fn generate_with_size(bits: usize) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)?;
        let public = private.to_public_key();
        Ok(Self { private, public })
    }

    /// Reconstruct a keypair from a stored PKCS#8 PEM private key.
    pub fn from_private_pem(pem: &str) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)?;
        let public = private.to_public_key();
        Ok(Self { private, public })
    }

    /// Serialize the private key for persistent storage (mode 0600).
    pub fn private_pem(&self) -> Result<Zeroizing<String>, CryptoError> {
        Ok(self.private.to_pkcs8_pem(LineEnding::LF)?)
    }

    pub fn public(&self) -> &RsaPublicKey {
        &self.public
    }

    pub fn private(&self) -> &RsaPrivateKey {
        &self.private
    }

    pub fn node_id(&self) -> Result<NodeId, CryptoError> {
        node_id_from_public_key(&self.public)
    }

    pub fn sign_value(&self, v: &Value) -> Result<Vec<u8>, CryptoError> {
        sign_value(&self.private, v)
    }
}

/// Dump a public key to SubjectPublicKeyInfo PEM bytes.
///
/// This serialization is load-bearing: node IDs are the hash of exactly
/// these bytes, and the PKS stores them verbatim.
pub fn dump_public_key(key: &RsaPublicKey) -> Result<Vec<u8>, CryptoError> {
    Ok(key.to_public_key_pem(LineEnding::LF)?.into_bytes())
}

/// Load a public key from SubjectPublicKeyInfo PEM bytes.
pub fn load_public_key(pem: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    let text = std::str::from_utf8(pem).map_err(|_| CryptoError::MalformedKey)?;
    Ok(RsaPublicKey::from_public_key_pem(text)?)
}

/// Derive a node ID: the hash of the serialized public key.
pub fn node_id_from_public_key(key: &RsaPublicKey) -> Result<NodeId, CryptoError> {
    Ok(hash(&dump_public_key(key)?))
}

/// Check that a public key matches a claimed node ID.
///
/// The comparison is constant-time: this runs in authentication contexts
/// where a timing oracle on the ID bytes must not exist.
pub fn verify_node_id(key: &RsaPublicKey, node_id: &NodeId) -> Result<bool, CryptoError> {
    let derived = node_id_from_public_key(key)?;
    Ok(derived.ct_eq(node_id).into())
}

// ── Signatures ───────────────────────────────────────────────────────────────

fn pss() -> Pss {
    // Salt length equals the digest length.
    Pss::new::<Sha256>()
}

/// Sign a canonical map: RSA-PSS(SHA-256) over `hash(encode(v))`.
pub fn sign_value(key: &RsaPrivateKey, v: &Value) -> Result<Vec<u8>, CryptoError> {
    let digest: [u8; 32] = Sha256::digest(hash_value(v)).into();
    Ok(key.sign_with_rng(&mut rand::thread_rng(), pss(), &digest)?)
}

/// Verify a detached signature over a canonical map.
///
/// Fails with [`CryptoError::InvalidSignature`] on any mismatch.
pub fn verify_value(key: &RsaPublicKey, signature: &[u8], v: &Value) -> Result<(), CryptoError> {
    let digest: [u8; 32] = Sha256::digest(hash_value(v)).into();
    key.verify(pss(), &digest, signature)
        .map_err(|_| CryptoError::InvalidSignature)
}

// ── Identifier encoding ──────────────────────────────────────────────────────

// Standard base64 with '/' swapped for '-', so encoded identifiers are safe
// as file names. Padding kept.
const B64_ALPHABET: base64::alphabet::Alphabet = match base64::alphabet::Alphabet::new(
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+-",
) {
    Ok(a) => a,
    Err(_) => panic!("invalid base64 alphabet"),
};

const B64: base64::engine::GeneralPurpose =
    base64::engine::GeneralPurpose::new(&B64_ALPHABET, base64::engine::general_purpose::PAD);

/// Encode binary identifiers for file names and logs.
pub fn b64encode(data: &[u8]) -> String {
    use base64::Engine as _;
    B64.encode(data)
}

/// Decode an identifier produced by [`b64encode`].
pub fn b64decode(text: &str) -> Result<Vec<u8>, CryptoError> {
    use base64::Engine as _;
    B64.decode(text).map_err(|_| CryptoError::MalformedId)
}

// ── Peer lists ───────────────────────────────────────────────────────────────

/// Tag prefix identifying a stored value as a peer list.
///
/// The DHT storage layer unions values carrying this prefix instead of
/// overwriting them, so concurrent announcements under one drop key merge.
pub const PEERLIST_PREFIX: &[u8] = b"type:peerlist";

/// Encode a peer list as a tagged byte string for DPS storage.
pub fn encode_peerlist(peers: &[Peer]) -> Vec<u8> {
    let list = Value::List(peers.iter().map(Peer::to_value).collect());
    let mut out = PEERLIST_PREFIX.to_vec();
    out.extend_from_slice(&list.encode());
    out
}

/// Decode a tagged peer list. Returns `None` on a missing prefix or any
/// malformed content — stored values we did not write are untrusted.
pub fn decode_peerlist(raw: &[u8]) -> Option<Vec<Peer>> {
    let body = raw.strip_prefix(PEERLIST_PREFIX)?;
    let value = Value::decode(body).ok()?;
    value.as_list()?.iter().map(Peer::from_value).collect()
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("signature verification failed")]
    InvalidSignature,

    #[error("malformed PEM key material")]
    MalformedKey,

    #[error("malformed base64 identifier")]
    MalformedId,

    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("key serialization error: {0}")]
    Pkcs8(#[from] rsa::pkcs8::Error),

    #[error("public key serialization error: {0}")]
    Spki(#[from] rsa::pkcs8::spki::Error),
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MapBuilder;

    /// 2048-bit keys keep the test suite fast; the signing path is identical.
    fn test_keypair() -> Keypair {
        Keypair::generate_with_size(2048).unwrap()
    }

    #[test]
    fn hash_known_vector() {
        // SHA-256 of the empty input
        let expected = [
            0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f,
            0xb9, 0x24, 0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b,
            0x78, 0x52, 0xb8, 0x55,
        ];
        assert_eq!(hash(b""), expected);
    }

    #[test]
    fn incremental_hasher_matches_oneshot() {
        let mut h = Hasher::new();
        h.update(b"hello ");
        h.update(b"world");
        assert_eq!(h.finalize(), hash(b"hello world"));
    }

    #[test]
    fn hash_value_is_hash_of_encoding() {
        let v = MapBuilder::new().entry(b"key", "foo").build();
        assert_eq!(hash_value(&v), hash(&v.encode()));
    }

    #[test]
    fn keypair_round_trips_through_pem() {
        let kp = test_keypair();
        let pem = kp.private_pem().unwrap();
        let restored = Keypair::from_private_pem(&pem).unwrap();
        assert_eq!(kp.node_id().unwrap(), restored.node_id().unwrap());
    }

    #[test]
    fn node_id_is_hash_of_public_pem() {
        let kp = test_keypair();
        let pem = dump_public_key(kp.public()).unwrap();
        assert_eq!(kp.node_id().unwrap(), hash(&pem));
    }

    #[test]
    fn public_key_pem_round_trip() {
        let kp = test_keypair();
        let pem = dump_public_key(kp.public()).unwrap();
        let loaded = load_public_key(&pem).unwrap();
        assert_eq!(&loaded, kp.public());
    }

    #[test]
    fn verify_node_id_accepts_and_rejects() {
        let kp = test_keypair();
        let id = kp.node_id().unwrap();
        assert!(verify_node_id(kp.public(), &id).unwrap());

        let mut wrong = id;
        wrong[0] ^= 0xff;
        assert!(!verify_node_id(kp.public(), &wrong).unwrap());
    }

    #[test]
    fn sign_verify_round_trip() {
        let kp = test_keypair();
        let v = MapBuilder::new().entry(b"a", 1u64).entry(b"b", 2u64).build();
        let sig = kp.sign_value(&v).unwrap();
        verify_value(kp.public(), &sig, &v).unwrap();
    }

    #[test]
    fn mutated_map_fails_verification() {
        let kp = test_keypair();
        let v = MapBuilder::new().entry(b"a", 1u64).entry(b"b", 2u64).build();
        let sig = kp.sign_value(&v).unwrap();

        let mutated = MapBuilder::new().entry(b"a", 1u64).entry(b"b", 3u64).build();
        let err = verify_value(kp.public(), &sig, &mutated).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidSignature));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let kp1 = test_keypair();
        let kp2 = test_keypair();
        let v = MapBuilder::new().entry(b"a", 1u64).build();
        let sig = kp1.sign_value(&v).unwrap();
        assert!(verify_value(kp2.public(), &sig, &v).is_err());
    }

    #[test]
    fn b64_round_trip() {
        let data = b"IamImportantData";
        let encoded = b64encode(data);
        assert_eq!(b64decode(&encoded).unwrap(), data);
    }

    #[test]
    fn b64_avoids_path_separators() {
        // 0xff-heavy input exercises the high end of the alphabet.
        let encoded = b64encode(&[0xffu8; 48]);
        assert!(!encoded.contains('/'));
    }

    #[test]
    fn peerlist_round_trip() {
        let peers = vec![
            Peer::new(vec![1u8; 32], "1.2.3.4", 2),
            Peer::new(vec![2u8; 32], "2.3.4.5", 3),
        ];
        let encoded = encode_peerlist(&peers);
        assert!(encoded.starts_with(PEERLIST_PREFIX));
        assert_eq!(decode_peerlist(&encoded).unwrap(), peers);
    }

    #[test]
    fn peerlist_garbage_is_none() {
        assert_eq!(decode_peerlist(b"garbage"), None);
        assert_eq!(decode_peerlist(b"type:peerlistgarbage"), None);
        assert_eq!(decode_peerlist(b""), None);
    }

    #[test]
    fn random_nonces_differ() {
        assert_ne!(random_bytes(), random_bytes());
        assert_ne!(random_nonce(), random_nonce());
    }
}
