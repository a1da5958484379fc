//! Key primitives consumed by the credential bootstrap.
//!
//! Key pairs are X25519. Pre-key signatures are XEdDSA so that the identity
//! key used for Diffie-Hellman also signs, the way the Signal protocol does:
//! the Montgomery private key is mapped to an Edwards scalar whose public
//! point has sign bit zero, and verification converts the Montgomery public
//! key back to that Edwards point.
//!
//! Reference: <https://signal.org/docs/specifications/xeddsa/>

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::codec::b64;
use crate::error::{Result, StoreError};

/// Type byte prepended to a Curve25519 public key before it is signed.
pub const KEY_BUNDLE_TYPE: u8 = 0x05;
pub const KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

// ── Key material ──────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    #[zeroize(skip)]
    #[serde(with = "b64")]
    pub public: Vec<u8>,
    #[serde(with = "b64")]
    pub private: Vec<u8>,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(&self.public))
            .field("private", &"<redacted>")
            .finish()
    }
}

impl KeyPair {
    /// Human-readable fingerprint: BLAKE3 of the public key, truncated to
    /// 20 bytes, hex-encoded in groups of 4.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.public);
        let hex = hex::encode(&hash.as_bytes()[..20]);
        hex.as_bytes()
            .chunks(4)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn public_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.public)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedKeyPair {
    pub key_pair: KeyPair,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
    pub key_id: u32,
}

/// Prefix a raw 32-byte Curve25519 public key with [`KEY_BUNDLE_TYPE`].
/// Keys that already carry the prefix are returned unchanged.
pub fn signal_pub_key(public: &[u8]) -> Vec<u8> {
    if public.len() == KEY_LEN {
        let mut out = Vec::with_capacity(KEY_LEN + 1);
        out.push(KEY_BUNDLE_TYPE);
        out.extend_from_slice(public);
        out
    } else {
        public.to_vec()
    }
}

// ── Capability ────────────────────────────────────────────────────────────────

/// Opaque key-generation, signing and randomness capability.
pub trait KeyPrimitives: Send + Sync {
    fn generate_key_pair(&self) -> Result<KeyPair>;

    /// Sign `message` with a Curve25519 private key.
    fn sign(&self, private_key: &[u8], message: &[u8]) -> Result<Vec<u8>>;

    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()>;

    fn random_bytes(&self, len: usize) -> Result<Vec<u8>>;

    /// 14-bit registration id.
    fn registration_id(&self) -> Result<u16> {
        let bytes = self.random_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]) & 0x3FFF)
    }

    fn uuid(&self) -> Result<Uuid> {
        let bytes: [u8; 16] = self
            .random_bytes(16)?
            .try_into()
            .map_err(|_| StoreError::Crypto("uuid needs 16 random bytes".into()))?;
        Ok(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }
}

/// X25519 + XEdDSA over the operating system RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct CurvePrimitives;

impl KeyPrimitives for CurvePrimitives {
    fn generate_key_pair(&self) -> Result<KeyPair> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Ok(KeyPair {
            public: public.as_bytes().to_vec(),
            private: secret.to_bytes().to_vec(),
        })
    }

    fn sign(&self, private_key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; 64];
        OsRng.fill_bytes(&mut nonce);
        let sig = xeddsa_sign(to_32(private_key)?, message, &nonce);
        nonce.zeroize();
        Ok(sig.to_vec())
    }

    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
        let public = match public_key.len() {
            33 if public_key[0] == KEY_BUNDLE_TYPE => &public_key[1..],
            _ => public_key,
        };
        let sig: [u8; SIGNATURE_LEN] = signature
            .try_into()
            .map_err(|_| StoreError::Crypto("signature must be 64 bytes".into()))?;
        if xeddsa_verify(to_32(public)?, message, &sig) {
            Ok(())
        } else {
            Err(StoreError::Crypto("signature verification failed".into()))
        }
    }

    fn random_bytes(&self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| StoreError::Crypto(format!("rng: {e}")))?;
        Ok(buf)
    }
}

// ── XEdDSA ────────────────────────────────────────────────────────────────────

fn to_32(bytes: &[u8]) -> Result<[u8; KEY_LEN]> {
    bytes
        .try_into()
        .map_err(|_| StoreError::Crypto(format!("expected 32-byte key, got {}", bytes.len())))
}

fn clamp(mut k: [u8; KEY_LEN]) -> [u8; KEY_LEN] {
    k[0] &= 248;
    k[31] &= 127;
    k[31] |= 64;
    k
}

fn hash_to_scalar(parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&hasher.finalize());
    Scalar::from_bytes_mod_order_wide(&wide)
}

fn xeddsa_sign(private_key: [u8; KEY_LEN], message: &[u8], nonce: &[u8; 64]) -> [u8; SIGNATURE_LEN] {
    let clamped = Zeroizing::new(clamp(private_key));
    let k = Scalar::from_bytes_mod_order(*clamped);
    let big_a = EdwardsPoint::mul_base(&k).compress();
    // Force the public point's sign bit to zero.
    let (a, big_a) = if big_a.as_bytes()[31] & 0x80 != 0 {
        let a = -k;
        (a, EdwardsPoint::mul_base(&a).compress())
    } else {
        (k, big_a)
    };

    // hash_1 prefix: 0xFE followed by 31 bytes of 0xFF.
    let mut prefix = [0xFFu8; 32];
    prefix[0] = 0xFE;
    let r = hash_to_scalar(&[&prefix, a.as_bytes(), message, nonce]);
    let big_r = EdwardsPoint::mul_base(&r).compress();
    let h = hash_to_scalar(&[big_r.as_bytes(), big_a.as_bytes(), message]);
    let s = r + h * a;

    let mut sig = [0u8; SIGNATURE_LEN];
    sig[..32].copy_from_slice(big_r.as_bytes());
    sig[32..].copy_from_slice(s.as_bytes());
    sig
}

fn xeddsa_verify(public_key: [u8; KEY_LEN], message: &[u8], sig: &[u8; SIGNATURE_LEN]) -> bool {
    let Some(big_a) = MontgomeryPoint(public_key).to_edwards(0) else {
        return false;
    };
    let mut r_bytes = [0u8; 32];
    r_bytes.copy_from_slice(&sig[..32]);
    let mut s_bytes = [0u8; 32];
    s_bytes.copy_from_slice(&sig[32..]);
    let Some(s) = Option::<Scalar>::from(Scalar::from_canonical_bytes(s_bytes)) else {
        return false;
    };
    let big_r = CompressedEdwardsY(r_bytes);
    let h = hash_to_scalar(&[&r_bytes, big_a.compress().as_bytes(), message]);
    // R' = sB - hA
    let check = EdwardsPoint::vartime_double_scalar_mul_basepoint(&h, &(-big_a), &s);
    check.compress() == big_r
}
