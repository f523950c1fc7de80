//! BIP-340 signing capability with interchangeable back-ends.
//!
//! The default back-end wraps the C secp256k1 library; building with the
//! `pure-rust` feature swaps in a RustCrypto (`k256`) implementation.
//! Everything above this module sees only the [`Signer`] trait.

use std::sync::Arc;

use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroize;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("signing failed")]
    Signing,
}

/// A 32-byte secret key that wipes itself on drop.
pub struct SecretKey([u8; 32]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Wipe the key material immediately instead of waiting for drop.
    pub fn zero(&mut self) {
        self.0.zeroize();
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// The signing capability the relay depends on: key generation,
/// deterministic BIP-340 Schnorr signing, verification, and ECDH.
pub trait Signer: Send + Sync {
    /// Generate a fresh keypair with cryptographically secure entropy.
    fn generate(&self) -> Result<(SecretKey, [u8; 32]), SignerError>;

    /// Sign a 32-byte message, returning the 64-byte Schnorr signature.
    fn sign(&self, sec: &SecretKey, msg32: &[u8; 32]) -> Result<[u8; 64], SignerError>;

    /// Verify a Schnorr signature over `msg32` by the x-only `pubkey32`.
    fn verify(&self, pubkey32: &[u8; 32], msg32: &[u8; 32], sig64: &[u8; 64]) -> bool;

    /// X coordinate of `sec · P` for the x-only peer key `peer32`.
    fn ecdh(&self, sec: &SecretKey, peer32: &[u8; 32]) -> Result<[u8; 32], SignerError>;
}

/// Back-end over the libsecp256k1 bindings.
pub struct NativeSigner {
    secp: secp256k1::Secp256k1<secp256k1::All>,
}

impl NativeSigner {
    pub fn new() -> Self {
        Self { secp: secp256k1::Secp256k1::new() }
    }
}

impl Default for NativeSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl Signer for NativeSigner {
    fn generate(&self) -> Result<(SecretKey, [u8; 32]), SignerError> {
        let mut rng = rand::thread_rng();
        loop {
            let mut buf = [0u8; 32];
            rng.fill_bytes(&mut buf);
            // Rejection-samples the negligible out-of-order values.
            let Ok(kp) = secp256k1::Keypair::from_seckey_slice(&self.secp, &buf) else {
                buf.zeroize();
                continue;
            };
            let pubkey = kp.x_only_public_key().0.serialize();
            return Ok((SecretKey::from_bytes(buf), pubkey));
        }
    }

    fn sign(&self, sec: &SecretKey, msg32: &[u8; 32]) -> Result<[u8; 64], SignerError> {
        let kp = secp256k1::Keypair::from_seckey_slice(&self.secp, sec.as_bytes())
            .map_err(|_| SignerError::InvalidSecretKey)?;
        let msg = secp256k1::Message::from_digest_slice(msg32)
            .map_err(|_| SignerError::Signing)?;
        let sig = self.secp.sign_schnorr_no_aux_rand(&msg, &kp);
        Ok(*sig.as_ref())
    }

    fn verify(&self, pubkey32: &[u8; 32], msg32: &[u8; 32], sig64: &[u8; 64]) -> bool {
        let Ok(pk) = secp256k1::XOnlyPublicKey::from_slice(pubkey32) else {
            return false;
        };
        let Ok(sig) = secp256k1::schnorr::Signature::from_slice(sig64) else {
            return false;
        };
        let Ok(msg) = secp256k1::Message::from_digest_slice(msg32) else {
            return false;
        };
        self.secp.verify_schnorr(&sig, &msg, &pk).is_ok()
    }

    fn ecdh(&self, sec: &SecretKey, peer32: &[u8; 32]) -> Result<[u8; 32], SignerError> {
        let sk = secp256k1::SecretKey::from_slice(sec.as_bytes())
            .map_err(|_| SignerError::InvalidSecretKey)?;
        let xonly = secp256k1::XOnlyPublicKey::from_slice(peer32)
            .map_err(|_| SignerError::InvalidPublicKey)?;
        let pk = secp256k1::PublicKey::from_x_only_public_key(
            xonly,
            secp256k1::Parity::Even,
        );
        let point = secp256k1::ecdh::shared_secret_point(&pk, &sk);
        let mut shared = [0u8; 32];
        shared.copy_from_slice(&point[..32]);
        Ok(shared)
    }
}

/// Pure-Rust back-end over the `k256` crate.
#[cfg(feature = "pure-rust")]
pub struct PureSigner;

#[cfg(feature = "pure-rust")]
impl Signer for PureSigner {
    fn generate(&self) -> Result<(SecretKey, [u8; 32]), SignerError> {
        let mut rng = rand::thread_rng();
        loop {
            let mut buf = [0u8; 32];
            rng.fill_bytes(&mut buf);
            let Ok(sk) = k256::schnorr::SigningKey::from_bytes(&buf) else {
                buf.zeroize();
                continue;
            };
            let pubkey: [u8; 32] = sk.verifying_key().to_bytes().into();
            return Ok((SecretKey::from_bytes(buf), pubkey));
        }
    }

    fn sign(&self, sec: &SecretKey, msg32: &[u8; 32]) -> Result<[u8; 64], SignerError> {
        let sk = k256::schnorr::SigningKey::from_bytes(sec.as_bytes())
            .map_err(|_| SignerError::InvalidSecretKey)?;
        let sig = sk
            .sign_raw(msg32, &[0u8; 32])
            .map_err(|_| SignerError::Signing)?;
        Ok(sig.to_bytes())
    }

    fn verify(&self, pubkey32: &[u8; 32], msg32: &[u8; 32], sig64: &[u8; 64]) -> bool {
        let Ok(vk) = k256::schnorr::VerifyingKey::from_bytes(pubkey32) else {
            return false;
        };
        let Ok(sig) = k256::schnorr::Signature::try_from(&sig64[..]) else {
            return false;
        };
        vk.verify_raw(msg32, &sig).is_ok()
    }

    fn ecdh(&self, sec: &SecretKey, peer32: &[u8; 32]) -> Result<[u8; 32], SignerError> {
        let sk = k256::SecretKey::from_bytes(sec.as_bytes().into())
            .map_err(|_| SignerError::InvalidSecretKey)?;
        let mut sec1 = [0u8; 33];
        sec1[0] = 0x02;
        sec1[1..].copy_from_slice(peer32);
        let pk = k256::PublicKey::from_sec1_bytes(&sec1)
            .map_err(|_| SignerError::InvalidPublicKey)?;
        let shared =
            k256::ecdh::diffie_hellman(sk.to_nonzero_scalar(), pk.as_affine());
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes());
        Ok(out)
    }
}

/// The back-end selected by the build configuration.
#[cfg(not(feature = "pure-rust"))]
pub fn default_signer() -> Arc<dyn Signer> {
    Arc::new(NativeSigner::new())
}

#[cfg(feature = "pure-rust")]
pub fn default_signer() -> Arc<dyn Signer> {
    Arc::new(PureSigner)
}
