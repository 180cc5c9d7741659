use anyhow::{Result, anyhow, bail};
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};

use super::signer::PayloadSigner;
use crate::keys::jwk::encode;
use crate::keys::{Algorithm, Jwk};

/// ECDSA over secp256k1 with a SHA-256 prehash (JWS `ES256K`).
///
/// Signatures are the 64-byte `r || s` encoding.
pub struct Secp256k1Signer {
    signing_key: Option<SigningKey>,
    verifying_key: VerifyingKey,
}

impl Secp256k1Signer {
    /// The SHA-256 hash of the seed becomes the 32-byte private key.
    pub fn from_seed(seed: &str) -> Result<Self> {
        let hash = Sha256::digest(seed.as_bytes());
        let signing_key = SigningKey::from_bytes((&hash).into())
            .map_err(|e| anyhow!("invalid seed: {e}"))?;
        Ok(Self::from_signing_key(signing_key))
    }

    pub fn generate<R: CryptoRng + RngCore>(rng: &mut R) -> Self {
        Self::from_signing_key(SigningKey::random(rng))
    }

    pub fn from_scalar(scalar: &[u8]) -> Result<Self> {
        let signing_key =
            SigningKey::from_slice(scalar).map_err(|e| anyhow!("invalid secp256k1 scalar: {e}"))?;
        Ok(Self::from_signing_key(signing_key))
    }

    /// Builds a key from JWK coordinates. With `d` the key can sign, and the
    /// coordinates must belong to it.
    pub fn from_jwk_parts(x: &[u8], y: &[u8], d: Option<&[u8]>) -> Result<Self> {
        if x.len() != 32 || y.len() != 32 {
            bail!("secp256k1 coordinates must be 32 bytes each");
        }
        let mut point = Vec::with_capacity(65);
        point.push(0x04);
        point.extend_from_slice(x);
        point.extend_from_slice(y);
        let verifying_key = VerifyingKey::from_sec1_bytes(&point)
            .map_err(|e| anyhow!("invalid secp256k1 public key: {e}"))?;

        let Some(d) = d else {
            return Ok(Self {
                signing_key: None,
                verifying_key,
            });
        };
        let signer = Self::from_scalar(d)?;
        if signer.verifying_key != verifying_key {
            bail!("public coordinates do not match the private key");
        }
        Ok(signer)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = *signing_key.verifying_key();
        Self {
            signing_key: Some(signing_key),
            verifying_key,
        }
    }
}

impl PayloadSigner for Secp256k1Signer {
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let signing_key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| anyhow!("secp256k1 key has no private material"))?;
        let digest = Sha256::digest(payload);
        let signature: Signature = signing_key
            .sign_prehash(&digest)
            .map_err(|e| anyhow!("secp256k1 sign_prehash failed: {e}"))?;
        Ok(signature.to_bytes().to_vec())
    }

    fn verify(&self, payload: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        self.verifying_key
            .verify_prehash(&Sha256::digest(payload), &signature)
            .is_ok()
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::Es256k
    }

    fn can_sign(&self) -> bool {
        self.signing_key.is_some()
    }

    fn public_jwk(&self) -> Jwk {
        let point = self.verifying_key.to_encoded_point(false);
        Jwk {
            kty: "EC".to_string(),
            crv: Some("secp256k1".to_string()),
            x: point.x().map(|x| encode(x)),
            y: point.y().map(|y| encode(y)),
            ..Jwk::default()
        }
    }

    fn private_jwk(&self) -> Option<Jwk> {
        let signing_key = self.signing_key.as_ref()?;
        Some(Jwk {
            d: Some(encode(&signing_key.to_bytes())),
            ..self.public_jwk()
        })
    }
}
