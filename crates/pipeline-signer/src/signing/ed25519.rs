use anyhow::{Result, anyhow, bail};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};

use super::signer::PayloadSigner;
use crate::keys::jwk::encode;
use crate::keys::{Algorithm, Jwk};

/// Ed25519 signer (JWS `EdDSA`).
pub struct Ed25519Signer {
    signing_key: Option<SigningKey>,
    verifying_key: VerifyingKey,
}

impl Ed25519Signer {
    /// The SHA-256 hash of the seed becomes the 32-byte secret key.
    pub fn from_seed(seed: &str) -> Self {
        let hash = Sha256::digest(seed.as_bytes());
        Self::from_signing_key(SigningKey::from_bytes(&hash.into()))
    }

    pub fn generate<R: CryptoRng + RngCore>(rng: &mut R) -> Self {
        Self::from_signing_key(SigningKey::generate(rng))
    }

    pub fn from_secret(secret: &[u8]) -> Result<Self> {
        let secret: [u8; 32] = secret
            .try_into()
            .map_err(|_| anyhow!("Ed25519 secret keys are 32 bytes, got {}", secret.len()))?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&secret)))
    }

    /// Builds a key from the JWK `x` (public) and `d` (secret) members; at
    /// least one must be present, and they must agree when both are.
    pub fn from_jwk_parts(x: Option<&[u8]>, d: Option<&[u8]>) -> Result<Self> {
        let public = x
            .map(|x| -> Result<VerifyingKey> {
                let x: [u8; 32] = x
                    .try_into()
                    .map_err(|_| anyhow!("Ed25519 public keys are 32 bytes, got {}", x.len()))?;
                VerifyingKey::from_bytes(&x).map_err(|e| anyhow!("invalid Ed25519 public key: {e}"))
            })
            .transpose()?;

        match (public, d) {
            (_, Some(d)) => {
                let signer = Self::from_secret(d)?;
                if public.is_some_and(|public| public != signer.verifying_key) {
                    bail!("public key does not match the private key");
                }
                Ok(signer)
            }
            (Some(verifying_key), None) => Ok(Self {
                signing_key: None,
                verifying_key,
            }),
            (None, None) => bail!("missing `x`"),
        }
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key: Some(signing_key),
            verifying_key,
        }
    }
}

impl PayloadSigner for Ed25519Signer {
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let signing_key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| anyhow!("Ed25519 key has no private material"))?;
        Ok(signing_key.sign(payload).to_bytes().to_vec())
    }

    fn verify(&self, payload: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        self.verifying_key.verify_strict(payload, &signature).is_ok()
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::EdDsa
    }

    fn can_sign(&self) -> bool {
        self.signing_key.is_some()
    }

    fn public_jwk(&self) -> Jwk {
        Jwk {
            kty: "OKP".to_string(),
            crv: Some("Ed25519".to_string()),
            x: Some(encode(self.verifying_key.as_bytes())),
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
