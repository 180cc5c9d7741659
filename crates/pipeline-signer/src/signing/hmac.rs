use anyhow::{Result, anyhow, bail};
use hmac::{Hmac, Mac};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};

use super::signer::PayloadSigner;
use crate::keys::jwk::encode;
use crate::keys::{Algorithm, Jwk};

type HmacSha256 = Hmac<Sha256>;

const MIN_SECRET_LEN: usize = 32;

/// HMAC-SHA-256 (JWS `HS256`). Symmetric: the verification key is the
/// secret itself, so a "public" key set for this algorithm can also sign.
pub struct HmacSigner {
    secret: Vec<u8>,
}

impl HmacSigner {
    pub fn new(secret: &[u8]) -> Result<Self> {
        if secret.is_empty() {
            bail!("HMAC secret must not be empty");
        }
        if secret.len() < MIN_SECRET_LEN {
            tracing::warn!(
                len = secret.len(),
                "HMAC secret is shorter than {MIN_SECRET_LEN} bytes"
            );
        }
        Ok(Self {
            secret: secret.to_vec(),
        })
    }

    pub fn from_seed(seed: &str) -> Self {
        Self {
            secret: Sha256::digest(seed.as_bytes()).to_vec(),
        }
    }

    pub fn generate<R: CryptoRng + RngCore>(rng: &mut R) -> Self {
        let mut secret = vec![0u8; MIN_SECRET_LEN];
        rng.fill_bytes(&mut secret);
        Self { secret }
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret).map_err(|e| anyhow!("invalid HMAC key: {e}"))
    }
}

impl PayloadSigner for HmacSigner {
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut mac = self.mac()?;
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn verify(&self, payload: &[u8], signature: &[u8]) -> bool {
        let Ok(mut mac) = self.mac() else {
            return false;
        };
        mac.update(payload);
        mac.verify_slice(signature).is_ok()
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::Hs256
    }

    fn can_sign(&self) -> bool {
        true
    }

    fn public_jwk(&self) -> Jwk {
        Jwk {
            kty: "oct".to_string(),
            k: Some(encode(&self.secret)),
            ..Jwk::default()
        }
    }

    fn private_jwk(&self) -> Option<Jwk> {
        Some(self.public_jwk())
    }
}
