use anyhow::{Context, Result, anyhow, bail};
use rand::{CryptoRng, RngCore};
use rand_chacha::ChaCha20Rng;
use rand_chacha::rand_core::SeedableRng;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use super::signer::PayloadSigner;
use crate::keys::jwk::encode;
use crate::keys::{Algorithm, Jwk};

const RSA_KEY_BITS: usize = 2048;

/// RSA PKCS#1 v1.5 signer with SHA-256 digest (JWS `RS256`).
pub struct RsaSigner {
    signing_key: Option<SigningKey<Sha256>>,
    private_key: Option<RsaPrivateKey>,
    verifying_key: VerifyingKey<Sha256>,
    public_key: RsaPublicKey,
}

impl RsaSigner {
    /// The SHA-256 hash of the seed seeds a deterministic CSPRNG used for
    /// RSA key generation.
    pub fn from_seed(seed: &str) -> Result<Self> {
        let hash = Sha256::digest(seed.as_bytes());
        let mut rng = ChaCha20Rng::from_seed(hash.into());
        Self::generate(&mut rng)
    }

    pub fn generate<R: CryptoRng + RngCore>(rng: &mut R) -> Result<Self> {
        let private_key =
            RsaPrivateKey::new(rng, RSA_KEY_BITS).context("generating RSA key")?;
        Self::from_private_key(private_key)
    }

    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|e| anyhow!("invalid PKCS#8 RSA key: {e}"))?;
        Self::from_private_key(private_key)
    }

    pub fn from_public_parts(n: &[u8], e: &[u8]) -> Result<Self> {
        let public_key = RsaPublicKey::new(BigUint::from_bytes_be(n), BigUint::from_bytes_be(e))
            .context("invalid RSA public key")?;
        check_size(&public_key)?;
        Ok(Self {
            signing_key: None,
            private_key: None,
            verifying_key: VerifyingKey::<Sha256>::new(public_key.clone()),
            public_key,
        })
    }

    pub fn from_private_parts(n: &[u8], e: &[u8], d: &[u8], p: &[u8], q: &[u8]) -> Result<Self> {
        let private_key = RsaPrivateKey::from_components(
            BigUint::from_bytes_be(n),
            BigUint::from_bytes_be(e),
            BigUint::from_bytes_be(d),
            vec![BigUint::from_bytes_be(p), BigUint::from_bytes_be(q)],
        )
        .context("invalid RSA private key")?;
        private_key.validate().context("inconsistent RSA private key")?;
        Self::from_private_key(private_key)
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Result<Self> {
        let public_key = private_key.to_public_key();
        check_size(&public_key)?;
        Ok(Self {
            signing_key: Some(SigningKey::<Sha256>::new(private_key.clone())),
            private_key: Some(private_key),
            verifying_key: VerifyingKey::<Sha256>::new(public_key.clone()),
            public_key,
        })
    }
}

fn check_size(public_key: &RsaPublicKey) -> Result<()> {
    let bits = public_key.size() * 8;
    if bits < RSA_KEY_BITS {
        bail!("RSA keys must be at least {RSA_KEY_BITS} bits, got {bits}");
    }
    Ok(())
}

impl PayloadSigner for RsaSigner {
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let signing_key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| anyhow!("RSA key has no private material"))?;
        let signature = signing_key
            .try_sign(payload)
            .map_err(|e| anyhow!("RSA signing failed: {e}"))?;
        Ok(signature.to_vec())
    }

    fn verify(&self, payload: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::try_from(signature) else {
            return false;
        };
        self.verifying_key.verify(payload, &signature).is_ok()
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::Rs256
    }

    fn can_sign(&self) -> bool {
        self.signing_key.is_some()
    }

    fn public_jwk(&self) -> Jwk {
        Jwk {
            kty: "RSA".to_string(),
            n: Some(encode(&self.public_key.n().to_bytes_be())),
            e: Some(encode(&self.public_key.e().to_bytes_be())),
            ..Jwk::default()
        }
    }

    fn private_jwk(&self) -> Option<Jwk> {
        let private_key = self.private_key.as_ref()?;
        let primes = private_key.primes();
        Some(Jwk {
            d: Some(encode(&private_key.d().to_bytes_be())),
            p: primes.first().map(|p| encode(&p.to_bytes_be())),
            q: primes.get(1).map(|q| encode(&q.to_bytes_be())),
            ..self.public_jwk()
        })
    }
}
