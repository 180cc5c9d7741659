use std::sync::Arc;

use anyhow::{Context, Result, bail};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};

use super::{Algorithm, Key};
use crate::error::SigningError;
use crate::signing::{Ed25519Signer, HmacSigner, PayloadSigner, RsaSigner, Secp256k1Signer};

/// A JSON Web Key (RFC 7517), limited to the members the supported key
/// types use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(default, rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

impl JwkSet {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serializing key set")
    }
}

pub(crate) fn encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub(crate) fn decode(member: &str, value: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .with_context(|| format!("`{member}` is not valid base64url"))
}

fn required<'a>(member: &str, value: &'a Option<String>) -> Result<Vec<u8>> {
    let value = value
        .as_deref()
        .with_context(|| format!("missing `{member}`"))?;
    decode(member, value)
}

fn optional(member: &str, value: &Option<String>) -> Result<Option<Vec<u8>>> {
    value.as_deref().map(|v| decode(member, v)).transpose()
}

impl Jwk {
    /// The algorithm named by `alg`, or inferred from the key type and curve.
    pub fn algorithm_name(&self) -> Option<String> {
        if let Some(alg) = &self.alg {
            return Some(alg.clone());
        }
        let inferred = match (self.kty.as_str(), self.crv.as_deref()) {
            ("OKP", Some("Ed25519")) => "EdDSA",
            ("EC", Some("secp256k1")) => "ES256K",
            ("EC", Some("P-256")) => "ES256",
            ("EC", Some("P-384")) => "ES384",
            ("EC", Some("P-521")) => "ES512",
            ("RSA", _) => "RS256",
            ("oct", _) => "HS256",
            _ => return None,
        };
        Some(inferred.to_string())
    }

    pub fn into_key(self) -> Result<Key, SigningError> {
        let kid = self
            .kid
            .clone()
            .ok_or_else(|| SigningError::KeyParse("key is missing `kid`".to_string()))?;
        let name = self.algorithm_name().ok_or_else(|| {
            SigningError::KeyParse(format!("{kid}: cannot determine algorithm for kty {:?}", self.kty))
        })?;
        let Some(algorithm) = Algorithm::from_name(&name) else {
            return Ok(Key::unsupported(kid, name));
        };
        let backend = self
            .backend(algorithm)
            .map_err(|e| SigningError::KeyParse(format!("{kid}: {e:#}")))?;
        Ok(Key::new(kid, backend))
    }

    fn expect_type(&self, kty: &str, crv: Option<&str>) -> Result<()> {
        if self.kty != kty {
            bail!("expected kty {kty:?}, found {:?}", self.kty);
        }
        if crv.is_some() && self.crv.as_deref() != crv {
            bail!("expected crv {:?}, found {:?}", crv.unwrap_or_default(), self.crv);
        }
        Ok(())
    }

    fn backend(&self, algorithm: Algorithm) -> Result<Arc<dyn PayloadSigner>> {
        Ok(match algorithm {
            Algorithm::EdDsa => {
                self.expect_type("OKP", Some("Ed25519"))?;
                Arc::new(Ed25519Signer::from_jwk_parts(
                    optional("x", &self.x)?.as_deref(),
                    optional("d", &self.d)?.as_deref(),
                )?)
            }
            Algorithm::Es256k => {
                self.expect_type("EC", Some("secp256k1"))?;
                Arc::new(Secp256k1Signer::from_jwk_parts(
                    &required("x", &self.x)?,
                    &required("y", &self.y)?,
                    optional("d", &self.d)?.as_deref(),
                )?)
            }
            Algorithm::Rs256 => {
                self.expect_type("RSA", None)?;
                let n = required("n", &self.n)?;
                let e = required("e", &self.e)?;
                match optional("d", &self.d)? {
                    None => Arc::new(RsaSigner::from_public_parts(&n, &e)?),
                    Some(d) => Arc::new(RsaSigner::from_private_parts(
                        &n,
                        &e,
                        &d,
                        &required("p", &self.p)?,
                        &required("q", &self.q)?,
                    )?),
                }
            }
            Algorithm::Hs256 => {
                self.expect_type("oct", None)?;
                Arc::new(HmacSigner::new(&required("k", &self.k)?)?)
            }
        })
    }
}

/// Accepts `{"keys": [...]}` or a bare JWK object.
pub fn parse_key_set(bytes: &[u8]) -> Result<Vec<Jwk>, SigningError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| SigningError::KeyParse(e.to_string()))?;
    let parsed = if value.get("keys").is_some() {
        serde_json::from_value::<JwkSet>(value).map(|set| set.keys)
    } else {
        serde_json::from_value::<Jwk>(value).map(|key| vec![key])
    };
    parsed.map_err(|e| SigningError::KeyParse(e.to_string()))
}

fn key_pair(key_id: &str, signer: &dyn PayloadSigner) -> Result<(JwkSet, JwkSet)> {
    let label = |mut jwk: Jwk| {
        jwk.kid = Some(key_id.to_string());
        jwk.alg = Some(signer.algorithm().as_str().to_string());
        jwk.key_use = Some("sig".to_string());
        jwk
    };
    let private = signer
        .private_jwk()
        .context("generated key has no private half")?;
    Ok((
        JwkSet {
            keys: vec![label(private)],
        },
        JwkSet {
            keys: vec![label(signer.public_jwk())],
        },
    ))
}

/// Generates a fresh key and returns `(private, public)` key sets, each
/// holding the one key under `key_id`.
pub fn generate_key_pair(key_id: &str, algorithm: Algorithm) -> Result<(JwkSet, JwkSet)> {
    let mut rng = rand::rngs::OsRng;
    let signer: Box<dyn PayloadSigner> = match algorithm {
        Algorithm::EdDsa => Box::new(Ed25519Signer::generate(&mut rng)),
        Algorithm::Es256k => Box::new(Secp256k1Signer::generate(&mut rng)),
        Algorithm::Rs256 => Box::new(RsaSigner::generate(&mut rng)?),
        Algorithm::Hs256 => Box::new(HmacSigner::generate(&mut rng)),
    };
    key_pair(key_id, signer.as_ref())
}

/// Deterministic variant of [`generate_key_pair`] for fixtures.
pub fn key_pair_from_seed(
    key_id: &str,
    algorithm: Algorithm,
    seed: &str,
) -> Result<(JwkSet, JwkSet)> {
    let signer: Box<dyn PayloadSigner> = match algorithm {
        Algorithm::EdDsa => Box::new(Ed25519Signer::from_seed(seed)),
        Algorithm::Es256k => Box::new(Secp256k1Signer::from_seed(seed)?),
        Algorithm::Rs256 => Box::new(RsaSigner::from_seed(seed)?),
        Algorithm::Hs256 => Box::new(HmacSigner::from_seed(seed)),
    };
    key_pair(key_id, signer.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeySet;

    #[test]
    fn single_jwk_object_is_a_key_set() {
        let (private, _) = key_pair_from_seed("my-key", Algorithm::EdDsa, "seed").unwrap();
        let bytes = serde_json::to_vec(&private.keys[0]).unwrap();
        let keys = KeySet::load(&bytes).unwrap();
        assert_eq!(keys.key_ids().collect::<Vec<_>>(), vec!["my-key"]);
    }

    #[test]
    fn generated_pairs_load_for_every_algorithm() {
        for algorithm in [Algorithm::EdDsa, Algorithm::Es256k, Algorithm::Hs256] {
            let (private, public) = generate_key_pair("k", algorithm).unwrap();
            let private = KeySet::load(private.to_json().unwrap().as_bytes()).unwrap();
            let public = KeySet::load(public.to_json().unwrap().as_bytes()).unwrap();
            assert!(private.lookup("k").unwrap().signer().unwrap().can_sign());
            assert_eq!(public.lookup("k").unwrap().algorithm(), algorithm.as_str());
        }
    }

    #[test]
    fn public_half_omits_private_members() {
        let (_, public) = key_pair_from_seed("k", Algorithm::Es256k, "seed").unwrap();
        let jwk = &public.keys[0];
        assert!(jwk.d.is_none());
        assert!(jwk.x.is_some() && jwk.y.is_some());
        assert_eq!(jwk.key_use.as_deref(), Some("sig"));
    }

    #[test]
    fn algorithm_is_inferred_without_alg() {
        let (private, _) = key_pair_from_seed("k", Algorithm::EdDsa, "seed").unwrap();
        let mut jwk = private.keys[0].clone();
        jwk.alg = None;
        assert_eq!(jwk.algorithm_name().as_deref(), Some("EdDSA"));
        assert_eq!(jwk.into_key().unwrap().algorithm(), "EdDSA");
    }

    #[test]
    fn mismatched_curve_is_a_parse_error() {
        let (private, _) = key_pair_from_seed("k", Algorithm::EdDsa, "seed").unwrap();
        let mut jwk = private.keys[0].clone();
        jwk.crv = Some("X25519".to_string());
        assert!(matches!(jwk.into_key(), Err(SigningError::KeyParse(_))));
    }

    #[test]
    fn missing_kid_is_a_parse_error() {
        let (private, _) = key_pair_from_seed("k", Algorithm::Hs256, "seed").unwrap();
        let mut jwk = private.keys[0].clone();
        jwk.kid = None;
        assert!(matches!(jwk.into_key(), Err(SigningError::KeyParse(_))));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(parse_key_set(b"not json"), Err(SigningError::KeyParse(_))));
    }

    #[test]
    fn padded_base64_is_tolerated() {
        assert_eq!(decode("k", "YQ==").unwrap(), b"a");
    }
}
