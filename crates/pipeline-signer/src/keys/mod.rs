pub mod jwk;
pub mod source;

pub use jwk::{Jwk, JwkSet, generate_key_pair, key_pair_from_seed};
pub use source::KeySource;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::SigningError;
use crate::signing::{Ed25519Signer, HmacSigner, PayloadSigner, RsaSigner, Secp256k1Signer};

/// JWS algorithms this crate can sign and verify with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    EdDsa,
    Es256k,
    Rs256,
    Hs256,
}

impl Algorithm {
    pub const ALL: [Algorithm; 4] = [
        Algorithm::EdDsa,
        Algorithm::Es256k,
        Algorithm::Rs256,
        Algorithm::Hs256,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::EdDsa => "EdDSA",
            Algorithm::Es256k => "ES256K",
            Algorithm::Rs256 => "RS256",
            Algorithm::Hs256 => "HS256",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|algorithm| algorithm.as_str() == name)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named key. Keys whose algorithm this crate does not implement still
/// load, so that using them fails with `UnsupportedAlgorithm` rather than
/// rejecting the whole key set.
#[derive(Clone)]
pub struct Key {
    id: String,
    algorithm: String,
    backend: Option<Arc<dyn PayloadSigner>>,
}

impl Key {
    pub fn new(id: impl Into<String>, backend: Arc<dyn PayloadSigner>) -> Self {
        Self {
            id: id.into(),
            algorithm: backend.algorithm().as_str().to_string(),
            backend: Some(backend),
        }
    }

    pub fn unsupported(id: impl Into<String>, algorithm: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            algorithm: algorithm.into(),
            backend: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Algorithm name as declared by the key, supported or not.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn signer(&self) -> Result<&dyn PayloadSigner, SigningError> {
        self.backend
            .as_deref()
            .ok_or_else(|| SigningError::UnsupportedAlgorithm {
                algorithm: self.algorithm.clone(),
            })
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("id", &self.id)
            .field("algorithm", &self.algorithm)
            .field("private", &self.backend.as_ref().is_some_and(|b| b.can_sign()))
            .finish()
    }
}

/// Keys indexed by key id. Immutable once loaded.
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: BTreeMap<String, Key>,
}

impl KeySet {
    /// Parses a JWKS document, or a single JWK object.
    pub fn load(bytes: &[u8]) -> Result<Self, SigningError> {
        let keys = jwk::parse_key_set(bytes)?
            .into_iter()
            .map(Jwk::into_key)
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_keys(keys)
    }

    /// Builds a one-key set from raw key material: a 32-byte seed for EdDSA,
    /// a 32-byte scalar for ES256K, PKCS#8 DER for RS256, the shared secret
    /// for HS256.
    pub fn from_single(
        key_id: &str,
        algorithm: Algorithm,
        material: &[u8],
    ) -> Result<Self, SigningError> {
        let parse_error = |e: anyhow::Error| SigningError::KeyParse(format!("{key_id}: {e:#}"));
        let backend: Arc<dyn PayloadSigner> = match algorithm {
            Algorithm::EdDsa => Arc::new(Ed25519Signer::from_secret(material).map_err(parse_error)?),
            Algorithm::Es256k => {
                Arc::new(Secp256k1Signer::from_scalar(material).map_err(parse_error)?)
            }
            Algorithm::Rs256 => Arc::new(RsaSigner::from_pkcs8_der(material).map_err(parse_error)?),
            Algorithm::Hs256 => Arc::new(HmacSigner::new(material).map_err(parse_error)?),
        };
        Self::from_keys(vec![Key::new(key_id, backend)])
    }

    pub fn from_source(source: &KeySource) -> Result<Self, SigningError> {
        match source {
            KeySource::Single {
                key_id,
                algorithm,
                material,
            } => Self::from_single(key_id, *algorithm, material),
            other => Self::load(&other.read_bytes()?),
        }
    }

    pub fn from_keys(keys: Vec<Key>) -> Result<Self, SigningError> {
        if keys.is_empty() {
            return Err(SigningError::KeyParse("key set contains no keys".to_string()));
        }
        let mut indexed = BTreeMap::new();
        for key in keys {
            if key.id.is_empty() {
                return Err(SigningError::KeyParse("key id must not be empty".to_string()));
            }
            let id = key.id.clone();
            if indexed.insert(id.clone(), key).is_some() {
                return Err(SigningError::KeyParse(format!("duplicate key id {id:?}")));
            }
        }
        Ok(Self { keys: indexed })
    }

    pub fn lookup(&self, key_id: &str) -> Result<&Key, SigningError> {
        self.keys.get(key_id).ok_or_else(|| SigningError::KeyNotFound {
            key_id: key_id.to_string(),
        })
    }

    /// Picks the signing key. Without a key id the set must hold exactly
    /// one key.
    pub fn select(&self, key_id: Option<&str>) -> Result<&Key, SigningError> {
        match key_id {
            Some(key_id) => self.lookup(key_id),
            None if self.keys.len() == 1 => self
                .keys
                .values()
                .next()
                .ok_or(SigningError::AmbiguousKey { count: 0 }),
            None => Err(SigningError::AmbiguousKey {
                count: self.keys.len(),
            }),
        }
    }

    pub fn key_ids(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
