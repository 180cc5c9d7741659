use crate::keys::{Algorithm, Jwk};

/// Trait for signing and verifying canonical step payloads.
///
/// Implementations are synchronous. For async callers, use `spawn_blocking`.
pub trait PayloadSigner: Send + Sync {
    /// Sign canonical bytes. Returns raw signature bytes.
    fn sign(&self, payload: &[u8]) -> anyhow::Result<Vec<u8>>;

    /// Check raw signature bytes against canonical bytes.
    fn verify(&self, payload: &[u8], signature: &[u8]) -> bool;

    fn algorithm(&self) -> Algorithm;

    /// Whether private key material is present.
    fn can_sign(&self) -> bool;

    /// Verification half of the key, without `kid`/`alg`/`use`.
    fn public_jwk(&self) -> Jwk;

    /// Full key including private members, if present.
    fn private_jwk(&self) -> Option<Jwk>;
}
