mod ed25519;
mod hmac;
mod rsa;
mod secp256k1;
mod signer;
mod step;

pub use self::ed25519::Ed25519Signer;
pub use self::hmac::HmacSigner;
pub use self::rsa::RsaSigner;
pub use secp256k1::Secp256k1Signer;
pub use signer::PayloadSigner;
pub use step::{Signature, VerifyFailure, sign_step, sign_step_with_env, verify_step, verify_step_with_env};
