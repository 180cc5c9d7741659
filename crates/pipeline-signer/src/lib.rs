pub mod canonical;
pub mod error;
pub mod keys;
pub mod pipeline;
pub mod request;
pub mod server;
pub mod signing;
pub mod validate;

pub use error::{ServerError, SigningError};
pub use keys::{Algorithm, Key, KeySet, KeySource};
pub use pipeline::walker::{Outcome, StepReport, VerificationReport, sign_all, verify_all};
pub use pipeline::{PipelineDocument, Step, StepKind, StepPath};
pub use request::{sign_pipeline, verify_pipeline};
pub use server::{AppState, router, run};
pub use signing::{PayloadSigner, Signature, VerifyFailure, sign_step, verify_step};
pub use validate::{SigningInput, VerificationInput};
