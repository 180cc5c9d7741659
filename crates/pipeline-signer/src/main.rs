use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use pipeline_signer::keys::{generate_key_pair, key_pair_from_seed};
use pipeline_signer::validate::validate_key_sources;
use pipeline_signer::{
    Algorithm, AppState, KeySet, KeySource, Outcome, SigningInput, VerificationInput, run,
    sign_pipeline, verify_pipeline,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SigningAlgorithm {
    Eddsa,
    Es256k,
    Rs256,
    Hs256,
}

impl From<SigningAlgorithm> for Algorithm {
    fn from(algorithm: SigningAlgorithm) -> Self {
        match algorithm {
            SigningAlgorithm::Eddsa => Algorithm::EdDsa,
            SigningAlgorithm::Es256k => Algorithm::Es256k,
            SigningAlgorithm::Rs256 => Algorithm::Rs256,
            SigningAlgorithm::Hs256 => Algorithm::Hs256,
        }
    }
}

#[derive(Parser)]
#[clap(name = "pipeline-signer", version, about = "Sign and verify pipeline steps")]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign every command step of a pipeline.
    Sign(SignArgs),
    /// Verify every signed step; exits non-zero if any step fails.
    Verify(VerifyArgs),
    /// Generate a private and a public key set.
    Keygen(KeygenArgs),
    /// Serve signing and verification over HTTP.
    Serve(ServeArgs),
}

#[derive(clap::Args)]
struct KeyArgs {
    /// Inline JWKS (or single JWK) JSON.
    #[clap(long, env = "PIPELINE_JWKS", hide_env_values = true)]
    jwks: Option<String>,
    #[clap(long, env = "PIPELINE_JWKS_FILE")]
    jwks_file: Option<PathBuf>,
}

#[derive(clap::Args)]
struct SignArgs {
    #[clap(long, env = "PIPELINE_REPOSITORY")]
    repository: String,
    #[clap(flatten)]
    keys: KeyArgs,
    #[clap(long, env = "PIPELINE_JWKS_KEY_ID")]
    jwks_key_id: Option<String>,
    /// Unsigned pipeline file, `-` for stdin.
    #[clap(long, default_value = "-")]
    steps: PathBuf,
    /// Where to write the signed pipeline; stdout if omitted.
    #[clap(long)]
    output: Option<PathBuf>,
}

#[derive(clap::Args)]
struct VerifyArgs {
    #[clap(long, env = "PIPELINE_REPOSITORY")]
    repository: String,
    #[clap(flatten)]
    keys: KeyArgs,
    /// Signed pipeline file, `-` for stdin.
    #[clap(long, default_value = "-")]
    steps: PathBuf,
}

#[derive(clap::Args)]
struct KeygenArgs {
    #[clap(long)]
    key_id: String,
    #[clap(long, value_enum, default_value = "eddsa")]
    algorithm: SigningAlgorithm,
    /// Derive the key from a seed instead of the OS RNG. For fixtures only.
    #[clap(long)]
    seed: Option<String>,
    #[clap(long)]
    private_out: PathBuf,
    #[clap(long)]
    public_out: PathBuf,
}

#[derive(clap::Args)]
struct ServeArgs {
    #[clap(long, env = "HOST", default_value = "127.0.0.1")]
    host: String,
    #[clap(long, env = "PORT", default_value = "3000")]
    port: u16,
    #[clap(flatten)]
    keys: KeyArgs,
    /// Key used when a sign request names none.
    #[clap(long, env = "PIPELINE_JWKS_KEY_ID")]
    jwks_key_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Sign(args) => sign(args),
        Command::Verify(args) => verify(args),
        Command::Keygen(args) => keygen(args),
        Command::Serve(args) => serve(args).await,
    }
}

fn read_steps(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("reading steps from stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn sign(args: SignArgs) -> Result<()> {
    let input = SigningInput {
        repository: args.repository,
        unsigned_steps: read_steps(&args.steps)?,
        jwks: args.keys.jwks,
        jwks_file: args.keys.jwks_file,
        jwks_key_id: args.jwks_key_id,
    };
    let signed = sign_pipeline(&input)?;
    match args.output {
        Some(path) => {
            std::fs::write(&path, signed).with_context(|| format!("writing {}", path.display()))?
        }
        None => print!("{signed}"),
    }
    Ok(())
}

fn verify(args: VerifyArgs) -> Result<()> {
    let input = VerificationInput {
        repository: args.repository,
        signed_steps: read_steps(&args.steps)?,
        jwks: args.keys.jwks,
        jwks_file: args.keys.jwks_file,
    };
    let report = verify_pipeline(&input)?;
    for step in &report.steps {
        match &step.outcome {
            Outcome::Valid => println!("{}\t{}\tvalid", step.path, step.kind),
            Outcome::Skipped => println!("{}\t{}\tskipped", step.path, step.kind),
            Outcome::Failed(failure) => println!("{}\t{}\tFAILED: {failure}", step.path, step.kind),
        }
    }
    let failed = report.failures().count();
    if failed > 0 {
        bail!("{failed} step(s) failed verification");
    }
    Ok(())
}

fn keygen(args: KeygenArgs) -> Result<()> {
    let algorithm = Algorithm::from(args.algorithm);
    let (private, public) = match &args.seed {
        Some(seed) => key_pair_from_seed(&args.key_id, algorithm, seed)?,
        None => generate_key_pair(&args.key_id, algorithm)?,
    };
    std::fs::write(&args.private_out, private.to_json()?)
        .with_context(|| format!("writing {}", args.private_out.display()))?;
    std::fs::write(&args.public_out, public.to_json()?)
        .with_context(|| format!("writing {}", args.public_out.display()))?;
    tracing::info!(key_id = %args.key_id, %algorithm, "generated key pair");
    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let keys = match (&args.keys.jwks, &args.keys.jwks_file) {
        (None, None) => {
            tracing::warn!("no key set configured; /sign and /verify will return 503");
            None
        }
        (jwks, jwks_file) => {
            validate_key_sources(jwks.as_deref(), jwks_file.as_deref())?;
            let source = KeySource::select(jwks.as_deref(), jwks_file.as_deref())?;
            let keys = KeySet::from_source(&source)?;
            tracing::info!(keys = keys.len(), "loaded key set");
            Some(Arc::new(keys))
        }
    };

    run(
        args.host,
        args.port,
        AppState {
            keys,
            default_key_id: args.jwks_key_id,
        },
    )
    .await
}
