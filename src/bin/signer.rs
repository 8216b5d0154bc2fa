//! `schsm-signer`: maintain detached CMS signatures for files.
//!
//! For each path argument, files are hashed with SHA-256 and signed through
//! the on-card signature template carrying the given label; directories are
//! scanned one level deep. Signatures land next to the files as `.p7s`.
//!
//! The platform reader backend lives outside this crate, so the binary runs
//! against the bundled card simulation: a single reader holding a
//! provisioned card. This keeps the complete signing path exercisable from
//! the command line (CI, format inspection) without hardware.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use schsm::card::Pin;
use schsm::mock::{MockCard, MockHsm, SignatureKind};
use schsm::signer::{FileOutcome, HsmSigner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum KeyKind {
    Rsa,
    Ecdsa,
}

/// Sign files with a SmartCard-HSM signature template.
#[derive(Parser, Debug)]
#[command(name = "schsm-signer", version)]
struct Args {
    /// User PIN (6-16 characters).
    pin: String,

    /// Label of the signing key and its template.
    label: String,

    /// Files or directories to sign.
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Key flavour provisioned on the simulated card.
    #[arg(long, value_enum, default_value = "rsa")]
    key_kind: KeyKind,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // usage problems exit with 1
            eprint!("{e}");
            return ExitCode::from(1);
        }
    };

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            error!(error = %e, "signer failed");
            ExitCode::from(2)
        }
    }
}

fn run(args: &Args) -> Result<bool, Box<dyn std::error::Error>> {
    let kind = match args.key_kind {
        KeyKind::Rsa => SignatureKind::Rsa2048,
        KeyKind::Ecdsa => SignatureKind::EcdsaP256,
    };
    let card = MockCard::blank().with_signing_setup(&args.label, kind, 0x01, 0x05);
    let hsm = MockHsm::builder().reader_with("simulated reader", card).build();

    let pin = Pin::user(&args.pin)?;
    let transport = hsm.transport();
    let mut signer = HsmSigner::open(transport.as_ref(), &pin)?;

    let mut all_ok = true;
    for path in &args.paths {
        if path.is_dir() {
            let summary = signer.sign_directory(&args.label, path)?;
            if summary.failed > 0 {
                all_ok = false;
            }
        } else {
            match signer.sign_file(&args.label, path) {
                Ok(FileOutcome::Signed | FileOutcome::Unmodified | FileOutcome::Empty) => {}
                Err(e) => {
                    error!(path = %path.display(), error = %e, "signing failed");
                    all_ok = false;
                }
            }
        }
    }
    Ok(all_ok)
}
