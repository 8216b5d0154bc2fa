//! Standalone signing front-end.
//!
//! [`HsmSigner`] owns its own card connection, independent of the slot and
//! session machinery: it attaches to the first reader whose card hosts the
//! HSM application, verifies the user PIN once and then signs document
//! hashes through the template engine. The file helpers walk directories
//! and maintain detached `.p7s` signatures next to the signed files.
//!
//! Like the template engine it wraps, a signer instance is single-threaded:
//! callers serialise, and the envelope returned by a sign is invalidated by
//! the next one.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::card::{HsmChannel, Pin};
use crate::error::CkError;
use crate::reader::{CardConnection, ReaderTransport};
use crate::sign::TemplateSigner;
use crate::template::TemplateError;

/// Extension of detached signature files.
pub const SIG_EXTENSION: &str = "p7s";

/// Trailer appended to `.p7s` files: magic plus the signed content length.
/// A later run compares the length to decide whether to re-sign.
const TRAILER_MAGIC: &[u8; 8] = b"SCHSMMD1";

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("'{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl SignerError {
    fn io(path: &Path, source: std::io::Error) -> SignerError {
        SignerError::Io { path: path.to_path_buf(), source }
    }
}

pub type Result<T> = std::result::Result<T, SignerError>;

/// Outcome of [`HsmSigner::sign_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    /// A fresh signature was written.
    Signed,
    /// The existing signature still covers the file.
    Unmodified,
    /// Empty files are not signed.
    Empty,
}

/// Counters of a directory walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignSummary {
    pub signed: u32,
    pub skipped: u32,
    pub failed: u32,
}

// ============================================================================
// SIGNER
// ============================================================================

pub struct HsmSigner {
    connection: Box<dyn CardConnection>,
    engine: TemplateSigner,
}

impl std::fmt::Debug for HsmSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HsmSigner").field("engine", &self.engine).finish()
    }
}

impl HsmSigner {
    /// Attach to the first reader whose card hosts the HSM application and
    /// verify the user PIN.
    pub fn open(transport: &dyn ReaderTransport, pin: &Pin) -> std::result::Result<HsmSigner, TemplateError> {
        for reader in transport.list_readers().map_err(CkError::from)? {
            let Ok(mut connection) = transport.connect(&reader) else {
                continue;
            };
            let mut channel = HsmChannel::new(connection.as_mut());
            if channel.select_app().is_err() {
                continue;
            }
            // this is our card; PIN failures abort rather than burning
            // attempts elsewhere
            channel.verify_user_pin(pin).map_err(TemplateError::from)?;
            info!(reader = reader.as_str(), "signer attached");
            return Ok(HsmSigner { connection, engine: TemplateSigner::new() });
        }
        Err(TemplateError::from(CkError::TokenNotPresent))
    }

    /// Sign a 32-byte document hash under `label`. The returned envelope
    /// borrow is invalidated by the next call.
    pub fn sign_hash(&mut self, label: &str, hash: &[u8]) -> std::result::Result<&[u8], TemplateError> {
        let mut channel = HsmChannel::new(self.connection.as_mut());
        self.engine.sign_hash(&mut channel, label, hash)
    }

    /// Drop the cached template.
    pub fn release_template(&mut self) {
        self.engine.release();
    }

    /// Sign one file if needed, writing `<path>.p7s`.
    ///
    /// Decision table: no signature or unreadable trailer → sign; recorded
    /// length equals the file size → skip; file shrunk → warn and re-sign;
    /// file grew → re-sign.
    pub fn sign_file(&mut self, label: &str, path: &Path) -> Result<FileOutcome> {
        let meta = std::fs::metadata(path).map_err(|e| SignerError::io(path, e))?;
        if meta.len() == 0 {
            info!(path = %path.display(), "empty, skipped");
            return Ok(FileOutcome::Empty);
        }

        let sig_path = sig_path_for(path);
        if let Some(recorded) = read_trailer(&sig_path) {
            if recorded == meta.len() {
                info!(path = %path.display(), "unmodified");
                return Ok(FileOutcome::Unmodified);
            }
            if meta.len() < recorded {
                warn!(path = %path.display(), "shrunk since last signing");
            } else {
                info!(path = %path.display(), "modified");
            }
        } else {
            info!(path = %path.display(), "not yet signed");
        }

        let (hash, hashed_len) = hash_file(path)?;
        let envelope = self.sign_hash(label, &hash)?.to_vec();
        write_signature(&sig_path, &envelope, hashed_len)?;
        info!(sig = %sig_path.display(), "created");
        Ok(FileOutcome::Signed)
    }

    /// Sign every regular file in `dir` (non-recursive). Hidden entries and
    /// `.p7s` files are skipped; per-file failures are logged and counted,
    /// not fatal.
    pub fn sign_directory(&mut self, label: &str, dir: &Path) -> Result<SignSummary> {
        let entries = std::fs::read_dir(dir).map_err(|e| SignerError::io(dir, e))?;
        let mut summary = SignSummary::default();
        for entry in entries {
            let entry = entry.map_err(|e| SignerError::io(dir, e))?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || name.ends_with(&format!(".{SIG_EXTENSION}")) {
                continue;
            }
            if path.is_dir() {
                continue;
            }
            match self.sign_file(label, &path) {
                Ok(FileOutcome::Signed) => summary.signed += 1,
                Ok(_) => summary.skipped += 1,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "signing failed");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }
}

// ============================================================================
// FILE HELPERS
// ============================================================================

/// `<path>.p7s`
pub fn sig_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{SIG_EXTENSION}"));
    PathBuf::from(name)
}

fn hash_file(path: &Path) -> Result<([u8; 32], u64)> {
    let mut file = File::open(path).map_err(|e| SignerError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 0x10000];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).map_err(|e| SignerError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hasher.finalize().into(), total))
}

fn write_signature(sig_path: &Path, envelope: &[u8], content_len: u64) -> Result<()> {
    let mut file = File::create(sig_path).map_err(|e| SignerError::io(sig_path, e))?;
    file.write_all(envelope).map_err(|e| SignerError::io(sig_path, e))?;
    file.write_all(TRAILER_MAGIC).map_err(|e| SignerError::io(sig_path, e))?;
    file.write_all(&content_len.to_be_bytes())
        .map_err(|e| SignerError::io(sig_path, e))?;
    Ok(())
}

/// The recorded content length, or `None` when the signature file is
/// missing or carries no readable trailer.
fn read_trailer(sig_path: &Path) -> Option<u64> {
    let mut file = File::open(sig_path).ok()?;
    let len = file.metadata().ok()?.len();
    if len < (TRAILER_MAGIC.len() + 8) as u64 {
        return None;
    }
    file.seek(SeekFrom::End(-((TRAILER_MAGIC.len() + 8) as i64))).ok()?;
    let mut trailer = [0u8; 16];
    file.read_exact(&mut trailer).ok()?;
    if &trailer[..8] != TRAILER_MAGIC {
        return None;
    }
    Some(u64::from_be_bytes(trailer[8..].try_into().ok()?))
}
