//! SHA-256 content checksums for backup artifacts and their `.sha256` sidecars.

use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddFunctionName;
use function_name::named;
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

/// Read buffer size used when streaming a file through the hash.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Extension appended to an artifact path to locate its checksum record.
pub static SIDECAR_EXT: &str = "sha256";

/// Result of comparing an artifact against its sidecar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verification {
    pub valid: bool,
    pub reason: String,
}

impl Verification {
    fn passed() -> Self {
        Self {
            valid: true,
            reason: "Checksum verification passed".to_string(),
        }
    }

    fn failed<S: Into<String>>(reason: S) -> Self {
        Self {
            valid: false,
            reason: reason.into(),
        }
    }
}

pub struct IntegrityVerifier;

impl IntegrityVerifier {
    /// `<path>.sha256`
    pub fn sidecar_path<P: AsRef<Path>>(path: P) -> PathBuf {
        let mut sidecar = OsString::from(path.as_ref().as_os_str());
        sidecar.push(".");
        sidecar.push(SIDECAR_EXT);
        sidecar.into()
    }

    pub fn compute_checksum<P: AsRef<Path>>(path: P) -> Result<String> {
        Self::compute_checksum_with_chunk_size(path, CHUNK_SIZE)
    }

    #[named]
    pub fn compute_checksum_with_chunk_size<P: AsRef<Path>>(
        path: P,
        chunk_size: usize,
    ) -> Result<String> {
        let path = path.as_ref();
        File::open(path)
            .and_then(|f| Self::digest_reader(f, chunk_size))
            .map_err(|e| {
                Error::integrity(format!("Failed to calculate checksum for {path:?}: {e}"))
            })
            .add_fn_name(function_path!())
    }

    /// Hex encoded SHA-256 of everything `reader` yields, read `chunk_size`
    /// bytes at a time.
    pub fn digest_reader<R: Read>(mut reader: R, chunk_size: usize) -> std::io::Result<String> {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; chunk_size.max(1)];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Writes the raw hex digest, with no trailing newline, to the sidecar of `path`.
    #[named]
    pub fn persist_checksum<P: AsRef<Path>>(path: P, digest: &str) -> Result<PathBuf> {
        let path = path.as_ref();
        let sidecar = Self::sidecar_path(path);
        std::fs::write(&sidecar, digest)
            .map(|_| sidecar)
            .map_err(|e| Error::integrity(format!("Failed to save checksum for {path:?}: {e}")))
            .add_fn_name(function_path!())
    }

    /// A missing sidecar or a digest mismatch is a failed [`Verification`];
    /// only being unable to read either file is an error.
    #[named]
    pub fn verify<P: AsRef<Path>>(path: P) -> Result<Verification> {
        let path = path.as_ref();
        let sidecar = Self::sidecar_path(path);

        let stored = match std::fs::read(&sidecar) {
            Ok(stored) => stored,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(Verification::failed("Checksum file not found"));
            }
            Err(e) => {
                return Err(Error::integrity(format!(
                    "Failed to read checksum file {sidecar:?}: {e}"
                )))
                .add_fn_name(function_path!());
            }
        };
        let Ok(stored) = std::str::from_utf8(&stored) else {
            return Ok(Verification::failed(
                "Checksum verification failed: checksum file is not valid text",
            ));
        };
        let stored = stored.trim();

        let calculated = Self::compute_checksum(path).add_fn_name(function_path!())?;
        if stored.eq_ignore_ascii_case(&calculated) {
            Ok(Verification::passed())
        } else {
            tracing::warn!(
                "Checksum mismatch for {:?}: recorded {}, calculated {}",
                path,
                stored,
                calculated
            );
            Ok(Verification::failed(format!(
                "Checksum verification failed: recorded {stored}, calculated {calculated}"
            )))
        }
    }
}
