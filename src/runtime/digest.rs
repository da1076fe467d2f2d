//! Archive digests known while the graph is being described.
//!
//! The staging graph always verifies the download against the pinned
//! checksum when it is executed. A [`DigestSource`] lets the describer
//! reject a mismatching archive before any graph is produced, whenever the
//! archive bytes are already available locally.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::RuntimeDistribution;
use crate::error::{ProvisionError, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Smallest possible gzip member: 10 byte header + 8 byte trailer.
const GZIP_MIN_LEN: u64 = 18;

/// Reports the actual sha256 of the archive a distribution resolves to.
pub trait DigestSource {
    /// `Ok(None)` when the digest cannot be known before execution.
    fn sha256(&self, distribution: &RuntimeDistribution) -> Result<Option<String>>;
}

/// Digest unknown while describing; only the in-graph check applies.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deferred;

impl DigestSource for Deferred {
    fn sha256(&self, _distribution: &RuntimeDistribution) -> Result<Option<String>> {
        Ok(None)
    }
}

/// A digest recorded elsewhere, e.g. by a previous download.
#[derive(Debug, Clone)]
pub struct KnownDigest(pub String);

impl DigestSource for KnownDigest {
    fn sha256(&self, _distribution: &RuntimeDistribution) -> Result<Option<String>> {
        Ok(Some(self.0.to_ascii_lowercase()))
    }
}

/// A pre-fetched archive on the local disk. It must exist.
#[derive(Debug, Clone)]
pub struct LocalArchive {
    pub path: PathBuf,
}

impl LocalArchive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DigestSource for LocalArchive {
    fn sha256(&self, distribution: &RuntimeDistribution) -> Result<Option<String>> {
        if !self.path.is_file() {
            return Err(ProvisionError::Fetch {
                url: distribution.download_url.clone(),
                reason: format!("local archive '{}' not found", self.path.display()),
            });
        }
        hash_gzip_archive(&self.path, &distribution.download_url).map(Some)
    }
}

/// Download cache holding archives as `<dir>/<expected sha256>/<archive name>`.
///
/// Entries are keyed by the pinned checksum, so an archive for another
/// version is never looked at. A hit that hashes differently is a corrupt
/// entry. A missing entry is not an error: the digest is simply unknown.
#[derive(Debug, Clone)]
pub struct DownloadCache {
    pub dir: PathBuf,
}

impl DownloadCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `$XDG_CACHE_HOME/runtime-builder/downloads` or the platform equivalent.
    pub fn user_cache() -> Option<Self> {
        dirs::cache_dir().map(|dir| Self::new(dir.join("runtime-builder").join("downloads")))
    }

    pub fn entry_path(&self, distribution: &RuntimeDistribution) -> PathBuf {
        self.dir
            .join(distribution.expected_sha256.to_ascii_lowercase())
            .join(&distribution.archive_name)
    }
}

impl DigestSource for DownloadCache {
    fn sha256(&self, distribution: &RuntimeDistribution) -> Result<Option<String>> {
        let cached = self.entry_path(distribution);
        if !cached.is_file() {
            debug!("no cached archive at {}", cached.display());
            return Ok(None);
        }
        hash_gzip_archive(&cached, &distribution.download_url).map(Some)
    }
}

/// Compare an actual digest against the pinned one.
pub fn verify_sha256(archive: &str, expected: &str, actual: &str) -> Result<()> {
    if !expected.eq_ignore_ascii_case(actual) {
        return Err(ProvisionError::Integrity {
            archive: archive.to_string(),
            expected: expected.to_ascii_lowercase(),
            actual: actual.to_ascii_lowercase(),
        });
    }
    Ok(())
}

pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Stream a file through sha256, returning the hex digest and size.
pub fn sha256_file(path: &Path) -> std::io::Result<(String, u64)> {
    let f = File::open(path)?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    let sha = format!("{:x}", hasher.finalize());
    Ok((sha, size))
}

fn hash_gzip_archive(path: &Path, url: &str) -> Result<String> {
    let mut magic = [0u8; 2];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map_err(|e| ProvisionError::Extraction {
            archive: path.display().to_string(),
            reason: format!("cannot read gzip header: {}", e),
        })?;
    if magic != GZIP_MAGIC {
        return Err(ProvisionError::Extraction {
            archive: path.display().to_string(),
            reason: "not a gzip archive".to_string(),
        });
    }

    let (sha, size) = sha256_file(path).map_err(|e| ProvisionError::Fetch {
        url: url.to_string(),
        reason: format!("reading '{}': {}", path.display(), e),
    })?;
    if size < GZIP_MIN_LEN {
        return Err(ProvisionError::Extraction {
            archive: path.display().to_string(),
            reason: format!("truncated archive ({} bytes)", size),
        });
    }
    debug!("sha256 {} ({} bytes) for {}", sha, size, path.display());
    Ok(sha)
}
