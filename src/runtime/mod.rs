//! Runtime installation: fetch, verify, unpack, expose on PATH.
//!
//! The download happens in a separate staging state built from a small
//! builder image. Only the verified archive is copied into the target
//! state, so curl and the archive never end up in the final layer.

pub mod digest;

use tracing::{debug, info};

use crate::error::{ProvisionError, Result};
use crate::graph::{argv, shell, GraphState};
use digest::{is_sha256_hex, verify_sha256, DigestSource};

pub const JULIA_ROOT_DIR: &str = "/opt/julia";
pub const JULIA_BIN_DIR: &str = "/opt/julia/bin";
pub const JULIA_DOWNLOAD_URL: &str =
    "https://julialang-s3.julialang.org/bin/linux/x64/1.8/julia-1.8.3-linux-x86_64.tar.gz";
pub const JULIA_ARCHIVE_SHA256: &str =
    "33c3b09356ffaa25d3331c3646b1f2d4b09944e8f93fcb994957801b8bbf58a9";
pub const JULIA_ARCHIVE_NAME: &str = "julia.tar.gz";

/// Image used only for the download step.
pub const DEFAULT_BUILDER_IMAGE: &str = "docker.io/curlimages/curl:8.4.0";

/// A downloadable runtime and where it gets installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeDistribution {
    pub download_url: String,
    pub expected_sha256: String,
    pub archive_name: String,
    pub install_root: String,
    pub bin_dir: String,
}

impl RuntimeDistribution {
    /// Julia 1.8.3 for linux x86_64.
    pub fn julia() -> Self {
        Self {
            download_url: JULIA_DOWNLOAD_URL.to_string(),
            expected_sha256: JULIA_ARCHIVE_SHA256.to_string(),
            archive_name: JULIA_ARCHIVE_NAME.to_string(),
            install_root: JULIA_ROOT_DIR.to_string(),
            bin_dir: JULIA_BIN_DIR.to_string(),
        }
    }

    /// Same install layout, different archive.
    pub fn with_download(mut self, url: impl Into<String>, sha256: impl Into<String>) -> Self {
        self.download_url = url.into();
        self.expected_sha256 = sha256.into().to_ascii_lowercase();
        self
    }

    /// Where the archive lives in the target state until it is unpacked.
    pub fn archive_tmp_path(&self) -> String {
        format!("/tmp/{}", self.archive_name)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ProvisionError::InvalidDistribution(msg));

        if !(self.download_url.starts_with("https://") || self.download_url.starts_with("http://"))
        {
            return invalid(format!(
                "download url must be http(s), got '{}'",
                self.download_url
            ));
        }
        if !is_sha256_hex(&self.expected_sha256) {
            return invalid(format!("invalid sha256: '{}'", self.expected_sha256));
        }
        if self.archive_name.is_empty()
            || self.archive_name.contains('/')
            || self.archive_name.starts_with('.')
            || !is_shell_word(&self.archive_name)
        {
            return invalid(format!("invalid archive name: '{}'", self.archive_name));
        }
        if !self.install_root.starts_with('/') {
            return invalid(format!(
                "install root must be absolute: '{}'",
                self.install_root
            ));
        }
        for (what, path) in [("install root", &self.install_root), ("bin dir", &self.bin_dir)] {
            if !is_shell_word(path) {
                return invalid(format!("unsupported characters in {}: '{}'", what, path));
            }
        }
        if !self
            .bin_dir
            .strip_prefix(&self.install_root)
            .is_some_and(|rest| rest.starts_with('/'))
        {
            return invalid(format!(
                "bin dir '{}' must be inside install root '{}'",
                self.bin_dir, self.install_root
            ));
        }
        Ok(())
    }
}

/// Archive names and install paths are spliced unquoted into shell steps.
fn is_shell_word(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'))
}

impl Default for RuntimeDistribution {
    fn default() -> Self {
        Self::julia()
    }
}

/// Describes the runtime install onto a target state.
#[derive(Debug, Clone)]
pub struct RuntimeInstaller {
    pub distribution: RuntimeDistribution,
    pub builder_image: String,
}

impl RuntimeInstaller {
    pub fn new(distribution: RuntimeDistribution) -> Self {
        Self {
            distribution,
            builder_image: DEFAULT_BUILDER_IMAGE.to_string(),
        }
    }

    pub fn with_builder_image(mut self, image: impl Into<String>) -> Self {
        self.builder_image = image.into();
        self
    }

    /// Staging state that downloads the archive and checks it against the
    /// pinned sha256 when executed.
    pub fn fetch_state(&self) -> GraphState {
        let dist = &self.distribution;
        let tmp = dist.archive_tmp_path();

        GraphState::image(&self.builder_image)
            .run(
                argv(&["curl", "-fsSL", dist.download_url.as_str(), "-o", tmp.as_str()]),
                format!("[internal] downloading {}", dist.archive_name),
            )
            .run(
                shell(format!("echo '{}  {}' | sha256sum -c -", dist.expected_sha256, tmp)),
                format!("[internal] verifying checksum of {}", dist.archive_name),
            )
    }

    /// Install the runtime onto `base`.
    ///
    /// A digest reported by `digest` must match the pinned checksum;
    /// otherwise nothing is described and [`ProvisionError::Integrity`] is
    /// returned.
    pub fn install_runtime(
        &self,
        base: &GraphState,
        digest: &dyn DigestSource,
    ) -> Result<GraphState> {
        let dist = &self.distribution;
        dist.validate()?;
        info!("describing runtime install from {}", dist.download_url);

        match digest.sha256(dist)? {
            Some(actual) => {
                verify_sha256(&dist.archive_name, &dist.expected_sha256, &actual)?;
                info!("{} matches pinned sha256", dist.archive_name);
            }
            None => debug!(
                "digest of {} unknown while describing, checked at execution",
                dist.archive_name
            ),
        }

        let staging = self.fetch_state();
        let tmp = dist.archive_tmp_path();

        let installed = base
            .copy(
                &staging,
                &tmp,
                &tmp,
                format!("[internal] copying {} to /tmp", dist.archive_name),
            )
            .mkdir_all(
                &dist.install_root,
                0o755,
                format!("[internal] creating {} folder for runtime", dist.install_root),
            )
            .run(
                shell(format!(
                    "tar -xzf {} --strip-components 1 -C {} && rm {}",
                    tmp, dist.install_root, tmp
                )),
                format!("[internal] unpacking runtime archive under {}", dist.install_root),
            )
            .with_path_entry(&dist.bin_dir);

        Ok(installed)
    }
}
