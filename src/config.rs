//! Declarative environment config (`runtime.toml`).
//!
//! ```toml
//! [image]
//! base = "docker.io/library/ubuntu:22.04"
//!
//! [runtime]
//! local_archive = "downloads/julia.tar.gz"
//! download_cache = true  # or a directory
//!
//! [mirror]
//! setup = "on-demand"
//! lifetime = "build"
//!
//! [packages]
//! groups = [["JSON", "HTTP"], ["Plots"]]
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::graph::GraphState;
use crate::mirror::{MirrorConfig, MirrorLifetime, MirrorPolicy};
use crate::packages::PackageGroup;
use crate::pipeline::Provisioner;
use crate::runtime::digest::{Deferred, DownloadCache, LocalArchive};
use crate::runtime::{RuntimeDistribution, DEFAULT_BUILDER_IMAGE};

pub const DEFAULT_BASE_IMAGE: &str = "docker.io/library/ubuntu:22.04";

/// Parsed and validated environment config.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub base_image: String,
    pub builder_image: String,
    pub distribution: RuntimeDistribution,
    pub local_archive: Option<PathBuf>,
    pub download_cache: Option<PathBuf>,
    pub policy: MirrorPolicy,
    pub lifetime: MirrorLifetime,
    pub groups: Vec<PackageGroup>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuntimeToml {
    image: Option<ImageToml>,
    runtime: Option<RuntimeSectionToml>,
    mirror: Option<MirrorToml>,
    packages: Option<PackagesToml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageToml {
    base: Option<String>,
    builder: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuntimeSectionToml {
    url: Option<String>,
    sha256: Option<String>,
    local_archive: Option<String>,
    download_cache: Option<CacheToml>,
}

/// `download_cache = true` for the user cache dir, or an explicit directory.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CacheToml {
    Enabled(bool),
    Dir(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MirrorToml {
    setup: Option<String>,
    lifetime: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PackagesToml {
    groups: Option<Vec<Vec<String>>>,
}

pub fn load_config(config_path: &Path) -> Result<LoadedConfig> {
    let config_text = fs::read_to_string(config_path)
        .with_context(|| format!("reading runtime config '{}'", config_path.display()))?;
    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    parse_config(&config_text, base_dir)
        .with_context(|| format!("parsing runtime config '{}'", config_path.display()))
}

/// Parse config text; relative paths resolve against `base_dir`.
pub fn parse_config(config_text: &str, base_dir: &Path) -> Result<LoadedConfig> {
    let parsed: RuntimeToml = toml::from_str(config_text)?;

    let image = parsed.image.unwrap_or_default();
    let runtime = parsed.runtime.unwrap_or_default();
    let mirror = parsed.mirror.unwrap_or_default();
    let packages = parsed.packages.unwrap_or_default();

    let distribution = match (runtime.url, runtime.sha256) {
        (None, None) => RuntimeDistribution::julia(),
        (None, Some(sha256)) => RuntimeDistribution::julia()
            .with_download(crate::runtime::JULIA_DOWNLOAD_URL, sha256.trim()),
        (Some(url), Some(sha256)) => {
            RuntimeDistribution::julia().with_download(url.trim(), sha256.trim())
        }
        (Some(url), None) => bail!(
            "runtime.url '{}' overrides the download but runtime.sha256 is missing",
            url
        ),
    };
    distribution
        .validate()
        .context("invalid [runtime] section")?;

    let policy = match mirror.setup.as_deref().map(normalize) {
        None => MirrorPolicy::default(),
        Some(ref s) if s == "always" => MirrorPolicy::Always,
        Some(ref s) if s == "on-demand" || s == "on_demand" => MirrorPolicy::OnDemand,
        Some(other) => bail!(
            "unsupported mirror.setup '{}' (expected 'always' or 'on-demand')",
            other
        ),
    };

    let lifetime = match mirror.lifetime.as_deref().map(normalize) {
        None => MirrorLifetime::default(),
        Some(ref s) if s == "build" => MirrorLifetime::Build,
        Some(ref s) if s == "service" => MirrorLifetime::Service,
        Some(other) => bail!(
            "unsupported mirror.lifetime '{}' (expected 'build' or 'service')",
            other
        ),
    };

    let groups = packages
        .groups
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(i, names)| {
            PackageGroup::new(names.into_iter().map(|n| n.trim().to_string()))
                .with_context(|| format!("invalid packages.groups[{}]", i))
        })
        .collect::<Result<Vec<_>>>()?;

    let download_cache = match runtime.download_cache {
        None | Some(CacheToml::Enabled(false)) => None,
        Some(CacheToml::Enabled(true)) => Some(
            DownloadCache::user_cache()
                .context("runtime.download_cache: no user cache directory on this host")?
                .dir,
        ),
        Some(CacheToml::Dir(dir)) if dir.trim().is_empty() => {
            bail!("runtime.download_cache must not be empty")
        }
        Some(CacheToml::Dir(dir)) => Some(resolve_path(base_dir, dir.trim())),
    };

    Ok(LoadedConfig {
        base_image: non_empty(image.base, "image.base")?
            .unwrap_or_else(|| DEFAULT_BASE_IMAGE.to_string()),
        builder_image: non_empty(image.builder, "image.builder")?
            .unwrap_or_else(|| DEFAULT_BUILDER_IMAGE.to_string()),
        distribution,
        local_archive: runtime
            .local_archive
            .map(|path| resolve_path(base_dir, &path)),
        download_cache,
        policy,
        lifetime,
        groups,
    })
}

impl LoadedConfig {
    pub fn base_state(&self) -> GraphState {
        GraphState::image(&self.base_image)
    }

    /// Provisioner for this config.
    ///
    /// An explicit `local_archive` must exist and is always hashed. A
    /// configured download cache is consulted otherwise. Without either the
    /// digest is only checked when the graph executes.
    pub fn provisioner(&self) -> Provisioner {
        let mirror = MirrorConfig {
            lifetime: self.lifetime,
            ..MirrorConfig::julia()
        };
        let provisioner = Provisioner::new(self.distribution.clone(), mirror)
            .with_policy(self.policy)
            .with_builder_image(&self.builder_image);

        match (&self.local_archive, &self.download_cache) {
            (Some(path), _) => provisioner.with_digest_source(LocalArchive::new(path)),
            (None, Some(dir)) => provisioner.with_digest_source(DownloadCache::new(dir)),
            (None, None) => provisioner.with_digest_source(Deferred),
        }
    }
}

fn normalize(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

fn non_empty(value: Option<String>, field: &str) -> Result<Option<String>> {
    match value {
        Some(v) if v.trim().is_empty() => bail!("{} must not be empty", field),
        Some(v) => Ok(Some(v.trim().to_string())),
        None => Ok(None),
    }
}

fn resolve_path(base_dir: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base_dir.join(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::JULIA_ARCHIVE_SHA256;
    use tempfile::TempDir;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("", Path::new("/etc")).unwrap();

        assert_eq!(config.base_image, DEFAULT_BASE_IMAGE);
        assert_eq!(config.builder_image, DEFAULT_BUILDER_IMAGE);
        assert_eq!(config.distribution, RuntimeDistribution::julia());
        assert_eq!(config.policy, MirrorPolicy::OnDemand);
        assert_eq!(config.lifetime, MirrorLifetime::Build);
        assert!(config.groups.is_empty());
        assert!(config.local_archive.is_none());
    }

    #[test]
    fn test_full_config() {
        let text = r#"
            [image]
            base = "debian:bookworm"

            [runtime]
            local_archive = "downloads/julia.tar.gz"

            [mirror]
            setup = "Always"
            lifetime = "service"

            [packages]
            groups = [["JSON", "HTTP"], ["Plots"]]
        "#;
        let config = parse_config(text, Path::new("/work")).unwrap();

        assert_eq!(config.base_image, "debian:bookworm");
        assert_eq!(config.policy, MirrorPolicy::Always);
        assert_eq!(config.lifetime, MirrorLifetime::Service);
        assert_eq!(
            config.local_archive,
            Some(PathBuf::from("/work/downloads/julia.tar.gz"))
        );
        assert_eq!(config.groups.len(), 2);
        assert_eq!(config.groups[0].names(), ["JSON", "HTTP"]);
        assert_eq!(config.groups[1].names(), ["Plots"]);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = parse_config("[packages]\nlist = []\n", Path::new("/")).unwrap_err();
        assert!(format!("{:#}", err).contains("unknown field"));
    }

    #[test]
    fn test_url_override_requires_sha256() {
        let text = "[runtime]\nurl = \"https://example.org/julia.tar.gz\"\n";
        let err = parse_config(text, Path::new("/")).unwrap_err();
        assert!(err.to_string().contains("runtime.sha256 is missing"));
    }

    #[test]
    fn test_malformed_sha256_rejected() {
        let text = "[runtime]\nsha256 = \"abc\"\n";
        assert!(parse_config(text, Path::new("/")).is_err());
    }

    #[test]
    fn test_bad_package_name_reports_group() {
        let text = "[packages]\ngroups = [[\"JSON\"], [\"bad name\"]]\n";
        let err = parse_config(text, Path::new("/")).unwrap_err();
        assert!(err.to_string().contains("packages.groups[1]"));
    }

    #[test]
    fn test_unsupported_setup_rejected() {
        let text = "[mirror]\nsetup = \"sometimes\"\n";
        let err = parse_config(text, Path::new("/")).unwrap_err();
        assert!(err.to_string().contains("unsupported mirror.setup"));
    }

    #[test]
    fn test_load_config_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("runtime.toml");
        fs::write(&path, "[packages]\ngroups = [[\"JSON\"]]\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.groups.len(), 1);
    }

    #[test]
    fn test_load_config_missing_file() {
        let temp = TempDir::new().unwrap();
        let err = load_config(&temp.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("reading runtime config"));
    }

    fn write_mismatching_archive(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut bytes = vec![0x1f, 0x8b, 0x08, 0x00];
        bytes.extend_from_slice(&[0u8; 16]);
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_default_config_ignores_host_download_cache() {
        let temp = TempDir::new().unwrap();
        let cache = temp.path().join("cache");
        write_mismatching_archive(&cache.join("julia.tar.gz"));
        write_mismatching_archive(&cache.join(JULIA_ARCHIVE_SHA256).join("julia.tar.gz"));

        let config = parse_config("[packages]\ngroups = [[\"JSON\"]]\n", temp.path()).unwrap();
        assert!(config.download_cache.is_none());

        let plan = config
            .provisioner()
            .plan(&config.base_state(), &config.groups)
            .unwrap();
        assert!(plan.graph.env("JULIA_DEPOT_PATH").is_some());
    }

    #[test]
    fn test_configured_cache_entry_is_verified() {
        let temp = TempDir::new().unwrap();
        write_mismatching_archive(
            &temp
                .path()
                .join("cache")
                .join(JULIA_ARCHIVE_SHA256)
                .join("julia.tar.gz"),
        );

        let config = parse_config("[runtime]\ndownload_cache = \"cache\"\n", temp.path()).unwrap();
        assert_eq!(config.download_cache, Some(temp.path().join("cache")));

        let err = config
            .provisioner()
            .plan(&config.base_state(), &config.groups)
            .unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_download_cache_false_is_disabled() {
        let config = parse_config("[runtime]\ndownload_cache = false\n", Path::new("/")).unwrap();
        assert!(config.download_cache.is_none());
    }

    #[test]
    fn test_provisioner_with_missing_local_archive_fails() {
        let temp = TempDir::new().unwrap();
        let text = "[runtime]\nlocal_archive = \"nope.tar.gz\"\n";
        let config = parse_config(text, temp.path()).unwrap();

        let err = config
            .provisioner()
            .plan(&config.base_state(), &config.groups)
            .unwrap_err();
        assert!(matches!(err, crate::error::ProvisionError::Fetch { .. }));
    }
}
