//! Local package registry and caching package server.
//!
//! The mirror is built from two Julia scripts embedded at compile time and
//! written verbatim into the image. The registry generator runs to
//! completion first, then the server is started detached so later
//! package installs in the same build can resolve through it.
//!
//! With [`MirrorLifetime::Build`] the server only exists for the build. With
//! [`MirrorLifetime::Service`] the server is also recorded as a service in
//! [`ProvisioningState`] for the image finalizer to start at runtime.

use std::fmt;
use tracing::info;

use crate::error::{ProvisionError, Result};
use crate::graph::{argv, shell, GraphState};
use crate::packages::pkg_add_args;
use crate::state::{ProvisioningState, ServiceSpec};

pub const JULIA_CONFIG_DIR: &str = "/opt/julia/config";
pub const REGISTRY_SCRIPT_NAME: &str = "registry.jl";
pub const SERVER_SCRIPT_NAME: &str = "server.jl";

/// Registry generator, written verbatim into the image.
pub const REGISTRY_SCRIPT: &str = include_str!("assets/registry.jl");
/// Package server definition, written verbatim into the image.
pub const SERVER_SCRIPT: &str = include_str!("assets/server.jl");

/// Address [`SERVER_SCRIPT`] listens on. Clients are pointed here.
pub const MIRROR_HOST: &str = "127.0.0.1";
pub const MIRROR_PORT: u16 = 9999;

/// Julia packages the generator and the server need.
pub const MIRROR_TOOLING: &[&str] = &["LocalRegistry", "LocalPackageServer"];

/// Run operations [`configure_mirror`] always emits.
pub const MIRROR_SETUP_COMMANDS: usize = 6;

pub const SERVICE_NAME: &str = "julia-pkg-server";

/// When the mirror is set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MirrorPolicy {
    /// On every environment build, even without requested packages.
    Always,
    /// Only when at least one package is requested.
    #[default]
    OnDemand,
}

impl MirrorPolicy {
    pub fn wants_mirror(self, has_packages: bool) -> bool {
        match self {
            MirrorPolicy::Always => true,
            MirrorPolicy::OnDemand => has_packages,
        }
    }
}

impl fmt::Display for MirrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorPolicy::Always => write!(f, "always"),
            MirrorPolicy::OnDemand => write!(f, "on-demand"),
        }
    }
}

/// How long the package server is expected to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MirrorLifetime {
    /// Serves the build only; discarded with the build container.
    #[default]
    Build,
    /// Also started by the image finalizer in the runtime container.
    Service,
}

impl fmt::Display for MirrorLifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorLifetime::Build => write!(f, "build"),
            MirrorLifetime::Service => write!(f, "service"),
        }
    }
}

/// Everything needed to describe the mirror setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorConfig {
    pub registry_script: String,
    pub server_script: String,
    pub install_dir: String,
    pub tooling: Vec<String>,
    /// Identity for the commits the registry generator makes.
    pub git_name: String,
    pub git_email: String,
    pub lifetime: MirrorLifetime,
}

impl MirrorConfig {
    pub fn julia() -> Self {
        Self {
            registry_script: REGISTRY_SCRIPT.to_string(),
            server_script: SERVER_SCRIPT.to_string(),
            install_dir: JULIA_CONFIG_DIR.to_string(),
            tooling: MIRROR_TOOLING.iter().map(|s| s.to_string()).collect(),
            git_name: "runtime-builder".to_string(),
            git_email: "runtime-builder@localhost".to_string(),
            lifetime: MirrorLifetime::Build,
        }
    }

    /// URL package clients use to reach the server. Fixed by the embedded
    /// server script, independent of the config.
    pub fn url(&self) -> String {
        format!("http://{}:{}", MIRROR_HOST, MIRROR_PORT)
    }

    pub fn registry_path(&self) -> String {
        format!("{}/{}", self.install_dir, REGISTRY_SCRIPT_NAME)
    }

    pub fn server_path(&self) -> String {
        format!("{}/{}", self.install_dir, SERVER_SCRIPT_NAME)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.install_dir.starts_with('/') || self.install_dir.ends_with('/') {
            return Err(ProvisionError::ConfigWrite {
                path: self.install_dir.clone(),
                reason: "mirror config dir must be absolute without trailing slash".to_string(),
            });
        }
        for (name, content) in [
            (REGISTRY_SCRIPT_NAME, &self.registry_script),
            (SERVER_SCRIPT_NAME, &self.server_script),
        ] {
            if content.trim().is_empty() {
                return Err(ProvisionError::ConfigWrite {
                    path: format!("{}/{}", self.install_dir, name),
                    reason: "script is empty".to_string(),
                });
            }
        }
        Ok(())
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self::julia()
    }
}

/// Describe the mirror setup on top of `root`.
///
/// Requires the runtime to be installed and on PATH already. Records the
/// config directory as writable in `state`.
pub fn configure_mirror(
    root: &GraphState,
    config: &MirrorConfig,
    state: &mut ProvisioningState,
) -> Result<GraphState> {
    config.validate()?;
    let tooling_install = pkg_add_args(&config.tooling)?;
    info!(
        "describing package mirror at {} ({} lifetime)",
        config.url(),
        config.lifetime
    );

    let mirror = root
        .run(
            shell(
                "apt-get update && apt-get install -y --no-install-recommends git \
                 && rm -rf /var/lib/apt/lists/*",
            ),
            "[internal] installing git for the package mirror",
        )
        .run(
            argv(&["git", "config", "--global", "user.name", config.git_name.as_str()]),
            "[internal] setting git user name",
        )
        .run(
            argv(&["git", "config", "--global", "user.email", config.git_email.as_str()]),
            "[internal] setting git user email",
        )
        .run(
            tooling_install,
            format!("[internal] installing mirror tooling: {}", config.tooling.join(" ")),
        )
        .mkdir_all(
            &config.install_dir,
            0o755,
            format!("[internal] creating {} for mirror config", config.install_dir),
        )
        .write_file(
            config.registry_path(),
            config.registry_script.as_str(),
            0o644,
            format!("[internal] writing {}", REGISTRY_SCRIPT_NAME),
        )
        .write_file(
            config.server_path(),
            config.server_script.as_str(),
            0o644,
            format!("[internal] writing {}", SERVER_SCRIPT_NAME),
        );

    state.add_writable_dir(config.install_dir.as_str());

    let mirror = mirror
        .run(
            argv(&["julia", config.registry_path().as_str()]),
            "[internal] generating local package registry",
        )
        .run(
            shell(format!(
                "nohup julia {} > /dev/null 2>&1 &",
                config.server_path()
            )),
            format!("[internal] starting package server on {}", config.url()),
        );

    if config.lifetime == MirrorLifetime::Service {
        state.add_service(ServiceSpec {
            name: SERVICE_NAME.to_string(),
            args: vec!["julia".to_string(), config.server_path()],
            working_dir: config.install_dir.clone(),
        });
    }

    Ok(mirror)
}
