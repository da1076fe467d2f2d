//! Graph-assembly session: runtime, then mirror, then packages.
//!
//! Each stage consumes the state the previous one returned, so every
//! ordering dependency is carried by the threaded value and an executor
//! cannot reorder them.

use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::graph::GraphState;
use crate::mirror::{configure_mirror, MirrorConfig, MirrorPolicy};
use crate::packages::{PackageGroup, PackageInstaller};
use crate::runtime::digest::{Deferred, DigestSource};
use crate::runtime::{RuntimeDistribution, RuntimeInstaller};
use crate::state::ProvisioningState;

/// Everything an executor and the image finalizer need from one run.
#[derive(Debug, Serialize)]
pub struct Plan {
    pub graph: GraphState,
    pub provisioning: ProvisioningState,
}

impl Plan {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Runs the three provisioning stages in order.
pub struct Provisioner {
    pub runtime: RuntimeInstaller,
    pub mirror: MirrorConfig,
    pub policy: MirrorPolicy,
    digest: Box<dyn DigestSource>,
}

impl Provisioner {
    pub fn new(distribution: RuntimeDistribution, mirror: MirrorConfig) -> Self {
        Self {
            runtime: RuntimeInstaller::new(distribution),
            mirror,
            policy: MirrorPolicy::default(),
            digest: Box::new(Deferred),
        }
    }

    pub fn julia() -> Self {
        Self::new(RuntimeDistribution::julia(), MirrorConfig::julia())
    }

    pub fn with_policy(mut self, policy: MirrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_builder_image(mut self, image: impl Into<String>) -> Self {
        self.runtime = self.runtime.with_builder_image(image);
        self
    }

    /// Where the actual archive digest comes from while describing.
    pub fn with_digest_source(mut self, digest: impl DigestSource + 'static) -> Self {
        self.digest = Box::new(digest);
        self
    }

    /// Package installer wired to this session's runtime and mirror.
    pub fn package_installer(&self) -> PackageInstaller {
        PackageInstaller {
            bin_dir: self.runtime.distribution.bin_dir.clone(),
            ..PackageInstaller::julia(self.mirror.url())
        }
    }

    /// Describe the full provisioning of `root`.
    ///
    /// On error nothing is returned; `state` may hold entries from stages
    /// that completed, and the caller must discard it.
    pub fn provision(
        &self,
        root: &GraphState,
        groups: &[PackageGroup],
        state: &mut ProvisioningState,
    ) -> Result<GraphState> {
        let has_packages = groups.iter().any(|g| !g.is_empty());
        info!(
            "provisioning runtime ({} package group(s), mirror {})",
            groups.len(),
            self.policy
        );

        let mut graph = self.runtime.install_runtime(root, self.digest.as_ref())?;

        if self.policy.wants_mirror(has_packages) {
            graph = configure_mirror(&graph, &self.mirror, state)?;
        } else {
            info!("no packages requested, skipping package mirror");
        }

        self.package_installer()
            .install_packages(&graph, groups, state)
    }

    /// [`Self::provision`] on a fresh [`ProvisioningState`], bundled as a plan.
    pub fn plan(&self, root: &GraphState, groups: &[PackageGroup]) -> Result<Plan> {
        let mut provisioning = ProvisioningState::new();
        let graph = self.provision(root, groups, &mut provisioning)?;
        Ok(Plan {
            graph,
            provisioning,
        })
    }
}

impl Default for Provisioner {
    fn default() -> Self {
        Self::julia()
    }
}
