//! Batched Julia package installation through the local mirror.
//!
//! Each [`PackageGroup`] becomes exactly one `Pkg.add([...])` command.
//! Groups are installed in caller order since later groups may rely on
//! earlier ones.

use tracing::{debug, info};

use crate::error::{ProvisionError, Result};
use crate::graph::GraphState;
use crate::runtime::JULIA_BIN_DIR;
use crate::state::ProvisioningState;

pub const JULIA_PKG_DIR: &str = "/opt/julia/user_packages";
pub const DEPOT_PATH_ENV: &str = "JULIA_DEPOT_PATH";
pub const PKG_SERVER_ENV: &str = "JULIA_PKG_SERVER";

/// Registry every install resolves against, fetched through the mirror.
pub const DEFAULT_REGISTRY: &str = "General";

/// Package names installed together by one command, in the given order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackageGroup {
    names: Vec<String>,
}

impl PackageGroup {
    /// Build a group, rejecting names that are not valid package names.
    pub fn new<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        for name in &names {
            validate_package_name(name)?;
        }
        Ok(Self { names })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Package names are identifiers, optionally with a `.jl` style suffix.
///
/// Anything else could break out of the quoted install expression.
pub fn validate_package_name(name: &str) -> Result<()> {
    let reject = |reason: &str| {
        Err(ProvisionError::ToolInstall {
            tool: name.to_string(),
            reason: reason.to_string(),
        })
    };

    let Some(first) = name.chars().next() else {
        return reject("package name is empty");
    };
    if first.is_ascii_digit() || first == '.' {
        return reject("package name must start with a letter or '_'");
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '.'))
    {
        return reject(&format!("invalid character {:?} in package name", bad));
    }
    Ok(())
}

/// `julia -e 'using Pkg; Pkg.add(["A","B"])'` as argv.
pub fn pkg_add_args(names: &[String]) -> Result<Vec<String>> {
    for name in names {
        validate_package_name(name)?;
    }
    Ok(vec![
        "julia".to_string(),
        "-e".to_string(),
        format!(r#"using Pkg; Pkg.add(["{}"])"#, names.join(r#"",""#)),
    ])
}

/// `julia -e 'using Pkg; Pkg.Registry.add("General")'` as argv.
pub fn registry_add_args(registry: &str) -> Vec<String> {
    vec![
        "julia".to_string(),
        "-e".to_string(),
        format!(r#"using Pkg; Pkg.Registry.add("{}")"#, registry),
    ]
}

/// Describes package installs and their bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInstaller {
    pub depot_dir: String,
    pub bin_dir: String,
    pub mirror_url: String,
    pub registry: String,
}

impl PackageInstaller {
    pub fn julia(mirror_url: impl Into<String>) -> Self {
        Self {
            depot_dir: JULIA_PKG_DIR.to_string(),
            bin_dir: JULIA_BIN_DIR.to_string(),
            mirror_url: mirror_url.into(),
            registry: DEFAULT_REGISTRY.to_string(),
        }
    }

    /// Install every non-empty group onto `root`.
    ///
    /// Without any package this returns `root` itself and leaves `state`
    /// untouched. Otherwise the depot and mirror variables are exported on
    /// the graph and in `state`, and the depot is recorded as writable.
    pub fn install_packages(
        &self,
        root: &GraphState,
        groups: &[PackageGroup],
        state: &mut ProvisioningState,
    ) -> Result<GraphState> {
        let groups: Vec<&PackageGroup> = groups.iter().filter(|g| !g.is_empty()).collect();
        if groups.is_empty() {
            debug!("no packages requested, skipping package install");
            return Ok(root.clone());
        }
        if !self.depot_dir.starts_with('/') {
            return Err(ProvisionError::ConfigWrite {
                path: self.depot_dir.clone(),
                reason: "package depot must be an absolute path".to_string(),
            });
        }

        // Build every command first so a bad name leaves `state` untouched.
        let installs = groups
            .iter()
            .map(|group| Ok((pkg_add_args(group.names())?, group.names().join(" "))))
            .collect::<Result<Vec<_>>>()?;
        info!("describing {} package install command(s)", installs.len());

        let mut root = root
            .mkdir_all(
                &self.depot_dir,
                0o755,
                "[internal] creating folder for julia packages",
            )
            .with_path_entry(&self.bin_dir);

        root = state.export_env(&root, DEPOT_PATH_ENV, &self.depot_dir);
        root = state.export_env(&root, PKG_SERVER_ENV, &self.mirror_url);

        root = root.run(
            registry_add_args(&self.registry),
            format!("[internal] adding {} registry through {}", self.registry, self.mirror_url),
        );

        state.add_writable_dir(self.depot_dir.as_str());

        for (args, listing) in installs {
            root = root.run(
                args,
                format!("[internal] installing Julia packages: {}", listing),
            );
        }

        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installer() -> PackageInstaller {
        PackageInstaller::julia("http://127.0.0.1:9999")
    }

    fn root() -> GraphState {
        GraphState::image("docker.io/library/ubuntu:22.04")
    }

    fn group(names: &[&str]) -> PackageGroup {
        PackageGroup::new(names.iter().copied()).unwrap()
    }

    #[test]
    fn test_empty_groups_fast_path() {
        let root = root();
        let mut state = ProvisioningState::new();

        let result = installer().install_packages(&root, &[], &mut state).unwrap();

        assert!(result.ptr_eq(&root));
        assert_eq!(state, ProvisioningState::new());
    }

    #[test]
    fn test_only_empty_groups_take_fast_path() {
        let root = root();
        let mut state = ProvisioningState::new();
        let groups = vec![PackageGroup::default(), PackageGroup::default()];

        let result = installer()
            .install_packages(&root, &groups, &mut state)
            .unwrap();

        assert!(result.ptr_eq(&root));
        assert!(state.writable_directories.is_empty());
    }

    #[test]
    fn test_one_command_per_group_in_order() {
        let mut state = ProvisioningState::new();
        let groups = vec![group(&["A", "B"]), group(&["C"])];

        let result = installer()
            .install_packages(&root(), &groups, &mut state)
            .unwrap();
        let installs: Vec<String> = result
            .commands()
            .into_iter()
            .filter(|c| c.contains("Pkg.add("))
            .collect();

        assert_eq!(installs.len(), 2);
        assert!(installs[0].ends_with(r#"Pkg.add(["A","B"])"#));
        assert!(installs[1].ends_with(r#"Pkg.add(["C"])"#));
    }

    #[test]
    fn test_registry_add_precedes_installs() {
        let mut state = ProvisioningState::new();
        let groups = vec![group(&["JSON"]), group(&["HTTP"]), group(&["Plots"])];

        let result = installer()
            .install_packages(&root(), &groups, &mut state)
            .unwrap();
        let commands = result.commands();
        let registry = commands
            .iter()
            .position(|c| c.contains("Pkg.Registry.add"))
            .unwrap();

        for (i, command) in commands.iter().enumerate() {
            if command.contains("Pkg.add(") {
                assert!(registry < i, "registry add must come before '{}'", command);
            }
        }
    }

    #[test]
    fn test_env_exports_match_graph_env() {
        let mut state = ProvisioningState::new();
        let result = installer()
            .install_packages(&root(), &[group(&["JSON"])], &mut state)
            .unwrap();

        for key in [DEPOT_PATH_ENV, PKG_SERVER_ENV] {
            assert_eq!(
                result.env(key),
                state.environment_exports.get(key).map(String::as_str),
                "{} diverged",
                key
            );
        }
        assert_eq!(result.env(DEPOT_PATH_ENV), Some(JULIA_PKG_DIR));
        assert_eq!(result.env(PKG_SERVER_ENV), Some("http://127.0.0.1:9999"));
    }

    #[test]
    fn test_bin_dir_on_path_once() {
        let mut state = ProvisioningState::new();
        let already = root().with_path_entry(JULIA_BIN_DIR);

        let result = installer()
            .install_packages(&already, &[group(&["JSON"])], &mut state)
            .unwrap();
        let path = result.env("PATH").unwrap();

        assert_eq!(path.matches(JULIA_BIN_DIR).count(), 1);
    }

    #[test]
    fn test_depot_recorded_once_across_runs() {
        let mut state = ProvisioningState::new();
        let groups = vec![group(&["JSON"])];

        installer()
            .install_packages(&root(), &groups, &mut state)
            .unwrap();
        installer()
            .install_packages(&root(), &groups, &mut state)
            .unwrap();

        assert_eq!(state.writable_directories, vec![JULIA_PKG_DIR]);
    }

    #[test]
    fn test_invalid_names_rejected() {
        for bad in ["", "1Pkg", ".hidden", "JSON\"])", "a b", "x;rm", "ünicode"] {
            assert!(
                PackageGroup::new([bad]).is_err(),
                "'{}' should be rejected",
                bad
            );
        }
        assert!(PackageGroup::new(["JSON", "HTTP.jl", "_Internal2"]).is_ok());
    }

    #[test]
    fn test_pkg_add_args_quote_join() {
        let args = pkg_add_args(&["A".to_string(), "B".to_string()]).unwrap();
        assert_eq!(args[0], "julia");
        assert_eq!(args[1], "-e");
        assert_eq!(args[2], r#"using Pkg; Pkg.add(["A","B"])"#);
    }

    #[test]
    fn test_relative_depot_rejected_without_touching_state() {
        let mut state = ProvisioningState::new();
        let installer = PackageInstaller {
            depot_dir: "user_packages".into(),
            ..installer()
        };

        let err = installer
            .install_packages(&root(), &[group(&["JSON"])], &mut state)
            .unwrap_err();

        assert!(matches!(err, ProvisionError::ConfigWrite { .. }));
        assert_eq!(state, ProvisioningState::new());
    }
}
