//! Runtime provisioning as an immutable container build graph.
//!
//! This crate describes, without executing anything, how to turn a base
//! image into one with a Julia runtime, a local package mirror, and a set of
//! user-requested packages. The result is a [`GraphState`] for an external
//! graph executor plus a [`ProvisioningState`] for the image finalizer.
//!
//! # Architecture
//!
//! ```text
//! Provisioner (pipeline)
//!     │
//!     ├── RuntimeInstaller   fetch → verify → copy → unpack → PATH
//!     ├── configure_mirror   git → tooling → scripts → registry → server
//!     └── PackageInstaller   depot → env → registry add → Pkg.add per group
//!
//! GraphState ──► executor (JSON definition)
//! ProvisioningState ──► image finalizer (env exports, writable dirs)
//! ```
//!
//! # Example
//!
//! ```rust
//! use runtime_builder::{GraphState, PackageGroup, Provisioner, ProvisioningState};
//!
//! let groups = vec![PackageGroup::new(["JSON", "HTTP"])?];
//! let mut state = ProvisioningState::new();
//!
//! let graph = Provisioner::julia().provision(
//!     &GraphState::image("docker.io/library/ubuntu:22.04"),
//!     &groups,
//!     &mut state,
//! )?;
//!
//! assert_eq!(graph.env("JULIA_PKG_SERVER"), Some("http://127.0.0.1:9999"));
//! assert_eq!(state.writable_directories.len(), 2);
//! # Ok::<(), runtime_builder::ProvisionError>(())
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod mirror;
pub mod packages;
pub mod pipeline;
pub mod runtime;
pub mod state;

pub use error::ProvisionError;
pub use graph::{GraphState, Op};
pub use mirror::{MirrorConfig, MirrorLifetime, MirrorPolicy};
pub use packages::{PackageGroup, PackageInstaller};
pub use pipeline::{Plan, Provisioner};
pub use runtime::{RuntimeDistribution, RuntimeInstaller};
pub use state::ProvisioningState;
