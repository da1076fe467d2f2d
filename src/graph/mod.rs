//! Immutable build-graph state.
//!
//! A [`GraphState`] describes WHAT an external graph executor must do to
//! materialize an image, not HOW. Every transformation returns a new state
//! that shares its history with the input, so earlier states stay valid and
//! can be threaded into other subgraphs (for example as the source of a
//! [`Op::Copy`]).
//!
//! # Example
//!
//! ```rust
//! use runtime_builder::graph::{shell, GraphState};
//!
//! let base = GraphState::image("docker.io/library/ubuntu:22.04");
//! let next = base
//!     .mkdir_all("/opt/tool", 0o755, "create tool dir")
//!     .run(shell("echo ready > /opt/tool/state"), "mark ready")
//!     .add_env("TOOL_HOME", "/opt/tool");
//!
//! assert_eq!(base.len(), 0);
//! assert_eq!(next.len(), 3);
//! assert_eq!(next.env("TOOL_HOME"), Some("/opt/tool"));
//! ```

pub mod definition;

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub use definition::Definition;

/// PATH every image-based state starts with.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Where the root filesystem of a state comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reference", rename_all = "snake_case")]
pub enum Source {
    /// Empty filesystem.
    Scratch,
    /// Container image reference.
    Image(String),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Scratch => write!(f, "scratch"),
            Source::Image(reference) => write!(f, "{}", reference),
        }
    }
}

/// Operations recorded in a state's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    // ─────────────────────────────────────────────────────────────────────
    // Process operations
    // ─────────────────────────────────────────────────────────────────────
    /// Run a command (argv form) with the state's environment.
    Run { args: Vec<String>, name: String },

    // ─────────────────────────────────────────────────────────────────────
    // File operations
    // ─────────────────────────────────────────────────────────────────────
    /// Copy `src` out of another state's filesystem to `dest`.
    Copy {
        from: GraphState,
        src: String,
        dest: String,
        name: String,
    },

    /// Create a directory with the given mode.
    Mkdir {
        path: String,
        mode: u32,
        parents: bool,
        name: String,
    },

    /// Write a file verbatim with the given mode.
    WriteFile {
        path: String,
        content: String,
        mode: u32,
        name: String,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Environment
    // ─────────────────────────────────────────────────────────────────────
    /// Set an environment variable for all later operations.
    Env { key: String, value: String },
}

impl Op {
    /// Argv of a run operation, `None` for everything else.
    pub fn as_run(&self) -> Option<&[String]> {
        match self {
            Op::Run { args, .. } => Some(args),
            _ => None,
        }
    }

    /// Human readable progress name. Env operations have none.
    pub fn name(&self) -> Option<&str> {
        match self {
            Op::Run { name, .. }
            | Op::Copy { name, .. }
            | Op::Mkdir { name, .. }
            | Op::WriteFile { name, .. } => Some(name),
            Op::Env { .. } => None,
        }
    }
}

/// One history entry. Traversals over `prev` are loops, never recursion,
/// so history length is not bounded by the stack.
struct Layer {
    op: Op,
    prev: Option<Arc<Layer>>,
    depth: usize,
}

impl Drop for Layer {
    fn drop(&mut self) {
        // Unlink uniquely owned ancestors one at a time; stop at the first
        // one another state still shares.
        let mut prev = self.prev.take();
        while let Some(layer) = prev {
            match Arc::try_unwrap(layer) {
                Ok(mut owned) => prev = owned.prev.take(),
                Err(_) => break,
            }
        }
    }
}

/// Persistent build-graph value.
///
/// Cloning is cheap: history and environment are reference counted and
/// never mutated in place.
#[derive(Clone)]
pub struct GraphState {
    source: Source,
    env: Arc<BTreeMap<String, String>>,
    head: Option<Arc<Layer>>,
}

impl PartialEq for GraphState {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        self.source == other.source
            && self.len() == other.len()
            && self.env == other.env
            && self.ops() == other.ops()
    }
}

impl Eq for GraphState {}

impl fmt::Debug for GraphState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphState")
            .field("source", &self.source)
            .field("env", &self.env)
            .field("ops", &self.ops())
            .finish()
    }
}

impl GraphState {
    /// Empty filesystem with an empty environment.
    pub fn scratch() -> Self {
        Self {
            source: Source::Scratch,
            env: Arc::new(BTreeMap::new()),
            head: None,
        }
    }

    /// State rooted at a container image, starting with [`DEFAULT_PATH`].
    pub fn image(reference: impl Into<String>) -> Self {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), DEFAULT_PATH.to_string());
        Self {
            source: Source::Image(reference.into()),
            env: Arc::new(env),
            head: None,
        }
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Number of operations in the history.
    pub fn len(&self) -> usize {
        self.head.as_ref().map(|layer| layer.depth).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// True when both values are the very same state, not just equal ones.
    pub fn ptr_eq(&self, other: &GraphState) -> bool {
        let same_head = match (&self.head, &other.head) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_head && Arc::ptr_eq(&self.env, &other.env) && self.source == other.source
    }

    fn push(&self, op: Op) -> Self {
        let depth = self.len() + 1;
        Self {
            source: self.source.clone(),
            env: Arc::clone(&self.env),
            head: Some(Arc::new(Layer {
                op,
                prev: self.head.clone(),
                depth,
            })),
        }
    }

    /// Run a command.
    pub fn run(&self, args: Vec<String>, name: impl Into<String>) -> Self {
        self.push(Op::Run {
            args,
            name: name.into(),
        })
    }

    /// Copy a path out of `from` into this state.
    pub fn copy(
        &self,
        from: &GraphState,
        src: impl Into<String>,
        dest: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        self.push(Op::Copy {
            from: from.clone(),
            src: src.into(),
            dest: dest.into(),
            name: name.into(),
        })
    }

    /// Create a directory and any missing parents.
    pub fn mkdir_all(&self, path: impl Into<String>, mode: u32, name: impl Into<String>) -> Self {
        self.push(Op::Mkdir {
            path: path.into(),
            mode,
            parents: true,
            name: name.into(),
        })
    }

    /// Write a file.
    pub fn write_file(
        &self,
        path: impl Into<String>,
        content: impl Into<String>,
        mode: u32,
        name: impl Into<String>,
    ) -> Self {
        self.push(Op::WriteFile {
            path: path.into(),
            content: content.into(),
            mode,
            name: name.into(),
        })
    }

    /// Set an environment variable for every later operation.
    pub fn add_env(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        let mut env = (*self.env).clone();
        env.insert(key.clone(), value.clone());

        let mut next = self.push(Op::Env { key, value });
        next.env = Arc::new(env);
        next
    }

    /// Append `dir` to PATH unless it is already one of its entries.
    pub fn with_path_entry(&self, dir: &str) -> Self {
        let current = self.env("PATH").unwrap_or("");
        if current.split(':').any(|entry| entry == dir) {
            return self.clone();
        }
        let path = if current.is_empty() {
            dir.to_string()
        } else {
            format!("{}:{}", current, dir)
        };
        self.add_env("PATH", path)
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn envs(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// History from the first operation to the last.
    pub fn ops(&self) -> Vec<&Op> {
        let mut ops = Vec::with_capacity(self.len());
        let mut cursor = self.head.as_deref();
        while let Some(layer) = cursor {
            ops.push(&layer.op);
            cursor = layer.prev.as_deref();
        }
        ops.reverse();
        ops
    }

    /// Command lines of every run operation, in order.
    pub fn commands(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(Op::as_run)
            .map(|args| args.join(" "))
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helper functions for readable command construction
// ─────────────────────────────────────────────────────────────────────────────

/// Argv for running a script through `/bin/sh -c`.
pub fn shell(script: impl Into<String>) -> Vec<String> {
    vec!["/bin/sh".into(), "-c".into(), script.into()]
}

/// Argv from string slices.
pub fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}
