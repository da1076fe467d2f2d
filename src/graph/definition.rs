//! Serialized form of a [`GraphState`] handed to the graph executor.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

use super::{GraphState, Op, Source};

/// Flattened view of a state: base, final environment, ordered history.
///
/// Copy operations embed the definition of the state they copy from.
#[derive(Debug, Serialize)]
pub struct Definition<'a> {
    pub source: &'a Source,
    pub env: &'a BTreeMap<String, String>,
    pub ops: Vec<&'a Op>,
}

impl GraphState {
    pub fn definition(&self) -> Definition<'_> {
        Definition {
            source: self.source(),
            env: self.envs(),
            ops: self.ops(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.definition())
    }
}

impl Serialize for GraphState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.definition().serialize(serializer)
    }
}
