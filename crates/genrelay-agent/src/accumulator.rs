//! Reassembly of tool calls split across stream chunks.

use crate::stream::ToolCallFragment;
use genrelay_core::{GenrelayError, GenrelayResult, ToolCall};
use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct PartialCall {
    name: Option<String>,
    arguments: String,
}

/// Per-stream buffer of in-progress tool calls, keyed by index.
///
/// Fragments for different indices may interleave freely. Argument chunks
/// are appended verbatim in arrival order and parsed only at finalize time;
/// a chunk is never merged, trimmed or deduplicated.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u32, PartialCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment. Returns `true` the first time its index is seen.
    pub fn accept(&mut self, fragment: ToolCallFragment) -> bool {
        let mut first_seen = false;
        let call = self.calls.entry(fragment.index).or_insert_with(|| {
            first_seen = true;
            PartialCall::default()
        });

        if let Some(name) = fragment.name.filter(|n| !n.is_empty()) {
            call.name = Some(name);
        }
        if let Some(chunk) = fragment.arguments_chunk {
            call.arguments.push_str(&chunk);
        }

        first_seen
    }

    /// Parse the buffered arguments for `index` into a [`ToolCall`].
    ///
    /// An empty buffer stands for a call with no arguments and yields `{}`.
    pub fn finalize(&self, index: u32) -> GenrelayResult<ToolCall> {
        let call = self
            .calls
            .get(&index)
            .ok_or_else(|| GenrelayError::ToolArgumentParse {
                index,
                message: "no fragments received for this index".into(),
            })?;

        let name = call
            .name
            .clone()
            .ok_or_else(|| GenrelayError::ToolArgumentParse {
                index,
                message: "tool call never received a name".into(),
            })?;

        let arguments = if call.arguments.trim().is_empty() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(&call.arguments).map_err(|e| {
                GenrelayError::ToolArgumentParse {
                    index,
                    message: e.to_string(),
                }
            })?
        };

        Ok(ToolCall {
            index,
            name,
            arguments_json: call.arguments.clone(),
            arguments,
        })
    }

    /// Finalize every call in ascending index order, stopping at the first
    /// malformed one.
    pub fn finalize_all(&self) -> GenrelayResult<Vec<ToolCall>> {
        self.calls.keys().map(|&index| self.finalize(index)).collect()
    }

    pub fn indices(&self) -> Vec<u32> {
        self.calls.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
