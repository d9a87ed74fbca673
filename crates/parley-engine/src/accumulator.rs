//! Reassembles streamed tool-call fragments into complete invocations.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use parley_core::stream::ToolCallDelta;
use parley_core::tools::ToolInvocation;

/// Per-id state of one streamed tool call.
#[derive(Clone, Debug, PartialEq)]
pub enum CallState {
    Accumulating {
        kind: String,
        name: String,
        partial_args: String,
    },
    /// Arguments parsed and the call was handed out. Later fragments are ignored.
    Complete,
}

/// One accumulator lives for exactly one streamed round.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    entries: HashMap<String, CallState>,
    /// Providers that only send the id on the first fragment key later ones by index.
    index_ids: HashMap<u32, String>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment. Returns the invocation the first time its arguments parse.
    pub fn push(&mut self, delta: &ToolCallDelta) -> Option<ToolInvocation> {
        let id = self.resolve_id(delta);
        let entry = self
            .entries
            .entry(id.clone())
            .or_insert_with(|| CallState::Accumulating {
                kind: "function".into(),
                name: String::new(),
                partial_args: String::new(),
            });

        let CallState::Accumulating {
            kind,
            name,
            partial_args,
        } = entry
        else {
            debug!(tool_call_id = %id, "fragment for completed call ignored");
            return None;
        };

        if let Some(k) = delta.kind.as_deref().filter(|k| !k.is_empty()) {
            *kind = k.to_string();
        }
        if let Some(n) = delta.name.as_deref().filter(|n| !n.is_empty()) {
            name.push_str(n);
        }
        if let Some(args) = &delta.arguments {
            partial_args.push_str(args);
        }

        // Empty text is not a call yet; incomplete JSON waits for the next fragment.
        if partial_args.trim().is_empty() {
            return None;
        }
        let arguments: Value = serde_json::from_str(partial_args.as_str()).ok()?;

        let invocation = ToolInvocation {
            id: id.clone(),
            kind: std::mem::take(kind),
            name: std::mem::take(name),
            arguments,
        };
        *entry = CallState::Complete;
        Some(invocation)
    }

    /// Ids whose arguments never became valid JSON.
    pub fn pending(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .entries
            .iter()
            .filter(|(_, state)| matches!(state, CallState::Accumulating { .. }))
            .map(|(id, _)| id.as_str())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn state(&self, id: &str) -> Option<&CallState> {
        self.entries.get(id)
    }

    fn resolve_id(&mut self, delta: &ToolCallDelta) -> String {
        match delta.id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => {
                self.index_ids.insert(delta.index, id.to_string());
                id.to_string()
            }
            None => self
                .index_ids
                .get(&delta.index)
                .cloned()
                .unwrap_or_else(|| format!("index_{}", delta.index)),
        }
    }
}
