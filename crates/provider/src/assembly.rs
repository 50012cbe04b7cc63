use std::collections::BTreeMap;

use crate::types::{RawToolCall, StreamEvent, Usage};

/// Accumulates streaming deltas into a final message plus tool calls.
///
/// Tool-call argument fragments are concatenated **per call index**, never
/// appended as separate calls. A call is complete once its `ToolCallDone`
/// arrives or the stream itself finishes.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    pub text: String,
    calls: BTreeMap<u32, PartialCall>,
    pub usage: Option<Usage>,
    pub done: bool,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
    closed: bool,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextDelta(text) => {
                self.text.push_str(text);
            }
            StreamEvent::ToolCallStart { index, id, name } => {
                let call = self.calls.entry(*index).or_default();
                if call.id.is_none() {
                    call.id = id.clone();
                }
                if call.name.is_empty() {
                    call.name = name.clone();
                }
            }
            StreamEvent::ToolCallDelta {
                index,
                arguments_delta,
            } => {
                let call = self.calls.entry(*index).or_default();
                call.arguments.push_str(arguments_delta);
            }
            StreamEvent::ToolCallDone { index } => {
                if let Some(call) = self.calls.get_mut(index) {
                    call.closed = true;
                }
            }
            StreamEvent::Usage(usage) => {
                self.usage = Some(usage.clone());
            }
            StreamEvent::Done => {
                self.done = true;
                for call in self.calls.values_mut() {
                    call.closed = true;
                }
            }
            StreamEvent::Error(e) => {
                self.error = Some(e.clone());
            }
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.calls.is_empty()
    }

    /// Calls ready for dispatch, in index order. Open calls (no end-of-call
    /// signal yet) are withheld.
    pub fn completed_calls(&self) -> Vec<RawToolCall> {
        self.calls
            .values()
            .filter(|c| c.closed && !c.name.is_empty())
            .map(|c| RawToolCall {
                id: c.id.clone(),
                name: c.name.clone(),
                arguments: c.arguments.clone(),
            })
            .collect()
    }
}
