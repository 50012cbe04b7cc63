use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn as_text(&self) -> &str {
        match self {
            MessageContent::Text(s) => s,
            MessageContent::Parts(parts) => parts
                .iter()
                .find_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .unwrap_or(""),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult { tool_use_id: String, content: String },
}

/// Canonical tool declaration, presented to providers in the OpenAI-style
/// `{type:"function", function:{name, description, parameters}}` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// How hard a provider can be pushed into calling a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceStyle {
    /// Supports a "required" mode that forbids text-only replies.
    Strict,
    /// Auto mode plus a function-calling config equivalent to "ANY".
    AutoMustCall,
    /// Only an "auto" equivalent; degradation path applies on 400s.
    Weak,
}

impl ToolChoiceStyle {
    pub fn from_class(class: &str) -> Self {
        match class {
            "strict" => ToolChoiceStyle::Strict,
            "any" => ToolChoiceStyle::AutoMustCall,
            _ => ToolChoiceStyle::Weak,
        }
    }
}

/// Requested tool-choice behavior for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolChoice {
    /// Enforce per the provider's style; never accept a text-only reply.
    #[default]
    Enforced,
    /// Provider decides.
    Auto,
    /// Tools offered for context only.
    None,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub system: Option<String>,
    pub stream: bool,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            tools: Vec::new(),
            tool_choice: ToolChoice::default(),
            max_tokens: None,
            temperature: None,
            system: None,
            stream: false,
        }
    }
}

/// A tool call as the provider returned it. Arguments are the raw JSON
/// string; ids may be absent on providers that do not assign them.
#[derive(Debug, Clone, PartialEq)]
pub struct RawToolCall {
    pub id: Option<String>,
    pub name: String,
    pub arguments: String,
}

/// A tool call after argument-shape normalization: arguments are a map,
/// the id is always present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub message: Message,
    pub tool_calls: Vec<RawToolCall>,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens as u64 + self.output_tokens as u64
    }
}

/// Streaming deltas. Tool-call fragments carry the call's position index;
/// assembly concatenates fragments per index.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta(String),
    ToolCallStart {
        index: u32,
        id: Option<String>,
        name: String,
    },
    ToolCallDelta {
        index: u32,
        arguments_delta: String,
    },
    ToolCallDone {
        index: u32,
    },
    Usage(Usage),
    Done,
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_content_as_text_prefers_text_part() {
        let content = MessageContent::Parts(vec![
            ContentPart::ToolResult {
                tool_use_id: "t1".into(),
                content: "ignored".into(),
            },
            ContentPart::Text {
                text: "hello".into(),
            },
        ]);
        assert_eq!(content.as_text(), "hello");
    }

    #[test]
    fn tool_choice_style_from_class() {
        assert_eq!(ToolChoiceStyle::from_class("strict"), ToolChoiceStyle::Strict);
        assert_eq!(
            ToolChoiceStyle::from_class("any"),
            ToolChoiceStyle::AutoMustCall
        );
        assert_eq!(ToolChoiceStyle::from_class("weak"), ToolChoiceStyle::Weak);
        assert_eq!(
            ToolChoiceStyle::from_class("something-else"),
            ToolChoiceStyle::Weak
        );
    }

    #[test]
    fn message_serde_round_trip() {
        let msg = Message {
            role: Role::Assistant,
            content: MessageContent::Parts(vec![ContentPart::ToolUse {
                id: "call_1".into(),
                name: "read_file".into(),
                input: serde_json::json!({"path": "src/lib.rs"}),
            }]),
        };
        let text = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(back.role, Role::Assistant);
        match back.content {
            MessageContent::Parts(parts) => assert_eq!(parts.len(), 1),
            MessageContent::Text(_) => panic!("expected parts"),
        }
    }
}
