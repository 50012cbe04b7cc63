use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde_json::json;

use crate::types::*;
use crate::{Provider, ProviderError};

/// The one concrete transport: an OpenAI-compatible chat-completions
/// endpoint. Serves the local-provider default (ollama) and every cloud
/// entry in the provider table, all of which speak this wire format at
/// their base URL. Wire vocabulary stays inside this module.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    style: ToolChoiceStyle,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
        style: ToolChoiceStyle,
        timeout_secs: u64,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(timeout_secs))
                .build()
                .unwrap_or_default(),
            name: name.into(),
            base_url: base_url.into(),
            api_key,
            default_model: default_model.into(),
            style,
        }
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.post(url);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        req
    }

    fn build_messages(&self, request: &ChatRequest) -> Vec<serde_json::Value> {
        let mut msgs = Vec::new();
        if let Some(system) = &request.system {
            msgs.push(json!({"role": "system", "content": system}));
        }
        for msg in &request.messages {
            match &msg.content {
                MessageContent::Text(text) => {
                    msgs.push(json!({"role": role_str(&msg.role), "content": text}));
                }
                MessageContent::Parts(parts) => {
                    // Tool-use parts become an assistant message with
                    // tool_calls; tool-result parts become tool messages.
                    let mut tool_calls = Vec::new();
                    let mut text_chunks = Vec::new();
                    for part in parts {
                        match part {
                            ContentPart::Text { text } => text_chunks.push(text.clone()),
                            ContentPart::ToolUse { id, name, input } => tool_calls.push(json!({
                                "id": id,
                                "type": "function",
                                "function": {"name": name, "arguments": input.to_string()},
                            })),
                            ContentPart::ToolResult {
                                tool_use_id,
                                content,
                            } => msgs.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_use_id,
                                "content": content,
                            })),
                        }
                    }
                    if !tool_calls.is_empty() {
                        let mut m = json!({
                            "role": "assistant",
                            "tool_calls": tool_calls,
                        });
                        if !text_chunks.is_empty() {
                            m["content"] = json!(text_chunks.join("\n"));
                        }
                        msgs.push(m);
                    } else if !text_chunks.is_empty() {
                        msgs.push(json!({
                            "role": role_str(&msg.role),
                            "content": text_chunks.join("\n"),
                        }));
                    }
                }
            }
        }
        msgs
    }

    fn build_tools(&self, tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect()
    }

    fn build_body(&self, model: &str, request: &ChatRequest) -> serde_json::Value {
        let mut body = json!({
            "model": model,
            "messages": self.build_messages(request),
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(self.build_tools(&request.tools));
            match request.tool_choice {
                ToolChoice::Enforced => match self.style {
                    ToolChoiceStyle::Strict => {
                        body["tool_choice"] = json!("required");
                    }
                    ToolChoiceStyle::AutoMustCall => {
                        body["tool_choice"] = json!("auto");
                        body["function_calling_config"] = json!({"mode": "ANY"});
                    }
                    ToolChoiceStyle::Weak => {
                        body["tool_choice"] = json!("auto");
                    }
                },
                ToolChoice::Auto => {
                    body["tool_choice"] = json!("auto");
                }
                ToolChoice::None => {}
            }
        }
        body
    }
}

fn role_str(role: &Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Incremental decoder for the chat-completions event stream. Frames are
/// blank-line separated; only `data:` lines carry payload on this wire,
/// and `[DONE]` marks the end of payloads. Chunks may split a frame at
/// any byte.
#[derive(Debug, Default)]
struct FrameBuf {
    buffer: String,
}

impl FrameBuf {
    fn extend(&mut self, chunk: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
    }

    /// Next complete data payload, if one is fully buffered. Keep-alive
    /// comments and frames without data lines are skipped.
    fn next_data(&mut self) -> Option<String> {
        while let Some(pos) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..pos + 2).collect();
            let mut data_lines = Vec::new();
            for line in frame.lines() {
                if let Some(rest) = line.strip_prefix("data:") {
                    data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
                }
            }
            if data_lines.is_empty() {
                continue;
            }
            let data = data_lines.join("\n");
            if data == "[DONE]" {
                continue;
            }
            return Some(data);
        }
        None
    }
}

/// One data payload to one canonical stream event. Usage frames and the
/// finish marker take precedence; tool-call fragments keep the wire's
/// position index so assembly can concatenate per call.
fn parse_delta(data: &str) -> Result<StreamEvent> {
    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| ProviderError::DeserializationError(e.to_string()))?;

    if let Some(usage) = value.get("usage").filter(|u| u.is_object()) {
        return Ok(StreamEvent::Usage(Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        }));
    }

    if value["choices"][0]["finish_reason"].is_string() {
        return Ok(StreamEvent::Done);
    }

    let delta = &value["choices"][0]["delta"];

    if let Some(content) = delta["content"].as_str() {
        return Ok(StreamEvent::TextDelta(content.to_string()));
    }

    if let Some(tool_calls) = delta["tool_calls"].as_array() {
        for tc in tool_calls {
            let index = tc["index"].as_u64().unwrap_or(0) as u32;
            if let Some(function) = tc.get("function") {
                if let Some(name) = function["name"].as_str() {
                    return Ok(StreamEvent::ToolCallStart {
                        index,
                        id: tc["id"].as_str().map(String::from),
                        name: name.to_string(),
                    });
                }
                if let Some(args) = function["arguments"].as_str() {
                    return Ok(StreamEvent::ToolCallDelta {
                        index,
                        arguments_delta: args.to_string(),
                    });
                }
            }
        }
    }

    Ok(StreamEvent::TextDelta(String::new()))
}

fn parse_raw_tool_calls(value: &serde_json::Value) -> Vec<RawToolCall> {
    value
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .map(|tc| RawToolCall {
                    id: tc["id"].as_str().map(String::from),
                    name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                    arguments: tc["function"]["arguments"]
                        .as_str()
                        .unwrap_or("{}")
                        .to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn tool_choice_style(&self) -> ToolChoiceStyle {
        self.style
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let model = if request.model.is_empty() {
            &self.default_model
        } else {
            &request.model
        };
        let body = self.build_body(model, request);

        let url = format!("{}/chat/completions", self.base_url);
        let resp = self.request(&url).json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                anyhow::Error::from(ProviderError::Timeout(0))
            } else {
                anyhow::Error::from(e)
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let body = resp.text().await.unwrap_or_default();
            return Err(
                ProviderError::from_http(status.as_u16(), body, retry_after.as_deref()).into(),
            );
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::DeserializationError(e.to_string()))?;
        let choice = &data["choices"][0];
        let content = choice["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        let tool_calls = parse_raw_tool_calls(&choice["message"]["tool_calls"]);

        Ok(ChatResponse {
            message: Message {
                role: Role::Assistant,
                content: MessageContent::Text(content),
            },
            tool_calls,
            usage: data.get("usage").filter(|u| u.is_object()).map(|u| Usage {
                input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
            }),
            finish_reason: choice["finish_reason"].as_str().map(String::from),
        })
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let model = if request.model.is_empty() {
            &self.default_model
        } else {
            &request.model
        };
        let mut body = self.build_body(model, request);
        body["stream"] = json!(true);
        body["stream_options"] = json!({"include_usage": true});

        let url = format!("{}/chat/completions", self.base_url);
        let resp = self.request(&url).json(&body).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let body = resp.text().await.unwrap_or_default();
            return Err(
                ProviderError::from_http(status.as_u16(), body, retry_after.as_deref()).into(),
            );
        }

        let byte_stream = resp.bytes_stream();
        let events = futures::stream::unfold(
            (byte_stream, FrameBuf::default()),
            |(mut bytes, mut frames)| async move {
                loop {
                    if let Some(data) = frames.next_data() {
                        return Some((parse_delta(&data), (bytes, frames)));
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => frames.extend(&chunk),
                        Some(Err(e)) => {
                            return Some((
                                Err(ProviderError::StreamError(e.to_string()).into()),
                                (bytes, frames),
                            ))
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(Box::pin(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(style: ToolChoiceStyle) -> OpenAiCompatProvider {
        OpenAiCompatProvider::new(
            "test",
            "http://localhost:0/v1",
            None,
            "test-model",
            style,
            30,
        )
    }

    fn request_with_tool(choice: ToolChoice) -> ChatRequest {
        let mut req = ChatRequest::new("test-model");
        req.tools.push(ToolDefinition {
            name: "read_file".into(),
            description: "read".into(),
            parameters: json!({"type": "object", "properties": {}}),
        });
        req.tool_choice = choice;
        req.messages.push(Message::user("hi"));
        req
    }

    #[test]
    fn strict_style_sets_required() {
        let body = provider(ToolChoiceStyle::Strict)
            .build_body("m", &request_with_tool(ToolChoice::Enforced));
        assert_eq!(body["tool_choice"], "required");
        assert!(body.get("function_calling_config").is_none());
    }

    #[test]
    fn any_style_sets_auto_plus_any_mode() {
        let body = provider(ToolChoiceStyle::AutoMustCall)
            .build_body("m", &request_with_tool(ToolChoice::Enforced));
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["function_calling_config"]["mode"], "ANY");
    }

    #[test]
    fn weak_style_sets_plain_auto() {
        let body = provider(ToolChoiceStyle::Weak)
            .build_body("m", &request_with_tool(ToolChoice::Enforced));
        assert_eq!(body["tool_choice"], "auto");
        assert!(body.get("function_calling_config").is_none());
    }

    #[test]
    fn tool_choice_none_omits_the_field() {
        let body =
            provider(ToolChoiceStyle::Strict).build_body("m", &request_with_tool(ToolChoice::None));
        assert!(body.get("tool_choice").is_none());
        assert!(body.get("tools").is_some());
    }

    #[test]
    fn no_tools_means_no_choice_field() {
        let mut req = ChatRequest::new("m");
        req.messages.push(Message::user("hi"));
        let body = provider(ToolChoiceStyle::Strict).build_body("m", &req);
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn tool_results_become_tool_messages() {
        let mut req = ChatRequest::new("m");
        req.messages.push(Message {
            role: Role::Assistant,
            content: MessageContent::Parts(vec![ContentPart::ToolUse {
                id: "c1".into(),
                name: "read_file".into(),
                input: json!({"path": "a"}),
            }]),
        });
        req.messages.push(Message {
            role: Role::User,
            content: MessageContent::Parts(vec![ContentPart::ToolResult {
                tool_use_id: "c1".into(),
                content: "contents".into(),
            }]),
        });
        let body = provider(ToolChoiceStyle::Strict).build_body("m", &req);
        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs[0]["role"], "assistant");
        assert_eq!(msgs[0]["tool_calls"][0]["function"]["name"], "read_file");
        assert_eq!(msgs[1]["role"], "tool");
        assert_eq!(msgs[1]["tool_call_id"], "c1");
    }

    #[test]
    fn raw_tool_calls_parse_from_response_shape() {
        let value = json!([
            {"id": "c9", "function": {"name": "edit_file", "arguments": "{\"path\":\"x\"}"}}
        ]);
        let calls = parse_raw_tool_calls(&value);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id.as_deref(), Some("c9"));
        assert_eq!(calls[0].arguments, "{\"path\":\"x\"}");
    }

    #[test]
    fn frame_buf_reassembles_frames_split_across_chunks() {
        let mut frames = FrameBuf::default();
        frames.extend(b"data: {\"a\":");
        assert!(frames.next_data().is_none());
        frames.extend(b"1}\n\ndata: [DONE]\n\n");
        assert_eq!(frames.next_data().as_deref(), Some("{\"a\":1}"));
        // the terminator is swallowed, not surfaced
        assert!(frames.next_data().is_none());
    }

    #[test]
    fn frame_buf_skips_keepalives_and_joins_data_lines() {
        let mut frames = FrameBuf::default();
        frames.extend(b": ping\n\ndata: line1\ndata: line2\n\n");
        assert_eq!(frames.next_data().as_deref(), Some("line1\nline2"));
        assert!(frames.next_data().is_none());
    }

    #[test]
    fn parse_delta_maps_tool_call_fragments_with_index() {
        let start = parse_delta(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":2,"id":"c1","function":{"name":"read_file"}}]}}]}"#,
        )
        .unwrap();
        match start {
            StreamEvent::ToolCallStart { index, id, name } => {
                assert_eq!(index, 2);
                assert_eq!(id.as_deref(), Some("c1"));
                assert_eq!(name, "read_file");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let delta = parse_delta(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":2,"function":{"arguments":"{\"pa"}}]}}]}"#,
        )
        .unwrap();
        match delta {
            StreamEvent::ToolCallDelta {
                index,
                arguments_delta,
            } => {
                assert_eq!(index, 2);
                assert_eq!(arguments_delta, "{\"pa");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parse_delta_finish_and_usage_frames() {
        let done = parse_delta(r#"{"choices":[{"finish_reason":"tool_calls","delta":{}}]}"#).unwrap();
        assert!(matches!(done, StreamEvent::Done));

        let usage =
            parse_delta(r#"{"usage":{"prompt_tokens":11,"completion_tokens":7},"choices":[]}"#)
                .unwrap();
        match usage {
            StreamEvent::Usage(u) => assert_eq!(u.total(), 18),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parse_delta_rejects_malformed_payloads() {
        assert!(parse_delta("not json").is_err());
    }
}
