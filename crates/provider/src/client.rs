use anyhow::Result;
use futures::StreamExt;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::assembly::StreamAssembler;
use crate::normalize::normalize_tool_calls;
use crate::types::*;
use crate::{Provider, ProviderError};

/// Outcome of one LM exchange after normalization: assembled text plus
/// tool calls with map-shaped arguments and guaranteed ids. Serializable
/// so callers can response-cache deterministic calls.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LmResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
}

impl LmResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Provider-agnostic client. Wraps a transport with tool-choice
/// enforcement, the two-step degradation path, retry with backoff, and
/// argument-shape normalization. Nothing above this layer sees provider
/// vocabulary.
pub struct LmClient {
    provider: Box<dyn Provider>,
    retry: rev_config::RetrySettings,
}

impl LmClient {
    pub fn new(provider: Box<dyn Provider>, retry: rev_config::RetrySettings) -> Self {
        Self { provider, retry }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn default_model(&self) -> &str {
        self.provider.default_model()
    }

    /// One blocking exchange. Transport errors retry with backoff;
    /// tool-choice rejections walk the degradation path.
    pub async fn chat(&self, request: &ChatRequest) -> Result<LmResponse> {
        let mut attempt = 0u32;
        let response = loop {
            match self.chat_degrading(request).await {
                Ok(response) => break response,
                Err(e) => {
                    if !self.should_retry(&e, attempt) {
                        return Err(e);
                    }
                    attempt += 1;
                    self.backoff(&e, attempt).await;
                }
            }
        };

        Ok(LmResponse {
            text: response.message.content.as_text().to_string(),
            tool_calls: normalize_tool_calls(response.tool_calls),
            usage: response.usage,
        })
    }

    /// Streaming exchange: deltas are forwarded to `on_event` as they
    /// arrive and the assembled result is returned once the stream ends.
    /// A failed stream is retried whole; partial assemblies are dropped.
    pub async fn chat_streaming(
        &self,
        request: &ChatRequest,
        mut on_event: impl FnMut(&StreamEvent),
    ) -> Result<LmResponse> {
        let mut attempt = 0u32;
        loop {
            let result = self.stream_once(request, &mut on_event).await;
            match result {
                Ok(asm) => {
                    let tool_calls = normalize_tool_calls(asm.completed_calls());
                    return Ok(LmResponse {
                        text: asm.text,
                        tool_calls,
                        usage: asm.usage,
                    });
                }
                Err(e) => {
                    if !self.should_retry(&e, attempt) {
                        return Err(e);
                    }
                    attempt += 1;
                    self.backoff(&e, attempt).await;
                }
            }
        }
    }

    async fn stream_once(
        &self,
        request: &ChatRequest,
        on_event: &mut impl FnMut(&StreamEvent),
    ) -> Result<StreamAssembler> {
        let mut stream = self.provider.chat_stream(request).await?;
        let mut asm = StreamAssembler::new();
        while let Some(event) = stream.next().await {
            let event = event?;
            asm.process(&event);
            on_event(&event);
        }
        if let Some(msg) = asm.error.take() {
            return Err(ProviderError::StreamError(msg).into());
        }
        Ok(asm)
    }

    /// The degradation path for providers that reject the tool-choice
    /// parameter: exactly one retry without it, then exactly one retry
    /// without tools at all. Every attempt is logged.
    async fn chat_degrading(&self, request: &ChatRequest) -> Result<ChatResponse> {
        match self.provider.chat(request).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                if !is_invalid_request(&e)
                    || request.tools.is_empty()
                    || request.tool_choice == ToolChoice::None
                {
                    return Err(e);
                }
                tracing::warn!(
                    provider = self.provider.name(),
                    error = %e,
                    "tool-choice rejected; retrying without tool_choice"
                );
                let mut no_choice = request.clone();
                no_choice.tool_choice = ToolChoice::None;
                match self.provider.chat(&no_choice).await {
                    Ok(resp) => Ok(resp),
                    Err(e2) => {
                        if !is_invalid_request(&e2) {
                            return Err(e2);
                        }
                        tracing::warn!(
                            provider = self.provider.name(),
                            error = %e2,
                            "tools rejected; retrying without tools"
                        );
                        let mut bare = no_choice.clone();
                        bare.tools.clear();
                        self.provider.chat(&bare).await
                    }
                }
            }
        }
    }

    fn should_retry(&self, error: &anyhow::Error, attempt: u32) -> bool {
        attempt < self.retry.max_retries
            && error
                .downcast_ref::<ProviderError>()
                .map(|pe| pe.is_retryable())
                .unwrap_or(false)
    }

    async fn backoff(&self, error: &anyhow::Error, attempt: u32) {
        let base = error
            .downcast_ref::<ProviderError>()
            .and_then(|pe| pe.retry_after_ms())
            .unwrap_or_else(|| {
                self.retry
                    .initial_backoff_ms
                    .saturating_mul(2u64.saturating_pow(attempt - 1))
            })
            .min(self.retry.max_backoff_ms);
        let jitter = rand::rng().random_range(0..=base / 4 + 1);
        let wait = base + jitter;
        tracing::debug!(attempt, wait_ms = wait, "retrying LM call");
        tokio::time::sleep(std::time::Duration::from_millis(wait)).await;
    }
}

fn is_invalid_request(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<ProviderError>()
        .map(|pe| pe.is_invalid_request())
        .unwrap_or(false)
}

/// Deterministic key for response caching: provider, model, messages, and
/// tool schemas all participate.
pub fn request_fingerprint(provider: &str, request: &ChatRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    hasher.update(request.model.as_bytes());
    if let Some(system) = &request.system {
        hasher.update(system.as_bytes());
    }
    for msg in &request.messages {
        hasher.update(serde_json::to_vec(msg).unwrap_or_default());
    }
    for tool in &request.tools {
        hasher.update(serde_json::to_vec(tool).unwrap_or_default());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use std::sync::Mutex;

    /// Scripted provider: records the shape of every attempt and replays
    /// a queue of outcomes.
    struct ScriptedProvider {
        attempts: Mutex<Vec<AttemptShape>>,
        script: Mutex<Vec<Result<ChatResponse>>>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum AttemptShape {
        WithChoice,
        NoChoice,
        NoTools,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<ChatResponse>>) -> Self {
            Self {
                attempts: Mutex::new(Vec::new()),
                script: Mutex::new(script),
            }
        }

        fn shapes(&self) -> Vec<AttemptShape> {
            self.attempts.lock().unwrap().clone()
        }
    }

    fn text_response(text: &str) -> ChatResponse {
        ChatResponse {
            message: Message::assistant(text),
            tool_calls: vec![],
            usage: Some(Usage {
                input_tokens: 3,
                output_tokens: 2,
            }),
            finish_reason: Some("stop".into()),
        }
    }

    fn invalid_request() -> anyhow::Error {
        ProviderError::HttpError {
            status: 400,
            body: "tool_choice unsupported".into(),
        }
        .into()
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn tool_choice_style(&self) -> ToolChoiceStyle {
            ToolChoiceStyle::Weak
        }

        fn default_model(&self) -> &str {
            "scripted-model"
        }

        async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
            let shape = if request.tools.is_empty() {
                AttemptShape::NoTools
            } else if request.tool_choice == ToolChoice::None {
                AttemptShape::NoChoice
            } else {
                AttemptShape::WithChoice
            };
            self.attempts.lock().unwrap().push(shape);
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Ok(text_response("default"));
            }
            script.remove(0)
        }

        async fn chat_stream(
            &self,
            _request: &ChatRequest,
        ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
            let events = vec![
                Ok(StreamEvent::ToolCallStart {
                    index: 0,
                    id: None,
                    name: "write_file".into(),
                }),
                Ok(StreamEvent::ToolCallDelta {
                    index: 0,
                    arguments_delta: "{\"a\":".into(),
                }),
                Ok(StreamEvent::ToolCallDelta {
                    index: 0,
                    arguments_delta: "1}".into(),
                }),
                Ok(StreamEvent::Done),
            ];
            Ok(Box::pin(futures::stream::iter(events)))
        }
    }

    fn request_with_tools() -> ChatRequest {
        let mut req = ChatRequest::new("m");
        req.messages.push(Message::user("go"));
        req.tools.push(ToolDefinition {
            name: "write_file".into(),
            description: "w".into(),
            parameters: serde_json::json!({"type": "object"}),
        });
        req
    }

    fn fast_retry() -> rev_config::RetrySettings {
        rev_config::RetrySettings {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn degradation_walks_choice_then_tools_then_fails() {
        let provider = ScriptedProvider::new(vec![
            Err(invalid_request()),
            Err(invalid_request()),
            Ok(text_response("bare")),
        ]);
        let shapes_handle = std::sync::Arc::new(provider);
        // LmClient owns the provider box; keep a second handle for assertions.
        struct Shared(std::sync::Arc<ScriptedProvider>);
        #[async_trait]
        impl Provider for Shared {
            fn name(&self) -> &str {
                self.0.name()
            }
            fn tool_choice_style(&self) -> ToolChoiceStyle {
                self.0.tool_choice_style()
            }
            fn default_model(&self) -> &str {
                self.0.default_model()
            }
            async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
                self.0.chat(request).await
            }
            async fn chat_stream(
                &self,
                request: &ChatRequest,
            ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
                self.0.chat_stream(request).await
            }
        }

        let client = LmClient::new(Box::new(Shared(shapes_handle.clone())), fast_retry());
        let response = client.chat(&request_with_tools()).await.unwrap();
        assert_eq!(response.text, "bare");
        assert_eq!(
            shapes_handle.shapes(),
            vec![
                AttemptShape::WithChoice,
                AttemptShape::NoChoice,
                AttemptShape::NoTools
            ]
        );
    }

    #[tokio::test]
    async fn enforced_path_succeeds_without_degradation() {
        let provider = std::sync::Arc::new(ScriptedProvider::new(vec![Ok(ChatResponse {
            message: Message::assistant(""),
            tool_calls: vec![RawToolCall {
                id: None,
                name: "write_file".into(),
                arguments: "{\"path\":\"a\"}".into(),
            }],
            usage: None,
            finish_reason: Some("tool_calls".into()),
        })]));
        struct Shared(std::sync::Arc<ScriptedProvider>);
        #[async_trait]
        impl Provider for Shared {
            fn name(&self) -> &str {
                self.0.name()
            }
            fn tool_choice_style(&self) -> ToolChoiceStyle {
                self.0.tool_choice_style()
            }
            fn default_model(&self) -> &str {
                self.0.default_model()
            }
            async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
                self.0.chat(request).await
            }
            async fn chat_stream(
                &self,
                request: &ChatRequest,
            ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
                self.0.chat_stream(request).await
            }
        }
        let client = LmClient::new(Box::new(Shared(provider.clone())), fast_retry());
        let response = client.chat(&request_with_tools()).await.unwrap();
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].arguments["path"], "a");
        assert!(response.tool_calls[0].id.starts_with("call_"));
        assert_eq!(provider.shapes(), vec![AttemptShape::WithChoice]);
    }

    #[tokio::test]
    async fn retryable_errors_retry_then_succeed() {
        let provider = ScriptedProvider::new(vec![
            Err(ProviderError::RateLimited { retry_after_ms: 1 }.into()),
            Ok(text_response("after retry")),
        ]);
        let client = LmClient::new(Box::new(provider), fast_retry());
        let response = client.chat(&request_with_tools()).await.unwrap();
        assert_eq!(response.text, "after retry");
    }

    #[tokio::test]
    async fn streaming_assembles_one_call_from_fragments() {
        let provider = ScriptedProvider::new(vec![]);
        let client = LmClient::new(Box::new(provider), fast_retry());
        let mut deltas = 0usize;
        let response = client
            .chat_streaming(&request_with_tools(), |event| {
                if matches!(event, StreamEvent::ToolCallDelta { .. }) {
                    deltas += 1;
                }
            })
            .await
            .unwrap();
        assert_eq!(deltas, 2);
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].arguments, serde_json::json!({"a": 1}));
    }

    #[test]
    fn fingerprint_is_stable_and_input_sensitive() {
        let req = request_with_tools();
        let a = request_fingerprint("p", &req);
        let b = request_fingerprint("p", &req);
        assert_eq!(a, b);
        let mut req2 = req.clone();
        req2.messages.push(Message::user("more"));
        assert_ne!(a, request_fingerprint("p", &req2));
        assert_ne!(a, request_fingerprint("other", &req));
    }
}
