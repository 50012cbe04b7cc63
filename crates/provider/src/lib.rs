pub mod types;

pub mod assembly;
pub mod client;
pub mod normalize;
pub mod openai_compat;
pub mod select;

mod error;

pub use client::{request_fingerprint, LmClient, LmResponse};
pub use error::ProviderError;
pub use types::*;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// A chat transport. Implementations translate the canonical request and
/// stream shapes to whatever the wire actually speaks; nothing above this
/// trait sees provider vocabulary.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// How this provider's tool-choice parameter behaves; drives the
    /// enforcement mapping in the transport and the degradation path in
    /// the client.
    fn tool_choice_style(&self) -> types::ToolChoiceStyle;

    fn default_model(&self) -> &str;

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;
}
