//! Capability contracts
//!
//! Every API surface a backend can serve is its own trait. Adapters
//! implement the subset they support and advertise it through
//! [`crate::backend::Backend`]; asking for anything else yields
//! [`crate::BackendError::UnsupportedOperation`].

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::server::ByteSink;

/// API surface kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Completion,
    Embeddings,
    Reranking,
    Image,
    TextToSpeech,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Completion,
        Capability::Embeddings,
        Capability::Reranking,
        Capability::Image,
        Capability::TextToSpeech,
    ];

    const fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// Set of capabilities implemented by one adapter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn with(self, capability: Capability) -> Self {
        Self(self.0 | capability.bit())
    }

    pub const fn contains(&self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.contains(*c))
    }
}

impl Serialize for CapabilitySet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

/// Individual operations, as routed by the API layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ChatCompletion,
    Completion,
    Responses,
    Embeddings,
    Reranking,
    ImageGenerations,
    ImageEdits,
    ImageVariations,
    AudioSpeech,
}

impl Operation {
    pub fn capability(self) -> Capability {
        match self {
            Self::ChatCompletion | Self::Completion | Self::Responses => Capability::Completion,
            Self::Embeddings => Capability::Embeddings,
            Self::Reranking => Capability::Reranking,
            Self::ImageGenerations | Self::ImageEdits | Self::ImageVariations => Capability::Image,
            Self::AudioSpeech => Capability::TextToSpeech,
        }
    }

    /// Human-readable name used in unsupported-operation errors
    pub fn display_name(self) -> &'static str {
        match self {
            Self::ChatCompletion => "Chat completion",
            Self::Completion => "Text completion",
            Self::Responses => "Responses",
            Self::Embeddings => "Embeddings",
            Self::Reranking => "Reranking",
            Self::ImageGenerations => "Image generation",
            Self::ImageEdits => "Image editing",
            Self::ImageVariations => "Image variations",
            Self::AudioSpeech => "Text to speech",
        }
    }

    /// OpenAI-compatible path on the wrapped server
    pub fn endpoint(self) -> &'static str {
        match self {
            Self::ChatCompletion => "/v1/chat/completions",
            Self::Completion => "/v1/completions",
            Self::Responses => "/v1/responses",
            Self::Embeddings => "/v1/embeddings",
            Self::Reranking => "/v1/rerank",
            Self::ImageGenerations => "/v1/images/generations",
            Self::ImageEdits | Self::ImageVariations => "/v1/images/edits",
            Self::AudioSpeech => "/v1/audio/speech",
        }
    }

    pub fn is_streamable(self) -> bool {
        matches!(self, Self::ChatCompletion | Self::Completion | Self::Responses)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Chat, text completion and responses
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn chat_completion(&self, request: &Value) -> Result<Value>;

    async fn completion(&self, request: &Value) -> Result<Value>;

    async fn responses(&self, request: &Value) -> Result<Value>;

    /// Stream a completion-family request as server-sent events
    async fn stream_completion(
        &self,
        operation: Operation,
        request: &Value,
        sink: &ByteSink,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

#[async_trait]
pub trait EmbeddingsBackend: Send + Sync {
    async fn embeddings(&self, request: &Value) -> Result<Value>;
}

#[async_trait]
pub trait RerankingBackend: Send + Sync {
    async fn reranking(&self, request: &Value) -> Result<Value>;
}

/// Image generation, editing and variations.
///
/// Edit and variation requests carry their images as base64 in
/// `image_data` / `mask_data`.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    async fn image_generations(&self, request: &Value) -> Result<Value>;

    async fn image_edits(&self, request: &Value) -> Result<Value>;

    async fn image_variations(&self, request: &Value) -> Result<Value>;
}

/// Speech synthesis; audio bytes are streamed into `sink`
#[async_trait]
pub trait TextToSpeechBackend: Send + Sync {
    async fn audio_speech(
        &self,
        request: &Value,
        sink: &ByteSink,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_set() {
        let set = CapabilitySet::empty()
            .with(Capability::Completion)
            .with(Capability::Reranking);
        assert!(set.contains(Capability::Completion));
        assert!(set.contains(Capability::Reranking));
        assert!(!set.contains(Capability::Image));
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            [Capability::Completion, Capability::Reranking]
        );
        assert_eq!(
            serde_json::to_value(set).unwrap(),
            serde_json::json!(["completion", "reranking"])
        );
    }

    #[test]
    fn test_operation_mapping() {
        assert_eq!(Operation::Responses.capability(), Capability::Completion);
        assert_eq!(Operation::ImageVariations.capability(), Capability::Image);
        assert_eq!(Operation::ImageVariations.endpoint(), "/v1/images/edits");
        assert_eq!(Operation::ChatCompletion.to_string(), "Chat completion");
        assert!(!Operation::Embeddings.is_streamable());
    }
}
