//! Capability types for the inference gateway.

use serde::{Deserialize, Serialize};

/// Operations an engine recipe can serve.
///
/// These are logical operation families, not endpoints: `Completions` covers
/// chat completions, legacy completions and the responses API, which every
/// text engine implements together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Chat/text completion and the responses API
    Completions,
    /// Vector embeddings generation
    Embeddings,
    /// Relevance reranking of documents against a query
    Reranking,
    /// Text-to-image generation
    ImageGenerate,
    /// Image editing with prompt and optional mask
    ImageEdit,
    /// Image variations without a user prompt
    ImageVariation,
    /// Speech-to-text transcription
    AudioTranscribe,
    /// Text-to-speech synthesis
    AudioSpeak,
}

impl Capability {
    /// All capability variants for iteration.
    pub const ALL: [Capability; 8] = [
        Capability::Completions,
        Capability::Embeddings,
        Capability::Reranking,
        Capability::ImageGenerate,
        Capability::ImageEdit,
        Capability::ImageVariation,
        Capability::AudioTranscribe,
        Capability::AudioSpeak,
    ];
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Completions => write!(f, "completions"),
            Capability::Embeddings => write!(f, "embeddings"),
            Capability::Reranking => write!(f, "reranking"),
            Capability::ImageGenerate => write!(f, "image_generate"),
            Capability::ImageEdit => write!(f, "image_edit"),
            Capability::ImageVariation => write!(f, "image_variation"),
            Capability::AudioTranscribe => write!(f, "audio_transcribe"),
            Capability::AudioSpeak => write!(f, "audio_speak"),
        }
    }
}
