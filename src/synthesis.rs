//! # Speech Synthesis
//!
//! One-shot text-to-speech used by voicemail playback. Given text and a voice
//! it returns one base64 PCM payload; there is no streaming here.

use crate::audio::codec::EncodedAudioChunk;
use crate::config::SynthesisConfig;
use crate::error::PipelineError;
use crate::transport::live::SpeechConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Turns text into encoded speech.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<EncodedAudioChunk, PipelineError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: [RequestContent<'a>; 1],
    generation_config: RequestGenerationConfig<'a>,
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    parts: [RequestPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestGenerationConfig<'a> {
    response_modalities: [&'static str; 1],
    speech_config: SpeechConfig<'a>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidatePart {
    inline_data: Option<EncodedAudioChunk>,
}

fn build_request<'a>(text: &'a str, voice: &'a str) -> GenerateRequest<'a> {
    GenerateRequest {
        contents: [RequestContent {
            parts: [RequestPart { text }],
        }],
        generation_config: RequestGenerationConfig {
            response_modalities: ["AUDIO"],
            speech_config: SpeechConfig::prebuilt(voice),
        },
    }
}

/// First inline audio part of the first candidate that has one.
fn extract_audio(response: GenerateResponse) -> Result<EncodedAudioChunk, PipelineError> {
    response
        .candidates
        .into_iter()
        .filter_map(|candidate| candidate.content)
        .flat_map(|content| content.parts)
        .find_map(|part| part.inline_data)
        .filter(|chunk| !chunk.data.is_empty())
        .ok_or_else(|| PipelineError::Synthesis("response contained no audio".to_string()))
}

/// HTTP client for the vendor's `generateContent` endpoint with audio output.
pub struct GenerativeSpeechClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl GenerativeSpeechClient {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
        }
    }

    pub fn from_config(config: &SynthesisConfig) -> Self {
        Self::new(config.endpoint.clone(), config.model.clone(), config.api_key())
    }

    fn url(&self) -> String {
        format!("{}/models/{}:generateContent", self.endpoint.trim_end_matches('/'), self.model)
    }
}

#[async_trait]
impl SpeechSynthesizer for GenerativeSpeechClient {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<EncodedAudioChunk, PipelineError> {
        let api_key = self
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| PipelineError::Synthesis("no API key configured for speech synthesis".to_string()))?;

        let response = self
            .client
            .post(self.url())
            .header("x-goog-api-key", api_key)
            .json(&build_request(text, voice))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Synthesis(format!("speech API error {}: {}", status, body)));
        }

        let chunk = extract_audio(response.json().await?)?;
        debug!(voice, mime_type = %chunk.mime_type, bytes = chunk.data.len(), "Synthesized speech");
        Ok(chunk)
    }
}
