//! Bubble analysis through a Gemini-style `generateContent` HTTP endpoint.
//!
//! One request carries every page image of a batch inline (base64) together
//! with a fixed instruction; the model answers with a JSON array holding one
//! bubble list per image.

use crate::config::AppConfig;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use koma_core::analysis::parse_batch_payload;
use koma_core::{AnalysisError, AnalysisService, PageImage, RawBubble};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const API_KEY_HEADER: &str = "x-goog-api-key";

const INSTRUCTION: &str = "You are given manga pages in order. For every page, find each speech \
bubble or narration box that contains dialogue and transcribe its text. Ignore sound effects, \
signs, titles and any other non-dialogue text. Answer with only a JSON array that has exactly one \
element per page, in the order the pages were given. Each element is an array of objects of the \
form {\"text\": string, \"box_2d\": [ymin, xmin, ymax, xmax]} where the box coordinates are \
integers from 0 to 1000 relative to the page size. Use an empty array for a page without dialogue.";

pub struct GeminiAnalysisService {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    api_key_env: String,
}

impl GeminiAnalysisService {
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var(&config.analysis_api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        if api_key.is_none() {
            warn!(
                env = %config.analysis_api_key_env,
                "No analysis API key set; bubble analysis will fail until it is"
            );
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.analysis_timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            url: endpoint_url(&config.analysis_endpoint, &config.analysis_model),
            api_key,
            api_key_env: config.analysis_api_key_env.clone(),
        })
    }
}

#[async_trait]
impl AnalysisService for GeminiAnalysisService {
    async fn analyze(&self, pages: &[PageImage]) -> Result<Vec<Vec<RawBubble>>, AnalysisError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            AnalysisError::NotConfigured(format!("environment variable {} is not set", self.api_key_env))
        })?;
        let body = build_request(pages);
        debug!(pages = pages.len(), url = %self.url, "Sending analysis request");

        let response = self
            .client
            .post(&self.url)
            .header(API_KEY_HEADER, api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| AnalysisError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalysisError::Status {
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }
        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|err| AnalysisError::Payload(err.to_string()))?;
        let text = response_text(&parsed)?;
        parse_batch_payload(&text, pages.len())
    }
}

fn endpoint_url(endpoint: &str, model: &str) -> String {
    format!(
        "{}/models/{}:generateContent",
        endpoint.trim_end_matches('/'),
        model
    )
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

fn build_request(pages: &[PageImage]) -> GenerateRequest {
    let mut parts = Vec::with_capacity(pages.len() + 1);
    parts.push(Part {
        text: Some(INSTRUCTION.to_string()),
        inline_data: None,
    });
    parts.extend(pages.iter().map(|page| Part {
        text: None,
        inline_data: Some(InlineData {
            mime_type: page.mime_type.clone(),
            data: STANDARD.encode(&page.data),
        }),
    }));
    GenerateRequest {
        contents: vec![Content { parts }],
        generation_config: GenerationConfig {
            response_mime_type: "application/json",
            temperature: 0.0,
        },
    }
}

fn response_text(response: &GenerateResponse) -> Result<String, AnalysisError> {
    let text: String = response
        .candidates
        .first()
        .and_then(|candidate| candidate.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|part| part.text.as_deref())
                .collect()
        })
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(AnalysisError::Payload("response has no text".to_string()));
    }
    Ok(text)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
