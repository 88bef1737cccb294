//! Ports to the vision service and the page images it analyzes.

use crate::model::{BoundingBox, Bubble, PageIndex};
use crate::reading_order::sort_reading_order;
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("failed to load page {page}: {reason}")]
    PageLoad { page: PageIndex, reason: String },
    #[error("analysis request failed: {0}")]
    Transport(String),
    #[error("analysis service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("analysis payload could not be parsed: {0}")]
    Payload(String),
    #[error("analysis returned {actual} page results for {expected} pages")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("analysis service is not configured: {0}")]
    NotConfigured(String),
}

/// Encoded page image ready to be sent to the analysis service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub page: PageIndex,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// A bubble exactly as the service reported it, before validation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawBubble {
    pub text: String,
    pub box_2d: Vec<f64>,
}

/// Vision service that finds dialogue bubbles.
///
/// One call covers a whole batch; the response must hold one bubble list per
/// input image, in the same order.
#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn analyze(&self, pages: &[PageImage]) -> Result<Vec<Vec<RawBubble>>, AnalysisError>;
}

/// Source of page images for the open document.
#[async_trait]
pub trait PageSource: Send + Sync {
    fn page_count(&self) -> usize;

    async fn load(&self, page: PageIndex) -> Result<PageImage, AnalysisError>;
}

/// Parse the JSON text of a batch response, tolerating a Markdown code fence
/// around it, and check there is one list per requested page.
pub fn parse_batch_payload(
    text: &str,
    expected: usize,
) -> Result<Vec<Vec<RawBubble>>, AnalysisError> {
    let body = strip_code_fence(text);
    let pages: Vec<Vec<RawBubble>> =
        serde_json::from_str(body).map_err(|err| AnalysisError::Payload(err.to_string()))?;
    if pages.len() != expected {
        return Err(AnalysisError::LengthMismatch {
            expected,
            actual: pages.len(),
        });
    }
    Ok(pages)
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip an optional language tag such as ```json
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// Validate and order one page's raw bubbles. Bubbles with bad geometry are
/// dropped individually; the rest of the page is kept.
pub fn build_page_bubbles(page: PageIndex, raw: Vec<RawBubble>, row_tolerance: u16) -> Vec<Bubble> {
    let mut bubbles: Vec<Bubble> = raw
        .into_iter()
        .enumerate()
        .filter_map(|(idx, raw)| match BoundingBox::from_box_2d(&raw.box_2d) {
            Ok(bbox) => Some(Bubble {
                text: raw.text.trim().to_string(),
                bbox,
            }),
            Err(err) => {
                warn!(page, bubble_idx = idx, "Dropping bubble with malformed box: {err}");
                None
            }
        })
        .collect();
    sort_reading_order(&mut bubbles, row_tolerance);
    bubbles
}
