//! TickerExtractor collaborator (§6).
//!
//! `POST {text, hint?}` → `{symbol, confidence}` over HTTP. Retries once
//! on any transport failure, 1 s timeout per attempt.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::Symbol;
use crate::{EngineError, Result};

const CALL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
struct ExtractRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'a [String]>,
}

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    symbol: Option<String>,
    #[allow(dead_code)]
    confidence: f64,
}

/// Thin HTTP client over the extractor endpoint.
#[derive(Debug, Clone)]
pub struct TickerExtractor {
    client: reqwest::Client,
    url: String,
}

impl TickerExtractor {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    /// Resolve the single best symbol for an article body, optionally
    /// seeded with the article's own symbols hint. Returns `Ok(None)`
    /// when the extractor found no confident symbol; returns
    /// `Err(ExtractorFailure)` only once both the original call and its
    /// single retry have failed.
    pub async fn extract(&self, text: &str, hint: &[String]) -> Result<Option<Symbol>> {
        let body = ExtractRequest {
            text,
            hint: (!hint.is_empty()).then_some(hint),
        };
        let mut last_err = None;
        for attempt in 0..2 {
            match self.call(&body).await {
                Ok(resolved) => return Ok(resolved),
                Err(err) => {
                    if attempt == 0 {
                        warn!(%err, "extractor call failed, retrying once");
                    }
                    last_err = Some(err);
                }
            }
        }
        Err(EngineError::ExtractorFailure(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    async fn call(&self, body: &ExtractRequest<'_>) -> Result<Option<Symbol>> {
        let response = self
            .client
            .post(&self.url)
            .json(body)
            .timeout(CALL_TIMEOUT)
            .send()
            .await
            .map_err(|e| EngineError::ExtractorFailure(e.to_string()))?
            .error_for_status()
            .map_err(|e| EngineError::ExtractorFailure(e.to_string()))?
            .json::<ExtractResponse>()
            .await
            .map_err(|e| EngineError::ExtractorFailure(e.to_string()))?;

        Ok(response.symbol.as_deref().and_then(Symbol::parse))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_request_omits_empty_hint() {
        let body = ExtractRequest {
            text: "Acme Corp beats earnings",
            hint: None,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("hint"));
    }
}
