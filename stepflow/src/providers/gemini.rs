//! Remote reasoning-model provider backed by the Gemini API

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use stepflow_sdk::{
    async_trait, Provider, ProviderError, ProviderMetadata, ProviderResult, PROVIDER_TIMEOUT_SECS,
};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Default Gemini model served by this provider
pub const GEMINI_MODEL_ID: &str = "gemini-2.5-flash";

/// How much of an upstream error body to surface in messages
const ERROR_BODY_PREVIEW_CHARS: usize = 300;

pub struct GeminiProvider {
    client: reqwest::Client,
    /// None when the environment carries no key; every call then fails with
    /// an actionable auth error instead of a confusing upstream one.
    api_key: Option<String>,
    model: String,
}

impl GeminiProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self::with_model(api_key, GEMINI_MODEL_ID)
    }

    pub fn with_model(api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            model: model.into(),
        }
    }

    async fn call_api(
        &self,
        api_key: &str,
        prompt: &str,
        system_instruction: &str,
        context: &str,
    ) -> ProviderResult<String> {
        let user_text = if context.trim().is_empty() {
            prompt.to_string()
        } else {
            format!(
                "Context from previously approved steps:\n\n{context}\n\n---\n\n{prompt}"
            )
        };
        let body = json!({
            "system_instruction": { "parts": [{ "text": system_instruction }] },
            "contents": [{ "role": "user", "parts": [{ "text": user_text }] }]
        });

        let url = format!("{}/{}:generateContent", GEMINI_API_BASE, self.model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(classify_status_error(status, &error_body));
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Upstream(format!("malformed Gemini response: {}", e)))?;
        parsed.text().ok_or(ProviderError::EmptyResponse)
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            id: self.model.clone(),
            name: "Gemini 2.5 Flash".to_string(),
            description: "Google's hosted reasoning model via the generateContent API".to_string(),
            local: false,
        }
    }

    async fn generate(
        &self,
        prompt: &str,
        system_instruction: &str,
        context: &str,
    ) -> ProviderResult<String> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            ProviderError::Auth(
                "GEMINI_API_KEY is not set — export it or add it to your .env file".to_string(),
            )
        })?;

        match tokio::time::timeout(
            Duration::from_secs(PROVIDER_TIMEOUT_SECS),
            self.call_api(api_key, prompt, system_instruction, context),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                secs: PROVIDER_TIMEOUT_SECS,
            }),
        }
    }
}

fn classify_transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout {
            secs: PROVIDER_TIMEOUT_SECS,
        }
    } else {
        ProviderError::Upstream(format!("request to Gemini failed: {}", err))
    }
}

fn classify_status_error(status: reqwest::StatusCode, body: &str) -> ProviderError {
    let preview: String = body.chars().take(ERROR_BODY_PREVIEW_CHARS).collect();
    match status {
        reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => ProviderError::Auth(
            format!("Gemini rejected the API key (HTTP {}) — verify GEMINI_API_KEY", status.as_u16()),
        ),
        reqwest::StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimit(format!(
            "Gemini quota exhausted (HTTP 429) — wait before retrying or check your plan: {}",
            preview
        )),
        _ => ProviderError::Upstream(format!("Gemini API error {}: {}", status.as_u16(), preview)),
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
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
    parts: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    text: Option<String>,
}

impl GenerateContentResponse {
    /// Joined text of the first candidate, or None when nothing usable came back
    fn text(&self) -> Option<String> {
        let text: String = self
            .candidates
            .first()?
            .content
            .as_ref()?
            .parts
            .iter()
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_api_key_is_auth_error() {
        let provider = GeminiProvider::new(None);
        let err = provider.generate("prompt", "system", "").await.unwrap_err();
        assert!(matches!(err, ProviderError::Auth(msg) if msg.contains("GEMINI_API_KEY")));
    }

    #[tokio::test]
    async fn test_blank_api_key_is_auth_error() {
        let provider = GeminiProvider::new(Some("   ".to_string()));
        let err = provider.generate("prompt", "system", "").await.unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
    }

    #[test]
    fn test_status_classification() {
        let err = classify_status_error(reqwest::StatusCode::UNAUTHORIZED, "denied");
        assert!(matches!(err, ProviderError::Auth(_)));

        let err = classify_status_error(reqwest::StatusCode::FORBIDDEN, "denied");
        assert!(matches!(err, ProviderError::Auth(_)));

        let err = classify_status_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(err, ProviderError::RateLimit(_)));

        let err = classify_status_error(reqwest::StatusCode::BAD_GATEWAY, "oops");
        assert!(matches!(err, ProviderError::Upstream(msg) if msg.contains("502")));
    }

    #[test]
    fn test_response_text_extraction() {
        let parsed: GenerateContentResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Hello " }, { "text": "world" }] }
            }]
        }))
        .unwrap();
        assert_eq!(parsed.text().as_deref(), Some("Hello world"));
    }

    #[test]
    fn test_empty_candidates_yield_none() {
        let parsed: GenerateContentResponse =
            serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(parsed.text(), None);

        let parsed: GenerateContentResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": "  " }] } }]
        }))
        .unwrap();
        assert_eq!(parsed.text(), None);
    }

    #[test]
    fn test_metadata_is_remote() {
        let provider = GeminiProvider::new(Some("key".to_string()));
        let meta = provider.metadata();
        assert_eq!(meta.id, GEMINI_MODEL_ID);
        assert!(!meta.local);
    }
}
