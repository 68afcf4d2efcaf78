use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::Translator;
use crate::error::{Result, SubburnError};
use crate::settings::LANGUAGES;

const DEFAULT_ENDPOINT: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3.2:3b";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    format: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TranslationPayload {
    text: String,
}

/// Translator backed by a local ollama endpoint. Requests JSON-format
/// output so the model's reply can be unwrapped reliably.
pub struct OllamaTranslator {
    client: Client,
    endpoint: String,
    model: String,
}

impl OllamaTranslator {
    pub fn new() -> Self {
        Self::with_endpoint(DEFAULT_ENDPOINT, DEFAULT_MODEL)
    }

    pub fn with_endpoint<S1: Into<String>, S2: Into<String>>(endpoint: S1, model: S2) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("HTTP client creation should not fail");

        Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
        }
    }

    /// Check that the endpoint is reachable before a translation-enabled
    /// job starts.
    pub async fn check_availability(&self) -> Result<()> {
        let url = format!("{}/api/tags", self.endpoint);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SubburnError::Translation(format!("ollama is not reachable: {e}")))?;

        if !response.status().is_success() {
            return Err(SubburnError::Translation(format!(
                "ollama endpoint returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn build_prompt(&self, text: &str, source: &str, target: &str) -> String {
        let language_name = |code: &str| -> String {
            LANGUAGES
                .iter()
                .find(|(c, _)| *c == code)
                .map(|(_, name)| (*name).to_string())
                .unwrap_or_else(|| code.to_string())
        };

        let source_clause = if source == "auto" {
            "Detect the source language.".to_string()
        } else {
            format!("The source language is {}.", language_name(source))
        };

        format!(
            "Translate the following subtitle text to {target}. {source_clause} \
             Keep line breaks exactly as they are, translate nothing else, and \
             respond with JSON of the form {{\"text\": \"<translation>\"}}.\n\n{text}",
            target = language_name(target),
        )
    }
}

impl Default for OllamaTranslator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Translator for OllamaTranslator {
    async fn translate(&self, text: &str, source: &str, target: &str) -> Result<String> {
        let request = GenerateRequest {
            model: self.model.clone(),
            prompt: self.build_prompt(text, source, target),
            stream: false,
            format: "json".to_string(),
        };

        let url = format!("{}/api/generate", self.endpoint);
        debug!("Sending translation request to {url}");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| SubburnError::Translation(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SubburnError::Translation(format!(
                "ollama API error {status}: {body}"
            )));
        }

        let generated: GenerateResponse = response
            .json()
            .await
            .map_err(|e| SubburnError::Translation(format!("unparseable response: {e}")))?;

        let raw = generated.response.trim();
        if raw.is_empty() {
            return Err(SubburnError::Translation(
                "empty translation received".to_string(),
            ));
        }

        let translation = match serde_json::from_str::<TranslationPayload>(raw) {
            Ok(payload) => payload.text,
            // Some models ignore the JSON format hint; fall back to the
            // raw reply.
            Err(_) => raw.to_string(),
        };

        let translation = translation.trim();
        if translation.is_empty() {
            return Err(SubburnError::Translation(
                "empty translation received".to_string(),
            ));
        }

        Ok(translation.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_names_languages_and_keeps_text() {
        let translator = OllamaTranslator::new();
        let prompt = translator.build_prompt("Hello\nthere", "en", "it");
        assert!(prompt.contains("to Italian"));
        assert!(prompt.contains("source language is English"));
        assert!(prompt.contains("Hello\nthere"));
    }

    #[test]
    fn test_prompt_auto_detects_source() {
        let translator = OllamaTranslator::new();
        let prompt = translator.build_prompt("Hola", "auto", "en");
        assert!(prompt.contains("Detect the source language."));
    }
}
