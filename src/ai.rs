/*
 * Meeting Companion Server - LLM Client
 * Copyright (c) 2024 Meeting Companion Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::config::LlmConfig;

const RATE_LIMIT_BACKOFF: Duration = Duration::from_millis(500);

/// Why a completion call failed. Recap falls back to deterministic
/// summaries on any of these; an unconfigured provider is expected and
/// stays quiet, everything else is worth a log line.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM provider not configured")]
    NotConfigured,

    #[error("LLM request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("LLM authentication rejected ({status})")]
    Auth { status: u16 },

    #[error("LLM rate limited")]
    RateLimited,

    #[error("LLM upstream error ({status})")]
    Upstream { status: u16 },

    #[error("LLM response malformed: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions client for any OpenAI-compatible endpoint. Recap and
/// Q&A prompts go through `simple_completion`; a rate-limited call is
/// retried once after a short backoff, every other failure is returned
/// classified so callers can pick their fallback.
pub struct LlmClient {
    client: Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to build LLM HTTP client")?;
        Ok(Self { client, config })
    }

    pub fn is_configured(&self) -> bool {
        !self.config.api_key.is_empty()
    }

    pub fn model_name(&self) -> &str {
        &self.config.model
    }

    pub async fn simple_completion(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
    ) -> Result<String, LlmError> {
        if !self.is_configured() {
            return Err(LlmError::NotConfigured);
        }

        match self
            .request_completion(system_prompt, user_prompt, max_tokens)
            .await
        {
            Err(LlmError::RateLimited) => {
                tokio::time::sleep(RATE_LIMIT_BACKOFF).await;
                self.request_completion(system_prompt, user_prompt, max_tokens)
                    .await
            }
            other => other,
        }
    }

    async fn request_completion(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
    ) -> Result<String, LlmError> {
        let request_body = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt}
            ],
            "max_tokens": max_tokens.min(self.config.max_tokens),
            "temperature": self.config.temperature,
            "stream": false
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&request_body)
            .send()
            .await?;

        let status = response.status().as_u16();
        match status {
            401 | 403 => return Err(LlmError::Auth { status }),
            429 => return Err(LlmError::RateLimited),
            code if code >= 400 => return Err(LlmError::Upstream { status: code }),
            _ => {}
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|err| LlmError::MalformedResponse(err.to_string()))?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| LlmError::MalformedResponse("no message content".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(server_url: &str) -> LlmConfig {
        LlmConfig {
            api_key: "test-key".to_string(),
            model: "test-model".to_string(),
            base_url: server_url.to_string(),
            max_tokens: 512,
            temperature: 0.0,
        }
    }

    #[tokio::test]
    async fn completion_extracts_message_content() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"content":"{\"recap_lines\":[]}"}}]}"#)
            .create_async()
            .await;

        let client = LlmClient::new(config_for(&server.url())).unwrap();
        let content = client.simple_completion("system", "user", 256).await.unwrap();
        assert_eq!(content, r#"{"recap_lines":[]}"#);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unconfigured_client_errors_before_any_request() {
        let client = LlmClient::new(LlmConfig::default()).unwrap();
        assert!(!client.is_configured());
        assert!(matches!(
            client.simple_completion("s", "u", 64).await,
            Err(LlmError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn auth_rejection_is_classified() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .create_async()
            .await;

        let client = LlmClient::new(config_for(&server.url())).unwrap();
        assert!(matches!(
            client.simple_completion("s", "u", 64).await,
            Err(LlmError::Auth { status: 401 })
        ));
    }

    #[tokio::test]
    async fn upstream_error_status_is_classified() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(500)
            .create_async()
            .await;

        let client = LlmClient::new(config_for(&server.url())).unwrap();
        assert!(matches!(
            client.simple_completion("s", "u", 64).await,
            Err(LlmError::Upstream { status: 500 })
        ));
    }

    #[tokio::test]
    async fn rate_limit_retries_exactly_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .expect(2)
            .create_async()
            .await;

        let client = LlmClient::new(config_for(&server.url())).unwrap();
        assert!(matches!(
            client.simple_completion("s", "u", 64).await,
            Err(LlmError::RateLimited)
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn empty_choices_and_blank_content_are_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[]}"#)
            .create_async()
            .await;

        let client = LlmClient::new(config_for(&server.url())).unwrap();
        assert!(matches!(
            client.simple_completion("s", "u", 64).await,
            Err(LlmError::MalformedResponse(_))
        ));
    }
}
