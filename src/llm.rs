use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::config::LlmSettings;

/// One endpoint in the fallback chain.
#[derive(Debug, Clone)]
pub struct Provider {
    pub name: String,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_owned(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_owned(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: String,
    pub provider: String,
}

#[derive(Debug, Clone)]
pub struct JsonChatOutcome {
    pub value: serde_json::Value,
    pub provider: String,
}

/// Raised only when every provider in the chain has been exhausted.
#[derive(Debug, thiserror::Error)]
#[error("all model providers failed: {summary}")]
pub struct AllProvidersFailed {
    pub summary: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Chat-completions client over an ordered provider chain. Transport errors,
/// non-2xx statuses, and undecodable bodies fall through to the next
/// provider; invalid JSON in JSON mode gets one strict retry on the same
/// provider first.
pub struct ModelClient {
    client: reqwest::Client,
    providers: Vec<Provider>,
    json_retries: usize,
    last_provider_used: Mutex<Option<String>>,
}

impl ModelClient {
    pub fn new(settings: &LlmSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("build model http client")?;
        let providers = settings
            .providers
            .iter()
            .map(|p| Provider {
                name: p.name.clone(),
                base_url: p.base_url.trim_end_matches('/').to_owned(),
                model: p.model.clone(),
                api_key: p.api_key.clone(),
            })
            .collect();
        Ok(Self {
            client,
            providers,
            json_retries: settings.json_retries,
            last_provider_used: Mutex::new(None),
        })
    }

    pub fn last_provider_used(&self) -> Option<String> {
        self.last_provider_used.lock().ok()?.clone()
    }

    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatOutcome, AllProvidersFailed> {
        let mut attempts = Vec::new();
        for provider in &self.providers {
            match self.call_provider(provider, messages, false).await {
                Ok(content) => {
                    self.record_success(&provider.name);
                    return Ok(ChatOutcome {
                        content,
                        provider: provider.name.clone(),
                    });
                }
                Err(err) => {
                    tracing::warn!(provider = %provider.name, error = %format!("{err:#}"), "model provider failed");
                    attempts.push(format!("{}: {err:#}", provider.name));
                }
            }
        }
        Err(AllProvidersFailed {
            summary: attempts.join("; "),
        })
    }

    /// JSON-mode call: the request carries `response_format: json_object` and
    /// the reply must contain a parsable JSON object.
    pub async fn chat_json(
        &self,
        messages: &[ChatMessage],
    ) -> Result<JsonChatOutcome, AllProvidersFailed> {
        let mut attempts = Vec::new();
        for provider in &self.providers {
            match self.call_provider_json(provider, messages).await {
                Ok(value) => {
                    self.record_success(&provider.name);
                    return Ok(JsonChatOutcome {
                        value,
                        provider: provider.name.clone(),
                    });
                }
                Err(err) => {
                    tracing::warn!(provider = %provider.name, error = %format!("{err:#}"), "model provider failed");
                    attempts.push(format!("{}: {err:#}", provider.name));
                }
            }
        }
        Err(AllProvidersFailed {
            summary: attempts.join("; "),
        })
    }

    async fn call_provider_json(
        &self,
        provider: &Provider,
        messages: &[ChatMessage],
    ) -> anyhow::Result<serde_json::Value> {
        let mut messages = messages.to_vec();
        let attempts = self.json_retries.saturating_add(1);

        let mut last_err = None;
        for attempt in 0..attempts {
            let content = self
                .call_provider(provider, &messages, true)
                .await
                .with_context(|| format!("call attempt {}/{attempts}", attempt + 1))?;

            match parse_json_reply(&content) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    tracing::warn!(
                        provider = %provider.name,
                        attempt = attempt + 1,
                        attempts,
                        "model reply is not valid JSON; retrying with strict instruction"
                    );
                    messages.push(ChatMessage::user(
                        "The previous reply was not valid JSON. Reply again with ONLY a single \
                         valid JSON object, no markdown fences, no commentary.",
                    ));
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no json attempts made")))
    }

    async fn call_provider(
        &self,
        provider: &Provider,
        messages: &[ChatMessage],
        json_mode: bool,
    ) -> anyhow::Result<String> {
        let url = format!("{}/chat/completions", provider.base_url);
        let body = ChatCompletionRequest {
            model: &provider.model,
            messages,
            response_format: json_mode.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(api_key) = provider.api_key.as_deref() {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.with_context(|| format!("POST {url}"))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("model endpoint returned {status}");
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .context("decode chat completion response")?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow::anyhow!("response has no message content"))?;
        Ok(content)
    }

    fn record_success(&self, provider: &str) {
        if let Ok(mut last) = self.last_provider_used.lock() {
            *last = Some(provider.to_owned());
        }
    }
}

fn parse_json_reply(content: &str) -> anyhow::Result<serde_json::Value> {
    let json = extract_json_object(content).context("extract json object from reply")?;
    serde_json::from_str(json).context("parse reply json")
}

fn extract_json_object(text: &str) -> anyhow::Result<&str> {
    let start = text
        .find('{')
        .ok_or_else(|| anyhow::anyhow!("missing `{{`"))?;
    let end = text
        .rfind('}')
        .ok_or_else(|| anyhow::anyhow!("missing `}}`"))?;
    if end <= start {
        anyhow::bail!("invalid json object span");
    }
    Ok(&text[start..=end])
}
