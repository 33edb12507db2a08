//! Backend Adapter (§4.6): per-provider chat completion, normalized to
//! a common `{text, tokens, model, finish_reason}` shape. The variant
//! set is closed — dispatch is by tag, not open-world virtual method
//! lookup (§9 "ad-hoc class hierarchies for adapters").

pub mod prompt;

use crate::models::ProviderKind;
use crate::{OrchestratorError, Result};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

pub use prompt::{compose_system_prompt, PromptContext};

/// Normalized adapter output, common to every provider kind.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub text: String,
    pub tokens: u64,
    pub model: String,
    pub finish_reason: Option<String>,
}

/// Everything the adapter needs to dispatch a single call. Resolved
/// once by the caller (the registry) and passed in as a plain value —
/// the adapter never reads `std::env` itself (§9).
pub struct BackendRequest<'a> {
    pub provider_kind: ProviderKind,
    pub endpoint: Option<&'a str>,
    pub model_id: &'a str,
    pub credential: Option<&'a str>,
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
    pub max_tokens: Option<u32>,
    /// True only for OpenAI-compatible hosts where non-streaming
    /// responses must be treated as hung (the NVIDIA NIM case).
    pub streaming: bool,
}

fn estimate_tokens(text: &str) -> u64 {
    ((text.len() as f64) / 4.0).ceil() as u64
}

/// Classifies an HTTP status/transport failure into the two shapes the
/// orchestrator treats differently.
fn classify_status(status: reqwest::StatusCode, retry_after: Option<Duration>) -> OrchestratorError {
    if status.as_u16() == 429 {
        OrchestratorError::RateLimited {
            message: format!("rate limited ({status})"),
            retry_after,
        }
    } else {
        OrchestratorError::Transport {
            message: format!("backend returned {status}"),
        }
    }
}

fn retry_after_from_headers(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Dispatches one backend call. Bridge providers fail fast with
/// `OutOfScope` before any I/O (§7). Every other provider kind is
/// wrapped in the 5-minute safety deadline (§4.6, §5).
pub async fn call(req: &BackendRequest<'_>) -> Result<BackendResponse> {
    if req.provider_kind.is_bridge() {
        return Err(OrchestratorError::OutOfScope(format!(
            "{:?} is executed by the host IDE, not the core",
            req.provider_kind
        )));
    }

    let deadline = crate::constants::BACKEND_CALL_TIMEOUT;
    match tokio::time::timeout(deadline, dispatch(req)).await {
        Ok(result) => result,
        Err(_) => Err(OrchestratorError::Transport {
            message: format!("backend call exceeded {}s deadline", deadline.as_secs()),
        }),
    }
}

async fn dispatch(req: &BackendRequest<'_>) -> Result<BackendResponse> {
    match req.provider_kind {
        ProviderKind::OpenAiCompatible if req.streaming => call_openai_streaming(req).await,
        ProviderKind::OpenAiCompatible => call_openai_buffered(req).await,
        ProviderKind::Anthropic | ProviderKind::Gemini => call_thinking_model(req).await,
        ProviderKind::CursorBridge | ProviderKind::CopilotBridge => unreachable!("bridge kinds rejected above"),
    }
}

#[derive(Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    content: String,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    total_tokens: u64,
}

fn openai_body(req: &BackendRequest<'_>, stream: bool) -> serde_json::Value {
    let mut body = json!({
        "model": req.model_id,
        "messages": [
            {"role": "system", "content": req.system_prompt},
            {"role": "user", "content": req.user_prompt},
        ],
        "temperature": 0.2,
        "stream": stream,
    });
    if let Some(max_tokens) = req.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    // NVIDIA NIM-hosted thinking toggles, passed through unmodified
    // per §6 — the core does not interpret their contents.
    if req.model_id.contains("thinking") {
        body["extra_body"] = json!({"chat_template_kwargs": {"thinking": true}});
    } else if stream {
        body["extra_body"] = json!({"chat_template_kwargs": {"enable_thinking": true, "clear_thinking": false}});
    }
    body
}

async fn call_openai_buffered(req: &BackendRequest<'_>) -> Result<BackendResponse> {
    let endpoint = req
        .endpoint
        .ok_or_else(|| OrchestratorError::Config("openai-compatible agent has no endpoint".into()))?;

    let client = reqwest::Client::new();
    let mut builder = client.post(endpoint).json(&openai_body(req, false));
    if let Some(cred) = req.credential {
        builder = builder.bearer_auth(cred);
    }

    let resp = builder.send().await.map_err(|e| OrchestratorError::Transport {
        message: format!("request failed: {e}"),
    })?;

    if !resp.status().is_success() {
        let retry_after = retry_after_from_headers(&resp);
        let status = resp.status();
        return Err(classify_status(status, retry_after));
    }

    let parsed: OpenAiChatResponse = resp.json().await.map_err(|e| OrchestratorError::Transport {
        message: format!("malformed response body: {e}"),
    })?;

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| OrchestratorError::Transport {
            message: "backend returned no choices".into(),
        })?;

    let text = choice.message.content;
    let tokens = parsed
        .usage
        .map(|u| u.total_tokens)
        .unwrap_or_else(|| estimate_tokens(&text));

    Ok(BackendResponse {
        model: parsed.model.unwrap_or_else(|| req.model_id.to_string()),
        finish_reason: choice.finish_reason,
        tokens,
        text,
    })
}

/// Streams server-sent events and concatenates delta content. Required
/// for the NVIDIA NIM host; non-streaming there is considered hung, so
/// callers must route `streaming: true` agents exclusively through
/// this path.
async fn call_openai_streaming(req: &BackendRequest<'_>) -> Result<BackendResponse> {
    use futures::StreamExt;

    let endpoint = req
        .endpoint
        .ok_or_else(|| OrchestratorError::Config("streaming agent has no endpoint".into()))?;

    let client = reqwest::Client::new();
    let mut builder = client.post(endpoint).json(&openai_body(req, true));
    if let Some(cred) = req.credential {
        builder = builder.bearer_auth(cred);
    }

    let resp = builder.send().await.map_err(|e| OrchestratorError::Transport {
        message: format!("request failed: {e}"),
    })?;

    if !resp.status().is_success() {
        let retry_after = retry_after_from_headers(&resp);
        let status = resp.status();
        return Err(classify_status(status, retry_after));
    }

    let mut text = String::new();
    let mut model = req.model_id.to_string();
    let mut finish_reason = None;
    let mut usage_tokens = None;
    let mut byte_stream = resp.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(|e| OrchestratorError::Transport {
            message: format!("stream read failed: {e}"),
        })?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim_end_matches('\r').to_string();
            buffer.drain(..=pos);
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                continue;
            }
            let event: serde_json::Value = match serde_json::from_str(data) {
                Ok(v) => v,
                Err(_) => {
                    debug!("skipping malformed SSE chunk");
                    continue;
                }
            };
            if let Some(m) = event.get("model").and_then(|v| v.as_str()) {
                model = m.to_string();
            }
            if let Some(usage) = event.get("usage").and_then(|v| v.get("total_tokens")).and_then(|v| v.as_u64()) {
                usage_tokens = Some(usage);
            }
            if let Some(choice) = event.get("choices").and_then(|c| c.as_array()).and_then(|c| c.first()) {
                if let Some(delta) = choice.get("delta").and_then(|d| d.get("content")).and_then(|c| c.as_str()) {
                    text.push_str(delta);
                }
                if let Some(fr) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                    finish_reason = Some(fr.to_string());
                }
            }
        }
    }

    let tokens = usage_tokens.unwrap_or_else(|| estimate_tokens(&text));
    Ok(BackendResponse {
        text,
        tokens,
        model,
        finish_reason,
    })
}

/// Dedicated "thinking-model" protocol (Anthropic, Google): distinct
/// wire shape, normalized to the same `{text, tokens}` pair the rest
/// of the core depends on.
async fn call_thinking_model(req: &BackendRequest<'_>) -> Result<BackendResponse> {
    match req.provider_kind {
        ProviderKind::Anthropic => call_anthropic(req).await,
        ProviderKind::Gemini => call_gemini(req).await,
        _ => unreachable!("only anthropic/gemini reach call_thinking_model"),
    }
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
    usage: Option<AnthropicUsage>,
    model: Option<String>,
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

async fn call_anthropic(req: &BackendRequest<'_>) -> Result<BackendResponse> {
    let endpoint = req.endpoint.unwrap_or("https://api.anthropic.com/v1/messages");
    let client = reqwest::Client::new();
    let mut builder = client
        .post(endpoint)
        .header("anthropic-version", "2023-06-01")
        .json(&json!({
            "model": req.model_id,
            "system": req.system_prompt,
            "max_tokens": req.max_tokens.unwrap_or(4096),
            "messages": [{"role": "user", "content": req.user_prompt}],
        }));
    if let Some(cred) = req.credential {
        builder = builder.header("x-api-key", cred);
    }

    let resp = builder.send().await.map_err(|e| OrchestratorError::Transport {
        message: format!("request failed: {e}"),
    })?;
    if !resp.status().is_success() {
        let retry_after = retry_after_from_headers(&resp);
        let status = resp.status();
        return Err(classify_status(status, retry_after));
    }

    let parsed: AnthropicResponse = resp.json().await.map_err(|e| OrchestratorError::Transport {
        message: format!("malformed response body: {e}"),
    })?;
    let text: String = parsed.content.iter().map(|b| b.text.as_str()).collect();
    let tokens = parsed
        .usage
        .map(|u| u.input_tokens + u.output_tokens)
        .unwrap_or_else(|| estimate_tokens(&text));

    Ok(BackendResponse {
        model: parsed.model.unwrap_or_else(|| req.model_id.to_string()),
        finish_reason: parsed.stop_reason,
        tokens,
        text,
    })
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct GeminiUsage {
    #[serde(rename = "totalTokenCount")]
    total_token_count: u64,
}

async fn call_gemini(req: &BackendRequest<'_>) -> Result<BackendResponse> {
    let credential = req
        .credential
        .ok_or_else(|| OrchestratorError::Config("gemini agent has no credential".into()))?;
    let base = req
        .endpoint
        .unwrap_or("https://generativelanguage.googleapis.com/v1beta/models");
    let url = format!("{base}/{}:generateContent?key={credential}", req.model_id);

    let client = reqwest::Client::new();
    let resp = client
        .post(&url)
        .json(&json!({
            "systemInstruction": {"parts": [{"text": req.system_prompt}]},
            "contents": [{"role": "user", "parts": [{"text": req.user_prompt}]}],
        }))
        .send()
        .await
        .map_err(|e| OrchestratorError::Transport {
            message: format!("request failed: {e}"),
        })?;

    if !resp.status().is_success() {
        let retry_after = retry_after_from_headers(&resp);
        let status = resp.status();
        return Err(classify_status(status, retry_after));
    }

    let parsed: GeminiResponse = resp.json().await.map_err(|e| OrchestratorError::Transport {
        message: format!("malformed response body: {e}"),
    })?;
    let candidate = parsed
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| OrchestratorError::Transport {
            message: "backend returned no candidates".into(),
        })?;
    let text: String = candidate.content.parts.iter().map(|p| p.text.as_str()).collect();
    let tokens = parsed
        .usage_metadata
        .map(|u| u.total_token_count)
        .unwrap_or_else(|| estimate_tokens(&text));

    Ok(BackendResponse {
        model: req.model_id.to_string(),
        finish_reason: candidate.finish_reason,
        tokens,
        text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bridge_providers_fail_fast_without_io() {
        let req = BackendRequest {
            provider_kind: ProviderKind::CursorBridge,
            endpoint: None,
            model_id: "n/a",
            credential: None,
            system_prompt: "",
            user_prompt: "",
            max_tokens: None,
            streaming: false,
        };
        let err = call(&req).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::OutOfScope(_)));
    }

    #[test]
    fn estimates_tokens_as_ceil_len_over_four() {
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[tokio::test]
    async fn buffered_openai_reads_content_and_usage() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"model":"gpt-test","choices":[{"message":{"content":"hi there"},"finish_reason":"stop"}],"usage":{"total_tokens":42}}"#,
            )
            .create_async()
            .await;

        let endpoint = format!("{}/v1/chat/completions", server.url());
        let req = BackendRequest {
            provider_kind: ProviderKind::OpenAiCompatible,
            endpoint: Some(&endpoint),
            model_id: "gpt-test",
            credential: None,
            system_prompt: "sys",
            user_prompt: "user",
            max_tokens: None,
            streaming: false,
        };
        let resp = call_openai_buffered(&req).await.unwrap();
        assert_eq!(resp.text, "hi there");
        assert_eq!(resp.tokens, 42);
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rate_limit_status_classifies_as_rate_limited() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(429)
            .with_header("retry-after", "60")
            .create_async()
            .await;

        let endpoint = format!("{}/v1/chat/completions", server.url());
        let req = BackendRequest {
            provider_kind: ProviderKind::OpenAiCompatible,
            endpoint: Some(&endpoint),
            model_id: "gpt-test",
            credential: None,
            system_prompt: "sys",
            user_prompt: "user",
            max_tokens: None,
            streaming: false,
        };
        let err = call_openai_buffered(&req).await.unwrap_err();
        match err {
            OrchestratorError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(60)));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_error_classifies_as_transport() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(500)
            .create_async()
            .await;

        let endpoint = format!("{}/v1/chat/completions", server.url());
        let req = BackendRequest {
            provider_kind: ProviderKind::OpenAiCompatible,
            endpoint: Some(&endpoint),
            model_id: "gpt-test",
            credential: None,
            system_prompt: "sys",
            user_prompt: "user",
            max_tokens: None,
            streaming: false,
        };
        let err = call_openai_buffered(&req).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Transport { .. }));
        mock.assert_async().await;
    }
}
