//! Gemini REST 客户端（generateContent）
//!
//! - Base URL: https://generativelanguage.googleapis.com/v1beta
//! - 每次请求带上完整历史（contents）、systemInstruction、safetySettings，可选 google_search 工具
//! - 历史记录保持后端原样的 `Content` JSON，追加时不做转换

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::llm::{ChatBackend, ChatSession, LlmError, SessionParams};
use crate::memory::ConversationHistory;

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// 这些结束原因且没有文本时视为被安全过滤拦截
const BLOCKING_FINISH_REASONS: &[&str] = &["SAFETY", "PROHIBITED_CONTENT", "BLOCKLIST", "SPII"];

/// Gemini 后端：持有共享的 HTTP Client（内部为 Arc，clone 便宜）
#[derive(Debug, Clone)]
pub struct GeminiBackend {
    client: reqwest::Client,
    base_url: String,
}

impl GeminiBackend {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| LlmError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

impl ChatBackend for GeminiBackend {
    fn create_session(&self, params: SessionParams) -> Box<dyn ChatSession> {
        let safety_settings = params
            .safety
            .iter()
            .map(|(category, threshold)| json!({ "category": category, "threshold": threshold }))
            .collect();
        Box::new(GeminiSession {
            client: self.client.clone(),
            endpoint: format!("{}/models/{}:generateContent", self.base_url, params.model),
            api_key: params.api_key,
            system_prompt: params.system_prompt,
            safety_settings,
            search_grounding: params.search_grounding,
            history: params.history,
        })
    }
}

struct GeminiSession {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    system_prompt: String,
    safety_settings: Vec<Value>,
    search_grounding: bool,
    history: ConversationHistory,
}

impl GeminiSession {
    fn request_body(&self, user: &Value) -> Value {
        let mut contents = self.history.records().to_vec();
        contents.push(user.clone());

        let mut body = json!({
            "contents": contents,
            "safetySettings": self.safety_settings,
        });
        if !self.system_prompt.is_empty() {
            body["systemInstruction"] = json!({ "parts": [{ "text": self.system_prompt }] });
        }
        if self.search_grounding {
            body["tools"] = json!([{ "google_search": {} }]);
        }
        body
    }
}

#[async_trait]
impl ChatSession for GeminiSession {
    async fn send_message(&mut self, text: &str) -> Result<String, LlmError> {
        let user = json!({ "role": "user", "parts": [{ "text": text }] });
        let body = self.request_body(&user);

        debug!(
            endpoint = %self.endpoint,
            history_len = self.history.len(),
            content_len = text.len(),
            "sending Gemini request"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;
        trace!(status = status.as_u16(), body = %raw, "Gemini raw response");

        if !status.is_success() {
            return Err(classify_error(status.as_u16(), &raw));
        }

        let parsed: GenerateContentResponse =
            serde_json::from_str(&raw).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        match interpret_response(parsed)? {
            Some((reply, content)) => {
                self.history.push(user);
                self.history.push(content);
                Ok(reply)
            }
            None => Ok(String::new()),
        }
    }

    fn history(&self) -> &ConversationHistory {
        &self.history
    }

    fn history_mut(&mut self) -> &mut ConversationHistory {
        &mut self.history
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Value>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

/// 非 2xx 响应分类：429 / RESOURCE_EXHAUSTED 为限流，其余为 API 错误
fn classify_error(status: u16, body: &str) -> LlmError {
    let detail = serde_json::from_str::<ApiErrorBody>(body).ok().map(|b| b.error);
    let (code, message, api_status) = match detail {
        Some(d) => (
            if d.code == 0 { status } else { d.code },
            d.message,
            d.status,
        ),
        None => (status, body.chars().take(200).collect(), String::new()),
    };

    if code == 429 || status == 429 || api_status == "RESOURCE_EXHAUSTED" {
        LlmError::RateLimited { code, message }
    } else {
        LlmError::ApiError { code, message }
    }
}

/// 解析成功响应：返回 (回复文本, 原样的 model 记录)；没有可用候选时返回 None
fn interpret_response(
    response: GenerateContentResponse,
) -> Result<Option<(String, Value)>, LlmError> {
    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(LlmError::SafetyBlocked { reason });
    }

    let Some(candidate) = response.candidates.into_iter().next() else {
        return Ok(None);
    };

    let text = candidate
        .content
        .as_ref()
        .map(extract_text)
        .unwrap_or_default();

    if text.is_empty() {
        if let Some(reason) = candidate
            .finish_reason
            .filter(|r| BLOCKING_FINISH_REASONS.contains(&r.as_str()))
        {
            return Err(LlmError::SafetyBlocked { reason });
        }
        return Ok(None);
    }

    match candidate.content {
        Some(mut content) => {
            if content.get("role").is_none() {
                content["role"] = json!("model");
            }
            Ok(Some((text, content)))
        }
        None => Ok(None),
    }
}

/// 拼接所有非 thought 的 text part
fn extract_text(content: &Value) -> String {
    content
        .get("parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|p| !p.get("thought").and_then(Value::as_bool).unwrap_or(false))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}
