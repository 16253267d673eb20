//! 后端抽象
//!
//! 所有后端（Gemini / Mock）实现 ChatBackend：create_session 建立绑定 Key、模型、系统提示词、安全策略与历史的会话；
//! ChatSession::send_message 发送一条消息，成功时会话自身把 user/model 两条记录追加进历史。

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::ConversationHistory;

/// 后端调用错误（已分类）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// 额度耗尽 / 限流，可换下一个 Key 重试
    #[error("Rate limited (code {code}): {message}")]
    RateLimited { code: u16, message: String },

    /// 被安全过滤拦截，不重试
    #[error("Blocked by safety filter: {reason}")]
    SafetyBlocked { reason: String },

    #[error("API error (code {code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// 后端给出的数字错误码（安全拦截与网络错误没有）
    pub fn code(&self) -> Option<u16> {
        match self {
            LlmError::RateLimited { code, .. } | LlmError::ApiError { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_quota_exhausted(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. })
    }

    /// 后端明确拒绝（安全拦截或其它 API 错误）；网络、解析失败不算
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            LlmError::SafetyBlocked { .. } | LlmError::ApiError { .. }
        )
    }
}

/// 安全策略：类别 -> 拦截阈值（按类别名排序，请求体稳定）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SafetyPolicy {
    thresholds: BTreeMap<String, String>,
}

impl SafetyPolicy {
    pub fn new(thresholds: BTreeMap<String, String>) -> Self {
        // 配置层可能把键转成小写，后端只认大写枚举名
        let thresholds = thresholds
            .into_iter()
            .map(|(k, v)| (k.to_ascii_uppercase(), v.to_ascii_uppercase()))
            .collect();
        Self { thresholds }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.thresholds
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.thresholds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }
}

/// 会话构造参数
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub api_key: String,
    pub model: String,
    pub system_prompt: String,
    pub safety: SafetyPolicy,
    /// 可选工具增强：Google Search grounding
    pub search_grounding: bool,
    pub history: ConversationHistory,
}

/// 一条活动的后端会话，持有运行中的历史
#[async_trait]
pub trait ChatSession: Send {
    /// 发送一条消息；成功时返回回复文本（可能为空）并把本轮追加到历史
    async fn send_message(&mut self, text: &str) -> Result<String, LlmError>;

    fn history(&self) -> &ConversationHistory;

    fn history_mut(&mut self) -> &mut ConversationHistory;
}

/// 后端：按参数创建会话
pub trait ChatBackend: Send + Sync {
    fn create_session(&self, params: SessionParams) -> Box<dyn ChatSession>;
}
