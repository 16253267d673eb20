//! Mock 后端（用于测试，无需 API）
//!
//! 按顺序吐出预设的回复或错误；队列空了就回显消息。记录每次调用使用的 Key 和文本，以及会话创建次数。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{ChatBackend, ChatSession, LlmError, SessionParams};
use crate::memory::ConversationHistory;

/// 一次 send_message 调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub api_key: String,
    pub text: String,
}

#[derive(Debug, Default)]
struct MockState {
    replies: VecDeque<Result<String, LlmError>>,
    calls: Vec<MockCall>,
    /// 每次创建会话时带入的历史条数
    seed_lengths: Vec<usize>,
}

/// 可脚本化的 Mock 后端；clone 后共享同一份状态，便于测试里保留一份用来断言
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
    delay: Option<Duration>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = Result<String, LlmError>>,
    {
        let backend = Self::new();
        backend.lock().replies.extend(replies);
        backend
    }

    /// 每次发送前先等待一段时间（测超时）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn sessions_created(&self) -> usize {
        self.lock().seed_lengths.len()
    }

    pub fn seed_lengths(&self) -> Vec<usize> {
        self.lock().seed_lengths.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ChatBackend for MockBackend {
    fn create_session(&self, params: SessionParams) -> Box<dyn ChatSession> {
        self.lock().seed_lengths.push(params.history.len());
        Box::new(MockSession {
            backend: self.clone(),
            api_key: params.api_key,
            history: params.history,
        })
    }
}

struct MockSession {
    backend: MockBackend,
    api_key: String,
    history: ConversationHistory,
}

#[async_trait]
impl ChatSession for MockSession {
    async fn send_message(&mut self, text: &str) -> Result<String, LlmError> {
        if let Some(delay) = self.backend.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = {
            let mut state = self.backend.lock();
            state.calls.push(MockCall {
                api_key: self.api_key.clone(),
                text: text.to_string(),
            });
            state
                .replies
                .pop_front()
                .unwrap_or_else(|| Ok(format!("Echo from Mock: {text}")))
        }?;

        if !reply.is_empty() {
            self.history
                .push(json!({ "role": "user", "parts": [{ "text": text }] }));
            self.history
                .push(json!({ "role": "model", "parts": [{ "text": reply }] }));
        }
        Ok(reply)
    }

    fn history(&self) -> &ConversationHistory {
        &self.history
    }

    fn history_mut(&mut self) -> &mut ConversationHistory {
        &mut self.history
    }
}
