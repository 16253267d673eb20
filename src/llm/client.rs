//! 带容错的聊天客户端
//!
//! 对外只有一个入口 send(turn) -> ReplyOutcome：
//! - 额度耗尽：换下一个 Key、丢弃旧句柄后重试，每个 Key 最多一次；N 个 Key 全部耗尽返回 QuotaExhausted
//! - 后端拒绝（安全拦截 / 其它 API 错误）：返回固定文案，不重试
//! - 回复里出现思考泄漏标记：丢弃回复，发一条纠正消息重来，次数有上限
//! - 其它失败：记录完整错误，对外只返回通用错误文案
//!
//! 会话与历史的修改在一把 tokio Mutex 下串行，锁跨越后端调用。

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use regex::{Regex, RegexBuilder};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::core::{ChatTurn, StoreError};
use crate::llm::{ConversationSession, CredentialRotator};
use crate::memory::SessionStore;

/// 后端拒绝但没有给出数字状态码时（安全拦截）使用的 errorCode
pub const REJECTED_WITHOUT_CODE: i32 = 400;

/// send 的结果；所有后端错误在这里被收敛成文案 + 错误码
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    Reply(String),
    /// 后端返回空文本（合法，不是错误）
    Empty,
    QuotaExhausted(String),
    BackendRejected { code: Option<u16>, message: String },
    Internal(String),
}

impl ReplyOutcome {
    /// 返回给调用方的文本
    pub fn text(&self) -> &str {
        match self {
            ReplyOutcome::Reply(text)
            | ReplyOutcome::QuotaExhausted(text)
            | ReplyOutcome::Internal(text)
            | ReplyOutcome::BackendRejected { message: text, .. } => text,
            ReplyOutcome::Empty => "",
        }
    }

    pub fn into_text(self) -> String {
        match self {
            ReplyOutcome::Reply(text)
            | ReplyOutcome::QuotaExhausted(text)
            | ReplyOutcome::Internal(text)
            | ReplyOutcome::BackendRejected { message: text, .. } => text,
            ReplyOutcome::Empty => String::new(),
        }
    }

    /// 回复载荷里的 errorCode
    pub fn error_code(&self) -> i32 {
        match self {
            ReplyOutcome::Reply(_) | ReplyOutcome::Empty => 0,
            ReplyOutcome::QuotaExhausted(_) => 429,
            ReplyOutcome::BackendRejected { code, .. } => {
                code.map(i32::from).unwrap_or(REJECTED_WITHOUT_CODE)
            }
            ReplyOutcome::Internal(_) => 500,
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, ReplyOutcome::Reply(_) | ReplyOutcome::Empty)
    }
}

/// 固定回复文案
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CannedMessages {
    pub error: String,
    pub stop_candidate: String,
    pub resource_exhausted: String,
}

impl Default for CannedMessages {
    fn default() -> Self {
        Self {
            error: "Sorry, something went wrong on my side. Please try again.".to_string(),
            stop_candidate: "Sorry, I cannot answer that one.".to_string(),
            resource_exhausted:
                "I have talked too much today and need a short break. Please wait a moment."
                    .to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub max_history_length: usize,
    /// 小于 1 时按 1 处理
    pub max_leak_retries: usize,
    pub leak_markers: Vec<String>,
    /// `{date_time}` 替换为原消息时间
    pub corrective_template: String,
    pub timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_history_length: 200,
            max_leak_retries: 2,
            leak_markers: vec![
                "プロセス".into(),
                "考え中".into(),
                "thinking".into(),
                "thought".into(),
            ],
            corrective_template: "Your reply to the message sent at {date_time} exposed your \
                                  internal thinking process. Answer again without any reasoning."
                .to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct ResilientChatClient {
    session: Mutex<ConversationSession>,
    credentials: CredentialRotator,
    store: SessionStore,
    messages: CannedMessages,
    leak_pattern: Option<Regex>,
    options: ClientOptions,
    last_error_code: AtomicI32,
    /// 自启动或上次 reset 以来是否有过成功的交换
    dirty: AtomicBool,
}

impl ResilientChatClient {
    pub fn new(
        session: ConversationSession,
        credentials: CredentialRotator,
        store: SessionStore,
        messages: CannedMessages,
        mut options: ClientOptions,
    ) -> Self {
        options.max_leak_retries = options.max_leak_retries.max(1);
        let leak_pattern = build_leak_pattern(&options.leak_markers);
        Self {
            session: Mutex::new(session),
            credentials,
            store,
            messages,
            leak_pattern,
            options,
            last_error_code: AtomicI32::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    /// 发送一条消息，返回已分类的结果；永远不向调用方抛出后端原始错误
    pub async fn send(&self, turn: &ChatTurn) -> ReplyOutcome {
        let outcome = self.send_turn(turn).await;
        self.last_error_code.store(outcome.error_code(), Ordering::Relaxed);
        outcome
    }

    async fn send_turn(&self, turn: &ChatTurn) -> ReplyOutcome {
        let mut text = match turn.to_wire() {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "failed to serialize turn");
                return self.internal();
            }
        };

        let mut session = self.session.lock().await;
        let mut leak_retries = 0;
        loop {
            let reply = match self.exchange(&mut session, &text).await {
                Ok(reply) => reply,
                Err(outcome) => return outcome,
            };
            self.persist(&mut session);

            if reply.is_empty() {
                return ReplyOutcome::Empty;
            }
            if !self.is_leaked(&reply) {
                return ReplyOutcome::Reply(reply);
            }

            if leak_retries >= self.options.max_leak_retries {
                error!(
                    retries = leak_retries,
                    reply = %reply,
                    "reply still leaks reasoning, giving up"
                );
                return self.internal();
            }
            leak_retries += 1;
            warn!(
                attempt = leak_retries,
                reply = %reply,
                "reply leaked reasoning, asking for a redo"
            );

            let corrective = ChatTurn {
                content: self
                    .options
                    .corrective_template
                    .replace("{date_time}", &turn.date_time),
                ..turn.clone()
            };
            text = match corrective.to_wire() {
                Ok(text) => text,
                Err(e) => {
                    error!(error = %e, "failed to serialize corrective turn");
                    return self.internal();
                }
            };
        }
    }

    /// 一次逻辑交换：遇到额度耗尽时依次尝试每个 Key
    async fn exchange(
        &self,
        session: &mut ConversationSession,
        text: &str,
    ) -> Result<String, ReplyOutcome> {
        let attempts = self.credentials.len();
        for attempt in 1..=attempts {
            let (index, api_key) = self.credentials.current();
            debug!(credential = index, attempt, content = %text, "sending turn to backend");

            let handle = session.ensure(index, api_key);
            let result =
                tokio::time::timeout(self.options.timeout, handle.send_message(text)).await;

            match result {
                Ok(Ok(reply)) => {
                    let reply = reply.trim().to_string();
                    debug!(credential = index, reply = %reply, "backend replied");
                    return Ok(reply);
                }
                Ok(Err(e)) if e.is_quota_exhausted() => {
                    warn!(
                        credential = index,
                        attempt,
                        of = attempts,
                        error = %e,
                        "quota exhausted"
                    );
                    self.credentials.advance();
                    session.invalidate();
                }
                Ok(Err(e)) if e.is_rejection() => {
                    warn!(credential = index, error = %e, "backend rejected the turn");
                    return Err(ReplyOutcome::BackendRejected {
                        code: e.code(),
                        message: self.messages.stop_candidate.clone(),
                    });
                }
                Ok(Err(e)) => {
                    error!(credential = index, error = %e, "backend call failed");
                    return Err(self.internal());
                }
                Err(_) => {
                    error!(
                        credential = index,
                        timeout_secs = self.options.timeout.as_secs(),
                        "backend call timed out"
                    );
                    return Err(self.internal());
                }
            }
        }

        error!(keys = attempts, "every API key is out of quota");
        Err(ReplyOutcome::QuotaExhausted(
            self.messages.resource_exhausted.clone(),
        ))
    }

    fn is_leaked(&self, reply: &str) -> bool {
        self.leak_pattern
            .as_ref()
            .is_some_and(|re| re.is_match(reply))
    }

    /// 剪枝并落盘；写盘失败只记日志
    fn persist(&self, session: &mut ConversationSession) {
        let removed =
            SessionStore::truncate(session.history_mut(), self.options.max_history_length);
        if removed > 0 {
            debug!(removed, "trimmed oldest history records");
        }
        self.dirty.store(true, Ordering::Relaxed);
        if let Err(e) = self.store.save(session.history()) {
            error!(path = %self.store.path().display(), error = %e, "failed to save history");
        }
    }

    fn internal(&self) -> ReplyOutcome {
        ReplyOutcome::Internal(self.messages.error.clone())
    }

    /// 清空内存中的历史并丢弃句柄；持久化文件不动
    pub async fn reset(&self) {
        let mut session = self.session.lock().await;
        session.reset();
        self.dirty.store(false, Ordering::Relaxed);
        self.last_error_code.store(0, Ordering::Relaxed);
        info!("chat history reset");
    }

    /// 退出时调用：自启动或上次 reset 以来有过交换才写盘，否则保留已有文件。
    /// 返回是否写了盘
    pub async fn save_history(&self) -> Result<bool, StoreError> {
        let session = self.session.lock().await;
        if !self.dirty.load(Ordering::Relaxed) {
            debug!("no exchange since startup or reset, keeping persisted history");
            return Ok(false);
        }
        self.store.save(session.history())?;
        Ok(true)
    }

    pub async fn history_len(&self) -> usize {
        self.session.lock().await.history().len()
    }

    /// 最近一次 send 的 errorCode
    pub fn last_error_code(&self) -> i32 {
        self.last_error_code.load(Ordering::Relaxed)
    }

    pub fn credentials(&self) -> &CredentialRotator {
        &self.credentials
    }
}

fn build_leak_pattern(markers: &[String]) -> Option<Regex> {
    let alternatives: Vec<String> = markers
        .iter()
        .filter(|m| !m.is_empty())
        .map(|m| regex::escape(m))
        .collect();
    if alternatives.is_empty() {
        return None;
    }
    match RegexBuilder::new(&alternatives.join("|"))
        .case_insensitive(true)
        .build()
    {
        Ok(re) => Some(re),
        Err(e) => {
            error!(error = %e, "invalid leak marker pattern, leak detection disabled");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockBackend, SafetyPolicy, SessionConfig};
    use crate::memory::ConversationHistory;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        backend: MockBackend,
        client: ResilientChatClient,
        store: SessionStore,
    }

    fn fixture(keys: usize, backend: MockBackend, options: ClientOptions) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let session = ConversationSession::new(
            Arc::new(backend.clone()),
            SessionConfig {
                model: "mock".to_string(),
                system_prompt: String::new(),
                safety: SafetyPolicy::default(),
                search_grounding: false,
            },
        );
        let secrets = (0..keys).map(|i| format!("key-{i}")).collect();
        let credentials = CredentialRotator::new(secrets, dir.path().join("idx.txt")).unwrap();
        let store = SessionStore::new(dir.path().join("history.json"));
        let client = ResilientChatClient::new(
            session,
            credentials,
            store.clone(),
            CannedMessages::default(),
            options,
        );
        Fixture {
            _dir: dir,
            backend,
            client,
            store,
        }
    }

    fn quota() -> Result<String, LlmError> {
        Err(LlmError::RateLimited {
            code: 429,
            message: "quota".to_string(),
        })
    }

    fn turn(content: &str) -> ChatTurn {
        ChatTurn {
            content: content.to_string(),
            date_time: "2025-01-01T09:00:00".to_string(),
            ..ChatTurn::default()
        }
    }

    #[tokio::test]
    async fn test_reply_is_trimmed_and_persisted() {
        let backend = MockBackend::with_replies([Ok("  hello!  \n".to_string())]);
        let f = fixture(1, backend, ClientOptions::default());

        let outcome = f.client.send(&turn("hi")).await;
        assert_eq!(outcome, ReplyOutcome::Reply("hello!".to_string()));
        assert_eq!(f.client.last_error_code(), 0);
        assert_eq!(f.store.load().unwrap().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_reply_is_not_an_error() {
        let backend = MockBackend::with_replies([Ok("   ".to_string())]);
        let f = fixture(1, backend, ClientOptions::default());
        let outcome = f.client.send(&turn("hi")).await;
        assert_eq!(outcome, ReplyOutcome::Empty);
        assert_eq!(outcome.error_code(), 0);
        assert!(!outcome.is_error());
    }

    #[tokio::test]
    async fn test_quota_rotates_to_next_key() {
        let backend = MockBackend::with_replies([quota(), Ok("ok".to_string())]);
        let f = fixture(3, backend, ClientOptions::default());

        let outcome = f.client.send(&turn("hi")).await;
        assert_eq!(outcome, ReplyOutcome::Reply("ok".to_string()));
        assert_eq!(f.client.credentials().current_index(), 1);

        let calls = f.backend.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].api_key, "key-0");
        assert_eq!(calls[1].api_key, "key-1");
        assert_eq!(f.backend.sessions_created(), 2);
    }

    #[tokio::test]
    async fn test_all_keys_exhausted() {
        let backend = MockBackend::with_replies([quota(), quota(), quota()]);
        let f = fixture(3, backend, ClientOptions::default());

        let outcome = f.client.send(&turn("hi")).await;
        assert!(matches!(outcome, ReplyOutcome::QuotaExhausted(_)));
        assert_eq!(f.client.last_error_code(), 429);
        assert_eq!(f.backend.calls().len(), 3);
        // 转了一整圈回到起点
        assert_eq!(f.client.credentials().current_index(), 0);
    }

    #[tokio::test]
    async fn test_safety_block_is_not_retried() {
        let backend = MockBackend::with_replies([Err(LlmError::SafetyBlocked {
            reason: "SAFETY".to_string(),
        })]);
        let f = fixture(2, backend, ClientOptions::default());

        let outcome = f.client.send(&turn("hi")).await;
        assert_eq!(
            outcome,
            ReplyOutcome::BackendRejected {
                code: None,
                message: CannedMessages::default().stop_candidate
            }
        );
        assert_eq!(outcome.error_code(), REJECTED_WITHOUT_CODE);
        assert!(outcome.is_error());
        assert_eq!(f.client.last_error_code(), REJECTED_WITHOUT_CODE);
        assert_eq!(f.backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_api_error_keeps_code() {
        let backend = MockBackend::with_replies([Err(LlmError::ApiError {
            code: 400,
            message: "bad".to_string(),
        })]);
        let f = fixture(1, backend, ClientOptions::default());
        let outcome = f.client.send(&turn("hi")).await;
        assert_eq!(outcome.error_code(), 400);
        assert_eq!(outcome.text(), CannedMessages::default().stop_candidate);
    }

    #[tokio::test]
    async fn test_network_error_is_internal() {
        let backend = MockBackend::with_replies([Err(LlmError::Network("reset".to_string()))]);
        let f = fixture(1, backend, ClientOptions::default());
        let outcome = f.client.send(&turn("hi")).await;
        assert_eq!(outcome, ReplyOutcome::Internal(CannedMessages::default().error));
        assert!(!outcome.text().contains("reset"));
    }

    #[tokio::test]
    async fn test_leaked_reply_is_retried_with_corrective_turn() {
        let backend = MockBackend::with_replies([
            Ok("My Thinking: the user said hi".to_string()),
            Ok("hello".to_string()),
        ]);
        let f = fixture(1, backend, ClientOptions::default());

        let outcome = f.client.send(&turn("hi")).await;
        assert_eq!(outcome, ReplyOutcome::Reply("hello".to_string()));

        let calls = f.backend.calls();
        assert_eq!(calls.len(), 2);
        let corrective: serde_json::Value = serde_json::from_str(&calls[1].text).unwrap();
        assert!(corrective["content"]
            .as_str()
            .unwrap()
            .contains("2025-01-01T09:00:00"));
    }

    #[tokio::test]
    async fn test_leak_retry_is_bounded() {
        let backend = MockBackend::with_replies((0..10).map(|_| Ok("考え中です".to_string())));
        let options = ClientOptions {
            max_leak_retries: 2,
            ..ClientOptions::default()
        };
        let f = fixture(1, backend, options);

        let outcome = f.client.send(&turn("hi")).await;
        assert_eq!(outcome, ReplyOutcome::Internal(CannedMessages::default().error));
        assert_eq!(f.backend.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_timeout_is_internal() {
        let backend = MockBackend::new().with_delay(Duration::from_millis(200));
        let options = ClientOptions {
            timeout: Duration::from_millis(20),
            ..ClientOptions::default()
        };
        let f = fixture(1, backend, options);
        let outcome = f.client.send(&turn("hi")).await;
        assert_eq!(outcome.error_code(), 500);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let options = ClientOptions {
            max_history_length: 4,
            ..ClientOptions::default()
        };
        let f = fixture(1, MockBackend::new(), options);
        for i in 0..5 {
            f.client.send(&turn(&format!("m{i}"))).await;
        }
        assert_eq!(f.client.history_len().await, 4);
        assert_eq!(f.store.load().unwrap().unwrap().len(), 4);
        assert_eq!(f.backend.sessions_created(), 1);
    }

    #[tokio::test]
    async fn test_reset_empties_history() {
        let f = fixture(1, MockBackend::new(), ClientOptions::default());
        f.client.send(&turn("hi")).await;
        f.client.reset().await;
        assert_eq!(f.client.history_len().await, 0);
        // 文件仍在
        assert!(f.store.load().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_zero_leak_retries_still_sends_one_corrective_turn() {
        let backend = MockBackend::with_replies([
            Ok("thinking...".to_string()),
            Ok("hello".to_string()),
        ]);
        let options = ClientOptions {
            max_leak_retries: 0,
            ..ClientOptions::default()
        };
        let f = fixture(1, backend, options);

        let outcome = f.client.send(&turn("hi")).await;
        assert_eq!(outcome, ReplyOutcome::Reply("hello".to_string()));
        assert_eq!(f.backend.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_history_save_still_replies() {
        let f = fixture(1, MockBackend::new(), ClientOptions::default());
        // 临时文件位置被目录占住，写盘必然失败
        std::fs::create_dir(f._dir.path().join("history.json.tmp")).unwrap();

        let outcome = f.client.send(&turn("hi")).await;
        assert!(matches!(outcome, ReplyOutcome::Reply(_)));
        assert_eq!(f.client.last_error_code(), 0);
        assert_eq!(f.client.history_len().await, 2);
        assert!(f.store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_history_skips_when_nothing_was_sent() {
        let f = fixture(1, MockBackend::new(), ClientOptions::default());
        let mut history = ConversationHistory::new();
        history.push(serde_json::json!({ "role": "user", "parts": [] }));
        history.push(serde_json::json!({ "role": "model", "parts": [] }));
        f.store.save(&history).unwrap();

        assert!(!f.client.save_history().await.unwrap());
        assert_eq!(f.store.load().unwrap().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_save_history_skips_after_reset() {
        let f = fixture(1, MockBackend::new(), ClientOptions::default());
        f.client.send(&turn("hi")).await;
        assert!(f.client.save_history().await.unwrap());

        f.client.reset().await;
        assert!(!f.client.save_history().await.unwrap());
        assert_eq!(f.store.load().unwrap().unwrap().len(), 2);

        f.client.send(&turn("again")).await;
        assert!(f.client.save_history().await.unwrap());
        assert_eq!(f.store.load().unwrap().unwrap().len(), 2);
    }

    #[test]
    fn test_leak_pattern_is_case_insensitive_and_escaped() {
        let re = build_leak_pattern(&["thought".to_string(), "a.b".to_string()]).unwrap();
        assert!(re.is_match("Thought: ..."));
        assert!(re.is_match("a.b"));
        assert!(!re.is_match("axb"));
        assert!(build_leak_pattern(&[]).is_none());
    }
}
