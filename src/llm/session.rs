//! 会话句柄管理
//!
//! 一个 ConversationSession 最多持有一个活动的后端会话，绑定 (Key 下标, 模型, 系统提示词, 安全策略, 创建时的历史)。
//! 只有在 Key 轮换或显式 reset 后才重建，普通轮次复用同一个句柄。

use std::sync::Arc;

use tracing::debug;

use crate::llm::{ChatBackend, ChatSession, SafetyPolicy, SessionParams};
use crate::memory::ConversationHistory;

/// 会话的固定参数（整个进程生命周期不变）
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model: String,
    pub system_prompt: String,
    pub safety: SafetyPolicy,
    pub search_grounding: bool,
}

pub struct ConversationSession {
    backend: Arc<dyn ChatBackend>,
    config: SessionConfig,
    /// 没有活动句柄时的历史；建句柄时交给后端会话
    seed: ConversationHistory,
    handle: Option<Box<dyn ChatSession>>,
    bound_credential: Option<usize>,
}

impl ConversationSession {
    pub fn new(backend: Arc<dyn ChatBackend>, config: SessionConfig) -> Self {
        Self {
            backend,
            config,
            seed: ConversationHistory::new(),
            handle: None,
            bound_credential: None,
        }
    }

    /// 用已恢复的历史作为初始种子
    pub fn with_history(mut self, history: ConversationHistory) -> Self {
        self.seed = history;
        self
    }

    /// 返回绑定到 credential_index 的会话；已有且 Key 未变则直接复用
    pub fn ensure(&mut self, credential_index: usize, api_key: &str) -> &mut Box<dyn ChatSession> {
        if self.bound_credential != Some(credential_index) {
            self.invalidate();
        }
        let backend = &self.backend;
        let config = &self.config;
        let seed = &mut self.seed;
        self.bound_credential = Some(credential_index);
        self.handle.get_or_insert_with(|| {
            debug!(
                credential = credential_index,
                model = %config.model,
                history_len = seed.len(),
                "creating backend session"
            );
            backend.create_session(SessionParams {
                api_key: api_key.to_string(),
                model: config.model.clone(),
                system_prompt: config.system_prompt.clone(),
                safety: config.safety.clone(),
                search_grounding: config.search_grounding,
                history: std::mem::take(seed),
            })
        })
    }

    /// 丢弃活动句柄，历史保留到种子里供下一个句柄使用
    pub fn invalidate(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            self.seed = std::mem::take(handle.history_mut());
        }
        self.bound_credential = None;
    }

    /// 丢弃句柄并清空历史
    pub fn reset(&mut self) {
        self.handle = None;
        self.bound_credential = None;
        self.seed.clear();
    }

    pub fn is_live(&self) -> bool {
        self.handle.is_some()
    }

    /// 当前历史：活动句柄的，否则为种子
    pub fn history(&self) -> &ConversationHistory {
        match &self.handle {
            Some(handle) => handle.history(),
            None => &self.seed,
        }
    }

    /// 可原地修改的当前历史（剪枝用），不重建句柄
    pub fn history_mut(&mut self) -> &mut ConversationHistory {
        match self.handle.as_mut() {
            Some(handle) => handle.history_mut(),
            None => &mut self.seed,
        }
    }
}
