//! 应用上下文：启动时构建一次，HTTP / WebSocket 处理器共享同一个 Arc<AppContext>

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use crate::config::{AppConfig, PromptsSection};
use crate::core::{Dispatcher, NarrationAggregator};
use crate::gateway::BroadcastHub;
use crate::llm::{
    CannedMessages, ChatBackend, ClientOptions, ConversationSession, CredentialRotator,
    ResilientChatClient, SafetyPolicy, SessionConfig,
};
use crate::memory::SessionStore;
use crate::text::read_text;

/// 启动时读入的提示词与固定文案
#[derive(Debug, Clone, Default)]
pub struct PromptTexts {
    pub base_prompt: String,
    pub additional_requests_prompt: String,
    pub messages: CannedMessages,
}

impl PromptTexts {
    /// 文件与 `.template` 都缺失时，固定文案用内置默认值
    pub fn load(base_dir: &Path, prompts: &PromptsSection) -> Self {
        let defaults = CannedMessages::default();
        let or_default = |text: String, fallback: String| {
            if text.trim().is_empty() {
                fallback
            } else {
                text.trim_end().to_string()
            }
        };
        Self {
            base_prompt: read_text(base_dir, &prompts.base_prompt),
            additional_requests_prompt: read_text(base_dir, &prompts.additional_requests_prompt)
                .trim()
                .to_string(),
            messages: CannedMessages {
                error: or_default(read_text(base_dir, &prompts.error_message), defaults.error),
                stop_candidate: or_default(
                    read_text(base_dir, &prompts.stop_candidate_message),
                    defaults.stop_candidate,
                ),
                resource_exhausted: or_default(
                    read_text(base_dir, &prompts.resource_exhausted_message),
                    defaults.resource_exhausted,
                ),
            },
        }
    }
}

pub struct AppContext {
    pub config: AppConfig,
    pub client: Arc<ResilientChatClient>,
    pub narration: Arc<NarrationAggregator>,
    pub dispatcher: Dispatcher,
    pub hub: BroadcastHub,
}

impl AppContext {
    /// 组装所有组件；Key 列表为空时报错
    pub fn build(config: AppConfig, backend: Arc<dyn ChatBackend>) -> anyhow::Result<Self> {
        let texts = PromptTexts::load(&config.app.base_dir, &config.prompts);

        let credentials =
            CredentialRotator::new(config.google.api_keys.clone(), config.key_index_path())
                .context(
                    "google.api_keys must contain at least one key (FUYUKA__GOOGLE__API_KEYS)",
                )?;

        let store = SessionStore::new(config.history_path());
        let history = if config.session.resume {
            match store.load() {
                Ok(Some(history)) => {
                    info!(
                        records = history.len(),
                        path = %store.path().display(),
                        "restored chat history"
                    );
                    history
                }
                Ok(None) => Default::default(),
                Err(e) => {
                    warn!(
                        path = %store.path().display(),
                        error = %e,
                        "failed to load chat history, starting fresh"
                    );
                    Default::default()
                }
            }
        } else {
            Default::default()
        };

        let session = ConversationSession::new(
            backend,
            SessionConfig {
                model: config.google.model.clone(),
                system_prompt: texts.base_prompt.clone(),
                safety: SafetyPolicy::new(config.google.safety.clone()),
                search_grounding: config.google.search_grounding,
            },
        )
        .with_history(history);

        let client = Arc::new(ResilientChatClient::new(
            session,
            credentials,
            store,
            texts.messages.clone(),
            ClientOptions {
                max_history_length: config.session.max_history_length,
                max_leak_retries: config.retry.max_leak_retries,
                leak_markers: config.retry.leak_markers.clone(),
                corrective_template: config.retry.corrective_template.clone(),
                timeout: Duration::from_secs(config.google.timeout_secs),
            },
        ));

        let narration = Arc::new(NarrationAggregator::new(
            Arc::clone(&client),
            config.narration.threshold,
            config.narration.separator.clone(),
            config.narration.acknowledge_instruction.clone(),
        ));

        let dispatcher = Dispatcher::new(
            Arc::clone(&client),
            Arc::clone(&narration),
            texts.additional_requests_prompt,
        );

        Ok(Self {
            config,
            client,
            narration,
            dispatcher,
            hub: BroadcastHub::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockBackend;

    fn config(dir: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.app.cache_dir = dir.join("cache");
        config.app.base_dir = dir.to_path_buf();
        config.google.api_keys = vec!["k".to_string()];
        config
    }

    #[test]
    fn test_build_requires_api_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.google.api_keys.clear();
        assert!(AppContext::build(config, Arc::new(MockBackend::new())).is_err());
    }

    #[test]
    fn test_prompt_texts_fall_back_to_builtin_messages() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("messages")).unwrap();
        std::fs::write(
            dir.path().join("messages/error_message.txt"),
            "oops\n",
        )
        .unwrap();

        let texts = PromptTexts::load(dir.path(), &PromptsSection::default());
        assert_eq!(texts.messages.error, "oops");
        assert_eq!(
            texts.messages.stop_candidate,
            CannedMessages::default().stop_candidate
        );
        assert!(texts.base_prompt.is_empty());
    }

    #[tokio::test]
    async fn test_build_restores_history_when_resuming() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut history = crate::memory::ConversationHistory::new();
        history.push(serde_json::json!({ "role": "user", "parts": [{ "text": "a" }] }));
        history.push(serde_json::json!({ "role": "model", "parts": [{ "text": "b" }] }));
        SessionStore::new(config.history_path()).save(&history).unwrap();

        let ctx = AppContext::build(config.clone(), Arc::new(MockBackend::new())).unwrap();
        assert_eq!(ctx.client.history_len().await, 2);

        let mut fresh = config;
        fresh.session.resume = false;
        let ctx = AppContext::build(fresh, Arc::new(MockBackend::new())).unwrap();
        assert_eq!(ctx.client.history_len().await, 0);
    }
}
