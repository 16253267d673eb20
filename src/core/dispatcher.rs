//! 入站消息分发
//!
//! 清洗 content 后按 Turn 分两条路径：
//! - Ambient：交给 NarrationAggregator 累积，只有触发合批时才有回复文本
//! - Direct：先 flush 旁白，再附加全局要求、发送，回复压平换行

use std::sync::Arc;

use tracing::debug;

use crate::core::{ChatTurn, NarrationAggregator, Turn};
use crate::gateway::ChatResult;
use crate::llm::ResilientChatClient;
use crate::text::remove_newlines;

pub struct Dispatcher {
    client: Arc<ResilientChatClient>,
    narration: Arc<NarrationAggregator>,
    additional_requests_prompt: String,
}

impl Dispatcher {
    pub fn new(
        client: Arc<ResilientChatClient>,
        narration: Arc<NarrationAggregator>,
        additional_requests_prompt: impl Into<String>,
    ) -> Self {
        Self {
            client,
            narration,
            additional_requests_prompt: additional_requests_prompt.into(),
        }
    }

    /// 处理一条入站消息，返回回复载荷；request 为清洗（及附加要求）后的消息
    pub async fn dispatch(&self, source_id: &str, turn: ChatTurn) -> ChatResult {
        match Turn::from(turn.sanitized()) {
            Turn::Ambient(turn) => {
                debug!(source = %source_id, speaker = %turn.display_name, "ambient turn");
                let outcome = self.narration.ingest(&turn).await;
                let (response, error_code) = match outcome {
                    Some(outcome) => (remove_newlines(outcome.text()), outcome.error_code()),
                    None => (String::new(), 0),
                };
                ChatResult::new(source_id, turn, response, error_code)
            }
            Turn::Direct(turn) => {
                debug!(source = %source_id, speaker = %turn.display_name, "direct turn");
                self.narration.flush().await;
                let turn = turn.with_additional_requests(&self.additional_requests_prompt);
                let outcome = self.client.send(&turn).await;
                let response = remove_newlines(outcome.text());
                ChatResult::new(source_id, turn, response, outcome.error_code())
            }
        }
    }

    /// 清空旁白缓冲与对话历史
    pub async fn reset(&self) {
        self.narration.reset().await;
        self.client.reset().await;
    }
}
