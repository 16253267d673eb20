//! 旁白合批
//!
//! 旁白（noisy）消息不逐条发给后端：内容先累积到缓冲区，累计长度超过阈值才合成一条消息送出，
//! 让后端只"理解剧情"而不逐句回复。直接提问前必须先 flush，保证后端按时间顺序看到上下文。
//! 触发条件只看长度，不看时间。

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::core::ChatTurn;
use crate::llm::{ReplyOutcome, ResilientChatClient};

#[derive(Debug, Default)]
struct NarrationBuffer {
    /// 最近一位讲述者
    speaker_name: String,
    text: String,
    /// 按字符计
    running_length: usize,
}

impl NarrationBuffer {
    fn clear(&mut self) {
        self.text.clear();
        self.running_length = 0;
    }
}

pub struct NarrationAggregator {
    client: Arc<ResilientChatClient>,
    buffer: Mutex<NarrationBuffer>,
    threshold: usize,
    separator: String,
    acknowledge_instruction: String,
}

impl NarrationAggregator {
    pub fn new(
        client: Arc<ResilientChatClient>,
        threshold: usize,
        separator: impl Into<String>,
        acknowledge_instruction: impl Into<String>,
    ) -> Self {
        Self {
            client,
            buffer: Mutex::new(NarrationBuffer::default()),
            threshold,
            separator: separator.into(),
            acknowledge_instruction: acknowledge_instruction.into(),
        }
    }

    /// 累积一条旁白；超过阈值时送出整批并返回结果，否则返回 None（不访问后端）
    pub async fn ingest(&self, turn: &ChatTurn) -> Option<ReplyOutcome> {
        let mut buffer = self.buffer.lock().await;
        buffer.speaker_name = turn.display_name.clone();
        buffer.text.push_str(&turn.content);
        buffer.text.push_str(&self.separator);
        buffer.running_length += turn.content.chars().count() + self.separator.chars().count();

        if buffer.running_length <= self.threshold {
            debug!(
                buffered = buffer.running_length,
                threshold = self.threshold,
                "narration buffered"
            );
            return None;
        }
        self.flush_locked(&mut buffer).await
    }

    /// 立即送出缓冲内容；缓冲为空时什么都不做
    pub async fn flush(&self) -> Option<ReplyOutcome> {
        let mut buffer = self.buffer.lock().await;
        self.flush_locked(&mut buffer).await
    }

    async fn flush_locked(&self, buffer: &mut NarrationBuffer) -> Option<ReplyOutcome> {
        if buffer.text.is_empty() {
            return None;
        }
        let turn = ChatTurn::narration(
            buffer.speaker_name.clone(),
            buffer.text.trim(),
            self.acknowledge_instruction.clone(),
        );
        info!(
            speaker = %buffer.speaker_name,
            chars = buffer.running_length,
            "flushing narration batch"
        );
        let outcome = self.client.send(&turn).await;
        buffer.clear();
        Some(outcome)
    }

    /// 丢弃缓冲内容，不发送
    pub async fn reset(&self) {
        self.buffer.lock().await.clear();
    }

    pub async fn buffered_len(&self) -> usize {
        self.buffer.lock().await.running_length
    }
}
