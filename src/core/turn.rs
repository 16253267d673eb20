//! 入站消息模型
//!
//! ChatTurn 是一条聊天事件（观众发言或旁白）；Turn 区分直接提问与旁白，两者走不同路径。
//! 发给后端的线格式是紧凑 JSON，值为 false 的布尔键与缺省的可选字段不输出，节省 token。

use serde::{Deserialize, Serialize};

use crate::text::clean_and_extract_alt;

fn is_false(b: &bool) -> bool {
    !*b
}

/// 一条聊天事件；所有字段都有默认值，缺省字段可直接省略
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatTurn {
    pub date_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    pub content: String,
    #[serde(skip_serializing_if = "is_false")]
    pub is_first: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub is_first_on_stream: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub needs_response: bool,
    /// 旁白标记
    #[serde(rename = "noisy", alias = "ambientFlag", skip_serializing_if = "is_false")]
    pub noisy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_requests: Option<String>,
}

impl Default for ChatTurn {
    fn default() -> Self {
        Self {
            date_time: now_iso8601(),
            id: Some("master".to_string()),
            display_name: "マスター".to_string(),
            nickname: Some("ご主人様".to_string()),
            content: "おはようございます。今日もよろしくお願いします。".to_string(),
            is_first: false,
            is_first_on_stream: false,
            needs_response: false,
            noisy: false,
            additional_requests: Some("あなたの回答は30文字以内にまとめてください".to_string()),
        }
    }
}

impl ChatTurn {
    /// 旁白合批后的合成消息：无 id，noisy = true
    pub fn narration(
        speaker: impl Into<String>,
        content: impl Into<String>,
        instruction: impl Into<String>,
    ) -> Self {
        Self {
            date_time: now_iso8601(),
            id: None,
            display_name: speaker.into(),
            nickname: None,
            content: content.into(),
            is_first: false,
            is_first_on_stream: false,
            needs_response: false,
            noisy: true,
            additional_requests: Some(instruction.into()),
        }
    }

    /// 后端线格式（紧凑 JSON）
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// 清洗 content 中的 HTML
    pub fn sanitized(mut self) -> Self {
        self.content = clean_and_extract_alt(&self.content);
        self
    }

    /// 追加全局附加要求：调用方给的要求在前，空格连接；空串忽略
    pub fn with_additional_requests(mut self, prompt: &str) -> Self {
        let own = self.additional_requests.take().unwrap_or_default();
        let requests: Vec<&str> = [own.as_str(), prompt]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();
        self.additional_requests = if requests.is_empty() {
            None
        } else {
            Some(requests.join(" "))
        };
        self
    }
}

fn now_iso8601() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// 已分类的入站消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Turn {
    /// 直接发给助手，需要回复
    Direct(ChatTurn),
    /// 旁白，先缓冲再合批
    Ambient(ChatTurn),
}

impl From<ChatTurn> for Turn {
    fn from(turn: ChatTurn) -> Self {
        if turn.noisy {
            Turn::Ambient(turn)
        } else {
            Turn::Direct(turn)
        }
    }
}
