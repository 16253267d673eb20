//! 对话历史
//!
//! 保存后端返回的原生记录（Gemini `Content` 对象），不做任何解释；超出上限时从最旧端成对剪枝，保持 user/model 交替。

use serde::{Deserialize, Serialize};

/// 单条后端原生记录（原样保存、原样回传）
pub type HistoryRecord = serde_json::Value;

/// 有序的历史记录序列，除剪枝外只追加
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationHistory {
    records: Vec<HistoryRecord>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<HistoryRecord>) -> Self {
        Self { records }
    }

    pub fn push(&mut self, record: HistoryRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[HistoryRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// 从最旧端两条两条地删除，直到长度 ≤ max_len；返回删除条数
    ///
    /// 删除数向上取偶；只有历史本身为奇数条且要求全部清空时才会删掉奇数条。
    pub fn truncate(&mut self, max_len: usize) -> usize {
        let len = self.records.len();
        if len <= max_len {
            return 0;
        }
        let excess = len - max_len;
        let remove = (excess + excess % 2).min(len);
        self.records.drain(..remove);
        remove
    }
}
